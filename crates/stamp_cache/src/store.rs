//! Durable storage of `CompositeAddress -> StoredRecord`.
//!
//! A store is a single append-only log file. It starts with a bincode
//! header carrying magic bytes, the format version and the cache version,
//! followed by checksummed entries:
//!
//! ```text
//! kind:u8 | payload_len:u32 LE | checksum:u64 LE | payload
//! put payload:    target:i32 LE | key chunk | source chunk | output chunk
//! remove payload: target:i32 LE | key chunk
//! ```
//!
//! Every chunk is a `u32 LE` length followed by the codec's bytes. Keys are
//! indexed in memory when the store is opened. States are decoded once to
//! validate them, then stay on disk and are decoded again on demand. Any
//! structural problem found while opening, including a state the current
//! codecs cannot decode, is reported as [`CacheError::Corrupted`] and never
//! repaired in place. Damage found after opening is an I/O error.

use std::collections::{BTreeSet, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use stamp_common::checksum64;

use crate::address::{AddressDescriptor, CompositeAddress};
use crate::codec::Codecs;
use crate::error::CacheError;

/// Magic bytes identifying a stamp cache store.
const STORE_MAGIC: [u8; 4] = *b"STMP";

/// Current on-disk format version. Increment on breaking layout changes.
const STORE_FORMAT_VERSION: u32 = 1;

const ENTRY_PUT: u8 = 1;
const ENTRY_REMOVE: u8 = 2;

/// Bytes preceding each entry payload: kind, payload length, checksum.
const ENTRY_HEADER_LEN: u64 = 1 + 4 + 8;

/// Suffix of the temporary file written during compaction.
const COMPACT_SUFFIX: &str = ".compact";

/// Stale bytes tolerated before compaction is worth the rewrite.
const MIN_COMPACT_BYTES: u64 = 4096;

/// Header written at the start of every store file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoreHeader {
    magic: [u8; 4],
    format_version: u32,
    cache_version: u32,
}

/// The value stored per address: the source state an item was last
/// processed from and the output state that processing produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord<S, O> {
    /// Snapshot of the item's inputs.
    pub source_state: S,
    /// Snapshot of what was produced for the item.
    pub output_state: O,
}

/// Where the latest `put` entry for an address lives in the log.
#[derive(Debug, Clone, Copy)]
struct ValueLocation {
    /// Offset of the entry payload.
    offset: u64,
    len: u32,
    checksum: u64,
}

impl ValueLocation {
    fn entry_len(&self) -> u64 {
        ENTRY_HEADER_LEN + u64::from(self.len)
    }
}

struct Slot<K> {
    address: CompositeAddress<K>,
    location: ValueLocation,
}

/// Durable, target-scoped record store backed by one log file.
///
/// Reads take `&self` and may run from several threads; the shared read
/// handle is guarded by a mutex. Writes take `&mut self`. Opening the same
/// file from two stores at once is not supported.
pub struct PersistentStore<K, S, O> {
    path: PathBuf,
    codecs: Codecs<K, S, O>,
    descriptor: AddressDescriptor<K>,
    cache_version: u32,
    /// Address hash -> slots sharing that hash.
    index: HashMap<u64, Vec<Slot<K>>>,
    /// Target -> address hash -> number of that target's slots in the bucket.
    targets: HashMap<i32, HashMap<u64, usize>>,
    len: usize,
    writer: File,
    reader: Mutex<File>,
    data_start: u64,
    end: u64,
    live_bytes: u64,
    compact_on_close: bool,
}

impl<K, S, O> PersistentStore<K, S, O> {
    /// Opens the store at `path`, creating an empty one stamped with
    /// `cache_version` if the file does not exist.
    ///
    /// An existing file keeps the cache version it was created with; see
    /// [`PersistentStore::version`].
    pub fn open(
        path: &Path,
        codecs: Codecs<K, S, O>,
        cache_version: u32,
    ) -> Result<Self, CacheError> {
        if !path.exists() {
            create_empty(path, cache_version)?;
        }
        let raw = std::fs::read(path).map_err(|e| CacheError::io(path, e))?;
        let (header, data_start) = parse_header(path, &raw)?;

        let descriptor = AddressDescriptor::new(codecs.key.clone());
        let writer = OpenOptions::new()
            .append(true)
            .open(path)
            .map_err(|e| CacheError::io(path, e))?;
        let reader = File::open(path).map_err(|e| CacheError::io(path, e))?;

        let mut store = Self {
            path: path.to_path_buf(),
            codecs,
            descriptor,
            cache_version: header.cache_version,
            index: HashMap::new(),
            targets: HashMap::new(),
            len: 0,
            writer,
            reader: Mutex::new(reader),
            data_start,
            end: raw.len() as u64,
            live_bytes: 0,
            compact_on_close: true,
        };
        store.replay(&raw[data_start as usize..])?;

        tracing::debug!(
            path = %store.path.display(),
            records = store.len,
            stale_bytes = store.stale_bytes(),
            "opened cache store"
        );
        Ok(store)
    }

    /// Rebuilds the in-memory index from the log entries.
    fn replay(&mut self, mut data: &[u8]) -> Result<(), CacheError> {
        let mut offset = self.data_start;
        while !data.is_empty() {
            if (data.len() as u64) < ENTRY_HEADER_LEN {
                return Err(self.corrupt(format!("truncated entry header at offset {offset}")));
            }
            let kind = data[0];
            let len = u32::from_le_bytes([data[1], data[2], data[3], data[4]]);
            let mut checksum_bytes = [0u8; 8];
            checksum_bytes.copy_from_slice(&data[5..13]);
            let checksum = u64::from_le_bytes(checksum_bytes);

            let header_len = ENTRY_HEADER_LEN as usize;
            let Some(payload) = data.get(header_len..header_len + len as usize) else {
                return Err(self.corrupt(format!("truncated entry payload at offset {offset}")));
            };
            if checksum64(payload) != checksum {
                return Err(self.corrupt(format!("checksum mismatch at offset {offset}")));
            }

            let mut cursor = payload;
            let target = take_i32(&mut cursor)
                .ok_or_else(|| self.corrupt(format!("missing target at offset {offset}")))?;
            let key_bytes = take_chunk(&mut cursor)
                .ok_or_else(|| self.corrupt(format!("missing key at offset {offset}")))?;
            let key = self
                .codecs
                .key
                .decode(key_bytes)
                .map_err(|e| self.corrupt(format!("undecodable key at offset {offset}: {e}")))?;
            let address = CompositeAddress::new(target, key);

            match kind {
                ENTRY_PUT => {
                    self.validate_states(cursor, offset)?;
                    let location = ValueLocation {
                        offset: offset + ENTRY_HEADER_LEN,
                        len,
                        checksum,
                    };
                    self.live_bytes += location.entry_len();
                    self.index_put(address, location);
                }
                ENTRY_REMOVE => {
                    self.index_remove(address.target, &address.key);
                }
                other => {
                    return Err(self.corrupt(format!(
                        "unknown entry kind {other} at offset {offset}"
                    )));
                }
            }

            let consumed = header_len + len as usize;
            data = &data[consumed..];
            offset += consumed as u64;
        }
        Ok(())
    }

    /// Checks that the state chunks of a `put` payload decode with the
    /// current codecs.
    fn validate_states(&self, mut cursor: &[u8], offset: u64) -> Result<(), CacheError> {
        let source = take_chunk(&mut cursor)
            .ok_or_else(|| self.corrupt(format!("missing source state at offset {offset}")))?;
        let output = take_chunk(&mut cursor)
            .ok_or_else(|| self.corrupt(format!("missing output state at offset {offset}")))?;
        self.codecs.source.decode(source).map_err(|e| {
            self.corrupt(format!("undecodable source state at offset {offset}: {e}"))
        })?;
        self.codecs.output.decode(output).map_err(|e| {
            self.corrupt(format!("undecodable output state at offset {offset}: {e}"))
        })?;
        Ok(())
    }

    /// Returns the record stored for `key` under `target`, if any.
    pub fn get(&self, target: i32, key: &K) -> Result<Option<StoredRecord<S, O>>, CacheError> {
        let Some(slot) = self.find(target, key) else {
            return Ok(None);
        };
        let payload = read_payload(&self.reader, &self.path, slot.location)?;

        let Some((source_bytes, output_bytes)) = split_states(&payload) else {
            return Err(CacheError::invalid_data(
                &self.path,
                format!("malformed record at offset {}", slot.location.offset),
            ));
        };

        Ok(Some(StoredRecord {
            source_state: self.codecs.source.decode(source_bytes)?,
            output_state: self.codecs.output.decode(output_bytes)?,
        }))
    }

    /// Returns `true` if a record is stored for `key` under `target`.
    pub fn contains(&self, target: i32, key: &K) -> bool {
        self.find(target, key).is_some()
    }

    /// Stores a record for `key` under `target`, replacing any previous one.
    pub fn put(
        &mut self,
        target: i32,
        key: K,
        source_state: &S,
        output_state: &O,
    ) -> Result<(), CacheError> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&target.to_le_bytes());
        push_chunk(&mut payload, |out| self.codecs.key.encode(&key, out))?;
        push_chunk(&mut payload, |out| self.codecs.source.encode(source_state, out))?;
        push_chunk(&mut payload, |out| self.codecs.output.encode(output_state, out))?;

        let location = self.append(ENTRY_PUT, &payload)?;
        self.index_put(CompositeAddress::new(target, key), location);
        Ok(())
    }

    /// Removes the record for `key` under `target`. Returns `false` if
    /// nothing was stored.
    pub fn remove(&mut self, target: i32, key: &K) -> Result<bool, CacheError> {
        if self.find(target, key).is_none() {
            return Ok(false);
        }
        let mut payload = Vec::new();
        payload.extend_from_slice(&target.to_le_bytes());
        push_chunk(&mut payload, |out| self.codecs.key.encode(key, out))?;

        let location = self.append(ENTRY_REMOVE, &payload)?;
        // Remove entries never become live data.
        self.live_bytes -= location.entry_len();
        self.index_remove(target, key);
        Ok(true)
    }

    /// Visits every key stored under `target` until `visitor` returns `false`.
    ///
    /// Returns `false` if the visitor stopped the enumeration early.
    pub fn for_each_key_in_target(
        &self,
        target: i32,
        mut visitor: impl FnMut(&K) -> bool,
    ) -> bool {
        let Some(hashes) = self.targets.get(&target) else {
            return true;
        };
        for hash in hashes.keys() {
            let Some(bucket) = self.index.get(hash) else {
                continue;
            };
            for slot in bucket.iter().filter(|s| s.address.target == target) {
                if !visitor(&slot.address.key) {
                    return false;
                }
            }
        }
        true
    }

    /// Targets currently holding at least one record, in ascending order.
    pub fn targets(&self) -> Vec<i32> {
        self.targets
            .keys()
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Cache version recorded in the store header.
    pub fn version(&self) -> u32 {
        self.cache_version
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes in the log no longer referenced by any live record.
    pub fn stale_bytes(&self) -> u64 {
        self.end - self.data_start - self.live_bytes
    }

    /// Controls whether [`PersistentStore::close`] compacts a mostly stale log.
    pub fn set_compact_on_close(&mut self, compact: bool) {
        self.compact_on_close = compact;
    }

    /// Forces written entries to durable storage.
    pub fn flush(&mut self) -> Result<(), CacheError> {
        self.writer
            .sync_data()
            .map_err(|e| CacheError::io(&self.path, e))
    }

    /// Rewrites the log so it only contains live records.
    ///
    /// The new log is written to a sibling file and renamed over the
    /// original, so a crash mid-way leaves the old log intact.
    pub fn compact(&mut self) -> Result<(), CacheError> {
        let tmp_path = sibling_path(&self.path, COMPACT_SUFFIX);
        let header_bytes = encode_header(self.cache_version)?;

        let file = File::create(&tmp_path).map_err(|e| CacheError::io(&tmp_path, e))?;
        let mut out = BufWriter::new(file);
        out.write_all(&header_bytes)
            .map_err(|e| CacheError::io(&tmp_path, e))?;

        let mut offset = header_bytes.len() as u64;
        let mut relocated = Vec::with_capacity(self.len);
        for (hash, bucket) in &self.index {
            for (i, slot) in bucket.iter().enumerate() {
                let payload = read_payload(&self.reader, &self.path, slot.location)?;
                let entry = frame_entry(ENTRY_PUT, &payload, slot.location.checksum);
                out.write_all(&entry)
                    .map_err(|e| CacheError::io(&tmp_path, e))?;
                relocated.push((*hash, i, offset + ENTRY_HEADER_LEN));
                offset += entry.len() as u64;
            }
        }
        let file = out
            .into_inner()
            .map_err(|e| CacheError::io(&tmp_path, e.into_error()))?;
        file.sync_all().map_err(|e| CacheError::io(&tmp_path, e))?;
        drop(file);

        // Handles opened before the rename follow the file to its new name.
        let writer = OpenOptions::new()
            .append(true)
            .open(&tmp_path)
            .map_err(|e| CacheError::io(&tmp_path, e))?;
        let reader = File::open(&tmp_path).map_err(|e| CacheError::io(&tmp_path, e))?;
        if let Err(e) = std::fs::rename(&tmp_path, &self.path) {
            std::fs::remove_file(&tmp_path).ok();
            return Err(CacheError::io(&self.path, e));
        }
        self.writer = writer;
        self.reader = Mutex::new(reader);

        let stale = self.stale_bytes();
        for (hash, i, new_offset) in relocated {
            if let Some(slot) = self.index.get_mut(&hash).and_then(|b| b.get_mut(i)) {
                slot.location.offset = new_offset;
            }
        }
        self.data_start = header_bytes.len() as u64;
        self.end = offset;
        self.live_bytes = offset - self.data_start;

        tracing::debug!(
            path = %self.path.display(),
            records = self.len,
            reclaimed_bytes = stale,
            "compacted cache store"
        );
        Ok(())
    }

    /// Flushes and releases the store. Errors are logged, not returned.
    pub fn close(mut self) {
        if self.compact_on_close && self.should_compact() {
            if let Err(err) = self.compact() {
                tracing::warn!(path = %self.path.display(), %err, "failed to compact cache store");
            }
        }
        if let Err(err) = self.flush() {
            tracing::warn!(path = %self.path.display(), %err, "failed to close cache store");
        }
    }

    fn should_compact(&self) -> bool {
        let stale = self.stale_bytes();
        stale >= MIN_COMPACT_BYTES && stale > self.live_bytes
    }

    fn append(&mut self, kind: u8, payload: &[u8]) -> Result<ValueLocation, CacheError> {
        let len = u32::try_from(payload.len()).map_err(|_| CacheError::Codec {
            reason: format!("record of {} bytes is too large", payload.len()),
        })?;
        let checksum = checksum64(payload);
        let entry = frame_entry(kind, payload, checksum);
        self.writer
            .write_all(&entry)
            .map_err(|e| CacheError::io(&self.path, e))?;

        let location = ValueLocation {
            offset: self.end + ENTRY_HEADER_LEN,
            len,
            checksum,
        };
        self.end += entry.len() as u64;
        self.live_bytes += location.entry_len();
        Ok(location)
    }

    fn find(&self, target: i32, key: &K) -> Option<&Slot<K>> {
        self.index
            .get(&self.descriptor.hash_parts(target, key))?
            .iter()
            .find(|slot| self.descriptor.matches(&slot.address, target, key))
    }

    /// Points `address` at `location`. Callers account for the new entry's
    /// bytes in `live_bytes`; a replaced entry's bytes are released here.
    fn index_put(&mut self, address: CompositeAddress<K>, location: ValueLocation) {
        let hash = self.descriptor.hash(&address);
        let bucket = self.index.entry(hash).or_default();
        if let Some(slot) = bucket
            .iter_mut()
            .find(|slot| self.descriptor.equal(&slot.address, &address))
        {
            self.live_bytes -= slot.location.entry_len();
            slot.location = location;
        } else {
            *self
                .targets
                .entry(address.target)
                .or_default()
                .entry(hash)
                .or_default() += 1;
            bucket.push(Slot { address, location });
            self.len += 1;
        }
    }

    fn index_remove(&mut self, target: i32, key: &K) {
        let hash = self.descriptor.hash_parts(target, key);
        let Some(bucket) = self.index.get_mut(&hash) else {
            return;
        };
        let Some(pos) = bucket
            .iter()
            .position(|slot| self.descriptor.matches(&slot.address, target, key))
        else {
            return;
        };
        let slot = bucket.swap_remove(pos);
        if bucket.is_empty() {
            self.index.remove(&hash);
        }
        self.live_bytes -= slot.location.entry_len();
        self.len -= 1;

        if let Some(hashes) = self.targets.get_mut(&target) {
            if let Some(count) = hashes.get_mut(&hash) {
                *count -= 1;
                if *count == 0 {
                    hashes.remove(&hash);
                }
            }
            if hashes.is_empty() {
                self.targets.remove(&target);
            }
        }
    }

    fn corrupt(&self, reason: String) -> CacheError {
        CacheError::corrupted(&self.path, reason)
    }

}

/// Removes the backing file at `path` and every sibling file whose name
/// starts with the backing file's name.
pub fn delete_all_files(path: &Path) -> Result<(), CacheError> {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return Ok(());
    };
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(CacheError::io(dir, e)),
    };
    for entry in entries {
        let entry = entry.map_err(|e| CacheError::io(dir, e))?;
        let matches = entry
            .file_name()
            .to_str()
            .is_some_and(|n| n.starts_with(name));
        if matches {
            let file = entry.path();
            std::fs::remove_file(&file).map_err(|e| CacheError::io(&file, e))?;
        }
    }
    Ok(())
}

fn create_empty(path: &Path, cache_version: u32) -> Result<(), CacheError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| CacheError::io(dir, e))?;
    }
    let header_bytes = encode_header(cache_version)?;
    std::fs::write(path, header_bytes).map_err(|e| CacheError::io(path, e))
}

/// Encodes the store header as `u32 LE length + bincode header`.
fn encode_header(cache_version: u32) -> Result<Vec<u8>, CacheError> {
    let header = StoreHeader {
        magic: STORE_MAGIC,
        format_version: STORE_FORMAT_VERSION,
        cache_version,
    };
    let header_bytes = bincode::serde::encode_to_vec(&header, bincode::config::standard())
        .map_err(|e| CacheError::Serialization {
            reason: e.to_string(),
        })?;
    let mut output = Vec::with_capacity(4 + header_bytes.len());
    output.extend_from_slice(&(header_bytes.len() as u32).to_le_bytes());
    output.extend_from_slice(&header_bytes);
    Ok(output)
}

/// Parses and validates the header, returning it with the offset of the first entry.
fn parse_header(path: &Path, raw: &[u8]) -> Result<(StoreHeader, u64), CacheError> {
    if raw.len() < 4 {
        return Err(CacheError::corrupted(path, "missing header length"));
    }
    let header_len = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize;
    let Some(header_bytes) = raw.get(4..4 + header_len) else {
        return Err(CacheError::corrupted(path, "truncated header"));
    };
    let (header, _): (StoreHeader, usize) =
        bincode::serde::decode_from_slice(header_bytes, bincode::config::standard())
            .map_err(|e| CacheError::corrupted(path, format!("unreadable header: {e}")))?;

    if header.magic != STORE_MAGIC {
        return Err(CacheError::corrupted(path, "bad magic bytes"));
    }
    if header.format_version != STORE_FORMAT_VERSION {
        return Err(CacheError::corrupted(
            path,
            format!(
                "format version {} (expected {STORE_FORMAT_VERSION})",
                header.format_version
            ),
        ));
    }
    Ok((header, (4 + header_len) as u64))
}

fn frame_entry(kind: u8, payload: &[u8], checksum: u64) -> Vec<u8> {
    let mut entry = Vec::with_capacity(ENTRY_HEADER_LEN as usize + payload.len());
    entry.push(kind);
    entry.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    entry.extend_from_slice(&checksum.to_le_bytes());
    entry.extend_from_slice(payload);
    entry
}

fn read_payload(
    reader: &Mutex<File>,
    path: &Path,
    location: ValueLocation,
) -> Result<Vec<u8>, CacheError> {
    let mut file = reader.lock().map_err(|_| {
        CacheError::io(path, std::io::Error::other("cache store reader lock poisoned"))
    })?;
    let mut payload = vec![0u8; location.len as usize];
    file.seek(SeekFrom::Start(location.offset))
        .and_then(|_| file.read_exact(&mut payload))
        .map_err(|e| CacheError::io(path, e))?;
    if checksum64(&payload) != location.checksum {
        return Err(CacheError::invalid_data(
            path,
            format!("checksum mismatch at offset {}", location.offset),
        ));
    }
    Ok(payload)
}

/// Appends a `u32 LE` length-prefixed chunk produced by `write`.
fn push_chunk(
    out: &mut Vec<u8>,
    write: impl FnOnce(&mut Vec<u8>) -> Result<(), CacheError>,
) -> Result<(), CacheError> {
    let start = out.len();
    out.extend_from_slice(&[0; 4]);
    write(out)?;
    let len = u32::try_from(out.len() - start - 4).map_err(|_| CacheError::Codec {
        reason: "encoded value exceeds 4 GiB".to_string(),
    })?;
    out[start..start + 4].copy_from_slice(&len.to_le_bytes());
    Ok(())
}

/// Splits a `put` payload into its source and output chunks.
fn split_states(payload: &[u8]) -> Option<(&[u8], &[u8])> {
    let mut cursor = payload;
    take_i32(&mut cursor)?;
    take_chunk(&mut cursor)?;
    let source = take_chunk(&mut cursor)?;
    let output = take_chunk(&mut cursor)?;
    Some((source, output))
}

fn take_i32(input: &mut &[u8]) -> Option<i32> {
    let (head, rest) = input.split_first_chunk::<4>()?;
    *input = rest;
    Some(i32::from_le_bytes(*head))
}

fn take_chunk<'a>(input: &mut &'a [u8]) -> Option<&'a [u8]> {
    let (head, rest) = input.split_first_chunk::<4>()?;
    let len = u32::from_le_bytes(*head) as usize;
    let chunk = rest.get(..len)?;
    *input = &rest[len..];
    Some(chunk)
}

fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(suffix);
    path.with_file_name(name)
}
