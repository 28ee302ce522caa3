//! Change classification and the per-target processing protocol.
//!
//! For one target, the items a front-end currently reports are compared with
//! what the cache remembers:
//!
//! - **changed**: no stored record (new) or a stored source state that
//!   differs from the fresh one (modified). These are reprocessed and their
//!   new states written back.
//! - **unchanged**: stored source state equals the fresh one. Nothing happens.
//! - **obsolete**: stored under the target but no longer reported. The
//!   front-end discards their outputs and the records are removed.
//!
//! Stored keys are snapshotted before anything is mutated, so the cache is
//! never modified while it is being enumerated.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::address::KeySet;
use crate::cache::CompilerCache;
use crate::error::{CacheError, SessionError};
use crate::store::StoredRecord;

/// An item currently belonging to a target, with its freshly computed state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item<K, S> {
    /// Item key.
    pub key: K,
    /// Source state computed by the front-end for this build.
    pub source_state: S,
}

impl<K, S> Item<K, S> {
    /// Creates an item.
    pub fn new(key: K, source_state: S) -> Self {
        Self { key, source_state }
    }
}

/// A stored item that is no longer part of its target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObsoleteItem<K, S, O> {
    /// Item key.
    pub key: K,
    /// What the cache remembered for it, so outputs can be located.
    pub record: StoredRecord<S, O>,
}

/// Notifications the protocol and the front-end emit while processing.
///
/// These are write-only: they never affect cache state.
pub trait OutputConsumer<K> {
    /// A file was written or deleted and should be refreshed.
    fn add_file_to_refresh(&mut self, file: &Path);

    /// A directory's contents changed and should be refreshed.
    fn add_directory_to_refresh(&mut self, dir: &Path);

    /// An item was handled successfully this session.
    fn add_processed_item(&mut self, item: &K);
}

/// An [`OutputConsumer`] that records every notification.
#[derive(Debug, Clone)]
pub struct CollectingConsumer<K> {
    /// Files reported for refresh, in order.
    pub files: Vec<PathBuf>,
    /// Directories reported for refresh, in order.
    pub directories: Vec<PathBuf>,
    /// Items reported as processed, in order.
    pub processed: Vec<K>,
}

impl<K> CollectingConsumer<K> {
    /// Creates an empty consumer.
    pub fn new() -> Self {
        Self {
            files: Vec::new(),
            directories: Vec::new(),
            processed: Vec::new(),
        }
    }
}

impl<K> Default for CollectingConsumer<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Clone> OutputConsumer<K> for CollectingConsumer<K> {
    fn add_file_to_refresh(&mut self, file: &Path) {
        self.files.push(file.to_path_buf());
    }

    fn add_directory_to_refresh(&mut self, dir: &Path) {
        self.directories.push(dir.to_path_buf());
    }

    fn add_processed_item(&mut self, item: &K) {
        self.processed.push(item.clone());
    }
}

/// The compiler front-end driven by the protocol.
///
/// Front-ends report failures as plain messages; the protocol wraps them in
/// [`SessionError::FrontEnd`] together with the target.
pub trait CompilerInstance<K, S, O> {
    /// Every target that exists in the project.
    fn all_targets(&self) -> Vec<i32>;

    /// Targets to process in this session.
    fn selected_targets(&self) -> Vec<i32>;

    /// Items currently belonging to `target`, with fresh source states.
    fn items(&mut self, target: i32) -> Result<Vec<Item<K, S>>, String>;

    /// Reprocesses changed items.
    ///
    /// Returns one outcome per input item, in order: `Some(output_state)` on
    /// success, `None` if the item failed and must be retried next session.
    fn process(
        &mut self,
        target: i32,
        items: &[Item<K, S>],
        consumer: &mut dyn OutputConsumer<K>,
    ) -> Result<Vec<Option<O>>, String>;

    /// Discards the outputs of obsolete items.
    fn discard(
        &mut self,
        target: i32,
        items: &[ObsoleteItem<K, S, O>],
        consumer: &mut dyn OutputConsumer<K>,
    ) -> Result<(), String>;
}

/// Partition of a target's items relative to the cache.
#[derive(Debug, Clone)]
pub struct ChangeSet<K, S, O> {
    /// Items with no stored record.
    pub new_items: Vec<Item<K, S>>,
    /// Items whose stored source state differs from the fresh one.
    pub modified_items: Vec<Item<K, S>>,
    /// Items whose stored source state matches.
    pub unchanged_items: Vec<Item<K, S>>,
    /// Stored items no longer reported for the target.
    pub obsolete: Vec<ObsoleteItem<K, S, O>>,
}

impl<K, S, O> ChangeSet<K, S, O> {
    /// Returns `true` if nothing needs reprocessing or cleanup.
    pub fn is_empty(&self) -> bool {
        self.new_items.is_empty() && self.modified_items.is_empty() && self.obsolete.is_empty()
    }

    /// Number of items that need reprocessing (new + modified).
    pub fn dirty_count(&self) -> usize {
        self.new_items.len() + self.modified_items.len()
    }
}

/// Counts of what happened to one target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetReport {
    /// The target processed.
    pub target: i32,
    /// Items seen for the first time.
    pub new: usize,
    /// Items whose source state changed.
    pub modified: usize,
    /// Items skipped because nothing changed.
    pub unchanged: usize,
    /// Stored items removed because they left the target.
    pub obsolete: usize,
    /// Changed items reprocessed and written back.
    pub processed: usize,
    /// Changed items the front-end failed on.
    pub failed: usize,
}

/// Outcome of a whole session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionReport {
    /// One report per selected target, in selection order.
    pub targets: Vec<TargetReport>,
    /// Targets that vanished from the project and were cleared from the cache.
    pub removed_targets: Vec<TargetReport>,
}

/// Classifies `items` of `target` against the cache without modifying it.
///
/// Source states are compared with the cache's source codec. If the same key
/// appears twice in `items`, only its first occurrence counts.
pub fn classify<K: Clone, S, O>(
    cache: &CompilerCache<K, S, O>,
    target: i32,
    items: Vec<Item<K, S>>,
) -> Result<ChangeSet<K, S, O>, CacheError> {
    let codecs = cache.codecs().clone();

    let mut stored = Vec::new();
    cache.process_sources(target, |key| {
        stored.push(key.clone());
        true
    })?;

    let mut current = KeySet::new(codecs.key.clone());
    let mut changes = ChangeSet {
        new_items: Vec::new(),
        modified_items: Vec::new(),
        unchanged_items: Vec::new(),
        obsolete: Vec::new(),
    };

    for item in items {
        if !current.insert(item.key.clone()) {
            tracing::debug!(target_id = target, "ignoring duplicate item");
            continue;
        }
        match cache.get_state(target, &item.key)? {
            None => changes.new_items.push(item),
            Some(record) if codecs.source.equal(&record.source_state, &item.source_state) => {
                changes.unchanged_items.push(item)
            }
            Some(_) => changes.modified_items.push(item),
        }
    }

    for key in stored {
        if current.contains(&key) {
            continue;
        }
        if let Some(record) = cache.get_state(target, &key)? {
            changes.obsolete.push(ObsoleteItem { key, record });
        }
    }

    Ok(changes)
}

/// Runs the protocol for one target.
///
/// Obsolete items are discarded and removed first, then changed items are
/// reprocessed. Each successful outcome is written back with the item's fresh
/// source state and reported through [`OutputConsumer::add_processed_item`].
pub fn process_target<K, S, O, C>(
    cache: &mut CompilerCache<K, S, O>,
    instance: &mut C,
    target: i32,
    consumer: &mut dyn OutputConsumer<K>,
) -> Result<TargetReport, SessionError>
where
    K: Clone,
    C: CompilerInstance<K, S, O> + ?Sized,
{
    let items = instance
        .items(target)
        .map_err(|reason| SessionError::FrontEnd { target, reason })?;
    let changes = classify(cache, target, items)?;

    let mut report = TargetReport {
        target,
        new: changes.new_items.len(),
        modified: changes.modified_items.len(),
        unchanged: changes.unchanged_items.len(),
        obsolete: changes.obsolete.len(),
        ..TargetReport::default()
    };

    remove_obsolete(cache, instance, target, &changes.obsolete, consumer)?;

    let changed: Vec<Item<K, S>> = changes
        .new_items
        .into_iter()
        .chain(changes.modified_items)
        .collect();
    if !changed.is_empty() {
        let outcomes = instance
            .process(target, &changed, consumer)
            .map_err(|reason| SessionError::FrontEnd { target, reason })?;
        if outcomes.len() != changed.len() {
            return Err(SessionError::OutcomeCount {
                target,
                expected: changed.len(),
                actual: outcomes.len(),
            });
        }
        for (item, outcome) in changed.into_iter().zip(outcomes) {
            match outcome {
                Some(output_state) => {
                    cache.put_state(
                        target,
                        item.key.clone(),
                        &item.source_state,
                        &output_state,
                    )?;
                    consumer.add_processed_item(&item.key);
                    report.processed += 1;
                }
                None => report.failed += 1,
            }
        }
    }

    if report.failed > 0 {
        tracing::warn!(
            target_id = target,
            failed = report.failed,
            "front-end failed on some items"
        );
    }
    tracing::debug!(
        target_id = target,
        new = report.new,
        modified = report.modified,
        unchanged = report.unchanged,
        obsolete = report.obsolete,
        "processed target"
    );
    Ok(report)
}

/// Runs the protocol for every selected target.
///
/// Targets still stored in the cache but absent from
/// [`CompilerInstance::all_targets`] have all their items treated as
/// obsolete before the selected targets are processed.
pub fn process_session<K, S, O, C>(
    cache: &mut CompilerCache<K, S, O>,
    instance: &mut C,
    consumer: &mut dyn OutputConsumer<K>,
) -> Result<SessionReport, SessionError>
where
    K: Clone,
    C: CompilerInstance<K, S, O> + ?Sized,
{
    let mut report = SessionReport::default();

    let known: BTreeSet<i32> = instance.all_targets().into_iter().collect();
    for target in cache.targets()? {
        if known.contains(&target) {
            continue;
        }
        let obsolete = classify(cache, target, Vec::new())?.obsolete;
        remove_obsolete(cache, instance, target, &obsolete, consumer)?;
        tracing::debug!(target_id = target, obsolete = obsolete.len(), "cleared removed target");
        report.removed_targets.push(TargetReport {
            target,
            obsolete: obsolete.len(),
            ..TargetReport::default()
        });
    }

    for target in instance.selected_targets() {
        report
            .targets
            .push(process_target(cache, instance, target, consumer)?);
    }
    Ok(report)
}

fn remove_obsolete<K, S, O, C>(
    cache: &mut CompilerCache<K, S, O>,
    instance: &mut C,
    target: i32,
    obsolete: &[ObsoleteItem<K, S, O>],
    consumer: &mut dyn OutputConsumer<K>,
) -> Result<(), SessionError>
where
    C: CompilerInstance<K, S, O> + ?Sized,
{
    if obsolete.is_empty() {
        return Ok(());
    }
    instance
        .discard(target, obsolete, consumer)
        .map_err(|reason| SessionError::FrontEnd { target, reason })?;
    for item in obsolete {
        cache.remove(target, &item.key)?;
    }
    Ok(())
}
