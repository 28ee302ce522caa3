//! End-to-end incremental builds over real files.
//!
//! A toy front-end "compiles" every `.src` file of a module directory by
//! copying it to `out/<module>/<name>.out`, and the cache decides which
//! files need that work across successive sessions.

use std::path::{Path, PathBuf};

use stamp_cache::{
    process_session, CacheError, Codecs, CollectingConsumer, CompilerCache, CompilerInstance,
    Item, ObsoleteItem, OutputConsumer, SessionReport, TIMESTAMPS_FILE,
};
use stamp_common::FileStamp;

type Cache = CompilerCache<PathBuf, FileStamp, PathBuf>;

/// Targets are module directories `mod<N>` under the project root.
struct CopyCompiler {
    root: PathBuf,
    modules: Vec<i32>,
    compiled: Vec<PathBuf>,
}

impl CopyCompiler {
    fn new(root: &Path, modules: &[i32]) -> Self {
        Self {
            root: root.to_path_buf(),
            modules: modules.to_vec(),
            compiled: Vec::new(),
        }
    }

    fn module_dir(&self, target: i32) -> PathBuf {
        self.root.join(format!("mod{target}"))
    }

    fn out_dir(&self, target: i32) -> PathBuf {
        self.root.join("out").join(format!("mod{target}"))
    }
}

impl CompilerInstance<PathBuf, FileStamp, PathBuf> for CopyCompiler {
    fn all_targets(&self) -> Vec<i32> {
        self.modules.clone()
    }

    fn selected_targets(&self) -> Vec<i32> {
        self.modules.clone()
    }

    fn items(&mut self, target: i32) -> Result<Vec<Item<PathBuf, FileStamp>>, String> {
        let mut items = Vec::new();
        let entries = std::fs::read_dir(self.module_dir(target)).map_err(|e| e.to_string())?;
        for entry in entries {
            let path = entry.map_err(|e| e.to_string())?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("src") {
                let stamp = FileStamp::of_file(&path).map_err(|e| e.to_string())?;
                items.push(Item::new(path, stamp));
            }
        }
        Ok(items)
    }

    fn process(
        &mut self,
        target: i32,
        items: &[Item<PathBuf, FileStamp>],
        consumer: &mut dyn OutputConsumer<PathBuf>,
    ) -> Result<Vec<Option<PathBuf>>, String> {
        let out_dir = self.out_dir(target);
        std::fs::create_dir_all(&out_dir).map_err(|e| e.to_string())?;
        consumer.add_directory_to_refresh(&out_dir);

        let mut outcomes = Vec::new();
        for item in items {
            let Some(stem) = item.key.file_stem() else {
                outcomes.push(None);
                continue;
            };
            let output = out_dir.join(stem).with_extension("out");
            std::fs::copy(&item.key, &output).map_err(|e| e.to_string())?;
            consumer.add_file_to_refresh(&output);
            self.compiled.push(item.key.clone());
            outcomes.push(Some(output));
        }
        Ok(outcomes)
    }

    fn discard(
        &mut self,
        _target: i32,
        items: &[ObsoleteItem<PathBuf, FileStamp, PathBuf>],
        consumer: &mut dyn OutputConsumer<PathBuf>,
    ) -> Result<(), String> {
        for item in items {
            let output = &item.record.output_state;
            if output.exists() {
                std::fs::remove_file(output).map_err(|e| e.to_string())?;
            }
            consumer.add_file_to_refresh(output);
        }
        Ok(())
    }
}

fn write(root: &Path, rel: &str, content: &str) -> PathBuf {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, content).unwrap();
    path
}

fn open(cache_dir: &Path) -> Cache {
    CompilerCache::create("copy", cache_dir, Codecs::bincode()).unwrap()
}

fn run(cache_dir: &Path, compiler: &mut CopyCompiler) -> SessionReport {
    let mut cache = open(cache_dir);
    let mut consumer = CollectingConsumer::<PathBuf>::new();
    let report = process_session(&mut cache, compiler, &mut consumer).unwrap();
    cache.close();
    report
}

#[test]
fn rebuilds_only_what_changed() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let cache_dir = root.join(".stamp-cache");
    let a = write(root, "mod1/a.src", "alpha");
    let b = write(root, "mod1/b.src", "beta");
    write(root, "mod2/c.src", "gamma");

    // First build: everything is new.
    let mut compiler = CopyCompiler::new(root, &[1, 2]);
    let report = run(&cache_dir, &mut compiler);
    assert_eq!(report.targets[0].new, 2);
    assert_eq!(report.targets[1].new, 1);
    assert_eq!(compiler.compiled.len(), 3);
    assert!(root.join("out/mod1/a.out").exists());

    // Second build: nothing changed.
    let mut compiler = CopyCompiler::new(root, &[1, 2]);
    let report = run(&cache_dir, &mut compiler);
    assert!(compiler.compiled.is_empty());
    assert_eq!(report.targets[0].unchanged, 2);
    assert_eq!(report.targets[1].unchanged, 1);

    // Third build: a edited, b deleted, d added.
    std::fs::write(&a, "alpha v2").unwrap();
    std::fs::remove_file(&b).unwrap();
    let d = write(root, "mod1/d.src", "delta");
    let mut compiler = CopyCompiler::new(root, &[1, 2]);
    let report = run(&cache_dir, &mut compiler);
    let mod1 = &report.targets[0];
    assert_eq!((mod1.new, mod1.modified, mod1.obsolete), (1, 1, 1));
    let mut compiled = compiler.compiled.clone();
    compiled.sort();
    assert_eq!(compiled, vec![a.clone(), d.clone()]);
    assert!(!root.join("out/mod1/b.out").exists());
    assert_eq!(
        std::fs::read_to_string(root.join("out/mod1/a.out")).unwrap(),
        "alpha v2"
    );

    let cache = open(&cache_dir);
    assert!(cache.get_state(1, &b).unwrap().is_none());
    let stored = cache.get_state(1, &a).unwrap().unwrap();
    assert_eq!(stored.source_state, FileStamp::from_content(b"alpha v2"));
    assert_eq!(stored.output_state, root.join("out/mod1/a.out"));
}

#[test]
fn removed_module_is_cleared() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let cache_dir = root.join(".stamp-cache");
    write(root, "mod1/a.src", "alpha");
    write(root, "mod2/c.src", "gamma");

    run(&cache_dir, &mut CopyCompiler::new(root, &[1, 2]));
    let report = run(&cache_dir, &mut CopyCompiler::new(root, &[1]));

    assert_eq!(report.removed_targets.len(), 1);
    assert_eq!(report.removed_targets[0].target, 2);
    assert!(!root.join("out/mod2/c.out").exists());
    assert_eq!(open(&cache_dir).targets().unwrap(), vec![1]);
}

#[test]
fn corrupted_cache_triggers_full_rebuild() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let cache_dir = root.join(".stamp-cache");
    write(root, "mod1/a.src", "alpha");
    write(root, "mod1/b.src", "beta");
    run(&cache_dir, &mut CopyCompiler::new(root, &[1]));

    let store = cache_dir.join("copy").join(TIMESTAMPS_FILE);
    let len = std::fs::metadata(&store).unwrap().len();
    let file = std::fs::OpenOptions::new().write(true).open(&store).unwrap();
    file.set_len(len - 3).unwrap();
    drop(file);

    let mut compiler = CopyCompiler::new(root, &[1]);
    let report = run(&cache_dir, &mut compiler);
    assert_eq!(report.targets[0].new, 2);
    assert_eq!(compiler.compiled.len(), 2);
}

#[test]
fn target_isolation_across_many_targets() {
    let dir = tempfile::tempdir().unwrap();
    let mut cache = open(dir.path());
    for target in 0..5 {
        for i in 0..10 {
            let key = PathBuf::from(format!("mod{target}/f{i}.src"));
            let stamp = FileStamp::from_content(key.to_string_lossy().as_bytes());
            cache.put_state(target, key.clone(), &stamp, &key).unwrap();
        }
    }
    for target in 0..5 {
        let prefix = format!("mod{target}/");
        let mut seen = 0;
        cache
            .process_sources(target, |key| {
                assert!(key.to_string_lossy().starts_with(&prefix));
                seen += 1;
                true
            })
            .unwrap();
        assert_eq!(seen, 10);
    }
}

#[test]
fn io_errors_propagate_after_close() {
    let dir = tempfile::tempdir().unwrap();
    let mut cache = open(dir.path());
    cache.close();
    let err = cache.process_sources(1, |_| true).unwrap_err();
    assert!(matches!(err, CacheError::Closed { .. }));
}
