use std::fs;

use tempfile::Builder;

use tessera::config::{IndexConfig, LockConfig};
use tessera::document::{Document, Term};
use tessera::error::TesseraError;
use tessera::index::Index;

fn config() -> IndexConfig {
    IndexConfig {
        lock: LockConfig {
            timeout_ms: 40,
            poll_interval_ms: 5,
            max_poll_interval_ms: 20,
        },
        ..IndexConfig::default()
    }
}

fn doc(id: usize, body: &str) -> Document {
    Document::builder()
        .add_terms("id", [id.to_string()])
        .add_text("body", body)
        .build()
}

fn file_names(dir: &std::path::Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[test]
fn test_index_persists_across_handles() {
    let dir = Builder::new().prefix("tessera_persist").tempdir().unwrap();

    {
        let index = Index::open_dir(dir.path(), config()).unwrap();
        let mut writer = index.writer().unwrap();
        assert!(dir.path().join("write.lock").exists());
        writer.add_documents((0..6).map(|i| doc(i, "on disk"))).unwrap();
        writer.close().unwrap();
        assert!(!dir.path().join("write.lock").exists());
    }

    let generation = {
        let index = Index::open_dir(dir.path(), config()).unwrap();
        assert!(index.exists().unwrap());
        let reader = index.reader().unwrap();
        assert_eq!(reader.num_docs(), 6);
        assert_eq!(reader.term_docs(&Term::new("body", "disk")).unwrap().len(), 6);
        reader.generation()
    };

    assert_eq!(
        file_names(dir.path()),
        vec![
            "_0.nrm".to_string(),
            "_0.seg".to_string(),
            "segments.gen".to_string(),
            format!("segments_{generation}"),
        ]
    );
}

#[test]
fn test_lock_is_shared_across_handles() {
    let dir = Builder::new().prefix("tessera_lock").tempdir().unwrap();
    let first = Index::open_dir(dir.path(), config()).unwrap();
    let second = Index::open_dir(dir.path(), config()).unwrap();

    let writer = first.writer().unwrap();
    match second.writer() {
        Err(TesseraError::LockObtainFailed { lock, .. }) => {
            assert!(lock.ends_with("write.lock"));
            assert!(lock.contains(&dir.path().display().to_string()));
        }
        other => panic!("expected LockObtainFailed, got {other:?}"),
    }
    assert!(second.is_locked().unwrap());
    drop(writer);

    assert!(!second.is_locked().unwrap());
    second.writer().unwrap().close().unwrap();
}

#[test]
fn test_stale_lock_file_needs_unlock() {
    let dir = Builder::new().prefix("tessera_stale_lock").tempdir().unwrap();
    let index = Index::open_dir(dir.path(), config()).unwrap();
    index.writer().unwrap().close().unwrap();

    // A crashed process leaves its lock file behind.
    fs::write(dir.path().join("write.lock"), "crashed-owner").unwrap();
    assert!(matches!(index.writer(), Err(TesseraError::LockObtainFailed { .. })));

    index.unlock().unwrap();
    let mut writer = index.writer().unwrap();
    writer.add_document(doc(0, "recovered")).unwrap();
    writer.close().unwrap();
    assert_eq!(index.stats().unwrap().doc_count, 1);
}

#[test]
fn test_leftovers_of_a_crash_are_reclaimed() {
    let dir = Builder::new().prefix("tessera_crash").tempdir().unwrap();
    let index = Index::open_dir(dir.path(), config()).unwrap();
    let mut writer = index.writer().unwrap();
    writer.add_document(doc(0, "kept")).unwrap();
    writer.close().unwrap();

    fs::write(dir.path().join("pending_segments_9"), b"torn").unwrap();
    fs::write(dir.path().join("_7.seg"), b"torn").unwrap();
    fs::write(dir.path().join("_0_3.del"), b"torn").unwrap();
    fs::write(dir.path().join("notes.txt"), b"not ours").unwrap();

    let mut unreferenced = index.unreferenced_files().unwrap();
    unreferenced.sort();
    assert_eq!(unreferenced, vec!["_0_3.del", "_7.seg", "pending_segments_9"]);

    // Opening a writer runs a deleter pass.
    let mut writer = index.writer().unwrap();
    assert!(!dir.path().join("_7.seg").exists());
    assert!(!dir.path().join("pending_segments_9").exists());
    assert!(dir.path().join("notes.txt").exists());

    writer.add_document(doc(1, "new")).unwrap();
    writer.close().unwrap();
    let reader = index.reader().unwrap();
    assert_eq!(reader.num_docs(), 2);
    assert!(index.check().unwrap().is_ok());
}

#[test]
fn test_compound_segments() {
    let dir = Builder::new().prefix("tessera_cfs").tempdir().unwrap();
    let config = IndexConfig {
        use_compound_file: true,
        ..config()
    };
    let index = Index::open_dir(dir.path(), config).unwrap();
    let mut writer = index.writer().unwrap();
    writer.add_documents((0..3).map(|i| doc(i, "packed"))).unwrap();
    writer.close().unwrap();

    let names = file_names(dir.path());
    assert!(names.contains(&"_0.cfs".to_string()));
    assert!(!names.contains(&"_0.seg".to_string()));

    let mut reader = index.reader().unwrap();
    reader.delete_documents(&Term::new("id", "1")).unwrap();
    reader.close().unwrap();

    let reader = index.reader().unwrap();
    assert_eq!(reader.num_docs(), 2);
    assert!(dir.path().join("_0_1.del").exists());
}

#[test]
fn test_check_reports_truncated_segment() {
    let dir = Builder::new().prefix("tessera_check").tempdir().unwrap();
    let index = Index::open_dir(dir.path(), config()).unwrap();
    let mut writer = index.writer().unwrap();
    writer.add_documents((0..3).map(|i| doc(i, "truncate me"))).unwrap();
    writer.close().unwrap();

    let path = dir.path().join("_0.seg");
    let bytes = fs::read(&path).unwrap();
    fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();

    let report = index.check().unwrap();
    assert!(!report.is_ok());
    assert!(report.missing_files.is_empty());
    assert!(report.segments[0].error.is_some());
    assert!(matches!(index.reader(), Err(TesseraError::CorruptIndex(_))));
}
