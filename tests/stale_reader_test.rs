use tessera::config::{IndexConfig, LockConfig};
use tessera::document::{Document, Term};
use tessera::error::TesseraError;
use tessera::index::{Index, ReaderState};

fn config() -> IndexConfig {
    IndexConfig {
        lock: LockConfig {
            timeout_ms: 25,
            poll_interval_ms: 5,
            max_poll_interval_ms: 10,
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

/// Index with ten documents in one segment; even ids contain "even".
fn build_index() -> Index {
    let index = Index::in_memory(config()).unwrap();
    let mut writer = index.writer().unwrap();
    for i in 0..10 {
        let body = if i % 2 == 0 { "even number" } else { "odd number" };
        writer.add_document(doc(i, body)).unwrap();
    }
    writer.close().unwrap();
    index
}

#[test]
fn test_structural_change_makes_reader_stale() {
    let index = build_index();
    let mut reader = index.reader().unwrap();

    let mut writer = index.writer().unwrap();
    writer.add_document(doc(10, "late")).unwrap();
    writer.close().unwrap();

    assert!(!reader.is_current().unwrap());
    assert!(matches!(reader.delete_document(0), Err(TesseraError::StaleReader(_))));
    assert!(matches!(
        reader.set_norm(0, "body", 7),
        Err(TesseraError::StaleReader(_))
    ));
    assert!(matches!(
        reader.delete_documents(&Term::new("body", "even")),
        Err(TesseraError::StaleReader(_))
    ));

    // Rejected without staging anything or keeping the lock.
    assert_eq!(reader.state(), ReaderState::Opened);
    assert_eq!(reader.num_docs(), 10);
    assert!(!reader.is_deleted(0).unwrap());
    assert!(!index.is_locked().unwrap());

    let mut reopened = reader.reopen().unwrap();
    assert_eq!(reopened.num_docs(), 11);
    reopened.delete_document(0).unwrap();
    reopened.close().unwrap();
    reader.close().unwrap();

    let fresh = index.reader().unwrap();
    assert_eq!(fresh.num_docs(), 10);
    assert!(fresh.is_deleted(0).unwrap());
}

#[test]
fn test_deletion_visible_only_to_later_sessions() {
    let index = build_index();
    let before = index.reader().unwrap();

    let mut deleter = index.reader().unwrap();
    assert_eq!(deleter.delete_documents(&Term::new("body", "even")).unwrap(), 5);
    deleter.close().unwrap();

    assert_eq!(before.num_docs(), 10);
    assert_eq!(before.term_docs(&Term::new("body", "even")).unwrap().len(), 5);
    assert!(!before.has_deletions());

    let after = index.reader().unwrap();
    assert_eq!(after.num_docs(), 5);
    assert!(after.term_docs(&Term::new("body", "even")).unwrap().is_empty());
    assert_eq!(after.term_docs(&Term::new("body", "odd")).unwrap(), vec![1, 3, 5, 7, 9]);
    assert!(after.has_deletions());
}

#[test]
fn test_writer_lock_blocks_reader_mutation() {
    let index = build_index();
    let mut reader = index.reader().unwrap();

    let writer = index.writer().unwrap();
    assert!(matches!(
        reader.delete_document(3),
        Err(TesseraError::LockObtainFailed { .. })
    ));
    assert!(!reader.is_deleted(3).unwrap());

    // A writer that changes nothing publishes nothing, so the reader is
    // still current once the lock is free.
    let mut writer = writer;
    writer.close().unwrap();
    assert!(reader.is_current().unwrap());
    reader.delete_document(3).unwrap();

    // The reader now holds the lock until it commits.
    assert!(matches!(index.writer(), Err(TesseraError::LockObtainFailed { .. })));
    reader.commit().unwrap();
    assert!(!index.is_locked().unwrap());
    assert_eq!(index.reader().unwrap().num_docs(), 9);
}

#[test]
fn test_out_of_range_leaves_state_unchanged() {
    let index = build_index();
    let mut reader = index.reader().unwrap();
    reader.delete_document(2).unwrap();
    reader.set_norm(4, "body", 9).unwrap();

    assert!(matches!(
        reader.delete_document(11),
        Err(TesseraError::OutOfRange { doc: 11, max_doc: 10 })
    ));
    assert!(matches!(
        reader.delete_document(10),
        Err(TesseraError::OutOfRange { doc: 10, max_doc: 10 })
    ));
    assert!(matches!(
        reader.set_norm(10, "body", 1),
        Err(TesseraError::OutOfRange { .. })
    ));

    for doc in 0..10 {
        assert_eq!(reader.is_deleted(doc).unwrap(), doc == 2);
    }
    assert_eq!(reader.norm(4, "body").unwrap(), 9);
    reader.close().unwrap();

    let fresh = index.reader().unwrap();
    assert_eq!(fresh.num_docs(), 9);
    assert_eq!(fresh.norm(4, "body").unwrap(), 9);
}

#[test]
fn test_undelete_all_committed_immediately() {
    let index = build_index();
    let mut reader = index.reader().unwrap();
    assert_eq!(reader.delete_documents(&Term::new("body", "odd")).unwrap(), 5);
    reader.commit().unwrap();
    assert_eq!(reader.num_docs(), 5);

    reader.undelete_all().unwrap();
    assert_eq!(reader.num_docs(), 10);
    reader.commit().unwrap();
    reader.close().unwrap();

    let fresh = index.reader().unwrap();
    assert_eq!(fresh.num_docs(), 10);
    assert!(!fresh.has_deletions());
}

#[test]
fn test_undelete_all_after_reopen() {
    let index = build_index();
    let mut reader = index.reader().unwrap();
    for doc in [0, 4, 8] {
        reader.delete_document(doc).unwrap();
    }
    reader.close().unwrap();

    let mut reader = index.reader().unwrap();
    assert_eq!(reader.num_docs(), 7);
    reader.undelete_all().unwrap();
    reader.close().unwrap();

    let fresh = index.reader().unwrap();
    assert_eq!(fresh.num_docs(), 10);
    assert_eq!(index.stats().unwrap().deleted_count, 0);
}

#[test]
fn test_failed_commit_keeps_changes_staged() {
    let index = build_index();
    let mut reader = index.reader().unwrap();
    reader.delete_document(1).unwrap();

    // Someone removes the lock and publishes a structural change meanwhile.
    index.unlock().unwrap();
    let mut writer = index.writer().unwrap();
    writer.add_document(doc(10, "intruder")).unwrap();
    writer.close().unwrap();

    assert!(matches!(reader.commit(), Err(TesseraError::StaleReader(_))));
    assert_eq!(reader.state(), ReaderState::PendingChanges);
    assert!(reader.is_deleted(1).unwrap());
    assert!(!index.is_locked().unwrap());

    let fresh = index.reader().unwrap();
    assert_eq!(fresh.num_docs(), 11);
    assert!(!fresh.is_deleted(1).unwrap());

    assert!(matches!(reader.close(), Err(TesseraError::StaleReader(_))));
    assert_eq!(reader.state(), ReaderState::Closed);
}

#[test]
fn test_undelete_all_needs_lock_and_fresh_view() {
    let index = build_index();
    let mut reader = index.reader().unwrap();

    let mut writer = index.writer().unwrap();
    assert!(matches!(
        reader.undelete_all(),
        Err(TesseraError::LockObtainFailed { .. })
    ));
    writer.add_document(doc(10, "late")).unwrap();
    writer.commit().unwrap();
    assert!(matches!(
        reader.undelete_all(),
        Err(TesseraError::LockObtainFailed { .. })
    ));
    writer.close().unwrap();

    assert!(!reader.is_current().unwrap());
    assert!(matches!(reader.undelete_all(), Err(TesseraError::StaleReader(_))));
    assert_eq!(reader.state(), ReaderState::Opened);
    assert!(!index.is_locked().unwrap());

    let mut reopened = reader.reopen().unwrap();
    reopened.undelete_all().unwrap();
    reopened.close().unwrap();
    assert_eq!(index.reader().unwrap().num_docs(), 11);
}
