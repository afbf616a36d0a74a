use std::sync::Arc;

use tessera::config::IndexConfig;
use tessera::document::Document;
use tessera::error::TesseraError;
use tessera::index::Index;
use tessera::index::norms::{decode_norm, encode_norm};
use tessera::storage::Storage;
use tessera::storage::memory::MemoryStorage;

/// One segment `_0` of four documents; `id` is field 0, `body` field 1.
fn build_index() -> (Arc<MemoryStorage>, Index) {
    let storage = Arc::new(MemoryStorage::new_default());
    let index = Index::open(storage.clone(), IndexConfig::default()).unwrap();
    let mut writer = index.writer().unwrap();
    for (i, body) in ["a", "a b", "a b c", "a b c d"].iter().enumerate() {
        writer
            .add_document(
                Document::builder()
                    .add_terms("id", [i.to_string()])
                    .add_text("body", body)
                    .build(),
            )
            .unwrap();
    }
    writer.close().unwrap();
    (storage, index)
}

#[test]
fn test_base_norms_follow_field_length() {
    let (_, index) = build_index();
    let reader = index.reader().unwrap();
    let norms = reader.norms("body").unwrap().unwrap();

    assert_eq!(norms.len(), 4);
    assert_eq!(norms[0], encode_norm(1.0));
    // Longer fields never score higher.
    assert!(norms.windows(2).all(|pair| decode_norm(pair[0]) >= decode_norm(pair[1])));
}

#[test]
fn test_old_generation_survives_while_referenced() {
    let (storage, index) = build_index();

    let mut first = index.reader().unwrap();
    first.set_norm(0, "body", 10).unwrap();
    first.commit().unwrap();
    assert!(storage.file_exists("_0_1.s1"));

    let pinned = index.reader().unwrap();
    assert_eq!(pinned.norm(0, "body").unwrap(), 10);
    let base = pinned.norm(1, "body").unwrap();

    first.set_norm(1, "body", 20).unwrap();
    first.commit().unwrap();
    assert!(storage.file_exists("_0_2.s1"));
    // Still referenced by `pinned`.
    assert!(storage.file_exists("_0_1.s1"));
    assert_eq!(pinned.norm(1, "body").unwrap(), base);
    assert!(!pinned.is_current().unwrap());

    first.close().unwrap();
    assert!(storage.file_exists("_0_1.s1"));

    let mut pinned = pinned;
    pinned.close().unwrap();
    assert!(!storage.file_exists("_0_1.s1"));
    assert!(storage.file_exists("_0_2.s1"));

    let fresh = index.reader().unwrap();
    assert_eq!(fresh.norm(0, "body").unwrap(), 10);
    assert_eq!(fresh.norm(1, "body").unwrap(), 20);
    assert_eq!(fresh.descriptor().segments[0].norm_generations.get(&1), Some(&2));
}

#[test]
fn test_untouched_fields_get_no_generation() {
    let (storage, index) = build_index();
    let mut reader = index.reader().unwrap();
    reader.set_norm_f32(2, "body", 0.25).unwrap();
    reader.close().unwrap();

    assert!(storage.file_exists("_0_1.s1"));
    assert!(!storage.file_exists("_0_1.s0"));
    assert!(!storage.file_exists("_0_1.del"));

    let fresh = index.reader().unwrap();
    assert_eq!(fresh.norm(2, "body").unwrap(), encode_norm(0.25));
    assert!(fresh.descriptor().segments[0].norm_generations.get(&0).is_none());
}

#[test]
fn test_unknown_field_is_rejected_without_locking() {
    let (_, index) = build_index();
    let mut reader = index.reader().unwrap();
    assert!(matches!(
        reader.set_norm(0, "title", 1),
        Err(TesseraError::InvalidArgument(_))
    ));
    assert!(!reader.has_pending_changes());
    assert!(!index.is_locked().unwrap());
}

#[test]
fn test_norms_survive_merge() {
    let (_, index) = build_index();
    let mut reader = index.reader().unwrap();
    reader.set_norm(3, "body", 77).unwrap();
    reader.delete_document(0).unwrap();
    reader.close().unwrap();

    let mut writer = index.writer().unwrap();
    writer.optimize().unwrap();
    writer.close().unwrap();

    let fresh = index.reader().unwrap();
    assert_eq!(fresh.max_doc(), 3);
    assert!(!fresh.has_deletions());
    // Former doc 3 is now doc 2.
    assert_eq!(fresh.norm(2, "body").unwrap(), 77);
    assert!(fresh.descriptor().segments[0].norm_generations.is_empty());
    assert!(index.unreferenced_files().unwrap().is_empty());
}
