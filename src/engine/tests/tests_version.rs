//! Version-edit records and engine-file naming.

use std::sync::atomic::AtomicI64;

use crate::engine::key::{InternalKey, ValueKind};
use crate::engine::version::{
    EngineFile, FileMeta, VersionEdit, log_file_path, manifest_file_path, parse_engine_file,
    table_file_path,
};

fn sample_meta(number: u64) -> FileMeta {
    FileMeta {
        number,
        dir: "t/tablet1/lg0".into(),
        size: 4096,
        entries: 17,
        smallest: InternalKey::new(b"aaa".to_vec(), 12, ValueKind::Value),
        largest: InternalKey::new(b"zzz".to_vec(), 3, ValueKind::Deletion),
        delete_tag_percent: 12,
        ttl_percentile_expiry: 0,
        allowed_seeks: AtomicI64::new(100),
    }
}

#[test]
fn edit_roundtrip_preserves_every_field() {
    let mut edit = VersionEdit {
        comparator: Some("tabletdb.InternalKeyComparator".into()),
        log_number: Some(9),
        next_file_number: Some(42),
        last_sequence: Some(777),
        ..Default::default()
    };
    edit.compact_pointers
        .push((3, InternalKey::new(b"ptr".to_vec(), 5, ValueKind::Value)));
    edit.deleted_files.push((2, 7, "t/tablet1/lg0".into()));
    edit.added_files.push((1, sample_meta(8)));

    let bytes = edit.encode().unwrap();
    let decoded = VersionEdit::decode(&bytes).unwrap();

    assert_eq!(decoded.comparator, edit.comparator);
    assert_eq!(decoded.log_number, Some(9));
    assert_eq!(decoded.next_file_number, Some(42));
    assert_eq!(decoded.last_sequence, Some(777));
    assert_eq!(decoded.compact_pointers.len(), 1);
    assert_eq!(decoded.deleted_files, edit.deleted_files);
    assert_eq!(decoded.added_files.len(), 1);

    let meta = &decoded.added_files[0].1;
    assert_eq!(meta.number, 8);
    assert_eq!(meta.dir, "t/tablet1/lg0");
    assert_eq!(meta.size, 4096);
    assert_eq!(meta.entries, 17);
    assert_eq!(meta.smallest.user_key, b"aaa");
    assert_eq!(meta.largest.kind, ValueKind::Deletion);
    assert_eq!(meta.delete_tag_percent, 12);
}

#[test]
fn unknown_high_tag_is_skipped() {
    use crate::encoding::Encode;

    let edit = VersionEdit {
        log_number: Some(5),
        ..Default::default()
    };
    let mut bytes = edit.encode().unwrap();

    // A future field: tag 250 with a framed payload.
    250u32.encode_to(&mut bytes).unwrap();
    b"future-field".to_vec().encode_to(&mut bytes).unwrap();

    let decoded = VersionEdit::decode(&bytes).unwrap();
    assert_eq!(decoded.log_number, Some(5));
}

#[test]
fn unknown_low_tag_is_corruption() {
    use crate::encoding::Encode;

    let mut bytes = Vec::new();
    99u32.encode_to(&mut bytes).unwrap();
    let result = VersionEdit::decode(&bytes);
    assert!(result.is_err());
}

#[test]
fn file_names_parse_back() {
    assert_eq!(
        parse_engine_file("00000007.log"),
        EngineFile::Log(7)
    );
    assert_eq!(
        parse_engine_file("00000031.sst"),
        EngineFile::Table(31)
    );
    assert_eq!(
        parse_engine_file("MANIFEST-000004"),
        EngineFile::Manifest(4)
    );
    assert_eq!(parse_engine_file("CURRENT"), EngineFile::Current);
    assert_eq!(
        parse_engine_file("__init_load_filelock"),
        EngineFile::InitLock
    );
    assert_eq!(parse_engine_file("stray.txt"), EngineFile::Unknown);

    assert_eq!(log_file_path("d", 7), "d/00000007.log");
    assert_eq!(table_file_path("d", 31), "d/00000031.sst");
    assert_eq!(manifest_file_path("d", 4), "d/MANIFEST-000004");
}

#[test]
fn internal_key_ordering_is_key_asc_then_seq_desc() {
    let a1 = InternalKey::new(b"a".to_vec(), 9, ValueKind::Value);
    let a2 = InternalKey::new(b"a".to_vec(), 3, ValueKind::Value);
    let b1 = InternalKey::new(b"b".to_vec(), 100, ValueKind::Value);

    assert!(a1 < a2, "newer sequence sorts first for one key");
    assert!(a2 < b1, "key order dominates sequence order");

    // At equal (key, sequence), a value sorts before a tombstone.
    let val = InternalKey::new(b"a".to_vec(), 5, ValueKind::Value);
    let del = InternalKey::new(b"a".to_vec(), 5, ValueKind::Deletion);
    assert!(val < del);
}

#[test]
fn internal_key_encoding_roundtrip() {
    let key = InternalKey::new(b"row\x00cf\x01q".to_vec(), 123_456, ValueKind::Deletion);
    let bytes = key.encode();
    let decoded = InternalKey::decode(&bytes).unwrap();
    assert_eq!(decoded, key);
}
