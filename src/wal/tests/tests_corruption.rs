//! Torn tails and mid-file damage.

use crate::dfs::Dfs;
use crate::wal::tests::helpers::*;
use crate::wal::{WalError, WalReader};

#[test]
fn torn_tail_drops_last_record_only() {
    let (tmp, dfs) = mount();
    write_records(&dfs, &[b"alpha", b"beta", b"gamma"]);

    // Chop two bytes off the final fragment's payload.
    let len = dfs.file_size(LOG).unwrap();
    truncate_log(&tmp, len - 2);

    let mut reader = WalReader::new(dfs.open_sequential(LOG).unwrap());
    let records = reader.read_all().unwrap();
    assert_eq!(records, vec![b"alpha".to_vec(), b"beta".to_vec()]);
    assert!(reader.tail_truncated());
}

#[test]
fn torn_tail_inside_header_drops_cleanly() {
    let (tmp, dfs) = mount();
    write_records(&dfs, &[b"alpha", b"beta"]);

    let len = dfs.file_size(LOG).unwrap();
    // Leave 6 of the final fragment's 7 header bytes (crc + length, which
    // is nonzero for "beta").
    let second_start = len - (7 + 4) as u64;
    truncate_log(&tmp, second_start + 6);

    let mut reader = WalReader::new(dfs.open_sequential(LOG).unwrap());
    let records = reader.read_all().unwrap();
    assert_eq!(records, vec![b"alpha".to_vec()]);
    assert!(reader.tail_truncated());
}

#[test]
fn flipped_payload_byte_at_tail_is_torn() {
    let (tmp, dfs) = mount();
    write_records(&dfs, &[b"alpha", b"beta"]);

    let len = dfs.file_size(LOG).unwrap();
    corrupt_byte(&tmp, len - 1);

    let mut reader = WalReader::new(dfs.open_sequential(LOG).unwrap());
    let records = reader.read_all().unwrap();
    assert_eq!(records, vec![b"alpha".to_vec()]);
    assert!(reader.tail_truncated());
}

#[test]
fn mid_file_damage_errors_by_default() {
    let (tmp, dfs) = mount();
    // Big first record so damage sits well before the tail block.
    let big = vec![9u8; crate::wal::BLOCK_SIZE * 3];
    write_records(&dfs, &[&big, b"tail"]);

    corrupt_byte(&tmp, 100);

    let mut reader = WalReader::new(dfs.open_sequential(LOG).unwrap());
    let err = reader.read_all().unwrap_err();
    assert!(matches!(err, WalError::Corruption { .. }));
}

#[test]
fn mid_file_damage_skipped_when_tolerated() {
    let (tmp, dfs) = mount();
    let big = vec![9u8; crate::wal::BLOCK_SIZE * 3];
    write_records(&dfs, &[&big, b"tail"]);

    corrupt_byte(&tmp, 100);

    let mut reader = WalReader::with_tolerance(dfs.open_sequential(LOG).unwrap(), true);
    let records = reader.read_all().unwrap();
    // The fragmented big record is lost with its damaged block; the intact
    // trailing record survives.
    assert_eq!(records, vec![b"tail".to_vec()]);
}
