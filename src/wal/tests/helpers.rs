use tempfile::TempDir;

use crate::dfs::{Dfs, LocalDfs};
use crate::wal::{WalReader, WalWriter};

pub const LOG: &str = "000001.log";

pub fn write_records(dfs: &LocalDfs, records: &[&[u8]]) {
    let mut writer = WalWriter::new(dfs.create(LOG).unwrap());
    for record in records {
        writer.add_record(record).unwrap();
    }
    writer.sync().unwrap();
}

pub fn replay(dfs: &LocalDfs) -> (Vec<Vec<u8>>, bool) {
    let mut reader = WalReader::new(dfs.open_sequential(LOG).unwrap());
    let records = reader.read_all().unwrap();
    (records, reader.tail_truncated())
}

pub fn mount() -> (TempDir, LocalDfs) {
    let tmp = TempDir::new().unwrap();
    let dfs = LocalDfs::new(tmp.path()).unwrap();
    (tmp, dfs)
}

/// Truncate the on-disk log to `len` bytes, simulating a crash mid-append.
pub fn truncate_log(tmp: &TempDir, len: u64) {
    let path = tmp.path().join(LOG);
    let file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
    file.set_len(len).unwrap();
}

/// Flip one byte of the on-disk log.
pub fn corrupt_byte(tmp: &TempDir, offset: u64) {
    use std::io::{Read, Seek, SeekFrom, Write};
    let path = tmp.path().join(LOG);
    let mut file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .unwrap();
    file.seek(SeekFrom::Start(offset)).unwrap();
    let mut byte = [0u8; 1];
    file.read_exact(&mut byte).unwrap();
    byte[0] ^= 0xFF;
    file.seek(SeekFrom::Start(offset)).unwrap();
    file.write_all(&byte).unwrap();
}
