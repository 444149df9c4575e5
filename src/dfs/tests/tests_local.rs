//! LocalDfs behavior: read/write/rename/list, random-access mapping,
//! error classification.

use std::io::Read;

use tempfile::TempDir;

use crate::dfs::{Dfs, DfsError, LocalDfs, basename_of, join_path, parent_of};

fn mount(tmp: &TempDir) -> LocalDfs {
    LocalDfs::new(tmp.path()).unwrap()
}

#[test]
fn write_then_sequential_read() {
    let tmp = TempDir::new().unwrap();
    let dfs = mount(&tmp);

    let mut file = dfs.create("t/lg0/000001.sst").unwrap();
    file.append(b"hello ").unwrap();
    file.append(b"world").unwrap();
    file.sync().unwrap();
    drop(file);

    let mut reader = dfs.open_sequential("t/lg0/000001.sst").unwrap();
    let mut contents = String::new();
    reader.read_to_string(&mut contents).unwrap();
    assert_eq!(contents, "hello world");
}

#[test]
fn random_access_positioned_reads() {
    let tmp = TempDir::new().unwrap();
    let dfs = mount(&tmp);

    let mut file = dfs.create("data.bin").unwrap();
    file.append(b"0123456789").unwrap();
    file.sync().unwrap();
    drop(file);

    let random = dfs.open_random("data.bin", Some(10)).unwrap();
    assert_eq!(random.len(), 10);

    let mut buf = [0u8; 4];
    let n = random.read_at(3, &mut buf).unwrap();
    assert_eq!(n, 4);
    assert_eq!(&buf, b"3456");

    // Read past the tail is short, read at the tail is empty.
    let n = random.read_at(8, &mut buf).unwrap();
    assert_eq!(n, 2);
    assert_eq!(&buf[..2], b"89");
    assert_eq!(random.read_at(10, &mut buf).unwrap(), 0);
}

#[test]
fn random_access_size_lookup_when_unknown() {
    let tmp = TempDir::new().unwrap();
    let dfs = mount(&tmp);

    let mut file = dfs.create("sized.bin").unwrap();
    file.append(&[7u8; 123]).unwrap();
    drop(file);

    let random = dfs.open_random("sized.bin", None).unwrap();
    assert_eq!(random.len(), 123);
}

#[test]
fn empty_file_maps_to_empty_handle() {
    let tmp = TempDir::new().unwrap();
    let dfs = mount(&tmp);

    drop(dfs.create("empty.bin").unwrap());
    let random = dfs.open_random("empty.bin", None).unwrap();
    assert!(random.is_empty());
    let mut buf = [0u8; 8];
    assert_eq!(random.read_at(0, &mut buf).unwrap(), 0);
}

#[test]
fn missing_file_is_not_found() {
    let tmp = TempDir::new().unwrap();
    let dfs = mount(&tmp);

    let err = dfs.open_sequential("absent").unwrap_err();
    assert!(err.is_not_found());
    assert!(matches!(err, DfsError::NotFound(_)));

    let err = dfs.file_size("absent").unwrap_err();
    assert!(err.is_not_found());
}

#[test]
fn rename_and_list() {
    let tmp = TempDir::new().unwrap();
    let dfs = mount(&tmp);

    drop(dfs.create("dir/a").unwrap());
    drop(dfs.create("dir/b").unwrap());
    dfs.rename("dir/b", "dir/c").unwrap();

    let names = dfs.list("dir").unwrap();
    assert_eq!(names, vec!["a".to_string(), "c".to_string()]);

    dfs.delete("dir/a").unwrap();
    assert!(!dfs.exists("dir/a"));
    assert!(dfs.exists("dir/c"));
}

#[test]
fn delete_dir_is_recursive() {
    let tmp = TempDir::new().unwrap();
    let dfs = mount(&tmp);

    drop(dfs.create("tree/x/y").unwrap());
    assert!(dfs.exists("tree"));
    dfs.delete_dir("tree").unwrap();
    assert!(!dfs.exists("tree"));
}

#[test]
fn path_helpers() {
    assert_eq!(join_path(&["users", "tablet01", "lg0"]), "users/tablet01/lg0");
    assert_eq!(join_path(&["", "a", ""]), "a");
    assert_eq!(parent_of("a/b/c"), "a/b");
    assert_eq!(parent_of("a"), "");
    assert_eq!(basename_of("a/b/000001.sst"), "000001.sst");
    assert_eq!(basename_of("plain"), "plain");
}
