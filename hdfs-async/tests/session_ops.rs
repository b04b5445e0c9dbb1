mod common;

use common::{connect, connect_with, dispatcher, init_logging};
use hdfs_async::driver::memory::{MemoryCluster, MemoryDriver};
use hdfs_async::{ConnectOptions, EntryKind, Error, Session, Truncation, WriteOptions};

#[test]
fn mkdir_then_list_parent() {
    let (s, _) = connect();
    s.create_directory("/a/b").unwrap().wait().unwrap();

    let entries = s.list("/a").unwrap().wait().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].path(), "/a/b");
    assert_eq!(entries[0].kind(), EntryKind::Directory);
}

#[test]
fn created_directory_stats_as_directory() {
    let (s, _) = connect();
    s.create_directory("/made").unwrap().wait().unwrap();
    let info = s.path_info("/made").unwrap().wait().unwrap();
    assert!(info.is_directory());
    assert_eq!(info.owner(), "hdfs");
    assert_eq!(serde_json::to_value(&info).unwrap()["type"], "directory");
    assert!(s.is_directory("/made").unwrap().wait().unwrap());
    assert!(!s.is_file("/made").unwrap().wait().unwrap());
}

#[test]
fn listing_the_root_normalizes_paths() {
    let (s, cluster) = connect();
    s.create_directory("/x").unwrap().wait().unwrap();
    s.create_directory("/y").unwrap().wait().unwrap();
    let entries = s.list("/").unwrap().wait().unwrap();
    let paths: Vec<_> = entries.iter().map(|e| e.path().to_string()).collect();
    assert_eq!(paths, ["/x", "/y"]);
    // The native array is released inside the task.
    assert_eq!(cluster.live_listings(), 0);
}

#[test]
fn deleting_a_missing_path_fails_with_a_message() {
    let (s, _) = connect();
    let err = s.delete("/missing", false).unwrap().wait().unwrap_err();
    assert_eq!(err.code, libc::ENOENT);
    assert!(!err.message.is_empty());
}

#[test]
fn non_recursive_delete_keeps_children() {
    let (s, _) = connect();
    s.create_directory("/d/e").unwrap().wait().unwrap();
    let err = s.delete("/d", false).unwrap().wait().unwrap_err();
    assert_eq!(err.code, libc::ENOTEMPTY);
    s.delete("/d", true).unwrap().wait().unwrap();
    assert!(!s.exists("/d/e").unwrap().wait().unwrap());
}

#[test]
fn rename_chown_chmod_utime() {
    let (s, _) = connect();
    s.create_directory("/old").unwrap().wait().unwrap();
    s.rename("/old", "/new").unwrap().wait().unwrap();
    assert!(!s.exists("/old").unwrap().wait().unwrap());

    s.chown("/new", None, Some("ops")).unwrap().wait().unwrap();
    s.chmod("/new", 0o700).unwrap().wait().unwrap();
    s.utime("/new", Some(1_600_000_000), None).unwrap().wait().unwrap();

    let info = s.path_info("/new").unwrap().wait().unwrap();
    assert_eq!(info.owner(), "hdfs");
    assert_eq!(info.group(), "ops");
    assert_eq!(info.permissions(), 0o700);
    assert_eq!(info.last_mod(), 1_600_000_000);
    assert_ne!(info.last_access(), 1_600_000_000);
}

#[test]
fn truncate_signals_block_recovery() {
    let (s, _) = connect_with(MemoryCluster::builder().block_size(4));
    let w = s.writer("/t", WriteOptions::default()).unwrap();
    w.open().unwrap().wait().unwrap();
    w.write(bytes::Bytes::from_static(b"0123456789"))
        .unwrap()
        .wait()
        .unwrap();
    w.close().wait().unwrap();

    assert_eq!(s.truncate("/t", 8).unwrap().wait().unwrap(), Truncation::Done);
    assert_eq!(
        s.truncate("/t", 0).unwrap().wait().unwrap(),
        Truncation::Done
    );
    assert_eq!(s.path_info("/t").unwrap().wait().unwrap().size(), 0);

    let w = s.writer("/u", WriteOptions::default()).unwrap();
    w.open().unwrap().wait().unwrap();
    w.write(bytes::Bytes::from_static(b"abcdef")).unwrap().wait().unwrap();
    w.close().wait().unwrap();
    assert_eq!(
        s.truncate("/u", 3).unwrap().wait().unwrap(),
        Truncation::AwaitRecovery
    );
}

#[test]
fn sizes_and_replication() {
    let (s, _) = connect_with(MemoryCluster::builder().capacity(1 << 30).block_size(1 << 20));
    assert_eq!(s.capacity().unwrap().wait().unwrap(), 1 << 30);
    assert_eq!(s.default_block_size().unwrap().wait().unwrap(), 1 << 20);
    assert_eq!(s.used().unwrap().wait().unwrap(), 0);

    let w = s
        .writer("/r", WriteOptions::default().replication(2))
        .unwrap();
    w.open().unwrap().wait().unwrap();
    w.write(bytes::Bytes::from_static(b"xyz")).unwrap().wait().unwrap();
    w.close().wait().unwrap();
    assert_eq!(s.used().unwrap().wait().unwrap(), 3);
    assert_eq!(s.path_info("/r").unwrap().wait().unwrap().replication(), 2);

    s.set_replication("/r", 5).unwrap().wait().unwrap();
    assert_eq!(s.path_info("/r").unwrap().wait().unwrap().replication(), 5);
}

#[test]
fn relative_paths_follow_the_working_directory() {
    let (s, _) = connect();
    assert_eq!(s.working_directory().unwrap().wait().unwrap(), "/user/hdfs");
    s.create_directory("/data/in").unwrap().wait().unwrap();
    s.set_working_directory("/data").unwrap().wait().unwrap();
    let entries = s.list(".").unwrap().wait().unwrap();
    assert_eq!(entries[0].path(), "/data/in");
    assert!(s.exists("in").unwrap().wait().unwrap());
}

#[test]
fn failed_connect_exposes_no_session() {
    init_logging();
    let driver = MemoryDriver::new(MemoryCluster::builder().build());
    let options = ConnectOptions::new("nowhere").port(9000);
    match Session::connect(driver, dispatcher(), &options) {
        Err(Error::Connect { address, source }) => {
            assert_eq!(address, "nowhere:9000");
            assert_eq!(source.code, libc::ECONNREFUSED);
        }
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("connect to an unknown host succeeded"),
    }
}

#[test]
fn connection_parameters_reach_the_library() {
    init_logging();
    let cluster = MemoryCluster::builder().require_token("secret").build();
    let driver = MemoryDriver::new(cluster.clone());
    let rejected = Session::connect(driver.clone(), dispatcher(), &ConnectOptions::default());
    assert!(matches!(rejected, Err(Error::Connect { .. })));

    let options = ConnectOptions::default().user("bob").auth_token("secret");
    let s = Session::connect(driver, dispatcher(), &options).unwrap();
    s.create_directory("/owned").unwrap().wait().unwrap();
    assert_eq!(s.path_info("/owned").unwrap().wait().unwrap().owner(), "bob");
    assert_eq!(cluster.connections(), 1);
    s.close().wait().unwrap();
    assert_eq!(cluster.connections(), 0);
}
