mod common;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use common::{connect, eventually};
use hdfs_async::{ErrorOutcome, Outcome};

#[test]
fn native_calls_run_off_the_caller_thread() {
    let (s, cluster) = connect();
    s.exists("/").unwrap().wait().unwrap();
    assert_ne!(cluster.last_thread(), Some(thread::current().id()));
}

#[test]
fn concurrent_failures_keep_their_own_errors() {
    let (s, cluster) = connect();
    cluster.set_latency(Duration::from_millis(20));
    let tasks: Vec<_> = (0..16)
        .map(|i| {
            let path = format!("/missing-{i}");
            (path.clone(), s.delete(&path, false).unwrap())
        })
        .collect();
    for (path, task) in tasks {
        let err = task.wait().unwrap_err();
        assert_eq!(err.code, libc::ENOENT);
        assert!(err.message.contains(&path), "{} lacks {path}", err.message);
    }
}

#[test]
fn callbacks_run_once_on_the_draining_thread() {
    let (s, _) = connect();
    let dispatcher = s.dispatcher().clone();
    let seen: Arc<Mutex<Vec<(String, Outcome<bool>)>>> = Arc::default();
    let me = thread::current().id();

    for path in ["/", "/nope", "/user"] {
        let seen = seen.clone();
        s.exists(path).unwrap().on_complete(move |outcome| {
            assert_eq!(thread::current().id(), me);
            seen.lock().unwrap().push((path.to_string(), outcome));
        });
    }
    let failing = seen.clone();
    s.delete("/nope", false).unwrap().on_complete(move |outcome| {
        failing
            .lock()
            .unwrap()
            .push(("delete".into(), outcome.map(|()| true)));
    });

    assert_eq!(dispatcher.run_until_idle(), 4);
    assert_eq!(dispatcher.poll_completions(), 0);

    let seen = seen.lock().unwrap();
    let names: HashSet<_> = seen.iter().map(|(p, _)| p.as_str()).collect();
    assert_eq!(names.len(), 4);
    for (name, outcome) in seen.iter() {
        match name.as_str() {
            "/" => assert_eq!(outcome, &Ok(true)),
            "/nope" | "/user" => assert_eq!(outcome, &Ok(false)),
            _ => assert!(matches!(outcome, Err(ErrorOutcome { code, .. }) if *code == libc::ENOENT)),
        }
    }
}

#[test]
fn injected_fault_is_delivered_not_thrown() {
    let (s, cluster) = connect();
    cluster.fail_next("capacity", libc::EIO);
    let err = s.capacity().unwrap().wait().unwrap_err();
    assert_eq!(err.code, libc::EIO);
    assert!(s.capacity().unwrap().wait().unwrap() > 0);
}

#[test]
fn submission_returns_while_the_call_is_parked() {
    let (s, cluster) = connect();
    cluster.hold("used");
    let task = s.used().unwrap();
    thread::sleep(Duration::from_millis(50));
    assert!(!task.is_finished());
    assert_eq!(s.dispatcher().in_flight(), 1);
    cluster.release("used");
    assert_eq!(task.wait().unwrap(), 0);
}

#[test]
fn dropping_the_session_disconnects() {
    let (s, cluster) = connect();
    assert_eq!(cluster.connections(), 1);
    drop(s);
    assert!(eventually(|| cluster.connections() == 0));
}

#[test]
fn session_close_waits_for_open_files() {
    let (s, cluster) = connect();
    let w = s
        .writer("/held", hdfs_async::WriteOptions::default())
        .unwrap();
    w.open().unwrap().wait().unwrap();
    s.close().wait().unwrap();
    assert_eq!(cluster.connections(), 1);

    w.close().wait().unwrap();
    assert_eq!(cluster.open_files(), 0);
    cluster.set_latency(Duration::from_millis(300));
    drop(w);
    // The writer held the last reference; its disconnect runs on a worker.
    assert_eq!(cluster.connections(), 1);
    assert!(eventually(|| cluster.connections() == 0));
    assert_ne!(cluster.last_thread(), Some(thread::current().id()));
}
