#![allow(dead_code)]

use std::sync::{Arc, Once};

use hdfs_async::driver::memory::{MemoryCluster, MemoryClusterBuilder, MemoryDriver};
use hdfs_async::{ConnectOptions, DispatchConfig, Dispatcher, Session};

pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
            .format_timestamp_secs()
            .target(env_logger::Target::Stdout)
            .is_test(true)
            .init();
    });
}

pub fn dispatcher() -> Dispatcher {
    Dispatcher::new(&DispatchConfig::default()).unwrap()
}

pub fn connect_with(builder: MemoryClusterBuilder) -> (Session<MemoryDriver>, Arc<MemoryCluster>) {
    init_logging();
    let cluster = builder.build();
    let session = Session::connect(
        MemoryDriver::new(cluster.clone()),
        dispatcher(),
        &ConnectOptions::default(),
    )
    .unwrap();
    (session, cluster)
}

pub fn connect() -> (Session<MemoryDriver>, Arc<MemoryCluster>) {
    connect_with(MemoryCluster::builder())
}

/// Poll `done` for up to a second; background releases finish on workers.
pub fn eventually(done: impl Fn() -> bool) -> bool {
    for _ in 0..100 {
        if done() {
            return true;
        }
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
    done()
}
