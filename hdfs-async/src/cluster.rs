use std::sync::Arc;

use crate::capture::check_handle;
use crate::dispatch::{Dispatcher, Task};
use crate::driver::{Driver, to_cstring};
use crate::error::Result;
use crate::meta::NamenodeInfo;

/// HA topology lookups. Needs no connection; the library answers from its
/// client configuration.
pub struct ClusterInfo<D: Driver> {
    driver: Arc<D>,
    dispatcher: Dispatcher,
}

impl<D: Driver> ClusterInfo<D> {
    pub fn new(driver: D, dispatcher: Dispatcher) -> Self {
        Self {
            driver: Arc::new(driver),
            dispatcher,
        }
    }

    /// Namenodes of the HA nameservice `service`, in configuration order.
    pub fn namenodes(&self, service: &str) -> Result<Task<Vec<NamenodeInfo>>> {
        let service = to_cstring("service", service)?;
        let driver = self.driver.clone();
        Ok(self.dispatcher.run("namenodes", move || {
            let nodes = check_handle(&*driver, driver.ha_namenodes(&service))?;
            Ok(nodes.iter().map(NamenodeInfo::from_raw).collect())
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatchConfig;
    use crate::driver::memory::{MemoryCluster, MemoryDriver};

    fn cluster_info() -> ClusterInfo<MemoryDriver> {
        let cluster = MemoryCluster::builder()
            .ha_service("ns1", &[("nn1:8020", "nn1:50070"), ("nn2:8020", "nn2:50070")])
            .build();
        let dispatcher = Dispatcher::new(&DispatchConfig::default()).unwrap();
        ClusterInfo::new(MemoryDriver::new(cluster), dispatcher)
    }

    #[test]
    fn lists_namenodes_in_order() {
        let info = cluster_info();
        let nodes = info.namenodes("ns1").unwrap().wait().unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].rpc_address, "nn1:8020");
        assert_eq!(nodes[1].http_address, "nn2:50070");
    }

    #[test]
    fn unknown_service_is_an_error_outcome() {
        let info = cluster_info();
        let err = info.namenodes("ns9").unwrap().wait().unwrap_err();
        assert!(err.message.contains("ns9"));
    }
}
