//! In-memory cloud used by tests

use crate::{CloudClient, CloudError, Port, Subnet};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

/// A cloud that answers from a fixed set of ports and subnets
#[derive(Debug, Default)]
pub struct StaticCloud {
    ports: RwLock<HashMap<String, Port>>,
    subnets: RwLock<HashMap<String, Subnet>>,
}

impl StaticCloud {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_port(self, port: Port) -> Self {
        self.insert_port(port);
        self
    }

    pub fn with_subnet(self, subnet: Subnet) -> Self {
        self.subnets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(subnet.id.clone(), subnet);
        self
    }

    pub fn insert_port(&self, port: Port) {
        self.ports
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(port.id.clone(), port);
    }

    pub fn remove_port(&self, port_id: &str) -> Option<Port> {
        self.ports
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(port_id)
    }
}

#[async_trait::async_trait]
impl CloudClient for StaticCloud {
    async fn get_port(&self, port_id: &str) -> Result<Port, CloudError> {
        self.ports
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(port_id)
            .cloned()
            .ok_or_else(|| CloudError::NotFound {
                kind: "port",
                id: port_id.to_string(),
            })
    }

    async fn get_subnet(&self, subnet_id: &str) -> Result<Subnet, CloudError> {
        self.subnets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(subnet_id)
            .cloned()
            .ok_or_else(|| CloudError::NotFound {
                kind: "subnet",
                id: subnet_id.to_string(),
            })
    }
}
