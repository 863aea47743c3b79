//! In-memory namespace manager used by tests
//!
//! Tracks which networks have a context and records every call, without
//! touching the kernel.

use crate::namespace::resolve_addresses;
use crate::{NamespaceId, NamespaceManager, NetnsError, NetworkNamespace};
use injector_cloud::{CloudClient, Port};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// A call observed by [`RecordingNamespaces`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamespaceCall {
    Ensure(String),
    Enable(String),
    Disable(String),
    Close(String),
    Delete(String),
}

#[derive(Debug, Default)]
struct State {
    existing: HashMap<String, NamespaceId>,
    calls: Vec<NamespaceCall>,
    failing: HashSet<String>,
    next_ino: u64,
    entered: usize,
}

#[derive(Debug, Default)]
pub struct RecordingNamespaces {
    state: Mutex<State>,
}

impl RecordingNamespaces {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `ensure` fail for a network
    pub fn fail_ensure(&self, network_id: &str) {
        self.lock().failing.insert(network_id.to_string());
    }

    pub fn exists(&self, network_id: &str) -> bool {
        self.lock().existing.contains_key(network_id)
    }

    pub fn calls(&self) -> Vec<NamespaceCall> {
        self.lock().calls.clone()
    }

    /// Number of bindings currently held
    pub fn entered_count(&self) -> usize {
        self.lock().entered
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait::async_trait]
impl NamespaceManager for RecordingNamespaces {
    async fn ensure(
        &self,
        port: &Port,
        cloud: &dyn CloudClient,
    ) -> Result<NetworkNamespace, NetnsError> {
        let network_id = port.network_id.as_str();
        self.lock()
            .calls
            .push(NamespaceCall::Ensure(network_id.to_string()));

        if self.lock().failing.contains(network_id) {
            return Err(NetnsError::Netlink(format!(
                "refusing to create namespace for {}",
                network_id
            )));
        }

        if let Some(id) = self.lock().existing.get(network_id).copied() {
            return Ok(NetworkNamespace::new(network_id, id, None));
        }

        resolve_addresses(port, cloud).await?;

        let mut state = self.lock();
        state.next_ino += 1;
        let id = NamespaceId {
            dev: 0,
            ino: state.next_ino,
        };
        state.existing.insert(network_id.to_string(), id);
        Ok(NetworkNamespace::new(network_id, id, None))
    }

    fn enable(&self, namespace: &mut NetworkNamespace) -> Result<(), NetnsError> {
        namespace.check_enter()?;
        let mut state = self.lock();
        if state.existing.get(namespace.network_id()) != Some(&namespace.id()) {
            return Err(NetnsError::Inconsistent {
                name: namespace.name().to_string(),
            });
        }
        state
            .calls
            .push(NamespaceCall::Enable(namespace.network_id().to_string()));
        state.entered += 1;
        namespace.set_entered(true);
        Ok(())
    }

    fn disable(&self, namespace: &mut NetworkNamespace) -> Result<(), NetnsError> {
        namespace.check_leave()?;
        let mut state = self.lock();
        state
            .calls
            .push(NamespaceCall::Disable(namespace.network_id().to_string()));
        state.entered = state.entered.saturating_sub(1);
        namespace.set_entered(false);
        Ok(())
    }

    fn close(&self, namespace: NetworkNamespace) -> Result<(), NetnsError> {
        if namespace.is_entered() {
            return Err(NetnsError::StillEntered(namespace.name().to_string()));
        }
        self.lock()
            .calls
            .push(NamespaceCall::Close(namespace.network_id().to_string()));
        Ok(())
    }

    async fn delete_by_id(&self, network_id: &str) -> Result<(), NetnsError> {
        let mut state = self.lock();
        state
            .calls
            .push(NamespaceCall::Delete(network_id.to_string()));
        match state.existing.remove(network_id) {
            Some(_) => Ok(()),
            None => Err(NetnsError::NotFound(injector_proto::namespace_name(
                network_id,
            ))),
        }
    }
}
