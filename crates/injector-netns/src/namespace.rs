use crate::NetnsError;
use injector_cloud::{CloudClient, Port};
use std::fs::File;
use std::marker::PhantomData;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, error};

/// Identity of the kernel object behind a namespace handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NamespaceId {
    pub dev: u64,
    pub ino: u64,
}

/// An open handle to the isolated network context of one cloud network
///
/// The handle tracks whether the calling thread is currently bound to it. A
/// handle can be entered once at a time, and must be left before it is closed.
#[derive(Debug)]
pub struct NetworkNamespace {
    network_id: String,
    name: String,
    id: NamespaceId,
    pub(crate) handle: Option<File>,
    pub(crate) origin: Option<File>,
    entered: bool,
}

impl NetworkNamespace {
    pub fn new(network_id: &str, id: NamespaceId, handle: Option<File>) -> Self {
        Self {
            network_id: network_id.to_string(),
            name: injector_proto::namespace_name(network_id),
            id,
            handle,
            origin: None,
            entered: false,
        }
    }

    pub fn network_id(&self) -> &str {
        &self.network_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> NamespaceId {
        self.id
    }

    pub fn is_entered(&self) -> bool {
        self.entered
    }

    pub(crate) fn check_enter(&self) -> Result<(), NetnsError> {
        if self.entered {
            return Err(NetnsError::AlreadyEntered(self.name.clone()));
        }
        Ok(())
    }

    pub(crate) fn check_leave(&self) -> Result<(), NetnsError> {
        if !self.entered {
            return Err(NetnsError::NotEntered(self.name.clone()));
        }
        Ok(())
    }

    pub(crate) fn set_entered(&mut self, entered: bool) {
        self.entered = entered;
    }
}

/// Creates, enters and destroys per-network isolated contexts
#[async_trait::async_trait]
pub trait NamespaceManager: Send + Sync {
    /// Return the context for the port's network, creating and wiring it if absent
    ///
    /// An existing context is re-attached without being rewired.
    async fn ensure(
        &self,
        port: &Port,
        cloud: &dyn CloudClient,
    ) -> Result<NetworkNamespace, NetnsError>;

    /// Bind the calling thread to the context
    fn enable(&self, namespace: &mut NetworkNamespace) -> Result<(), NetnsError>;

    /// Return the calling thread to the context it was in before `enable`
    fn disable(&self, namespace: &mut NetworkNamespace) -> Result<(), NetnsError>;

    /// Release the handle without tearing the context down
    fn close(&self, namespace: NetworkNamespace) -> Result<(), NetnsError>;

    /// Destroy the context of a network
    async fn delete_by_id(&self, network_id: &str) -> Result<(), NetnsError>;
}

/// Scoped binding of the current thread to a namespace
///
/// Dropping the binding always returns the thread to its original context.
/// The binding is `!Send` so it cannot leave the thread it was created on.
pub struct NamespaceBinding<'a> {
    manager: &'a dyn NamespaceManager,
    namespace: &'a mut NetworkNamespace,
    released: bool,
    _thread: PhantomData<*const ()>,
}

impl<'a> NamespaceBinding<'a> {
    pub fn acquire(
        manager: &'a dyn NamespaceManager,
        namespace: &'a mut NetworkNamespace,
    ) -> Result<Self, NetnsError> {
        manager.enable(namespace)?;
        Ok(Self {
            manager,
            namespace,
            released: false,
            _thread: PhantomData,
        })
    }

    /// Leave the namespace, reporting a failure to switch back
    pub fn release(mut self) -> Result<(), NetnsError> {
        self.released = true;
        self.manager.disable(self.namespace)
    }
}

impl Drop for NamespaceBinding<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.manager.disable(self.namespace) {
            error!(
                namespace = %self.namespace.name(),
                "Failed to leave namespace: {}", e
            );
        }
    }
}

/// Run `work` on a fresh OS thread bound to `namespace`
///
/// The thread exits once `work` returns, so no other task is ever scheduled on
/// a thread that is still inside the namespace. Async work can be driven from
/// inside `work` with [`tokio::runtime::Handle::block_on`]. The namespace
/// handle is handed back together with the result.
pub async fn run_pinned<T, F>(
    manager: Arc<dyn NamespaceManager>,
    mut namespace: NetworkNamespace,
    work: F,
) -> Result<(NetworkNamespace, T), NetnsError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = tokio::sync::oneshot::channel();
    let name = namespace.name().to_string();

    std::thread::Builder::new()
        .name(format!("netns-{}", short_id(namespace.network_id())))
        .spawn(move || {
            let result = (|| -> Result<T, NetnsError> {
                let binding = NamespaceBinding::acquire(manager.as_ref(), &mut namespace)?;
                let output = work();
                binding.release()?;
                Ok(output)
            })();
            let _ = tx.send(result.map(|output| (namespace, output)));
        })?;

    debug!(namespace = %name, "Dispatched work to pinned thread");

    rx.await
        .map_err(|_| NetnsError::Pinned(format!("worker for {} exited without a result", name)))?
}

/// Host-side and namespace-side interface names for a port
///
/// Interface names are limited to 15 bytes, so only the first 11 characters of
/// the port ID are used.
pub fn interface_names(port_id: &str) -> (String, String) {
    let prefix = short_id(port_id);
    (format!("tap{}", prefix), format!("ns-{}", prefix))
}

/// Resolve a port's fixed IPs to (address, prefix length) via their subnets
pub async fn resolve_addresses(
    port: &Port,
    cloud: &dyn CloudClient,
) -> Result<Vec<(IpAddr, u8)>, NetnsError> {
    let mut addresses = Vec::with_capacity(port.fixed_ips.len());
    for fixed_ip in &port.fixed_ips {
        let subnet = cloud.get_subnet(&fixed_ip.subnet_id).await?;
        addresses.push((fixed_ip.ip_address, subnet.prefix_len()?));
    }
    Ok(addresses)
}

fn short_id(id: &str) -> &str {
    match id.char_indices().nth(11) {
        Some((end, _)) => &id[..end],
        None => id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RecordingNamespaces;
    use injector_cloud::{FixedIp, StaticCloud, Subnet};

    fn port() -> Port {
        Port {
            id: "d5b2a3c4-1111-2222-3333-444455556666".to_string(),
            network_id: "net-a".to_string(),
            mac_address: "fa:16:3e:aa:bb:cc".to_string(),
            fixed_ips: vec![FixedIp {
                subnet_id: "sub-a".to_string(),
                ip_address: "10.0.0.5".parse().unwrap(),
            }],
        }
    }

    fn cloud() -> StaticCloud {
        StaticCloud::new().with_port(port()).with_subnet(Subnet {
            id: "sub-a".to_string(),
            cidr: "10.0.0.0/24".to_string(),
        })
    }

    #[test]
    fn test_interface_names() {
        let (host, peer) = interface_names("d5b2a3c4-1111-2222-3333-444455556666");
        assert_eq!(host, "tapd5b2a3c4-11");
        assert_eq!(peer, "ns-d5b2a3c4-11");
        assert!(host.len() <= 15);

        let (host, _) = interface_names("abc");
        assert_eq!(host, "tapabc");
    }

    #[tokio::test]
    async fn test_resolve_addresses() {
        let addresses = resolve_addresses(&port(), &cloud()).await.unwrap();
        assert_eq!(addresses, vec![("10.0.0.5".parse().unwrap(), 24)]);
    }

    #[tokio::test]
    async fn test_resolve_addresses_unknown_subnet() {
        let err = resolve_addresses(&port(), &StaticCloud::new())
            .await
            .unwrap_err();
        assert!(matches!(err, NetnsError::Cloud(ref e) if e.is_not_found()));
    }

    #[tokio::test]
    async fn test_binding_leaves_on_drop() {
        let manager = RecordingNamespaces::new();
        let mut namespace = manager.ensure(&port(), &cloud()).await.unwrap();

        {
            let _binding = NamespaceBinding::acquire(&manager, &mut namespace).unwrap();
        }
        assert!(!namespace.is_entered());

        // Entering twice without leaving is rejected
        manager.enable(&mut namespace).unwrap();
        assert!(matches!(
            manager.enable(&mut namespace),
            Err(NetnsError::AlreadyEntered(_))
        ));
        manager.disable(&mut namespace).unwrap();
        assert!(matches!(
            manager.disable(&mut namespace),
            Err(NetnsError::NotEntered(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_run_pinned_returns_namespace_and_output() {
        let manager = Arc::new(RecordingNamespaces::new());
        let namespace = manager.ensure(&port(), &cloud()).await.unwrap();
        let caller = std::thread::current().id();

        let (namespace, worker) = run_pinned(manager.clone(), namespace, move || {
            std::thread::current().id()
        })
        .await
        .unwrap();

        assert_ne!(worker, caller);
        assert!(!namespace.is_entered());
        assert_eq!(manager.entered_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_run_pinned_leaves_namespace_on_panic() {
        let manager = Arc::new(RecordingNamespaces::new());
        let namespace = manager.ensure(&port(), &cloud()).await.unwrap();

        let result = run_pinned::<(), _>(manager.clone(), namespace, || panic!("work failed")).await;

        assert!(matches!(result, Err(NetnsError::Pinned(_))));
        assert_eq!(manager.entered_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_run_pinned_drives_async_work() {
        let manager = Arc::new(RecordingNamespaces::new());
        let namespace = manager.ensure(&port(), &cloud()).await.unwrap();
        let runtime = tokio::runtime::Handle::current();

        let (_, value) = run_pinned(manager, namespace, move || {
            runtime.block_on(async { 40 + 2 })
        })
        .await
        .unwrap();

        assert_eq!(value, 42);
    }
}
