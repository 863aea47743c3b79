//! Kernel network namespaces wired with a veth pair over rtnetlink

use crate::namespace::{interface_names, resolve_addresses, NamespaceBinding};
use crate::{NamespaceId, NamespaceManager, NetnsError, NetworkNamespace, NETNS_RUN_DIR};
use futures_util::stream::TryStreamExt;
use injector_cloud::{CloudClient, Port};
use nix::sched::{setns, CloneFlags};
use rtnetlink::{new_connection, Handle, LinkUnspec, LinkVeth};
use std::collections::HashMap;
use std::fs::File;
use std::net::IpAddr;
use std::os::fd::AsRawFd;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Thread-local network namespace of the calling thread
const THREAD_NETNS: &str = "/proc/thread-self/ns/net";

/// Namespace manager backed by named kernel network namespaces
#[derive(Debug, Default)]
pub struct LinuxNamespaces {
    known: Mutex<HashMap<String, NamespaceId>>,
}

impl LinuxNamespaces {
    pub fn new() -> Self {
        Self::default()
    }

    fn path_for(network_id: &str) -> PathBuf {
        Path::new(NETNS_RUN_DIR).join(injector_proto::namespace_name(network_id))
    }

    /// Open the namespace mount and check it against the identity seen before
    fn attach(&self, network_id: &str, path: &Path) -> Result<NetworkNamespace, NetnsError> {
        let file = File::open(path)?;
        let meta = file.metadata()?;
        let id = NamespaceId {
            dev: meta.dev(),
            ino: meta.ino(),
        };

        let mut known = self.known.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(previous) = known.get(network_id) {
            if *previous != id {
                return Err(NetnsError::Inconsistent {
                    name: injector_proto::namespace_name(network_id),
                });
            }
        }
        known.insert(network_id.to_string(), id);

        Ok(NetworkNamespace::new(network_id, id, Some(file)))
    }

    fn forget(&self, network_id: &str) {
        self.known
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(network_id);
    }

    /// Open a netlink connection whose socket lives inside `namespace`
    fn netlink_in(&self, namespace: &mut NetworkNamespace) -> Result<Handle, NetnsError> {
        let runtime = tokio::runtime::Handle::current();

        let (connection, handle) = std::thread::scope(|scope| {
            scope
                .spawn(|| {
                    let binding = NamespaceBinding::acquire(self, namespace)?;
                    let _runtime = runtime.enter();
                    let (connection, handle, _) = new_connection()?;
                    binding.release()?;
                    Ok::<_, NetnsError>((connection, handle))
                })
                .join()
                .map_err(|_| NetnsError::Pinned("netlink setup thread panicked".to_string()))?
        })?;

        tokio::spawn(connection);
        Ok(handle)
    }

    async fn wire(
        &self,
        namespace: &mut NetworkNamespace,
        port: &Port,
        addresses: &[(IpAddr, u8)],
        host: &Handle,
    ) -> Result<(), NetnsError> {
        let (host_if, peer_if) = interface_names(&port.id);
        let mac = port.mac_bytes()?;

        // Leftover host side of an earlier failed attempt
        if let Ok(Some(index)) = link_index(host, &host_if).await {
            warn!(interface = %host_if, "Removing stale veth");
            host.link().del(index).execute().await.map_err(netlink)?;
        }

        host.link()
            .add(LinkVeth::new(&host_if, &peer_if).build())
            .execute()
            .await
            .map_err(netlink)?;

        let peer_index = link_index(host, &peer_if)
            .await?
            .ok_or_else(|| NetnsError::InterfaceNotFound(peer_if.clone()))?;
        host.link()
            .set(LinkUnspec::new_with_index(peer_index).address(mac).build())
            .execute()
            .await
            .map_err(netlink)?;

        let fd = namespace
            .handle
            .as_ref()
            .ok_or_else(|| NetnsError::NotFound(namespace.name().to_string()))?
            .as_raw_fd();
        host.link()
            .set(LinkUnspec::new_with_index(peer_index).setns_by_fd(fd).build())
            .execute()
            .await
            .map_err(netlink)?;

        let host_index = link_index(host, &host_if)
            .await?
            .ok_or_else(|| NetnsError::InterfaceNotFound(host_if.clone()))?;
        set_up(host, host_index).await?;

        let inner = self.netlink_in(namespace)?;
        let lo = link_index(&inner, "lo")
            .await?
            .ok_or_else(|| NetnsError::InterfaceNotFound("lo".to_string()))?;
        set_up(&inner, lo).await?;

        let peer_index = link_index(&inner, &peer_if)
            .await?
            .ok_or_else(|| NetnsError::InterfaceNotFound(peer_if.clone()))?;
        set_up(&inner, peer_index).await?;

        for (address, prefix) in addresses {
            inner
                .address()
                .add(peer_index, *address, *prefix)
                .replace()
                .execute()
                .await
                .map_err(netlink)?;
            debug!(
                namespace = %namespace.name(),
                address = %address,
                prefix = prefix,
                "Assigned address"
            );
        }

        Ok(())
    }
}

#[async_trait::async_trait]
impl NamespaceManager for LinuxNamespaces {
    async fn ensure(
        &self,
        port: &Port,
        cloud: &dyn CloudClient,
    ) -> Result<NetworkNamespace, NetnsError> {
        let path = Self::path_for(&port.network_id);
        if path.exists() {
            let namespace = self.attach(&port.network_id, &path)?;
            debug!(namespace = %namespace.name(), "Attached to existing namespace");
            return Ok(namespace);
        }

        // Resolve everything from the cloud before touching the kernel
        let addresses = resolve_addresses(port, cloud).await?;

        let (connection, host, _) = new_connection()?;
        tokio::spawn(connection);

        let name = injector_proto::namespace_name(&port.network_id);
        rtnetlink::NetworkNamespace::add(name.clone())
            .await
            .map_err(netlink)?;

        let mut namespace = self.attach(&port.network_id, &path)?;
        if let Err(e) = self.wire(&mut namespace, port, &addresses, &host).await {
            warn!(namespace = %name, "Wiring failed, removing namespace: {}", e);
            drop(namespace);
            self.forget(&port.network_id);
            if let Err(del) = rtnetlink::NetworkNamespace::del(name.clone()).await {
                warn!(namespace = %name, "Failed to remove namespace: {}", del);
            }
            return Err(e);
        }

        info!(
            namespace = %name,
            port_id = %port.id,
            addresses = addresses.len(),
            "Created namespace"
        );
        Ok(namespace)
    }

    fn enable(&self, namespace: &mut NetworkNamespace) -> Result<(), NetnsError> {
        namespace.check_enter()?;
        let origin = File::open(THREAD_NETNS)?;
        let target = namespace
            .handle
            .as_ref()
            .ok_or_else(|| NetnsError::NotFound(namespace.name().to_string()))?;
        setns(target, CloneFlags::CLONE_NEWNET)?;
        namespace.origin = Some(origin);
        namespace.set_entered(true);
        Ok(())
    }

    fn disable(&self, namespace: &mut NetworkNamespace) -> Result<(), NetnsError> {
        namespace.check_leave()?;
        let origin = namespace
            .origin
            .as_ref()
            .ok_or_else(|| NetnsError::NotEntered(namespace.name().to_string()))?;
        setns(origin, CloneFlags::CLONE_NEWNET)?;
        namespace.origin = None;
        namespace.set_entered(false);
        Ok(())
    }

    fn close(&self, namespace: NetworkNamespace) -> Result<(), NetnsError> {
        if namespace.is_entered() {
            return Err(NetnsError::StillEntered(namespace.name().to_string()));
        }
        Ok(())
    }

    async fn delete_by_id(&self, network_id: &str) -> Result<(), NetnsError> {
        let name = injector_proto::namespace_name(network_id);
        let path = Self::path_for(network_id);
        if !path.exists() {
            self.forget(network_id);
            return Err(NetnsError::NotFound(name));
        }

        // Refuse to delete a namespace that was replaced behind our back
        drop(self.attach(network_id, &path)?);

        rtnetlink::NetworkNamespace::del(name.clone())
            .await
            .map_err(netlink)?;
        self.forget(network_id);

        info!(namespace = %name, "Deleted namespace");
        Ok(())
    }
}

async fn link_index(handle: &Handle, name: &str) -> Result<Option<u32>, NetnsError> {
    let mut links = handle.link().get().match_name(name.to_string()).execute();
    match links.try_next().await.map_err(netlink)? {
        Some(link) => Ok(Some(link.header.index)),
        None => Ok(None),
    }
}

async fn set_up(handle: &Handle, index: u32) -> Result<(), NetnsError> {
    let link = LinkUnspec::new_with_index(index).up().build();
    handle.link().set(link).execute().await.map_err(netlink)
}

fn netlink(e: rtnetlink::Error) -> NetnsError {
    NetnsError::Netlink(e.to_string())
}
