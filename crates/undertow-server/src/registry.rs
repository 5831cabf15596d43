use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::RwLock;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use undertow_common::TrafficStats;
use undertow_protocol::ProxyType;

use crate::routes::{RouteError, RouteRegistrar};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Invalid subdomain: {0}")]
    InvalidSubdomain(String),

    #[error("Domain already in use: {0}")]
    DomainInUse(String),

    #[error("Route registration failed: {0}")]
    Route(#[from] RouteError),
}

/// A vanity domain bound to a proxy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainBinding {
    pub domain: String,
    pub route_id: String,
}

/// Per-proxy counters. `traffic.a_to_b` is public → client, `b_to_a` the
/// other way.
#[derive(Debug, Default)]
pub struct ProxyStats {
    pub traffic: Arc<TrafficStats>,
    connections: AtomicU64,
}

impl ProxyStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connection_opened(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connections(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }
}

/// An active proxy, owned by one control channel
#[derive(Debug)]
pub struct ProxyEntry {
    pub port: u16,
    pub proxy_type: ProxyType,
    pub proxy_name: String,
    /// Peer address of the owning control connection
    pub peer: SocketAddr,
    pub domain: Option<DomainBinding>,
    /// Cancelled when the entry is removed; stops the listener
    pub shutdown: CancellationToken,
    pub stats: Arc<ProxyStats>,
    pub created_at: SystemTime,
}

/// Read-only view of a proxy
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ProxySnapshot {
    pub proxy_id: u64,
    pub port: u16,
    pub proxy_type: ProxyType,
    pub proxy_name: String,
    pub peer: SocketAddr,
    pub domain: Option<String>,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub connections: u64,
    pub created_at: SystemTime,
}

#[derive(Default)]
struct Inner {
    /// Ports held by a proxy, active or still being set up
    reserved: HashSet<u16>,
    entries: HashMap<u16, (u64, ProxyEntry)>,
    domains: HashSet<String>,
}

/// Active proxies, their ports and their domains.
///
/// One lock guards all three so that reservations and removals are atomic;
/// it is never held across I/O.
pub struct ProxyRegistry {
    inner: RwLock<Inner>,
    routes: Arc<dyn RouteRegistrar>,
    /// Base domain when domain tunneling is on
    base_domain: Option<String>,
    next_id: AtomicU64,
}

impl ProxyRegistry {
    pub fn new(routes: Arc<dyn RouteRegistrar>, base_domain: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(Inner::default()),
            routes,
            base_domain,
            next_id: AtomicU64::new(1),
        })
    }

    /// Claim `port` for a new proxy. False if taken or 0.
    pub fn reserve(&self, port: u16) -> bool {
        port != 0 && self.inner.write().reserved.insert(port)
    }

    /// Undo a reservation on a failure path
    pub fn release(&self, port: u16) {
        let mut inner = self.inner.write();
        if !inner.entries.contains_key(&port) {
            inner.reserved.remove(&port);
        }
    }

    pub fn is_reserved(&self, port: u16) -> bool {
        self.inner.read().reserved.contains(&port)
    }

    /// Bind `requested` (or a generated subdomain) under the base domain and
    /// register its route. `None` when domain tunneling is off.
    pub async fn bind_domain(
        &self,
        requested: &str,
        port: u16,
    ) -> Result<Option<DomainBinding>, RegistryError> {
        let Some(base) = &self.base_domain else {
            return Ok(None);
        };

        let subdomain = if requested.is_empty() {
            generate_subdomain()
        } else {
            requested.to_ascii_lowercase()
        };
        if !is_valid_subdomain(&subdomain) {
            return Err(RegistryError::InvalidSubdomain(subdomain));
        }

        let domain = format!("{}.{}", subdomain, base);
        if !self.inner.write().domains.insert(domain.clone()) {
            return Err(RegistryError::DomainInUse(domain));
        }

        match self.routes.add_route(&domain, port).await {
            Ok(route_id) => Ok(Some(DomainBinding { domain, route_id })),
            Err(e) => {
                self.inner.write().domains.remove(&domain);
                Err(e.into())
            }
        }
    }

    /// Drop a binding whose proxy never made it into the registry
    pub async fn unbind_domain(&self, binding: &DomainBinding) {
        self.inner.write().domains.remove(&binding.domain);
        if let Err(e) = self.routes.remove_route(&binding.route_id).await {
            tracing::error!("Failed to remove route {}: {}", binding.route_id, e);
        }
    }

    /// Register an entry on its (already reserved) port
    pub fn add(&self, entry: ProxyEntry) -> u64 {
        let proxy_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.write();
        inner.reserved.insert(entry.port);
        if let Some(binding) = &entry.domain {
            inner.domains.insert(binding.domain.clone());
        }
        inner.entries.insert(entry.port, (proxy_id, entry));
        proxy_id
    }

    /// Remove the proxy on `port`, whoever owns it.
    ///
    /// The port stays reserved until the owning unit has dropped its
    /// listener and calls [`ProxyRegistry::release`].
    pub async fn remove(&self, port: u16) -> bool {
        let removed = {
            let mut inner = self.inner.write();
            Self::detach(&mut inner, port, None)
        };
        self.finish_removal(removed).await
    }

    /// Remove the proxy on `port` only if it is still `proxy_id`
    pub async fn remove_owned(&self, port: u16, proxy_id: u64) -> bool {
        let removed = {
            let mut inner = self.inner.write();
            Self::detach(&mut inner, port, Some(proxy_id))
        };
        self.finish_removal(removed).await
    }

    /// Remove every proxy
    pub async fn clear(&self) -> usize {
        let removed: Vec<ProxyEntry> = {
            let mut inner = self.inner.write();
            let ports: Vec<u16> = inner.entries.keys().copied().collect();
            ports
                .into_iter()
                .filter_map(|port| Self::detach(&mut inner, port, None))
                .collect()
        };

        let count = removed.len();
        for entry in removed {
            self.finish_removal(Some(entry)).await;
        }
        count
    }

    fn detach(inner: &mut Inner, port: u16, owner: Option<u64>) -> Option<ProxyEntry> {
        match (inner.entries.get(&port), owner) {
            (None, _) => return None,
            (Some((id, _)), Some(owner)) if *id != owner => return None,
            _ => {}
        }

        let (_, entry) = inner.entries.remove(&port)?;
        if let Some(binding) = &entry.domain {
            inner.domains.remove(&binding.domain);
        }
        Some(entry)
    }

    async fn finish_removal(&self, entry: Option<ProxyEntry>) -> bool {
        let Some(entry) = entry else {
            return false;
        };

        entry.shutdown.cancel();
        tracing::info!(
            "Removed {} proxy on port {} (owner {})",
            entry.proxy_type,
            entry.port,
            entry.peer
        );

        if let Some(binding) = &entry.domain {
            if let Err(e) = self.routes.remove_route(&binding.route_id).await {
                tracing::error!("Failed to remove route {}: {}", binding.route_id, e);
            }
        }
        true
    }

    pub fn contains(&self, port: u16) -> bool {
        self.inner.read().entries.contains_key(&port)
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Active proxies ordered by port
    pub fn snapshot(&self) -> Vec<ProxySnapshot> {
        let inner = self.inner.read();
        let mut proxies: Vec<ProxySnapshot> = inner
            .entries
            .values()
            .map(|(proxy_id, entry)| {
                let traffic = entry.stats.traffic.snapshot();
                ProxySnapshot {
                    proxy_id: *proxy_id,
                    port: entry.port,
                    proxy_type: entry.proxy_type,
                    proxy_name: entry.proxy_name.clone(),
                    peer: entry.peer,
                    domain: entry.domain.as_ref().map(|b| b.domain.clone()),
                    bytes_in: traffic.a_to_b,
                    bytes_out: traffic.b_to_a,
                    connections: entry.stats.connections(),
                    created_at: entry.created_at,
                }
            })
            .collect();
        proxies.sort_by_key(|p| p.port);
        proxies
    }
}

/// Random subdomain that always starts with a letter
fn generate_subdomain() -> String {
    let id = Uuid::new_v4().simple().to_string();
    let mut chars = id.chars();
    let prefix = match chars.next() {
        // Map 0-9 to a-j
        Some(c) if c.is_ascii_digit() => char::from(b'a' + (c as u8 - b'0')),
        Some(c) => c,
        None => 'a',
    };
    std::iter::once(prefix).chain(chars.take(6)).collect()
}

/// Validate subdomain format (lowercase alphanumeric and hyphens only)
pub fn is_valid_subdomain(subdomain: &str) -> bool {
    if subdomain.is_empty() || subdomain.len() > 63 {
        return false;
    }

    let valid_char = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit();
    // Must start and end with alphanumeric
    if !subdomain.starts_with(valid_char) || !subdomain.ends_with(valid_char) {
        return false;
    }

    subdomain.chars().all(|c| valid_char(c) || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    use crate::routes::NoopRoutes;

    #[derive(Default)]
    struct RecordingRoutes {
        fail: bool,
        removed: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RouteRegistrar for RecordingRoutes {
        async fn add_route(&self, domain: &str, port: u16) -> Result<String, RouteError> {
            if self.fail {
                return Err(RouteError::Api("unavailable".to_string()));
            }
            Ok(crate::routes::route_id(domain, port))
        }

        async fn remove_route(&self, route_id: &str) -> Result<(), RouteError> {
            self.removed.lock().push(route_id.to_string());
            Ok(())
        }
    }

    fn entry(port: u16, domain: Option<DomainBinding>) -> ProxyEntry {
        ProxyEntry {
            port,
            proxy_type: ProxyType::Tcp,
            proxy_name: "test".to_string(),
            peer: "127.0.0.1:40000".parse().unwrap(),
            domain,
            shutdown: CancellationToken::new(),
            stats: ProxyStats::new(),
            created_at: SystemTime::now(),
        }
    }

    #[test]
    fn test_valid_subdomains() {
        assert!(is_valid_subdomain("myapp"));
        assert!(is_valid_subdomain("my-app"));
        assert!(is_valid_subdomain("my-app-123"));
        assert!(is_valid_subdomain("a"));
        assert!(is_valid_subdomain("123"));
    }

    #[test]
    fn test_invalid_subdomains() {
        assert!(!is_valid_subdomain(""));
        assert!(!is_valid_subdomain("-myapp"));
        assert!(!is_valid_subdomain("myapp-"));
        assert!(!is_valid_subdomain("my_app"));
        assert!(!is_valid_subdomain("my.app"));
        assert!(!is_valid_subdomain("MyApp"));
        assert!(!is_valid_subdomain(&"a".repeat(64)));
    }

    #[test]
    fn test_generated_subdomain_is_valid() {
        for _ in 0..100 {
            let sub = generate_subdomain();
            assert_eq!(sub.len(), 7);
            assert!(sub.starts_with(|c: char| c.is_ascii_lowercase()));
            assert!(is_valid_subdomain(&sub));
        }
    }

    #[test]
    fn test_reserve_is_exclusive() {
        let registry = ProxyRegistry::new(Arc::new(NoopRoutes), None);
        assert!(!registry.reserve(0));
        assert!(registry.reserve(9000));
        assert!(!registry.reserve(9000));

        registry.release(9000);
        assert!(registry.reserve(9000));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reserve_has_one_winner() {
        let registry = ProxyRegistry::new(Arc::new(NoopRoutes), None);
        let start = Arc::new(tokio::sync::Barrier::new(8));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            let start = start.clone();
            handles.push(tokio::spawn(async move {
                start.wait().await;
                registry.reserve(9000)
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert!(registry.is_reserved(9000));
    }

    #[tokio::test]
    async fn test_release_does_not_drop_an_active_entry() {
        let registry = ProxyRegistry::new(Arc::new(NoopRoutes), None);
        assert!(registry.reserve(9000));
        registry.add(entry(9000, None));

        registry.release(9000);
        assert!(registry.is_reserved(9000));
        assert!(!registry.reserve(9000));
    }

    #[tokio::test]
    async fn test_remove_cancels_and_frees_port() {
        let registry = ProxyRegistry::new(Arc::new(NoopRoutes), None);
        assert!(registry.reserve(9000));
        let e = entry(9000, None);
        let shutdown = e.shutdown.clone();
        registry.add(e);

        assert!(registry.remove(9000).await);
        assert!(shutdown.is_cancelled());
        assert!(!registry.contains(9000));

        // Held until the owner lets go of its listener
        assert!(!registry.reserve(9000));
        registry.release(9000);
        assert!(registry.reserve(9000));

        // Idempotent
        registry.release(9000);
        assert!(!registry.remove(9000).await);
    }

    #[tokio::test]
    async fn test_remove_owned_ignores_newer_owner() {
        let registry = ProxyRegistry::new(Arc::new(NoopRoutes), None);
        assert!(registry.reserve(9000));
        let old_id = registry.add(entry(9000, None));
        assert!(registry.remove_owned(9000, old_id).await);
        registry.release(9000);

        assert!(registry.reserve(9000));
        let new_id = registry.add(entry(9000, None));
        assert_ne!(old_id, new_id);

        // A late cleanup from the old owner must not evict the new one
        assert!(!registry.remove_owned(9000, old_id).await);
        assert!(registry.contains(9000));
    }

    #[tokio::test]
    async fn test_bind_domain_disabled() {
        let registry = ProxyRegistry::new(Arc::new(NoopRoutes), None);
        assert_eq!(registry.bind_domain("myapp", 9000).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_bind_domain_uniqueness_and_release() {
        let routes = Arc::new(RecordingRoutes::default());
        let registry = ProxyRegistry::new(routes.clone(), Some("example.com".to_string()));

        let binding = registry.bind_domain("myapp", 9000).await.unwrap().unwrap();
        assert_eq!(binding.domain, "myapp.example.com");
        assert_eq!(binding.route_id, "myapp.example.com.9000");

        assert!(matches!(
            registry.bind_domain("myapp", 9001).await,
            Err(RegistryError::DomainInUse(_))
        ));

        assert!(registry.reserve(9000));
        registry.add(entry(9000, Some(binding)));
        assert!(registry.remove(9000).await);
        assert_eq!(routes.removed.lock().as_slice(), ["myapp.example.com.9000"]);

        // Free again after removal
        assert!(registry.bind_domain("myapp", 9001).await.is_ok());
    }

    #[tokio::test]
    async fn test_bind_domain_rolls_back_on_route_failure() {
        let routes = Arc::new(RecordingRoutes {
            fail: true,
            ..Default::default()
        });
        let registry = ProxyRegistry::new(routes, Some("example.com".to_string()));

        assert!(matches!(
            registry.bind_domain("myapp", 9000).await,
            Err(RegistryError::Route(_))
        ));
        assert!(registry.inner.read().domains.is_empty());
    }

    #[tokio::test]
    async fn test_bind_domain_rejects_invalid_subdomain() {
        let registry = ProxyRegistry::new(Arc::new(NoopRoutes), Some("example.com".to_string()));
        assert!(matches!(
            registry.bind_domain("bad_name", 9000).await,
            Err(RegistryError::InvalidSubdomain(_))
        ));
    }

    #[tokio::test]
    async fn test_clear_and_snapshot() {
        let registry = ProxyRegistry::new(Arc::new(NoopRoutes), None);
        for port in [9002, 9000, 9001] {
            assert!(registry.reserve(port));
            registry.add(entry(port, None));
        }

        let ports: Vec<u16> = registry.snapshot().iter().map(|p| p.port).collect();
        assert_eq!(ports, vec![9000, 9001, 9002]);

        assert_eq!(registry.clear().await, 3);
        assert!(registry.is_empty());
        assert!(registry.snapshot().is_empty());
    }
}
