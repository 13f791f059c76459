//! Endpoint registry
//!
//! The registry is the single owner of endpoint state. A host holds one
//! virtual IP and one lease; every port opened on that IP is a separate
//! listener sharing both.
//!
//! Locking: `state` is a short synchronous lock around the maps and is
//! never held across an await or an OS call. Read-modify-write sequences
//! (allocate then insert, scan then tear down) run under `gate`, an async
//! mutex, so they are serialized without blocking the proxies that read
//! their routes concurrently.

use crate::dns::{domain_of, DnsResolver};
use crate::error::FrontendError;
use crate::interface::{InterfaceResult, SharedInterfaceManager};
use crate::ippool::Subnet;
use crate::proxy::{ProxyContext, ProxyHandle, ProxyListener};
use crate::target::{Route, Scheme};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Maximum hostname length (RFC 1035)
const MAX_HOSTNAME_LEN: usize = 253;

/// One (host, port) row
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Endpoint {
    pub host: String,
    pub ip: Ipv4Addr,
    pub port: u16,
    pub scheme: Scheme,
    pub target: String,
    pub lease_expiry: DateTime<Utc>,
}

/// Static parameters of a registry
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub interface: String,
    pub subnet: Subnet,
    pub lease_duration: Duration,
    /// How long to wait for a listener's accept loop when stopping it
    pub stop_timeout: Duration,
}

struct HostEntry {
    ip: Ipv4Addr,
    lease_expiry: DateTime<Utc>,
    listeners: BTreeMap<u16, ProxyHandle>,
}

impl HostEntry {
    fn endpoint(&self, host: &str, port: u16, listener: &ProxyHandle) -> Endpoint {
        let route = listener.route();
        Endpoint {
            host: host.to_string(),
            ip: self.ip,
            port,
            scheme: route.scheme,
            target: route.to_string(),
            lease_expiry: self.lease_expiry,
        }
    }
}

#[derive(Default)]
struct RegistryState {
    hosts: BTreeMap<String, HostEntry>,
    control_host: Option<String>,
}

pub struct EndpointRegistry {
    config: RegistryConfig,
    interfaces: SharedInterfaceManager,
    dns: Arc<DnsResolver>,
    proxy: Arc<ProxyContext>,
    state: Mutex<RegistryState>,
    gate: tokio::sync::Mutex<()>,
}

/// Lowercased host without the trailing dot, checked for DNS syntax
pub fn normalize_host(host: &str) -> Result<String, FrontendError> {
    let host = host.trim().trim_end_matches('.').to_ascii_lowercase();
    if host.is_empty() {
        return Err(FrontendError::MissingParameter("host"));
    }

    let valid = host.len() <= MAX_HOSTNAME_LEN
        && host.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        });

    if !valid {
        return Err(FrontendError::InvalidHost(host));
    }
    Ok(host)
}

/// `now + lease`, or an error when the sum leaves chrono's range
fn expiry_after(now: DateTime<Utc>, lease: Duration) -> Result<DateTime<Utc>, FrontendError> {
    chrono::Duration::from_std(lease)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .ok_or_else(|| FrontendError::Internal(format!("lease of {:?} is out of range", lease)))
}

impl EndpointRegistry {
    pub fn new(
        config: RegistryConfig,
        interfaces: SharedInterfaceManager,
        dns: Arc<DnsResolver>,
        proxy: Arc<ProxyContext>,
    ) -> Self {
        Self {
            config,
            interfaces,
            dns,
            proxy,
            state: Mutex::new(RegistryState::default()),
            gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Run an interface command on the blocking pool
    async fn interface_call<F>(&self, op: F) -> Result<(), FrontendError>
    where
        F: FnOnce(&dyn crate::interface::InterfaceManager, &str) -> InterfaceResult + Send + 'static,
    {
        let manager = Arc::clone(&self.interfaces);
        let name = self.config.interface.clone();

        tokio::task::spawn_blocking(move || op(manager.as_ref(), &name))
            .await
            .map_err(|e| FrontendError::Internal(format!("interface task failed: {}", e)))?
            .map_err(FrontendError::Interface)
    }

    /// Install the domain of `host`, configuring the system resolver the
    /// first time a domain is seen
    async fn register_domain(&self, host: &str) -> Result<(), FrontendError> {
        let domain = domain_of(host).ok_or_else(|| FrontendError::InvalidHost(host.to_string()))?;
        if self.dns.is_registered(&domain) {
            return Ok(());
        }

        let dns = Arc::clone(&self.dns);
        let result = tokio::task::spawn_blocking(move || dns.register_domain(&domain))
            .await
            .map_err(|e| FrontendError::Internal(format!("domain registration task failed: {}", e)))?;

        if let Err(e) = result {
            // the zone is live either way; only the OS resolver hook failed
            warn!(host, error = %e, "Failed to point system resolver at embedded DNS");
        }
        Ok(())
    }

    /// Create the endpoint for `host` or renew its lease and retarget `port`
    pub async fn create_or_renew(
        &self,
        host: &str,
        port: u16,
        target: &str,
    ) -> Result<Endpoint, FrontendError> {
        let host = normalize_host(host)?;
        if port == 0 {
            return Err(FrontendError::InvalidPort(port.to_string()));
        }

        let _gate = self.gate.lock().await;

        if self.state.lock().control_host.as_deref() == Some(host.as_str()) {
            return Err(FrontendError::InvalidHost(format!("{} is reserved", host)));
        }

        // a bare host:port keeps the scheme of the listener already on the port
        let existing = self.state.lock().hosts.get(&host).map(|entry| {
            let scheme = entry.listeners.get(&port).map(|l| l.route().scheme);
            (entry.ip, scheme)
        });
        let default = existing.and_then(|(_, scheme)| scheme).unwrap_or(Scheme::Tcp);
        let route = Route::parse_with_default(target, default)?;
        let existing = existing.map(|(ip, scheme)| (ip, scheme.is_some()));

        if let Some((_, true)) = existing {
            let state = self.state.lock();
            if let Some(listener) = state.hosts.get(&host).and_then(|e| e.listeners.get(&port)) {
                listener.set_route(route.clone());
            }
        }

        let lease_expiry = expiry_after(Utc::now(), self.config.lease_duration)?;

        match existing {
            Some((ip, true)) => {
                debug!(host = %host, ip = %ip, port, route = %route, "Renewed endpoint");
            }
            Some((ip, false)) => {
                let handle = self.start_listener(&host, ip, port, route).await?;
                if let Some(entry) = self.state.lock().hosts.get_mut(&host) {
                    entry.listeners.insert(port, handle);
                }
                self.dns.set_host(&host, ip);
                info!(host = %host, ip = %ip, port, "Opened port on existing endpoint");
            }
            None => {
                let ip = self.create_host(&host, port, route).await?;
                info!(host = %host, ip = %ip, port, "Created endpoint");
            }
        }

        let mut state = self.state.lock();
        let entry = state
            .hosts
            .get_mut(&host)
            .ok_or_else(|| FrontendError::Internal(format!("{} vanished during update", host)))?;
        entry.lease_expiry = lease_expiry;

        let listener = entry
            .listeners
            .get(&port)
            .ok_or_else(|| FrontendError::Internal(format!("no listener on port {}", port)))?;
        Ok(entry.endpoint(&host, port, listener))
    }

    /// Allocate, alias, publish and start the first listener for a new host
    async fn create_host(&self, host: &str, port: u16, route: Route) -> Result<Ipv4Addr, FrontendError> {
        let ip = {
            let state = self.state.lock();
            let in_use: HashSet<Ipv4Addr> = state.hosts.values().map(|e| e.ip).collect();
            self.config
                .subnet
                .allocate(&in_use)
                .ok_or_else(|| FrontendError::PoolExhausted(self.config.subnet.to_string()))?
        };

        self.interface_call(move |m, name| m.add_alias(name, ip)).await?;

        if let Err(e) = self.register_domain(host).await {
            self.release_alias(ip).await;
            return Err(e);
        }

        let handle = match self.start_listener(host, ip, port, route).await {
            Ok(handle) => handle,
            Err(e) => {
                self.release_alias(ip).await;
                return Err(e);
            }
        };

        self.dns.set_host(host, ip);

        let mut listeners = BTreeMap::new();
        listeners.insert(port, handle);
        self.state.lock().hosts.insert(
            host.to_string(),
            HostEntry {
                ip,
                lease_expiry: Utc::now(),
                listeners,
            },
        );

        Ok(ip)
    }

    async fn release_alias(&self, ip: Ipv4Addr) {
        if let Err(e) = self.interface_call(move |m, name| m.remove_alias(name, ip)).await {
            warn!(ip = %ip, error = %e, "Failed to remove alias after failed create");
        }
    }

    async fn start_listener(
        &self,
        host: &str,
        ip: Ipv4Addr,
        port: u16,
        route: Route,
    ) -> Result<ProxyHandle, FrontendError> {
        let addr = SocketAddr::new(IpAddr::V4(ip), port);
        ProxyListener::start(addr, host, route, Arc::clone(&self.proxy)).await
    }

    /// Start (or retarget) a listener on an existing host's IP; the lease
    /// is left as is
    pub async fn attach_proxy(
        &self,
        host: &str,
        port: u16,
        scheme: &str,
        target: &str,
    ) -> Result<Endpoint, FrontendError> {
        let host = normalize_host(host)?;
        if port == 0 {
            return Err(FrontendError::InvalidPort(port.to_string()));
        }
        if scheme.trim().is_empty() {
            return Err(FrontendError::MissingParameter("scheme"));
        }
        let scheme: Scheme = scheme.trim().parse()?;
        let route = Route::parse(target, Some(scheme))?;

        let _gate = self.gate.lock().await;

        let (ip, retargeted) = {
            let state = self.state.lock();
            let entry = state
                .hosts
                .get(&host)
                .ok_or_else(|| FrontendError::UnknownEndpoint(host.clone()))?;
            let listener = entry.listeners.get(&port);
            if let Some(listener) = listener {
                listener.set_route(route.clone());
            }
            (entry.ip, listener.is_some())
        };

        if !retargeted {
            let handle = self.start_listener(&host, ip, port, route).await?;
            if let Some(entry) = self.state.lock().hosts.get_mut(&host) {
                entry.listeners.insert(port, handle);
            }
        }
        info!(host = %host, ip = %ip, port, scheme = %scheme, "Attached proxy");

        let state = self.state.lock();
        let entry = state
            .hosts
            .get(&host)
            .ok_or_else(|| FrontendError::UnknownEndpoint(host.clone()))?;
        let listener = entry
            .listeners
            .get(&port)
            .ok_or_else(|| FrontendError::Internal(format!("no listener on port {}", port)))?;
        Ok(entry.endpoint(&host, port, listener))
    }

    /// Snapshot ordered by (host, port)
    pub fn list(&self) -> Vec<Endpoint> {
        let state = self.state.lock();
        state
            .hosts
            .iter()
            .flat_map(|(host, entry)| {
                entry
                    .listeners
                    .iter()
                    .map(move |(port, listener)| entry.endpoint(host, *port, listener))
            })
            .collect()
    }

    /// Tear `host` down now, regardless of its lease
    pub async fn delete(&self, host: &str) -> Result<(), FrontendError> {
        let host = normalize_host(host)?;
        let _gate = self.gate.lock().await;

        let entry = self
            .state
            .lock()
            .hosts
            .remove(&host)
            .ok_or_else(|| FrontendError::UnknownEndpoint(host.clone()))?;

        match self.teardown(&host, entry).await {
            Ok(()) => {
                info!(host = %host, "Deleted endpoint");
                Ok(())
            }
            Err((e, entry)) => {
                self.state.lock().hosts.insert(host, entry);
                Err(e)
            }
        }
    }

    /// Tear down every host whose lease ended before `now`; returns the
    /// hosts removed. Hosts that fail to tear down stay for the next call.
    pub async fn expire(&self, now: DateTime<Utc>) -> Vec<String> {
        let _gate = self.gate.lock().await;

        let expired: Vec<(String, HostEntry)> = {
            let mut state = self.state.lock();
            let hosts: Vec<String> = state
                .hosts
                .iter()
                .filter(|(_, entry)| entry.lease_expiry < now)
                .map(|(host, _)| host.clone())
                .collect();
            hosts
                .into_iter()
                .filter_map(|host| state.hosts.remove(&host).map(|entry| (host, entry)))
                .collect()
        };

        let mut removed = Vec::with_capacity(expired.len());
        for (host, entry) in expired {
            match self.teardown(&host, entry).await {
                Ok(()) => {
                    info!(host = %host, "Endpoint lease expired");
                    removed.push(host);
                }
                Err((e, entry)) => {
                    warn!(host = %host, error = %e, "Failed to expire endpoint, retrying next sweep");
                    self.state.lock().hosts.insert(host, entry);
                }
            }
        }
        removed
    }

    /// Tear down every endpoint, for process shutdown
    pub async fn close_all(&self) {
        let _gate = self.gate.lock().await;
        let entries: Vec<(String, HostEntry)> = std::mem::take(&mut self.state.lock().hosts)
            .into_iter()
            .collect();

        for (host, entry) in entries {
            if let Err((e, _)) = self.teardown(&host, entry).await {
                warn!(host = %host, error = %e, "Failed to tear down endpoint on shutdown");
            }
        }
    }

    /// Stop listeners, remove the alias, then withdraw the DNS record. On
    /// failure the (now listener-less) entry is handed back with its record
    /// still published.
    async fn teardown(
        &self,
        host: &str,
        mut entry: HostEntry,
    ) -> Result<(), (FrontendError, HostEntry)> {
        for (_, listener) in std::mem::take(&mut entry.listeners) {
            listener.stop(self.config.stop_timeout).await;
        }

        let ip = entry.ip;
        match self.interface_call(move |m, name| m.remove_alias(name, ip)).await {
            Ok(()) => {
                self.dns.remove_host(host);
                Ok(())
            }
            Err(e) => Err((e, entry)),
        }
    }

    /// Publish the control API's own name on the reserved address
    pub async fn publish_control_host(&self, host: &str) -> Result<Ipv4Addr, FrontendError> {
        let host = normalize_host(host)?;
        let ip = self.config.subnet.reserved();

        let _gate = self.gate.lock().await;
        self.register_domain(&host).await?;
        self.dns.set_host(&host, ip);
        self.state.lock().control_host = Some(host.clone());

        info!(host = %host, ip = %ip, "Published control host");
        Ok(ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::CertificateAuthority;
    use crate::interface::{InterfaceManager, NoopInterface};
    use crate::proxy::TlsSource;
    use crate::system_dns::Unmanaged;
    use crate::upstream::Upstream;
    use tokio::net::TcpStream;

    /// Records alias changes; fails removals while `fail_remove` is set
    #[derive(Default)]
    struct RecordingInterface {
        calls: parking_lot::Mutex<Vec<String>>,
        fail_remove: std::sync::atomic::AtomicBool,
    }

    impl InterfaceManager for RecordingInterface {
        fn create_interface(&self, name: &str, base_ip: Ipv4Addr) -> InterfaceResult {
            self.calls.lock().push(format!("create {} {}", name, base_ip));
            Ok(())
        }

        fn destroy_interface(&self, name: &str) -> InterfaceResult {
            self.calls.lock().push(format!("destroy {}", name));
            Ok(())
        }

        fn add_alias(&self, name: &str, ip: Ipv4Addr) -> InterfaceResult {
            self.calls.lock().push(format!("add {} {}", name, ip));
            Ok(())
        }

        fn remove_alias(&self, name: &str, ip: Ipv4Addr) -> InterfaceResult {
            if self.fail_remove.load(std::sync::atomic::Ordering::SeqCst) {
                return Err("ifconfig: permission denied".to_string());
            }
            self.calls.lock().push(format!("remove {} {}", name, ip));
            Ok(())
        }
    }

    fn registry_with(
        subnet: &str,
        lease: Duration,
        interfaces: SharedInterfaceManager,
    ) -> (EndpointRegistry, Arc<DnsResolver>) {
        let dns = Arc::new(DnsResolver::new(
            Arc::new(Unmanaged),
            "127.0.0.1:53".parse().unwrap(),
        ));
        let proxy = Arc::new(ProxyContext {
            tls: TlsSource::Authority(Arc::new(CertificateAuthority::generate().unwrap())),
            upstream: Upstream::new(None, Duration::from_secs(2), Duration::from_secs(30)),
            handshake_timeout: Duration::from_secs(5),
        });
        let config = RegistryConfig {
            interface: "vip0".to_string(),
            subnet: subnet.parse().unwrap(),
            lease_duration: lease,
            stop_timeout: Duration::from_secs(5),
        };
        (
            EndpointRegistry::new(config, interfaces, Arc::clone(&dns), proxy),
            dns,
        )
    }

    fn registry(subnet: &str) -> (EndpointRegistry, Arc<DnsResolver>) {
        registry_with(subnet, Duration::from_secs(1800), Arc::new(NoopInterface))
    }

    #[test]
    fn test_normalize_host() {
        assert_eq!(normalize_host("Web.Shop.Convox.").unwrap(), "web.shop.convox");
        assert!(matches!(normalize_host(" "), Err(FrontendError::MissingParameter("host"))));
        assert!(normalize_host("bad..host").is_err());
        assert!(normalize_host("-bad.host").is_err());
        assert!(normalize_host("under_score.convox").is_err());
        assert!(normalize_host(&"a".repeat(64)).is_err());
    }

    #[tokio::test]
    async fn test_create_allocates_lowest_free_ip() {
        let (registry, dns) = registry("127.77.10.0/24");

        let web = registry.create_or_renew("web.convox", 18080, "tcp://127.0.0.1:1").await.unwrap();
        let db = registry.create_or_renew("db.convox", 18080, "tcp://127.0.0.1:2").await.unwrap();

        assert_eq!(web.ip, "127.77.10.2".parse::<Ipv4Addr>().unwrap());
        assert_eq!(db.ip, "127.77.10.3".parse::<Ipv4Addr>().unwrap());
        assert!(dns.is_registered("convox"));
        assert_eq!(dns.lookup("web.convox"), Some(web.ip));

        registry.close_all().await;
    }

    #[tokio::test]
    async fn test_renewal_keeps_one_listener_and_extends_lease() {
        let (registry, _) = registry("127.77.11.0/24");

        let first = registry
            .create_or_renew("svc.example", 18080, "http://10.0.0.5:9000")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = registry
            .create_or_renew("svc.example", 18080, "http://10.0.0.5:9000")
            .await
            .unwrap();

        assert_eq!(first.ip, second.ip);
        assert!(second.lease_expiry > first.lease_expiry);
        assert_eq!(registry.list().len(), 1);

        registry.close_all().await;
    }

    #[tokio::test]
    async fn test_renewal_retargets() {
        let (registry, _) = registry("127.77.12.0/24");

        registry.create_or_renew("web.convox", 18080, "tcp://127.0.0.1:1").await.unwrap();
        let renewed = registry
            .create_or_renew("web.convox", 18080, "http://127.0.0.1:2")
            .await
            .unwrap();

        assert_eq!(renewed.target, "http://127.0.0.1:2");
        assert_eq!(renewed.scheme, Scheme::Http);
        assert_eq!(registry.list()[0].target, "http://127.0.0.1:2");

        registry.close_all().await;
    }

    #[tokio::test]
    async fn test_list_is_ordered_by_host_then_port() {
        let (registry, _) = registry("127.77.13.0/24");

        registry.create_or_renew("zeta.convox", 18081, "127.0.0.1:1").await.unwrap();
        registry.create_or_renew("alpha.convox", 18082, "127.0.0.1:1").await.unwrap();
        registry.create_or_renew("alpha.convox", 18080, "127.0.0.1:1").await.unwrap();

        let rows: Vec<(String, u16)> = registry.list().into_iter().map(|e| (e.host, e.port)).collect();
        assert_eq!(
            rows,
            vec![
                ("alpha.convox".to_string(), 18080),
                ("alpha.convox".to_string(), 18082),
                ("zeta.convox".to_string(), 18081),
            ]
        );

        registry.close_all().await;
    }

    #[tokio::test]
    async fn test_invalid_parameters() {
        let (registry, _) = registry("127.77.14.0/24");

        assert!(matches!(
            registry.create_or_renew("web.convox", 0, "127.0.0.1:1").await,
            Err(FrontendError::InvalidPort(_))
        ));
        assert!(matches!(
            registry.create_or_renew("web.convox", 80, "").await,
            Err(FrontendError::MissingParameter("target"))
        ));
        assert!(matches!(
            registry.create_or_renew("", 80, "127.0.0.1:1").await,
            Err(FrontendError::MissingParameter("host"))
        ));
        assert!(registry.list().is_empty());
    }

    #[tokio::test]
    async fn test_pool_exhaustion() {
        // /30 has exactly one endpoint address
        let (registry, _) = registry("127.77.15.0/30");

        registry.create_or_renew("one.convox", 18080, "127.0.0.1:1").await.unwrap();
        let err = registry
            .create_or_renew("two.convox", 18080, "127.0.0.1:1")
            .await
            .unwrap_err();
        assert!(matches!(err, FrontendError::PoolExhausted(_)));

        registry.close_all().await;
    }

    #[tokio::test]
    async fn test_delete_tears_down_and_frees_ip() {
        let interfaces = Arc::new(RecordingInterface::default());
        let (registry, dns) = registry_with(
            "127.77.16.0/24",
            Duration::from_secs(1800),
            Arc::clone(&interfaces) as SharedInterfaceManager,
        );

        let web = registry.create_or_renew("web.convox", 18080, "127.0.0.1:1").await.unwrap();
        registry.delete("web.convox").await.unwrap();

        assert!(registry.list().is_empty());
        assert_eq!(dns.lookup("web.convox"), None);
        assert!(TcpStream::connect((web.ip, 18080)).await.is_err());
        assert_eq!(
            *interfaces.calls.lock(),
            vec![
                "add vip0 127.77.16.2".to_string(),
                "remove vip0 127.77.16.2".to_string()
            ]
        );

        // the address is reused
        let again = registry.create_or_renew("db.convox", 18080, "127.0.0.1:1").await.unwrap();
        assert_eq!(again.ip, web.ip);

        assert!(matches!(
            registry.delete("missing.convox").await,
            Err(FrontendError::UnknownEndpoint(_))
        ));

        registry.close_all().await;
    }

    #[tokio::test]
    async fn test_attach_proxy() {
        let (registry, _) = registry("127.77.17.0/24");

        assert!(matches!(
            registry.attach_proxy("web.convox", 18443, "tls", "127.0.0.1:1").await,
            Err(FrontendError::UnknownEndpoint(_))
        ));

        let web = registry.create_or_renew("web.convox", 18080, "127.0.0.1:1").await.unwrap();
        let attached = registry
            .attach_proxy("web.convox", 18443, "tls", "127.0.0.1:2")
            .await
            .unwrap();

        assert_eq!(attached.ip, web.ip);
        assert_eq!(attached.scheme, Scheme::Tls);
        assert_eq!(attached.lease_expiry, web.lease_expiry);
        assert_eq!(registry.list().len(), 2);
        assert!(TcpStream::connect((web.ip, 18443)).await.is_ok());

        assert!(matches!(
            registry.attach_proxy("web.convox", 18444, "ftp", "127.0.0.1:2").await,
            Err(FrontendError::InvalidScheme(_))
        ));

        registry.close_all().await;
    }

    #[tokio::test]
    async fn test_expire_removes_lapsed_hosts() {
        let (registry, dns) = registry_with(
            "127.77.18.0/24",
            Duration::from_secs(1),
            Arc::new(NoopInterface),
        );

        let web = registry.create_or_renew("web.convox", 18080, "127.0.0.1:1").await.unwrap();

        assert!(registry.expire(Utc::now()).await.is_empty());

        let removed = registry.expire(Utc::now() + chrono::Duration::seconds(2)).await;
        assert_eq!(removed, vec!["web.convox".to_string()]);
        assert!(registry.list().is_empty());
        assert_eq!(dns.lookup("web.convox"), None);
        assert!(TcpStream::connect((web.ip, 18080)).await.is_err());
    }

    #[tokio::test]
    async fn test_expire_failure_is_retried() {
        let interfaces = Arc::new(RecordingInterface::default());
        let (registry, _) = registry_with(
            "127.77.19.0/24",
            Duration::from_secs(1),
            Arc::clone(&interfaces) as SharedInterfaceManager,
        );

        registry.create_or_renew("web.convox", 18080, "127.0.0.1:1").await.unwrap();
        interfaces
            .fail_remove
            .store(true, std::sync::atomic::Ordering::SeqCst);

        let later = Utc::now() + chrono::Duration::seconds(2);
        assert!(registry.expire(later).await.is_empty());

        // the IP stays allocated until the alias is gone
        let other = registry.create_or_renew("db.convox", 18080, "127.0.0.1:1").await.unwrap();
        assert_eq!(other.ip, "127.77.19.3".parse::<Ipv4Addr>().unwrap());

        interfaces
            .fail_remove
            .store(false, std::sync::atomic::Ordering::SeqCst);
        let removed = registry.expire(later).await;
        assert!(removed.contains(&"web.convox".to_string()));

        registry.close_all().await;
    }

    #[tokio::test]
    async fn test_control_host_is_reserved() {
        let (registry, dns) = registry("127.77.20.0/24");

        let ip = registry.publish_control_host("api.convox").await.unwrap();
        assert_eq!(ip, "127.77.20.1".parse::<Ipv4Addr>().unwrap());
        assert_eq!(dns.lookup("api.convox"), Some(ip));
        assert!(dns.is_registered("convox"));

        assert!(matches!(
            registry.create_or_renew("api.convox", 18080, "127.0.0.1:1").await,
            Err(FrontendError::InvalidHost(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_teardown_keeps_dns_until_alias_is_gone() {
        let interfaces = Arc::new(RecordingInterface::default());
        let (registry, dns) = registry_with(
            "127.77.21.0/24",
            Duration::from_secs(1),
            Arc::clone(&interfaces) as SharedInterfaceManager,
        );

        let web = registry.create_or_renew("web.convox", 18080, "127.0.0.1:1").await.unwrap();
        interfaces
            .fail_remove
            .store(true, std::sync::atomic::Ordering::SeqCst);

        let later = Utc::now() + chrono::Duration::seconds(2);
        assert!(registry.expire(later).await.is_empty());
        assert_eq!(dns.lookup("web.convox"), Some(web.ip));

        // renewing restarts the listener and the name still resolves to it
        interfaces
            .fail_remove
            .store(false, std::sync::atomic::Ordering::SeqCst);
        let renewed = registry.create_or_renew("web.convox", 18080, "127.0.0.1:1").await.unwrap();
        assert_eq!(renewed.ip, web.ip);
        assert_eq!(dns.lookup("web.convox"), Some(web.ip));
        assert!(TcpStream::connect((web.ip, 18080)).await.is_ok());

        registry.delete("web.convox").await.unwrap();
        assert_eq!(dns.lookup("web.convox"), None);
    }

    #[tokio::test]
    async fn test_bare_renewal_keeps_listener_scheme() {
        let (registry, _) = registry("127.77.22.0/24");

        registry.create_or_renew("web.convox", 18080, "127.0.0.1:1").await.unwrap();
        registry
            .attach_proxy("web.convox", 18443, "tls", "127.0.0.1:2")
            .await
            .unwrap();

        let renewed = registry
            .create_or_renew("web.convox", 18443, "127.0.0.1:3")
            .await
            .unwrap();
        assert_eq!(renewed.scheme, Scheme::Tls);
        assert_eq!(renewed.target, "tls://127.0.0.1:3");

        // an explicit prefix still switches it
        let switched = registry
            .create_or_renew("web.convox", 18443, "https://127.0.0.1:3")
            .await
            .unwrap();
        assert_eq!(switched.scheme, Scheme::Https);

        registry.close_all().await;
    }

    #[test]
    fn test_expiry_out_of_range_is_an_error() {
        let now = Utc::now();
        assert!(expiry_after(now, Duration::from_secs(60)).unwrap() > now);
        assert!(matches!(
            expiry_after(now, Duration::from_secs(u64::MAX)),
            Err(FrontendError::Internal(_))
        ));
    }
}
