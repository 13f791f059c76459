use serde::Deserialize;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use crate::ippool::Subnet;

/// Environment variables that override the startup parameters
pub const ENV_INTERFACE: &str = "VIPGATE_INTERFACE";
pub const ENV_SUBNET: &str = "VIPGATE_SUBNET";
pub const ENV_DOMAIN: &str = "VIPGATE_DOMAIN";

/// Longest lease accepted from configuration (one year)
pub const MAX_LEASE_SECS: u64 = 365 * 24 * 60 * 60;

/// Global configuration for the frontend
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Embedded DNS responder
    #[serde(default)]
    pub dns: DnsConfig,

    /// Connection handling for endpoint proxies
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Static workload locations used to resolve `app/kind/name:port` targets
    #[serde(default)]
    pub locator: LocatorConfig,

    /// Listeners for the standalone balancer binary
    #[serde(default)]
    pub balancer: BalancerConfig,
}

/// Which set of OS primitives manages the virtual interface
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceDriver {
    /// Pick by target OS
    #[default]
    Auto,
    /// `ip link` / `ip addr`
    Linux,
    /// `ifconfig`
    Darwin,
    /// Do nothing (loopback subnets, tests)
    None,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Name of the virtual interface holding the endpoint addresses
    #[serde(default = "default_interface")]
    pub interface: String,

    /// Interface management backend (default: auto)
    #[serde(default)]
    pub interface_driver: InterfaceDriver,

    /// Subnet the virtual IPs are drawn from, in CIDR notation
    #[serde(default = "default_subnet")]
    pub subnet: String,

    /// Managed root domain (the last label of every endpoint host)
    #[serde(default = "default_domain")]
    pub domain: String,

    /// Hostname the control API is published under (default: api.<domain>)
    pub api_hostname: Option<String>,

    /// Port for the control API on the reserved address
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Serve the control API over TLS (default: true)
    #[serde(default = "default_true")]
    pub api_tls: bool,

    /// Lease granted to an endpoint on each create or renew, in seconds
    #[serde(default = "default_lease")]
    pub lease_secs: u64,

    /// Interval between lease reaper sweeps, in seconds
    #[serde(default = "default_reap_interval")]
    pub reap_interval_secs: u64,

    /// Write the root certificate here (PEM) at startup so clients can trust it
    pub ca_cert_file: Option<String>,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,
}

impl ServerConfig {
    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }

    pub fn api_hostname(&self) -> String {
        self.api_hostname
            .clone()
            .unwrap_or_else(|| format!("api.{}", self.domain))
    }

    pub fn subnet(&self) -> anyhow::Result<Subnet> {
        self.subnet
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid subnet '{}': {}", self.subnet, e))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            interface: default_interface(),
            interface_driver: InterfaceDriver::default(),
            subnet: default_subnet(),
            domain: default_domain(),
            api_hostname: None,
            api_port: default_api_port(),
            api_tls: true,
            lease_secs: default_lease(),
            reap_interval_secs: default_reap_interval(),
            ca_cert_file: None,
            pid_file: None,
        }
    }
}

/// How the host's own resolver is pointed at the embedded DNS server
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
pub enum SystemResolverKind {
    /// Resolver directory on macOS, nothing elsewhere
    #[default]
    #[serde(rename = "auto")]
    Auto,
    /// One file per domain under `resolver_dir`
    #[serde(rename = "resolver-dir")]
    ResolverDir,
    /// dnsmasq drop-in plus a reload command
    #[serde(rename = "dnsmasq")]
    Dnsmasq,
    /// Leave the system resolver alone
    #[serde(rename = "none")]
    None,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DnsConfig {
    /// Listen address (default: reserved address of the subnet)
    pub bind: Option<String>,

    /// UDP port to answer on
    #[serde(default = "default_dns_port")]
    pub port: u16,

    /// Recursive resolver for names outside the managed domains
    #[serde(default = "default_upstream")]
    pub upstream: String,

    /// Upstream exchange timeout in milliseconds
    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout_ms: u64,

    /// TTL of authoritative answers in seconds
    #[serde(default = "default_dns_ttl")]
    pub ttl_secs: u32,

    /// System resolver integration
    #[serde(default)]
    pub system_resolver: SystemResolverKind,

    /// Directory for resolver files (macOS style)
    #[serde(default = "default_resolver_dir")]
    pub resolver_dir: String,

    /// Directory for dnsmasq drop-ins
    #[serde(default = "default_dnsmasq_dir")]
    pub dnsmasq_dir: String,

    /// Command run after writing a dnsmasq drop-in
    #[serde(default = "default_dnsmasq_reload")]
    pub dnsmasq_reload: Vec<String>,
}

impl DnsConfig {
    pub fn upstream_addr(&self) -> anyhow::Result<SocketAddr> {
        self.upstream
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid DNS upstream '{}': {}", self.upstream, e))
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream_timeout_ms)
    }

    /// Resolve the listen address, falling back to the reserved address
    pub fn bind_addr(&self, reserved: IpAddr) -> anyhow::Result<SocketAddr> {
        let ip = match &self.bind {
            Some(bind) => bind
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid DNS bind address '{}': {}", bind, e))?,
            None => reserved,
        };
        Ok(SocketAddr::new(ip, self.port))
    }
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            bind: None,
            port: default_dns_port(),
            upstream: default_upstream(),
            upstream_timeout_ms: default_upstream_timeout(),
            ttl_secs: default_dns_ttl(),
            system_resolver: SystemResolverKind::default(),
            resolver_dir: default_resolver_dir(),
            dnsmasq_dir: default_dnsmasq_dir(),
            dnsmasq_reload: default_dnsmasq_reload(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// Maximum time for a client TLS handshake, in seconds
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,

    /// Maximum time to establish a backend connection, in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// A relayed connection with no traffic in either direction for this
    /// long is closed, in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Time allowed for a proxy's accept loop to wind down on teardown
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,
}

impl ProxyConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_secs: default_handshake_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            stop_timeout_secs: default_stop_timeout(),
        }
    }
}

/// One live instance of a service
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct InstanceConfig {
    /// Instance identifier
    pub id: String,
    /// Directly reachable address; instances without one are reached
    /// through the locator's backend stream
    pub ip: Option<IpAddr>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LocatorConfig {
    /// Instances keyed by `app/service`
    #[serde(default)]
    pub services: HashMap<String, Vec<InstanceConfig>>,
}

/// What a balancer listener does with a request
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BalancerMode {
    /// Answer every request with a redirect to the target
    Redirect,
    /// Forward to the fixed target
    #[default]
    Proxy,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BalancerListenerConfig {
    /// Listen address, e.g. "0.0.0.0:443"
    pub bind: String,

    /// Listener protocol: tcp, tls, http or https
    #[serde(default = "default_balancer_scheme")]
    pub scheme: String,

    /// Redirect or proxy
    #[serde(default)]
    pub mode: BalancerMode,

    /// Redirect URL (`*` in the path is replaced by the request path) or
    /// fixed `host:port` proxy target
    pub target: String,

    /// Name used for the generated certificate when no files are given
    #[serde(default = "default_balancer_hostname")]
    pub hostname: String,

    /// Path to TLS certificate file (PEM format)
    pub tls_cert: Option<String>,

    /// Path to TLS private key file (PEM format)
    pub tls_key: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct BalancerConfig {
    #[serde(default)]
    pub listeners: Vec<BalancerListenerConfig>,
}

fn default_true() -> bool {
    true
}

fn default_interface() -> String {
    "vip0".to_string()
}

fn default_subnet() -> String {
    "10.42.84.0/24".to_string()
}

fn default_domain() -> String {
    "convox".to_string()
}

fn default_api_port() -> u16 {
    9477
}

fn default_lease() -> u64 {
    30 * 60
}

fn default_reap_interval() -> u64 {
    30
}

fn default_dns_port() -> u16 {
    53
}

fn default_upstream() -> String {
    "8.8.8.8:53".to_string()
}

fn default_upstream_timeout() -> u64 {
    3000
}

fn default_dns_ttl() -> u32 {
    5
}

fn default_resolver_dir() -> String {
    "/etc/resolver".to_string()
}

fn default_dnsmasq_dir() -> String {
    "/etc/NetworkManager/dnsmasq.d".to_string()
}

fn default_dnsmasq_reload() -> Vec<String> {
    vec![
        "systemctl".to_string(),
        "restart".to_string(),
        "NetworkManager".to_string(),
    ]
}

fn default_handshake_timeout() -> u64 {
    10
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_idle_timeout() -> u64 {
    3600
}

fn default_stop_timeout() -> u64 {
    5
}

fn default_balancer_scheme() -> String {
    "http".to_string()
}

fn default_balancer_hostname() -> String {
    "localhost".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let mut config: Config = toml::from_str(&content)?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Override the startup parameters from the environment
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(interface) = lookup(ENV_INTERFACE).filter(|v| !v.is_empty()) {
            self.server.interface = interface;
        }
        if let Some(subnet) = lookup(ENV_SUBNET).filter(|v| !v.is_empty()) {
            self.server.subnet = subnet;
        }
        if let Some(domain) = lookup(ENV_DOMAIN).filter(|v| !v.is_empty()) {
            self.server.domain = domain;
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let subnet = self.server.subnet()?;
        if subnet.capacity() == 0 {
            anyhow::bail!("Subnet {} leaves no addresses for endpoints", self.server.subnet);
        }

        let domain = self.server.domain.trim_matches('.');
        if domain.is_empty() || domain.contains('.') {
            anyhow::bail!(
                "Domain '{}' must be a single label (e.g. \"convox\")",
                self.server.domain
            );
        }

        if self.server.interface.is_empty() {
            anyhow::bail!("Interface name must not be empty");
        }

        if self.server.lease_secs == 0 || self.server.lease_secs > MAX_LEASE_SECS {
            anyhow::bail!(
                "lease_secs ({}) must be between 1 and {}",
                self.server.lease_secs,
                MAX_LEASE_SECS
            );
        }

        if self.server.reap_interval_secs == 0
            || self.server.reap_interval_secs >= self.server.lease_secs
        {
            anyhow::bail!(
                "reap_interval_secs ({}) must be non-zero and smaller than lease_secs ({})",
                self.server.reap_interval_secs,
                self.server.lease_secs
            );
        }

        self.dns.upstream_addr()?;

        for (key, instances) in &self.locator.services {
            if key.split('/').count() != 2 {
                anyhow::bail!("Locator service '{}' must be written as app/service", key);
            }
            if instances.iter().any(|i| i.id.is_empty()) {
                anyhow::bail!("Locator service '{}' has an instance without an id", key);
            }
        }

        for listener in &self.balancer.listeners {
            listener
                .bind
                .parse::<SocketAddr>()
                .map_err(|e| anyhow::anyhow!("Invalid balancer bind '{}': {}", listener.bind, e))?;
            if listener.tls_cert.is_some() != listener.tls_key.is_some() {
                anyhow::bail!(
                    "Balancer listener {} needs both tls_cert and tls_key",
                    listener.bind
                );
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
interface = "vlan2"
subnet = "10.10.0.0/16"
domain = "dev"
api_port = 8443
lease_secs = 120
reap_interval_secs = 10
ca_cert_file = "/var/run/vipgate/ca.pem"

[dns]
port = 5353
upstream = "1.1.1.1:53"
system_resolver = "dnsmasq"

[proxy]
idle_timeout_secs = 60

[locator.services]
"shop/web" = [
    { id = "web-1", ip = "10.0.1.5" },
    { id = "web-2" },
]
"#;

        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.server.interface, "vlan2");
        assert_eq!(config.server.domain, "dev");
        assert_eq!(config.server.api_port, 8443);
        assert_eq!(config.server.lease_duration(), Duration::from_secs(120));
        assert_eq!(config.server.api_hostname(), "api.dev");
        assert_eq!(config.server.ca_cert_file.as_deref(), Some("/var/run/vipgate/ca.pem"));
        assert_eq!(config.dns.port, 5353);
        assert_eq!(config.dns.system_resolver, SystemResolverKind::Dnsmasq);
        assert_eq!(config.proxy.idle_timeout(), Duration::from_secs(60));

        let web = config.locator.services.get("shop/web").unwrap();
        assert_eq!(web.len(), 2);
        assert_eq!(web[0].ip, Some("10.0.1.5".parse().unwrap()));
        assert_eq!(web[1].ip, None);
    }

    #[test]
    fn test_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        config.validate().unwrap();

        assert_eq!(config.server.interface, "vip0");
        assert_eq!(config.server.subnet, "10.42.84.0/24");
        assert_eq!(config.server.domain, "convox");
        assert!(config.server.api_tls);
        assert_eq!(config.server.lease_duration(), Duration::from_secs(1800));
        assert_eq!(config.server.reap_interval(), Duration::from_secs(30));
        assert_eq!(config.dns.upstream, "8.8.8.8:53");
        assert_eq!(config.dns.ttl_secs, 5);
        assert_eq!(config.dns.system_resolver, SystemResolverKind::Auto);
        assert_eq!(config.server.interface_driver, InterfaceDriver::Auto);
        assert!(config.balancer.listeners.is_empty());
    }

    #[test]
    fn test_dns_bind_defaults_to_reserved_address() {
        let config = DnsConfig::default();
        let reserved: IpAddr = "10.42.84.1".parse().unwrap();
        assert_eq!(
            config.bind_addr(reserved).unwrap(),
            "10.42.84.1:53".parse::<SocketAddr>().unwrap()
        );

        let config = DnsConfig {
            bind: Some("127.0.0.1".to_string()),
            port: 5300,
            ..DnsConfig::default()
        };
        assert_eq!(
            config.bind_addr(reserved).unwrap(),
            "127.0.0.1:5300".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_env_overrides(|key| match key {
            ENV_INTERFACE => Some("dummy9".to_string()),
            ENV_SUBNET => Some("172.20.0.0/24".to_string()),
            ENV_DOMAIN => Some(String::new()),
            _ => None,
        });

        assert_eq!(config.server.interface, "dummy9");
        assert_eq!(config.server.subnet, "172.20.0.0/24");
        assert_eq!(config.server.domain, "convox");
    }

    #[test]
    fn test_reap_interval_must_be_below_lease() {
        let mut config = Config::default();
        config.server.lease_secs = 30;
        config.server.reap_interval_secs = 30;
        assert!(config.validate().is_err());

        config.server.reap_interval_secs = 5;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_lease_is_bounded() {
        let mut config = Config::default();
        config.server.lease_secs = u64::MAX;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("lease_secs"), "{}", err);

        config.server.lease_secs = MAX_LEASE_SECS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_subnet_rejected() {
        let mut config = Config::default();
        config.server.subnet = "10.0.0.0".to_string();
        assert!(config.validate().is_err());

        config.server.subnet = "10.0.0.0/31".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_multi_label_domain_rejected() {
        let mut config = Config::default();
        config.server.domain = "example.com".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_balancer_listeners() {
        let toml = r#"
[[balancer.listeners]]
bind = "0.0.0.0:80"
mode = "redirect"
target = "https://*/*"

[[balancer.listeners]]
bind = "0.0.0.0:443"
scheme = "https"
target = "10.0.0.10:8080"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();

        let listeners = &config.balancer.listeners;
        assert_eq!(listeners.len(), 2);
        assert_eq!(listeners[0].mode, BalancerMode::Redirect);
        assert_eq!(listeners[0].scheme, "http");
        assert_eq!(listeners[1].mode, BalancerMode::Proxy);
        assert_eq!(listeners[1].hostname, "localhost");
        assert!(listeners[1].tls_cert.is_none() && listeners[1].tls_key.is_none());
    }

    #[test]
    fn test_balancer_requires_cert_and_key_together() {
        let toml = r#"
[[balancer.listeners]]
bind = "0.0.0.0:443"
scheme = "https"
target = "10.0.0.10:8080"
tls_cert = "/etc/cert.pem"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vipgate.toml");
        std::fs::write(&path, "[server]\nlease_secs = 90\nreap_interval_secs = 15\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.server.lease_secs, 90);
        assert_eq!(config.server.reap_interval_secs, 15);
    }
}
