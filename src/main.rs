use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};
use vipgate::api::{ControlApi, PKG_NAME, VERSION};
use vipgate::ca::CertificateAuthority;
use vipgate::config::Config;
use vipgate::dns::{DnsResolver, DnsServer};
use vipgate::interface::{self, SharedInterfaceManager};
use vipgate::locator::{SharedLocator, StaticLocator};
use vipgate::proxy::{ProxyContext, TlsSource};
use vipgate::registry::{EndpointRegistry, RegistryConfig};
use vipgate::upstream::Upstream;
use vipgate::{reaper, system_dns};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("vipgate=debug".parse().expect("valid log directive")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("vipgate.toml"));

    let config = load_config(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    print_startup_banner(&config);

    let pid_file_path = config.server.pid_file.as_ref().map(PathBuf::from);
    let _pid_file = if let Some(ref path) = pid_file_path {
        let pid_file = PidFile::create(path)?;
        info!(path = %path.display(), "PID file written and locked");
        Some(pid_file)
    } else {
        None
    };

    let subnet = config.server.subnet()?;
    let reserved = subnet.reserved();

    // A leftover interface from an unclean exit would make creation fail
    let interfaces = interface::for_driver(config.server.interface_driver);
    let _ = interfaces.destroy_interface(&config.server.interface);
    interfaces
        .create_interface(&config.server.interface, reserved)
        .map_err(|e| anyhow::anyhow!("Failed to create interface {}: {}", config.server.interface, e))?;
    info!(interface = %config.server.interface, ip = %reserved, "Virtual interface up");

    let result = serve(&config, reserved, Arc::clone(&interfaces)).await;

    if let Err(e) = interfaces.destroy_interface(&config.server.interface) {
        warn!(interface = %config.server.interface, error = %e, "Failed to destroy interface");
    }

    if let Some(ref path) = pid_file_path {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }

    match &result {
        Ok(()) => info!("Shutdown complete"),
        Err(e) => error!(error = %e, "Frontend stopped with an error"),
    }
    result
}

fn load_config(path: &Path) -> anyhow::Result<Config> {
    if path.exists() {
        let config = Config::load(path)?;
        info!(path = %path.display(), "Configuration loaded");
        return Ok(config);
    }

    warn!(path = %path.display(), "Configuration file not found, using defaults");
    let mut config = Config::default();
    config.apply_env_overrides(|key| std::env::var(key).ok());
    config.validate()?;
    Ok(config)
}

/// Run every service on the interface until a shutdown signal arrives
async fn serve(
    config: &Config,
    reserved: std::net::Ipv4Addr,
    interfaces: SharedInterfaceManager,
) -> anyhow::Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let ca = Arc::new(CertificateAuthority::generate()?);
    if let Some(ref path) = config.server.ca_cert_file {
        std::fs::write(path, ca.root_pem())
            .map_err(|e| anyhow::anyhow!("Failed to write root certificate to {}: {}", path, e))?;
        info!(path = %path, "Root certificate written");
    }

    let dns_addr = config.dns.bind_addr(IpAddr::V4(reserved))?;
    let resolver = Arc::new(DnsResolver::new(system_dns::from_config(&config.dns), dns_addr));
    let dns_server = DnsServer::bind(
        dns_addr,
        Arc::clone(&resolver),
        config.dns.upstream_addr()?,
        config.dns.upstream_timeout(),
        config.dns.ttl_secs,
    )
    .await?;

    let locator: SharedLocator = Arc::new(StaticLocator::new(&config.locator));
    let proxy = Arc::new(ProxyContext {
        tls: TlsSource::Authority(Arc::clone(&ca)),
        upstream: Upstream::new(
            Some(locator),
            config.proxy.connect_timeout(),
            config.proxy.idle_timeout(),
        ),
        handshake_timeout: config.proxy.handshake_timeout(),
    });

    let registry = Arc::new(EndpointRegistry::new(
        RegistryConfig {
            interface: config.server.interface.clone(),
            subnet: config.server.subnet()?,
            lease_duration: config.server.lease_duration(),
            stop_timeout: config.proxy.stop_timeout(),
        },
        interfaces,
        resolver,
        proxy,
    ));

    let api_hostname = config.server.api_hostname();
    registry.publish_control_host(&api_hostname).await?;

    let api_addr = SocketAddr::new(IpAddr::V4(reserved), config.server.api_port);
    let mut api = ControlApi::new(api_addr, Arc::clone(&registry), shutdown_rx.clone());
    if config.server.api_tls {
        api = api.with_tls(TlsAcceptor::from(ca.server_config(&api_hostname)?));
    }
    let api_listener = api.bind().await?;
    info!(
        host = %api_hostname,
        addr = %api_addr,
        tls = api.tls_enabled(),
        "Control API published"
    );

    let dns_shutdown = shutdown_rx.clone();
    let dns_handle = tokio::spawn(async move {
        if let Err(e) = dns_server.run(dns_shutdown).await {
            error!(error = %e, "DNS server error");
        }
    });

    let api_handle = tokio::spawn(async move {
        if let Err(e) = api.serve(api_listener).await {
            error!(error = %e, "Control API error");
        }
    });

    let reaper_handle = tokio::spawn(reaper::run(
        Arc::clone(&registry),
        config.server.reap_interval(),
        shutdown_rx.clone(),
    ));

    wait_for_signal().await?;

    let _ = shutdown_tx.send(true);

    info!("Tearing down endpoints...");
    registry.close_all().await;

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = api_handle.await;
        let _ = dns_handle.await;
        let _ = reaper_handle.await;
    })
    .await;

    Ok(())
}

/// Resolve on Ctrl+C or SIGTERM
async fn wait_for_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())
            .map_err(|e| anyhow::anyhow!("Failed to install SIGTERM handler: {}", e))?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    Ok(())
}

/// PID file handle that maintains an exclusive lock
#[cfg(unix)]
struct PidFile {
    _file: std::fs::File,
}

#[cfg(unix)]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::io::Write;
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };

        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("Another instance is already running (PID file is locked)");
            }
            return Err(err.into());
        }

        writeln!(&file, "{}", std::process::id())?;

        // the lock lives as long as the handle
        Ok(Self { _file: file })
    }
}

#[cfg(not(unix))]
struct PidFile;

#[cfg(not(unix))]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::io::Write;
        let mut file = std::fs::File::create(path)?;
        writeln!(file, "{}", std::process::id())?;
        Ok(Self)
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting frontend");
    info!(
        interface = %config.server.interface,
        driver = ?config.server.interface_driver,
        subnet = %config.server.subnet,
        domain = %config.server.domain,
        "Network configuration"
    );
    info!(
        api_host = %config.server.api_hostname(),
        api_port = config.server.api_port,
        api_tls = config.server.api_tls,
        "Control API settings"
    );
    info!(
        lease_secs = config.server.lease_secs,
        reap_interval_secs = config.server.reap_interval_secs,
        "Lease settings"
    );
    info!(
        port = config.dns.port,
        upstream = %config.dns.upstream,
        ttl = config.dns.ttl_secs,
        system_resolver = ?config.dns.system_resolver,
        "DNS settings"
    );
    info!(
        handshake_timeout_secs = config.proxy.handshake_timeout().as_secs(),
        connect_timeout_secs = config.proxy.connect_timeout().as_secs(),
        idle_timeout_secs = config.proxy.idle_timeout().as_secs(),
        "Proxy timeouts"
    );
    info!(
        services = ?config.locator.services.keys().collect::<Vec<_>>(),
        "Configured workload locations"
    );
}
