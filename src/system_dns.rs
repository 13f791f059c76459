//! Points the host's own resolver at the embedded DNS server
//!
//! Done once per managed domain: either a resolver-directory file
//! (`/etc/resolver/<domain>` on macOS) or a dnsmasq drop-in followed by a
//! service reload (NetworkManager on Linux desktops).

use crate::config::{DnsConfig, SystemResolverKind};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use tracing::info;

pub trait SystemResolver: Send + Sync {
    /// Direct queries for `domain` to `nameserver`
    fn configure(&self, domain: &str, nameserver: SocketAddr) -> anyhow::Result<()>;
}

pub type SharedSystemResolver = Arc<dyn SystemResolver>;

pub fn from_config(config: &DnsConfig) -> SharedSystemResolver {
    match config.system_resolver {
        SystemResolverKind::ResolverDir => Arc::new(ResolverDirectory::new(&config.resolver_dir)),
        SystemResolverKind::Dnsmasq => Arc::new(Dnsmasq::new(
            &config.dnsmasq_dir,
            config.dnsmasq_reload.clone(),
        )),
        SystemResolverKind::None => Arc::new(Unmanaged),
        SystemResolverKind::Auto => {
            if cfg!(target_os = "macos") {
                Arc::new(ResolverDirectory::new(&config.resolver_dir))
            } else {
                Arc::new(Unmanaged)
            }
        }
    }
}

/// One file per domain containing `nameserver` and `port` lines
#[derive(Debug, Clone)]
pub struct ResolverDirectory {
    dir: PathBuf,
}

impl ResolverDirectory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl SystemResolver for ResolverDirectory {
    fn configure(&self, domain: &str, nameserver: SocketAddr) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.dir).map_err(|e| {
            anyhow::anyhow!("Failed to create resolver directory {}: {}", self.dir.display(), e)
        })?;

        let path = self.dir.join(domain);
        let content = format!("nameserver {}\nport {}\n", nameserver.ip(), nameserver.port());
        std::fs::write(&path, content)
            .map_err(|e| anyhow::anyhow!("Failed to write {}: {}", path.display(), e))?;

        info!(domain, path = %path.display(), "Resolver file written");
        Ok(())
    }
}

/// dnsmasq `server=/domain/ip#port` drop-in plus a reload command
#[derive(Debug, Clone)]
pub struct Dnsmasq {
    dir: PathBuf,
    reload: Vec<String>,
}

impl Dnsmasq {
    pub fn new(dir: impl Into<PathBuf>, reload: Vec<String>) -> Self {
        Self {
            dir: dir.into(),
            reload,
        }
    }

    fn drop_in_path(&self, domain: &str) -> PathBuf {
        self.dir.join(format!("vipgate-{}.conf", domain))
    }
}

impl SystemResolver for Dnsmasq {
    fn configure(&self, domain: &str, nameserver: SocketAddr) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.dir).map_err(|e| {
            anyhow::anyhow!("Failed to create dnsmasq directory {}: {}", self.dir.display(), e)
        })?;

        let path = self.drop_in_path(domain);
        let content = format!(
            "server=/{}/{}#{}\n",
            domain,
            nameserver.ip(),
            nameserver.port()
        );
        std::fs::write(&path, content)
            .map_err(|e| anyhow::anyhow!("Failed to write {}: {}", path.display(), e))?;

        if let Some((program, args)) = self.reload.split_first() {
            let output = Command::new(program)
                .args(args)
                .output()
                .map_err(|e| anyhow::anyhow!("Failed to run {}: {}", program, e))?;
            if !output.status.success() {
                anyhow::bail!(
                    "{} failed: {}",
                    self.reload.join(" "),
                    String::from_utf8_lossy(&output.stderr).trim()
                );
            }
        }

        info!(domain, path = %path.display(), "dnsmasq drop-in written");
        Ok(())
    }
}

/// Leaves the system resolver alone
#[derive(Debug, Default, Clone, Copy)]
pub struct Unmanaged;

impl SystemResolver for Unmanaged {
    fn configure(&self, _domain: &str, _nameserver: SocketAddr) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nameserver() -> SocketAddr {
        "10.42.84.1:53".parse().unwrap()
    }

    #[test]
    fn test_resolver_directory_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = ResolverDirectory::new(dir.path().join("resolver"));

        resolver.configure("convox", nameserver()).unwrap();

        let content = std::fs::read_to_string(dir.path().join("resolver/convox")).unwrap();
        assert_eq!(content, "nameserver 10.42.84.1\nport 53\n");
    }

    #[test]
    fn test_dnsmasq_writes_drop_in_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("reloaded");
        let resolver = Dnsmasq::new(
            dir.path(),
            vec![
                "touch".to_string(),
                marker.to_string_lossy().into_owned(),
            ],
        );

        resolver.configure("convox", "10.42.84.1:5353".parse().unwrap()).unwrap();

        let content = std::fs::read_to_string(dir.path().join("vipgate-convox.conf")).unwrap();
        assert_eq!(content, "server=/convox/10.42.84.1#5353\n");
        assert!(marker.exists());
    }

    #[test]
    fn test_dnsmasq_reload_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = Dnsmasq::new(dir.path(), vec!["false".to_string()]);

        assert!(resolver.configure("convox", nameserver()).is_err());
    }

    #[test]
    fn test_dnsmasq_without_reload_command() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = Dnsmasq::new(dir.path(), Vec::new());

        resolver.configure("dev", nameserver()).unwrap();
        assert!(dir.path().join("vipgate-dev.conf").exists());
    }

    #[test]
    fn test_unmanaged_does_nothing() {
        assert!(Unmanaged.configure("convox", nameserver()).is_ok());
    }
}
