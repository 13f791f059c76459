//! Virtual network interface management
//!
//! Endpoint addresses live as aliases on one virtual interface. The
//! commands that create the interface and bind aliases differ between OS
//! families, so the rest of the crate only sees [`InterfaceManager`].
//!
//! Creation is not idempotent: callers destroy a leftover interface
//! before creating it again, and never add an alias before creation has
//! succeeded.

use crate::config::InterfaceDriver;
use std::net::Ipv4Addr;
use std::process::Command;
use std::sync::Arc;
use tracing::debug;

/// Errors from interface operations carry the failing command and its stderr
pub type InterfaceResult = Result<(), String>;

pub trait InterfaceManager: Send + Sync {
    /// Create the interface, assign `base_ip` and bring it up
    fn create_interface(&self, name: &str, base_ip: Ipv4Addr) -> InterfaceResult;

    /// Remove the interface and every alias on it
    fn destroy_interface(&self, name: &str) -> InterfaceResult;

    /// Bind an additional address to the interface
    fn add_alias(&self, name: &str, ip: Ipv4Addr) -> InterfaceResult;

    /// Unbind an address previously added with [`add_alias`](Self::add_alias)
    fn remove_alias(&self, name: &str, ip: Ipv4Addr) -> InterfaceResult;
}

pub type SharedInterfaceManager = Arc<dyn InterfaceManager>;

/// Pick the implementation for the configured driver
pub fn for_driver(driver: InterfaceDriver) -> SharedInterfaceManager {
    match driver {
        InterfaceDriver::Linux => Arc::new(LinuxInterface),
        InterfaceDriver::Darwin => Arc::new(DarwinInterface),
        InterfaceDriver::None => Arc::new(NoopInterface),
        InterfaceDriver::Auto => {
            if cfg!(target_os = "macos") {
                Arc::new(DarwinInterface)
            } else {
                Arc::new(LinuxInterface)
            }
        }
    }
}

fn run(program: &str, args: &[&str]) -> InterfaceResult {
    debug!(program, args = ?args, "Running interface command");

    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| format!("Failed to run {}: {}", program, e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!(
            "{} {} failed: {}",
            program,
            args.join(" "),
            stderr.trim()
        ));
    }
    Ok(())
}

/// iproute2 on a `dummy` link
#[derive(Debug, Default, Clone, Copy)]
pub struct LinuxInterface;

impl InterfaceManager for LinuxInterface {
    fn create_interface(&self, name: &str, base_ip: Ipv4Addr) -> InterfaceResult {
        let cidr = format!("{}/32", base_ip);

        run("ip", &["link", "add", name, "type", "dummy"])?;

        if let Err(e) = run("ip", &["addr", "add", &cidr, "dev", name]) {
            let _ = run("ip", &["link", "del", name]);
            return Err(e);
        }

        if let Err(e) = run("ip", &["link", "set", name, "up"]) {
            let _ = run("ip", &["link", "del", name]);
            return Err(e);
        }

        Ok(())
    }

    fn destroy_interface(&self, name: &str) -> InterfaceResult {
        run("ip", &["link", "del", name])
    }

    fn add_alias(&self, name: &str, ip: Ipv4Addr) -> InterfaceResult {
        let cidr = format!("{}/32", ip);
        run("ip", &["addr", "add", &cidr, "dev", name])
    }

    fn remove_alias(&self, name: &str, ip: Ipv4Addr) -> InterfaceResult {
        let cidr = format!("{}/32", ip);
        run("ip", &["addr", "del", &cidr, "dev", name])
    }
}

/// BSD `ifconfig`; loopback names (`lo0`) only get aliases
#[derive(Debug, Default, Clone, Copy)]
pub struct DarwinInterface;

impl DarwinInterface {
    fn is_loopback(name: &str) -> bool {
        name.starts_with("lo")
    }
}

impl InterfaceManager for DarwinInterface {
    fn create_interface(&self, name: &str, base_ip: Ipv4Addr) -> InterfaceResult {
        let ip = base_ip.to_string();

        if Self::is_loopback(name) {
            return run("ifconfig", &[name, "alias", &ip, "255.255.255.255"]);
        }

        run("ifconfig", &[name, "create"])?;
        if let Err(e) = run("ifconfig", &[name, "inet", &ip, "netmask", "255.255.255.255", "up"]) {
            let _ = run("ifconfig", &[name, "destroy"]);
            return Err(e);
        }
        Ok(())
    }

    fn destroy_interface(&self, name: &str) -> InterfaceResult {
        if Self::is_loopback(name) {
            // aliases are removed one by one on teardown
            return Ok(());
        }
        run("ifconfig", &[name, "destroy"])
    }

    fn add_alias(&self, name: &str, ip: Ipv4Addr) -> InterfaceResult {
        run("ifconfig", &[name, "alias", &ip.to_string(), "255.255.255.255"])
    }

    fn remove_alias(&self, name: &str, ip: Ipv4Addr) -> InterfaceResult {
        run("ifconfig", &[name, "-alias", &ip.to_string()])
    }
}

/// Leaves the system untouched; for subnets the host already routes
/// locally (e.g. 127.0.0.0/8 on Linux)
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopInterface;

impl InterfaceManager for NoopInterface {
    fn create_interface(&self, name: &str, base_ip: Ipv4Addr) -> InterfaceResult {
        debug!(name, %base_ip, "Interface management disabled, not creating interface");
        Ok(())
    }

    fn destroy_interface(&self, _name: &str) -> InterfaceResult {
        Ok(())
    }

    fn add_alias(&self, _name: &str, _ip: Ipv4Addr) -> InterfaceResult {
        Ok(())
    }

    fn remove_alias(&self, _name: &str, _ip: Ipv4Addr) -> InterfaceResult {
        Ok(())
    }
}
