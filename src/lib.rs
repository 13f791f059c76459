//! Vipgate - a local frontend for container workloads
//!
//! This library gives each workload a stable virtual IP and DNS name:
//! - Allocates addresses from a subnet as aliases on a virtual interface
//! - Answers DNS for the managed domain and forwards everything else
//! - Runs per-endpoint TCP/HTTP/TLS proxies, terminating TLS with an
//!   in-memory certificate authority
//! - Expires endpoints whose lease is not renewed
//! - Exposes a control API to create, renew, retarget and delete endpoints

pub mod api;
pub mod balancer;
pub mod ca;
pub mod config;
pub mod dns;
pub mod error;
pub mod interface;
pub mod ippool;
pub mod locator;
pub mod proxy;
pub mod reaper;
pub mod registry;
pub mod relay;
pub mod system_dns;
pub mod target;
pub mod upstream;
