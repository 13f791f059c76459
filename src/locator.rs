//! Workload location
//!
//! Backend references (`app/kind/name:port`) are resolved through a
//! [`WorkloadLocator`] on every dial. The frontend ships a
//! [`StaticLocator`] driven by configuration; deployments that schedule
//! workloads elsewhere plug in their own implementation.

use crate::config::LocatorConfig;
use crate::error::FrontendError;
use futures::future::BoxFuture;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

/// A live instance of a service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceAddress {
    pub id: String,
    /// `None` when the instance is only reachable through
    /// [`WorkloadLocator::open_backend_stream`]
    pub ip: Option<IpAddr>,
}

/// Any bidirectional byte stream to a backend
pub trait Conn: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Conn for T {}

pub type BoxedStream = Box<dyn Conn>;

pub trait WorkloadLocator: Send + Sync {
    /// Instances currently serving `service` of `app`
    fn list_instances<'a>(
        &'a self,
        app: &'a str,
        service: &'a str,
    ) -> BoxFuture<'a, Result<Vec<InstanceAddress>, FrontendError>>;

    /// Stream to `port` of an instance that has no routable address
    fn open_backend_stream<'a>(
        &'a self,
        app: &'a str,
        instance_id: &'a str,
        port: u16,
    ) -> BoxFuture<'a, Result<BoxedStream, FrontendError>>;
}

pub type SharedLocator = Arc<dyn WorkloadLocator>;

/// Uniform random choice; `None` for an empty list
pub fn choose_instance(instances: &[InstanceAddress]) -> Option<&InstanceAddress> {
    instances.choose(&mut rand::thread_rng())
}

/// Instances listed in the `[locator.services]` table
#[derive(Debug, Default)]
pub struct StaticLocator {
    services: HashMap<String, Vec<InstanceAddress>>,
}

impl StaticLocator {
    pub fn new(config: &LocatorConfig) -> Self {
        let services = config
            .services
            .iter()
            .map(|(key, instances)| {
                let instances = instances
                    .iter()
                    .map(|i| InstanceAddress {
                        id: i.id.clone(),
                        ip: i.ip,
                    })
                    .collect();
                (key.clone(), instances)
            })
            .collect();
        Self { services }
    }

    fn instance(&self, app: &str, instance_id: &str) -> Option<&InstanceAddress> {
        let prefix = format!("{}/", app);
        self.services
            .iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .flat_map(|(_, instances)| instances.iter())
            .find(|i| i.id == instance_id)
    }
}

impl WorkloadLocator for StaticLocator {
    fn list_instances<'a>(
        &'a self,
        app: &'a str,
        service: &'a str,
    ) -> BoxFuture<'a, Result<Vec<InstanceAddress>, FrontendError>> {
        Box::pin(async move {
            let key = format!("{}/{}", app, service);
            let instances = self.services.get(&key).cloned().unwrap_or_default();
            debug!(service = %key, count = instances.len(), "Listed instances");
            Ok(instances)
        })
    }

    fn open_backend_stream<'a>(
        &'a self,
        app: &'a str,
        instance_id: &'a str,
        port: u16,
    ) -> BoxFuture<'a, Result<BoxedStream, FrontendError>> {
        Box::pin(async move {
            // static instances have no side channel; fall back to their address
            let ip = self
                .instance(app, instance_id)
                .and_then(|i| i.ip)
                .ok_or_else(|| {
                    FrontendError::Backend(format!(
                        "instance {} of {} is not reachable",
                        instance_id, app
                    ))
                })?;

            let addr = SocketAddr::new(ip, port);
            let stream = TcpStream::connect(addr)
                .await
                .map_err(|e| FrontendError::Backend(format!("{}: {}", addr, e)))?;
            Ok(Box::new(stream) as BoxedStream)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InstanceConfig;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn config() -> LocatorConfig {
        let mut services = HashMap::new();
        services.insert(
            "shop/web".to_string(),
            vec![
                InstanceConfig {
                    id: "web-1".to_string(),
                    ip: Some("127.0.0.1".parse().unwrap()),
                },
                InstanceConfig {
                    id: "web-2".to_string(),
                    ip: None,
                },
            ],
        );
        LocatorConfig { services }
    }

    #[tokio::test]
    async fn test_list_instances() {
        let locator = StaticLocator::new(&config());

        let instances = locator.list_instances("shop", "web").await.unwrap();
        assert_eq!(instances.len(), 2);
        assert_eq!(instances[0].id, "web-1");

        assert!(locator.list_instances("shop", "worker").await.unwrap().is_empty());
    }

    #[test]
    fn test_choose_instance() {
        assert!(choose_instance(&[]).is_none());

        let instances = vec![
            InstanceAddress {
                id: "a".to_string(),
                ip: None,
            },
            InstanceAddress {
                id: "b".to_string(),
                ip: None,
            },
        ];
        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            seen.insert(choose_instance(&instances).unwrap().id.clone());
        }
        assert_eq!(seen.len(), 2, "both instances should be picked eventually");
    }

    #[tokio::test]
    async fn test_open_backend_stream_dials_instance() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"hello").await.unwrap();
        });

        let locator = StaticLocator::new(&config());
        let mut stream = locator.open_backend_stream("shop", "web-1", port).await.unwrap();

        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn test_open_backend_stream_unreachable_instance() {
        let locator = StaticLocator::new(&config());
        assert!(locator.open_backend_stream("shop", "web-2", 80).await.is_err());
        assert!(locator.open_backend_stream("shop", "missing", 80).await.is_err());
    }
}
