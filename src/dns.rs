//! Embedded DNS responder
//!
//! Two classes of query:
//!
//! ```text
//! Client Query (UDP)
//!      |
//!      v
//! A record under a registered domain?
//!      |
//!      +-- yes --> answer from the zone table (AA, TTL 5s)
//!      |           unknown host -> NOERROR, empty answer
//!      |
//!      +-- no --> forward verbatim to upstream over TCP
//!                       |
//!                       +-- ok -> upstream bytes, unmodified
//!                       +-- error/timeout -> SERVFAIL
//! ```

use crate::system_dns::SharedSystemResolver;
use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{DNSClass, RData, Record, RecordType};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Large enough for EDNS payloads
const MAX_DATAGRAM: usize = 4096;

/// Lowercase, without the trailing root dot
fn normalize(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

/// Last label of a host, the unit of domain registration
pub fn domain_of(host: &str) -> Option<String> {
    let host = normalize(host);
    host.rsplit('.').next().filter(|l| !l.is_empty()).map(String::from)
}

/// Zone table shared between the registry (writer) and the DNS server
pub struct DnsResolver {
    domains: RwLock<HashSet<String>>,
    hosts: RwLock<HashMap<String, Ipv4Addr>>,
    system: SharedSystemResolver,
    nameserver: SocketAddr,
}

impl DnsResolver {
    /// `nameserver` is the address the system resolver is pointed at
    pub fn new(system: SharedSystemResolver, nameserver: SocketAddr) -> Self {
        Self {
            domains: RwLock::new(HashSet::new()),
            hosts: RwLock::new(HashMap::new()),
            system,
            nameserver,
        }
    }

    /// Install an authoritative zone for `domain` and point the system
    /// resolver at us. Returns false when the domain was already
    /// registered; the system side effect runs at most once per domain.
    pub fn register_domain(&self, domain: &str) -> anyhow::Result<bool> {
        let domain = normalize(domain);
        if !self.domains.write().insert(domain.clone()) {
            return Ok(false);
        }

        info!(domain = %domain, nameserver = %self.nameserver, "Registered managed domain");
        self.system.configure(&domain, self.nameserver)?;
        Ok(true)
    }

    pub fn is_registered(&self, domain: &str) -> bool {
        self.domains.read().contains(&normalize(domain))
    }

    /// True when `name` falls under a registered domain
    pub fn is_managed(&self, name: &str) -> bool {
        domain_of(name)
            .map(|d| self.domains.read().contains(&d))
            .unwrap_or(false)
    }

    pub fn set_host(&self, host: &str, ip: Ipv4Addr) {
        self.hosts.write().insert(normalize(host), ip);
    }

    pub fn remove_host(&self, host: &str) {
        self.hosts.write().remove(&normalize(host));
    }

    pub fn lookup(&self, name: &str) -> Option<Ipv4Addr> {
        self.hosts.read().get(&normalize(name)).copied()
    }
}

/// UDP DNS server answering from a [`DnsResolver`]
pub struct DnsServer {
    socket: Arc<UdpSocket>,
    resolver: Arc<DnsResolver>,
    upstream: SocketAddr,
    upstream_timeout: Duration,
    ttl: u32,
}

impl DnsServer {
    pub async fn bind(
        addr: SocketAddr,
        resolver: Arc<DnsResolver>,
        upstream: SocketAddr,
        upstream_timeout: Duration,
        ttl: u32,
    ) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind DNS socket {}: {}", addr, e))?;

        Ok(Self {
            socket: Arc::new(socket),
            resolver,
            upstream,
            upstream_timeout,
            ttl,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<()> {
        let addr = self.socket.local_addr()?;
        info!(addr = %addr, upstream = %self.upstream, "DNS server listening");

        let server = Arc::new(self);
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            tokio::select! {
                result = server.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, peer)) => {
                            let query = buf[..len].to_vec();
                            let server = Arc::clone(&server);
                            tokio::spawn(async move {
                                if let Some(response) = server.handle_query(&query).await {
                                    if let Err(e) = server.socket.send_to(&response, peer).await {
                                        debug!(peer = %peer, error = %e, "Failed to send DNS response");
                                    }
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to receive DNS query");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("DNS server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Build the reply for one datagram; `None` drops it
    pub async fn handle_query(&self, query: &[u8]) -> Option<Vec<u8>> {
        let message = match Message::from_vec(query) {
            Ok(m) => m,
            Err(e) => {
                debug!(error = %e, "Dropping malformed DNS query");
                return None;
            }
        };

        if message.message_type() != MessageType::Query {
            return None;
        }

        if let Some(response) = self.answer_authoritative(&message) {
            return match response.to_vec() {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    warn!(error = %e, "Failed to encode DNS response");
                    None
                }
            };
        }

        match self.forward(query).await {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                let name = message
                    .queries()
                    .first()
                    .map(|q| q.name().to_string())
                    .unwrap_or_default();
                warn!(name = %name, upstream = %self.upstream, error = %e, "Upstream DNS failed");
                servfail(&message).to_vec().ok()
            }
        }
    }

    /// Answer for a single A/IN question under a registered domain
    fn answer_authoritative(&self, query: &Message) -> Option<Message> {
        if query.op_code() != OpCode::Query || query.queries().len() != 1 {
            return None;
        }

        let question = &query.queries()[0];
        if question.query_type() != RecordType::A || question.query_class() != DNSClass::IN {
            return None;
        }

        let name = question.name().to_string();
        if !self.resolver.is_managed(&name) {
            return None;
        }

        let mut response = Message::new();
        response
            .set_id(query.id())
            .set_message_type(MessageType::Response)
            .set_op_code(OpCode::Query)
            .set_authoritative(true)
            .set_recursion_desired(query.recursion_desired())
            .set_recursion_available(false)
            .set_response_code(ResponseCode::NoError)
            .add_query(question.clone());

        match self.resolver.lookup(&name) {
            Some(ip) => {
                debug!(name = %name, ip = %ip, "Authoritative answer");
                response.add_answer(Record::from_rdata(
                    question.name().clone(),
                    self.ttl,
                    RData::A(A::from(ip)),
                ));
            }
            None => {
                debug!(name = %name, "Managed name has no record");
            }
        }

        Some(response)
    }

    /// Relay the raw query to the upstream resolver over TCP
    async fn forward(&self, query: &[u8]) -> anyhow::Result<Vec<u8>> {
        let len = u16::try_from(query.len())
            .map_err(|_| anyhow::anyhow!("Query too large to forward"))?;

        let exchange = async {
            let mut stream = TcpStream::connect(self.upstream).await?;

            let mut framed = Vec::with_capacity(query.len() + 2);
            framed.extend_from_slice(&len.to_be_bytes());
            framed.extend_from_slice(query);
            stream.write_all(&framed).await?;

            let mut len_buf = [0u8; 2];
            stream.read_exact(&mut len_buf).await?;
            let mut response = vec![0u8; u16::from_be_bytes(len_buf) as usize];
            stream.read_exact(&mut response).await?;

            Ok::<_, std::io::Error>(response)
        };

        match tokio::time::timeout(self.upstream_timeout, exchange).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(anyhow::anyhow!("Exchange with upstream failed: {}", e)),
            Err(_) => Err(anyhow::anyhow!(
                "Upstream did not answer within {}ms",
                self.upstream_timeout.as_millis()
            )),
        }
    }
}

/// SERVFAIL echoing the query's id and question
fn servfail(query: &Message) -> Message {
    let mut response = Message::new();
    response
        .set_id(query.id())
        .set_message_type(MessageType::Response)
        .set_op_code(query.op_code())
        .set_recursion_desired(query.recursion_desired())
        .set_recursion_available(true)
        .set_response_code(ResponseCode::ServFail)
        .add_queries(query.queries().to_vec());
    response
}
