use anyhow::Context;
use async_trait::async_trait;
use hickory_resolver::TokioResolver;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;

use crate::packet::{Packet, PacketError, MAX_DNS_PACKET_SIZE};

pub const DNS_PORT: u16 = 53;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("consulta inválida: {0}")]
    Packet(#[from] PacketError),

    #[error("no pude abrir socket hacia {addr}")]
    Dial {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("fallo de E/S con {addr}")]
    Io {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("{addr} no respondió en {timeout:?}")]
    Timeout { addr: SocketAddr, timeout: Duration },
}

/// Sends one raw query to some resolver and returns its raw reply.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn exchange(&self, query: &[u8]) -> Result<Vec<u8>, UpstreamError>;
}

/// Plain UDP forwarding, one fresh socket per query.
#[derive(Debug, Clone)]
pub struct UdpUpstream {
    endpoints: Vec<SocketAddr>,
    timeout: Duration,
}

impl UdpUpstream {
    pub fn new(endpoints: Vec<SocketAddr>, timeout: Duration) -> anyhow::Result<Self> {
        anyhow::ensure!(!endpoints.is_empty(), "no hay upstreams configurados");
        Ok(Self { endpoints, timeout })
    }

    /// Endpoint for a transaction ID. Retransmissions of one query keep the
    /// same ID and so reach the same resolver.
    pub fn endpoint_for(&self, id: u16) -> SocketAddr {
        self.endpoints[usize::from(id) % self.endpoints.len()]
    }

    pub fn endpoints(&self) -> &[SocketAddr] {
        &self.endpoints
    }
}

#[async_trait]
impl Upstream for UdpUpstream {
    async fn exchange(&self, query: &[u8]) -> Result<Vec<u8>, UpstreamError> {
        let addr = self.endpoint_for(Packet::parse(query)?.id());
        let io = |source| UpstreamError::Io { addr, source };

        let local: SocketAddr = match addr {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(local)
            .await
            .map_err(|source| UpstreamError::Dial { addr, source })?;
        socket
            .connect(addr)
            .await
            .map_err(|source| UpstreamError::Dial { addr, source })?;

        let round_trip = async {
            socket.send(query).await.map_err(io)?;
            let mut buf = vec![0u8; MAX_DNS_PACKET_SIZE];
            let n = socket.recv(&mut buf).await.map_err(io)?;
            buf.truncate(n);
            Ok::<_, UpstreamError>(buf)
        };

        tokio::time::timeout(self.timeout, round_trip)
            .await
            .map_err(|_| UpstreamError::Timeout {
                addr,
                timeout: self.timeout,
            })?
    }
}

/// Turns the configured upstream list into socket addresses.
///
/// IP literals are taken as they are; hostnames go through the system
/// resolver and every address they resolve to becomes an endpoint.
pub async fn resolve_endpoints(upstreams: &[String]) -> anyhow::Result<Vec<SocketAddr>> {
    let mut endpoints = Vec::new();
    let mut resolver: Option<TokioResolver> = None;

    for u in upstreams {
        let (host, port) = split_host_port(u).with_context(|| format!("upstream inválido: {u}"))?;

        if let Ok(ip) = host.parse::<IpAddr>() {
            endpoints.push(SocketAddr::new(ip, port));
            continue;
        }

        if resolver.is_none() {
            resolver = Some(
                TokioResolver::builder_tokio()
                    .context("no pude crear resolver del sistema")?
                    .build(),
            );
        }
        let Some(r) = &resolver else {
            continue;
        };
        let ips = r
            .lookup_ip(host)
            .await
            .with_context(|| format!("no pude resolver upstream {host}"))?;
        endpoints.extend(ips.iter().map(|ip| SocketAddr::new(ip, port)));
    }

    anyhow::ensure!(!endpoints.is_empty(), "no hay upstreams configurados");
    Ok(endpoints)
}

fn split_host_port(s: &str) -> anyhow::Result<(&str, u16)> {
    let s = s.trim();
    if let Ok(addr) = s.parse::<SocketAddr>() {
        // "[::1]:53" o "1.1.1.1:53"; el host vuelve a parsear como IP
        let host = s
            .rsplit_once(':')
            .map(|(h, _)| h.trim_start_matches('[').trim_end_matches(']'))
            .unwrap_or(s);
        return Ok((host, addr.port()));
    }
    if s.parse::<IpAddr>().is_ok() {
        return Ok((s, DNS_PORT));
    }
    match s.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => Ok((host, port.parse()?)),
        _ => Ok((s, DNS_PORT)),
    }
}
