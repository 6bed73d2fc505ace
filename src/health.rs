//! Self-directed liveness probe.
//!
//! Sends a `google.com A` query to a running proxy and expects a relayed
//! reply, which the proxy marks by flipping the Z bit (`0x8180` → `0x81c0`).

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;

use crate::observer::MetricsObserver;
use crate::packet::{GOOGLE_QUERY, HEADER_LEN, MAX_DNS_PACKET_SIZE};

const EXPECTED_FLAGS: u16 = 0x81c0;

#[derive(Debug, Error)]
pub enum HealthError {
    #[error("fallo de E/S con {addr}")]
    Io {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("{addr} no respondió en {timeout:?}")]
    Timeout { addr: SocketAddr, timeout: Duration },

    #[error("respuesta corta: {0} bytes")]
    ShortResponse(usize),

    #[error("flags de respuesta 0x{0:04x}, se esperaba 0x{EXPECTED_FLAGS:04x}")]
    UnexpectedFlags(u16),
}

/// Runs one check and counts its outcome in `slowdns_health_requests`.
pub async fn probe(addr: SocketAddr, timeout: Duration) -> Result<(), HealthError> {
    let result = check(addr, timeout).await;
    MetricsObserver::health_check(result.is_ok());
    result
}

async fn check(addr: SocketAddr, timeout: Duration) -> Result<(), HealthError> {
    let io = |source| HealthError::Io { addr, source };

    let mut req = GOOGLE_QUERY;
    req[0..2].copy_from_slice(&rand::random::<u16>().to_be_bytes());

    let local: SocketAddr = match addr {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = UdpSocket::bind(local).await.map_err(io)?;
    socket.connect(addr).await.map_err(io)?;

    let exchange = async {
        socket.send(&req).await.map_err(io)?;
        let mut buf = vec![0u8; MAX_DNS_PACKET_SIZE];
        let n = socket.recv(&mut buf).await.map_err(io)?;
        buf.truncate(n);
        Ok::<_, HealthError>(buf)
    };
    let reply = tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| HealthError::Timeout { addr, timeout })??;

    if reply.len() < HEADER_LEN {
        return Err(HealthError::ShortResponse(reply.len()));
    }
    let flags = u16::from_be_bytes([reply[2], reply[3]]);
    if flags != EXPECTED_FLAGS {
        return Err(HealthError::UnexpectedFlags(flags));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn one_shot_server(reply: Vec<u8>) -> SocketAddr {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (_, peer) = server.recv_from(&mut buf).await.unwrap();
            server.send_to(&reply, peer).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn marked_reply_is_healthy() {
        let mut reply = GOOGLE_QUERY.to_vec();
        reply[2] = 0x81;
        reply[3] = 0xc0;
        let addr = one_shot_server(reply).await;

        probe(addr, Duration::from_secs(2)).await.unwrap();
    }

    #[tokio::test]
    async fn unmarked_reply_is_unhealthy() {
        let mut reply = GOOGLE_QUERY.to_vec();
        reply[2] = 0x81;
        reply[3] = 0x80;
        let addr = one_shot_server(reply).await;

        let err = probe(addr, Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(err, HealthError::UnexpectedFlags(0x8180)));
    }

    #[tokio::test]
    async fn short_reply_is_unhealthy() {
        let addr = one_shot_server(vec![0x81, 0xc0]).await;
        let err = probe(addr, Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(err, HealthError::ShortResponse(2)));
    }
}
