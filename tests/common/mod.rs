#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;

use slowdns::packet::Packet;

pub const UPSTREAM_TTL: u32 = 300;
pub const UPSTREAM_ADDR: [u8; 4] = [93, 184, 216, 34];

/// Local resolver that answers every A query with one fixed record.
pub struct FakeUpstream {
    pub addr: SocketAddr,
    pub calls: Arc<AtomicUsize>,
}

pub async fn start_fake_upstream(delay: Duration) -> anyhow::Result<FakeUpstream> {
    let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await?);
    let addr = socket.local_addr()?;
    let calls = Arc::new(AtomicUsize::new(0));

    let counter = calls.clone();
    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            let Ok((n, peer)) = socket.recv_from(&mut buf).await else {
                return;
            };
            counter.fetch_add(1, Ordering::SeqCst);
            let Some(reply) = answer(&buf[..n]) else {
                continue;
            };
            let socket = socket.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = socket.send_to(&reply, peer).await;
            });
        }
    });

    Ok(FakeUpstream { addr, calls })
}

pub fn answer(query: &[u8]) -> Option<Vec<u8>> {
    let packet = Packet::parse(query).ok()?;
    let question = packet.query().ok()?;

    let mut out = query[..2].to_vec();
    out.extend_from_slice(&[0x81, 0x80, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00]);
    out.extend_from_slice(question);
    out.extend_from_slice(&[0xc0, 0x0c, 0x00, 0x01, 0x00, 0x01]);
    out.extend_from_slice(&UPSTREAM_TTL.to_be_bytes());
    out.extend_from_slice(&[0x00, 0x04]);
    out.extend_from_slice(&UPSTREAM_ADDR);
    Some(out)
}

pub fn encode_query(id: u16, name: &str) -> Vec<u8> {
    let mut out = id.to_be_bytes().to_vec();
    out.extend_from_slice(&[0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
    for label in name.split('.') {
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.extend_from_slice(&[0x00, 0x00, 0x01, 0x00, 0x01]);
    out
}

pub async fn client() -> anyhow::Result<UdpSocket> {
    Ok(UdpSocket::bind("127.0.0.1:0").await?)
}

pub async fn recv_reply(sock: &UdpSocket, wait: Duration) -> anyhow::Result<Packet> {
    let mut buf = vec![0u8; 4096];
    let n = tokio::time::timeout(wait, sock.recv(&mut buf)).await??;
    buf.truncate(n);
    Ok(Packet::parse(buf)?)
}
