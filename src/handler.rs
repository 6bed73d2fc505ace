use crate::{
    blocklist::Blocklist,
    cache::ResponseCache,
    clock::{Clock, SystemClock},
    config::AppConfig,
    delay::DelayManager,
    forwarder::{Upstream, UpstreamError},
    observer::{BlockLevel, DropReason, Observer},
    packet::{Packet, PacketError, HEADER_LEN, MARKER_BIT, MAX_DNS_PACKET_SIZE},
    pool::BufferPool,
};

use anyhow::Context;
use dashmap::DashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::UdpSocket;

const IDLE_BUFFERS: usize = 256;

#[derive(Debug, Error)]
pub enum ServeError {
    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error("respuesta del upstream demasiado corta: {0} bytes")]
    ShortReply(usize),

    #[error("no pude armar la respuesta falsa")]
    Spoof(#[from] PacketError),

    #[error("no pude responder a {peer}")]
    Relay {
        peer: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// Everything a request task needs, built once at startup.
pub struct DnsHandler {
    soft: Blocklist,
    hard: Blocklist,
    throttled: Vec<String>,
    delays: DelayManager,
    cache: Option<ResponseCache>,
    upstream: Arc<dyn Upstream>,
    observer: Arc<dyn Observer>,
    in_flight: DashSet<u16>,
    pool: Arc<BufferPool>,
    slow_ttl: u32,
}

impl DnsHandler {
    pub fn new(
        cfg: &AppConfig,
        soft: Blocklist,
        hard: Blocklist,
        upstream: Arc<dyn Upstream>,
        observer: Arc<dyn Observer>,
    ) -> Self {
        Self::with_clock(cfg, soft, hard, upstream, observer, Arc::new(SystemClock))
    }

    pub fn with_clock(
        cfg: &AppConfig,
        soft: Blocklist,
        hard: Blocklist,
        upstream: Arc<dyn Upstream>,
        observer: Arc<dyn Observer>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let cache = cfg
            .cache
            .enabled
            .then(|| ResponseCache::new(Arc::clone(&clock)));

        Self {
            soft,
            hard,
            throttled: cfg.throttle.substrings.clone(),
            delays: DelayManager::new(cfg.throttle.window(), cfg.throttle.grace(), clock),
            cache,
            upstream,
            observer,
            in_flight: DashSet::new(),
            pool: BufferPool::new(MAX_DNS_PACKET_SIZE, IDLE_BUFFERS),
            slow_ttl: cfg.throttle.slow_ttl,
        }
    }

    pub async fn serve(self, addr: SocketAddr) -> anyhow::Result<()> {
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("no pude escuchar en {addr}"))?;
        tracing::info!("Escuchando UDP {}", socket.local_addr()?);

        Arc::new(self).serve_socket(socket).await
    }

    /// Receive loop. Each datagram is handed to its own task together with
    /// the buffer it was read into; the loop never waits on a request.
    pub async fn serve_socket(self: Arc<Self>, socket: UdpSocket) -> anyhow::Result<()> {
        let socket = Arc::new(socket);

        let mut backoff = RecvBackoff::default();

        loop {
            let mut buf = self.pool.get();
            let (n, peer) = match socket.recv_from(buf.spare_mut()).await {
                Ok(r) => r,
                Err(e) => {
                    let pause = backoff.next_pause();
                    tracing::warn!(?pause, "fallo al leer del socket: {e}");
                    tokio::time::sleep(pause).await;
                    continue;
                }
            };
            let received = Instant::now();
            backoff.reset();
            buf.set_filled(n);

            let handler = Arc::clone(&self);
            let socket = Arc::clone(&socket);
            tokio::spawn(async move {
                handler.handle(&socket, buf, peer, received).await;
            });
        }
    }

    /// `received` is when the datagram left the socket; the request latency
    /// is measured from there.
    async fn handle<B>(&self, socket: &UdpSocket, buf: B, peer: SocketAddr, received: Instant)
    where
        B: AsRef<[u8]> + Sync,
    {
        let packet = match Packet::parse(buf) {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!(%peer, "ignorando paquete: {e}");
                self.observer.dropped(DropReason::Malformed);
                return;
            }
        };

        let id = packet.id();
        let Some(_in_flight) = InFlight::acquire(&self.in_flight, id) else {
            tracing::debug!(%peer, id, "consulta repetida en curso, descartada");
            self.observer.dropped(DropReason::Duplicate);
            return;
        };

        let name = packet.domain();
        let level = self.classify(name);

        let started = Instant::now();
        let result = match level {
            BlockLevel::None => self.proxy(socket, &packet, peer, None).await,
            BlockLevel::Soft => self.slow_proxy(socket, &packet, peer).await,
            BlockLevel::Hard => self.mitm(socket, &packet, peer).await,
        };
        let overhead = started.elapsed();

        let is_error = result.is_err();
        match result {
            Ok(()) => tracing::debug!(%peer, id, domain = name, %level, "respondida"),
            Err(e) => {
                let e = anyhow::Error::from(e);
                tracing::warn!(%peer, id, domain = name, %level, "no pude servir: {e:#}");
            }
        }

        self.observer.overhead_latency(level, is_error, overhead);
        self.observer.request_latency(level, is_error, received.elapsed());
    }

    /// Hard list wins over soft; the throttled substrings only ever soften.
    pub fn classify(&self, name: &str) -> BlockLevel {
        if self.hard.blocked(name) {
            BlockLevel::Hard
        } else if self.soft.blocked(name) || self.throttled.iter().any(|s| name.contains(s.as_str()))
        {
            BlockLevel::Soft
        } else {
            BlockLevel::None
        }
    }

    async fn proxy<B>(
        &self,
        socket: &UdpSocket,
        query: &Packet<B>,
        peer: SocketAddr,
        rewrite_ttl: Option<u32>,
    ) -> Result<(), ServeError>
    where
        B: AsRef<[u8]> + Sync,
    {
        // el camino lento nunca sale de caché: saltaría la espera
        let cache = self.cache.as_ref().filter(|_| rewrite_ttl.is_none());

        if let Some(mut hit) = cache.and_then(|c| c.fetch(query)) {
            hit.set_id(query.id());
            return relay(socket, hit.raw(), peer).await;
        }

        let mut reply = self.upstream.exchange(query.raw()).await?;
        if reply.len() < HEADER_LEN {
            return Err(ServeError::ShortReply(reply.len()));
        }

        // Bit Z: marca las respuestas que pasaron por el proxy.
        reply[3] ^= MARKER_BIT;

        if let Some(ttl) = rewrite_ttl {
            match Packet::parse(&mut reply[..]) {
                Ok(mut p) => p.set_ttl(ttl),
                Err(e) => tracing::warn!(%peer, "respuesta del upstream inválida: {e}"),
            }
        }

        if let Some(cache) = cache {
            if let Ok(p) = Packet::parse(&reply[..]) {
                cache.store_reply(query, &p);
            }
        }

        relay(socket, &reply, peer).await
    }

    async fn slow_proxy<B>(
        &self,
        socket: &UdpSocket,
        query: &Packet<B>,
        peer: SocketAddr,
    ) -> Result<(), ServeError>
    where
        B: AsRef<[u8]> + Sync,
    {
        let delay = self.delays.next_delay(query.domain());
        tracing::debug!(domain = query.domain(), ?delay, "retrasando consulta");
        tokio::time::sleep(delay).await;

        self.proxy(socket, query, peer, Some(self.slow_ttl)).await
    }

    async fn mitm<B>(
        &self,
        socket: &UdpSocket,
        query: &Packet<B>,
        peer: SocketAddr,
    ) -> Result<(), ServeError>
    where
        B: AsRef<[u8]> + Sync,
    {
        let address = self
            .hard
            .address_for(query.domain())
            .unwrap_or(Ipv4Addr::UNSPECIFIED);
        let reply = query.spoof(address)?;
        relay(socket, &reply, peer).await
    }

    /// Transactions currently being handled.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn soft_count(&self) -> usize {
        self.soft.len()
    }

    pub fn hard_count(&self) -> usize {
        self.hard.len()
    }
}

async fn relay(socket: &UdpSocket, bytes: &[u8], peer: SocketAddr) -> Result<(), ServeError> {
    socket
        .send_to(bytes, peer)
        .await
        .map(|_| ())
        .map_err(|source| ServeError::Relay { peer, source })
}

/// Pause after failed socket reads: doubles on each consecutive failure up
/// to a ceiling, back to the floor after a good read.
#[derive(Debug)]
struct RecvBackoff {
    current: Duration,
}

impl RecvBackoff {
    const FLOOR: Duration = Duration::from_millis(10);
    const CEILING: Duration = Duration::from_secs(1);

    fn next_pause(&mut self) -> Duration {
        let pause = self.current;
        self.current = (self.current * 2).min(Self::CEILING);
        pause
    }

    fn reset(&mut self) {
        self.current = Self::FLOOR;
    }
}

impl Default for RecvBackoff {
    fn default() -> Self {
        Self {
            current: Self::FLOOR,
        }
    }
}

/// Registration of a transaction ID in the in-flight set; released on drop,
/// whatever path the request takes out.
struct InFlight<'a> {
    set: &'a DashSet<u16>,
    id: u16,
}

impl<'a> InFlight<'a> {
    fn acquire(set: &'a DashSet<u16>, id: u16) -> Option<Self> {
        set.insert(id).then_some(Self { set, id })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.remove(&self.id);
    }
}
