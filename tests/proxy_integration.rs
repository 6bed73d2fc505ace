mod common;

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tokio::net::UdpSocket;

use slowdns::{
    blocklist::Blocklist,
    config::AppConfig,
    forwarder::UdpUpstream,
    handler::DnsHandler,
    health,
    observer::{BlockLevel, Observer},
};

use common::{client, encode_query, recv_reply, start_fake_upstream, UPSTREAM_TTL};

#[derive(Default)]
struct Recorder(Mutex<Vec<(BlockLevel, bool)>>);

impl Observer for Recorder {
    fn request_latency(&self, level: BlockLevel, is_error: bool, _: Duration) {
        if let Ok(mut seen) = self.0.lock() {
            seen.push((level, is_error));
        }
    }

    fn overhead_latency(&self, _: BlockLevel, _: bool, _: Duration) {}
}

async fn start_proxy(
    cfg: &AppConfig,
    upstream: SocketAddr,
    soft: Blocklist,
    hard: Blocklist,
    observer: Arc<Recorder>,
) -> anyhow::Result<SocketAddr> {
    let upstream = UdpUpstream::new(vec![upstream], Duration::from_secs(2))?;
    let handler = DnsHandler::new(cfg, soft, hard, Arc::new(upstream), observer);

    let socket = UdpSocket::bind("127.0.0.1:0").await?;
    let addr = socket.local_addr()?;
    tokio::spawn(Arc::new(handler).serve_socket(socket));
    Ok(addr)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn plain_query_is_relayed_with_marker() -> anyhow::Result<()> {
    let upstream = start_fake_upstream(Duration::ZERO).await?;
    let proxy = start_proxy(
        &AppConfig::default(),
        upstream.addr,
        Blocklist::new(),
        Blocklist::new(),
        Arc::default(),
    )
    .await?;

    let sock = client().await?;
    sock.send_to(&encode_query(0x1234, "example.org"), proxy).await?;
    let reply = recv_reply(&sock, Duration::from_secs(2)).await?;

    assert_eq!(reply.id(), 0x1234);
    assert_eq!(reply.flags(), 0x81c0);
    assert_eq!(reply.ttl(), UPSTREAM_TTL);
    assert_eq!(reply.domain(), "example.org");
    assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn hard_blocked_name_is_spoofed_from_file() -> anyhow::Result<()> {
    let tmp = TempDir::new()?;
    let path = tmp.path().join("hard.txt");
    std::fs::write(&path, "# trackers\n10.0.0.1 blocked.test\nbare.test\n")?;
    let hard = Blocklist::load(path.to_str().unwrap()).await?;

    let upstream = start_fake_upstream(Duration::ZERO).await?;
    let proxy = start_proxy(
        &AppConfig::default(),
        upstream.addr,
        Blocklist::new(),
        hard,
        Arc::default(),
    )
    .await?;

    let sock = client().await?;

    sock.send_to(&encode_query(7, "blocked.test"), proxy).await?;
    let reply = recv_reply(&sock, Duration::from_secs(2)).await?;
    assert_eq!(reply.id(), 7);
    assert_eq!(reply.flags(), 0x81c0);
    assert_eq!(reply.ttl(), 120);
    assert_eq!(&reply.raw()[reply.raw().len() - 4..], &[10, 0, 0, 1]);

    sock.send_to(&encode_query(8, "bare.test"), proxy).await?;
    let reply = recv_reply(&sock, Duration::from_secs(2)).await?;
    assert_eq!(
        &reply.raw()[reply.raw().len() - 4..],
        &Ipv4Addr::UNSPECIFIED.octets()
    );

    assert_eq!(upstream.calls.load(Ordering::SeqCst), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn soft_blocked_name_waits_and_gets_short_ttl() -> anyhow::Result<()> {
    let mut cfg = AppConfig::default();
    cfg.throttle.window_ms = 200;
    let soft: Blocklist = [("slow.test", None)].into_iter().collect();

    let upstream = start_fake_upstream(Duration::ZERO).await?;
    let proxy = start_proxy(&cfg, upstream.addr, soft, Blocklist::new(), Arc::default()).await?;

    let sock = client().await?;
    let started = Instant::now();
    sock.send_to(&encode_query(0x0101, "slow.test"), proxy).await?;
    let reply = recv_reply(&sock, Duration::from_secs(2)).await?;

    assert!(started.elapsed() >= Duration::from_millis(200));
    assert_eq!(reply.ttl(), 5);
    assert_eq!(reply.flags(), 0x81c0);

    // la lista es exacta: un subdominio no listado pasa sin espera
    let started = Instant::now();
    sock.send_to(&encode_query(0x0102, "www.slow.test"), proxy).await?;
    let reply = recv_reply(&sock, Duration::from_secs(2)).await?;
    assert!(started.elapsed() < Duration::from_millis(200));
    assert_eq!(reply.ttl(), UPSTREAM_TTL);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn throttled_substring_shares_window_per_parent_domain() -> anyhow::Result<()> {
    let mut cfg = AppConfig::default();
    cfg.throttle.window_ms = 400;
    cfg.throttle.substrings = vec!["tarpit".to_string()];

    let upstream = start_fake_upstream(Duration::ZERO).await?;
    let proxy = start_proxy(
        &cfg,
        upstream.addr,
        Blocklist::new(),
        Blocklist::new(),
        Arc::default(),
    )
    .await?;

    let a = client().await?;
    let b = client().await?;
    let started = Instant::now();
    a.send_to(&encode_query(1, "www.tarpit.test"), proxy).await?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    b.send_to(&encode_query(2, "cdn.tarpit.test"), proxy).await?;

    recv_reply(&a, Duration::from_secs(2)).await?;
    recv_reply(&b, Duration::from_secs(2)).await?;

    // ambos se liberan al cierre de la misma ventana, no 400ms después del segundo
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(400));
    assert!(elapsed < Duration::from_millis(550));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_in_flight_datagram_gets_one_reply() -> anyhow::Result<()> {
    let upstream = start_fake_upstream(Duration::from_millis(300)).await?;
    let proxy = start_proxy(
        &AppConfig::default(),
        upstream.addr,
        Blocklist::new(),
        Blocklist::new(),
        Arc::default(),
    )
    .await?;

    let sock = client().await?;
    let query = encode_query(0x4242, "dup.test");
    sock.send_to(&query, proxy).await?;
    sock.send_to(&query, proxy).await?;

    let reply = recv_reply(&sock, Duration::from_secs(2)).await?;
    assert_eq!(reply.id(), 0x4242);
    assert!(recv_reply(&sock, Duration::from_millis(500)).await.is_err());
    assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);

    // terminada la primera, el mismo ID vuelve a atenderse
    sock.send_to(&query, proxy).await?;
    recv_reply(&sock, Duration::from_secs(2)).await?;
    assert_eq!(upstream.calls.load(Ordering::SeqCst), 2);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn health_probe_accepts_running_proxy() -> anyhow::Result<()> {
    let upstream = start_fake_upstream(Duration::ZERO).await?;
    let proxy = start_proxy(
        &AppConfig::default(),
        upstream.addr,
        Blocklist::new(),
        Blocklist::new(),
        Arc::default(),
    )
    .await?;

    health::probe(proxy, Duration::from_secs(2)).await?;

    // el upstream solo no marca la respuesta
    assert!(health::probe(upstream.addr, Duration::from_secs(2)).await.is_err());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn observations_carry_block_level_and_outcome() -> anyhow::Result<()> {
    let recorder = Arc::new(Recorder::default());
    let hard: Blocklist = [("spoof.test", None)].into_iter().collect();

    // upstream que nunca contesta: la consulta normal termina en error
    let silent = UdpSocket::bind("127.0.0.1:0").await?;
    let mut cfg = AppConfig::default();
    cfg.proxy.timeout_ms = 100;

    let upstream = UdpUpstream::new(vec![silent.local_addr()?], cfg.proxy.timeout())?;
    let handler = DnsHandler::new(
        &cfg,
        Blocklist::new(),
        hard,
        Arc::new(upstream),
        recorder.clone(),
    );
    let socket = UdpSocket::bind("127.0.0.1:0").await?;
    let proxy = socket.local_addr()?;
    tokio::spawn(Arc::new(handler).serve_socket(socket));

    let sock = client().await?;
    sock.send_to(&encode_query(1, "spoof.test"), proxy).await?;
    recv_reply(&sock, Duration::from_secs(2)).await?;
    sock.send_to(&encode_query(2, "lost.test"), proxy).await?;

    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let seen = recorder.0.lock().map(|s| s.clone()).unwrap_or_default();
        if seen.len() == 2 {
            assert!(seen.contains(&(BlockLevel::Hard, false)));
            assert!(seen.contains(&(BlockLevel::None, true)));
            break;
        }
        assert!(Instant::now() < deadline, "observaciones: {seen:?}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    drop(silent);
    Ok(())
}
