//! Metrics and tracing setup for keyspace.
//!
//! Provides a global [`NodeMetrics`] singleton backed by the `prometheus`
//! crate, plus a lightweight HTTP server for Prometheus scraping.

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::OnceLock;

// ────────────────────────── Tracing ──────────────────────────

/// Initialize the tracing subscriber with env-filter; `fallback` is used
/// when `RUST_LOG` is unset (the node passes its `--log-level` flag).
pub fn init_tracing(fallback: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(fallback)),
        )
        .init();
}

// ────────────────────────── Prometheus metrics ──────────────────────────

static METRICS: OnceLock<NodeMetrics> = OnceLock::new();

/// Retrieve (or lazily create) the global metrics singleton.
pub fn metrics() -> &'static NodeMetrics {
    METRICS.get_or_init(NodeMetrics::new)
}

/// All Prometheus metrics for a keyspace node.
pub struct NodeMetrics {
    pub registry: Registry,

    // ── Client operations ──
    pub kv_puts: IntCounter,
    pub kv_gets: IntCounter,
    pub kv_deletes: IntCounter,

    // ── Peer RPCs ──
    pub rpcs_sent: IntCounterVec,
    pub rpcs_received: IntCounter,

    // ── Replication ──
    pub read_repairs: IntCounter,
    pub quorum_failures: IntCounter,

    // ── Membership ──
    pub gossip_rounds: IntCounter,
    pub peers_alive: IntGauge,
}

// Manual Debug impl because prometheus types don't derive Debug.
impl std::fmt::Debug for NodeMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeMetrics").finish_non_exhaustive()
    }
}

impl NodeMetrics {
    fn new() -> Self {
        let registry = Registry::new();

        let kv_puts = IntCounter::with_opts(Opts::new("keyspace_kv_puts_total", "Client PUTs"))
            .expect("kv_puts counter");
        let kv_gets = IntCounter::with_opts(Opts::new("keyspace_kv_gets_total", "Client GETs"))
            .expect("kv_gets counter");
        let kv_deletes =
            IntCounter::with_opts(Opts::new("keyspace_kv_deletes_total", "Client DELETEs"))
                .expect("kv_deletes counter");

        let rpcs_sent = IntCounterVec::new(
            Opts::new("keyspace_rpcs_sent_total", "Outbound peer RPCs, by op"),
            &["op"],
        )
        .expect("rpcs_sent counter vec");
        let rpcs_received = IntCounter::with_opts(Opts::new(
            "keyspace_rpcs_received_total",
            "Inbound peer RPCs",
        ))
        .expect("rpcs_received counter");

        let read_repairs = IntCounter::with_opts(Opts::new(
            "keyspace_read_repairs_total",
            "Read repair passes triggered",
        ))
        .expect("read_repairs counter");
        let quorum_failures = IntCounter::with_opts(Opts::new(
            "keyspace_quorum_failures_total",
            "Operations that missed their quorum",
        ))
        .expect("quorum_failures counter");

        let gossip_rounds = IntCounter::with_opts(Opts::new(
            "keyspace_gossip_rounds_total",
            "Gossip rounds completed",
        ))
        .expect("gossip_rounds counter");
        let peers_alive = IntGauge::with_opts(Opts::new(
            "keyspace_peers_alive",
            "Members currently considered alive",
        ))
        .expect("peers_alive gauge");

        registry
            .register(Box::new(kv_puts.clone()))
            .expect("register kv_puts");
        registry
            .register(Box::new(kv_gets.clone()))
            .expect("register kv_gets");
        registry
            .register(Box::new(kv_deletes.clone()))
            .expect("register kv_deletes");
        registry
            .register(Box::new(rpcs_sent.clone()))
            .expect("register rpcs_sent");
        registry
            .register(Box::new(rpcs_received.clone()))
            .expect("register rpcs_received");
        registry
            .register(Box::new(read_repairs.clone()))
            .expect("register read_repairs");
        registry
            .register(Box::new(quorum_failures.clone()))
            .expect("register quorum_failures");
        registry
            .register(Box::new(gossip_rounds.clone()))
            .expect("register gossip_rounds");
        registry
            .register(Box::new(peers_alive.clone()))
            .expect("register peers_alive");

        Self {
            registry,
            kv_puts,
            kv_gets,
            kv_deletes,
            rpcs_sent,
            rpcs_received,
            read_repairs,
            quorum_failures,
            gossip_rounds,
            peers_alive,
        }
    }
}

/// Encode all registered metrics in Prometheus text exposition format.
pub fn encode_metrics() -> String {
    let m = metrics();
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    encoder
        .encode(&m.registry.gather(), &mut buf)
        .expect("prometheus text encoding");
    String::from_utf8(buf).expect("prometheus output is valid UTF-8")
}

// ────────────────────────── Metrics HTTP server ──────────────────────────

use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

async fn metrics_handler(
    _req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, std::convert::Infallible> {
    let body = encode_metrics();
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
        .body(Full::new(Bytes::from(body)))
        .expect("valid HTTP response"))
}

/// Serve Prometheus metrics on the given address (`GET /metrics`).
///
/// Spawns a lightweight HTTP/1.1 server; call from a `tokio::spawn`.
pub async fn serve_metrics(
    addr: SocketAddr,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("metrics server listening on http://{}/metrics", addr);

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(metrics_handler))
                .await
            {
                tracing::debug!("metrics connection error: {}", e);
            }
        });
    }
}

// ────────────────────────── Tests ──────────────────────────
