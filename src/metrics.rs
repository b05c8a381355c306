// ===============================
// src/metrics.rs
// ===============================
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, GaugeVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::convert::Infallible;
use std::net::SocketAddr;
use tracing::{error, info};

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Feed / signal --------
pub static TRADES_CLASSIFIED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("trades_classified_total", "target trades seen (label class: fresh|stale)"),
        &["class"],
    )
    .unwrap()
});

pub static TRADES_PUBLISHED: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("trades_published_total", "trades handed to the aggregator").unwrap());

pub static SIGNALS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("signals_total", "order intents emitted by the aggregator"), &["side"]).unwrap()
});

pub static WASH_SUPPRESSED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("wash_suppressed_total", "batches dropped as balanced buy/sell").unwrap()
});

// -------- Orders --------
pub static ORDERS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("orders_total", "order lifecycle events (label event)"),
        &["event"],
    )
    .unwrap()
});

pub static OPEN_ORDERS: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("open_orders", "orders currently tracked").unwrap());

// -------- Health --------
pub static STAGE_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("stage_errors_total", "failed stage cycles"), &["stage"]).unwrap()
});

pub static STAGE_ALIVE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(Opts::new("stage_alive", "1 while the stage loop runs"), &["stage"]).unwrap()
});

pub static VENUE_RETRIES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("venue_retries_total", "venue calls retried after network errors"),
        &["op"],
    )
    .unwrap()
});

// -------- Market --------
pub static MARKET_PRICE: Lazy<GaugeVec> = Lazy::new(|| {
    GaugeVec::new(Opts::new("market_price", "indicative average execution price"), &["side"]).unwrap()
});

// ---- Config visibility ----
pub static CONFIG_SYMBOL: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(Opts::new("config_symbol", "configured pair (label: symbol)"), &["symbol"]).unwrap()
});

pub fn init() {
    for m in [
        REGISTRY.register(Box::new(TRADES_CLASSIFIED.clone())),
        REGISTRY.register(Box::new(TRADES_PUBLISHED.clone())),
        REGISTRY.register(Box::new(SIGNALS.clone())),
        REGISTRY.register(Box::new(WASH_SUPPRESSED.clone())),
        REGISTRY.register(Box::new(ORDERS.clone())),
        REGISTRY.register(Box::new(OPEN_ORDERS.clone())),
        REGISTRY.register(Box::new(STAGE_ERRORS.clone())),
        REGISTRY.register(Box::new(STAGE_ALIVE.clone())),
        REGISTRY.register(Box::new(VENUE_RETRIES.clone())),
        REGISTRY.register(Box::new(MARKET_PRICE.clone())),
        REGISTRY.register(Box::new(CONFIG_SYMBOL.clone())),
    ] {
        if let Err(e) = m {
            error!(?e, "metric registration failed");
        }
    }
}

// Encode all metrics in Prometheus text format
fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

// Every path answers with the exposition (GET / and /metrics both work)
async fn handle(_req: Request<Body>) -> Result<Response<Body>, Infallible> {
    let rsp = Response::builder()
        .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
        .body(Body::from(encode_metrics()))
        .unwrap_or_else(|_| Response::new(Body::from("# encode error\n")));
    Ok(rsp)
}

pub async fn serve_metrics(port: u16) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let make_svc = make_service_fn(|_conn| async { Ok::<_, Infallible>(service_fn(handle)) });
    match Server::try_bind(&addr) {
        Ok(builder) => {
            info!(%addr, "metrics listening (/ and /metrics)");
            if let Err(e) = builder.serve(make_svc).await {
                error!(?e, "metrics server stopped");
            }
        }
        Err(e) => error!(?e, %addr, "metrics bind failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exposition_contains_registered_series() {
        init();
        TRADES_PUBLISHED.inc();
        let text = String::from_utf8(encode_metrics()).unwrap();
        assert!(text.contains("trades_published_total"));
    }
}
