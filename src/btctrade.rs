// ===============================
// src/btctrade.rs
// ===============================
//
// BTC Trade UA REST venue.
// - Public feed : GET  deals/{pair}            (carries the counterparty user name)
// - Private     : POST buy|sell/{pair}, order/status/{id}, order/remove/{pair}/{id},
//                 ask|bid/{pair} (price estimate for an amount)
// - Auth        : form body incl. out_order_id + nonce, headers `public-key`
//                 and `api-sign` = hex(sha256(body ++ secret))
//
use async_trait::async_trait;
use chrono::DateTime;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::config::VenueCfg;
use crate::domain::{OrderAck, OrderStatus, PriceEstimate, Side, Trade};
use crate::error::VenueError;
use crate::venue::Venue;

pub fn sign_body(secret: &str, body: &str) -> String {
    let mut h = Sha256::new();
    h.update(body.as_bytes());
    h.update(secret.as_bytes());
    hex::encode(h.finalize())
}

/// "KRB/UAH" -> "krb_uah"
pub fn pair_path(symbol: &str) -> String {
    symbol.trim().replace('/', "_").to_ascii_lowercase()
}

fn split_pair(symbol: &str) -> Result<(String, String), VenueError> {
    match symbol.trim().split_once('/') {
        Some((b, q)) if !b.is_empty() && !q.is_empty() => Ok((b.to_ascii_uppercase(), q.to_ascii_uppercase())),
        _ => Err(VenueError::Malformed(format!("pair {symbol:?} is not BASE/QUOTE"))),
    }
}

fn encode_form(params: &[(&str, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

// ---- field helpers: the venue sends numbers both as JSON numbers and strings ----
fn num(v: &Value, key: &str) -> Result<f64, VenueError> {
    let f = match v.get(key) {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    f.ok_or_else(|| VenueError::Malformed(format!("field {key:?} missing or not numeric")))
}

fn text(v: &Value, key: &str) -> Result<String, VenueError> {
    match v.get(key) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(VenueError::Malformed(format!("field {key:?} missing"))),
    }
}

fn message(v: &Value) -> String {
    ["description", "msg", "error"]
        .iter()
        .find_map(|k| v.get(*k).and_then(|x| x.as_str()))
        .unwrap_or("no reason given")
        .to_string()
}

/// `unixtime` (seconds) when present. `pub_date` is venue-local wall time
/// unless it spells out its offset, so only an offset-bearing one is used.
fn deal_ts_ms(row: &Value) -> Result<i64, VenueError> {
    if row.get("unixtime").is_some() {
        let secs = num(row, "unixtime")?;
        return Ok((secs * 1000.0).round() as i64);
    }
    let raw = text(row, "pub_date")?;
    if let Ok(dt) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(dt.timestamp_millis());
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f%z", "%Y-%m-%dT%H:%M:%S%.f%z"] {
        if let Ok(dt) = DateTime::parse_from_str(&raw, fmt) {
            return Ok(dt.timestamp_millis());
        }
    }
    Err(VenueError::Malformed(format!("no unixtime and pub_date {raw:?} has no offset")))
}

pub fn parse_deal(row: &Value) -> Result<Trade, VenueError> {
    let side = match text(row, "type")?.to_ascii_lowercase().as_str() {
        "buy" => Side::Buy,
        "sell" => Side::Sell,
        other => return Err(VenueError::Malformed(format!("deal side {other:?}"))),
    };
    Ok(Trade {
        id: text(row, "id")?,
        ts_ms: deal_ts_ms(row)?,
        side,
        amount: num(row, "amnt_trade")?,
        price: num(row, "price")?,
        user: text(row, "user")?,
    })
}

/// Bad rows are skipped; only a feed with no usable row at all is an error.
pub fn parse_deals(rows: &[Value]) -> Result<Vec<Trade>, VenueError> {
    let mut trades = Vec::with_capacity(rows.len());
    let mut first_err = None;
    for row in rows {
        match parse_deal(row) {
            Ok(t) => trades.push(t),
            Err(e) => {
                warn!(error = %e, deal_id = ?row.get("id"), "skipping deal row");
                first_err.get_or_insert(e);
            }
        }
    }
    match first_err {
        Some(e) if trades.is_empty() => Err(e),
        _ => Ok(trades),
    }
}

pub fn parse_status(v: &Value) -> Result<OrderStatus, VenueError> {
    Ok(match text(v, "status")?.to_ascii_lowercase().as_str() {
        "processing" => OrderStatus::Open,
        "processed" => OrderStatus::Filled,
        "canceled" | "cancelled" => OrderStatus::Cancelled,
        other => OrderStatus::Other(other.to_string()),
    })
}

fn status_flag(v: &Value) -> bool {
    v.get("status").and_then(|s| s.as_bool()).unwrap_or(false)
}

pub struct BtcTradeVenue {
    http: reqwest::Client,
    base: Url,
    api_key: String,
    api_secret: String,
    last_nonce: AtomicI64,
}

impl BtcTradeVenue {
    pub fn new(cfg: &VenueCfg) -> Result<Self, VenueError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| VenueError::Network(e.to_string()))?;
        let mut base = cfg.rest_url.clone();
        if !base.path().ends_with('/') {
            let p = format!("{}/", base.path());
            base.set_path(&p);
        }
        Ok(Self {
            http,
            base,
            api_key: cfg.api_key.clone(),
            api_secret: cfg.api_secret.clone(),
            last_nonce: AtomicI64::new(0),
        })
    }

    /// Strictly increasing millisecond nonce.
    fn nonce(&self) -> i64 {
        let now = self.now_millis();
        let prev = self
            .last_nonce
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| Some(now.max(last + 1)))
            .unwrap_or(now);
        now.max(prev + 1)
    }

    fn url(&self, path: &str) -> Result<Url, VenueError> {
        self.base.join(path).map_err(|e| VenueError::Malformed(format!("bad path {path:?}: {e}")))
    }

    async fn read(rsp: reqwest::Response) -> Result<Value, VenueError> {
        let status = rsp.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(VenueError::Network(format!("http {status}")));
        }
        if !status.is_success() {
            let body = rsp.text().await.unwrap_or_default();
            return Err(VenueError::Http { status: status.as_u16(), body });
        }
        let body = rsp.text().await?;
        Ok(serde_json::from_str::<Value>(&body)?)
    }

    async fn public_get(&self, path: &str) -> Result<Value, VenueError> {
        let rsp = self.http.get(self.url(path)?).send().await?;
        Self::read(rsp).await
    }

    async fn private_post(&self, path: &str, params: Vec<(&str, String)>) -> Result<Value, VenueError> {
        let nonce = self.nonce().to_string();
        let mut all = vec![("out_order_id", nonce.clone()), ("nonce", nonce)];
        all.extend(params);
        let body = encode_form(&all);
        let sig = sign_body(&self.api_secret, &body);
        debug!(%path, "venue private call");

        let rsp = self
            .http
            .post(self.url(path)?)
            .header("public-key", &self.api_key)
            .header("api-sign", sig)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await?;
        Self::read(rsp).await
    }
}

#[async_trait]
impl Venue for BtcTradeVenue {
    async fn submit_order(&self, side: Side, symbol: &str, amount: f64, price: f64) -> Result<OrderAck, VenueError> {
        let (base, quote) = split_pair(symbol)?;
        let path = format!("{}/{}", side.as_str(), pair_path(symbol));
        let v = self
            .private_post(
                &path,
                vec![
                    ("count", format!("{amount}")),
                    ("price", format!("{price}")),
                    ("currency1", quote),
                    ("currency", base),
                ],
            )
            .await?;
        if !status_flag(&v) {
            return Ok(OrderAck { accepted: false, order_id: None, message: Some(message(&v)) });
        }
        Ok(OrderAck { accepted: true, order_id: Some(text(&v, "order_id")?), message: None })
    }

    async fn query_order(&self, order_id: &str) -> Result<OrderStatus, VenueError> {
        let v = self.private_post(&format!("order/status/{order_id}"), Vec::new()).await?;
        parse_status(&v)
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<OrderStatus, VenueError> {
        let v = self
            .private_post(&format!("order/remove/{}/{}", pair_path(symbol), order_id), Vec::new())
            .await?;
        if status_flag(&v) {
            Ok(OrderStatus::Cancelled)
        } else {
            Err(VenueError::Rejected(message(&v)))
        }
    }

    async fn fetch_recent_trades(&self, symbol: &str) -> Result<Vec<Trade>, VenueError> {
        let v = self.public_get(&format!("deals/{}", pair_path(symbol))).await?;
        let rows = v
            .as_array()
            .ok_or_else(|| VenueError::Malformed("deals: expected an array".into()))?;
        parse_deals(rows)
    }

    async fn estimate_price(&self, side: Side, symbol: &str, amount: f64) -> Result<PriceEstimate, VenueError> {
        // buying walks the asks, selling walks the bids
        let (book, total_key) = match side {
            Side::Buy => ("ask", "got_sum"),
            Side::Sell => ("bid", "cost_sum"),
        };
        let v = self
            .private_post(&format!("{}/{}", book, pair_path(symbol)), vec![("amount", format!("{amount}"))])
            .await?;
        Ok(PriceEstimate { end_price: num(&v, "end_price")?, total: num(&v, total_key)? })
    }
}
