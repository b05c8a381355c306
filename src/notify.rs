// ===============================
// src/notify.rs
// ===============================
//
// Outbound alerts. Two message shapes: free text, and an order/trade record
// rendered as a fixed-width block. Senders never wait for delivery.
//
use chrono::{TimeZone, Utc};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::domain::{OrderIntent, Side, Trade};

#[derive(Debug, Clone, PartialEq)]
pub struct OrderRecord {
    pub ts_ms: i64,
    pub symbol: String,
    pub side: Side,
    pub amount: f64,
    pub price: f64,
}

impl OrderRecord {
    pub fn from_trade(t: &Trade, symbol: &str) -> Self {
        Self { ts_ms: t.ts_ms, symbol: symbol.to_string(), side: t.side, amount: t.amount, price: t.price }
    }

    fn date(&self) -> String {
        match Utc.timestamp_millis_opt(self.ts_ms).single() {
            Some(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
            None => "-".to_string(),
        }
    }

    /// `NEW order            : [DATE: ... PAIR: ... SIDE: ... AMNT: ... PRICE: ...]`
    pub fn console_line(&self, title: &str) -> String {
        format!(
            "{:20}: [DATE: {:20} PAIR: {:10} SIDE: {:5} AMNT: {:15.8} PRICE: {:15.8}]",
            clip(title, 20),
            self.date(),
            clip(&self.symbol, 10),
            self.side.as_str(),
            self.amount,
            self.price
        )
    }

    pub fn html_block(&self, title: &str) -> String {
        format!(
            "<b>{:20}:</b>\n<pre>DATE: {}\nPAIR: {}\nSIDE: {}\nAMNT: {:.8}\nPRICE: {:.8}</pre>",
            escape_html(&clip(title, 20)),
            self.date(),
            escape_html(&clip(&self.symbol, 10)),
            self.side.as_str(),
            self.amount,
            self.price
        )
    }
}

impl From<&OrderIntent> for OrderRecord {
    fn from(i: &OrderIntent) -> Self {
        Self { ts_ms: i.ts_ms, symbol: i.symbol.clone(), side: i.side, amount: i.amount, price: i.price }
    }
}

fn clip(s: &str, n: usize) -> String {
    s.chars().take(n).collect()
}

pub fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

pub trait Notifier: Send + Sync {
    fn alert(&self, text: &str);
    fn order(&self, title: &str, record: &OrderRecord);
}

/// Used when no chat channel is configured.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn alert(&self, text: &str) {
        info!(target: "notify", "{text}");
    }
    fn order(&self, title: &str, record: &OrderRecord) {
        info!(target: "notify", "{}", record.console_line(title));
    }
}

pub struct TelegramNotifier {
    tx: mpsc::UnboundedSender<String>,
}

impl TelegramNotifier {
    /// Starts the delivery task; must be called inside the runtime.
    pub fn spawn(token: String, chat_id: String) -> Self {
        let (tx, rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(deliver(rx, token, chat_id));
        Self { tx }
    }

    fn push(&self, html: String) {
        if self.tx.send(html).is_err() {
            warn!("telegram delivery task gone, message dropped");
        }
    }
}

impl Notifier for TelegramNotifier {
    fn alert(&self, text: &str) { self.push(escape_html(text)) }
    fn order(&self, title: &str, record: &OrderRecord) { self.push(record.html_block(title)) }
}

async fn deliver(mut rx: mpsc::UnboundedReceiver<String>, token: String, chat_id: String) {
    let http = reqwest::Client::new();
    let url = format!("https://api.telegram.org/bot{token}/sendMessage");
    while let Some(text) = rx.recv().await {
        let body = json!({ "chat_id": chat_id, "text": text, "parse_mode": "HTML" });
        match http.post(&url).json(&body).send().await {
            Ok(rsp) if rsp.status().is_success() => {}
            Ok(rsp) => warn!(status = %rsp.status(), "telegram sendMessage rejected"),
            Err(e) => warn!(error = %e, "telegram sendMessage failed"),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> OrderRecord {
        OrderRecord { ts_ms: 1_519_898_400_000, symbol: "KRB/UAH".into(), side: Side::Sell, amount: 30.0, price: 0.0125 }
    }

    #[test]
    fn console_line_is_fixed_width() {
        let line = record().console_line("a very long title that is clipped");
        assert_eq!(
            line,
            "a very long title th: [DATE: 2018-03-01 10:00:00  PAIR: KRB/UAH    SIDE: sell  AMNT:     30.00000000 PRICE:      0.01250000]"
        );
    }

    #[test]
    fn html_block_lists_every_field() {
        let block = record().html_block("NEW order");
        assert!(block.starts_with("<b>NEW order           :</b>\n<pre>"));
        assert!(block.contains("DATE: 2018-03-01 10:00:00\n"));
        assert!(block.contains("PAIR: KRB/UAH\nSIDE: sell\nAMNT: 30.00000000\nPRICE: 0.01250000</pre>"));
    }

    #[test]
    fn html_is_escaped() {
        assert_eq!(escape_html("a<b>&c"), "a&lt;b&gt;&amp;c");
    }
}
