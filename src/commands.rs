// ===============================
// src/commands.rs
// ===============================
//
// Operator commands:
//   /prices amount pair          indicative BUY/SELL average for that size
//   /buy    amount pair [price]  manual buy intent
//   /sell   amount pair [price]  manual sell intent
//
// Parsing is pure and total: bad input becomes a CommandError before anything
// touches the venue or the command queue. Manual intents join the same queue
// the aggregator feeds, so the trader tracks them like any other order.
//
use std::sync::Arc;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::mpsc,
};
use tracing::{info, warn};

use crate::config::normalize_symbol;
use crate::domain::{Event, IntentOrigin, OrderIntent, Side};
use crate::error::CommandError;
use crate::exchange::ExchangeClient;
use crate::notify::{Notifier, OrderRecord};
use crate::recorder::Journal;

const PRICES_USAGE: &str = "/prices amount pair";
const BUY_USAGE: &str = "/buy amount pair [price]";
const SELL_USAGE: &str = "/sell amount pair [price]";

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Prices { amount: f64, symbol: String },
    Order { side: Side, amount: f64, symbol: String, price: Option<f64> },
}

fn positive(raw: &str) -> Option<f64> {
    raw.parse::<f64>().ok().filter(|v| v.is_finite() && *v > 0.0)
}

impl Command {
    pub fn parse(text: &str, known_symbols: &[String]) -> Result<Self, CommandError> {
        let words: Vec<&str> = text.split_whitespace().collect();
        let Some((&head, args)) = words.split_first() else {
            return Err(CommandError::UnknownCommand(String::new()));
        };
        // "/buy@SomeBot" style suffixes are accepted
        let name = head.split('@').next().unwrap_or(head).to_ascii_lowercase();

        let (usage, side) = match name.as_str() {
            "/prices" => (PRICES_USAGE, None),
            "/buy" => (BUY_USAGE, Some(Side::Buy)),
            "/sell" => (SELL_USAGE, Some(Side::Sell)),
            _ => return Err(CommandError::UnknownCommand(head.to_string())),
        };

        let max_args = if side.is_some() { 3 } else { 2 };
        if args.len() < 2 || args.len() > max_args {
            return Err(CommandError::Usage(usage));
        }
        let amount = positive(args[0]).ok_or_else(|| CommandError::BadAmount(args[0].to_string()))?;
        let symbol = normalize_symbol(args[1]);
        if !known_symbols.iter().any(|s| *s == symbol) {
            return Err(CommandError::UnknownSymbol(symbol));
        }

        match side {
            None => Ok(Command::Prices { amount, symbol }),
            Some(side) => {
                let price = match args.get(2) {
                    Some(raw) => Some(positive(raw).ok_or_else(|| CommandError::BadPrice(raw.to_string()))?),
                    None => None,
                };
                Ok(Command::Order { side, amount, symbol, price })
            }
        }
    }
}

pub struct CommandDesk {
    ex: Arc<ExchangeClient>,
    cmd_tx: mpsc::Sender<OrderIntent>,
    known_symbols: Vec<String>,
    notifier: Arc<dyn Notifier>,
    journal: Journal,
}

impl CommandDesk {
    pub fn new(
        ex: Arc<ExchangeClient>,
        cmd_tx: mpsc::Sender<OrderIntent>,
        known_symbols: Vec<String>,
        notifier: Arc<dyn Notifier>,
        journal: Journal,
    ) -> Self {
        Self { ex, cmd_tx, known_symbols, notifier, journal }
    }

    pub fn parse(&self, text: &str) -> Result<Command, CommandError> { Command::parse(text, &self.known_symbols) }

    pub async fn execute(&self, cmd: Command) -> Result<String, CommandError> {
        match cmd {
            Command::Prices { amount, symbol } => {
                let buy = self.ex.estimate_execution_price(Side::Buy, &symbol, amount).await?.average(amount);
                let sell = self.ex.estimate_execution_price(Side::Sell, &symbol, amount).await?.average(amount);
                Ok(format!("Market prices ({amount:.4} {symbol}):\nBUY: {buy:.8}\nSELL: {sell:.8}"))
            }
            Command::Order { side, amount, symbol, price } => {
                let price = match price {
                    Some(p) => p,
                    None => self.ex.estimate_execution_price(side, &symbol, amount).await?.end_price,
                };
                let intent = OrderIntent {
                    side,
                    symbol,
                    amount,
                    price,
                    ts_ms: self.ex.now_millis(),
                    origin: IntentOrigin::Manual,
                };
                self.cmd_tx.send(intent.clone()).await.map_err(|_| CommandError::QueueClosed)?;

                let rec = OrderRecord::from(&intent);
                self.notifier.order("Manual order", &rec);
                self.journal.record(Event::Intent(intent));
                Ok(rec.console_line("Manual order"))
            }
        }
    }

    pub async fn handle_line(&self, line: &str) -> Result<String, CommandError> {
        let cmd = self.parse(line)?;
        self.execute(cmd).await
    }
}

/// Reads one command per stdin line until EOF.
pub async fn run_console(desk: CommandDesk) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    info!("console ready: {PRICES_USAGE} | {BUY_USAGE} | {SELL_USAGE}");
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => continue,
            Ok(Some(line)) => match desk.handle_line(line.trim()).await {
                Ok(reply) => info!("{reply}"),
                Err(e) => warn!(error = %e, "command refused"),
            },
            Ok(None) => {
                info!("console: stdin closed");
                return;
            }
            Err(e) => {
                warn!(?e, "console: read failed");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::testing::CapturingNotifier;
    use crate::venue::{MockVenue, Op};
    use std::time::Duration;

    fn known() -> Vec<String> { vec!["KRB/UAH".into()] }

    fn desk(venue: Arc<MockVenue>) -> (CommandDesk, mpsc::Receiver<OrderIntent>) {
        let ex = Arc::new(ExchangeClient::with_retry_delay(venue, Duration::from_millis(1)));
        let (tx, rx) = mpsc::channel(4);
        let d = CommandDesk::new(ex, tx, known(), Arc::new(CapturingNotifier::default()), Journal::disabled());
        (d, rx)
    }

    #[test]
    fn parses_the_three_commands() {
        assert_eq!(
            Command::parse("/prices 1000 krb/uah", &known()).unwrap(),
            Command::Prices { amount: 1000.0, symbol: "KRB/UAH".into() }
        );
        assert_eq!(
            Command::parse("/buy 5 KRB/UAH", &known()).unwrap(),
            Command::Order { side: Side::Buy, amount: 5.0, symbol: "KRB/UAH".into(), price: None }
        );
        assert_eq!(
            Command::parse("/sell@desk_bot 5 KRB/UAH 1.25", &known()).unwrap(),
            Command::Order { side: Side::Sell, amount: 5.0, symbol: "KRB/UAH".into(), price: Some(1.25) }
        );
    }

    #[test]
    fn rejects_malformed_input() {
        let k = known();
        assert!(matches!(Command::parse("/buy", &k), Err(CommandError::Usage(_))));
        assert!(matches!(Command::parse("/prices 1 KRB/UAH 3", &k), Err(CommandError::Usage(_))));
        assert!(matches!(Command::parse("/buy ten KRB/UAH", &k), Err(CommandError::BadAmount(_))));
        assert!(matches!(Command::parse("/buy -1 KRB/UAH", &k), Err(CommandError::BadAmount(_))));
        assert!(matches!(Command::parse("/buy NaN KRB/UAH", &k), Err(CommandError::BadAmount(_))));
        assert!(matches!(Command::parse("/sell 1 KRB/UAH 0", &k), Err(CommandError::BadPrice(_))));
        assert!(matches!(Command::parse("/sell 1 BTC/UAH", &k), Err(CommandError::UnknownSymbol(_))));
        assert!(matches!(Command::parse("/moon 1 KRB/UAH", &k), Err(CommandError::UnknownCommand(_))));
        assert!(matches!(Command::parse("   ", &k), Err(CommandError::UnknownCommand(_))));
    }

    #[tokio::test]
    async fn malformed_line_never_reaches_venue_or_queue() {
        let venue = Arc::new(MockVenue::default());
        let (d, mut rx) = desk(venue.clone());
        assert!(d.handle_line("/buy 1 DOGE/UAH").await.is_err());
        assert!(rx.try_recv().is_err());
        assert_eq!(venue.calls(Op::Estimate), 0);
    }

    #[tokio::test]
    async fn manual_order_without_price_uses_end_price() {
        let venue = Arc::new(MockVenue::new(3.0));
        let (d, mut rx) = desk(venue);
        d.handle_line("/sell 7 KRB/UAH").await.unwrap();
        let intent = rx.try_recv().unwrap();
        assert_eq!((intent.side, intent.amount, intent.price), (Side::Sell, 7.0, 3.0));
        assert_eq!(intent.origin, IntentOrigin::Manual);
    }

    #[tokio::test]
    async fn manual_order_with_price_skips_estimate() {
        let venue = Arc::new(MockVenue::new(3.0));
        let (d, mut rx) = desk(venue.clone());
        d.handle_line("/buy 2 KRB/UAH 2.9").await.unwrap();
        assert_eq!(rx.try_recv().unwrap().price, 2.9);
        assert_eq!(venue.calls(Op::Estimate), 0);
    }

    #[tokio::test]
    async fn prices_reply_lists_both_sides() {
        let (d, _rx) = desk(Arc::new(MockVenue::new(1.5)));
        let reply = d.handle_line("/prices 100 KRB/UAH").await.unwrap();
        assert_eq!(reply, "Market prices (100.0000 KRB/UAH):\nBUY: 1.50000000\nSELL: 1.50000000");
    }

    #[tokio::test]
    async fn closed_queue_is_reported() {
        let (d, rx) = desk(Arc::new(MockVenue::default()));
        drop(rx);
        assert!(matches!(d.handle_line("/buy 1 KRB/UAH 1").await, Err(CommandError::QueueClosed)));
    }
}
