// ===============================
// src/main.rs
// ===============================
/*
 Quick checks while it runs:

 curl -s localhost:9898/metrics | egrep '^(stage_alive|open_orders|market_price)'
 curl -s localhost:9898/metrics | grep '^orders_total'

 Console (stdin): /prices 1000 KRB/UAH | /buy 5 KRB/UAH [price] | /sell 5 KRB/UAH [price]
*/
mod aggregator;
mod btctrade; // REST adapter (signing, endpoints) for the live venue
mod clock;
mod commands;
mod config;
mod domain;
mod error;
mod exchange; // the one locked, retrying handle every stage shares
mod latch;
mod metrics;
mod notify;
mod prices;
mod recorder;
mod stage;
mod trader;
mod venue; // Venue trait + in-process mock
mod watcher;

use futures_util::future::select_all;
use std::sync::Arc;
use tokio::{select, sync::mpsc, time::Duration};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::aggregator::SignalAggregator;
use crate::commands::CommandDesk;
use crate::config::VenueMode;
use crate::domain::{Event, OrderIntent, Trade};
use crate::exchange::ExchangeClient;
use crate::latch::BatchReadyLatch;
use crate::notify::{LogNotifier, Notifier, TelegramNotifier};
use crate::prices::MarketPricePoller;
use crate::recorder::Journal;
use crate::trader::OrderManager;
use crate::venue::{MockVenue, Venue};
use crate::watcher::FeedWatcher;

#[tokio::main]
async fn main() {
    // ---- Logging ----
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting...");

    // ---- Config ----
    let settings = match config::load() {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "bad configuration");
            std::process::exit(2);
        }
    };

    // ---- Metrics ----
    metrics::init();
    tokio::spawn(metrics::serve_metrics(settings.metrics_port));
    metrics::CONFIG_SYMBOL.with_label_values(&[&settings.watcher.symbol]).set(1);

    info!(
        venue_mode = ?settings.venue.mode,
        symbol = %settings.watcher.symbol,
        users = ?settings.watcher.target_users,
        known_symbols = ?settings.known_symbols,
        max_stage_errors = settings.stage.max_consecutive_errors,
        "startup config"
    );

    // ---- Venue + shared exchange handle ----
    let venue: Arc<dyn Venue> = match settings.venue.mode {
        // dry run: synthetic deals from the target users, orders fill halfway to expiry
        VenueMode::Mock => Arc::new(MockVenue::simulated(
            settings.watcher.target_users.clone(),
            settings.trader.max_order_age / 2,
        )),
        VenueMode::Live => match btctrade::BtcTradeVenue::new(&settings.venue) {
            Ok(v) => Arc::new(v),
            Err(e) => {
                error!(error = %e, "venue client init failed");
                std::process::exit(2);
            }
        },
    };
    let ex = Arc::new(ExchangeClient::new(venue));

    // ---- Notifier ----
    let notifier: Arc<dyn Notifier> = match (&settings.notify.telegram_token, &settings.notify.telegram_chat_id) {
        (Some(token), Some(chat)) => Arc::new(TelegramNotifier::spawn(token.clone(), chat.clone())),
        _ => Arc::new(LogNotifier),
    };

    // ---- Recorder (optional) ----
    let journal = match settings.record_file.clone() {
        Some(path) => {
            let (rec_tx, rec_rx) = mpsc::channel::<Event>(8192);
            tokio::spawn(recorder::run(rec_rx, path));
            Journal::new(rec_tx)
        }
        None => Journal::disabled(),
    };

    // ---- Queues ----
    let (trade_tx, trade_rx) = mpsc::unbounded_channel::<Trade>();
    let (cmd_tx, cmd_rx) = mpsc::channel::<OrderIntent>(settings.command_queue_cap);
    let latch = BatchReadyLatch::new();

    // ---- Stages ----
    let watcher = FeedWatcher::new(
        ex.clone(),
        settings.watcher.clone(),
        settings.stage.clone(),
        trade_tx,
        latch.clone(),
        notifier.clone(),
        journal.clone(),
    );
    let aggregator = SignalAggregator::new(
        ex.clone(),
        settings.aggregator.clone(),
        settings.stage.clone(),
        trade_rx,
        cmd_tx.clone(),
        latch,
        notifier.clone(),
        journal.clone(),
    );
    let trader = OrderManager::new(
        ex.clone(),
        settings.trader.clone(),
        settings.stage.clone(),
        cmd_rx,
        notifier.clone(),
        journal.clone(),
    );
    let poller = MarketPricePoller::new(ex.clone(), settings.poller.clone(), settings.stage.clone(), notifier.clone());

    let mut stages = vec![
        tokio::spawn(watcher.run()),
        tokio::spawn(aggregator.run()),
        tokio::spawn(trader.run()),
        tokio::spawn(poller.run()),
    ];

    // ---- Operator console ----
    let sup_journal = journal.clone();
    let desk = CommandDesk::new(ex, cmd_tx, settings.known_symbols.clone(), notifier.clone(), journal);
    tokio::spawn(commands::run_console(desk));

    info!("Ready!");
    sup_journal.record(Event::Note("started".into()));

    // ---- Supervisor ----
    let code = loop {
        select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, shutting down");
                break 0;
            }
            (res, _, rest) = select_all(stages) => {
                let what = match res {
                    Ok(stage) => {
                        error!(%stage, "stage exited");
                        format!("{stage} stopped")
                    }
                    Err(e) => {
                        error!(?e, "stage task aborted");
                        "stage task aborted".to_string()
                    }
                };
                notifier.alert(&what);
                sup_journal.record(Event::Note(what));
                stages = rest;
                if settings.halt_on_stage_exit || stages.is_empty() {
                    break 1;
                }
                warn!(remaining = stages.len(), "continuing with the remaining stages");
            }
        }
    };

    // let the notifier and journal push out their last lines
    tokio::time::sleep(Duration::from_secs(1)).await;
    // stdin reader sits on a blocking thread; exit instead of waiting for the runtime to drain
    std::process::exit(code);
}
