// ===============================
// src/config.rs
// ===============================
//
// All settings come from the environment (after `.env` is read). Each component
// gets its own typed struct; everything is validated once here, before any task starts.
//
use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

use crate::error::ConfigError;

/// Which venue implementation backs the exchange client
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VenueMode {
    Mock,
    Live,
}

impl VenueMode {
    fn parse(raw: Option<String>) -> Result<VenueMode, ConfigError> {
        match raw.unwrap_or_default().trim().to_ascii_lowercase().as_str() {
            "" | "live" => Ok(VenueMode::Live),
            "mock" => Ok(VenueMode::Mock),
            other => Err(ConfigError::Invalid { key: "VENUE_MODE", reason: format!("unknown mode {other:?}") }),
        }
    }
}

#[derive(Clone, Debug)]
pub struct VenueCfg {
    pub mode: VenueMode,
    pub rest_url: Url,
    pub api_key: String,
    pub api_secret: String,
}

#[derive(Clone, Debug)]
pub struct WatcherCfg {
    pub symbol: String,
    pub target_users: Vec<String>,
    pub min_trade_amount: f64,
    pub max_trade_age: Duration,
    pub poll_period: Duration,
    pub seen_retention: Duration,
}

#[derive(Clone, Debug)]
pub struct AggregatorCfg {
    pub symbol: String,
    pub order_amount_mult: f64,
    pub buy_price_mult: f64,
    pub sell_price_mult: f64,
    pub wash_threshold: f64,
}

#[derive(Clone, Debug)]
pub struct TraderCfg {
    pub max_order_age: Duration,
    pub command_wait: Duration,
}

#[derive(Clone, Debug)]
pub struct PollerCfg {
    pub symbol: String,
    pub notional: f64,
    pub period: Duration,
}

/// Failure policy shared by every stage loop
#[derive(Clone, Debug)]
pub struct StageCfg {
    pub max_consecutive_errors: u32,
    pub backoff_base: Duration,
}

impl Default for StageCfg {
    fn default() -> Self {
        Self { max_consecutive_errors: 10, backoff_base: Duration::from_millis(1000) }
    }
}

#[derive(Clone, Debug, Default)]
pub struct NotifyCfg {
    pub telegram_token: Option<String>,
    pub telegram_chat_id: Option<String>,
}

#[derive(Clone, Debug)]
pub struct Settings {
    pub venue: VenueCfg,
    pub watcher: WatcherCfg,
    pub aggregator: AggregatorCfg,
    pub trader: TraderCfg,
    pub poller: PollerCfg,
    pub stage: StageCfg,
    pub notify: NotifyCfg,
    pub known_symbols: Vec<String>,
    pub command_queue_cap: usize,
    pub record_file: Option<String>,
    pub metrics_port: u16,
    pub halt_on_stage_exit: bool,
}

pub fn load() -> Result<Settings, ConfigError> {
    // Make sure .env is read (TARGET_PAIR, VENUE_API_KEY, ...)
    let _ = dotenv();
    from_lookup(|key| env::var(key).ok())
}

/// Builds settings from any key lookup (the process env in production).
pub fn from_lookup<F>(get: F) -> Result<Settings, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| get(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

    // ===== Venue =====
    let mode = VenueMode::parse(get("VENUE_MODE"))?;
    let rest_raw = get("VENUE_REST_URL").unwrap_or_else(|| "https://btc-trade.com.ua/api/".to_string());
    let rest_url = Url::parse(&rest_raw)
        .map_err(|e| ConfigError::Invalid { key: "VENUE_REST_URL", reason: e.to_string() })?;
    let (api_key, api_secret) = match mode {
        VenueMode::Live => (
            get("VENUE_API_KEY").ok_or(ConfigError::Missing("VENUE_API_KEY"))?,
            get("VENUE_API_SECRET").ok_or(ConfigError::Missing("VENUE_API_SECRET"))?,
        ),
        VenueMode::Mock => (
            get("VENUE_API_KEY").unwrap_or_default(),
            get("VENUE_API_SECRET").unwrap_or_default(),
        ),
    };

    // ===== Pipeline =====
    let symbol = normalize_symbol(&get("TARGET_PAIR").ok_or(ConfigError::Missing("TARGET_PAIR"))?);
    let target_users: Vec<String> = get("TARGET_USERS")
        .map(|s| s.split(',').map(|u| u.trim().to_string()).filter(|u| !u.is_empty()).collect())
        .unwrap_or_default();
    if target_users.is_empty() {
        return Err(ConfigError::Missing("TARGET_USERS"));
    }

    let min_trade_amount: f64 = parse_or(&get, "MIN_TRADE_AMOUNT", 0.0)?;
    non_negative("MIN_TRADE_AMOUNT", min_trade_amount)?;
    let max_trade_age = secs(&get, "MAX_TRADE_AGE_SECS", 60)?;
    let poll_period = secs(&get, "FEED_PERIOD_SECS", 10)?;
    let seen_retention = secs(&get, "SEEN_RETENTION_SECS", 3600)?;
    if seen_retention < max_trade_age {
        return Err(ConfigError::Invalid {
            key: "SEEN_RETENTION_SECS",
            reason: "must not be shorter than MAX_TRADE_AGE_SECS".into(),
        });
    }

    let order_amount_mult: f64 = parse_or(&get, "ORDER_AMOUNT_MULT", 1.0)?;
    positive("ORDER_AMOUNT_MULT", order_amount_mult)?;
    let buy_price_mult: f64 = parse_or(&get, "BUY_PRICE_MULT", 1.0)?;
    if !(buy_price_mult.is_finite() && buy_price_mult >= 1.0) {
        return Err(ConfigError::Invalid { key: "BUY_PRICE_MULT", reason: "must be >= 1".into() });
    }
    let sell_price_mult: f64 = parse_or(&get, "SELL_PRICE_MULT", 1.0)?;
    if !(sell_price_mult > 0.0 && sell_price_mult <= 1.0) {
        return Err(ConfigError::Invalid { key: "SELL_PRICE_MULT", reason: "must be in (0, 1]".into() });
    }
    let wash_threshold: f64 = parse_or(&get, "WASH_THRESHOLD", 0.2)?;
    non_negative("WASH_THRESHOLD", wash_threshold)?;

    let max_order_age = secs(&get, "MAX_ORDER_AGE_SECS", 300)?;
    let command_wait = Duration::from_millis(parse_or(&get, "COMMAND_WAIT_MS", 5000u64)?);

    let notional: f64 = parse_or(&get, "PRICE_NOTIONAL", 1000.0)?;
    positive("PRICE_NOTIONAL", notional)?;
    let price_period = secs(&get, "PRICE_PERIOD_SECS", 3)?;

    let stage = StageCfg {
        max_consecutive_errors: parse_or(&get, "MAX_STAGE_ERRORS", 10u32)?.max(1),
        backoff_base: Duration::from_millis(parse_or(&get, "STAGE_BACKOFF_MS", 1000u64)?),
    };

    // Command whitelist: KNOWN_SYMBOLS=BTC/UAH,ETH/UAH (default: the target pair only)
    let mut known_symbols: Vec<String> = get("KNOWN_SYMBOLS")
        .map(|s| s.split(',').map(normalize_symbol).filter(|x| !x.is_empty()).collect())
        .unwrap_or_default();
    if !known_symbols.contains(&symbol) {
        known_symbols.push(symbol.clone());
    }

    Ok(Settings {
        venue: VenueCfg { mode, rest_url, api_key, api_secret },
        watcher: WatcherCfg {
            symbol: symbol.clone(),
            target_users,
            min_trade_amount,
            max_trade_age,
            poll_period,
            seen_retention,
        },
        aggregator: AggregatorCfg {
            symbol: symbol.clone(),
            order_amount_mult,
            buy_price_mult,
            sell_price_mult,
            wash_threshold,
        },
        trader: TraderCfg { max_order_age, command_wait },
        poller: PollerCfg { symbol, notional, period: price_period },
        stage,
        notify: NotifyCfg { telegram_token: get("TELEGRAM_BOT_TOKEN"), telegram_chat_id: get("TELEGRAM_CHAT_ID") },
        known_symbols,
        command_queue_cap: parse_or(&get, "COMMAND_QUEUE_CAP", 1024usize)?.max(1),
        record_file: get("RECORD_FILE"),
        metrics_port: parse_or(&get, "METRICS_PORT", 9898u16)?,
        halt_on_stage_exit: parse_or(&get, "HALT_ON_STAGE_EXIT", true)?,
    })
}

pub fn normalize_symbol(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}

fn parse_or<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|e: T::Err| ConfigError::Invalid { key, reason: format!("{raw:?}: {e}") }),
    }
}

fn secs<G>(get: &G, key: &'static str, default: u64) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let v: u64 = parse_or(get, key, default)?;
    if v == 0 {
        return Err(ConfigError::Invalid { key, reason: "must be > 0".into() });
    }
    Ok(Duration::from_secs(v))
}

fn positive(key: &'static str, v: f64) -> Result<(), ConfigError> {
    if v.is_finite() && v > 0.0 { Ok(()) } else { Err(ConfigError::Invalid { key, reason: "must be > 0".into() }) }
}

fn non_negative(key: &'static str, v: f64) -> Result<(), ConfigError> {
    if v.is_finite() && v >= 0.0 { Ok(()) } else { Err(ConfigError::Invalid { key, reason: "must be >= 0".into() }) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(pairs: &[(&str, &str)]) -> Result<Settings, ConfigError> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        from_lookup(|k| map.get(k).cloned())
    }

    const BASE: &[(&str, &str)] = &[("VENUE_MODE", "mock"), ("TARGET_PAIR", "krb/uah"), ("TARGET_USERS", "whale, , shark")];

    #[test]
    fn defaults_apply() {
        let s = settings(BASE).unwrap();
        assert_eq!(s.watcher.symbol, "KRB/UAH");
        assert_eq!(s.watcher.target_users, vec!["whale", "shark"]);
        assert_eq!(s.watcher.poll_period, Duration::from_secs(10));
        assert_eq!(s.aggregator.wash_threshold, 0.2);
        assert_eq!(s.trader.command_wait, Duration::from_millis(5000));
        assert_eq!(s.stage.max_consecutive_errors, 10);
        assert_eq!(s.known_symbols, vec!["KRB/UAH"]);
        assert!(s.halt_on_stage_exit);
    }

    #[test]
    fn live_mode_requires_credentials() {
        let mut pairs = BASE.to_vec();
        pairs[0] = ("VENUE_MODE", "live");
        assert!(matches!(settings(&pairs), Err(ConfigError::Missing("VENUE_API_KEY"))));
    }

    #[test]
    fn price_multipliers_must_bias_toward_fill() {
        let mut pairs = BASE.to_vec();
        pairs.push(("BUY_PRICE_MULT", "0.99"));
        assert!(matches!(settings(&pairs), Err(ConfigError::Invalid { key: "BUY_PRICE_MULT", .. })));

        let mut pairs = BASE.to_vec();
        pairs.push(("SELL_PRICE_MULT", "1.01"));
        assert!(matches!(settings(&pairs), Err(ConfigError::Invalid { key: "SELL_PRICE_MULT", .. })));
    }

    #[test]
    fn retention_cannot_undercut_freshness_window() {
        let mut pairs = BASE.to_vec();
        pairs.push(("MAX_TRADE_AGE_SECS", "120"));
        pairs.push(("SEEN_RETENTION_SECS", "60"));
        assert!(matches!(settings(&pairs), Err(ConfigError::Invalid { key: "SEEN_RETENTION_SECS", .. })));
    }

    #[test]
    fn garbage_numbers_are_rejected() {
        let mut pairs = BASE.to_vec();
        pairs.push(("MIN_TRADE_AMOUNT", "lots"));
        assert!(matches!(settings(&pairs), Err(ConfigError::Invalid { key: "MIN_TRADE_AMOUNT", .. })));
    }

    #[test]
    fn missing_target_users_is_an_error() {
        let pairs = [("VENUE_MODE", "mock"), ("TARGET_PAIR", "KRB/UAH")];
        assert!(matches!(settings(&pairs), Err(ConfigError::Missing("TARGET_USERS"))));
    }
}
