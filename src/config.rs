use std::str::FromStr;
use std::time::Duration;

use anyhow::{ensure, Context};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;

use crate::feed::binance::{DEPTH_WS_URL, TRADE_WS_URL};
use crate::feed::{Channel, FeedConfig};
use crate::grid::{GridConfig, LiquidityPolicy, MultiplierPolicy, Tier};
use crate::round::RoundTimings;
use crate::settlement::BetRules;
use crate::types::BPS_SCALE;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub trade_ws_url: String,
    pub depth_ws_url: String,
    pub channels: String,
    pub reconnect_delay_ms: u64,

    pub betting_secs: u64,
    pub live_secs: u64,
    pub result_secs: u64,
    pub timer_ms: u64,

    pub max_selections: usize,
    pub bet_presets: String,
    pub default_stake: String,
    pub min_stake: String,
    pub time_windows: String,
    pub default_time_window: u64,

    // Grid
    pub price_decimals: u32,
    pub quantization_bucket: String,
    pub grid_tiers: String,
    pub band_ratio: String,
    pub multiplier_policy: String,

    pub history_cap: usize,
    pub auto_submit_on_lock: bool,

    // Settlement relay; dry-run when unset
    pub settlement_url: Option<String>,
    pub settlement_timeout_ms: u64,

    // Stats
    pub stats_log_sec: u64,
    pub stats_jsonl_path: Option<String>,
}

impl Settings {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        let c = config::Config::builder()
            .set_default("trade_ws_url", TRADE_WS_URL)?
            .set_default("depth_ws_url", DEPTH_WS_URL)?
            .set_default("channels", "trades,depth")?
            .set_default("reconnect_delay_ms", 2000)?
            .set_default("betting_secs", 15)?
            .set_default("live_secs", 30)?
            .set_default("result_secs", 3)?
            .set_default("timer_ms", 1000)?
            .set_default("max_selections", 2)?
            .set_default("bet_presets", "0.01,0.05,0.1,0.5")?
            .set_default("default_stake", "0.05")?
            .set_default("min_stake", "0.01")?
            .set_default("time_windows", "30,60,120")?
            .set_default("default_time_window", 60)?
            .set_default("price_decimals", 2)?
            .set_default("quantization_bucket", "10")?
            .set_default("grid_tiers", "5:15000,10:30000,20:55400,50:100000,100:500000")?
            .set_default("band_ratio", "0.1")?
            .set_default("multiplier_policy", "static")?
            .set_default("history_cap", 10)?
            .set_default("auto_submit_on_lock", false)?
            .set_default("settlement_timeout_ms", 10_000)?
            .set_default("stats_log_sec", 30)?
            .add_source(config::Environment::default())
            .build()?;
        Ok(c.try_deserialize()?)
    }

    pub fn feed_config(&self) -> anyhow::Result<FeedConfig> {
        let mut channels = parse_list::<Channel>(&self.channels).context("CHANNELS")?;
        channels.sort();
        channels.dedup();
        ensure!(!channels.is_empty(), "CHANNELS must name at least one channel");
        Ok(FeedConfig { channels, reconnect_delay: Duration::from_millis(self.reconnect_delay_ms) })
    }

    pub fn engine_config(&self) -> anyhow::Result<EngineConfig> {
        let policy = match self.multiplier_policy.trim().to_ascii_lowercase().as_str() {
            "static" => MultiplierPolicy::Static,
            "liquidity" | "liquidity_time" => {
                MultiplierPolicy::LiquidityTime(LiquidityPolicy::default())
            }
            other => {
                anyhow::bail!("MULTIPLIER_POLICY must be static or liquidity, got {:?}", other)
            }
        };

        let cfg = EngineConfig {
            timings: RoundTimings {
                betting_ms: secs_to_ms(self.betting_secs),
                live_ms: secs_to_ms(self.live_secs),
                result_ms: secs_to_ms(self.result_secs),
            },
            timer_tick: Duration::from_millis(self.timer_ms),
            max_selections: self.max_selections,
            bet_presets: parse_list::<Decimal>(&self.bet_presets).context("BET_PRESETS")?,
            default_stake: parse_dec(&self.default_stake).context("DEFAULT_STAKE")?,
            time_windows: parse_list::<u64>(&self.time_windows).context("TIME_WINDOWS")?,
            default_time_window: self.default_time_window,
            grid: GridConfig {
                tiers: parse_tiers(&self.grid_tiers).context("GRID_TIERS")?,
                band_ratio: parse_dec(&self.band_ratio).context("BAND_RATIO")?,
                bucket_size: parse_dec(&self.quantization_bucket).context("QUANTIZATION_BUCKET")?,
                price_decimals: self.price_decimals,
                policy,
            },
            history_cap: self.history_cap,
            bet_rules: BetRules {
                min_stake: parse_dec(&self.min_stake).context("MIN_STAKE")?,
                max_zones: self.max_selections,
                price_decimals: self.price_decimals,
            },
            auto_submit_on_lock: self.auto_submit_on_lock,
        };
        cfg.validate()?;
        Ok(cfg)
    }
}

/// Everything the round engine needs, parsed and checked.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub timings: RoundTimings,
    /// Countdown granularity of the runtime timer.
    pub timer_tick: Duration,
    pub max_selections: usize,
    pub bet_presets: Vec<Decimal>,
    pub default_stake: Decimal,
    /// Seconds.
    pub time_windows: Vec<u64>,
    pub default_time_window: u64,
    pub grid: GridConfig,
    pub history_cap: usize,
    pub bet_rules: BetRules,
    pub auto_submit_on_lock: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timings: RoundTimings { betting_ms: 15_000, live_ms: 30_000, result_ms: 3_000 },
            timer_tick: Duration::from_secs(1),
            max_selections: 2,
            bet_presets: vec![dec!(0.01), dec!(0.05), dec!(0.1), dec!(0.5)],
            default_stake: dec!(0.05),
            time_windows: vec![30, 60, 120],
            default_time_window: 60,
            grid: GridConfig {
                tiers: default_tiers(),
                band_ratio: dec!(0.1),
                bucket_size: dec!(10),
                price_decimals: 2,
                policy: MultiplierPolicy::Static,
            },
            history_cap: 10,
            bet_rules: BetRules { min_stake: dec!(0.01), max_zones: 2, price_decimals: 2 },
            auto_submit_on_lock: false,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        let t = &self.timings;
        ensure!(
            t.betting_ms > 0 && t.live_ms > 0 && t.result_ms > 0,
            "phase durations must be positive"
        );
        ensure!(!self.timer_tick.is_zero(), "timer tick must be positive");
        ensure!(self.max_selections >= 1, "max selections must be at least 1");
        ensure!(
            self.bet_rules.max_zones == self.max_selections,
            "max zones ({}) must equal max selections ({})",
            self.bet_rules.max_zones,
            self.max_selections
        );
        ensure!(self.bet_rules.min_stake > Decimal::ZERO, "min stake must be positive");

        ensure!(!self.bet_presets.is_empty(), "bet presets must not be empty");
        ensure!(
            self.bet_presets.iter().all(|p| *p >= self.bet_rules.min_stake),
            "every bet preset must be at least the min stake {}",
            self.bet_rules.min_stake
        );
        ensure!(
            self.bet_presets.contains(&self.default_stake),
            "default stake {} is not one of the presets",
            self.default_stake
        );

        ensure!(!self.time_windows.is_empty(), "time windows must not be empty");
        ensure!(self.time_windows.iter().all(|w| *w > 0), "time windows must be positive");
        ensure!(
            self.time_windows.contains(&self.default_time_window),
            "default time window {}s is not one of the windows",
            self.default_time_window
        );

        let g = &self.grid;
        ensure!(!g.tiers.is_empty(), "grid needs at least one tier");
        ensure!(
            g.tiers.windows(2).all(|w| w[0].distance_bps < w[1].distance_bps),
            "grid tiers must be ordered nearest to farthest"
        );
        ensure!(g.tiers.iter().all(|t| t.distance_bps > 0), "tier distances must be positive");
        ensure!(
            g.tiers.windows(2).all(|w| w[0].base_multiplier_bps < w[1].base_multiplier_bps),
            "tier multipliers must increase with distance"
        );
        ensure!(
            g.tiers.iter().all(|t| t.base_multiplier_bps >= BPS_SCALE),
            "tier multipliers must be at least {} bps",
            BPS_SCALE
        );
        ensure!(g.band_ratio > Decimal::ZERO, "band ratio must be positive");
        ensure!(g.bucket_size > Decimal::ZERO, "quantization bucket must be positive");
        ensure!(g.price_decimals <= 9, "price decimals must be at most 9");
        Ok(())
    }
}

pub fn default_tiers() -> Vec<Tier> {
    [(5, 15_000), (10, 30_000), (20, 55_400), (50, 100_000), (100, 500_000)]
        .into_iter()
        .map(|(distance_bps, base_multiplier_bps)| Tier { distance_bps, base_multiplier_bps })
        .collect()
}

fn secs_to_ms(secs: u64) -> i64 {
    i64::try_from(secs.saturating_mul(1000)).unwrap_or(i64::MAX)
}

fn parse_dec(s: &str) -> anyhow::Result<Decimal> {
    s.trim().parse::<Decimal>().with_context(|| format!("bad decimal {:?}", s))
}

/// Comma separated; blank entries are skipped.
fn parse_list<T>(s: &str) -> anyhow::Result<Vec<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    s.split(',')
        .map(str::trim)
        .filter(|x| !x.is_empty())
        .map(|x| x.parse::<T>().map_err(|e| anyhow::anyhow!("bad entry {:?}: {}", x, e)))
        .collect()
}

/// `distance_bps:multiplier_bps` pairs, comma separated.
fn parse_tiers(s: &str) -> anyhow::Result<Vec<Tier>> {
    parse_list::<String>(s)?
        .iter()
        .map(|pair| {
            let (d, m) = pair
                .split_once(':')
                .with_context(|| format!("tier {:?} is not distance:multiplier", pair))?;
            Ok(Tier {
                distance_bps: d.trim().parse().with_context(|| format!("tier distance {:?}", d))?,
                base_multiplier_bps: m
                    .trim()
                    .parse()
                    .with_context(|| format!("tier multiplier {:?}", m))?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn tiers_parse() {
        let tiers = parse_tiers("5:15000, 10:30000").unwrap();
        assert_eq!(tiers, vec![
            Tier { distance_bps: 5, base_multiplier_bps: 15_000 },
            Tier { distance_bps: 10, base_multiplier_bps: 30_000 },
        ]);
        assert!(parse_tiers("5-15000").is_err());
        assert!(parse_tiers("5:x").is_err());
    }

    #[test]
    fn lists_parse() {
        assert_eq!(parse_list::<u64>("30, 60,,120").unwrap(), vec![30, 60, 120]);
        assert_eq!(parse_list::<Decimal>("0.01,0.5").unwrap(), vec![dec!(0.01), dec!(0.5)]);
        assert!(parse_list::<u64>("30,abc").is_err());
    }

    #[test]
    fn bad_configs_are_rejected() {
        let mut c = EngineConfig::default();
        c.default_stake = dec!(0.07);
        assert!(c.validate().is_err());

        let mut c = EngineConfig::default();
        c.grid.tiers.reverse();
        assert!(c.validate().is_err());

        let mut c = EngineConfig::default();
        c.grid.tiers[0].base_multiplier_bps = 9_000;
        assert!(c.validate().is_err());

        let mut c = EngineConfig::default();
        c.grid.tiers[2].base_multiplier_bps = 30_000;
        assert!(c.validate().is_err());

        let mut c = EngineConfig::default();
        c.default_time_window = 45;
        assert!(c.validate().is_err());

        let mut c = EngineConfig::default();
        c.timings.live_ms = 0;
        assert!(c.validate().is_err());
    }
}
