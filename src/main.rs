use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

use gridbet::config::Settings;
use gridbet::engine::{start_engine, EngineCommand, EngineHandle, EngineUpdate};
use gridbet::feed::{BinanceTransport, MarketFeed};
use gridbet::settlement::{DryRunSettlement, HttpSettlement, SettlementClient};
use gridbet::stats::Stats;
use gridbet::types::{to_fixed, CellKey, Side};

fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}

async fn maybe_write_jsonl(path: &Option<String>, line: &str) {
    if let Some(p) = path.as_ref().map(|x| x.trim().to_string()).filter(|x| !x.is_empty()) {
        if let Ok(mut f) = tokio::fs::OpenOptions::new().create(true).append(true).open(&p).await {
            use tokio::io::AsyncWriteExt;
            let _ = f.write_all(line.as_bytes()).await;
            let _ = f.write_all(b"\n").await;
        }
    }
}

#[derive(Debug)]
enum ConsoleCmd {
    Engine(EngineCommand),
    Snapshot,
    Cells,
    Quit,
}

/// One console line: `toggle above 100.04`, `stake 0.1`, `window 30`, `confirm`, `clear`,
/// `snapshot`, `cells` or `quit`.
fn parse_console(line: &str, price_decimals: u32) -> Result<Option<ConsoleCmd>> {
    let mut parts = line.split_whitespace();
    let Some(verb) = parts.next() else { return Ok(None) };
    let cmd = match verb.to_ascii_lowercase().as_str() {
        "toggle" | "t" => {
            let side: Side = parts.next().context("toggle needs a side")?.parse()?;
            let lower: Decimal = parts
                .next()
                .context("toggle needs the cell's lower bound")?
                .parse()
                .context("lower bound")?;
            let lower_fixed = to_fixed(lower, price_decimals)
                .and_then(|v| v.to_i64())
                .context("lower bound out of range")?;
            ConsoleCmd::Engine(EngineCommand::Toggle(CellKey { side, lower_fixed }))
        }
        "stake" => {
            let stake: Decimal =
                parts.next().context("stake needs an amount")?.parse().context("stake")?;
            ConsoleCmd::Engine(EngineCommand::SetStake(stake))
        }
        "window" => {
            let secs: u64 =
                parts.next().context("window needs seconds")?.parse().context("window")?;
            ConsoleCmd::Engine(EngineCommand::SetTimeWindow(secs))
        }
        "confirm" | "bet" => ConsoleCmd::Engine(EngineCommand::Confirm),
        "clear" => ConsoleCmd::Engine(EngineCommand::ClearSelection),
        "snapshot" | "snap" => ConsoleCmd::Snapshot,
        "cells" => ConsoleCmd::Cells,
        "quit" | "exit" => ConsoleCmd::Quit,
        other => bail!("unknown command {:?}", other),
    };
    Ok(Some(cmd))
}

/// Returns false when the operator asked to quit.
async fn run_console(engine: &EngineHandle, cmd: ConsoleCmd) -> Result<bool> {
    match cmd {
        ConsoleCmd::Engine(c) => engine.send(c).await?,
        ConsoleCmd::Snapshot => {
            let snap = engine.snapshot().await?;
            println!("{}", serde_json::to_string_pretty(&snap)?);
        }
        ConsoleCmd::Cells => {
            let snap = engine.snapshot().await?;
            for c in &snap.cells {
                let picked = if snap.selection.iter().any(|s| s.id == c.id) { "*" } else { " " };
                println!(
                    "{} {:<5} tier={} [{} .. {}] x{}",
                    picked,
                    c.side,
                    c.distance_tier,
                    c.price_lower,
                    c.price_upper,
                    Decimal::from(c.multiplier_bps) / Decimal::from(10_000u32)
                );
            }
        }
        ConsoleCmd::Quit => return Ok(false),
    }
    Ok(true)
}

fn log_update(u: &EngineUpdate) {
    match u {
        EngineUpdate::Countdown { round_id, phase, remaining_ms } => {
            tracing::debug!(round_id, phase = %phase, remaining_ms, "countdown");
        }
        EngineUpdate::GridRegenerated { .. } => {
            let json = serde_json::to_string(u).unwrap_or_default();
            tracing::debug!(update = %json, "engine update");
        }
        _ => {
            let json = serde_json::to_string(u).unwrap_or_default();
            tracing::info!(update = %json, "engine update");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let s = Settings::from_env()?;
    let engine_cfg = s.engine_config()?;
    let feed_cfg = s.feed_config()?;
    let price_decimals = engine_cfg.grid.price_decimals;

    let stats = Stats::new(now_ms());

    let transport = Arc::new(BinanceTransport::new(s.trade_ws_url.clone(), s.depth_ws_url.clone()));
    let (feed, feed_events) = MarketFeed::new(feed_cfg, transport, stats.clone());

    let settlement: Arc<dyn SettlementClient> =
        match s.settlement_url.as_deref().map(str::trim).filter(|u| !u.is_empty()) {
            Some(url) => {
                tracing::info!(url = %url, "settlement via http relay");
                let timeout = Duration::from_millis(s.settlement_timeout_ms);
                Arc::new(HttpSettlement::new(url.to_string(), timeout)?)
            }
            None => {
                tracing::info!("settlement url unset, bets are logged only");
                Arc::new(DryRunSettlement::new())
            }
        };

    let engine = start_engine(engine_cfg, feed, feed_events, settlement, stats.clone());
    let mut updates = engine.subscribe();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut console_open = true;
    let mut stats_tick = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("ctrl-c, shutting down");
                break;
            }
            line = lines.next_line(), if console_open => match line {
                Ok(Some(l)) => match parse_console(&l, price_decimals) {
                    Ok(Some(cmd)) => match run_console(&engine, cmd).await {
                        Ok(true) => {}
                        Ok(false) => break,
                        Err(e) => {
                            tracing::warn!(error = %format!("{:#}", e), "console command failed")
                        }
                    },
                    Ok(None) => {}
                    Err(e) => tracing::warn!(error = %format!("{:#}", e), "bad console input"),
                },
                Ok(None) => {
                    tracing::info!("stdin closed, console disabled");
                    console_open = false;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "stdin read failed, console disabled");
                    console_open = false;
                }
            },
            u = updates.recv() => match u {
                Ok(u) => log_update(&u),
                Err(RecvError::Lagged(n)) => tracing::warn!(skipped = n, "update log lagged"),
                Err(RecvError::Closed) => break,
            },
            _ = stats_tick.tick() => {
                let t = now_ms();
                if stats.should_log(t, s.stats_log_sec) {
                    let ss = stats.snapshot(t);
                    stats.mark_logged(t);

                    let line = serde_json::to_string(&ss).unwrap_or_default();
                    tracing::info!(
                        up_sec = ss.up_sec,
                        ticks = ss.ticks,
                        depth_updates = ss.depth_updates,
                        dropped = ss.dropped_messages,
                        reconnects = ss.reconnects,
                        grid_regens = ss.grid_regenerations,
                        rounds = ss.rounds_completed,
                        bets_locked = ss.bets_locked,
                        hits = ss.hits,
                        submissions_ok = ss.submissions_ok,
                        submissions_failed = ss.submissions_failed,
                        "stats"
                    );

                    maybe_write_jsonl(&s.stats_jsonl_path, &line).await;
                }
            }
        }
    }

    engine.shutdown().await;
    Ok(())
}
