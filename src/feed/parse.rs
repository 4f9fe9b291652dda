use rust_decimal::Decimal;
use serde::Deserialize;

use crate::types::{PriceTick, RawDepth};

#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unparsable decimal {0:?}")]
    Decimal(String),
    #[error("non-positive price {0}")]
    NonPositivePrice(Decimal),
}

#[derive(Debug, Deserialize)]
struct TradeMsg {
    p: String,
    #[serde(rename = "T")]
    t: i64,
}

#[derive(Debug, Deserialize)]
struct DepthMsg {
    #[serde(rename = "lastUpdateId", default)]
    last_update_id: Option<u64>,
    #[serde(default)]
    bids: Vec<[String; 2]>,
    #[serde(default)]
    asks: Vec<[String; 2]>,
}

fn parse_dec(s: &str) -> Result<Decimal, FeedError> {
    s.trim().parse::<Decimal>().map_err(|_| FeedError::Decimal(s.to_string()))
}

/// `{"p": "<price>", "T": <ms>}`; any other fields are ignored.
pub fn parse_trade(text: &str) -> Result<PriceTick, FeedError> {
    let msg: TradeMsg = serde_json::from_str(text)?;
    let price = parse_dec(&msg.p)?;
    if price <= Decimal::ZERO {
        return Err(FeedError::NonPositivePrice(price));
    }
    Ok(PriceTick { time_ms: msg.t, price })
}

/// `{"bids": [[p, q], ...], "asks": [[p, q], ...]}`, each side best-to-worst.
pub fn parse_depth(text: &str) -> Result<RawDepth, FeedError> {
    let msg: DepthMsg = serde_json::from_str(text)?;
    Ok(RawDepth {
        last_update_id: msg.last_update_id,
        bids: parse_levels(&msg.bids)?,
        asks: parse_levels(&msg.asks)?,
    })
}

fn parse_levels(raw: &[[String; 2]]) -> Result<Vec<(Decimal, Decimal)>, FeedError> {
    raw.iter()
        .map(|[p, q]| {
            let price = parse_dec(p)?;
            if price <= Decimal::ZERO {
                return Err(FeedError::NonPositivePrice(price));
            }
            Ok((price, parse_dec(q)?))
        })
        .collect()
}
