use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;

use super::{Bet, Confirmation, SettlementClient, SettlementError};

/// Posts bets to a relay that signs and forwards them to the ledger program.
#[derive(Clone)]
pub struct HttpSettlement {
    base_url: String,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct SubmitResp {
    signature: String,
}

impl HttpSettlement {
    pub fn new(base_url: String, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("build settlement http client")?;
        Ok(Self { base_url, http })
    }

    fn bets_url(&self) -> String {
        format!("{}/bets", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl SettlementClient for HttpSettlement {
    async fn submit(&self, bet: &Bet) -> Result<Confirmation, SettlementError> {
        let url = self.bets_url();
        tracing::debug!(url = %url, round_id = bet.round_id, "submitting bet");

        let resp = self
            .http
            .post(&url)
            .json(bet)
            .send()
            .await
            .map_err(|e| SettlementError::Transport(e.to_string()))?;

        let status = resp.status();
        let body = resp.text().await.map_err(|e| SettlementError::Transport(e.to_string()))?;
        if !status.is_success() {
            let snippet: String = body.chars().take(256).collect();
            return Err(if status.is_client_error() {
                SettlementError::Rejected(format!("status={} body={}", status, snippet))
            } else {
                SettlementError::Transport(format!("status={} body={}", status, snippet))
            });
        }

        let parsed: SubmitResp = serde_json::from_str(&body)
            .map_err(|e| SettlementError::Transport(format!("decode submit response: {}", e)))?;
        Ok(Confirmation(parsed.signature))
    }
}
