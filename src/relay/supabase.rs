//! Supabase-backed broadcast relay.
//!
//! A Speaker inserts one row per transcript text into a PostgREST table;
//! Listeners poll for rows with an id above the last one they saw.
//!
//! ## Design
//! - HTTP client (reqwest) against the Supabase PostgREST endpoint
//! - Service-key authentication (`apikey` + `Authorization: Bearer`)
//! - The subscription cursor starts at the newest existing row, so a
//!   Listener only hears texts published after it joined

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{BroadcastRelay, RelaySubscription};

/// Table holding relayed transcript rows.
pub const DEFAULT_TABLE: &str = "interpretation_messages";

/// How often a subscription asks for new rows.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

// ── Configuration ────────────────────────────────────────────────

/// Supabase connection configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupabaseConfig {
    /// Supabase project URL (e.g., https://xxxx.supabase.co).
    pub url: String,
    /// Supabase service role key (server-side, never exposed to client).
    pub service_key: String,
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_table() -> String {
    DEFAULT_TABLE.to_string()
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL.as_millis() as u64
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl SupabaseConfig {
    pub fn new(url: impl Into<String>, service_key: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            service_key: service_key.into(),
            table: default_table(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }

    /// Build from `SUPABASE_URL`, `SUPABASE_SERVICE_KEY` and the optional
    /// `SUPABASE_RELAY_TABLE`, read through `lookup`.
    pub fn from_vars(lookup: &dyn Fn(&str) -> Option<String>) -> Option<Self> {
        let url = non_empty(lookup("SUPABASE_URL"))?;
        let service_key = non_empty(lookup("SUPABASE_SERVICE_KEY"))?;
        let mut config = Self::new(url, service_key);
        config.overlay_vars(lookup);
        Some(config)
    }

    /// Replace the fields whose variable is set.
    pub fn overlay_vars(&mut self, lookup: &dyn Fn(&str) -> Option<String>) {
        if let Some(url) = non_empty(lookup("SUPABASE_URL")) {
            self.url = url;
        }
        if let Some(key) = non_empty(lookup("SUPABASE_SERVICE_KEY")) {
            self.service_key = key;
        }
        if let Some(table) = non_empty(lookup("SUPABASE_RELAY_TABLE")) {
            self.table = table;
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

// ── Data models ──────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct NewRow<'a> {
    text: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
struct RelayRow {
    id: i64,
    #[serde(default)]
    text: String,
}

// ── Relay client ─────────────────────────────────────────────────

#[derive(Clone)]
pub struct SupabaseRelay {
    config: SupabaseConfig,
    http: reqwest::Client,
}

impl SupabaseRelay {
    pub fn new(config: SupabaseConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;

        Ok(Self { config, http })
    }

    /// Build the PostgREST URL for the relay table.
    fn table_url(&self) -> String {
        format!(
            "{}/rest/v1/{}",
            self.config.url.trim_end_matches('/'),
            self.config.table
        )
    }

    fn auth_headers(&self) -> Vec<(&str, String)> {
        vec![
            ("apikey", self.config.service_key.clone()),
            (
                "Authorization",
                format!("Bearer {}", self.config.service_key),
            ),
        ]
    }

    fn get(&self, query: &[(&str, String)]) -> reqwest::RequestBuilder {
        let mut request = self.http.get(self.table_url()).query(query);
        for (key, value) in self.auth_headers() {
            request = request.header(key, value);
        }
        request
    }

    async fn fetch_rows(&self, query: &[(&str, String)]) -> anyhow::Result<Vec<RelayRow>> {
        let resp = self.get(query).send().await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Relay fetch failed ({status}): {body}");
        }

        Ok(resp.json().await?)
    }

    /// Id of the newest row, or 0 for an empty table.
    async fn latest_id(&self) -> anyhow::Result<i64> {
        let rows = self
            .fetch_rows(&[
                ("select", "id".to_string()),
                ("order", "id.desc".to_string()),
                ("limit", "1".to_string()),
            ])
            .await?;
        Ok(rows.first().map(|row| row.id).unwrap_or(0))
    }

    async fn rows_after(&self, cursor: i64) -> anyhow::Result<Vec<RelayRow>> {
        self.fetch_rows(&[
            ("select", "id,text".to_string()),
            ("id", format!("gt.{cursor}")),
            ("order", "id.asc".to_string()),
        ])
        .await
    }
}

#[async_trait]
impl BroadcastRelay for SupabaseRelay {
    async fn publish(&self, text: &str) -> anyhow::Result<()> {
        let mut request = self
            .http
            .post(self.table_url())
            .json(&NewRow { text })
            .header("Prefer", "return=minimal");

        for (key, value) in self.auth_headers() {
            request = request.header(key, value);
        }

        let resp = request.send().await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Relay publish failed ({status}): {body}");
        }

        Ok(())
    }

    async fn subscribe(&self) -> anyhow::Result<RelaySubscription> {
        let mut cursor = self.latest_id().await?;
        let (out, cancel, sub) = RelaySubscription::channel();
        let relay = self.clone();
        let interval = self.config.poll_interval();

        tracing::info!(table = %self.config.table, cursor, "Relay subscription opened");

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let rows = match relay.rows_after(cursor).await {
                    Ok(rows) => rows,
                    Err(e) => {
                        tracing::warn!(error = %e, "Relay poll failed");
                        continue;
                    }
                };
                for row in rows {
                    cursor = cursor.max(row.id);
                    if row.text.trim().is_empty() {
                        continue;
                    }
                    if out.send(row.text).await.is_err() {
                        return;
                    }
                }
            }
            tracing::debug!("Relay subscription closed");
        });

        Ok(sub)
    }
}

// ── Tests ────────────────────────────────────────────────────────
