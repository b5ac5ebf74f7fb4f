use crate::models::BillingSession;
use crate::services::UsageSource;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

/// Nested token counters as emitted by the usage CLI.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTokenCounts {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
}

impl RawTokenCounts {
    pub fn total(&self) -> u64 {
        self.input_tokens
            + self.output_tokens
            + self.cache_creation_input_tokens
            + self.cache_read_input_tokens
    }
}

/// One usage block exactly as reported by the external command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawUsageBlock {
    pub id: String,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub is_gap: bool,
    #[serde(default)]
    pub token_counts: RawTokenCounts,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(rename = "costUSD", default)]
    pub cost_usd: f64,
}

impl RawUsageBlock {
    /// Convert to the domain type, rejecting blocks that violate the
    /// end-after-start invariant.
    pub fn into_billing_session(self) -> Option<BillingSession> {
        if let Some(end) = self.end_time {
            if end <= self.start_time {
                log::warn!(
                    "Discarding usage block {} with end time not after start time",
                    self.id
                );
                return None;
            }
        }
        let total = if self.total_tokens > 0 {
            self.total_tokens
        } else {
            self.token_counts.total()
        };
        Some(BillingSession {
            id: self.id,
            start_time: self.start_time,
            end_time: self.end_time,
            input_tokens: self.token_counts.input_tokens,
            output_tokens: self.token_counts.output_tokens,
            total_tokens: total,
            cost_usd: self.cost_usd,
            is_active: self.is_active,
        })
    }
}

/// Top-level shape of the CLI's JSON output. `blocks` is required so an
/// unrelated JSON object never passes for an empty result.
#[derive(Debug, Deserialize)]
struct BlocksEnvelope {
    blocks: Vec<RawUsageBlock>,
}

/// One way of invoking the usage command.
///
/// Different host environments restrict process spawning differently: an
/// interactive shell has the runner wrappers on PATH, a service supervisor
/// may only expose the bare binary, and a stripped supervisor environment
/// needs a login shell to find anything at all. A fixed single strategy is
/// not portable, so strategies are tried in order.
pub trait InvocationStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn build_command(&self, args: &[String]) -> Command;
}

/// `bunx ccusage ...`: wrapper runner, preferred in interactive shells.
pub struct BunxStrategy;

impl InvocationStrategy for BunxStrategy {
    fn name(&self) -> &'static str {
        "bunx"
    }

    fn build_command(&self, args: &[String]) -> Command {
        let mut command = Command::new("bunx");
        command.arg("ccusage").args(args);
        command
    }
}

/// `ccusage ...`: direct spawn of a globally installed binary.
pub struct DirectStrategy;

impl InvocationStrategy for DirectStrategy {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn build_command(&self, args: &[String]) -> Command {
        let mut command = Command::new("ccusage");
        command.args(args);
        command
    }
}

/// `sh -lc "ccusage ..."`: login-shell indirection for supervisors that
/// strip PATH down to almost nothing.
pub struct ShellStrategy;

impl InvocationStrategy for ShellStrategy {
    fn name(&self) -> &'static str {
        "shell"
    }

    fn build_command(&self, args: &[String]) -> Command {
        let mut command = Command::new("sh");
        command.arg("-lc");
        command.arg(format!("ccusage {}", args.join(" ")));
        command
    }
}

/// Runs the external usage command through an ordered strategy chain.
///
/// `fetch` never raises to its caller: every strategy failure is logged and
/// absorbed, and total failure yields an empty result.
pub struct UsageExecutor {
    strategies: Vec<Box<dyn InvocationStrategy>>,
    process_timeout: Duration,
}

impl UsageExecutor {
    pub fn new(process_timeout: Duration) -> Self {
        Self {
            strategies: vec![
                Box::new(BunxStrategy),
                Box::new(DirectStrategy),
                Box::new(ShellStrategy),
            ],
            process_timeout,
        }
    }

    /// Replace the strategy chain (used by tests to inject fake commands).
    pub fn with_strategies(
        strategies: Vec<Box<dyn InvocationStrategy>>,
        process_timeout: Duration,
    ) -> Self {
        Self {
            strategies,
            process_timeout,
        }
    }

    /// Invoke the usage command, optionally bounded below by `since`.
    /// Returns the first well-formed result; `None` when every strategy
    /// fails ("no data this cycle", never an error to the caller).
    pub async fn fetch_usage(&self, since: Option<NaiveDate>) -> Option<Vec<RawUsageBlock>> {
        let args = build_args(since);

        for strategy in &self.strategies {
            match self.run_strategy(strategy.as_ref(), &args).await {
                Ok(blocks) => {
                    log::debug!(
                        "Usage fetch via '{}' returned {} blocks",
                        strategy.name(),
                        blocks.len()
                    );
                    return Some(blocks);
                }
                Err(e) => {
                    log::debug!("Usage fetch strategy '{}' failed: {e:#}", strategy.name());
                }
            }
        }

        log::warn!("All usage fetch strategies failed; treating as no data this cycle");
        None
    }

    async fn run_strategy(
        &self,
        strategy: &dyn InvocationStrategy,
        args: &[String],
    ) -> Result<Vec<RawUsageBlock>> {
        let mut command = strategy.build_command(args);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = timeout(self.process_timeout, command.output())
            .await
            .map_err(|_| anyhow!("timed out after {:?}", self.process_timeout))?
            .context("failed to spawn process")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!(
                "exited with {}: {}",
                output.status,
                stderr.trim().chars().take(200).collect::<String>()
            ));
        }

        parse_blocks(&output.stdout)
    }
}

fn build_args(since: Option<NaiveDate>) -> Vec<String> {
    let mut args = vec!["blocks".to_string(), "--json".to_string()];
    if let Some(date) = since {
        args.push("--since".to_string());
        args.push(date.format("%Y%m%d").to_string());
    }
    args
}

/// Parse the CLI's stdout. Accepts the documented envelope object as well as
/// a bare block array (older CLI versions emitted the array directly).
fn parse_blocks(stdout: &[u8]) -> Result<Vec<RawUsageBlock>> {
    let text = std::str::from_utf8(stdout).context("output was not UTF-8")?;
    if let Ok(envelope) = serde_json::from_str::<BlocksEnvelope>(text) {
        return Ok(envelope.blocks);
    }
    serde_json::from_str::<Vec<RawUsageBlock>>(text).context("unparsable blocks output")
}

impl UsageSource for UsageExecutor {
    fn fetch(
        &self,
        since: Option<NaiveDate>,
    ) -> impl std::future::Future<Output = Option<Vec<RawUsageBlock>>> + Send {
        self.fetch_usage(since)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_envelope_output() {
        let json = r#"{
            "blocks": [
                {
                    "id": "2025-07-01T10:00:00.000Z",
                    "startTime": "2025-07-01T10:00:00.000Z",
                    "endTime": "2025-07-01T15:00:00.000Z",
                    "isActive": false,
                    "tokenCounts": {"inputTokens": 120, "outputTokens": 480},
                    "totalTokens": 600,
                    "costUSD": 1.25
                }
            ]
        }"#;
        let blocks = parse_blocks(json.as_bytes()).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].total_tokens, 600);
        assert_eq!(blocks[0].cost_usd, 1.25);
        assert!(!blocks[0].is_gap);
    }

    #[test]
    fn parses_bare_array_output() {
        let json = r#"[{"id": "b", "startTime": "2025-07-01T10:00:00Z", "isGap": true}]"#;
        let blocks = parse_blocks(json.as_bytes()).unwrap();
        assert_eq!(blocks.len(), 1);
        assert!(blocks[0].is_gap);
    }

    #[test]
    fn rejects_garbage_output() {
        assert!(parse_blocks(b"command not found").is_err());
    }

    #[test]
    fn totals_fall_back_to_nested_counters() {
        let json = r#"{"blocks": [{
            "id": "b",
            "startTime": "2025-07-01T10:00:00Z",
            "tokenCounts": {"inputTokens": 10, "outputTokens": 30, "cacheReadInputTokens": 5}
        }]}"#;
        let blocks = parse_blocks(json.as_bytes()).unwrap();
        let session = blocks[0].clone().into_billing_session().unwrap();
        assert_eq!(session.total_tokens, 45);
    }

    #[test]
    fn end_before_start_is_rejected() {
        let block = RawUsageBlock {
            id: "bad".to_string(),
            start_time: Utc::now(),
            end_time: Some(Utc::now() - chrono::Duration::hours(1)),
            is_active: false,
            is_gap: false,
            token_counts: RawTokenCounts::default(),
            total_tokens: 0,
            cost_usd: 0.0,
        };
        assert!(block.into_billing_session().is_none());
    }

    #[test]
    fn since_argument_is_compact_date() {
        let args = build_args(NaiveDate::from_ymd_opt(2025, 6, 17));
        assert_eq!(args, vec!["blocks", "--json", "--since", "20250617"]);
    }
}
