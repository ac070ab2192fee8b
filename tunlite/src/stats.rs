//! Traffic counters read from the proxy's stats API.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use serde::Serialize;
use tokio::process::Command;

use crate::error::{TunnelError, TunnelResult};
use crate::process::expand_args;
use crate::runtime::ProxyOptions;
use crate::runtime::constants::{API_PLACEHOLDER, process::STATS_QUERY_TIMEOUT};

const UPLINK_COUNTER: &str = "outbound>>>proxy>>>traffic>>>uplink";
const DOWNLINK_COUNTER: &str = "outbound>>>proxy>>>traffic>>>downlink";

/// Cumulative bytes through the proxy outbound.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TrafficStats {
    pub upload: u64,
    pub download: u64,
}

impl TrafficStats {
    /// Bytes moved since `earlier`. Counters reset with the proxy, so this saturates.
    pub fn since(&self, earlier: &TrafficStats) -> TrafficStats {
        TrafficStats {
            upload: self.upload.saturating_sub(earlier.upload),
            download: self.download.saturating_sub(earlier.download),
        }
    }
}

/// Runs `<proxy> api statsquery -s <addr>` and parses the result.
#[derive(Debug, Clone)]
pub struct StatsQuery {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl StatsQuery {
    pub fn from_options(options: &ProxyOptions) -> Self {
        Self {
            program: options.program.clone(),
            args: expand_args(&options.stats_args, API_PLACEHOLDER, &options.stats_api_addr),
            timeout: STATS_QUERY_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn query(&self) -> TunnelResult<TrafficStats> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| {
                TunnelError::Internal(format!(
                    "stats query timed out after {} ms",
                    self.timeout.as_millis()
                ))
            })?
            .map_err(|e| TunnelError::Internal(format!("stats query failed to run: {}", e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        // Some proxy builds print the result on stderr.
        let body = if stdout.contains(">>>") { stdout } else { stderr };
        Ok(parse_stats_output(&body))
    }
}

/// Parse `{"stat":[{"name":..., "value":...}]}`. Unknown or malformed input yields zeros.
pub fn parse_stats_output(output: &str) -> TrafficStats {
    let mut stats = TrafficStats::default();

    let Ok(json) = serde_json::from_str::<serde_json::Value>(output.trim()) else {
        return stats;
    };
    let Some(entries) = json.get("stat").and_then(|s| s.as_array()) else {
        return stats;
    };

    for entry in entries {
        let name = entry.get("name").and_then(|n| n.as_str()).unwrap_or("");
        let value = entry.get("value").map(counter_value).unwrap_or(0);
        match name {
            UPLINK_COUNTER => stats.upload = value,
            DOWNLINK_COUNTER => stats.download = value,
            _ => {}
        }
    }
    stats
}

fn counter_value(value: &serde_json::Value) -> u64 {
    value
        .as_u64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
        .unwrap_or(0)
}
