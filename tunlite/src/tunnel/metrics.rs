//! Start-sequence timing.

use serde::Serialize;

use crate::pipeline::PipelineMetrics;

/// Per-step durations of a successful start, in milliseconds.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StartMetrics {
    pub total_ms: u128,
    pub proxy_config_ms: Option<u128>,
    pub proxy_spawn_ms: Option<u128>,
    pub port_probe_ms: Option<u128>,
    pub interface_ms: Option<u128>,
    pub relay_config_ms: Option<u128>,
    pub relay_launch_ms: Option<u128>,
}

impl StartMetrics {
    pub fn from_pipeline(pipeline: &PipelineMetrics, total_ms: u128) -> Self {
        Self {
            total_ms,
            proxy_config_ms: pipeline.task_duration_ms("proxy_config"),
            proxy_spawn_ms: pipeline.task_duration_ms("proxy_spawn"),
            port_probe_ms: pipeline.task_duration_ms("port_probe"),
            interface_ms: pipeline.task_duration_ms("interface_establish"),
            relay_config_ms: pipeline.task_duration_ms("relay_config"),
            relay_launch_ms: pipeline.task_duration_ms("relay_launch"),
        }
    }

    pub fn log_start_stages(&self) {
        tracing::info!(
            total_ms = self.total_ms as u64,
            proxy_config_ms = ?self.proxy_config_ms,
            proxy_spawn_ms = ?self.proxy_spawn_ms,
            port_probe_ms = ?self.port_probe_ms,
            interface_ms = ?self.interface_ms,
            relay_config_ms = ?self.relay_config_ms,
            relay_launch_ms = ?self.relay_launch_ms,
            "Tunnel start stages"
        );
    }
}
