//! Materialization of the proxy and relay config files.
//!
//! Both files are written to a temp file in the target directory, synced and
//! renamed into place, so readers never observe a partial document.

mod relay;

pub use relay::RelayConfig;

use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use crate::error::{TunnelError, TunnelResult};

/// Opaque proxy configuration supplied by the caller.
///
/// The controller never interprets it beyond checking it is non-empty.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ProxyConfig(String);

impl ProxyConfig {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn from_json_value(value: &serde_json::Value) -> TunnelResult<Self> {
        serde_json::to_string_pretty(value)
            .map(Self)
            .map_err(|e| TunnelError::Config(format!("Failed to serialize proxy config: {}", e)))
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for ProxyConfig {
    // Config blobs carry credentials.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ProxyConfig({} bytes)", self.0.len())
    }
}

impl From<String> for ProxyConfig {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

impl From<&str> for ProxyConfig {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

/// Write the proxy config verbatim.
pub fn write_proxy_config(path: &Path, config: &ProxyConfig) -> TunnelResult<()> {
    write_atomic(path, config.as_str().as_bytes())
}

/// Render and write the relay config.
pub fn write_relay_config(path: &Path, config: &RelayConfig) -> TunnelResult<()> {
    write_atomic(path, config.render().as_bytes())
}

fn write_atomic(path: &Path, contents: &[u8]) -> TunnelResult<()> {
    let dir = path.parent().ok_or_else(|| {
        TunnelError::Storage(format!("Config path has no parent: {}", path.display()))
    })?;

    let storage_err = |what: &str, e: std::io::Error| {
        TunnelError::Storage(format!("Failed to {} {}: {}", what, path.display(), e))
    };

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| storage_err("stage", e))?;
    tmp.as_file()
        .set_permissions(std::fs::Permissions::from_mode(0o600))
        .map_err(|e| storage_err("chmod", e))?;
    tmp.write_all(contents).map_err(|e| storage_err("write", e))?;
    tmp.as_file().sync_all().map_err(|e| storage_err("sync", e))?;
    tmp.persist(path).map_err(|e| storage_err("persist", e.error))?;

    tracing::debug!(path = %path.display(), bytes = contents.len(), "Wrote config file");
    Ok(())
}
