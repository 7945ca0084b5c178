use anyhow::{Context, Result};
use std::path::Path;

/// Write the Prometheus text exposition to `path` for a textfile collector.
/// The file is replaced atomically so a scrape never sees a partial write.
pub async fn write_metrics_file(path: &Path) -> Result<()> {
    let body = telemetry::encode_metrics().context("failed to encode metrics")?;
    let tmp = path.with_extension("prom.tmp");
    tokio::fs::write(&tmp, body)
        .await
        .with_context(|| format!("failed to write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}
