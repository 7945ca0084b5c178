use anyhow::Result;
use device_manager::{NegotiationConfig, PtzConfig};
use inspection_cams::{load_cameras, write_metrics_file, AgentConfig, CameraRegistry};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use stream_node::StreamConfig;
use telemetry::LogConfig;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let _log_guard = telemetry::init_structured_logging(
        LogConfig::new("camera-agent").with_version(env!("CARGO_PKG_VERSION")),
    );

    let config = AgentConfig::from_env();
    let cameras = load_cameras(&config.cameras_file)?;
    info!(
        count = cameras.len(),
        file = %config.cameras_file.display(),
        "loaded camera definitions"
    );

    let registry = Arc::new(CameraRegistry::new(
        NegotiationConfig::default(),
        StreamConfig::default(),
        PtzConfig::default(),
    ));

    for camera in cameras {
        let code = camera.code.clone();
        match registry.connect_camera(camera).await {
            Ok(report) if report.success => info!(
                camera = %code,
                port = ?report.active_port,
                mode = %report.mode,
                resolution = ?report.resolution,
                model = ?report.device_model,
                ptz = report.ptz_available,
                "camera connected"
            ),
            Ok(report) => warn!(
                camera = %code,
                mode = %report.mode,
                error = ?report.error,
                "camera unavailable"
            ),
            Err(e) => error!(camera = %code, error = %format!("{:#}", e), "camera setup failed"),
        }
    }

    let stats_task = tokio::spawn(log_stats(
        Arc::clone(&registry),
        config.stats_interval,
        config.metrics_file.clone(),
    ));

    shutdown_signal().await;
    stats_task.abort();
    registry.shutdown().await;

    Ok(())
}

async fn log_stats(registry: Arc<CameraRegistry>, every: Duration, metrics_file: Option<PathBuf>) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        for stats in registry.stats().await {
            info!(
                camera = %stats.camera,
                state = ?stats.state,
                fps = stats.fps,
                frames = stats.frames_total,
                reconnects = stats.reconnect_attempts,
                last_frame_age_ms = ?stats.last_frame_age_ms,
                "stream stats"
            );
        }
        if let Some(path) = &metrics_file {
            if let Err(e) = write_metrics_file(path).await {
                warn!(error = %format!("{:#}", e), "failed to export metrics");
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
            let _ = sigterm.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
}
