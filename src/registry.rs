//! Explicitly owned camera registry.
//!
//! Maps camera codes to their negotiated connection, stream engine and PTZ
//! controller. Negotiation results are kept for every camera, connected or
//! not, so callers can report connection diagnostics.

use crate::config::CameraDefinition;
use anyhow::{anyhow, Context, Result};
use device_manager::{
    ConnectReport, Connection, NegotiationConfig, PtzConfig, PtzController, SoapTransport,
};
use std::collections::HashMap;
use std::sync::Arc;
use stream_node::{
    FfmpegSource, SnapshotOutcome, SourceFactory, StreamConfig, StreamEngine, StreamStats,
};
use tokio::sync::RwLock;
use tracing::{info, warn};

struct LiveCamera {
    connection: Connection,
    engine: Arc<StreamEngine>,
    ptz: Arc<PtzController>,
}

struct CameraEntry {
    definition: CameraDefinition,
    report: ConnectReport,
    live: Option<LiveCamera>,
}

pub struct CameraRegistry {
    negotiation: NegotiationConfig,
    stream: StreamConfig,
    ptz: PtzConfig,
    /// Shared SOAP transport; each connection builds its own HTTP client when unset
    transport: Option<Arc<dyn SoapTransport>>,
    source_factory: SourceFactory,
    cameras: RwLock<HashMap<String, CameraEntry>>,
}

impl CameraRegistry {
    pub fn new(negotiation: NegotiationConfig, stream: StreamConfig, ptz: PtzConfig) -> Self {
        let source_factory = FfmpegSource::factory(stream.stale_timeout);
        Self {
            negotiation,
            stream,
            ptz,
            transport: None,
            source_factory,
            cameras: RwLock::new(HashMap::new()),
        }
    }

    /// Registry wired to caller-supplied SOAP and decoder backends.
    pub fn with_backends(
        negotiation: NegotiationConfig,
        stream: StreamConfig,
        ptz: PtzConfig,
        transport: Arc<dyn SoapTransport>,
        source_factory: SourceFactory,
    ) -> Self {
        Self {
            negotiation,
            stream,
            ptz,
            transport: Some(transport),
            source_factory,
            cameras: RwLock::new(HashMap::new()),
        }
    }

    fn connection_for(&self, definition: &CameraDefinition) -> Result<Connection> {
        let credentials = definition.credentials.clone();
        match &self.transport {
            Some(transport) => Ok(Connection::with_transport(
                credentials,
                self.negotiation.clone(),
                Arc::clone(transport),
            )),
            None => Connection::new(credentials, self.negotiation.clone()),
        }
    }

    /// Negotiate a camera and start its stream, replacing any existing
    /// session under the same code.
    ///
    /// A failed negotiation is not an error here: the returned report carries
    /// `success = false` and the failure text, and is kept for `reports()`.
    pub async fn connect_camera(&self, definition: CameraDefinition) -> Result<ConnectReport> {
        let code = definition.code.clone();
        self.disconnect_camera(&code).await;

        let mut connection = self
            .connection_for(&definition)
            .with_context(|| format!("failed to set up connection for camera {}", code))?;

        let report = match connection.connect().await {
            Ok(report) => report,
            Err(err) => {
                let report = err.report();
                self.cameras.write().await.insert(
                    code,
                    CameraEntry {
                        definition,
                        report: report.clone(),
                        live: None,
                    },
                );
                return Ok(report);
            }
        };

        let uri = connection
            .stream_uri()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("camera {} negotiated without a stream uri", code))?;
        let engine = Arc::new(StreamEngine::new(
            code.clone(),
            definition.credentials.transport,
            self.stream.clone(),
            Arc::clone(&self.source_factory),
        ));
        let ptz = Arc::new(PtzController::new(&connection, self.ptz.clone()));

        let starting = Arc::clone(&engine);
        let streaming = tokio::task::spawn_blocking(move || starting.start(&uri))
            .await
            .context("stream start task failed")?;
        if streaming {
            info!(camera = %code, ptz = ptz.is_available(), "camera streaming");
        } else {
            warn!(camera = %code, "camera negotiated but stream not open yet; capture loop will retry");
        }

        self.cameras.write().await.insert(
            code,
            CameraEntry {
                definition,
                report: report.clone(),
                live: Some(LiveCamera {
                    connection,
                    engine,
                    ptz,
                }),
            },
        );
        Ok(report)
    }

    /// Stop the stream and drop the session. Returns whether the code was known.
    pub async fn disconnect_camera(&self, code: &str) -> bool {
        let Some(entry) = self.cameras.write().await.remove(code) else {
            return false;
        };

        if let Some(mut live) = entry.live {
            let engine = Arc::clone(&live.engine);
            if let Err(e) = tokio::task::spawn_blocking(move || engine.stop()).await {
                warn!(camera = %code, error = %e, "stream stop task failed");
            }
            live.connection.disconnect();
            info!(camera = %code, "camera disconnected");
        }
        true
    }

    pub async fn engine(&self, code: &str) -> Option<Arc<StreamEngine>> {
        self.cameras
            .read()
            .await
            .get(code)
            .and_then(|entry| entry.live.as_ref())
            .map(|live| Arc::clone(&live.engine))
    }

    pub async fn ptz(&self, code: &str) -> Option<Arc<PtzController>> {
        self.cameras
            .read()
            .await
            .get(code)
            .and_then(|entry| entry.live.as_ref())
            .map(|live| Arc::clone(&live.ptz))
    }

    /// Latest negotiation report per camera, ordered by code.
    pub async fn reports(&self) -> Vec<(String, ConnectReport)> {
        let cameras = self.cameras.read().await;
        let mut reports: Vec<_> = cameras
            .iter()
            .map(|(code, entry)| (code.clone(), entry.report.clone()))
            .collect();
        reports.sort_by(|a, b| a.0.cmp(&b.0));
        reports
    }

    pub async fn stats(&self) -> Vec<StreamStats> {
        let cameras = self.cameras.read().await;
        let mut stats: Vec<_> = cameras
            .values()
            .filter_map(|entry| entry.live.as_ref())
            .map(|live| live.engine.stats())
            .collect();
        stats.sort_by(|a, b| a.camera.cmp(&b.camera));
        stats
    }

    /// Snapshot of a connected camera, named after its code and location.
    pub async fn capture_image(&self, code: &str) -> Result<SnapshotOutcome> {
        let (engine, location) = {
            let cameras = self.cameras.read().await;
            let entry = cameras
                .get(code)
                .ok_or_else(|| anyhow!("unknown camera {}", code))?;
            let live = entry
                .live
                .as_ref()
                .ok_or_else(|| anyhow!("camera {} is not connected", code))?;
            (Arc::clone(&live.engine), entry.definition.location.clone())
        };
        Ok(engine.capture_image(code, &location).await?)
    }

    pub async fn shutdown(&self) {
        let codes: Vec<String> = self.cameras.read().await.keys().cloned().collect();
        for code in codes {
            self.disconnect_camera(&code).await;
        }
        info!("camera registry shut down");
    }
}
