use crate::connection::Connection;
use crate::parse::{self, checked_document, soap_fault};
use crate::requests::{
    self, PtzSpaceRefs, PtzVector, PAN_TILT_VELOCITY_SPACE, ZOOM_VELOCITY_SPACE,
};
use crate::soap::{OnvifRequest, SoapAuth, SoapResponse, SoapTransport};
use crate::types::{MoveStrategy, PtzMoveOutcome, PtzPreset, PtzSpaces};
use crate::xml::XmlElement;
use anyhow::{anyhow, Result};
use common::env::env_or;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use telemetry::metrics::PTZ_COMMANDS_TOTAL;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const STOP_RETRY_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct PtzConfig {
    /// Fraction of the requested velocity used as a relative translation
    pub translation_scale: f32,
    /// Move duration when the caller does not give one
    pub default_duration: Duration,
}

impl Default for PtzConfig {
    fn default() -> Self {
        Self {
            translation_scale: env_or("PTZ_TRANSLATION_SCALE", 0.1),
            default_duration: Duration::from_millis(env_or("PTZ_DEFAULT_DURATION_MS", 500)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PtzError {
    #[error("PTZ is not available on this camera")]
    PtzUnavailable,
    #[error("all PTZ move methods failed: {}", .failures.join("; "))]
    AllMethodsFailed { failures: Vec<String> },
    /// A continuous move was accepted but no stop got through; the camera
    /// may still be moving.
    #[error("PTZ {} move accepted but stop failed, camera may still be moving: {reason}", .strategy.as_str())]
    MotionNotStopped {
        strategy: MoveStrategy,
        reason: String,
    },
    #[error("PTZ {operation} failed: {reason}")]
    Request {
        operation: &'static str,
        reason: String,
    },
}

/// PTZ service address and tokens captured during negotiation.
#[derive(Clone)]
pub struct PtzHandle {
    endpoint: String,
    profile_token: String,
    configuration_token: Option<String>,
    auth: Option<SoapAuth>,
    transport: Arc<dyn SoapTransport>,
}

impl fmt::Debug for PtzHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PtzHandle")
            .field("endpoint", &self.endpoint)
            .field("profile_token", &self.profile_token)
            .field("configuration_token", &self.configuration_token)
            .finish_non_exhaustive()
    }
}

impl PtzHandle {
    pub fn new(
        endpoint: String,
        profile_token: String,
        configuration_token: Option<String>,
        auth: Option<SoapAuth>,
        transport: Arc<dyn SoapTransport>,
    ) -> Self {
        Self {
            endpoint,
            profile_token,
            configuration_token,
            auth,
            transport,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn profile_token(&self) -> &str {
        &self.profile_token
    }

    async fn send(&self, request: &OnvifRequest) -> Result<SoapResponse> {
        self.transport
            .send(&self.endpoint, request, self.auth.as_ref())
            .await
    }

    /// Command call: HTTP < 400 and no SOAP fault. An empty or non-XML
    /// success body is accepted.
    async fn execute(&self, request: &OnvifRequest) -> Result<()> {
        let response = self.send(request).await?;
        if let Ok(doc) = XmlElement::parse(&response.body) {
            if let Some(reason) = soap_fault(&doc) {
                return Err(anyhow!("{} fault: {}", request.operation, reason));
            }
        }
        if !response.is_http_success() {
            return Err(anyhow!(
                "{} failed with HTTP {}",
                request.operation,
                response.status
            ));
        }
        Ok(())
    }

    async fn query(&self, request: &OnvifRequest) -> Result<XmlElement> {
        let response = self.send(request).await?;
        checked_document(request.operation, &response)
    }
}

/// Motion and preset control over a negotiated PTZ handle.
pub struct PtzController {
    handle: Option<PtzHandle>,
    config: PtzConfig,
    spaces: Mutex<Option<PtzSpaces>>,
}

impl PtzController {
    pub fn new(connection: &Connection, config: PtzConfig) -> Self {
        Self::from_handle(connection.ptz_handle(), config)
    }

    pub fn from_handle(handle: Option<PtzHandle>, config: PtzConfig) -> Self {
        Self {
            handle,
            config,
            spaces: Mutex::new(None),
        }
    }

    pub fn is_available(&self) -> bool {
        self.handle.is_some()
    }

    pub fn config(&self) -> &PtzConfig {
        &self.config
    }

    fn handle(&self) -> Result<&PtzHandle, PtzError> {
        self.handle.as_ref().ok_or(PtzError::PtzUnavailable)
    }

    /// Move by velocity for `duration`, walking the fallback chain until a
    /// variant is accepted. Inputs are clamped to `[-1, 1]`.
    pub async fn move_camera(
        &self,
        pan: f32,
        tilt: f32,
        zoom: f32,
        duration: Duration,
    ) -> Result<PtzMoveOutcome, PtzError> {
        let handle = self.handle()?;
        let velocity = PtzVector {
            pan: clamp_unit(pan),
            tilt: clamp_unit(tilt),
            zoom: clamp_unit(zoom),
        };
        let spaces = self.spaces(handle).await;

        let mut failures = Vec::new();
        for strategy in MoveStrategy::CHAIN {
            let request = self.move_request(handle, strategy, velocity, &spaces);
            match handle.execute(&request).await {
                Ok(()) => {
                    PTZ_COMMANDS_TOTAL
                        .with_label_values(&[strategy.as_str(), "success"])
                        .inc();
                    info!(
                        method = strategy.as_str(),
                        pan = velocity.pan,
                        tilt = velocity.tilt,
                        zoom = velocity.zoom,
                        fallbacks = failures.len(),
                        "PTZ move accepted"
                    );

                    let stopped = if strategy.needs_stop() {
                        tokio::time::sleep(duration).await;
                        self.stop_after_move(handle)
                            .await
                            .map_err(|reason| PtzError::MotionNotStopped { strategy, reason })?;
                        true
                    } else {
                        false
                    };
                    return Ok(PtzMoveOutcome {
                        strategy,
                        failed_attempts: failures,
                        stopped,
                    });
                }
                Err(e) => {
                    PTZ_COMMANDS_TOTAL
                        .with_label_values(&[strategy.as_str(), "failure"])
                        .inc();
                    debug!(method = strategy.as_str(), error = %format!("{:#}", e), "PTZ move variant rejected");
                    failures.push(format!("{}: {:#}", strategy.as_str(), e));
                }
            }
        }

        warn!(failures = ?failures, "all PTZ move methods failed");
        Err(PtzError::AllMethodsFailed { failures })
    }

    /// `move_camera` for the configured default duration.
    pub async fn nudge(&self, pan: f32, tilt: f32, zoom: f32) -> Result<PtzMoveOutcome, PtzError> {
        self.move_camera(pan, tilt, zoom, self.config.default_duration)
            .await
    }

    /// Stop pan/tilt and zoom.
    pub async fn stop(&self) -> Result<(), PtzError> {
        let handle = self.handle()?;
        let result = handle
            .execute(&requests::stop(&handle.profile_token, true, true))
            .await;
        record("stop", &result);
        result.map_err(|e| PtzError::Request {
            operation: "stop",
            reason: format!("{:#}", e),
        })
    }

    pub async fn get_presets(&self) -> Result<Vec<PtzPreset>, PtzError> {
        let handle = self.handle()?;
        let result = handle
            .query(&requests::get_presets(&handle.profile_token))
            .await;
        record("get_presets", &result);
        result
            .map(|doc| parse::parse_presets(&doc))
            .map_err(|e| PtzError::Request {
                operation: "get_presets",
                reason: format!("{:#}", e),
            })
    }

    pub async fn goto_preset(&self, preset_token: &str) -> Result<(), PtzError> {
        let handle = self.handle()?;
        if preset_token.trim().is_empty() {
            return Err(PtzError::Request {
                operation: "goto_preset",
                reason: "preset token is empty".to_string(),
            });
        }
        let result = handle
            .execute(&requests::goto_preset(&handle.profile_token, preset_token))
            .await;
        record("goto_preset", &result);
        result.map_err(|e| PtzError::Request {
            operation: "goto_preset",
            reason: format!("{:#}", e),
        })
    }

    fn move_request(
        &self,
        handle: &PtzHandle,
        strategy: MoveStrategy,
        velocity: PtzVector,
        spaces: &PtzSpaces,
    ) -> OnvifRequest {
        match strategy {
            MoveStrategy::ContinuousPlain => {
                requests::continuous_move(&handle.profile_token, velocity, None)
            }
            MoveStrategy::ContinuousWithSpace => requests::continuous_move(
                &handle.profile_token,
                velocity,
                Some(PtzSpaceRefs {
                    pan_tilt: spaces
                        .pan_tilt_velocity
                        .as_deref()
                        .unwrap_or(PAN_TILT_VELOCITY_SPACE),
                    zoom: spaces
                        .zoom_velocity
                        .as_deref()
                        .unwrap_or(ZOOM_VELOCITY_SPACE),
                }),
            ),
            MoveStrategy::Relative => {
                let scale = self.config.translation_scale;
                let translation = PtzVector {
                    pan: velocity.pan * scale,
                    tilt: velocity.tilt * scale,
                    zoom: velocity.zoom * scale,
                };
                let refs = match (&spaces.pan_tilt_translation, &spaces.zoom_translation) {
                    (Some(pan_tilt), Some(zoom)) => Some(PtzSpaceRefs {
                        pan_tilt: pan_tilt.as_str(),
                        zoom: zoom.as_str(),
                    }),
                    _ => None,
                };
                requests::relative_move(&handle.profile_token, translation, refs)
            }
        }
    }

    /// Stop after a continuous move, retrying once after [`STOP_RETRY_DELAY`].
    async fn stop_after_move(&self, handle: &PtzHandle) -> Result<(), String> {
        let request = requests::stop(&handle.profile_token, true, true);
        let mut last_error = String::new();
        for attempt in 1..=2 {
            let result = handle.execute(&request).await;
            record("stop", &result);
            match result {
                Ok(()) => return Ok(()),
                Err(e) => {
                    last_error = format!("{:#}", e);
                    warn!(attempt, error = %last_error, "PTZ stop after move failed");
                }
            }
            if attempt == 1 {
                tokio::time::sleep(STOP_RETRY_DELAY).await;
            }
        }
        Err(last_error)
    }

    /// Supported coordinate spaces, fetched on first use and cached once the
    /// lookup completes.
    async fn spaces(&self, handle: &PtzHandle) -> PtzSpaces {
        let mut cached = self.spaces.lock().await;
        if let Some(spaces) = cached.as_ref() {
            return spaces.clone();
        }
        match fetch_spaces(handle).await {
            Ok(spaces) => {
                debug!(spaces = ?spaces, "PTZ coordinate spaces cached");
                *cached = Some(spaces.clone());
                spaces
            }
            Err(e) => {
                warn!(error = %format!("{:#}", e), "PTZ node lookup failed; using generic spaces");
                PtzSpaces::default()
            }
        }
    }
}

async fn fetch_spaces(handle: &PtzHandle) -> Result<PtzSpaces> {
    let doc = handle.query(&requests::get_configurations()).await?;
    let configurations = parse::parse_ptz_configurations(&doc);
    let configuration = configurations
        .iter()
        .find(|c| Some(&c.token) == handle.configuration_token.as_ref())
        .or_else(|| configurations.first());

    let Some(node_token) = configuration.and_then(|c| c.node_token.as_deref()) else {
        return Ok(PtzSpaces::default());
    };
    let node = handle.query(&requests::get_node(node_token)).await?;
    parse::parse_ptz_node(&node)
}

fn record<T>(operation: &str, result: &Result<T>) {
    let status = if result.is_ok() { "success" } else { "failure" };
    PTZ_COMMANDS_TOTAL
        .with_label_values(&[operation, status])
        .inc();
}

fn clamp_unit(value: f32) -> f32 {
    if value.is_finite() {
        value.clamp(-1.0, 1.0)
    } else {
        0.0
    }
}
