//! ONVIF negotiation client.
//!
//! `connect()` walks the candidate port list until the capability handshake
//! answers, then enumerates media profiles, selects one by stream tier and
//! resolves a playable stream URI. Device information and clock sync are
//! best-effort; PTZ support is probed opportunistically.

use crate::parse::{self, checked_document};
use crate::ptz::PtzHandle;
use crate::requests;
use crate::soap::{HttpSoapTransport, OnvifRequest, SoapAuth, SoapTransport};
use crate::stream_uri::{append_channel_params, inject_credentials, select_profile};
use crate::types::{ConnectReport, DeviceInfo, ServiceAddresses};
use crate::xml::XmlElement;
use anyhow::Result;
use chrono::Utc;
use common::env::{env_or, env_ports};
use common::validation::{validate_credentials, validate_uri};
use common::{BestEffort, CameraCredentials, MediaProfile, NegotiationMode, Resolution};
use std::sync::Arc;
use std::time::Duration;
use telemetry::metrics::{NEGOTIATIONS_TOTAL, NEGOTIATION_PORT_PROBES};
use thiserror::Error;
use tracing::{debug, info, warn};

const DEFAULT_PORTS: [u16; 4] = [80, 8000, 8080, 8899];

#[derive(Debug, Clone)]
pub struct NegotiationConfig {
    /// Ports tried after the hint in auto-detect mode
    pub default_ports: Vec<u16>,
    /// Per-request transport timeout; bounds each port attempt
    pub request_timeout: Duration,
    /// Push the host clock to the device after the handshake
    pub sync_clock: bool,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            default_ports: env_ports("ONVIF_DEFAULT_PORTS", &DEFAULT_PORTS),
            request_timeout: Duration::from_secs(env_or("ONVIF_TIMEOUT_SECS", 10)),
            sync_clock: env_or("ONVIF_SYNC_CLOCK", true),
        }
    }
}

/// Terminal failure of one `connect()` call.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum NegotiationError {
    #[error("no reachable ONVIF port ({mode}, tried {tried:?}): {last_error}")]
    NoReachablePort {
        mode: NegotiationMode,
        tried: Vec<u16>,
        last_error: String,
    },
    #[error("handshake ok on port {port} but no usable media profile ({mode}): {last_error}")]
    NoUsableMediaProfile {
        mode: NegotiationMode,
        port: u16,
        last_error: String,
    },
    #[error("stream URI unavailable for profile '{profile_token}' ({mode}): {last_error}")]
    StreamUriUnavailable {
        mode: NegotiationMode,
        port: u16,
        profile_token: String,
        last_error: String,
    },
    #[error("negotiation failed after profile selection ({mode}): {last_error}")]
    PostNegotiationError {
        mode: NegotiationMode,
        port: u16,
        last_error: String,
    },
}

impl NegotiationError {
    pub fn mode(&self) -> NegotiationMode {
        match self {
            NegotiationError::NoReachablePort { mode, .. }
            | NegotiationError::NoUsableMediaProfile { mode, .. }
            | NegotiationError::StreamUriUnavailable { mode, .. }
            | NegotiationError::PostNegotiationError { mode, .. } => *mode,
        }
    }

    /// Underlying transport/protocol error text
    pub fn last_error(&self) -> &str {
        match self {
            NegotiationError::NoReachablePort { last_error, .. }
            | NegotiationError::NoUsableMediaProfile { last_error, .. }
            | NegotiationError::StreamUriUnavailable { last_error, .. }
            | NegotiationError::PostNegotiationError { last_error, .. } => last_error,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            NegotiationError::NoReachablePort { .. } => "no_reachable_port",
            NegotiationError::NoUsableMediaProfile { .. } => "no_usable_media_profile",
            NegotiationError::StreamUriUnavailable { .. } => "stream_uri_unavailable",
            NegotiationError::PostNegotiationError { .. } => "post_negotiation_error",
        }
    }

    fn port(&self) -> Option<u16> {
        match self {
            NegotiationError::NoReachablePort { .. } => None,
            NegotiationError::NoUsableMediaProfile { port, .. }
            | NegotiationError::StreamUriUnavailable { port, .. }
            | NegotiationError::PostNegotiationError { port, .. } => Some(*port),
        }
    }

    /// Failed report for diagnostics; `active_port` is the port that answered, if any.
    pub fn report(&self) -> ConnectReport {
        ConnectReport {
            success: false,
            stream_uri: None,
            resolution: None,
            device_model: None,
            ptz_available: false,
            active_port: self.port(),
            mode: self.mode(),
            profile_token: match self {
                NegotiationError::StreamUriUnavailable { profile_token, .. } => {
                    Some(profile_token.clone())
                }
                _ => None,
            },
            error: Some(self.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
struct Session {
    active_port: u16,
    mode: NegotiationMode,
    device_info: Option<DeviceInfo>,
    profile: MediaProfile,
    stream_uri: String,
    ptz: Option<PtzHandle>,
}

/// Negotiated session with one camera.
pub struct Connection {
    credentials: CameraCredentials,
    config: NegotiationConfig,
    transport: Arc<dyn SoapTransport>,
    session: Option<Session>,
}

impl Connection {
    pub fn new(credentials: CameraCredentials, config: NegotiationConfig) -> Result<Self> {
        let transport = HttpSoapTransport::new(config.request_timeout)?;
        Ok(Self::with_transport(credentials, config, Arc::new(transport)))
    }

    pub fn with_transport(
        credentials: CameraCredentials,
        config: NegotiationConfig,
        transport: Arc<dyn SoapTransport>,
    ) -> Self {
        Self {
            credentials,
            config,
            transport,
            session: None,
        }
    }

    /// Candidate ports in try order, and the mode that produced them.
    pub fn candidate_ports(&self) -> (Vec<u16>, NegotiationMode) {
        if let Some(port) = self.credentials.onvif_port {
            return (vec![port], NegotiationMode::Manual);
        }
        let mut ports = vec![self.credentials.port];
        for port in &self.config.default_ports {
            if !ports.contains(port) {
                ports.push(*port);
            }
        }
        (ports, NegotiationMode::AutoDetect)
    }

    /// Negotiate a fresh session, replacing any previous one.
    pub async fn connect(&mut self) -> Result<ConnectReport, NegotiationError> {
        self.session = None;
        let camera = self.credentials.ip.clone();

        match self.negotiate().await {
            Ok(session) => {
                NEGOTIATIONS_TOTAL.with_label_values(&["success"]).inc();
                info!(
                    camera = %camera,
                    port = session.active_port,
                    mode = %session.mode,
                    profile = %session.profile.token,
                    resolution = ?session.profile.resolution,
                    ptz = session.ptz.is_some(),
                    "camera negotiated"
                );
                self.session = Some(session);
                Ok(self.report())
            }
            Err(err) => {
                NEGOTIATIONS_TOTAL.with_label_values(&[err.kind()]).inc();
                warn!(camera = %camera, mode = %err.mode(), error = %err, "camera negotiation failed");
                Err(err)
            }
        }
    }

    /// Drop all session state. Safe to call repeatedly.
    pub fn disconnect(&mut self) {
        if self.session.take().is_some() {
            debug!(camera = %self.credentials.ip, "camera disconnected");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    pub fn credentials(&self) -> &CameraCredentials {
        &self.credentials
    }

    /// Playable URI with credentials and channel parameters applied.
    pub fn stream_uri(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.stream_uri.as_str())
    }

    pub fn profile(&self) -> Option<&MediaProfile> {
        self.session.as_ref().map(|s| &s.profile)
    }

    pub fn resolution(&self) -> Option<Resolution> {
        self.profile().and_then(|p| p.resolution)
    }

    pub fn active_port(&self) -> Option<u16> {
        self.session.as_ref().map(|s| s.active_port)
    }

    pub fn mode(&self) -> NegotiationMode {
        self.candidate_ports().1
    }

    pub fn device_info(&self) -> Option<&DeviceInfo> {
        self.session.as_ref().and_then(|s| s.device_info.as_ref())
    }

    pub fn device_model(&self) -> Option<&str> {
        self.device_info().and_then(|info| info.model.as_deref())
    }

    pub fn has_ptz(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.ptz.is_some())
    }

    pub fn ptz_handle(&self) -> Option<PtzHandle> {
        self.session.as_ref().and_then(|s| s.ptz.clone())
    }

    /// Snapshot of the current session for the registry and UI.
    pub fn report(&self) -> ConnectReport {
        ConnectReport {
            success: self.is_connected(),
            stream_uri: self.stream_uri().map(str::to_string),
            resolution: self.resolution(),
            device_model: self.device_model().map(str::to_string),
            ptz_available: self.has_ptz(),
            active_port: self.active_port(),
            mode: self.mode(),
            profile_token: self.profile().map(|p| p.token.clone()),
            error: None,
        }
    }

    fn auth(&self) -> Option<SoapAuth> {
        self.credentials
            .has_login()
            .then(|| SoapAuth::new(&self.credentials.username, &self.credentials.password))
    }

    fn device_endpoint(&self, port: u16) -> String {
        let host = &self.credentials.ip;
        if host.contains(':') && !host.starts_with('[') {
            format!("http://[{}]:{}/onvif/device_service", host, port)
        } else {
            format!("http://{}:{}/onvif/device_service", host, port)
        }
    }

    async fn call(&self, endpoint: &str, request: &OnvifRequest) -> Result<XmlElement> {
        let auth = self.auth();
        let response = self.transport.send(endpoint, request, auth.as_ref()).await?;
        checked_document(request.operation, &response)
    }

    async fn negotiate(&self) -> Result<Session, NegotiationError> {
        let (ports, mode) = self.candidate_ports();

        if let Err(e) = validate_credentials(&self.credentials) {
            return Err(NegotiationError::NoReachablePort {
                mode,
                tried: Vec::new(),
                last_error: format!("invalid credentials: {:#}", e),
            });
        }

        let (port, services) = self.find_port(&ports, mode).await?;
        let device_endpoint = self.device_endpoint(port);

        let device_info =
            BestEffort::from_result("device information", self.fetch_device_info(&device_endpoint).await)
                .ok();
        if self.config.sync_clock {
            let sync = BestEffort::from_result("clock sync", self.sync_clock(&device_endpoint).await);
            if sync.is_ignored() {
                debug!(camera = %self.credentials.ip, "device clock left unsynchronised");
            }
        }

        let media_endpoint = services.media.clone().unwrap_or_else(|| device_endpoint.clone());

        let profiles = match self.call(&media_endpoint, &requests::get_profiles()).await {
            Ok(doc) => parse::parse_profiles(&doc),
            Err(e) => {
                return Err(NegotiationError::NoUsableMediaProfile {
                    mode,
                    port,
                    last_error: format!("{:#}", e),
                })
            }
        };
        let profile = select_profile(&profiles, self.credentials.stream_tier)
            .cloned()
            .ok_or_else(|| NegotiationError::NoUsableMediaProfile {
                mode,
                port,
                last_error: "device returned no media profiles".to_string(),
            })?;
        debug!(
            camera = %self.credentials.ip,
            profiles = profiles.len(),
            selected = %profile.token,
            tier = %self.credentials.stream_tier,
            "media profile selected"
        );

        let stream_uri = self
            .resolve_stream_uri(&media_endpoint, &profile, mode, port)
            .await?;
        let ptz = self.probe_ptz(&services, &profile).await;

        Ok(Session {
            active_port: port,
            mode,
            device_info,
            profile,
            stream_uri,
            ptz,
        })
    }

    async fn find_port(
        &self,
        ports: &[u16],
        mode: NegotiationMode,
    ) -> Result<(u16, ServiceAddresses), NegotiationError> {
        let mut last_error = String::from("no candidate ports");
        let mut tried = Vec::with_capacity(ports.len());

        for &port in ports {
            tried.push(port);
            let endpoint = self.device_endpoint(port);
            let outcome = match self.call(&endpoint, &requests::get_capabilities()).await {
                Ok(doc) => parse::parse_capabilities(&doc),
                Err(e) => Err(e),
            };
            match outcome {
                Ok(services) => {
                    NEGOTIATION_PORT_PROBES.with_label_values(&["success"]).inc();
                    debug!(camera = %self.credentials.ip, port, "capability handshake succeeded");
                    return Ok((port, services));
                }
                Err(e) => {
                    NEGOTIATION_PORT_PROBES.with_label_values(&["failure"]).inc();
                    last_error = format!("port {}: {:#}", port, e);
                    debug!(camera = %self.credentials.ip, port, error = %last_error, "capability handshake failed");
                }
            }
        }

        Err(NegotiationError::NoReachablePort {
            mode,
            tried,
            last_error,
        })
    }

    async fn fetch_device_info(&self, endpoint: &str) -> Result<DeviceInfo> {
        let doc = self
            .call(endpoint, &requests::get_device_information())
            .await?;
        parse::parse_device_info(&doc)
    }

    async fn sync_clock(&self, endpoint: &str) -> Result<()> {
        self.call(endpoint, &requests::set_system_date_and_time(Utc::now()))
            .await
            .map(|_| ())
    }

    async fn resolve_stream_uri(
        &self,
        media_endpoint: &str,
        profile: &MediaProfile,
        mode: NegotiationMode,
        port: u16,
    ) -> Result<String, NegotiationError> {
        let request = requests::get_stream_uri(&profile.token, self.credentials.transport);
        let auth = self.auth();

        let post_error = |last_error: String| NegotiationError::PostNegotiationError {
            mode,
            port,
            last_error,
        };
        let unavailable = |last_error: String| NegotiationError::StreamUriUnavailable {
            mode,
            port,
            profile_token: profile.token.clone(),
            last_error,
        };

        let response = self
            .transport
            .send(media_endpoint, &request, auth.as_ref())
            .await
            .map_err(|e| post_error(format!("{:#}", e)))?;
        let doc = checked_document(request.operation, &response)
            .map_err(|e| unavailable(format!("{:#}", e)))?;
        let raw = parse::parse_stream_uri(&doc)
            .ok_or_else(|| unavailable("GetStreamUri response carried no Uri".to_string()))?;

        let mut uri = inject_credentials(
            &raw,
            &self.credentials.username,
            &self.credentials.password,
        );
        if let Some(channel) = self.credentials.channel_id {
            uri = append_channel_params(&uri, channel, self.credentials.stream_tier);
        }
        validate_uri(&uri, "stream uri").map_err(|e| post_error(format!("{:#}", e)))?;
        Ok(uri)
    }

    async fn probe_ptz(&self, services: &ServiceAddresses, profile: &MediaProfile) -> Option<PtzHandle> {
        let Some(endpoint) = services.ptz.clone() else {
            debug!(camera = %self.credentials.ip, "no PTZ service advertised");
            return None;
        };

        let configurations = match self.call(&endpoint, &requests::get_configurations()).await {
            Ok(doc) => parse::parse_ptz_configurations(&doc),
            Err(e) => {
                debug!(camera = %self.credentials.ip, error = %format!("{:#}", e), "PTZ configuration probe failed");
                Vec::new()
            }
        };

        let configuration_token = profile
            .ptz_configuration_token
            .clone()
            .or_else(|| configurations.first().map(|c| c.token.clone()));
        if configuration_token.is_none() {
            debug!(camera = %self.credentials.ip, "PTZ service has no configuration; treating as unavailable");
            return None;
        }

        Some(PtzHandle::new(
            endpoint,
            profile.token.clone(),
            configuration_token,
            self.auth(),
            self.transport.clone(),
        ))
    }
}
