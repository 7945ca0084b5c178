//! Scripted camera backends shared by the integration tests.

#![allow(dead_code)]

use anyhow::{bail, Result};
use async_trait::async_trait;
use device_manager::{OnvifRequest, SoapAuth, SoapResponse, SoapTransport};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use stream_node::{DecodeError, Frame, SourceFactory, VideoSource};
use common::TransportMode;

#[derive(Debug, Clone)]
pub struct Call {
    pub operation: String,
    pub endpoint: String,
    pub body: String,
    pub authenticated: bool,
}

/// ONVIF device answering on a single port.
///
/// The device service refuses connections on every other port; media and PTZ
/// services are reachable through the addresses advertised in the handshake.
pub struct StubCamera {
    pub host: String,
    pub live_port: u16,
    pub model: String,
    /// `(token, Some((width, height)))` per profile, in device order
    pub profiles: Vec<(String, Option<(u32, u32)>)>,
    pub stream_uri: Option<String>,
    pub ptz: bool,
    /// Move methods answered with a SOAP fault: "continuous", "continuous_space", "relative", "stop"
    pub rejected: HashSet<&'static str>,
    /// Stop requests answered with a fault before stops start succeeding
    pub failing_stops: AtomicUsize,
    pub calls: Mutex<Vec<Call>>,
}

impl StubCamera {
    pub fn new(host: &str, live_port: u16) -> Self {
        Self {
            host: host.to_string(),
            live_port,
            model: "DS-2CD2345".to_string(),
            profiles: vec![("profile_1".to_string(), Some((1280, 720)))],
            stream_uri: Some(format!("rtsp://{}:554/Streaming/Channels/101", host)),
            ptz: false,
            rejected: HashSet::new(),
            failing_stops: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_profiles(mut self, profiles: &[(&str, Option<(u32, u32)>)]) -> Self {
        self.profiles = profiles
            .iter()
            .map(|(token, res)| (token.to_string(), *res))
            .collect();
        self
    }

    pub fn with_ptz(mut self) -> Self {
        self.ptz = true;
        self
    }

    pub fn without_stream_uri(mut self) -> Self {
        self.stream_uri = None;
        self
    }

    pub fn rejecting(mut self, methods: &[&'static str]) -> Self {
        self.rejected.extend(methods.iter().copied());
        self
    }

    pub fn failing_stops(self, count: usize) -> Self {
        self.failing_stops.store(count, Ordering::SeqCst);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn operations(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.operation).collect()
    }

    pub fn count(&self, operation: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.operation == operation)
            .count()
    }

    fn service(&self, path: &str) -> String {
        format!("http://{}:{}/onvif/{}", self.host, self.live_port, path)
    }

    fn capabilities(&self) -> String {
        let ptz = if self.ptz {
            format!("<tt:PTZ><tt:XAddr>{}</tt:XAddr></tt:PTZ>", self.service("ptz_service"))
        } else {
            String::new()
        };
        format!(
            "<tds:GetCapabilitiesResponse><tds:Capabilities><tt:Media><tt:XAddr>{}</tt:XAddr></tt:Media>{}</tds:Capabilities></tds:GetCapabilitiesResponse>",
            self.service("media_service"),
            ptz
        )
    }

    fn profiles_body(&self) -> String {
        let mut body = String::from("<trt:GetProfilesResponse>");
        for (token, resolution) in &self.profiles {
            body.push_str(&format!(r#"<trt:Profiles token="{}"><tt:Name>{}</tt:Name>"#, token, token));
            if let Some((w, h)) = resolution {
                body.push_str(&format!(
                    "<tt:VideoEncoderConfiguration><tt:Resolution><tt:Width>{}</tt:Width><tt:Height>{}</tt:Height></tt:Resolution></tt:VideoEncoderConfiguration>",
                    w, h
                ));
            }
            body.push_str("</trt:Profiles>");
        }
        body.push_str("</trt:GetProfilesResponse>");
        body
    }

    fn move_method(request: &OnvifRequest) -> &'static str {
        match request.operation {
            "ContinuousMove" if request.body.contains("space=") => "continuous_space",
            "ContinuousMove" => "continuous",
            "RelativeMove" => "relative",
            _ => "stop",
        }
    }
}

fn envelope(body: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope"><s:Body>{}</s:Body></s:Envelope>"#,
        body
    )
}

fn ok(body: &str) -> SoapResponse {
    SoapResponse {
        status: 200,
        body: envelope(body),
    }
}

fn fault(reason: &str) -> SoapResponse {
    SoapResponse {
        status: 500,
        body: envelope(&format!(
            "<s:Fault><s:Code><s:Value>s:Receiver</s:Value></s:Code><s:Reason><s:Text>{}</s:Text></s:Reason></s:Fault>",
            reason
        )),
    }
}

#[async_trait]
impl SoapTransport for StubCamera {
    async fn send(
        &self,
        endpoint: &str,
        request: &OnvifRequest,
        auth: Option<&SoapAuth>,
    ) -> Result<SoapResponse> {
        self.calls.lock().unwrap().push(Call {
            operation: request.operation.to_string(),
            endpoint: endpoint.to_string(),
            body: request.body.clone(),
            authenticated: auth.is_some(),
        });

        if endpoint.contains("/onvif/device_service")
            && !endpoint.contains(&format!(":{}/", self.live_port))
        {
            bail!("error sending request for url ({}): connection refused", endpoint);
        }

        let response = match request.operation {
            "GetCapabilities" => ok(&self.capabilities()),
            "GetDeviceInformation" => ok(&format!(
                "<tds:GetDeviceInformationResponse><tds:Manufacturer>Hikvision</tds:Manufacturer><tds:Model>{}</tds:Model><tds:FirmwareVersion>V5.5.0</tds:FirmwareVersion><tds:SerialNumber>SN123</tds:SerialNumber></tds:GetDeviceInformationResponse>",
                self.model
            )),
            "SetSystemDateAndTime" => ok("<tds:SetSystemDateAndTimeResponse/>"),
            "GetProfiles" => ok(&self.profiles_body()),
            "GetStreamUri" => match &self.stream_uri {
                Some(uri) => ok(&format!(
                    "<trt:GetStreamUriResponse><trt:MediaUri><tt:Uri>{}</tt:Uri></trt:MediaUri></trt:GetStreamUriResponse>",
                    uri
                )),
                None => fault("stream uri not supported"),
            },
            "GetConfigurations" if self.ptz => ok(
                r#"<tptz:GetConfigurationsResponse><tptz:PTZConfiguration token="ptz_cfg"><tt:NodeToken>ptz_node</tt:NodeToken></tptz:PTZConfiguration></tptz:GetConfigurationsResponse>"#,
            ),
            "GetNode" => ok(
                "<tptz:GetNodeResponse><tptz:PTZNode token=\"ptz_node\"><tt:SupportedPTZSpaces><tt:ContinuousPanTiltVelocitySpace><tt:URI>http://www.onvif.org/ver10/tptz/PanTiltSpaces/VelocityGenericSpace</tt:URI></tt:ContinuousPanTiltVelocitySpace><tt:ContinuousZoomVelocitySpace><tt:URI>http://www.onvif.org/ver10/tptz/ZoomSpaces/VelocityGenericSpace</tt:URI></tt:ContinuousZoomVelocitySpace></tt:SupportedPTZSpaces></tptz:PTZNode></tptz:GetNodeResponse>",
            ),
            "ContinuousMove" | "RelativeMove" | "Stop" => {
                let method = Self::move_method(request);
                let transient_stop_failure = method == "stop"
                    && self
                        .failing_stops
                        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                        .is_ok();
                if self.rejected.contains(method) || transient_stop_failure {
                    fault(&format!("{} rejected", method))
                } else {
                    ok("")
                }
            }
            "GetPresets" => ok(
                r#"<tptz:GetPresetsResponse><tptz:Preset token="1"><tt:Name>Gate</tt:Name></tptz:Preset><tptz:Preset token="2"><tt:Name>Yard</tt:Name></tptz:Preset></tptz:GetPresetsResponse>"#,
            ),
            "GotoPreset" => ok("<tptz:GotoPresetResponse/>"),
            _ => fault("action not supported"),
        };
        Ok(response)
    }
}

/// Checkerboard frame that passes the solid-color check.
pub fn textured_frame(width: u32, height: u32) -> Frame {
    let data: Vec<u8> = (0..width * height)
        .flat_map(|i| {
            let v = if (i + i / width) % 2 == 0 { 16 } else { 235 };
            [v, v, v]
        })
        .collect();
    Frame::from_rgb(width, height, data).unwrap()
}

pub fn gray_frame(width: u32, height: u32) -> Frame {
    Frame::solid(width, height, [128, 128, 128])
}

/// Shared control block for every decoder a factory hands out.
#[derive(Default)]
pub struct SourceScript {
    pub opens: AtomicUsize,
    pub reads: AtomicUsize,
    pub releases: AtomicUsize,
    pub fail_open: AtomicBool,
    /// Next read fails and closes the decoder
    pub fail_next_read: AtomicBool,
    /// Reads return `Ok(None)` (connected, no data)
    pub starve: AtomicBool,
}

impl SourceScript {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        let script = Self::default();
        script.fail_open.store(true, Ordering::SeqCst);
        Arc::new(script)
    }

    pub fn factory(self: &Arc<Self>) -> SourceFactory {
        let script = Arc::clone(self);
        Arc::new(move || {
            Box::new(ScriptedSource {
                script: Arc::clone(&script),
                open: false,
            }) as Box<dyn VideoSource>
        })
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

pub struct ScriptedSource {
    script: Arc<SourceScript>,
    open: bool,
}

impl VideoSource for ScriptedSource {
    fn open(&mut self, _uri: &str, _transport: TransportMode) -> Result<(), DecodeError> {
        self.script.opens.fetch_add(1, Ordering::SeqCst);
        if self.script.fail_open.load(Ordering::SeqCst) {
            self.open = false;
            return Err(DecodeError::Open("connection refused".to_string()));
        }
        self.open = true;
        Ok(())
    }

    fn read(&mut self) -> Result<Option<Frame>, DecodeError> {
        if !self.open {
            return Err(DecodeError::NotOpen);
        }
        std::thread::sleep(Duration::from_millis(2));
        self.script.reads.fetch_add(1, Ordering::SeqCst);
        if self.script.fail_next_read.swap(false, Ordering::SeqCst) {
            self.open = false;
            return Err(DecodeError::Read("connection reset".to_string()));
        }
        if self.script.starve.load(Ordering::SeqCst) {
            return Ok(None);
        }
        Ok(Some(textured_frame(32, 24)))
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn release(&mut self) {
        if self.open {
            self.script.releases.fetch_add(1, Ordering::SeqCst);
        }
        self.open = false;
    }
}
