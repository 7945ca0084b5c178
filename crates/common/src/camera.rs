//! Camera-facing data model shared by negotiation, streaming and PTZ.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::str::FromStr;

/// Which encoder profile a camera should be negotiated onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StreamTier {
    /// Highest advertised resolution
    #[default]
    Main,
    /// Lowest advertised resolution
    Sub,
}

impl StreamTier {
    /// NVR `subtype` query value for this tier.
    pub fn subtype(self) -> u8 {
        match self {
            StreamTier::Main => 0,
            StreamTier::Sub => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StreamTier::Main => "main",
            StreamTier::Sub => "sub",
        }
    }
}

impl FromStr for StreamTier {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "main" => Ok(StreamTier::Main),
            "sub" => Ok(StreamTier::Sub),
            other => Err(anyhow::anyhow!("unknown stream tier '{}'", other)),
        }
    }
}

impl Display for StreamTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport used for the media session (RTSP interleaved vs RTP over UDP).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    #[default]
    Tcp,
    Udp,
}

impl TransportMode {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportMode::Tcp => "tcp",
            TransportMode::Udp => "udp",
        }
    }
}

impl FromStr for TransportMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(TransportMode::Tcp),
            "udp" => Ok(TransportMode::Udp),
            other => Err(anyhow::anyhow!("unknown transport mode '{}'", other)),
        }
    }
}

impl Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection parameters for one camera, as supplied by the registry layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraCredentials {
    pub ip: String,
    /// Port hint; tried first in auto-detect mode
    #[serde(default = "default_port_hint")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Pins negotiation to a single port ("manual" mode)
    #[serde(default)]
    pub onvif_port: Option<u16>,
    /// NVR channel behind a shared control endpoint
    #[serde(default)]
    pub channel_id: Option<u32>,
    #[serde(default)]
    pub stream_tier: StreamTier,
    #[serde(default)]
    pub transport: TransportMode,
}

fn default_port_hint() -> u16 {
    80
}

impl CameraCredentials {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
            username: String::new(),
            password: String::new(),
            onvif_port: None,
            channel_id: None,
            stream_tier: StreamTier::Main,
            transport: TransportMode::Tcp,
        }
    }

    pub fn with_login(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    pub fn with_onvif_port(mut self, port: u16) -> Self {
        self.onvif_port = Some(port);
        self
    }

    pub fn with_channel(mut self, channel_id: u32) -> Self {
        self.channel_id = Some(channel_id);
        self
    }

    pub fn with_tier(mut self, tier: StreamTier) -> Self {
        self.stream_tier = tier;
        self
    }

    pub fn with_transport(mut self, transport: TransportMode) -> Self {
        self.transport = transport;
        self
    }

    pub fn has_login(&self) -> bool {
        !self.username.is_empty()
    }
}

/// Pixel dimensions of an encoder configuration or a decoded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

impl Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// One advertised encoder configuration of a camera.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaProfile {
    pub token: String,
    pub name: Option<String>,
    pub resolution: Option<Resolution>,
    pub frame_rate_limit: Option<u32>,
    /// PTZ configuration bound to this profile, when advertised
    pub ptz_configuration_token: Option<String>,
}

impl MediaProfile {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            name: None,
            resolution: None,
            frame_rate_limit: None,
            ptz_configuration_token: None,
        }
    }

    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.resolution = Some(Resolution::new(width, height));
        self
    }
}

/// How the candidate port list was built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NegotiationMode {
    /// Caller pinned an explicit ONVIF port
    #[serde(rename = "manual")]
    Manual,
    /// Hint first, then the default port list
    #[serde(rename = "auto-detect")]
    AutoDetect,
}

impl NegotiationMode {
    pub fn as_str(self) -> &'static str {
        match self {
            NegotiationMode::Manual => "manual",
            NegotiationMode::AutoDetect => "auto-detect",
        }
    }
}

impl Display for NegotiationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
