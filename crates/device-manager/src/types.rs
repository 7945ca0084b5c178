use common::{NegotiationMode, Resolution};
use serde::{Deserialize, Serialize};

/// Service addresses advertised in the capability handshake
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceAddresses {
    pub media: Option<String>,
    pub ptz: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub firmware_version: Option<String>,
    pub serial_number: Option<String>,
}

/// Structured result of one `connect()` call, consumed by the registry and UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectReport {
    pub success: bool,
    pub stream_uri: Option<String>,
    pub resolution: Option<Resolution>,
    pub device_model: Option<String>,
    pub ptz_available: bool,
    pub active_port: Option<u16>,
    pub mode: NegotiationMode,
    pub profile_token: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PtzConfigurationInfo {
    pub token: String,
    pub node_token: Option<String>,
}

/// Coordinate spaces a PTZ node advertises; `None` when not exposed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PtzSpaces {
    pub pan_tilt_velocity: Option<String>,
    pub zoom_velocity: Option<String>,
    pub pan_tilt_translation: Option<String>,
    pub zoom_translation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PtzPreset {
    pub token: String,
    pub name: Option<String>,
}

/// Which command variant carried a PTZ move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoveStrategy {
    /// ContinuousMove without space annotations
    ContinuousPlain,
    /// ContinuousMove with the advertised velocity spaces
    ContinuousWithSpace,
    /// RelativeMove by a small fixed translation
    Relative,
}

impl MoveStrategy {
    /// Fallback order for `move_camera`.
    pub const CHAIN: [MoveStrategy; 3] = [
        MoveStrategy::ContinuousPlain,
        MoveStrategy::ContinuousWithSpace,
        MoveStrategy::Relative,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MoveStrategy::ContinuousPlain => "continuous",
            MoveStrategy::ContinuousWithSpace => "continuous_space",
            MoveStrategy::Relative => "relative",
        }
    }

    /// Continuous moves run until stopped; relative moves end on their own.
    pub fn needs_stop(self) -> bool {
        !matches!(self, MoveStrategy::Relative)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PtzMoveOutcome {
    pub strategy: MoveStrategy,
    /// Variants tried before the one that succeeded
    pub failed_attempts: Vec<String>,
    /// A Stop was sent and accepted; relative moves never need one
    pub stopped: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_strategy_is_self_terminating() {
        assert!(MoveStrategy::ContinuousPlain.needs_stop());
        assert!(MoveStrategy::ContinuousWithSpace.needs_stop());
        assert!(!MoveStrategy::Relative.needs_stop());
        assert_eq!(MoveStrategy::CHAIN[2], MoveStrategy::Relative);
    }

    #[test]
    fn connect_report_serializes_mode() {
        let report = ConnectReport {
            success: false,
            stream_uri: None,
            resolution: None,
            device_model: None,
            ptz_available: false,
            active_port: None,
            mode: NegotiationMode::AutoDetect,
            profile_token: None,
            error: Some("connection refused".to_string()),
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["mode"], "auto-detect");
        assert_eq!(json["error"], "connection refused");
    }
}
