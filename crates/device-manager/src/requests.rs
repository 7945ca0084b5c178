//! Request builders for the device, media and PTZ services.

use crate::soap::OnvifRequest;
use chrono::{DateTime, Datelike, Timelike, Utc};
use common::TransportMode;
use std::borrow::Cow;

pub const DEVICE_ACTION_NS: &str = "http://www.onvif.org/ver10/device/wsdl";
pub const MEDIA_ACTION_NS: &str = "http://www.onvif.org/ver10/media/wsdl";
pub const PTZ_ACTION_NS: &str = "http://www.onvif.org/ver20/ptz/wsdl";
pub const TT_NS: &str = "http://www.onvif.org/ver10/schema";

pub const PAN_TILT_VELOCITY_SPACE: &str =
    "http://www.onvif.org/ver10/tptz/PanTiltSpaces/VelocityGenericSpace";
pub const ZOOM_VELOCITY_SPACE: &str =
    "http://www.onvif.org/ver10/tptz/ZoomSpaces/VelocityGenericSpace";
pub const PAN_TILT_TRANSLATION_SPACE: &str =
    "http://www.onvif.org/ver10/tptz/PanTiltSpaces/TranslationGenericSpace";
pub const ZOOM_TRANSLATION_SPACE: &str =
    "http://www.onvif.org/ver10/tptz/ZoomSpaces/TranslationGenericSpace";

/// Pan/tilt/zoom triple; velocities for continuous moves, offsets for relative ones.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PtzVector {
    pub pan: f32,
    pub tilt: f32,
    pub zoom: f32,
}

/// Coordinate-space URIs attached to PanTilt and Zoom elements.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PtzSpaceRefs<'a> {
    pub pan_tilt: &'a str,
    pub zoom: &'a str,
}

pub fn get_capabilities() -> OnvifRequest {
    build(
        DEVICE_ACTION_NS,
        "GetCapabilities",
        format!(
            r#"<GetCapabilities xmlns="{}"><Category>All</Category></GetCapabilities>"#,
            DEVICE_ACTION_NS
        ),
    )
}

pub fn get_device_information() -> OnvifRequest {
    build(
        DEVICE_ACTION_NS,
        "GetDeviceInformation",
        format!(r#"<GetDeviceInformation xmlns="{}"/>"#, DEVICE_ACTION_NS),
    )
}

/// Push the given UTC time to the device clock.
pub fn set_system_date_and_time(now: DateTime<Utc>) -> OnvifRequest {
    build(
        DEVICE_ACTION_NS,
        "SetSystemDateAndTime",
        format!(
            concat!(
                r#"<SetSystemDateAndTime xmlns="{ns}">"#,
                "<DateTimeType>Manual</DateTimeType>",
                "<DaylightSavings>false</DaylightSavings>",
                r#"<UTCDateTime><Date xmlns="{tt}"><Year>{year}</Year><Month>{month}</Month><Day>{day}</Day></Date>"#,
                r#"<Time xmlns="{tt}"><Hour>{hour}</Hour><Minute>{minute}</Minute><Second>{second}</Second></Time></UTCDateTime>"#,
                "</SetSystemDateAndTime>"
            ),
            ns = DEVICE_ACTION_NS,
            tt = TT_NS,
            year = now.year(),
            month = now.month(),
            day = now.day(),
            hour = now.hour(),
            minute = now.minute(),
            second = now.second(),
        ),
    )
}

pub fn get_profiles() -> OnvifRequest {
    build(
        MEDIA_ACTION_NS,
        "GetProfiles",
        format!(r#"<GetProfiles xmlns="{}"/>"#, MEDIA_ACTION_NS),
    )
}

/// Unicast playback address for a profile over the session transport.
pub fn get_stream_uri(profile_token: &str, transport: TransportMode) -> OnvifRequest {
    let protocol = match transport {
        TransportMode::Tcp => "RTSP",
        TransportMode::Udp => "UDP",
    };
    build(
        MEDIA_ACTION_NS,
        "GetStreamUri",
        format!(
            concat!(
                r#"<GetStreamUri xmlns="{ns}"><StreamSetup>"#,
                r#"<Stream xmlns="{tt}">RTP-Unicast</Stream>"#,
                r#"<Transport xmlns="{tt}"><Protocol>{protocol}</Protocol></Transport>"#,
                "</StreamSetup><ProfileToken>{token}</ProfileToken></GetStreamUri>"
            ),
            ns = MEDIA_ACTION_NS,
            tt = TT_NS,
            protocol = protocol,
            token = xml_escape(profile_token),
        ),
    )
}

pub fn get_configurations() -> OnvifRequest {
    build(
        PTZ_ACTION_NS,
        "GetConfigurations",
        format!(r#"<GetConfigurations xmlns="{}"/>"#, PTZ_ACTION_NS),
    )
}

pub fn get_node(token: &str) -> OnvifRequest {
    build(
        PTZ_ACTION_NS,
        "GetNode",
        format!(
            r#"<GetNode xmlns="{0}"><NodeToken>{1}</NodeToken></GetNode>"#,
            PTZ_ACTION_NS,
            xml_escape(token)
        ),
    )
}

/// Velocity move; `spaces` of `None` leaves the space attributes off entirely.
pub fn continuous_move(
    profile: &str,
    velocity: PtzVector,
    spaces: Option<PtzSpaceRefs<'_>>,
) -> OnvifRequest {
    let velocity = format!(
        "{}{}",
        pan_tilt_element(velocity.pan, velocity.tilt, spaces.map(|s| s.pan_tilt)),
        zoom_element(velocity.zoom, spaces.map(|s| s.zoom))
    );
    build(
        PTZ_ACTION_NS,
        "ContinuousMove",
        format!(
            r#"<ContinuousMove xmlns="{ns}"><ProfileToken>{profile}</ProfileToken><Velocity>{velocity}</Velocity></ContinuousMove>"#,
            ns = PTZ_ACTION_NS,
            profile = xml_escape(profile),
            velocity = velocity
        ),
    )
}

pub fn relative_move(
    profile: &str,
    translation: PtzVector,
    spaces: Option<PtzSpaceRefs<'_>>,
) -> OnvifRequest {
    let translation = format!(
        "{}{}",
        pan_tilt_element(translation.pan, translation.tilt, spaces.map(|s| s.pan_tilt)),
        zoom_element(translation.zoom, spaces.map(|s| s.zoom))
    );
    build(
        PTZ_ACTION_NS,
        "RelativeMove",
        format!(
            r#"<RelativeMove xmlns="{ns}"><ProfileToken>{profile}</ProfileToken><Translation>{translation}</Translation></RelativeMove>"#,
            ns = PTZ_ACTION_NS,
            profile = xml_escape(profile),
            translation = translation
        ),
    )
}

pub fn stop(profile: &str, pan_tilt: bool, zoom: bool) -> OnvifRequest {
    build(
        PTZ_ACTION_NS,
        "Stop",
        format!(
            r#"<Stop xmlns="{ns}"><ProfileToken>{profile}</ProfileToken><PanTilt>{pan_tilt}</PanTilt><Zoom>{zoom}</Zoom></Stop>"#,
            ns = PTZ_ACTION_NS,
            profile = xml_escape(profile),
            pan_tilt = pan_tilt,
            zoom = zoom
        ),
    )
}

pub fn get_presets(profile: &str) -> OnvifRequest {
    build(
        PTZ_ACTION_NS,
        "GetPresets",
        format!(
            r#"<GetPresets xmlns="{0}"><ProfileToken>{1}</ProfileToken></GetPresets>"#,
            PTZ_ACTION_NS,
            xml_escape(profile)
        ),
    )
}

pub fn goto_preset(profile: &str, preset_token: &str) -> OnvifRequest {
    build(
        PTZ_ACTION_NS,
        "GotoPreset",
        format!(
            r#"<GotoPreset xmlns="{0}"><ProfileToken>{1}</ProfileToken><PresetToken>{2}</PresetToken></GotoPreset>"#,
            PTZ_ACTION_NS,
            xml_escape(profile),
            xml_escape(preset_token)
        ),
    )
}

pub fn xml_escape(value: &str) -> Cow<'_, str> {
    quick_xml::escape::escape(value)
}

fn build(namespace: &'static str, operation: &'static str, body: String) -> OnvifRequest {
    OnvifRequest {
        namespace,
        operation,
        body,
    }
}

fn pan_tilt_element(pan: f32, tilt: f32, space: Option<&str>) -> String {
    format!(
        r#"<PanTilt x="{pan}" y="{tilt}" xmlns="{tt}"{space}/>"#,
        pan = format_float(pan),
        tilt = format_float(tilt),
        tt = TT_NS,
        space = space_attr(space)
    )
}

fn zoom_element(zoom: f32, space: Option<&str>) -> String {
    format!(
        r#"<Zoom x="{zoom}" xmlns="{tt}"{space}/>"#,
        zoom = format_float(zoom),
        tt = TT_NS,
        space = space_attr(space)
    )
}

fn space_attr(space: Option<&str>) -> String {
    match space {
        Some(space) => format!(r#" space="{}""#, xml_escape(space)),
        None => String::new(),
    }
}

fn format_float(value: f32) -> String {
    let normalized = if value.abs() < f32::EPSILON {
        0.0
    } else {
        value
    };
    format!("{:.3}", normalized)
}
