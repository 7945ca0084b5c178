//! Response parsers for the ONVIF operations the client issues.

use crate::soap::SoapResponse;
use crate::types::{DeviceInfo, PtzConfigurationInfo, PtzPreset, PtzSpaces, ServiceAddresses};
use crate::xml::XmlElement;
use anyhow::{anyhow, Result};
use common::{MediaProfile, Resolution};

/// Parse a response body, turning HTTP errors and SOAP faults into errors.
pub fn checked_document(operation: &str, response: &SoapResponse) -> Result<XmlElement> {
    let doc = XmlElement::parse(&response.body);

    if let Ok(doc) = &doc {
        if let Some(reason) = soap_fault(doc) {
            return Err(anyhow!(
                "{} returned SOAP fault (HTTP {}): {}",
                operation,
                response.status,
                reason
            ));
        }
    }
    if !response.is_http_success() {
        return Err(anyhow!("{} failed with HTTP {}", operation, response.status));
    }
    doc.map_err(|e| anyhow!("{} returned unparseable XML: {}", operation, e))
}

/// Fault reason text, if the document is a SOAP fault.
pub fn soap_fault(doc: &XmlElement) -> Option<String> {
    let fault = doc.find("Fault")?;
    let reason = fault
        .find("Reason")
        .and_then(|r| r.find_text("Text"))
        .or_else(|| fault.find_text("faultstring"))
        .or_else(|| fault.find("Subcode").and_then(|s| s.find_text("Value")))
        .unwrap_or("unspecified fault");
    Some(reason.to_string())
}

pub fn parse_capabilities(doc: &XmlElement) -> Result<ServiceAddresses> {
    let capabilities = doc
        .find("Capabilities")
        .ok_or_else(|| anyhow!("GetCapabilities response has no Capabilities"))?;
    let xaddr = |service: &str| {
        capabilities
            .child(service)
            .and_then(|s| s.find_text("XAddr"))
            .map(str::to_string)
    };
    Ok(ServiceAddresses {
        media: xaddr("Media"),
        ptz: xaddr("PTZ"),
    })
}

pub fn parse_device_info(doc: &XmlElement) -> Result<DeviceInfo> {
    let response = doc
        .find("GetDeviceInformationResponse")
        .ok_or_else(|| anyhow!("missing GetDeviceInformationResponse"))?;
    let field = |name: &str| response.find_text(name).map(str::to_string);
    Ok(DeviceInfo {
        manufacturer: field("Manufacturer"),
        model: field("Model"),
        firmware_version: field("FirmwareVersion"),
        serial_number: field("SerialNumber"),
    })
}

/// Profiles in the order the device enumerates them.
pub fn parse_profiles(doc: &XmlElement) -> Vec<MediaProfile> {
    doc.find_all("Profiles")
        .filter_map(|profile| {
            let token = profile.attr("token")?;
            let encoder = profile.find("VideoEncoderConfiguration");
            let resolution = encoder
                .and_then(|e| e.find("Resolution"))
                .and_then(parse_resolution);
            let frame_rate_limit = encoder
                .and_then(|e| e.find_text("FrameRateLimit"))
                .and_then(|v| v.parse().ok());
            Some(MediaProfile {
                token: token.to_string(),
                name: profile.child("Name").and_then(XmlElement::text).map(str::to_string),
                resolution,
                frame_rate_limit,
                ptz_configuration_token: profile
                    .child("PTZConfiguration")
                    .and_then(|p| p.attr("token"))
                    .map(str::to_string),
            })
        })
        .collect()
}

fn parse_resolution(element: &XmlElement) -> Option<Resolution> {
    let width: u32 = element.find_text("Width")?.parse().ok()?;
    let height: u32 = element.find_text("Height")?.parse().ok()?;
    (width > 0 && height > 0).then(|| Resolution::new(width, height))
}

/// `MediaUri/Uri`; `None` when missing or blank.
pub fn parse_stream_uri(doc: &XmlElement) -> Option<String> {
    doc.find("MediaUri")
        .and_then(|m| m.find_text("Uri"))
        .or_else(|| doc.find_text("Uri"))
        .map(str::to_string)
}

pub fn parse_ptz_configurations(doc: &XmlElement) -> Vec<PtzConfigurationInfo> {
    doc.find_all("PTZConfiguration")
        .filter_map(|config| {
            Some(PtzConfigurationInfo {
                token: config.attr("token")?.to_string(),
                node_token: config.find_text("NodeToken").map(str::to_string),
            })
        })
        .collect()
}

pub fn parse_ptz_node(doc: &XmlElement) -> Result<PtzSpaces> {
    let spaces = doc
        .find("SupportedPTZSpaces")
        .ok_or_else(|| anyhow!("PTZ node does not expose SupportedPTZSpaces"))?;
    let uri = |name: &str| {
        spaces
            .child(name)
            .and_then(|s| s.find_text("URI"))
            .map(str::to_string)
    };
    Ok(PtzSpaces {
        pan_tilt_velocity: uri("ContinuousPanTiltVelocitySpace"),
        zoom_velocity: uri("ContinuousZoomVelocitySpace"),
        pan_tilt_translation: uri("RelativePanTiltTranslationSpace"),
        zoom_translation: uri("RelativeZoomTranslationSpace"),
    })
}

pub fn parse_presets(doc: &XmlElement) -> Vec<PtzPreset> {
    doc.find_all("Preset")
        .filter_map(|preset| {
            Some(PtzPreset {
                token: preset.attr("token")?.to_string(),
                name: preset.find_text("Name").map(str::to_string),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(xml: &str) -> XmlElement {
        XmlElement::parse(xml).unwrap()
    }

    #[test]
    fn capabilities_yield_media_and_ptz_addresses() {
        let body = r#"<s:Envelope xmlns:s="x"><s:Body><tds:GetCapabilitiesResponse><tds:Capabilities>
            <tt:Device><tt:XAddr>http://10.0.0.5/onvif/device_service</tt:XAddr></tt:Device>
            <tt:Media><tt:XAddr>http://10.0.0.5/onvif/Media</tt:XAddr></tt:Media>
            <tt:PTZ><tt:XAddr>http://10.0.0.5/onvif/PTZ</tt:XAddr></tt:PTZ>
        </tds:Capabilities></tds:GetCapabilitiesResponse></s:Body></s:Envelope>"#;
        let addrs = parse_capabilities(&doc(body)).unwrap();
        assert_eq!(addrs.media.as_deref(), Some("http://10.0.0.5/onvif/Media"));
        assert_eq!(addrs.ptz.as_deref(), Some("http://10.0.0.5/onvif/PTZ"));
    }

    #[test]
    fn capabilities_without_ptz() {
        let body = "<Envelope><Body><Capabilities><Media><XAddr>http://m</XAddr></Media></Capabilities></Body></Envelope>";
        let addrs = parse_capabilities(&doc(body)).unwrap();
        assert!(addrs.ptz.is_none());
        assert!(parse_capabilities(&doc("<Envelope/>")).is_err());
    }

    #[test]
    fn profiles_with_and_without_resolution() {
        let body = r#"<Envelope><Body><GetProfilesResponse>
            <Profiles token="main"><Name>MainStream</Name>
              <VideoEncoderConfiguration><Resolution><Width>1920</Width><Height>1080</Height></Resolution>
              <RateControl><FrameRateLimit>25</FrameRateLimit></RateControl></VideoEncoderConfiguration>
              <PTZConfiguration token="ptz0"/>
            </Profiles>
            <Profiles token="meta"><Name>Metadata</Name></Profiles>
            <Profiles><Name>no token</Name></Profiles>
        </GetProfilesResponse></Body></Envelope>"#;
        let profiles = parse_profiles(&doc(body));
        assert_eq!(profiles.len(), 2);
        assert_eq!(profiles[0].token, "main");
        assert_eq!(profiles[0].resolution, Some(Resolution::new(1920, 1080)));
        assert_eq!(profiles[0].frame_rate_limit, Some(25));
        assert_eq!(profiles[0].ptz_configuration_token.as_deref(), Some("ptz0"));
        assert_eq!(profiles[1].resolution, None);
    }

    #[test]
    fn stream_uri_blank_is_none() {
        let ok = doc("<Envelope><MediaUri><Uri> rtsp://x/1 </Uri></MediaUri></Envelope>");
        assert_eq!(parse_stream_uri(&ok).as_deref(), Some("rtsp://x/1"));
        let blank = doc("<Envelope><MediaUri><Uri>  </Uri></MediaUri></Envelope>");
        assert_eq!(parse_stream_uri(&blank), None);
    }

    #[test]
    fn fault_reason_is_reported() {
        let body = r#"<Envelope><Body><Fault><Code><Value>Sender</Value></Code>
            <Reason><Text xml:lang="en">Action not supported</Text></Reason></Fault></Body></Envelope>"#;
        let response = SoapResponse {
            status: 500,
            body: body.to_string(),
        };
        let err = checked_document("ContinuousMove", &response).unwrap_err();
        assert!(err.to_string().contains("Action not supported"));
    }

    #[test]
    fn http_error_without_xml() {
        let response = SoapResponse {
            status: 401,
            body: "Unauthorized".to_string(),
        };
        let err = checked_document("GetProfiles", &response).unwrap_err();
        assert!(err.to_string().contains("HTTP 401"));
    }

    #[test]
    fn node_spaces_and_presets() {
        let node = doc(r#"<Envelope><PTZNode token="n0"><SupportedPTZSpaces>
            <ContinuousPanTiltVelocitySpace><URI>urn:pt-vel</URI></ContinuousPanTiltVelocitySpace>
            <RelativeZoomTranslationSpace><URI>urn:z-rel</URI></RelativeZoomTranslationSpace>
        </SupportedPTZSpaces></PTZNode></Envelope>"#);
        let spaces = parse_ptz_node(&node).unwrap();
        assert_eq!(spaces.pan_tilt_velocity.as_deref(), Some("urn:pt-vel"));
        assert_eq!(spaces.zoom_translation.as_deref(), Some("urn:z-rel"));
        assert!(spaces.zoom_velocity.is_none());

        let presets = doc(r#"<Envelope><Preset token="1"><Name>Gate</Name></Preset><Preset token="2"/></Envelope>"#);
        let presets = parse_presets(&presets);
        assert_eq!(presets.len(), 2);
        assert_eq!(presets[0].name.as_deref(), Some("Gate"));
        assert!(presets[1].name.is_none());
    }

    #[test]
    fn configurations_carry_node_tokens() {
        let body = doc(r#"<Envelope><PTZConfiguration token="c0"><NodeToken>n0</NodeToken></PTZConfiguration></Envelope>"#);
        let configs = parse_ptz_configurations(&body);
        assert_eq!(
            configs,
            vec![PtzConfigurationInfo {
                token: "c0".to_string(),
                node_token: Some("n0".to_string())
            }]
        );
    }
}
