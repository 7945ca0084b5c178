//! Profile selection and stream-URI post-processing.

use common::{MediaProfile, StreamTier};

/// Pick the profile for a stream tier.
///
/// Main takes the largest `width*height`, sub the smallest; ties go to the
/// earlier profile. Profiles without a resolution are skipped, and if none
/// has one the first enumerated profile is used.
pub fn select_profile(profiles: &[MediaProfile], tier: StreamTier) -> Option<&MediaProfile> {
    let mut best: Option<(&MediaProfile, u64)> = None;
    for profile in profiles {
        let Some(resolution) = profile.resolution else {
            continue;
        };
        let area = resolution.area();
        let better = match best {
            None => true,
            Some((_, current)) => match tier {
                StreamTier::Main => area > current,
                StreamTier::Sub => area < current,
            },
        };
        if better {
            best = Some((profile, area));
        }
    }
    best.map(|(profile, _)| profile).or_else(|| profiles.first())
}

/// Insert `user:password@` into an RTSP URI that carries no userinfo yet.
///
/// Non-RTSP URIs, URIs that already hold credentials and empty usernames are
/// returned unchanged, so applying this twice is a no-op.
pub fn inject_credentials(uri: &str, username: &str, password: &str) -> String {
    if username.is_empty() {
        return uri.to_string();
    }
    let Some(scheme_end) = uri.find("://") else {
        return uri.to_string();
    };
    let scheme = &uri[..scheme_end];
    if !scheme.eq_ignore_ascii_case("rtsp") && !scheme.eq_ignore_ascii_case("rtsps") {
        return uri.to_string();
    }

    let rest = &uri[scheme_end + 3..];
    let authority_end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    if rest[..authority_end].contains('@') {
        return uri.to_string();
    }

    format!(
        "{}://{}:{}@{}",
        scheme,
        encode_userinfo(username),
        encode_userinfo(password),
        rest
    )
}

/// Address one channel behind an NVR endpoint.
///
/// Appends `channel=<id>` unless a `channel` parameter exists, then
/// `subtype=<0|1>` from the tier unless a `subtype` parameter exists.
pub fn append_channel_params(uri: &str, channel_id: u32, tier: StreamTier) -> String {
    let (base, fragment) = match uri.find('#') {
        Some(idx) => (&uri[..idx], &uri[idx..]),
        None => (uri, ""),
    };

    let mut out = base.to_string();
    let mut push = |key: &str, value: String| {
        if has_query_param(&out, key) {
            return;
        }
        out.push(if out.contains('?') { '&' } else { '?' });
        out.push_str(key);
        out.push('=');
        out.push_str(&value);
    };
    push("channel", channel_id.to_string());
    push("subtype", tier.subtype().to_string());

    out.push_str(fragment);
    out
}

fn has_query_param(uri: &str, key: &str) -> bool {
    let Some((_, query)) = uri.split_once('?') else {
        return false;
    };
    query
        .split('&')
        .any(|pair| pair.split('=').next() == Some(key))
}

fn encode_userinfo(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' | b'!' | b'*' => {
                encoded.push(byte as char)
            }
            _ => encoded.push_str(&format!("%{:02X}", byte)),
        }
    }
    encoded
}
