//! WS-Security UsernameToken header with a PasswordDigest.
//!
//! `digest = base64(sha1(nonce ++ created ++ password))`

use crate::requests::xml_escape;
use anyhow::Result;
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use rand::{rngs::OsRng, RngCore};
use sha1::{Digest, Sha1};

const PASSWORD_DIGEST_TYPE: &str = "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-username-token-profile-1.0#PasswordDigest";
const NONCE_ENCODING: &str = "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-soap-message-security-1.0#Base64Binary";
const NONCE_LEN: usize = 20;

pub fn build_wsse_header(username: &str, password: &str) -> Result<String> {
    let created = created_timestamp(Utc::now());
    let nonce = generate_nonce(NONCE_LEN);
    let nonce_b64 = general_purpose::STANDARD.encode(&nonce);
    let digest_b64 = password_digest(&nonce, &created, password);
    let username = xml_escape(username);

    Ok(format!(
        r#"  <s:Header>
    <Security xmlns="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-secext-1.0.xsd" s:mustUnderstand="1">
      <UsernameToken>
        <Username>{}</Username>
        <Password Type="{}">{}</Password>
        <Nonce EncodingType="{}">{}</Nonce>
        <Created xmlns="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-utility-1.0.xsd">{}</Created>
      </UsernameToken>
    </Security>
  </s:Header>
"#,
        username, PASSWORD_DIGEST_TYPE, digest_b64, NONCE_ENCODING, nonce_b64, created
    ))
}

fn created_timestamp(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

fn generate_nonce(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

fn password_digest(nonce: &[u8], created: &str, password: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(nonce);
    hasher.update(created.as_bytes());
    hasher.update(password.as_bytes());
    general_purpose::STANDARD.encode(hasher.finalize())
}
