// Signed opaque credentials carried in the `?token=` query parameter.
//
// Envelope: base64(JSON) [+ "-" + base64(HMAC-SHA256(base64(JSON), secret))].
// Both components use the standard base64 alphabet, which cannot contain the
// `-` separator, so the split is unambiguous. Reserved payload fields:
// `_v` (version, 1), `_t` (type tag), `_e` (epoch-millis expiry), `_i`
// (issuer id). Verification strips the reserved fields.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde_json::{Map, Value};
use sha2::Sha256;

use crate::error::TokenError;

type HmacSha256 = Hmac<Sha256>;

const TOKEN_VERSION: i64 = 1;

/// Node-to-node credential.
pub const TYPE_CLUSTER_PEER: i64 = 1;
/// Send-only client of the cluster port.
pub const TYPE_PUBLISHER: i64 = 2;

#[derive(Debug, Default, Clone)]
pub struct CreateOpts {
    /// Absolute expiry, epoch milliseconds. Takes precedence over `ttl`.
    pub expire: Option<i64>,
    /// Relative expiry in milliseconds from now.
    pub ttl: Option<i64>,
    pub secret: Option<String>,
    pub token_type: Option<i64>,
    /// Issuer/session id, stored as `_i`.
    pub id: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct VerifyOpts {
    /// When set, `_t` must match exactly.
    pub token_type: Option<i64>,
    /// When set, the signature component is required and checked.
    pub secret: Option<String>,
}

/// Decoded token: caller data with the reserved fields stripped, plus the
/// identity fields the fabric routes on.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenPayload {
    pub data: Value,
    pub token_type: Option<i64>,
    pub issuer: Option<String>,
}

pub fn create(data: &Value, opts: &CreateOpts) -> Result<String, TokenError> {
    let mut map = match data {
        Value::Object(m) => m.clone(),
        Value::Null => Map::new(),
        _ => return Err(TokenError::Malformed),
    };
    map.insert("_v".into(), Value::from(TOKEN_VERSION));
    if let Some(t) = opts.token_type {
        map.insert("_t".into(), Value::from(t));
    }
    let expiry = opts
        .expire
        .or_else(|| opts.ttl.map(|ttl| chrono::Utc::now().timestamp_millis() + ttl));
    if let Some(e) = expiry {
        map.insert("_e".into(), Value::from(e));
    }
    if let Some(id) = &opts.id {
        map.insert("_i".into(), Value::from(id.clone()));
    }

    let json = Value::Object(map).to_string();
    let payload = B64.encode(json.as_bytes());
    match &opts.secret {
        Some(secret) if !secret.is_empty() => {
            let sig = sign(payload.as_bytes(), secret);
            Ok(format!("{payload}-{sig}"))
        }
        _ => Ok(payload),
    }
}

pub fn verify(token: &str, opts: &VerifyOpts) -> Result<TokenPayload, TokenError> {
    let (payload_b64, sig_b64) = match token.split_once('-') {
        Some((p, s)) => (p, Some(s)),
        None => (token, None),
    };

    if let Some(secret) = opts.secret.as_deref().filter(|s| !s.is_empty()) {
        let sig_b64 = sig_b64.ok_or(TokenError::SignatureMissing)?;
        let sig = B64.decode(sig_b64).map_err(|_| TokenError::Malformed)?;
        let mut mac = <HmacSha256 as Mac>::new_from_slice(secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(payload_b64.as_bytes());
        mac.verify_slice(&sig)
            .map_err(|_| TokenError::SignatureMismatch)?;
    }

    let json = B64.decode(payload_b64).map_err(|_| TokenError::Malformed)?;
    let value: Value = serde_json::from_slice(&json).map_err(|_| TokenError::Malformed)?;
    let Value::Object(mut map) = value else {
        return Err(TokenError::Malformed);
    };

    if map.remove("_v").and_then(|v| v.as_i64()) != Some(TOKEN_VERSION) {
        return Err(TokenError::VersionMismatch);
    }
    if let Some(expiry) = map.remove("_e").and_then(|v| v.as_i64()) {
        if expiry < chrono::Utc::now().timestamp_millis() {
            return Err(TokenError::Expired);
        }
    }
    let token_type = map.remove("_t").and_then(|v| v.as_i64());
    if let Some(expected) = opts.token_type {
        if token_type != Some(expected) {
            return Err(TokenError::TypeMismatch);
        }
    }
    let issuer = map
        .remove("_i")
        .and_then(|v| v.as_str().map(str::to_string));

    Ok(TokenPayload {
        data: Value::Object(map),
        token_type,
        issuer,
    })
}

fn sign(payload: &[u8], secret: &str) -> String {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts any key length");
    mac.update(payload);
    B64.encode(mac.finalize().into_bytes())
}
