//! HMAC request signing and replay protection.
//!
//! A signed request carries a millisecond timestamp, a one-shot nonce, the
//! device id and a base64 HMAC-SHA256 over the canonical payload
//! `METHOD\nFULL_URL\nRAW_BODY\nTIMESTAMP\nNONCE`, keyed by the device
//! secret. Validation short-circuits on the first failing step.

use std::sync::Arc;
use std::time::Duration;

use base64ct::Encoding;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::{Sha256, Sha512};
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::cache::TtlCache;
use crate::errors::TetherError;
use crate::settings::RequestSigning;

use super::devices::DeviceRegistry;

type HmacSha256 = Hmac<Sha256>;
type HmacSha512 = Hmac<Sha512>;

/// Why a signed request was rejected. Collapsed to a single "invalid
/// signature" failure at the gateway boundary; the variant is retained for
/// event context only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("missing timestamp header")]
    MissingTimestamp,
    #[error("timestamp outside tolerance window")]
    TimestampOutOfRange,
    #[error("missing nonce header")]
    MissingNonce,
    #[error("nonce already used")]
    DuplicateNonce,
    #[error("missing signature header")]
    MissingSignature,
    #[error("missing device id header")]
    MissingDeviceId,
    #[error("no secret for device")]
    UnknownDevice,
    #[error("signature mismatch")]
    SignatureMismatch,
}

impl SignatureError {
    pub fn reason(&self) -> &'static str {
        match self {
            SignatureError::MissingTimestamp => "missing_timestamp",
            SignatureError::TimestampOutOfRange => "timestamp_out_of_range",
            SignatureError::MissingNonce => "missing_nonce",
            SignatureError::DuplicateNonce => "duplicate_nonce",
            SignatureError::MissingSignature => "missing_signature",
            SignatureError::MissingDeviceId => "missing_device_id",
            SignatureError::UnknownDevice => "unknown_device",
            SignatureError::SignatureMismatch => "signature_mismatch",
        }
    }
}

/// The signable pieces of a request, extracted by the gateway.
#[derive(Debug, Clone, Default)]
pub struct SignedRequest<'a> {
    pub method: &'a str,
    pub url: &'a str,
    pub body: &'a str,
    pub device_id: Option<&'a str>,
    pub timestamp: Option<&'a str>,
    pub nonce: Option<&'a str>,
    pub signature: Option<&'a str>,
}

/// Computes the signature a well-behaved client would send (HMAC-SHA256, the
/// default algorithm). Pure; server validation and reference clients test
/// against the same vectors. The secret is the 64-char hex string exactly as
/// delivered to the device.
pub fn sign_payload(
    method: &str,
    url: &str,
    body: &str,
    timestamp: &str,
    nonce: &str,
    secret: &str,
) -> String {
    let payload = format!("{}\n{}\n{}\n{}\n{}", method, url, body, timestamp, nonce);
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(payload.as_bytes());
    base64ct::Base64::encode_string(&mac.finalize().into_bytes())
}

/// SHA-512 variant for deployments that override `request_signing.algorithm`.
pub fn sign_payload_sha512(
    method: &str,
    url: &str,
    body: &str,
    timestamp: &str,
    nonce: &str,
    secret: &str,
) -> String {
    let payload = format!("{}\n{}\n{}\n{}\n{}", method, url, body, timestamp, nonce);
    let mut mac =
        HmacSha512::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(payload.as_bytes());
    base64ct::Base64::encode_string(&mac.finalize().into_bytes())
}

pub struct SignatureValidator {
    registry: Arc<DeviceRegistry>,
    replay: Arc<TtlCache>,
    cfg: RequestSigning,
}

impl SignatureValidator {
    pub fn new(registry: Arc<DeviceRegistry>, replay: Arc<TtlCache>, cfg: RequestSigning) -> Self {
        Self {
            registry,
            replay,
            cfg,
        }
    }

    /// Runs the three-step pipeline. `Ok(Ok(()))` is a pass, `Ok(Err(_))` a
    /// rejection with its cause; outer `Err` is an infrastructure failure.
    pub async fn validate(
        &self,
        req: &SignedRequest<'_>,
    ) -> Result<Result<(), SignatureError>, TetherError> {
        // 1. Timestamp bounds the staleness of any captured request.
        let Some(timestamp) = req.timestamp else {
            return Ok(Err(SignatureError::MissingTimestamp));
        };
        let Ok(ts_ms) = timestamp.parse::<i64>() else {
            return Ok(Err(SignatureError::TimestampOutOfRange));
        };
        let now_ms = Utc::now().timestamp_millis();
        let tolerance_ms = self.cfg.timestamp_tolerance * 1000;
        if (now_ms - ts_ms).abs() > tolerance_ms {
            return Ok(Err(SignatureError::TimestampOutOfRange));
        }

        // 2. Nonce: first use wins, the cache entry outlives the tolerance
        // window so a replay cannot slip in before natural expiry.
        let nonce = if self.cfg.require_nonce {
            let Some(nonce) = req.nonce else {
                return Ok(Err(SignatureError::MissingNonce));
            };
            if !self.replay.add(
                &format!("nonce:{}", nonce),
                "1",
                Duration::from_secs(self.cfg.timestamp_tolerance as u64),
            ) {
                return Ok(Err(SignatureError::DuplicateNonce));
            }
            nonce
        } else {
            req.nonce.unwrap_or("")
        };

        // 3. HMAC over the canonical payload.
        let Some(provided) = req.signature else {
            return Ok(Err(SignatureError::MissingSignature));
        };
        let Some(device_id) = req.device_id else {
            return Ok(Err(SignatureError::MissingDeviceId));
        };
        let Some(secret) = self.registry.get_secret(device_id).await? else {
            return Ok(Err(SignatureError::UnknownDevice));
        };

        let expected = match self.cfg.algorithm.as_str() {
            "sha512" => sign_payload_sha512(req.method, req.url, req.body, timestamp, nonce, &secret),
            _ => sign_payload(req.method, req.url, req.body, timestamp, nonce, &secret),
        };
        if bool::from(expected.as_bytes().ct_eq(provided.as_bytes())) {
            Ok(Ok(()))
        } else {
            Ok(Err(SignatureError::SignatureMismatch))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "5f2b8c3d9a1e4f6070819202b3c4d5e6f7a8b9c0d1e2f30415263748596a7b8c";

    fn sample_signature() -> String {
        sign_payload(
            "POST",
            "https://api.example.com/mobile/users",
            r#"{"email":"a@b.c"}"#,
            "1720000000000",
            "nonce-123",
            SECRET,
        )
    }

    #[test]
    fn sign_is_deterministic() {
        assert_eq!(sample_signature(), sample_signature());
    }

    #[test]
    fn sign_changes_with_any_field() {
        let base = sign_payload("POST", "/u", "body", "1", "n", SECRET);
        assert_ne!(base, sign_payload("GET", "/u", "body", "1", "n", SECRET));
        assert_ne!(base, sign_payload("POST", "/v", "body", "1", "n", SECRET));
        assert_ne!(base, sign_payload("POST", "/u", "tampered", "1", "n", SECRET));
        assert_ne!(base, sign_payload("POST", "/u", "body", "2", "n", SECRET));
        assert_ne!(base, sign_payload("POST", "/u", "body", "1", "m", SECRET));
        assert_ne!(base, sign_payload("POST", "/u", "body", "1", "n", "other-secret"));
    }

    #[test]
    fn signature_is_base64_of_32_bytes() {
        let decoded = base64ct::Base64::decode_vec(&sample_signature()).expect("valid base64");
        assert_eq!(decoded.len(), 32);
    }

    #[test]
    fn sha512_variant_differs_and_is_64_bytes() {
        let a = sign_payload("POST", "/u", "body", "1", "n", SECRET);
        let b = sign_payload_sha512("POST", "/u", "body", "1", "n", SECRET);
        assert_ne!(a, b);
        let decoded = base64ct::Base64::decode_vec(&b).expect("valid base64");
        assert_eq!(decoded.len(), 64);
    }

    #[test]
    fn field_order_is_not_ambiguous() {
        // Moving a byte across the newline boundary must change the MAC.
        let a = sign_payload("POST", "/ab", "c", "1", "n", SECRET);
        let b = sign_payload("POST", "/a", "bc", "1", "n", SECRET);
        assert_ne!(a, b);
    }
}
