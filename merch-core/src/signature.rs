//! HMAC-SHA256 verification of payment-gateway webhook deliveries.
//!
//! The gateway signs `"{timestamp}.{raw body}"` with the shared endpoint secret
//! and sends `t=<unix seconds>,v1=<hex digest>` in the signature header. Several
//! `v1` entries may be present while a secret is being rotated.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "stripe-signature";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SignatureError {
    #[error("Signature header missing")]
    Missing,

    #[error("Signature header malformed: {0}")]
    Malformed(String),

    #[error("Signature timestamp outside tolerance ({age_seconds}s old)")]
    OutsideTolerance { age_seconds: i64 },

    #[error("No signature matched the payload")]
    Mismatch,

    #[error("Webhook secret unusable")]
    InvalidKey,
}

#[derive(Clone)]
pub struct WebhookVerifier {
    secret: String,
    tolerance_seconds: i64,
}

impl WebhookVerifier {
    pub fn new(secret: impl Into<String>, tolerance_seconds: u64) -> Self {
        Self {
            secret: secret.into(),
            tolerance_seconds: tolerance_seconds.min(i64::MAX as u64) as i64,
        }
    }

    fn mac(&self, timestamp: i64, payload: &[u8]) -> Result<HmacSha256, SignatureError> {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).map_err(|_| SignatureError::InvalidKey)?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        Ok(mac)
    }

    /// Produce a header value for `payload`, as the gateway would
    pub fn sign(&self, payload: &[u8], timestamp: i64) -> Result<String, SignatureError> {
        let digest = self.mac(timestamp, payload)?.finalize().into_bytes();
        Ok(format!("t={},v1={}", timestamp, hex::encode(digest)))
    }

    /// Check `header` against the raw request body. `now` is unix seconds.
    pub fn verify(&self, payload: &[u8], header: &str, now: i64) -> Result<(), SignatureError> {
        let mut timestamp = None;
        let mut candidates = Vec::new();

        for part in header.split(',') {
            let (key, value) = part
                .trim()
                .split_once('=')
                .ok_or_else(|| SignatureError::Malformed(part.to_string()))?;
            match key {
                "t" => {
                    let parsed = value
                        .parse::<i64>()
                        .map_err(|_| SignatureError::Malformed(format!("timestamp {}", value)))?;
                    timestamp = Some(parsed);
                }
                "v1" => candidates.push(value),
                // v0 and future schemes are ignored
                _ => {}
            }
        }

        let timestamp = timestamp.ok_or_else(|| SignatureError::Malformed("no timestamp".into()))?;
        if candidates.is_empty() {
            return Err(SignatureError::Malformed("no v1 signature".into()));
        }

        let age_seconds = now.saturating_sub(timestamp);
        if age_seconds.abs() > self.tolerance_seconds {
            return Err(SignatureError::OutsideTolerance { age_seconds });
        }

        let mac = self.mac(timestamp, payload)?;
        for candidate in candidates {
            let Ok(bytes) = hex::decode(candidate) else {
                continue;
            };
            // verify_slice compares in constant time
            if mac.clone().verify_slice(&bytes).is_ok() {
                return Ok(());
            }
        }

        Err(SignatureError::Mismatch)
    }
}
