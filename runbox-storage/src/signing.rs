//! HMAC-signed, time-limited download URLs
//!
//! The URL carries all authorization state: a base64url `payload` holding
//! `{path, exp, method}` and a hex `sig` holding HMAC-SHA-256 of the payload
//! JSON under the process signing key. No server-side token table exists.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};

use runbox_core::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Current UNIX time in seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[derive(Debug, Serialize, Deserialize)]
struct Payload {
    path: String,
    exp: u64,
    method: String,
}

/// Mints and verifies signed download URLs under a process-wide key.
#[derive(Clone)]
pub struct UrlSigner {
    key: Vec<u8>,
    base_url: String,
    ttl_secs: u64,
}

impl UrlSigner {
    pub fn new(key: impl Into<Vec<u8>>, base_url: impl Into<String>, ttl_secs: u64) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            key: key.into(),
            base_url,
            ttl_secs,
        }
    }

    pub fn ttl_secs(&self) -> u64 {
        self.ttl_secs
    }

    /// Sign a GET of `path` expiring at `now + ttl`. Returns the absolute
    /// URL and the embedded expiry.
    pub fn sign(&self, path: &str, now: u64) -> Result<(String, u64)> {
        let exp = now + self.ttl_secs;
        let payload = Payload {
            path: path.to_string(),
            exp,
            method: "GET".to_string(),
        };
        let json = serde_json::to_vec(&payload)?;
        let encoded = URL_SAFE_NO_PAD.encode(&json);
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|_| Error::Sandbox("invalid signing key".to_string()))?;
        mac.update(&json);
        let sig = hex::encode(mac.finalize().into_bytes());
        let url = format!(
            "{}{}?payload={}&sig={}",
            self.base_url, path, encoded, sig
        );
        Ok((url, exp))
    }

    /// Verify a download request. Every failure reason — bad encoding, bad
    /// signature, path or method mismatch, expiry — collapses to
    /// [`Error::Forbidden`] so clients cannot distinguish them.
    pub fn verify(&self, request_path: &str, payload: &str, sig: &str, now: u64) -> Result<()> {
        let json = URL_SAFE_NO_PAD
            .decode(payload.as_bytes())
            .map_err(|_| Error::Forbidden)?;
        let sig = hex::decode(sig).map_err(|_| Error::Forbidden)?;

        // Constant-time comparison via Mac::verify_slice.
        let mut mac = HmacSha256::new_from_slice(&self.key).map_err(|_| Error::Forbidden)?;
        mac.update(&json);
        mac.verify_slice(&sig).map_err(|_| Error::Forbidden)?;

        let decoded: Payload = serde_json::from_slice(&json).map_err(|_| Error::Forbidden)?;
        if decoded.path != request_path {
            return Err(Error::Forbidden);
        }
        if decoded.method != "GET" {
            return Err(Error::Forbidden);
        }
        if decoded.exp <= now {
            return Err(Error::Forbidden);
        }
        Ok(())
    }
}
