//! PKCE (Proof Key for Code Exchange), RFC 7636

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::crypto::constant_time_eq;
use crate::error::OAuthError;

/// Transformation applied to the verifier to produce the challenge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PkceMethod {
    /// The challenge is the verifier itself
    #[serde(rename = "plain")]
    Plain,
    /// `BASE64URL(SHA256(verifier))`
    #[serde(rename = "S256")]
    S256,
}

impl FromStr for PkceMethod {
    type Err = OAuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "S256" => Ok(Self::S256),
            "plain" => Ok(Self::Plain),
            other => Err(OAuthError::InvalidRequest(format!(
                "Unsupported code_challenge_method: {other}"
            ))),
        }
    }
}

impl fmt::Display for PkceMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Plain => "plain",
            Self::S256 => "S256",
        })
    }
}

/// A code challenge stored with an authorization grant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PkceChallenge {
    /// The challenge string sent at authorization time
    pub challenge: String,
    /// How the challenge was derived
    pub method: PkceMethod,
}

impl PkceChallenge {
    /// Whether `verifier` reproduces this challenge
    #[must_use]
    pub fn verify(&self, verifier: &str) -> bool {
        if !is_valid_verifier(verifier) {
            return false;
        }
        let computed = match self.method {
            PkceMethod::S256 => s256_challenge(verifier),
            PkceMethod::Plain => verifier.to_owned(),
        };
        constant_time_eq(computed.as_bytes(), self.challenge.as_bytes())
    }
}

/// Compute `BASE64URL(SHA256(verifier))`
#[must_use]
pub fn s256_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// 43 to 128 characters from the unreserved set
fn is_valid_verifier(verifier: &str) -> bool {
    (43..=128).contains(&verifier.len())
        && verifier
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~'))
}
