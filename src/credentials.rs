//! Single-user credential store and Basic authorization parsing

use crate::config::{AuthConfig, ConfigError};
use base64::Engine;
use sha2::{Digest, Sha256};

const HASH_PREFIX: &str = "sha256:";

/// Username and password decoded from a Basic `Authorization` header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicCredentials {
    pub username: String,
    pub password: String,
}

/// Parse an `Authorization` header value using the Basic scheme.
///
/// Returns `None` for any other scheme, invalid base64, non UTF-8 payloads,
/// or a payload without the `:` separator.
pub fn parse_basic_auth(header: &str) -> Option<BasicCredentials> {
    let (scheme, encoded) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }

    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;

    // The password may itself contain ':'
    let (username, password) = decoded.split_once(':')?;
    Some(BasicCredentials {
        username: username.to_string(),
        password: password.to_string(),
    })
}

/// Holds the one accepted credential.
///
/// The password is kept only as a SHA-256 digest. Without a configured
/// password every validation fails.
#[derive(Clone)]
pub struct CredentialStore {
    username: String,
    digest: Option<String>,
}

impl CredentialStore {
    /// Store holding a plaintext password (digested immediately)
    pub fn new(username: impl Into<String>, password: Option<&str>) -> Self {
        Self {
            username: username.into(),
            digest: password.filter(|p| !p.is_empty()).map(sha256_hex),
        }
    }

    /// Build the store from configuration; a `password_hash` wins over `password`
    pub fn from_config(auth: &AuthConfig) -> Result<Self, ConfigError> {
        if let Some(hash) = auth.password_hash.as_deref().filter(|h| !h.is_empty()) {
            let digest = parse_password_hash(hash)?;
            return Ok(Self {
                username: auth.username.clone(),
                digest: Some(digest),
            });
        }
        Ok(Self::new(auth.username.clone(), auth.password.as_deref()))
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Whether any request can ever pass validation
    pub fn is_configured(&self) -> bool {
        self.digest.is_some()
    }

    /// Check a username/password pair
    pub fn validate(&self, username: &str, password: &str) -> bool {
        let Some(expected) = self.digest.as_deref() else {
            return false;
        };

        // Evaluate both comparisons so a wrong username costs the same as a wrong password
        let user_ok = constant_time_compare(&sha256_hex(&self.username), &sha256_hex(username));
        let pass_ok = constant_time_compare(expected, &sha256_hex(password));
        user_ok & pass_ok
    }

    /// Validate a raw `Authorization` header value
    pub fn validate_header(&self, header: &str) -> bool {
        parse_basic_auth(header)
            .map(|c| self.validate(&c.username, &c.password))
            .unwrap_or(false)
    }
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore")
            .field("username", &self.username)
            .field("configured", &self.is_configured())
            .finish()
    }
}

fn sha256_hex(value: &str) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}

fn parse_password_hash(value: &str) -> Result<String, ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidValue {
        name: "MLFLOW_AUTH_PASSWORD_HASH",
        value: "<redacted>".to_string(),
        reason: reason.to_string(),
    };

    let hex_digest = value
        .strip_prefix(HASH_PREFIX)
        .ok_or_else(|| invalid("expected format sha256:<hex>"))?;
    let bytes = hex::decode(hex_digest).map_err(|_| invalid("digest is not valid hex"))?;
    if bytes.len() != 32 {
        return Err(invalid("digest must be 32 bytes"));
    }
    Ok(hex::encode(bytes))
}

/// Constant-time string comparison to prevent timing attacks
fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }
    result == 0
}
