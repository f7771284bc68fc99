//! Per-subscription request authentication.
//!
//! [`sign`] is a pure function of the configured [`SecurityMethod`] and the
//! request materials (serialized body plus signing timestamp). It never looks
//! at anything else, and it fails closed: a method whose credentials are
//! missing produces an error, never an unsigned request.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use thiserror::Error;

use crate::error::{DeliveryError, WebhookError, WebhookResult};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the unix timestamp covered by an HMAC signature.
pub const TIMESTAMP_HEADER: &str = "X-Timestamp";
/// Header carrying the hex HMAC-SHA256 signature.
pub const SIGNATURE_HEADER: &str = "X-Signature";
/// Default header for the static shared secret.
pub const DEFAULT_SECRET_HEADER: &str = "X-Webhook-Secret";

/// Authentication configured on a subscription.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum SecurityMethod {
    /// No authentication headers.
    None,
    /// HTTP basic authentication.
    Basic {
        /// User name.
        username: String,
        /// Password.
        password: String,
    },
    /// Static bearer token.
    BearerToken {
        /// Token value.
        token: String,
    },
    /// API key sent in a caller-chosen header.
    ApiKey {
        /// Header name.
        header: String,
        /// Key value.
        value: String,
    },
    /// HMAC-SHA256 over `timestamp || body`.
    HmacSha256 {
        /// Shared signing secret.
        secret: String,
    },
    /// Static shared secret sent as-is.
    WebhookSecret {
        /// Header name.
        #[serde(default = "default_secret_header")]
        header: String,
        /// Secret value.
        value: String,
    },
}

fn default_secret_header() -> String {
    DEFAULT_SECRET_HEADER.to_string()
}

impl SecurityMethod {
    /// Builds a method from its stored name and opaque JSON configuration.
    ///
    /// This is where configuration is validated: every field the method
    /// requires must be present and non-empty.
    pub fn from_config(method: &str, config: &Value) -> WebhookResult<Self> {
        let parsed = match method {
            "none" => SecurityMethod::None,
            "basic" => SecurityMethod::Basic {
                username: required(method, config, &["username", "user"])?,
                password: required(method, config, &["password", "pass"])?,
            },
            "bearer_token" => SecurityMethod::BearerToken {
                token: required(method, config, &["token"])?,
            },
            "api_key" => SecurityMethod::ApiKey {
                header: required(method, config, &["header", "key_name"])?,
                value: required(method, config, &["value", "key_value"])?,
            },
            "hmac_sha256" => SecurityMethod::HmacSha256 {
                secret: required(method, config, &["secret"])?,
            },
            "webhook_secret" => SecurityMethod::WebhookSecret {
                header: optional(config, &["header"]).unwrap_or_else(default_secret_header),
                value: required(method, config, &["secret", "value"])?,
            },
            other => {
                return Err(WebhookError::ConfigError(format!(
                    "unknown security method '{other}'"
                )));
            }
        };

        parsed.validate()?;
        Ok(parsed)
    }

    /// Checks that every credential the method needs is non-empty.
    pub fn validate(&self) -> WebhookResult<()> {
        self.missing_field()
            .map_or(Ok(()), |e| Err(WebhookError::ConfigError(e.to_string())))
    }

    /// The stored method name.
    pub fn name(&self) -> &'static str {
        match self {
            SecurityMethod::None => "none",
            SecurityMethod::Basic { .. } => "basic",
            SecurityMethod::BearerToken { .. } => "bearer_token",
            SecurityMethod::ApiKey { .. } => "api_key",
            SecurityMethod::HmacSha256 { .. } => "hmac_sha256",
            SecurityMethod::WebhookSecret { .. } => "webhook_secret",
        }
    }

    fn missing_field(&self) -> Option<SigningError> {
        let missing = |field: &'static str| {
            Some(SigningError::MissingField {
                method: self.name(),
                field,
            })
        };

        match self {
            SecurityMethod::None => None,
            SecurityMethod::Basic { username, .. } if username.is_empty() => missing("username"),
            SecurityMethod::Basic { password, .. } if password.is_empty() => missing("password"),
            SecurityMethod::Basic { .. } => None,
            SecurityMethod::BearerToken { token } if token.is_empty() => missing("token"),
            SecurityMethod::BearerToken { .. } => None,
            SecurityMethod::ApiKey { header, .. } if header.trim().is_empty() => missing("header"),
            SecurityMethod::ApiKey { value, .. } if value.is_empty() => missing("value"),
            SecurityMethod::ApiKey { .. } => None,
            SecurityMethod::HmacSha256 { secret } if secret.is_empty() => missing("secret"),
            SecurityMethod::HmacSha256 { .. } => None,
            SecurityMethod::WebhookSecret { header, .. } if header.trim().is_empty() => {
                missing("header")
            }
            SecurityMethod::WebhookSecret { value, .. } if value.is_empty() => missing("value"),
            SecurityMethod::WebhookSecret { .. } => None,
        }
    }
}

impl Default for SecurityMethod {
    fn default() -> Self {
        SecurityMethod::None
    }
}

impl std::fmt::Debug for SecurityMethod {
    // Credentials never reach logs.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SecurityMethod::ApiKey { header, .. } | SecurityMethod::WebhookSecret { header, .. } => f
                .debug_struct(self.name())
                .field("header", header)
                .finish_non_exhaustive(),
            _ => f.write_str(self.name()),
        }
    }
}

fn lookup(config: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| config.get(*k))
        .filter_map(Value::as_str)
        .find(|v| !v.is_empty())
        .map(str::to_string)
}

fn required(method: &str, config: &Value, keys: &[&str]) -> WebhookResult<String> {
    lookup(config, keys).ok_or_else(|| {
        WebhookError::ConfigError(format!(
            "security method '{method}' requires '{}'",
            keys[0]
        ))
    })
}

fn optional(config: &Value, keys: &[&str]) -> Option<String> {
    lookup(config, keys)
}

/// Everything a signer may look at.
#[derive(Debug, Clone, Copy)]
pub struct SigningMaterials<'a> {
    /// Unix timestamp (seconds) the signature is bound to.
    pub timestamp: i64,
    /// The exact bytes that will be sent as the request body.
    pub body: &'a [u8],
}

/// Signing failure. The request must not be sent.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SigningError {
    /// A required credential is absent.
    #[error("security method '{method}' is missing '{field}'")]
    MissingField {
        /// Method name.
        method: &'static str,
        /// Missing field.
        field: &'static str,
    },
    /// The HMAC key was rejected.
    #[error("invalid signing key")]
    InvalidKey,
}

impl From<SigningError> for DeliveryError {
    fn from(err: SigningError) -> Self {
        DeliveryError::configuration(err.to_string())
    }
}

/// Computes the authentication headers for one request.
pub fn sign(
    method: &SecurityMethod,
    materials: SigningMaterials<'_>,
) -> Result<Vec<(String, String)>, SigningError> {
    if let Some(err) = method.missing_field() {
        return Err(err);
    }

    let headers = match method {
        SecurityMethod::None => Vec::new(),
        SecurityMethod::Basic { username, password } => {
            let credentials = BASE64.encode(format!("{username}:{password}"));
            vec![("Authorization".to_string(), format!("Basic {credentials}"))]
        }
        SecurityMethod::BearerToken { token } => {
            vec![("Authorization".to_string(), format!("Bearer {token}"))]
        }
        SecurityMethod::ApiKey { header, value } => vec![(header.clone(), value.clone())],
        SecurityMethod::HmacSha256 { secret } => {
            let signature = HmacSigner::new(secret).sign(materials.timestamp, materials.body)?;
            vec![
                (TIMESTAMP_HEADER.to_string(), materials.timestamp.to_string()),
                (SIGNATURE_HEADER.to_string(), signature),
            ]
        }
        SecurityMethod::WebhookSecret { header, value } => vec![(header.clone(), value.clone())],
    };

    Ok(headers)
}

/// HMAC-SHA256 signer over `timestamp || body`.
pub struct HmacSigner {
    secret: String,
}

impl HmacSigner {
    /// Creates a new signer with the given secret.
    pub fn new(secret: impl Into<String>) -> Self {
        Self { secret: secret.into() }
    }

    /// Returns the lowercase hex signature for `timestamp || payload`.
    pub fn sign(&self, timestamp: i64, payload: &[u8]) -> Result<String, SigningError> {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).map_err(|_| SigningError::InvalidKey)?;

        mac.update(timestamp.to_string().as_bytes());
        mac.update(payload);

        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Verifies a signature against the payload.
    pub fn verify(&self, signature: &str, timestamp: i64, payload: &[u8]) -> bool {
        match self.sign(timestamp, payload) {
            Ok(expected) => constant_time_compare(&expected, signature),
            Err(_) => false,
        }
    }
}

/// Receiver-side verification failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VerificationError {
    /// Timestamp header is not a unix timestamp.
    #[error("Invalid timestamp")]
    InvalidTimestamp,
    /// Timestamp is outside the freshness window.
    #[error("Signature expired")]
    Expired,
    /// Signature does not match.
    #[error("Invalid signature")]
    Invalid,
}

/// Verifies `X-Timestamp`/`X-Signature` the way a receiver should.
///
/// Rejects timestamps further than `tolerance_secs` from `now` in either
/// direction, then compares signatures in constant time.
pub fn verify_hmac_signature(
    secret: &str,
    timestamp_header: &str,
    signature_header: &str,
    body: &[u8],
    tolerance_secs: i64,
    now: i64,
) -> Result<(), VerificationError> {
    let timestamp = timestamp_header
        .trim()
        .parse::<i64>()
        .map_err(|_| VerificationError::InvalidTimestamp)?;

    if now.abs_diff(timestamp) > u64::try_from(tolerance_secs).unwrap_or(0) {
        return Err(VerificationError::Expired);
    }

    if !HmacSigner::new(secret).verify(signature_header.trim(), timestamp, body) {
        return Err(VerificationError::Invalid);
    }

    Ok(())
}

/// Constant-time string comparison to prevent timing attacks.
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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn materials(body: &[u8]) -> SigningMaterials<'_> {
        SigningMaterials {
            timestamp: 1_700_000_000,
            body,
        }
    }

    fn header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
        headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn test_none_emits_nothing() {
        let headers = sign(&SecurityMethod::None, materials(b"{}")).unwrap();
        assert!(headers.is_empty());
    }

    #[test]
    fn test_basic_auth() {
        let method = SecurityMethod::Basic {
            username: "aladdin".to_string(),
            password: "opensesame".to_string(),
        };
        let headers = sign(&method, materials(b"{}")).unwrap();
        assert_eq!(
            header(&headers, "Authorization"),
            Some("Basic YWxhZGRpbjpvcGVuc2VzYW1l")
        );
    }

    #[test]
    fn test_bearer_and_api_key() {
        let bearer = SecurityMethod::BearerToken { token: "tok".to_string() };
        let headers = sign(&bearer, materials(b"")).unwrap();
        assert_eq!(header(&headers, "Authorization"), Some("Bearer tok"));

        let api_key = SecurityMethod::ApiKey {
            header: "X-Api-Key".to_string(),
            value: "k-123".to_string(),
        };
        let headers = sign(&api_key, materials(b"")).unwrap();
        assert_eq!(headers, vec![("X-Api-Key".to_string(), "k-123".to_string())]);
    }

    #[test]
    fn test_hmac_headers_and_determinism() {
        let method = SecurityMethod::HmacSha256 { secret: "s3cr3t".to_string() };
        let body = br#"{"id":42}"#;

        let first = sign(&method, materials(body)).unwrap();
        let second = sign(&method, materials(body)).unwrap();

        assert_eq!(first, second);
        assert_eq!(header(&first, TIMESTAMP_HEADER), Some("1700000000"));

        let signature = header(&first, SIGNATURE_HEADER).unwrap();
        assert_eq!(signature.len(), 64);
        assert!(HmacSigner::new("s3cr3t").verify(signature, 1_700_000_000, body));
        assert!(!HmacSigner::new("s3cr3t").verify(signature, 1_700_000_001, body));
        assert!(!HmacSigner::new("other").verify(signature, 1_700_000_000, body));
    }

    #[test]
    fn test_hmac_covers_timestamp_then_body() {
        let signer = HmacSigner::new("key");
        // timestamp || body with no separator
        let concatenated = signer.sign(12, b"34").unwrap();
        assert_eq!(concatenated, signer.sign(1, b"234").unwrap());
        assert_ne!(concatenated, signer.sign(12, b"35").unwrap());
    }

    #[test]
    fn test_webhook_secret_static_header() {
        let method = SecurityMethod::from_config("webhook_secret", &json!({"secret": "shh"})).unwrap();
        let headers = sign(&method, materials(b"body")).unwrap();
        assert_eq!(header(&headers, DEFAULT_SECRET_HEADER), Some("shh"));
    }

    #[test]
    fn test_from_config_requires_fields() {
        assert!(SecurityMethod::from_config("none", &json!({})).is_ok());
        assert!(SecurityMethod::from_config("basic", &json!({"username": "u"})).is_err());
        assert!(SecurityMethod::from_config("bearer_token", &json!({"token": ""})).is_err());
        assert!(SecurityMethod::from_config("api_key", &json!({"value": "v"})).is_err());
        assert!(SecurityMethod::from_config("hmac_sha256", &json!({})).is_err());
        assert!(SecurityMethod::from_config("oauth", &json!({})).is_err());

        let api_key = SecurityMethod::from_config(
            "api_key",
            &json!({"key_name": "X-Key", "key_value": "v"}),
        )
        .unwrap();
        assert_eq!(
            api_key,
            SecurityMethod::ApiKey {
                header: "X-Key".to_string(),
                value: "v".to_string()
            }
        );
    }

    #[test]
    fn test_sign_fails_closed_on_empty_credentials() {
        let method = SecurityMethod::HmacSha256 { secret: String::new() };
        let err = sign(&method, materials(b"{}")).unwrap_err();
        assert_eq!(
            err,
            SigningError::MissingField {
                method: "hmac_sha256",
                field: "secret"
            }
        );
        assert!(!DeliveryError::from(err).is_retryable());
    }

    #[test]
    fn test_receiver_verification() {
        let body = b"payload";
        let signature = HmacSigner::new("s3cr3t").sign(1000, body).unwrap();

        assert_eq!(verify_hmac_signature("s3cr3t", "1000", &signature, body, 300, 1200), Ok(()));
        assert_eq!(
            verify_hmac_signature("s3cr3t", "1000", &signature, body, 300, 1400),
            Err(VerificationError::Expired)
        );
        assert_eq!(
            verify_hmac_signature("s3cr3t", "1000", &signature, b"tampered", 300, 1000),
            Err(VerificationError::Invalid)
        );
        assert_eq!(
            verify_hmac_signature("s3cr3t", "soon", &signature, body, 300, 1000),
            Err(VerificationError::InvalidTimestamp)
        );

        // Extreme timestamps are stale, not an arithmetic fault.
        assert_eq!(
            verify_hmac_signature("s3cr3t", "-9223372036854775808", "00", body, 300, 1_700_000_000),
            Err(VerificationError::Expired)
        );
        assert_eq!(
            verify_hmac_signature("s3cr3t", "9223372036854775807", "00", body, 300, -1),
            Err(VerificationError::Expired)
        );
    }

    #[test]
    fn test_debug_redacts_credentials() {
        let method = SecurityMethod::BearerToken { token: "super-secret".to_string() };
        assert!(!format!("{method:?}").contains("super-secret"));
    }
}
