//! Request Signing for the Cloud REST API
//!
//! Signed endpoints expect a Hawk-style `Authorization` header computed from
//! the cloud-issued [`SigningCredential`].
//!
//! # Algorithm
//!
//! 1. Draw the current Unix timestamp and a random nonce
//! 2. Digest the query and form parameters independently: sort keys, join
//!    `key=value` pairs with `&`, MD5 hex (an absent set digests to `""`)
//! 3. Join `id:secret_id:nonce:timestamp:md5(path):query:form` with `:`
//! 4. HMAC-SHA256 that string with the credential secret and base64 the MAC
//!
//! # Example
//!
//! ```
//! use rrlink_common::auth::{sign_with, SigningCredential};
//!
//! let credential = SigningCredential::new("user-id", "secret-id", "hmac-key", "https://api.example.com");
//! let header = sign_with(&credential, "/user/homes/1", None, None, 1700000000, "abcdefgh").unwrap();
//! assert!(header.starts_with("Hawk id=\"user-id\""));
//! ```

use std::collections::BTreeMap;
use std::fmt;

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::protocol::error::{Result, RrError};
use crate::protocol::message::unix_timestamp;

type HmacSha256 = Hmac<Sha256>;

/// Query or form parameters. The map keeps keys sorted, which is the
/// canonical order for digesting.
pub type Params = BTreeMap<String, String>;

/// Cloud-issued key material used to sign REST requests.
///
/// Obtained from login and never regenerated here. Field aliases accept the
/// provider's short names (`u`, `s`, `h`, `a`).
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningCredential {
    /// Account identifier
    #[serde(alias = "u")]
    pub id: String,
    /// Secret identifier
    #[serde(alias = "s")]
    pub secret_id: String,
    /// Shared HMAC secret
    #[serde(alias = "h")]
    secret: String,
    /// Base URL of the REST endpoint serving this account
    #[serde(alias = "a")]
    pub endpoint: String,
}

impl SigningCredential {
    pub fn new(
        id: impl Into<String>,
        secret_id: impl Into<String>,
        secret: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            secret_id: secret_id.into(),
            secret: secret.into(),
            endpoint: endpoint.into(),
        }
    }
}

impl fmt::Debug for SigningCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningCredential")
            .field("id", &self.id)
            .field("secret_id", &self.secret_id)
            .field("secret", &"*****")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

/// Signs a request with a fresh timestamp and nonce.
///
/// # Arguments
///
/// * `credential` - Key material from login
/// * `path` - Request path, e.g. `/user/homes/123`
/// * `query` - Query parameters, if any
/// * `form` - Form parameters, if any
///
/// # Returns
///
/// The value for the `Authorization` header
pub fn sign(
    credential: &SigningCredential,
    path: &str,
    query: Option<&Params>,
    form: Option<&Params>,
) -> Result<String> {
    sign_with(credential, path, query, form, unix_timestamp() as u64, &generate_nonce())
}

/// Deterministic core of [`sign`]: for fixed inputs the header is always
/// identical.
pub fn sign_with(
    credential: &SigningCredential,
    path: &str,
    query: Option<&Params>,
    form: Option<&Params>,
    timestamp: u64,
    nonce: &str,
) -> Result<String> {
    let timestamp = timestamp.to_string();
    let path_digest = md5_hex(path.as_bytes());
    let query_digest = params_digest(query);
    let form_digest = params_digest(form);

    let prestr = [
        credential.id.as_str(),
        credential.secret_id.as_str(),
        nonce,
        timestamp.as_str(),
        path_digest.as_str(),
        query_digest.as_str(),
        form_digest.as_str(),
    ]
    .join(":");

    let mut mac = HmacSha256::new_from_slice(credential.secret.as_bytes())
        .map_err(|e| RrError::InvalidRequest(format!("invalid signing secret: {}", e)))?;
    mac.update(prestr.as_bytes());
    let mac = STANDARD.encode(mac.finalize().into_bytes());

    Ok(format!(
        "Hawk id=\"{}\",s=\"{}\",ts=\"{}\",nonce=\"{}\",mac=\"{}\"",
        credential.id, credential.secret_id, timestamp, nonce, mac
    ))
}

/// Canonical digest of a parameter set; `""` when absent.
pub fn params_digest(params: Option<&Params>) -> String {
    match params {
        None => String::new(),
        Some(params) => {
            let joined = params
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join("&");
            md5_hex(joined.as_bytes())
        }
    }
}

/// Value of the `header_clientid` header sent to account endpoints.
///
/// `base64(MD5(username || device_identifier))`
pub fn client_id_header(username: &str, device_identifier: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(username.as_bytes());
    hasher.update(device_identifier.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// 6 random bytes, base64url without padding (8 characters).
pub fn generate_nonce() -> String {
    let mut bytes = [0u8; 6];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", Md5::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credential() -> SigningCredential {
        SigningCredential::new("uid-1", "sid-1", "hmac-secret", "https://api.example.com")
    }

    fn params(pairs: &[(&str, &str)]) -> Params {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_signature_is_deterministic() {
        let query = params(&[("s", "abc"), ("t", "xyz")]);
        let a = sign_with(&credential(), "/user/devices/newadd", Some(&query), None, 1_700_000_000, "nonce123").unwrap();
        let b = sign_with(&credential(), "/user/devices/newadd", Some(&query), None, 1_700_000_000, "nonce123").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_signature_matches_reference_computation() {
        let header = sign_with(&credential(), "/user/homes/1", None, None, 1_700_000_000, "nonce123").unwrap();

        let prestr = format!(
            "uid-1:sid-1:nonce123:1700000000:{}::",
            md5_hex(b"/user/homes/1")
        );
        let mut mac = HmacSha256::new_from_slice(b"hmac-secret").unwrap();
        mac.update(prestr.as_bytes());
        let expected_mac = STANDARD.encode(mac.finalize().into_bytes());

        assert_eq!(
            header,
            format!(
                "Hawk id=\"uid-1\",s=\"sid-1\",ts=\"1700000000\",nonce=\"nonce123\",mac=\"{}\"",
                expected_mac
            )
        );
    }

    #[test]
    fn test_every_input_changes_signature() {
        let query = params(&[("a", "1")]);
        let form = params(&[("hid", "9")]);
        let base = sign_with(&credential(), "/p", Some(&query), Some(&form), 100, "n1").unwrap();

        let other_cred = SigningCredential::new("uid-1", "sid-1", "other-secret", "https://api.example.com");
        let variants = [
            sign_with(&other_cred, "/p", Some(&query), Some(&form), 100, "n1").unwrap(),
            sign_with(&credential(), "/q", Some(&query), Some(&form), 100, "n1").unwrap(),
            sign_with(&credential(), "/p", Some(&params(&[("a", "2")])), Some(&form), 100, "n1").unwrap(),
            sign_with(&credential(), "/p", Some(&query), Some(&params(&[("hid", "8")])), 100, "n1").unwrap(),
            sign_with(&credential(), "/p", Some(&query), Some(&form), 101, "n1").unwrap(),
            sign_with(&credential(), "/p", Some(&query), Some(&form), 100, "n2").unwrap(),
            sign_with(&credential(), "/p", None, Some(&form), 100, "n1").unwrap(),
        ];

        for variant in variants {
            assert_ne!(variant, base);
        }
    }

    #[test]
    fn test_query_and_form_are_digested_separately() {
        let set = params(&[("k", "v")]);
        let as_query = sign_with(&credential(), "/p", Some(&set), None, 1, "n").unwrap();
        let as_form = sign_with(&credential(), "/p", None, Some(&set), 1, "n").unwrap();
        assert_ne!(as_query, as_form);
    }

    #[test]
    fn test_params_digest_sorts_keys() {
        let digest = params_digest(Some(&params(&[("tzid", "Europe/Paris"), ("hid", "42")])));
        assert_eq!(digest, md5_hex(b"hid=42&tzid=Europe/Paris"));
        assert_eq!(params_digest(None), "");
    }

    #[test]
    fn test_nonce_shape() {
        let nonce = generate_nonce();
        assert_eq!(nonce.len(), 8);
        assert_ne!(nonce, generate_nonce());
    }

    #[test]
    fn test_client_id_header() {
        let a = client_id_header("user@example.com", "device-a");
        let b = client_id_header("user@example.com", "device-b");
        assert_ne!(a, b);
        assert_eq!(a.len(), 24);
    }

    #[test]
    fn test_credential_debug_masks_secret() {
        let printed = format!("{:?}", credential());
        assert!(!printed.contains("hmac-secret"));
        assert!(printed.contains("*****"));
    }

    #[test]
    fn test_credential_accepts_short_names() {
        let cred: SigningCredential = serde_json::from_str(
            r#"{"u": "uid-1", "s": "sid-1", "h": "hmac-secret", "a": "https://api.example.com"}"#,
        )
        .unwrap();
        assert_eq!(cred, credential());
    }
}
