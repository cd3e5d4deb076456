//! Presigned STS `GetCallerIdentity` URLs, the basis of EKS IAM tokens.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use super::TokenError;

type HmacSha256 = Hmac<Sha256>;

pub const TOKEN_PREFIX: &str = "k8s-aws-v1.";
pub const CLUSTER_ID_HEADER: &str = "x-k8s-aws-id";
/// Lifetime of the presigned URL, in seconds.
pub const PRESIGN_EXPIRES_SECS: u64 = 15 * 60;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const SERVICE: &str = "sts";
const SIGNED_HEADERS: &str = "host;x-k8s-aws-id";

#[derive(Clone, PartialEq, Eq)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl std::fmt::Debug for AwsCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>, TokenError> {
    let mut mac =
        HmacSha256::new_from_slice(key).map_err(|e| TokenError::Signing(e.to_string()))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Derives the SigV4 signing key for `date` (`YYYYMMDD`).
pub fn signing_key(
    secret: &str,
    date: &str,
    region: &str,
    service: &str,
) -> Result<Vec<u8>, TokenError> {
    let k_date = hmac_sha256(format!("AWS4{secret}").as_bytes(), date.as_bytes())?;
    let k_region = hmac_sha256(&k_date, region.as_bytes())?;
    let k_service = hmac_sha256(&k_region, service.as_bytes())?;
    hmac_sha256(&k_service, b"aws4_request")
}

/// RFC 3986 percent-encoding as SigV4 expects it.
///
/// `url`'s form encoder writes a space as `+` where SigV4 needs `%20`, so it
/// cannot build the canonical query string.
fn uri_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

pub fn sts_host(region: &str) -> String {
    format!("sts.{region}.amazonaws.com")
}

/// Builds a presigned `GetCallerIdentity` URL bound to `cluster` through the
/// signed `x-k8s-aws-id` header.
pub fn presign_get_caller_identity(
    credentials: &AwsCredentials,
    region: &str,
    cluster: &str,
    now: DateTime<Utc>,
) -> Result<String, TokenError> {
    let host = sts_host(region);
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date = now.format("%Y%m%d").to_string();
    let scope = format!("{date}/{region}/{SERVICE}/aws4_request");

    let mut query = BTreeMap::new();
    query.insert("Action", "GetCallerIdentity".to_string());
    query.insert("Version", "2011-06-15".to_string());
    query.insert("X-Amz-Algorithm", ALGORITHM.to_string());
    query.insert(
        "X-Amz-Credential",
        format!("{}/{scope}", credentials.access_key_id),
    );
    query.insert("X-Amz-Date", amz_date.clone());
    query.insert("X-Amz-Expires", PRESIGN_EXPIRES_SECS.to_string());
    if let Some(session_token) = &credentials.session_token {
        query.insert("X-Amz-Security-Token", session_token.clone());
    }
    query.insert("X-Amz-SignedHeaders", SIGNED_HEADERS.to_string());

    let canonical_query = query
        .iter()
        .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
        .collect::<Vec<_>>()
        .join("&");

    let payload_hash = hex::encode(Sha256::digest(b""));
    let canonical_request = format!(
        "GET\n/\n{canonical_query}\nhost:{host}\n{CLUSTER_ID_HEADER}:{cluster}\n\n{SIGNED_HEADERS}\n{payload_hash}"
    );

    let string_to_sign = format!(
        "{ALGORITHM}\n{amz_date}\n{scope}\n{}",
        hex::encode(Sha256::digest(canonical_request.as_bytes()))
    );

    let key = signing_key(&credentials.secret_access_key, &date, region, SERVICE)?;
    let signature = hex::encode(hmac_sha256(&key, string_to_sign.as_bytes())?);

    Ok(format!(
        "https://{host}/?{canonical_query}&X-Amz-Signature={signature}"
    ))
}

pub fn encode_token(presigned_url: &str) -> String {
    format!("{TOKEN_PREFIX}{}", URL_SAFE_NO_PAD.encode(presigned_url))
}
