//! Service-account signing: OAuth2 token assertions and signed URLs.
//!
//! Everything here is pure computation over the key material; no network
//! calls happen in this module.
//!
//! Signed upload URLs come in two schemes:
//! - V2: `GoogleAccessId`, `Expires` (absolute unix time) and a base64
//!   RSA-SHA256 signature over `METHOD\nMD5\nTYPE\nEXPIRES\n/bucket/object`.
//! - V4: `X-Goog-*` query parameters, a canonical request hashed with
//!   SHA-256 and a hex RSA-SHA256 signature over the string-to-sign.

use base64::engine::general_purpose::{STANDARD as BASE64_STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::credentials::ServiceAccountKey;
use crate::errors::{StorageError, StorageResult};

/// Maximum signed URL lifetime (7 days).
pub const MAX_SIGNED_URL_TTL: u64 = 604800;

/// Read-only scope handed out to callers.
pub const SCOPE_READ_ONLY: &str = "https://www.googleapis.com/auth/devstorage.read_only";

/// Scope the gateway itself uses against the JSON API.
pub const SCOPE_FULL_CONTROL: &str = "https://www.googleapis.com/auth/devstorage.full_control";

/// Lifetime requested for token assertions.
const ASSERTION_LIFETIME_SECS: i64 = 3600;

const V4_ALGORITHM: &str = "GOOG4-RSA-SHA256";
const V4_SIGNED_HEADERS: &str = "content-type;host";

/// RFC 3986 unreserved characters stay literal; everything else is encoded.
const UNRESERVED: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Same as [`UNRESERVED`] but keeps `/` so object paths stay readable.
const PATH: &AsciiSet = &UNRESERVED.remove(b'/');

/// Signed URL scheme.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SigningScheme {
    #[default]
    V2,
    V4,
}

/// Percent-encode an object name for use in a URL path.
pub fn encode_object_path(object: &str) -> String {
    utf8_percent_encode(object, PATH).to_string()
}

fn encode_query_value(value: &str) -> String {
    utf8_percent_encode(value, UNRESERVED).to_string()
}

/// RSA-SHA256 (PKCS#1 v1.5) signature of `message`.
pub fn rsa_sha256(message: &[u8], key: &EncodingKey) -> StorageResult<Vec<u8>> {
    let encoded = jsonwebtoken::crypto::sign(message, key, Algorithm::RS256)
        .map_err(|e| StorageError::Auth(format!("signing failed: {e}")))?;
    URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|e| StorageError::Auth(format!("signing failed: {e}")))
}

#[derive(Debug, Serialize, Deserialize)]
struct AssertionClaims {
    iss: String,
    scope: String,
    aud: String,
    iat: i64,
    exp: i64,
}

/// Build the RS256 JWT assertion exchanged for an access token.
pub fn token_assertion(
    key: &ServiceAccountKey,
    encoding_key: &EncodingKey,
    scope: &str,
    now: DateTime<Utc>,
) -> StorageResult<String> {
    let iat = now.timestamp();
    let claims = AssertionClaims {
        iss: key.client_email.clone(),
        scope: scope.to_string(),
        aud: key.token_uri().to_string(),
        iat,
        exp: iat + ASSERTION_LIFETIME_SECS,
    };

    let mut header = Header::new(Algorithm::RS256);
    header.kid = key.private_key_id.clone();

    jsonwebtoken::encode(&header, &claims, encoding_key)
        .map_err(|e| StorageError::Auth(format!("cannot build token assertion: {e}")))
}

/// Inputs of one signed upload URL.
#[derive(Debug, Clone)]
pub struct UploadUrlRequest<'a> {
    pub bucket: &'a str,
    pub object: &'a str,
    pub content_type: &'a str,
    pub issued: DateTime<Utc>,
    pub ttl: Duration,
}

/// Signs upload URLs for one service account.
pub struct UrlSigner<'a> {
    pub client_email: &'a str,
    pub key: &'a EncodingKey,
    /// Scheme and host the URL points at, e.g. `https://storage.googleapis.com`.
    pub base: &'a str,
}

impl UrlSigner<'_> {
    /// Produce a PUT upload URL under `scheme`.
    pub fn sign(&self, scheme: SigningScheme, req: &UploadUrlRequest<'_>) -> StorageResult<String> {
        validate_upload_request(req)?;
        match scheme {
            SigningScheme::V2 => self.sign_v2(req),
            SigningScheme::V4 => self.sign_v4(req),
        }
    }

    fn sign_v2(&self, req: &UploadUrlRequest<'_>) -> StorageResult<String> {
        let expires = req.issued.timestamp() + req.ttl.as_secs() as i64;
        let string_to_sign =
            v2_string_to_sign("PUT", req.content_type, expires, req.bucket, req.object);
        let signature = BASE64_STANDARD.encode(rsa_sha256(string_to_sign.as_bytes(), self.key)?);

        Ok(format!(
            "{}/{}/{}?GoogleAccessId={}&Expires={}&Signature={}",
            self.base.trim_end_matches('/'),
            req.bucket,
            encode_object_path(req.object),
            encode_query_value(self.client_email),
            expires,
            encode_query_value(&signature),
        ))
    }

    fn sign_v4(&self, req: &UploadUrlRequest<'_>) -> StorageResult<String> {
        let host = host_of(self.base)?;
        let datetime = req.issued.format("%Y%m%dT%H%M%SZ").to_string();
        let date = req.issued.format("%Y%m%d").to_string();
        let scope = format!("{date}/auto/storage/goog4_request");

        let mut query = BTreeMap::new();
        query.insert("X-Goog-Algorithm", V4_ALGORITHM.to_string());
        query.insert(
            "X-Goog-Credential",
            format!("{}/{}", self.client_email, scope),
        );
        query.insert("X-Goog-Date", datetime.clone());
        query.insert("X-Goog-Expires", req.ttl.as_secs().to_string());
        query.insert("X-Goog-SignedHeaders", V4_SIGNED_HEADERS.to_string());
        let canonical_query = canonical_query_string(&query);

        let canonical_uri = format!("/{}/{}", req.bucket, encode_object_path(req.object));
        let canonical_request = v4_canonical_request(
            "PUT",
            &canonical_uri,
            &canonical_query,
            req.content_type,
            &host,
        );
        let string_to_sign = v4_string_to_sign(&datetime, &scope, &canonical_request);
        let signature = hex::encode(rsa_sha256(string_to_sign.as_bytes(), self.key)?);

        Ok(format!(
            "{}{}?{}&X-Goog-Signature={}",
            self.base.trim_end_matches('/'),
            canonical_uri,
            canonical_query,
            signature
        ))
    }
}

fn validate_upload_request(req: &UploadUrlRequest<'_>) -> StorageResult<()> {
    if req.object.is_empty() {
        return Err(StorageError::invalid("object key must not be empty"));
    }
    if req.content_type.trim().is_empty() {
        return Err(StorageError::invalid("content type must not be empty"));
    }
    let secs = req.ttl.as_secs();
    if secs == 0 || secs > MAX_SIGNED_URL_TTL {
        return Err(StorageError::invalid(format!(
            "expiry must be between 1 and {MAX_SIGNED_URL_TTL} seconds, got {secs}"
        )));
    }
    Ok(())
}

/// Host (and non-default port) of a base URL, as sent in the `host` header.
fn host_of(base: &str) -> StorageResult<String> {
    let url = reqwest::Url::parse(base)
        .map_err(|e| StorageError::invalid(format!("invalid signing base {base}: {e}")))?;
    let host = url
        .host_str()
        .ok_or_else(|| StorageError::invalid(format!("signing base {base} has no host")))?;
    Ok(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

/// V2 string-to-sign. The Content-MD5 line is left empty.
pub fn v2_string_to_sign(
    method: &str,
    content_type: &str,
    expires: i64,
    bucket: &str,
    object: &str,
) -> String {
    format!(
        "{method}\n\n{content_type}\n{expires}\n/{bucket}/{}",
        encode_object_path(object)
    )
}

fn canonical_query_string(params: &BTreeMap<&str, String>) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", encode_query_value(k), encode_query_value(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/// V4 canonical request for an unsigned-payload upload.
pub fn v4_canonical_request(
    method: &str,
    canonical_uri: &str,
    canonical_query: &str,
    content_type: &str,
    host: &str,
) -> String {
    format!(
        "{method}\n{canonical_uri}\n{canonical_query}\ncontent-type:{}\nhost:{host}\n\n{V4_SIGNED_HEADERS}\nUNSIGNED-PAYLOAD",
        content_type.trim()
    )
}

/// V4 string-to-sign.
pub fn v4_string_to_sign(datetime: &str, scope: &str, canonical_request: &str) -> String {
    let hash = hex::encode(Sha256::digest(canonical_request.as_bytes()));
    format!("{V4_ALGORITHM}\n{datetime}\n{scope}\n{hash}")
}
