//! Request and response bodies of the gateway RPC protocol.
//!
//! Every operation is a `POST /rpc/<Operation>` carrying the channel in
//! the [`CHANNEL_HEADER`] header.  Bodies are JSON except for `SaveFile`
//! (raw request body, key in the query string) and `GetFile` (raw
//! response body).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::backend::{AccessToken, DownloadUrl};

/// Header naming the channel a call runs against.
pub const CHANNEL_HEADER: &str = "x-channel";

/// Optional header bounding how long the gateway works on a call.
pub const TIMEOUT_HEADER: &str = "x-timeout-ms";

/// RPC operation names, as they appear in the URL path.
pub mod op {
    pub const SAVE_FILE: &str = "SaveFile";
    pub const GET_FILE: &str = "GetFile";
    pub const DELETE: &str = "Delete";
    pub const EXIST: &str = "Exist";
    pub const LIST: &str = "List";
    pub const IS_PUBLIC: &str = "IsPublic";
    pub const GET_DOWNLOAD_URL: &str = "GetDownloadUrl";
    pub const GET_SIGNED_URL: &str = "GetSignedUrl";
    pub const GET_ACCESS_TOKEN: &str = "GetAccessToken";
}

/// Path of an RPC operation.
pub fn rpc_path(operation: &str) -> String {
    format!("/rpc/{operation}")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveFileResponse {
    pub url: String,
}

/// Body of every call addressing a single object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyRequest {
    pub key: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Empty {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExistResponse {
    pub exist: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListRequest {
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListResponse {
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsPublicResponse {
    pub is_public: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedUrlRequest {
    pub key: String,
    pub content_type: String,
    pub expire_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedUrlResponse {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessTokenBody {
    pub access_token: String,
    pub token_type: String,
    #[serde(default)]
    pub refresh_token: String,
    /// Unix seconds.
    #[serde(with = "chrono::serde::ts_seconds")]
    pub expiry: DateTime<Utc>,
}

impl From<AccessToken> for AccessTokenBody {
    fn from(token: AccessToken) -> Self {
        Self {
            access_token: token.access_token,
            token_type: token.token_type,
            refresh_token: token.refresh_token,
            expiry: token.expiry,
        }
    }
}

impl From<AccessTokenBody> for AccessToken {
    fn from(body: AccessTokenBody) -> Self {
        Self {
            access_token: body.access_token,
            token_type: body.token_type,
            refresh_token: body.refresh_token,
            expiry: body.expiry,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadUrlResponse {
    pub url: String,
    pub is_public: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<AccessTokenBody>,
}

impl From<DownloadUrl> for DownloadUrlResponse {
    fn from(download: DownloadUrl) -> Self {
        let is_public = download.is_public();
        let (url, token) = download.into_parts();
        Self {
            url,
            is_public,
            token: token.map(AccessTokenBody::from),
        }
    }
}

impl DownloadUrlResponse {
    /// Rebuild a [`DownloadUrl`].  Fails when `is_public` and the
    /// presence of a token disagree.
    pub fn into_download_url(self) -> Result<DownloadUrl, String> {
        match (self.is_public, self.token) {
            (true, None) => Ok(DownloadUrl::public(self.url)),
            (false, Some(token)) => Ok(DownloadUrl::private(self.url, token.into())),
            (true, Some(_)) => Err("public download URL carries an access token".to_string()),
            (false, None) => Err("private download URL without an access token".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token() -> AccessToken {
        AccessToken {
            access_token: "ya29.x".to_string(),
            token_type: "Bearer".to_string(),
            refresh_token: String::new(),
            expiry: DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        }
    }

    #[test]
    fn test_public_download_omits_token() {
        let resp = DownloadUrlResponse::from(DownloadUrl::public("https://x/b/k".into()));
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["is_public"], true);
        assert!(json.get("token").is_none());
    }

    #[test]
    fn test_private_download_carries_token() {
        let resp = DownloadUrlResponse::from(DownloadUrl::private("https://x/b/k".into(), token()));
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("\"expiry\":1767225600"));

        let back: DownloadUrlResponse = serde_json::from_str(&json).unwrap();
        let url = back.into_download_url().unwrap();
        assert!(!url.is_public());
        assert_eq!(url.access_token(), Some(&token()));
    }

    #[test]
    fn test_token_expiry_is_unix_seconds() {
        let json = serde_json::to_value(AccessTokenBody::from(token())).unwrap();
        assert!(json["expiry"].is_i64());
        assert_eq!(json["expiry"], 1_767_225_600_i64);

        let back: AccessTokenBody = serde_json::from_value(json).unwrap();
        assert_eq!(AccessToken::from(back), token());
    }

    #[test]
    fn test_inconsistent_download_is_rejected() {
        let resp = DownloadUrlResponse {
            url: "https://x/b/k".into(),
            is_public: false,
            token: None,
        };
        assert!(resp.into_download_url().is_err());
    }

    #[test]
    fn test_list_request_path_defaults_to_empty() {
        let req: ListRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(req.path, "");
        assert_eq!(rpc_path(op::LIST), "/rpc/List");
    }
}
