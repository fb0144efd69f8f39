//! Gateway error types.
//!
//! Every variant is one class of the error vocabulary shared by the
//! in-process clients, the gateway and the remote client.  The enum
//! implements [`axum::response::IntoResponse`] so handlers can simply
//! return `Err(StorageError::NotFound { .. })`, and
//! [`StorageError::from_wire`] turns a gateway error response back into
//! the same variant on the calling side.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Generate a 16-character hex request ID.
pub fn generate_request_id() -> String {
    let bytes: [u8; 8] = rand::random();
    hex::encode(bytes).to_uppercase()
}

/// Storage gateway errors.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The object does not exist in the channel's bucket.
    #[error("object not found: {key}")]
    NotFound { key: String },

    /// Missing channel header, unknown channel, or a malformed argument.
    #[error("{message}")]
    InvalidArgument { message: String },

    /// Credential material could not be read, fetched, or parsed.
    #[error("credential error: {0}")]
    Credential(String),

    /// Token exchange or signing failed.
    #[error("authorization error: {0}")]
    Auth(String),

    /// The backend could not be reached or the client could not be built.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Any backend failure without a more specific class.
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Result alias used across the crate.
pub type StorageResult<T> = Result<T, StorageError>;

/// JSON body of every gateway error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl StorageError {
    /// Shorthand for [`StorageError::InvalidArgument`].
    pub fn invalid(message: impl Into<String>) -> Self {
        StorageError::InvalidArgument {
            message: message.into(),
        }
    }

    /// Shorthand for [`StorageError::NotFound`].
    pub fn not_found(key: impl Into<String>) -> Self {
        StorageError::NotFound { key: key.into() }
    }

    /// Return the stable wire code for this error class.
    pub fn code(&self) -> &'static str {
        match self {
            StorageError::NotFound { .. } => "NotFound",
            StorageError::InvalidArgument { .. } => "InvalidArgument",
            StorageError::Credential(_) => "CredentialError",
            StorageError::Auth(_) => "AuthError",
            StorageError::BackendUnavailable(_) => "BackendUnavailable",
            StorageError::Internal(_) => "Internal",
        }
    }

    /// Return the HTTP status code the gateway answers with.
    pub fn status_code(&self) -> StatusCode {
        match self {
            StorageError::NotFound { .. } => StatusCode::NOT_FOUND,
            StorageError::InvalidArgument { .. } => StatusCode::BAD_REQUEST,
            StorageError::Credential(_) => StatusCode::INTERNAL_SERVER_ERROR,
            StorageError::Auth(_) => StatusCode::BAD_GATEWAY,
            StorageError::BackendUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            StorageError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message carried on the wire, without the class prefix added by
    /// `Display`.
    fn wire_message(&self) -> String {
        match self {
            StorageError::NotFound { key } => key.clone(),
            StorageError::InvalidArgument { message } => message.clone(),
            StorageError::Credential(m)
            | StorageError::Auth(m)
            | StorageError::BackendUnavailable(m) => m.clone(),
            StorageError::Internal(e) => format!("{e:#}"),
        }
    }

    /// Rebuild an error from a gateway error response.
    ///
    /// The `code` field decides the variant.  When the body is not an
    /// [`ErrorBody`] the status code is used instead.
    pub fn from_wire(status: StatusCode, body: &[u8]) -> Self {
        match serde_json::from_slice::<ErrorBody>(body) {
            Ok(err) => match err.code.as_str() {
                "NotFound" => StorageError::NotFound { key: err.message },
                "InvalidArgument" => StorageError::InvalidArgument {
                    message: err.message,
                },
                "CredentialError" => StorageError::Credential(err.message),
                "AuthError" => StorageError::Auth(err.message),
                "BackendUnavailable" => StorageError::BackendUnavailable(err.message),
                _ => StorageError::Internal(anyhow::anyhow!(err.message)),
            },
            Err(_) => {
                let text = String::from_utf8_lossy(body).into_owned();
                match status {
                    StatusCode::NOT_FOUND => StorageError::NotFound { key: text },
                    StatusCode::BAD_REQUEST => StorageError::InvalidArgument { message: text },
                    StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => {
                        StorageError::BackendUnavailable(text)
                    }
                    _ => StorageError::Internal(anyhow::anyhow!("HTTP {status}: {text}")),
                }
            }
        }
    }
}

impl IntoResponse for StorageError {
    fn into_response(self) -> Response {
        let request_id = generate_request_id();
        let status = self.status_code();
        let body = ErrorBody {
            code: self.code().to_string(),
            message: self.wire_message(),
        };

        (
            status,
            [("x-request-id", request_id)],
            axum::Json(body),
        )
            .into_response()
    }
}
