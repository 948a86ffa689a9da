//! Failure taxonomy for the mesh.
//!
//! Every per-connection failure stays inside the connection that raised it;
//! the dispatch loop only ever sees the resulting peer-down event. Handshake
//! rejections map onto HTTP status codes so the acceptor can return them
//! straight from an axum handler.

use std::fmt::Display;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MeshError {
    /// The handshake carried a missing or wrong `auth_token`.
    #[error("missing/incorrect auth_token header")]
    Authentication,

    /// A live connection for this node id already exists.
    #[error("already connected to {peer_id}")]
    DuplicateConnection { peer_id: String },

    /// The handshake was well authenticated but otherwise unusable.
    #[error("bad handshake: {0}")]
    Handshake(String),

    /// Read or write on an established connection failed.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The peer could not be reached at all.
    #[error("failed to dial {address}: {reason}")]
    Dial { address: String, reason: String },

    /// A received frame was not a valid cluster message.
    #[error("failed to decode frame: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("mesh is shutting down")]
    ShuttingDown,
}

impl MeshError {
    pub(crate) fn transport(err: impl Display) -> Self {
        Self::Transport(err.to_string())
    }

    pub(crate) fn dial(address: &str, reason: impl Display) -> Self {
        Self::Dial {
            address: address.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            MeshError::Authentication => StatusCode::UNAUTHORIZED,
            MeshError::DuplicateConnection { .. } => StatusCode::CONFLICT,
            MeshError::Handshake(_) | MeshError::Decode(_) => StatusCode::BAD_REQUEST,
            MeshError::Transport(_) => StatusCode::INTERNAL_SERVER_ERROR,
            MeshError::Dial { .. } => StatusCode::BAD_GATEWAY,
            MeshError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for MeshError {
    fn into_response(self) -> Response {
        (self.status_code(), self.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_rejections_are_client_errors() {
        assert_eq!(MeshError::Authentication.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            MeshError::DuplicateConnection {
                peer_id: "a".into()
            }
            .status_code(),
            StatusCode::CONFLICT
        );
        assert!(MeshError::Handshake("no node_id".into())
            .status_code()
            .is_client_error());
    }
}
