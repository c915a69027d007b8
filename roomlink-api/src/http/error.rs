// HTTP error handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;

use roomlink_sfu::{AdmissionError, ProtocolError, SessionError};

/// Result type for HTTP handlers
pub type AppResult<T> = Result<T, AppError>;

/// Application error with HTTP status code
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }

    pub fn bad_gateway(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }

    pub fn internal_server_error(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.status, self.message)
    }
}

impl std::error::Error for AppError {}

/// Error response JSON structure
#[derive(Debug, Serialize, Deserialize)]
struct ErrorResponse {
    error: String,
    status: u16,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status;
        let body = Json(ErrorResponse {
            error: self.message,
            status: status.as_u16(),
        });

        (status, body).into_response()
    }
}

impl From<ProtocolError> for AppError {
    fn from(err: ProtocolError) -> Self {
        let status = StatusCode::from_u16(err.code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!("Protocol error: {}", err);
        }
        Self::new(status, err.to_string())
    }
}

impl From<SessionError> for AppError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::RoomNotFound(_) | SessionError::BroadcasterNotFound(_) | SessionError::RoomClosed(_) => {
                Self::not_found(err.to_string())
            }
            SessionError::RoomAlreadyExists(_) | SessionError::BroadcasterAlreadyExists(_) => {
                Self::conflict(err.to_string())
            }
            SessionError::InvalidInput(msg) => Self::bad_request(msg),
            SessionError::NoWorkers => Self::service_unavailable(err.to_string()),
            SessionError::Protocol(e) => e.into(),
            SessionError::Engine { .. } => {
                tracing::error!("Engine error: {}", err);
                Self::internal_server_error(err.to_string())
            }
        }
    }
}

impl From<AdmissionError> for AppError {
    fn from(err: AdmissionError) -> Self {
        match err {
            AdmissionError::MissingParameter(_) => Self::bad_request(err.to_string()),
            AdmissionError::RoomFull { .. } => Self::forbidden(err.to_string()),
            AdmissionError::RoomClosed(_) => Self::conflict(err.to_string()),
            AdmissionError::Unavailable(e) => e.into(),
        }
    }
}

/// Convert cluster errors to HTTP errors
impl From<roomlink_cluster::Error> for AppError {
    fn from(err: roomlink_cluster::Error) -> Self {
        use roomlink_cluster::Error;

        match err {
            Error::NoServersAvailable | Error::InsufficientCapacity { .. } => {
                Self::service_unavailable(err.to_string())
            }
            Error::ServerNotFound(_) => Self::not_found(err.to_string()),
            Error::InvalidInput(msg) => Self::bad_request(msg),
            Error::Forward(_) => {
                tracing::warn!("Room forwarding failed: {}", err);
                Self::bad_gateway(err.to_string())
            }
            Error::Database(_) | Error::Timeout(_) => {
                tracing::error!("Ledger error: {}", err);
                Self::service_unavailable("Ledger temporarily unavailable")
            }
            Error::Serialization(_) | Error::Configuration(_) => {
                tracing::error!("Internal error: {}", err);
                Self::internal_server_error("Internal server error")
            }
        }
    }
}

/// Convert anyhow errors to HTTP errors
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        tracing::error!("Anyhow error: {}", err);
        Self::internal_server_error("Internal server error")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_error_statuses() {
        assert_eq!(
            AppError::from(SessionError::RoomNotFound("r".into())).status,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::from(SessionError::RoomAlreadyExists("r".into())).status,
            StatusCode::CONFLICT
        );
        let err = AppError::from(SessionError::InvalidInput("bad".into()));
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.message, "bad");
        assert_eq!(
            AppError::from(SessionError::Protocol(ProtocolError::TransportNotFound("t".into()))).status,
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn test_cluster_error_statuses() {
        use roomlink_cluster::Error;

        assert_eq!(
            AppError::from(Error::NoServersAvailable).status,
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            AppError::from(Error::Forward("x".into())).status,
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            AppError::from(Error::InvalidInput("x".into())).status,
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_admission_error_statuses() {
        assert_eq!(
            AppError::from(AdmissionError::MissingParameter("roomId")).status,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::from(AdmissionError::RoomFull {
                room_id: "r".into(),
                max_peers: 2
            })
            .status,
            StatusCode::FORBIDDEN
        );
    }
}
