use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::{debug, warn};

use liblivefeed::LiveFeedError;

/// A request that failed before streaming started.
#[derive(Debug)]
pub struct ApiError(pub LiveFeedError);

impl From<LiveFeedError> for ApiError {
    fn from(err: LiveFeedError) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self.0 {
            LiveFeedError::InvalidUserId(_) => StatusCode::BAD_REQUEST,
            LiveFeedError::UserNotFound(_) => StatusCode::NOT_FOUND,
            LiveFeedError::AtCapacity(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if self.0.is_client_error() {
            debug!(status = status.as_u16(), error = %self.0, "stream request rejected");
        } else {
            warn!(status = status.as_u16(), error = %self.0, "stream request failed");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_map_to_status_codes() {
        let cases = [
            (LiveFeedError::InvalidUserId("abc".into()), StatusCode::BAD_REQUEST),
            (LiveFeedError::UserNotFound(7), StatusCode::NOT_FOUND),
            (LiveFeedError::AtCapacity(10), StatusCode::SERVICE_UNAVAILABLE),
            (LiveFeedError::Store("disk full".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, expected) in cases {
            assert_eq!(ApiError(err).status(), expected);
        }
    }
}
