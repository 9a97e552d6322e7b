use crate::{
    constants::{BASIC_AUTH_REALM, HEADER_TEXT},
    forms::FieldErrors,
};
use axum::{
    body::Body,
    http::StatusCode,
    http::header,
    response::{IntoResponse, Response},
};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("{message}")]
    Http { status: StatusCode, message: String },
    #[error("ERRORS: {0}")]
    Validation(FieldErrors),
    #[error("storage failure: {0}")]
    Storage(String),
    #[error("internal server error")]
    Internal,
}

impl RegistryError {
    pub fn http(status: StatusCode, message: impl Into<String>) -> Self {
        Self::Http {
            status,
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Http { status, .. } => *status,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Storage(_) | Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            // storage details stay in the logs
            RegistryError::Storage(detail) => {
                tracing::error!(detail = %detail, "storage failure");
                "internal server error".to_string()
            }
            other => other.to_string(),
        };

        let mut builder = Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, HEADER_TEXT);
        if status == StatusCode::UNAUTHORIZED {
            builder = builder.header(
                header::WWW_AUTHENTICATE,
                format!("Basic realm=\"{BASIC_AUTH_REALM}\""),
            );
        }
        builder.body(Body::from(message)).unwrap_or_else(|_| {
            (StatusCode::INTERNAL_SERVER_ERROR, "internal server error").into_response()
        })
    }
}

impl From<std::io::Error> for RegistryError {
    fn from(err: std::io::Error) -> Self {
        RegistryError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for RegistryError {
    fn from(_: serde_json::Error) -> Self {
        RegistryError::Internal
    }
}

impl From<FieldErrors> for RegistryError {
    fn from(errors: FieldErrors) -> Self {
        RegistryError::Validation(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::RegistryError;
    use crate::forms::FieldErrors;
    use axum::{http::StatusCode, http::header, response::IntoResponse};

    #[test]
    fn unauthorized_responses_carry_basic_challenge() {
        let response =
            RegistryError::http(StatusCode::UNAUTHORIZED, "who are you").into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response
                .headers()
                .get(header::WWW_AUTHENTICATE)
                .and_then(|value| value.to_str().ok()),
            Some("Basic realm=\"pypi\"")
        );
    }

    #[test]
    fn validation_errors_render_as_bad_request() {
        let mut errors = FieldErrors::default();
        errors.add("name", "This field is required.");
        let err = RegistryError::from(errors);
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.to_string(), "ERRORS: name: This field is required.");
    }

    #[test]
    fn io_errors_become_storage_failures() {
        let err = RegistryError::from(std::io::Error::other("disk on fire"));
        assert!(matches!(err, RegistryError::Storage(_)));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
