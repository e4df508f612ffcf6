use axum::extract::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use std::env;
use std::fmt::{self, Debug, Display};

#[derive(Clone, Debug, PartialEq)]
pub struct Error {
    pub code: i32,
    pub message: String,
}

impl Error {
    /// Failures worth retrying: the backend or the network may recover.
    pub fn is_transient(&self) -> bool {
        matches!(self.code, 3 | 4 | 6 | 7)
    }

    pub fn is_decode_error(&self) -> bool {
        self.code == 2
    }

    pub fn is_invalid_input_error(&self) -> bool {
        self.code == 101 || self.code == 102
    }

    pub fn is_not_found_error(&self) -> bool {
        self.code == 103
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

impl std::error::Error for Error {}

impl From<env::VarError> for Error {
    fn from(err: env::VarError) -> Self {
        env_var_error(err)
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        reqwest_error(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        decode_error(err)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        io_error(err)
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, error_message) = match self.code {
            1..=99 => (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error"),
            103 => (StatusCode::NOT_FOUND, self.message.as_str()),
            _ => (StatusCode::BAD_REQUEST, self.message.as_str()),
        };

        let body = Json(json!({
            "code": self.code,
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

pub fn invalid_state_error() -> Error {
    Error {
        code: 100,
        message: "invalid state".into(),
    }
}

pub fn invalid_input_error() -> Error {
    Error {
        code: 101,
        message: "invalid input".into(),
    }
}

pub fn counter_bounds_error(min: f64, max: f64) -> Error {
    Error {
        code: 102,
        message: format!(
            "counter offer must be 80-150% of original amount ({:.0} - {:.0})",
            min, max
        ),
    }
}

pub fn not_found_error() -> Error {
    Error {
        code: 103,
        message: "not found".into(),
    }
}

pub fn env_var_error(_: env::VarError) -> Error {
    Error {
        code: 1,
        message: "environment variable error".into(),
    }
}

pub fn decode_error<T: Debug>(err: T) -> Error {
    tracing::debug!("decode failure: {:?}", err);

    Error {
        code: 2,
        message: "decode error".into(),
    }
}

pub fn reqwest_error(err: reqwest::Error) -> Error {
    if err.is_decode() {
        return decode_error(err);
    }

    Error {
        code: 3,
        message: "reqwest error".into(),
    }
}

pub fn upstream_error() -> Error {
    Error {
        code: 4,
        message: "upstream error".into(),
    }
}

pub fn unexpected_error() -> Error {
    Error {
        code: 5,
        message: "unexpected error".into(),
    }
}

pub fn timeout_error() -> Error {
    Error {
        code: 6,
        message: "request timed out".into(),
    }
}

pub fn subscription_error() -> Error {
    Error {
        code: 7,
        message: "subscription error".into(),
    }
}

pub fn io_error(_: std::io::Error) -> Error {
    Error {
        code: 8,
        message: "io error".into(),
    }
}

pub fn presentation_error() -> Error {
    Error {
        code: 9,
        message: "presentation unavailable".into(),
    }
}
