//! Classification of failed fetches and their user-facing messages.

use serde::{Deserialize, Serialize};

/// The HTTP status treated as a successful response.
pub const SUCCESS_STATUS: u16 = 200;

const MESSAGE_FORBIDDEN: &str = "We don't have access to the requested data.";
const MESSAGE_NOT_FOUND: &str = "We couldn't find the data you were looking for.";
const MESSAGE_SERVER_ERROR: &str = "The server ran into a problem while retrieving data. Please try again later.";
const MESSAGE_UNAVAILABLE: &str = "The data service is temporarily unavailable. Please try again shortly.";
const MESSAGE_JSON_MALFORMED: &str = "The data we received was malformed and could not be read.";
const MESSAGE_UNKNOWN: &str =
    "Something went wrong when retrieving data. Please try refreshing or contact us if the problem persists.";

/// Why a fetch did not produce a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    /// HTTP 403.
    Forbidden,
    /// HTTP 404.
    NotFound,
    /// HTTP 500.
    ServerError,
    /// HTTP 503.
    Unavailable,
    /// Successful status but the body could not be parsed.
    JsonMalformed,
    /// Unmapped statuses and transport-level failures.
    Unknown,
}

impl FailureKind {
    /// Classify a non-success HTTP status.
    pub fn from_status(status: u16) -> Self {
        match status {
            403 => Self::Forbidden,
            404 => Self::NotFound,
            500 => Self::ServerError,
            503 => Self::Unavailable,
            _ => Self::Unknown,
        }
    }

    /// User-facing message stored on the error record.
    pub fn message(self) -> &'static str {
        match self {
            Self::Forbidden => MESSAGE_FORBIDDEN,
            Self::NotFound => MESSAGE_NOT_FOUND,
            Self::ServerError => MESSAGE_SERVER_ERROR,
            Self::Unavailable => MESSAGE_UNAVAILABLE,
            Self::JsonMalformed => MESSAGE_JSON_MALFORMED,
            Self::Unknown => MESSAGE_UNKNOWN,
        }
    }
}
