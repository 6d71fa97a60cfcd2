use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PortalError {
    #[error("{0}")]
    Validation(String),
    #[error("the {time} slot on {date} is already taken")]
    SlotTaken { date: String, time: String },
    #[error("{date} is blocked for booking")]
    DateBlocked { date: String },
    #[error("past visits can no longer be modified")]
    NotEditable,
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("not allowed")]
    Forbidden { hint: &'static str },
    #[error("storage error: {0}")]
    Store(#[from] sqlx::Error),
}

impl PortalError {
    pub fn validation(message: impl Into<String>) -> Self {
        PortalError::Validation(message.into())
    }

    fn hint(&self) -> Option<&str> {
        match self {
            PortalError::Forbidden { hint } => Some(hint),
            PortalError::SlotTaken { .. } => Some("pick another time or cancel the existing visit"),
            PortalError::DateBlocked { .. } => Some("the date is blocked globally or for this client"),
            _ => None,
        }
    }
}

impl ResponseError for PortalError {
    fn status_code(&self) -> StatusCode {
        match self {
            PortalError::Validation(_) | PortalError::NotEditable => StatusCode::BAD_REQUEST,
            PortalError::SlotTaken { .. } | PortalError::DateBlocked { .. } => StatusCode::CONFLICT,
            PortalError::NotFound(_) => StatusCode::NOT_FOUND,
            PortalError::Forbidden { .. } => StatusCode::FORBIDDEN,
            PortalError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        if let PortalError::Store(err) = self {
            log::error!("storage failure: {err}");
        }
        let details = match self {
            PortalError::Store(err) => Some(err.to_string()),
            _ => None,
        };
        HttpResponse::build(self.status_code()).json(json!({
            "error": self.to_string(),
            "details": details,
            "hint": self.hint(),
        }))
    }
}
