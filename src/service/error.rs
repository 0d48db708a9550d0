use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    #[error("prediction service request failed: {0}")]
    Transport(String),
    #[error("prediction service returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid prediction service payload: {0}")]
    Protocol(String),
    #[error("prediction service unavailable: {0}")]
    Unavailable(String),
}

impl ServiceError {
    pub fn status(status: u16, body: &str) -> Self {
        Self::Status {
            status,
            body: body.chars().take(240).collect(),
        }
    }

    pub fn http_status(&self) -> Option<u16> {
        match self {
            ServiceError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}
