use std::fmt;

use serde::{Deserialize, Serialize};

use crate::service::ServiceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionErrorKind {
    Service,
    Disposed,
    InvalidScope,
    InvalidRequest,
    ScopeChanged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredictionError {
    pub kind: PredictionErrorKind,
    pub message: String,
}

impl PredictionError {
    pub fn new(kind: PredictionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for PredictionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for PredictionError {}

impl From<ServiceError> for PredictionError {
    fn from(err: ServiceError) -> Self {
        PredictionError::new(PredictionErrorKind::Service, err.to_string())
    }
}

pub fn disposed() -> PredictionError {
    PredictionError::new(PredictionErrorKind::Disposed, "prediction state has been disposed")
}

pub fn invalid_scope(message: impl Into<String>) -> PredictionError {
    PredictionError::new(PredictionErrorKind::InvalidScope, message)
}

pub fn invalid_request(message: impl Into<String>) -> PredictionError {
    PredictionError::new(PredictionErrorKind::InvalidRequest, message)
}

pub fn scope_changed(message: impl Into<String>) -> PredictionError {
    PredictionError::new(PredictionErrorKind::ScopeChanged, message)
}
