//! Error types for the call manager core

use thiserror::Error;

use crate::types::{CallId, CallState, CallType};

/// Result type for call manager operations
pub type CallManagerResult<T> = Result<T, CallManagerError>;

/// Broad classes of failure, used by callers that map errors onto result codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// An event was not recognized by the current state machine node
    InvalidTransition,
    /// The admission policy refused the request
    AdmissionConflict,
    /// An audio renderer, ringtone or accessory could not be acquired
    Resource,
    /// The request referenced a call that does not exist or is in the wrong state
    LocalState,
    /// The request is not supported for the call's bearer
    Unsupported,
    /// The telephony backend reported a failure
    Backend,
    /// Configuration or lifecycle misuse
    Setup,
}

/// Errors that can occur in the call manager core
#[derive(Debug, Error)]
pub enum CallManagerError {
    /// Event not accepted by the current state
    #[error("Event {event} not accepted in state {state}")]
    InvalidTransition { state: String, event: String },

    /// Admission policy refused the request
    #[error("Not allowed: {reason}")]
    NotAllowed { reason: String },

    /// A dial request is already being processed
    #[error("A dial request is already in progress")]
    DialInProgress,

    /// Audio resource could not be acquired
    #[error("Resource {resource} unavailable: {reason}")]
    ResourceUnavailable { resource: String, reason: String },

    /// Requested output route is not present
    #[error("Audio device unavailable: {device}")]
    DeviceUnavailable { device: String },

    /// Call not found in the registry
    #[error("Call not found: {call_id}")]
    CallNotFound { call_id: CallId },

    /// Call is in the wrong state for the operation
    #[error("Call {call_id} is {state}, cannot {operation}")]
    InvalidState {
        call_id: CallId,
        state: CallState,
        operation: String,
    },

    /// Operation not supported for this call type
    #[error("{operation} is not supported for {call_type} calls")]
    Unsupported { operation: String, call_type: CallType },

    /// Telephony backend failure
    #[error("Backend error in {operation}: {message}")]
    Backend { operation: String, message: String },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Component used before `init`/`start`
    #[error("Not initialized")]
    NotInitialized,

    /// Component initialized twice
    #[error("Already initialized")]
    AlreadyInitialized,

    /// Internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl CallManagerError {
    /// Create an admission rejection
    pub fn not_allowed(reason: impl Into<String>) -> Self {
        Self::NotAllowed {
            reason: reason.into(),
        }
    }

    /// Create a resource acquisition error
    pub fn resource(resource: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ResourceUnavailable {
            resource: resource.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(call_id: CallId, state: CallState, operation: impl Into<String>) -> Self {
        Self::InvalidState {
            call_id,
            state,
            operation: operation.into(),
        }
    }

    /// Create an unsupported operation error
    pub fn unsupported(operation: impl Into<String>, call_type: CallType) -> Self {
        Self::Unsupported {
            operation: operation.into(),
            call_type,
        }
    }

    /// Create a backend error
    pub fn backend(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Backend {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Classify the error
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidTransition { .. } => ErrorCategory::InvalidTransition,
            Self::NotAllowed { .. } | Self::DialInProgress => ErrorCategory::AdmissionConflict,
            Self::ResourceUnavailable { .. } | Self::DeviceUnavailable { .. } => ErrorCategory::Resource,
            Self::CallNotFound { .. } | Self::InvalidState { .. } => ErrorCategory::LocalState,
            Self::Unsupported { .. } => ErrorCategory::Unsupported,
            Self::Backend { .. } => ErrorCategory::Backend,
            Self::Configuration { .. }
            | Self::NotInitialized
            | Self::AlreadyInitialized
            | Self::Internal { .. } => ErrorCategory::Setup,
        }
    }
}

impl From<toml::de::Error> for CallManagerError {
    fn from(err: toml::de::Error) -> Self {
        Self::config(err.to_string())
    }
}

impl From<std::io::Error> for CallManagerError {
    fn from(err: std::io::Error) -> Self {
        Self::config(format!("I/O error: {}", err))
    }
}
