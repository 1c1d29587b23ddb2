//! Error taxonomy for registry, dispatch, storage, eventing and collaborators.
//!
//! Domain errors are typed so callers can branch on them; application glue
//! (settings, CLI, batch runs) wraps them in `anyhow`.

use thiserror::Error;

use crate::dispatcher::AttemptRecord;

/// Failure to register a plugin descriptor.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistrationError {
    /// Descriptor is malformed (empty names, priority out of range, ...).
    #[error("invalid descriptor for plugin `{plugin}`: {reason}")]
    InvalidDescriptor { plugin: String, reason: String },

    /// Two handlers of one descriptor claim the same intent at the same
    /// priority, so registration order cannot order them.
    #[error(
        "plugin `{plugin}` declares `{first}` and `{second}` for intent `{intent}` at identical priority {priority}"
    )]
    DuplicateCapabilityConflict {
        plugin: String,
        intent: String,
        priority: u8,
        first: String,
        second: String,
    },

    /// The plugin failed its own initialization.
    #[error("plugin `{plugin}` failed to initialize: {reason}")]
    InitializationFailed { plugin: String, reason: String },
}

impl RegistrationError {
    pub fn invalid(plugin: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidDescriptor {
            plugin: plugin.into(),
            reason: reason.into(),
        }
    }
}

/// Lookup miss on a plugin or handler.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NotFoundError {
    #[error("plugin `{0}` is not registered")]
    Plugin(String),
    #[error("handler `{handler}` is not registered by plugin `{plugin}`")]
    Handler { plugin: String, handler: String },
}

/// Errors raised by an AI completion/embedding provider.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("provider network error: {0}")]
    Network(String),
    #[error("provider request timed out")]
    Timeout,
    #[error("provider quota exhausted: {0}")]
    Quota(String),
    #[error("provider unavailable: {0}")]
    Unavailable(String),
}

/// Errors from the keyed expiring store and its plugin facades.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("store is closed for writes")]
    Closed,
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("serialization failure: {0}")]
    Serialization(String),
}

impl From<sled::Error> for StorageError {
    fn from(e: sled::Error) -> Self {
        StorageError::Persistence(e.to_string())
    }
}

impl From<bincode::Error> for StorageError {
    fn from(e: bincode::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

/// Errors returned to event publishers and subscribers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EventBusError {
    #[error("event bus is closed")]
    Closed,
    #[error("subscriber `{subscriber_id}` is already subscribed to `{topic}`")]
    AlreadySubscribed { topic: String, subscriber_id: String },
}

/// Failure of the external intent resolver.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IntentResolutionError {
    #[error("request text is empty")]
    EmptyRequest,
    #[error("no intent matched `{0}`")]
    Unrecognized(String),
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Error produced by a single plugin handler invocation.
///
/// Inside `dispatch` these are absorbed into fallthrough; they only reach a
/// caller through `call_plugin`.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Event(#[from] EventBusError),
    #[error("nested plugin call failed: {0}")]
    Call(Box<DispatchError>),
}

impl HandlerError {
    pub fn failed(msg: impl Into<String>) -> Self {
        HandlerError::Failed(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        HandlerError::InvalidInput(msg.into())
    }

    pub fn is_provider(&self) -> bool {
        matches!(self, HandlerError::Provider(_))
    }
}

impl From<DispatchError> for HandlerError {
    fn from(e: DispatchError) -> Self {
        HandlerError::Call(Box::new(e))
    }
}

/// Dispatch-level failures surfaced to the orchestrator or to a calling plugin.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no handler is registered for intent `{intent}`")]
    UnroutableIntent { intent: String },

    #[error("no handler could serve intent `{intent}` ({} candidate(s) tried)", attempts.len())]
    NoHandlerAvailable {
        intent: String,
        attempts: Vec<AttemptRecord>,
    },

    #[error("`{caller}` lacks permission to call `{plugin}::{handler}`")]
    PermissionDenied {
        caller: String,
        plugin: String,
        handler: String,
    },

    #[error(transparent)]
    NotFound(#[from] NotFoundError),

    #[error("plugin call chain depth {depth} exceeds the maximum of {max}")]
    CallDepthExceeded { depth: usize, max: usize },

    #[error("handler `{plugin}::{handler}` timed out after {timeout_ms}ms")]
    HandlerTimeout {
        plugin: String,
        handler: String,
        timeout_ms: u64,
    },

    #[error("handler `{plugin}::{handler}` failed: {source}")]
    Handler {
        plugin: String,
        handler: String,
        #[source]
        source: Box<HandlerError>,
    },

    #[error("dispatch of intent `{intent}` exceeded {timeout_ms}ms")]
    Timeout { intent: String, timeout_ms: u64 },
}

impl DispatchError {
    /// Short machine-readable kind used in structured responses.
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::UnroutableIntent { .. } => "unroutable_intent",
            DispatchError::NoHandlerAvailable { .. } => "no_handler_available",
            DispatchError::PermissionDenied { .. } => "permission_denied",
            DispatchError::NotFound(_) => "not_found",
            DispatchError::CallDepthExceeded { .. } => "call_depth_exceeded",
            DispatchError::HandlerTimeout { .. } => "handler_timeout",
            DispatchError::Handler { .. } => "handler_error",
            DispatchError::Timeout { .. } => "dispatch_timeout",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_error_kinds_are_stable() {
        let err = DispatchError::UnroutableIntent {
            intent: "weather".into(),
        };
        assert_eq!(err.kind(), "unroutable_intent");
        assert!(err.to_string().contains("weather"));

        let err = DispatchError::CallDepthExceeded { depth: 5, max: 4 };
        assert_eq!(err.kind(), "call_depth_exceeded");
    }

    #[test]
    fn test_nested_call_error_wraps_dispatch_error() {
        let inner = DispatchError::NotFound(NotFoundError::Plugin("ghost".into()));
        let err: HandlerError = inner.into();
        assert!(matches!(err, HandlerError::Call(_)));
        assert!(err.to_string().contains("ghost"));
    }
}
