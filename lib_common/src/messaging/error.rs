use std::time::Duration;

use thiserror::Error;

use super::transport::{ResourceKind, TransportError};
use crate::connections::manager::ConnectError;

/// Every error keeps the transport cause and names the action that failed.
#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("failed to check if {kind} {name} exists: {source}")]
    ExistenceCheck {
        kind: ResourceKind,
        name: String,
        #[source]
        source: TransportError,
    },
    #[error("failed to create {kind} {name}: {source}")]
    Create {
        kind: ResourceKind,
        name: String,
        #[source]
        source: TransportError,
    },
    #[error("failed to publish message: {0}")]
    Publish(#[source] TransportError),
    #[error("publisher for topic {0} is closed")]
    PublisherClosed(String),
    #[error("deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),
    #[error("operation cancelled")]
    Cancelled,
    /// A terminal receive-loop error, as reported by the transport.
    #[error(transparent)]
    Transport(TransportError),
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error("invalid messaging configuration: {0}")]
    Config(String),
}

impl MessagingError {
    /// Cancellation is driven by the caller and is not a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, MessagingError::Cancelled)
    }

    /// The transport error underneath, if any.
    pub fn transport_error(&self) -> Option<&TransportError> {
        match self {
            MessagingError::ExistenceCheck { source, .. } | MessagingError::Create { source, .. } => Some(source),
            MessagingError::Publish(source) | MessagingError::Transport(source) => Some(source),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.transport_error().is_some_and(TransportError::is_not_found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_action() {
        let err = MessagingError::Create {
            kind: ResourceKind::Subscription,
            name: "billing".into(),
            source: TransportError::Backend("connection reset".into()),
        };
        assert_eq!(
            err.to_string(),
            "failed to create subscription billing: broker error: connection reset"
        );

        let err = MessagingError::Publish(TransportError::not_found(ResourceKind::Topic, "events"));
        assert_eq!(err.to_string(), "failed to publish message: topic events not found");
        assert!(err.is_not_found());
    }

    #[test]
    fn test_transport_errors_pass_through_unwrapped() {
        let err = MessagingError::Transport(TransportError::not_found(ResourceKind::Subscription, "gone"));
        assert_eq!(err.to_string(), "subscription gone not found");
        assert!(!err.is_cancelled());
        assert!(MessagingError::Cancelled.is_cancelled());
    }
}
