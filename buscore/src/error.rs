use {std::sync::Arc, thiserror::Error, zbus::message::Type};

/// An error.
///
/// Errors are [Clone] because a completed [PendingCall](crate::PendingCall) keeps its
/// reply around and hands a copy to every callback attached after completion.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A handle or argument passed to a constructor was unusable.
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// The transport refused to install a completion notifier.
    #[error("Could not set up the pending call notification")]
    SetupFailed,
    /// The peer replied with an error message.
    #[error("{name}: {description}")]
    Remote { name: String, description: String },
    /// A synchronous wait expired.
    #[error("Timed out waiting for a reply")]
    Timeout,
    /// The connection has been lost or torn down.
    #[error("The bus connection has been lost")]
    ConnectionLost,
    /// The call was cancelled before a reply arrived.
    #[error("The call has been cancelled")]
    Cancelled,
    /// Could not connect to the bus.
    #[error("Could not connect to the bus")]
    Connect(#[source] Arc<zbus::Error>),
    /// Could not start the runtime that drives a bus connection.
    #[error("Could not start the connection runtime")]
    Runtime(#[source] Arc<std::io::Error>),
    /// Could not build or send a message.
    #[error("Could not send a message")]
    Send(#[source] Arc<zbus::Error>),
    /// Could not deserialize a message.
    #[error("Could not deserialize a message")]
    Deserialize(#[source] Arc<zbus::Error>),
    /// A reply was expected but a message of another type was supplied.
    #[error("Expected a method return but got a message of type {0:?}")]
    UnexpectedMessage(Type),
    /// A match rule string could not be parsed.
    #[error("Invalid match rule `{rule}`: {reason}")]
    InvalidMatchRule { rule: String, reason: &'static str },
}

impl Error {
    pub(crate) fn send(e: zbus::Error) -> Self {
        Self::Send(Arc::new(e))
    }

    pub(crate) fn deserialize(e: zbus::Error) -> Self {
        Self::Deserialize(Arc::new(e))
    }

    /// Returns the D-Bus error name if this error was sent by the peer.
    pub fn remote_name(&self) -> Option<&str> {
        match self {
            Self::Remote { name, .. } => Some(name),
            _ => None,
        }
    }
}
