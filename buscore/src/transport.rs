//! The connection the [Executor](crate::Executor) pumps.

use {crate::Error, std::time::Duration, zbus::Message};

pub mod connection;
pub mod memory;

/// A bus connection.
///
/// Implementations must be usable from several threads at once: one thread calls
/// [Self::recv] in a loop while any number of threads call [Self::send].
pub trait Transport: Send + Sync + 'static {
    /// The unique name assigned by the bus.
    fn unique_name(&self) -> Option<String>;

    /// Queues a message for sending.
    ///
    /// Messages are sent in the order in which this function is called. This function
    /// does not block.
    fn send(&self, msg: Message) -> Result<(), Error>;

    /// Waits up to `timeout` for the next incoming message.
    ///
    /// Returns `Ok(None)` if the timeout expired and [Error::ConnectionLost] once the
    /// connection is gone.
    fn recv(&self, timeout: Duration) -> Result<Option<Message>, Error>;

    /// Closes the connection. Calling this multiple times has no further effect.
    fn close(&self);
}
