//! The push transport seam.

use futures_util::stream::BoxStream;

/// Event emitted by an open push transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushEvent {
    /// The channel is established.
    Open,
    /// One text message.
    Message(String),
    /// The channel failed. No further events follow.
    Error(String),
}

/// Stream of events from one transport connection. Dropping it closes the
/// connection.
pub type PushEvents = BoxStream<'static, PushEvent>;

/// A one-way, server-to-client text channel bound to a URL.
pub trait PushTransport: Send + Sync + 'static {
    /// Open a fresh connection to `url`.
    ///
    /// Connection failures are reported as a [`PushEvent::Error`] on the
    /// returned stream, never by panicking or blocking here.
    fn open(&self, url: &str) -> PushEvents;
}
