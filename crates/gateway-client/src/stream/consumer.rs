//! Push-stream consumer: a handle plus a background driver task.
//!
//! The driver owns the [`SubscriptionMachine`] and the live transport. It
//! feeds caller commands, transport events and the reconnect timer into the
//! machine and performs the returned effects. Callers observe the
//! subscription through a [`SubscriptionSnapshot`] watch channel, the shared
//! message buffer and an optional [`StreamObserver`].

use std::sync::Arc;

use futures_util::StreamExt;
use parking_lot::RwLock;
use tokio::{
    sync::{mpsc, watch},
    time::Instant,
};
use tracing::{debug, info};

use super::{
    config::StreamConfig,
    machine::{Effect, Input, StreamStatus, SubscriptionMachine},
    message::Message,
    transport::{PushEvent, PushEvents, PushTransport},
};
use crate::error::{StreamError, StreamResult};

/// Lifecycle callbacks, invoked on the driver task in effect order.
///
/// Implementations must not block.
pub trait StreamObserver: Send + Sync + 'static {
    fn on_open(&self) {}

    /// Called after `message` has been appended to the buffer.
    fn on_message(&self, _message: &Message) {}

    fn on_error(&self, _error: &StreamError) {}

    fn on_close(&self) {}

    fn on_transition(&self, _from: StreamStatus, _to: StreamStatus) {}
}

/// Observer that ignores every callback.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl StreamObserver for NoopObserver {}

/// Point-in-time view of a subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionSnapshot {
    pub status: StreamStatus,
    pub reconnect_attempts: u32,
    pub last_error: Option<StreamError>,
}

impl SubscriptionSnapshot {
    fn of(machine: &SubscriptionMachine) -> Self {
        Self {
            status: machine.status(),
            reconnect_attempts: machine.reconnect_attempts(),
            last_error: machine.last_error().cloned(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Command {
    Connect,
    Reconnect,
    Close,
}

impl From<Command> for Input {
    fn from(command: Command) -> Self {
        match command {
            Command::Connect => Input::Connect,
            Command::Reconnect => Input::Reconnect,
            Command::Close => Input::Close,
        }
    }
}

/// Handle to one push-stream subscription.
///
/// Dropping the handle stops the driver and closes the transport.
pub struct StreamConsumer {
    cmd_tx: mpsc::Sender<Command>,
    snapshot: watch::Receiver<SubscriptionSnapshot>,
    buffer: Arc<RwLock<Vec<Message>>>,
}

impl std::fmt::Debug for StreamConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamConsumer")
            .field("snapshot", &*self.snapshot.borrow())
            .field("buffered", &self.buffer.read().len())
            .finish()
    }
}

impl StreamConsumer {
    /// Start the driver in the `Closed` state. Must be called inside a tokio
    /// runtime.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Config`] if the configuration is invalid.
    pub fn spawn(
        config: StreamConfig,
        transport: Arc<dyn PushTransport>,
        observer: Arc<dyn StreamObserver>,
    ) -> StreamResult<Self> {
        config.validate().map_err(StreamError::config)?;

        let machine = SubscriptionMachine::from_config(&config);
        let (cmd_tx, cmd_rx) = mpsc::channel(config.command_channel_capacity);
        let (snapshot_tx, snapshot) = watch::channel(SubscriptionSnapshot::of(&machine));
        let buffer = Arc::new(RwLock::new(Vec::new()));

        let driver = Driver {
            url: config.url,
            machine,
            transport,
            observer,
            snapshot_tx,
            buffer: Arc::clone(&buffer),
            events: None,
            deadline: None,
        };
        tokio::spawn(driver.run(cmd_rx));

        Ok(Self {
            cmd_tx,
            snapshot,
            buffer,
        })
    }

    /// Spawn and immediately connect.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Config`] if the configuration is invalid.
    pub async fn open(
        config: StreamConfig,
        transport: Arc<dyn PushTransport>,
        observer: Arc<dyn StreamObserver>,
    ) -> StreamResult<Self> {
        let consumer = Self::spawn(config, transport, observer)?;
        consumer.connect().await?;
        Ok(consumer)
    }

    /// Open a fresh transport, cancelling any scheduled reconnect.
    ///
    /// # Errors
    ///
    /// Returns an error if the driver task has shut down.
    pub async fn connect(&self) -> StreamResult<()> {
        self.send(Command::Connect).await
    }

    /// Reset the attempt counter and connect immediately.
    ///
    /// # Errors
    ///
    /// Returns an error if the driver task has shut down.
    pub async fn reconnect(&self) -> StreamResult<()> {
        self.send(Command::Reconnect).await
    }

    /// Close the subscription. A no-op when already closed.
    ///
    /// # Errors
    ///
    /// Returns an error if the driver task has shut down.
    pub async fn close(&self) -> StreamResult<()> {
        self.send(Command::Close).await
    }

    async fn send(&self, command: Command) -> StreamResult<()> {
        self.cmd_tx
            .send(command)
            .await
            .map_err(|_| StreamError::driver_gone())
    }

    pub fn status(&self) -> StreamStatus {
        self.snapshot.borrow().status
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.snapshot.borrow().reconnect_attempts
    }

    pub fn last_error(&self) -> Option<StreamError> {
        self.snapshot.borrow().last_error.clone()
    }

    pub fn snapshot(&self) -> SubscriptionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Every message received so far, oldest first.
    pub fn messages(&self) -> Vec<Message> {
        self.buffer.read().clone()
    }

    /// The last `n` messages, oldest first.
    pub fn recent_messages(&self, n: usize) -> Vec<Message> {
        let buffer = self.buffer.read();
        buffer[buffer.len().saturating_sub(n)..].to_vec()
    }

    /// Watch snapshot changes.
    pub fn subscribe(&self) -> watch::Receiver<SubscriptionSnapshot> {
        self.snapshot.clone()
    }

    /// Check whether the driver task is still running.
    pub fn is_running(&self) -> bool {
        !self.cmd_tx.is_closed()
    }
}

struct Driver {
    url: String,
    machine: SubscriptionMachine,
    transport: Arc<dyn PushTransport>,
    observer: Arc<dyn StreamObserver>,
    snapshot_tx: watch::Sender<SubscriptionSnapshot>,
    buffer: Arc<RwLock<Vec<Message>>>,
    events: Option<PushEvents>,
    deadline: Option<Instant>,
}

impl Driver {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        loop {
            let armed = self.deadline;
            let input = tokio::select! {
                biased;

                cmd = cmd_rx.recv() => match cmd {
                    Some(command) => Input::from(command),
                    None => {
                        debug!(url = %self.url, "Stream consumer dropped, shutting down");
                        return;
                    }
                },

                () = tokio::time::sleep_until(armed.unwrap_or_else(Instant::now)), if armed.is_some() => {
                    self.deadline = None;
                    Input::ReconnectTimerFired
                }

                event = next_event(&mut self.events) => match event {
                    Some(PushEvent::Open) => Input::TransportOpened,
                    Some(PushEvent::Message(payload)) => {
                        debug!(bytes = payload.len(), "Stream message received");
                        Input::TransportMessage(payload)
                    }
                    Some(PushEvent::Error(reason)) => {
                        Input::TransportFailed(StreamError::transport(reason))
                    }
                    None => Input::TransportFailed(StreamError::transport("push stream ended")),
                },
            };

            for effect in self.machine.dispatch(input) {
                self.apply(effect);
            }
            let snapshot = SubscriptionSnapshot::of(&self.machine);
            self.snapshot_tx.send_if_modified(|current| {
                if *current == snapshot {
                    return false;
                }
                *current = snapshot;
                true
            });
        }
    }

    fn apply(&mut self, effect: Effect) {
        match effect {
            Effect::Transition { from, to } => {
                debug!(url = %self.url, %from, %to, "Stream status changed");
                self.observer.on_transition(from, to);
            }
            Effect::OpenTransport => {
                info!(
                    url = %self.url,
                    attempt = self.machine.reconnect_attempts(),
                    "Stream connecting"
                );
                self.events = Some(self.transport.open(&self.url));
            }
            Effect::DisposeTransport => self.events = None,
            Effect::ArmReconnectTimer(delay) => self.deadline = Some(Instant::now() + delay),
            Effect::CancelReconnectTimer => self.deadline = None,
            Effect::NotifyOpen => {
                info!(url = %self.url, "Stream open");
                self.observer.on_open();
            }
            Effect::Deliver(message) => {
                self.buffer.write().push(message.clone());
                self.observer.on_message(&message);
            }
            Effect::NotifyError(err) => self.observer.on_error(&err),
            Effect::NotifyClose => {
                info!(url = %self.url, "Stream closed");
                self.observer.on_close();
            }
        }
    }
}

async fn next_event(events: &mut Option<PushEvents>) -> Option<PushEvent> {
    match events {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}
