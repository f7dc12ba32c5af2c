//! Subscription state machine.
//!
//! [`SubscriptionMachine::dispatch`] is the single entry point: it takes an
//! [`Input`] (a caller command, a transport event or the reconnect timer),
//! updates the state and returns the [`Effect`]s the driver must perform, in
//! order. The machine does no I/O, so every transition can be asserted in
//! isolation.

use std::{fmt, time::Duration};

use tracing::{debug, error, warn};

use super::{config::StreamConfig, message::Message};
use crate::error::StreamError;

/// Subscription status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamStatus {
    /// Not connected. Initial state; also reached by `close()` or when
    /// reconnect attempts are exhausted.
    Closed,
    /// A transport is being opened.
    Connecting,
    /// The transport is delivering messages.
    Open,
    /// The transport failed; a reconnect may be scheduled.
    Error,
}

impl StreamStatus {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

impl fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Connecting => write!(f, "connecting"),
            Self::Open => write!(f, "open"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Everything that can happen to a subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    /// Caller asked to connect.
    Connect,
    /// Caller asked to reconnect now, resetting the attempt counter.
    Reconnect,
    /// Caller asked to close.
    Close,
    /// The transport reported it is open.
    TransportOpened,
    /// The transport delivered a raw payload.
    TransportMessage(String),
    /// The transport failed or ended.
    TransportFailed(StreamError),
    /// The scheduled reconnect delay elapsed.
    ReconnectTimerFired,
}

/// Work the driver performs on behalf of the machine.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Status changed.
    Transition { from: StreamStatus, to: StreamStatus },
    /// Open a fresh transport to the subscription URL.
    OpenTransport,
    /// Drop the current transport.
    DisposeTransport,
    /// Fire [`Input::ReconnectTimerFired`] after the delay.
    ArmReconnectTimer(Duration),
    CancelReconnectTimer,
    NotifyOpen,
    /// Append to the buffer and notify the caller.
    Deliver(Message),
    NotifyError(StreamError),
    NotifyClose,
}

/// Reconnect state of one subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionMachine {
    status: StreamStatus,
    reconnect_attempts: u32,
    max_reconnect_attempts: u32,
    reconnect_interval: Duration,
    timer_armed: bool,
    transport_live: bool,
    last_error: Option<StreamError>,
}

impl SubscriptionMachine {
    /// Create a machine in the `Closed` state.
    pub fn new(max_reconnect_attempts: u32, reconnect_interval: Duration) -> Self {
        Self {
            status: StreamStatus::Closed,
            reconnect_attempts: 0,
            max_reconnect_attempts,
            reconnect_interval,
            timer_armed: false,
            transport_live: false,
            last_error: None,
        }
    }

    /// Create a machine from a subscription configuration.
    pub fn from_config(config: &StreamConfig) -> Self {
        Self::new(config.max_reconnect_attempts, config.reconnect_interval)
    }

    pub fn status(&self) -> StreamStatus {
        self.status
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    /// The most recent transport failure, cleared when a transport opens.
    pub fn last_error(&self) -> Option<&StreamError> {
        self.last_error.as_ref()
    }

    /// Apply `input` and return the effects to perform, in order.
    pub fn dispatch(&mut self, input: Input) -> Vec<Effect> {
        let mut effects = Vec::new();
        match input {
            Input::Connect => self.connect(&mut effects),
            Input::Reconnect => {
                self.reconnect_attempts = 0;
                self.connect(&mut effects);
            }
            Input::Close => self.close(&mut effects),
            Input::TransportOpened => {
                if !self.transport_live || self.status != StreamStatus::Connecting {
                    debug!(status = %self.status, "Ignoring stale open event");
                    return effects;
                }
                self.transition(StreamStatus::Open, &mut effects);
                self.last_error = None;
                self.reconnect_attempts = 0;
                effects.push(Effect::NotifyOpen);
            }
            Input::TransportMessage(payload) => {
                if self.status != StreamStatus::Open {
                    debug!(status = %self.status, "Ignoring message outside open state");
                    return effects;
                }
                match Message::decode(&payload) {
                    Ok(message) => effects.push(Effect::Deliver(message)),
                    Err(err) => {
                        warn!(error = %err, bytes = payload.len(), "Discarding undecodable stream message");
                    }
                }
            }
            Input::TransportFailed(err) => {
                if !self.transport_live {
                    debug!(error = %err, "Ignoring failure of a disposed transport");
                    return effects;
                }
                self.fail(err, &mut effects);
            }
            Input::ReconnectTimerFired => {
                if !self.timer_armed {
                    return effects;
                }
                self.timer_armed = false;
                if self.status == StreamStatus::Error {
                    self.connect(&mut effects);
                }
            }
        }
        effects
    }

    fn connect(&mut self, effects: &mut Vec<Effect>) {
        self.cancel_timer(effects);
        self.dispose(effects);
        self.transition(StreamStatus::Connecting, effects);
        self.transport_live = true;
        effects.push(Effect::OpenTransport);
    }

    fn close(&mut self, effects: &mut Vec<Effect>) {
        if self.status == StreamStatus::Closed && !self.timer_armed && !self.transport_live {
            return;
        }
        self.cancel_timer(effects);
        self.dispose(effects);
        self.transition(StreamStatus::Closed, effects);
        effects.push(Effect::NotifyClose);
    }

    fn fail(&mut self, err: StreamError, effects: &mut Vec<Effect>) {
        self.dispose(effects);
        self.transition(StreamStatus::Error, effects);
        self.last_error = Some(err.clone());
        effects.push(Effect::NotifyError(err));

        if self.reconnect_attempts < self.max_reconnect_attempts {
            self.reconnect_attempts += 1;
            self.timer_armed = true;
            warn!(
                attempt = self.reconnect_attempts,
                max_attempts = self.max_reconnect_attempts,
                delay_ms = self.reconnect_interval.as_millis() as u64,
                "Stream reconnect scheduled"
            );
            effects.push(Effect::ArmReconnectTimer(self.reconnect_interval));
        } else {
            error!(
                attempts = self.reconnect_attempts,
                "Max stream reconnect attempts exceeded"
            );
            self.transition(StreamStatus::Closed, effects);
            effects.push(Effect::NotifyClose);
        }
    }

    fn cancel_timer(&mut self, effects: &mut Vec<Effect>) {
        if self.timer_armed {
            self.timer_armed = false;
            effects.push(Effect::CancelReconnectTimer);
        }
    }

    fn dispose(&mut self, effects: &mut Vec<Effect>) {
        if self.transport_live {
            self.transport_live = false;
            effects.push(Effect::DisposeTransport);
        }
    }

    fn transition(&mut self, to: StreamStatus, effects: &mut Vec<Effect>) {
        let from = self.status;
        if from != to {
            self.status = to;
            effects.push(Effect::Transition { from, to });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Duration = Duration::from_millis(100);
    const VALID: &str =
        r#"{"agent":"a","status":"running","message":"hi","timestamp":"2026-01-01T00:00:00Z"}"#;

    fn transitions(effects: &[Effect]) -> Vec<StreamStatus> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Transition { to, .. } => Some(*to),
                _ => None,
            })
            .collect()
    }

    fn failure() -> Input {
        Input::TransportFailed(StreamError::transport("connection refused"))
    }

    #[test]
    fn test_connect_from_closed() {
        let mut machine = SubscriptionMachine::new(3, INTERVAL);
        assert_eq!(machine.status(), StreamStatus::Closed);

        let effects = machine.dispatch(Input::Connect);
        assert_eq!(
            effects,
            vec![
                Effect::Transition {
                    from: StreamStatus::Closed,
                    to: StreamStatus::Connecting
                },
                Effect::OpenTransport,
            ]
        );
    }

    #[test]
    fn test_open_resets_attempts_and_clears_error() {
        let mut machine = SubscriptionMachine::new(3, INTERVAL);
        machine.dispatch(Input::Connect);
        machine.dispatch(failure());
        assert_eq!(machine.reconnect_attempts(), 1);
        assert!(machine.last_error().is_some());

        machine.dispatch(Input::ReconnectTimerFired);
        let effects = machine.dispatch(Input::TransportOpened);

        assert_eq!(machine.status(), StreamStatus::Open);
        assert_eq!(machine.reconnect_attempts(), 0);
        assert!(machine.last_error().is_none());
        assert!(effects.contains(&Effect::NotifyOpen));
    }

    #[test]
    fn test_cap_respected_with_three_attempts() {
        let mut machine = SubscriptionMachine::new(3, INTERVAL);
        let mut seen = transitions(&machine.dispatch(Input::Connect));

        for _ in 0..3 {
            let effects = machine.dispatch(failure());
            assert!(effects.contains(&Effect::ArmReconnectTimer(INTERVAL)));
            seen.extend(transitions(&effects));
            seen.extend(transitions(&machine.dispatch(Input::ReconnectTimerFired)));
        }
        let last = machine.dispatch(failure());
        assert!(last.contains(&Effect::NotifyClose));
        assert!(!last.iter().any(|e| matches!(e, Effect::ArmReconnectTimer(_))));
        seen.extend(transitions(&last));

        use StreamStatus::*;
        assert_eq!(
            seen,
            vec![
                Connecting, Error, Connecting, Error, Connecting, Error, Connecting, Error, Closed
            ]
        );
        assert_eq!(machine.reconnect_attempts(), 3);

        // No timer is armed, so a stray tick does nothing.
        assert!(machine.dispatch(Input::ReconnectTimerFired).is_empty());
    }

    #[test]
    fn test_manual_reconnect_resets_counter() {
        let mut machine = SubscriptionMachine::new(3, INTERVAL);
        machine.dispatch(Input::Connect);
        machine.dispatch(failure());
        machine.dispatch(Input::ReconnectTimerFired);
        machine.dispatch(failure());
        assert_eq!(machine.reconnect_attempts(), 2);

        let effects = machine.dispatch(Input::Reconnect);
        assert_eq!(machine.reconnect_attempts(), 0);
        assert_eq!(machine.status(), StreamStatus::Connecting);
        assert_eq!(
            effects,
            vec![
                Effect::CancelReconnectTimer,
                Effect::Transition {
                    from: StreamStatus::Error,
                    to: StreamStatus::Connecting
                },
                Effect::OpenTransport,
            ]
        );
    }

    #[test]
    fn test_reconnect_after_exhaustion() {
        let mut machine = SubscriptionMachine::new(0, INTERVAL);
        machine.dispatch(Input::Connect);
        machine.dispatch(failure());
        assert_eq!(machine.status(), StreamStatus::Closed);

        machine.dispatch(Input::Reconnect);
        assert_eq!(machine.status(), StreamStatus::Connecting);
    }

    #[test]
    fn test_malformed_message_is_discarded() {
        let mut machine = SubscriptionMachine::new(3, INTERVAL);
        machine.dispatch(Input::Connect);
        machine.dispatch(Input::TransportOpened);

        let effects = machine.dispatch(Input::TransportMessage("{not json".to_string()));
        assert!(effects.is_empty());
        assert_eq!(machine.status(), StreamStatus::Open);

        let effects = machine.dispatch(Input::TransportMessage(VALID.to_string()));
        assert!(matches!(effects.as_slice(), [Effect::Deliver(m)] if m.agent == "a"));
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut machine = SubscriptionMachine::new(3, INTERVAL);
        machine.dispatch(Input::Connect);
        machine.dispatch(Input::TransportOpened);

        let effects = machine.dispatch(Input::Close);
        assert_eq!(
            effects,
            vec![
                Effect::DisposeTransport,
                Effect::Transition {
                    from: StreamStatus::Open,
                    to: StreamStatus::Closed
                },
                Effect::NotifyClose,
            ]
        );
        assert!(machine.dispatch(Input::Close).is_empty());
    }

    #[test]
    fn test_close_cancels_pending_reconnect() {
        let mut machine = SubscriptionMachine::new(3, INTERVAL);
        machine.dispatch(Input::Connect);
        machine.dispatch(failure());

        let effects = machine.dispatch(Input::Close);
        assert_eq!(effects.first(), Some(&Effect::CancelReconnectTimer));
        assert_eq!(machine.status(), StreamStatus::Closed);

        // A tick racing the cancellation must not resurrect the subscription.
        assert!(machine.dispatch(Input::ReconnectTimerFired).is_empty());
        assert_eq!(machine.status(), StreamStatus::Closed);
    }

    #[test]
    fn test_close_when_never_connected_is_noop() {
        let mut machine = SubscriptionMachine::new(3, INTERVAL);
        assert!(machine.dispatch(Input::Close).is_empty());
    }

    #[test]
    fn test_stale_transport_events_ignored() {
        let mut machine = SubscriptionMachine::new(3, INTERVAL);
        assert!(machine.dispatch(Input::TransportOpened).is_empty());
        assert!(machine.dispatch(failure()).is_empty());
        assert!(
            machine
                .dispatch(Input::TransportMessage(VALID.to_string()))
                .is_empty()
        );
        assert_eq!(machine.status(), StreamStatus::Closed);
    }
}
