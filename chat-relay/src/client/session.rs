//! Connection lifecycle of one client, as a pure state machine.
//!
//! Transport callbacks arrive as [`SessionEvent`]s and the machine answers with
//! [`Effect`]s for the driver to carry out. Nothing here touches a socket or a
//! timer, which keeps every transition testable without a runtime.

use std::time::Duration;

use tracing::debug;

use crate::{
    client::gate::PresenceGate,
    config::{ReconnectPolicy, WireFormat},
    envelope::{Envelope, Tag},
    error::ClientError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closing,
    Disconnected,
    Backoff { attempt: u32, delay: Duration },
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Explicit user request to connect.
    Connect,
    Opened,
    /// The transport could not even be constructed (bad address, bad scheme).
    TransportFailed { reason: String },
    /// Explicit user request to leave.
    Disconnect,
    Closed { clean: bool, code: Option<u16> },
    RetryElapsed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    OpenTransport { target: String },
    CloseTransport,
    ScheduleRetry { attempt: u32, delay: Duration },
    CancelRetry,
    Notify(Notice),
}

/// Status updates meant for the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Connecting { target: String },
    Connected { identity: String },
    Disconnected { code: Option<u16> },
    ConnectionLost,
    Reconnecting {
        attempt: u32,
        max_attempts: u32,
        delay: Duration,
    },
    Failed(ClientError),
}

/// `2^attempt * base`, saturating instead of overflowing.
pub fn backoff_delay(attempt: u32, base: Duration) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    base.saturating_mul(factor)
}

#[derive(Debug, Clone)]
pub struct Session {
    gate: PresenceGate,
    policy: ReconnectPolicy,
    state: ConnectionState,
    attempt: u32,
}

impl Session {
    pub fn new(gate: PresenceGate, policy: ReconnectPolicy) -> Self {
        Self {
            gate,
            policy,
            state: ConnectionState::Idle,
            attempt: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn gate(&self) -> &PresenceGate {
        &self.gate
    }

    pub fn set_identity(&mut self, identity: &str) -> Result<(), ClientError> {
        self.gate.set_identity(identity)
    }

    pub fn set_target(&mut self, target: &str) -> Result<(), ClientError> {
        self.gate.set_target(target)
    }

    /// Whether the connect action should be offered right now.
    pub fn can_connect(&self) -> bool {
        self.gate.is_ready()
            && matches!(
                self.state,
                ConnectionState::Idle | ConnectionState::Exhausted
            )
    }

    pub fn can_send(&self) -> bool {
        self.state == ConnectionState::Open
    }

    /// Builds the outbound frame and the envelope to echo locally.
    pub fn compose(
        &self,
        body: &str,
        tag: Tag,
        format: WireFormat,
    ) -> Result<(Envelope, String), ClientError> {
        let body = body.trim();
        if body.is_empty() {
            return Err(ClientError::EmptyMessage);
        }
        if !self.can_send() {
            return Err(ClientError::NotConnected);
        }
        let envelope = Envelope::new(self.gate.identity(), body, tag);
        let frame = envelope.encode(format);
        Ok((envelope, frame))
    }

    pub fn handle(&mut self, event: SessionEvent) -> Vec<Effect> {
        use ConnectionState::*;

        match (self.state, event) {
            (Idle | Exhausted, SessionEvent::Connect) => self.connect(),
            (Connecting, SessionEvent::Opened) => {
                self.attempt = 0;
                self.set_state(Open);
                vec![Effect::Notify(Notice::Connected {
                    identity: self.gate.identity().to_string(),
                })]
            }
            (Connecting, SessionEvent::TransportFailed { reason }) => {
                self.settle(Idle);
                vec![Effect::Notify(Notice::Failed(
                    ClientError::TransportConstruction {
                        target: self.gate.target().to_string(),
                        reason,
                    },
                ))]
            }
            (Connecting | Open, SessionEvent::Closed { clean: false, .. }) => {
                self.connection_lost()
            }
            (Connecting | Open | Closing, SessionEvent::Closed { code, .. }) => {
                self.settle(Idle);
                vec![Effect::Notify(Notice::Disconnected { code })]
            }
            (Connecting | Open, SessionEvent::Disconnect) => {
                self.set_state(Closing);
                vec![Effect::CloseTransport]
            }
            (Backoff { .. }, SessionEvent::Disconnect) => {
                self.settle(Idle);
                vec![
                    Effect::CancelRetry,
                    Effect::Notify(Notice::Disconnected { code: None }),
                ]
            }
            (Backoff { .. }, SessionEvent::RetryElapsed) => {
                if self.gate.is_ready() {
                    self.open_transport()
                } else {
                    self.exhaust()
                }
            }
            (state, event) => {
                debug!(?state, ?event, "ignoring session event");
                Vec::new()
            }
        }
    }

    fn connect(&mut self) -> Vec<Effect> {
        if !self.gate.is_ready() {
            return vec![Effect::Notify(Notice::Failed(ClientError::NotReady))];
        }
        if self.state == ConnectionState::Exhausted {
            self.attempt = 0;
        }
        self.open_transport()
    }

    fn open_transport(&mut self) -> Vec<Effect> {
        self.gate.lock();
        self.set_state(ConnectionState::Connecting);
        let target = self.gate.target().to_string();
        vec![
            Effect::Notify(Notice::Connecting {
                target: target.clone(),
            }),
            Effect::OpenTransport { target },
        ]
    }

    fn connection_lost(&mut self) -> Vec<Effect> {
        self.settle(ConnectionState::Disconnected);
        let mut effects = vec![Effect::Notify(Notice::ConnectionLost)];

        self.attempt += 1;
        if self.attempt > self.policy.max_attempts {
            effects.extend(self.exhaust());
            return effects;
        }

        let attempt = self.attempt;
        let delay = backoff_delay(attempt, self.policy.base_delay);
        self.set_state(ConnectionState::Backoff { attempt, delay });
        effects.push(Effect::ScheduleRetry { attempt, delay });
        effects.push(Effect::Notify(Notice::Reconnecting {
            attempt,
            max_attempts: self.policy.max_attempts,
            delay,
        }));
        effects
    }

    fn exhaust(&mut self) -> Vec<Effect> {
        self.settle(ConnectionState::Exhausted);
        vec![Effect::Notify(Notice::Failed(ClientError::RetryExhausted {
            attempts: self.policy.max_attempts,
        }))]
    }

    /// Moves to a resting state where identity and target are editable again.
    fn settle(&mut self, state: ConnectionState) {
        self.gate.unlock();
        self.set_state(state);
    }

    fn set_state(&mut self, next: ConnectionState) {
        debug!(from = ?self.state, to = ?next, attempt = self.attempt, "session transition");
        self.state = next;
    }
}
