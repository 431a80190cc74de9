//! Runs a [`Session`] against a real WebSocket.
//!
//! One task multiplexes user commands, the in-flight handshake, inbound frames
//! and the retry deadline. The backoff is a deadline polled by the same
//! `select!`, so commands keep flowing while a retry is pending.

use std::{collections::VecDeque, future::Future, pin::Pin, time::Duration};

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use tokio::{
    net::TcpStream,
    select,
    sync::mpsc,
    time::{Instant, sleep_until, timeout},
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{
        Error as WsError, Message,
        protocol::{CloseFrame, frame::coding::CloseCode},
    },
};
use tracing::{debug, info, warn};

use crate::{
    client::{
        gate::PresenceGate,
        session::{ConnectionState, Effect, Notice, Session, SessionEvent},
    },
    config::ClientConfig,
    envelope::{self, Envelope, Tag},
    error::ClientError,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Handshake = Pin<Box<dyn Future<Output = HandshakeOutcome> + Send>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserCommand {
    SetIdentity(String),
    SetTarget(String),
    Connect,
    Disconnect,
    Send { body: String, tag: Tag },
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Notice(Notice),
    /// Envelope relayed from another participant.
    Message(Envelope),
    /// Our own envelope, shown locally once it is on the wire.
    Echo(Envelope),
    Rejected(ClientError),
    State(ConnectionState),
}

enum HandshakeOutcome {
    Opened(Box<WsStream>),
    Failed(SessionEvent),
}

pub async fn run(
    config: ClientConfig,
    mut commands: mpsc::Receiver<UserCommand>,
    events: mpsc::Sender<ClientEvent>,
) -> Result<()> {
    let mut driver = Driver::new(config, events);

    loop {
        select! {
            command = commands.recv() => match command {
                Some(UserCommand::Quit) | None => break,
                Some(command) => driver.on_command(command).await,
            },
            outcome = poll_handshake(&mut driver.handshake) => driver.on_handshake(outcome).await,
            frame = next_frame(&mut driver.transport) => driver.on_frame(frame).await,
            _ = retry_timer(driver.retry_at) => {
                driver.retry_at = None;
                driver.apply(SessionEvent::RetryElapsed).await;
            }
        }
    }

    driver.shutdown().await;
    Ok(())
}

struct Driver {
    session: Session,
    config: ClientConfig,
    events: mpsc::Sender<ClientEvent>,
    handshake: Option<Handshake>,
    transport: Option<WsStream>,
    /// Set once the peer's close frame has been seen on the current transport.
    close_code: Option<Option<u16>>,
    retry_at: Option<Instant>,
}

impl Driver {
    fn new(config: ClientConfig, events: mpsc::Sender<ClientEvent>) -> Self {
        let gate = PresenceGate::new(&config.identity, &config.target);
        Self {
            session: Session::new(gate, config.reconnect),
            config,
            events,
            handshake: None,
            transport: None,
            close_code: None,
            retry_at: None,
        }
    }

    async fn on_command(&mut self, command: UserCommand) {
        match command {
            UserCommand::SetIdentity(identity) => {
                if let Err(err) = self.session.set_identity(&identity) {
                    self.emit(ClientEvent::Rejected(err)).await;
                }
            }
            UserCommand::SetTarget(target) => {
                if let Err(err) = self.session.set_target(&target) {
                    self.emit(ClientEvent::Rejected(err)).await;
                }
            }
            UserCommand::Connect => self.apply(SessionEvent::Connect).await,
            UserCommand::Disconnect => self.apply(SessionEvent::Disconnect).await,
            UserCommand::Send { body, tag } => self.send(&body, tag).await,
            UserCommand::Quit => {}
        }
    }

    async fn send(&mut self, body: &str, tag: Tag) {
        let (echo, frame) = match self.session.compose(body, tag, self.config.wire_format) {
            Ok(composed) => composed,
            Err(err) => {
                self.emit(ClientEvent::Rejected(err)).await;
                return;
            }
        };
        let Some(transport) = self.transport.as_mut() else {
            self.emit(ClientEvent::Rejected(ClientError::NotConnected)).await;
            return;
        };

        match transport.send(Message::Text(frame)).await {
            Ok(()) => self.emit(ClientEvent::Echo(echo)).await,
            Err(err) => {
                warn!(error = %err, "send failed, dropping transport");
                self.transport = None;
                self.apply(SessionEvent::Closed {
                    clean: false,
                    code: None,
                })
                .await;
            }
        }
    }

    async fn on_handshake(&mut self, outcome: HandshakeOutcome) {
        match outcome {
            HandshakeOutcome::Opened(stream) => {
                info!(relay = %self.session.gate().target(), "connected to relay");
                self.transport = Some(*stream);
                self.close_code = None;
                self.apply(SessionEvent::Opened).await;
            }
            HandshakeOutcome::Failed(event) => self.apply(event).await,
        }
    }

    async fn on_frame(&mut self, frame: Option<Result<Message, WsError>>) {
        let clean = match frame {
            Some(Ok(Message::Text(text))) => {
                self.emit(ClientEvent::Message(envelope::decode(&text))).await;
                return;
            }
            Some(Ok(Message::Close(frame))) => {
                self.close_code = Some(frame.map(|frame| u16::from(frame.code)));
                return;
            }
            Some(Ok(_)) => return,
            Some(Err(err)) => {
                debug!(error = %err, "transport read failed");
                self.close_code.is_some()
            }
            None => self.close_code.is_some(),
        };

        self.transport = None;
        let code = self.close_code.take().flatten();
        self.apply(SessionEvent::Closed { clean, code }).await;
    }

    /// Feeds an event to the session and carries out the resulting effects,
    /// including any follow-up events those effects produce.
    async fn apply(&mut self, event: SessionEvent) {
        let mut pending = VecDeque::from([event]);
        while let Some(event) = pending.pop_front() {
            let before = self.session.state();
            for effect in self.session.handle(event) {
                if let Some(follow_up) = self.execute(effect).await {
                    pending.push_back(follow_up);
                }
            }
            let after = self.session.state();
            if after != before {
                self.emit(ClientEvent::State(after)).await;
            }
        }
    }

    async fn execute(&mut self, effect: Effect) -> Option<SessionEvent> {
        match effect {
            Effect::OpenTransport { target } => {
                self.handshake = Some(Box::pin(open_transport(
                    target,
                    self.config.connect_timeout,
                )));
                None
            }
            Effect::CloseTransport => self.close_transport().await,
            Effect::ScheduleRetry { attempt, delay } => {
                debug!(attempt, delay_ms = delay.as_millis() as u64, "retry scheduled");
                self.retry_at = Some(Instant::now() + delay);
                None
            }
            Effect::CancelRetry => {
                self.retry_at = None;
                None
            }
            Effect::Notify(notice) => {
                self.emit(ClientEvent::Notice(notice)).await;
                None
            }
        }
    }

    async fn close_transport(&mut self) -> Option<SessionEvent> {
        // Abandoning a handshake closes nothing on the wire.
        self.handshake = None;
        let Some(transport) = self.transport.as_mut() else {
            return Some(SessionEvent::Closed {
                clean: true,
                code: None,
            });
        };

        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "client disconnect".into(),
        };
        match transport.close(Some(frame)).await {
            // The peer's reply arrives through on_frame.
            Ok(()) => None,
            Err(err) => {
                debug!(error = %err, "close handshake failed");
                self.transport = None;
                Some(SessionEvent::Closed {
                    clean: false,
                    code: None,
                })
            }
        }
    }

    async fn shutdown(&mut self) {
        self.handshake = None;
        if let Some(mut transport) = self.transport.take() {
            if let Err(err) = transport.close(None).await {
                debug!(error = %err, "failed to close transport on exit");
            }
        }
    }

    async fn emit(&mut self, event: ClientEvent) {
        if self.events.send(event).await.is_err() {
            debug!("client event receiver dropped");
        }
    }
}

async fn open_transport(target: String, connect_timeout: Duration) -> HandshakeOutcome {
    match timeout(connect_timeout, connect_async(target.as_str())).await {
        Ok(Ok((stream, _response))) => HandshakeOutcome::Opened(Box::new(stream)),
        Ok(Err(err)) => HandshakeOutcome::Failed(classify_connect_error(err)),
        Err(_) => {
            debug!(relay = %target, "connect attempt timed out");
            HandshakeOutcome::Failed(SessionEvent::Closed {
                clean: false,
                code: None,
            })
        }
    }
}

/// Bad addresses cannot succeed on retry; everything else is a lost connection.
fn classify_connect_error(err: WsError) -> SessionEvent {
    match err {
        WsError::Url(_) | WsError::HttpFormat(_) => SessionEvent::TransportFailed {
            reason: err.to_string(),
        },
        other => {
            debug!(error = %other, "connect attempt failed");
            SessionEvent::Closed {
                clean: false,
                code: None,
            }
        }
    }
}

async fn poll_handshake(handshake: &mut Option<Handshake>) -> HandshakeOutcome {
    if let Some(pending) = handshake.as_mut() {
        let outcome = pending.await;
        *handshake = None;
        return outcome;
    }
    std::future::pending().await
}

async fn next_frame(transport: &mut Option<WsStream>) -> Option<Result<Message, WsError>> {
    match transport {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

async fn retry_timer(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}
