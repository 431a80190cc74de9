use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result, anyhow};
use chat_relay::{
    client::{ClientEvent, ConnectionState, Notice, UserCommand, driver},
    config::{ClientConfig, ReconnectPolicy, RelayConfig},
    envelope::{self, Envelope, Tag},
    error::ClientError,
    registry::ConnectionRegistry,
    relay::Relay,
};
use futures_util::{SinkExt, StreamExt};
use tokio::{
    net::TcpListener,
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{sleep, timeout},
};
use tokio_tungstenite::{connect_async, tungstenite::Message};

const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    addr: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    shutdown: oneshot::Sender<()>,
    server: JoinHandle<Result<()>>,
}

async fn start_relay() -> Result<Harness> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let relay = Relay::new(listener, RelayConfig::default());
    let addr = relay.local_addr()?;
    let registry = relay.registry();
    let (shutdown, shutdown_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(relay.run_until(async move {
        let _ = shutdown_rx.await;
    }));
    Ok(Harness {
        addr,
        registry,
        shutdown,
        server,
    })
}

struct Client {
    commands: mpsc::Sender<UserCommand>,
    events: mpsc::Receiver<ClientEvent>,
    task: JoinHandle<Result<()>>,
}

impl Client {
    fn spawn(config: ClientConfig) -> Self {
        let (commands, command_rx) = mpsc::channel(16);
        let (event_tx, events) = mpsc::channel(64);
        let task = tokio::spawn(driver::run(config, command_rx, event_tx));
        Self {
            commands,
            events,
            task,
        }
    }

    async fn send(&self, command: UserCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| anyhow!("driver stopped"))
    }

    async fn next_event(&mut self) -> Result<ClientEvent> {
        timeout(WAIT, self.events.recv())
            .await
            .context("timed out waiting for client event")?
            .ok_or_else(|| anyhow!("driver stopped"))
    }

    /// Skips events until one matches, returning it.
    async fn wait_for<F>(&mut self, description: &str, mut matches: F) -> Result<ClientEvent>
    where
        F: FnMut(&ClientEvent) -> bool,
    {
        loop {
            let event = self
                .next_event()
                .await
                .with_context(|| format!("waiting for {description}"))?;
            if matches(&event) {
                return Ok(event);
            }
        }
    }

    async fn quit(self) -> Result<()> {
        self.send(UserCommand::Quit).await?;
        timeout(WAIT, self.task)
            .await
            .context("driver did not exit")???;
        Ok(())
    }
}

fn client_config(addr: SocketAddr, reconnect: ReconnectPolicy) -> ClientConfig {
    ClientConfig {
        identity: "alice".into(),
        target: format!("ws://{addr}/"),
        reconnect,
        connect_timeout: Duration::from_secs(1),
        ..ClientConfig::default()
    }
}

async fn wait_for_connections(registry: &ConnectionRegistry, expected: usize) -> Result<()> {
    timeout(WAIT, async {
        while registry.len().await != expected {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .with_context(|| format!("registry never reached {expected} connections"))
}

#[tokio::test]
async fn chats_through_a_live_relay() -> Result<()> {
    let relay = start_relay().await?;
    let mut alice = Client::spawn(client_config(relay.addr, ReconnectPolicy::default()));
    let (mut bob, _) = connect_async(format!("ws://{}/", relay.addr)).await?;

    alice.send(UserCommand::Connect).await?;
    let connected = alice
        .wait_for("connected notice", |event| {
            matches!(event, ClientEvent::Notice(Notice::Connected { .. }))
        })
        .await?;
    assert_eq!(
        connected,
        ClientEvent::Notice(Notice::Connected {
            identity: "alice".into()
        })
    );
    assert_eq!(
        alice.next_event().await?,
        ClientEvent::State(ConnectionState::Open)
    );
    wait_for_connections(&relay.registry, 2).await?;

    // Identity cannot change while connected.
    alice.send(UserCommand::SetIdentity("mallory".into())).await?;
    assert_eq!(
        alice.next_event().await?,
        ClientEvent::Rejected(ClientError::IdentityLocked)
    );

    alice
        .send(UserCommand::Send {
            body: "  hello bob ".into(),
            tag: Tag::Plain,
        })
        .await?;
    assert_eq!(
        alice.next_event().await?,
        ClientEvent::Echo(Envelope::new("alice", "hello bob", Tag::Plain))
    );

    let frame = timeout(WAIT, bob.next())
        .await?
        .context("bob socket closed")??;
    let text = match frame {
        Message::Text(text) => text,
        other => return Err(anyhow!("expected text frame, got {other:?}")),
    };
    assert_eq!(
        envelope::decode_structured(&text)?,
        Envelope::new("alice", "hello bob", Tag::Plain)
    );

    bob.send(Message::Text(
        r#"{"username":"bob","message":"[LLM] what did alice say?"}"#.into(),
    ))
    .await?;
    assert_eq!(
        alice.next_event().await?,
        ClientEvent::Message(Envelope::new(
            "bob",
            "what did alice say?",
            Tag::Annotated
        ))
    );

    alice
        .send(UserCommand::Send {
            body: "   ".into(),
            tag: Tag::Plain,
        })
        .await?;
    assert_eq!(
        alice.next_event().await?,
        ClientEvent::Rejected(ClientError::EmptyMessage)
    );

    alice.quit().await?;
    let _ = relay.shutdown.send(());
    let _ = timeout(WAIT, relay.server).await;
    Ok(())
}

#[tokio::test]
async fn manual_disconnect_does_not_retry() -> Result<()> {
    let relay = start_relay().await?;
    let mut alice = Client::spawn(client_config(relay.addr, ReconnectPolicy::default()));

    alice.send(UserCommand::Connect).await?;
    alice
        .wait_for("open state", |event| {
            *event == ClientEvent::State(ConnectionState::Open)
        })
        .await?;

    alice.send(UserCommand::Disconnect).await?;
    assert_eq!(
        alice.next_event().await?,
        ClientEvent::State(ConnectionState::Closing)
    );
    assert_eq!(
        alice.next_event().await?,
        ClientEvent::Notice(Notice::Disconnected { code: Some(1000) })
    );
    assert_eq!(
        alice.next_event().await?,
        ClientEvent::State(ConnectionState::Idle)
    );
    wait_for_connections(&relay.registry, 0).await?;

    // Editable again once idle.
    alice.send(UserCommand::SetIdentity("alicia".into())).await?;
    alice.send(UserCommand::Connect).await?;
    let connected = alice
        .wait_for("reconnect as new name", |event| {
            matches!(event, ClientEvent::Notice(Notice::Connected { .. }))
        })
        .await?;
    assert_eq!(
        connected,
        ClientEvent::Notice(Notice::Connected {
            identity: "alicia".into()
        })
    );

    alice.quit().await?;
    let _ = relay.shutdown.send(());
    let _ = timeout(WAIT, relay.server).await;
    Ok(())
}

#[tokio::test]
async fn retries_with_backoff_then_gives_up() -> Result<()> {
    let relay = start_relay().await?;
    let reconnect = ReconnectPolicy {
        max_attempts: 2,
        base_delay: Duration::from_millis(50),
    };
    let mut alice = Client::spawn(client_config(relay.addr, reconnect));

    alice.send(UserCommand::Connect).await?;
    alice
        .wait_for("open state", |event| {
            *event == ClientEvent::State(ConnectionState::Open)
        })
        .await?;

    let _ = relay.shutdown.send(());
    timeout(WAIT, relay.server)
        .await
        .context("relay did not shut down")???;

    let mut retries = Vec::new();
    let mut lost = 0;
    let mut saw_system_notice = false;
    loop {
        match alice.next_event().await? {
            ClientEvent::Message(envelope) => {
                assert_eq!(envelope.sender, "System");
                saw_system_notice = true;
            }
            ClientEvent::Notice(Notice::ConnectionLost) => lost += 1,
            ClientEvent::Notice(Notice::Reconnecting {
                attempt,
                max_attempts,
                delay,
            }) => {
                assert_eq!(max_attempts, 2);
                retries.push((attempt, delay));
            }
            ClientEvent::Notice(Notice::Failed(err)) => {
                assert_eq!(err, ClientError::RetryExhausted { attempts: 2 });
                break;
            }
            _ => {}
        }
    }

    assert!(saw_system_notice, "relay announced its shutdown");
    assert_eq!(lost, 3);
    assert_eq!(
        retries,
        vec![
            (1, Duration::from_millis(100)),
            (2, Duration::from_millis(200)),
        ]
    );
    assert_eq!(
        alice.next_event().await?,
        ClientEvent::State(ConnectionState::Exhausted)
    );

    // Sending is refused until a manual reconnect succeeds.
    alice
        .send(UserCommand::Send {
            body: "still there?".into(),
            tag: Tag::Plain,
        })
        .await?;
    assert_eq!(
        alice.next_event().await?,
        ClientEvent::Rejected(ClientError::NotConnected)
    );

    alice.quit().await
}
