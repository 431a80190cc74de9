//! Terminal front-end for the relay client.
//!
//! Lines typed on stdin become [`UserCommand`]s for the [`driver`]; the
//! driver's [`ClientEvent`]s are rendered back to stdout and stderr.

pub mod driver;
pub mod gate;
pub mod session;

use std::io::BufRead;

use anyhow::{Context, Result, anyhow, bail};
use tokio::{
    io::{self, AsyncWriteExt},
    select,
    sync::mpsc,
};
use tracing::{debug, warn};

use crate::{
    cli::ClientArgs,
    config::ClientConfig,
    envelope::{Envelope, Tag},
};

pub use driver::{ClientEvent, UserCommand};
pub use gate::PresenceGate;
pub use session::{ConnectionState, Notice, Session};

/// What a line of terminal input asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Command(UserCommand),
    Help,
    Nothing,
}

impl Input {
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(Self::Nothing);
        }
        let Some(command) = line.strip_prefix('/') else {
            return Ok(Self::Command(UserCommand::Send {
                body: line.to_string(),
                tag: Tag::Plain,
            }));
        };

        let (name, rest) = match command.split_once(char::is_whitespace) {
            Some((name, rest)) => (name, rest.trim()),
            None => (command, ""),
        };
        let command = match name.to_ascii_lowercase().as_str() {
            "name" => UserCommand::SetIdentity(rest.to_string()),
            "server" => UserCommand::SetTarget(rest.to_string()),
            "connect" => UserCommand::Connect,
            "disconnect" => UserCommand::Disconnect,
            "prompt" => {
                if rest.is_empty() {
                    bail!("usage: /prompt <text>");
                }
                UserCommand::Send {
                    body: rest.to_string(),
                    tag: Tag::Annotated,
                }
            }
            "quit" => UserCommand::Quit,
            "help" => return Ok(Self::Help),
            other => return Err(anyhow!("unknown command: /{other}")),
        };
        Ok(Self::Command(command))
    }
}

const HELP: &str = "\
*** /name <name>      set your display name
*** /server <url>     set the relay address, e.g. ws://127.0.0.1:8080
*** /connect          connect once name and server are set
*** /disconnect       leave the relay
*** /prompt <text>    send a message tagged for the assistant
*** /quit             exit";

pub async fn run(args: ClientArgs) -> Result<()> {
    let config = ClientConfig::from(args);
    let auto_connect = PresenceGate::new(&config.identity, &config.target).is_ready();

    let (command_tx, command_rx) = mpsc::channel(32);
    let (event_tx, mut event_rx) = mpsc::channel(128);
    let mut driver = tokio::spawn(driver::run(config, command_rx, event_tx));
    let mut lines = spawn_stdin_reader();

    if auto_connect {
        command_tx
            .send(UserCommand::Connect)
            .await
            .context("client driver stopped")?;
    } else {
        write_stdout("*** set /name and /server, then /connect (or /help)").await?;
    }

    let mut driver_finished = false;
    loop {
        select! {
            event = event_rx.recv() => match event {
                Some(event) => render_event(event).await?,
                None => {
                    driver_finished = true;
                    break;
                }
            },
            line = lines.recv() => {
                if !handle_stdin_input(line, &command_tx).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }

    if !driver_finished && command_tx.send(UserCommand::Quit).await.is_err() {
        debug!("client driver already stopped");
    }
    drop(command_tx);
    // Keep draining so the driver never blocks on a full event channel.
    loop {
        select! {
            result = &mut driver => return result.context("client driver panicked")?,
            event = event_rx.recv(), if !driver_finished => match event {
                Some(event) => render_event(event).await?,
                None => driver_finished = true,
            },
        }
    }
}

/// Blocking stdin reads cannot be cancelled, so they live on their own
/// thread instead of the runtime's blocking pool.
fn spawn_stdin_reader() -> mpsc::Receiver<io::Result<String>> {
    let (tx, rx) = mpsc::channel(16);
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
    });
    rx
}

async fn handle_stdin_input(
    line: Option<io::Result<String>>,
    commands: &mpsc::Sender<UserCommand>,
) -> Result<bool> {
    let Some(line) = line else {
        return Ok(false);
    };

    match Input::parse(&line?) {
        Ok(Input::Nothing) => Ok(true),
        Ok(Input::Help) => {
            write_stdout(HELP).await?;
            Ok(true)
        }
        Ok(Input::Command(UserCommand::Quit)) => {
            write_stdout("*** leaving chat").await?;
            Ok(false)
        }
        Ok(Input::Command(command)) => {
            commands
                .send(command)
                .await
                .context("client driver stopped")?;
            Ok(true)
        }
        Err(err) => {
            write_stderr(&format!("!!! {err}")).await?;
            Ok(true)
        }
    }
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn render_event(event: ClientEvent) -> io::Result<()> {
    match event {
        ClientEvent::Notice(notice) => render_notice(notice).await,
        ClientEvent::Message(envelope) | ClientEvent::Echo(envelope) => {
            write_stdout(&format_envelope(&envelope)).await
        }
        ClientEvent::Rejected(err) => write_stderr(&format!("!!! {err}")).await,
        ClientEvent::State(state) => {
            debug!(?state, "connection state changed");
            Ok(())
        }
    }
}

async fn render_notice(notice: Notice) -> io::Result<()> {
    match notice {
        Notice::Connecting { target } => write_stdout(&format!("*** connecting to {target}")).await,
        Notice::Connected { identity } => {
            write_stdout(&format!("*** connected as {identity}")).await
        }
        Notice::Disconnected { code } => {
            let line = match code {
                Some(code) => format!("*** disconnected (code {code})"),
                None => "*** disconnected".to_string(),
            };
            write_stdout(&line).await
        }
        Notice::ConnectionLost => write_stdout("*** connection lost").await,
        Notice::Reconnecting {
            attempt,
            max_attempts,
            delay,
        } => {
            write_stdout(&format!(
                "*** reconnecting in {:.1}s (attempt {attempt}/{max_attempts})",
                delay.as_secs_f64()
            ))
            .await
        }
        Notice::Failed(err) => write_stderr(&format!("!!! {err}")).await,
    }
}

fn format_envelope(envelope: &Envelope) -> String {
    format!("<{}> {}", envelope.sender, envelope.tagged_body())
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}
