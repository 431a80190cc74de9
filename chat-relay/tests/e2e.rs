use std::{path::Path, process::Stdio, time::Duration};

use anyhow::{Context, Result, anyhow};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    process::{Child, ChildStdin, ChildStdout, Command},
    time::timeout,
};

const READ_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn cli_chat_end_to_end() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("chat-relay");

    let mut relay = Proc::spawn(&binary, &["relay", "--listen", "127.0.0.1:0"], "info")?;
    let banner = relay.next_line().await.context("relay banner")?;
    let addr = banner
        .split_whitespace()
        .last()
        .filter(|addr| addr.contains(':'))
        .ok_or_else(|| anyhow!("relay banner missing socket: {banner}"))?;
    let server = format!("ws://{addr}/");

    // Keep reading relay logs so its pipe never fills; aborting kills it.
    let relay_logs = tokio::spawn(async move {
        while let Ok(Some(_)) = relay.stdout.next_line().await {}
    });

    let mut alice = Proc::client(&binary, "alice", &server).await?;
    let mut bob = Proc::client(&binary, "bob", &server).await?;

    // Bob speaks first: the relay only reads his frames once he is registered.
    bob.send_line("Hi Alice!").await?;
    alice.expect_line("<bob> Hi Alice!").await?;
    bob.expect_line("<bob> Hi Alice!").await?;

    alice.send_line("Hello from Alice").await?;
    alice.expect_line("<alice> Hello from Alice").await?;
    bob.expect_line("<alice> Hello from Alice").await?;

    // Prompts keep their marker on both ends.
    alice.send_line("/prompt summarize the chat").await?;
    alice
        .expect_line("<alice> [LLM] summarize the chat")
        .await?;
    bob.expect_line("<alice> [LLM] summarize the chat").await?;

    bob.send_line("/quit").await?;
    bob.expect_line("*** leaving chat").await?;
    alice.send_line("/quit").await?;
    alice.expect_line("*** leaving chat").await?;

    alice.wait_success().await.context("alice client")?;
    bob.wait_success().await.context("bob client")?;

    relay_logs.abort();
    let _ = relay_logs.await;
    Ok(())
}

/// A spawned `chat-relay` process with line-oriented stdio.
struct Proc {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Lines<BufReader<ChildStdout>>,
}

impl Proc {
    fn spawn(binary: &Path, args: &[&str], log_level: &str) -> Result<Self> {
        let mut child = Command::new(binary)
            .args(args)
            .env("RUST_LOG", log_level)
            .env("NO_COLOR", "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn chat-relay {args:?}"))?;
        let stdout = child.stdout.take().context("stdout not piped")?;
        Ok(Self {
            stdin: child.stdin.take(),
            stdout: BufReader::new(stdout).lines(),
            child,
        })
    }

    async fn client(binary: &Path, name: &str, server: &str) -> Result<Self> {
        let mut client = Self::spawn(
            binary,
            &["client", "--name", name, "--server", server],
            "warn",
        )?;
        client
            .expect_line(&format!("*** connecting to {server}"))
            .await?;
        client
            .expect_line(&format!("*** connected as {name}"))
            .await?;
        Ok(client)
    }

    async fn send_line(&mut self, line: &str) -> Result<()> {
        let stdin = self.stdin.as_mut().context("stdin already closed")?;
        stdin.write_all(format!("{line}\n").as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn next_line(&mut self) -> Result<String> {
        timeout(READ_TIMEOUT, self.stdout.next_line())
            .await
            .context("timed out waiting for output")??
            .ok_or_else(|| anyhow!("output closed"))
    }

    async fn expect_line(&mut self, expected: &str) -> Result<()> {
        let line = self.next_line().await?;
        if line != expected {
            return Err(anyhow!("expected '{expected}', got '{line}'"));
        }
        Ok(())
    }

    async fn wait_success(mut self) -> Result<()> {
        let status = timeout(READ_TIMEOUT, self.child.wait())
            .await
            .context("process did not exit")??;
        if !status.success() {
            return Err(anyhow!("exited with status {status}"));
        }
        Ok(())
    }
}
