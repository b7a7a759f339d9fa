//! `NodeShell` over the russh binding, against an in-process SSH server

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use russh::keys::{decode_secret_key, ssh_key};
use russh::server::{self, Auth, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec};
use secrecy::SecretString;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use nodeshell_exec::*;

const HOST_KEY: &str = include_str!("fixtures/host_ed25519");
const CLIENT_KEY: &str = include_str!("fixtures/id_ed25519");
/// Unlocks with the passphrase `pw`
const ENCRYPTED_CLIENT_KEY: &str = include_str!("fixtures/id_ed25519_encrypted");

/// Server side of one connection; commands are interpreted, not run
///
/// - `echo X` prints `X`, `warn X` prints `X` on stderr, `exit N` exits `N`
/// - `refuse` fails the exec request
/// - `drop connection` prints a line and then kills the connection
/// - `kill -9 $$` ends without an exit status
/// - user `nobody` is never authenticated
struct FakeNode;

impl server::Handler for FakeNode {
    type Error = russh::Error;

    async fn auth_publickey(
        &mut self,
        user: &str,
        _public_key: &ssh_key::PublicKey,
    ) -> Result<Auth, Self::Error> {
        if user == "nobody" {
            Ok(Auth::reject())
        } else {
            Ok(Auth::Accept)
        }
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let command = String::from_utf8_lossy(data).into_owned();
        if command == "refuse" {
            session.channel_failure(channel)?;
            return Ok(());
        }
        session.channel_success(channel)?;

        if command == "drop connection" {
            session.data(channel, CryptoVec::from("partial\n"))?;
            return Err(russh::Error::Disconnect);
        }
        if let Some(text) = command.strip_prefix("echo ") {
            session.data(channel, CryptoVec::from(format!("{text}\n")))?;
        }
        if let Some(text) = command.strip_prefix("warn ") {
            session.extended_data(channel, 1, CryptoVec::from(format!("{text}\n")))?;
        }
        if command != "kill -9 $$" {
            let code = command
                .strip_prefix("exit ")
                .and_then(|code| code.parse().ok())
                .unwrap_or(0);
            session.exit_status_request(channel, code)?;
        }
        session.eof(channel)?;
        session.close(channel)?;
        Ok(())
    }
}

async fn start_node() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let config = Arc::new(server::Config {
        keys: vec![decode_secret_key(HOST_KEY, None).unwrap()],
        auth_rejection_time: Duration::from_millis(10),
        auth_rejection_time_initial: Some(Duration::ZERO),
        ..Default::default()
    });

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let config = config.clone();
            tokio::spawn(async move {
                if let Ok(session) = server::run_stream(config, stream, FakeNode).await {
                    let _ = session.await;
                }
            });
        }
    });
    addr
}

#[derive(Default)]
struct RecordingSink {
    lines: Mutex<Vec<String>>,
}

impl LogSink for RecordingSink {
    fn log_line(&self, _host: &str, line: &str) {
        self.lines.lock().unwrap().push(line.to_string());
    }
}

struct SlowPrompt {
    delay: Duration,
    asked: Arc<AtomicUsize>,
}

impl PassphrasePrompt for SlowPrompt {
    fn ask_passphrase(&self, _prompt: &str) -> Option<SecretString> {
        self.asked.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        Some(SecretString::new("pw".to_string()))
    }

    fn show_message(&self, _text: &str) {}
}

fn client_identity() -> Arc<Identity> {
    Arc::new(Identity::from_pem("id_test", CLIENT_KEY.to_string()))
}

fn shell(sink: Arc<RecordingSink>) -> NodeShell {
    let config = ShellConfig {
        connect_timeout_secs: 5,
        ..ShellConfig::default()
    };
    NodeShellBuilder::from_identity(client_identity())
        .with_sink(sink)
        .with_config(config)
        .build()
        .unwrap()
}

fn params(addr: SocketAddr, user: &str) -> ConnectionParameters {
    ConnectionParameters::new(NodeId(1), "127.0.0.1", user).with_port(addr.port())
}

async fn run(shell: &NodeShell, addr: SocketAddr, command: &str) -> ExecutionResult {
    let (tx, mut rx) = mpsc::unbounded_channel::<ExecutionResult>();
    let handle = shell.exec(&params(addr, "u"), command, tx).await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("no completion within 10s")
        .expect("completion queue closed");
    handle.join().await;
    assert!(rx.recv().await.is_none());
    result
}

#[tokio::test]
async fn test_echo_over_ssh() {
    let addr = start_node().await;
    let sink = Arc::new(RecordingSink::default());
    let shell = shell(sink.clone());

    let result = run(&shell, addr, "echo ok").await;

    assert_eq!(result.error, None);
    assert_eq!(result.exit_status, 0);
    assert_eq!(*sink.lines.lock().unwrap(), vec!["ok".to_string()]);
}

#[tokio::test]
async fn test_exit_status_over_ssh() {
    let addr = start_node().await;
    let shell = shell(Arc::default());

    let result = run(&shell, addr, "exit 7").await;

    assert_eq!(result.error, None);
    assert_eq!(result.exit_status, 7);
}

#[tokio::test]
async fn test_stderr_is_not_relayed() {
    let addr = start_node().await;
    let sink = Arc::new(RecordingSink::default());
    let shell = shell(sink.clone());

    let result = run(&shell, addr, "warn careful").await;

    assert!(result.success());
    assert!(sink.lines.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_missing_exit_status_over_ssh() {
    let addr = start_node().await;
    let shell = shell(Arc::default());

    let result = run(&shell, addr, "kill -9 $$").await;

    assert_eq!(result.error, None);
    assert_eq!(result.exit_status, -1);
}

#[tokio::test]
async fn test_refused_exec_reported_through_listener() {
    let addr = start_node().await;
    let shell = shell(Arc::default());

    let result = run(&shell, addr, "refuse").await;

    assert!(matches!(result.error, Some(ExecError::Transport(_))));
    assert_eq!(result.exit_status, -1);
}

#[tokio::test]
async fn test_dropped_connection_is_a_transport_error() {
    let addr = start_node().await;
    let shell = shell(Arc::default());

    let result = run(&shell, addr, "drop connection").await;

    assert!(
        matches!(result.error, Some(ExecError::Transport(_))),
        "got {result:?}"
    );
    assert_eq!(result.exit_status, -1);
}

#[tokio::test]
async fn test_rejected_user_fails_synchronously() {
    let addr = start_node().await;
    let shell = shell(Arc::default());
    let (tx, mut rx) = mpsc::unbounded_channel::<ExecutionResult>();

    let err = shell
        .exec(&params(addr, "nobody"), "echo ok", tx)
        .await
        .unwrap_err();

    assert_eq!(err, ExecError::AuthenticationFailed("127.0.0.1".to_string()));
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn test_slow_passphrase_entry_over_ssh() {
    let addr = start_node().await;
    let asked = Arc::new(AtomicUsize::new(0));
    let config = ShellConfig {
        connect_timeout_secs: 1,
        ..ShellConfig::default()
    };
    let shell = NodeShellBuilder::from_identity(Arc::new(Identity::from_pem(
        "id_encrypted",
        ENCRYPTED_CLIENT_KEY.to_string(),
    )))
    .with_prompt(SlowPrompt {
        delay: Duration::from_secs(2),
        asked: asked.clone(),
    })
    .with_config(config)
    .build()
    .unwrap();

    let result = run(&shell, addr, "exit 0").await;

    assert!(result.success(), "got {result:?}");
    assert_eq!(asked.load(Ordering::SeqCst), 1);
}
