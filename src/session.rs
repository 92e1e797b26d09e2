//! Stage-1 session channels.
//!
//! A session channel collects `pty-req`, `env` and `window-change` requests
//! until `shell` or `exec` arrives, then runs the command in the account's
//! sandbox with the channel's streams attached.

use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::directory::Directory;
use crate::error::GatewayError;
use crate::recorder::Recorder;
use crate::request::{should_record, ChannelRequest, PtyRequest, WindowSize};
use crate::sandbox::{BoxedWriter, ExecAttachOptions, Sandbox, SandboxManager};

/// Window events buffered towards the sandbox exec.
const WINDOW_QUEUE: usize = 4;

/// Streams of one session channel.
pub struct SessionIo {
    pub stdin: mpsc::Receiver<Vec<u8>>,
    pub stdout: BoxedWriter,
    pub stderr: BoxedWriter,
    /// Extra stderr handle for gateway-side notices.
    pub notice: BoxedWriter,
}

/// Everything a session needs besides its streams.
#[derive(Clone)]
pub struct SessionContext {
    pub account: String,
    pub sandbox: Sandbox,
    pub sandboxes: Arc<SandboxManager>,
    pub directory: Directory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The channel went away before `shell` or `exec`.
    NoCommand,
    /// The command could not be started; no exit status is sent.
    Aborted,
    Completed { exit_status: u32 },
}

#[derive(Default)]
struct Pending {
    pty: Option<PtyRequest>,
    env: Vec<String>,
    /// Latest size seen before the command; earlier ones are superseded.
    window: Option<WindowSize>,
}

/// Drive one session channel to completion.
pub async fn run(
    ctx: SessionContext,
    mut requests: mpsc::UnboundedReceiver<ChannelRequest>,
    mut io: SessionIo,
) -> SessionOutcome {
    let (window_tx, window_rx) = mpsc::channel::<WindowSize>(WINDOW_QUEUE);
    let mut pending = Pending::default();

    let command = loop {
        let Some(request) = requests.recv().await else {
            debug!("Session channel closed before a command");
            return SessionOutcome::NoCommand;
        };
        match request {
            ChannelRequest::Pty(pty) => {
                pending.window = Some(WindowSize {
                    cols: pty.cols,
                    rows: pty.rows,
                });
                pending.pty = Some(pty);
            }
            ChannelRequest::Env { name, value } => pending.env.push(format!("{}={}", name, value)),
            ChannelRequest::WindowChange { cols, rows, .. } => {
                pending.window = Some(WindowSize { cols, rows });
            }
            ChannelRequest::Shell => break String::new(),
            ChannelRequest::Exec { command } => break command,
            other => debug!("Ignoring {} before command", other.kind()),
        }
    };

    if let Some(window) = pending.window.take() {
        let _ = window_tx.send(window).await;
    }

    // Resizes keep flowing while the command runs.
    let forward = tokio::spawn(async move {
        while let Some(request) = requests.recv().await {
            match request {
                ChannelRequest::WindowChange { cols, rows, .. } => {
                    let _ = window_tx.send(WindowSize { cols, rows }).await;
                }
                other => debug!("Ignoring {} after command", other.kind()),
            }
        }
    });

    let outcome = execute(&ctx, command, pending, window_rx, &mut io).await;
    forward.abort();
    outcome
}

async fn execute(
    ctx: &SessionContext,
    command: String,
    pending: Pending,
    window_rx: mpsc::Receiver<WindowSize>,
    io: &mut SessionIo,
) -> SessionOutcome {
    let argv = match shell_words::split(&command) {
        Ok(argv) => argv,
        Err(e) => {
            warn!("Malformed command {:?}: {}", command, e);
            return SessionOutcome::Aborted;
        }
    };

    let recorded = should_record(&argv);
    let session_id = match ctx
        .directory
        .sessions
        .create_session(&ctx.account, &command, recorded)
        .await
    {
        Ok(id) => id,
        Err(e) => {
            warn!("Failed to create session record: {:#}", e);
            return SessionOutcome::Aborted;
        }
    };
    info!(session_id, recorded, command = %command, "Session started");

    let stdout = std::mem::replace(&mut io.stdout, Box::new(tokio::io::sink()));
    let stderr = std::mem::replace(&mut io.stderr, Box::new(tokio::io::sink()));
    let (_, stdin_placeholder) = mpsc::channel(1);
    let stdin = std::mem::replace(&mut io.stdin, stdin_placeholder);

    let tty = pending.pty.is_some();
    let mut opts = ExecAttachOptions::new(argv, stdout);
    opts.env = pending.env;
    opts.stdin = Some(stdin);
    opts.stderr = Some(stderr);
    opts.tty = tty;
    if let Some(pty) = pending.pty {
        opts.term = pty.term;
        opts.window = Some(window_rx);
    }

    let recorder = if recorded {
        Recorder::start(&mut opts, session_id, ctx.directory.replays.as_ref()).await
    } else {
        Recorder::disabled()
    };

    let result = ctx.sandboxes.exec_attach(&ctx.sandbox, opts).await;
    recorder.close().await;

    if let Err(e) = ctx.directory.sessions.finish_session(session_id).await {
        warn!(session_id, "Failed to finish session record: {:#}", e);
    }

    let exit_status = match result {
        Ok(Some(code)) => u32::try_from(code).unwrap_or(255),
        Ok(None) => 0,
        Err(e) => {
            let err = GatewayError::Execution(e);
            warn!(session_id, "{:#}", err);
            let notice = format!("bastion: {}\r\n", err.client_message());
            let _ = io.notice.write_all(notice.as_bytes()).await;
            let _ = io.notice.flush().await;
            1
        }
    };
    info!(session_id, exit_status, "Session finished");

    SessionOutcome::Completed { exit_status }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::config::GatewayConfig;
    use crate::directory::UserRecord;
    use crate::recorder::testing::MemoryReplays;
    use crate::replay::FrameKind;
    use crate::sandbox::testing::FakeRuntime;
    use crate::state::{DirectoryState, LocalDirectory};

    struct Harness {
        ctx: SessionContext,
        runtime: Arc<FakeRuntime>,
        local: Arc<LocalDirectory>,
        replays: MemoryReplays,
        dir: PathBuf,
    }

    async fn harness() -> Harness {
        let dir = std::env::temp_dir().join(format!("bastion-session-{}", uuid::Uuid::new_v4()));
        let runtime = Arc::new(FakeRuntime::default());
        let mut config = GatewayConfig::default();
        config.sandbox_dir = dir.clone();
        let sandboxes = Arc::new(SandboxManager::new(runtime.clone(), &config).unwrap());

        let mut state = DirectoryState::default();
        state.users.insert(
            "alice".to_string(),
            UserRecord {
                account: "alice".to_string(),
                blocked: false,
                viewed_at: 0,
            },
        );
        let local = Arc::new(LocalDirectory::in_memory(state));
        let replays = MemoryReplays::default();
        let directory = Directory::from_store(local.clone(), Arc::new(replays.clone()));

        let sandbox = sandboxes.find_or_create("alice").await.unwrap();
        Harness {
            ctx: SessionContext {
                account: "alice".to_string(),
                sandbox,
                sandboxes,
                directory,
            },
            runtime,
            local,
            replays,
            dir,
        }
    }

    struct Client {
        requests: mpsc::UnboundedSender<ChannelRequest>,
        stdin: mpsc::Sender<Vec<u8>>,
        stdout: tokio::io::DuplexStream,
        stderr: tokio::io::DuplexStream,
    }

    fn channel() -> (Client, mpsc::UnboundedReceiver<ChannelRequest>, SessionIo) {
        let (requests, requests_rx) = mpsc::unbounded_channel();
        let (stdin, stdin_rx) = mpsc::channel(32);
        let (stdout_w, stdout) = tokio::io::duplex(1024);
        let (stderr_w, stderr) = tokio::io::duplex(1024);
        let io = SessionIo {
            stdin: stdin_rx,
            stdout: Box::new(stdout_w),
            stderr: Box::new(stderr_w),
            notice: Box::new(tokio::io::sink()),
        };
        (
            Client {
                requests,
                stdin,
                stdout,
                stderr,
            },
            requests_rx,
            io,
        )
    }

    async fn read_all(mut stream: tokio::io::DuplexStream) -> Vec<u8> {
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn test_exec_runs_in_sandbox() {
        let h = harness().await;
        let (client, requests, io) = channel();

        client
            .requests
            .send(ChannelRequest::Env {
                name: "LANG".to_string(),
                value: "C.UTF-8".to_string(),
            })
            .unwrap();
        client
            .requests
            .send(ChannelRequest::Exec {
                command: "cat 'my file'".to_string(),
            })
            .unwrap();
        client.stdin.send(b"input".to_vec()).await.unwrap();
        drop(client.stdin);
        *h.runtime.exit_code.lock().unwrap() = Some(3);

        let outcome = run(h.ctx.clone(), requests, io).await;
        assert_eq!(outcome, SessionOutcome::Completed { exit_status: 3 });
        drop(client.requests);

        assert_eq!(read_all(client.stdout).await, b"out:input");
        assert_eq!(read_all(client.stderr).await, b"err");

        let exec = h.runtime.execs.lock().unwrap()[0].clone();
        assert_eq!(exec.name, "sandbox-alice");
        assert_eq!(exec.cmd, vec!["cat", "my file"]);
        assert_eq!(exec.env, vec!["LANG=C.UTF-8"]);
        assert!(!exec.tty);

        let record = h.local.get_session(1).await.unwrap();
        assert_eq!(record.command, "cat 'my file'");
        assert!(record.recorded);
        assert!(record.finished_at > 0);

        let frames = h.replays.frames.lock().unwrap().clone();
        assert!(frames.iter().any(|f| f.kind == FrameKind::Stdout));
        assert!(frames.iter().any(|f| f.kind == FrameKind::Stderr));
        assert_eq!(*h.replays.closed.lock().unwrap(), vec![1]);

        let _ = std::fs::remove_dir_all(h.dir);
    }

    #[tokio::test]
    async fn test_shell_with_pty() {
        let h = harness().await;
        let (client, requests, io) = channel();

        client
            .requests
            .send(ChannelRequest::Pty(PtyRequest {
                term: "xterm-256color".to_string(),
                cols: 80,
                rows: 24,
                pix_width: 0,
                pix_height: 0,
                modes: Vec::new(),
            }))
            .unwrap();
        client
            .requests
            .send(ChannelRequest::WindowChange {
                cols: 120,
                rows: 40,
                pix_width: 0,
                pix_height: 0,
            })
            .unwrap();
        client.requests.send(ChannelRequest::Shell).unwrap();
        drop(client.stdin);

        let outcome = run(h.ctx.clone(), requests, io).await;
        assert_eq!(outcome, SessionOutcome::Completed { exit_status: 0 });

        let exec = h.runtime.execs.lock().unwrap()[0].clone();
        assert!(exec.cmd.is_empty());
        assert!(exec.tty);
        assert_eq!(exec.term, "xterm-256color");
        assert_eq!(exec.windows, vec![WindowSize { cols: 120, rows: 40 }]);

        let frames = h.replays.frames.lock().unwrap().clone();
        assert!(frames.iter().any(|f| f.kind == FrameKind::WindowSize));

        let _ = std::fs::remove_dir_all(h.dir);
    }

    #[tokio::test]
    async fn test_resizes_before_command_keep_latest() {
        let h = harness().await;
        let (client, requests, io) = channel();

        client
            .requests
            .send(ChannelRequest::Pty(PtyRequest {
                term: "xterm".to_string(),
                cols: 80,
                rows: 24,
                pix_width: 0,
                pix_height: 0,
                modes: Vec::new(),
            }))
            .unwrap();
        for cols in [90, 100, 110, 120, 130, 140] {
            client
                .requests
                .send(ChannelRequest::WindowChange {
                    cols,
                    rows: 40,
                    pix_width: 0,
                    pix_height: 0,
                })
                .unwrap();
        }
        client.requests.send(ChannelRequest::Shell).unwrap();
        drop(client.stdin);

        run(h.ctx.clone(), requests, io).await;

        let exec = h.runtime.execs.lock().unwrap()[0].clone();
        assert_eq!(exec.windows.last(), Some(&WindowSize { cols: 140, rows: 40 }));
        assert!(!exec.windows.contains(&WindowSize { cols: 80, rows: 24 }));

        let frames = h.replays.frames.lock().unwrap().clone();
        let sizes: Vec<_> = frames
            .iter()
            .filter(|f| f.kind == FrameKind::WindowSize)
            .filter_map(|f| crate::replay::decode_window_size(&f.payload))
            .collect();
        assert_eq!(sizes, vec![(140, 40)]);

        let _ = std::fs::remove_dir_all(h.dir);
    }

    #[tokio::test]
    async fn test_scp_not_recorded() {
        let h = harness().await;
        let (client, requests, io) = channel();
        client
            .requests
            .send(ChannelRequest::Exec {
                command: "scp -t /root".to_string(),
            })
            .unwrap();
        drop(client.stdin);

        run(h.ctx.clone(), requests, io).await;

        let record = h.local.get_session(1).await.unwrap();
        assert!(!record.recorded);
        assert!(h.replays.opened.lock().unwrap().is_empty());

        let _ = std::fs::remove_dir_all(h.dir);
    }

    #[tokio::test]
    async fn test_no_command_creates_no_session() {
        let h = harness().await;
        let (client, requests, io) = channel();
        client
            .requests
            .send(ChannelRequest::Env {
                name: "A".to_string(),
                value: "B".to_string(),
            })
            .unwrap();
        drop(client.requests);

        let outcome = run(h.ctx.clone(), requests, io).await;
        assert_eq!(outcome, SessionOutcome::NoCommand);
        assert!(h.local.get_session(1).await.is_none());
        assert!(h.runtime.execs.lock().unwrap().is_empty());

        let _ = std::fs::remove_dir_all(h.dir);
    }

    #[tokio::test]
    async fn test_malformed_command_aborts() {
        let h = harness().await;
        let (client, requests, io) = channel();
        client
            .requests
            .send(ChannelRequest::Exec {
                command: "echo 'unterminated".to_string(),
            })
            .unwrap();

        let outcome = run(h.ctx.clone(), requests, io).await;
        assert_eq!(outcome, SessionOutcome::Aborted);
        assert!(h.local.get_session(1).await.is_none());

        let _ = std::fs::remove_dir_all(h.dir);
    }

    #[tokio::test]
    async fn test_exec_failure_exits_one() {
        let h = harness().await;
        *h.runtime.fail_exec.lock().unwrap() = true;
        let (client, requests, io) = channel();
        client
            .requests
            .send(ChannelRequest::Exec {
                command: "true".to_string(),
            })
            .unwrap();
        drop(client.stdin);

        let outcome = run(h.ctx.clone(), requests, io).await;
        assert_eq!(outcome, SessionOutcome::Completed { exit_status: 1 });
        // still closed out in the audit trail
        assert!(h.local.get_session(1).await.unwrap().finished_at > 0);

        let _ = std::fs::remove_dir_all(h.dir);
    }
}
