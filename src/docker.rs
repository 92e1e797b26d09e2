//! Docker-backed sandbox runtime.
//!
//! Handles:
//! - Inspecting, creating and starting sandbox containers
//! - Running setup scripts inside a sandbox
//! - Attaching interactive execs, with TTY resize and termination

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::exec::{CreateExecOptions, ResizeExecOptions, StartExecOptions, StartExecResults};
use bollard::models::{ContainerCreateBody, HostConfig, RestartPolicy, RestartPolicyNameEnum};
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, InspectContainerOptions, StartContainerOptions,
};
use bollard::Docker;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::sandbox::{
    ExecAttachOptions, SandboxRuntime, SandboxSpec, SandboxStatus, ScriptOutput, DEFAULT_SHELL,
};

/// Time the exec gets to exit on its own once its output has ended.
const EXIT_GRACE: Duration = Duration::from_secs(1);
/// Time between SIGTERM and SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(10);

/// Sandbox runtime talking to the local Docker daemon.
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub async fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .context("Failed to connect to Docker daemon")?;

        // Verify connection
        docker
            .ping()
            .await
            .context("Failed to ping Docker daemon")?;

        info!("Connected to Docker daemon");

        Ok(Self { docker })
    }

    async fn create_exec(
        &self,
        name: &str,
        cmd: Vec<String>,
        tty: bool,
        env: Option<Vec<String>>,
    ) -> Result<String> {
        let options = CreateExecOptions {
            cmd: Some(cmd),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(tty),
            env,
            ..Default::default()
        };

        let response = self
            .docker
            .create_exec(name, options)
            .await
            .with_context(|| format!("Failed to create exec in {}", name))?;

        Ok(response.id)
    }

    async fn start_exec(&self, exec_id: &str, tty: bool) -> Result<StartExecResults> {
        let options = StartExecOptions {
            detach: false,
            tty,
            output_capacity: None,
        };

        self.docker
            .start_exec(exec_id, Some(options))
            .await
            .context("Failed to start exec")
    }

    /// Give a finished exec a moment to exit, then terminate whatever is
    /// left of it. Returns the exit code if the exec has exited.
    async fn reap(&self, exec_id: &str) -> Option<i64> {
        tokio::time::sleep(EXIT_GRACE).await;

        let info = match self.docker.inspect_exec(exec_id).await {
            Ok(info) => info,
            Err(e) => {
                warn!("Failed to inspect exec {}: {}", exec_id, e);
                return None;
            }
        };

        let pid = info.pid.unwrap_or(0);
        if !info.running.unwrap_or(false) || pid == 0 {
            return info.exit_code;
        }

        debug!(exec_id, pid, "Exec still running, sending SIGTERM");
        terminate(pid, false);

        let docker = self.docker.clone();
        let id = exec_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(KILL_GRACE).await;
            match docker.inspect_exec(&id).await {
                Ok(info) if info.running.unwrap_or(false) => {
                    warn!(exec_id = %id, pid, "Exec ignored SIGTERM, sending SIGKILL");
                    terminate(pid, true);
                }
                Ok(_) => {}
                Err(e) => warn!("Failed to inspect exec {}: {}", id, e),
            }
        });

        // `inspect_exec` may briefly report Running=true after the signal
        for _ in 0..40 {
            tokio::time::sleep(Duration::from_millis(25)).await;
            match self.docker.inspect_exec(exec_id).await {
                Ok(info) if !info.running.unwrap_or(false) => return info.exit_code,
                Ok(_) => continue,
                Err(_) => break,
            }
        }
        None
    }
}

#[cfg(unix)]
fn terminate(pid: i64, kill: bool) {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    let sig = if kill { Signal::SIGKILL } else { Signal::SIGTERM };
    if let Err(e) = signal::kill(Pid::from_raw(raw), sig) {
        debug!(pid, "Failed to send {}: {}", sig, e);
    }
}

#[cfg(not(unix))]
fn terminate(pid: i64, _kill: bool) {
    warn!(pid, "Cannot signal exec processes on this platform");
}

#[async_trait]
impl SandboxRuntime for DockerRuntime {
    async fn inspect(&self, name: &str) -> Result<Option<SandboxStatus>> {
        let info = match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => info,
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => return Ok(None),
            Err(e) => return Err(e).context("Failed to inspect container"),
        };

        let running = info
            .state
            .as_ref()
            .and_then(|s| s.running)
            .unwrap_or(false);
        let paused = info
            .state
            .as_ref()
            .and_then(|s| s.paused)
            .unwrap_or(false);

        // a paused container also reports running, but exec is unusable
        let status = if paused {
            SandboxStatus::Paused
        } else if running {
            SandboxStatus::Running
        } else {
            SandboxStatus::Stopped
        };
        Ok(Some(status))
    }

    async fn create(&self, spec: &SandboxSpec) -> Result<()> {
        let host_config = HostConfig {
            binds: Some(spec.binds.clone()),
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::ALWAYS),
                maximum_retry_count: None,
            }),
            memory: spec.memory,
            nano_cpus: spec.nano_cpus,
            ..Default::default()
        };

        let config = ContainerCreateBody {
            image: Some(spec.image.clone()),
            hostname: Some(spec.hostname.clone()),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptionsBuilder::new().name(&spec.name).build();

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .with_context(|| format!("Failed to create container {}", spec.name))?;

        info!(
            "Created container {} ({})",
            spec.name,
            response.id.get(..12).unwrap_or(&response.id)
        );
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<()> {
        match self
            .docker
            .start_container(name, None::<StartContainerOptions>)
            .await
        {
            Ok(()) => {}
            // already running
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {}
            Err(e) => return Err(e).with_context(|| format!("Failed to start container {}", name)),
        }
        info!("Started container {}", name);
        Ok(())
    }

    async fn unpause(&self, name: &str) -> Result<()> {
        self.docker
            .unpause_container(name)
            .await
            .with_context(|| format!("Failed to unpause container {}", name))
    }

    async fn exec_script(&self, name: &str, script: &str) -> Result<ScriptOutput> {
        let exec_id = self
            .create_exec(name, vec![DEFAULT_SHELL.to_string()], false, None)
            .await?;

        let StartExecResults::Attached { mut output, mut input } =
            self.start_exec(&exec_id, false).await?
        else {
            return Ok(ScriptOutput::default());
        };

        input
            .write_all(script.as_bytes())
            .await
            .context("Failed to write script to exec")?;
        // close stdin so bash runs the script and exits
        let _ = input.shutdown().await;

        let mut result = ScriptOutput::default();
        while let Some(chunk) = output.next().await {
            match chunk.context("Script output error")? {
                LogOutput::StdErr { message } => {
                    result.stderr.push_str(&String::from_utf8_lossy(&message))
                }
                LogOutput::StdOut { message }
                | LogOutput::StdIn { message }
                | LogOutput::Console { message } => {
                    result.stdout.push_str(&String::from_utf8_lossy(&message))
                }
            }
        }

        if !result.stderr.is_empty() {
            debug!(container = name, "Script stderr: {}", result.stderr.trim_end());
        }
        Ok(result)
    }

    async fn exec_attach(&self, name: &str, opts: ExecAttachOptions) -> Result<Option<i64>> {
        let ExecAttachOptions {
            mut env,
            mut cmd,
            stdin,
            mut stdout,
            mut stderr,
            tty,
            term,
            window,
        } = opts;

        if tty && !term.is_empty() {
            env.push(format!("TERM={}", term));
        }
        if cmd.is_empty() {
            cmd.push(DEFAULT_SHELL.to_string());
        }

        let exec_id = self.create_exec(name, cmd, tty, Some(env)).await?;
        let results = self.start_exec(&exec_id, tty).await?;
        let StartExecResults::Attached { mut output, mut input } = results else {
            warn!("Exec started in detached mode unexpectedly");
            return Ok(None);
        };

        let resize_task = match window {
            Some(mut window) if tty => {
                let docker = self.docker.clone();
                let id = exec_id.clone();
                Some(tokio::spawn(async move {
                    while let Some(size) = window.recv().await {
                        let options = ResizeExecOptions {
                            width: u16::try_from(size.cols).unwrap_or(u16::MAX),
                            height: u16::try_from(size.rows).unwrap_or(u16::MAX),
                        };
                        if let Err(e) = docker.resize_exec(&id, options).await {
                            warn!("Failed to resize exec {}: {}", id, e);
                        }
                    }
                }))
            }
            _ => None,
        };

        // Keep forwarding output even if the client closes stdin early.
        let stdin_task = tokio::spawn(async move {
            if let Some(mut stdin) = stdin {
                while let Some(data) = stdin.recv().await {
                    if input.write_all(&data).await.is_err() {
                        return;
                    }
                }
            }
            let _ = input.shutdown().await;
        });

        let mut result = Ok(());
        while let Some(chunk) = output.next().await {
            let written = match chunk {
                Ok(LogOutput::StdErr { message }) if !tty => match stderr.as_mut() {
                    Some(stderr) => stderr.write_all(&message).await,
                    None => stdout.write_all(&message).await,
                },
                Ok(LogOutput::StdErr { message })
                | Ok(LogOutput::StdOut { message })
                | Ok(LogOutput::StdIn { message })
                | Ok(LogOutput::Console { message }) => stdout.write_all(&message).await,
                Err(e) => {
                    result = Err(anyhow::Error::new(e).context("Exec output error"));
                    break;
                }
            };
            if let Err(e) = written {
                debug!("Client stream closed: {}", e);
                break;
            }
        }
        let _ = stdout.flush().await;
        if let Some(stderr) = stderr.as_mut() {
            let _ = stderr.flush().await;
        }

        stdin_task.abort();
        let exit_code = self.reap(&exec_id).await;
        if let Some(task) = resize_task {
            task.abort();
        }

        result.map(|()| exit_code)
    }
}
