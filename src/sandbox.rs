//! Per-account sandboxes.
//!
//! Every account gets one long-lived container named `sandbox-<account>`
//! with a persistent `/root` and a `/shared` directory bind-mounted from the
//! host. Interactive sessions run as execs inside it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncWrite;
use tokio::sync::{mpsc, Mutex};
use tracing::info;

use crate::config::GatewayConfig;
use crate::request::WindowSize;

pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Command run when an exec carries no argv.
pub const DEFAULT_SHELL: &str = "/bin/bash";

const SCRIPT_GENERATE_SSH_KEY: &str = r#"#!/bin/bash
echo "Notes:
1. Sandboxes are isolated from each other, root is yours to use.
2. id_rsa.pub is synced to the bastion and .ssh/config is regenerated on every login.
3. Only /root is persistent, files elsewhere may be lost.
4. /shared is shared with every other user.
5. Use tmux or a similar tool to keep long-running sessions.
" > /root/README

cp -f /etc/skel/.bashrc /etc/skel/.profile /root/

mkdir -p /root/.ssh
chmod 700 /root/.ssh
cd /root/.ssh

ssh-keygen -f /root/.ssh/id_rsa -t rsa -N ''

echo "id_rsa and id_rsa.pub are managed by the bastion, do not modify them" > README
"#;

const SCRIPT_READ_PUBLIC_KEY: &str = "cat /root/.ssh/id_rsa.pub";

/// Options for attaching to a command inside a sandbox.
pub struct ExecAttachOptions {
    /// `NAME=VALUE` pairs.
    pub env: Vec<String>,
    /// Empty means [`DEFAULT_SHELL`].
    pub cmd: Vec<String>,
    pub stdin: Option<mpsc::Receiver<Vec<u8>>>,
    pub stdout: BoxedWriter,
    /// Ignored when a TTY is allocated.
    pub stderr: Option<BoxedWriter>,
    pub tty: bool,
    pub term: String,
    /// Live TTY resizes, applied in order.
    pub window: Option<mpsc::Receiver<WindowSize>>,
}

impl ExecAttachOptions {
    pub fn new(cmd: Vec<String>, stdout: BoxedWriter) -> Self {
        Self {
            env: Vec::new(),
            cmd,
            stdin: None,
            stdout,
            stderr: None,
            tty: false,
            term: String::new(),
            window: None,
        }
    }
}

/// Container to create for an account.
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxSpec {
    pub name: String,
    pub hostname: String,
    pub image: String,
    /// `host:container` bind mounts.
    pub binds: Vec<String>,
    pub memory: Option<i64>,
    pub nano_cpus: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxStatus {
    Running,
    Paused,
    Stopped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Container runtime operations the sandbox manager relies on.
#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    /// `None` when no container has this name.
    async fn inspect(&self, name: &str) -> Result<Option<SandboxStatus>>;
    async fn create(&self, spec: &SandboxSpec) -> Result<()>;
    async fn start(&self, name: &str) -> Result<()>;
    async fn unpause(&self, name: &str) -> Result<()>;
    /// Run a bash script fed through stdin and collect its output.
    async fn exec_script(&self, name: &str, script: &str) -> Result<ScriptOutput>;
    /// Run a command wired to the given streams. Returns the exit code when
    /// the runtime reports one.
    async fn exec_attach(&self, name: &str, opts: ExecAttachOptions) -> Result<Option<i64>>;
}

/// Handle to an account's running sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sandbox {
    pub account: String,
    pub name: String,
    /// Whether this call created the container.
    pub created: bool,
}

/// One `Host` block of the sandbox's `~/.ssh/config`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshEntry {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub user: String,
}

pub fn container_name(account: &str) -> String {
    format!("sandbox-{}", account)
}

/// Reject account names that are unsafe as container names or paths.
pub fn validate_account(account: &str) -> Result<()> {
    if account.is_empty() {
        return Err(anyhow!("Account name cannot be empty"));
    }

    if account.len() > 64 {
        return Err(anyhow!("Account name too long (max 64 chars)"));
    }

    for c in account.chars() {
        if !c.is_ascii_alphanumeric() && c != '-' && c != '_' && c != '.' {
            return Err(anyhow!("Invalid character '{}' in account name", c));
        }
    }

    if account.starts_with('.') || account.starts_with('-') {
        return Err(anyhow!("Account name cannot start with '.' or '-'"));
    }

    Ok(())
}

/// Script that rewrites `/root/.ssh/config` with one block per entry.
pub fn script_seed_ssh_config(entries: &[SshEntry]) -> String {
    let mut script = String::from("#!/bin/bash\nrm -f /root/.ssh/config\n");
    if entries.is_empty() {
        script.push_str("echo '' > /root/.ssh/config\n");
        return script;
    }
    for entry in entries {
        for line in [
            format!("Host {}", entry.name),
            format!("HostName {}", entry.host),
            format!("Port {}", entry.port),
            format!("User {}", entry.user),
            String::new(),
        ] {
            script.push_str(&format!(
                "echo {} >> /root/.ssh/config\n",
                shell_words::quote(&line)
            ));
        }
    }
    script
}

#[cfg(unix)]
async fn ensure_sandbox_dir(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    tokio::fs::create_dir_all(path)
        .await
        .with_context(|| format!("Failed to create sandbox directory: {}", path.display()))?;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o750))
        .await
        .with_context(|| format!("Failed to chmod sandbox directory: {}", path.display()))?;
    Ok(())
}

#[cfg(not(unix))]
async fn ensure_sandbox_dir(path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path)
        .await
        .with_context(|| format!("Failed to create sandbox directory: {}", path.display()))?;
    Ok(())
}

/// Creates, starts and execs into account sandboxes.
pub struct SandboxManager {
    runtime: Arc<dyn SandboxRuntime>,
    sandbox_dir: PathBuf,
    image: String,
    memory: Option<i64>,
    nano_cpus: Option<i64>,
    /// Serializes find-or-create across all accounts.
    create_lock: Mutex<()>,
}

impl SandboxManager {
    pub fn new(runtime: Arc<dyn SandboxRuntime>, config: &GatewayConfig) -> Result<Self> {
        let resources = &config.sandbox_resources;
        let memory = resources
            .memory_limit
            .as_deref()
            .map(parse_memory_limit)
            .transpose()?;
        // 1 CPU = 1e9 nano CPUs
        let nano_cpus = resources.cpu_limit.map(|cpu| (cpu * 1_000_000_000.0) as i64);

        Ok(Self {
            runtime,
            sandbox_dir: config.sandbox_dir.clone(),
            image: config.sandbox_image.clone(),
            memory,
            nano_cpus,
            create_lock: Mutex::new(()),
        })
    }

    fn spec(&self, account: &str, home: &Path, shared: &Path) -> SandboxSpec {
        SandboxSpec {
            name: container_name(account),
            hostname: format!("{}.sandbox", account),
            image: self.image.clone(),
            binds: vec![
                format!("{}:/root", home.display()),
                format!("{}:/shared", shared.display()),
            ],
            memory: self.memory,
            nano_cpus: self.nano_cpus,
        }
    }

    /// Find the account's sandbox, creating and starting it as needed.
    ///
    /// An SSH keypair is generated inside the container only when it is
    /// created by this call.
    pub async fn find_or_create(&self, account: &str) -> Result<Sandbox> {
        validate_account(account)?;
        let _guard = self.create_lock.lock().await;

        let name = container_name(account);
        let home = self.sandbox_dir.join(&name);
        let shared = self.sandbox_dir.join("shared");
        ensure_sandbox_dir(&home).await?;
        ensure_sandbox_dir(&shared).await?;

        let created = match self.runtime.inspect(&name).await? {
            Some(SandboxStatus::Running) => false,
            Some(SandboxStatus::Paused) => {
                info!("Unpausing paused sandbox {}", name);
                self.runtime.unpause(&name).await?;
                false
            }
            Some(SandboxStatus::Stopped) => {
                info!("Starting stopped sandbox {}", name);
                self.runtime.start(&name).await?;
                false
            }
            None => {
                info!("Creating sandbox {} for {}", name, account);
                self.runtime.create(&self.spec(account, &home, &shared)).await?;
                self.runtime.start(&name).await?;
                self.runtime
                    .exec_script(&name, SCRIPT_GENERATE_SSH_KEY)
                    .await
                    .with_context(|| format!("Failed to generate SSH key in {}", name))?;
                true
            }
        };

        Ok(Sandbox {
            account: account.to_string(),
            name,
            created,
        })
    }

    pub async fn exec_attach(&self, sandbox: &Sandbox, opts: ExecAttachOptions) -> Result<Option<i64>> {
        self.runtime.exec_attach(&sandbox.name, opts).await
    }

    /// The sandbox's own public key, one OpenSSH line.
    pub async fn public_key(&self, sandbox: &Sandbox) -> Result<String> {
        let output = self
            .runtime
            .exec_script(&sandbox.name, SCRIPT_READ_PUBLIC_KEY)
            .await?;
        let key = output.stdout.trim();
        if key.is_empty() {
            return Err(anyhow!("Sandbox {} has no public key", sandbox.name));
        }
        Ok(key.to_string())
    }

    pub async fn seed_ssh_config(&self, sandbox: &Sandbox, entries: &[SshEntry]) -> Result<()> {
        self.runtime
            .exec_script(&sandbox.name, &script_seed_ssh_config(entries))
            .await?;
        Ok(())
    }
}

/// Parse a memory limit string (e.g., "4g", "512m") to bytes.
pub fn parse_memory_limit(s: &str) -> Result<i64> {
    let s = s.trim().to_lowercase();
    let (num, mult) = if s.ends_with('g') {
        (s.trim_end_matches('g'), 1024 * 1024 * 1024)
    } else if s.ends_with('m') {
        (s.trim_end_matches('m'), 1024 * 1024)
    } else if s.ends_with('k') {
        (s.trim_end_matches('k'), 1024)
    } else {
        (s.as_str(), 1)
    };

    let num: i64 = num
        .parse()
        .with_context(|| format!("Invalid memory limit: {}", s))?;

    num.checked_mul(mult)
        .filter(|bytes| *bytes >= 0)
        .ok_or_else(|| anyhow!("Memory limit out of range: {}", s))
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-process runtime used by tests across the crate.

    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    use tokio::io::AsyncWriteExt;

    use super::*;

    #[derive(Debug, Clone, Default)]
    pub struct ExecCall {
        pub name: String,
        pub cmd: Vec<String>,
        pub env: Vec<String>,
        pub tty: bool,
        pub term: String,
        pub stdin: Vec<u8>,
        pub windows: Vec<WindowSize>,
    }

    /// Fake runtime: execs echo a fixed reply to stdout and "err" to stderr.
    #[derive(Default)]
    pub struct FakeRuntime {
        pub containers: StdMutex<HashMap<String, SandboxStatus>>,
        pub created: StdMutex<Vec<SandboxSpec>>,
        pub scripts: StdMutex<Vec<(String, String)>>,
        pub execs: StdMutex<Vec<ExecCall>>,
        pub public_key: StdMutex<String>,
        pub exit_code: StdMutex<Option<i64>>,
        pub fail_exec: StdMutex<bool>,
    }

    #[async_trait]
    impl SandboxRuntime for FakeRuntime {
        async fn inspect(&self, name: &str) -> Result<Option<SandboxStatus>> {
            Ok(self.containers.lock().unwrap().get(name).copied())
        }

        async fn create(&self, spec: &SandboxSpec) -> Result<()> {
            self.created.lock().unwrap().push(spec.clone());
            self.containers
                .lock()
                .unwrap()
                .insert(spec.name.clone(), SandboxStatus::Stopped);
            Ok(())
        }

        async fn start(&self, name: &str) -> Result<()> {
            self.containers
                .lock()
                .unwrap()
                .insert(name.to_string(), SandboxStatus::Running);
            Ok(())
        }

        async fn unpause(&self, name: &str) -> Result<()> {
            self.start(name).await
        }

        async fn exec_script(&self, name: &str, script: &str) -> Result<ScriptOutput> {
            self.scripts
                .lock()
                .unwrap()
                .push((name.to_string(), script.to_string()));
            let stdout = if script == SCRIPT_READ_PUBLIC_KEY {
                self.public_key.lock().unwrap().clone()
            } else {
                String::new()
            };
            Ok(ScriptOutput {
                stdout,
                stderr: String::new(),
            })
        }

        async fn exec_attach(&self, name: &str, mut opts: ExecAttachOptions) -> Result<Option<i64>> {
            let mut call = ExecCall {
                name: name.to_string(),
                cmd: opts.cmd.clone(),
                env: opts.env.clone(),
                tty: opts.tty,
                term: opts.term.clone(),
                ..Default::default()
            };

            if let Some(window) = opts.window.as_mut() {
                let wait = std::time::Duration::from_millis(100);
                while let Ok(Some(w)) = tokio::time::timeout(wait, window.recv()).await {
                    call.windows.push(w);
                }
            }
            if let Some(mut stdin) = opts.stdin.take() {
                while let Some(chunk) = stdin.recv().await {
                    call.stdin.extend_from_slice(&chunk);
                }
            }

            opts.stdout.write_all(b"out:").await?;
            opts.stdout.write_all(&call.stdin).await?;
            opts.stdout.flush().await?;
            if let Some(stderr) = opts.stderr.as_mut() {
                stderr.write_all(b"err").await?;
                stderr.flush().await?;
            }

            self.execs.lock().unwrap().push(call);
            if *self.fail_exec.lock().unwrap() {
                return Err(anyhow!("exec failed"));
            }
            Ok(*self.exit_code.lock().unwrap())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeRuntime;
    use super::*;

    fn manager(runtime: Arc<FakeRuntime>, dir: &Path) -> SandboxManager {
        let mut config = GatewayConfig::default();
        config.sandbox_dir = dir.to_path_buf();
        config.sandbox_image = "bastion-sandbox:test".to_string();
        config.sandbox_resources.memory_limit = Some("512m".to_string());
        config.sandbox_resources.cpu_limit = Some(1.5);
        SandboxManager::new(runtime, &config).unwrap()
    }

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("bastion-sandbox-{}", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn test_find_or_create_is_idempotent() {
        let dir = temp_dir();
        let runtime = Arc::new(FakeRuntime::default());
        let manager = manager(runtime.clone(), &dir);

        let first = manager.find_or_create("alice").await.unwrap();
        let second = manager.find_or_create("alice").await.unwrap();

        assert_eq!(first.name, "sandbox-alice");
        assert_eq!(first.name, second.name);
        assert!(first.created);
        assert!(!second.created);
        assert_eq!(runtime.created.lock().unwrap().len(), 1);

        // keygen runs only on creation
        let scripts = runtime.scripts.lock().unwrap();
        assert_eq!(scripts.len(), 1);
        assert!(scripts[0].1.contains("ssh-keygen"));

        assert!(dir.join("sandbox-alice").is_dir());
        assert!(dir.join("shared").is_dir());

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_create_spec() {
        let dir = temp_dir();
        let runtime = Arc::new(FakeRuntime::default());
        let manager = manager(runtime.clone(), &dir);
        manager.find_or_create("bob").await.unwrap();

        let spec = runtime.created.lock().unwrap()[0].clone();
        assert_eq!(spec.hostname, "bob.sandbox");
        assert_eq!(spec.image, "bastion-sandbox:test");
        assert_eq!(
            spec.binds,
            vec![
                format!("{}:/root", dir.join("sandbox-bob").display()),
                format!("{}:/shared", dir.join("shared").display()),
            ]
        );
        assert_eq!(spec.memory, Some(512 * 1024 * 1024));
        assert_eq!(spec.nano_cpus, Some(1_500_000_000));

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_stopped_sandbox_is_started() {
        let dir = temp_dir();
        let runtime = Arc::new(FakeRuntime::default());
        runtime
            .containers
            .lock()
            .unwrap()
            .insert("sandbox-carol".to_string(), SandboxStatus::Stopped);
        let manager = manager(runtime.clone(), &dir);

        let sandbox = manager.find_or_create("carol").await.unwrap();
        assert!(!sandbox.created);
        assert_eq!(
            runtime.containers.lock().unwrap().get("sandbox-carol"),
            Some(&SandboxStatus::Running)
        );
        assert!(runtime.scripts.lock().unwrap().is_empty());

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_public_key_trimmed() {
        let dir = temp_dir();
        let runtime = Arc::new(FakeRuntime::default());
        *runtime.public_key.lock().unwrap() = "ssh-rsa AAAA root@dave.sandbox\n".to_string();
        let manager = manager(runtime.clone(), &dir);
        let sandbox = manager.find_or_create("dave").await.unwrap();
        assert_eq!(
            manager.public_key(&sandbox).await.unwrap(),
            "ssh-rsa AAAA root@dave.sandbox"
        );

        *runtime.public_key.lock().unwrap() = String::new();
        assert!(manager.public_key(&sandbox).await.is_err());

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_invalid_account_rejected() {
        let dir = temp_dir();
        let manager = manager(Arc::new(FakeRuntime::default()), &dir);
        assert!(manager.find_or_create("../etc").await.is_err());
        assert!(manager.find_or_create("").await.is_err());
    }

    #[test]
    fn test_validate_account() {
        assert!(validate_account("alice").is_ok());
        assert!(validate_account("alice.smith").is_ok());
        assert!(validate_account("a_b-c").is_ok());

        assert!(validate_account(".hidden").is_err());
        assert!(validate_account("-x").is_err());
        assert!(validate_account("has space").is_err());
        assert!(validate_account("a/b").is_err());
    }

    #[test]
    fn test_seed_ssh_config_script() {
        let script = script_seed_ssh_config(&[SshEntry {
            name: "db-1-root".to_string(),
            host: "172.17.0.1".to_string(),
            port: 2222,
            user: "root@db-1".to_string(),
        }]);
        assert!(script.contains("rm -f /root/.ssh/config"));
        assert!(script.contains("echo 'Host db-1-root' >> /root/.ssh/config"));
        assert!(script.contains("echo 'HostName 172.17.0.1' >> /root/.ssh/config"));
        assert!(script.contains("echo 'Port 2222' >> /root/.ssh/config"));
        assert!(script.contains("echo 'User root@db-1' >> /root/.ssh/config"));

        let empty = script_seed_ssh_config(&[]);
        assert!(empty.contains("echo '' > /root/.ssh/config"));
    }

    #[test]
    fn test_parse_memory_limit() {
        assert_eq!(parse_memory_limit("4g").unwrap(), 4 * 1024 * 1024 * 1024);
        assert_eq!(parse_memory_limit("512m").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_memory_limit("1024k").unwrap(), 1024 * 1024);
        assert_eq!(parse_memory_limit("1000").unwrap(), 1000);
        assert_eq!(parse_memory_limit("2G").unwrap(), 2 * 1024 * 1024 * 1024);
        assert!(parse_memory_limit("lots").is_err());
        assert!(parse_memory_limit("9223372036854775807g").is_err());
        assert!(parse_memory_limit("-1g").is_err());
    }
}
