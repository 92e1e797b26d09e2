//! Local, file-backed implementation of the directory services.
//!
//! Stores:
//! - users and their blocked flag
//! - public keys by fingerprint
//! - nodes by hostname
//! - grants
//! - session audit records
//!
//! Replays are written one file per session under the replay directory.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::directory::{
    GrantItem, GrantService, Grant, KeyRecord, KeyService, Node, NodeService, ReplayService,
    ReplaySink, SessionRecord, SessionService, UserRecord, UserService, now,
};
use crate::grant;
use crate::replay::{ReplayFrame, write_frame};

/// Persistent directory state.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct DirectoryState {
    /// Account name to user.
    #[serde(default)]
    pub users: HashMap<String, UserRecord>,

    /// Fingerprint to key.
    #[serde(default)]
    pub keys: HashMap<String, KeyRecord>,

    /// Hostname to node.
    #[serde(default)]
    pub nodes: BTreeMap<String, Node>,

    #[serde(default)]
    pub grants: Vec<Grant>,

    #[serde(default)]
    pub sessions: BTreeMap<i64, SessionRecord>,

    /// Last issued session id.
    #[serde(default)]
    pub last_session_id: i64,
}

/// Thread-safe directory backed by a JSON file.
pub struct LocalDirectory {
    state: RwLock<DirectoryState>,
    path: Option<PathBuf>,
    /// Serializes writers of the state file.
    save_lock: Mutex<()>,
}

impl LocalDirectory {
    /// Load state from disk, or start empty.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let content = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("Failed to read state file: {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse state file: {}", path.display()))?
        } else {
            DirectoryState::default()
        };

        Ok(Self {
            state: RwLock::new(state),
            path: Some(path),
            save_lock: Mutex::new(()),
        })
    }

    /// A directory that is never written to disk.
    pub fn in_memory(state: DirectoryState) -> Self {
        Self {
            state: RwLock::new(state),
            path: None,
            save_lock: Mutex::new(()),
        }
    }

    /// Save state to disk.
    ///
    /// The file is replaced atomically: the snapshot goes to a `0600`
    /// temporary file next to it, which is then renamed over the old one.
    pub async fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let _guard = self.save_lock.lock().await;
        let content = {
            let state = self.state.read().await;
            serde_json::to_string_pretty(&*state).context("Failed to serialize state")?
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create state directory: {}", parent.display()))?;
        }

        let tmp = path.with_extension("json.tmp");
        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o600);
        let mut file = options
            .open(&tmp)
            .await
            .with_context(|| format!("Failed to open state file: {}", tmp.display()))?;
        file.write_all(content.as_bytes())
            .await
            .with_context(|| format!("Failed to write state file: {}", tmp.display()))?;
        file.flush()
            .await
            .with_context(|| format!("Failed to write state file: {}", tmp.display()))?;
        file.sync_all()
            .await
            .with_context(|| format!("Failed to sync state file: {}", tmp.display()))?;
        drop(file);

        tokio::fs::rename(&tmp, path)
            .await
            .with_context(|| format!("Failed to replace state file: {}", path.display()))?;

        Ok(())
    }

    #[cfg(test)]
    pub async fn get_session(&self, id: i64) -> Option<SessionRecord> {
        self.state.read().await.sessions.get(&id).cloned()
    }
}

#[async_trait]
impl KeyService for LocalDirectory {
    async fn get_key(&self, fingerprint: &str) -> Result<Option<KeyRecord>> {
        Ok(self.state.read().await.keys.get(fingerprint).cloned())
    }

    async fn touch_key(&self, fingerprint: &str) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if let Some(key) = state.keys.get_mut(fingerprint) {
                key.viewed_at = now();
            }
        }
        self.save().await
    }

    async fn put_key(&self, mut key: KeyRecord) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if let Some(existing) = state.keys.get(&key.fingerprint) {
                if existing.account != key.account || existing.source != key.source {
                    bail!(
                        "Key {} is already registered to {} ({:?})",
                        key.fingerprint,
                        existing.account,
                        existing.source
                    );
                }
                if key.created_at == 0 {
                    key.created_at = existing.created_at;
                }
            }
            if key.created_at == 0 {
                key.created_at = now();
            }
            state.keys.insert(key.fingerprint.clone(), key);
        }
        self.save().await
    }
}

#[async_trait]
impl UserService for LocalDirectory {
    async fn get_user(&self, account: &str) -> Result<Option<UserRecord>> {
        Ok(self.state.read().await.users.get(account).cloned())
    }

    async fn touch_user(&self, account: &str) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if let Some(user) = state.users.get_mut(account) {
                user.viewed_at = now();
            }
        }
        self.save().await
    }
}

#[async_trait]
impl NodeService for LocalDirectory {
    async fn get_node(&self, hostname: &str) -> Result<Option<Node>> {
        Ok(self.state.read().await.nodes.get(hostname).cloned())
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        Ok(self.state.read().await.nodes.values().cloned().collect())
    }
}

#[async_trait]
impl GrantService for LocalDirectory {
    async fn check_grant(&self, account: &str, user: &str, hostname: &str) -> Result<bool> {
        let state = self.state.read().await;
        let grants = state.grants.iter().filter(|g| g.account == account);
        Ok(grant::check(grants, user, hostname, now()))
    }

    async fn list_grant_items(&self, account: &str) -> Result<Vec<GrantItem>> {
        let state = self.state.read().await;
        let grants: Vec<Grant> = state
            .grants
            .iter()
            .filter(|g| g.account == account)
            .cloned()
            .collect();
        Ok(grant::list_items(state.nodes.values(), &grants, now()))
    }
}

#[async_trait]
impl SessionService for LocalDirectory {
    async fn create_session(&self, account: &str, command: &str, recorded: bool) -> Result<i64> {
        let id = {
            let mut state = self.state.write().await;
            state.last_session_id += 1;
            let id = state.last_session_id;
            state.sessions.insert(
                id,
                SessionRecord {
                    id,
                    account: account.to_string(),
                    command: command.to_string(),
                    recorded,
                    created_at: now(),
                    finished_at: 0,
                },
            );
            id
        };
        self.save().await?;
        Ok(id)
    }

    async fn finish_session(&self, id: i64) -> Result<()> {
        {
            let mut state = self.state.write().await;
            let session = state
                .sessions
                .get_mut(&id)
                .with_context(|| format!("Unknown session {}", id))?;
            session.finished_at = now();
        }
        self.save().await
    }
}

/// Replay storage: one file per session, frames appended in wire format.
pub struct FileReplayStore {
    dir: PathBuf,
}

impl FileReplayStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// `<dir>/hhhh/hhhh/hhhh/<16 hex digits>` for the big-endian session id.
    pub fn path_for(&self, session_id: i64) -> PathBuf {
        replay_path(&self.dir, session_id)
    }
}

fn replay_path(dir: &Path, session_id: i64) -> PathBuf {
    let name = format!("{:016x}", session_id as u64);
    dir.join(&name[..4])
        .join(&name[4..8])
        .join(&name[8..12])
        .join(&name)
}

#[async_trait]
impl ReplayService for FileReplayStore {
    async fn open(&self, session_id: i64) -> Result<Box<dyn ReplaySink>> {
        let path = self.path_for(session_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create replay directory: {}", parent.display()))?;
        }

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("Failed to open replay file: {}", path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o640)).await;
        }

        debug!("Recording session {} to {}", session_id, path.display());

        Ok(Box::new(FileReplaySink {
            writer: BufWriter::new(file),
        }))
    }
}

struct FileReplaySink {
    writer: BufWriter<tokio::fs::File>,
}

#[async_trait]
impl ReplaySink for FileReplaySink {
    async fn send(&mut self, frame: &ReplayFrame) -> Result<()> {
        write_frame(&mut self.writer, frame)
            .await
            .context("Failed to write replay frame")
    }

    async fn close(mut self: Box<Self>) -> Result<()> {
        self.writer.flush().await.context("Failed to flush replay file")?;
        self.writer
            .into_inner()
            .sync_all()
            .await
            .context("Failed to sync replay file")
    }
}
