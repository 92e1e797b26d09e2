//! Contracts of the services the gateway consumes.
//!
//! Users, keys, nodes, grants, sessions and replays are owned by an external
//! store. The gateway only reads authorization decisions from it and writes
//! audit records back.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::replay::ReplayFrame;

/// Where a public key came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeySource {
    /// Uploaded by the account owner.
    Manual,
    /// Exported from the account's sandbox.
    Sandbox,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRecord {
    /// `SHA256:...` fingerprint, the lookup key.
    pub fingerprint: String,
    pub account: String,
    #[serde(default)]
    pub name: String,
    pub source: KeySource,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub viewed_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub account: String,
    #[serde(default)]
    pub blocked: bool,
    #[serde(default)]
    pub viewed_at: i64,
}

/// A target host reachable through the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub hostname: String,
    /// `host:port` the gateway dials.
    pub address: String,
    /// Whether the gateway owns the node's `authorized_keys`.
    #[serde(default)]
    pub key_managed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    pub account: String,
    /// Hostname pattern, `*` is a wildcard.
    pub hostname_pattern: String,
    pub user: String,
    /// Unix seconds; 0 never expires.
    #[serde(default)]
    pub expired_at: i64,
}

/// A grant resolved against a concrete node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantItem {
    pub hostname: String,
    pub user: String,
    pub expired_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: i64,
    pub account: String,
    pub command: String,
    pub recorded: bool,
    pub created_at: i64,
    #[serde(default)]
    pub finished_at: i64,
}

#[async_trait]
pub trait KeyService: Send + Sync {
    async fn get_key(&self, fingerprint: &str) -> Result<Option<KeyRecord>>;
    async fn touch_key(&self, fingerprint: &str) -> Result<()>;
    /// Insert or replace a key by fingerprint.
    async fn put_key(&self, key: KeyRecord) -> Result<()>;
}

#[async_trait]
pub trait UserService: Send + Sync {
    async fn get_user(&self, account: &str) -> Result<Option<UserRecord>>;
    async fn touch_user(&self, account: &str) -> Result<()>;
}

#[async_trait]
pub trait NodeService: Send + Sync {
    async fn get_node(&self, hostname: &str) -> Result<Option<Node>>;
    async fn list_nodes(&self) -> Result<Vec<Node>>;
}

#[async_trait]
pub trait GrantService: Send + Sync {
    /// Whether `account` may act as `user` on `hostname` right now.
    async fn check_grant(&self, account: &str, user: &str, hostname: &str) -> Result<bool>;
    /// Active grants of `account` expanded to concrete nodes, one item per
    /// `(hostname, user)`.
    async fn list_grant_items(&self, account: &str) -> Result<Vec<GrantItem>>;
}

#[async_trait]
pub trait SessionService: Send + Sync {
    async fn create_session(&self, account: &str, command: &str, recorded: bool) -> Result<i64>;
    async fn finish_session(&self, id: i64) -> Result<()>;
}

/// Write side of one session's replay stream. Single writer.
#[async_trait]
pub trait ReplaySink: Send {
    async fn send(&mut self, frame: &ReplayFrame) -> Result<()>;
    async fn close(self: Box<Self>) -> Result<()>;
}

#[async_trait]
pub trait ReplayService: Send + Sync {
    async fn open(&self, session_id: i64) -> Result<Box<dyn ReplaySink>>;
}

/// Handles to every collaborator, shared by all connections.
#[derive(Clone)]
pub struct Directory {
    pub keys: Arc<dyn KeyService>,
    pub users: Arc<dyn UserService>,
    pub nodes: Arc<dyn NodeService>,
    pub grants: Arc<dyn GrantService>,
    pub sessions: Arc<dyn SessionService>,
    pub replays: Arc<dyn ReplayService>,
}

impl Directory {
    /// Use one backend for every record service.
    pub fn from_store<S>(store: Arc<S>, replays: Arc<dyn ReplayService>) -> Self
    where
        S: KeyService + UserService + NodeService + GrantService + SessionService + 'static,
    {
        Self {
            keys: store.clone(),
            users: store.clone(),
            nodes: store.clone(),
            grants: store.clone(),
            sessions: store,
            replays,
        }
    }
}

/// Current time in unix seconds.
pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}
