//! Outbound SSH connections from the gateway to target hosts.
//!
//! Stage-2 sessions and tunnels both dial targets with the gateway's client
//! keys. Tunnels share one connection per target address for the lifetime
//! of the inbound connection that opened them.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use russh::client::{self, AuthResult};
use russh::keys::{PrivateKey, PrivateKeyWithHashAlg, PublicKey};
use russh::{ChannelMsg, Disconnect};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::keys::{normalize_address, public_key_to_openssh};

/// Target-side client handler. Host keys of targets are not verified.
pub struct TargetClient;

impl client::Handler for TargetClient {
    type Error = anyhow::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        debug!(
            key_type = ?server_public_key.algorithm(),
            "Accepting target host key"
        );
        Ok(true)
    }
}

/// Dials targets and opens forwarded streams over established connections.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Client: Send + Sync + 'static;
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    async fn connect(&self, address: &str) -> Result<Self::Client>;
    /// Forward to `127.0.0.1:port` as seen from the target.
    async fn open_stream(&self, client: &Self::Client, port: u32) -> Result<Self::Stream>;
    async fn disconnect(&self, client: &Self::Client);
}

/// Per-connection cache of target connections, keyed by address.
pub struct TunnelPool<C: Connector> {
    connector: Arc<C>,
    clients: Mutex<HashMap<String, Arc<C::Client>>>,
}

impl<C: Connector> TunnelPool<C> {
    pub fn new(connector: Arc<C>) -> Self {
        Self {
            connector,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Open a stream to `port` on the target at `address`, reusing an
    /// existing connection to that address when there is one.
    pub async fn dial(&self, address: &str, port: u32) -> Result<C::Stream> {
        let address = normalize_address(address);

        // Held across connect so concurrent dials share one connection.
        let client = {
            let mut clients = self.clients.lock().await;
            match clients.get(&address) {
                Some(client) => client.clone(),
                None => {
                    let client = Arc::new(self.connector.connect(&address).await?);
                    clients.insert(address.clone(), client.clone());
                    client
                }
            }
        };

        self.connector.open_stream(&client, port).await
    }

    /// Disconnect every cached connection.
    pub async fn close(&self) {
        let clients: Vec<_> = self.clients.lock().await.drain().collect();
        for (address, client) in clients {
            debug!(address = %address, "Closing tunnel connection");
            self.connector.disconnect(&client).await;
        }
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.clients.lock().await.len()
    }
}

/// Connects to targets over SSH with the gateway's client keys.
pub struct SshConnector {
    config: Arc<client::Config>,
    keys: Vec<Arc<PrivateKey>>,
    user: String,
}

impl SshConnector {
    pub fn new(keys: Vec<Arc<PrivateKey>>, user: impl Into<String>) -> Self {
        Self {
            config: Arc::new(client::Config::default()),
            keys,
            user: user.into(),
        }
    }

    /// OpenSSH lines of the client keys, for target `authorized_keys`.
    pub fn authorized_keys(&self) -> Vec<String> {
        self.keys
            .iter()
            .map(|key| public_key_to_openssh(key.public_key()))
            .collect()
    }

    /// Connect to `address` and authenticate with the first accepted key.
    pub async fn dial(&self, address: &str) -> Result<client::Handle<TargetClient>> {
        let address = normalize_address(address);
        let mut handle = client::connect(self.config.clone(), address.as_str(), TargetClient)
            .await
            .with_context(|| format!("Failed to connect to {}", address))?;

        for key in &self.keys {
            let key_with_alg = PrivateKeyWithHashAlg::new(key.clone(), None);
            match handle
                .authenticate_publickey(&self.user, key_with_alg)
                .await
                .with_context(|| format!("Failed to authenticate to {}", address))?
            {
                AuthResult::Success => {
                    debug!(address = %address, user = %self.user, "Authenticated to target");
                    return Ok(handle);
                }
                AuthResult::Failure { .. } => continue,
            }
        }

        Err(anyhow!("All client keys rejected by {}", address))
    }

    /// Connect to `address` and open a session channel on it.
    pub async fn open_session(
        &self,
        address: &str,
    ) -> Result<(client::Handle<TargetClient>, russh::Channel<client::Msg>)> {
        let handle = self.dial(address).await?;
        let channel = handle
            .channel_open_session()
            .await
            .with_context(|| format!("Failed to open session on {}", address))?;
        Ok((handle, channel))
    }

    /// Replace the target user's `authorized_keys` on `address` with the
    /// gateway's client keys.
    pub async fn override_authorized_keys(&self, address: &str) -> Result<()> {
        let (handle, mut channel) = self.open_session(address).await?;

        let mut keys = self.authorized_keys().join("\n");
        keys.push('\n');

        channel
            .exec(
                true,
                "umask 077; mkdir -p ~/.ssh && cat > ~/.ssh/authorized_keys",
            )
            .await?;
        channel.data(keys.as_bytes()).await?;
        channel.eof().await?;

        let mut exit_status = None;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Failure => bail!("Target {} refused exec", address),
                ChannelMsg::ExitStatus { exit_status: code } => exit_status = Some(code),
                ChannelMsg::Close => break,
                _ => {}
            }
        }

        let _ = handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await;

        match exit_status {
            Some(0) => {
                info!(address, "Overrode authorized_keys");
                Ok(())
            }
            Some(code) => Err(anyhow!("Overriding keys on {} exited with {}", address, code)),
            None => Err(anyhow!("Overriding keys on {} ended without exit status", address)),
        }
    }
}

#[async_trait]
impl Connector for SshConnector {
    type Client = client::Handle<TargetClient>;
    type Stream = russh::ChannelStream<client::Msg>;

    async fn connect(&self, address: &str) -> Result<Self::Client> {
        self.dial(address).await
    }

    async fn open_stream(&self, client: &Self::Client, port: u32) -> Result<Self::Stream> {
        let channel = client
            .channel_open_direct_tcpip("127.0.0.1", port, "127.0.0.1", 0)
            .await
            .with_context(|| format!("Failed to forward to target port {}", port))?;
        Ok(channel.into_stream())
    }

    async fn disconnect(&self, client: &Self::Client) {
        if let Err(e) = client
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
        {
            warn!("Failed to disconnect tunnel: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    struct CountingConnector {
        connects: AtomicUsize,
        disconnects: AtomicUsize,
    }

    #[async_trait]
    impl Connector for CountingConnector {
        type Client = String;
        type Stream = tokio::io::DuplexStream;

        async fn connect(&self, address: &str) -> Result<String> {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            self.connects.fetch_add(1, Ordering::SeqCst);
            if address.starts_with("unreachable") {
                bail!("connection refused");
            }
            Ok(address.to_string())
        }

        async fn open_stream(&self, _client: &String, _port: u32) -> Result<Self::Stream> {
            let (a, _b) = tokio::io::duplex(64);
            Ok(a)
        }

        async fn disconnect(&self, _client: &String) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_concurrent_dials_share_connection() {
        let connector = Arc::new(CountingConnector::default());
        let pool = Arc::new(TunnelPool::new(connector.clone()));

        let a = tokio::spawn({
            let pool = pool.clone();
            async move { pool.dial("10.0.0.5", 8080).await.map(|_| ()) }
        });
        let b = tokio::spawn({
            let pool = pool.clone();
            async move { pool.dial("10.0.0.5:22", 9090).await.map(|_| ()) }
        });
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert_eq!(pool.len().await, 1);

        pool.dial("10.0.0.6", 8080).await.unwrap();
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);

        pool.close().await;
        assert_eq!(connector.disconnects.load(Ordering::SeqCst), 2);
        assert_eq!(pool.len().await, 0);
    }

    #[tokio::test]
    async fn test_failed_connect_not_cached() {
        let connector = Arc::new(CountingConnector::default());
        let pool = TunnelPool::new(connector.clone());

        assert!(pool.dial("unreachable", 80).await.is_err());
        assert!(pool.dial("unreachable", 80).await.is_err());
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
        assert_eq!(pool.len().await, 0);
    }
}
