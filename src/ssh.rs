//! SSH server implementation using russh.
//!
//! Handles:
//! - Public key authentication against the directory
//! - Stage-1 session channels, run inside the account's sandbox
//! - Stage-1 direct-tcpip channels, tunnelled through target hosts
//! - Stage-2 session channels, relayed to the granted target host

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::{Context, Result};
use russh::keys::PublicKey;
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, MethodKind, MethodSet, Pty, Sig};
use tokio::sync::mpsc;
use tracing::{debug, field, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

use crate::auth::{authorize, Identity, Route, Target};
use crate::config::GatewayConfig;
use crate::directory::{Directory, KeyRecord, KeySource};
use crate::error::GatewayError;
use crate::keys::{fingerprint, fingerprint_from_openssh};
use crate::relay::{relay, RelayEvent, ServerChannel};
use crate::request::{ChannelRequest, PtyRequest};
use crate::sandbox::{Sandbox, SandboxManager, SshEntry};
use crate::session::{self, SessionContext, SessionIo, SessionOutcome};
use crate::tunnel::{SshConnector, TunnelPool};

/// Chunks of client input buffered per session channel.
const STDIN_QUEUE: usize = 32;

/// Shared state for the SSH server.
pub struct Gateway {
    pub config: Arc<GatewayConfig>,
    pub directory: Directory,
    pub sandboxes: Arc<SandboxManager>,
    pub connector: Arc<SshConnector>,
    /// Gateway address as seen from sandboxes.
    pub egress: IpAddr,
    /// Port sandboxes use to reach the gateway.
    pub listen_port: u16,
}

impl Gateway {
    pub fn new(
        config: Arc<GatewayConfig>,
        directory: Directory,
        sandboxes: Arc<SandboxManager>,
        connector: Arc<SshConnector>,
    ) -> Result<Self> {
        let egress = config.egress_ip()?;
        let listen_port = config.listen_socket()?.port();
        Ok(Self {
            config,
            directory,
            sandboxes,
            connector,
            egress,
            listen_port,
        })
    }
}

/// Where traffic of an open channel goes.
enum ChannelRoute {
    /// Stage-1 session running in the sandbox.
    Session {
        requests: mpsc::UnboundedSender<ChannelRequest>,
        /// Dropped on EOF.
        stdin: Option<mpsc::Sender<Vec<u8>>>,
    },
    /// Stage-2 channel relayed to a target.
    Relay {
        events: mpsc::UnboundedSender<RelayEvent>,
    },
}

/// Per-connection handler state.
pub struct ConnectionHandler {
    gateway: Arc<Gateway>,

    /// Gateway-side address of the connection.
    local_addr: SocketAddr,

    /// Span carrying the connection's log fields.
    span: Span,

    /// Set once by a successful authentication.
    identity: OnceLock<Identity>,

    /// Target connections backing this connection's tunnels.
    tunnels: Arc<TunnelPool<SshConnector>>,

    channels: HashMap<ChannelId, ChannelRoute>,

    /// A Stage-2 connection serves a single session channel.
    target_session_opened: bool,
}

fn reject() -> Auth {
    Auth::Reject {
        proceed_with_methods: None,
        partial_success: false,
    }
}

impl ConnectionHandler {
    fn new(
        gateway: Arc<Gateway>,
        local_addr: SocketAddr,
        span: Span,
        tunnels: Arc<TunnelPool<SshConnector>>,
    ) -> Self {
        Self {
            gateway,
            local_addr,
            span,
            identity: OnceLock::new(),
            tunnels,
            channels: HashMap::new(),
            target_session_opened: false,
        }
    }

    /// Take the connection's only Stage-2 session slot.
    fn claim_target_session(&mut self) -> bool {
        !std::mem::replace(&mut self.target_session_opened, true)
    }

    fn record_identity(&self, identity: &Identity) {
        self.span.record("stage", identity.stage());
        self.span.record("account", identity.account.as_str());
        if let Route::Target(target) = &identity.route {
            self.span.record("user", target.user.as_str());
            self.span.record("hostname", target.hostname.as_str());
            self.span.record("address", target.address.as_str());
        }
    }

    /// Hand a channel request to whatever serves the channel.
    fn dispatch(
        &mut self,
        channel_id: ChannelId,
        request: ChannelRequest,
        session: &mut Session,
    ) -> Result<()> {
        let kind = request.kind();
        match self.channels.get(&channel_id) {
            Some(ChannelRoute::Session { requests, .. }) => {
                let supported = matches!(
                    request,
                    ChannelRequest::Pty(_)
                        | ChannelRequest::Env { .. }
                        | ChannelRequest::WindowChange { .. }
                        | ChannelRequest::Shell
                        | ChannelRequest::Exec { .. }
                );
                if supported && requests.send(request).is_ok() {
                    session.channel_success(channel_id)?;
                } else {
                    debug!("Refusing {} on session channel", kind);
                    session.channel_failure(channel_id)?;
                }
            }
            // the relay answers with the target's reply
            Some(ChannelRoute::Relay { events }) => {
                if events.send(RelayEvent::Request(request)).is_err() {
                    session.channel_failure(channel_id)?;
                }
            }
            None => session.channel_failure(channel_id)?,
        }
        Ok(())
    }

    /// Stage-1: find or create the sandbox and start the session driver.
    async fn open_sandbox_session(
        &mut self,
        channel: Channel<Msg>,
        account: &str,
        session: &mut Session,
    ) -> Result<bool> {
        let sandbox = match self.gateway.sandboxes.find_or_create(account).await {
            Ok(sandbox) => sandbox,
            Err(e) => {
                let err = GatewayError::rejected(format!("sandbox unavailable: {:#}", e));
                warn!("{}", err);
                return Ok(false);
            }
        };
        debug!(
            sandbox = %sandbox.name,
            created = sandbox.created,
            "Sandbox ready for {}",
            sandbox.account
        );

        if let Err(e) = self.refresh_sandbox_key(account, &sandbox).await {
            warn!("Failed to refresh sandbox key: {:#}", e);
        }
        if let Err(e) = self.seed_ssh_config(account, &sandbox).await {
            warn!("Failed to seed sandbox ssh config: {:#}", e);
        }

        let channel_id = channel.id();
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (stdin_tx, stdin_rx) = mpsc::channel(STDIN_QUEUE);
        let io = SessionIo {
            stdin: stdin_rx,
            stdout: Box::new(Box::pin(channel.make_writer())),
            stderr: Box::new(Box::pin(channel.make_writer_ext(Some(1)))),
            notice: Box::new(Box::pin(channel.make_writer_ext(Some(1)))),
        };
        drop(channel);

        let ctx = SessionContext {
            account: account.to_string(),
            sandbox,
            sandboxes: self.gateway.sandboxes.clone(),
            directory: self.gateway.directory.clone(),
        };

        self.channels.insert(
            channel_id,
            ChannelRoute::Session {
                requests: requests_tx,
                stdin: Some(stdin_tx),
            },
        );

        let handle = session.handle();
        tokio::spawn(
            async move {
                let outcome = session::run(ctx, requests_rx, io).await;
                if let SessionOutcome::Completed { exit_status } = outcome {
                    if handle.exit_status_request(channel_id, exit_status).await.is_err() {
                        debug!(exit_status, "Client gone before exit status");
                    }
                }
                if handle.eof(channel_id).await.is_err() {
                    debug!("Client gone before eof");
                }
                if handle.close(channel_id).await.is_err() {
                    debug!("Client gone before close");
                }
            }
            .instrument(self.span.clone()),
        );

        Ok(true)
    }

    /// Export the sandbox's own key so the sandbox can log in to Stage-2.
    async fn refresh_sandbox_key(&self, account: &str, sandbox: &Sandbox) -> Result<()> {
        let public_key = self.gateway.sandboxes.public_key(sandbox).await?;
        let fingerprint = fingerprint_from_openssh(&public_key)?;
        self.gateway
            .directory
            .keys
            .put_key(KeyRecord {
                fingerprint,
                account: account.to_string(),
                name: sandbox.name.clone(),
                source: KeySource::Sandbox,
                created_at: 0,
                viewed_at: 0,
            })
            .await
    }

    /// One `Host` alias per granted `(hostname, user)`.
    async fn seed_ssh_config(&self, account: &str, sandbox: &Sandbox) -> Result<()> {
        let items = self
            .gateway
            .directory
            .grants
            .list_grant_items(account)
            .await?;

        let entries: Vec<SshEntry> = items
            .into_iter()
            .filter(|item| item.user != self.gateway.config.tunnel_user)
            .map(|item| SshEntry {
                name: format!("{}-{}", item.hostname, item.user),
                host: self.gateway.egress.to_string(),
                port: self.gateway.listen_port,
                user: format!("{}@{}", item.user, item.hostname),
            })
            .collect();

        self.gateway.sandboxes.seed_ssh_config(sandbox, &entries).await
    }

    /// Stage-2: dial the target and relay the channel to it.
    async fn open_target_session(
        &mut self,
        channel: Channel<Msg>,
        target: Target,
        session: &mut Session,
    ) -> Result<bool> {
        if !self.claim_target_session() {
            warn!("{}", GatewayError::rejected("target connection already has a session"));
            return Ok(false);
        }

        let (client, upstream) = match self.gateway.connector.open_session(&target.address).await {
            Ok(pair) => pair,
            Err(e) => {
                let err = GatewayError::Infrastructure(e);
                warn!("Failed to reach target: {:#}", err);
                return Ok(false);
            }
        };

        let channel_id = channel.id();
        drop(channel);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        self.channels
            .insert(channel_id, ChannelRoute::Relay { events: events_tx });

        let downstream = ServerChannel {
            handle: session.handle(),
            id: channel_id,
        };
        tokio::spawn(
            async move {
                relay(upstream, downstream, target.user, events_rx).await;
                if let Err(e) = client
                    .disconnect(russh::Disconnect::ByApplication, "", "English")
                    .await
                {
                    debug!("Target disconnect failed: {}", e);
                }
                debug!("Relay finished");
            }
            .instrument(self.span.clone()),
        );

        Ok(true)
    }

    /// Stage-1 tunnel: `host` must be a known node the account holds a
    /// tunnel grant for.
    async fn open_tunnel(
        &self,
        account: &str,
        host: &str,
        port: u32,
    ) -> Result<russh::ChannelStream<russh::client::Msg>, GatewayError> {
        let directory = &self.gateway.directory;
        let tunnel_user = &self.gateway.config.tunnel_user;

        let node = directory
            .nodes
            .get_node(host)
            .await
            .map_err(GatewayError::Infrastructure)?
            .ok_or_else(|| GatewayError::rejected(format!("unknown node {}", host)))?;

        let granted = directory
            .grants
            .check_grant(account, tunnel_user, host)
            .await
            .map_err(GatewayError::Infrastructure)?;
        if !granted {
            return Err(GatewayError::rejected(format!("no tunnel grant for {}", host)));
        }

        self.tunnels
            .dial(&node.address, port)
            .await
            .map_err(GatewayError::Infrastructure)
    }
}

impl Handler for ConnectionHandler {
    type Error = anyhow::Error;

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        let fingerprint = fingerprint(public_key);
        debug!("Public key auth for '{}' with {}", user, fingerprint);

        if self.identity.get().is_some() {
            return Ok(reject());
        }

        match authorize(
            &self.gateway.directory,
            self.local_addr.ip(),
            self.gateway.egress,
            user,
            &fingerprint,
        )
        .await
        {
            Ok(identity) => {
                self.record_identity(&identity);
                info!(fingerprint = %identity.fingerprint, "Authenticated");
                let _ = self.identity.set(identity);
                Ok(Auth::Accept)
            }
            Err(e) => {
                warn!(login = user, "Rejected: {}", e);
                Ok(reject())
            }
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Some(identity) = self.identity.get().cloned() else {
            return Ok(false);
        };
        debug!("Session channel opened: {:?}", channel.id());

        match identity.route {
            Route::Sandbox => {
                self.open_sandbox_session(channel, &identity.account, session)
                    .await
            }
            Route::Target(target) => self.open_target_session(channel, target, session).await,
        }
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let account = match self.identity.get() {
            Some(Identity {
                account,
                route: Route::Sandbox,
                ..
            }) => account.clone(),
            _ => {
                debug!("direct-tcpip refused outside sandbox connections");
                return Ok(false);
            }
        };

        info!(
            "Direct-tcpip request: {}:{} from {}:{}",
            host_to_connect, port_to_connect, originator_address, originator_port
        );

        let mut target = match self
            .open_tunnel(&account, host_to_connect, port_to_connect)
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Tunnel to {}:{} refused: {}", host_to_connect, port_to_connect, e);
                return Ok(false);
            }
        };

        let label = format!("{}:{}", host_to_connect, port_to_connect);
        tokio::spawn(
            async move {
                let mut stream = channel.into_stream();
                match tokio::io::copy_bidirectional(&mut stream, &mut target).await {
                    Ok((up, down)) => debug!("Tunnel {} closed ({} up, {} down)", label, up, down),
                    Err(e) => debug!("Tunnel {} ended: {}", label, e),
                }
            }
            .instrument(self.span.clone()),
        );

        Ok(true)
    }

    async fn pty_request(
        &mut self,
        channel_id: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(
            "PTY request: channel={:?}, term={}, cols={}, rows={}",
            channel_id, term, col_width, row_height
        );
        let request = ChannelRequest::Pty(PtyRequest {
            term: term.to_string(),
            cols: col_width,
            rows: row_height,
            pix_width,
            pix_height,
            modes: modes.to_vec(),
        });
        self.dispatch(channel_id, request, session)
    }

    async fn env_request(
        &mut self,
        channel_id: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let request = ChannelRequest::Env {
            name: variable_name.to_string(),
            value: variable_value.to_string(),
        };
        self.dispatch(channel_id, request, session)
    }

    async fn shell_request(
        &mut self,
        channel_id: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.dispatch(channel_id, ChannelRequest::Shell, session)
    }

    async fn exec_request(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let command = String::from_utf8_lossy(data).into_owned();
        debug!("Exec request: channel={:?}, command={}", channel_id, command);
        self.dispatch(channel_id, ChannelRequest::Exec { command }, session)
    }

    async fn subsystem_request(
        &mut self,
        channel_id: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let request = ChannelRequest::Subsystem {
            name: name.to_string(),
        };
        self.dispatch(channel_id, request, session)
    }

    async fn x11_request(
        &mut self,
        channel_id: ChannelId,
        _single_connection: bool,
        _x11_auth_protocol: &str,
        _x11_auth_cookie: &str,
        _x11_screen_number: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.dispatch(channel_id, ChannelRequest::X11, session)
    }

    async fn window_change_request(
        &mut self,
        channel_id: ChannelId,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let request = ChannelRequest::WindowChange {
            cols: col_width,
            rows: row_height,
            pix_width,
            pix_height,
        };
        self.dispatch(channel_id, request, session)
    }

    async fn signal(
        &mut self,
        channel_id: ChannelId,
        signal: Sig,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        // only relayed channels pass signals on
        if let Some(ChannelRoute::Relay { events }) = self.channels.get(&channel_id) {
            let _ = events.send(RelayEvent::Request(ChannelRequest::Signal(signal)));
        }
        Ok(())
    }

    async fn data(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        match self.channels.get(&channel_id) {
            Some(ChannelRoute::Session {
                stdin: Some(stdin), ..
            }) => {
                let _ = stdin.send(data.to_vec()).await;
            }
            Some(ChannelRoute::Relay { events }) => {
                let _ = events.send(RelayEvent::Data(data.to_vec()));
            }
            _ => {}
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel_id: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!("Channel EOF: {:?}", channel_id);
        match self.channels.get_mut(&channel_id) {
            // Drop the stdin sender to signal EOF to the exec
            Some(ChannelRoute::Session { stdin, .. }) => *stdin = None,
            Some(ChannelRoute::Relay { events }) => {
                let _ = events.send(RelayEvent::Eof);
            }
            None => {}
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel_id: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!("Channel closed: {:?}", channel_id);
        self.channels.remove(&channel_id);
        Ok(())
    }
}

/// Run the SSH server.
pub async fn run_server(gateway: Arc<Gateway>) -> Result<()> {
    let key = crate::keys::load_or_generate_key(&gateway.config.host_key_path, "host key").await?;

    let russh_config = Arc::new(russh::server::Config {
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        methods: MethodSet::from(&[MethodKind::PublicKey][..]),
        keys: vec![key],
        ..Default::default()
    });

    let addr = gateway.config.listen_socket()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("SSH server listening on {}", listener.local_addr()?);

    loop {
        let (stream, peer_addr) = listener.accept().await?;
        let local_addr = match stream.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                warn!("Dropping connection from {}: {}", peer_addr, e);
                continue;
            }
        };

        let gateway = gateway.clone();
        let russh_config = russh_config.clone();
        let span = info_span!(
            "conn",
            conn = %Uuid::new_v4(),
            peer = %peer_addr,
            stage = field::Empty,
            account = field::Empty,
            user = field::Empty,
            hostname = field::Empty,
            address = field::Empty,
        );

        tokio::spawn(
            async move {
                let tunnels = Arc::new(TunnelPool::new(gateway.connector.clone()));
                let handler =
                    ConnectionHandler::new(gateway, local_addr, Span::current(), tunnels.clone());
                match russh::server::run_stream(russh_config, stream, handler).await {
                    Ok(session) => {
                        if let Err(e) = session.await {
                            warn!("SSH session error: {}", e);
                        }
                    }
                    Err(e) => {
                        warn!("SSH connection error: {}", e);
                    }
                }
                tunnels.close().await;
                debug!("Connection closed");
            }
            .instrument(span),
        );
    }
}
