//! Stage-2 channel relay.
//!
//! Each session channel opened by a sandbox is paired with a session channel
//! on the target host. Requests from the sandbox are rewritten (commands run
//! through sudo as the granted user) and forwarded; the target's replies,
//! output and exit status flow back unchanged.

use std::collections::VecDeque;

use anyhow::{bail, Result};
use async_trait::async_trait;
use russh::server::Handle;
use russh::{ChannelId, ChannelMsg};
use tokio::sync::mpsc;
use tracing::debug;

use crate::request::{route_to_target, ChannelRequest, Routed};

/// Traffic from the sandbox side of a relayed channel.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    Request(ChannelRequest),
    Data(Vec<u8>),
    Eof,
}

/// The channel towards the target host.
#[async_trait]
pub trait Upstream: Send {
    /// Send a request. Returns whether the target will answer it.
    async fn request(&mut self, request: ChannelRequest) -> Result<bool>;
    async fn data(&mut self, data: &[u8]) -> Result<()>;
    async fn eof(&mut self) -> Result<()>;
    async fn close(&mut self) -> Result<()>;
    async fn wait(&mut self) -> Option<ChannelMsg>;
}

/// The channel towards the sandbox. Methods return `false` once it is gone.
#[async_trait]
pub trait Downstream: Send + Sync {
    async fn reply(&self, success: bool) -> bool;
    async fn deliver(&self, msg: ChannelMsg) -> bool;
    async fn close(&self);
}

#[async_trait]
impl Upstream for russh::Channel<russh::client::Msg> {
    async fn request(&mut self, request: ChannelRequest) -> Result<bool> {
        match request {
            ChannelRequest::Pty(pty) => {
                self.request_pty(
                    true,
                    &pty.term,
                    pty.cols,
                    pty.rows,
                    pty.pix_width,
                    pty.pix_height,
                    &pty.modes,
                )
                .await?;
                Ok(true)
            }
            ChannelRequest::Env { name, value } => {
                self.set_env(true, name, value).await?;
                Ok(true)
            }
            ChannelRequest::WindowChange {
                cols,
                rows,
                pix_width,
                pix_height,
            } => {
                self.window_change(cols, rows, pix_width, pix_height).await?;
                Ok(false)
            }
            ChannelRequest::Shell => {
                self.request_shell(true).await?;
                Ok(true)
            }
            ChannelRequest::Exec { command } => {
                self.exec(true, command).await?;
                Ok(true)
            }
            ChannelRequest::Subsystem { name } => {
                self.request_subsystem(true, &name).await?;
                Ok(true)
            }
            ChannelRequest::Signal(sig) => {
                self.signal(sig).await?;
                Ok(false)
            }
            ChannelRequest::X11 => bail!("x11 forwarding cannot be relayed"),
        }
    }

    async fn data(&mut self, data: &[u8]) -> Result<()> {
        russh::Channel::data(self, data).await?;
        Ok(())
    }

    async fn eof(&mut self) -> Result<()> {
        russh::Channel::eof(self).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        russh::Channel::close(self).await?;
        Ok(())
    }

    async fn wait(&mut self) -> Option<ChannelMsg> {
        russh::Channel::wait(self).await
    }
}

/// A channel of an inbound server session.
pub struct ServerChannel {
    pub handle: Handle,
    pub id: ChannelId,
}

#[async_trait]
impl Downstream for ServerChannel {
    async fn reply(&self, success: bool) -> bool {
        if success {
            self.handle.channel_success(self.id).await.is_ok()
        } else {
            self.handle.channel_failure(self.id).await.is_ok()
        }
    }

    async fn deliver(&self, msg: ChannelMsg) -> bool {
        match msg {
            ChannelMsg::Data { data } => self.handle.data(self.id, data).await.is_ok(),
            ChannelMsg::ExtendedData { data, ext } => {
                self.handle.extended_data(self.id, ext, data).await.is_ok()
            }
            ChannelMsg::ExitStatus { exit_status } => self
                .handle
                .exit_status_request(self.id, exit_status)
                .await
                .is_ok(),
            ChannelMsg::ExitSignal {
                signal_name,
                core_dumped,
                error_message,
                lang_tag,
            } => self
                .handle
                .exit_signal_request(self.id, signal_name, core_dumped, error_message, lang_tag)
                .await
                .is_ok(),
            ChannelMsg::Eof => self.handle.eof(self.id).await.is_ok(),
            ChannelMsg::Success => self.reply(true).await,
            ChannelMsg::Failure => self.reply(false).await,
            _ => true,
        }
    }

    async fn close(&self) {
        let _ = self.handle.close(self.id).await;
    }
}

/// A reply owed to the sandbox, in request order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingReply {
    /// Answered when the target replies.
    Target,
    /// Rejected locally; sent once every earlier reply is out.
    Reject,
}

/// Channel replies must go out in request order, so local rejections wait
/// behind any reply still owed by the target.
#[derive(Debug, Default)]
struct ReplyQueue {
    pending: VecDeque<PendingReply>,
}

impl ReplyQueue {
    fn expect_target(&mut self) {
        self.pending.push_back(PendingReply::Target);
    }

    /// Returns `false` once the sandbox side is gone.
    async fn reject<D: Downstream>(&mut self, downstream: &D) -> bool {
        if self.pending.is_empty() {
            downstream.reply(false).await
        } else {
            self.pending.push_back(PendingReply::Reject);
            true
        }
    }

    /// Pass on a target reply, then any rejections queued behind it.
    async fn target_replied<D: Downstream>(&mut self, downstream: &D, success: bool) -> bool {
        if self.pending.front() == Some(&PendingReply::Target) {
            self.pending.pop_front();
        }
        if !downstream.reply(success).await {
            return false;
        }
        while self.pending.front() == Some(&PendingReply::Reject) {
            self.pending.pop_front();
            if !downstream.reply(false).await {
                return false;
            }
        }
        true
    }
}

/// Relay one channel until either side closes it.
///
/// `user` is the account commands run as on the target.
pub async fn relay<U, D>(
    mut upstream: U,
    downstream: D,
    user: String,
    mut events: mpsc::UnboundedReceiver<RelayEvent>,
) where
    U: Upstream,
    D: Downstream,
{
    let mut replies = ReplyQueue::default();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(RelayEvent::Request(request)) => {
                    let kind = request.kind();
                    // one-way requests get no reply
                    let one_way = matches!(kind, "window-change" | "signal");
                    let answered = match route_to_target(request, &user) {
                        Routed::Forward(request) => match upstream.request(request).await {
                            Ok(expects_reply) => expects_reply,
                            Err(e) => {
                                debug!("Failed to forward {}: {:#}", kind, e);
                                false
                            }
                        },
                        Routed::Reject => {
                            debug!("Rejecting {} on relayed channel", kind);
                            false
                        }
                    };
                    if answered {
                        replies.expect_target();
                    } else if !one_way && !replies.reject(&downstream).await {
                        break;
                    }
                }
                Some(RelayEvent::Data(data)) => {
                    if let Err(e) = upstream.data(&data).await {
                        debug!("Target write failed: {:#}", e);
                        break;
                    }
                }
                Some(RelayEvent::Eof) => {
                    if let Err(e) = upstream.eof().await {
                        debug!("Failed to send eof to target: {:#}", e);
                    }
                }
                None => {
                    // sandbox side closed
                    let _ = upstream.close().await;
                    return;
                }
            },
            msg = upstream.wait() => match msg {
                Some(ChannelMsg::Close) | None => break,
                Some(msg) => {
                    let delivered = match msg {
                        ChannelMsg::Success => replies.target_replied(&downstream, true).await,
                        ChannelMsg::Failure => replies.target_replied(&downstream, false).await,
                        msg => downstream.deliver(msg).await,
                    };
                    if !delivered {
                        let _ = upstream.close().await;
                        return;
                    }
                }
            },
        }
    }

    downstream.close().await;
    let _ = upstream.close().await;
}
