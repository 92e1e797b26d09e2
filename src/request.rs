//! Channel-local SSH requests.
//!
//! The russh handler callbacks are turned into [`ChannelRequest`] values and
//! queued per channel, so each session channel can run its own event loop.

use russh::{Pty, Sig};

/// Terminal dimensions in characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    pub cols: u32,
    pub rows: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PtyRequest {
    pub term: String,
    pub cols: u32,
    pub rows: u32,
    pub pix_width: u32,
    pub pix_height: u32,
    pub modes: Vec<(Pty, u32)>,
}

/// One request received on a channel (`pty-req`, `env`, `exec`, ...).
#[derive(Debug, Clone)]
pub enum ChannelRequest {
    Pty(PtyRequest),
    Env {
        name: String,
        value: String,
    },
    WindowChange {
        cols: u32,
        rows: u32,
        pix_width: u32,
        pix_height: u32,
    },
    Shell,
    Exec {
        command: String,
    },
    Subsystem {
        name: String,
    },
    X11,
    Signal(Sig),
}

impl ChannelRequest {
    /// SSH request type name, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ChannelRequest::Pty(_) => "pty-req",
            ChannelRequest::Env { .. } => "env",
            ChannelRequest::WindowChange { .. } => "window-change",
            ChannelRequest::Shell => "shell",
            ChannelRequest::Exec { .. } => "exec",
            ChannelRequest::Subsystem { .. } => "subsystem",
            ChannelRequest::X11 => "x11-req",
            ChannelRequest::Signal(_) => "signal",
        }
    }
}

// `Sig` has no `PartialEq`; signals compare by name.
impl PartialEq for ChannelRequest {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Pty(a), Self::Pty(b)) => a == b,
            (Self::Env { name: n1, value: v1 }, Self::Env { name: n2, value: v2 }) => n1 == n2 && v1 == v2,
            (
                Self::WindowChange {
                    cols: c1,
                    rows: r1,
                    pix_width: w1,
                    pix_height: h1,
                },
                Self::WindowChange {
                    cols: c2,
                    rows: r2,
                    pix_width: w2,
                    pix_height: h2,
                },
            ) => (c1, r1, w1, h1) == (c2, r2, w2, h2),
            (Self::Shell, Self::Shell) | (Self::X11, Self::X11) => true,
            (Self::Exec { command: a }, Self::Exec { command: b }) => a == b,
            (Self::Subsystem { name: a }, Self::Subsystem { name: b }) => a == b,
            (Self::Signal(a), Self::Signal(b)) => format!("{:?}", a) == format!("{:?}", b),
            _ => false,
        }
    }
}

/// Whether a session running `argv` should be recorded.
///
/// `scp` transfers are binary and not replayable; everything else,
/// including an interactive shell (empty argv), is recorded.
pub fn should_record(argv: &[String]) -> bool {
    match argv.first() {
        Some(first) => first.trim().to_lowercase() != "scp",
        None => true,
    }
}

/// Wrap `command` so it runs as `user` on the target through
/// non-interactive sudo. An empty command gives a login shell.
pub fn switch_user(user: &str, command: &str) -> String {
    if command.is_empty() {
        shell_words::join(["sudo", "-S", "-n", "-u", user, "-i"])
    } else {
        shell_words::join(["sudo", "-S", "-n", "-u", user, "-i", "--", "bash", "-c", command])
    }
}

/// What the target-side relay does with a request from the sandbox user.
#[derive(Debug, Clone, PartialEq)]
pub enum Routed {
    Forward(ChannelRequest),
    Reject,
}

/// Rewrite a request travelling from the sandbox towards the target host.
///
/// Commands are executed as `user`; a shell becomes an elevated login shell.
/// X11 forwarding and subsystems never reach the target.
pub fn route_to_target(request: ChannelRequest, user: &str) -> Routed {
    match request {
        ChannelRequest::Exec { command } => Routed::Forward(ChannelRequest::Exec {
            command: switch_user(user, &command),
        }),
        ChannelRequest::Shell => Routed::Forward(ChannelRequest::Exec {
            command: switch_user(user, ""),
        }),
        ChannelRequest::X11 | ChannelRequest::Subsystem { .. } => Routed::Reject,
        other => Routed::Forward(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(s: &str) -> Vec<String> {
        shell_words::split(s).unwrap()
    }

    #[test]
    fn test_should_record() {
        assert!(should_record(&[]));
        assert!(should_record(&argv("ls -la")));
        assert!(should_record(&argv("vim 'my file'")));
        assert!(!should_record(&argv("scp -t /tmp")));
        assert!(!should_record(&argv("SCP -f foo")));
        assert!(should_record(&argv("scpx")));
    }

    #[test]
    fn test_switch_user() {
        assert_eq!(switch_user("deploy", ""), "sudo -S -n -u deploy -i");
        assert_eq!(
            switch_user("deploy", "ls -la /srv"),
            "sudo -S -n -u deploy -i -- bash -c 'ls -la /srv'"
        );

        let wrapped = switch_user("root", "echo 'a b'; id");
        let parts = shell_words::split(&wrapped).unwrap();
        assert_eq!(parts.last().map(String::as_str), Some("echo 'a b'; id"));
        assert_eq!(parts[..4], ["sudo", "-S", "-n", "-u"]);
    }

    #[test]
    fn test_route_to_target() {
        assert_eq!(
            route_to_target(ChannelRequest::Shell, "root"),
            Routed::Forward(ChannelRequest::Exec {
                command: "sudo -S -n -u root -i".to_string()
            })
        );
        assert_eq!(
            route_to_target(
                ChannelRequest::Exec {
                    command: "uptime".to_string()
                },
                "app"
            ),
            Routed::Forward(ChannelRequest::Exec {
                command: "sudo -S -n -u app -i -- bash -c uptime".to_string()
            })
        );
        assert_eq!(route_to_target(ChannelRequest::X11, "root"), Routed::Reject);
        assert_eq!(
            route_to_target(
                ChannelRequest::Subsystem {
                    name: "sftp".to_string()
                },
                "root"
            ),
            Routed::Reject
        );

        let env = ChannelRequest::Env {
            name: "LANG".to_string(),
            value: "C.UTF-8".to_string(),
        };
        assert_eq!(route_to_target(env.clone(), "root"), Routed::Forward(env));
    }

    #[test]
    fn test_signals_compare_by_name() {
        assert_eq!(ChannelRequest::Signal(Sig::TERM), ChannelRequest::Signal(Sig::TERM));
        assert_ne!(ChannelRequest::Signal(Sig::TERM), ChannelRequest::Signal(Sig::KILL));
        assert_eq!(
            route_to_target(ChannelRequest::Signal(Sig::INT), "root"),
            Routed::Forward(ChannelRequest::Signal(Sig::INT))
        );
        assert_ne!(ChannelRequest::Shell, ChannelRequest::X11);
    }
}
