//! Connection authorization.
//!
//! A connection is either Stage-1 (a user reaching their sandbox) or Stage-2
//! (a sandbox reaching a target host through the gateway). The stage is
//! decided once, at public-key authentication, from where the connection
//! comes from, the login name and the origin of the presented key.

use std::net::IpAddr;

use crate::directory::{Directory, KeySource};
use crate::error::GatewayError;
use crate::keys::{normalize_address, parse_target_login};

/// Target of a Stage-2 connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Account to act as on the target.
    pub user: String,
    pub hostname: String,
    /// `host:port` to dial.
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Stage-1: sessions run in the account's sandbox.
    Sandbox,
    /// Stage-2: sessions are relayed to a target host.
    Target(Target),
}

/// The authenticated principal of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub account: String,
    pub fingerprint: String,
    pub route: Route,
}

impl Identity {
    pub fn stage(&self) -> &'static str {
        match self.route {
            Route::Sandbox => "sandbox",
            Route::Target(_) => "target",
        }
    }
}

/// Whether a connection arriving on `local_ip` came in through the sandbox
/// egress address.
pub fn is_from_sandbox(local_ip: IpAddr, egress: IpAddr) -> bool {
    local_ip.to_canonical() == egress.to_canonical()
}

/// Authorize a public-key login.
///
/// `local_ip` is the gateway-side address of the connection. Touching the
/// key and user is best-effort.
pub async fn authorize(
    directory: &Directory,
    local_ip: IpAddr,
    egress: IpAddr,
    login: &str,
    fingerprint: &str,
) -> Result<Identity, GatewayError> {
    let key = directory
        .keys
        .get_key(fingerprint)
        .await
        .map_err(GatewayError::Infrastructure)?
        .ok_or_else(|| GatewayError::denied(format!("unknown key {}", fingerprint)))?;

    if let Err(e) = directory.keys.touch_key(fingerprint).await {
        tracing::warn!("Failed to touch key {}: {:#}", fingerprint, e);
    }

    let user = directory
        .users
        .get_user(&key.account)
        .await
        .map_err(GatewayError::Infrastructure)?
        .ok_or_else(|| GatewayError::denied(format!("unknown account {}", key.account)))?;

    if user.blocked {
        return Err(GatewayError::denied(format!("account {} is blocked", user.account)));
    }

    if let Err(e) = directory.users.touch_user(&user.account).await {
        tracing::warn!("Failed to touch user {}: {:#}", user.account, e);
    }

    let target_login = parse_target_login(login);
    let route = match target_login {
        Some((target_user, hostname))
            if is_from_sandbox(local_ip, egress) && key.source == KeySource::Sandbox =>
        {
            let node = directory
                .nodes
                .get_node(&hostname)
                .await
                .map_err(GatewayError::Infrastructure)?
                .ok_or_else(|| GatewayError::denied(format!("unknown node {}", hostname)))?;

            let granted = directory
                .grants
                .check_grant(&user.account, &target_user, &hostname)
                .await
                .map_err(GatewayError::Infrastructure)?;
            if !granted {
                return Err(GatewayError::denied(format!(
                    "{} has no grant for {}@{}",
                    user.account, target_user, hostname
                )));
            }

            Route::Target(Target {
                user: target_user,
                hostname,
                address: normalize_address(&node.address),
            })
        }
        _ => {
            // sandbox keys only ever authenticate Stage-2 connections
            if key.source == KeySource::Sandbox {
                return Err(GatewayError::denied(format!(
                    "sandbox key {} used outside the sandbox",
                    fingerprint
                )));
            }
            Route::Sandbox
        }
    };

    Ok(Identity {
        account: user.account,
        fingerprint: fingerprint.to_string(),
        route,
    })
}
