//! Gateway error taxonomy.
//!
//! Internal plumbing uses `anyhow`; these variants mark how a failure is
//! surfaced to the connecting client. Wrapped `anyhow` chains are rendered
//! inline, so the variants carry no separate source.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Authentication or authorization refused. The client only ever sees a
    /// generic rejection; the reason is logged.
    #[error("authentication denied: {0}")]
    AuthDenied(String),

    /// A single channel was refused. The connection stays up.
    #[error("channel rejected: {0}")]
    ChannelRejected(String),

    /// The sandboxed command failed. Reported through `exit-status`.
    #[error("execution failed: {0:#}")]
    Execution(anyhow::Error),

    /// A dependency of the gateway (container runtime, target host, replay
    /// storage, directory) failed.
    #[error("infrastructure error: {0:#}")]
    Infrastructure(anyhow::Error),
}

impl GatewayError {
    pub fn denied(reason: impl Into<String>) -> Self {
        Self::AuthDenied(reason.into())
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::ChannelRejected(reason.into())
    }

    /// Generic message safe to show to a client.
    pub fn client_message(&self) -> &'static str {
        match self {
            Self::AuthDenied(_) => "permission denied",
            Self::ChannelRejected(_) => "channel rejected",
            Self::Execution(_) => "execution failed",
            Self::Infrastructure(_) => "internal error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_hides_detail() {
        let err = GatewayError::denied("key SHA256:abc not found");
        assert_eq!(err.client_message(), "permission denied");
        assert!(err.to_string().contains("SHA256:abc"));

        let err = GatewayError::Infrastructure(anyhow::anyhow!("docker unreachable"));
        assert_eq!(err.client_message(), "internal error");
    }

    #[test]
    fn test_cause_rendered_once() {
        let cause = anyhow::anyhow!("connection refused").context("Failed to start exec");
        let err = GatewayError::Execution(cause);
        assert_eq!(
            err.to_string(),
            "execution failed: Failed to start exec: connection refused"
        );
        assert!(std::error::Error::source(&err).is_none());

        let wrapped = format!("{:#}", anyhow::Error::new(err));
        assert_eq!(wrapped.matches("connection refused").count(), 1);
    }
}
