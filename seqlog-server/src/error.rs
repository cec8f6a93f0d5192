//! Startup failures and the exit codes reported to the supervisor

use std::net::SocketAddr;

use seqlog_core::SeqLogError;
use thiserror::Error;

/// Why the service could not start (or stopped abnormally)
#[derive(Error, Debug)]
pub enum StartupError {
    #[error("Configuration error: {0}")]
    Config(#[source] SeqLogError),

    #[error("Cannot create shared channel: {0}")]
    Channel(#[source] SeqLogError),

    #[error("Cannot open log output directory: {0}")]
    OutputDir(#[source] SeqLogError),

    #[error("Cannot bind web server to {addr}: {source}")]
    WebServer {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Service failure: {0}")]
    Service(#[source] SeqLogError),

    #[error("Web server failure: {0}")]
    Serve(#[source] std::io::Error),
}

impl StartupError {
    /// Process exit code; 0 is reserved for a clean start and stop
    pub fn exit_code(&self) -> u8 {
        match self {
            StartupError::Config(_) => 2,
            StartupError::Channel(_) => 3,
            StartupError::OutputDir(_) => 4,
            StartupError::WebServer { .. } => 5,
            StartupError::Service(_) | StartupError::Serve(_) => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        let config = StartupError::Config(SeqLogError::config("bad"));
        assert_eq!(config.exit_code(), 2);

        let channel = StartupError::Channel(SeqLogError::ChannelLayout {
            reason: "magic".to_string(),
        });
        assert_eq!(channel.exit_code(), 3);

        let output = StartupError::OutputDir(SeqLogError::Io(std::io::Error::other("denied")));
        assert_eq!(output.exit_code(), 4);

        let bind = StartupError::WebServer {
            addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            source: std::io::Error::other("in use"),
        };
        assert_eq!(bind.exit_code(), 5);
        assert!(bind.to_string().contains("0.0.0.0:8080"));
    }
}
