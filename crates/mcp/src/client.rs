//! Lifecycle management for a connected server.
//!
//! A [`Client`] is the process, its pipes and the session acquired as one
//! unit. If any step of startup fails, what was already acquired is released
//! before the error is returned.

use tracing::{debug, info, warn};

use crate::error::Result;
use crate::protocol::{ClientInfo, InitializeResult, Tool};
use crate::session::Session;
use crate::transport::{ServerConfig, StdioTransport};

/// A running, initialized server.
pub struct Client {
    config: ServerConfig,
    session: Session,
    info: InitializeResult,
}

impl Client {
    /// Spawn the server, perform the handshake and fetch its tools.
    pub async fn connect(config: ServerConfig, client_info: ClientInfo) -> Result<Self> {
        let transport = StdioTransport::spawn(&config)?;
        let session = Session::with_timeout(transport, config.request_timeout);

        match Self::handshake(&session, client_info).await {
            Ok(info) => {
                info!(
                    server = %config.name,
                    name = %info.server_info.name,
                    "connected to server"
                );
                Ok(Self {
                    config,
                    session,
                    info,
                })
            }
            Err(e) => {
                if let Err(close_err) = session.close().await {
                    warn!(server = %config.name, error = %close_err, "cleanup after failed connect");
                }
                Err(e)
            }
        }
    }

    async fn handshake(session: &Session, client_info: ClientInfo) -> Result<InitializeResult> {
        let info = session.initialize(client_info).await?;
        let tools = session.list_tools().await?;
        debug!(count = tools.len(), "listed tools");
        Ok(info)
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn server_info(&self) -> &InitializeResult {
        &self.info
    }

    /// Tools listed at connect time (or by the latest `list_tools`).
    pub async fn tools(&self) -> Vec<Tool> {
        self.session.tools().await
    }

    /// Close the session and stop the server process.
    pub async fn shutdown(self) -> Result<()> {
        debug!(server = %self.config.name, "shutting down");
        self.session.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn info() -> ClientInfo {
        ClientInfo::new("skiff-test", "0.0.0")
    }

    #[tokio::test]
    async fn spawn_failure_is_surfaced() {
        let config = ServerConfig::new("missing", "/nonexistent/skiff-server");
        let err = Client::connect(config, info()).await.err().unwrap();
        assert!(matches!(err, Error::Spawn { .. }));
    }

    #[tokio::test]
    async fn server_that_exits_fails_connect() {
        let config = ServerConfig::new("quitter", "sh").args(["-c", "exit 0"]);
        let err = Client::connect(config, info()).await.err().unwrap();
        assert!(err.is_connection_error(), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn garbage_speaking_server_times_out_and_is_released() {
        let pid_file = std::env::temp_dir().join(format!("skiff-noisy-{}.pid", std::process::id()));
        let mut config = ServerConfig::new("noisy", "sh").args([
            "-c",
            "echo $$ > \"$1\"; while read line; do echo 'not a protocol message'; done",
            "sh",
            pid_file.to_str().unwrap(),
        ]);
        config.request_timeout = Some(std::time::Duration::from_millis(200));

        let err = Client::connect(config, info()).await.err().unwrap();
        assert!(matches!(err, Error::Timeout));

        let pid = std::fs::read_to_string(&pid_file).unwrap();
        std::fs::remove_file(&pid_file).unwrap();
        let alive = std::process::Command::new("kill")
            .args(["-0", pid.trim()])
            .stderr(std::process::Stdio::null())
            .status()
            .unwrap()
            .success();
        assert!(!alive, "server process {} still running", pid.trim());
    }
}
