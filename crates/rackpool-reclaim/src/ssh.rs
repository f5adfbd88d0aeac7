//! A thin SSH session wrapper for reclamation workers.
//!
//! The workers need exactly four things from SSH: run a command and read its
//! output, stream a byte payload to a remote path, fire a command that keeps
//! running after the session is gone, and disconnect. Host keys are accepted
//! blindly; the pool talks to machines it is about to wipe, on a network it
//! owns.

use std::sync::Arc;
use std::time::Duration;

use russh::client::{self, Handle};
use russh::{ChannelMsg, Disconnect};
use tracing::error;

use crate::error::{ReclaimError, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

struct AcceptingClient;

impl client::Handler for AcceptingClient {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

/// One authenticated session against a host being reclaimed.
pub struct SshSession {
    handle: Handle<AcceptingClient>,
}

impl SshSession {
    /// Connects and authenticates with a password.
    pub async fn connect(
        hostname: &str,
        port: u16,
        username: &str,
        password: &str,
    ) -> Result<Self> {
        let config = Arc::new(client::Config::default());
        let connecting = client::connect(config, (hostname, port), AcceptingClient);
        let mut handle = tokio::time::timeout(CONNECT_TIMEOUT, connecting)
            .await
            .map_err(|_| ReclaimError::ConnectTimeout(hostname.to_string()))??;
        let auth = handle.authenticate_password(username, password).await?;
        if !auth.success() {
            return Err(ReclaimError::AuthenticationRejected);
        }
        Ok(Self { handle })
    }

    /// Runs a command, returning its stdout and exit status.
    pub async fn output(&self, command: &str) -> Result<(String, u32)> {
        let mut channel = self.handle.channel_open_session().await?;
        channel.exec(true, command).await?;
        let mut stdout = Vec::new();
        let mut status = 0u32;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
                ChannelMsg::ExitStatus { exit_status } => status = exit_status,
                _ => {}
            }
        }
        Ok((String::from_utf8_lossy(&stdout).into_owned(), status))
    }

    /// Runs a command and requires it to exit cleanly.
    pub async fn run(&self, command: &str) -> Result<u32> {
        let (_, status) = self.output(command).await?;
        Ok(status)
    }

    /// Streams `data` into `remote_path` through `cat`.
    pub async fn upload(&self, remote_path: &str, data: &[u8]) -> Result<()> {
        let command = format!("cat > {remote_path}");
        let mut channel = self.handle.channel_open_session().await?;
        channel.exec(true, command.as_str()).await?;
        channel.data(data).await?;
        channel.eof().await?;
        let mut status = 0u32;
        while let Some(msg) = channel.wait().await {
            if let ChannelMsg::ExitStatus { exit_status } = msg {
                status = exit_status;
            }
        }
        if status != 0 {
            return Err(ReclaimError::CommandFailed { command, status });
        }
        Ok(())
    }

    /// Fires a command that must survive this session's teardown.
    pub async fn run_detached(&self, command: &str) -> Result<()> {
        let wrapped = format!("nohup sh -c '{command}' >/dev/null 2>&1 &");
        let status = self.run(&wrapped).await?;
        if status != 0 {
            return Err(ReclaimError::CommandFailed {
                command: wrapped,
                status,
            });
        }
        Ok(())
    }

    /// Disconnects; a failure here is only worth a log line.
    pub async fn close(self, host: &str) {
        if let Err(err) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
        {
            error!(%host, error = %err, "unable to close ssh connection");
        }
    }
}
