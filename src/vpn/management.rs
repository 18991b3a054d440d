//! OpenVPN management socket client
//!
//! The peer greets every connection with a banner that must be drained
//! before the first command. Requests are space-joined tokens ending in
//! CR-LF; a response is complete once the buffered data ends in CR-LF.
//! Every read is bounded by [`READ_TIMEOUT`], and the stream is closed when
//! the client is dropped, so no exit path leaves the socket open.

use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::time::timeout;
use tracing::{debug, error};

use crate::error::{GateError, GateResult};

pub const TERMINATOR: &str = "\r\n";
pub const READ_TIMEOUT: Duration = Duration::from_secs(1);

const CHUNK_SIZE: usize = 1024;

pub struct ManagementClient {
    stream: UnixStream,
}

impl ManagementClient {
    /// Connect and drain the welcome banner
    pub async fn connect(path: &Path) -> GateResult<Self> {
        let stream = match timeout(READ_TIMEOUT, UnixStream::connect(path)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                error!("Failed to open management socket {:?}: {}", path, e);
                return Err(GateError::ControlSocket(format!(
                    "failed to open management socket {:?}: {}",
                    path, e
                )));
            }
            Err(_) => {
                return Err(GateError::Timeout(format!("connecting to management socket {:?}", path)));
            }
        };

        let mut client = Self { stream };
        let banner = client.read_response().await?;
        debug!("Management banner: {}", banner.trim_end());
        Ok(client)
    }

    /// Send one command and return the raw response
    pub async fn run<S: AsRef<str>>(&mut self, tokens: &[S]) -> GateResult<String> {
        let line: Vec<&str> = tokens.iter().map(|t| t.as_ref()).collect();
        self.send(&line.join(" ")).await?;
        self.read_response().await
    }

    /// Send `quit` and close the connection
    pub async fn quit(mut self) -> GateResult<()> {
        self.send("quit").await?;
        self.stream.shutdown().await?;
        Ok(())
    }

    async fn send(&mut self, command: &str) -> GateResult<()> {
        debug!("Management command: {}", command);
        let mut data = String::with_capacity(command.len() + TERMINATOR.len());
        data.push_str(command);
        data.push_str(TERMINATOR);
        self.stream
            .write_all(data.as_bytes())
            .await
            .map_err(|e| GateError::ControlSocket(format!("write failed: {}", e)))
    }

    async fn read_response(&mut self) -> GateResult<String> {
        let mut data = Vec::new();
        let mut chunk = [0u8; CHUNK_SIZE];

        loop {
            let n = match timeout(READ_TIMEOUT, self.stream.read(&mut chunk)).await {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(GateError::ControlSocket(format!("read failed: {}", e))),
                Err(_) => return Err(GateError::Timeout("waiting for management response".to_string())),
            };

            if n == 0 {
                return Err(GateError::ControlSocket("connection closed by peer".to_string()));
            }

            data.extend_from_slice(&chunk[..n]);
            if data.ends_with(TERMINATOR.as_bytes()) {
                return Ok(String::from_utf8_lossy(&data).to_string());
            }
        }
    }
}

/// Open a connection, run one command, always quit
pub async fn send_command<S: AsRef<str>>(path: &Path, tokens: &[S]) -> GateResult<String> {
    let mut client = ManagementClient::connect(path).await?;
    let response = client.run(tokens).await;
    if let Err(e) = client.quit().await {
        debug!("Management quit failed: {}", e);
    }
    response
}

/// Force-disconnect a session by common name
pub async fn kill_client(path: &Path, common_name: &str) -> GateResult<String> {
    send_command(path, &["kill", common_name]).await
}
