//! IPC client
//!
//! One Unix socket connection per request, matching how the server closes
//! a connection after `shutdown`.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use super::protocol::{
    decode_message, encode_message, IpcCommand, IpcResponse, NatEntry, PeerClaim, ServerStatus,
    LENGTH_PREFIX_SIZE, MAX_MESSAGE_SIZE,
};
use crate::connection::StatsSnapshot;
use crate::error::IpcError;
use crate::overlay::PeerId;
use crate::stack::Route;

/// IPC client for sending commands to the server
#[derive(Debug, Clone)]
pub struct IpcClient {
    socket_path: PathBuf,
}

impl IpcClient {
    /// Create a new IPC client
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
        }
    }

    /// Socket this client connects to
    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Send a command and receive a response
    ///
    /// # Errors
    ///
    /// Returns `IpcError` if the server is unreachable or answers with a
    /// malformed frame. Error responses are returned as `Ok`.
    pub async fn send(&self, command: IpcCommand) -> Result<IpcResponse, IpcError> {
        let mut stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|e| IpcError::ConnectionError(e.to_string()))?;

        let encoded =
            encode_message(&command).map_err(|e| IpcError::serialization(e.to_string()))?;
        stream.write_all(&encoded).await?;
        stream.flush().await?;

        let mut len_buf = [0u8; LENGTH_PREFIX_SIZE];
        stream.read_exact(&mut len_buf).await?;
        let msg_len = u32::from_be_bytes(len_buf) as usize;

        if msg_len > MAX_MESSAGE_SIZE {
            return Err(IpcError::protocol(format!(
                "Response too large: {msg_len} bytes"
            )));
        }

        let mut msg_buf = vec![0u8; msg_len];
        stream.read_exact(&mut msg_buf).await?;

        decode_message(&msg_buf).map_err(|e| IpcError::protocol(e.to_string()))
    }

    /// Send a ping command
    pub async fn ping(&self) -> Result<bool, IpcError> {
        let response = self.send(IpcCommand::Ping).await?;
        Ok(matches!(response, IpcResponse::Pong))
    }

    /// Fetch server status
    pub async fn status(&self) -> Result<ServerStatus, IpcError> {
        match self.send(IpcCommand::Status).await? {
            IpcResponse::Status(status) => Ok(status),
            other => Err(unexpected(other)),
        }
    }

    /// Fetch forwarder statistics
    pub async fn stats(&self) -> Result<StatsSnapshot, IpcError> {
        match self.send(IpcCommand::GetStats).await? {
            IpcResponse::Stats(stats) => Ok(stats),
            other => Err(unexpected(other)),
        }
    }

    pub async fn nat_set(&self, address: IpAddr, translated: IpAddr) -> Result<(), IpcError> {
        expect_success(
            self.send(IpcCommand::NatSet {
                address,
                translated,
            })
            .await?,
        )
    }

    pub async fn nat_delete(&self, address: IpAddr) -> Result<(), IpcError> {
        expect_success(self.send(IpcCommand::NatDelete { address }).await?)
    }

    pub async fn nat_list(&self) -> Result<Vec<NatEntry>, IpcError> {
        match self.send(IpcCommand::NatList).await? {
            IpcResponse::NatList { entries } => Ok(entries),
            other => Err(unexpected(other)),
        }
    }

    pub async fn peer_claim(&self, address: IpAddr, peer_id: PeerId) -> Result<(), IpcError> {
        expect_success(self.send(IpcCommand::PeerClaim { address, peer_id }).await?)
    }

    pub async fn peer_release(&self, address: IpAddr) -> Result<(), IpcError> {
        expect_success(self.send(IpcCommand::PeerRelease { address }).await?)
    }

    pub async fn peer_list(&self) -> Result<Vec<PeerClaim>, IpcError> {
        match self.send(IpcCommand::PeerList).await? {
            IpcResponse::PeerList { claims } => Ok(claims),
            other => Err(unexpected(other)),
        }
    }

    pub async fn route_table(&self) -> Result<Vec<Route>, IpcError> {
        match self.send(IpcCommand::RouteTable).await? {
            IpcResponse::RouteTable { routes } => Ok(routes),
            other => Err(unexpected(other)),
        }
    }

    /// Ask the server to shut down gracefully
    pub async fn shutdown(&self) -> Result<(), IpcError> {
        expect_success(self.send(IpcCommand::Shutdown).await?)
    }
}

fn expect_success(response: IpcResponse) -> Result<(), IpcError> {
    match response {
        IpcResponse::Success { .. } => Ok(()),
        other => Err(unexpected(other)),
    }
}

fn unexpected(response: IpcResponse) -> IpcError {
    match response {
        IpcResponse::Error(info) => IpcError::protocol(info.to_string()),
        other => IpcError::protocol(format!("unexpected response: {other:?}")),
    }
}
