//! Control socket server
//!
//! Accepts operator clients on a Unix socket and answers length-prefixed
//! JSON commands through [`IpcHandler`]. Each client gets its own task.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::handler::IpcHandler;
use super::protocol::{
    decode_message, encode_message, ErrorCode, IpcCommand, IpcResponse, LENGTH_PREFIX_SIZE,
};
use crate::config::IpcConfig;
use crate::error::IpcError;

/// IPC server for handling control commands
pub struct IpcServer {
    /// Configuration
    config: IpcConfig,

    /// Command handler
    handler: Arc<IpcHandler>,

    /// Shutdown signal sender
    shutdown_tx: broadcast::Sender<()>,
}

impl IpcServer {
    /// Create a new IPC server
    pub fn new(config: IpcConfig, handler: Arc<IpcHandler>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            handler,
            shutdown_tx,
        }
    }

    /// Bind the Unix socket, replacing a stale socket file.
    ///
    /// # Errors
    ///
    /// Returns `IpcError::SocketCreation` if the socket file or its directory
    /// cannot be prepared, and `IpcError::BindError` if binding fails.
    pub fn bind(&self) -> Result<UnixListener, IpcError> {
        let socket_path = &self.config.socket_path;

        // Remove existing socket file if it exists
        if socket_path.exists() {
            std::fs::remove_file(socket_path).map_err(|e| IpcError::SocketCreation {
                path: socket_path.display().to_string(),
                reason: format!("Failed to remove existing socket: {e}"),
            })?;
        }

        // Create parent directory if needed
        if let Some(parent) = socket_path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| IpcError::SocketCreation {
                    path: socket_path.display().to_string(),
                    reason: format!("Failed to create parent directory: {e}"),
                })?;
            }
        }

        let listener = UnixListener::bind(socket_path).map_err(|e| IpcError::BindError {
            path: socket_path.display().to_string(),
            reason: e.to_string(),
        })?;

        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(self.config.socket_mode);
            std::fs::set_permissions(socket_path, permissions).map_err(|e| {
                IpcError::SocketCreation {
                    path: socket_path.display().to_string(),
                    reason: format!("Failed to set permissions: {e}"),
                }
            })?;
        }

        info!(path = %socket_path.display(), "control socket listening");
        Ok(listener)
    }

    /// Run the IPC server
    ///
    /// Binds the socket and serves clients until `shutdown` is called.
    ///
    /// # Errors
    ///
    /// Returns `IpcError` if the socket cannot be bound.
    pub async fn run(&self) -> Result<(), IpcError> {
        if !self.config.enabled {
            info!("control socket disabled");
            return Ok(());
        }

        let listener = self.bind()?;
        self.serve(listener).await;
        Ok(())
    }

    /// Serve clients on an already-bound listener until shutdown
    pub async fn serve(&self, listener: UnixListener) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => {
                            let handler = Arc::clone(&self.handler);
                            let max_size = self.config.max_message_size;

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, handler, max_size).await {
                                    debug!(error = %e, "control connection ended with error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "control socket accept failed");
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("control socket shutting down");
                    break;
                }
            }
        }

        // Cleanup socket file
        if self.config.socket_path.exists() {
            let _ = std::fs::remove_file(&self.config.socket_path);
        }
    }

    /// Get a shutdown signal sender
    #[must_use]
    pub fn shutdown_sender(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Initiate shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// One length-prefixed frame read from a control client
enum Frame {
    Body(Vec<u8>),
    Oversized(usize),
    Closed,
}

async fn read_frame(stream: &mut UnixStream, max_message_size: usize) -> Result<Frame, IpcError> {
    let mut len_buf = [0u8; LENGTH_PREFIX_SIZE];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(Frame::Closed),
        Err(e) => return Err(IpcError::from(e)),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_message_size {
        return Ok(Frame::Oversized(len));
    }

    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok(Frame::Body(body))
}

/// Serve one control client until it disconnects or asks for shutdown
async fn handle_connection(
    mut stream: UnixStream,
    handler: Arc<IpcHandler>,
    max_message_size: usize,
) -> Result<(), IpcError> {
    debug!("control client connected");

    loop {
        let body = match read_frame(&mut stream, max_message_size).await? {
            Frame::Body(body) => body,
            Frame::Closed => {
                debug!("control client disconnected");
                return Ok(());
            }
            // The body is never read, so the stream cannot be resynchronised
            Frame::Oversized(len) => {
                warn!(len, max = max_message_size, "control message too large");
                let response = IpcResponse::error(
                    ErrorCode::InvalidParameters,
                    format!("Message too large: {len} bytes"),
                );
                return send_response(&mut stream, &response).await;
            }
        };

        let command: IpcCommand = match decode_message(&body) {
            Ok(command) => command,
            Err(e) => {
                warn!(error = %e, "undecodable control command");
                let response = IpcResponse::error(
                    ErrorCode::InvalidCommand,
                    format!("Invalid command format: {e}"),
                );
                send_response(&mut stream, &response).await?;
                continue;
            }
        };

        let closes = matches!(command, IpcCommand::Shutdown);
        let response = handler.handle(command).await;
        send_response(&mut stream, &response).await?;

        if closes {
            debug!("shutdown requested, closing control connection");
            return Ok(());
        }
    }
}

/// Send a response to the client
async fn send_response(stream: &mut UnixStream, response: &IpcResponse) -> Result<(), IpcError> {
    let encoded = encode_message(response).map_err(|e| IpcError::serialization(e.to_string()))?;

    stream.write_all(&encoded).await?;
    stream.flush().await?;

    Ok(())
}
