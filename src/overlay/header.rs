//! Port header for overlay streams
//!
//! The first two bytes of every forwarded overlay stream carry the TCP port
//! the guest originally asked for, as an unsigned big-endian integer. Nothing
//! else is negotiated at this layer; payload starts at byte three.
//!
//! ```text
//! +--------+--------+---------------------
//! | port (u16, BE)  | payload ...
//! +--------+--------+---------------------
//! ```

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::OverlayError;

/// Size of the port header in bytes
pub const PORT_HEADER_LEN: usize = 2;

/// Encode a port into its header bytes
#[must_use]
pub const fn encode_port(port: u16) -> [u8; PORT_HEADER_LEN] {
    port.to_be_bytes()
}

/// Decode header bytes into a port
#[must_use]
pub const fn decode_port(header: [u8; PORT_HEADER_LEN]) -> u16 {
    u16::from_be_bytes(header)
}

/// Write the port header as its own write, then flush
///
/// # Errors
///
/// Returns `OverlayError::IoError` if the stream rejects the write.
pub async fn write_port_header<W>(writer: &mut W, port: u16) -> Result<(), OverlayError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(&encode_port(port)).await?;
    writer.flush().await?;
    Ok(())
}

/// Read exactly the port header from the start of a stream
///
/// # Errors
///
/// Returns `OverlayError::ShortHeader` if the stream ends before two bytes
/// arrive, or `OverlayError::IoError` on any other read failure.
pub async fn read_port_header<R>(reader: &mut R) -> Result<u16, OverlayError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; PORT_HEADER_LEN];
    let mut received = 0;
    while received < PORT_HEADER_LEN {
        let n = reader.read(&mut header[received..]).await?;
        if n == 0 {
            return Err(OverlayError::ShortHeader { received });
        }
        received += n;
    }
    Ok(decode_port(header))
}
