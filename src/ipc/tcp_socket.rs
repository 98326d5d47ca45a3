//! Framing of control protocol messages on the client TCP connection.

use super::protocol::{MsgHeader, Reply, Request, HEADER_LEN};
use crate::error::ManagerError;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

/// Accept the single controller connection.
///
/// The socket gets `TCP_NODELAY` and a zero linger timeout, so closing it
/// resets the connection instead of lingering in `TIME_WAIT`.
pub async fn accept_single(listener: &TcpListener) -> Result<ClientConnection, ManagerError> {
    let (stream, peer) = listener.accept().await?;
    stream.set_nodelay(true)?;
    let socket = socket2::SockRef::from(&stream);
    if let Err(e) = socket.set_linger(Some(Duration::ZERO)) {
        warn!("Failed to set SO_LINGER on controller socket: {}", e);
    }
    debug!("Accepted controller connection from {}", peer);
    Ok(ClientConnection { stream, peer })
}

/// The controller's connection.
pub struct ClientConnection {
    stream: TcpStream,
    peer: SocketAddr,
}

impl ClientConnection {
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Read exactly `buf.len()` bytes, returning how many arrived before EOF.
    async fn read_full(&mut self, buf: &mut [u8]) -> Result<usize, ManagerError> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.stream.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    /// Read the next request.
    ///
    /// A clean EOF before any header byte is [`Request::Close`]. A header or
    /// body cut short by EOF is a protocol violation.
    pub async fn recv_request(&mut self) -> Result<Request, ManagerError> {
        let mut header_buf = [0u8; HEADER_LEN];
        match self.read_full(&mut header_buf).await? {
            0 => return Ok(Request::Close),
            HEADER_LEN => {}
            n => {
                return Err(ManagerError::ProtocolViolation(format!(
                    "connection closed after {} of {} header bytes",
                    n, HEADER_LEN
                )))
            }
        }

        let header = MsgHeader::decode(&header_buf)?;
        let body_len = Request::body_len(header.message_type)?;
        let mut body = vec![0u8; body_len];
        let got = self.read_full(&mut body).await?;
        if got != body_len {
            return Err(ManagerError::ProtocolViolation(format!(
                "connection closed after {} of {} body bytes for message type {}",
                got, body_len, header.message_type
            )));
        }

        let request = Request::decode(&header, &body)?;
        debug!("Received {:?}", request);
        Ok(request)
    }

    pub async fn send_reply(&mut self, reply: &Reply) -> Result<(), ManagerError> {
        let bytes = reply.encode()?;
        self.stream.write_all(&bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) {
        if let Err(e) = self.stream.shutdown().await {
            debug!("Controller socket shutdown: {}", e);
        }
    }
}
