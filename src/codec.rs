use std::io;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Handshake lines longer than this reject the peer. Nothing legitimate comes
/// close; the largest line is a negotiation object with a hex challenge.
pub const MAX_LINE_LEN: usize = 4096;

pub const HELLO_EXPOSER: &str = "HELLO:exposer";
pub const HELLO_ACCESSOR: &str = "HELLO:accessor";
pub const LINE_OK: &str = "OK";
pub const CHAL_PREFIX: &str = "CHAL:";
pub const AUTH_PREFIX: &str = "AUTH:";

#[derive(Debug, Error)]
pub enum LineError {
    #[error("Peer closed the channel mid-handshake")]
    Closed,

    #[error("Handshake line exceeds {MAX_LINE_LEN} bytes")]
    TooLong,

    #[error("Handshake line is not valid UTF-8")]
    InvalidUtf8,

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Line-delimited view of a peer channel, used only until the handshake
/// completes. Bytes read past the final line are handed back by
/// [`LineIo::into_parts`] so the mux doesn't lose them.
pub struct LineIo<C> {
    inner: C,
    buf: BytesMut,
}

impl<C: AsyncRead + AsyncWrite + Unpin> LineIo<C> {
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(1024),
        }
    }

    /// Writes one line, appending the terminator and flushing.
    pub async fn send_line(&mut self, line: &str) -> io::Result<()> {
        self.inner.write_all(line.as_bytes()).await?;
        self.inner.write_all(b"\n").await?;
        self.inner.flush().await
    }

    /// Reads one `\n`-terminated line, stripping the terminator and any
    /// trailing `\r`.
    pub async fn recv_line(&mut self) -> Result<String, LineError> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                if pos > MAX_LINE_LEN {
                    return Err(LineError::TooLong);
                }

                let line = self.buf.split_to(pos + 1);
                let line = &line[..pos];
                let line = match line.last() {
                    Some(b'\r') => &line[..pos - 1],
                    _ => line,
                };

                return match std::str::from_utf8(line) {
                    Ok(s) => Ok(s.to_string()),
                    Err(_) => Err(LineError::InvalidUtf8),
                };
            }

            if self.buf.len() > MAX_LINE_LEN {
                return Err(LineError::TooLong);
            }

            let mut chunk = [0u8; 1024];
            let count = self.inner.read(&mut chunk).await?;
            if count == 0 {
                return Err(LineError::Closed);
            }
            self.buf.extend_from_slice(&chunk[..count]);
        }
    }

    /// Retires the codec, returning the channel and any bytes already read
    /// past the last consumed line.
    pub fn into_parts(self) -> (C, Bytes) {
        (self.inner, self.buf.freeze())
    }
}

/// The accessor's negotiation line: the protocol it wants this link to carry,
/// plus a challenge for the exposer when mutual authentication is on.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClientNegotiate {
    pub protocol: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_chal: Option<String>,
}

/// The exposer's negotiation reply.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HostNegotiate {
    pub protocol: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_auth: Option<String>,
}
