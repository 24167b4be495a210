pub mod tcp;
pub mod udp;

use std::{
    io,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::{
    mux::{MuxReceiver, MuxSender},
    supervisor::Supervisor,
    throttle::Throttle,
    utils::is_benign_disconnect,
};

/// How long a substream gets to end naturally once shutdown begins.
pub(crate) const STREAM_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Read buffer for the socket→substream direction.
const PIPE_BUFFER_LEN: usize = 8192;

/// Pumps substream chunks into a local socket. Returns the byte count once
/// the peer closes the substream.
pub(crate) async fn pipe_stream_to_writer<W>(mut rx: MuxReceiver, mut writer: W, counter: &AtomicU64) -> io::Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    while let Some(chunk) = rx.recv().await {
        writer.write_all(&chunk).await?;
        counter.fetch_add(chunk.len() as u64, Ordering::Relaxed);
        total += chunk.len() as u64;
    }

    let _ = writer.shutdown().await;
    Ok(total)
}

/// Pumps local socket bytes into a substream, pacing each chunk through the
/// throttle before it is forwarded.
pub(crate) async fn pipe_reader_to_stream<R>(
    mut reader: R,
    tx: &MuxSender,
    throttle: &mut Throttle,
    counter: &AtomicU64,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; PIPE_BUFFER_LEN];
    let mut total = 0u64;

    loop {
        let count = reader.read(&mut buf).await?;
        if count == 0 {
            break;
        }

        throttle.admit(count).await;
        tx.send(Bytes::copy_from_slice(&buf[..count])).await?;
        counter.fetch_add(count as u64, Ordering::Relaxed);
        total += count as u64;
    }

    tx.close().await;
    Ok(total)
}

pub(crate) fn log_stream_end(what: &str, error: &io::Error, supervisor: &Supervisor) {
    if is_benign_disconnect(error) && !supervisor.config().show_warnings {
        debug!("{what} ended: {error}");
    } else {
        warn!("{what} ended with error: {error}");
    }
}
