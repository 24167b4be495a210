//! Contract around the peer-discovery overlay.
//!
//! The overlay runs as its own task behind an [`OverlayHandle`]: it pushes
//! connection and closure events out, and takes rejoin/close commands in. The
//! supervisor never sees how peers are actually found, which also makes it
//! trivial to drive with in-memory channels in tests.

pub mod quic;

use std::io;

use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
};

/// A reliable, ordered, bidirectional byte channel to one peer.
pub trait Channel: AsyncRead + AsyncWrite + Unpin {}

impl<T: AsyncRead + AsyncWrite + Unpin> Channel for T {}

/// One established peer channel, plus the address key used for the
/// rejected-peer cache.
pub struct PeerLink {
    pub channel: Box<dyn Channel>,
    pub peer_key: String,
}

pub enum OverlayEvent {
    /// A peer on the same topic established a byte channel to us.
    Connection(PeerLink),

    /// The overlay lost its footing; the supervisor schedules one rejoin.
    Closed,

    /// The overlay cannot continue. Fatal to the process.
    Fatal(io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayCommand {
    Rejoin,
    Close,
}

pub struct OverlayHandle {
    events: mpsc::Receiver<OverlayEvent>,
    commands: mpsc::Sender<OverlayCommand>,
}

impl OverlayHandle {
    pub fn new(events: mpsc::Receiver<OverlayEvent>, commands: mpsc::Sender<OverlayCommand>) -> Self {
        Self { events, commands }
    }

    /// The next overlay event; `None` once the overlay task is gone.
    pub async fn next_event(&mut self) -> Option<OverlayEvent> {
        self.events.recv().await
    }

    pub fn commands(&self) -> mpsc::Sender<OverlayCommand> {
        self.commands.clone()
    }
}
