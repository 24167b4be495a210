use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    io::{self, Cursor, Error, ErrorKind},
    rc::Rc,
};

use bytes::Bytes;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::{mpsc, watch},
    task::spawn_local,
};
use tracing::debug;

const FRAME_OPEN: u8 = 1;
const FRAME_DATA: u8 = 2;
const FRAME_CLOSE: u8 = 3;

/// DATA frame payload limit. Larger writes are split into multiple frames;
/// a UDP datagram always fits in one, so datagram boundaries survive.
pub const MAX_DATA_PAYLOAD: usize = u16::MAX as usize;

/// Queued chunks per inbound substream before the channel reader stalls.
const INBOUND_BUFFER_CHUNKS: usize = 32;

/// Queued outbound frames before writers stall.
const OUTBOUND_BUFFER_FRAMES: usize = 32;

/// Substream id parity, one per end of the channel, so both ends can open
/// substreams without colliding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Even,
    Odd,
}

impl Side {
    fn first_id(self) -> u32 {
        match self {
            Self::Even => 0,
            Self::Odd => 1,
        }
    }
}

enum Frame {
    Open { id: u32 },
    Data { id: u32, payload: Bytes },
    Close { id: u32 },
}

struct StreamEntry {
    data_tx: mpsc::Sender<Bytes>,
    closed: Rc<Cell<bool>>,
}

struct Shared {
    streams: RefCell<HashMap<u32, StreamEntry>>,
    dead: Cell<bool>,
    dead_tx: watch::Sender<bool>,
}

impl Shared {
    fn mark_dead(&self) {
        self.dead.set(true);
        // send_replace stores the value even with no subscriber yet.
        self.dead_tx.send_replace(true);
    }
}

/// One multiplexed session over one peer channel. Carries any number of
/// independent bidirectional substreams; bytes within a substream are ordered,
/// substreams are not ordered relative to each other, and closing one never
/// affects the others or the channel itself.
pub struct MuxSession {
    out_tx: mpsc::Sender<Frame>,
    shared: Rc<Shared>,
    next_id: Cell<u32>,
    incoming_rx: mpsc::Receiver<MuxStream>,
}

impl MuxSession {
    /// Takes over a peer channel after the handshake. `leftover` is whatever
    /// the handshake codec had already read past its last line.
    pub fn new<C>(channel: C, leftover: Bytes, side: Side) -> Self
    where
        C: AsyncRead + AsyncWrite + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(channel);
        let reader = Cursor::new(leftover).chain(read_half);

        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_BUFFER_FRAMES);
        let (incoming_tx, incoming_rx) = mpsc::channel(8);

        let (dead_tx, _) = watch::channel(false);
        let shared = Rc::new(Shared {
            streams: RefCell::new(HashMap::new()),
            dead: Cell::new(false),
            dead_tx,
        });

        spawn_local(write_task(out_rx, write_half, Rc::clone(&shared)));
        spawn_local(read_task(reader, Rc::clone(&shared), incoming_tx, out_tx.downgrade()));

        Self {
            out_tx,
            shared,
            next_id: Cell::new(side.first_id()),
            incoming_rx,
        }
    }

    /// Opens a new outbound substream with a fresh id.
    pub async fn open(&self) -> io::Result<MuxStream> {
        if self.shared.dead.get() {
            return Err(Error::new(ErrorKind::NotConnected, "mux session is closed"));
        }

        let id = self.next_id.get();
        self.next_id.set(id + 2);

        let stream = register(&self.shared, &self.out_tx, id);
        if self.out_tx.send(Frame::Open { id }).await.is_err() {
            self.shared.streams.borrow_mut().remove(&id);
            return Err(Error::new(ErrorKind::NotConnected, "mux session is closed"));
        }

        Ok(stream)
    }

    /// Waits for the peer to open a substream. Returns `None` once the
    /// session is closed.
    pub async fn accept(&mut self) -> Option<MuxStream> {
        self.incoming_rx.recv().await
    }

    pub fn is_dead(&self) -> bool {
        self.shared.dead.get()
    }

    /// Resolves once the underlying peer channel is gone.
    pub async fn wait_closed(&self) {
        let mut dead_rx = self.shared.dead_tx.subscribe();
        while !*dead_rx.borrow() {
            if dead_rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// One end of a substream pair.
pub struct MuxStream {
    sender: MuxSender,
    receiver: MuxReceiver,
}

impl MuxStream {
    pub fn id(&self) -> u32 {
        self.sender.id
    }

    pub fn split(self) -> (MuxSender, MuxReceiver) {
        (self.sender, self.receiver)
    }

    /// Closes the substream in both directions; the peer observes EOF.
    pub async fn close(self) {
        self.sender.close().await;
    }
}

/// Write half of a substream. Each `send` becomes one or more DATA frames;
/// writes of up to [`MAX_DATA_PAYLOAD`] bytes arrive at the peer as a single
/// chunk.
pub struct MuxSender {
    id: u32,
    out: mpsc::Sender<Frame>,
    closed: Rc<Cell<bool>>,
    shared: Rc<Shared>,
}

impl MuxSender {
    pub async fn send(&self, data: Bytes) -> io::Result<()> {
        if self.closed.get() || self.shared.dead.get() {
            return Err(Error::new(ErrorKind::BrokenPipe, "substream is closed"));
        }

        let mut data = data;
        loop {
            let payload = data.split_to(data.len().min(MAX_DATA_PAYLOAD));
            let frame = Frame::Data { id: self.id, payload };
            if self.out.send(frame).await.is_err() {
                return Err(Error::new(ErrorKind::BrokenPipe, "peer channel is closed"));
            }

            if data.is_empty() {
                return Ok(());
            }
        }
    }

    pub async fn close(&self) {
        if !self.closed.replace(true) {
            self.shared.streams.borrow_mut().remove(&self.id);
            let _ = self.out.send(Frame::Close { id: self.id }).await;
        }
    }
}

impl Drop for MuxSender {
    fn drop(&mut self) {
        if !self.closed.replace(true) {
            self.shared.streams.borrow_mut().remove(&self.id);
            let _ = self.out.try_send(Frame::Close { id: self.id });
        }
    }
}

/// Read half of a substream.
pub struct MuxReceiver {
    data_rx: mpsc::Receiver<Bytes>,
}

impl MuxReceiver {
    /// Receives the next chunk. `None` means the peer closed the substream or
    /// the whole channel went away.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.data_rx.recv().await
    }
}

fn register(shared: &Rc<Shared>, out_tx: &mpsc::Sender<Frame>, id: u32) -> MuxStream {
    let (data_tx, data_rx) = mpsc::channel(INBOUND_BUFFER_CHUNKS);
    let closed = Rc::new(Cell::new(false));

    shared.streams.borrow_mut().insert(
        id,
        StreamEntry {
            data_tx,
            closed: Rc::clone(&closed),
        },
    );

    MuxStream {
        sender: MuxSender {
            id,
            out: out_tx.clone(),
            closed,
            shared: Rc::clone(shared),
        },
        receiver: MuxReceiver { data_rx },
    }
}

async fn write_task<W: AsyncWrite + Unpin>(mut out_rx: mpsc::Receiver<Frame>, mut writer: W, shared: Rc<Shared>) {
    while let Some(frame) = out_rx.recv().await {
        if let Err(error) = write_frame(&mut writer, &frame).await {
            debug!("Peer channel write ended: {error}");
            break;
        }
    }

    let _ = writer.shutdown().await;
    shared.mark_dead();
}

async fn read_task<R: AsyncRead + Unpin>(
    mut reader: R,
    shared: Rc<Shared>,
    incoming_tx: mpsc::Sender<MuxStream>,
    out_weak: mpsc::WeakSender<Frame>,
) {
    loop {
        let frame = match read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(error) => {
                debug!("Peer channel read ended: {error}");
                break;
            }
        };

        match frame {
            Frame::Open { id } => {
                // The weak handle keeps the writer from outliving the session
                // and its substreams; failing to upgrade means teardown.
                let out_tx = match out_weak.upgrade() {
                    Some(out_tx) => out_tx,
                    None => break,
                };

                let stream = register(&shared, &out_tx, id);
                if incoming_tx.send(stream).await.is_err() {
                    break;
                }
            }
            Frame::Data { id, payload } => {
                let maybe_tx = shared.streams.borrow().get(&id).map(|entry| entry.data_tx.clone());

                // Unknown ids are substreams we already closed; drop silently.
                if let Some(data_tx) = maybe_tx {
                    if data_tx.send(payload).await.is_err() {
                        shared.streams.borrow_mut().remove(&id);
                    }
                }
            }
            Frame::Close { id } => {
                if let Some(entry) = shared.streams.borrow_mut().remove(&id) {
                    entry.closed.set(true);
                    // Dropping data_tx delivers EOF to the receiver.
                }
            }
        }
    }

    shared.mark_dead();
    shared.streams.borrow_mut().clear();
}

async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Option<Frame>> {
    let mut kind = [0u8; 1];
    if let Err(error) = reader.read_exact(&mut kind).await {
        return match error.kind() {
            ErrorKind::UnexpectedEof => Ok(None),
            _ => Err(error),
        };
    }

    let mut id_bytes = [0u8; 4];
    reader.read_exact(&mut id_bytes).await?;
    let id = u32::from_be_bytes(id_bytes);

    match kind[0] {
        FRAME_OPEN => Ok(Some(Frame::Open { id })),
        FRAME_CLOSE => Ok(Some(Frame::Close { id })),
        FRAME_DATA => {
            let mut len_bytes = [0u8; 2];
            reader.read_exact(&mut len_bytes).await?;
            let len = u16::from_be_bytes(len_bytes) as usize;

            let mut payload = vec![0u8; len];
            reader.read_exact(&mut payload).await?;
            Ok(Some(Frame::Data {
                id,
                payload: Bytes::from(payload),
            }))
        }
        other => Err(Error::new(ErrorKind::InvalidData, format!("Unknown mux frame type {other}"))),
    }
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> io::Result<()> {
    match frame {
        Frame::Open { id } => {
            writer.write_all(&[FRAME_OPEN]).await?;
            writer.write_all(&id.to_be_bytes()).await?;
        }
        Frame::Close { id } => {
            writer.write_all(&[FRAME_CLOSE]).await?;
            writer.write_all(&id.to_be_bytes()).await?;
        }
        Frame::Data { id, payload } => {
            writer.write_all(&[FRAME_DATA]).await?;
            writer.write_all(&id.to_be_bytes()).await?;
            writer.write_all(&(payload.len() as u16).to_be_bytes()).await?;
            writer.write_all(payload).await?;
        }
    }

    writer.flush().await
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tokio::task::LocalSet;

    use super::{MuxSession, Side};

    fn pair() -> (MuxSession, MuxSession) {
        let (near, far) = tokio::io::duplex(4096);
        (
            MuxSession::new(near, Bytes::new(), Side::Even),
            MuxSession::new(far, Bytes::new(), Side::Odd),
        )
    }

    #[tokio::test]
    async fn open_accept_and_exchange() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let (even, mut odd) = pair();

                let outbound = even.open().await.unwrap();
                let inbound = odd.accept().await.unwrap();
                assert_eq!(outbound.id(), inbound.id());

                let (near_tx, mut near_rx) = outbound.split();
                let (far_tx, mut far_rx) = inbound.split();

                near_tx.send(Bytes::from_static(b"hello")).await.unwrap();
                assert_eq!(&far_rx.recv().await.unwrap()[..], b"hello");

                far_tx.send(Bytes::from_static(b"world")).await.unwrap();
                assert_eq!(&near_rx.recv().await.unwrap()[..], b"world");
            })
            .await;
    }

    #[tokio::test]
    async fn write_boundaries_are_preserved() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let (even, mut odd) = pair();

                let (near_tx, _near_rx) = even.open().await.unwrap().split();
                let (_far_tx, mut far_rx) = odd.accept().await.unwrap().split();

                near_tx.send(Bytes::from_static(b"one")).await.unwrap();
                near_tx.send(Bytes::from_static(b"two")).await.unwrap();
                near_tx.send(Bytes::from_static(b"three")).await.unwrap();

                assert_eq!(&far_rx.recv().await.unwrap()[..], b"one");
                assert_eq!(&far_rx.recv().await.unwrap()[..], b"two");
                assert_eq!(&far_rx.recv().await.unwrap()[..], b"three");
            })
            .await;
    }

    #[tokio::test]
    async fn substreams_are_independent() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let (even, mut odd) = pair();

                let first = even.open().await.unwrap();
                let second = even.open().await.unwrap();
                assert_ne!(first.id(), second.id());

                let inbound_first = odd.accept().await.unwrap();
                let inbound_second = odd.accept().await.unwrap();

                let (first_tx, _first_keep) = first.split();
                first_tx.send(Bytes::from_static(b"a")).await.unwrap();
                first_tx.close().await;

                // Closing the first substream must not disturb the second.
                let (second_tx, _second_keep) = second.split();
                second_tx.send(Bytes::from_static(b"b")).await.unwrap();

                let (_tx1, mut rx1) = inbound_first.split();
                assert_eq!(&rx1.recv().await.unwrap()[..], b"a");
                assert!(rx1.recv().await.is_none());

                let (_tx2, mut rx2) = inbound_second.split();
                assert_eq!(&rx2.recv().await.unwrap()[..], b"b");
            })
            .await;
    }

    #[tokio::test]
    async fn close_delivers_eof_and_poisons_the_sender() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let (even, mut odd) = pair();

                let outbound = even.open().await.unwrap();
                let inbound = odd.accept().await.unwrap();

                let (near_tx, _near_rx) = outbound.split();
                near_tx.close().await;
                assert!(near_tx.send(Bytes::from_static(b"late")).await.is_err());

                let (_far_tx, mut far_rx) = inbound.split();
                assert!(far_rx.recv().await.is_none());
            })
            .await;
    }

    #[tokio::test]
    async fn channel_teardown_closes_every_substream() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let (even, mut odd) = pair();

                let (_near_tx, _near_rx) = even.open().await.unwrap().split();
                let (_far_tx, mut far_rx) = odd.accept().await.unwrap().split();

                // Dropping the whole even side (session handle and pipe
                // halves) shuts the channel down.
                drop(_near_tx);
                drop(_near_rx);
                drop(even);

                assert!(far_rx.recv().await.is_none());
                assert!(odd.accept().await.is_none());
                assert!(odd.is_dead());
                odd.wait_closed().await;
            })
            .await;
    }

    #[tokio::test]
    async fn leftover_handshake_bytes_are_consumed_first() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let (near, far) = tokio::io::duplex(4096);

                // A complete OPEN frame for substream 1, as if it had been
                // read together with the tail of the handshake.
                let leftover = Bytes::from_static(&[super::FRAME_OPEN, 0, 0, 0, 1]);

                let mut even = MuxSession::new(near, leftover, Side::Even);
                let _odd = MuxSession::new(far, Bytes::new(), Side::Odd);

                let inbound = even.accept().await.unwrap();
                assert_eq!(inbound.id(), 1);
            })
            .await;
    }
}
