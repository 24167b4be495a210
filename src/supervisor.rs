use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    io::{self, Error, ErrorKind},
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    rc::Rc,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{
    net::{TcpListener, TcpStream, UdpSocket},
    select,
    sync::{mpsc, watch, Notify},
    task::spawn_local,
    time::{sleep, timeout, Instant},
};
use tracing::{debug, error, info, warn};

use crate::{
    codec::LineIo,
    config::{Config, Protocol, Role, StreamProtocol},
    forward,
    handshake::{self, AccessorParams, ExposerParams, HandshakeError, Negotiated},
    metrics::Metrics,
    mux::{MuxSession, Side},
    transport::{Channel, OverlayCommand, OverlayEvent, OverlayHandle, PeerLink},
    utils::is_benign_disconnect,
};

/// How long a blocking rejection keeps a peer out.
const REJECT_TTL: Duration = Duration::from_secs(10);

/// Delay before rejoining the overlay after it closes.
const REJOIN_DELAY: Duration = Duration::from_secs(5);

/// Total time shutdown waits for active substreams to drain.
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(3);

/// Time the overlay gets to destroy itself during shutdown.
const OVERLAY_CLOSE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Tcp,
    Udp,
}

/// The substream budget. Shared between the supervisor and the RAII guards it
/// hands out.
struct Budget {
    active: Cell<usize>,
    drained: Notify,
}

/// Per-process state: the stream budget, the rejected-peer cache, rejoin
/// bookkeeping and the shutdown signal. One instance, shared by `Rc`.
pub struct Supervisor {
    config: Rc<Config>,
    metrics: Arc<Metrics>,
    budget: Rc<Budget>,
    rejected: RefCell<HashMap<String, Instant>>,
    connected: Cell<bool>,
    rejoin_pending: Rc<Cell<bool>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Supervisor {
    pub fn new(config: Rc<Config>, metrics: Arc<Metrics>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            metrics,
            budget: Rc::new(Budget {
                active: Cell::new(0),
                drained: Notify::new(),
            }),
            rejected: RefCell::new(HashMap::new()),
            connected: Cell::new(false),
            rejoin_pending: Rc::new(Cell::new(false)),
            shutdown_tx,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn active_streams(&self) -> usize {
        self.budget.active.get()
    }

    /// Resolves once graceful shutdown has begun. Safe to call at any point,
    /// including after the fact.
    pub async fn wait_shutdown(&self) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        while !*shutdown_rx.borrow() {
            if shutdown_rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn begin_shutdown(&self) {
        // send_replace updates the value even with no receiver subscribed
        // yet, so late wait_shutdown callers still observe it.
        self.shutdown_tx.send_replace(true);
    }

    /// Claims one slot of the stream budget. The returned guard gives the
    /// slot back (and fixes the gauge) when dropped. Returns `None` with no
    /// resources allocated once the budget is spent.
    pub fn try_admit(&self, kind: StreamKind) -> Option<StreamGuard> {
        if self.budget.active.get() >= self.config.max_streams {
            return None;
        }

        self.budget.active.set(self.budget.active.get() + 1);
        gauge(&self.metrics, kind).fetch_add(1, Ordering::Relaxed);

        Some(StreamGuard {
            budget: Rc::clone(&self.budget),
            metrics: Arc::clone(&self.metrics),
            kind,
        })
    }

    /// Whether a peer key sits in the rejected-peer cache. Lapsed entries are
    /// swept on the way through.
    pub fn is_rejected(&self, peer_key: &str) -> bool {
        let mut rejected = self.rejected.borrow_mut();
        match rejected.get(peer_key) {
            Some(deadline) if Instant::now() < *deadline => true,
            Some(_) => {
                rejected.remove(peer_key);
                false
            }
            None => false,
        }
    }

    pub fn block_peer(&self, peer_key: &str) {
        let now = Instant::now();
        let mut rejected = self.rejected.borrow_mut();
        rejected.retain(|_, deadline| *deadline > now);
        rejected.insert(peer_key.to_string(), now + REJECT_TTL);
    }

    fn set_connected(&self, connected: bool) {
        self.connected.set(connected);
        self.metrics.connected_to_host.store(connected, Ordering::Relaxed);
    }

    /// Main event loop: peers in, rejoins scheduled, Ctrl-C out.
    pub async fn run(self: Rc<Self>, mut overlay: OverlayHandle) -> io::Result<()> {
        let result = loop {
            select! {
                biased;
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutting down");
                    break Ok(());
                }
                event = overlay.next_event() => match event {
                    Some(OverlayEvent::Connection(link)) => {
                        let supervisor = Rc::clone(&self);
                        spawn_local(supervisor.handle_link(link));
                    }
                    Some(OverlayEvent::Closed) => self.schedule_rejoin(&overlay.commands()),
                    Some(OverlayEvent::Fatal(error)) => {
                        error!("Overlay failed: {error}");
                        break Err(error);
                    }
                    None => break Err(Error::new(ErrorKind::Other, "Overlay task ended unexpectedly")),
                },
            }
        };

        self.graceful_shutdown(&mut overlay).await;
        result
    }

    /// Schedules exactly one rejoin 5 s out, no matter how many close events
    /// fire within the window.
    fn schedule_rejoin(&self, commands: &mpsc::Sender<OverlayCommand>) {
        self.set_connected(false);
        if self.rejoin_pending.replace(true) {
            return;
        }

        warn!("Overlay closed, rejoining in {} seconds", REJOIN_DELAY.as_secs());
        let pending = Rc::clone(&self.rejoin_pending);
        let commands = commands.clone();
        spawn_local(async move {
            sleep(REJOIN_DELAY).await;
            pending.set(false);
            let _ = commands.send(OverlayCommand::Rejoin).await;
        });
    }

    async fn graceful_shutdown(&self, overlay: &mut OverlayHandle) {
        self.begin_shutdown();

        if self.budget.active.get() > 0 && timeout(SHUTDOWN_DRAIN_TIMEOUT, self.wait_drained()).await.is_err() {
            warn!(
                "Shutdown drain timed out with {} streams still active",
                self.budget.active.get()
            );
        }

        let _ = overlay.commands().send(OverlayCommand::Close).await;
        let close_result = timeout(OVERLAY_CLOSE_TIMEOUT, async {
            while overlay.next_event().await.is_some() {}
        })
        .await;

        if close_result.is_err() {
            warn!("Overlay didn't close in time, exiting anyway");
        }
    }

    async fn wait_drained(&self) {
        while self.budget.active.get() > 0 {
            self.budget.drained.notified().await;
        }
    }

    /// Runs one peer link from byte channel to forwarder teardown.
    pub async fn handle_link(self: Rc<Self>, link: PeerLink) {
        let peer_key = link.peer_key;
        if self.is_rejected(&peer_key) {
            debug!("Dropping peer {peer_key}: recently rejected");
            return;
        }

        self.metrics.p2p_connections.fetch_add(1, Ordering::Relaxed);
        info!("Peer connected: {peer_key}");

        let mut io = LineIo::new(link.channel);
        let negotiated = match timeout(self.config.handshake_timeout, self.drive_handshake(&mut io)).await {
            Ok(Ok(negotiated)) => negotiated,
            Ok(Err(HandshakeError::Rejected(reason))) => {
                warn!("Rejected peer {peer_key}: {reason}");
                if reason.blocks() {
                    self.block_peer(&peer_key);
                }
                return;
            }
            Ok(Err(HandshakeError::ChannelClosed)) => {
                debug!("Peer {peer_key} went away mid-handshake");
                return;
            }
            Ok(Err(HandshakeError::Io(error))) => {
                if is_benign_disconnect(&error) && !self.config.show_warnings {
                    debug!("Handshake with {peer_key} ended: {error}");
                } else {
                    warn!("Handshake with {peer_key} failed: {error}");
                }
                return;
            }
            Err(_) => {
                warn!("Handshake with {peer_key} timed out");
                return;
            }
        };

        info!("Handshake with {peer_key} complete, forwarding {}", negotiated.protocol);
        self.install_forwarder(io, negotiated).await;
        info!("Peer session with {peer_key} ended");
    }

    async fn drive_handshake(&self, io: &mut LineIo<Box<dyn Channel>>) -> Result<Negotiated, HandshakeError> {
        match self.config.role {
            Role::Exposer => {
                let params = ExposerParams {
                    protocol: self.config.protocol,
                    secret: self.config.secret.as_deref(),
                };
                handshake::run_exposer(io, params).await
            }
            Role::Accessor => {
                let protocol = match self.config.protocol {
                    Protocol::Udp => StreamProtocol::Udp,
                    _ => StreamProtocol::Tcp,
                };
                let params = AccessorParams {
                    protocol,
                    secret: self.config.secret.as_deref(),
                    already_connected: self.connected.get(),
                };
                handshake::run_accessor(io, params).await
            }
        }
    }

    async fn install_forwarder(self: Rc<Self>, io: LineIo<Box<dyn Channel>>, negotiated: Negotiated) {
        let (channel, leftover) = io.into_parts();
        let side = match self.config.role {
            Role::Exposer => Side::Even,
            Role::Accessor => Side::Odd,
        };
        let session = MuxSession::new(channel, leftover, side);

        match (self.config.role, negotiated.protocol) {
            (Role::Exposer, StreamProtocol::Tcp) => forward::tcp::run_exposer(session, Rc::clone(&self)).await,
            (Role::Exposer, StreamProtocol::Udp) => forward::udp::run_exposer(session, Rc::clone(&self)).await,
            (Role::Accessor, StreamProtocol::Tcp) => {
                let bind_address = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, self.config.listen_port));
                let listener = match TcpListener::bind(bind_address).await {
                    Ok(listener) => listener,
                    Err(error) => {
                        error!("Couldn't bind TCP listener at {bind_address}: {error}");
                        return;
                    }
                };

                info!("Accepting connections on {bind_address}");
                self.set_connected(true);
                forward::tcp::run_accessor(session, listener, Rc::clone(&self)).await;
                self.set_connected(false);
            }
            (Role::Accessor, StreamProtocol::Udp) => {
                let bind_address = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, self.config.listen_port));
                let socket = match UdpSocket::bind(bind_address).await {
                    Ok(socket) => socket,
                    Err(error) => {
                        error!("Couldn't bind UDP socket at {bind_address}: {error}");
                        return;
                    }
                };

                info!("Accepting datagrams on {bind_address}");
                self.set_connected(true);
                if let Err(error) = forward::udp::run_accessor(session, socket, Rc::clone(&self)).await {
                    forward::log_stream_end("Datagram flow", &error, &self);
                }
                self.set_connected(false);
            }
        }
    }
}

fn gauge(metrics: &Metrics, kind: StreamKind) -> &AtomicU64 {
    match kind {
        StreamKind::Tcp => &metrics.tcp_streams,
        StreamKind::Udp => &metrics.udp_streams,
    }
}

/// RAII slot of the stream budget.
pub struct StreamGuard {
    budget: Rc<Budget>,
    metrics: Arc<Metrics>,
    kind: StreamKind,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.budget.active.set(self.budget.active.get().saturating_sub(1));
        gauge(&self.metrics, self.kind).fetch_sub(1, Ordering::Relaxed);

        if self.budget.active.get() == 0 {
            self.budget.drained.notify_waiters();
        }
    }
}

/// One-shot loopback dial against the exposed service so a misconfigured
/// exposer fails before any network activity.
pub async fn probe_exposed_service(config: &Config) -> io::Result<()> {
    let address = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, config.exposed_port));
    match TcpStream::connect(address).await {
        Ok(_) => {
            debug!("Startup probe reached {address}");
            Ok(())
        }
        Err(error) => Err(Error::new(
            error.kind(),
            format!("Nothing is listening on {address}: {error}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use std::{net::Ipv4Addr, rc::Rc, sync::atomic::Ordering, sync::Arc, time::Duration};

    use bytes::Bytes;
    use tokio::{
        net::TcpListener,
        sync::mpsc,
        task::{spawn_local, LocalSet},
        time::timeout,
    };

    use crate::{
        codec::LineIo,
        config::{self, LaunchMode, Overrides, Role, StreamProtocol},
        handshake::{run_accessor, AccessorParams},
        metrics::Metrics,
        mux::{MuxSession, Side},
        transport::{OverlayCommand, PeerLink},
    };

    use super::{StreamKind, Supervisor};

    fn test_supervisor(role: Role, overrides: Overrides) -> Rc<Supervisor> {
        let mode = LaunchMode::Direct {
            role,
            bridge_id: "alpha123".to_string(),
        };
        let config = config::resolve(mode, overrides).unwrap();
        Rc::new(Supervisor::new(Rc::new(config), Arc::new(Metrics::new())))
    }

    #[test]
    fn budget_admits_up_to_max_streams() {
        let supervisor = test_supervisor(
            Role::Exposer,
            Overrides {
                max_streams: Some(2),
                ..Overrides::default()
            },
        );

        let first = supervisor.try_admit(StreamKind::Tcp).unwrap();
        let _second = supervisor.try_admit(StreamKind::Udp).unwrap();
        assert_eq!(supervisor.active_streams(), 2);
        assert!(supervisor.try_admit(StreamKind::Tcp).is_none());

        assert_eq!(supervisor.metrics().tcp_streams.load(Ordering::Relaxed), 1);
        assert_eq!(supervisor.metrics().udp_streams.load(Ordering::Relaxed), 1);

        // A freed slot admits the next stream.
        drop(first);
        assert_eq!(supervisor.metrics().tcp_streams.load(Ordering::Relaxed), 0);
        assert!(supervisor.try_admit(StreamKind::Tcp).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_peers_expire_after_the_ttl() {
        let supervisor = test_supervisor(Role::Exposer, Overrides::default());

        supervisor.block_peer("10.0.0.1:7000");
        assert!(supervisor.is_rejected("10.0.0.1:7000"));
        assert!(!supervisor.is_rejected("10.0.0.2:7000"));

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(supervisor.is_rejected("10.0.0.1:7000"));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!supervisor.is_rejected("10.0.0.1:7000"));
    }

    #[tokio::test(start_paused = true)]
    async fn overlay_close_schedules_exactly_one_rejoin() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let supervisor = test_supervisor(Role::Accessor, Overrides::default());
                let (command_tx, mut command_rx) = mpsc::channel(8);

                supervisor.schedule_rejoin(&command_tx);
                supervisor.schedule_rejoin(&command_tx);
                supervisor.schedule_rejoin(&command_tx);

                tokio::time::sleep(Duration::from_secs(6)).await;

                assert_eq!(command_rx.try_recv().unwrap(), OverlayCommand::Rejoin);
                assert!(command_rx.try_recv().is_err());
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_drain_waits_for_guards() {
        let supervisor = test_supervisor(Role::Exposer, Overrides::default());
        let guard = supervisor.try_admit(StreamKind::Tcp).unwrap();

        supervisor.begin_shutdown();
        assert!(timeout(Duration::from_millis(100), supervisor.wait_drained()).await.is_err());

        drop(guard);
        timeout(Duration::from_millis(100), supervisor.wait_drained())
            .await
            .expect("drain should complete once the guard is gone");
    }

    #[tokio::test]
    async fn exposer_link_serves_a_tunneled_tcp_stream() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let echo = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
                let echo_port = echo.local_addr().unwrap().port();
                spawn_local(async move {
                    while let Ok((mut socket, _)) = echo.accept().await {
                        spawn_local(async move {
                            let (mut read_half, mut write_half) = socket.split();
                            let _ = tokio::io::copy(&mut read_half, &mut write_half).await;
                        });
                    }
                });

                let supervisor = test_supervisor(
                    Role::Exposer,
                    Overrides {
                        exposed_port: Some(echo_port),
                        ..Overrides::default()
                    },
                );

                let (near, far) = tokio::io::duplex(16 * 1024);
                let link = PeerLink {
                    channel: Box::new(near),
                    peer_key: "127.0.0.1:9999".to_string(),
                };
                spawn_local(Rc::clone(&supervisor).handle_link(link));

                // Drive the accessor side of the wire by hand.
                let mut io = LineIo::new(far);
                let params = AccessorParams {
                    protocol: StreamProtocol::Tcp,
                    secret: None,
                    already_connected: false,
                };
                let negotiated = run_accessor(&mut io, params).await.unwrap();
                assert_eq!(negotiated.protocol, StreamProtocol::Tcp);

                let (channel, leftover) = io.into_parts();
                let session = MuxSession::new(channel, leftover, Side::Odd);

                let stream = session.open().await.unwrap();
                let (tx, mut rx) = stream.split();
                tx.send(Bytes::from_static(b"ping")).await.unwrap();
                assert_eq!(&rx.recv().await.unwrap()[..], b"ping");
                tx.close().await;

                let metrics = Arc::clone(supervisor.metrics());
                timeout(Duration::from_secs(2), async {
                    while metrics.tcp_streams.load(Ordering::Relaxed) != 0 {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                })
                .await
                .expect("stream gauge should return to zero");

                assert_eq!(metrics.p2p_connections.load(Ordering::Relaxed), 1);
            })
            .await;
    }
}
