//! QUIC-backed overlay: the topic is folded into a rendezvous UDP port.
//! Announcing endpoints bind a server endpoint there; looking-up endpoints
//! dial candidate addresses (loopback, plus anything in `NATBRIDGE_BOOTSTRAP`)
//! until one accepts. The peer channel is the connection's first
//! bidirectional stream, opened by the dialing side.

use std::{
    env,
    io::{self, Error, ErrorKind},
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use quinn::{
    ClientConfig, Connecting, Connection, Endpoint, EndpointConfig, IdleTimeout, RecvStream, SendStream, ServerConfig,
    TokioRuntime, TransportConfig, VarInt,
};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    select,
    sync::mpsc,
    task::spawn_local,
    time::sleep,
};
use tracing::{debug, info, warn};

use crate::{
    config::{Config, Role},
    utils::{derive_topic, rendezvous_port},
};

use super::{OverlayCommand, OverlayEvent, OverlayHandle, PeerLink};

/// Extra rendezvous candidates for lookups, comma-separated `addr:port`.
pub const BOOTSTRAP_ENV: &str = "NATBRIDGE_BOOTSTRAP";

/// Floor for the connection idle timeout, so aggressive handshake timeouts
/// don't starve an otherwise healthy but quiet channel.
const MIN_IDLE_TIMEOUT: Duration = Duration::from_secs(4);

const SERVER_NAME: &str = "natbridge";
const LOOKUP_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Starts the overlay task for the configured bridge and returns its handle.
/// Exposers announce by serving the topic's rendezvous port; accessors look
/// up by dialing it.
pub fn spawn(config: &Config) -> OverlayHandle {
    let topic = derive_topic(&config.bridge_id);
    let tuning = Tuning::from_config(config);

    let (event_tx, event_rx) = mpsc::channel(8);
    let (command_tx, command_rx) = mpsc::channel(4);

    if config.role == Role::Exposer {
        spawn_local(announce_task(topic, tuning, event_tx, command_rx));
    } else {
        spawn_local(lookup_task(topic, tuning, event_tx, command_rx));
    }

    OverlayHandle::new(event_rx, command_tx)
}

/// QUIC transport knobs, derived from the runtime configuration.
///
/// The idle timeout covers at least a full handshake window, so a slow peer
/// is cut off by the handshake timer rather than the transport, and the
/// announcer pings often enough to keep a quiet tunnel alive.
#[derive(Clone, Copy)]
struct Tuning {
    idle: Duration,
    keepalive: Duration,
}

impl Tuning {
    fn from_config(config: &Config) -> Self {
        let idle = config.handshake_timeout.max(MIN_IDLE_TIMEOUT);
        Self {
            idle,
            keepalive: idle / 4,
        }
    }

    fn transport(&self, keepalive: bool) -> Arc<TransportConfig> {
        let mut transport = TransportConfig::default();

        // Everything rides the single bidirectional stream that becomes the
        // peer channel; unidirectional streams have no meaning here.
        transport.max_concurrent_uni_streams(0_u8.into());
        transport.max_idle_timeout(Some(IdleTimeout::from(VarInt::from_u32(self.idle.as_millis() as u32))));
        if keepalive {
            transport.keep_alive_interval(Some(self.keepalive));
        }

        Arc::new(transport)
    }
}

async fn announce_task(
    topic: [u8; 32],
    tuning: Tuning,
    events: mpsc::Sender<OverlayEvent>,
    mut commands: mpsc::Receiver<OverlayCommand>,
) {
    let port = rendezvous_port(&topic);
    let bind_address = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));

    let socket = match std::net::UdpSocket::bind(bind_address) {
        Ok(socket) => socket,
        Err(error) if error.kind() == ErrorKind::AddrInUse => {
            // Another announcer already owns this topic's port, most likely a
            // second exposer on the same host. Dial it instead so the
            // handshake gets to reject the conflict.
            warn!("Rendezvous port {port} is taken, dialing whoever holds it");
            return lookup_task(topic, tuning, events, commands).await;
        }
        Err(error) => {
            let _ = events.send(OverlayEvent::Fatal(error)).await;
            return;
        }
    };

    let endpoint = match make_server_endpoint(socket, &tuning) {
        Ok(endpoint) => endpoint,
        Err(error) => {
            let _ = events.send(OverlayEvent::Fatal(error)).await;
            return;
        }
    };

    info!("Announcing on UDP port {port}");

    loop {
        select! {
            command = commands.recv() => match command {
                // An announcer never leaves the topic; rejoin is a no-op.
                Some(OverlayCommand::Rejoin) => continue,
                Some(OverlayCommand::Close) | None => break,
            },
            incoming = endpoint.accept() => match incoming {
                Some(connecting) => {
                    let events = events.clone();
                    spawn_local(async move {
                        match accept_peer(connecting).await {
                            Ok(link) => {
                                let _ = events.send(OverlayEvent::Connection(link)).await;
                            }
                            Err(error) => debug!("Incoming peer failed to establish: {error}"),
                        }
                    });
                }
                None => break,
            },
        }
    }

    endpoint.close(VarInt::from_u32(0), b"Bridge endpoint is shutting down");
    endpoint.wait_idle().await;
}

async fn accept_peer(connecting: Connecting) -> io::Result<PeerLink> {
    let connection = connecting
        .await
        .map_err(|error| Error::new(ErrorKind::ConnectionAborted, error))?;
    let peer_key = connection.remote_address().to_string();

    let (send, recv) = connection
        .accept_bi()
        .await
        .map_err(|error| Error::new(ErrorKind::ConnectionAborted, error))?;

    debug!("Accepted peer channel from {peer_key}");
    Ok(PeerLink {
        channel: Box::new(QuicChannel::new(send, recv, connection)),
        peer_key,
    })
}

async fn lookup_task(
    topic: [u8; 32],
    tuning: Tuning,
    events: mpsc::Sender<OverlayEvent>,
    mut commands: mpsc::Receiver<OverlayCommand>,
) {
    let port = rendezvous_port(&topic);
    let candidates = candidate_addresses(port);

    let endpoint = match make_client_endpoint(&tuning) {
        Ok(endpoint) => endpoint,
        Err(error) => {
            let _ = events.send(OverlayEvent::Fatal(error)).await;
            return;
        }
    };

    info!("Looking up peers on {} candidate address(es)", candidates.len());

    'join: loop {
        let connection = select! {
            connection = dial_until_connected(&endpoint, &candidates) => connection,
            _ = wait_for_close(&mut commands) => break 'join,
        };

        let peer_key = connection.remote_address().to_string();
        match connection.open_bi().await {
            Ok((send, recv)) => {
                let link = PeerLink {
                    channel: Box::new(QuicChannel::new(send, recv, connection.clone())),
                    peer_key,
                };
                if events.send(OverlayEvent::Connection(link)).await.is_err() {
                    break 'join;
                }
            }
            Err(error) => {
                debug!("Peer {peer_key} went away before the channel opened: {error}");
                sleep(LOOKUP_RETRY_DELAY).await;
                continue 'join;
            }
        }

        // Hold here until the connection dies, then wait for the supervisor
        // to schedule the rejoin.
        select! {
            reason = connection.closed() => {
                debug!("Peer connection closed: {reason}");
                if events.send(OverlayEvent::Closed).await.is_err() {
                    break 'join;
                }

                loop {
                    match commands.recv().await {
                        Some(OverlayCommand::Rejoin) => continue 'join,
                        Some(OverlayCommand::Close) | None => break 'join,
                    }
                }
            }
            _ = wait_for_close(&mut commands) => break 'join,
        }
    }

    endpoint.close(VarInt::from_u32(0), b"Bridge endpoint is shutting down");
    endpoint.wait_idle().await;
}

async fn dial_until_connected(endpoint: &Endpoint, candidates: &[SocketAddr]) -> Connection {
    loop {
        for address in candidates {
            match endpoint.connect(*address, SERVER_NAME) {
                Ok(connecting) => match connecting.await {
                    Ok(connection) => {
                        debug!("Connected to {address}");
                        return connection;
                    }
                    Err(error) => debug!("Couldn't reach {address}: {error}"),
                },
                Err(error) => debug!("Couldn't start connection to {address}: {error}"),
            }
        }

        sleep(LOOKUP_RETRY_DELAY).await;
    }
}

/// Consumes commands until a close is requested; rejoins are irrelevant in
/// the state the caller is in.
async fn wait_for_close(commands: &mut mpsc::Receiver<OverlayCommand>) {
    loop {
        match commands.recv().await {
            Some(OverlayCommand::Rejoin) => continue,
            Some(OverlayCommand::Close) | None => return,
        }
    }
}

fn candidate_addresses(port: u16) -> Vec<SocketAddr> {
    let mut candidates = vec![SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))];

    if let Ok(extra) = env::var(BOOTSTRAP_ENV) {
        for part in extra.split(',').map(str::trim).filter(|part| !part.is_empty()) {
            match part.parse::<SocketAddr>() {
                Ok(address) => candidates.push(address),
                Err(_) => warn!("Ignoring invalid {BOOTSTRAP_ENV} entry {part:?}"),
            }
        }
    }

    candidates
}

fn make_server_endpoint(socket: std::net::UdpSocket, tuning: &Tuning) -> io::Result<Endpoint> {
    let runtime = Arc::new(TokioRuntime);
    Endpoint::new(EndpointConfig::default(), Some(server_config(tuning)?), socket, runtime)
}

fn make_client_endpoint(tuning: &Tuning) -> io::Result<Endpoint> {
    let bind_address = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));
    let mut endpoint = Endpoint::client(bind_address)?;
    endpoint.set_default_client_config(client_config(tuning));
    Ok(endpoint)
}

/// Dialing side of the channel crypto.
///
/// Peers rendezvous by topic and prove who they are in the bridge handshake
/// running on top of this channel (HMAC challenge/response when a secret is
/// set). The TLS layer underneath contributes confidentiality and integrity
/// only, so the dialer accepts whatever throwaway certificate the announcer
/// presents.
fn client_config(tuning: &Tuning) -> ClientConfig {
    let crypto = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyAnnouncerCert))
        .with_no_client_auth();

    let mut client = ClientConfig::new(Arc::new(crypto));
    client.transport_config(tuning.transport(false));
    client
}

/// Announcing side: a certificate minted at startup and pinned by nobody.
fn server_config(tuning: &Tuning) -> io::Result<ServerConfig> {
    let cert = rcgen::generate_simple_self_signed(vec![SERVER_NAME.into()])
        .map_err(|error| Error::new(ErrorKind::Other, error))?;
    let key = rustls::PrivateKey(cert.serialize_private_key_der());
    let chain = vec![rustls::Certificate(
        cert.serialize_der().map_err(|error| Error::new(ErrorKind::Other, error))?,
    )];

    let mut server = ServerConfig::with_single_cert(chain, key).map_err(|error| Error::new(ErrorKind::InvalidInput, error))?;
    server.transport = tuning.transport(true);
    Ok(server)
}

/// A QUIC bidirectional stream glued into one duplex byte channel. Holds the
/// connection so the link owns its transport lifetime.
pub struct QuicChannel {
    send: SendStream,
    recv: RecvStream,
    _connection: Connection,
}

impl QuicChannel {
    fn new(send: SendStream, recv: RecvStream, connection: Connection) -> Self {
        Self {
            send,
            recv,
            _connection: connection,
        }
    }
}

impl AsyncRead for QuicChannel {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.recv).poll_read(cx, buf)
    }
}

impl AsyncWrite for QuicChannel {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<Result<usize, io::Error>> {
        Pin::new(&mut self.send).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        Pin::new(&mut self.send).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        Pin::new(&mut self.send).poll_shutdown(cx)
    }
}

/// See [`client_config`]: identity comes from the bridge handshake, not from
/// a certificate chain no deployment could realistically provision.
struct AcceptAnyAnnouncerCert;

impl rustls::client::ServerCertVerifier for AcceptAnyAnnouncerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}
