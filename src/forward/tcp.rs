use std::{
    io::{self, Error, ErrorKind},
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    rc::Rc,
    time::Duration,
};

use tokio::{
    net::{TcpListener, TcpStream},
    select,
    task::spawn_local,
    time::{sleep, timeout},
};
use tracing::{debug, info, warn};

use crate::{
    mux::{MuxSession, MuxStream},
    supervisor::{StreamGuard, StreamKind, Supervisor},
    throttle::Throttle,
};

use super::{log_stream_end, pipe_reader_to_stream, pipe_stream_to_writer, STREAM_DRAIN_TIMEOUT};

/// Exposer side: every inbound substream is one tunneled TCP connection to
/// dial into the exposed service.
pub async fn run_exposer(mut session: MuxSession, supervisor: Rc<Supervisor>) {
    loop {
        let stream = select! {
            maybe = session.accept() => match maybe {
                Some(stream) => stream,
                None => break,
            },
            _ = supervisor.wait_shutdown() => break,
        };

        let guard = match supervisor.try_admit(StreamKind::Tcp) {
            Some(guard) => guard,
            None => {
                warn!("Stream budget exhausted, refusing tunneled connection");
                stream.close().await;
                continue;
            }
        };

        debug!("Tunneled TCP connection opened on substream {}", stream.id());
        let supervisor = Rc::clone(&supervisor);
        spawn_local(async move {
            match handle_exposed_connection(stream, guard, &supervisor).await {
                Ok(()) => {}
                Err(error) => log_stream_end("Exposed TCP stream", &error, &supervisor),
            }
        });
    }
}

async fn handle_exposed_connection(stream: MuxStream, guard: StreamGuard, supervisor: &Rc<Supervisor>) -> io::Result<()> {
    let _guard = guard;
    let config = supervisor.config();

    let socket = match dial_with_retry(config.exposed_port, config.tcp_connect_retries, config.tcp_retry_delay).await {
        Ok(socket) => socket,
        Err(error) => {
            stream.close().await;
            return Err(error);
        }
    };
    socket.set_nodelay(true)?;

    let metrics = supervisor.metrics();
    let mut throttle = Throttle::new(config.kbps);

    let (sock_read, sock_write) = socket.into_split();
    let (tx, rx) = stream.split();

    // Substream→socket runs unthrottled; the service's replies pace through
    // the throttle on their way back to the accessor.
    let pipes = async {
        select! {
            result = pipe_stream_to_writer(rx, sock_write, &metrics.bytes_down) => result,
            result = pipe_reader_to_stream(sock_read, &tx, &mut throttle, &metrics.bytes_up) => result,
        }
    };
    tokio::pin!(pipes);

    let result = select! {
        result = &mut pipes => result,
        _ = supervisor.wait_shutdown() => timeout(STREAM_DRAIN_TIMEOUT, &mut pipes).await.unwrap_or(Ok(0)),
    };

    tx.close().await;
    result.map(|_| ())
}

/// Dials the exposed service with a bounded retry budget.
async fn dial_with_retry(port: u16, retries: u32, delay: Duration) -> io::Result<TcpStream> {
    let address = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port));
    let mut last_error = None;

    for attempt in 0..retries.max(1) {
        if attempt > 0 {
            sleep(delay).await;
        }

        match TcpStream::connect(address).await {
            Ok(socket) => return Ok(socket),
            Err(error) => {
                debug!("Dial attempt {} to {address} failed: {error}", attempt + 1);
                last_error = Some(error);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| Error::new(ErrorKind::Other, "No dial attempts were made")))
}

/// Accessor side: each connection accepted on the local listener becomes one
/// substream through the tunnel.
pub async fn run_accessor(session: MuxSession, listener: TcpListener, supervisor: Rc<Supervisor>) {
    let session = Rc::new(session);

    loop {
        let (socket, from) = select! {
            result = listener.accept() => match result {
                Ok(pair) => pair,
                Err(error) => {
                    warn!("Error accepting local connection: {error}");
                    continue;
                }
            },
            _ = session.wait_closed() => break,
            _ = supervisor.wait_shutdown() => break,
        };

        let guard = match supervisor.try_admit(StreamKind::Tcp) {
            Some(guard) => guard,
            None => {
                warn!("Stream budget exhausted, refusing connection from {from}");
                continue;
            }
        };

        debug!("Local connection from {from} entering the tunnel");
        let session = Rc::clone(&session);
        let supervisor = Rc::clone(&supervisor);
        spawn_local(async move {
            match handle_local_connection(&session, socket, guard, &supervisor).await {
                Ok(()) => {}
                Err(error) => log_stream_end("Local TCP stream", &error, &supervisor),
            }
        });
    }

    info!("Stopped accepting local connections");
}

async fn handle_local_connection(
    session: &MuxSession,
    socket: TcpStream,
    guard: StreamGuard,
    supervisor: &Rc<Supervisor>,
) -> io::Result<()> {
    let _guard = guard;

    let stream = session.open().await?;
    let metrics = supervisor.metrics();
    let mut throttle = Throttle::new(supervisor.config().kbps);

    let (sock_read, sock_write) = socket.into_split();
    let (tx, rx) = stream.split();

    let pipes = async {
        select! {
            result = pipe_stream_to_writer(rx, sock_write, &metrics.bytes_up) => result,
            result = pipe_reader_to_stream(sock_read, &tx, &mut throttle, &metrics.bytes_down) => result,
        }
    };
    tokio::pin!(pipes);

    let result = select! {
        result = &mut pipes => result,
        _ = supervisor.wait_shutdown() => timeout(STREAM_DRAIN_TIMEOUT, &mut pipes).await.unwrap_or(Ok(0)),
    };

    tx.close().await;
    result.map(|_| ())
}

#[cfg(test)]
mod tests {
    use std::{net::Ipv4Addr, rc::Rc, sync::atomic::Ordering, sync::Arc, time::Duration};

    use bytes::Bytes;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
        task::{spawn_local, LocalSet},
        time::timeout,
    };

    use crate::{
        config::{self, LaunchMode, Overrides, Role},
        metrics::Metrics,
        mux::{MuxSession, Side},
        supervisor::Supervisor,
    };

    fn supervisor(role: Role, overrides: Overrides) -> Rc<Supervisor> {
        let mode = LaunchMode::Direct {
            role,
            bridge_id: "alpha123".to_string(),
        };
        let config = config::resolve(mode, overrides).unwrap();
        Rc::new(Supervisor::new(Rc::new(config), Arc::new(Metrics::new())))
    }

    async fn spawn_echo_server() -> u16 {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        spawn_local(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                spawn_local(async move {
                    let (mut read_half, mut write_half) = socket.split();
                    let _ = tokio::io::copy(&mut read_half, &mut write_half).await;
                });
            }
        });

        port
    }

    /// Wires an exposer and an accessor forwarder together over an in-memory
    /// peer channel, returning the accessor's listen address.
    async fn start_tunnel(exposer: &Rc<Supervisor>, accessor: &Rc<Supervisor>) -> std::net::SocketAddr {
        let (near, far) = tokio::io::duplex(64 * 1024);
        let exposer_session = MuxSession::new(near, Bytes::new(), Side::Even);
        let accessor_session = MuxSession::new(far, Bytes::new(), Side::Odd);

        spawn_local(super::run_exposer(exposer_session, Rc::clone(exposer)));

        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let listen_address = listener.local_addr().unwrap();
        spawn_local(super::run_accessor(accessor_session, listener, Rc::clone(accessor)));

        listen_address
    }

    async fn wait_for_gauge(supervisor: &Rc<Supervisor>, value: u64) {
        timeout(Duration::from_secs(2), async {
            while supervisor.metrics().tcp_streams.load(Ordering::Relaxed) != value {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("tcp stream gauge never settled");
    }

    #[tokio::test]
    async fn tunnels_a_tcp_connection_end_to_end() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let echo_port = spawn_echo_server().await;

                let exposer = supervisor(
                    Role::Exposer,
                    Overrides {
                        exposed_port: Some(echo_port),
                        ..Overrides::default()
                    },
                );
                let accessor = supervisor(Role::Accessor, Overrides::default());
                let listen_address = start_tunnel(&exposer, &accessor).await;

                let mut client = TcpStream::connect(listen_address).await.unwrap();
                client.write_all(b"hello\n").await.unwrap();

                let mut reply = [0u8; 6];
                client.read_exact(&mut reply).await.unwrap();
                assert_eq!(&reply, b"hello\n");

                // One live substream on each side while the client is open.
                assert_eq!(accessor.metrics().tcp_streams.load(Ordering::Relaxed), 1);
                wait_for_gauge(&exposer, 1).await;

                drop(client);
                wait_for_gauge(&accessor, 0).await;
                wait_for_gauge(&exposer, 0).await;

                assert_eq!(accessor.metrics().bytes_down.load(Ordering::Relaxed), 6);
                assert_eq!(accessor.metrics().bytes_up.load(Ordering::Relaxed), 6);
            })
            .await;
    }

    #[tokio::test]
    async fn third_connection_is_refused_when_the_budget_is_two() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let echo_port = spawn_echo_server().await;

                let exposer = supervisor(
                    Role::Exposer,
                    Overrides {
                        exposed_port: Some(echo_port),
                        ..Overrides::default()
                    },
                );
                let accessor = supervisor(
                    Role::Accessor,
                    Overrides {
                        max_streams: Some(2),
                        ..Overrides::default()
                    },
                );
                let listen_address = start_tunnel(&exposer, &accessor).await;

                let mut first = TcpStream::connect(listen_address).await.unwrap();
                first.write_all(b"a").await.unwrap();
                let mut byte = [0u8; 1];
                first.read_exact(&mut byte).await.unwrap();

                let mut second = TcpStream::connect(listen_address).await.unwrap();
                second.write_all(b"b").await.unwrap();
                second.read_exact(&mut byte).await.unwrap();

                // The third is dropped at accept with no tunnel resources.
                let mut third = TcpStream::connect(listen_address).await.unwrap();
                let read = timeout(Duration::from_secs(2), third.read(&mut byte)).await.unwrap();
                assert_eq!(read.unwrap(), 0);
                assert_eq!(accessor.metrics().tcp_streams.load(Ordering::Relaxed), 2);

                // Freeing one slot lets a new connection through.
                drop(first);
                wait_for_gauge(&accessor, 1).await;

                let mut fourth = TcpStream::connect(listen_address).await.unwrap();
                fourth.write_all(b"c").await.unwrap();
                fourth.read_exact(&mut byte).await.unwrap();
                assert_eq!(&byte, b"c");
            })
            .await;
    }

    #[tokio::test]
    async fn exhausted_dial_retries_close_the_substream() {
        let local = LocalSet::new();
        local
            .run_until(async {
                // Grab a port with nothing listening behind it.
                let unused_port = {
                    let probe = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
                    probe.local_addr().unwrap().port()
                };

                let exposer = supervisor(
                    Role::Exposer,
                    Overrides {
                        exposed_port: Some(unused_port),
                        tcp_retries: Some(2),
                        tcp_retry_delay_ms: Some(10),
                        ..Overrides::default()
                    },
                );
                let accessor = supervisor(Role::Accessor, Overrides::default());
                let listen_address = start_tunnel(&exposer, &accessor).await;

                let mut client = TcpStream::connect(listen_address).await.unwrap();
                client.write_all(b"anyone there?").await.unwrap();

                // The exposer gives up after its retry budget and the tunnel
                // surfaces that as a clean close.
                let mut buf = [0u8; 16];
                let read = timeout(Duration::from_secs(2), client.read(&mut buf)).await.unwrap();
                assert_eq!(read.unwrap(), 0);

                wait_for_gauge(&exposer, 0).await;
            })
            .await;
    }
}
