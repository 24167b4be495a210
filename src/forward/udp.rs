use std::{
    io,
    net::{Ipv4Addr, SocketAddr},
    rc::Rc,
};

use bytes::Bytes;
use tokio::{net::UdpSocket, select, task::spawn_local};
use tracing::{debug, info, warn};

use crate::{
    mux::{MuxSession, MuxStream},
    supervisor::{StreamGuard, StreamKind, Supervisor},
    throttle::Throttle,
};

use super::log_stream_end;

/// Largest payload a UDP datagram can carry; also bounds one substream chunk.
const MAX_DATAGRAM_LEN: usize = 65507;

/// Exposer side: one ephemeral loopback socket per inbound substream, each
/// datagram carried as one substream chunk in either direction.
pub async fn run_exposer(mut session: MuxSession, supervisor: Rc<Supervisor>) {
    loop {
        let stream = select! {
            maybe = session.accept() => match maybe {
                Some(stream) => stream,
                None => break,
            },
            _ = supervisor.wait_shutdown() => break,
        };

        let guard = match supervisor.try_admit(StreamKind::Udp) {
            Some(guard) => guard,
            None => {
                warn!("Stream budget exhausted, refusing tunneled datagram flow");
                stream.close().await;
                continue;
            }
        };

        debug!("Tunneled UDP flow opened on substream {}", stream.id());
        let supervisor = Rc::clone(&supervisor);
        spawn_local(async move {
            match handle_exposed_flow(stream, guard, &supervisor).await {
                Ok(()) => {}
                Err(error) => log_stream_end("Exposed UDP flow", &error, &supervisor),
            }
        });
    }
}

async fn handle_exposed_flow(stream: MuxStream, guard: StreamGuard, supervisor: &Rc<Supervisor>) -> io::Result<()> {
    let _guard = guard;
    let config = supervisor.config();

    let socket = match UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await {
        Ok(socket) => socket,
        Err(error) => {
            stream.close().await;
            return Err(error);
        }
    };
    socket.connect((Ipv4Addr::LOCALHOST, config.exposed_port)).await?;

    let metrics = supervisor.metrics();
    let mut throttle = Throttle::new(config.kbps);

    let (tx, mut rx) = stream.split();
    let mut buf = vec![0u8; MAX_DATAGRAM_LEN];

    loop {
        select! {
            chunk = rx.recv() => match chunk {
                Some(datagram) => {
                    socket.send(&datagram).await?;
                    metrics.add_bytes_down(datagram.len() as u64);
                }
                None => break,
            },
            result = socket.recv(&mut buf) => {
                let len = result?;
                throttle.admit(len).await;
                tx.send(Bytes::copy_from_slice(&buf[..len])).await?;
                metrics.add_bytes_up(len as u64);
            }
            _ = supervisor.wait_shutdown() => break,
        }
    }

    tx.close().await;
    Ok(())
}

/// Accessor side: a single substream carries every datagram seen on the local
/// listen socket. Replies go to the last source that sent us something, so a
/// local client gets its answers back on the socket it sent from.
pub async fn run_accessor(session: MuxSession, socket: UdpSocket, supervisor: Rc<Supervisor>) -> io::Result<()> {
    let guard = match supervisor.try_admit(StreamKind::Udp) {
        Some(guard) => guard,
        None => {
            warn!("Stream budget exhausted, cannot start the datagram flow");
            return Ok(());
        }
    };
    let _guard = guard;

    let stream = session.open().await?;
    debug!("Datagram flow bound to substream {}", stream.id());

    let metrics = supervisor.metrics();
    let listen_port = supervisor.config().listen_port;
    let fallback = SocketAddr::from((Ipv4Addr::LOCALHOST, listen_port));

    let (tx, mut rx) = stream.split();
    let mut last_source: Option<SocketAddr> = None;
    let mut buf = vec![0u8; MAX_DATAGRAM_LEN];

    loop {
        select! {
            result = socket.recv_from(&mut buf) => {
                let (len, from) = result?;
                last_source = Some(from);
                tx.send(Bytes::copy_from_slice(&buf[..len])).await?;
                metrics.add_bytes_down(len as u64);
            }
            chunk = rx.recv() => match chunk {
                Some(datagram) => {
                    let target = last_source.unwrap_or(fallback);
                    socket.send_to(&datagram, target).await?;
                    metrics.add_bytes_up(datagram.len() as u64);
                }
                None => break,
            },
            _ = supervisor.wait_shutdown() => break,
        }
    }

    tx.close().await;
    info!("Datagram flow ended");
    Ok(())
}
