use std::{io, rc::Rc, sync::atomic::Ordering, sync::Arc};

use serde::Serialize;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    task::spawn_local,
};
use tracing::{debug, warn};

use crate::{config::Config, metrics::Metrics};

/// Largest request head we bother reading before answering.
const MAX_REQUEST_HEAD: usize = 4096;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse<'a> {
    uptime_sec: u64,
    mode: &'a str,
    bridge_id: &'a str,
    protocol: &'a str,
    listen_port: u16,
    remote_port: u16,
    p2p_connections: u64,
    tcp_streams: u64,
    udp_streams: u64,
    bytes_up: u64,
    bytes_down: u64,
    connected_to_host: bool,
    max_streams: usize,
    kbps: u64,
}

/// Serves `GET /status` as JSON on a loopback listener; every other path is a
/// 404. Read-only, so it never touches supervisor state beyond the counters.
pub async fn serve(listener: TcpListener, config: Rc<Config>, metrics: Arc<Metrics>) {
    loop {
        let (stream, _) = match listener.accept().await {
            Ok(pair) => pair,
            Err(error) => {
                warn!("Error accepting status connection: {error}");
                continue;
            }
        };

        let config = Rc::clone(&config);
        let metrics = Arc::clone(&metrics);
        spawn_local(async move {
            if let Err(error) = handle_request(stream, &config, &metrics).await {
                debug!("Status request failed: {error}");
            }
        });
    }
}

async fn handle_request(mut stream: TcpStream, config: &Config, metrics: &Metrics) -> io::Result<()> {
    let mut buf = [0u8; MAX_REQUEST_HEAD];
    let mut len = 0;

    loop {
        if len == buf.len() {
            break;
        }

        let count = stream.read(&mut buf[len..]).await?;
        if count == 0 {
            break;
        }
        len += count;

        if buf[..len].windows(4).any(|window| window == b"\r\n\r\n") {
            break;
        }
    }

    let head = String::from_utf8_lossy(&buf[..len]);
    let mut parts = head.split_whitespace();
    let method = parts.next().unwrap_or("");
    let target = parts.next().unwrap_or("");

    if method == "GET" && target == "/status" {
        let body = serde_json::to_string(&build_response(config, metrics))?;
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        stream.write_all(response.as_bytes()).await?;
    } else {
        stream
            .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
            .await?;
    }

    stream.shutdown().await
}

fn build_response<'a>(config: &'a Config, metrics: &Metrics) -> StatusResponse<'a> {
    StatusResponse {
        uptime_sec: metrics.uptime_secs(),
        mode: config.role.as_str(),
        bridge_id: &config.bridge_id,
        protocol: config.protocol.as_str(),
        listen_port: config.listen_port,
        remote_port: config.exposed_port,
        p2p_connections: metrics.p2p_connections.load(Ordering::Relaxed),
        tcp_streams: metrics.tcp_streams.load(Ordering::Relaxed),
        udp_streams: metrics.udp_streams.load(Ordering::Relaxed),
        bytes_up: metrics.bytes_up.load(Ordering::Relaxed),
        bytes_down: metrics.bytes_down.load(Ordering::Relaxed),
        connected_to_host: metrics.connected_to_host.load(Ordering::Relaxed),
        max_streams: config.max_streams,
        kbps: config.kbps,
    }
}
