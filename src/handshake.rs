use std::{
    fmt,
    io::{self, Error, ErrorKind},
};

use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    codec::{
        ClientNegotiate, HostNegotiate, LineError, LineIo, AUTH_PREFIX, CHAL_PREFIX, HELLO_ACCESSOR, HELLO_EXPOSER,
        LINE_OK,
    },
    config::{Protocol, StreamProtocol},
};

type HmacSha256 = Hmac<Sha256>;

/// Why a peer was turned away. Blocking reasons additionally land the peer in
/// the rejected-peer cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    HostConflict,
    ClientConflict,
    AuthFailed,
    AuthNotConfigured,
    AlreadyConnected,
    UnsupportedProtocol(String),
    ProtocolMismatch { offered: String, configured: String },
    UnexpectedLine(String),
    MalformedNegotiation(String),
    OversizedLine,
    BadUtf8,
}

impl RejectReason {
    /// Blocking rejections suppress reconnect storms via the peer cache.
    pub fn blocks(&self) -> bool {
        matches!(self, Self::HostConflict)
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HostConflict => write!(f, "host-host conflict"),
            Self::ClientConflict => write!(f, "client-client conflict"),
            Self::AuthFailed => write!(f, "auth failed"),
            Self::AuthNotConfigured => write!(f, "auth not configured"),
            Self::AlreadyConnected => write!(f, "already connected"),
            Self::UnsupportedProtocol(p) => write!(f, "unsupported protocol {p:?}"),
            Self::ProtocolMismatch { offered, configured } => {
                write!(f, "protocol mismatch: peer wants {offered}, this side carries {configured}")
            }
            Self::UnexpectedLine(line) => write!(f, "unexpected handshake line {line:?}"),
            Self::MalformedNegotiation(detail) => write!(f, "malformed negotiation line: {detail}"),
            Self::OversizedLine => write!(f, "handshake line too long"),
            Self::BadUtf8 => write!(f, "handshake line is not valid UTF-8"),
        }
    }
}

#[derive(Debug)]
pub enum HandshakeError {
    /// The peer was actively turned away.
    Rejected(RejectReason),

    /// The peer went away mid-handshake.
    ChannelClosed,

    Io(io::Error),
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected(reason) => reason.fmt(f),
            Self::ChannelClosed => write!(f, "peer closed the channel mid-handshake"),
            Self::Io(error) => error.fmt(f),
        }
    }
}

impl From<LineError> for HandshakeError {
    fn from(error: LineError) -> Self {
        match error {
            LineError::Closed => Self::ChannelClosed,
            LineError::TooLong => Self::Rejected(RejectReason::OversizedLine),
            LineError::InvalidUtf8 => Self::Rejected(RejectReason::BadUtf8),
            LineError::Io(error) => Self::Io(error),
        }
    }
}

impl From<io::Error> for HandshakeError {
    fn from(error: io::Error) -> Self {
        Self::Io(error)
    }
}

/// The outcome of a successful handshake: the single protocol this link will
/// carry from here on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiated {
    pub protocol: StreamProtocol,
}

pub struct ExposerParams<'a> {
    pub protocol: Protocol,
    pub secret: Option<&'a str>,
}

pub struct AccessorParams<'a> {
    pub protocol: StreamProtocol,
    pub secret: Option<&'a str>,

    /// Whether this accessor already holds a ready session; a second exposer
    /// is then rejected right after its greeting.
    pub already_connected: bool,
}

/// Drives the exposer side of the handshake: greeting, conflict detection,
/// optional challenge/response, then protocol negotiation.
pub async fn run_exposer<C>(io: &mut LineIo<C>, params: ExposerParams<'_>) -> Result<Negotiated, HandshakeError>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    io.send_line(HELLO_EXPOSER).await?;

    let greeting = io.recv_line().await?;
    match greeting.as_str() {
        HELLO_ACCESSOR => {}
        HELLO_EXPOSER => return Err(HandshakeError::Rejected(RejectReason::HostConflict)),
        other => return Err(HandshakeError::Rejected(RejectReason::UnexpectedLine(other.to_string()))),
    }

    if let Some(secret) = params.secret {
        let nonce = hex::encode(rand::random::<[u8; 16]>());
        io.send_line(&format!("{CHAL_PREFIX}{nonce}")).await?;

        let line = io.recv_line().await?;
        let tag = match line.strip_prefix(AUTH_PREFIX) {
            Some(tag) => tag,
            None => return Err(HandshakeError::Rejected(RejectReason::AuthFailed)),
        };

        if !verify_auth(secret, &nonce, tag) {
            return Err(HandshakeError::Rejected(RejectReason::AuthFailed));
        }
    }

    io.send_line(LINE_OK).await?;

    let line = io.recv_line().await?;
    let request: ClientNegotiate = serde_json::from_str(&line)
        .map_err(|error| HandshakeError::Rejected(RejectReason::MalformedNegotiation(error.to_string())))?;

    let protocol = request
        .protocol
        .parse::<StreamProtocol>()
        .map_err(|()| HandshakeError::Rejected(RejectReason::UnsupportedProtocol(request.protocol.clone())))?;

    if !params.protocol.accepts(protocol) {
        return Err(HandshakeError::Rejected(RejectReason::ProtocolMismatch {
            offered: protocol.to_string(),
            configured: params.protocol.to_string(),
        }));
    }

    let host_auth = match (params.secret, &request.client_chal) {
        (Some(secret), Some(challenge)) => Some(auth_tag(secret, challenge)),
        _ => None,
    };

    let reply = HostNegotiate {
        protocol: protocol.to_string(),
        host_auth,
    };
    io.send_line(&encode_json(&reply)?).await?;

    Ok(Negotiated { protocol })
}

/// Drives the accessor side: greeting, optional challenge answer and mutual
/// authentication of the exposer, then protocol negotiation.
pub async fn run_accessor<C>(io: &mut LineIo<C>, params: AccessorParams<'_>) -> Result<Negotiated, HandshakeError>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    io.send_line(HELLO_ACCESSOR).await?;

    let greeting = io.recv_line().await?;
    match greeting.as_str() {
        HELLO_EXPOSER => {}
        HELLO_ACCESSOR => return Err(HandshakeError::Rejected(RejectReason::ClientConflict)),
        other => return Err(HandshakeError::Rejected(RejectReason::UnexpectedLine(other.to_string()))),
    }

    if params.already_connected {
        return Err(HandshakeError::Rejected(RejectReason::AlreadyConnected));
    }

    let line = io.recv_line().await?;
    if let Some(nonce) = line.strip_prefix(CHAL_PREFIX) {
        let secret = match params.secret {
            Some(secret) => secret,
            None => return Err(HandshakeError::Rejected(RejectReason::AuthNotConfigured)),
        };

        io.send_line(&format!("{AUTH_PREFIX}{}", auth_tag(secret, nonce))).await?;

        // The exposer acknowledges a good answer with OK; on a bad one it
        // simply destroys the link and this read surfaces the closure.
        io.recv_line().await?;
    }

    let client_chal = params.secret.map(|_| hex::encode(rand::random::<[u8; 16]>()));
    let request = ClientNegotiate {
        protocol: params.protocol.to_string(),
        client_chal: client_chal.clone(),
    };
    io.send_line(&encode_json(&request)?).await?;

    let line = io.recv_line().await?;
    let reply: HostNegotiate = serde_json::from_str(&line)
        .map_err(|error| HandshakeError::Rejected(RejectReason::MalformedNegotiation(error.to_string())))?;

    if reply.protocol != params.protocol.as_str() {
        return Err(HandshakeError::Rejected(RejectReason::ProtocolMismatch {
            offered: reply.protocol,
            configured: params.protocol.to_string(),
        }));
    }

    if let (Some(secret), Some(challenge)) = (params.secret, &client_chal) {
        let authentic = match &reply.host_auth {
            Some(tag) => verify_auth(secret, challenge, tag),
            None => false,
        };

        if !authentic {
            return Err(HandshakeError::Rejected(RejectReason::AuthFailed));
        }
    }

    Ok(Negotiated {
        protocol: params.protocol,
    })
}

fn encode_json<T: serde::Serialize>(value: &T) -> io::Result<String> {
    serde_json::to_string(value).map_err(|error| Error::new(ErrorKind::InvalidData, error))
}

/// HMAC-SHA256 over the challenge exactly as it appeared on the wire.
fn auth_tag(secret: &str, challenge: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(challenge.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

fn verify_auth(secret: &str, challenge: &str, tag_hex: &str) -> bool {
    let tag = match hex::decode(tag_hex) {
        Ok(tag) => tag,
        Err(_) => return false,
    };

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(challenge.as_bytes());
    mac.verify_slice(&tag).is_ok()
}

#[cfg(test)]
mod tests {
    use tokio::io::DuplexStream;

    use crate::{
        codec::LineIo,
        config::{Protocol, StreamProtocol},
    };

    use super::{run_accessor, run_exposer, AccessorParams, ExposerParams, HandshakeError, RejectReason};

    fn pair() -> (LineIo<DuplexStream>, LineIo<DuplexStream>) {
        let (near, far) = tokio::io::duplex(4096);
        (LineIo::new(near), LineIo::new(far))
    }

    fn exposer_params(secret: Option<&str>) -> ExposerParams<'_> {
        ExposerParams {
            protocol: Protocol::Tcp,
            secret,
        }
    }

    fn accessor_params(secret: Option<&str>) -> AccessorParams<'_> {
        AccessorParams {
            protocol: StreamProtocol::Tcp,
            secret,
            already_connected: false,
        }
    }

    #[tokio::test]
    async fn plain_handshake_reaches_ready() {
        let (mut exposer_io, mut accessor_io) = pair();

        let (exposer, accessor) = tokio::join!(
            run_exposer(&mut exposer_io, exposer_params(None)),
            run_accessor(&mut accessor_io, accessor_params(None)),
        );

        assert_eq!(exposer.unwrap().protocol, StreamProtocol::Tcp);
        assert_eq!(accessor.unwrap().protocol, StreamProtocol::Tcp);
    }

    #[tokio::test]
    async fn mutual_auth_succeeds_with_matching_secrets() {
        let (mut exposer_io, mut accessor_io) = pair();

        let (exposer, accessor) = tokio::join!(
            run_exposer(&mut exposer_io, exposer_params(Some("s3cret"))),
            run_accessor(&mut accessor_io, accessor_params(Some("s3cret"))),
        );

        assert!(exposer.is_ok());
        assert!(accessor.is_ok());
    }

    #[tokio::test]
    async fn wrong_secret_never_reaches_ready() {
        let (near, far) = tokio::io::duplex(4096);

        let exposer = tokio::spawn(async move {
            let mut io = LineIo::new(near);
            run_exposer(&mut io, exposer_params(Some("s3cret"))).await
        });

        let mut accessor_io = LineIo::new(far);
        let accessor = run_accessor(&mut accessor_io, accessor_params(Some("wrong"))).await;

        let exposer = exposer.await.unwrap();
        assert!(matches!(
            exposer,
            Err(HandshakeError::Rejected(RejectReason::AuthFailed))
        ));
        assert!(accessor.is_err());
    }

    #[tokio::test]
    async fn both_protocols_accepts_either_offer() {
        let (mut exposer_io, mut accessor_io) = pair();

        let exposer_params = ExposerParams {
            protocol: Protocol::Both,
            secret: None,
        };
        let accessor_params = AccessorParams {
            protocol: StreamProtocol::Udp,
            secret: None,
            already_connected: false,
        };

        let (exposer, accessor) = tokio::join!(
            run_exposer(&mut exposer_io, exposer_params),
            run_accessor(&mut accessor_io, accessor_params),
        );

        assert_eq!(exposer.unwrap().protocol, StreamProtocol::Udp);
        assert_eq!(accessor.unwrap().protocol, StreamProtocol::Udp);
    }

    #[tokio::test]
    async fn protocol_mismatch_is_rejected() {
        let (near, far) = tokio::io::duplex(4096);

        let exposer = tokio::spawn(async move {
            let mut io = LineIo::new(near);
            let params = ExposerParams {
                protocol: Protocol::Udp,
                secret: None,
            };
            run_exposer(&mut io, params).await
        });

        let mut accessor_io = LineIo::new(far);
        let accessor = run_accessor(&mut accessor_io, accessor_params(None)).await;

        assert!(matches!(
            exposer.await.unwrap(),
            Err(HandshakeError::Rejected(RejectReason::ProtocolMismatch { .. }))
        ));
        assert!(accessor.is_err());
    }

    #[tokio::test]
    async fn two_exposers_reject_each_other_and_block() {
        let (mut near_io, mut far_io) = pair();

        let (near, far) = tokio::join!(
            run_exposer(&mut near_io, exposer_params(None)),
            run_exposer(&mut far_io, exposer_params(None)),
        );

        for result in [near, far] {
            match result {
                Err(HandshakeError::Rejected(reason)) => {
                    assert_eq!(reason, RejectReason::HostConflict);
                    assert!(reason.blocks());
                }
                other => panic!("Expected host conflict, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn two_accessors_reject_each_other_without_blocking() {
        let (mut near_io, mut far_io) = pair();

        let (near, far) = tokio::join!(
            run_accessor(&mut near_io, accessor_params(None)),
            run_accessor(&mut far_io, accessor_params(None)),
        );

        for result in [near, far] {
            match result {
                Err(HandshakeError::Rejected(reason)) => {
                    assert_eq!(reason, RejectReason::ClientConflict);
                    assert!(!reason.blocks());
                }
                other => panic!("Expected client conflict, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn connected_accessor_turns_away_a_second_exposer() {
        let (near, far) = tokio::io::duplex(4096);

        let exposer = tokio::spawn(async move {
            let mut io = LineIo::new(near);
            run_exposer(&mut io, exposer_params(None)).await
        });

        let mut accessor_io = LineIo::new(far);
        let params = AccessorParams {
            protocol: StreamProtocol::Tcp,
            secret: None,
            already_connected: true,
        };
        let accessor = run_accessor(&mut accessor_io, params).await;

        assert!(matches!(
            accessor,
            Err(HandshakeError::Rejected(RejectReason::AlreadyConnected))
        ));
        drop(accessor_io);
        assert!(exposer.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn challenge_without_a_secret_is_rejected() {
        let (near, far) = tokio::io::duplex(4096);

        let script = tokio::spawn(async move {
            let mut io = LineIo::new(far);
            io.send_line("HELLO:exposer").await.unwrap();
            io.send_line("CHAL:aabbccdd").await.unwrap();
            io
        });

        let mut accessor_io = LineIo::new(near);
        let accessor = run_accessor(&mut accessor_io, accessor_params(None)).await;

        assert!(matches!(
            accessor,
            Err(HandshakeError::Rejected(RejectReason::AuthNotConfigured))
        ));
        drop(script.await.unwrap());
    }

    #[tokio::test]
    async fn oversized_greeting_is_rejected() {
        let (near, far) = tokio::io::duplex(16 * 1024);

        let script = tokio::spawn(async move {
            let mut io = LineIo::new(far);
            io.send_line(&"a".repeat(5000)).await.unwrap();
            io
        });

        let mut exposer_io = LineIo::new(near);
        let exposer = run_exposer(&mut exposer_io, exposer_params(None)).await;

        assert!(matches!(
            exposer,
            Err(HandshakeError::Rejected(RejectReason::OversizedLine))
        ));
        drop(script.await.unwrap());
    }
}
