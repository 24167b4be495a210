use std::io::{Error, ErrorKind};

use sha2::{Digest, Sha256};

/// Prefix mixed into the topic hash so bridge ids don't collide with other
/// applications hashing user strings onto the same overlay.
const TOPIC_NAMESPACE: &str = "NAT-bridge:";

/// The lowest port of the dynamic range that rendezvous ports are folded into.
const RENDEZVOUS_PORT_BASE: u16 = 49152;

/// Derives the 32-byte rendezvous topic for a bridge id.
///
/// Both endpoints of a bridge derive the same topic from the same id; joining
/// the same topic is all that's needed for discovery.
pub fn derive_topic(bridge_id: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(TOPIC_NAMESPACE.as_bytes());
    hasher.update(bridge_id.as_bytes());

    let digest = hasher.finalize();
    let mut topic = [0u8; 32];
    topic.copy_from_slice(&digest);
    topic
}

/// Folds a topic into a UDP port in the dynamic range (49152..=65535).
///
/// Announcing endpoints bind this port; looking-up endpoints dial it.
pub fn rendezvous_port(topic: &[u8; 32]) -> u16 {
    let fold = u16::from_be_bytes([topic[0], topic[1]]);
    RENDEZVOUS_PORT_BASE + fold % (u16::MAX - RENDEZVOUS_PORT_BASE)
}

/// Whether an I/O error is one of the expected teardown diagnostics that a
/// peer going away produces. These are logged at debug level unless the user
/// asked for warnings.
pub fn is_benign_disconnect(error: &Error) -> bool {
    matches!(
        error.kind(),
        ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof
            | ErrorKind::NotConnected
    )
}
