//! Gossip wire messages.
//!
//! Two message kinds travel over UDP: `whohas` asks the mesh who holds a
//! newer copy of a cache path, `ihave` advertises local freshness. Both are
//! ephemeral; correctness comes from the embedded mtimes, not from
//! transport ordering. Every datagram is a sealed envelope: the
//! postcard-encoded message plus an HMAC tag over those bytes.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::keys::KeyRing;

/// Largest accepted datagram.
pub const MAX_DATAGRAM: usize = 8192;

/// A gossip message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Gossip {
    /// "Who has a newer copy of this path?"
    Whohas {
        /// Cache-relative path wanted.
        file: String,
        /// Only copies strictly newer than this mtime are interesting.
        newer: u64,
        /// Transient id of the requester, used to drop our own broadcasts.
        tuid: String,
    },
    /// "I have this path at this freshness; fetch it from me."
    Ihave {
        /// Cache-relative path advertised.
        file: String,
        /// The sender's local mtime for the path.
        mtime: u64,
        /// Port of the sender's HTTP cache server.
        port: u16,
        /// URL scheme for the fetch.
        scheme: String,
        /// Transient id of the sender.
        tuid: String,
    },
}

impl Gossip {
    /// The transient host id embedded in the message.
    pub fn tuid(&self) -> &str {
        match self {
            Gossip::Whohas { tuid, .. } => tuid,
            Gossip::Ihave { tuid, .. } => tuid,
        }
    }

    /// The cache-relative path the message is about.
    pub fn file(&self) -> &str {
        match self {
            Gossip::Whohas { file, .. } => file,
            Gossip::Ihave { file, .. } => file,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Sealed {
    auth: Option<String>,
    body: Vec<u8>,
}

/// Failure to accept an incoming datagram. Both cases are dropped by the
/// receiver without a reply.
#[derive(Debug, thiserror::Error)]
pub enum OpenError {
    /// The datagram did not parse.
    #[error("malformed datagram: {0}")]
    Malformed(#[from] postcard::Error),
    /// The authentication tag did not verify against any configured key.
    #[error("authentication failed")]
    BadAuth,
}

/// Serialize and sign `msg` for the wire.
pub fn seal(msg: &Gossip, ring: &mut KeyRing) -> Bytes {
    let body = postcard::to_stdvec(msg).expect("gossip message serializes");
    let auth = ring.sign(&body);
    let sealed = postcard::to_stdvec(&Sealed { auth, body }).expect("envelope serializes");
    Bytes::from(sealed)
}

/// Parse and verify a received datagram.
pub fn open(data: &[u8], ring: &mut KeyRing) -> Result<Gossip, OpenError> {
    let sealed: Sealed = postcard::from_bytes(data)?;
    if !ring.verify(&sealed.body, sealed.auth.as_deref()) {
        return Err(OpenError::BadAuth);
    }
    let msg = postcard::from_bytes(&sealed.body)?;
    Ok(msg)
}
