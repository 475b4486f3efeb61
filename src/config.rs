//! Configuration context for a mesh host.
//!
//! All state that the original system pulled from ambient process
//! environment lives here explicitly: the storage root, the host's name and
//! trust domain, network endpoints, and the shared-key file. A [`Settings`]
//! is built once at startup and handed into [`crate::volume::Volume`] and
//! [`crate::mesh::CacheMesh`] construction.

use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

/// Name of the hand-off file listing paths wanted from the mesh.
pub const PULL_FILE: &str = ".pull";
/// Name of the hand-off file listing paths that just became newer locally.
pub const ANNOUNCE_FILE: &str = ".announce";

/// Configuration for one participating host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Base directory for all replicated and private state.
    pub root: PathBuf,
    /// This host's name, used in lock holders, xids and tuids.
    pub hostname: String,
    /// Trust domain. Only cache paths under `<domain>/` are accepted from
    /// peers, and all volumes live under `<domain>/volume/<name>`.
    pub domain: String,
    /// UDP port the gossip node listens on and sends to.
    pub udp_port: u16,
    /// TCP port the HTTP cache server listens on; advertised in `ihave`.
    pub http_port: u16,
    /// Known unicast peers. Gossip is sent to each of these in addition to
    /// the broadcast address (if enabled).
    pub peers: Vec<SocketAddr>,
    /// Whether to send to the limited broadcast address as well.
    pub broadcast: bool,
    /// Path to the newline-delimited shared HMAC key file, if any.
    pub key_file: Option<PathBuf>,
    /// Root under which snapshot entries are materialized. `/` on a real
    /// host; a scratch directory in tests.
    pub volroot: PathBuf,
    /// How long a pull request stays outstanding before it expires.
    pub pull_timeout: Duration,
    /// How long a volume operation waits for the mesh to satisfy a pull
    /// hand-off before giving up and carrying on with local state.
    pub pull_wait: Duration,
}

impl Settings {
    /// Settings rooted at `root` with defaults for everything else.
    pub fn new(
        root: impl Into<PathBuf>,
        hostname: impl Into<String>,
        domain: impl Into<String>,
    ) -> Self {
        Self {
            root: root.into(),
            hostname: hostname.into(),
            domain: domain.into(),
            udp_port: 64321,
            http_port: 64320,
            peers: Vec::new(),
            broadcast: true,
            key_file: None,
            volroot: PathBuf::from("/"),
            pull_timeout: Duration::from_secs(2),
            pull_wait: Duration::from_secs(10),
        }
    }

    /// The shared cache tree. Everything under here is replicated between
    /// hosts and served over HTTP.
    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("fs/cache")
    }

    /// The private tree: staging, history and the hand-off files. Never
    /// leaves the host.
    pub fn private_dir(&self) -> PathBuf {
        self.root.join("fs/private")
    }

    /// The hand-off file the mesh polls for fetch requests.
    pub fn pull_file(&self) -> PathBuf {
        self.private_dir().join(PULL_FILE)
    }

    /// The hand-off file the mesh drains to broadcast freshness.
    pub fn announce_file(&self) -> PathBuf {
        self.private_dir().join(ANNOUNCE_FILE)
    }

    /// Paths for the volume `name`.
    pub fn volume_paths(&self, name: &str) -> VolumePaths {
        let rel = format!("{}/volume/{}", self.domain, name);
        let cachevol = self.cache_dir().join(&rel);
        let privatevol = self.private_dir().join(&rel);
        VolumePaths {
            rel,
            journal: cachevol.join("journal"),
            lock: cachevol.join("lock"),
            block: cachevol.join("block"),
            wip: privatevol.join("journal.wip"),
            history: privatevol.join("history"),
            cachevol,
            privatevol,
        }
    }
}

/// On-disk layout of a single volume, derived from [`Settings`].
#[derive(Debug, Clone)]
pub struct VolumePaths {
    /// Volume directory relative to the cache root, `<domain>/volume/<name>`.
    pub rel: String,
    /// Shared side of the volume.
    pub cachevol: PathBuf,
    /// Private side of the volume.
    pub privatevol: PathBuf,
    /// The append-only journal (shared).
    pub journal: PathBuf,
    /// The lock file (shared). Empty or absent means unlocked.
    pub lock: PathBuf,
    /// Root of the content-addressed block tree (shared).
    pub block: PathBuf,
    /// Staged, uncommitted journal entries (private).
    pub wip: PathBuf,
    /// Applied-xid log (private).
    pub history: PathBuf,
}

impl VolumePaths {
    /// The journal path relative to the cache root, as used on the wire and
    /// in hand-off files.
    pub fn journal_rel(&self) -> String {
        format!("{}/journal", self.rel)
    }

    /// The lock path relative to the cache root.
    pub fn lock_rel(&self) -> String {
        format!("{}/lock", self.rel)
    }

    /// The cache-relative path of block `key`.
    pub fn block_rel(&self, key: &crate::blobs::BlockKey) -> String {
        format!("{}/block/{}/{}", self.rel, key.prefix(), key)
    }
}

/// Join a cache-relative path onto `root`, refusing anything that would
/// escape it. Rejects `..` and non-normal components outright rather than
/// resolving them.
pub fn safe_join(root: &Path, rel: &str) -> Option<PathBuf> {
    let rel = rel.trim_start_matches('/');
    let mut out = root.to_path_buf();
    for comp in Path::new(rel).components() {
        match comp {
            std::path::Component::Normal(c) => out.push(c),
            _ => return None,
        }
    }
    if out == root {
        return None;
    }
    Some(out)
}
