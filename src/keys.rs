//! Shared-secret HMAC key management.
//!
//! Keys are newline-delimited in a single file. The file is re-read when
//! its mtime changes, but at most once per check interval, so a flood of
//! incoming messages cannot turn into a flood of `stat` calls. A line
//! consisting of `+ANY+` disables verification entirely; it is meant for
//! bootstrap and testing only.
//!
//! Signing always uses the first key. Verification accepts a message that
//! matches *any* configured key, which lets operators rotate keys without a
//! flag day: add the new key everywhere, then move it to the front, then
//! drop the old one.

use std::{
    path::PathBuf,
    sync::Arc,
    time::{Instant, SystemTime},
};

use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use sha1::Sha1;
use tracing::debug;

type HmacSha1 = Hmac<Sha1>;

/// Default minimum interval between key file stat checks.
pub const DEFAULT_CHECK_INTERVAL: std::time::Duration = std::time::Duration::from_secs(10);

/// A reloadable set of shared HMAC keys.
#[derive(Debug)]
pub struct KeyRing {
    path: Option<PathBuf>,
    check_interval: std::time::Duration,
    next_check: Option<Instant>,
    mtime: Option<SystemTime>,
    keys: Vec<String>,
    any: bool,
}

/// A [`KeyRing`] shared between the mesh, the volumes and the HTTP server.
pub type SharedKeyRing = Arc<RwLock<KeyRing>>;

impl KeyRing {
    /// A keyring backed by the key file at `path`, or an empty one when
    /// `path` is `None` (no keys configured: everything verifies).
    pub fn new(path: Option<PathBuf>) -> Self {
        Self::with_check_interval(path, DEFAULT_CHECK_INTERVAL)
    }

    /// Like [`KeyRing::new`] with an explicit reload check interval.
    pub fn with_check_interval(path: Option<PathBuf>, check_interval: std::time::Duration) -> Self {
        Self {
            path,
            check_interval,
            next_check: None,
            mtime: None,
            keys: Vec::new(),
            any: false,
        }
    }

    /// Wrap into the shared handle used across tasks.
    pub fn shared(self) -> SharedKeyRing {
        Arc::new(RwLock::new(self))
    }

    fn reload(&mut self) {
        let Some(path) = &self.path else {
            return;
        };
        let now = Instant::now();
        if let Some(next) = self.next_check {
            if now < next {
                return;
            }
        }
        self.next_check = Some(now + self.check_interval);
        let Ok(meta) = path.metadata() else {
            return;
        };
        let mtime = meta.modified().ok();
        if mtime.is_some() && mtime == self.mtime {
            return;
        }
        let Ok(content) = std::fs::read_to_string(path) else {
            return;
        };
        debug!(?path, "reloading hmac keys");
        self.mtime = mtime;
        self.keys.clear();
        self.any = false;
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if line == "+ANY+" {
                self.any = true;
                continue;
            }
            self.keys.push(line.to_string());
        }
    }

    /// Sign `msg` with the first key. `None` when no keys are configured.
    pub fn sign(&mut self, msg: &[u8]) -> Option<String> {
        self.reload();
        let key = self.keys.first()?;
        Some(digest(key, msg))
    }

    /// Verify `tag` over `msg` against any configured key.
    ///
    /// True when no keys are configured or `+ANY+` is present.
    pub fn verify(&mut self, msg: &[u8], tag: Option<&str>) -> bool {
        self.reload();
        if self.keys.is_empty() || self.any {
            return true;
        }
        let Some(tag) = tag else {
            return false;
        };
        self.keys.iter().any(|key| digest(key, msg) == tag)
    }

    /// The response to an HTTP fetch challenge: HMAC over the challenge
    /// bytes with the first key.
    pub fn response(&mut self, challenge: &str) -> Option<String> {
        self.reload();
        let key = self.keys.first()?;
        Some(digest(key, challenge.as_bytes()))
    }

    /// Check a challenge response against any configured key. Same
    /// no-keys/`+ANY+` rules as [`KeyRing::verify`].
    pub fn check(&mut self, challenge: &str, response: Option<&str>) -> bool {
        self.reload();
        if self.keys.is_empty() || self.any {
            return true;
        }
        let Some(response) = response else {
            return false;
        };
        self.keys
            .iter()
            .any(|key| digest(key, challenge.as_bytes()) == response)
    }
}

fn digest(key: &str, msg: &[u8]) -> String {
    let mut mac = HmacSha1::new_from_slice(key.as_bytes()).expect("hmac accepts any key length");
    mac.update(msg);
    hex::encode(mac.finalize().into_bytes())
}
