//! Content-addressed block storage.
//!
//! Blocks are immutable byte blobs keyed by a digest of their content and
//! stored as flat files under `block/<prefix>/<key>`. The same content
//! always maps to the same key, so a second `put` of identical bytes is a
//! no-op. There is no delete; the store is append-only.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Context, Result};
use md5::Md5;
use sha1::{Digest, Sha1};
use tracing::warn;

/// Number of leading hex characters of the key used as the shard directory.
const PREFIX_LEN: usize = 4;
/// Trailing tag reserved for future digest-algorithm changes.
const KEY_VERSION: &str = "1";

/// Key of a stored block: `<sha1-hex>-<md5-hex>-1`.
///
/// Keys arrive inside journal entries fetched from peers, so the format is
/// enforced on deserialization, not just construction. Anything that fails
/// [`ensure_valid_key`] (wrong digest lengths, path separators, dots) is
/// rejected before it can reach the filesystem layer.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, derive_more::Display, serde::Serialize, serde::Deserialize,
)]
#[display("{_0}")]
#[serde(try_from = "String")]
pub struct BlockKey(String);

impl BlockKey {
    /// Compute the key for `content`.
    pub fn compute(content: &[u8]) -> Self {
        let sha = Sha1::digest(content);
        let md = Md5::digest(content);
        BlockKey(format!(
            "{}-{}-{}",
            hex::encode(sha),
            hex::encode(md),
            KEY_VERSION
        ))
    }

    /// The shard directory for this key.
    pub fn prefix(&self) -> &str {
        &self.0[..PREFIX_LEN]
    }

    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::str::FromStr for BlockKey {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        ensure_valid_key(s)?;
        Ok(BlockKey(s.to_string()))
    }
}

impl TryFrom<String> for BlockKey {
    type Error = anyhow::Error;

    fn try_from(s: String) -> Result<Self> {
        ensure_valid_key(&s)?;
        Ok(BlockKey(s))
    }
}

fn ensure_valid_key(key: &str) -> Result<()> {
    // sha1 (40) + '-' + md5 (32) + '-' + version
    let mut parts = key.splitn(3, '-');
    let sha = parts.next().unwrap_or_default();
    let md = parts.next().unwrap_or_default();
    let version = parts.next().unwrap_or_default();
    if sha.len() != 40
        || md.len() != 32
        || version.is_empty()
        || !key.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
    {
        return Err(anyhow!("invalid block key: {:?}", key));
    }
    Ok(())
}

/// The on-disk block store of a single volume.
#[derive(Debug, Clone)]
pub struct BlockStore {
    /// Root of the block tree, `<cachevol>/block`.
    root: PathBuf,
}

impl BlockStore {
    /// Creates or opens the store rooted at `root`.
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create {:?}", root.as_ref()))?;
        Ok(BlockStore {
            root: root.as_ref().to_path_buf(),
        })
    }

    /// Stores `content` and returns its key. Re-putting identical content
    /// is a no-op.
    pub fn put(&self, content: &[u8]) -> Result<BlockKey> {
        let key = BlockKey::compute(content);
        let filepath = self.path(&key)?;
        if let Ok(meta) = filepath.metadata() {
            // the digest is trusted; the length compare only catches gross
            // corruption of an existing copy
            if meta.len() != content.len() as u64 {
                warn!(
                    key = %key,
                    on_disk = meta.len(),
                    len = content.len(),
                    "existing block has unexpected length, keeping it"
                );
            }
            return Ok(key);
        }

        // Write to a temp name then rename, so a crash never leaves a
        // half-written block under its final key.
        let tmp = filepath.with_extension("tmp");
        fs::write(&tmp, content).with_context(|| format!("failed to write {tmp:?}"))?;
        fs::rename(&tmp, &filepath)
            .with_context(|| format!("failed to rename {tmp:?} -> {filepath:?}"))?;
        Ok(key)
    }

    /// Retrieves the block stored under `key`.
    pub fn get(&self, key: &BlockKey) -> Result<Vec<u8>> {
        let filepath = self.path(key)?;
        fs::read(&filepath).with_context(|| format!("failed to read block {filepath:?}"))
    }

    /// Whether a block for `key` is present locally.
    pub fn contains(&self, key: &BlockKey) -> bool {
        self.path_unchecked(key).is_file()
    }

    /// Filesystem path for `key`, creating the shard directory if missing.
    pub fn path(&self, key: &BlockKey) -> Result<PathBuf> {
        let p = self.path_unchecked(key);
        let parent = p
            .parent()
            .ok_or_else(|| anyhow!("no parent for block path {p:?}"))?;
        if !parent.exists() {
            if let Err(err) = fs::create_dir(parent) {
                if err.kind() != io::ErrorKind::AlreadyExists {
                    return Err(err).with_context(|| format!("failed to create {parent:?}"));
                }
            }
        }
        Ok(p)
    }

    fn path_unchecked(&self, key: &BlockKey) -> PathBuf {
        self.root.join(key.prefix()).join(key.as_str())
    }
}
