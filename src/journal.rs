//! The append-only change journal and the applied-entry history.
//!
//! A journal is a flat file of committed [`JournalEntry`] records, framed as
//! a little-endian `u32` length followed by the postcard-encoded entry.
//! Append order is causal order is replay order; entries are never modified
//! or removed. The parsed view is cached and re-read only when the backing
//! file changes, so callers must tolerate a parse happening on any query.
//!
//! The history file is the private record of which entries have been applied
//! on this host: one `"<time> <xid>"` line per applied entry. An entry is
//! pending iff it is in the journal and its xid is not in the history.

use std::{
    collections::HashSet,
    fs,
    io::Write,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{blobs::BlockKey, keys::KeyRing};

/// Ownership and mode of one directory on the path from the volume root to
/// a snapshot's parent, recorded so replicas can recreate missing
/// directories faithfully.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirMeta {
    /// Directory path relative to the volume root, with a leading `/`.
    pub path: String,
    /// Unix permission bits.
    pub mode: u32,
    /// Owning user id.
    pub uid: u32,
    /// Owning group id.
    pub gid: u32,
}

/// The payload of a journal entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    /// A full-file overwrite snapshot.
    Snap {
        /// Destination path relative to the volume root, with a leading `/`.
        pathname: String,
        /// Content-addressed key of the file body.
        block: BlockKey,
        /// Owning user id of the file.
        uid: u32,
        /// Owning group id of the file.
        gid: u32,
        /// Unix permission bits of the file.
        mode: u32,
        /// Modification time to restore, seconds since the epoch.
        mtime: u64,
        /// Directory chain from the volume root to the file's parent.
        parents: Vec<DirMeta>,
    },
    /// A command to execute identically on every replica.
    Exec {
        /// Command and arguments; no shell interpolation.
        cmd: Vec<String>,
        /// Working directory for the command.
        cwd: String,
    },
    /// A request to reboot the host once prior entries are applied.
    Reboot,
}

/// One committed (or staged) change record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Globally unique id, `<secs>.<random>@<hostname>`.
    pub xid: String,
    /// Commit time, seconds since the epoch.
    pub time: u64,
    /// The lock message in force when the entry was staged.
    pub message: String,
    /// HMAC tag over the rest of the record, set at append time.
    pub auth: Option<String>,
    /// What the entry does.
    pub kind: EntryKind,
}

impl JournalEntry {
    /// A fresh entry for `kind`, stamped with a new xid and the current
    /// time.
    pub fn new(kind: EntryKind, message: String, hostname: &str) -> Self {
        Self {
            xid: new_xid(hostname),
            time: unix_now(),
            message,
            auth: None,
            kind,
        }
    }

    fn signable_bytes(&self) -> Vec<u8> {
        let mut unsigned = self.clone();
        unsigned.auth = None;
        postcard::to_stdvec(&unsigned).expect("entry serializes")
    }

    /// Set the authentication tag with the keyring's signing key.
    pub fn sign(&mut self, ring: &mut KeyRing) {
        self.auth = ring.sign(&self.signable_bytes());
    }

    /// Verify the authentication tag against the keyring.
    pub fn verify(&self, ring: &mut KeyRing) -> bool {
        ring.verify(&self.signable_bytes(), self.auth.as_deref())
    }

    /// Serialize as a length-prefixed frame ready for appending.
    pub fn to_frame(&self) -> Vec<u8> {
        let body = postcard::to_stdvec(self).expect("entry serializes");
        let mut frame = Vec::with_capacity(4 + body.len());
        frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
        frame.extend_from_slice(&body);
        frame
    }
}

/// A new globally unique entry id.
pub fn new_xid(hostname: &str) -> String {
    format!("{}.{:010}@{}", unix_now(), rand::random::<u32>(), hostname)
}

/// Seconds since the Unix epoch.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock after 1970")
        .as_secs()
}

/// Decode a byte buffer of length-prefixed frames into entries.
pub fn decode_entries(mut buf: &[u8]) -> Result<Vec<JournalEntry>> {
    let mut entries = Vec::new();
    while !buf.is_empty() {
        if buf.len() < 4 {
            bail!("truncated journal frame header");
        }
        let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        buf = &buf[4..];
        if buf.len() < len {
            bail!("truncated journal frame: want {len} bytes, have {}", buf.len());
        }
        let entry: JournalEntry =
            postcard::from_bytes(&buf[..len]).context("malformed journal entry")?;
        entries.push(entry);
        buf = &buf[len..];
    }
    Ok(entries)
}

/// Change marker of a file: mtime plus length. Comparing both sides steps
/// around the one-second mtime granularity for quick successive writes.
type FileStamp = (Option<SystemTime>, u64);

fn stamp(path: &Path) -> FileStamp {
    match path.metadata() {
        Ok(meta) => (meta.modified().ok(), meta.len()),
        Err(_) => (None, 0),
    }
}

/// The append-only journal of one volume.
#[derive(Debug)]
pub struct Journal {
    path: PathBuf,
    cached: Option<(FileStamp, Vec<JournalEntry>)>,
}

impl Journal {
    /// Opens the journal backed by `path`, creating an empty file (and its
    /// parent directories) if missing.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        ensure_file(&path)?;
        Ok(Self { path, cached: None })
    }

    /// The ordered list of committed entries. Re-parses only when the
    /// backing file changed since the last read.
    pub fn entries(&mut self) -> Result<&[JournalEntry]> {
        let current = stamp(&self.path);
        let fresh = matches!(&self.cached, Some((cached, _)) if *cached == current);
        if !fresh {
            let data = fs::read(&self.path)
                .with_context(|| format!("failed to read journal {:?}", self.path))?;
            let entries = decode_entries(&data)
                .with_context(|| format!("failed to parse journal {:?}", self.path))?;
            self.cached = Some((current, entries));
        }
        Ok(&self.cached.as_ref().expect("just populated").1)
    }

    /// Append pre-serialized frames in a single write call.
    pub fn add_raw(&mut self, frames: &[u8]) -> Result<()> {
        let mut f = fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)
            .with_context(|| format!("failed to open journal {:?}", self.path))?;
        f.write_all(frames)
            .with_context(|| format!("failed to append to journal {:?}", self.path))?;
        self.cached = None;
        Ok(())
    }

    /// Raw modification time of the backing file, for optimistic-concurrency
    /// checks.
    pub fn mtime(&self) -> Option<SystemTime> {
        self.path.metadata().ok().and_then(|m| m.modified().ok())
    }

    /// Raw bytes of the backing file.
    pub fn raw(&self) -> Result<Vec<u8>> {
        fs::read(&self.path).with_context(|| format!("failed to read journal {:?}", self.path))
    }

    /// Copy this journal into `other`, which must be empty or absent.
    pub fn copy(&self, other: &mut Journal) -> Result<()> {
        let dst_len = other.path.metadata().map(|m| m.len()).unwrap_or(0);
        if dst_len != 0 {
            bail!("destination journal {:?} is not empty", other.path);
        }
        let data = self.raw()?;
        fs::write(&other.path, &data)
            .with_context(|| format!("failed to write journal {:?}", other.path))?;
        other.cached = None;
        Ok(())
    }

    /// Migrate into `other`: the shorter of the two journals must be a
    /// byte-for-byte prefix of the longer, otherwise the two histories have
    /// forked and the migration fails. With `append`, the missing tail is
    /// appended to `other`.
    pub fn migrate(&self, other: &mut Journal, append: bool) -> Result<()> {
        let ours = self.raw()?;
        let theirs = other.raw()?;
        let short = ours.len().min(theirs.len());
        if ours[..short] != theirs[..short] {
            bail!(
                "conflicting fork between {:?} and {:?}",
                self.path,
                other.path
            );
        }
        if append && ours.len() > theirs.len() {
            other.add_raw(&ours[theirs.len()..])?;
        }
        Ok(())
    }
}

/// The applied-entry log of one volume.
#[derive(Debug)]
pub struct History {
    path: PathBuf,
    cached: Option<(FileStamp, HashSet<String>)>,
}

impl History {
    /// Opens the history backed by `path`, creating an empty file (and its
    /// parent directories) if missing.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        ensure_file(&path)?;
        Ok(Self { path, cached: None })
    }

    /// Record `entry` as durably applied.
    pub fn add(&mut self, entry: &JournalEntry) -> Result<()> {
        let line = format!("{} {}\n", unix_now(), entry.xid);
        let mut f = fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)
            .with_context(|| format!("failed to open history {:?}", self.path))?;
        f.write_all(line.as_bytes())
            .with_context(|| format!("failed to append to history {:?}", self.path))?;
        self.cached = None;
        Ok(())
    }

    /// The set of applied xids. Re-read when the backing file changed.
    pub fn xid_set(&mut self) -> Result<&HashSet<String>> {
        let current = stamp(&self.path);
        let fresh = matches!(&self.cached, Some((cached, _)) if *cached == current);
        if !fresh {
            let data = fs::read_to_string(&self.path)
                .with_context(|| format!("failed to read history {:?}", self.path))?;
            let mut set = HashSet::new();
            for line in data.lines() {
                // "<time> <xid>"; tolerate and skip anything else
                match line.split_whitespace().nth(1) {
                    Some(xid) => {
                        set.insert(xid.to_string());
                    }
                    None => warn!(?line, path = ?self.path, "skipping malformed history line"),
                }
            }
            self.cached = Some((current, set));
        }
        Ok(&self.cached.as_ref().expect("just populated").1)
    }
}

fn ensure_file(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("failed to create {parent:?}"))?;
    }
    if !path.exists() {
        fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .with_context(|| format!("failed to create {path:?}"))?;
    }
    Ok(())
}
