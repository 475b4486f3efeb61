//! Per-volume coordination: lock, staging, check-in and replay.
//!
//! A volume is one replicated namespace. Changes are staged under the
//! volume lock into a private work-in-progress file, applied locally as
//! they are staged, and appended to the shared journal at check-in. Replay
//! (`update`) applies committed entries this host has not seen, in journal
//! order.
//!
//! The volume never talks to the network. Wanted files are listed in the
//! `pull` hand-off file and freshness notices in the `announce` file; the
//! cache mesh polls both and signals completion by truncating the pull
//! file back to zero length. That file-truncation hand-off is the only
//! synchronization between the two components.

use std::{
    fs,
    io::Write,
    os::unix::fs::{chown, MetadataExt, PermissionsExt},
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::{Duration, Instant, SystemTime},
};

use anyhow::{anyhow, Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

use crate::{
    blobs::{BlockKey, BlockStore},
    config::{safe_join, Settings, VolumePaths},
    journal::{DirMeta, EntryKind, History, Journal, JournalEntry},
    keys::SharedKeyRing,
};

/// How many times a block fetch is retried when the fetched bytes do not
/// hash to the expected key.
const BLOCK_FETCH_ATTEMPTS: usize = 3;
/// Poll interval while waiting for the mesh to drain a pull hand-off.
const PULL_POLL: Duration = Duration::from_millis(50);

/// Failure of a volume operation, with the stable status codes the CLI
/// front end reports.
#[derive(Debug, thiserror::Error)]
pub enum OpError {
    /// The volume is locked by someone else.
    #[error("resource is locked: {0}")]
    Locked(String),
    /// The operation requires the lock and the caller does not hold it.
    #[error("resource is not locked")]
    NotLocked,
    /// A lock or changelog message is required.
    #[error("changelog/lock message (-m) required")]
    NeedMsg,
    /// The journal changed while a check-in was in flight, or histories
    /// diverged. Never auto-merged; the operator must repair and retry.
    #[error("conflicting changes: {0}")]
    Conflict(String),
    /// Uncommitted local changes block the operation.
    #[error("local changes in progress; commit or discard them first")]
    Pending,
    /// A journal entry failed during replay; later entries were not
    /// applied this run.
    #[error("replay halted: {0}")]
    Replay(String),
    /// The snapshot source does not exist.
    #[error("no such file: {0}")]
    NotFound(PathBuf),
    /// The snapshot source is not a plain file or lies outside the volume
    /// root.
    #[error("invalid snapshot source: {0}")]
    Invalid(String),
    /// Anything else.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OpError {
    /// The stable status code for this failure.
    pub fn code(&self) -> i32 {
        match self {
            OpError::Locked(_) => 220,
            OpError::NotLocked => 221,
            OpError::NeedMsg => 222,
            OpError::Conflict(_) => 223,
            OpError::NotFound(_) => 2,
            OpError::Invalid(_) => 22,
            OpError::Pending | OpError::Replay(_) | OpError::Other(_) => 224,
        }
    }
}

/// What a successful [`Volume::update`] did.
#[derive(Debug, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// This many pending entries were applied.
    Applied(usize),
    /// A reboot entry was reached and recorded; the caller must now reboot
    /// the host. No further entries were applied this run.
    RebootPending,
}

/// A handle on one replicated volume.
#[derive(Debug)]
pub struct Volume {
    name: String,
    settings: Arc<Settings>,
    paths: VolumePaths,
    journal: Journal,
    history: History,
    blocks: BlockStore,
    ring: SharedKeyRing,
}

impl Volume {
    /// Opens (creating on first use) the volume `name`.
    pub fn open(settings: Arc<Settings>, ring: SharedKeyRing, name: &str) -> Result<Self> {
        let paths = settings.volume_paths(name);
        for dir in [&paths.cachevol, &paths.privatevol] {
            fs::create_dir_all(dir).with_context(|| format!("failed to create {dir:?}"))?;
        }
        let journal = Journal::open(&paths.journal)?;
        let history = History::open(&paths.history)?;
        let blocks = BlockStore::new(&paths.block)?;
        Ok(Self {
            name: name.to_string(),
            settings,
            paths,
            journal,
            history,
            blocks,
            ring,
        })
    }

    /// The volume name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The volume's derived paths.
    pub fn paths(&self) -> &VolumePaths {
        &self.paths
    }

    fn me(&self, user: &str) -> String {
        format!("{}@{}", user, self.settings.hostname)
    }

    // ------------------------------------------------------------------
    // mesh hand-off

    /// Queue `rel` (cache-relative) for broadcast by the mesh.
    pub fn announce(&self, rel: &str) -> Result<()> {
        let file = self.settings.announce_file();
        if let Some(parent) = file.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut f = fs::OpenOptions::new().append(true).create(true).open(&file)?;
        f.write_all(format!("{rel}\n").as_bytes())?;
        Ok(())
    }

    /// Ask the mesh for fresh copies of `rels` and wait until it signals
    /// completion by truncating the pull file, or until the configured wait
    /// elapses. A timeout is not an error; the caller carries on with
    /// whatever local state it has and surfaces missing data later.
    pub async fn pull(&self, rels: &[&str]) -> Result<()> {
        if self.settings.pull_wait.is_zero() {
            return Ok(());
        }
        let file = self.settings.pull_file();
        if let Some(parent) = file.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut lines = String::new();
        for rel in rels {
            lines.push_str(rel);
            lines.push('\n');
        }
        let mut f = fs::OpenOptions::new().append(true).create(true).open(&file)?;
        f.write_all(lines.as_bytes())?;
        drop(f);

        let deadline = Instant::now() + self.settings.pull_wait;
        loop {
            tokio::time::sleep(PULL_POLL).await;
            match file.metadata() {
                // empty-but-present means the request completed
                Ok(meta) if meta.len() == 0 => return Ok(()),
                _ => {}
            }
            if Instant::now() > deadline {
                warn!(volume = %self.name, ?rels, "pull not satisfied in time, continuing");
                return Ok(());
            }
        }
    }

    async fn pull_journal_and_lock(&self) -> Result<()> {
        let journal = self.paths.journal_rel();
        let lock = self.paths.lock_rel();
        self.pull(&[journal.as_str(), lock.as_str()]).await
    }

    // ------------------------------------------------------------------
    // lock protocol

    fn lock_content(&self) -> Option<String> {
        match fs::read_to_string(&self.paths.lock) {
            Ok(s) if !s.trim().is_empty() => Some(s),
            _ => None,
        }
    }

    /// The current lock holder as `user@host`, if locked.
    pub fn lock_holder(&self) -> Option<String> {
        let content = self.lock_content()?;
        let (holder, _) = content.split_once(':')?;
        Some(holder.trim().to_string())
    }

    /// The current lock message, or `"none"` when unlocked. Captured into
    /// every staged entry.
    pub fn lock_message(&self) -> String {
        match self.lock_content() {
            Some(content) => content
                .split_once(':')
                .map(|(_, msg)| msg.trim().to_string())
                .unwrap_or(content),
            None => "none".to_string(),
        }
    }

    fn cklock(&self, user: &str) -> Result<(), OpError> {
        match self.lock_holder() {
            None => Err(OpError::NotLocked),
            Some(holder) if holder != self.me(user) => {
                Err(OpError::Locked(self.lock_content().unwrap_or(holder)))
            }
            Some(_) => Ok(()),
        }
    }

    /// Acquire the volume lock for `user` with `message`.
    pub async fn lock(&mut self, user: &str, message: &str) -> Result<(), OpError> {
        // refresh the lock and journal first so a stale local view cannot
        // race a remote holder
        self.pull_journal_and_lock().await?;
        if message.trim().is_empty() {
            return Err(OpError::NeedMsg);
        }
        if let Some(holder) = self.lock_holder() {
            if holder != self.me(user) {
                return Err(OpError::Locked(self.lock_content().unwrap_or(holder)));
            }
        }
        let content = format!("{}: {}", self.me(user), message.trim());
        fs::write(&self.paths.lock, &content)
            .with_context(|| format!("failed to write lock {:?}", self.paths.lock))?;
        // re-read to catch a write race
        if self.lock_holder().as_deref() != Some(&self.me(user)) {
            return Err(OpError::NotLocked);
        }
        self.announce(&self.paths.lock_rel())?;
        info!(volume = %self.name, holder = %self.me(user), "locked");
        Ok(())
    }

    /// Release the volume lock. Breaking another holder's lock is allowed
    /// as a deliberate escape hatch, but is logged loudly.
    pub async fn unlock(&mut self, user: &str) -> Result<(), OpError> {
        if let Some(holder) = self.lock_holder() {
            if holder != self.me(user) {
                warn!(
                    volume = %self.name,
                    broken = %holder,
                    by = %self.me(user),
                    "breaking someone else's lock, please notify them"
                );
            }
            // truncate rather than unlink so the release propagates through
            // the same fetch path as any other cache file
            fs::write(&self.paths.lock, b"")
                .with_context(|| format!("failed to clear lock {:?}", self.paths.lock))?;
            self.announce(&self.paths.lock_rel())?;
        }
        info!(volume = %self.name, "unlocked");
        Ok(())
    }

    // ------------------------------------------------------------------
    // staging

    fn wip_bytes(&self) -> Option<Vec<u8>> {
        match fs::read(&self.paths.wip) {
            Ok(data) if !data.is_empty() => Some(data),
            _ => None,
        }
    }

    /// Apply an entry locally, sign it, and append it to the wip file. The
    /// local replica never lags its own writes.
    async fn stage(&mut self, mut entry: JournalEntry) -> Result<(), OpError> {
        entry.sign(&mut self.ring.write());
        self.apply(&entry, true).await?;
        self.history.add(&entry)?;
        let mut f = fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.paths.wip)
            .with_context(|| format!("failed to open wip {:?}", self.paths.wip))?;
        f.write_all(&entry.to_frame())
            .with_context(|| format!("failed to append to wip {:?}", self.paths.wip))?;
        Ok(())
    }

    /// Stage a full-file snapshot of `path`.
    pub async fn snap(&mut self, user: &str, path: &Path) -> Result<(), OpError> {
        self.cklock(user)?;
        let meta = match fs::symlink_metadata(path) {
            Ok(meta) => meta,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(OpError::NotFound(path.to_path_buf()))
            }
            Err(err) => return Err(OpError::Other(err.into())),
        };
        if !meta.is_file() {
            return Err(OpError::Invalid(format!("{path:?} is not a plain file")));
        }
        let rel = path
            .strip_prefix(&self.settings.volroot)
            .map_err(|_| OpError::Invalid(format!("{path:?} is outside the volume root")))?;
        let pathname = format!("/{}", rel.display());

        let content = fs::read(path).with_context(|| format!("failed to read {path:?}"))?;
        let block = self.blocks.put(&content)?;

        let parents = self.parent_chain(rel)?;
        let entry = JournalEntry::new(
            EntryKind::Snap {
                pathname: pathname.clone(),
                block,
                uid: meta.uid(),
                gid: meta.gid(),
                mode: meta.permissions().mode() & 0o7777,
                mtime: meta.mtime().max(0) as u64,
                parents,
            },
            self.lock_message(),
            &self.settings.hostname,
        );
        self.stage(entry).await?;
        info!(volume = %self.name, path = %pathname, "snapshot staged");
        Ok(())
    }

    /// Record the mode/owner chain from the volume root down to `rel`'s
    /// parent, so replicas can recreate missing directories faithfully.
    fn parent_chain(&self, rel: &Path) -> Result<Vec<DirMeta>> {
        let mut chain = Vec::new();
        let mut at = PathBuf::new();
        let Some(parent) = rel.parent() else {
            return Ok(chain);
        };
        for comp in parent.components() {
            at.push(comp);
            let local = self.settings.volroot.join(&at);
            let meta = fs::metadata(&local)
                .with_context(|| format!("failed to stat parent dir {local:?}"))?;
            chain.push(DirMeta {
                path: format!("/{}", at.display()),
                mode: meta.permissions().mode() & 0o7777,
                uid: meta.uid(),
                gid: meta.gid(),
            });
        }
        Ok(chain)
    }

    /// Stage a command to run identically on every replica.
    pub async fn exec_cmd(&mut self, user: &str, cmd: Vec<String>, cwd: &str) -> Result<(), OpError> {
        self.cklock(user)?;
        if cmd.is_empty() {
            return Err(OpError::Invalid("empty command".to_string()));
        }
        let entry = JournalEntry::new(
            EntryKind::Exec {
                cmd,
                cwd: cwd.to_string(),
            },
            self.lock_message(),
            &self.settings.hostname,
        );
        self.stage(entry).await?;
        info!(volume = %self.name, "exec staged");
        Ok(())
    }

    /// Stage a reboot request. Replicas reboot when they replay it; the
    /// staging host only records it.
    pub async fn reboot(&mut self, user: &str) -> Result<(), OpError> {
        self.cklock(user)?;
        let entry = JournalEntry::new(
            EntryKind::Reboot,
            self.lock_message(),
            &self.settings.hostname,
        );
        self.stage(entry).await?;
        info!(volume = %self.name, "reboot staged");
        Ok(())
    }

    // ------------------------------------------------------------------
    // check-in

    /// Commit the staged entries to the shared journal.
    ///
    /// This is the system's only concurrency control: optimistic,
    /// single-writer-per-volume, detect-don't-merge. If another host's
    /// commit became visible since we staged, the check-in aborts and the
    /// wip file is left intact for the operator to repair.
    pub async fn ci(&mut self, user: &str) -> Result<(), OpError> {
        let Some(wip) = self.wip_bytes() else {
            info!(volume = %self.name, "no outstanding updates");
            return Ok(());
        };
        self.cklock(user)?;

        let before = self.journal.mtime();
        self.pull_journal_and_lock().await?;
        if self.journal.mtime() != before {
            return Err(OpError::Conflict(format!(
                "journal for {} changed during check-in; repair and retry",
                self.name
            )));
        }
        let wip_mtime = fs::metadata(&self.paths.wip)
            .and_then(|m| m.modified())
            .ok();
        if newer_than(self.journal.mtime(), wip_mtime) {
            return Err(OpError::Conflict(format!(
                "journal for {} is newer than the staged changes; repair and retry",
                self.name
            )));
        }

        self.journal.add_raw(&wip)?;
        fs::remove_file(&self.paths.wip)
            .with_context(|| format!("failed to remove wip {:?}", self.paths.wip))?;
        self.announce(&self.paths.journal_rel())?;
        info!(volume = %self.name, "changes checked in");
        self.unlock(user).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // replay

    /// Apply all committed entries this host has not applied yet, in
    /// journal order.
    pub async fn update(&mut self, reboot_ok: bool) -> Result<UpdateOutcome, OpError> {
        if self.wip_bytes().is_some() {
            return Err(OpError::Pending);
        }
        self.pull_journal_and_lock().await?;

        let done = self.history.xid_set()?.clone();
        let pending: Vec<JournalEntry> = self
            .journal
            .entries()?
            .iter()
            .filter(|e| !done.contains(&e.xid))
            .cloned()
            .collect();
        if pending.is_empty() {
            info!(volume = %self.name, "no new updates");
            return Ok(UpdateOutcome::Applied(0));
        }

        let mut applied = 0;
        for entry in pending {
            if !entry.verify(&mut self.ring.write()) {
                warn!(volume = %self.name, xid = %entry.xid, "journal entry has a bad auth tag");
            }
            if let EntryKind::Reboot = entry.kind {
                if !reboot_ok {
                    return Err(OpError::Replay(format!(
                        "entry {} requests a reboot; re-run with reboot allowed",
                        entry.xid
                    )));
                }
                self.history.add(&entry)?;
                info!(volume = %self.name, xid = %entry.xid, "reboot pending");
                return Ok(UpdateOutcome::RebootPending);
            }
            self.apply(&entry, false).await?;
            self.history.add(&entry)?;
            applied += 1;
        }
        info!(volume = %self.name, applied, "update done");
        Ok(UpdateOutcome::Applied(applied))
    }

    /// Apply one entry to the local filesystem/command state. `staging` is
    /// true when the entry was authored here (the block is known present).
    async fn apply(&mut self, entry: &JournalEntry, staging: bool) -> Result<(), OpError> {
        match &entry.kind {
            EntryKind::Snap {
                pathname,
                block,
                uid,
                gid,
                mode,
                mtime,
                parents,
            } => {
                if !staging {
                    self.ensure_block(block).await?;
                }
                self.apply_snap(pathname, block, *uid, *gid, *mode, *mtime, parents)?;
                info!(volume = %self.name, path = %pathname, "updated");
                Ok(())
            }
            EntryKind::Exec { cmd, cwd } => {
                run_exec(cmd, cwd).await.map_err(|err| {
                    if staging {
                        OpError::Other(err)
                    } else {
                        OpError::Replay(format!("{err:#}"))
                    }
                })
            }
            EntryKind::Reboot => Ok(()),
        }
    }

    /// Make sure the block for `key` is present and verifies, fetching it
    /// from the mesh if missing. A fetched copy that does not hash to the
    /// expected key is deleted and re-fetched, up to a small retry bound.
    async fn ensure_block(&mut self, key: &BlockKey) -> Result<(), OpError> {
        let rel = self.paths.block_rel(key);
        for attempt in 0..BLOCK_FETCH_ATTEMPTS {
            if self.blocks.contains(key) {
                let data = self.blocks.get(key)?;
                if &BlockKey::compute(&data) == key {
                    return Ok(());
                }
                warn!(key = %key, attempt, "block failed verification, deleting bad copy");
                fs::remove_file(self.blocks.path(key)?)
                    .with_context(|| format!("failed to delete bad block {key}"))?;
            }
            self.pull(&[rel.as_str()]).await?;
        }
        Err(OpError::Other(anyhow!(
            "missing block {key} after {BLOCK_FETCH_ATTEMPTS} fetch attempts"
        )))
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_snap(
        &self,
        pathname: &str,
        block: &BlockKey,
        uid: u32,
        gid: u32,
        mode: u32,
        mtime: u64,
        parents: &[DirMeta],
    ) -> Result<()> {
        // journal entries come from peers; nothing in them may name a path
        // outside the volume root
        let dest = safe_join(&self.settings.volroot, pathname)
            .ok_or_else(|| anyhow!("unsafe pathname {pathname:?} in journal entry"))?;

        // recreate any missing parent directories with the recorded
        // mode/owner chain
        for dir in parents {
            let local = safe_join(&self.settings.volroot, &dir.path)
                .ok_or_else(|| anyhow!("unsafe parent dir {:?} in journal entry", dir.path))?;
            if !local.is_dir() {
                fs::create_dir(&local)
                    .with_context(|| format!("failed to create parent dir {local:?}"))?;
                fs::set_permissions(&local, fs::Permissions::from_mode(dir.mode))?;
                set_owner(&local, dir.uid, dir.gid);
            }
        }

        let data = self.blocks.get(block)?;
        let parent = dest.parent().ok_or_else(|| anyhow!("no parent for {dest:?}"))?;
        let name = dest
            .file_name()
            .ok_or_else(|| anyhow!("no file name in {dest:?}"))?;
        let tmp = parent.join(format!(".{}.tmp", name.to_string_lossy()));
        fs::write(&tmp, &data).with_context(|| format!("failed to write {tmp:?}"))?;
        fs::set_permissions(&tmp, fs::Permissions::from_mode(mode))?;
        set_owner(&tmp, uid, gid);
        filetime::set_file_mtime(&tmp, filetime::FileTime::from_unix_time(mtime as i64, 0))
            .with_context(|| format!("failed to set mtime on {tmp:?}"))?;
        fs::rename(&tmp, &dest)
            .with_context(|| format!("failed to rename {tmp:?} -> {dest:?}"))?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // fork / migrate

    /// Start a new volume as a copy of this one's committed history. The
    /// destination journal must be empty.
    pub async fn fork(&mut self, new_name: &str) -> Result<(), OpError> {
        let mut other = Volume::open(self.settings.clone(), self.ring.clone(), new_name)?;
        self.journal.copy(&mut other.journal)?;
        self.announce(&other.paths.journal_rel())?;
        info!(from = %self.name, to = %new_name, "forked volume");
        Ok(())
    }

    /// Move this host's history onto the volume `new_name`. Fails if the
    /// two journals have diverged; otherwise the destination ends up a
    /// superset of ours and this host can switch to it.
    pub async fn migrate(&mut self, new_name: &str) -> Result<(), OpError> {
        let mut other = Volume::open(self.settings.clone(), self.ring.clone(), new_name)?;
        self.journal.migrate(&mut other.journal, true)?;
        self.announce(&other.paths.journal_rel())?;
        info!(from = %self.name, to = %new_name, "migrated volume");
        Ok(())
    }
}

/// True when `a` is strictly newer than `b` (missing times are oldest).
fn newer_than(a: Option<SystemTime>, b: Option<SystemTime>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a > b,
        (Some(_), None) => true,
        _ => false,
    }
}

fn set_owner(path: &Path, uid: u32, gid: u32) {
    // needs privileges; a replica running unprivileged keeps going with
    // its own ownership
    if let Err(err) = chown(path, Some(uid), Some(gid)) {
        debug!(?path, uid, gid, "chown failed: {err}");
    }
}

/// Run one exec entry, streaming its output as it arrives.
async fn run_exec(cmd: &[String], cwd: &str) -> Result<()> {
    let cmdline = cmd.join(" ");
    info!(cwd, "running: {cmdline}");
    let mut child = tokio::process::Command::new(&cmd[0])
        .args(&cmd[1..])
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to spawn {cmdline}"))?;

    let stdout = child.stdout.take().ok_or_else(|| anyhow!("no stdout handle"))?;
    let stderr = child.stderr.take().ok_or_else(|| anyhow!("no stderr handle"))?;
    let out_task = async {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            info!("{line}");
        }
    };
    let err_task = async {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            warn!("{line}");
        }
    };
    let (status, _, _) = tokio::join!(child.wait(), out_task, err_task);
    let status = status.with_context(|| format!("failed to wait for {cmdline}"))?;
    if !status.success() {
        return Err(anyhow!("command failed with {status}: {cmdline}"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyRing;

    fn test_settings(dir: &Path) -> Arc<Settings> {
        let mut settings = Settings::new(dir.join("var"), "host1", "example.com");
        settings.volroot = dir.join("root");
        settings.pull_wait = Duration::ZERO;
        fs::create_dir_all(&settings.volroot).unwrap();
        Arc::new(settings)
    }

    fn test_volume(dir: &Path) -> Volume {
        let settings = test_settings(dir);
        Volume::open(settings, KeyRing::new(None).shared(), "generic").unwrap()
    }

    #[tokio::test]
    async fn test_lock_state_machine() {
        let dir = tempfile::tempdir().unwrap();
        let mut vol = test_volume(dir.path());

        // message required
        let err = vol.lock("alice", "  ").await.unwrap_err();
        assert_eq!(err.code(), 222);

        vol.lock("alice", "add file").await.unwrap();
        assert_eq!(vol.lock_holder().unwrap(), "alice@host1");
        assert_eq!(vol.lock_message(), "add file");

        // re-locking by the same holder is fine
        vol.lock("alice", "still my change").await.unwrap();

        // another user is refused
        let err = vol.lock("bob", "mine now").await.unwrap_err();
        assert_eq!(err.code(), 220);

        vol.unlock("alice").await.unwrap();
        assert!(vol.lock_holder().is_none());
        // lock file is empty, not gone
        assert!(vol.paths().lock.exists());

        vol.lock("bob", "mine now").await.unwrap();
        assert_eq!(vol.lock_holder().unwrap(), "bob@host1");
    }

    #[tokio::test]
    async fn test_snap_requires_lock_and_plain_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut vol = test_volume(dir.path());
        let target = dir.path().join("root/etc/foo");
        fs::create_dir_all(target.parent().unwrap()).unwrap();
        fs::write(&target, "bar").unwrap();

        let err = vol.snap("alice", &target).await.unwrap_err();
        assert_eq!(err.code(), 221);

        vol.lock("alice", "add foo").await.unwrap();
        let err = vol
            .snap("alice", &dir.path().join("root/etc/missing"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), 2);
        let err = vol
            .snap("alice", &dir.path().join("root/etc"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), 22);

        vol.snap("alice", &target).await.unwrap();
        // staged, applied and recorded locally
        assert!(vol.wip_bytes().is_some());
        assert_eq!(vol.history.xid_set().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_ci_and_replay_on_second_replica() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = test_volume(dir.path());
        let target = dir.path().join("root/etc/sub/foo");
        fs::create_dir_all(target.parent().unwrap()).unwrap();
        fs::write(&target, "bar").unwrap();
        fs::set_permissions(&target, fs::Permissions::from_mode(0o640)).unwrap();

        a.lock("alice", "add file").await.unwrap();
        a.snap("alice", &target).await.unwrap();
        a.ci("alice").await.unwrap();
        assert!(a.wip_bytes().is_none());
        assert!(a.lock_holder().is_none());

        // a second update on the author is a no-op
        assert_eq!(a.update(false).await.unwrap(), UpdateOutcome::Applied(0));

        // replica b shares the cache tree (same journal and block store)
        // but has its own volroot and private tree
        let dir_b = tempfile::tempdir().unwrap();
        let mut settings_b = Settings::new(dir_b.path().join("var"), "host2", "example.com");
        settings_b.volroot = dir_b.path().join("root");
        settings_b.pull_wait = Duration::ZERO;
        fs::create_dir_all(&settings_b.volroot).unwrap();
        let settings_b = Arc::new(settings_b);
        let mut b = Volume::open(settings_b.clone(), KeyRing::new(None).shared(), "generic").unwrap();
        // hand-carry the shared files, as if the mesh had synced them
        let paths_b = settings_b.volume_paths("generic");
        fs::create_dir_all(&paths_b.cachevol).unwrap();
        copy_tree(&a.paths().cachevol, &paths_b.cachevol);

        assert_eq!(b.update(false).await.unwrap(), UpdateOutcome::Applied(1));
        let replica_file = dir_b.path().join("root/etc/sub/foo");
        assert_eq!(fs::read(&replica_file).unwrap(), b"bar");
        let mode = fs::metadata(&replica_file).unwrap().permissions().mode() & 0o7777;
        assert_eq!(mode, 0o640);
        // parent dirs were recreated
        assert!(dir_b.path().join("root/etc/sub").is_dir());

        // idempotent
        assert_eq!(b.update(false).await.unwrap(), UpdateOutcome::Applied(0));
    }

    fn copy_tree(from: &Path, to: &Path) {
        for entry in fs::read_dir(from).unwrap() {
            let entry = entry.unwrap();
            let dst = to.join(entry.file_name());
            if entry.file_type().unwrap().is_dir() {
                fs::create_dir_all(&dst).unwrap();
                copy_tree(&entry.path(), &dst);
            } else {
                fs::copy(entry.path(), &dst).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_ci_conflict_on_concurrent_commit() {
        let dir = tempfile::tempdir().unwrap();
        let mut vol = test_volume(dir.path());
        let target = dir.path().join("root/foo");
        fs::write(&target, "one").unwrap();

        vol.lock("alice", "change").await.unwrap();
        vol.snap("alice", &target).await.unwrap();

        // another host's commit lands after we staged: journal becomes
        // newer than the wip file
        tokio::time::sleep(Duration::from_millis(1100)).await;
        let foreign = JournalEntry::new(
            EntryKind::Exec {
                cmd: vec!["true".into()],
                cwd: "/".into(),
            },
            "their change".into(),
            "host9",
        );
        vol.journal.add_raw(&foreign.to_frame()).unwrap();

        let err = vol.ci("alice").await.unwrap_err();
        assert_eq!(err.code(), 223);
        // wip intact, lock still held
        assert!(vol.wip_bytes().is_some());
        assert_eq!(vol.lock_holder().unwrap(), "alice@host1");
    }

    #[tokio::test]
    async fn test_exec_failure_halts_replay() {
        let dir = tempfile::tempdir().unwrap();
        let mut vol = test_volume(dir.path());
        let cwd = dir.path().to_string_lossy().to_string();

        // two foreign entries: a failing command, then a good one
        let bad = JournalEntry::new(
            EntryKind::Exec {
                cmd: vec!["false".into()],
                cwd: cwd.clone(),
            },
            "breaks".into(),
            "host9",
        );
        let good = JournalEntry::new(
            EntryKind::Exec {
                cmd: vec!["true".into()],
                cwd,
            },
            "fine".into(),
            "host9",
        );
        let mut frames = bad.to_frame();
        frames.extend(good.to_frame());
        vol.journal.add_raw(&frames).unwrap();

        let err = vol.update(false).await.unwrap_err();
        assert_eq!(err.code(), 224);
        // neither entry recorded: the failed one stays pending, the later
        // one was never reached
        assert!(vol.history.xid_set().unwrap().is_empty());

        // operator "fixes" the problem by rewriting the journal head
        // (simulating a repaired command) is out of scope; a rerun fails
        // the same way
        assert!(vol.update(false).await.is_err());
    }

    #[tokio::test]
    async fn test_update_refuses_with_pending_wip() {
        let dir = tempfile::tempdir().unwrap();
        let mut vol = test_volume(dir.path());
        let target = dir.path().join("root/foo");
        fs::write(&target, "one").unwrap();
        vol.lock("alice", "change").await.unwrap();
        vol.snap("alice", &target).await.unwrap();

        let err = vol.update(false).await.unwrap_err();
        assert!(matches!(err, OpError::Pending));
    }

    #[tokio::test]
    async fn test_reboot_entry_gates_on_flag() {
        let dir = tempfile::tempdir().unwrap();
        let mut vol = test_volume(dir.path());
        let entry = JournalEntry::new(EntryKind::Reboot, "kernel update".into(), "host9");
        vol.journal.add_raw(&entry.to_frame()).unwrap();

        let err = vol.update(false).await.unwrap_err();
        assert!(matches!(err, OpError::Replay(_)));
        assert!(vol.history.xid_set().unwrap().is_empty());

        assert_eq!(
            vol.update(true).await.unwrap(),
            UpdateOutcome::RebootPending
        );
        assert!(vol.history.xid_set().unwrap().contains(&entry.xid));
        // after the (virtual) reboot, nothing is pending
        assert_eq!(vol.update(true).await.unwrap(), UpdateOutcome::Applied(0));
    }

    #[tokio::test]
    async fn test_exec_staging_runs_command() {
        let dir = tempfile::tempdir().unwrap();
        let mut vol = test_volume(dir.path());
        let cwd = dir.path().to_string_lossy().to_string();
        vol.lock("alice", "touch marker").await.unwrap();
        vol.exec_cmd(
            "alice",
            vec!["touch".into(), "marker".into()],
            &cwd,
        )
        .await
        .unwrap();
        assert!(dir.path().join("marker").exists());

        // a failing command never reaches the wip file
        let before = vol.wip_bytes().unwrap().len();
        let err = vol
            .exec_cmd("alice", vec!["false".into()], &cwd)
            .await
            .unwrap_err();
        assert_eq!(err.code(), 224);
        assert_eq!(vol.wip_bytes().unwrap().len(), before);
    }

    #[tokio::test]
    async fn test_fork_and_migrate() {
        let dir = tempfile::tempdir().unwrap();
        let mut vol = test_volume(dir.path());
        let target = dir.path().join("root/foo");
        fs::write(&target, "one").unwrap();
        vol.lock("alice", "seed").await.unwrap();
        vol.snap("alice", &target).await.unwrap();
        vol.ci("alice").await.unwrap();

        vol.fork("staging").await.unwrap();
        let mut forked = Volume::open(
            vol.settings.clone(),
            vol.ring.clone(),
            "staging",
        )
        .unwrap();
        assert_eq!(
            forked.journal.entries().unwrap(),
            vol.journal.entries().unwrap()
        );

        // forking onto a non-empty destination fails
        assert!(vol.fork("staging").await.is_err());

        // migrating onto the same history is fine; onto a fork is not
        vol.migrate("staging").await.unwrap();
        let foreign = JournalEntry::new(EntryKind::Reboot, "divergent".into(), "host9");
        let mut diverged = Volume::open(vol.settings.clone(), vol.ring.clone(), "diverged").unwrap();
        diverged.journal.add_raw(&foreign.to_frame()).unwrap();
        assert!(vol.migrate("diverged").await.is_err());
    }

    #[tokio::test]
    async fn test_replay_rejects_malformed_block_keys() {
        // a journal fetched from a peer is untrusted input; entries whose
        // block key is not a well-formed digest pair must fail the parse,
        // not reach the filesystem
        #[derive(serde::Serialize)]
        enum RawKind {
            Snap {
                pathname: String,
                block: String,
                uid: u32,
                gid: u32,
                mode: u32,
                mtime: u64,
                parents: Vec<DirMeta>,
            },
        }
        #[derive(serde::Serialize)]
        struct RawEntry {
            xid: String,
            time: u64,
            message: String,
            auth: Option<String>,
            kind: RawKind,
        }
        fn frame(block: &str) -> Vec<u8> {
            let entry = RawEntry {
                xid: crate::journal::new_xid("host9"),
                time: crate::journal::unix_now(),
                message: "bad".into(),
                auth: None,
                kind: RawKind::Snap {
                    pathname: "/etc/foo".into(),
                    block: block.to_string(),
                    uid: 0,
                    gid: 0,
                    mode: 0o644,
                    mtime: 1_700_000_000,
                    parents: vec![],
                },
            };
            let body = postcard::to_stdvec(&entry).unwrap();
            let mut buf = (body.len() as u32).to_le_bytes().to_vec();
            buf.extend(body);
            buf
        }

        let dir = tempfile::tempdir().unwrap();
        let settings = test_settings(dir.path());
        let outside = dir.path().join("precious");
        fs::write(&outside, "keep me").unwrap();

        // a too-short key (would index out of bounds as a shard prefix)
        // and a traversal key aimed at a file outside the block store
        let bad_keys = ["x".to_string(), outside.display().to_string()];
        for (i, bad) in bad_keys.iter().enumerate() {
            let mut vol = Volume::open(
                settings.clone(),
                KeyRing::new(None).shared(),
                &format!("v{i}"),
            )
            .unwrap();
            vol.journal.add_raw(&frame(bad)).unwrap();
            let err = vol.update(false).await.unwrap_err();
            assert_eq!(err.code(), 224, "{bad}: {err:#}");
            assert!(vol.history.xid_set().unwrap().is_empty());
        }
        assert_eq!(fs::read(&outside).unwrap(), b"keep me");
    }

    #[tokio::test]
    async fn test_replay_refuses_paths_outside_volume_root() {
        let dir = tempfile::tempdir().unwrap();
        let mut vol = test_volume(dir.path());
        let key = vol.blocks.put(b"boom").unwrap();
        let entry = JournalEntry::new(
            EntryKind::Snap {
                pathname: "/../escape".into(),
                block: key.clone(),
                uid: 0,
                gid: 0,
                mode: 0o644,
                mtime: 1_700_000_000,
                parents: vec![],
            },
            "sneaky".into(),
            "host9",
        );
        vol.journal.add_raw(&entry.to_frame()).unwrap();
        let err = vol.update(false).await.unwrap_err();
        assert!(err.to_string().contains("unsafe pathname"), "{err:#}");
        assert!(!dir.path().join("escape").exists());
        assert!(vol.history.xid_set().unwrap().is_empty());

        // a poisoned parent-dir chain is refused the same way
        let mut vol2 = Volume::open(vol.settings.clone(), vol.ring.clone(), "v2").unwrap();
        let key2 = vol2.blocks.put(b"boom").unwrap();
        let entry = JournalEntry::new(
            EntryKind::Snap {
                pathname: "/etc/foo".into(),
                block: key2,
                uid: 0,
                gid: 0,
                mode: 0o644,
                mtime: 1_700_000_000,
                parents: vec![DirMeta {
                    path: "/../etc".into(),
                    mode: 0o755,
                    uid: 0,
                    gid: 0,
                }],
            },
            "sneaky".into(),
            "host9",
        );
        vol2.journal.add_raw(&entry.to_frame()).unwrap();
        let err = vol2.update(false).await.unwrap_err();
        assert!(err.to_string().contains("unsafe parent dir"), "{err:#}");
        assert!(!dir.path().join("etc").exists());
    }

    #[tokio::test]
    async fn test_update_deletes_corrupt_block_and_gives_up() {
        let dir = tempfile::tempdir().unwrap();
        let mut vol = test_volume(dir.path());
        let key = vol.blocks.put(b"good content").unwrap();
        // corrupt the stored copy behind the store's back
        fs::write(vol.blocks.path(&key).unwrap(), b"evil content!").unwrap();

        let entry = JournalEntry::new(
            EntryKind::Snap {
                pathname: "/foo".into(),
                block: key.clone(),
                uid: 0,
                gid: 0,
                mode: 0o644,
                mtime: 1_700_000_000,
                parents: vec![],
            },
            "corrupt".into(),
            "host9",
        );
        vol.journal.add_raw(&entry.to_frame()).unwrap();

        let err = vol.update(false).await.unwrap_err();
        assert!(err.to_string().contains("missing block"), "{err:#}");
        // the bad copy was deleted, never applied
        assert!(!vol.blocks.contains(&key));
        assert!(!dir.path().join("root/foo").exists());
        assert!(vol.history.xid_set().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_replay_determinism_on_fresh_replicas() {
        // build a journal with two snaps and replay it on two empty
        // replicas; both must end with identical bytes and histories
        let src = tempfile::tempdir().unwrap();
        let mut author = test_volume(src.path());
        let f1 = src.path().join("root/a.conf");
        let f2 = src.path().join("root/b.conf");
        fs::write(&f1, "first").unwrap();
        fs::write(&f2, "second").unwrap();
        author.lock("alice", "two files").await.unwrap();
        author.snap("alice", &f1).await.unwrap();
        author.snap("alice", &f2).await.unwrap();
        author.ci("alice").await.unwrap();

        let mut replicas = Vec::new();
        for host in ["r1", "r2"] {
            let dir = tempfile::tempdir().unwrap();
            let mut settings = Settings::new(dir.path().join("var"), host, "example.com");
            settings.volroot = dir.path().join("root");
            settings.pull_wait = Duration::ZERO;
            fs::create_dir_all(&settings.volroot).unwrap();
            let settings = Arc::new(settings);
            let mut vol =
                Volume::open(settings.clone(), KeyRing::new(None).shared(), "generic").unwrap();
            let paths = settings.volume_paths("generic");
            copy_tree(&author.paths().cachevol, &paths.cachevol);
            assert_eq!(vol.update(false).await.unwrap(), UpdateOutcome::Applied(2));
            let a = fs::read(dir.path().join("root/a.conf")).unwrap();
            let b = fs::read(dir.path().join("root/b.conf")).unwrap();
            let xids = vol.history.xid_set().unwrap().clone();
            replicas.push((a, b, xids, dir));
        }
        assert_eq!(replicas[0].0, replicas[1].0);
        assert_eq!(replicas[0].1, replicas[1].1);
        assert_eq!(replicas[0].2, replicas[1].2);
    }
}
