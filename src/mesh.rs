//! The cache mesh: UDP gossip plus authenticated HTTP fetch.
//!
//! One actor task owns the gossip socket and all transfer state. It polls
//! the two hand-off files: lines appended to the pull file become
//! outstanding `whohas` broadcasts, and lines appended to the announce
//! file become `ihave` broadcasts. When every outstanding pull has been
//! satisfied or has expired, the actor truncates the pull file back to
//! zero length; that is the completion signal volume operations wait on.
//!
//! Incoming `whohas` for a file we hold fresher is answered with `ihave`.
//! Incoming `ihave` for a file we hold staler triggers an HTTP fetch from
//! the sender, verified end to end: the HMAC challenge response, the
//! Last-Modified freshness check, the Content-Length byte count, and (for
//! blocks) the content digest checked later by the volume layer.

use std::{
    collections::{HashMap, HashSet},
    fs,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::Path,
    sync::Arc,
    time::{Duration, Instant, UNIX_EPOCH},
};

use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use tokio::{io::AsyncWriteExt, net::UdpSocket, sync::mpsc, task::JoinSet};
use tokio_util::{sync::CancellationToken, task::AbortOnDropHandle};
use tracing::{debug, info, trace, warn};

use crate::{
    config::{safe_join, Settings},
    http::HMAC_HEADER,
    journal::new_xid,
    keys::SharedKeyRing,
    proto::{self, Gossip, MAX_DATAGRAM},
};

/// Hand-off poll and housekeeping cadence.
const TICK: Duration = Duration::from_millis(500);
/// Minimum gap between rebroadcasts of the same outstanding `whohas`.
const RESEND_EVERY: Duration = Duration::from_millis(500);
/// Minimum gap between fetch attempts of the same URL.
const FETCH_HOLDOFF: Duration = Duration::from_secs(5);
/// Bounded send queue; datagrams past this are dropped, not queued.
const SENDQ_CAP: usize = 20;

/// Handle on the running mesh. The actor and its helper tasks stop when
/// this is dropped.
#[derive(Debug)]
pub struct CacheMesh {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    _task: AbortOnDropHandle<()>,
}

impl CacheMesh {
    /// Bind the gossip socket and start the actor.
    pub async fn spawn(settings: Arc<Settings>, ring: SharedKeyRing) -> Result<Self> {
        let bind: SocketAddr = (Ipv4Addr::UNSPECIFIED, settings.udp_port).into();
        let sock = UdpSocket::bind(bind)
            .await
            .with_context(|| format!("failed to bind gossip socket on {bind}"))?;
        if settings.broadcast {
            sock.set_broadcast(true)
                .context("failed to enable broadcast")?;
        }
        let local_addr = sock.local_addr()?;
        let sock = Arc::new(sock);
        info!(%local_addr, "gossip node up");

        let cancel = CancellationToken::new();
        let (sendq_tx, sendq_rx) = mpsc::channel(SENDQ_CAP);
        let sender = AbortOnDropHandle::new(tokio::spawn(send_loop(sock.clone(), sendq_rx)));

        let actor = Actor {
            tuid: new_xid(&settings.hostname),
            settings,
            ring,
            sock,
            sendq: sendq_tx,
            reqs: HashMap::new(),
            signal_due: false,
            fetching: HashSet::new(),
            recent: HashMap::new(),
            fetches: JoinSet::new(),
            cancel: cancel.clone(),
            _sender: sender,
        };
        let task = tokio::spawn(async move {
            if let Err(err) = actor.run().await {
                warn!("mesh actor failed: {err:#}");
            }
        });
        Ok(Self {
            local_addr,
            cancel,
            _task: AbortOnDropHandle::new(task),
        })
    }

    /// The bound gossip address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop the actor.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

/// One outstanding pull, keyed by cache-relative path in [`Actor::reqs`].
#[derive(Debug)]
struct PullRequest {
    /// The sealed `whohas`, rebroadcast until answered or expired.
    msg: Bytes,
    expires: Instant,
    last_sent: Instant,
    state: ReqState,
}

#[derive(Debug, PartialEq, Eq)]
enum ReqState {
    /// Still asking around.
    Start,
    /// A peer answered and a fetch is in flight.
    SendMe,
}

#[derive(Debug)]
struct FetchDone {
    file: String,
    ok: bool,
}

struct Actor {
    settings: Arc<Settings>,
    ring: SharedKeyRing,
    sock: Arc<UdpSocket>,
    tuid: String,
    sendq: mpsc::Sender<(Bytes, Vec<SocketAddr>)>,
    reqs: HashMap<String, PullRequest>,
    /// Set once pull lines were taken; cleared when the drained table is
    /// signalled back through the pull file.
    signal_due: bool,
    fetching: HashSet<String>,
    /// Per-URL anti-hammer stamps.
    recent: HashMap<String, Instant>,
    fetches: JoinSet<FetchDone>,
    cancel: CancellationToken,
    _sender: AbortOnDropHandle<()>,
}

impl Actor {
    async fn run(mut self) -> Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                res = self.sock.recv_from(&mut buf) => {
                    match res {
                        Ok((len, from)) => self.handle_datagram(&buf[..len], from),
                        Err(err) => {
                            // transient (ENOBUFS, ICMP-delivered refusals on
                            // some platforms); the socket itself is fine
                            warn!("gossip socket recv failed, continuing: {err}");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
                _ = tick.tick() => {
                    self.drain_announce();
                    self.take_pull_requests();
                    self.resend();
                }
                Some(done) = self.fetches.join_next(), if !self.fetches.is_empty() => {
                    match done {
                        Ok(done) => self.fetch_done(done),
                        Err(err) => warn!("fetch task panicked: {err}"),
                    }
                }
            }
        }
        debug!("mesh actor stopped");
        Ok(())
    }

    // --------------------------------------------------------------
    // hand-off files

    /// Broadcast `ihave` for every line queued in the announce file.
    ///
    /// The file is renamed aside before reading, so a line appended
    /// concurrently by a volume task lands in a fresh file for the next
    /// tick instead of being truncated away unseen.
    fn drain_announce(&mut self) {
        let file = self.settings.announce_file();
        let side = file.with_extension("sending");
        // leftovers from a crash mid-drain go out first
        if let Ok(stale) = fs::read_to_string(&side) {
            self.send_lines(&stale);
            let _ = fs::remove_file(&side);
        }
        match fs::metadata(&file) {
            Ok(meta) if meta.len() > 0 => {}
            _ => return,
        }
        if let Err(err) = fs::rename(&file, &side) {
            warn!(?file, "failed to take announce file: {err}");
            return;
        }
        let Ok(data) = fs::read_to_string(&side) else {
            return;
        };
        self.send_lines(&data);
        let _ = fs::remove_file(&side);
    }

    fn send_lines(&mut self, data: &str) {
        let lines: HashSet<&str> = data.lines().filter(|l| !l.trim().is_empty()).collect();
        for rel in lines {
            self.send_ihave(rel.trim(), None);
        }
    }

    /// Turn queued pull lines into outstanding `whohas` requests.
    ///
    /// The pull file is renamed aside before parsing so concurrent appends
    /// land in a fresh file for the next tick. A leftover side file from a
    /// crash is folded back in first.
    fn take_pull_requests(&mut self) {
        let pull = self.settings.pull_file();
        let side = pull.with_extension("taking");
        if let Ok(stale) = fs::read(&side) {
            if !stale.is_empty() {
                debug!("recovering interrupted pull hand-off");
                if append_to(&pull, &stale).is_err() {
                    return;
                }
            }
            let _ = fs::remove_file(&side);
        }
        match fs::metadata(&pull) {
            Ok(meta) if meta.len() > 0 => {}
            _ => {
                self.maybe_signal();
                return;
            }
        }
        if let Err(err) = fs::rename(&pull, &side) {
            warn!(?pull, "failed to take pull file: {err}");
            return;
        }
        let Ok(data) = fs::read_to_string(&side) else {
            return;
        };
        for rel in data.lines().map(str::trim).filter(|l| !l.is_empty()) {
            self.want(rel);
        }
        let _ = fs::remove_file(&side);
        self.signal_due = true;
        self.maybe_signal();
    }

    /// Once the request table has drained, hand completion back to the
    /// volume layer by leaving the pull file present and empty.
    fn maybe_signal(&mut self) {
        if !self.signal_due || !self.reqs.is_empty() || !self.fetching.is_empty() {
            return;
        }
        let pull = self.settings.pull_file();
        if !pull.exists() {
            if let Err(err) = append_to(&pull, b"") {
                warn!(?pull, "failed to signal pull completion: {err}");
                return;
            }
        }
        self.signal_due = false;
    }

    /// Register an outstanding request for `rel` and broadcast `whohas`.
    fn want(&mut self, rel: &str) {
        if self.reqs.contains_key(rel) || self.fetching.contains(rel) {
            return;
        }
        let newer = self.effective_mtime(rel);
        let msg = Gossip::Whohas {
            file: rel.to_string(),
            newer,
            tuid: self.tuid.clone(),
        };
        let sealed = proto::seal(&msg, &mut self.ring.write());
        trace!(file = rel, newer, "asking for a fresher copy");
        self.bcast(sealed.clone(), None);
        self.reqs.insert(
            rel.to_string(),
            PullRequest {
                msg: sealed,
                expires: Instant::now() + self.settings.pull_timeout,
                last_sent: Instant::now(),
                state: ReqState::Start,
            },
        );
    }

    /// Rebroadcast unanswered requests; expire the ones nobody answered.
    fn resend(&mut self) {
        let now = Instant::now();
        self.recent.retain(|_, at| now.duration_since(*at) < FETCH_HOLDOFF);
        let mut expired = Vec::new();
        let mut again = Vec::new();
        for (file, req) in &mut self.reqs {
            if req.state != ReqState::Start {
                continue;
            }
            if now > req.expires {
                expired.push(file.clone());
                continue;
            }
            if now.duration_since(req.last_sent) >= RESEND_EVERY {
                req.last_sent = now;
                again.push(req.msg.clone());
            }
        }
        for msg in again {
            self.bcast(msg, None);
        }
        for file in expired {
            debug!(file = %file, "nobody has a fresher copy, giving up");
            self.reqs.remove(&file);
        }
        self.maybe_signal();
    }

    // --------------------------------------------------------------
    // gossip in

    fn handle_datagram(&mut self, data: &[u8], from: SocketAddr) {
        let msg = match proto::open(data, &mut self.ring.write()) {
            Ok(msg) => msg,
            Err(err) => {
                debug!(%from, "dropping datagram: {err}");
                return;
            }
        };
        if msg.tuid() == self.tuid {
            return;
        }
        trace!(%from, ?msg, "gossip");
        match msg {
            Gossip::Whohas { file, newer, .. } => self.on_whohas(&file, newer, from),
            Gossip::Ihave {
                file,
                mtime,
                port,
                scheme,
                ..
            } => self.on_ihave(&file, mtime, port, &scheme, from),
        }
    }

    fn on_whohas(&mut self, file: &str, newer: u64, from: SocketAddr) {
        let Some(full) = safe_join(&self.settings.cache_dir(), file) else {
            warn!(%from, file, "refusing request outside the cache tree");
            return;
        };
        let Ok(meta) = fs::symlink_metadata(&full) else {
            return;
        };
        if !meta.is_file() {
            return;
        }
        let mtime = mtime_secs(&meta);
        if mtime > newer {
            self.send_ihave(file, Some(from));
        }
    }

    fn on_ihave(&mut self, file: &str, mtime: u64, port: u16, scheme: &str, from: SocketAddr) {
        let domain_prefix = format!("{}/", self.settings.domain);
        if !file.starts_with(&domain_prefix) {
            debug!(%from, file, "ignoring advertisement outside our domain");
            return;
        }
        if safe_join(&self.settings.cache_dir(), file).is_none() {
            warn!(%from, file, "refusing advertisement outside the cache tree");
            return;
        }
        let local = self.effective_mtime(file);
        if mtime > local {
            self.start_fetch(file, from.ip(), port, scheme, local);
        } else if local > mtime {
            // they are behind; tell them
            self.send_ihave(file, Some(from));
        }
    }

    // --------------------------------------------------------------
    // gossip out

    fn local_mtime(&self, rel: &str) -> Option<u64> {
        let full = safe_join(&self.settings.cache_dir(), rel)?;
        fs::symlink_metadata(full).ok().map(|m| mtime_secs(&m))
    }

    /// The freshness of our copy as seen when deciding whether to fetch.
    /// Empty files are the ground state of journals and released locks, so
    /// they never mask a non-empty remote copy. Advertisements
    /// ([`Actor::send_ihave`]) carry the real mtime, which is what lets a
    /// released (empty) lock still propagate.
    fn effective_mtime(&self, rel: &str) -> u64 {
        let Some(full) = safe_join(&self.settings.cache_dir(), rel) else {
            return 0;
        };
        match fs::symlink_metadata(full) {
            Ok(meta) if meta.len() > 0 => mtime_secs(&meta),
            _ => 0,
        }
    }

    /// Advertise our copy of `rel` to the peers (and to `also`, typically
    /// the host that just asked).
    fn send_ihave(&mut self, rel: &str, also: Option<SocketAddr>) {
        let Some(mtime) = self.local_mtime(rel) else {
            warn!(file = rel, "not advertising a file that is gone");
            return;
        };
        let msg = Gossip::Ihave {
            file: rel.to_string(),
            mtime,
            port: self.settings.http_port,
            scheme: "http".to_string(),
            tuid: self.tuid.clone(),
        };
        let sealed = proto::seal(&msg, &mut self.ring.write());
        self.bcast(sealed, also);
    }

    fn targets(&self, also: Option<SocketAddr>) -> Vec<SocketAddr> {
        let mut targets = self.settings.peers.clone();
        if self.settings.broadcast {
            targets.push((Ipv4Addr::BROADCAST, self.settings.udp_port).into());
        }
        if let Some(addr) = also {
            if !targets.contains(&addr) {
                targets.push(addr);
            }
        }
        targets
    }

    fn bcast(&mut self, msg: Bytes, also: Option<SocketAddr>) {
        let targets = self.targets(also);
        self.enqueue(msg, targets);
    }

    fn enqueue(&mut self, msg: Bytes, targets: Vec<SocketAddr>) {
        if targets.is_empty() {
            return;
        }
        if self.sendq.try_send((msg, targets)).is_err() {
            debug!("send queue full, dropping datagram");
        }
    }

    // --------------------------------------------------------------
    // fetch

    fn start_fetch(&mut self, file: &str, ip: IpAddr, port: u16, scheme: &str, local_mtime: u64) {
        if self.fetching.contains(file) {
            return;
        }
        let base_url = format!("{scheme}://{ip}:{port}/{file}");
        let now = Instant::now();
        if let Some(at) = self.recent.get(&base_url) {
            if now.duration_since(*at) < FETCH_HOLDOFF {
                trace!(url = %base_url, "recently tried this source, holding off");
                return;
            }
        }
        self.recent.insert(base_url.clone(), now);
        self.fetching.insert(file.to_string());
        if let Some(req) = self.reqs.get_mut(file) {
            req.state = ReqState::SendMe;
        }
        let file = file.to_string();
        let cache_root = self.settings.cache_dir();
        let ring = self.ring.clone();
        self.fetches.spawn(async move {
            let ok = match wget(&cache_root, &file, &base_url, ring, local_mtime).await {
                Ok(()) => true,
                Err(err) => {
                    debug!(file = %file, url = %base_url, "fetch failed: {err:#}");
                    false
                }
            };
            FetchDone { file, ok }
        });
    }

    fn fetch_done(&mut self, done: FetchDone) {
        self.fetching.remove(&done.file);
        if done.ok {
            self.reqs.remove(&done.file);
            info!(file = %done.file, "fetched a fresher copy");
            // pass the news along
            self.send_ihave(&done.file, None);
        } else if let Some(req) = self.reqs.get_mut(&done.file) {
            req.state = ReqState::Start;
            req.expires = Instant::now() + self.settings.pull_timeout;
        }
        self.maybe_signal();
    }
}

/// Fetch one cache file over HTTP and install it atomically.
///
/// Nothing about the transfer is trusted: the server must answer our
/// challenge with a valid HMAC, its copy must be strictly newer than
/// ours, and the body must be exactly Content-Length bytes.
async fn wget(
    cache_root: &Path,
    file: &str,
    base_url: &str,
    ring: SharedKeyRing,
    local_mtime: u64,
) -> Result<()> {
    let challenge = format!("{:032x}", rand::random::<u128>());
    let url = format!("{base_url}?challenge={challenge}");
    let resp = reqwest::get(&url)
        .await
        .with_context(|| format!("request to {base_url} failed"))?;
    if !resp.status().is_success() {
        bail!("server answered {}", resp.status());
    }

    let tag = resp
        .headers()
        .get(HMAC_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    if !ring.write().check(&challenge, tag.as_deref()) {
        bail!("bad or missing {HMAC_HEADER} response to our challenge");
    }

    let modified = resp
        .headers()
        .get(reqwest::header::LAST_MODIFIED)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| httpdate::parse_http_date(v).ok())
        .ok_or_else(|| anyhow!("no usable Last-Modified header"))?;
    let modified_secs = modified
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    if modified_secs <= local_mtime {
        bail!("server copy is not newer than ours");
    }
    let want_len = resp.content_length();

    let full = safe_join(cache_root, file).ok_or_else(|| anyhow!("unsafe path {file}"))?;
    let parent = full
        .parent()
        .ok_or_else(|| anyhow!("no parent for {full:?}"))?;
    tokio::fs::create_dir_all(parent).await?;
    let name = full
        .file_name()
        .ok_or_else(|| anyhow!("no file name in {full:?}"))?;
    let tmp = parent.join(format!(".{}.tmp", name.to_string_lossy()));

    let mut resp = resp;
    let stream = async {
        let mut out = tokio::fs::File::create(&tmp)
            .await
            .with_context(|| format!("failed to create {tmp:?}"))?;
        let mut got_len = 0u64;
        while let Some(chunk) = resp.chunk().await? {
            out.write_all(&chunk).await?;
            got_len += chunk.len() as u64;
        }
        out.sync_all().await?;
        if let Some(want) = want_len {
            if got_len != want {
                bail!("short transfer: got {got_len} of {want} bytes");
            }
        }
        anyhow::Ok(())
    };
    // a failed transfer must leave no trace, neither the final path nor
    // the temp file
    if let Err(err) = stream.await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(err);
    }

    filetime::set_file_mtime(&tmp, filetime::FileTime::from_system_time(modified))
        .with_context(|| format!("failed to set mtime on {tmp:?}"))?;
    tokio::fs::rename(&tmp, &full)
        .await
        .with_context(|| format!("failed to rename {tmp:?} -> {full:?}"))?;
    Ok(())
}

fn mtime_secs(meta: &fs::Metadata) -> u64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

async fn send_loop(sock: Arc<UdpSocket>, mut rx: mpsc::Receiver<(Bytes, Vec<SocketAddr>)>) {
    while let Some((msg, targets)) = rx.recv().await {
        for addr in targets {
            if let Err(err) = sock.send_to(&msg, addr).await {
                // transient; wait out things like ENOBUFS and try once more
                debug!(%addr, "send failed, backing off: {err}");
                tokio::time::sleep(Duration::from_secs(1)).await;
                if let Err(err) = sock.send_to(&msg, addr).await {
                    warn!(%addr, "dropping datagram: {err}");
                }
            }
        }
    }
}

fn append_to(path: &Path, data: &[u8]) -> Result<()> {
    use std::io::Write;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut f = fs::OpenOptions::new().append(true).create(true).open(path)?;
    f.write_all(data)?;
    Ok(())
}
