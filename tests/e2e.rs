//! Two hosts on loopback: one stages and checks in a change, the other
//! hears about it over gossip, fetches journal and block over HTTP, and
//! replays it into its own volume root.

use std::{fs, net::IpAddr, os::unix::fs::PermissionsExt, path::Path, sync::Arc, time::Duration};

use confmesh::{
    config::Settings,
    http::CacheServer,
    keys::KeyRing,
    mesh::CacheMesh,
    volume::{UpdateOutcome, Volume},
};

struct Host {
    settings: Arc<Settings>,
    _server: CacheServer,
    mesh: CacheMesh,
    _dir: tempfile::TempDir,
}

async fn start_host(hostname: &str, keyfile: &Path, peers: Vec<std::net::SocketAddr>) -> Host {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = Settings::new(dir.path().join("var"), hostname, "example.com");
    settings.volroot = dir.path().join("root");
    settings.udp_port = 0;
    settings.broadcast = false;
    settings.peers = peers;
    settings.key_file = Some(keyfile.to_path_buf());
    settings.pull_timeout = Duration::from_millis(500);
    settings.pull_wait = Duration::from_secs(20);
    fs::create_dir_all(&settings.volroot).unwrap();
    fs::create_dir_all(settings.cache_dir()).unwrap();
    fs::create_dir_all(settings.private_dir()).unwrap();

    let ring = KeyRing::with_check_interval(Some(keyfile.to_path_buf()), Duration::ZERO).shared();
    let server = CacheServer::bind(
        "127.0.0.1:0".parse().unwrap(),
        settings.cache_dir(),
        ring.clone(),
    )
    .await
    .unwrap();
    settings.http_port = server.addr().port();
    let settings = Arc::new(settings);
    let mesh = CacheMesh::spawn(settings.clone(), ring).await.unwrap();
    Host {
        settings,
        _server: server,
        mesh,
        _dir: dir,
    }
}

fn host_ring(host: &Host) -> confmesh::keys::SharedKeyRing {
    KeyRing::with_check_interval(host.settings.key_file.clone(), Duration::ZERO).shared()
}

#[tokio::test]
async fn test_change_propagates_between_hosts() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let keydir = tempfile::tempdir().unwrap();
    let keyfile = keydir.path().join("keys");
    fs::write(&keyfile, "shared-secret\n").unwrap();

    // host a first; its gossip address seeds host b's peer list
    let a = start_host("hosta", &keyfile, vec![]).await;
    let a_addr = ("127.0.0.1".parse::<IpAddr>().unwrap(), a.mesh.local_addr().port()).into();
    let b = start_host("hostb", &keyfile, vec![a_addr]).await;

    // stage and check in a change on a
    let mut vol_a = Volume::open(a.settings.clone(), host_ring(&a), "generic").unwrap();
    let target = a.settings.volroot.join("etc/motd");
    fs::create_dir_all(target.parent().unwrap()).unwrap();
    fs::write(&target, "all your base\n").unwrap();
    fs::set_permissions(&target, fs::Permissions::from_mode(0o640)).unwrap();

    vol_a.lock("alice", "roll out motd").await.unwrap();
    vol_a.snap("alice", &target).await.unwrap();
    vol_a.ci("alice").await.unwrap();
    assert!(vol_a.lock_holder().is_none());

    // replay on b pulls the journal, the lock and the block over the mesh
    let mut vol_b = Volume::open(b.settings.clone(), host_ring(&b), "generic").unwrap();
    let outcome = vol_b.update(false).await.unwrap();
    assert_eq!(outcome, UpdateOutcome::Applied(1));

    let replica = b.settings.volroot.join("etc/motd");
    assert_eq!(fs::read(&replica).unwrap(), b"all your base\n");
    let mode = fs::metadata(&replica).unwrap().permissions().mode() & 0o7777;
    assert_eq!(mode, 0o640);
    // the replayed file carries the recorded mtime, not the transfer time
    let staged = fs::metadata(&target).unwrap().modified().unwrap();
    let applied = fs::metadata(&replica).unwrap().modified().unwrap();
    let skew = staged
        .duration_since(applied)
        .unwrap_or_else(|e| e.duration());
    assert!(skew <= Duration::from_secs(1), "mtime skew {skew:?}");

    // a second run has nothing new
    assert_eq!(vol_b.update(false).await.unwrap(), UpdateOutcome::Applied(0));

    // b can take its turn at the lock now that a released it
    vol_b.lock("bob", "my turn").await.unwrap();
    assert_eq!(vol_b.lock_holder().unwrap(), "bob@hostb");
    vol_b.unlock("bob").await.unwrap();
}
