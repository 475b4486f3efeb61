//! HTTP server for the shared cache tree.
//!
//! Peers fetch journal, lock and block files from here after hearing an
//! `ihave`. The server is read-only and serves exactly the cache tree,
//! nothing else. Requests may carry a `challenge` query parameter; the
//! response then includes an `x-hmac` header proving possession of a
//! shared key, which the fetching side verifies before trusting the body.

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    extract::{Path as UrlPath, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio_util::{sync::CancellationToken, task::AbortOnDropHandle};
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::{config::safe_join, keys::SharedKeyRing};

/// Response header carrying the HMAC of the request's challenge.
pub const HMAC_HEADER: &str = "x-hmac";

#[derive(Debug, Clone)]
struct AppState {
    cache_root: Arc<PathBuf>,
    ring: SharedKeyRing,
}

#[derive(Debug, Deserialize)]
struct FetchQuery {
    challenge: Option<String>,
}

/// A running cache server. Shuts down when dropped.
#[derive(Debug)]
pub struct CacheServer {
    addr: SocketAddr,
    cancel: CancellationToken,
    _task: AbortOnDropHandle<()>,
}

impl CacheServer {
    /// Serve `cache_root` on `addr`. Pass port 0 to pick a free port and
    /// read it back from [`CacheServer::addr`].
    pub async fn bind(addr: SocketAddr, cache_root: PathBuf, ring: SharedKeyRing) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind http server on {addr}"))?;
        let addr = listener.local_addr()?;
        info!(%addr, root = ?cache_root, "cache server listening");

        let state = AppState {
            cache_root: Arc::new(cache_root),
            ring,
        };
        let app = Router::new()
            .route("/{*path}", get(fetch))
            .layer(TraceLayer::new_for_http())
            .with_state(state);

        let cancel = CancellationToken::new();
        let shutdown = cancel.clone();
        let task = tokio::spawn(async move {
            let serve = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await });
            if let Err(err) = serve.await {
                debug!("cache server stopped: {err:#}");
            }
        });
        Ok(Self {
            addr,
            cancel,
            _task: AbortOnDropHandle::new(task),
        })
    }

    /// The address the server is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Begin a graceful shutdown.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

async fn fetch(
    State(state): State<AppState>,
    UrlPath(path): UrlPath<String>,
    Query(query): Query<FetchQuery>,
) -> impl IntoResponse {
    let Some(full) = safe_join(&state.cache_root, &path) else {
        debug!(%path, "refusing path outside the cache tree");
        return StatusCode::NOT_FOUND.into_response();
    };
    let Ok(meta) = tokio::fs::symlink_metadata(&full).await else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if !meta.is_file() {
        return StatusCode::NOT_FOUND.into_response();
    }
    let body = match tokio::fs::read(&full).await {
        Ok(body) => body,
        Err(err) => {
            debug!(?full, "failed to read cache file: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let mut headers = HeaderMap::new();
    if let Ok(modified) = meta.modified() {
        if let Ok(value) = HeaderValue::from_str(&httpdate::fmt_http_date(modified)) {
            headers.insert(header::LAST_MODIFIED, value);
        }
    }
    if let Some(challenge) = query.challenge.as_deref() {
        if let Some(response) = state.ring.write().response(challenge) {
            if let Ok(value) = HeaderValue::from_str(&response) {
                headers.insert(HMAC_HEADER, value);
            }
        }
    }
    (headers, body).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyRing;
    use std::{fs, time::Duration};

    async fn serve(dir: &std::path::Path, ring: SharedKeyRing) -> CacheServer {
        CacheServer::bind("127.0.0.1:0".parse().unwrap(), dir.to_path_buf(), ring)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_serves_cache_files_with_last_modified() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("example.com/volume/g");
        fs::create_dir_all(&sub).unwrap();
        fs::write(sub.join("journal"), b"framed bytes").unwrap();

        let server = serve(dir.path(), KeyRing::new(None).shared()).await;
        let url = format!("http://{}/example.com/volume/g/journal", server.addr());
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        let modified = resp.headers().get(header::LAST_MODIFIED).unwrap();
        httpdate::parse_http_date(modified.to_str().unwrap()).unwrap();
        assert_eq!(
            resp.headers().get(header::CONTENT_LENGTH).unwrap(),
            &b"framed bytes".len().to_string()
        );
        assert_eq!(resp.bytes().await.unwrap().as_ref(), b"framed bytes");
    }

    #[tokio::test]
    async fn test_refuses_traversal_and_non_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("example.com")).unwrap();
        let secret = dir.path().parent().unwrap().join("secret");
        fs::write(&secret, "no").ok();

        let server = serve(dir.path(), KeyRing::new(None).shared()).await;
        for path in ["../secret", "a/../../secret", "example.com", "missing"] {
            let url = format!("http://{}/{}", server.addr(), path);
            let resp = reqwest::get(&url).await.unwrap();
            assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND, "{path}");
        }
    }

    #[tokio::test]
    async fn test_challenge_response_header() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("file"), b"x").unwrap();
        let keyfile = dir.path().join("keys");
        fs::write(&keyfile, "sekrit\n").unwrap();
        let ring = KeyRing::with_check_interval(Some(keyfile.clone()), Duration::ZERO).shared();

        let server = serve(dir.path(), ring).await;
        let url = format!("http://{}/file?challenge=abc123", server.addr());
        let resp = reqwest::get(&url).await.unwrap();
        let tag = resp.headers().get(HMAC_HEADER).unwrap().to_str().unwrap();

        let mut verifier = KeyRing::with_check_interval(Some(keyfile), Duration::ZERO);
        assert!(verifier.check("abc123", Some(tag)));
        assert!(!verifier.check("other", Some(tag)));

        // no challenge, no header
        let url = format!("http://{}/file", server.addr());
        let resp = reqwest::get(&url).await.unwrap();
        assert!(resp.headers().get(HMAC_HEADER).is_none());
    }
}
