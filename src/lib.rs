//! Peer-to-peer configuration distribution.
//!
//! Hosts in a trust domain share an append-only journal of configuration
//! changes per volume. Changes are staged on one host under an advisory
//! volume lock, checked in with an optimistic concurrency check, and
//! replayed deterministically on every other host. File contents travel
//! as content-addressed blocks through a gossip-driven cache mesh, so any
//! peer can serve any other.
//!
//! The building blocks:
//!
//! - [`config::Settings`]: the host's identity, directory layout and
//!   network endpoints.
//! - [`blobs::BlockStore`]: content-addressed file bodies.
//! - [`journal::Journal`] and [`journal::History`]: the shared change log
//!   and the private applied-entry log.
//! - [`keys::KeyRing`]: reloadable shared HMAC keys authenticating both
//!   gossip and fetches.
//! - [`volume::Volume`]: lock, snapshot, exec, check-in and replay.
//! - [`mesh::CacheMesh`] and [`http::CacheServer`]: the transfer plane.

#![recursion_limit = "256"]
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod blobs;
pub mod config;
pub mod http;
pub mod journal;
pub mod keys;
pub mod mesh;
pub mod proto;
pub mod volume;

pub use self::{
    config::Settings,
    http::CacheServer,
    keys::KeyRing,
    mesh::CacheMesh,
    volume::{OpError, UpdateOutcome, Volume},
};
