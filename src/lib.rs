/// Meridian - a personal data server for the AT Protocol.
///
/// Hosts content-addressed, signed repositories for many accounts, applies
/// record writes through a Merkle Search Tree, streams every mutation over
/// an ordered firehose, and fronts the whole thing with legacy sessions and
/// OAuth 2.1 (PKCE + PAR + DPoP).
pub mod account;
pub mod api;
pub mod blob;
pub mod config;
pub mod context;
pub mod crypto;
pub mod db;
pub mod error;
pub mod federation;
pub mod jobs;
pub mod metrics;
pub mod models;
pub mod oauth;
pub mod repo;
pub mod repo_writer;
pub mod sequencer;
pub mod server;
