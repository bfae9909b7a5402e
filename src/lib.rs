//! FireFrp management server
//!
//! Control plane for a pool of short-lived, authenticated TCP reverse
//! tunnels on top of an external frps daemon:
//! - `core/`: credential lifecycle state machine, port allocator, reject set,
//!   expiry scheduler, composite single-writer state
//! - `frps/`: subprocess provisioning, config generation, supervision, admin
//!   API client
//! - `http/`: client API, plugin callback endpoint, rate limiting
//! - `bot/`: chat gateway transport, event model, command dispatcher

pub mod app;
pub mod bot;
pub mod config;
pub mod core;
pub mod error;
pub mod frps;
pub mod games;
pub mod http;
pub mod logger;
pub mod motd;
pub mod store;
pub mod update;
