//! Chat bot
//!
//! The WebSocket transport to the chat gateway, the typed event model, and
//! the command dispatcher that turns group messages into control-plane
//! operations.

pub mod commands;
pub mod dispatcher;
pub mod event;
pub mod transport;

pub use dispatcher::BotDispatcher;
pub use transport::{BotNotifier, BotTransport};
