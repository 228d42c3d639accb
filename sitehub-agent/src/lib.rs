//! Agent side of the SiteHub protocol.
//!
//! A site holds a [`client::HubClient`] built from its issued credentials,
//! registers once ([`state::ensure_registered`]), routes hook output through
//! an [`queue::ErrorQueue`] and keeps a [`runtime::Agent`] running for
//! heartbeats, batch flushes and hub commands.

pub mod client;
pub mod error;
pub mod hooks;
pub mod queue;
pub mod runtime;
pub mod state;

pub use client::{Credentials, HubClient};
pub use error::{AgentError, Result};
pub use runtime::{Agent, AgentConfig, Site};
