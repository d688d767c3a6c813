// VPN Session Bridge Library
// Shared modules for the daemon and tests

#![warn(missing_docs)]

//! VPN Session Bridge Library
//!
//! This library relays VPN session control between an application layer and
//! the host operating system's VPN facility. It provisions a tunnel
//! registration, starts and stops it with caller-supplied credentials, and
//! forwards status transitions to a single listener.
//!
//! # Main Components
//!
//! - [`backend`]: OS VPN facility abstraction plus NetworkManager and in-memory backends
//! - [`broker`]: Single-slot status publisher
//! - [`channel`]: Method-call dispatch and wire types for the stdio transport
//! - [`config`]: Configuration file parsing and validation
//! - [`error`]: Error taxonomy surfaced to callers
//! - [`facade`]: The control entry point
//! - [`profile_store`]: Tunnel profile descriptor storage
//! - [`shared_store`]: Group-scoped values shared with the tunnel provider
//! - [`status`]: OS status translation and subscription handles
//! - [`tunnel_controller`]: Registration lifecycle against the OS
//! - [`types`]: Shared data structures

pub mod backend;
pub mod broker;
pub mod channel;
pub mod config;
pub mod error;
pub mod facade;
pub mod profile_store;
pub mod shared_store;
pub mod status;
pub mod tunnel_controller;
pub mod types;

pub use error::{BackendError, Error, Result};
pub use facade::ControlFacade;
pub use types::{Credentials, Profile, SessionStatus};
