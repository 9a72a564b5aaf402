//! # beaconsync-server
//!
//! Daemon library for the beaconsync beacon relay.
//!
//! Wires the core scheduler to a radio backend, an HTTP transport and a
//! sleep inhibitor, and exposes a small local control API for starting,
//! stopping, reconfiguring and watching the relay.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

pub mod api;
pub mod backend;
pub mod logging;
pub mod state;
