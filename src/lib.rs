//! Client-side session manager for the EasyErgo language server.
//!
//! Launches the server, drives the initialize handshake, routes requests to
//! whichever session is current, and restarts it on configuration or
//! environment changes without ever running two servers at once.

pub mod config;
pub mod host;
pub mod log;
pub mod process;
pub mod rpc;
pub mod session;
pub mod trigger;
