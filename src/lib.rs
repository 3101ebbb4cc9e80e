//! `pairing_daemon` — the security and connectivity substrate for a
//! background daemon that lets a mobile client control terminal sessions on
//! a host workstation.
//!
//! This crate covers exactly the core described in the project's design
//! documents: key and message cryptography, mutual challenge-response
//! authentication, pairing/reconnection orchestration, and ownership-typed
//! peer/connection lifecycle management — all under [`pairing`].
//! [`config`] and [`logging`] are the ambient shell around it.
//!
//! The terminal multiplexer, directory browser, clipboard bridge, and the
//! WebRTC/aioice/Tailscale transports themselves are host-application
//! concerns. This crate never talks to them directly — only through the
//! `pairing::Transport` and `pairing::TransportFactory` collaborator
//! contracts a host application injects.

pub mod config;
pub mod logging;
pub mod pairing;
