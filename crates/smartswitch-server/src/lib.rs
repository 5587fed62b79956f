//! # smartswitch-server
//!
//! HTTP server library for the smartswitch keep-alive daemon.
//!
//! This library provides the API handlers, logging setup and state management
//! around a [`smartswitch_core::KeepAliveHost`].

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

pub mod api;
pub mod logging;
pub mod state;
