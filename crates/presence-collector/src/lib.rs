//! # presence-collector
//!
//! Process-level plumbing for a collection point: logging setup and the
//! JSON-lines writer for outbound lifecycle messages.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

pub mod logging;
pub mod output;
