//! Core crate for framevec: turns uploaded videos into directories of
//! per-frame SVG images and serves the results.

pub mod archive;
pub mod config;
pub mod convert;
pub mod error;
pub mod extract;
pub mod job;
pub mod logging;
pub mod output;
pub mod pipeline;
pub mod retention;
pub mod runtime;
pub mod server;
pub mod workspace;
