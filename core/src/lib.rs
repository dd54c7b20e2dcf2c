//! Core library for cfgbuild
//!
//! Drives the system configuration build engine locally or over SSH, decodes
//! its structured progress stream, renders live progress and compares the
//! closures of two generations.

pub mod config;
pub mod diff;
pub mod error;
pub mod exec;
pub mod nix;
pub mod tui;
pub mod util;

pub use config::Settings;
pub use error::{Error, Result};
