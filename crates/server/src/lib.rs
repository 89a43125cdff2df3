//! Trellis daemon library.
//!
//! Provides the CLI configuration and shutdown plumbing used by the
//! `trellisd` binary.

#![deny(unsafe_code)]

pub mod config;
pub mod shutdown;
