//! Test harness for the display manager.
//!
//! Provides a software backend that behaves like real display hardware
//! (timer-driven vblanks, commit completions on the next tick, hot-plug
//! injection) plus fixtures and assertions for the integration suites.
//!
//! # Modules
//!
//! - `software`: the in-process backend and its control handle
//! - `fixtures`: canned display/output/surface setups
//! - `assertions`: timing and sequencing helpers

pub mod assertions;
pub mod fixtures;
pub mod software;

pub use fixtures::{init_display, init_display_threaded, init_with, primary_on, TestDisplay};
pub use software::{
    software_backend, software_backend_with, BackendOptions, OutputConfig, SoftwareControl,
};
