//! QuantLab Pipeline Library
//!
//! Exposes the research pipeline for use by binaries and tests.

pub mod config;
pub mod pipeline;
