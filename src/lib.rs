//! ACP — Agent Consent Proxy library.
//!
//! This library exposes the core components of ACP for integration testing
//! and programmatic use. The binary entrypoint is in `main.rs`.

// Several items are pub for use by the integration tests, which are
// separate compilation units — suppress false dead_code warnings.
#![allow(dead_code)]

pub mod agent;
pub mod audit;
pub mod channel;
pub mod cli;
pub mod config;
pub mod firewall;
pub mod gate;
pub mod policy;
pub mod proxy;
pub mod supervisor;
