//! Gateway RPC client and container image lifecycle for an OpenClaw
//! installation.

pub mod config;
pub mod gateway;
pub mod identity;
pub mod runtime;
pub mod types;
pub mod update;
