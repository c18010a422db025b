//! Orders service: order placement, status transitions and the order
//! lifecycle events exchanged with the rest of the platform.

pub mod config;
pub mod context;
pub mod domain;
pub mod messaging;
pub mod metrics;
pub mod orchestrator;
pub mod repository;
pub mod rpc;
pub mod utils;
