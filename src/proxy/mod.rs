//! Local proxy endpoints
//!
//! This module provides:
//! - tunnel engine adapters that expose one node as a loopback HTTP proxy
//! - the prober that classifies such an endpoint against the target API

pub mod engine;
pub mod probe;

pub use engine::{EngineKind, EngineSet, TunnelEngine, TunnelProcess};
pub use probe::{HttpProber, NodeProber};
