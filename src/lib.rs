//! Stochastic agent-based epidemic simulation comparing free movement,
//! lockdown, exposure notification and reputation-score contact tracing.

pub mod analysis;
pub mod config;
pub mod dist;
pub mod engine;
pub mod manager;
pub mod model;
pub mod orchestrator;
pub mod rng;
pub mod stats;
pub mod topology;
pub mod trace;
pub mod worker;
