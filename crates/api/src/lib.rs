//! HTTP API: server wiring, authentication and routing for the decision
//! pipeline services.

pub mod app;
pub mod authz;
pub mod config;
pub mod context;
pub mod middleware;
