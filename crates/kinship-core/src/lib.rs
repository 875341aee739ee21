//! Kinship session library (auth lifecycle, backend clients, config).

pub mod auth;
pub mod config;
pub mod context;
pub mod logging;
pub mod navigator;
pub mod profile;
pub mod routes;
pub mod session;
pub mod store;
