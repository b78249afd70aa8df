//! # Services module
//!
//! This module provide services to interact with kubernetes, the black duck
//! database and its web endpoints, and helpers to do so.
pub mod blackduck;
pub mod cfg;
pub mod crd;
pub mod database;
pub mod http;
pub mod k8s;
pub mod prober;
pub mod retry;
#[cfg(test)]
pub mod testing;
