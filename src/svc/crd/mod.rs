//! # Custom resource definition module
//!
//! This module provide custom resource definition managed by the operator and
//! their structures.

pub mod blackduck;
