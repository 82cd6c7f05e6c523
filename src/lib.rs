//! Ratekeeper - Distributed Token Bucket Rate Limiting Service
//!
//! This crate enforces per-key request budgets shared by any number of
//! concurrent callers and stateless service instances. Bucket state and
//! rules live in Redis; every check-and-consume runs as one atomic script
//! on the server, so instances never coordinate with each other directly.

pub mod clock;
pub mod config;
pub mod error;
pub mod grpc;
pub mod ratelimit;
pub mod store;
