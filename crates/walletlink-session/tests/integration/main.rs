//! Integration test entry point for walletlink-session.
//!
//! Run with: cargo test --test integration

mod harness;
mod local;
mod relay;
mod timeout;
