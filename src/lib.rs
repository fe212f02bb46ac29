//! Workspace-level integration test harness.
//!
//! This crate has no runtime code of its own; it exists only so that
//! `tests/integration/*.rs` can depend on every library crate in the
//! workspace the way a single end-to-end test would.
