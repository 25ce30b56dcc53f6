//! End-to-end smoke tests for the gateway; see `tests/smoke.rs`.
