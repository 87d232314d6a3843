//! Shared constants for integration tests.
//!
//! Integration tests are compiled as separate crates (one per top-level file in
//! `tests/`). Placing shared constants under `tests/common/` avoids creating an
//! additional integration test binary while still allowing reuse via:
//!
//! ```rust
//! #[path = "common/test_constants.rs"]
//! mod test_constants;
//! ```

/// Provider identifier used for scripted instances.
pub const INSTANCE_ID: &str = "i-behaviour";

/// Documentation-range address the scripted guest answers on.
pub const GUEST_ADDRESS: &str = "192.0.2.10";
