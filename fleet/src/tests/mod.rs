//! Internal tests module
//!
//! Cross-module scenarios with access to crate internals.
