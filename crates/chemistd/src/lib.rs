//! chemistd — bootstrap wiring for the chemist control plane.
//!
//! The binary in `main.rs` is a thin shell over [`bootstrap`], which is also
//! exercised directly by the end-to-end tests.

pub mod bootstrap;
