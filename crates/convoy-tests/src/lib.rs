//! Integration test helpers: an in-process daemon on a temp socket and a
//! client wrapper with one method per request used by the scenarios.

pub mod harness;
