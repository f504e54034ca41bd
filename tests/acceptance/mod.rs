//! Integration tests for stimmon acceptance testing.
//!
//! - `rendezvous_test`: gate protocol between two processes
//! - `session_test`: full fork/join sessions and their teardown

mod common;
mod rendezvous_test;
mod session_test;
