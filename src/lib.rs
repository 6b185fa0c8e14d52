//! reviewloop library crate
//!
//! Chunked code review against a language-model backend. The binary in
//! `main.rs` wires these modules together; tests exercise them directly.

pub mod chunk;
pub mod config;
pub mod ledger;
pub mod llm;
pub mod retry;
pub mod review;
pub mod source;
pub mod testing;
pub mod util;
