//! DedupFS Test & Validation Infrastructure
//!
//! A harness that opens engines over an in-memory store with a manual clock
//! and injectable write failures, cross-crate scenario tests for dedup,
//! write-back and garbage collection, and property-based tests.

pub mod harness;
pub mod proptest_store;

mod scenario_tests;

pub use harness::{check_reference_counts, compressible_block, random_block, test_config, FaultyKvStore, TestEnv};
