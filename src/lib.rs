//! Canopy - a schema/namespace migration engine for hierarchical content stores
//!
//! Canopy applies an ordered set of pluggable migration modules across a
//! versioned content tree, rewriting node types, property names/values, and
//! namespace prefixes while keeping the store in a consistent, incrementally
//! committed state even when millions of nodes must be touched.
//!
//! # Architecture
//!
//! The codebase follows a strict layered architecture:
//!
//! - [`core`] - Domain types: paths, validated names, engine configuration
//! - [`store`] - Single interface for all backing content-store operations
//! - [`overlay`] - In-memory shadow tree buffering structural edits
//! - [`engine`] - Orchestrates Prepare -> Preprocess -> Process -> Batch commit -> Wrap up
//!
//! # Correctness Invariants
//!
//! Canopy maintains the following invariants:
//!
//! 1. Modules run only after eligibility and ordering validation
//! 2. All structural edits flow through the overlay tree and its single
//!    transactional commit
//! 3. The version-tag set advances only when a run completes; partial batch
//!    commits are durable and re-running makes forward progress
//! 4. A document's stored variants are never split across two commit batches
//!    when they straddle a single batch boundary

pub mod core;
pub mod engine;
pub mod overlay;
pub mod store;
