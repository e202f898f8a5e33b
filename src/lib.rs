//! cairn: artifact-oriented orchestration for multi-phase research pipelines.
//!
//! Every artifact a run produces is written to a content-addressable
//! [`store`], recorded with its shape signature in a per-run provenance
//! [`manifest`], and checked by [`preflight`] before the next phase consumes
//! it. The [`engine`] drives the phases in order, reusing outputs of
//! compatible prior runs, and fans parallel phases out through the
//! [`coordinator`].

pub mod config;
pub mod coordinator;
pub mod engine;
pub mod errors;
pub mod experiment;
pub mod hashing;
pub mod journal;
pub mod logging;
pub mod manifest;
pub mod phase;
pub mod preflight;
pub mod shape;
pub mod store;
