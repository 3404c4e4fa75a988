//! # tollgate-core
//!
//! Core engine for tollgate, a resource-acquisition admission-control
//! system. It decides whether a named acquirer may obtain a counted bundle
//! of named resources under pluggable restriction policies, without ever
//! storing resource identifiers in the clear: each is tokenized with a
//! keyed HMAC whose key can rotate, and stored state survives rotation
//! through a lazy two-generation translation protocol.
//!
//! This crate holds the pure building blocks:
//!
//! - **Acquisition state**: records, request items, decision shapes, and
//!   their invariants ([`acquisition`])
//! - **Windows**: ISO-8601 duration parsing ([`duration`])
//! - **Policies**: the restriction method contract, the process-wide
//!   registry, and the built-in limit-over-duration method ([`policy`])
//! - **Tokenization**: the key-oracle trait, an in-process HMAC-SHA-256
//!   key ring, and the per-request rotation-aware tokenizer ([`tokenizer`])
//!
//! The I/O surface (stores, matcher, decision engine) lives in
//! `tollgate-engine`.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod acquisition;
pub mod duration;
pub mod policy;
pub mod tokenizer;

pub use acquisition::{
    AcquisitionEntry, AcquisitionRecord, Decision, EpochMillis, RecordMeta, ReleaseDecision,
    RequestItem, ResourceCount, TokenizedGroup,
};
pub use policy::{MethodRegistry, Restriction, RestrictionMethod};
pub use tokenizer::{HmacKeyRing, ResourceTokenizer, TokenizerOracle};
