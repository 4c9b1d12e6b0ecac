// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! tether-proto: wire schema for the Tether replication core.
//!
//! Canonical tagged values with byte-deterministic encoding, field-level
//! deltas, typed message bodies for the seventeen session message kinds, and
//! the binary frame codec with optional lz4 body compression.
#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms, unused_must_use)]
#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::cargo,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::dbg_macro,
    clippy::print_stdout,
    clippy::print_stderr
)]
#![allow(
    clippy::must_use_candidate,
    clippy::return_self_not_must_use,
    clippy::unreadable_literal,
    clippy::missing_const_for_fn,
    clippy::redundant_pub_crate,
    clippy::module_name_repetitions,
    clippy::use_self
)]

mod body;
mod delta;
mod merge;
mod value;
/// Binary frame codec (header layout, compression bit).
pub mod wire;

/// Message kinds, drain priorities, and typed bodies.
pub use body::{Body, BodyError, EntityState, MsgKind, Priority};
/// Field-level payload deltas.
pub use delta::PayloadDelta;
/// Merge-policy rules and their wire form.
pub use merge::{merge_table_from_value, merge_table_to_value, MergeRule, MergeTable};
/// Canonical value codec and payload digests.
pub use value::{
    decode_payload, decode_value, encode_payload, encode_value, payload_digest, CanonError,
    Digest, Payload, Value,
};
/// Frame codec types.
pub use wire::{Frame, WireError, COMPRESSED_BIT};
