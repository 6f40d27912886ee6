//! Core primitives shared by the Filament state-storage crates.
//!
//! This crate provides the fixed-size digest type ([`Hash256`]) and the
//! hashing contract ([`Hasher`]) consumed by the trie engine. The trie itself
//! never constructs digests by hand; everything flows through these types so
//! that the hash primitive stays swappable.

pub mod hash256;
pub mod hasher;

pub use hash256::{Hash256, ParseHashError};
pub use hasher::{blake2b_256, Blake2b256, Hasher};
