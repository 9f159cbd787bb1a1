// src/system/mod.rs

//! # System Interaction Layer
//!
//! The boundary between the engine and the executables it alters.
//!
//! - **`binary`**: the contract a binary parser/builder implements
//!   ([`binary::BinaryParser`], [`binary::BinaryObject`]) and an in-memory
//!   implementation used for dry runs and tests.

pub mod binary;
