// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! MerkleFS 9P Host — 9P2000.L request semantics over core references
//!
//! A transport decodes T-messages and drives [`Session`]; this crate owns the
//! fid table, the walk/open/clunk lifecycle, the attribute and dirent wire
//! shapes, and the total errno translation. Framing and sockets live with
//! the transport.

pub mod error;
pub mod session;
pub mod types;

pub use error::{HostError, HostResult, errno_of};
pub use session::Session;
pub use types::{Attr9, Dirent9, Qid9, StatFs9};
