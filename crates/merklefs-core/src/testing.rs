// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Test-support utilities for MerkleFS Core
//!
//! This module is available in unit tests and behind the `testing` feature
//! so host and daemon test suites can share the in-memory resolver.

pub mod mock_resolver;
