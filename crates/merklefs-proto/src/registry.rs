// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Explicit host-API registry.
//!
//! Built once at process start and injected into the components that need
//! it; there is deliberately no global mutable registration table.

use crate::HostApi;

/// One registered host API.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ApiEntry {
    pub api: HostApi,
    /// Protocol code used in mount-point component encoding.
    pub code: u32,
    pub name: &'static str,
}

/// Table of known host APIs.
#[derive(Clone, Debug)]
pub struct HostRegistry {
    entries: Vec<ApiEntry>,
}

impl HostRegistry {
    /// The standard table carrying both supported host APIs.
    pub fn standard() -> Self {
        Self {
            entries: vec![
                ApiEntry {
                    api: HostApi::Fuse,
                    code: 0x46_55,
                    name: "fuse",
                },
                ApiEntry {
                    api: HostApi::NineP,
                    code: 0x39_50,
                    name: "9p",
                },
            ],
        }
    }

    pub fn by_name(&self, name: &str) -> Option<&ApiEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn by_code(&self, code: u32) -> Option<&ApiEntry> {
        self.entries.iter().find(|e| e.code == code)
    }

    pub fn entries(&self) -> &[ApiEntry] {
        &self.entries
    }
}
