// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Attribute translation: resolved node metadata → protocol-neutral `Stat`.
//!
//! The translator reports which of the requested fields it actually filled;
//! block accounting is only available when the store reports it or the node
//! is a regular file whose size we can divide up ourselves.

use crate::resolver::NodeInfo;
use crate::types::{NodeKind, Stat, StatMask};

/// Translate `info` into a `Stat`, filling at most the `want`ed fields.
pub fn translate(info: &NodeInfo, want: StatMask, block_size: u32) -> (Stat, StatMask) {
    let mut filled = StatMask::default();
    let mut stat = Stat {
        kind: NodeKind::File,
        size: 0,
        block_size,
        blocks: 0,
    };

    if want.kind {
        stat.kind = info.kind;
        filled.kind = true;
    }
    if want.size {
        stat.size = info.size;
        filled.size = true;
    }
    if want.blocks {
        match info.blocks {
            Some(blocks) => {
                stat.blocks = blocks;
                filled.blocks = true;
            }
            None if info.kind == NodeKind::File => {
                stat.blocks = info.size.div_ceil(block_size as u64);
                filled.blocks = true;
            }
            // Block accounting is meaningless for the rest; leave unfilled.
            None => {}
        }
    }

    (stat, filled)
}

/// Synthesized stat for roots with no backing content (overlay, pin index,
/// key index). Never touches the resolver.
pub fn synthesized_dir(want: StatMask, block_size: u32) -> (Stat, StatMask) {
    let stat = Stat {
        kind: NodeKind::Directory,
        size: 0,
        block_size,
        blocks: 0,
    };
    let filled = StatMask {
        kind: want.kind,
        size: want.size,
        blocks: false,
    };
    (stat, filled)
}
