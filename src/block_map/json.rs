//! Hand-rolled JSON wire format for [`super::BlockMap`].
//!
//! `content_size` must round-trip exactly even past `f64`'s 53-bit mantissa,
//! so it is carried as a decimal string rather than a bare JSON number —
//! the same reasoning that keeps large integers out of JSON in other wire
//! formats this crate's download engine talks (job totals land in SQLite as
//! `i64`, never as JSON numbers, for the same precision reason).

use serde::{Deserialize, Serialize};

use super::{BlockMap, BlockMapError};

#[derive(Serialize, Deserialize)]
struct BlockMapWire {
    content_size: serde_json::Value,
    block_size: u64,
    ranges: Vec<u8>,
}

pub(super) fn to_json(map: &BlockMap) -> String {
    let wire = BlockMapWire {
        content_size: serde_json::Value::String(map.content_size.to_string()),
        block_size: map.block_size,
        ranges: map.bits.clone(),
    };
    serde_json::to_string(&wire).expect("block map wire format is always serialisable")
}

pub(super) fn from_json(s: &str) -> Result<BlockMap, BlockMapError> {
    let wire: BlockMapWire = serde_json::from_str(s)?;

    let content_size = match &wire.content_size {
        serde_json::Value::String(s) => s
            .parse::<u64>()
            .map_err(|_| BlockMapError::ContentSizeNotString)?,
        _ => return Err(BlockMapError::ContentSizeNotString),
    };

    if wire.block_size == 0 {
        return Err(BlockMapError::NonPositiveBlockSize);
    }

    let num_blocks = if content_size == 0 {
        0
    } else {
        ((content_size + wire.block_size - 1) / wire.block_size) as usize
    };
    let expected_len = (num_blocks + 7) / 8;

    if num_blocks > 0 && wire.ranges.is_empty() {
        return Err(BlockMapError::EmptyRanges);
    }

    let mut bits = vec![0u8; expected_len];
    let copy = wire.ranges.len().min(expected_len);
    bits[..copy].copy_from_slice(&wire.ranges[..copy]);

    Ok(BlockMap {
        content_size,
        block_size: wire.block_size,
        bits,
    })
}
