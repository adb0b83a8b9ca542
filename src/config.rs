//! Link configuration and region layout
//!
//! A link is two independent directions. Each direction lives in one shared
//! region laid out as `[control ring][blocks area]`; the split is a pure
//! function of the region length and the two sides' block counts, so both
//! cores derive identical geometry from the same static configuration with
//! no runtime negotiation.

use crate::doorbell::{doorbell_pair, Doorbell, DoorbellWaiter};
use crate::error::{ChannelError, Result};
use crate::region::SharedRegion;
use crate::ring::{ITEMS_OFFSET, ITEM_SIZE};
use crate::{BLOCK_ALIGNMENT, BLOCK_HEADER_SIZE, CONTROL_MESSAGE_LEN};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Ring items consumed by one control message (header word + payload word)
const ITEMS_PER_MESSAGE: usize = 1 + (CONTROL_MESSAGE_LEN + ITEM_SIZE - 1) / ITEM_SIZE;

fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) / alignment * alignment
}

/// Computed geometry of one direction's region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelLayout {
    /// Bytes reserved for the control ring at the start of the region
    pub ring_len: usize,
    /// Offset of the blocks area (equals `ring_len`, kept for clarity)
    pub blocks_offset: usize,
    /// Size of each block in the area
    pub block_size: usize,
    /// Number of blocks in the area
    pub block_count: usize,
}

impl ChannelLayout {
    /// Split a region of `region_len` bytes between the control ring and the
    /// blocks area.
    ///
    /// `local_blocks` is the block count of this direction; `remote_blocks`
    /// the opposite direction's. The ring is sized to hold one data message
    /// per local block plus one release message per remote block at the same
    /// time, so a correct peer can never wedge the control channel. The
    /// remainder is divided into `local_blocks` aligned blocks.
    pub fn compute(
        region_len: usize,
        local_blocks: usize,
        remote_blocks: usize,
    ) -> Result<ChannelLayout> {
        if local_blocks == 0 || local_blocks > 256 || remote_blocks == 0 || remote_blocks > 256 {
            return Err(ChannelError::InvalidArgument(format!(
                "block counts {}/{} outside 1..=256",
                local_blocks, remote_blocks
            )));
        }
        // One item is always unusable in a full/empty-distinguishing ring.
        let ring_items = 1 + ITEMS_PER_MESSAGE * (local_blocks + remote_blocks);
        let ring_len = align_up(ITEMS_OFFSET + ring_items * ITEM_SIZE, BLOCK_ALIGNMENT);

        let blocks_len = region_len.checked_sub(ring_len).ok_or_else(|| {
            ChannelError::InvalidArgument(format!(
                "region of {} bytes cannot hold a {}-byte control ring",
                region_len, ring_len
            ))
        })?;
        let block_size = blocks_len / local_blocks / BLOCK_ALIGNMENT * BLOCK_ALIGNMENT;
        if block_size < 2 * BLOCK_HEADER_SIZE {
            return Err(ChannelError::InvalidArgument(format!(
                "{} bytes left for {} blocks gives unusable {}-byte blocks",
                blocks_len, local_blocks, block_size
            )));
        }
        Ok(ChannelLayout {
            ring_len,
            blocks_offset: ring_len,
            block_size,
            block_count: local_blocks,
        })
    }
}

/// Everything one side needs to open a link: the two directions' regions,
/// their block counts, and the doorbells wired to the other core.
pub struct LinkConfig {
    /// Region this side transmits into
    pub tx_region: SharedRegion,
    /// Region the peer transmits into
    pub rx_region: SharedRegion,
    /// Block count of the TX direction
    pub tx_blocks: usize,
    /// Block count of the RX direction
    pub rx_blocks: usize,
    /// Rung after publishing into the TX control ring
    pub tx_doorbell: Arc<dyn Doorbell>,
    /// Released when the peer drains the TX control ring
    pub tx_ack_waiter: DoorbellWaiter,
    /// Released when the peer publishes into the RX control ring
    pub rx_data_waiter: DoorbellWaiter,
    /// Rung after draining the RX control ring
    pub rx_ack_doorbell: Arc<dyn Doorbell>,
}

impl LinkConfig {
    /// Build two mirrored in-process configurations over fresh in-memory
    /// regions, for tests and same-process links.
    pub fn loopback(
        a_to_b_len: usize,
        b_to_a_len: usize,
        a_blocks: usize,
        b_blocks: usize,
    ) -> (LinkConfig, LinkConfig) {
        let a_to_b = SharedRegion::new_in_memory(a_to_b_len);
        let b_to_a = SharedRegion::new_in_memory(b_to_a_len);
        let (ab_data_bell, ab_data_wait) = doorbell_pair();
        let (ab_ack_bell, ab_ack_wait) = doorbell_pair();
        let (ba_data_bell, ba_data_wait) = doorbell_pair();
        let (ba_ack_bell, ba_ack_wait) = doorbell_pair();

        let side_a = LinkConfig {
            tx_region: a_to_b.clone(),
            rx_region: b_to_a.clone(),
            tx_blocks: a_blocks,
            rx_blocks: b_blocks,
            tx_doorbell: ab_data_bell,
            tx_ack_waiter: ab_ack_wait,
            rx_data_waiter: ba_data_wait,
            rx_ack_doorbell: ba_ack_bell,
        };
        let side_b = LinkConfig {
            tx_region: b_to_a,
            rx_region: a_to_b,
            tx_blocks: b_blocks,
            rx_blocks: a_blocks,
            tx_doorbell: ba_data_bell,
            tx_ack_waiter: ba_ack_wait,
            rx_data_waiter: ab_data_wait,
            rx_ack_doorbell: ab_ack_bell,
        };
        (side_a, side_b)
    }
}

/// Point-in-time counters for one open link
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkStats {
    pub tx_block_size: usize,
    pub tx_block_count: usize,
    pub tx_blocks_in_use: usize,
    pub rx_block_size: usize,
    pub rx_block_count: usize,
    pub control_ring_items: usize,
    pub registered_endpoints: usize,
    pub ready_endpoints: usize,
}
