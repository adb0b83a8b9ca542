//! Lock-free SPSC ring transport
//!
//! One ring moves short delimited messages in one direction between the two
//! domains. The region starts with three u32 index cells (`read`, `write`,
//! `ack`) followed by an array of u32 items. A message occupies one header
//! item (`size | tag << 16`) plus `ceil(size / 4)` payload items, wrapping
//! circularly. `read == write` means empty; one item stays reserved so a full
//! ring is distinguishable from an empty one.
//!
//! Backpressure is explicit: a producer out of space publishes the read index
//! it observed into the `ack` cell and suspends; the consumer rings the ack
//! doorbell when it drains past that watermark. Between the publish and the
//! suspend the producer re-checks the read index, so a consumer that drained
//! in that window never leaves the producer stalled.
//!
//! Exactly one producer and one consumer may drive a direction. Both handles
//! take `&mut self`, so a second writer is unrepresentable; local actors that
//! share a direction must share the handle behind a mutex (see the control
//! channel).

use crate::doorbell::{Doorbell, DoorbellWaiter};
use crate::error::{ChannelError, Result};
use crate::region::SharedRegion;
use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;
use std::time::Duration;

const READ_INDEX: usize = 0;
const WRITE_INDEX: usize = 4;
const ACK_INDEX: usize = 8;
pub(crate) const ITEMS_OFFSET: usize = 12;
pub(crate) const ITEM_SIZE: usize = 4;

/// Ack cell value meaning "no wakeup requested"
const NO_ACK: u32 = 0xFFFF_FFFF;

fn item_offset(index: usize) -> usize {
    ITEMS_OFFSET + index * ITEM_SIZE
}

fn capacity_of(region: &SharedRegion) -> Result<usize> {
    let items = region.len().saturating_sub(ITEMS_OFFSET) / ITEM_SIZE;
    // Header item + one payload item + the reserved empty/full discriminator.
    if items < 3 {
        return Err(ChannelError::InvalidArgument(format!(
            "ring region of {} bytes is too small",
            region.len()
        )));
    }
    Ok(items)
}

fn load_indices(region: &SharedRegion, capacity: usize) -> Result<(usize, usize)> {
    let read = region.index_cell(READ_INDEX).load(Ordering::Acquire) as usize;
    let write = region.index_cell(WRITE_INDEX).load(Ordering::Acquire) as usize;
    if read >= capacity || write >= capacity {
        return Err(ChannelError::Corrupted(format!(
            "ring index out of range: read {}, write {}, capacity {}",
            read, write, capacity
        )));
    }
    Ok((read, write))
}

/// Producing half of one ring direction
pub struct RingProducer {
    region: SharedRegion,
    capacity: usize,
    doorbell: Arc<dyn Doorbell>,
    ack_wait: DoorbellWaiter,
}

impl RingProducer {
    /// Attach the producing side and initialize the cells it owns
    pub fn new(
        region: SharedRegion,
        doorbell: Arc<dyn Doorbell>,
        ack_wait: DoorbellWaiter,
    ) -> Result<Self> {
        let capacity = capacity_of(&region)?;
        region.index_cell(WRITE_INDEX).store(0, Ordering::Release);
        region.index_cell(ACK_INDEX).store(NO_ACK, Ordering::Release);
        Ok(Self {
            region,
            capacity,
            doorbell,
            ack_wait,
        })
    }

    /// Number of item slots in the ring
    pub fn capacity_items(&self) -> usize {
        self.capacity
    }

    /// Largest payload a single message can carry
    pub fn max_payload(&self) -> usize {
        ((self.capacity - 2) * ITEM_SIZE).min(u16::MAX as usize)
    }

    /// Send one tagged message, waiting for space without bound
    pub async fn send(&mut self, payload: &[u8], tag: u16) -> Result<()> {
        self.send_deadline(payload, tag, None).await
    }

    /// Send one tagged message with a bounded wait for space
    pub async fn send_timeout(&mut self, payload: &[u8], tag: u16, timeout: Duration) -> Result<()> {
        self.send_deadline(payload, tag, Some(timeout)).await
    }

    async fn send_deadline(
        &mut self,
        payload: &[u8],
        tag: u16,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let data_items = (payload.len() + ITEM_SIZE - 1) / ITEM_SIZE;
        let total_items = 1 + data_items;
        if payload.len() > self.max_payload() || total_items > self.capacity - 1 {
            // Will never fit no matter how much the consumer drains.
            return Err(ChannelError::OutOfMemory {
                requested: payload.len(),
                capacity: self.max_payload(),
            });
        }

        let read_cell = self.region.index_cell(READ_INDEX);
        let ack_cell = self.region.index_cell(ACK_INDEX);
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);

        let (mut read, mut write) = load_indices(&self.region, self.capacity)?;
        loop {
            let available = if read <= write {
                self.capacity - (write - read) - 1
            } else {
                read - write - 1
            };
            if available >= total_items {
                break;
            }

            // Ask the consumer for a wakeup, then re-check whether it already
            // drained between our space check and the watermark publish.
            ack_cell.store(read as u32, Ordering::SeqCst);
            fence(Ordering::SeqCst);
            if read_cell.load(Ordering::SeqCst) as usize == read {
                // A partial drain wakes us without restarting the clock.
                let waited = match deadline {
                    None => {
                        self.ack_wait.wait().await;
                        Ok(())
                    }
                    Some(deadline) => {
                        let remaining =
                            deadline.saturating_duration_since(tokio::time::Instant::now());
                        if remaining.is_zero() {
                            Err(ChannelError::Timeout(timeout.unwrap_or_default()))
                        } else {
                            tokio::time::timeout_at(deadline, self.ack_wait.wait())
                                .await
                                .map_err(|_| ChannelError::Timeout(timeout.unwrap_or_default()))
                        }
                    }
                };
                if let Err(e) = waited {
                    ack_cell.store(NO_ACK, Ordering::SeqCst);
                    return Err(e);
                }
            }
            ack_cell.store(NO_ACK, Ordering::SeqCst);
            let reloaded = load_indices(&self.region, self.capacity)?;
            read = reloaded.0;
            write = reloaded.1;
        }

        // Header item, then payload split at the array boundary if needed.
        let header = payload.len() as u32 | (tag as u32) << 16;
        self.region.write_at(item_offset(write), &header.to_ne_bytes());
        write = (write + 1) % self.capacity;

        let tail_items = self.capacity - write;
        if data_items >= tail_items {
            let tail_bytes = (tail_items * ITEM_SIZE).min(payload.len());
            self.region.write_at(item_offset(write), &payload[..tail_bytes]);
            if payload.len() > tail_bytes {
                self.region.write_at(ITEMS_OFFSET, &payload[tail_bytes..]);
            }
            write = data_items - tail_items;
        } else {
            if !payload.is_empty() {
                self.region.write_at(item_offset(write), payload);
            }
            write += data_items;
        }

        // Data must be visible before the index, and the index before the
        // doorbell.
        fence(Ordering::Release);
        self.region
            .index_cell(WRITE_INDEX)
            .store(write as u32, Ordering::Release);
        fence(Ordering::SeqCst);
        self.doorbell.ring();
        Ok(())
    }
}

/// Consuming half of one ring direction
pub struct RingConsumer {
    region: SharedRegion,
    capacity: usize,
    ack_doorbell: Arc<dyn Doorbell>,
    data_wait: DoorbellWaiter,
}

impl RingConsumer {
    /// Attach the consuming side and initialize the cell it owns
    pub fn new(
        region: SharedRegion,
        ack_doorbell: Arc<dyn Doorbell>,
        data_wait: DoorbellWaiter,
    ) -> Result<Self> {
        let capacity = capacity_of(&region)?;
        region.index_cell(READ_INDEX).store(0, Ordering::Release);
        Ok(Self {
            region,
            capacity,
            ack_doorbell,
            data_wait,
        })
    }

    /// Number of item slots in the ring
    pub fn capacity_items(&self) -> usize {
        self.capacity
    }

    /// Whether the ring currently holds no messages
    pub fn is_empty(&self) -> Result<bool> {
        let (read, write) = load_indices(&self.region, self.capacity)?;
        Ok(read == write)
    }

    /// Receive one message into `buf`, waiting for data without bound.
    ///
    /// Returns the payload length and tag. If `buf` is too small the message
    /// stays in the ring and `InvalidArgument` is returned so the caller can
    /// retry with a larger buffer.
    pub async fn receive(&mut self, buf: &mut [u8]) -> Result<(usize, u16)> {
        self.receive_deadline(Some(buf), None).await
    }

    /// Receive one message with a bounded wait for data
    pub async fn receive_timeout(
        &mut self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<(usize, u16)> {
        self.receive_deadline(Some(buf), Some(timeout)).await
    }

    /// Consume the next message without copying it out
    pub async fn skip(&mut self) -> Result<(usize, u16)> {
        self.receive_deadline(None, None).await
    }

    async fn receive_deadline(
        &mut self,
        buf: Option<&mut [u8]>,
        timeout: Option<Duration>,
    ) -> Result<(usize, u16)> {
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        let (entry_read, _write) = loop {
            let (read, write) = load_indices(&self.region, self.capacity)?;
            if read != write {
                break (read, write);
            }
            match deadline {
                None => self.data_wait.wait().await,
                Some(deadline) => {
                    let remaining =
                        deadline.saturating_duration_since(tokio::time::Instant::now());
                    if remaining.is_zero() {
                        return Err(ChannelError::Timeout(timeout.unwrap_or_default()));
                    }
                    tokio::time::timeout_at(deadline, self.data_wait.wait())
                        .await
                        .map_err(|_| ChannelError::Timeout(timeout.unwrap_or_default()))?;
                }
            }
        };

        let mut header_bytes = [0u8; ITEM_SIZE];
        self.region.read_at(item_offset(entry_read), &mut header_bytes);
        let header = u32::from_ne_bytes(header_bytes);
        let size = (header & 0xFFFF) as usize;
        let tag = (header >> 16) as u16;

        let data_items = (size + ITEM_SIZE - 1) / ITEM_SIZE;
        if 1 + data_items > self.capacity - 1 {
            return Err(ChannelError::Corrupted(format!(
                "message of {} bytes cannot fit a ring of {} items",
                size, self.capacity
            )));
        }
        if let Some(b) = &buf {
            if b.len() < size {
                // Leave the message unconsumed.
                return Err(ChannelError::InvalidArgument(format!(
                    "receive buffer of {} bytes is smaller than message of {} bytes",
                    b.len(),
                    size
                )));
            }
        }

        let mut read = (entry_read + 1) % self.capacity;
        let tail_items = self.capacity - read;
        if let Some(b) = buf {
            let dst = &mut b[..size];
            if data_items >= tail_items {
                let tail_bytes = (tail_items * ITEM_SIZE).min(size);
                self.region.read_at(item_offset(read), &mut dst[..tail_bytes]);
                if size > tail_bytes {
                    self.region.read_at(ITEMS_OFFSET, &mut dst[tail_bytes..]);
                }
            } else if size > 0 {
                self.region.read_at(item_offset(read), dst);
            }
        }
        read = if data_items >= tail_items {
            data_items - tail_items
        } else {
            read + data_items
        };

        // Reads must complete before releasing the slots, and the index must
        // land before the ack doorbell.
        fence(Ordering::SeqCst);
        self.region
            .index_cell(READ_INDEX)
            .store(read as u32, Ordering::Release);
        fence(Ordering::SeqCst);

        if self.region.index_cell(ACK_INDEX).load(Ordering::SeqCst) as usize == entry_read {
            self.ack_doorbell.ring();
        }

        Ok((size, tag))
    }
}
