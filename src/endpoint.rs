//! Endpoint registry, bonding and the buffer-exchange service
//!
//! A [`BufferService`] owns one link: the TX block pool, the RX blocks area
//! and the two control ring halves. Endpoints are registered by name on both
//! sides in any order; a background worker announces each local endpoint to
//! the peer and a pump task dispatches inbound control messages. An endpoint
//! reaches [`BondState::Ready`] once its own announcement was acknowledged
//! and the peer's announcement for the same name arrived, whichever order
//! that happens in.
//!
//! Address assignment is local: an endpoint's address is its slot index, and
//! data messages carry the RECEIVER's address, so the sender must learn the
//! peer's address from the bond exchange before any data can flow.

use crate::block::{Bitmap, BlockPool, BlockRegion};
use crate::config::{ChannelLayout, LinkConfig, LinkStats};
use crate::control::{ControlMessage, ControlReceiver, ControlSender};
use crate::error::{ChannelError, Result};
use crate::ring::{RingConsumer, RingProducer};
use crate::{ADDR_INVALID, ADDR_MAX, MSG_BOND, MSG_RELEASE_BOND, MSG_RELEASE_DATA};
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// What the handler wants done with a received buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxDisposition {
    /// Release the buffer back to the sender immediately
    Release,
    /// Keep the buffer; the owner releases it later via
    /// [`Endpoint::release_held`]
    Hold,
}

/// Callbacks invoked by the service's pump task.
///
/// Both callbacks run on the pump task, so they must not block; hand the
/// data off and return. The `data` slice is only valid during the call.
/// To keep the bytes longer, return [`RxDisposition::Hold`] and use
/// [`Endpoint::copy_held`].
pub trait EndpointHandler: Send + Sync {
    /// The endpoint finished bonding and can carry data in both directions
    fn bound(&self) {}

    /// A data buffer arrived. `handle` identifies the buffer for
    /// [`Endpoint::release_held`] / [`Endpoint::copy_held`] when holding.
    fn received(&self, data: &[u8], handle: u8) -> RxDisposition;
}

/// Bonding progress of one endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BondState {
    /// Announcement failed and must be redone from scratch
    Unconfigured,
    /// Registered locally, announcement not yet sent
    Configured,
    /// Announcement sent, waiting for the peer's acknowledgement
    Bonding,
    /// Announcement acknowledged, peer's address not yet known
    Bonded,
    /// Fully bonded in both directions
    Ready,
}

struct EndpointSlot {
    name: String,
    handler: Arc<dyn EndpointHandler>,
    state: BondState,
    /// Peer's address for this name, `ADDR_INVALID` until its bond arrived
    remote_addr: u8,
    /// TX block of our in-flight bond message while `Bonding`
    bond_block: Option<u8>,
}

/// Bond that arrived before the matching local endpoint was registered
struct PendingBond {
    remote_addr: u8,
    name: String,
}

struct Shared {
    control_tx: ControlSender,
    tx_pool: BlockPool,
    rx_blocks: BlockRegion,
    rx_held: Mutex<Bitmap>,
    endpoints: Mutex<heapless::Vec<EndpointSlot, { crate::MAX_ENDPOINTS }>>,
    pending_bonds: Mutex<heapless::Vec<PendingBond, { crate::MAX_ENDPOINTS }>>,
    bond_work: Notify,
    control_ring_items: usize,
}

impl Shared {
    async fn release_rx(&self, block_index: u8) {
        if let Err(e) = self.control_tx.send(MSG_RELEASE_DATA, block_index).await {
            warn!(block_index, error = %e, "failed to return rx buffer");
        }
    }

    /// Send the announcement for one endpoint. The bond block index is
    /// recorded before the control message goes out, so the acknowledgement
    /// cannot race past it.
    async fn send_bond(&self, addr: u8, name: &str) -> Result<()> {
        let grant = self.tx_pool.allocate(name.len() + 2, None).await?;
        let mut payload = Vec::with_capacity(name.len() + 2);
        payload.push(addr);
        payload.extend_from_slice(name.as_bytes());
        payload.push(0);
        self.tx_pool
            .blocks()
            .write_data(grant.index as usize, &payload);
        self.tx_pool.release(grant.index, Some(payload.len()))?;
        self.tx_pool
            .blocks()
            .flush_buffer(grant.index as usize, payload.len());

        {
            let mut endpoints = self.endpoints.lock();
            endpoints[addr as usize].bond_block = Some(grant.index);
        }
        if let Err(e) = self.control_tx.send(MSG_BOND, grant.index).await {
            let mut endpoints = self.endpoints.lock();
            endpoints[addr as usize].bond_block = None;
            drop(endpoints);
            let _ = self.tx_pool.release(grant.index, None);
            return Err(e);
        }
        Ok(())
    }

    /// Announce every endpoint still waiting to be announced
    async fn process_bond_work(&self) {
        loop {
            let next = {
                let mut endpoints = self.endpoints.lock();
                let mut pending = self.pending_bonds.lock();
                let next = endpoints.iter_mut().enumerate().find(|(_, slot)| {
                    matches!(
                        slot.state,
                        BondState::Unconfigured | BondState::Configured
                    )
                });
                match next {
                    Some((addr, slot)) => {
                        // A bond for this name may have arrived before the
                        // endpoint was registered.
                        if let Some(at) = pending.iter().position(|p| p.name == slot.name) {
                            slot.remote_addr = pending.swap_remove(at).remote_addr;
                        }
                        slot.state = BondState::Bonding;
                        Some((addr as u8, slot.name.clone()))
                    }
                    None => None,
                }
            };
            let Some((addr, name)) = next else { break };
            if let Err(e) = self.send_bond(addr, &name).await {
                warn!(addr, name = %name, error = %e, "bond announcement failed, will retry");
                {
                    let mut endpoints = self.endpoints.lock();
                    endpoints[addr as usize].state = BondState::Unconfigured;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
                self.bond_work.notify_one();
                break;
            }
            debug!(addr, name = %name, "bond announcement sent");
        }
    }

    fn on_bond(&self, remote_addr: u8, name: &str) {
        let to_bind = {
            let mut endpoints = self.endpoints.lock();
            match endpoints.iter_mut().find(|slot| slot.name == name) {
                Some(slot) => {
                    if slot.state == BondState::Ready {
                        warn!(name, "duplicate bond for ready endpoint");
                        return;
                    }
                    slot.remote_addr = remote_addr;
                    if slot.state == BondState::Bonded {
                        slot.state = BondState::Ready;
                        Some(Arc::clone(&slot.handler))
                    } else {
                        None
                    }
                }
                None => {
                    let pending = PendingBond {
                        remote_addr,
                        name: name.to_string(),
                    };
                    if self.pending_bonds.lock().push(pending).is_err() {
                        warn!(name, "pending bond table full, dropping bond");
                    }
                    None
                }
            }
        };
        if let Some(handler) = to_bind {
            debug!(name, remote_addr, "endpoint ready");
            handler.bound();
        }
    }

    fn on_release_bond(&self, block_index: u8) {
        let to_bind = {
            let mut endpoints = self.endpoints.lock();
            match endpoints
                .iter_mut()
                .find(|slot| slot.state == BondState::Bonding && slot.bond_block == Some(block_index))
            {
                Some(slot) => {
                    slot.bond_block = None;
                    if slot.remote_addr == ADDR_INVALID {
                        slot.state = BondState::Bonded;
                        None
                    } else {
                        slot.state = BondState::Ready;
                        Some(Arc::clone(&slot.handler))
                    }
                }
                None => {
                    warn!(block_index, "bond acknowledgement matches no endpoint");
                    None
                }
            }
        };
        if let Err(e) = self.tx_pool.release(block_index, None) {
            warn!(block_index, error = %e, "failed to free bond buffer");
        }
        if let Some(handler) = to_bind {
            debug!(block_index, "endpoint ready");
            handler.bound();
        }
    }

    async fn on_data(&self, local_addr: u8, block_index: u8) {
        let size = match self.rx_blocks.validate(block_index, true) {
            Ok(size) => size,
            Err(e) => {
                warn!(local_addr, block_index, error = %e, "dropping bad data buffer");
                return;
            }
        };
        let handler = {
            let endpoints = self.endpoints.lock();
            endpoints
                .get(local_addr as usize)
                .filter(|slot| slot.state == BondState::Ready)
                .map(|slot| Arc::clone(&slot.handler))
        };
        let Some(handler) = handler else {
            warn!(local_addr, "data for endpoint that is not ready");
            self.release_rx(block_index).await;
            return;
        };
        // Owned until released, so borrowing the payload is sound.
        let data = unsafe { self.rx_blocks.data_bytes(block_index as usize, size) };
        match handler.received(data, block_index) {
            RxDisposition::Release => self.release_rx(block_index).await,
            RxDisposition::Hold => {
                self.rx_held.lock().test_and_set(block_index as usize);
            }
        }
    }

    async fn on_bond_message(&self, block_index: u8) {
        let size = match self.rx_blocks.validate(block_index, true) {
            Ok(size) => size,
            Err(e) => {
                warn!(block_index, error = %e, "dropping bad bond buffer");
                return;
            }
        };
        let parsed = {
            let payload = unsafe { self.rx_blocks.data_bytes(block_index as usize, size) };
            parse_bond_payload(payload)
        };
        // The name was copied out; the peer can have its buffer back either way.
        if let Err(e) = self.control_tx.send(MSG_RELEASE_BOND, block_index).await {
            warn!(block_index, error = %e, "failed to acknowledge bond");
        }
        match parsed {
            Some((remote_addr, name)) => self.on_bond(remote_addr, &name),
            None => warn!(block_index, "malformed bond payload"),
        }
    }
}

/// `[address][name bytes][NUL]`, with the NUL required inside the buffer
fn parse_bond_payload(payload: &[u8]) -> Option<(u8, String)> {
    let (&remote_addr, rest) = payload.split_first()?;
    if remote_addr > ADDR_MAX {
        return None;
    }
    let name_len = rest.iter().position(|&b| b == 0)?;
    let name = std::str::from_utf8(&rest[..name_len]).ok()?;
    Some((remote_addr, name.to_string()))
}

async fn rx_pump(shared: Arc<Shared>, mut control_rx: ControlReceiver) {
    loop {
        match control_rx.recv().await {
            Ok(ControlMessage::Data {
                local_addr,
                block_index,
            }) => shared.on_data(local_addr, block_index).await,
            Ok(ControlMessage::ReleaseData { block_index }) => {
                if let Err(e) = shared.tx_pool.release(block_index, None) {
                    warn!(block_index, error = %e, "bad buffer release from peer");
                }
            }
            Ok(ControlMessage::Bond { block_index }) => {
                shared.on_bond_message(block_index).await
            }
            Ok(ControlMessage::ReleaseBond { block_index }) => shared.on_release_bond(block_index),
            Err(e) => {
                error!(error = %e, "control channel failed, stopping pump");
                break;
            }
        }
    }
}

async fn bond_worker(shared: Arc<Shared>) {
    loop {
        shared.bond_work.notified().await;
        shared.process_bond_work().await;
    }
}

/// One side of an open link
pub struct BufferService {
    shared: Arc<Shared>,
    tasks: Vec<JoinHandle<()>>,
}

impl BufferService {
    /// Derive the layout of both directions, wire up the control rings and
    /// start the pump and bonding tasks.
    pub fn open(config: LinkConfig) -> Result<BufferService> {
        let tx_layout =
            ChannelLayout::compute(config.tx_region.len(), config.tx_blocks, config.rx_blocks)?;
        let rx_layout =
            ChannelLayout::compute(config.rx_region.len(), config.rx_blocks, config.tx_blocks)?;

        let tx_ring = config.tx_region.view(0, tx_layout.ring_len)?;
        let tx_blocks_area = config.tx_region.view(
            tx_layout.blocks_offset,
            tx_layout.block_size * tx_layout.block_count,
        )?;
        let rx_ring = config.rx_region.view(0, rx_layout.ring_len)?;
        let rx_blocks_area = config.rx_region.view(
            rx_layout.blocks_offset,
            rx_layout.block_size * rx_layout.block_count,
        )?;

        let producer = RingProducer::new(tx_ring, config.tx_doorbell, config.tx_ack_waiter)?;
        let consumer = RingConsumer::new(rx_ring, config.rx_ack_doorbell, config.rx_data_waiter)?;

        let tx_pool = BlockPool::new(BlockRegion::new(
            tx_blocks_area,
            tx_layout.block_size,
            tx_layout.block_count,
        )?);
        let rx_blocks = BlockRegion::new(
            rx_blocks_area,
            rx_layout.block_size,
            rx_layout.block_count,
        )?;

        let control_ring_items = producer.capacity_items();
        let shared = Arc::new(Shared {
            control_tx: ControlSender::new(producer),
            tx_pool,
            rx_held: Mutex::new(Bitmap::new(rx_blocks.block_count())),
            rx_blocks,
            endpoints: Mutex::new(heapless::Vec::new()),
            pending_bonds: Mutex::new(heapless::Vec::new()),
            bond_work: Notify::new(),
            control_ring_items,
        });

        let tasks = vec![
            tokio::spawn(rx_pump(Arc::clone(&shared), ControlReceiver::new(consumer))),
            tokio::spawn(bond_worker(Arc::clone(&shared))),
        ];
        Ok(BufferService { shared, tasks })
    }

    /// Register a named endpoint and start bonding it.
    ///
    /// The returned handle is usable immediately; sends fail with `NotBound`
    /// until the peer registered the same name and both announcements
    /// completed, at which point the handler's `bound` fires.
    pub fn register_endpoint(
        &self,
        name: &str,
        handler: Arc<dyn EndpointHandler>,
    ) -> Result<Endpoint> {
        if name.is_empty() || name.as_bytes().contains(&0) {
            return Err(ChannelError::InvalidArgument(
                "endpoint name must be non-empty and NUL-free".to_string(),
            ));
        }
        if name.len() + 2 > self.shared.tx_pool.blocks().max_buffer_len() {
            return Err(ChannelError::InvalidArgument(format!(
                "endpoint name of {} bytes does not fit a bond message",
                name.len()
            )));
        }
        let addr = {
            let mut endpoints = self.shared.endpoints.lock();
            if endpoints.iter().any(|slot| slot.name == name) {
                return Err(ChannelError::InvalidArgument(format!(
                    "endpoint {:?} already registered",
                    name
                )));
            }
            let addr = endpoints.len() as u8;
            endpoints
                .push(EndpointSlot {
                    name: name.to_string(),
                    handler,
                    state: BondState::Configured,
                    remote_addr: ADDR_INVALID,
                    bond_block: None,
                })
                .map_err(|_| ChannelError::TooMany("endpoints"))?;
            addr
        };
        self.shared.bond_work.notify_one();
        debug!(name, addr, "endpoint registered");
        Ok(Endpoint {
            shared: Arc::clone(&self.shared),
            addr,
        })
    }

    /// Largest payload a single buffer on this link can carry
    pub fn max_payload_size(&self) -> usize {
        self.shared.tx_pool.blocks().max_buffer_len()
    }

    /// Snapshot of the link's counters
    pub fn stats(&self) -> LinkStats {
        let endpoints = self.shared.endpoints.lock();
        LinkStats {
            tx_block_size: self.shared.tx_pool.blocks().block_size(),
            tx_block_count: self.shared.tx_pool.blocks().block_count(),
            tx_blocks_in_use: self.shared.tx_pool.used_blocks(),
            rx_block_size: self.shared.rx_blocks.block_size(),
            rx_block_count: self.shared.rx_blocks.block_count(),
            control_ring_items: self.shared.control_ring_items,
            registered_endpoints: endpoints.len(),
            ready_endpoints: endpoints
                .iter()
                .filter(|slot| slot.state == BondState::Ready)
                .count(),
        }
    }
}

impl Drop for BufferService {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Writable TX buffer handed out by [`Endpoint::alloc_tx`].
///
/// Must be finished with [`Endpoint::send_prepared`] or returned with
/// [`Endpoint::drop_tx`]; dropping it on the floor leaks its blocks until
/// the link is torn down.
pub struct TxBuffer {
    index: u8,
    capacity: usize,
    blocks: BlockRegion,
}

impl TxBuffer {
    /// Usable payload capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The writable payload area
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // Exclusive grant held by self.
        unsafe { self.blocks.data_bytes_mut(self.index as usize, self.capacity) }
    }
}

/// Handle to one registered endpoint
pub struct Endpoint {
    shared: Arc<Shared>,
    addr: u8,
}

impl Endpoint {
    /// This side's address for the endpoint
    pub fn address(&self) -> u8 {
        self.addr
    }

    /// Current bonding state
    pub fn state(&self) -> BondState {
        self.shared.endpoints.lock()[self.addr as usize].state
    }

    fn remote_addr(&self) -> Result<u8> {
        let endpoints = self.shared.endpoints.lock();
        let slot = &endpoints[self.addr as usize];
        if slot.state == BondState::Ready {
            Ok(slot.remote_addr)
        } else {
            Err(ChannelError::NotBound(slot.name.clone()))
        }
    }

    /// Copy `data` into a fresh buffer and hand it to the peer, waiting for
    /// block space as long as it takes
    pub async fn send(&self, data: &[u8]) -> Result<()> {
        self.send_internal(data, None).await
    }

    /// [`send`](Self::send) with a bound on the block-space wait
    pub async fn send_timeout(&self, data: &[u8], timeout: Duration) -> Result<()> {
        self.send_internal(data, Some(timeout)).await
    }

    async fn send_internal(&self, data: &[u8], timeout: Option<Duration>) -> Result<()> {
        let remote_addr = self.remote_addr()?;
        let grant = self.shared.tx_pool.allocate(data.len(), timeout).await?;
        let blocks = self.shared.tx_pool.blocks();
        blocks.write_data(grant.index as usize, data);
        // Trim the header from rounded capacity to the actual length.
        self.shared.tx_pool.release(grant.index, Some(data.len()))?;
        blocks.flush_buffer(grant.index as usize, data.len());
        if let Err(e) = self.shared.control_tx.send(remote_addr, grant.index).await {
            let _ = self.shared.tx_pool.release(grant.index, None);
            return Err(e);
        }
        Ok(())
    }

    /// Allocate a writable buffer for a zero-copy send
    pub async fn alloc_tx(&self, size: usize, timeout: Option<Duration>) -> Result<TxBuffer> {
        let grant = self.shared.tx_pool.allocate(size, timeout).await?;
        Ok(TxBuffer {
            index: grant.index,
            capacity: grant.capacity,
            blocks: self.shared.tx_pool.blocks().clone(),
        })
    }

    /// Hand a prepared buffer to the peer. `len` is the filled prefix of the
    /// buffer; unused trailing blocks go back to the pool.
    pub async fn send_prepared(&self, buffer: TxBuffer, len: usize) -> Result<()> {
        if len > buffer.capacity {
            let _ = self.shared.tx_pool.release(buffer.index, None);
            return Err(ChannelError::InvalidArgument(format!(
                "length {} exceeds buffer capacity {}",
                len, buffer.capacity
            )));
        }
        let remote_addr = match self.remote_addr() {
            Ok(addr) => addr,
            Err(e) => {
                let _ = self.shared.tx_pool.release(buffer.index, None);
                return Err(e);
            }
        };
        self.shared.tx_pool.release(buffer.index, Some(len))?;
        self.shared
            .tx_pool
            .blocks()
            .flush_buffer(buffer.index as usize, len);
        if let Err(e) = self.shared.control_tx.send(remote_addr, buffer.index).await {
            let _ = self.shared.tx_pool.release(buffer.index, None);
            return Err(e);
        }
        Ok(())
    }

    /// Return an unused TX buffer to the pool without sending it
    pub fn drop_tx(&self, buffer: TxBuffer) -> Result<()> {
        self.shared.tx_pool.release(buffer.index, None)
    }

    fn check_handle(&self, handle: u8) -> Result<()> {
        if (handle as usize) < self.shared.rx_blocks.block_count() {
            Ok(())
        } else {
            Err(ChannelError::InvalidArgument(format!(
                "handle {} outside {} blocks",
                handle,
                self.shared.rx_blocks.block_count()
            )))
        }
    }

    /// Release a buffer that a handler chose to hold
    pub async fn release_held(&self, handle: u8) -> Result<()> {
        self.check_handle(handle)?;
        let was_held = self.shared.rx_held.lock().test_and_clear(handle as usize);
        if !was_held {
            return Err(ChannelError::InvalidArgument(format!(
                "buffer {} is not held",
                handle
            )));
        }
        self.shared.control_tx.send(MSG_RELEASE_DATA, handle).await
    }

    /// Copy the payload of a held buffer
    pub fn copy_held(&self, handle: u8) -> Result<Bytes> {
        self.check_handle(handle)?;
        {
            let held = self.shared.rx_held.lock();
            if !held.test(handle as usize) {
                return Err(ChannelError::InvalidArgument(format!(
                    "buffer {} is not held",
                    handle
                )));
            }
        }
        let size = self.shared.rx_blocks.validate(handle, false)?;
        let data = unsafe { self.shared.rx_blocks.data_bytes(handle as usize, size) };
        Ok(Bytes::copy_from_slice(data))
    }
}
