//! Corebridge - Shared Memory Cross-Core Transport
//!
//! Lock-free message transport between two independently scheduled execution
//! domains that share a memory region but no cache coherency. Two layers:
//! an SPSC ring carrying short delimited messages with explicit backpressure,
//! and a block buffer-exchange service with a name-matching endpoint
//! handshake on top of it.

pub mod block;
pub mod config;
pub mod control;
pub mod doorbell;
pub mod endpoint;
pub mod error;
pub mod region;
pub mod ring;

pub use block::{BlockPool, BlockRegion, TxGrant};
pub use config::{ChannelLayout, LinkConfig, LinkStats};
pub use control::{ControlMessage, ControlReceiver, ControlSender};
pub use doorbell::{doorbell_pair, Doorbell, DoorbellWaiter};
pub use endpoint::{BondState, BufferService, Endpoint, EndpointHandler, RxDisposition, TxBuffer};
pub use error::{ChannelError, Result};
pub use region::{CacheOps, NoCacheOps, SharedRegion};
pub use ring::{RingConsumer, RingProducer};

/// Special endpoint address indicating an invalid or unset entry.
pub const ADDR_INVALID: u8 = 0xFF;

/// Control message type: release a received data buffer.
pub const MSG_RELEASE_DATA: u8 = 0xFE;

/// Control message type: endpoint bond request.
pub const MSG_BOND: u8 = 0xFD;

/// Control message type: release a bond message buffer (bond ACK).
pub const MSG_RELEASE_BOND: u8 = 0xFC;

/// Largest value usable as an endpoint address.
pub const ADDR_MAX: u8 = 0xFB;

/// Number of bytes in every control message.
pub const CONTROL_MESSAGE_LEN: usize = 2;

/// Alignment of a block within the blocks area.
pub const BLOCK_ALIGNMENT: usize = 8;

/// Size of the per-buffer header (the `size` field) at the start of a block run.
pub const BLOCK_HEADER_SIZE: usize = 8;

/// Maximum number of endpoints per link (also bounds the pending-bond table).
pub const MAX_ENDPOINTS: usize = 8;
