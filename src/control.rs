//! Control channel
//!
//! Thin wrapper moving the fixed 2-byte coordination messages
//! `{type_or_address, block_index}` over the ring. All higher-layer sends go
//! through one async mutex because the ring guarantees single-writer safety
//! only; concurrent local actors must be serialized here.

use crate::error::{ChannelError, Result};
use crate::ring::{RingConsumer, RingProducer};
use crate::{ADDR_INVALID, CONTROL_MESSAGE_LEN, MSG_BOND, MSG_RELEASE_BOND, MSG_RELEASE_DATA};
use tokio::sync::Mutex;
use tracing::warn;

/// Decoded inbound control message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    /// Data buffer for the endpoint at `local_addr` starts at `block_index`
    Data { local_addr: u8, block_index: u8 },
    /// Peer finished with the TX buffer starting at `block_index`
    ReleaseData { block_index: u8 },
    /// Bond request; the named payload starts at `block_index`
    Bond { block_index: u8 },
    /// Bond ACK; the TX bond buffer at `block_index` can be freed
    ReleaseBond { block_index: u8 },
}

/// Sending half of the control channel, shared by all local actors
pub struct ControlSender {
    producer: Mutex<RingProducer>,
}

impl ControlSender {
    /// Wrap the producing ring half
    pub fn new(producer: RingProducer) -> Self {
        Self {
            producer: Mutex::new(producer),
        }
    }

    /// Send one `{type_or_address, block_index}` message
    pub async fn send(&self, type_or_addr: u8, block_index: u8) -> Result<()> {
        let message = [type_or_addr, block_index];
        let mut producer = self.producer.lock().await;
        producer.send(&message, 0).await
    }
}

/// Receiving half of the control channel, driven by a single pump task
pub struct ControlReceiver {
    consumer: RingConsumer,
}

impl ControlReceiver {
    /// Wrap the consuming ring half
    pub fn new(consumer: RingConsumer) -> Self {
        Self { consumer }
    }

    /// Receive and decode the next control message.
    ///
    /// Malformed lengths are logged and skipped; `Corrupted` is propagated so
    /// the driving loop stops.
    pub async fn recv(&mut self) -> Result<ControlMessage> {
        loop {
            let mut message = [0u8; CONTROL_MESSAGE_LEN];
            let (len, _tag) = match self.consumer.receive(&mut message).await {
                Ok(decoded) => decoded,
                Err(ChannelError::InvalidArgument(_)) => {
                    // Oversized entry cannot be a control message; drop it.
                    let (len, _) = self.consumer.skip().await?;
                    warn!(len, "dropping oversized control message");
                    continue;
                }
                Err(e) => return Err(e),
            };
            if len != CONTROL_MESSAGE_LEN {
                warn!(len, "dropping control message with bad length");
                continue;
            }
            let block_index = message[1];
            return Ok(match message[0] {
                ADDR_INVALID => {
                    // Reserved unset marker; a conforming peer never sends it.
                    warn!(block_index, "dropping control message with invalid type");
                    continue;
                }
                MSG_RELEASE_DATA => ControlMessage::ReleaseData { block_index },
                MSG_BOND => ControlMessage::Bond { block_index },
                MSG_RELEASE_BOND => ControlMessage::ReleaseBond { block_index },
                local_addr => ControlMessage::Data {
                    local_addr,
                    block_index,
                },
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doorbell::doorbell_pair;
    use crate::region::SharedRegion;
    use std::sync::Arc;

    fn control_pair() -> (Arc<ControlSender>, ControlReceiver) {
        let region = SharedRegion::new_in_memory(12 + 32 * 4);
        let (data_bell, data_wait) = doorbell_pair();
        let (ack_bell, ack_wait) = doorbell_pair();
        let tx = RingProducer::new(region.clone(), data_bell, ack_wait).unwrap();
        let rx = RingConsumer::new(region, ack_bell, data_wait).unwrap();
        (Arc::new(ControlSender::new(tx)), ControlReceiver::new(rx))
    }

    #[tokio::test]
    async fn test_control_message_decoding() {
        let (tx, mut rx) = control_pair();
        tx.send(MSG_RELEASE_DATA, 3).await.unwrap();
        tx.send(MSG_BOND, 1).await.unwrap();
        tx.send(MSG_RELEASE_BOND, 2).await.unwrap();
        tx.send(0x05, 7).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), ControlMessage::ReleaseData { block_index: 3 });
        assert_eq!(rx.recv().await.unwrap(), ControlMessage::Bond { block_index: 1 });
        assert_eq!(rx.recv().await.unwrap(), ControlMessage::ReleaseBond { block_index: 2 });
        assert_eq!(
            rx.recv().await.unwrap(),
            ControlMessage::Data {
                local_addr: 0x05,
                block_index: 7
            }
        );
    }

    #[tokio::test]
    async fn test_reserved_invalid_type_is_dropped() {
        let (tx, mut rx) = control_pair();
        tx.send(crate::ADDR_INVALID, 3).await.unwrap();
        tx.send(0x02, 9).await.unwrap();

        // The reserved marker is skipped; only the real message comes out.
        assert_eq!(
            rx.recv().await.unwrap(),
            ControlMessage::Data {
                local_addr: 0x02,
                block_index: 9
            }
        );
    }

    #[tokio::test]
    async fn test_concurrent_senders_are_serialized() {
        let (tx, mut rx) = control_pair();
        let mut handles = Vec::new();
        for i in 0..8u8 {
            let tx = Arc::clone(&tx);
            handles.push(tokio::spawn(async move { tx.send(i, i).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        let mut seen = Vec::new();
        for _ in 0..8 {
            match rx.recv().await.unwrap() {
                ControlMessage::Data {
                    local_addr,
                    block_index,
                } => {
                    assert_eq!(local_addr, block_index);
                    seen.push(local_addr);
                }
                other => panic!("unexpected message {:?}", other),
            }
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..8).collect::<Vec<_>>());
    }
}
