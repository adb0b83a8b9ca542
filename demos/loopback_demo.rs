//! Loopback demonstration of the buffer-exchange service
//!
//! Opens both sides of a link over in-memory regions, bonds an endpoint by
//! name and moves a few payloads each way, including one zero-copy send.

use corebridge::{
    BufferService, EndpointHandler, LinkConfig, RxDisposition,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tracing::info;

struct PrintingHandler {
    side: &'static str,
    delivered: mpsc::UnboundedSender<Vec<u8>>,
}

impl EndpointHandler for PrintingHandler {
    fn bound(&self) {
        info!(side = self.side, "endpoint bonded");
    }

    fn received(&self, data: &[u8], handle: u8) -> RxDisposition {
        info!(
            side = self.side,
            handle,
            len = data.len(),
            "received {:?}",
            String::from_utf8_lossy(data)
        );
        let _ = self.delivered.send(data.to_vec());
        RxDisposition::Release
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    // Two 4 KiB regions, 8 blocks per direction.
    let (config_a, config_b) = LinkConfig::loopback(4096, 4096, 8, 8);
    let service_a = BufferService::open(config_a)?;
    let service_b = BufferService::open(config_b)?;

    let (tx_a, mut delivered_a) = mpsc::unbounded_channel();
    let (tx_b, mut delivered_b) = mpsc::unbounded_channel();
    let ep_a = service_a.register_endpoint(
        "demo",
        Arc::new(PrintingHandler {
            side: "A",
            delivered: tx_a,
        }),
    )?;
    let ep_b = service_b.register_endpoint(
        "demo",
        Arc::new(PrintingHandler {
            side: "B",
            delivered: tx_b,
        }),
    )?;

    info!("waiting for the bond handshake");
    while ep_a.state() != corebridge::BondState::Ready
        || ep_b.state() != corebridge::BondState::Ready
    {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    ep_a.send(b"hello from A").await?;
    ep_b.send(b"hello from B").await?;

    // Zero-copy: write straight into shared memory, then hand it over.
    let mut buffer = ep_a.alloc_tx(64, None).await?;
    let message = b"written in place";
    buffer.as_mut_slice()[..message.len()].copy_from_slice(message);
    ep_a.send_prepared(buffer, message.len()).await?;

    timeout(Duration::from_secs(5), delivered_a.recv()).await?;
    timeout(Duration::from_secs(5), delivered_b.recv()).await?;
    timeout(Duration::from_secs(5), delivered_b.recv()).await?;

    let stats = service_a.stats();
    info!(?stats, "link counters after the exchange");
    info!(max_payload = service_a.max_payload_size(), "demo finished");
    Ok(())
}
