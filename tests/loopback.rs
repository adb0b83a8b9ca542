//! End-to-end exercises over an in-process loopback link

use corebridge::{
    BondState, BufferService, ChannelError, Endpoint, EndpointHandler, LinkConfig, RxDisposition,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Deterministic noise source for payload generation
fn noise(state: &mut u32) -> u32 {
    *state = state.wrapping_mul(1664525).wrapping_add(1013904223);
    *state >> 16
}

fn noise_payload(state: &mut u32, len: usize) -> Vec<u8> {
    (0..len).map(|_| noise(state) as u8).collect()
}

struct Collector {
    frames: Mutex<Vec<Vec<u8>>>,
    bound_count: AtomicUsize,
}

impl Collector {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            frames: Mutex::new(Vec::new()),
            bound_count: AtomicUsize::new(0),
        })
    }

    fn frame_count(&self) -> usize {
        self.frames.lock().unwrap().len()
    }
}

impl EndpointHandler for Collector {
    fn bound(&self) {
        self.bound_count.fetch_add(1, Ordering::SeqCst);
    }

    fn received(&self, data: &[u8], _handle: u8) -> RxDisposition {
        self.frames.lock().unwrap().push(data.to_vec());
        RxDisposition::Release
    }
}

async fn wait_ready(endpoint: &Endpoint) {
    for _ in 0..400 {
        if endpoint.state() == BondState::Ready {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("endpoint never became ready, state {:?}", endpoint.state());
}

async fn wait_frames(collector: &Collector, count: usize) {
    for _ in 0..1000 {
        if collector.frame_count() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!(
        "expected {} frames, got {}",
        count,
        collector.frame_count()
    );
}

fn bonded_pair(
    region_len: usize,
    blocks: usize,
) -> (BufferService, BufferService, Endpoint, Endpoint, Arc<Collector>, Arc<Collector>) {
    let (config_a, config_b) = LinkConfig::loopback(region_len, region_len, blocks, blocks);
    let service_a = BufferService::open(config_a).unwrap();
    let service_b = BufferService::open(config_b).unwrap();
    let collector_a = Collector::new();
    let collector_b = Collector::new();
    let ep_a = service_a.register_endpoint("data", collector_a.clone()).unwrap();
    let ep_b = service_b.register_endpoint("data", collector_b.clone()).unwrap();
    (service_a, service_b, ep_a, ep_b, collector_a, collector_b)
}

#[tokio::test]
async fn test_roundtrip_all_sizes() {
    let (service_a, _service_b, ep_a, ep_b, _ca, collector_b) = bonded_pair(8192, 16);
    wait_ready(&ep_a).await;
    wait_ready(&ep_b).await;

    let max = service_a.max_payload_size();
    let mut state = 1u32;
    let sizes = [0usize, 1, 7, 8, 63, 64, 65, max / 2, max];
    let mut expected = Vec::new();
    for &size in &sizes {
        let payload = noise_payload(&mut state, size);
        ep_a.send(&payload).await.unwrap();
        expected.push(payload);
    }
    wait_frames(&collector_b, expected.len()).await;
    assert_eq!(*collector_b.frames.lock().unwrap(), expected);
}

#[tokio::test]
async fn test_wraparound_stress_preserves_order_and_content() {
    let (_service_a, _service_b, ep_a, ep_b, collector_a, collector_b) = bonded_pair(4096, 8);
    wait_ready(&ep_a).await;
    wait_ready(&ep_b).await;

    // Far more traffic than the ring or the blocks area can hold at once,
    // in both directions, so every wraparound and backpressure path runs.
    let mut tx_state = 42u32;
    let mut expected_b = Vec::new();
    for _ in 0..500 {
        let size = (noise(&mut tx_state) as usize) % 200;
        expected_b.push(noise_payload(&mut tx_state, size));
    }
    let mut rx_state = 1337u32;
    let mut expected_a = Vec::new();
    for _ in 0..500 {
        let size = (noise(&mut rx_state) as usize) % 200;
        expected_a.push(noise_payload(&mut rx_state, size));
    }

    let forward = {
        let frames = expected_b.clone();
        tokio::spawn(async move {
            for frame in &frames {
                ep_a.send(frame).await.unwrap();
            }
            ep_a
        })
    };
    let backward = {
        let frames = expected_a.clone();
        tokio::spawn(async move {
            for frame in &frames {
                ep_b.send(frame).await.unwrap();
            }
            ep_b
        })
    };
    forward.await.unwrap();
    backward.await.unwrap();

    wait_frames(&collector_b, expected_b.len()).await;
    wait_frames(&collector_a, expected_a.len()).await;
    assert_eq!(*collector_b.frames.lock().unwrap(), expected_b);
    assert_eq!(*collector_a.frames.lock().unwrap(), expected_a);
}

#[tokio::test]
async fn test_backpressure_never_loses_a_wakeup() {
    // Tiny pool: nearly every send has to wait for a release first.
    let (service_a, _service_b, ep_a, ep_b, _ca, collector_b) = bonded_pair(1024, 4);
    wait_ready(&ep_a).await;
    wait_ready(&ep_b).await;

    let block = service_a.stats().tx_block_size - 8;
    let sends = async {
        for i in 0..200u32 {
            ep_a.send(&vec![i as u8; block]).await.unwrap();
        }
    };
    tokio::time::timeout(Duration::from_secs(30), sends)
        .await
        .expect("send loop stalled, a wakeup was lost");
    wait_frames(&collector_b, 200).await;
}

#[tokio::test]
async fn test_bonding_is_order_independent() {
    let (config_a, config_b) = LinkConfig::loopback(8192, 8192, 16, 16);
    let service_a = BufferService::open(config_a).unwrap();
    let service_b = BufferService::open(config_b).unwrap();

    // Opposite registration orders, with pauses so announcements for
    // not-yet-registered names actually hit the pending table.
    let names = ["alpha", "beta", "gamma"];
    let mut side_a = Vec::new();
    let mut side_b = Vec::new();
    for name in names {
        side_a.push((
            Collector::new(),
            name,
        ));
    }
    let mut eps_a = Vec::new();
    for (collector, name) in &side_a {
        eps_a.push(service_a.register_endpoint(name, collector.clone()).unwrap());
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    for name in names.iter().rev() {
        let collector = Collector::new();
        let ep = service_b.register_endpoint(name, collector.clone()).unwrap();
        side_b.push((collector, ep));
    }

    for ep in &eps_a {
        wait_ready(ep).await;
    }
    for (_, ep) in &side_b {
        wait_ready(ep).await;
    }
    for (collector, _) in &side_a {
        assert_eq!(collector.bound_count.load(Ordering::SeqCst), 1);
    }
    for (collector, _) in &side_b {
        assert_eq!(collector.bound_count.load(Ordering::SeqCst), 1);
    }
}

#[tokio::test]
async fn test_corrupted_ring_index_fails_fatally() {
    let (config_a, config_b) = LinkConfig::loopback(4096, 4096, 8, 8);
    // A's TX ring indices live at the start of the A-to-B region.
    let a_to_b = config_a.tx_region.clone();
    let service_a = BufferService::open(config_a).unwrap();
    let service_b = BufferService::open(config_b).unwrap();
    let collector_b = Collector::new();
    let ep_a = service_a.register_endpoint("data", Collector::new()).unwrap();
    let ep_b = service_b.register_endpoint("data", collector_b.clone()).unwrap();
    wait_ready(&ep_a).await;
    wait_ready(&ep_b).await;
    ep_a.send(b"before").await.unwrap();
    wait_frames(&collector_b, 1).await;

    // Smash the write index. Both sides must treat the ring as dead rather
    // than chase garbage.
    a_to_b
        .index_cell(4)
        .store(0xDEAD_0000, std::sync::atomic::Ordering::SeqCst);

    let result = ep_a.send(b"after").await;
    assert!(matches!(result, Err(ChannelError::Corrupted(_))));

    // The surviving side stays intact: no panic, no phantom frames.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(collector_b.frame_count(), 1);
    assert!(service_b.stats().registered_endpoints == 1);
}
