mod common;

use std::time::Duration;

use common::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sshmux::{Config, CryptoVec};
use tokio::sync::mpsc;

async fn next(out: &mut mpsc::UnboundedReceiver<CryptoVec>) -> CryptoVec {
    tokio::time::timeout(Duration::from_secs(5), out.recv())
        .await
        .expect("writer stalled")
        .expect("connection closed")
}

/// Open a channel from `c`, confirmed by the test with `window` and
/// `max_packet`.
async fn open(
    c: &sshmux::Connection,
    out: &mut mpsc::UnboundedReceiver<CryptoVec>,
    window: u32,
    max_packet: u32,
) -> sshmux::Channel {
    let opener = c.clone();
    let opening =
        tokio::spawn(async move { opener.channel_open_direct_tcpip("example.com", 80, "127.0.0.1", 4000).await });
    let packet = next(out).await;
    assert_eq!(packet[0], CHANNEL_OPEN);
    let mut f = Fields::new(&packet);
    assert_eq!(f.str(), "direct-tcpip");
    let id = f.u32();
    f.u32();
    f.u32();
    assert_eq!(f.str(), "example.com");
    assert_eq!(f.u32(), 80);

    let mut confirmation = CryptoVec::new();
    confirmation.push(CHANNEL_OPEN_CONFIRMATION);
    confirmation.push_u32_be(id);
    confirmation.push_u32_be(77);
    confirmation.push_u32_be(window);
    confirmation.push_u32_be(max_packet);
    c.handle_message(&confirmation).await.unwrap();
    opening.await.unwrap().unwrap()
}

fn adjust(id: u32, amount: u32) -> CryptoVec {
    let mut packet = CryptoVec::new();
    packet.push(CHANNEL_WINDOW_ADJUST);
    packet.push_u32_be(id);
    packet.push_u32_be(amount);
    packet
}

#[tokio::test]
async fn never_sends_beyond_the_window() {
    for seed in 0..8u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let (c, mut out, _) = single(Config::default());
        let initial = rng.gen_range(1..2000);
        let max_packet = rng.gen_range(1..700);
        let channel = open(&c, &mut out, initial, max_packet).await;
        let id = channel.id().as_u32();

        let sizes: Vec<usize> = (0..rng.gen_range(1..30)).map(|_| rng.gen_range(0..3000)).collect();
        let total: usize = sizes.iter().sum();
        let writing = tokio::spawn(async move {
            for n in sizes {
                assert_eq!(channel.write(&vec![7; n]).await.unwrap(), n);
            }
            channel
        });

        let mut granted = u64::from(initial);
        let mut received = 0u64;
        while received < total as u64 {
            let packet = next(&mut out).await;
            assert_eq!(packet[0], CHANNEL_DATA);
            let mut f = Fields::new(&packet);
            assert_eq!(f.u32(), 77);
            let n = f.string().len();
            assert!(n > 0 && n <= max_packet as usize);
            received += n as u64;
            assert!(received <= granted, "seed {}: {} bytes sent with {} granted", seed, received, granted);
            // The writer only waits when the window is exhausted.
            if received == granted || rng.gen_bool(0.3) {
                let amount = rng.gen_range(1..1500);
                granted += u64::from(amount);
                c.handle_message(&adjust(id, amount)).await.unwrap();
            }
        }
        let channel = writing.await.unwrap();
        assert_eq!(u64::from(channel.tx_window()), granted - received);
        assert!(out.try_recv().is_err());
    }
}

#[tokio::test]
async fn consumed_data_is_credited_back() {
    let mut config = Config::default();
    config.window_size = 1000;
    config.maximum_packet_size = 400;
    let (c, mut out, _) = single(config);
    let mut channel = open(&c, &mut out, 100, 100).await;
    let id = channel.id().as_u32();

    let mut sent = 0u32;
    let mut credited = 0u32;
    for round in 0..20 {
        let mut data = CryptoVec::new();
        data.push(CHANNEL_DATA);
        data.push_u32_be(id);
        push_string(&mut data, &[round as u8; 300]);
        c.handle_message(&data).await.unwrap();
        sent += 300;
        assert_eq!(&channel.read().await.unwrap()[..], &[round as u8; 300][..]);
        while let Ok(packet) = out.try_recv() {
            assert_eq!(packet[0], CHANNEL_WINDOW_ADJUST);
            let mut f = Fields::new(&packet);
            assert_eq!(f.u32(), 77);
            credited += f.u32();
        }
        // The remote side always has room for the next packet.
        assert!(1000 + credited - sent >= 300, "round {}", round);
        assert_eq!(channel.rx_window(), 1000 + credited - sent);
    }
    assert!(credited > 0);

    let mut overflow = adjust(id, u32::MAX);
    c.handle_message(&overflow).await.unwrap_err();
    overflow = adjust(id + 1, 1);
    assert!(!c.handle_message(&overflow).await.unwrap_err().is_fatal());
}
