//! Hotplug Bridge Integration Tests
//!
//! Event flow from a blocking USB thread into the Tokio runtime.
//!
//! Run with: `cargo test -p common --test hotplug_bridge_tests`

use common::test_utils::{mock_descriptor, mock_handle};
use common::{HotplugEvent, create_hotplug_bridge};
use std::thread;
use std::time::Duration;

#[tokio::test]
async fn test_events_keep_order_across_threads() {
    let (bridge, source) = create_hotplug_bridge();

    let producer = thread::spawn(move || {
        for address in 1..=50u8 {
            source
                .send_event(HotplugEvent::Arrived {
                    handle: mock_handle(address),
                    device: mock_descriptor(0x1234),
                })
                .unwrap();
            source
                .send_event(HotplugEvent::Left {
                    handle: mock_handle(address),
                })
                .unwrap();
        }
    });

    for address in 1..=50u8 {
        match bridge.recv_event().await.unwrap() {
            HotplugEvent::Arrived { handle, .. } => assert_eq!(handle, mock_handle(address)),
            other => panic!("expected arrival, got {:?}", other),
        }
        match bridge.recv_event().await.unwrap() {
            HotplugEvent::Left { handle } => assert_eq!(handle, mock_handle(address)),
            other => panic!("expected removal, got {:?}", other),
        }
    }

    producer.join().unwrap();
    assert!(bridge.recv_event().await.is_err());
}

#[tokio::test]
async fn test_full_channel_blocks_instead_of_dropping() {
    let (bridge, source) = create_hotplug_bridge();
    let total = 600u32;

    let producer = thread::spawn(move || {
        for i in 0..total {
            source
                .send_event(HotplugEvent::Left {
                    handle: mock_handle((i % 250) as u8 + 1),
                })
                .unwrap();
        }
    });

    // Let the producer fill the channel before draining it.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut received = 0;
    while bridge.recv_event().await.is_ok() {
        received += 1;
    }
    producer.join().unwrap();
    assert_eq!(received, total);
}

#[test]
fn test_send_fails_without_receiver() {
    let (bridge, source) = create_hotplug_bridge();
    drop(bridge);
    let result = source.send_event(HotplugEvent::Left {
        handle: mock_handle(1),
    });
    assert!(matches!(result, Err(common::Error::Channel(_))));
}
