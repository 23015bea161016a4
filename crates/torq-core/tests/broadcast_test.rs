// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Broadcast fan-out carrying torq events.

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use torq_core::events::{ChannelEvent, ChannelEventType};
use torq_core::{BroadcastConfig, Broadcaster, TorqEvent};

fn opened(node_id: i32, channel_id: i32) -> TorqEvent {
    TorqEvent::Channel(ChannelEvent {
        node_id,
        channel_id,
        event_type: ChannelEventType::Open,
        event_time: Utc::now(),
    })
}

#[tokio::test]
async fn test_subscribers_see_events_until_cancelled() {
    let (tx, rx) = mpsc::channel(8);
    let cancel = CancellationToken::new();
    let (broadcaster, task) = Broadcaster::spawn(rx, cancel.clone(), BroadcastConfig::default());

    let mut first = broadcaster.subscribe();
    let mut second = broadcaster.subscribe();
    for channel_id in 1..=3 {
        tx.send(opened(1, channel_id)).await.unwrap();
    }

    for subscription in [&mut first, &mut second] {
        for expected in 1..=3 {
            match subscription.recv().await {
                Some(TorqEvent::Channel(event)) => assert_eq!(event.channel_id, expected),
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    cancel.cancel();
    task.await.unwrap();
    assert!(first.recv().await.is_none());
    assert!(second.recv().await.is_none());
    assert_eq!(broadcaster.subscriber_count().await, 0);
}

#[tokio::test]
async fn test_late_subscriber_misses_earlier_events() {
    let (tx, rx) = mpsc::channel(8);
    let cancel = CancellationToken::new();
    let (broadcaster, _task) = Broadcaster::spawn(rx, cancel.clone(), BroadcastConfig::default());

    let mut early = broadcaster.subscribe();
    tx.send(opened(1, 1)).await.unwrap();
    assert_eq!(early.recv().await.map(|e| e.node_id()), Some(1));

    let mut late = broadcaster.subscribe();
    tx.send(opened(2, 2)).await.unwrap();
    assert_eq!(late.recv().await.map(|e| e.node_id()), Some(2));
    assert_eq!(early.recv().await.map(|e| e.node_id()), Some(2));
    assert!(late.try_recv().is_none());

    late.unsubscribe();
    assert_eq!(broadcaster.subscriber_count().await, 1);
    cancel.cancel();
}
