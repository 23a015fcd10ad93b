//! Command queue behaviour against a scripted transport

mod common;

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;

use common::{MockLens, Response};
use huskylens_core::config::QueueConfig;
use huskylens_core::protocol::ProtocolError;
use huskylens_core::queue::CommandQueue;
use huskylens_core::transport::ChannelId;

fn queue(lens: &Arc<MockLens>) -> CommandQueue {
    CommandQueue::spawn(Arc::clone(lens), QueueConfig::default())
}

#[tokio::test(start_paused = true)]
async fn test_blocked_commands_dispatch_in_order_one_at_a_time() {
    let lens = MockLens::new();
    lens.set_writable(false);
    lens.set_write_delay(Duration::from_millis(3));
    let queue = queue(&lens);
    let ch = ChannelId::default();

    let (a, b, c, ()) = tokio::join!(
        queue.send(ch, vec![0xA]),
        queue.send(ch, vec![0xB]),
        queue.send(ch, vec![0xC]),
        async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            lens.set_writable(true);
        },
    );

    a.unwrap();
    b.unwrap();
    c.unwrap();
    assert_eq!(lens.writes(), vec![vec![0xA], vec![0xB], vec![0xC]]);
    assert_eq!(lens.in_flight().max(), 1);

    let stats = queue.stats();
    assert_eq!(stats.dispatched, 3);
    assert!(stats.busy_retries >= 4);
    assert!(!lens.gate().is_busy());
}

#[tokio::test(start_paused = true)]
async fn test_recovery_timeout_frees_channel() {
    let lens = MockLens::new();
    lens.script(Response::Hang);
    let queue = queue(&lens);
    let ch = ChannelId::default();

    let started = tokio::time::Instant::now();
    let err = queue.send(ch, vec![1]).await.unwrap_err();
    assert!(matches!(err, ProtocolError::ChannelBusyTimeout));
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(1000) && elapsed < Duration::from_millis(1100));
    assert!(!lens.gate().is_busy());

    queue.send(ch, vec![2]).await.unwrap();
    assert_eq!(lens.writes(), vec![vec![1], vec![2]]);
    assert_eq!(queue.stats().recoveries, 1);
}

#[tokio::test(start_paused = true)]
async fn test_transport_error_still_clears_busy_flag() {
    let lens = MockLens::new();
    lens.script(Response::Fail);
    let queue = queue(&lens);

    let err = queue.send(ChannelId::default(), vec![1]).await.unwrap_err();
    assert!(matches!(err, ProtocolError::Transport(_)));
    assert!(!lens.gate().is_busy());

    queue.send(ChannelId::default(), vec![2]).await.unwrap();
    assert_eq!(queue.stats().recoveries, 0);
}

#[tokio::test(start_paused = true)]
async fn test_disconnected_transport_drops_commands() {
    let lens = MockLens::new();
    lens.set_connected(false);
    let queue = queue(&lens);

    let err = queue.send(ChannelId::default(), vec![1]).await.unwrap_err();
    assert!(matches!(err, ProtocolError::TransportDisconnected));
    assert!(lens.writes().is_empty());
    assert_eq!(queue.stats().dropped, 1);
}

#[tokio::test(start_paused = true)]
async fn test_shared_gate_serializes_two_sessions() {
    let first = MockLens::new();
    let second = MockLens::sharing(&first);
    first.set_write_delay(Duration::from_millis(4));
    second.set_write_delay(Duration::from_millis(4));
    let q1 = queue(&first);
    let q2 = queue(&second);
    let ch = ChannelId::default();

    let (a, b, c, d) = tokio::join!(
        q1.send(ch, vec![1]),
        q2.send(ch, vec![2]),
        q1.send(ch, vec![3]),
        q2.send(ch, vec![4]),
    );
    for result in [a, b, c, d] {
        result.unwrap();
    }

    assert_eq!(first.in_flight().max(), 1);
    assert_eq!(first.writes(), vec![vec![1], vec![3]]);
    assert_eq!(second.writes(), vec![vec![2], vec![4]]);
}

#[tokio::test(start_paused = true)]
async fn test_close_answers_pending_callers() {
    let lens = MockLens::new();
    lens.set_writable(false);
    let queue = queue(&lens);

    let (pending, ()) = tokio::join!(queue.send(ChannelId::default(), vec![1]), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.close();
    });

    assert!(matches!(pending, Err(ProtocolError::TransportDisconnected)));
    assert!(lens.writes().is_empty());
    let err = queue.send(ChannelId::default(), vec![2]).await.unwrap_err();
    assert!(matches!(err, ProtocolError::TransportDisconnected));
}
