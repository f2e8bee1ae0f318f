use crate::replica::election::timers::{SharedRng, TimerEventSink};
use crate::replica::LeaderTimerTick;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug)]
pub(super) enum TimerEvent {
    FollowerTimeout,
    LeaderTimer(LeaderTimerTick),
}

pub(super) fn test_rng() -> SharedRng {
    Arc::new(Mutex::new(StdRng::seed_from_u64(7)))
}

/// Collects timer events in a queue instead of acting on them.
#[derive(Clone)]
pub(super) struct TestUtilSink {
    tx: mpsc::UnboundedSender<TimerEvent>,
}

impl TestUtilSink {
    pub(super) fn new() -> (Self, TestUtilTimerEvents) {
        let (tx, rx) = mpsc::unbounded_channel();

        (
            TestUtilSink { tx },
            TestUtilTimerEvents {
                rx,
                timeout: Duration::from_millis(10),
            },
        )
    }
}

impl TimerEventSink for TestUtilSink {
    fn follower_timeout(&self) -> bool {
        self.tx.send(TimerEvent::FollowerTimeout).is_ok()
    }

    fn leader_timer(&self, tick: LeaderTimerTick) -> bool {
        self.tx.send(TimerEvent::LeaderTimer(tick)).is_ok()
    }
}

pub(super) struct TestUtilTimerEvents {
    rx: mpsc::UnboundedReceiver<TimerEvent>,
    timeout: Duration,
}

impl TestUtilTimerEvents {
    async fn recv(&mut self) -> TimerEvent {
        tokio::time::timeout(Duration::from_secs(5), self.rx.recv())
            .await
            .expect("Unexpected timeout")
            .expect("Expected value")
    }

    pub(super) async fn assert_leader_heartbeat_event(&mut self, expected_leader_heartbeat: LeaderTimerTick) {
        match self.recv().await {
            TimerEvent::LeaderTimer(event) => assert_eq!(event, expected_leader_heartbeat),
            other => panic!("Unexpected event {:?}", other),
        }
    }

    pub(super) async fn assert_follower_timeout_event(&mut self) {
        match self.recv().await {
            TimerEvent::FollowerTimeout => {}
            other => panic!("Unexpected event {:?}", other),
        }
    }

    pub(super) async fn assert_no_event(&mut self) {
        if let Ok(event) = tokio::time::timeout(self.timeout, self.rx.recv()).await {
            panic!("Expected no event, got {:?}", event);
        }
    }
}
