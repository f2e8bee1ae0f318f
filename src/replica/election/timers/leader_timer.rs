use crate::replica::election::timers::shared_option::SharedOption;
use crate::replica::election::timers::time::{Clock, RealClock};
use crate::replica::election::timers::TimerEventSink;
use crate::replica::{LeaderTimerTick, ReplicaId, Term};
use std::sync::{Arc, Weak};
use tokio::time::{Duration, Instant};

/// Drives heartbeats/replication to one peer while we are leader. Dropping the handle stops the
/// timer task.
pub(crate) struct LeaderTimerHandle<C: Clock = RealClock> {
    shared: Arc<Shared<C>>,
}

struct Shared<C: Clock> {
    heartbeat_duration: Duration,
    next_heartbeat_time: SharedOption<Instant>,
    clock: C,
}

struct LeaderTimerTask<C: Clock, S: TimerEventSink> {
    weak_shared: Weak<Shared<C>>,
    next_heartbeat_time: SharedOption<Instant>,
    sink: S,
    event: LeaderTimerTick,
    clock: C,
}

impl LeaderTimerHandle {
    pub(crate) fn spawn_timer_task<S: TimerEventSink>(
        heartbeat_duration: Duration,
        sink: S,
        peer_id: ReplicaId,
        term: Term,
    ) -> Self {
        // Add minimal logic in this constructor, as it is untested.
        let (task, handle) = LeaderTimerTask::new(heartbeat_duration, sink, peer_id, term, RealClock);
        tokio::task::spawn(task.run());

        handle
    }
}

impl<C: Clock> LeaderTimerHandle<C> {
    /// This updates the timestamp when we will next tell the replica to send AE to this peer.
    pub(crate) fn reset_heartbeat_timer(&self) {
        self.shared.reset_heartbeat_timer();
    }
}

impl<C: Clock> Shared<C> {
    fn reset_heartbeat_timer(&self) {
        let new_timeout = self.clock.now() + self.heartbeat_duration;
        self.next_heartbeat_time.replace(new_timeout);
    }
}

impl<C: Clock, S: TimerEventSink> LeaderTimerTask<C, S> {
    fn new(
        heartbeat_duration: Duration,
        sink: S,
        peer_id: ReplicaId,
        term: Term,
        clock: C,
    ) -> (Self, LeaderTimerHandle<C>) {
        let shared_opt = SharedOption::new();
        let shared = Arc::new(Shared {
            heartbeat_duration,
            next_heartbeat_time: shared_opt.clone(),
            clock: clock.clone(),
        });

        let task = LeaderTimerTask {
            weak_shared: Arc::downgrade(&shared),
            next_heartbeat_time: shared_opt,
            sink,
            event: LeaderTimerTick { peer_id, term },
            clock,
        };
        let handle = LeaderTimerHandle { shared };

        (task, handle)
    }

    async fn run(mut self) {
        // Starts out empty, so a new leader ticks every peer right away.
        loop {
            if let Some(due) = self.next_heartbeat_time.take() {
                // Something went out to this peer recently. Nothing to do until `due`, unless
                // another send pushes it back again.
                self.clock.sleep_until(due).await;
                continue;
            }

            // Nobody reset the deadline while we slept: the peer is owed a heartbeat.
            let shared = match self.weak_shared.upgrade() {
                Some(shared) => shared,
                // Handle dropped: we lost leadership of `self.event.term`.
                None => return,
            };
            if !self.sink.leader_timer(self.event.clone()) {
                return;
            }
            shared.reset_heartbeat_timer();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::election::timers::test_utils::TestUtilSink;
    use crate::replica::election::timers::time;

    #[tokio::test]
    async fn leader_timer_handle_lifecycle() {
        // -- setup --
        let heartbeat_timeout = Duration::from_millis(100);
        let (sink, mut events) = TestUtilSink::new();

        let peer_id = ReplicaId::new(3);
        let term = Term::new(10);
        let expected_heartbeat_event = LeaderTimerTick { peer_id, term };

        let (mock_clock, mut mock_clock_controller) = time::mocked_clock();

        // -- execute & verify --

        // 1. Spawn task, assert there is one event in the queue.
        let (timer_task, timer_handle) = LeaderTimerTask::new(heartbeat_timeout, sink, peer_id, term, mock_clock);
        let task_join_handle = tokio::task::spawn(timer_task.run());

        events
            .assert_leader_heartbeat_event(expected_heartbeat_event.clone())
            .await;
        events.assert_no_event().await;

        // 2. Advance time and receive heartbeat many times
        for _ in 0..5 {
            mock_clock_controller.advance(heartbeat_timeout);
            events
                .assert_leader_heartbeat_event(expected_heartbeat_event.clone())
                .await;
            events.assert_no_event().await;
        }

        // 3. Advance time by a big leap, still receive single heartbeat
        mock_clock_controller.advance(heartbeat_timeout * 5);
        events
            .assert_leader_heartbeat_event(expected_heartbeat_event.clone())
            .await;
        events.assert_no_event().await;

        // 4. Drop handle and assert timer task exited without sending more events.
        drop(timer_handle);
        mock_clock_controller.advance(heartbeat_timeout);
        task_join_handle.await.unwrap();
        events.assert_no_event().await;
    }

    #[tokio::test]
    async fn leader_timer_handle_resetting_timeout() {
        // -- setup --
        let heartbeat_timeout = Duration::from_millis(100);
        let (sink, mut events) = TestUtilSink::new();

        let peer_id = ReplicaId::new(1);
        let term = Term::new(2);
        let expected_heartbeat_event = LeaderTimerTick { peer_id, term };

        let (mock_clock, mut mock_clock_controller) = time::mocked_clock();

        // -- execute & verify --

        // 1. Spawn task, assert there is one event in the queue.
        let (timer_task, timer_handle) = LeaderTimerTask::new(heartbeat_timeout, sink, peer_id, term, mock_clock);
        tokio::task::spawn(timer_task.run());

        events
            .assert_leader_heartbeat_event(expected_heartbeat_event.clone())
            .await;
        events.assert_no_event().await;

        // 2a. Repeatedly advance time by 0.5 and reset heartbeat timer
        for _ in 0..5 {
            mock_clock_controller.advance(heartbeat_timeout / 2);
            timer_handle.reset_heartbeat_timer();
        }
        // 2b. Assert no heartbeat (because we reset it!).
        events.assert_no_event().await;

        // Sanity check that T=2.5. Heartbeat should be due at T=3.5.
        assert_eq!(mock_clock_controller.elapsed_time(), heartbeat_timeout * 5 / 2);

        // 3a. Advance time to T=3, assert no heartbeat (because we reset it!)
        mock_clock_controller.advance(heartbeat_timeout / 2);
        events.assert_no_event().await;

        // 3b. Advance time to T=3.5, assert heartbeat (timeout occurs)
        mock_clock_controller.advance(heartbeat_timeout / 2);
        events
            .assert_leader_heartbeat_event(expected_heartbeat_event.clone())
            .await;
    }

    #[tokio::test]
    async fn leader_timer_exits_when_sink_is_gone() {
        let heartbeat_timeout = Duration::from_millis(100);
        let (sink, mut events) = TestUtilSink::new();
        let (mock_clock, mut mock_clock_controller) = time::mocked_clock();
        let tick = LeaderTimerTick {
            peer_id: ReplicaId::new(2),
            term: Term::new(4),
        };

        let (timer_task, _timer_handle) =
            LeaderTimerTask::new(heartbeat_timeout, sink, tick.peer_id, tick.term, mock_clock);
        let task_join_handle = tokio::task::spawn(timer_task.run());
        events.assert_leader_heartbeat_event(tick).await;

        // Replica went away while the handle is still alive (e.g. killed mid-term).
        drop(events);
        mock_clock_controller.advance(heartbeat_timeout);
        task_join_handle.await.unwrap();
    }
}
