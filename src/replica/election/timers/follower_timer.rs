use crate::replica::election::timers::shared_option::SharedOption;
use crate::replica::election::timers::time::{Clock, RealClock};
use crate::replica::election::timers::{SharedRng, TimerEventSink};
use rand::Rng;
use std::ops::RangeInclusive;
use std::sync::{Arc, PoisonError, Weak};
use tokio::time::{Duration, Instant};

/// Dropping the handle stops the timer task.
pub(crate) struct FollowerTimerHandle<C: Clock = RealClock> {
    shared: Arc<Shared<C>>,
}

struct Shared<C: Clock> {
    next_wake_time: SharedOption<Instant>,
    timeout_range: RangeInclusive<Duration>,
    rng: SharedRng,
    clock: C,
}

struct FollowerTimerTask<C: Clock, S: TimerEventSink> {
    weak_shared: Weak<Shared<C>>,
    next_wake_time: SharedOption<Instant>,
    sink: S,
    clock: C,
    // timeout_backoff is an impl detail (not from paper) which is just a static amount of time
    // that this task will wait between triggering timeouts to the replica.
    timeout_backoff: Duration,
}

impl FollowerTimerHandle {
    pub(crate) fn spawn_timer_task<S: TimerEventSink>(
        min_timeout: Duration,
        max_timeout: Duration,
        rng: SharedRng,
        sink: S,
    ) -> Self {
        let (task, handle) = FollowerTimerTask::new(min_timeout, max_timeout, rng, sink, RealClock);
        tokio::task::spawn(task.run());

        handle
    }
}

impl<C: Clock> FollowerTimerHandle<C> {
    /// Push the timeout out by a fresh random duration.
    pub(crate) fn reset_timeout(&self) {
        self.shared.reset_timeout();
    }

    /// True if the timeout was reset after the task last picked up its deadline. A timeout
    /// event that arrives while this holds was overtaken by the reset.
    pub(crate) fn reset_since_last_wake(&self) -> bool {
        self.shared.next_wake_time.is_some()
    }
}

impl<C: Clock> Shared<C> {
    fn reset_timeout(&self) {
        let rand_timeout = self
            .rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .gen_range(self.timeout_range.clone());
        self.next_wake_time.replace(self.clock.now() + rand_timeout);
    }
}

impl<C: Clock, S: TimerEventSink> FollowerTimerTask<C, S> {
    fn new(
        min_timeout: Duration,
        max_timeout: Duration,
        rng: SharedRng,
        sink: S,
        clock: C,
    ) -> (Self, FollowerTimerHandle<C>) {
        let shared_opt = SharedOption::new();
        let shared = Arc::new(Shared {
            next_wake_time: shared_opt.clone(),
            timeout_range: RangeInclusive::new(min_timeout, max_timeout),
            rng,
            clock: clock.clone(),
        });

        // Timer task must have a timeout value present when it starts, otherwise it would
        // time out immediately after we become a follower.
        shared.reset_timeout();

        let task = FollowerTimerTask {
            weak_shared: Arc::downgrade(&shared),
            next_wake_time: shared_opt,
            sink,
            clock,
            timeout_backoff: min_timeout,
        };
        let handle = FollowerTimerHandle { shared };

        (task, handle)
    }

    async fn run(mut self) {
        loop {
            match self.next_wake_time.take() {
                Some(wake_time) => {
                    // We've heard from a leader (or just started), so we sleep until the next timeout.
                    self.clock.sleep_until(wake_time).await;
                }
                None => {
                    // We slept until `wake_time` and nobody reset it, so we haven't heard from a
                    // leader and should start a new election. A reset can still land before the
                    // replica takes its lock; the replica checks `reset_since_last_wake()` and
                    // drops the timeout in that case.
                    if self.weak_shared.strong_count() == 0 {
                        return;
                    }
                    if !self.sink.follower_timeout() {
                        return;
                    }
                    self.clock.sleep(self.timeout_backoff).await;
                }
            }

            // The timer handle has dropped, which means we are no longer a follower/candidate in
            // the same term. Exit the task without starting a new election.
            if self.weak_shared.strong_count() == 0 {
                return;
            }
        }
    }
}
