mod follower_timer;
mod leader_timer;
mod shared_option;
mod time;

#[cfg(test)]
mod test_utils;

pub(super) use follower_timer::FollowerTimerHandle;
pub(super) use leader_timer::LeaderTimerHandle;

use crate::replica::LeaderTimerTick;
use rand::rngs::StdRng;
use std::sync::{Arc, Mutex};

/// Random source for election timeouts. Owned by one replica and seeded once.
pub(crate) type SharedRng = Arc<Mutex<StdRng>>;

/// Where timer tasks deliver their events. Each method returns false once the receiver is gone
/// (replica dropped or killed), which tells the timer task to exit.
pub(crate) trait TimerEventSink: Clone + Send + Sync + 'static {
    fn follower_timeout(&self) -> bool;

    fn leader_timer(&self, tick: LeaderTimerTick) -> bool;
}
