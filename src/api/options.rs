use std::convert::TryFrom;
use tokio::time::Duration;

/// Tuning knobs. Anything left as None gets a default.
#[derive(Clone, Debug, Default)]
pub struct RaftOptions {
    pub leader_heartbeat_duration: Option<Duration>,
    pub follower_min_timeout: Option<Duration>,
    pub follower_max_timeout: Option<Duration>,
    /// Most log entries a leader sends in one AppendEntries call.
    pub max_entries_per_append: Option<usize>,
    /// How many applied messages can wait in the `ApplyStream` before the replica stops applying.
    pub apply_channel_capacity: Option<usize>,
    /// Seed for election timeout randomness. Taken from entropy if unset.
    pub rng_seed: Option<u64>,
}

#[derive(Debug)]
pub(super) struct RaftOptionsValidated {
    pub leader_heartbeat_duration: Duration,
    pub follower_min_timeout: Duration,
    pub follower_max_timeout: Duration,
    pub max_entries_per_append: usize,
    pub apply_channel_capacity: usize,
    pub rng_seed: Option<u64>,
}

impl RaftOptionsValidated {
    fn validate(&self) -> Result<(), &'static str> {
        if self.leader_heartbeat_duration >= self.follower_min_timeout {
            return Err("Follower minimum timeout must be greater than leader's heartbeat");
        }
        if self.follower_min_timeout > self.follower_max_timeout {
            return Err("Follower minimum timeout must not exceed maximum timeout");
        }
        if self.max_entries_per_append == 0 {
            return Err("Leader must be allowed to send at least 1 entry per AppendEntries");
        }
        if self.apply_channel_capacity == 0 {
            return Err("Apply channel capacity must be at least 1");
        }

        Ok(())
    }
}

impl TryFrom<RaftOptions> for RaftOptionsValidated {
    type Error = &'static str;

    fn try_from(options: RaftOptions) -> Result<Self, Self::Error> {
        let values = RaftOptionsValidated {
            leader_heartbeat_duration: options.leader_heartbeat_duration.unwrap_or(Duration::from_millis(100)),
            follower_min_timeout: options.follower_min_timeout.unwrap_or(Duration::from_millis(300)),
            follower_max_timeout: options.follower_max_timeout.unwrap_or(Duration::from_millis(450)),
            max_entries_per_append: options.max_entries_per_append.unwrap_or(64),
            apply_channel_capacity: options.apply_channel_capacity.unwrap_or(64),
            rng_seed: options.rng_seed,
        };

        values.validate()?;
        Ok(values)
    }
}
