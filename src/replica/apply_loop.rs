use crate::api::ApplyMsg;
use crate::handle::WeakReplicaHandle;
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};

/// Wakes the apply loop. A notification sent while the loop is busy is remembered, so the loop
/// never sleeps through newly committed entries.
#[derive(Clone, Default)]
pub(crate) struct ApplySignal {
    notify: Arc<Notify>,
}

impl ApplySignal {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn notify(&self) {
        self.notify.notify_one();
    }

    async fn wait(&self) {
        self.notify.notified().await;
    }
}

/// Delivers committed entries (and installed snapshots) to the consumer, in index order. Copies
/// a batch out under the replica lock, sends it without the lock, then records it as applied.
/// Returns when the replica is killed or dropped, or the consumer drops its stream.
pub(crate) async fn run_apply_loop(
    logger: slog::Logger,
    replica: WeakReplicaHandle,
    signal: ApplySignal,
    sender: mpsc::Sender<ApplyMsg>,
) {
    loop {
        loop {
            let (msgs, last_index) = match replica.take_apply_batch() {
                None => {
                    slog::info!(logger, "Replica is gone. Stopping apply loop.");
                    return;
                }
                Some(None) => break,
                Some(Some(batch)) => batch,
            };

            slog::debug!(logger, "Applying {} message(s) through {:?}", msgs.len(), last_index);
            for msg in msgs {
                if sender.send(msg).await.is_err() {
                    slog::warn!(logger, "ApplyStream has been dropped. Stopping apply loop.");
                    return;
                }
            }

            if !replica.mark_applied(last_index) {
                slog::info!(logger, "Replica is gone. Stopping apply loop.");
                return;
            }
        }

        signal.wait().await;
    }
}
