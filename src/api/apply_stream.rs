use crate::commitlog::Index;
use crate::replica::Term;
use bytes::Bytes;
use tokio::sync::mpsc;

/// What the replica hands to the application's state machine, in index order.
#[derive(Clone, Debug, PartialEq)]
pub enum ApplyMsg {
    /// A committed command.
    Command { index: Index, term: Term, command: Bytes },
    /// Replace the state machine with this snapshot. Commands that follow continue from
    /// `index + 1`.
    Snapshot { index: Index, term: Term, data: Bytes },
}

impl ApplyMsg {
    /// Log index of the command, or the last index covered by the snapshot.
    pub fn index(&self) -> Index {
        match self {
            ApplyMsg::Command { index, .. } => *index,
            ApplyMsg::Snapshot { index, .. } => *index,
        }
    }
}

// For external application to call into this library.
pub struct ApplyStream {
    receiver: mpsc::Receiver<ApplyMsg>,
}

impl ApplyStream {
    pub(crate) fn new(receiver: mpsc::Receiver<ApplyMsg>) -> Self {
        ApplyStream { receiver }
    }

    /// next returns the next message to apply to your application's state machine, or None once
    /// the replica has been killed or dropped.
    ///
    /// The replica waits for the application to take each message, so not reading the stream
    /// eventually stalls applying (but not replication).
    pub async fn next(&mut self) -> Option<ApplyMsg> {
        self.receiver.recv().await
    }
}
