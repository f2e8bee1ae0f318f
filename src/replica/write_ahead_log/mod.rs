//! This module is a raft-specific commit log that wraps the generic commit log. It adds the
//! snapshot boundary, commit/applied tracking, and the raft rules for moving them.

mod log;
mod log_entry;
mod snapshot;

pub(crate) use log::WriteAheadLog;
pub(crate) use log_entry::WriteAheadLogEntry;
pub(crate) use snapshot::Snapshot;
