//! Collaborators the scheduler drives but does not implement.

use std::io;
use std::path::Path;

use anyhow::Result;
use quay_events::InfoHash;

use crate::barrier::{BarrierToken, ShutdownBarrier};

/// Transfer runtime: peer sessions, tracker announces and storage.
///
/// Calls are made from the scheduler's single thread of control and should
/// return promptly; long-running work belongs on the runtime's own tasks.
pub trait TransferBackend: Send + Sync {
    /// Begin downloading or seeding.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime refused or failed to start the transfer.
    fn start(&self, info_hash: &InfoHash) -> Result<()>;

    /// Stop all peer activity for the transfer.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime failed to stop the transfer.
    fn stop(&self, info_hash: &InfoHash) -> Result<()>;

    /// Send the final "stopped" announce for one tracker.
    ///
    /// The token is already registered with `barrier`; implementations call
    /// [`ShutdownBarrier::complete`] once the announce settles, successfully
    /// or not.
    fn announce_stopped(&self, token: BarrierToken, barrier: ShutdownBarrier);
}

/// Free-space probe for a transfer's target volume.
pub trait DiskProbe: Send + Sync {
    /// Bytes available to unprivileged writers on the volume holding `path`.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error when the volume cannot be queried.
    fn free_space(&self, path: &Path) -> io::Result<u64>;
}
