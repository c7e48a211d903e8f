//! Discovery pipeline.
//!
//! A run takes one discovery from its stored definition to a set of per-IP result rows:
//!
//! 1. fetch the discovery and its candidate credentials
//! 2. delete the results of any previous run
//! 3. expand the address spec ([`ip`])
//! 4. ping every address with one batched process ([`probes`])
//! 5. connect to the discovery's port on every responding address, concurrently, and wait for
//!    all attempts
//! 6. ask the plugin once which credential works on each remaining address
//! 7. mark the discovery COMPLETED, or FAILED if a stage could not run at all
//!
//! Addresses that drop out at a stage are recorded as FAILED results right away. The
//! discovery's own status only reflects whether the pipeline finished.

pub mod ip;
pub mod pipeline;
pub mod probes;
pub mod registry;

pub use pipeline::{DiscoveryPipeline, DiscoveryReport, DiscoveryStore, DiscoveryTarget, PgDiscoveryStore};
pub use probes::{FpingProber, NetworkProber, ProbeOutcome};
pub use registry::{RunGuard, RunRegistry};

use crate::db::errors::DbError;
use crate::types::DiscoveryId;

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("Discovery {0} not found")]
    NotFound(DiscoveryId),

    #[error("Discovery {0} is already running")]
    AlreadyRunning(DiscoveryId),

    #[error("Discovery {id} cannot be run: {reason}")]
    InvalidTarget { id: DiscoveryId, reason: String },

    #[error("Discovery storage failed: {0}")]
    Store(#[from] DbError),
}
