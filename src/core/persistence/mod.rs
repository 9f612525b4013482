// src/core/persistence/mod.rs

//! The "freezer": durable server state as an append-only operation log
//! plus periodic full snapshots.
//!
//! Boot order: load the last snapshot, replay the log over it, then rotate
//! to a fresh log. At runtime the control loop appends one op per durable
//! mutation and cuts a new snapshot once the op counter crosses the
//! configured threshold (and once more at shutdown). A persistence failure
//! is fatal to the process.

pub mod log;
pub mod snapshot;

pub use log::{FreezerOp, LogWriter};
pub use snapshot::ServerImage;

use crate::core::ServerError;
use std::path::PathBuf;
use tracing::info;

#[derive(Debug)]
pub struct Freezer {
    snapshot_path: PathBuf,
    log_path: PathBuf,
    log: LogWriter,
    ops_since_snapshot: u32,
    snapshot_threshold: u32,
}

impl Freezer {
    /// Rebuilds the boot image (snapshot + replay) and opens a fresh log.
    pub async fn open(
        snapshot_path: PathBuf,
        log_path: PathBuf,
        snapshot_threshold: u32,
    ) -> Result<(Self, ServerImage), ServerError> {
        let mut image = snapshot::load(&snapshot_path).await?.unwrap_or_default();

        let ops = log::read_ops(&log_path).await?;
        let replayed = ops.len();
        for op in ops {
            op.apply(&mut image);
        }
        if replayed > 0 {
            info!("Replayed {replayed} logged ops over the snapshot");
            // The replayed ops are folded into a fresh snapshot before the
            // log is truncated, so they cannot be lost to a crash.
            snapshot::save(&image, &snapshot_path).await?;
        }

        let log = LogWriter::open(&log_path).await?;
        let freezer = Self {
            snapshot_path,
            log_path,
            log,
            ops_since_snapshot: 0,
            snapshot_threshold,
        };
        Ok((freezer, image))
    }

    /// Records a single durable mutation.
    pub async fn append(&mut self, op: &FreezerOp) -> Result<(), ServerError> {
        self.log.append(op).await?;
        self.ops_since_snapshot += 1;
        Ok(())
    }

    /// Whether the op counter has reached the snapshot threshold.
    pub fn snapshot_due(&self) -> bool {
        self.ops_since_snapshot >= self.snapshot_threshold
    }

    pub fn ops_since_snapshot(&self) -> u32 {
        self.ops_since_snapshot
    }

    /// Writes a full image, truncates the log, and resets the op counter.
    pub async fn snapshot(&mut self, image: &ServerImage) -> Result<(), ServerError> {
        self.log.sync().await?;
        snapshot::save(image, &self.snapshot_path).await?;
        self.log = LogWriter::open(&self.log_path).await?;
        self.ops_since_snapshot = 0;
        Ok(())
    }
}
