// src/core/persistence/log.rs

//! The append-only operation log: one JSON-encoded mutation per line,
//! replayed over the last snapshot at boot.

use crate::core::ServerError;
use crate::core::bans::Ban;
use crate::core::channel::Channel;
use crate::core::persistence::snapshot::ServerImage;
use crate::core::users::User;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::Path;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::warn;

/// One logged mutation. Channel and user ops carry the full record so
/// replay never has to reconstruct partial edits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FreezerOp {
    ChannelUpsert { channel: Channel },
    ChannelRemove { id: u32 },
    UserUpsert { user: User },
    UserRemove { id: u32 },
    BanListReplace { bans: Vec<Ban> },
    ConfigSet { key: String, value: String },
}

impl FreezerOp {
    /// Applies this op to a boot-time image.
    pub fn apply(self, image: &mut ServerImage) {
        match self {
            FreezerOp::ChannelUpsert { channel } => image.upsert_channel(channel),
            FreezerOp::ChannelRemove { id } => image.remove_channel(id),
            FreezerOp::UserUpsert { user } => image.upsert_user(user),
            FreezerOp::UserRemove { id } => image.remove_user(id),
            FreezerOp::BanListReplace { bans } => image.bans = bans,
            FreezerOp::ConfigSet { key, value } => {
                image.config_overrides.insert(key, value);
            }
        }
    }
}

/// The buffered log writer. Each append is flushed so a crash loses at
/// most the op being written.
#[derive(Debug)]
pub struct LogWriter {
    writer: BufWriter<File>,
}

impl LogWriter {
    /// Opens a fresh, truncated log at `path`.
    pub async fn open(path: &Path) -> Result<Self, ServerError> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .await?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    pub async fn append(&mut self, op: &FreezerOp) -> Result<(), ServerError> {
        let mut line = serde_json::to_vec(op)?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn sync(&mut self) -> Result<(), ServerError> {
        self.writer.flush().await?;
        self.writer.get_ref().sync_data().await?;
        Ok(())
    }
}

/// Reads every replayable op from `path`. A trailing torn line (from a
/// crash mid-append) is skipped with a warning; corruption earlier in the
/// log is an error.
pub async fn read_ops(path: &Path) -> Result<Vec<FreezerOp>, ServerError> {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let lines: Vec<&str> = raw.lines().filter(|l| !l.trim().is_empty()).collect();
    let mut ops = Vec::with_capacity(lines.len());
    for (index, line) in lines.iter().enumerate() {
        match serde_json::from_str::<FreezerOp>(line) {
            Ok(op) => ops.push(op),
            Err(e) if index == lines.len() - 1 => {
                warn!(
                    "Dropping torn trailing op in {}: {}",
                    path.display(),
                    e
                );
            }
            Err(e) => {
                return Err(ServerError::Persistence(format!(
                    "corrupt op at {}:{}: {}",
                    path.display(),
                    index + 1,
                    e
                )));
            }
        }
    }
    Ok(ops)
}
