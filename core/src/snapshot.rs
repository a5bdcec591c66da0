use crate::format;
use crate::pool::TaskGroup;
use crate::{BlobType, Disk, Error, ObjectId, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::{error, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub id: ObjectId,
    pub name: Option<String>,
    /// Creation time, Unix milliseconds.
    pub time: i64,
    /// Logical size of the snapshot content.
    pub len: i64,
    /// Bytes stored when the snapshot was made, snapshot object included.
    pub stored: i64,
}

impl SnapshotInfo {
    pub fn short_id(&self) -> String {
        self.id.short_string()
    }

    pub fn datetime(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.time).single()
    }

    pub fn summary(&self) -> String {
        let time = self
            .datetime()
            .map(|time| time.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "?".to_string());

        format!(
            "{} - {} at {}",
            self.short_id(),
            self.name.as_deref().unwrap_or("(anonymous)"),
            time
        )
    }
}

/// Every snapshot reachable from a tag, oldest first. Tags pointing to
/// something else than a readable snapshot are logged and skipped.
pub async fn list(disk: &Arc<Disk>) -> Result<Vec<SnapshotInfo>> {
    let ids = disk.list_tags().await?;

    let snapshots = Arc::new(Mutex::new(Vec::with_capacity(ids.len())));
    let group = TaskGroup::new(disk.pool());

    for id in ids {
        let disk = disk.clone();
        let snapshots = snapshots.clone();

        group.spawn(async move {
            let Ok((blob_type, data)) = disk.read_blob(&id).await else {
                return false;
            };

            if blob_type != BlobType::Snapshot {
                warn!("Object '{}' is not a Snapshot (ignoring)", id);
                return true;
            }
            let Ok(header) = format::decode_snapshot_header(&data) else {
                warn!("Malformed snapshot object '{}' (ignoring)", id);
                return true;
            };

            let info = SnapshotInfo {
                id,
                name: (!header.name.is_empty()).then_some(header.name),
                time: header.time,
                len: header.len,
                stored: header.stored + data.len() as i64,
            };

            match snapshots.lock() {
                Ok(mut snapshots) => snapshots.push(info),
                Err(poisoned) => poisoned.into_inner().push(info),
            }
            true
        });
    }

    let success = group.sync().await;

    let mut snapshots = match snapshots.lock() {
        Ok(mut snapshots) => std::mem::take(&mut *snapshots),
        Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
    };

    // Only fail when nothing could be read
    if !success && snapshots.is_empty() {
        error!("Failed to read any snapshot");
        return Err(Error::Other("Failed to list snapshots".to_string()));
    }

    snapshots.sort_by_key(|snapshot| snapshot.time);
    Ok(snapshots)
}
