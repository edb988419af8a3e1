//! Producer: enumerate work items, relabel, enqueue.

use serde_json::Value;
use tracing::{info, warn};

use taskdb::{TaskRecord, TaskStatus};
use uuid::Uuid;

use crate::db::DbHandle;
use crate::queueing::TaskQueue;
use crate::tracker::TaskGetter;

/// One producer pass: fetch activation-labeled items, `prepare` each
/// (label swap), create the pending database row and enqueue the key dict.
/// Per-item failures are tolerated; the pass continues. Returns the number
/// enqueued.
pub async fn produce_tasks(getter: &TaskGetter, db: &DbHandle, queue: &dyn TaskQueue) -> eyre::Result<usize> {
    let tasks = getter.list_tasks().await?;
    let mut enqueued = 0;

    for task in tasks {
        let key = task.key().clone();

        // Dedup: a pending or running attempt on this key is already in
        // flight.
        match db.latest_by_key(key.db_parts()).await {
            Ok(Some(latest)) if matches!(latest.status, TaskStatus::Pending | TaskStatus::Running) => {
                info!(%key, status = %latest.status, "produce_tasks: already in flight, skipping");
                continue;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(%key, error = %e, "produce_tasks: dedup lookup failed, skipping");
                continue;
            }
        }

        if let Err(e) = task.prepare().await {
            warn!(%key, error = %e, "produce_tasks: prepare failed, skipping item");
            continue;
        }

        let uuid = Uuid::new_v4().to_string();
        let record = TaskRecord::new_pending(&uuid, &key.db_parts(), None);
        if let Err(e) = db.insert(record).await {
            warn!(%key, error = %e, "produce_tasks: pending row insert failed, skipping item");
            continue;
        }

        let mut dict = key.to_dict();
        if let Some(object) = dict.as_object_mut() {
            object.insert("uuid".into(), Value::String(uuid));
        }
        queue.put(dict).await;
        enqueued += 1;
    }

    info!(enqueued, "produce_tasks: pass complete");
    Ok(enqueued)
}
