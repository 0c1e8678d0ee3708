use std::sync::Arc;

use serde::Deserialize;

use shipsync_core::ListResult;
use shipsync_sql::{Row, SQLStore, Value};

use crate::error::QueueError;
use crate::model::{QueueItem, QueueItemStatus};

/// SQL schema for the queue items table.
const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS queue_items (
    id                      INTEGER PRIMARY KEY AUTOINCREMENT,
    status                  TEXT NOT NULL,
    type                    TEXT NOT NULL,
    queue_name              TEXT NOT NULL,
    context                 TEXT NOT NULL DEFAULT '',
    serialized_task         BLOB NOT NULL,
    progress                INTEGER NOT NULL DEFAULT 0,
    last_execution_progress INTEGER NOT NULL DEFAULT 0,
    retries                 INTEGER NOT NULL DEFAULT 0,
    failure_description     TEXT NOT NULL DEFAULT '',
    create_time             INTEGER,
    queue_time              INTEGER,
    start_time              INTEGER,
    finish_time             INTEGER,
    fail_time               INTEGER,
    earliest_start_time     INTEGER,
    last_update_time        INTEGER
);
CREATE INDEX IF NOT EXISTS idx_queue_items_status ON queue_items(status);
CREATE INDEX IF NOT EXISTS idx_queue_items_queue_time ON queue_items(queue_time);
CREATE INDEX IF NOT EXISTS idx_queue_items_type ON queue_items(type);
";

/// Filters for the list endpoint.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItemQuery {
    #[serde(default)]
    pub status: Option<String>,

    #[serde(rename = "type", default)]
    pub task_type: Option<String>,

    #[serde(default)]
    pub queue: Option<String>,

    #[serde(default)]
    pub context: Option<String>,

    #[serde(default)]
    pub limit: Option<usize>,

    #[serde(default)]
    pub offset: Option<usize>,
}

/// Persistent storage for queue items, backed by SQLStore (SQLite).
pub struct QueueStore {
    db: Arc<dyn SQLStore>,
}

impl QueueStore {
    /// Create a new QueueStore and initialise the schema.
    pub fn new(db: Arc<dyn SQLStore>) -> Result<Self, QueueError> {
        db.exec_batch(SCHEMA)
            .map_err(|e| QueueError::StorageUnavailable(format!("queue schema init: {e}")))?;
        Ok(Self { db })
    }

    // -----------------------------------------------------------------------
    // CRUD
    // -----------------------------------------------------------------------

    /// Insert a new item and return the assigned id.
    pub fn insert(&self, item: &QueueItem) -> Result<i64, QueueError> {
        self.db
            .insert(
                "INSERT INTO queue_items (status, type, queue_name, context, serialized_task, \
                 progress, last_execution_progress, retries, failure_description, \
                 create_time, queue_time, start_time, finish_time, fail_time, \
                 earliest_start_time, last_update_time) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                &item_values(item),
            )
            .map_err(|e| QueueError::StorageUnavailable(e.to_string()))
    }

    /// Full-row update of an already-persisted item.
    pub fn update(&self, item: &QueueItem) -> Result<(), QueueError> {
        let id = persisted_id(item)?;
        let mut params = item_values(item);
        params.push(Value::Integer(id));

        let affected = self
            .db
            .exec(
                "UPDATE queue_items SET status = ?1, type = ?2, queue_name = ?3, context = ?4, \
                 serialized_task = ?5, progress = ?6, last_execution_progress = ?7, \
                 retries = ?8, failure_description = ?9, create_time = ?10, queue_time = ?11, \
                 start_time = ?12, finish_time = ?13, fail_time = ?14, \
                 earliest_start_time = ?15, last_update_time = ?16 \
                 WHERE id = ?17",
                &params,
            )
            .map_err(|e| QueueError::StorageUnavailable(e.to_string()))?;

        if affected == 0 {
            return Err(QueueError::NotFound(format!("queue item {id} not found")));
        }
        Ok(())
    }

    /// Compare-and-set update: writes the row only while its persisted
    /// status still equals `expected`. Returns `false` when a concurrent
    /// process changed the status first (no rows affected).
    pub fn update_guarded(
        &self,
        item: &QueueItem,
        expected: QueueItemStatus,
    ) -> Result<bool, QueueError> {
        let id = persisted_id(item)?;
        let mut params = item_values(item);
        params.push(Value::Integer(id));
        params.push(Value::Text(expected.as_str().to_string()));

        let affected = self
            .db
            .exec(
                "UPDATE queue_items SET status = ?1, type = ?2, queue_name = ?3, context = ?4, \
                 serialized_task = ?5, progress = ?6, last_execution_progress = ?7, \
                 retries = ?8, failure_description = ?9, create_time = ?10, queue_time = ?11, \
                 start_time = ?12, finish_time = ?13, fail_time = ?14, \
                 earliest_start_time = ?15, last_update_time = ?16 \
                 WHERE id = ?17 AND status = ?18",
                &params,
            )
            .map_err(|e| QueueError::StorageUnavailable(e.to_string()))?;

        Ok(affected > 0)
    }

    /// Get an item by id.
    pub fn get(&self, id: i64) -> Result<QueueItem, QueueError> {
        let rows = self
            .db
            .query(
                "SELECT * FROM queue_items WHERE id = ?1",
                &[Value::Integer(id)],
            )
            .map_err(|e| QueueError::StorageUnavailable(e.to_string()))?;

        let row = rows
            .first()
            .ok_or_else(|| QueueError::NotFound(format!("queue item {id} not found")))?;

        row_to_item(row)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// All items in a given status, oldest queue timestamp first.
    pub fn find_by_status(&self, status: QueueItemStatus) -> Result<Vec<QueueItem>, QueueError> {
        let rows = self
            .db
            .query(
                "SELECT * FROM queue_items WHERE status = ?1 ORDER BY queue_time ASC, id ASC",
                &[Value::Text(status.as_str().to_string())],
            )
            .map_err(|e| QueueError::StorageUnavailable(e.to_string()))?;

        rows.iter().map(row_to_item).collect()
    }

    /// Count items in a given status.
    pub fn count_by_status(&self, status: QueueItemStatus) -> Result<usize, QueueError> {
        let rows = self
            .db
            .query(
                "SELECT COUNT(*) AS cnt FROM queue_items WHERE status = ?1",
                &[Value::Text(status.as_str().to_string())],
            )
            .map_err(|e| QueueError::StorageUnavailable(e.to_string()))?;

        Ok(rows.first().and_then(|r| r.get_i64("cnt")).unwrap_or(0) as usize)
    }

    /// The globally-oldest QUEUED items by queue timestamp, across all
    /// queue names. Queue name is a label, not an ordering boundary.
    pub fn oldest_queued(&self, limit: usize) -> Result<Vec<QueueItem>, QueueError> {
        let rows = self
            .db
            .query(
                "SELECT * FROM queue_items WHERE status = ?1 \
                 ORDER BY queue_time ASC, id ASC LIMIT ?2",
                &[
                    Value::Text(QueueItemStatus::Queued.as_str().to_string()),
                    Value::Integer(limit as i64),
                ],
            )
            .map_err(|e| QueueError::StorageUnavailable(e.to_string()))?;

        rows.iter().map(row_to_item).collect()
    }

    /// Most recently queued item of a task type, optionally scoped to a
    /// context. Without a context the search is global across contexts.
    pub fn latest_by_type(
        &self,
        task_type: &str,
        context: Option<&str>,
    ) -> Result<Option<QueueItem>, QueueError> {
        let rows = match context {
            Some(ctx) => self.db.query(
                "SELECT * FROM queue_items WHERE type = ?1 AND context = ?2 \
                 ORDER BY queue_time DESC, id DESC LIMIT 1",
                &[
                    Value::Text(task_type.to_string()),
                    Value::Text(ctx.to_string()),
                ],
            ),
            None => self.db.query(
                "SELECT * FROM queue_items WHERE type = ?1 \
                 ORDER BY queue_time DESC, id DESC LIMIT 1",
                &[Value::Text(task_type.to_string())],
            ),
        }
        .map_err(|e| QueueError::StorageUnavailable(e.to_string()))?;

        rows.first().map(row_to_item).transpose()
    }

    /// List items with optional filters, newest first.
    pub fn list(&self, query: &QueueItemQuery) -> Result<ListResult<QueueItem>, QueueError> {
        let limit = query.limit.unwrap_or(50);
        let offset = query.offset.unwrap_or(0);

        let mut where_clauses: Vec<String> = Vec::new();
        let mut params: Vec<Value> = Vec::new();
        let mut idx = 1;

        if let Some(ref s) = query.status {
            where_clauses.push(format!("status = ?{idx}"));
            params.push(Value::Text(s.clone()));
            idx += 1;
        }
        if let Some(ref t) = query.task_type {
            where_clauses.push(format!("type = ?{idx}"));
            params.push(Value::Text(t.clone()));
            idx += 1;
        }
        if let Some(ref q) = query.queue {
            where_clauses.push(format!("queue_name = ?{idx}"));
            params.push(Value::Text(q.clone()));
            idx += 1;
        }
        if let Some(ref c) = query.context {
            where_clauses.push(format!("context = ?{idx}"));
            params.push(Value::Text(c.clone()));
            idx += 1;
        }

        let where_sql = if where_clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", where_clauses.join(" AND "))
        };

        // Count total
        let count_sql = format!("SELECT COUNT(*) AS cnt FROM queue_items {where_sql}");
        let count_rows = self
            .db
            .query(&count_sql, &params)
            .map_err(|e| QueueError::StorageUnavailable(e.to_string()))?;
        let total = count_rows
            .first()
            .and_then(|r| r.get_i64("cnt"))
            .unwrap_or(0) as usize;

        // Fetch page
        let select_sql = format!(
            "SELECT * FROM queue_items {where_sql} \
             ORDER BY queue_time DESC, id DESC LIMIT ?{idx} OFFSET ?{}",
            idx + 1
        );
        let mut select_params = params;
        select_params.push(Value::Integer(limit as i64));
        select_params.push(Value::Integer(offset as i64));

        let rows = self
            .db
            .query(&select_sql, &select_params)
            .map_err(|e| QueueError::StorageUnavailable(e.to_string()))?;

        let items = rows.iter().map(row_to_item).collect::<Result<Vec<_>, _>>()?;

        Ok(ListResult { items, total })
    }
}

fn persisted_id(item: &QueueItem) -> Result<i64, QueueError> {
    item.id
        .ok_or_else(|| QueueError::Internal("queue item was never persisted".into()))
}

/// Column values in schema order (without id).
fn item_values(item: &QueueItem) -> Vec<Value> {
    vec![
        Value::Text(item.status.as_str().to_string()),
        Value::Text(item.task_type.clone()),
        Value::Text(item.queue_name.clone()),
        Value::Text(item.context.clone()),
        Value::Blob(item.serialized_task.clone()),
        Value::Integer(item.progress_base_points as i64),
        Value::Integer(item.last_execution_progress_base_points as i64),
        Value::Integer(item.retries as i64),
        Value::Text(item.failure_description.clone()),
        Value::opt_integer(item.create_time),
        Value::opt_integer(item.queue_time),
        Value::opt_integer(item.start_time),
        Value::opt_integer(item.finish_time),
        Value::opt_integer(item.fail_time),
        Value::opt_integer(item.earliest_start_time),
        Value::opt_integer(item.last_update_time),
    ]
}

fn row_to_item(row: &Row) -> Result<QueueItem, QueueError> {
    let bad = |what: &str| QueueError::StorageUnavailable(format!("bad queue item row: {what}"));

    let status_str = row.get_str("status").ok_or_else(|| bad("status"))?;
    let status = QueueItemStatus::from_str(status_str)
        .ok_or_else(|| bad(&format!("unknown status {status_str}")))?;

    let progress = row
        .get_i64("progress")
        .and_then(|v| u16::try_from(v).ok())
        .ok_or_else(|| bad("progress"))?;
    let last_execution_progress = row
        .get_i64("last_execution_progress")
        .and_then(|v| u16::try_from(v).ok())
        .ok_or_else(|| bad("last_execution_progress"))?;
    let retries = row
        .get_i64("retries")
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| bad("retries"))?;

    Ok(QueueItem {
        id: Some(row.get_i64("id").ok_or_else(|| bad("id"))?),
        status,
        task_type: row.get_str("type").ok_or_else(|| bad("type"))?.to_string(),
        queue_name: row
            .get_str("queue_name")
            .ok_or_else(|| bad("queue_name"))?
            .to_string(),
        context: row.get_str("context").unwrap_or_default().to_string(),
        serialized_task: row
            .get_blob("serialized_task")
            .ok_or_else(|| bad("serialized_task"))?
            .to_vec(),
        progress_base_points: progress,
        last_execution_progress_base_points: last_execution_progress,
        retries,
        failure_description: row.get_str("failure_description").unwrap_or_default().to_string(),
        create_time: row.get_i64("create_time"),
        queue_time: row.get_i64("queue_time"),
        start_time: row.get_i64("start_time"),
        finish_time: row.get_i64("finish_time"),
        fail_time: row.get_i64("fail_time"),
        earliest_start_time: row.get_i64("earliest_start_time"),
        last_update_time: row.get_i64("last_update_time"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use shipsync_core::now_unix;
    use shipsync_sql::SqliteStore;

    fn test_store() -> QueueStore {
        let db = Arc::new(SqliteStore::open_in_memory().unwrap());
        QueueStore::new(db).unwrap()
    }

    fn queued_item(queue: &str, queue_time: i64) -> QueueItem {
        let mut item = QueueItem::new("test.echo", queue, "", vec![1]);
        item.status = QueueItemStatus::Queued;
        item.queue_time = Some(queue_time);
        item
    }

    #[test]
    fn insert_assigns_sequential_ids() {
        let store = test_store();
        let a = store.insert(&queued_item("q", 1)).unwrap();
        let b = store.insert(&queued_item("q", 2)).unwrap();
        assert!(b > a);
    }

    #[test]
    fn insert_and_get_roundtrip() {
        let store = test_store();
        let mut item = queued_item("default", 1_000);
        item.context = "shop-1".into();
        item.failure_description = "Attempt 1: boom".into();
        item.retries = 1;
        item.progress_base_points = 2500;
        item.last_execution_progress_base_points = 1000;
        item.last_update_time = Some(1_005);

        let id = store.insert(&item).unwrap();
        let got = store.get(id).unwrap();

        assert_eq!(got.id, Some(id));
        assert_eq!(got.status, QueueItemStatus::Queued);
        assert_eq!(got.task_type, "test.echo");
        assert_eq!(got.queue_name, "default");
        assert_eq!(got.context, "shop-1");
        assert_eq!(got.serialized_task, vec![1]);
        assert_eq!(got.progress_base_points, 2500);
        assert_eq!(got.last_execution_progress_base_points, 1000);
        assert_eq!(got.retries, 1);
        assert_eq!(got.failure_description, "Attempt 1: boom");
        assert_eq!(got.queue_time, Some(1_000));
        assert_eq!(got.last_update_time, Some(1_005));
        assert!(got.start_time.is_none());
    }

    #[test]
    fn get_missing_is_not_found() {
        let store = test_store();
        assert!(matches!(store.get(42), Err(QueueError::NotFound(_))));
    }

    #[test]
    fn update_writes_all_columns() {
        let store = test_store();
        let id = store.insert(&queued_item("q", 1)).unwrap();

        let mut item = store.get(id).unwrap();
        item.set_status(QueueItemStatus::InProgress).unwrap();
        item.start_time = Some(50);
        item.progress_base_points = 700;
        store.update(&item).unwrap();

        let got = store.get(id).unwrap();
        assert_eq!(got.status, QueueItemStatus::InProgress);
        assert_eq!(got.start_time, Some(50));
        assert_eq!(got.progress_base_points, 700);
    }

    #[test]
    fn update_unsaved_item_fails() {
        let store = test_store();
        let item = QueueItem::new("test.echo", "q", "", vec![]);
        assert!(store.update(&item).is_err());
    }

    #[test]
    fn guarded_update_is_a_cas() {
        let store = test_store();
        let id = store.insert(&queued_item("q", 1)).unwrap();

        let mut first = store.get(id).unwrap();
        first.set_status(QueueItemStatus::InProgress).unwrap();
        assert!(
            store
                .update_guarded(&first, QueueItemStatus::Queued)
                .unwrap()
        );

        // A racing claim sees 0 affected rows.
        let mut second = store.get(id).unwrap();
        second.status = QueueItemStatus::InProgress;
        assert!(
            !store
                .update_guarded(&second, QueueItemStatus::Queued)
                .unwrap()
        );
    }

    #[test]
    fn oldest_queued_is_global_fifo_across_queue_names() {
        let store = test_store();
        store.insert(&queued_item("queue-b", 300)).unwrap();
        let oldest = store.insert(&queued_item("queue-a", 100)).unwrap();
        let second = store.insert(&queued_item("queue-c", 200)).unwrap();
        store.insert(&queued_item("queue-a", 400)).unwrap();

        let items = store.oldest_queued(2).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].id, Some(oldest));
        assert_eq!(items[1].id, Some(second));
    }

    #[test]
    fn find_by_status_filters() {
        let store = test_store();
        let q = store.insert(&queued_item("q", 1)).unwrap();
        let mut running = queued_item("q", 2);
        running.status = QueueItemStatus::InProgress;
        let r = store.insert(&running).unwrap();

        let queued = store.find_by_status(QueueItemStatus::Queued).unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].id, Some(q));

        let in_progress = store.find_by_status(QueueItemStatus::InProgress).unwrap();
        assert_eq!(in_progress.len(), 1);
        assert_eq!(in_progress[0].id, Some(r));

        assert_eq!(store.count_by_status(QueueItemStatus::Queued).unwrap(), 1);
        assert_eq!(store.count_by_status(QueueItemStatus::Failed).unwrap(), 0);
    }

    #[test]
    fn running_items_across_queues() {
        // Two items enqueued three days ago into different queues, started
        // two days ago: both must show up as running.
        let store = test_store();
        let now = now_unix();
        let day = 86_400;

        for queue in ["queue1", "queue2"] {
            let mut item = queued_item(queue, now - 3 * day);
            item.status = QueueItemStatus::InProgress;
            item.start_time = Some(now - 2 * day);
            item.last_update_time = Some(now - 2 * day);
            store.insert(&item).unwrap();
        }

        let running = store.find_by_status(QueueItemStatus::InProgress).unwrap();
        assert_eq!(running.len(), 2);
        let queues: Vec<&str> = running.iter().map(|i| i.queue_name.as_str()).collect();
        assert!(queues.contains(&"queue1"));
        assert!(queues.contains(&"queue2"));
    }

    #[test]
    fn latest_by_type_scoping() {
        let store = test_store();

        let mut a = queued_item("q", 100);
        a.context = "shop-1".into();
        store.insert(&a).unwrap();

        let mut b = queued_item("q", 300);
        b.context = "shop-2".into();
        let b_id = store.insert(&b).unwrap();

        let mut c = queued_item("q", 200);
        c.context = "shop-1".into();
        let c_id = store.insert(&c).unwrap();

        // Global: newest by queue time regardless of context.
        let latest = store.latest_by_type("test.echo", None).unwrap().unwrap();
        assert_eq!(latest.id, Some(b_id));

        // Scoped: newest within the context.
        let latest = store
            .latest_by_type("test.echo", Some("shop-1"))
            .unwrap()
            .unwrap();
        assert_eq!(latest.id, Some(c_id));

        assert!(store.latest_by_type("other.type", None).unwrap().is_none());
    }

    #[test]
    fn list_filters_and_pages() {
        let store = test_store();
        for i in 0..5 {
            store.insert(&queued_item("q1", i)).unwrap();
        }
        let mut failed = queued_item("q2", 99);
        failed.status = QueueItemStatus::Failed;
        store.insert(&failed).unwrap();

        let all = store.list(&QueueItemQuery::default()).unwrap();
        assert_eq!(all.total, 6);

        let queued = store
            .list(&QueueItemQuery {
                status: Some("QUEUED".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(queued.total, 5);

        let page = store
            .list(&QueueItemQuery {
                status: Some("QUEUED".into()),
                limit: Some(2),
                offset: Some(4),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.items.len(), 1);

        let by_queue = store
            .list(&QueueItemQuery {
                queue: Some("q2".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_queue.total, 1);
        assert_eq!(by_queue.items[0].status, QueueItemStatus::Failed);
    }
}
