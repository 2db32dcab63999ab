//! libSQL backend — async `SequenceStore` implementation.
//!
//! Supports local file and in-memory databases. A single connection is
//! opened at startup and shared by the tick and the tracking endpoint.
//! Multi-statement transactions on a file database run on their own
//! connection so concurrent statements never join or roll back with them.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, Value, params};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::sequence::{
    Precondition, Prospect, StatusKind, StatusRecord, Step, StepKey, StepTime, StepUpdate,
    UpdateOutcome,
};
use crate::store::migrations;
use crate::store::traits::SequenceStore;

/// libSQL database backend.
///
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    /// An in-memory database only exists on the connection that created it.
    in_memory: bool,
}

/// How long a connection waits on a locked file database.
const BUSY_TIMEOUT_MS: u32 = 5_000;

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        set_busy_timeout(&conn).await?;

        let backend = Self {
            db: Arc::new(db),
            conn,
            in_memory: false,
        };
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
            in_memory: true,
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Connection to run a transaction on.
    async fn transaction_conn(&self) -> Result<Connection, DatabaseError> {
        if self.in_memory {
            return Ok(self.conn.clone());
        }
        let conn = self
            .db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        set_busy_timeout(&conn).await?;
        Ok(conn)
    }

    async fn load_steps(
        &self,
        prospect_id: Option<&str>,
    ) -> Result<HashMap<String, Vec<(StepKey, Step)>>, DatabaseError> {
        let conn = self.conn();
        let mut rows = match prospect_id {
            Some(id) => {
                conn.query(
                    &format!(
                        "SELECT {STEP_COLUMNS} FROM sequence_steps WHERE prospect_id = ?1 ORDER BY ordinal"
                    ),
                    params![id],
                )
                .await
            }
            None => {
                conn.query(
                    &format!(
                        "SELECT {STEP_COLUMNS} FROM sequence_steps ORDER BY prospect_id, ordinal"
                    ),
                    (),
                )
                .await
            }
        }
        .map_err(|e| DatabaseError::Query(format!("load_steps: {e}")))?;

        let mut steps: HashMap<String, Vec<(StepKey, Step)>> = HashMap::new();
        loop {
            let row = match rows.next().await {
                Ok(Some(row)) => row,
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("load_steps: {e}"))),
            };
            let prospect_id: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("load_steps row parse: {e}")))?;
            match row_to_step(&row) {
                Ok(Some(entry)) => steps.entry(prospect_id).or_default().push(entry),
                Ok(None) => {}
                Err(e) => warn!(prospect_id = %prospect_id, "Skipping step row: {e}"),
            }
        }
        Ok(steps)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> Value {
    match s {
        Some(s) => Value::Text(s.to_string()),
        None => Value::Null,
    }
}

/// Map a `id, email, my_email` row to a prospect with an empty sequence.
fn row_to_prospect(row: &libsql::Row) -> Result<Prospect, libsql::Error> {
    Ok(Prospect::new(
        row.get::<String>(0)?,
        row.get::<String>(1)?,
        row.get::<String>(2)?,
    ))
}

const STEP_COLUMNS: &str = "prospect_id, step_key, subject, body, day, hour, sent, message_id, sent_at, opened, opened_at";

/// Map a libsql Row to a (key, step) pair.
///
/// Column order matches STEP_COLUMNS. Rows whose key carries no valid
/// ordinal are skipped with a warning.
fn row_to_step(row: &libsql::Row) -> Result<Option<(StepKey, Step)>, libsql::Error> {
    let key_str: String = row.get(1)?;
    let key = match StepKey::parse(&key_str) {
        Ok(key) => key,
        Err(e) => {
            warn!("Skipping step with invalid key: {e}");
            return Ok(None);
        }
    };

    let sent_at_str: Option<String> = row.get(8).ok();
    let opened_at_str: Option<String> = row.get(10).ok();

    let step = Step {
        subject: row.get(2)?,
        body: row.get(3)?,
        time: StepTime {
            day: row.get(4).ok(),
            hour: row.get(5).ok(),
        },
        sent: row.get::<i64>(6)? != 0,
        message_id: row.get(7).ok(),
        sent_at: parse_optional_datetime(&sent_at_str),
        opened: row.get::<i64>(9)? != 0,
        opened_at: parse_optional_datetime(&opened_at_str),
    };
    Ok(Some((key, step)))
}

fn row_to_status_record(row: &libsql::Row) -> Result<StatusRecord, DatabaseError> {
    let timestamp: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("status row parse: {e}")))?;
    let kind: String = row
        .get(1)
        .map_err(|e| DatabaseError::Query(format!("status row parse: {e}")))?;

    Ok(StatusRecord {
        timestamp: parse_datetime(&timestamp),
        kind: kind.parse::<StatusKind>().map_err(DatabaseError::Query)?,
        email: row.get(2).ok(),
        step_key: row.get(3).ok(),
        error: row
            .get(4)
            .map_err(|e| DatabaseError::Query(format!("status row parse: {e}")))?,
    })
}

async fn set_busy_timeout(conn: &Connection) -> Result<(), DatabaseError> {
    conn.query(&format!("PRAGMA busy_timeout = {BUSY_TIMEOUT_MS}"), ())
        .await
        .map_err(|e| DatabaseError::Pool(format!("Failed to set busy timeout: {e}")))?;
    Ok(())
}

/// Translate typed step updates into SET clauses and positional values.
fn update_assignments(updates: &[StepUpdate]) -> (Vec<&'static str>, Vec<Value>) {
    let mut clauses = Vec::with_capacity(updates.len() + 1);
    let mut values = Vec::with_capacity(updates.len() + 2);

    for update in updates {
        match update {
            StepUpdate::Sent(sent) => {
                clauses.push("sent = ?");
                values.push(Value::Integer(i64::from(*sent)));
            }
            StepUpdate::MessageId(id) => {
                clauses.push("message_id = COALESCE(message_id, ?)");
                values.push(Value::Text(id.clone()));
            }
            StepUpdate::SentAt(at) => {
                clauses.push("sent_at = ?");
                values.push(Value::Text(at.to_rfc3339()));
            }
            StepUpdate::Opened(opened) => {
                clauses.push("opened = ?");
                values.push(Value::Integer(i64::from(*opened)));
            }
            StepUpdate::OpenedAt(at) => {
                clauses.push("opened_at = COALESCE(opened_at, ?)");
                values.push(Value::Text(at.to_rfc3339()));
            }
            StepUpdate::Reschedule(slot) => {
                clauses.push("day = ?");
                values.push(Value::Text(slot.day_name().to_string()));
                clauses.push("hour = ?");
                values.push(Value::Text(slot.hour_label()));
            }
        }
    }

    clauses.push("updated_at = ?");
    values.push(Value::Text(Utc::now().to_rfc3339()));
    (clauses, values)
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl SequenceStore for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Prospects ───────────────────────────────────────────────────

    async fn fetch_all_prospects(&self) -> Result<Vec<Prospect>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query("SELECT id, email, my_email FROM prospects ORDER BY id", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("fetch_all_prospects: {e}")))?;

        let mut prospects = Vec::new();
        loop {
            let row = match rows.next().await {
                Ok(Some(row)) => row,
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("fetch_all_prospects: {e}"))),
            };
            match row_to_prospect(&row) {
                Ok(prospect) => prospects.push(prospect),
                Err(e) => warn!("Skipping prospect row: {e}"),
            }
        }

        let mut steps = self.load_steps(None).await?;
        for prospect in &mut prospects {
            if let Some(entries) = steps.remove(&prospect.id) {
                prospect.sequence.extend(entries);
            }
        }

        debug!(count = prospects.len(), "Loaded prospects");
        Ok(prospects)
    }

    async fn get_prospect(&self, id: &str) -> Result<Option<Prospect>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                "SELECT id, email, my_email FROM prospects WHERE id = ?1",
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_prospect: {e}")))?;

        let row = match rows.next().await {
            Ok(Some(row)) => row,
            Ok(None) => return Ok(None),
            Err(e) => return Err(DatabaseError::Query(format!("get_prospect: {e}"))),
        };
        let mut prospect = row_to_prospect(&row)
            .map_err(|e| DatabaseError::Query(format!("get_prospect row parse: {e}")))?;

        if let Some(entries) = self.load_steps(Some(id)).await?.remove(id) {
            prospect.sequence.extend(entries);
        }
        Ok(Some(prospect))
    }

    async fn insert_prospect(&self, prospect: &Prospect) -> Result<(), DatabaseError> {
        let conn = self.transaction_conn().await?;
        let tx = conn
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_prospect begin: {e}")))?;

        tx.execute(
            "INSERT INTO prospects (id, email, my_email) VALUES (?1, ?2, ?3)",
            params![
                prospect.id.as_str(),
                prospect.email.as_str(),
                prospect.my_email.as_str()
            ],
        )
        .await
        .map_err(|e| DatabaseError::Constraint(format!("insert_prospect: {e}")))?;

        for (key, step) in &prospect.sequence {
            tx.execute(
                "INSERT INTO sequence_steps (prospect_id, ordinal, step_key, subject, body, day, hour,
                    sent, message_id, sent_at, opened, opened_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                vec![
                    Value::Text(prospect.id.clone()),
                    Value::Integer(i64::from(key.ordinal())),
                    Value::Text(key.as_str().to_string()),
                    Value::Text(step.subject.clone()),
                    Value::Text(step.body.clone()),
                    opt_text(step.time.day.as_deref()),
                    opt_text(step.time.hour.as_deref()),
                    Value::Integer(i64::from(step.sent)),
                    opt_text(step.message_id.as_deref()),
                    opt_text(step.sent_at.map(|t| t.to_rfc3339()).as_deref()),
                    Value::Integer(i64::from(step.opened)),
                    opt_text(step.opened_at.map(|t| t.to_rfc3339()).as_deref()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Constraint(format!("insert_prospect step {key}: {e}")))?;
        }

        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_prospect commit: {e}")))?;

        debug!(prospect_id = %prospect.id, steps = prospect.sequence.len(), "Prospect inserted into DB");
        Ok(())
    }

    async fn find_prospect_ids_by_email(&self, email: &str) -> Result<Vec<String>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                "SELECT id FROM prospects WHERE lower(email) = lower(?1) ORDER BY id",
                params![email],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_prospect_ids_by_email: {e}")))?;

        let mut ids = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row.get::<String>(0) {
                Ok(id) => ids.push(id),
                Err(e) => warn!("Skipping prospect id row: {e}"),
            }
        }
        Ok(ids)
    }

    // ── Steps ───────────────────────────────────────────────────────

    async fn update_step_fields(
        &self,
        prospect_id: &str,
        step_key: &StepKey,
        updates: &[StepUpdate],
        precondition: Option<Precondition>,
    ) -> Result<UpdateOutcome, DatabaseError> {
        if updates.is_empty() {
            return Err(DatabaseError::Query(
                "update_step_fields: no fields to update".into(),
            ));
        }

        let (clauses, mut values) = update_assignments(updates);
        let guard = match precondition {
            Some(Precondition::Unsent) => " AND sent = 0",
            Some(Precondition::Sent) => " AND sent = 1",
            None => "",
        };
        let sql = format!(
            "UPDATE sequence_steps SET {} WHERE prospect_id = ? AND ordinal = ?{guard}",
            clauses.join(", ")
        );
        values.push(Value::Text(prospect_id.to_string()));
        values.push(Value::Integer(i64::from(step_key.ordinal())));

        let conn = self.conn();
        let count = conn
            .execute(&sql, values)
            .await
            .map_err(|e| DatabaseError::Query(format!("update_step_fields: {e}")))?;

        if count > 0 {
            debug!(prospect_id, step = %step_key, ?updates, "Step updated in DB");
            return Ok(UpdateOutcome::Applied);
        }

        // Nothing matched: tell a missing step apart from a failed guard.
        let mut rows = conn
            .query(
                "SELECT 1 FROM sequence_steps WHERE prospect_id = ?1 AND ordinal = ?2",
                params![prospect_id, i64::from(step_key.ordinal())],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_step_fields lookup: {e}")))?;

        match rows.next().await {
            Ok(Some(_)) => Ok(UpdateOutcome::PreconditionFailed),
            Ok(None) => Ok(UpdateOutcome::NotFound),
            Err(e) => Err(DatabaseError::Query(format!("update_step_fields lookup: {e}"))),
        }
    }

    // ── Status log ──────────────────────────────────────────────────

    async fn append_status_record(&self, record: &StatusRecord) -> Result<(), DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO status_log (id, timestamp, kind, email, step_key, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            vec![
                Value::Text(Uuid::new_v4().to_string()),
                Value::Text(record.timestamp.to_rfc3339()),
                Value::Text(record.kind.as_str().to_string()),
                opt_text(record.email.as_deref()),
                opt_text(record.step_key.as_deref()),
                Value::Text(record.error.clone()),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("append_status_record: {e}")))?;

        debug!(kind = record.kind.as_str(), "Status record appended");
        Ok(())
    }

    async fn list_status_records(&self, limit: usize) -> Result<Vec<StatusRecord>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                "SELECT timestamp, kind, email, step_key, error FROM status_log
                 ORDER BY timestamp DESC, rowid DESC LIMIT ?1",
                params![limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_status_records: {e}")))?;

        let mut records = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_status_record(&row) {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping status row: {e}"),
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Weekday;

    use super::*;
    use crate::sequence::TimeSlot;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn key(raw: &str) -> StepKey {
        StepKey::parse(raw).unwrap()
    }

    fn prospect(id: &str) -> Prospect {
        let slot = TimeSlot::new(Weekday::Mon, 9);
        Prospect::new(id, format!("{id}@lead.com"), "me@sender.com")
            .with_step(key("email_1"), Step::new("Hello", "<p>one</p>", slot))
            .with_step(key("email_2"), Step::new("Hello", "<p>two</p>", slot.next()))
            .with_step(key("email_10"), Step::new("Hello", "<p>ten</p>", slot.next().next()))
    }

    #[tokio::test]
    async fn insert_and_fetch_roundtrip() {
        let db = test_db().await;
        db.insert_prospect(&prospect("p1")).await.unwrap();

        let all = db.fetch_all_prospects().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0], prospect("p1"));

        let ordinals: Vec<u32> = all[0].sequence.keys().map(StepKey::ordinal).collect();
        assert_eq!(ordinals, vec![1, 2, 10]);
    }

    #[tokio::test]
    async fn fetch_orders_by_prospect_id() {
        let db = test_db().await;
        db.insert_prospect(&prospect("p2")).await.unwrap();
        db.insert_prospect(&prospect("p1")).await.unwrap();

        let ids: Vec<String> = db
            .fetch_all_prospects()
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(ids, vec!["p1", "p2"]);
    }

    #[tokio::test]
    async fn get_prospect_not_found() {
        let db = test_db().await;
        assert!(db.get_prospect("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn malformed_schedule_survives_roundtrip() {
        let db = test_db().await;
        let p = Prospect::new("p1", "a@lead.com", "me@sender.com").with_step(
            key("email_1"),
            Step::with_time(
                "s",
                "b",
                StepTime {
                    day: None,
                    hour: Some("09:00".into()),
                },
            ),
        );
        db.insert_prospect(&p).await.unwrap();

        let loaded = db.get_prospect("p1").await.unwrap().unwrap();
        assert_eq!(loaded.sequence[&key("email_1")].time.day, None);
    }

    #[tokio::test]
    async fn duplicate_prospect_is_rejected() {
        let db = test_db().await;
        db.insert_prospect(&prospect("p1")).await.unwrap();
        let err = db.insert_prospect(&prospect("p1")).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Constraint(_)));
    }

    #[tokio::test]
    async fn mark_sent_with_unsent_precondition() {
        let db = test_db().await;
        db.insert_prospect(&prospect("p1")).await.unwrap();
        let now = Utc::now();

        let updates = [
            StepUpdate::Sent(true),
            StepUpdate::MessageId("<m1@sender.com>".into()),
            StepUpdate::SentAt(now),
        ];
        let first = db
            .update_step_fields("p1", &key("email_1"), &updates, Some(Precondition::Unsent))
            .await
            .unwrap();
        assert_eq!(first, UpdateOutcome::Applied);

        let second = db
            .update_step_fields(
                "p1",
                &key("email_1"),
                &[StepUpdate::Sent(true), StepUpdate::MessageId("<m2@sender.com>".into())],
                Some(Precondition::Unsent),
            )
            .await
            .unwrap();
        assert_eq!(second, UpdateOutcome::PreconditionFailed);

        let step = db.get_prospect("p1").await.unwrap().unwrap().sequence[&key("email_1")].clone();
        assert!(step.sent);
        assert_eq!(step.message_id.as_deref(), Some("<m1@sender.com>"));
        assert_eq!(step.sent_at.unwrap().timestamp(), now.timestamp());
    }

    #[tokio::test]
    async fn message_id_is_never_overwritten() {
        let db = test_db().await;
        db.insert_prospect(&prospect("p1")).await.unwrap();

        for id in ["<first@x>", "<second@x>"] {
            db.update_step_fields("p1", &key("email_1"), &[StepUpdate::MessageId(id.into())], None)
                .await
                .unwrap();
        }

        let step = db.get_prospect("p1").await.unwrap().unwrap().sequence[&key("email_1")].clone();
        assert_eq!(step.message_id.as_deref(), Some("<first@x>"));
    }

    #[tokio::test]
    async fn update_missing_step_reports_not_found() {
        let db = test_db().await;
        db.insert_prospect(&prospect("p1")).await.unwrap();

        let outcome = db
            .update_step_fields("p1", &key("email_7"), &[StepUpdate::Opened(true)], None)
            .await
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::NotFound);

        let outcome = db
            .update_step_fields("ghost", &key("email_1"), &[StepUpdate::Opened(true)], None)
            .await
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::NotFound);
    }

    #[tokio::test]
    async fn empty_update_is_rejected() {
        let db = test_db().await;
        assert!(db.update_step_fields("p1", &key("email_1"), &[], None).await.is_err());
    }

    #[tokio::test]
    async fn reschedule_writes_stored_format() {
        let db = test_db().await;
        db.insert_prospect(&prospect("p1")).await.unwrap();

        let to = TimeSlot::new(Weekday::Tue, 0);
        db.update_step_fields(
            "p1",
            &key("email_1"),
            &[StepUpdate::Reschedule(to)],
            Some(Precondition::Unsent),
        )
        .await
        .unwrap();

        let step = db.get_prospect("p1").await.unwrap().unwrap().sequence[&key("email_1")].clone();
        assert_eq!(step.time.day.as_deref(), Some("Tuesday"));
        assert_eq!(step.time.hour.as_deref(), Some("00:00"));
        assert_eq!(step.schedule().unwrap(), to);
    }

    #[tokio::test]
    async fn open_requires_sent_step() {
        let db = test_db().await;
        db.insert_prospect(&prospect("p1")).await.unwrap();

        let outcome = db
            .update_step_fields(
                "p1",
                &key("email_1"),
                &[StepUpdate::Opened(true)],
                Some(Precondition::Sent),
            )
            .await
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::PreconditionFailed);
        let step = db.get_prospect("p1").await.unwrap().unwrap().sequence[&key("email_1")].clone();
        assert!(!step.opened);
    }

    #[tokio::test]
    async fn find_prospects_by_email_is_case_insensitive() {
        let db = test_db().await;
        db.insert_prospect(&prospect("p1")).await.unwrap();
        db.insert_prospect(&prospect("p2")).await.unwrap();

        assert_eq!(
            db.find_prospect_ids_by_email("P1@Lead.com").await.unwrap(),
            vec!["p1".to_string()]
        );
        assert!(db.find_prospect_ids_by_email("none@x.com").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn status_log_append_and_list() {
        let db = test_db().await;
        db.append_status_record(
            &StatusRecord::new(StatusKind::SendError, "smtp down").for_step("a@lead.com", &key("email_2")),
        )
        .await
        .unwrap();
        db.append_status_record(&StatusRecord::new(StatusKind::CronError, "db unreachable"))
            .await
            .unwrap();

        let records = db.list_status_records(10).await.unwrap();
        assert_eq!(records.len(), 2);
        let send = records.iter().find(|r| r.kind == StatusKind::SendError).unwrap();
        assert_eq!(send.email.as_deref(), Some("a@lead.com"));
        assert_eq!(send.step_key.as_deref(), Some("email_2"));
        let cron = records.iter().find(|r| r.kind == StatusKind::CronError).unwrap();
        assert!(cron.email.is_none());

        assert_eq!(db.list_status_records(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn open_local_creates_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let db_path = tmp.path().join("nested").join("sequences.db");
        let db = LibSqlBackend::new_local(&db_path).await.unwrap();
        db.insert_prospect(&prospect("p1")).await.unwrap();
        assert!(db_path.exists());
    }

    #[tokio::test]
    async fn file_insert_transaction_is_isolated_from_shared_writes() {
        let tmp = tempfile::tempdir().unwrap();
        let db = Arc::new(
            LibSqlBackend::new_local(&tmp.path().join("sequences.db"))
                .await
                .unwrap(),
        );
        db.insert_prospect(&prospect("p1")).await.unwrap();

        let sent = [StepUpdate::Sent(true), StepUpdate::MessageId("<a@b>".into())];
        let (p2, email_1, p1) = (prospect("p2"), key("email_1"), prospect("p1"));
        let (inserted, updated, duplicate) = tokio::join!(
            db.insert_prospect(&p2),
            db.update_step_fields("p1", &email_1, &sent, Some(Precondition::Unsent)),
            db.insert_prospect(&p1),
        );
        inserted.unwrap();
        assert_eq!(updated.unwrap(), UpdateOutcome::Applied);
        assert!(matches!(duplicate, Err(DatabaseError::Constraint(_))));

        let all = db.fetch_all_prospects().await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all[0].sequence[&key("email_1")].sent);
        assert_eq!(all[1].sequence.len(), 3);
    }
}
