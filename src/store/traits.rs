//! `SequenceStore` trait — the persistence interface the scheduler needs.

use async_trait::async_trait;

use crate::error::DatabaseError;
use crate::sequence::{Precondition, Prospect, StatusRecord, StepKey, StepUpdate, UpdateOutcome};

/// Backend-agnostic store for prospects, their steps, and the status log.
#[async_trait]
pub trait SequenceStore: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    // ── Prospects ───────────────────────────────────────────────────

    /// Every prospect with its full sequence, ordered by prospect id.
    async fn fetch_all_prospects(&self) -> Result<Vec<Prospect>, DatabaseError>;

    /// Load a single prospect.
    async fn get_prospect(&self, id: &str) -> Result<Option<Prospect>, DatabaseError>;

    /// Insert a prospect and its steps.
    async fn insert_prospect(&self, prospect: &Prospect) -> Result<(), DatabaseError>;

    /// Ids of prospects whose recipient address matches (case-insensitive).
    async fn find_prospect_ids_by_email(&self, email: &str) -> Result<Vec<String>, DatabaseError>;

    // ── Steps ───────────────────────────────────────────────────────

    /// Apply field updates to one step in a single statement.
    ///
    /// `MessageId` and `OpenedAt` only fill empty fields; an already
    /// assigned message id is never overwritten.
    async fn update_step_fields(
        &self,
        prospect_id: &str,
        step_key: &StepKey,
        updates: &[StepUpdate],
        precondition: Option<Precondition>,
    ) -> Result<UpdateOutcome, DatabaseError>;

    // ── Status log ──────────────────────────────────────────────────

    /// Append a send attempt record.
    async fn append_status_record(&self, record: &StatusRecord) -> Result<(), DatabaseError>;

    /// Most recent status records first.
    async fn list_status_records(&self, limit: usize) -> Result<Vec<StatusRecord>, DatabaseError>;
}
