//! Open tracking — the pixel endpoint and the recorder behind it.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Query, State, rejection::QueryRejection},
    http::header,
    response::IntoResponse,
    routing::get,
};
use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::sequence::{Precondition, StepKey, StepUpdate, UpdateOutcome};
use crate::store::SequenceStore;

/// 1x1 transparent PNG served for every pixel request.
pub const PIXEL_PNG: &[u8] = &[
    0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a, 0x00, 0x00, 0x00, 0x0d,
    0x49, 0x48, 0x44, 0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01,
    0x08, 0x04, 0x00, 0x00, 0x00, 0xb5, 0x1c, 0x0c, 0x02, 0x00, 0x00, 0x00,
    0x0b, 0x49, 0x44, 0x41, 0x54, 0x78, 0xda, 0x63, 0x64, 0x60, 0x00, 0x00,
    0x00, 0x06, 0x00, 0x02, 0x30, 0x81, 0xd0, 0x2f, 0x00, 0x00, 0x00, 0x00,
    0x49, 0x45, 0x4e, 0x44, 0xae, 0x42, 0x60, 0x82,
];

/// What happened to an open notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOutcome {
    /// At least one matching sent step is now marked opened.
    Recorded,
    /// The step exists but has not been sent.
    NotSent,
    /// No prospect/step matches the correlation.
    Unknown,
    /// The step key could not be parsed.
    Invalid,
    /// The store failed; details are in the log.
    Failed,
}

/// Marks steps opened. Never returns an error to the caller.
pub struct OpenTracker {
    store: Arc<dyn SequenceStore>,
}

impl OpenTracker {
    pub fn new(store: Arc<dyn SequenceStore>) -> Self {
        Self { store }
    }

    /// Record that `email` opened step `step_key`. A `prospect_id` only
    /// matches when that prospect's recipient is `email`; when it is
    /// missing, every prospect with that recipient address is tried.
    pub async fn record_open(
        &self,
        email: &str,
        step_key: &str,
        prospect_id: Option<&str>,
    ) -> OpenOutcome {
        let key = match StepKey::parse(step_key) {
            Ok(key) => key,
            Err(e) => {
                debug!(email, "Ignoring open: {e}");
                return OpenOutcome::Invalid;
            }
        };

        let mut ids = match self.store.find_prospect_ids_by_email(email).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(email, step = %key, "Failed to resolve prospect for open: {e}");
                return OpenOutcome::Failed;
            }
        };
        if let Some(id) = prospect_id {
            ids.retain(|candidate| candidate == id);
        }

        let updates = [StepUpdate::Opened(true), StepUpdate::OpenedAt(Utc::now())];
        let mut outcome = OpenOutcome::Unknown;

        for id in &ids {
            match self
                .store
                .update_step_fields(id, &key, &updates, Some(Precondition::Sent))
                .await
            {
                Ok(UpdateOutcome::Applied) => outcome = OpenOutcome::Recorded,
                Ok(UpdateOutcome::PreconditionFailed) => {
                    if outcome == OpenOutcome::Unknown {
                        outcome = OpenOutcome::NotSent;
                    }
                }
                Ok(UpdateOutcome::NotFound) => {}
                Err(e) => {
                    warn!(email, prospect = %id, step = %key, "Failed to record open: {e}");
                    if outcome != OpenOutcome::Recorded {
                        outcome = OpenOutcome::Failed;
                    }
                }
            }
        }

        match outcome {
            OpenOutcome::Recorded => info!(email, step = %key, "Email opened"),
            OpenOutcome::NotSent => debug!(email, step = %key, "Open for unsent step ignored"),
            OpenOutcome::Unknown => debug!(email, step = %key, "Open for unknown step ignored"),
            OpenOutcome::Invalid | OpenOutcome::Failed => {}
        }
        outcome
    }
}

/// Shared state for tracking handlers.
#[derive(Clone)]
pub struct TrackingState {
    pub tracker: Arc<OpenTracker>,
}

/// Build the router serving the tracking pixel and a health check.
pub fn tracking_routes(tracker: Arc<OpenTracker>) -> Router {
    Router::new()
        .route("/track", get(track))
        .route("/health", get(health))
        .with_state(TrackingState { tracker })
}

#[derive(Debug, Deserialize)]
struct TrackParams {
    email: Option<String>,
    #[serde(rename = "emailKey")]
    email_key: Option<String>,
    id: Option<String>,
}

async fn track(
    State(state): State<TrackingState>,
    params: Result<Query<TrackParams>, QueryRejection>,
) -> impl IntoResponse {
    match params {
        Ok(Query(TrackParams {
            email: Some(email),
            email_key: Some(email_key),
            id,
        })) => {
            state
                .tracker
                .record_open(&email, &email_key, id.as_deref())
                .await;
        }
        Ok(_) => debug!("Tracking request missing email or emailKey"),
        Err(e) => debug!("Unreadable tracking query: {e}"),
    }

    (
        [
            (header::CONTENT_TYPE, "image/png"),
            (header::CACHE_CONTROL, "no-store, no-cache, must-revalidate"),
        ],
        PIXEL_PNG,
    )
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

#[cfg(test)]
mod tests {
    use chrono::Weekday;

    use super::*;
    use crate::sequence::{Prospect, Step, TimeSlot};
    use crate::store::LibSqlBackend;

    fn key(raw: &str) -> StepKey {
        StepKey::parse(raw).unwrap()
    }

    async fn tracker_with(prospects: &[Prospect]) -> (OpenTracker, Arc<LibSqlBackend>) {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        for prospect in prospects {
            store.insert_prospect(prospect).await.unwrap();
        }
        (OpenTracker::new(store.clone()), store)
    }

    fn sent_prospect(id: &str, email: &str) -> Prospect {
        let slot = TimeSlot::new(Weekday::Mon, 9);
        let mut step = Step::new("Hello", "Body", slot);
        step.sent = true;
        step.message_id = Some(format!("<{id}@y.com>"));
        step.sent_at = Some(Utc::now());
        Prospect::new(id, email, "me@y.com")
            .with_step(key("email_1"), step)
            .with_step(key("email_2"), Step::new("Again", "Body", slot))
    }

    #[test]
    fn pixel_is_a_68_byte_png() {
        assert_eq!(PIXEL_PNG.len(), 68);
        assert_eq!(&PIXEL_PNG[1..4], b"PNG");
    }

    #[tokio::test]
    async fn open_by_id_marks_sent_step() {
        let (tracker, store) = tracker_with(&[sent_prospect("p1", "lead@x.com")]).await;

        let outcome = tracker.record_open("lead@x.com", "email_1", Some("p1")).await;
        assert_eq!(outcome, OpenOutcome::Recorded);

        let prospect = store.get_prospect("p1").await.unwrap().unwrap();
        let step = &prospect.sequence[&key("email_1")];
        assert!(step.opened);
        assert!(step.opened_at.is_some());
    }

    #[tokio::test]
    async fn open_without_id_resolves_by_email() {
        let (tracker, store) = tracker_with(&[
            sent_prospect("p1", "lead@x.com"),
            sent_prospect("p2", "other@x.com"),
        ])
        .await;

        let outcome = tracker.record_open("LEAD@x.com", "email_1", None).await;
        assert_eq!(outcome, OpenOutcome::Recorded);

        let p1 = store.get_prospect("p1").await.unwrap().unwrap();
        let p2 = store.get_prospect("p2").await.unwrap().unwrap();
        assert!(p1.sequence[&key("email_1")].opened);
        assert!(!p2.sequence[&key("email_1")].opened);
    }

    #[tokio::test]
    async fn repeated_open_keeps_first_timestamp() {
        let (tracker, store) = tracker_with(&[sent_prospect("p1", "lead@x.com")]).await;

        tracker.record_open("lead@x.com", "email_1", Some("p1")).await;
        let first = store.get_prospect("p1").await.unwrap().unwrap().sequence[&key("email_1")]
            .opened_at;

        let outcome = tracker.record_open("lead@x.com", "email_1", Some("p1")).await;
        assert_eq!(outcome, OpenOutcome::Recorded);
        let second = store.get_prospect("p1").await.unwrap().unwrap().sequence[&key("email_1")]
            .opened_at;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn unsent_step_is_not_opened() {
        let (tracker, store) = tracker_with(&[sent_prospect("p1", "lead@x.com")]).await;

        let outcome = tracker.record_open("lead@x.com", "email_2", Some("p1")).await;
        assert_eq!(outcome, OpenOutcome::NotSent);

        let prospect = store.get_prospect("p1").await.unwrap().unwrap();
        assert!(!prospect.sequence[&key("email_2")].opened);
    }

    #[tokio::test]
    async fn id_with_another_recipient_is_not_recorded() {
        let (tracker, store) = tracker_with(&[sent_prospect("p1", "lead@x.com")]).await;

        let outcome = tracker
            .record_open("someone-else@z.com", "email_1", Some("p1"))
            .await;
        assert_eq!(outcome, OpenOutcome::Unknown);

        let prospect = store.get_prospect("p1").await.unwrap().unwrap();
        assert!(!prospect.sequence[&key("email_1")].opened);
    }

    #[tokio::test]
    async fn unknown_and_invalid_correlations_are_ignored() {
        let (tracker, _store) = tracker_with(&[sent_prospect("p1", "lead@x.com")]).await;

        assert_eq!(
            tracker.record_open("lead@x.com", "email_9", Some("p1")).await,
            OpenOutcome::Unknown
        );
        assert_eq!(
            tracker.record_open("nobody@x.com", "email_1", None).await,
            OpenOutcome::Unknown
        );
        assert_eq!(
            tracker.record_open("lead@x.com", "intro", Some("p1")).await,
            OpenOutcome::Invalid
        );
    }
}
