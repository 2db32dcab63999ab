//! Tick orchestration — one scheduling/send cycle, and the timer driving it.
//!
//! A tick loads every prospect, evaluates each sequence for the current
//! slot, runs admission control per sender identity, then drives one task
//! per identity that defers overflow and sends its plan sequentially with
//! the configured spacing. Identities run concurrently.
//!
//! Per step the stored state moves Pending -> Sent on a successful send
//! and persistence write (guarded by `sent = 0`). Transport or write
//! failures leave the step Pending and append a status record; they never
//! abort siblings. Only failing to load prospects ends a tick early.
//!
//! Delivery is at-least-once: if the process dies after the transport
//! accepted a message but before the write lands, the step is still
//! unsent and will be delivered again the next time its slot comes round.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, Utc};
use reqwest::Url;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::error::{DatabaseError, TickError};
use crate::sequence::admission::{self, AdmissionPolicy, PlannedSend, SendCandidate, SendPlan};
use crate::sequence::composer::{self, ComposeRequest, ThreadContext, TrackingCorrelation};
use crate::sequence::eligibility::{self, Blocked};
use crate::sequence::{
    Precondition, Prospect, StatusKind, StatusRecord, StepUpdate, TimeSlot, UpdateOutcome,
};
use crate::store::SequenceStore;
use crate::transport::{Mailer, OutgoingEmail};

/// Settings the orchestrator needs at runtime.
#[derive(Debug, Clone)]
pub struct TickConfig {
    pub policy: AdmissionPolicy,
    pub public_base_url: Url,
}

/// How a tick ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Completed,
    /// Another tick was still running.
    Skipped,
    /// The tick could not load its input.
    Aborted(String),
}

/// Summary of one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub slot: TimeSlot,
    pub outcome: TickOutcome,
    pub sent: usize,
    pub failed: usize,
    /// Sent by the transport but already recorded as sent by someone else.
    pub conflicts: usize,
    pub deferred: usize,
    /// Over-cap steps whose reschedule could not be written.
    pub deferral_failures: usize,
    pub blocked: usize,
    pub malformed: usize,
}

impl TickReport {
    fn new(slot: TimeSlot, outcome: TickOutcome) -> Self {
        Self {
            slot,
            outcome,
            sent: 0,
            failed: 0,
            conflicts: 0,
            deferred: 0,
            deferral_failures: 0,
            blocked: 0,
            malformed: 0,
        }
    }

    fn absorb(&mut self, identity: IdentityReport) {
        self.sent += identity.sent;
        self.failed += identity.failed;
        self.conflicts += identity.conflicts;
        self.deferred += identity.deferred;
        self.deferral_failures += identity.deferral_failures;
    }
}

/// Counters from one identity's task.
#[derive(Debug, Default)]
struct IdentityReport {
    sent: usize,
    failed: usize,
    conflicts: usize,
    deferred: usize,
    deferral_failures: usize,
}

/// Drives scheduling ticks against injected store and transport.
pub struct TickOrchestrator {
    store: Arc<dyn SequenceStore>,
    mailer: Arc<dyn Mailer>,
    config: TickConfig,
    in_progress: Mutex<()>,
}

impl TickOrchestrator {
    pub fn new(store: Arc<dyn SequenceStore>, mailer: Arc<dyn Mailer>, config: TickConfig) -> Self {
        Self {
            store,
            mailer,
            config,
            in_progress: Mutex::new(()),
        }
    }

    /// Run one tick for `slot`. Never panics or returns an error: problems
    /// are logged, recorded in the status log, and summarised in the report.
    pub async fn run_tick(&self, slot: TimeSlot) -> TickReport {
        let Ok(_guard) = self.in_progress.try_lock() else {
            tracing::warn!(%slot, "Previous tick still running, skipping");
            return TickReport::new(slot, TickOutcome::Skipped);
        };

        tracing::info!(%slot, "Tick started");
        let report = match self.try_run_tick(slot).await {
            Ok(report) => report,
            Err(e) => {
                tracing::error!(%slot, "Tick aborted: {e}");
                record_status(
                    self.store.as_ref(),
                    StatusRecord::new(StatusKind::CronError, e.to_string()),
                )
                .await;
                TickReport::new(slot, TickOutcome::Aborted(e.to_string()))
            }
        };

        tracing::info!(
            %slot,
            sent = report.sent,
            failed = report.failed,
            conflicts = report.conflicts,
            deferred = report.deferred,
            deferral_failures = report.deferral_failures,
            blocked = report.blocked,
            malformed = report.malformed,
            "Tick finished"
        );
        report
    }

    async fn try_run_tick(&self, slot: TimeSlot) -> Result<TickReport, TickError> {
        let prospects = self.store.fetch_all_prospects().await?;
        let mut report = TickReport::new(slot, TickOutcome::Completed);
        let mut tasks = Vec::new();

        for (identity, group) in admission::group_by_identity(&prospects) {
            let mut candidates = Vec::new();

            for prospect in &group {
                if prospect.is_complete() {
                    continue;
                }
                let evaluation = eligibility::evaluate(&prospect.sequence, slot);

                for (key, error) in &evaluation.malformed {
                    tracing::warn!(
                        prospect = %prospect.email,
                        step = %key,
                        "Invalid time data: {error}"
                    );
                }
                for (key, reason) in &evaluation.blocked {
                    match reason {
                        Blocked::PredecessorUnsent(prev) => tracing::info!(
                            prospect = %prospect.email,
                            "Skipping {key} because {prev} has not been sent"
                        ),
                        Blocked::PredecessorMissing => tracing::warn!(
                            prospect = %prospect.email,
                            "Skipping {key}: no preceding step exists"
                        ),
                    }
                }
                report.malformed += evaluation.malformed.len();
                report.blocked += evaluation.blocked.len();

                candidates.extend(evaluation.eligible.into_iter().map(|step_key| SendCandidate {
                    prospect_id: prospect.id.clone(),
                    recipient: prospect.email.clone(),
                    step_key,
                }));
            }

            let plan = admission::plan(&identity, candidates, slot, self.config.policy);
            if plan.sends.is_empty() && plan.deferred.is_empty() {
                continue;
            }

            tracing::info!(
                %identity,
                planned = plan.sends.len(),
                deferred = plan.deferred.len(),
                spread_secs = plan.total_delay().as_secs(),
                "Admission plan ready"
            );

            let snapshot: HashMap<String, Prospect> = group
                .iter()
                .map(|p| (p.id.clone(), (*p).clone()))
                .collect();
            let sender = IdentitySender {
                store: Arc::clone(&self.store),
                mailer: Arc::clone(&self.mailer),
                base_url: self.config.public_base_url.clone(),
                prospects: snapshot,
            };
            tasks.push((identity, tokio::spawn(sender.run(plan))));
        }

        for (identity, task) in tasks {
            match task.await {
                Ok(identity_report) => report.absorb(identity_report),
                Err(e) => {
                    let err = TickError::SenderTaskPanicked {
                        identity,
                        reason: e.to_string(),
                    };
                    tracing::error!("{err}");
                    record_status(
                        self.store.as_ref(),
                        StatusRecord::new(StatusKind::CronError, err.to_string()),
                    )
                    .await;
                }
            }
        }

        Ok(report)
    }
}

/// Everything one identity's task owns.
struct IdentitySender {
    store: Arc<dyn SequenceStore>,
    mailer: Arc<dyn Mailer>,
    base_url: Url,
    prospects: HashMap<String, Prospect>,
}

impl IdentitySender {
    async fn run(self, plan: SendPlan) -> IdentityReport {
        let mut report = IdentityReport::default();

        for deferral in &plan.deferred {
            let candidate = &deferral.candidate;
            let result = self
                .store
                .update_step_fields(
                    &candidate.prospect_id,
                    &candidate.step_key,
                    &[StepUpdate::Reschedule(deferral.to)],
                    Some(Precondition::Unsent),
                )
                .await;

            match result {
                Ok(UpdateOutcome::Applied) => {
                    report.deferred += 1;
                    tracing::info!(
                        identity = %plan.identity,
                        prospect = %candidate.recipient,
                        step = %candidate.step_key,
                        to = %deferral.to,
                        "Hourly cap reached, step deferred"
                    );
                }
                Ok(outcome) => tracing::warn!(
                    prospect = %candidate.recipient,
                    step = %candidate.step_key,
                    ?outcome,
                    "Deferral not applied"
                ),
                Err(e) => {
                    tracing::error!(
                        prospect = %candidate.recipient,
                        step = %candidate.step_key,
                        "Failed to defer: {e}"
                    );
                    self.record_failure(StatusKind::DbUpdateError, candidate, e.to_string()).await;
                    report.deferral_failures += 1;
                }
            }
        }

        for planned in &plan.sends {
            if !planned.delay.is_zero() {
                tokio::time::sleep(planned.delay).await;
            }
            self.send_one(&plan.identity, planned, &mut report).await;
        }

        report
    }

    async fn send_one(&self, identity: &str, planned: &PlannedSend, report: &mut IdentityReport) {
        let candidate = &planned.candidate;
        let Some(prospect) = self.prospects.get(&candidate.prospect_id) else {
            return;
        };
        let Some(step) = prospect.sequence.get(&candidate.step_key) else {
            return;
        };

        let thread = if candidate.step_key.is_root() {
            None
        } else {
            thread_context(prospect)
        };
        if !candidate.step_key.is_root() && thread.is_none() {
            tracing::warn!(
                prospect = %prospect.email,
                step = %candidate.step_key,
                "First step has no message id, sending unthreaded"
            );
        }

        let tracking = TrackingCorrelation {
            recipient: prospect.email.clone(),
            step_key: candidate.step_key.clone(),
            prospect_id: prospect.id.clone(),
        };
        let sender_display = self
            .mailer
            .display_name(identity)
            .unwrap_or_else(|| identity.to_string());
        let composed = composer::compose(&ComposeRequest {
            subject: &step.subject,
            body: &step.body,
            thread: thread.as_ref(),
            sender_display: &sender_display,
            tracking: &tracking,
            tracking_base: &self.base_url,
            now: Utc::now(),
        });

        tracing::info!(prospect = %prospect.email, step = %candidate.step_key, "Sending");
        let email = OutgoingEmail {
            recipient: prospect.email.clone(),
            subject: composed.subject,
            html_body: composed.html_body,
            headers: composed.headers,
        };

        let message_id = match self.mailer.send(identity, email).await {
            Ok(id) => id,
            Err(e) => {
                tracing::error!(
                    prospect = %prospect.email,
                    step = %candidate.step_key,
                    "Failed to send: {e}"
                );
                self.record_failure(StatusKind::SendError, candidate, e.to_string()).await;
                report.failed += 1;
                return;
            }
        };

        let updates = [
            StepUpdate::Sent(true),
            StepUpdate::MessageId(message_id),
            StepUpdate::SentAt(Utc::now()),
        ];
        let result = self
            .store
            .update_step_fields(
                &candidate.prospect_id,
                &candidate.step_key,
                &updates,
                Some(Precondition::Unsent),
            )
            .await;

        match result {
            Ok(UpdateOutcome::Applied) => report.sent += 1,
            Ok(UpdateOutcome::PreconditionFailed) => {
                tracing::warn!(
                    prospect = %prospect.email,
                    step = %candidate.step_key,
                    "Step was already recorded as sent; this delivery is a duplicate"
                );
                report.conflicts += 1;
            }
            Ok(UpdateOutcome::NotFound) => {
                let e = DatabaseError::NotFound {
                    entity: "step".into(),
                    id: format!("{}/{}", candidate.prospect_id, candidate.step_key),
                };
                self.record_failure(StatusKind::DbUpdateError, candidate, e.to_string()).await;
                report.failed += 1;
            }
            Err(e) => {
                tracing::error!(
                    prospect = %prospect.email,
                    step = %candidate.step_key,
                    "Sent but failed to record: {e}"
                );
                self.record_failure(StatusKind::DbUpdateError, candidate, e.to_string()).await;
                report.failed += 1;
            }
        }
    }

    async fn record_failure(
        &self,
        kind: StatusKind,
        candidate: &SendCandidate,
        error: String,
    ) {
        let record = StatusRecord::new(kind, error)
            .for_step(&candidate.recipient, &candidate.step_key);
        record_status(self.store.as_ref(), record).await;
    }
}

/// Thread root of a prospect, if it has been sent with a message id.
fn thread_context(prospect: &Prospect) -> Option<ThreadContext> {
    let root = prospect.root_step()?;
    if !root.sent {
        return None;
    }
    Some(ThreadContext {
        root_message_id: root.message_id.clone()?,
        root_body: root.body.clone(),
        root_sent_at: root.sent_at,
    })
}

/// Append a status record; failures only reach the process log.
async fn record_status(store: &dyn SequenceStore, record: StatusRecord) {
    if let Err(e) = store.append_status_record(&record).await {
        tracing::error!(kind = record.kind.as_str(), "Failed to append status record: {e}");
    }
}

/// Run ticks on `schedule` until the task is aborted. Each tick completes
/// before the next fire time is computed, so ticks never overlap and fire
/// times missed while a tick ran are skipped.
pub fn spawn_tick_loop(
    orchestrator: Arc<TickOrchestrator>,
    schedule: cron::Schedule,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let Some(next) = schedule.upcoming(Local).next() else {
                tracing::warn!("Tick schedule has no upcoming fire times, stopping");
                return;
            };
            let wait = (next - Local::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::time::sleep(wait).await;

            orchestrator.run_tick(TimeSlot::containing(&next)).await;
        }
    })
}
