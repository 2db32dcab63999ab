//! Eligibility evaluation — which steps of a sequence may go out this slot.
//!
//! A step is a *candidate* when its schedule is well-formed, matches the
//! current slot, and it has not been sent. A candidate is *eligible* when it
//! is the thread root or its immediate predecessor (ordinal - 1) is already
//! sent. Evaluation is a pure query over the stored sequence.

use crate::error::MalformedScheduleError;
use crate::sequence::{Sequence, StepKey, TimeSlot};

/// Why a due step was held back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Blocked {
    /// No step with ordinal - 1 exists.
    PredecessorMissing,
    /// The predecessor exists but has not been sent.
    PredecessorUnsent(StepKey),
}

/// Outcome of evaluating one sequence against one slot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Evaluation {
    /// Eligible steps, ascending by ordinal.
    pub eligible: Vec<StepKey>,
    /// Due but unsendable because of ordering.
    pub blocked: Vec<(StepKey, Blocked)>,
    /// Steps whose stored schedule could not be parsed.
    pub malformed: Vec<(StepKey, MalformedScheduleError)>,
}

/// Evaluate a sequence for `slot`.
pub fn evaluate(sequence: &Sequence, slot: TimeSlot) -> Evaluation {
    let mut evaluation = Evaluation::default();

    // BTreeMap iteration is already in ordinal order.
    for (key, step) in sequence {
        if step.sent {
            continue;
        }

        let scheduled = match step.schedule() {
            Ok(scheduled) => scheduled,
            Err(e) => {
                evaluation.malformed.push((key.clone(), e));
                continue;
            }
        };

        if scheduled != slot {
            continue;
        }

        if key.is_root() {
            evaluation.eligible.push(key.clone());
            continue;
        }

        let predecessor = sequence
            .iter()
            .find(|(k, _)| k.ordinal() == key.ordinal() - 1);

        match predecessor {
            Some((_, prev)) if prev.sent => evaluation.eligible.push(key.clone()),
            Some((prev_key, _)) => evaluation
                .blocked
                .push((key.clone(), Blocked::PredecessorUnsent(prev_key.clone()))),
            None => evaluation
                .blocked
                .push((key.clone(), Blocked::PredecessorMissing)),
        }
    }

    evaluation
}

#[cfg(test)]
mod tests {
    use chrono::Weekday;

    use super::*;
    use crate::sequence::{Step, StepTime};

    const MON_9: TimeSlot = TimeSlot {
        day: Weekday::Mon,
        hour: 9,
    };

    fn key(raw: &str) -> StepKey {
        StepKey::parse(raw).unwrap()
    }

    fn sent(mut step: Step) -> Step {
        step.sent = true;
        step.message_id = Some("<root@x.com>".into());
        step.sent_at = Some(chrono::Utc::now());
        step
    }

    fn ordinals(keys: &[StepKey]) -> Vec<u32> {
        keys.iter().map(StepKey::ordinal).collect()
    }

    #[test]
    fn root_step_due_now_is_eligible() {
        let mut seq = Sequence::new();
        seq.insert(key("email_1"), Step::new("hi", "body", MON_9));

        let eval = evaluate(&seq, MON_9);
        assert_eq!(ordinals(&eval.eligible), vec![1]);
        assert!(eval.blocked.is_empty());
    }

    #[test]
    fn steps_in_other_slots_are_not_candidates() {
        let mut seq = Sequence::new();
        seq.insert(key("email_1"), Step::new("hi", "body", MON_9.next()));

        let eval = evaluate(&seq, MON_9);
        assert!(eval.eligible.is_empty());
        assert!(eval.blocked.is_empty());
    }

    #[test]
    fn sent_steps_are_not_candidates() {
        let mut seq = Sequence::new();
        seq.insert(key("email_1"), sent(Step::new("hi", "body", MON_9)));

        assert!(evaluate(&seq, MON_9).eligible.is_empty());
    }

    #[test]
    fn successor_waits_for_unsent_predecessor() {
        let mut seq = Sequence::new();
        seq.insert(key("email_1"), Step::new("one", "b", MON_9.next()));
        seq.insert(key("email_2"), Step::new("two", "b", MON_9));

        let eval = evaluate(&seq, MON_9);
        assert!(eval.eligible.is_empty());
        assert_eq!(
            eval.blocked,
            vec![(key("email_2"), Blocked::PredecessorUnsent(key("email_1")))]
        );
    }

    #[test]
    fn successor_of_sent_predecessor_is_eligible() {
        let mut seq = Sequence::new();
        seq.insert(key("email_1"), sent(Step::new("one", "b", MON_9)));
        seq.insert(key("email_2"), Step::new("two", "b", MON_9));

        assert_eq!(ordinals(&evaluate(&seq, MON_9).eligible), vec![2]);
    }

    #[test]
    fn same_slot_chain_only_releases_first_unsent() {
        let mut seq = Sequence::new();
        seq.insert(key("email_1"), Step::new("one", "b", MON_9));
        seq.insert(key("email_2"), Step::new("two", "b", MON_9));

        let eval = evaluate(&seq, MON_9);
        assert_eq!(ordinals(&eval.eligible), vec![1]);
        assert_eq!(eval.blocked.len(), 1);
    }

    #[test]
    fn gap_in_ordinals_blocks_successor() {
        let mut seq = Sequence::new();
        seq.insert(key("email_1"), sent(Step::new("one", "b", MON_9)));
        seq.insert(key("email_3"), Step::new("three", "b", MON_9));

        let eval = evaluate(&seq, MON_9);
        assert!(eval.eligible.is_empty());
        assert_eq!(eval.blocked, vec![(key("email_3"), Blocked::PredecessorMissing)]);
    }

    #[test]
    fn predecessor_lookup_is_numeric_not_lexical() {
        let mut seq = Sequence::new();
        for n in 1..=9 {
            seq.insert(
                key(&format!("email_{n}")),
                sent(Step::new(format!("s{n}"), "b", MON_9)),
            );
        }
        seq.insert(key("email_10"), Step::new("s10", "b", MON_9));

        assert_eq!(ordinals(&evaluate(&seq, MON_9).eligible), vec![10]);
    }

    #[test]
    fn malformed_schedule_is_reported_and_siblings_still_evaluated() {
        let mut seq = Sequence::new();
        seq.insert(
            key("email_1"),
            Step::with_time(
                "one",
                "b",
                StepTime {
                    day: None,
                    hour: Some("09:00".into()),
                },
            ),
        );
        seq.insert(key("email_2"), sent(Step::new("two", "b", MON_9)));
        seq.insert(key("email_3"), Step::new("three", "b", MON_9));

        let eval = evaluate(&seq, MON_9);
        assert_eq!(
            eval.malformed,
            vec![(key("email_1"), MalformedScheduleError::MissingDay)]
        );
        assert_eq!(ordinals(&eval.eligible), vec![3]);
    }
}
