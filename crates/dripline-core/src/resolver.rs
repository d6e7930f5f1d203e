//! Step Graph Resolver - computes per-contact send schedules
//!
//! Pure functions over a step, its campaign's contacts, and the jobs
//! that already exist. All timezone interpretation happens here; every
//! other component operates on UTC instants only.

use chrono::{DateTime, Duration, TimeZone, Utc};
use chrono_tz::Tz;
use dripline_common::types::{ContactId, StepId};
use dripline_common::{Error, Result};
use dripline_storage::models::{CampaignStep, EmailJob, JobStatus, TriggerType};
use std::collections::HashSet;

/// Minimum spacing between consecutive sends within a step
pub const MIN_DELAY_MINUTES: f64 = 0.5;

/// One planned send for an eligible contact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedSend {
    pub contact_id: ContactId,
    pub scheduled_send_at: DateTime<Utc>,
}

/// A step resolved to concrete per-contact schedules
#[derive(Debug, Clone)]
pub struct StepResolution {
    pub step_id: StepId,
    pub sends: Vec<PlannedSend>,
    /// The step's scheduled window had already passed at resolution
    /// time; it is materialized now rather than silently skipped, and
    /// callers surface this for user notification.
    pub overdue: bool,
}

/// Outcome of attempting to resolve a step
#[derive(Debug, Clone)]
pub enum Resolution {
    Ready(StepResolution),
    /// Reply step whose target still has unresolved jobs. Resolution
    /// is deferred, not zero-filled.
    Deferred {
        step_id: StepId,
        target_step_id: StepId,
    },
}

/// Convert a declared wall-clock instant to UTC. The stored value's
/// wall-clock fields are authored in `timezone` when one is declared;
/// without one the value is taken as UTC directly.
pub fn to_utc_instant(declared: DateTime<Utc>, timezone: Option<&str>) -> Result<DateTime<Utc>> {
    let Some(name) = timezone else {
        return Ok(declared);
    };
    let zone: Tz = name
        .parse()
        .map_err(|_| Error::Validation(format!("Unknown timezone '{}'", name)))?;

    match zone.from_local_datetime(&declared.naive_utc()) {
        chrono::LocalResult::Single(local) => Ok(local.with_timezone(&Utc)),
        // DST fold: take the earlier instant
        chrono::LocalResult::Ambiguous(earlier, _) => Ok(earlier.with_timezone(&Utc)),
        chrono::LocalResult::None => Err(Error::Validation(format!(
            "Schedule time does not exist in timezone '{}'",
            name
        ))),
    }
}

/// Offset of the i-th send within a step, floored to whole seconds so
/// fractional-minute delays never produce sub-second job storms.
pub fn spacing_offset(index: usize, delay_minutes: f64) -> Duration {
    Duration::seconds((index as f64 * delay_minutes * 60.0).floor() as i64)
}

/// Base instant sends of this step are spaced from, plus whether the
/// step is overdue.
pub fn schedule_base(step: &CampaignStep, now: DateTime<Utc>) -> Result<(DateTime<Utc>, bool)> {
    let trigger = step
        .trigger_type_enum()
        .ok_or_else(|| Error::Integrity(format!("Step {} has unknown trigger type", step.id)))?;

    match trigger {
        TriggerType::Immediate => Ok((now, false)),
        TriggerType::Schedule => {
            let declared = step.schedule_time.ok_or_else(|| {
                Error::Validation(format!("Scheduled step {} has no schedule time", step.id))
            })?;
            let at = to_utc_instant(declared, step.timezone.as_deref())?;
            if at <= now {
                // Window elapsed (e.g. paused across the boundary):
                // materialize now, flag overdue
                Ok((now, true))
            } else {
                Ok((at, false))
            }
        }
    }
}

/// Resolve one step to per-contact send schedules.
///
/// `contacts` is the campaign's full list membership, `excluded` the
/// contacts disqualified by unsubscribe/bounce/complaint on earlier
/// steps, `existing_jobs` the jobs already materialized for this step
/// (re-resolving them is a no-op), and `target_jobs` the reply-target
/// step's jobs (required iff the step is a reply step).
///
/// Eligible contacts are processed in id-ascending order; the i-th
/// send lands at `base + floor(i * delay * 60)` seconds, continuing
/// the index sequence after any existing jobs so spacing survives
/// incremental materialization.
pub fn resolve_step(
    step: &CampaignStep,
    contacts: &[ContactId],
    excluded: &HashSet<ContactId>,
    existing_jobs: &[EmailJob],
    target_jobs: Option<&[EmailJob]>,
    now: DateTime<Utc>,
) -> Result<Resolution> {
    if step.delay_minutes < MIN_DELAY_MINUTES {
        return Err(Error::Validation(format!(
            "Step {} delay {} is below the minimum of {} minutes",
            step.id, step.delay_minutes, MIN_DELAY_MINUTES
        )));
    }

    let mut candidates: Vec<ContactId> = if let Some(target_id) = step.reply_to_step_id {
        let target_jobs = target_jobs.ok_or_else(|| {
            Error::Integrity(format!(
                "Reply step {} resolved without its target's jobs",
                step.id
            ))
        })?;
        let filter = step.reply_filter_enum().ok_or_else(|| {
            Error::Validation(format!("Reply step {} has no valid reply filter", step.id))
        })?;

        // The target must be fully resolved before the audience can
        // be derived
        let all_settled = target_jobs.iter().all(|job| {
            job.status_enum()
                .is_some_and(|status| status.is_terminal())
        });
        if target_jobs.is_empty() || !all_settled {
            return Ok(Resolution::Deferred {
                step_id: step.id,
                target_step_id: target_id,
            });
        }

        target_jobs
            .iter()
            .filter(|job| {
                job.status_enum()
                    .is_some_and(|status| status.matches_reply_filter(filter))
            })
            .map(|job| job.contact_id)
            .collect()
    } else {
        contacts
            .iter()
            .filter(|contact| !excluded.contains(contact))
            .copied()
            .collect()
    };

    // Idempotency: drop pairs already materialized
    let already: HashSet<ContactId> = existing_jobs.iter().map(|job| job.contact_id).collect();
    candidates.retain(|contact| !already.contains(contact));
    candidates.sort();
    candidates.dedup();

    let (base, overdue) = schedule_base(step, now)?;

    // Spacing continues after what's already materialized
    let start_index = existing_jobs.len();
    let sends = candidates
        .into_iter()
        .enumerate()
        .map(|(i, contact_id)| PlannedSend {
            contact_id,
            scheduled_send_at: base + spacing_offset(start_index + i, step.delay_minutes),
        })
        .collect();

    Ok(Resolution::Ready(StepResolution {
        step_id: step.id,
        sends,
        overdue,
    }))
}

/// Contacts disqualified from later steps by how earlier steps ended
pub fn exclusions_from(jobs: &[EmailJob]) -> impl Iterator<Item = ContactId> + '_ {
    jobs.iter()
        .filter(|job| {
            matches!(
                job.status_enum(),
                Some(JobStatus::Unsubscribed)
                    | Some(JobStatus::Bounced)
                    | Some(JobStatus::Complained)
            )
        })
        .map(|job| job.contact_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{job_with_status, step as make_step};
    use chrono::TimeZone;
    use dripline_storage::models::ReplyFilter;
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    fn ready(resolution: Resolution) -> StepResolution {
        match resolution {
            Resolution::Ready(r) => r,
            Resolution::Deferred { .. } => panic!("expected ready resolution"),
        }
    }

    fn sorted_contacts(n: usize) -> Vec<ContactId> {
        let mut contacts: Vec<ContactId> = (0..n).map(|_| Uuid::new_v4()).collect();
        contacts.sort();
        contacts
    }

    #[test]
    fn test_immediate_step_spacing_is_monotone() {
        let campaign_id = Uuid::new_v4();
        let step = make_step(campaign_id, 1, 1.5);
        let contacts = sorted_contacts(4);
        let now = Utc.with_ymd_and_hms(2026, 8, 30, 12, 0, 0).unwrap();

        let res = ready(
            resolve_step(&step, &contacts, &HashSet::new(), &[], None, now).unwrap(),
        );
        assert_eq!(res.sends.len(), 4);
        assert!(!res.overdue);
        for (i, send) in res.sends.iter().enumerate() {
            assert_eq!(
                send.scheduled_send_at,
                now + Duration::seconds((i as f64 * 90.0) as i64)
            );
        }
        // Deterministic id-ascending order
        let ids: Vec<ContactId> = res.sends.iter().map(|s| s.contact_id).collect();
        assert_eq!(ids, contacts);
    }

    #[test]
    fn test_fractional_delay_floors_to_seconds() {
        let step = make_step(Uuid::new_v4(), 1, 0.7);
        let contacts = sorted_contacts(3);
        let now = Utc.with_ymd_and_hms(2026, 8, 30, 12, 0, 0).unwrap();

        let res = ready(
            resolve_step(&step, &contacts, &HashSet::new(), &[], None, now).unwrap(),
        );
        // 0.7 min = 42s spacing, floored per index
        assert_eq!(res.sends[1].scheduled_send_at, now + Duration::seconds(42));
        assert_eq!(res.sends[2].scheduled_send_at, now + Duration::seconds(84));
    }

    #[test]
    fn test_idempotent_over_existing_jobs() {
        let step = make_step(Uuid::new_v4(), 1, 1.0);
        let contacts = sorted_contacts(3);
        let now = Utc::now();

        let existing: Vec<EmailJob> = contacts
            .iter()
            .map(|c| job_with_status(step.id, *c, JobStatus::Queued))
            .collect();
        let res = ready(
            resolve_step(&step, &contacts, &HashSet::new(), &existing, None, now).unwrap(),
        );
        assert!(res.sends.is_empty());
    }

    #[test]
    fn test_new_contacts_continue_spacing_after_existing() {
        let step = make_step(Uuid::new_v4(), 1, 1.0);
        let mut contacts = sorted_contacts(2);
        let now = Utc.with_ymd_and_hms(2026, 8, 30, 12, 0, 0).unwrap();

        let existing: Vec<EmailJob> = contacts
            .iter()
            .map(|c| job_with_status(step.id, *c, JobStatus::Sent))
            .collect();
        let newcomer = Uuid::new_v4();
        contacts.push(newcomer);

        let res = ready(
            resolve_step(&step, &contacts, &HashSet::new(), &existing, None, now).unwrap(),
        );
        assert_eq!(res.sends.len(), 1);
        assert_eq!(res.sends[0].contact_id, newcomer);
        // Index 2, not 0: spacing continues after the two existing jobs
        assert_eq!(res.sends[0].scheduled_send_at, now + Duration::seconds(120));
    }

    #[test]
    fn test_overdue_scheduled_step_materializes_now() {
        let mut step = make_step(Uuid::new_v4(), 1, 1.0);
        step.trigger_type = TriggerType::Schedule.to_string();
        let now = Utc.with_ymd_and_hms(2026, 8, 30, 12, 0, 0).unwrap();
        step.schedule_time = Some(now - Duration::hours(2));

        let contacts = sorted_contacts(2);
        let res = ready(
            resolve_step(&step, &contacts, &HashSet::new(), &[], None, now).unwrap(),
        );
        assert!(res.overdue);
        assert_eq!(res.sends[0].scheduled_send_at, now);
    }

    #[test]
    fn test_future_scheduled_step_uses_declared_instant() {
        let mut step = make_step(Uuid::new_v4(), 1, 1.0);
        step.trigger_type = TriggerType::Schedule.to_string();
        let now = Utc.with_ymd_and_hms(2026, 8, 30, 12, 0, 0).unwrap();
        let at = now + Duration::hours(3);
        step.schedule_time = Some(at);

        let contacts = sorted_contacts(1);
        let res = ready(
            resolve_step(&step, &contacts, &HashSet::new(), &[], None, now).unwrap(),
        );
        assert!(!res.overdue);
        assert_eq!(res.sends[0].scheduled_send_at, at);
    }

    #[test]
    fn test_timezone_interpretation() {
        // A wall-clock of 09:00 in Kolkata is 03:30 UTC
        let declared = Utc.with_ymd_and_hms(2026, 8, 31, 9, 0, 0).unwrap();
        let utc = to_utc_instant(declared, Some("Asia/Kolkata")).unwrap();
        assert_eq!(utc, Utc.with_ymd_and_hms(2026, 8, 31, 3, 30, 0).unwrap());

        assert_eq!(to_utc_instant(declared, None).unwrap(), declared);
        assert!(to_utc_instant(declared, Some("Not/AZone")).is_err());
    }

    #[test]
    fn test_reply_step_deferred_until_target_settles() {
        let campaign_id = Uuid::new_v4();
        let target = make_step(campaign_id, 1, 1.0);
        let mut reply = make_step(campaign_id, 2, 1.0);
        reply.reply_to_step_id = Some(target.id);
        reply.reply_filter = Some(ReplyFilter::Opened.to_string());

        let contacts = sorted_contacts(2);
        let target_jobs = vec![
            job_with_status(target.id, contacts[0], JobStatus::Opened),
            job_with_status(target.id, contacts[1], JobStatus::Queued),
        ];

        let resolution = resolve_step(
            &reply,
            &contacts,
            &HashSet::new(),
            &[],
            Some(&target_jobs),
            Utc::now(),
        )
        .unwrap();
        assert!(matches!(resolution, Resolution::Deferred { .. }));
    }

    #[test]
    fn test_reply_step_filter_yields_exact_subset() {
        // Five recipients on the target: two reach OPENED, three stay
        // SENT-only. An OPENED reply step yields exactly two sends.
        let campaign_id = Uuid::new_v4();
        let target = make_step(campaign_id, 1, 1.0);
        let mut reply = make_step(campaign_id, 2, 1.0);
        reply.reply_to_step_id = Some(target.id);
        reply.reply_filter = Some(ReplyFilter::Opened.to_string());

        let contacts = sorted_contacts(5);
        let target_jobs = vec![
            job_with_status(target.id, contacts[0], JobStatus::Opened),
            job_with_status(target.id, contacts[1], JobStatus::Sent),
            job_with_status(target.id, contacts[2], JobStatus::Clicked),
            job_with_status(target.id, contacts[3], JobStatus::Sent),
            job_with_status(target.id, contacts[4], JobStatus::Sent),
        ];

        let res = ready(
            resolve_step(
                &reply,
                &contacts,
                &HashSet::new(),
                &[],
                Some(&target_jobs),
                Utc::now(),
            )
            .unwrap(),
        );
        let mut eligible: Vec<ContactId> = res.sends.iter().map(|s| s.contact_id).collect();
        eligible.sort();
        let mut expected = vec![contacts[0], contacts[2]];
        expected.sort();
        assert_eq!(eligible, expected);
    }

    #[test]
    fn test_reply_step_without_target_jobs_is_integrity_error() {
        let mut reply = make_step(Uuid::new_v4(), 2, 1.0);
        reply.reply_to_step_id = Some(Uuid::new_v4());
        reply.reply_filter = Some(ReplyFilter::Sent.to_string());

        let err = resolve_step(&reply, &[], &HashSet::new(), &[], None, Utc::now()).unwrap_err();
        assert_eq!(err.code(), "INTEGRITY_VIOLATION");
    }

    #[test]
    fn test_excluded_contacts_are_skipped() {
        let step = make_step(Uuid::new_v4(), 1, 1.0);
        let contacts = sorted_contacts(3);
        let excluded: HashSet<ContactId> = [contacts[1]].into();

        let res = ready(
            resolve_step(&step, &contacts, &excluded, &[], None, Utc::now()).unwrap(),
        );
        assert_eq!(res.sends.len(), 2);
        assert!(res.sends.iter().all(|s| s.contact_id != contacts[1]));
    }

    #[test]
    fn test_delay_below_minimum_rejected() {
        let step = make_step(Uuid::new_v4(), 1, 0.25);
        let err =
            resolve_step(&step, &[], &HashSet::new(), &[], None, Utc::now()).unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }
}
