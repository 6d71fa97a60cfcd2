use chrono::NaiveDate;

use crate::models::{Booking, BookingStatus, TaskKind, TaskLink, TaskStatus, VisitTask, DAY_FORMAT};

/// Presentation grouping. Derived from kind/link/status on every read,
/// never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskGroup {
    ActionRequired,
    Scheduled,
    History,
}

pub fn group_for(task: &VisitTask) -> TaskGroup {
    if task.status.is_terminal() {
        return TaskGroup::History;
    }
    if task.kind == TaskKind::ClientRequest || task.link == TaskLink::Unscheduled {
        return TaskGroup::ActionRequired;
    }
    TaskGroup::Scheduled
}

pub fn allowed_transition(from: TaskStatus, to: TaskStatus) -> bool {
    if from == to {
        return true;
    }
    match from {
        TaskStatus::Pending => true,
        TaskStatus::Postponed => matches!(
            to,
            TaskStatus::Pending | TaskStatus::Completed | TaskStatus::Cancelled
        ),
        // A completed task may be reopened by the completion toggle.
        TaskStatus::Completed => to == TaskStatus::Pending,
        TaskStatus::Cancelled => false,
    }
}

#[derive(Debug, Clone)]
pub enum PostponeTarget {
    /// Detach from the visit and park in the general pool.
    GeneralPool { reason: String },
    /// Move to another visit day for the same client.
    Reassign { date: NaiveDate },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostponeOutcome {
    MovedToPool,
    /// A visit on the target date existed; the task is re-queued against it.
    Linked { booking_id: String },
    /// No visit on the target date; the date is kept as a note only.
    Unmatched { noted_date: NaiveDate },
}

/// Applies a postponement to a copy of the task. Reassignment matches the
/// first non-cancelled visit of the same client on the target date; when
/// none exists the link stays cleared and the wanted date goes into
/// `reason` as free text.
pub fn plan_postponement(
    task: &VisitTask,
    target: &PostponeTarget,
    bookings: &[Booking],
) -> (VisitTask, PostponeOutcome) {
    let mut updated = task.clone();
    match target {
        PostponeTarget::GeneralPool { reason } => {
            updated.link = TaskLink::Unscheduled;
            updated.status = TaskStatus::Postponed;
            updated.reason = Some(reason.clone());
            (updated, PostponeOutcome::MovedToPool)
        }
        PostponeTarget::Reassign { date } => {
            let matched = bookings.iter().find(|booking| {
                booking.status != BookingStatus::Cancelled
                    && booking.date == *date
                    && booking.client_id.as_deref() == Some(task.client_id.as_str())
            });
            match matched {
                Some(booking) => {
                    updated.link = TaskLink::LinkedTo(booking.id.clone());
                    updated.status = TaskStatus::Pending;
                    updated.visit_date = Some(*date);
                    (
                        updated,
                        PostponeOutcome::Linked {
                            booking_id: booking.id.clone(),
                        },
                    )
                }
                None => {
                    updated.link = TaskLink::Unscheduled;
                    updated.status = TaskStatus::Postponed;
                    updated.reason = Some(date.format(DAY_FORMAT).to_string());
                    (updated, PostponeOutcome::Unmatched { noted_date: *date })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::VisitKind;

    fn day(value: &str) -> NaiveDate {
        NaiveDate::parse_from_str(value, DAY_FORMAT).unwrap()
    }

    fn task(kind: TaskKind, link: TaskLink, status: TaskStatus) -> VisitTask {
        VisitTask {
            id: "t1".to_string(),
            link,
            client_id: "c1".to_string(),
            text: "replace switch".to_string(),
            notes: None,
            kind,
            status,
            viewed_by_admin: false,
            visit_date: None,
            reason: None,
            created_at: String::new(),
        }
    }

    fn visit(id: &str, client_id: &str, date: &str) -> Booking {
        Booking {
            id: id.to_string(),
            client_id: Some(client_id.to_string()),
            client_name: "Acme".to_string(),
            date: day(date),
            slot: None,
            kind: VisitKind::OnSite,
            status: BookingStatus::Confirmed,
            branch_id: None,
            branch_name: None,
            created_at: String::new(),
        }
    }

    #[test]
    fn client_requests_need_action_until_closed() {
        let open = task(
            TaskKind::ClientRequest,
            TaskLink::Unscheduled,
            TaskStatus::Pending,
        );
        assert_eq!(group_for(&open), TaskGroup::ActionRequired);

        let linked = task(
            TaskKind::ClientRequest,
            TaskLink::LinkedTo("b1".to_string()),
            TaskStatus::Pending,
        );
        assert_eq!(group_for(&linked), TaskGroup::ActionRequired);

        let done = task(
            TaskKind::ClientRequest,
            TaskLink::Unscheduled,
            TaskStatus::Completed,
        );
        assert_eq!(group_for(&done), TaskGroup::History);
    }

    #[test]
    fn linked_standard_tasks_are_scheduled() {
        let linked = task(
            TaskKind::Standard,
            TaskLink::LinkedTo("b1".to_string()),
            TaskStatus::Pending,
        );
        assert_eq!(group_for(&linked), TaskGroup::Scheduled);

        let pooled = task(TaskKind::Standard, TaskLink::Unscheduled, TaskStatus::Postponed);
        assert_eq!(group_for(&pooled), TaskGroup::ActionRequired);

        let cancelled = task(
            TaskKind::Standard,
            TaskLink::LinkedTo("b1".to_string()),
            TaskStatus::Cancelled,
        );
        assert_eq!(group_for(&cancelled), TaskGroup::History);
    }

    #[test]
    fn cancelled_is_a_dead_end() {
        assert!(!allowed_transition(TaskStatus::Cancelled, TaskStatus::Pending));
        assert!(allowed_transition(TaskStatus::Completed, TaskStatus::Pending));
        assert!(!allowed_transition(TaskStatus::Completed, TaskStatus::Postponed));
        assert!(allowed_transition(TaskStatus::Pending, TaskStatus::Cancelled));
        assert!(allowed_transition(TaskStatus::Postponed, TaskStatus::Pending));
    }

    #[test]
    fn postpone_to_pool_clears_the_link() {
        let original = task(
            TaskKind::Standard,
            TaskLink::LinkedTo("b1".to_string()),
            TaskStatus::Pending,
        );
        let (updated, outcome) = plan_postponement(
            &original,
            &PostponeTarget::GeneralPool {
                reason: "client asked to wait".to_string(),
            },
            &[],
        );
        assert_eq!(outcome, PostponeOutcome::MovedToPool);
        assert_eq!(updated.link, TaskLink::Unscheduled);
        assert_eq!(updated.status, TaskStatus::Postponed);
        assert_eq!(updated.reason.as_deref(), Some("client asked to wait"));
    }

    #[test]
    fn reassignment_links_a_matching_visit_and_requeues() {
        let original = task(
            TaskKind::Standard,
            TaskLink::LinkedTo("b1".to_string()),
            TaskStatus::Pending,
        );
        let bookings = vec![visit("b1", "c1", "2024-05-01"), visit("b2", "c1", "2024-06-01")];
        let (updated, outcome) = plan_postponement(
            &original,
            &PostponeTarget::Reassign {
                date: day("2024-06-01"),
            },
            &bookings,
        );
        assert_eq!(
            outcome,
            PostponeOutcome::Linked {
                booking_id: "b2".to_string()
            }
        );
        assert_eq!(updated.link, TaskLink::LinkedTo("b2".to_string()));
        assert_eq!(updated.status, TaskStatus::Pending);
    }

    #[test]
    fn reassignment_without_a_visit_degrades_to_a_note() {
        let original = task(
            TaskKind::Standard,
            TaskLink::LinkedTo("b1".to_string()),
            TaskStatus::Pending,
        );
        // b2 belongs to another client, so it must not match.
        let bookings = vec![visit("b2", "c2", "2024-07-01")];
        let (updated, outcome) = plan_postponement(
            &original,
            &PostponeTarget::Reassign {
                date: day("2024-07-01"),
            },
            &bookings,
        );
        assert_eq!(
            outcome,
            PostponeOutcome::Unmatched {
                noted_date: day("2024-07-01")
            }
        );
        assert_eq!(updated.link, TaskLink::Unscheduled);
        assert_eq!(updated.status, TaskStatus::Postponed);
        assert_eq!(updated.reason.as_deref(), Some("2024-07-01"));
    }
}
