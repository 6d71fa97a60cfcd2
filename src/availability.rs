use chrono::NaiveDate;

use crate::models::{BlockRecord, Booking, BookingStatus};

/// True when `date` is closed for `client_id`. A global block (no owner)
/// closes the date for every client; a per-client block only for its owner.
pub fn is_date_blocked(date: NaiveDate, client_id: Option<&str>, blocks: &[BlockRecord]) -> bool {
    blocks.iter().any(|block| {
        block.date == date
            && match block.client_id.as_deref() {
                None => true,
                Some(owner) => client_id == Some(owner),
            }
    })
}

pub fn is_globally_blocked(date: NaiveDate, blocks: &[BlockRecord]) -> bool {
    blocks
        .iter()
        .any(|block| block.date == date && block.is_global())
}

/// Visits strictly in the past are frozen. Calendar-day granularity only.
pub fn is_editable(date: NaiveDate, today: NaiveDate) -> bool {
    date >= today
}

pub fn is_slot_taken(date: NaiveDate, time: &str, bookings: &[Booking]) -> bool {
    bookings.iter().any(|booking| {
        booking.status != BookingStatus::Cancelled
            && booking.date == date
            && booking
                .slot
                .as_ref()
                .is_some_and(|slot| slot.label == time)
    })
}

/// Parses a 12-hour slot label ("09:00 AM") into minutes since midnight.
/// Accepts plain 24-hour "HH:MM" as well. Slot order always comes from this
/// value; lexical comparison of labels misorders "01:00 PM" before "09:00 AM".
pub fn slot_minutes(label: &str) -> Option<u16> {
    let label = label.trim();
    let (clock, meridiem) = match label.split_once(' ') {
        Some((clock, meridiem)) => (clock, Some(meridiem.trim())),
        None => (label, None),
    };

    let (hour, minute) = clock.split_once(':')?;
    let hour: u16 = hour.trim().parse().ok()?;
    let minute: u16 = minute.trim().parse().ok()?;
    if minute > 59 {
        return None;
    }

    let hour = match meridiem {
        Some(m) if m.eq_ignore_ascii_case("am") => match hour {
            12 => 0,
            1..=11 => hour,
            _ => return None,
        },
        Some(m) if m.eq_ignore_ascii_case("pm") => match hour {
            12 => 12,
            1..=11 => hour + 12,
            _ => return None,
        },
        Some(_) => return None,
        None => {
            if hour > 23 {
                return None;
            }
            hour
        }
    };

    Some(hour * 60 + minute)
}

/// All non-block bookings on `date`, earliest slot first. Slotless entries
/// sort last.
pub fn day_schedule(date: NaiveDate, bookings: &[Booking]) -> Vec<Booking> {
    let mut day: Vec<Booking> = bookings
        .iter()
        .filter(|booking| booking.date == date)
        .cloned()
        .collect();
    day.sort_by_key(|booking| booking.slot.as_ref().map_or(u16::MAX, |slot| slot.minutes));
    day
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Slot, VisitKind};

    fn day(value: &str) -> NaiveDate {
        NaiveDate::parse_from_str(value, "%Y-%m-%d").unwrap()
    }

    fn block(date: &str, client_id: Option<&str>) -> BlockRecord {
        BlockRecord {
            id: format!("block-{date}-{}", client_id.unwrap_or("global")),
            date: day(date),
            client_id: client_id.map(str::to_string),
            created_at: String::new(),
        }
    }

    fn booking(date: &str, time: &str, status: BookingStatus) -> Booking {
        Booking {
            id: format!("b-{date}-{time}"),
            client_id: Some("c1".to_string()),
            client_name: "Acme".to_string(),
            date: day(date),
            slot: Some(Slot {
                label: time.to_string(),
                minutes: slot_minutes(time).unwrap(),
            }),
            kind: VisitKind::OnSite,
            status,
            branch_id: None,
            branch_name: None,
            created_at: String::new(),
        }
    }

    #[test]
    fn global_block_applies_to_every_client() {
        let blocks = vec![block("2024-05-12", None)];
        assert!(is_date_blocked(day("2024-05-12"), Some("any-client"), &blocks));
        assert!(is_date_blocked(day("2024-05-12"), None, &blocks));
        assert!(!is_date_blocked(day("2024-05-13"), Some("any-client"), &blocks));
    }

    #[test]
    fn per_client_block_only_hits_its_owner() {
        let blocks = vec![block("2024-05-12", Some("c1"))];
        assert!(is_date_blocked(day("2024-05-12"), Some("c1"), &blocks));
        assert!(!is_date_blocked(day("2024-05-12"), Some("c2"), &blocks));
    }

    #[test]
    fn global_block_dominates_per_client_state() {
        // Removing the per-client block must not reopen a globally closed date.
        let blocks = vec![block("2024-05-12", None)];
        assert!(is_date_blocked(day("2024-05-12"), Some("c1"), &blocks));
        assert!(is_globally_blocked(day("2024-05-12"), &blocks));
    }

    #[test]
    fn past_dates_are_not_editable() {
        let today = day("2024-06-15");
        assert!(!is_editable(day("2024-06-14"), today));
        assert!(is_editable(day("2024-06-15"), today));
        assert!(is_editable(day("2024-06-16"), today));
    }

    #[test]
    fn cancelled_bookings_release_their_slot() {
        let bookings = vec![
            booking("2024-05-10", "10:00 AM", BookingStatus::Cancelled),
            booking("2024-05-10", "11:00 AM", BookingStatus::Confirmed),
        ];
        assert!(!is_slot_taken(day("2024-05-10"), "10:00 AM", &bookings));
        assert!(is_slot_taken(day("2024-05-10"), "11:00 AM", &bookings));
        assert!(!is_slot_taken(day("2024-05-11"), "11:00 AM", &bookings));
    }

    #[test]
    fn slot_minutes_handles_twelve_hour_labels() {
        assert_eq!(slot_minutes("09:00 AM"), Some(540));
        assert_eq!(slot_minutes("12:00 AM"), Some(0));
        assert_eq!(slot_minutes("12:30 PM"), Some(750));
        assert_eq!(slot_minutes("01:00 PM"), Some(780));
        assert_eq!(slot_minutes("11:45 pm"), Some(1425));
        assert_eq!(slot_minutes("14:30"), Some(870));
        assert_eq!(slot_minutes("13:00 PM"), None);
        assert_eq!(slot_minutes("10:75 AM"), None);
        assert_eq!(slot_minutes("noon"), None);
    }

    #[test]
    fn day_schedule_sorts_afternoon_after_morning() {
        // Lexically "01:00 PM" < "09:00 AM"; normalized minutes must win.
        let bookings = vec![
            booking("2024-05-10", "01:00 PM", BookingStatus::Confirmed),
            booking("2024-05-10", "09:00 AM", BookingStatus::Confirmed),
            booking("2024-05-10", "11:00 AM", BookingStatus::Pending),
            booking("2024-05-11", "08:00 AM", BookingStatus::Confirmed),
        ];
        let schedule = day_schedule(day("2024-05-10"), &bookings);
        let labels: Vec<&str> = schedule
            .iter()
            .map(|b| b.slot.as_ref().unwrap().label.as_str())
            .collect();
        assert_eq!(labels, vec!["09:00 AM", "11:00 AM", "01:00 PM"]);
    }
}
