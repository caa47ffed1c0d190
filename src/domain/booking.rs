//! Booking rules applied before an appointment is stored or moved.
//!
//! Everything here is pure: handlers load the branch, holidays and counters
//! from the database and pass them in.

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Utc, Weekday};
use uuid::Uuid;

use crate::models::AppointmentStatus;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BookingError {
    #[error("appointment date/time is in the past")]
    DateInPast,
    #[error("{0} is not a working day")]
    NonWorkingDay(Weekday),
    #[error("{0} is a holiday")]
    Holiday(String),
    #[error("time must be between {opens_at} and {closes_at}")]
    OutsideBusinessHours { opens_at: NaiveTime, closes_at: NaiveTime },
    #[error("client already has a pending appointment on this date")]
    DuplicateAppointment,
    #[error("branch has reached its daily capacity of {0}")]
    CapacityReached(i32),
}

impl BookingError {
    pub fn code(&self) -> &'static str {
        match self {
            BookingError::DateInPast => "DATE_IN_PAST",
            BookingError::NonWorkingDay(_) => "NON_WORKING_DAY",
            BookingError::Holiday(_) => "HOLIDAY",
            BookingError::OutsideBusinessHours { .. } => "OUTSIDE_BUSINESS_HOURS",
            BookingError::DuplicateAppointment => "DUPLICATE_APPOINTMENT",
            BookingError::CapacityReached(_) => "CAPACITY_REACHED",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BranchSchedule {
    pub opens_at: NaiveTime,
    pub closes_at: NaiveTime,
    pub open_saturdays: bool,
    pub daily_capacity: i32,
}

#[derive(Debug, Clone)]
pub struct HolidayEntry {
    pub date: NaiveDate,
    pub name: String,
    pub is_recurring: bool,
}

impl HolidayEntry {
    pub fn matches(&self, date: NaiveDate) -> bool {
        if self.is_recurring {
            self.date.month() == date.month() && self.date.day() == date.day()
        } else {
            self.date == date
        }
    }
}

pub fn holiday_on(date: NaiveDate, holidays: &[HolidayEntry]) -> Option<&str> {
    holidays
        .iter()
        .find(|h| h.matches(date))
        .map(|h| h.name.as_str())
}

/// Wall-clock time at the business location.
pub fn business_now(offset: FixedOffset) -> NaiveDateTime {
    to_business_time(Utc::now(), offset)
}

pub fn to_business_time(instant: DateTime<Utc>, offset: FixedOffset) -> NaiveDateTime {
    instant.with_timezone(&offset).naive_local()
}

pub fn is_working_day(date: NaiveDate, branch: &BranchSchedule) -> Result<(), BookingError> {
    match date.weekday() {
        Weekday::Sun => Err(BookingError::NonWorkingDay(Weekday::Sun)),
        Weekday::Sat if !branch.open_saturdays => Err(BookingError::NonWorkingDay(Weekday::Sat)),
        _ => Ok(()),
    }
}

/// Whether a whole day can take bookings, ignoring the time of day.
pub fn validate_day(
    date: NaiveDate,
    today: NaiveDate,
    branch: &BranchSchedule,
    holidays: &[HolidayEntry],
) -> Result<(), BookingError> {
    if date < today {
        return Err(BookingError::DateInPast);
    }
    is_working_day(date, branch)?;
    if let Some(name) = holiday_on(date, holidays) {
        return Err(BookingError::Holiday(name.to_string()));
    }
    Ok(())
}

/// Calendar checks for a requested slot, in the order they are reported.
pub fn validate_slot(
    date: NaiveDate,
    time: NaiveTime,
    now: NaiveDateTime,
    branch: &BranchSchedule,
    holidays: &[HolidayEntry],
) -> Result<(), BookingError> {
    if date < now.date() || (date == now.date() && time <= now.time()) {
        return Err(BookingError::DateInPast);
    }
    is_working_day(date, branch)?;
    if let Some(name) = holiday_on(date, holidays) {
        return Err(BookingError::Holiday(name.to_string()));
    }
    if time < branch.opens_at || time >= branch.closes_at {
        return Err(BookingError::OutsideBusinessHours {
            opens_at: branch.opens_at,
            closes_at: branch.closes_at,
        });
    }
    Ok(())
}

pub fn check_duplicate(pending_same_day: i64) -> Result<(), BookingError> {
    if pending_same_day > 0 {
        Err(BookingError::DuplicateAppointment)
    } else {
        Ok(())
    }
}

pub fn check_capacity(booked: i64, capacity: i32) -> Result<(), BookingError> {
    if booked >= i64::from(capacity) {
        Err(BookingError::CapacityReached(capacity))
    } else {
        Ok(())
    }
}

pub fn remaining_capacity(booked: i64, capacity: i32) -> i64 {
    (i64::from(capacity) - booked).max(0)
}

/// `APT-YYYYMMDD-XXXXXXXX`, suffix taken from the appointment id.
pub fn appointment_number(date: NaiveDate, appointment_id: Uuid) -> String {
    let simple = appointment_id.simple().to_string().to_uppercase();
    format!("APT-{}-{}", date.format("%Y%m%d"), &simple[..8])
}

pub fn can_transition(from: AppointmentStatus, to: AppointmentStatus) -> bool {
    matches!(
        (from, to),
        (
            AppointmentStatus::Pending,
            AppointmentStatus::Completed | AppointmentStatus::Cancelled | AppointmentStatus::Expired
        )
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn branch() -> BranchSchedule {
        BranchSchedule {
            opens_at: NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
            closes_at: NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
            open_saturdays: false,
            daily_capacity: 3,
        }
    }

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    // Wednesday 2026-10-14, 10:00 local
    fn now() -> NaiveDateTime {
        d(2026, 10, 14).and_time(t(10, 0))
    }

    #[test]
    fn weekday_within_hours_is_accepted() {
        assert_eq!(validate_slot(d(2026, 10, 15), t(9, 30), now(), &branch(), &[]), Ok(()));
    }

    #[test]
    fn past_date_and_earlier_today_are_rejected() {
        assert_eq!(
            validate_slot(d(2026, 10, 13), t(9, 0), now(), &branch(), &[]),
            Err(BookingError::DateInPast)
        );
        assert_eq!(
            validate_slot(d(2026, 10, 14), t(9, 0), now(), &branch(), &[]),
            Err(BookingError::DateInPast)
        );
        assert_eq!(validate_slot(d(2026, 10, 14), t(11, 0), now(), &branch(), &[]), Ok(()));
    }

    #[test]
    fn sunday_is_always_rejected() {
        let mut b = branch();
        b.open_saturdays = true;
        assert_eq!(
            validate_slot(d(2026, 10, 18), t(9, 0), now(), &b, &[]),
            Err(BookingError::NonWorkingDay(Weekday::Sun))
        );
    }

    #[test]
    fn saturday_depends_on_branch() {
        assert_eq!(
            validate_slot(d(2026, 10, 17), t(9, 0), now(), &branch(), &[]),
            Err(BookingError::NonWorkingDay(Weekday::Sat))
        );
        let mut b = branch();
        b.open_saturdays = true;
        assert_eq!(validate_slot(d(2026, 10, 17), t(9, 0), now(), &b, &[]), Ok(()));
    }

    #[test]
    fn fixed_and_recurring_holidays_block_booking() {
        let holidays = vec![
            HolidayEntry { date: d(2026, 10, 15), name: "Fixed".into(), is_recurring: false },
            HolidayEntry { date: d(2019, 12, 8), name: "Inmaculada".into(), is_recurring: true },
        ];
        assert_eq!(
            validate_slot(d(2026, 10, 15), t(9, 0), now(), &branch(), &holidays),
            Err(BookingError::Holiday("Fixed".into()))
        );
        // 2026-12-08 is a Tuesday
        assert_eq!(
            validate_slot(d(2026, 12, 8), t(9, 0), now(), &branch(), &holidays),
            Err(BookingError::Holiday("Inmaculada".into()))
        );
        assert_eq!(holiday_on(d(2027, 10, 15), &holidays), None);
    }

    #[test]
    fn day_check_ignores_time_of_day() {
        let today = now().date();
        assert_eq!(validate_day(today, today, &branch(), &[]), Ok(()));
        assert_eq!(
            validate_day(d(2026, 10, 13), today, &branch(), &[]),
            Err(BookingError::DateInPast)
        );
        assert_eq!(
            validate_day(d(2026, 10, 18), today, &branch(), &[]),
            Err(BookingError::NonWorkingDay(Weekday::Sun))
        );
    }

    #[test]
    fn closing_time_is_exclusive() {
        assert!(matches!(
            validate_slot(d(2026, 10, 15), t(17, 0), now(), &branch(), &[]),
            Err(BookingError::OutsideBusinessHours { .. })
        ));
        assert!(matches!(
            validate_slot(d(2026, 10, 15), t(7, 59), now(), &branch(), &[]),
            Err(BookingError::OutsideBusinessHours { .. })
        ));
        assert_eq!(validate_slot(d(2026, 10, 15), t(8, 0), now(), &branch(), &[]), Ok(()));
    }

    #[test]
    fn capacity_and_duplicates() {
        assert_eq!(check_capacity(2, 3), Ok(()));
        assert_eq!(check_capacity(3, 3), Err(BookingError::CapacityReached(3)));
        assert_eq!(remaining_capacity(5, 3), 0);
        assert_eq!(remaining_capacity(1, 3), 2);
        assert_eq!(check_duplicate(0), Ok(()));
        assert_eq!(check_duplicate(1), Err(BookingError::DuplicateAppointment));
    }

    #[test]
    fn appointment_number_embeds_date_and_id_prefix() {
        let id = Uuid::parse_str("3f2a9c1b-0000-4000-8000-000000000000").unwrap();
        assert_eq!(appointment_number(d(2026, 10, 15), id), "APT-20261015-3F2A9C1B");
    }

    #[test]
    fn only_pending_appointments_move() {
        use AppointmentStatus::*;
        assert!(can_transition(Pending, Cancelled));
        assert!(can_transition(Pending, Completed));
        assert!(can_transition(Pending, Expired));
        assert!(!can_transition(Cancelled, Completed));
        assert!(!can_transition(Completed, Cancelled));
        assert!(!can_transition(Pending, Pending));
    }

    #[test]
    fn business_time_applies_offset() {
        let instant = DateTime::parse_from_rfc3339("2026-10-15T03:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let bogota = FixedOffset::west_opt(5 * 3600).unwrap();
        assert_eq!(to_business_time(instant, bogota), d(2026, 10, 14).and_time(t(22, 0)));
    }
}
