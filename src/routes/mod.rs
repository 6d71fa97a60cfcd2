use chrono::{NaiveDate, Utc};

use crate::{error::PortalError, models::DAY_FORMAT};

pub mod admin;
pub mod client;
pub mod events;
pub mod technician;

pub(crate) fn parse_day(value: &str) -> Result<NaiveDate, PortalError> {
    NaiveDate::parse_from_str(value.trim(), DAY_FORMAT)
        .map_err(|_| PortalError::validation(format!("invalid date: {value}, expected YYYY-MM-DD")))
}

pub(crate) fn today() -> NaiveDate {
    Utc::now().date_naive()
}
