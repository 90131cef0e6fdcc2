// src/calendar.rs
use chrono::{Datelike, Days, Local, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

pub const DATE_FORMAT: &str = "%Y-%m-%d";

// --- Errors ---

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CalendarError {
    #[error("Malformed calendar date '{0}', expected YYYY-MM-DD")]
    MalformedDate(String),
    #[error("{0} is a {1}, not a Sunday")]
    NotASunday(NaiveDate, Weekday),
    #[error("Year {0} is outside the supported calendar range")]
    YearOutOfRange(i32),
}

// --- Sunday ---

/// The Sunday that anchors one weekly attendance cycle.
///
/// Arithmetic near the ends of chrono's supported range panics, the same as
/// `NaiveDate + Days` does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "NaiveDate", into = "NaiveDate")]
pub struct Sunday(NaiveDate);

impl Sunday {
    /// The Sunday of the week containing `date`.
    pub fn containing(date: NaiveDate) -> Self {
        let offset = date.weekday().num_days_from_sunday() as u64;
        Sunday(date - Days::new(offset))
    }

    pub fn date(&self) -> NaiveDate {
        self.0
    }

    pub fn week_dates(&self) -> [NaiveDate; 7] {
        std::array::from_fn(|i| self.0 + Days::new(i as u64))
    }

    pub fn previous(&self) -> Sunday {
        Sunday(self.0 - Days::new(7))
    }

    pub fn next(&self) -> Sunday {
        Sunday(self.0 + Days::new(7))
    }

    /// Whether `date` falls inside this Sunday's week (Sunday..=Saturday).
    pub fn contains(&self, date: NaiveDate) -> bool {
        Sunday::containing(date) == *self
    }
}

impl TryFrom<NaiveDate> for Sunday {
    type Error = CalendarError;

    fn try_from(date: NaiveDate) -> Result<Self, Self::Error> {
        match date.weekday() {
            Weekday::Sun => Ok(Sunday(date)),
            other => Err(CalendarError::NotASunday(date, other)),
        }
    }
}

impl From<Sunday> for NaiveDate {
    fn from(sunday: Sunday) -> Self {
        sunday.0
    }
}

impl fmt::Display for Sunday {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(DATE_FORMAT))
    }
}

// --- Week arithmetic ---

pub fn sunday_for_date(date: NaiveDate) -> Sunday {
    Sunday::containing(date)
}

pub fn week_dates_for_sunday(sunday: Sunday) -> [NaiveDate; 7] {
    sunday.week_dates()
}

pub fn previous_sunday(sunday: Sunday) -> Sunday {
    sunday.previous()
}

pub fn next_sunday(sunday: Sunday) -> Sunday {
    sunday.next()
}

/// Every Sunday whose date lies in `year`, ascending. Starts at the first
/// Sunday on or after January 1st, never one from the year before.
pub fn sundays_for_year(year: i32) -> Vec<Sunday> {
    let Some(jan_first) = NaiveDate::from_ymd_opt(year, 1, 1) else {
        return Vec::new();
    };
    let lead = (7 - jan_first.weekday().num_days_from_sunday()) % 7;
    let mut current = jan_first.checked_add_days(Days::new(lead as u64));

    let mut sundays = Vec::with_capacity(53);
    while let Some(date) = current.filter(|d| d.year() == year) {
        sundays.push(Sunday(date));
        current = date.checked_add_days(Days::new(7));
    }
    sundays
}

pub fn is_current_week(sunday: Sunday, clock: &dyn Clock) -> bool {
    sunday == sunday_for_date(clock.today())
}

// --- Parsing / formatting ---

/// Strict `YYYY-MM-DD` parsing. chrono on its own also accepts unpadded
/// fields; dates are used as lookup keys, so only the padded form is valid.
pub fn parse_calendar_date(raw: &str) -> Result<NaiveDate, CalendarError> {
    let trimmed = raw.trim();
    let bytes = trimmed.as_bytes();
    let well_shaped = bytes.len() == 10
        && bytes[4] == b'-'
        && bytes[7] == b'-'
        && bytes
            .iter()
            .enumerate()
            .all(|(i, b)| i == 4 || i == 7 || b.is_ascii_digit());
    if !well_shaped {
        return Err(CalendarError::MalformedDate(raw.to_string()));
    }
    NaiveDate::parse_from_str(trimmed, DATE_FORMAT)
        .map_err(|_| CalendarError::MalformedDate(raw.to_string()))
}

pub fn format_calendar_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

/// Display form used by report tables: the normalized date, or "-" when
/// the stored value cannot be read as a date.
pub fn display_date_or_dash(raw: &str) -> String {
    parse_calendar_date(raw)
        .map(format_calendar_date)
        .unwrap_or_else(|_| "-".to_string())
}

// --- Clock ---

pub trait Clock: Send + Sync {
    /// Today's date in local calendar terms.
    fn today(&self) -> NaiveDate;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn today(&self) -> NaiveDate {
        Local::now().date_naive()
    }
}

/// A clock pinned to a settable date, shared between clones.
#[derive(Debug, Clone)]
pub struct FixedClock {
    today: Arc<Mutex<NaiveDate>>,
}

impl FixedClock {
    pub fn new(today: NaiveDate) -> Self {
        Self {
            today: Arc::new(Mutex::new(today)),
        }
    }

    pub fn set(&self, today: NaiveDate) {
        *self.today.lock().unwrap_or_else(PoisonError::into_inner) = today;
    }
}

impl Clock for FixedClock {
    fn today(&self) -> NaiveDate {
        *self.today.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
