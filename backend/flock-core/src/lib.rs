// src/lib.rs
pub mod attendance_book;
pub mod backend_client;
pub mod bulk_import;
pub mod calendar;
pub mod config;
pub mod department;
pub mod error;
pub mod handlers;
pub mod models;
pub mod report;
pub mod snapshot;
pub mod sync;

#[cfg(test)]
mod calendar_tests;

pub use attendance_book::{AttendanceBook, BookError, ChangeEvent};
pub use calendar::{
    is_current_week, next_sunday, previous_sunday, sunday_for_date, sundays_for_year,
    week_dates_for_sunday, Clock, FixedClock, Sunday, SystemClock,
};
pub use department::{departments_match, resolve_department_alias, DepartmentAliases};
pub use error::AppError;
pub use report::attendance_rate;
