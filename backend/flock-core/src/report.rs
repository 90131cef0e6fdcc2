// src/report.rs
use serde::Serialize;

use crate::calendar::{sundays_for_year, Sunday};
use crate::models::{AttendanceMember, RecordIndex};

/// Percentage of `members` marked present on `sunday`, rounded to the
/// nearest integer.
///
/// The denominator is every member passed in, not just the ones with a
/// record: a member nobody checked counts as absent, so an unfinished
/// check-in shows up as a lower rate. An empty department yields 0.
pub fn attendance_rate(records: &RecordIndex, members: &[AttendanceMember], sunday: Sunday) -> u8 {
    rate_of(count_attended(records, members, sunday), members.len())
}

fn count_attended(records: &RecordIndex, members: &[AttendanceMember], sunday: Sunday) -> usize {
    members
        .iter()
        .filter(|m| {
            records
                .get(&(m.id.clone(), sunday.date()))
                .is_some_and(|r| r.attended)
        })
        .count()
}

fn rate_of(attended: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    let percent = (attended as f64 / total as f64 * 100.0).round();
    percent.clamp(0.0, 100.0) as u8
}

// --- Weekly summary ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WeekSummary {
    pub department: String,
    pub sunday: Sunday,
    pub total_members: usize,
    /// Members with any record on the Sunday, present or not.
    pub checked_in: usize,
    pub attended: usize,
    pub absent: usize,
    pub unchecked: usize,
    pub rate: u8,
    pub finalized: bool,
}

pub fn summarize_week(
    records: &RecordIndex,
    members: &[AttendanceMember],
    department: &str,
    sunday: Sunday,
    finalized: bool,
) -> WeekSummary {
    let mut checked_in = 0;
    let mut attended = 0;
    for member in members {
        if let Some(record) = records.get(&(member.id.clone(), sunday.date())) {
            checked_in += 1;
            if record.attended {
                attended += 1;
            }
        }
    }

    WeekSummary {
        department: department.to_string(),
        sunday,
        total_members: members.len(),
        checked_in,
        attended,
        absent: checked_in - attended,
        unchecked: members.len() - checked_in,
        rate: rate_of(attended, members.len()),
        finalized,
    }
}

// --- Yearly report ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct YearlyRow {
    pub sunday: Sunday,
    pub attended: usize,
    pub checked_in: usize,
    pub total_members: usize,
    pub rate: u8,
    pub finalized: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct YearlyReport {
    pub department: String,
    pub year: i32,
    pub rows: Vec<YearlyRow>,
    /// Mean rate over Sundays that have at least one check-in.
    pub average_rate: u8,
}

pub fn yearly_report(
    records: &RecordIndex,
    members: &[AttendanceMember],
    department: &str,
    year: i32,
    is_finalized: impl Fn(Sunday) -> bool,
) -> YearlyReport {
    let rows: Vec<YearlyRow> = sundays_for_year(year)
        .into_iter()
        .map(|sunday| {
            let week = summarize_week(records, members, department, sunday, is_finalized(sunday));
            YearlyRow {
                sunday,
                attended: week.attended,
                checked_in: week.checked_in,
                total_members: week.total_members,
                rate: week.rate,
                finalized: week.finalized,
            }
        })
        .collect();

    let counted: Vec<u32> = rows
        .iter()
        .filter(|row| row.checked_in > 0)
        .map(|row| u32::from(row.rate))
        .collect();
    let average_rate = if counted.is_empty() {
        0
    } else {
        (counted.iter().sum::<u32>() as f64 / counted.len() as f64).round() as u8
    };

    YearlyReport {
        department: department.to_string(),
        year,
        rows,
        average_rate,
    }
}
