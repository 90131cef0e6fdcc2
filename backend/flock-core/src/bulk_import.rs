// src/bulk_import.rs
use chrono::NaiveDate;
use csv::{ReaderBuilder, StringRecord, Trim};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::io::Read;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::calendar::format_calendar_date;
use crate::department::DepartmentAliases;
use crate::models::{Gender, NewMember};

static SEPARATED_DATE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d{4})\s*[-./]\s*(\d{1,2})\s*[-./]\s*(\d{1,2})\.?$").expect("valid date regex")
});
static COMPACT_DATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{4})(\d{2})(\d{2})$").expect("valid date regex"));

#[derive(Error, Debug)]
pub enum ImportError {
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("CSV header has no name column (expected 'name' or '이름')")]
    MissingNameColumn,
}

/// A row that could not be turned into a member. `line` is 1-based and
/// counts the header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowProblem {
    pub line: u64,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ParsedImport {
    pub members: Vec<NewMember>,
    pub problems: Vec<RowProblem>,
}

#[derive(Debug, Default)]
struct Columns {
    name: Option<usize>,
    gender: Option<usize>,
    birth_date: Option<usize>,
    department: Option<usize>,
}

impl Columns {
    fn from_headers(headers: &StringRecord) -> Self {
        let mut columns = Columns::default();
        for (index, raw) in headers.iter().enumerate() {
            let header = raw.trim_start_matches('\u{feff}').trim().to_lowercase();
            match header.as_str() {
                "name" | "이름" | "성명" => columns.name = Some(index),
                "gender" | "sex" | "성별" => columns.gender = Some(index),
                "birth_date" | "birthdate" | "birthday" | "생년월일" | "생일" => {
                    columns.birth_date = Some(index)
                }
                "department" | "dept" | "부서" => columns.department = Some(index),
                other => debug!("Ignoring unknown import column '{}'", other),
            }
        }
        columns
    }
}

fn cell<'r>(record: &'r StringRecord, index: Option<usize>) -> Option<&'r str> {
    index
        .and_then(|i| record.get(i))
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// Accepts `YYYY-MM-DD`, `YYYY.MM.DD`, `YYYY/MM/DD` with one- or two-digit
/// month and day, and `YYYYMMDD`.
pub fn parse_birth_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    let captures = SEPARATED_DATE
        .captures(raw)
        .or_else(|| COMPACT_DATE.captures(raw))?;
    let year = captures[1].parse().ok()?;
    let month = captures[2].parse().ok()?;
    let day = captures[3].parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

/// Stable member id for an imported row: the same person in the same
/// department always gets the same key, whichever alias the file used.
pub fn import_key(name: &str, birth_date: Option<NaiveDate>, department: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.trim().as_bytes());
    hasher.update([0x1f]);
    hasher.update(birth_date.map(format_calendar_date).unwrap_or_default().as_bytes());
    hasher.update([0x1f]);
    hasher.update(department.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("imp-{}", &digest[..16])
}

/// Parses a member list. Row problems are collected, not fatal; only an
/// unreadable file or a header without a name column fails the import.
pub fn parse_members_csv<R: Read>(
    reader: R,
    default_department: Option<&str>,
    aliases: &DepartmentAliases,
) -> Result<ParsedImport, ImportError> {
    let mut csv_reader = ReaderBuilder::new()
        .trim(Trim::All)
        .flexible(true)
        .from_reader(reader);

    let columns = Columns::from_headers(csv_reader.headers()?);
    if columns.name.is_none() {
        return Err(ImportError::MissingNameColumn);
    }

    let mut parsed = ParsedImport::default();
    for result in csv_reader.records() {
        let record = result?;
        let line = record.position().map(|p| p.line()).unwrap_or_default();
        if record.iter().all(|value| value.trim().is_empty()) {
            continue;
        }
        match parse_row(&record, &columns, default_department, aliases) {
            Ok(member) => parsed.members.push(member),
            Err(message) => {
                warn!("Import line {}: {}", line, message);
                parsed.problems.push(RowProblem { line, message });
            }
        }
    }

    info!(
        "Parsed member import: {} rows accepted, {} rejected",
        parsed.members.len(),
        parsed.problems.len()
    );
    Ok(parsed)
}

fn parse_row(
    record: &StringRecord,
    columns: &Columns,
    default_department: Option<&str>,
    aliases: &DepartmentAliases,
) -> Result<NewMember, String> {
    let name = cell(record, columns.name).ok_or("missing name")?;

    let department = cell(record, columns.department)
        .or(default_department.map(str::trim).filter(|d| !d.is_empty()))
        .ok_or_else(|| format!("no department for '{}'", name))?;

    let gender = cell(record, columns.gender)
        .map(|raw| raw.parse::<Gender>())
        .transpose()?;

    let birth_date = match cell(record, columns.birth_date) {
        Some(raw) => Some(
            parse_birth_date(raw).ok_or_else(|| format!("unreadable birth date '{}'", raw))?,
        ),
        None => None,
    };

    Ok(NewMember {
        id: Some(import_key(name, birth_date, aliases.resolve(department))),
        name: name.to_string(),
        gender,
        birth_date,
        department: department.to_string(),
    })
}
