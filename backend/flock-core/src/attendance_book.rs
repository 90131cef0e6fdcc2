// src/attendance_book.rs
use chrono::{NaiveDate, Utc};
use rand::{distributions::Alphanumeric, thread_rng, Rng};
use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::calendar::{is_current_week, Clock, Sunday};
use crate::department::DepartmentAliases;
use crate::models::{
    Actor, AttendanceMember, AttendanceRecord, AttendanceReport, MemberId, MemberUpdate,
    NewMember, RecordIndex, Role,
};
use crate::report::{self, WeekSummary, YearlyReport};
use crate::snapshot::BookSnapshot;

const EVENT_CHANNEL_CAPACITY: usize = 256;

// --- Errors ---

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BookError {
    #[error("Member not found: {0}")]
    MemberNotFound(MemberId),
    #[error("User '{user}' ({role}) may not manage department '{department}'")]
    Forbidden {
        user: String,
        role: Role,
        department: String,
    },
    #[error("Attendance for '{department}' in the week of {sunday} is finalized")]
    WeekFinalized { department: String, sunday: Sunday },
    #[error("Report for '{department}' in the week of {sunday} is already finalized")]
    AlreadyFinalized { department: String, sunday: Sunday },
    #[error("No finalized report for '{department}' in the week of {sunday}")]
    ReportNotFound { department: String, sunday: Sunday },
    #[error("Invalid member data: {0}")]
    InvalidMember(String),
}

// --- Change events ---

/// Published after every successful mutation. Bulk loads (`restore`,
/// `merge_pulled`) do not publish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeEvent {
    MemberUpserted(AttendanceMember),
    MemberDeleted { member_id: MemberId },
    RecordUpserted(AttendanceRecord),
    ReportFinalized(AttendanceReport),
    ReportReopened { department: String, sunday: Sunday },
}

// --- View models ---

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeekRow {
    pub member: AttendanceMember,
    /// `None` when nobody has checked this member yet.
    pub attended: Option<bool>,
    pub status_note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeekSheet {
    pub department: String,
    pub sunday: Sunday,
    pub dates: [NaiveDate; 7],
    pub previous: Sunday,
    pub next: Sunday,
    pub is_current_week: bool,
    pub rows: Vec<WeekRow>,
    pub summary: WeekSummary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusEntry {
    pub member_id: MemberId,
    pub member_name: String,
    pub date: NaiveDate,
    pub attended: bool,
    pub note: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub created: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BookCounts {
    pub members: usize,
    pub records: usize,
    pub reports: usize,
}

type ReportKey = (String, Sunday);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn generate_member_id() -> MemberId {
    let suffix: String = thread_rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect();
    format!("m-{}", suffix.to_lowercase())
}

// --- Attendance Book ---

/// Working copy of the attendance tables. Clones share the same state.
///
/// Locks are taken in the order members, records, reports, outbox and are
/// never held across an `.await`. Mutations publish while still holding the
/// table lock they changed, so a pull merged under all locks sees either
/// both the row and its outbox entry or neither.
#[derive(Clone)]
pub struct AttendanceBook {
    clock: Arc<dyn Clock>,
    aliases: Arc<DepartmentAliases>,
    members: Arc<Mutex<HashMap<MemberId, AttendanceMember>>>,
    records: Arc<Mutex<RecordIndex>>,
    reports: Arc<Mutex<HashMap<ReportKey, AttendanceReport>>>,
    /// Changes not yet acknowledged by the backend, oldest first.
    outbox: Arc<Mutex<VecDeque<ChangeEvent>>>,
    track_outbox: Arc<AtomicBool>,
    events: broadcast::Sender<ChangeEvent>,
}

impl AttendanceBook {
    pub fn new(clock: Arc<dyn Clock>, aliases: DepartmentAliases) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            clock,
            aliases: Arc::new(aliases),
            members: Arc::new(Mutex::new(HashMap::new())),
            records: Arc::new(Mutex::new(HashMap::new())),
            reports: Arc::new(Mutex::new(HashMap::new())),
            outbox: Arc::new(Mutex::new(VecDeque::new())),
            track_outbox: Arc::new(AtomicBool::new(false)),
            events,
        }
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn aliases(&self) -> &DepartmentAliases {
        &self.aliases
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.events.subscribe()
    }

    /// Callers hold the lock of the table they changed.
    fn publish(&self, event: ChangeEvent) {
        debug!("Publishing change event: {:?}", event);
        if self.track_outbox.load(Ordering::SeqCst) {
            lock(&self.outbox).push_back(event.clone());
        }
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn authorize(&self, actor: &Actor, department: &str) -> Result<(), BookError> {
        if actor.can_manage(department, &self.aliases) {
            Ok(())
        } else {
            warn!(
                "Denied: user {} ({}) attempted to manage department {}",
                actor.user_id, actor.role, department
            );
            Err(BookError::Forbidden {
                user: actor.user_id.clone(),
                role: actor.role,
                department: department.to_string(),
            })
        }
    }

    fn report_key(&self, department: &str, sunday: Sunday) -> ReportKey {
        (self.aliases.resolve(department).to_string(), sunday)
    }

    // --- Members ---

    pub fn member(&self, member_id: &str) -> Option<AttendanceMember> {
        lock(&self.members).get(member_id).cloned()
    }

    fn require_member(&self, member_id: &str) -> Result<AttendanceMember, BookError> {
        self.member(member_id)
            .ok_or_else(|| BookError::MemberNotFound(member_id.to_string()))
    }

    fn build_member(new_member: NewMember) -> Result<AttendanceMember, BookError> {
        let name = new_member.name.trim();
        if name.is_empty() {
            return Err(BookError::InvalidMember("name must not be empty".to_string()));
        }
        let department = new_member.department.trim();
        if department.is_empty() {
            return Err(BookError::InvalidMember(format!(
                "department must not be empty for '{}'",
                name
            )));
        }
        let id = new_member
            .id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(generate_member_id);

        Ok(AttendanceMember {
            id,
            name: name.to_string(),
            gender: new_member.gender,
            birth_date: new_member.birth_date,
            department: department.to_string(),
            active: true,
            created_at: Utc::now(),
        })
    }

    pub fn register_member(
        &self,
        actor: &Actor,
        new_member: NewMember,
    ) -> Result<AttendanceMember, BookError> {
        let member = Self::build_member(new_member)?;
        self.authorize(actor, &member.department)?;

        {
            let mut members = lock(&self.members);
            if members.contains_key(&member.id) {
                return Err(BookError::InvalidMember(format!(
                    "member id '{}' already exists",
                    member.id
                )));
            }
            members.insert(member.id.clone(), member.clone());
            self.publish(ChangeEvent::MemberUpserted(member.clone()));
        }
        info!(
            "Registered member {} ({}) in {}",
            member.name, member.id, member.department
        );
        Ok(member)
    }

    pub fn update_member(
        &self,
        actor: &Actor,
        member_id: &str,
        update: MemberUpdate,
    ) -> Result<AttendanceMember, BookError> {
        let mut member = self.require_member(member_id)?;
        self.authorize(actor, &member.department)?;

        if let Some(name) = update.name {
            let name = name.trim();
            if name.is_empty() {
                return Err(BookError::InvalidMember("name must not be empty".to_string()));
            }
            member.name = name.to_string();
        }
        if let Some(department) = update.department {
            let department = department.trim();
            if department.is_empty() {
                return Err(BookError::InvalidMember(
                    "department must not be empty".to_string(),
                ));
            }
            self.authorize(actor, department)?;
            member.department = department.to_string();
        }
        if update.gender.is_some() {
            member.gender = update.gender;
        }
        if update.birth_date.is_some() {
            member.birth_date = update.birth_date;
        }

        self.store_member(member)
    }

    fn store_member(&self, member: AttendanceMember) -> Result<AttendanceMember, BookError> {
        {
            let mut members = lock(&self.members);
            let slot = members
                .get_mut(&member.id)
                .ok_or_else(|| BookError::MemberNotFound(member.id.clone()))?;
            *slot = member.clone();
            self.publish(ChangeEvent::MemberUpserted(member.clone()));
        }
        info!("Updated member {} ({})", member.name, member.id);
        Ok(member)
    }

    fn set_member_active(
        &self,
        actor: &Actor,
        member_id: &str,
        active: bool,
    ) -> Result<AttendanceMember, BookError> {
        let mut member = self.require_member(member_id)?;
        self.authorize(actor, &member.department)?;
        member.active = active;
        self.store_member(member)
    }

    /// Hides the member from active views; history stays linked.
    pub fn deactivate_member(
        &self,
        actor: &Actor,
        member_id: &str,
    ) -> Result<AttendanceMember, BookError> {
        self.set_member_active(actor, member_id, false)
    }

    pub fn reactivate_member(
        &self,
        actor: &Actor,
        member_id: &str,
    ) -> Result<AttendanceMember, BookError> {
        self.set_member_active(actor, member_id, true)
    }

    /// Removes the member and every attendance record that refers to it.
    pub fn delete_member(
        &self,
        actor: &Actor,
        member_id: &str,
    ) -> Result<AttendanceMember, BookError> {
        let member = self.require_member(member_id)?;
        self.authorize(actor, &member.department)?;

        let removed_records = {
            let mut members = lock(&self.members);
            let mut records = lock(&self.records);
            members.remove(member_id);
            let before = records.len();
            records.retain(|(id, _), _| id != member_id);
            self.publish(ChangeEvent::MemberDeleted {
                member_id: member_id.to_string(),
            });
            before - records.len()
        };
        info!(
            "Deleted member {} ({}) and {} attendance records",
            member.name, member.id, removed_records
        );
        Ok(member)
    }

    /// Adds members in bulk. Ids that already exist are skipped, which makes
    /// re-importing the same file harmless.
    pub fn import_members(
        &self,
        actor: &Actor,
        new_members: Vec<NewMember>,
    ) -> Result<ImportSummary, BookError> {
        let built = new_members
            .into_iter()
            .map(Self::build_member)
            .collect::<Result<Vec<_>, _>>()?;
        for member in &built {
            self.authorize(actor, &member.department)?;
        }

        let mut created = 0;
        let mut skipped = 0;
        {
            let mut members = lock(&self.members);
            for member in built {
                if members.contains_key(&member.id) {
                    skipped += 1;
                    continue;
                }
                members.insert(member.id.clone(), member.clone());
                self.publish(ChangeEvent::MemberUpserted(member));
                created += 1;
            }
        }
        info!(
            "Imported {} members ({} skipped as duplicates)",
            created, skipped
        );
        Ok(ImportSummary { created, skipped })
    }

    /// Members whose department matches under alias resolution, by name.
    pub fn members_in_department(
        &self,
        department: &str,
        include_inactive: bool,
    ) -> Vec<AttendanceMember> {
        let mut found: Vec<AttendanceMember> = lock(&self.members)
            .values()
            .filter(|m| include_inactive || m.active)
            .filter(|m| self.aliases.matches(&m.department, department))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        found
    }

    // --- Attendance records ---

    fn upsert_record(
        &self,
        actor: &Actor,
        member_id: &str,
        date: NaiveDate,
        apply: impl FnOnce(&mut AttendanceRecord),
    ) -> Result<AttendanceRecord, BookError> {
        let member = self.require_member(member_id)?;
        self.authorize(actor, &member.department)?;
        let key = self.report_key(&member.department, Sunday::containing(date));

        let record = {
            let mut records = lock(&self.records);
            if lock(&self.reports).contains_key(&key) {
                let (department, sunday) = key;
                warn!(
                    "Rejected edit for member {} on {}: week of {} is finalized for {}",
                    member_id, date, sunday, department
                );
                return Err(BookError::WeekFinalized { department, sunday });
            }
            let entry = records
                .entry((member_id.to_string(), date))
                .or_insert_with(|| AttendanceRecord {
                    member_id: member_id.to_string(),
                    date,
                    attended: false,
                    status_note: None,
                    updated_at: Utc::now(),
                });
            apply(entry);
            entry.updated_at = Utc::now();
            let record = entry.clone();
            self.publish(ChangeEvent::RecordUpserted(record.clone()));
            record
        };
        info!(
            "Attendance for {} on {}: attended={}, note={}",
            member_id,
            date,
            record.attended,
            record.status_note.is_some()
        );
        Ok(record)
    }

    /// Flips the attended flag. A first touch marks the member present.
    pub fn toggle_attendance(
        &self,
        actor: &Actor,
        member_id: &str,
        date: NaiveDate,
    ) -> Result<AttendanceRecord, BookError> {
        self.upsert_record(actor, member_id, date, |record| {
            record.attended = !record.attended
        })
    }

    pub fn set_attendance(
        &self,
        actor: &Actor,
        member_id: &str,
        date: NaiveDate,
        attended: bool,
    ) -> Result<AttendanceRecord, BookError> {
        self.upsert_record(actor, member_id, date, |record| record.attended = attended)
    }

    /// Sets or clears the status / prayer note without touching `attended`.
    pub fn set_status_note(
        &self,
        actor: &Actor,
        member_id: &str,
        date: NaiveDate,
        note: Option<String>,
    ) -> Result<AttendanceRecord, BookError> {
        let note = note
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty());
        self.upsert_record(actor, member_id, date, |record| record.status_note = note)
    }

    pub fn record(&self, member_id: &str, date: NaiveDate) -> Option<AttendanceRecord> {
        lock(&self.records)
            .get(&(member_id.to_string(), date))
            .cloned()
    }

    // --- Views ---

    pub fn week_summary(&self, department: &str, sunday: Sunday) -> WeekSummary {
        let members = self.members_in_department(department, false);
        let finalized = self.is_finalized(department, sunday);
        let records = lock(&self.records);
        report::summarize_week(
            &records,
            &members,
            self.aliases.resolve(department),
            sunday,
            finalized,
        )
    }

    pub fn week_sheet(&self, department: &str, sunday: Sunday) -> WeekSheet {
        let members = self.members_in_department(department, false);
        let finalized = self.is_finalized(department, sunday);
        let resolved = self.aliases.resolve(department).to_string();

        let records = lock(&self.records);
        let summary = report::summarize_week(&records, &members, &resolved, sunday, finalized);
        let rows = members
            .into_iter()
            .map(|member| {
                let record = records.get(&(member.id.clone(), sunday.date()));
                WeekRow {
                    attended: record.map(|r| r.attended),
                    status_note: record.and_then(|r| r.status_note.clone()),
                    member,
                }
            })
            .collect();
        drop(records);

        WeekSheet {
            department: resolved,
            sunday,
            dates: sunday.week_dates(),
            previous: sunday.previous(),
            next: sunday.next(),
            is_current_week: is_current_week(sunday, self.clock.as_ref()),
            rows,
            summary,
        }
    }

    /// Status and prayer notes written during the week, including those of
    /// members deactivated since.
    pub fn status_log(&self, department: &str, sunday: Sunday) -> Vec<StatusEntry> {
        let members = self.members_in_department(department, true);
        let guard = lock(&self.records);
        let records: &RecordIndex = &guard;
        let mut entries: Vec<StatusEntry> = members
            .iter()
            .flat_map(|member| {
                sunday.week_dates().into_iter().filter_map(move |date| {
                    let record = records.get(&(member.id.clone(), date))?;
                    let note = record.status_note.clone()?;
                    Some(StatusEntry {
                        member_id: member.id.clone(),
                        member_name: member.name.clone(),
                        date,
                        attended: record.attended,
                        note,
                    })
                })
            })
            .collect();
        entries.sort_by(|a, b| {
            a.date
                .cmp(&b.date)
                .then_with(|| a.member_name.cmp(&b.member_name))
        });
        entries
    }

    /// Every note recorded for the member, newest first.
    pub fn member_notes(&self, member_id: &str) -> Result<Vec<AttendanceRecord>, BookError> {
        self.require_member(member_id)?;
        let mut notes: Vec<AttendanceRecord> = lock(&self.records)
            .values()
            .filter(|r| r.member_id == member_id && r.status_note.is_some())
            .cloned()
            .collect();
        notes.sort_by(|a, b| b.date.cmp(&a.date));
        Ok(notes)
    }

    pub fn yearly_report(&self, department: &str, year: i32) -> YearlyReport {
        let members = self.members_in_department(department, false);
        let resolved = self.aliases.resolve(department).to_string();
        let finalized: Vec<Sunday> = lock(&self.reports)
            .keys()
            .filter(|(dept, _)| *dept == resolved)
            .map(|(_, sunday)| *sunday)
            .collect();
        let records = lock(&self.records);
        report::yearly_report(&records, &members, &resolved, year, |sunday| {
            finalized.contains(&sunday)
        })
    }

    // --- Finalization ---

    pub fn is_finalized(&self, department: &str, sunday: Sunday) -> bool {
        lock(&self.reports).contains_key(&self.report_key(department, sunday))
    }

    pub fn report(&self, department: &str, sunday: Sunday) -> Option<AttendanceReport> {
        lock(&self.reports)
            .get(&self.report_key(department, sunday))
            .cloned()
    }

    pub fn finalize_report(
        &self,
        actor: &Actor,
        department: &str,
        sunday: Sunday,
    ) -> Result<AttendanceReport, BookError> {
        self.authorize(actor, department)?;
        let key = self.report_key(department, sunday);

        let report = {
            let mut reports = lock(&self.reports);
            if reports.contains_key(&key) {
                let (department, sunday) = key;
                return Err(BookError::AlreadyFinalized { department, sunday });
            }
            let report = AttendanceReport {
                department: key.0.clone(),
                sunday,
                submitted_by: Some(actor.user_id.clone()),
                submitted_at: Utc::now(),
            };
            reports.insert(key, report.clone());
            self.publish(ChangeEvent::ReportFinalized(report.clone()));
            report
        };
        info!(
            "Finalized attendance for {} in the week of {} by {}",
            report.department, sunday, actor.user_id
        );
        Ok(report)
    }

    /// Lifts a finalization so the week can be edited again. Admins only.
    pub fn reopen_report(
        &self,
        actor: &Actor,
        department: &str,
        sunday: Sunday,
    ) -> Result<AttendanceReport, BookError> {
        let (resolved, _) = self.report_key(department, sunday);
        if !actor.is_admin() {
            warn!(
                "Denied: user {} ({}) attempted to reopen {} for {}",
                actor.user_id, actor.role, resolved, sunday
            );
            return Err(BookError::Forbidden {
                user: actor.user_id.clone(),
                role: actor.role,
                department: resolved,
            });
        }

        let report = {
            let mut reports = lock(&self.reports);
            let report = reports
                .remove(&(resolved.clone(), sunday))
                .ok_or_else(|| BookError::ReportNotFound {
                    department: resolved.clone(),
                    sunday,
                })?;
            self.publish(ChangeEvent::ReportReopened {
                department: resolved.clone(),
                sunday,
            });
            report
        };
        info!(
            "Reopened attendance for {} in the week of {} by {}",
            resolved, sunday, actor.user_id
        );
        Ok(report)
    }

    // --- Bulk state ---

    pub fn counts(&self) -> BookCounts {
        BookCounts {
            members: lock(&self.members).len(),
            records: lock(&self.records).len(),
            reports: lock(&self.reports).len(),
        }
    }

    pub fn snapshot(&self) -> BookSnapshot {
        let members = {
            let mut members: Vec<AttendanceMember> = lock(&self.members).values().cloned().collect();
            members.sort_by(|a, b| a.id.cmp(&b.id));
            members
        };
        let records = {
            let mut records: Vec<AttendanceRecord> = lock(&self.records).values().cloned().collect();
            records.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.member_id.cmp(&b.member_id)));
            records
        };
        let reports = {
            let mut reports: Vec<AttendanceReport> = lock(&self.reports).values().cloned().collect();
            reports.sort_by(|a, b| a.sunday.cmp(&b.sunday).then_with(|| a.department.cmp(&b.department)));
            reports
        };
        let pending = lock(&self.outbox).iter().cloned().collect();
        BookSnapshot {
            members,
            records,
            reports,
            pending,
        }
    }

    fn index_snapshot(&self, snapshot: BookSnapshot) -> Tables {
        let members = snapshot
            .members
            .into_iter()
            .map(|m| (m.id.clone(), m))
            .collect();
        let records = snapshot
            .records
            .into_iter()
            .map(|r| (r.key(), r))
            .collect();
        let reports = snapshot
            .reports
            .into_iter()
            .map(|report| self.keyed_report(report))
            .collect();
        Tables {
            members,
            records,
            reports,
        }
    }

    fn keyed_report(&self, mut report: AttendanceReport) -> (ReportKey, AttendanceReport) {
        report.department = self.aliases.resolve(&report.department).to_string();
        (report_key_of(&report), report)
    }

    /// Replaces the whole working copy, unpushed changes included. Does not
    /// publish change events.
    pub fn restore(&self, snapshot: BookSnapshot) {
        let pending: VecDeque<ChangeEvent> = snapshot.pending.iter().cloned().collect();
        let tables = self.index_snapshot(snapshot);
        info!(
            "Restoring attendance book: {} members, {} records, {} reports, {} unpushed changes",
            tables.members.len(),
            tables.records.len(),
            tables.reports.len(),
            pending.len()
        );
        let mut members = lock(&self.members);
        let mut records = lock(&self.records);
        let mut reports = lock(&self.reports);
        let mut outbox = lock(&self.outbox);
        *members = tables.members;
        *records = tables.records;
        *reports = tables.reports;
        *outbox = pending;
    }

    /// Takes a pulled copy of the backend tables, then replays every change
    /// the backend has not acknowledged yet on top of it.
    pub fn merge_pulled(&self, remote: BookSnapshot) {
        let mut tables = self.index_snapshot(remote);

        let mut members = lock(&self.members);
        let mut records = lock(&self.records);
        let mut reports = lock(&self.reports);
        let outbox = lock(&self.outbox);
        for event in outbox.iter() {
            self.replay(&mut tables, event);
        }
        info!(
            "Merged backend pull: {} members, {} records, {} reports, {} local changes replayed",
            tables.members.len(),
            tables.records.len(),
            tables.reports.len(),
            outbox.len()
        );
        *members = tables.members;
        *records = tables.records;
        *reports = tables.reports;
    }

    fn replay(&self, tables: &mut Tables, event: &ChangeEvent) {
        match event {
            ChangeEvent::MemberUpserted(member) => {
                tables.members.insert(member.id.clone(), member.clone());
            }
            ChangeEvent::MemberDeleted { member_id } => {
                tables.members.remove(member_id);
                tables.records.retain(|(id, _), _| id != member_id);
            }
            ChangeEvent::RecordUpserted(record) => {
                tables.records.insert(record.key(), record.clone());
            }
            ChangeEvent::ReportFinalized(report) => {
                let (key, report) = self.keyed_report(report.clone());
                tables.reports.insert(key, report);
            }
            ChangeEvent::ReportReopened { department, sunday } => {
                tables.reports.remove(&self.report_key(department, *sunday));
            }
        }
    }

    // --- Backend outbox ---

    /// From now on every published change also waits in the outbox until
    /// `mark_pushed` acknowledges it.
    pub fn track_unpushed_changes(&self) {
        self.track_outbox.store(true, Ordering::SeqCst);
    }

    pub fn unpushed_changes(&self) -> usize {
        lock(&self.outbox).len()
    }

    /// Oldest change the backend has not acknowledged.
    pub fn next_unpushed(&self) -> Option<ChangeEvent> {
        lock(&self.outbox).front().cloned()
    }

    /// Drops `event` from the front of the outbox once the backend has it.
    pub fn mark_pushed(&self, event: &ChangeEvent) -> bool {
        let mut outbox = lock(&self.outbox);
        if outbox.front() == Some(event) {
            outbox.pop_front();
            true
        } else {
            false
        }
    }
}

struct Tables {
    members: HashMap<MemberId, AttendanceMember>,
    records: RecordIndex,
    reports: HashMap<ReportKey, AttendanceReport>,
}

fn report_key_of(report: &AttendanceReport) -> ReportKey {
    (report.department.clone(), report.sunday)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::FixedClock;
    use tokio::sync::broadcast::error::TryRecvError;

    fn d(date_str: &str) -> NaiveDate {
        NaiveDate::parse_from_str(date_str, "%Y-%m-%d")
            .unwrap_or_else(|_| panic!("Invalid date string format: {}", date_str))
    }

    fn s(date_str: &str) -> Sunday {
        Sunday::try_from(d(date_str)).unwrap()
    }

    fn new_member(id: &str, name: &str, department: &str) -> NewMember {
        NewMember {
            id: Some(id.to_string()),
            name: name.to_string(),
            department: department.to_string(),
            ..Default::default()
        }
    }

    // --- Test Setup ---
    fn setup_test_environment() -> (AttendanceBook, FixedClock, Actor) {
        let clock = FixedClock::new(d("2024-03-14"));
        let book = AttendanceBook::new(Arc::new(clock.clone()), DepartmentAliases::builtin());
        let admin = Actor::admin("admin");

        book.register_member(&admin, new_member("k1", "김하늘", "아동부"))
            .unwrap();
        book.register_member(&admin, new_member("k2", "박바다", "유치부"))
            .unwrap();
        book.register_member(&admin, new_member("y1", "이청년", "청년부"))
            .unwrap();
        (book, clock, admin)
    }

    #[test]
    fn department_listing_matches_both_spellings() {
        let (book, _, _) = setup_test_environment();
        let by_legacy: Vec<String> = book
            .members_in_department("아동부", false)
            .into_iter()
            .map(|m| m.id)
            .collect();
        let by_display: Vec<String> = book
            .members_in_department("유치부", false)
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(by_legacy, vec!["k1", "k2"]);
        assert_eq!(by_display, by_legacy);
    }

    #[test]
    fn toggle_marks_present_then_absent() {
        let (book, _, admin) = setup_test_environment();
        let first = book.toggle_attendance(&admin, "k1", d("2024-03-10")).unwrap();
        assert!(first.attended);
        let second = book.toggle_attendance(&admin, "k1", d("2024-03-10")).unwrap();
        assert!(!second.attended);
    }

    #[test]
    fn note_only_record_is_absent_and_note_survives_toggle() {
        let (book, _, admin) = setup_test_environment();
        let record = book
            .set_status_note(&admin, "k2", d("2024-03-10"), Some(" 수술 후 회복 중 ".to_string()))
            .unwrap();
        assert!(!record.attended);
        assert_eq!(record.status_note.as_deref(), Some("수술 후 회복 중"));

        let toggled = book.toggle_attendance(&admin, "k2", d("2024-03-10")).unwrap();
        assert!(toggled.attended);
        assert_eq!(toggled.status_note.as_deref(), Some("수술 후 회복 중"));

        let cleared = book
            .set_status_note(&admin, "k2", d("2024-03-10"), Some("   ".to_string()))
            .unwrap();
        assert_eq!(cleared.status_note, None);
        assert!(cleared.attended);
    }

    #[test]
    fn manager_can_only_touch_own_department() {
        let (book, _, _) = setup_test_environment();
        let manager = Actor::manager("mgr", "유치부");
        assert!(book.toggle_attendance(&manager, "k1", d("2024-03-10")).is_ok());
        let err = book
            .toggle_attendance(&manager, "y1", d("2024-03-10"))
            .unwrap_err();
        assert!(matches!(err, BookError::Forbidden { .. }));

        let member = Actor::member("someone");
        assert!(matches!(
            book.toggle_attendance(&member, "k1", d("2024-03-10")),
            Err(BookError::Forbidden { .. })
        ));
    }

    #[test]
    fn finalized_week_blocks_edits_until_reopened() {
        let (book, _, admin) = setup_test_environment();
        let manager = Actor::manager("mgr", "아동부");
        book.finalize_report(&manager, "유치부", s("2024-03-10"))
            .unwrap();
        assert!(book.is_finalized("아동부", s("2024-03-10")));

        // Any day of the finalized week is locked, for admins too.
        let err = book
            .toggle_attendance(&admin, "k1", d("2024-03-13"))
            .unwrap_err();
        assert_eq!(
            err,
            BookError::WeekFinalized {
                department: "유치부".to_string(),
                sunday: s("2024-03-10"),
            }
        );
        // Other departments and other weeks are unaffected.
        assert!(book.toggle_attendance(&admin, "y1", d("2024-03-10")).is_ok());
        assert!(book.toggle_attendance(&admin, "k1", d("2024-03-17")).is_ok());

        assert!(matches!(
            book.finalize_report(&admin, "아동부", s("2024-03-10")),
            Err(BookError::AlreadyFinalized { .. })
        ));
        assert!(matches!(
            book.reopen_report(&manager, "유치부", s("2024-03-10")),
            Err(BookError::Forbidden { .. })
        ));
        book.reopen_report(&admin, "유치부", s("2024-03-10")).unwrap();
        assert!(book.toggle_attendance(&admin, "k1", d("2024-03-13")).is_ok());
        assert!(matches!(
            book.reopen_report(&admin, "유치부", s("2024-03-10")),
            Err(BookError::ReportNotFound { .. })
        ));
    }

    #[test]
    fn week_sheet_reports_rows_and_summary() {
        let (book, _, admin) = setup_test_environment();
        book.set_attendance(&admin, "k1", d("2024-03-10"), true).unwrap();

        let sheet = book.week_sheet("아동부", s("2024-03-10"));
        assert_eq!(sheet.department, "유치부");
        assert_eq!(sheet.dates[0], d("2024-03-10"));
        assert_eq!(sheet.dates[6], d("2024-03-16"));
        assert_eq!(sheet.previous, s("2024-03-03"));
        assert_eq!(sheet.next, s("2024-03-17"));
        assert!(sheet.is_current_week);
        assert_eq!(sheet.rows.len(), 2);
        assert_eq!(sheet.rows[0].member.id, "k1");
        assert_eq!(sheet.rows[0].attended, Some(true));
        assert_eq!(sheet.rows[1].attended, None);
        assert_eq!(sheet.summary.rate, 50);
        assert_eq!(sheet.summary.unchecked, 1);
    }

    #[test]
    fn current_week_flag_follows_clock() {
        let (book, clock, _) = setup_test_environment();
        clock.set(d("2024-03-20"));
        assert!(!book.week_sheet("청년부", s("2024-03-10")).is_current_week);
        assert!(book.week_sheet("청년부", s("2024-03-17")).is_current_week);
    }

    #[test]
    fn deactivated_members_leave_active_views_but_keep_history() {
        let (book, _, admin) = setup_test_environment();
        book.set_status_note(&admin, "k2", d("2024-03-12"), Some("기도 부탁".to_string()))
            .unwrap();
        book.deactivate_member(&admin, "k2").unwrap();

        assert_eq!(book.members_in_department("유치부", false).len(), 1);
        assert_eq!(book.members_in_department("유치부", true).len(), 2);
        assert_eq!(book.week_summary("유치부", s("2024-03-10")).total_members, 1);

        let log = book.status_log("유치부", s("2024-03-10"));
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].member_name, "박바다");
        assert_eq!(log[0].note, "기도 부탁");

        book.reactivate_member(&admin, "k2").unwrap();
        assert_eq!(book.members_in_department("유치부", false).len(), 2);
    }

    #[test]
    fn delete_removes_member_and_records() {
        let (book, _, admin) = setup_test_environment();
        book.toggle_attendance(&admin, "k1", d("2024-03-10")).unwrap();
        book.toggle_attendance(&admin, "k1", d("2024-03-17")).unwrap();
        book.toggle_attendance(&admin, "k2", d("2024-03-10")).unwrap();

        book.delete_member(&admin, "k1").unwrap();
        assert!(book.member("k1").is_none());
        assert_eq!(book.counts().records, 1);
        assert_eq!(
            book.toggle_attendance(&admin, "k1", d("2024-03-10")),
            Err(BookError::MemberNotFound("k1".to_string()))
        );
    }

    #[test]
    fn update_member_checks_both_departments() {
        let (book, _, _) = setup_test_environment();
        let manager = Actor::manager("mgr", "유치부");
        let renamed = book
            .update_member(
                &manager,
                "k1",
                MemberUpdate {
                    name: Some("김하늘빛".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(renamed.name, "김하늘빛");
        assert_eq!(renamed.department, "아동부");

        let moved = book.update_member(
            &manager,
            "k1",
            MemberUpdate {
                department: Some("청년부".to_string()),
                ..Default::default()
            },
        );
        assert!(matches!(moved, Err(BookError::Forbidden { .. })));
    }

    #[test]
    fn register_rejects_blank_and_duplicate_members() {
        let (book, _, admin) = setup_test_environment();
        assert!(matches!(
            book.register_member(&admin, new_member("x", "  ", "청년부")),
            Err(BookError::InvalidMember(_))
        ));
        assert!(matches!(
            book.register_member(&admin, new_member("k1", "중복", "청년부")),
            Err(BookError::InvalidMember(_))
        ));
        let generated = book
            .register_member(
                &admin,
                NewMember {
                    name: "새신자".to_string(),
                    department: "청년부".to_string(),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(generated.id.starts_with("m-"));
    }

    #[test]
    fn import_skips_existing_ids() {
        let (book, _, admin) = setup_test_environment();
        let batch = vec![new_member("k1", "김하늘", "유치부"), new_member("n1", "새친구", "유치부")];
        assert_eq!(
            book.import_members(&admin, batch.clone()).unwrap(),
            ImportSummary { created: 1, skipped: 1 }
        );
        assert_eq!(
            book.import_members(&admin, batch).unwrap(),
            ImportSummary { created: 0, skipped: 2 }
        );
    }

    #[test]
    fn member_notes_are_newest_first() {
        let (book, _, admin) = setup_test_environment();
        book.set_status_note(&admin, "y1", d("2024-03-03"), Some("이직 준비".to_string()))
            .unwrap();
        book.set_status_note(&admin, "y1", d("2024-03-10"), Some("새 직장 적응".to_string()))
            .unwrap();
        book.toggle_attendance(&admin, "y1", d("2024-03-17")).unwrap();

        let notes = book.member_notes("y1").unwrap();
        let dates: Vec<NaiveDate> = notes.iter().map(|r| r.date).collect();
        assert_eq!(dates, vec![d("2024-03-10"), d("2024-03-03")]);
    }

    #[test]
    fn mutations_publish_change_events() {
        let (book, _, admin) = setup_test_environment();
        let mut events = book.subscribe();

        book.toggle_attendance(&admin, "y1", d("2024-03-10")).unwrap();
        book.finalize_report(&admin, "청년부", s("2024-03-10")).unwrap();

        assert!(matches!(events.try_recv(), Ok(ChangeEvent::RecordUpserted(r)) if r.member_id == "y1"));
        assert!(matches!(events.try_recv(), Ok(ChangeEvent::ReportFinalized(r)) if r.department == "청년부"));
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn snapshot_restores_into_fresh_book() {
        let (book, _, admin) = setup_test_environment();
        book.toggle_attendance(&admin, "k1", d("2024-03-10")).unwrap();
        book.finalize_report(&admin, "아동부", s("2024-03-10")).unwrap();

        let restored = AttendanceBook::new(
            Arc::new(FixedClock::new(d("2024-03-14"))),
            DepartmentAliases::builtin(),
        );
        let mut events = restored.subscribe();
        restored.restore(book.snapshot());

        assert_eq!(restored.counts(), book.counts());
        assert!(restored.is_finalized("유치부", s("2024-03-10")));
        assert_eq!(restored.record("k1", d("2024-03-10")), book.record("k1", d("2024-03-10")));
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn yearly_report_uses_resolved_department() {
        let (book, _, admin) = setup_test_environment();
        book.set_attendance(&admin, "k1", d("2024-01-07"), true).unwrap();
        book.set_attendance(&admin, "k2", d("2024-01-07"), false).unwrap();
        book.finalize_report(&admin, "아동부", s("2024-01-07")).unwrap();

        let report = book.yearly_report("아동부", 2024);
        assert_eq!(report.department, "유치부");
        assert_eq!(report.rows.len(), 52);
        assert_eq!(report.rows[0].rate, 50);
        assert!(report.rows[0].finalized);
        assert_eq!(report.average_rate, 50);
    }

    #[test]
    fn report_lookup_accepts_either_spelling() {
        let (book, _, admin) = setup_test_environment();
        assert!(book.report("유치부", s("2024-03-10")).is_none());
        book.finalize_report(&admin, "아동부", s("2024-03-10")).unwrap();

        let report = book.report("유치부", s("2024-03-10")).unwrap();
        assert_eq!(report.department, "유치부");
        assert_eq!(report.submitted_by.as_deref(), Some("admin"));
        assert_eq!(book.report("아동부", s("2024-03-10")), Some(report));
    }

    #[test]
    fn outbox_is_empty_until_tracking_starts() {
        let (book, _, admin) = setup_test_environment();
        assert_eq!(book.unpushed_changes(), 0);

        book.track_unpushed_changes();
        book.toggle_attendance(&admin, "k1", d("2024-03-10")).unwrap();
        book.delete_member(&admin, "y1").unwrap();
        assert_eq!(book.unpushed_changes(), 2);

        let first = book.next_unpushed().unwrap();
        assert!(matches!(&first, ChangeEvent::RecordUpserted(r) if r.member_id == "k1"));
        assert!(!book.mark_pushed(&ChangeEvent::MemberDeleted {
            member_id: "y1".to_string()
        }));
        assert!(book.mark_pushed(&first));
        assert!(matches!(
            book.next_unpushed(),
            Some(ChangeEvent::MemberDeleted { member_id }) if member_id == "y1"
        ));
    }

    #[test]
    fn merged_pull_keeps_unpushed_changes() {
        let (book, _, admin) = setup_test_environment();
        let remote = book.snapshot();
        book.track_unpushed_changes();

        book.toggle_attendance(&admin, "k1", d("2024-03-10")).unwrap();
        book.finalize_report(&admin, "아동부", s("2024-03-10")).unwrap();
        book.delete_member(&admin, "y1").unwrap();
        let mut events = book.subscribe();

        book.merge_pulled(remote);

        assert!(book.record("k1", d("2024-03-10")).unwrap().attended);
        assert!(book.is_finalized("유치부", s("2024-03-10")));
        assert!(book.member("y1").is_none());
        assert_eq!(book.unpushed_changes(), 3);
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn merged_pull_replays_a_reopen() {
        let (book, _, admin) = setup_test_environment();
        book.finalize_report(&admin, "유치부", s("2024-03-10")).unwrap();
        let remote = book.snapshot();
        book.track_unpushed_changes();
        book.reopen_report(&admin, "아동부", s("2024-03-10")).unwrap();

        book.merge_pulled(remote);
        assert!(!book.is_finalized("유치부", s("2024-03-10")));
        book.toggle_attendance(&admin, "k2", d("2024-03-10")).unwrap();
    }

    #[test]
    fn acknowledged_changes_give_way_to_the_pull() {
        let (book, _, admin) = setup_test_environment();
        let remote = book.snapshot();
        book.track_unpushed_changes();
        book.toggle_attendance(&admin, "k1", d("2024-03-10")).unwrap();
        while let Some(event) = book.next_unpushed() {
            book.mark_pushed(&event);
        }

        book.merge_pulled(remote);
        assert!(book.record("k1", d("2024-03-10")).is_none());
    }
}
