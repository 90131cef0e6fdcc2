// src/handlers.rs
use axum::{
    extract::{FromRequestParts, Path, Query, State},
    http::{request::Parts, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, patch, post, put},
    Json, Router,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::attendance_book::{AttendanceBook, BookError, StatusEntry, WeekSheet};
use crate::bulk_import::{parse_members_csv, RowProblem};
use crate::calendar::{
    format_calendar_date, is_current_week, parse_calendar_date, sundays_for_year, CalendarError,
    Sunday,
};
use crate::error::AppError;
use crate::models::{
    Actor, AttendanceMember, AttendanceRecord, AttendanceReport, MemberUpdate, NewMember, Role,
};
use crate::report::YearlyReport;

pub const USER_HEADER: &str = "x-flock-user";
pub const ROLE_HEADER: &str = "x-flock-role";
pub const DEPARTMENT_HEADER: &str = "x-flock-department";

// --- State ---

#[derive(Clone)]
pub struct AppState {
    pub book: AttendanceBook,
    pub started_at: DateTime<Utc>,
    pub backend_configured: bool,
}

impl AppState {
    pub fn new(book: AttendanceBook, backend_configured: bool) -> Self {
        Self {
            book,
            started_at: Utc::now(),
            backend_configured,
        }
    }
}

pub fn router(state: AppState) -> Router {
    let members = Router::new()
        .route("/", post(handle_register_member))
        .route("/import", post(handle_import_members))
        .route("/{id}", patch(handle_update_member).delete(handle_delete_member))
        .route("/{id}/deactivate", post(handle_deactivate_member))
        .route("/{id}/reactivate", post(handle_reactivate_member))
        .route("/{id}/notes", get(handle_member_notes));

    let departments = Router::new()
        .route("/{department}/members", get(handle_department_members))
        .route("/{department}/weeks/{date}", get(handle_week_sheet))
        .route("/{department}/weeks/{date}/status-log", get(handle_status_log))
        .route(
            "/{department}/weeks/{date}/report",
            get(handle_get_report)
                .post(handle_finalize_report)
                .delete(handle_reopen_report),
        )
        .route("/{department}/years/{year}/report", get(handle_yearly_report));

    let attendance = Router::new()
        .route("/", put(handle_set_attendance))
        .route("/toggle", post(handle_toggle_attendance))
        .route("/note", put(handle_set_status_note));

    let calendar = Router::new()
        .route("/week", get(handle_calendar_week))
        .route("/years/{year}/sundays", get(handle_year_sundays));

    Router::new()
        .route("/health", get(handle_health))
        .route("/status", get(handle_status))
        .nest("/api/members", members)
        .nest("/api/departments", departments)
        .nest("/api/attendance", attendance)
        .nest("/api/calendar", calendar)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// --- Actor extraction ---

fn header_text(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| std::str::from_utf8(value.as_bytes()).ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

impl<S: Send + Sync> FromRequestParts<S> for Actor {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = header_text(&parts.headers, USER_HEADER)
            .ok_or_else(|| AppError::Unauthenticated(format!("missing {} header", USER_HEADER)))?;
        let role: Role = header_text(&parts.headers, ROLE_HEADER)
            .ok_or_else(|| AppError::Unauthenticated(format!("missing {} header", ROLE_HEADER)))?
            .parse()
            .map_err(AppError::Unauthenticated)?;
        let department = header_text(&parts.headers, DEPARTMENT_HEADER);
        if role == Role::Manager && department.is_none() {
            return Err(AppError::Unauthenticated(format!(
                "manager requests need a {} header",
                DEPARTMENT_HEADER
            )));
        }
        Ok(Actor {
            user_id,
            role,
            department,
        })
    }
}

fn parse_date(raw: &str) -> Result<NaiveDate, AppError> {
    Ok(parse_calendar_date(raw)?)
}

fn week_of(raw: &str) -> Result<Sunday, AppError> {
    parse_date(raw).map(Sunday::containing)
}

// --- Health / status ---

async fn handle_health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn handle_status(State(state): State<AppState>) -> impl IntoResponse {
    let today = state.book.clock().today();
    Json(json!({
        "started_at": state.started_at,
        "today": format_calendar_date(today),
        "current_sunday": Sunday::containing(today),
        "counts": state.book.counts(),
        "backend_configured": state.backend_configured,
        "unpushed_changes": state.book.unpushed_changes(),
        "department_aliases": state.book.aliases().len(),
    }))
}

// --- Calendar ---

#[derive(Debug, Deserialize)]
struct WeekQuery {
    date: Option<String>,
}

#[derive(Debug, Serialize)]
struct WeekInfo {
    date: NaiveDate,
    sunday: Sunday,
    dates: [NaiveDate; 7],
    previous: Sunday,
    next: Sunday,
    is_current_week: bool,
}

async fn handle_calendar_week(
    State(state): State<AppState>,
    Query(query): Query<WeekQuery>,
) -> Result<Json<WeekInfo>, AppError> {
    let clock = state.book.clock();
    let date = match query.date.as_deref() {
        Some(raw) => parse_date(raw)?,
        None => clock.today(),
    };
    let sunday = Sunday::containing(date);
    Ok(Json(WeekInfo {
        date,
        sunday,
        dates: sunday.week_dates(),
        previous: sunday.previous(),
        next: sunday.next(),
        is_current_week: is_current_week(sunday, clock),
    }))
}

async fn handle_year_sundays(Path(year): Path<i32>) -> Result<impl IntoResponse, AppError> {
    let sundays = sundays_for_year(year);
    if sundays.is_empty() {
        return Err(CalendarError::YearOutOfRange(year).into());
    }
    Ok(Json(json!({ "year": year, "sundays": sundays })))
}

// --- Members ---

#[derive(Debug, Deserialize)]
struct MembersQuery {
    #[serde(default)]
    include_inactive: bool,
}

async fn handle_department_members(
    State(state): State<AppState>,
    Path(department): Path<String>,
    Query(query): Query<MembersQuery>,
) -> Json<Vec<AttendanceMember>> {
    Json(
        state
            .book
            .members_in_department(&department, query.include_inactive),
    )
}

async fn handle_register_member(
    State(state): State<AppState>,
    actor: Actor,
    Json(new_member): Json<NewMember>,
) -> Result<impl IntoResponse, AppError> {
    let member = state.book.register_member(&actor, new_member)?;
    Ok((StatusCode::CREATED, Json(member)))
}

async fn handle_update_member(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<String>,
    Json(update): Json<MemberUpdate>,
) -> Result<Json<AttendanceMember>, AppError> {
    Ok(Json(state.book.update_member(&actor, &id, update)?))
}

async fn handle_delete_member(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<String>,
) -> Result<Json<AttendanceMember>, AppError> {
    Ok(Json(state.book.delete_member(&actor, &id)?))
}

async fn handle_deactivate_member(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<String>,
) -> Result<Json<AttendanceMember>, AppError> {
    Ok(Json(state.book.deactivate_member(&actor, &id)?))
}

async fn handle_reactivate_member(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<String>,
) -> Result<Json<AttendanceMember>, AppError> {
    Ok(Json(state.book.reactivate_member(&actor, &id)?))
}

async fn handle_member_notes(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<AttendanceRecord>>, AppError> {
    Ok(Json(state.book.member_notes(&id)?))
}

#[derive(Debug, Deserialize)]
struct ImportQuery {
    department: Option<String>,
}

#[derive(Debug, Serialize)]
struct ImportResponse {
    created: usize,
    skipped: usize,
    problems: Vec<RowProblem>,
}

async fn handle_import_members(
    State(state): State<AppState>,
    actor: Actor,
    Query(query): Query<ImportQuery>,
    body: String,
) -> Result<Json<ImportResponse>, AppError> {
    let default_department = query.department.or_else(|| actor.department.clone());
    let parsed = parse_members_csv(
        body.as_bytes(),
        default_department.as_deref(),
        state.book.aliases(),
    )?;
    let summary = state.book.import_members(&actor, parsed.members)?;
    info!(
        "Import by {}: {} created, {} skipped, {} rejected rows",
        actor.user_id,
        summary.created,
        summary.skipped,
        parsed.problems.len()
    );
    Ok(Json(ImportResponse {
        created: summary.created,
        skipped: summary.skipped,
        problems: parsed.problems,
    }))
}

// --- Attendance ---

#[derive(Debug, Deserialize)]
struct ToggleRequest {
    member_id: String,
    date: String,
}

#[derive(Debug, Deserialize)]
struct SetAttendanceRequest {
    member_id: String,
    date: String,
    attended: bool,
}

#[derive(Debug, Deserialize)]
struct NoteRequest {
    member_id: String,
    date: String,
    #[serde(default)]
    note: Option<String>,
}

async fn handle_toggle_attendance(
    State(state): State<AppState>,
    actor: Actor,
    Json(request): Json<ToggleRequest>,
) -> Result<Json<AttendanceRecord>, AppError> {
    let date = parse_date(&request.date)?;
    Ok(Json(state.book.toggle_attendance(&actor, &request.member_id, date)?))
}

async fn handle_set_attendance(
    State(state): State<AppState>,
    actor: Actor,
    Json(request): Json<SetAttendanceRequest>,
) -> Result<Json<AttendanceRecord>, AppError> {
    let date = parse_date(&request.date)?;
    Ok(Json(state.book.set_attendance(
        &actor,
        &request.member_id,
        date,
        request.attended,
    )?))
}

async fn handle_set_status_note(
    State(state): State<AppState>,
    actor: Actor,
    Json(request): Json<NoteRequest>,
) -> Result<Json<AttendanceRecord>, AppError> {
    let date = parse_date(&request.date)?;
    Ok(Json(state.book.set_status_note(
        &actor,
        &request.member_id,
        date,
        request.note,
    )?))
}

// --- Weeks and reports ---

async fn handle_week_sheet(
    State(state): State<AppState>,
    Path((department, date)): Path<(String, String)>,
) -> Result<Json<WeekSheet>, AppError> {
    let sunday = week_of(&date)?;
    Ok(Json(state.book.week_sheet(&department, sunday)))
}

async fn handle_status_log(
    State(state): State<AppState>,
    Path((department, date)): Path<(String, String)>,
) -> Result<Json<Vec<StatusEntry>>, AppError> {
    let sunday = week_of(&date)?;
    Ok(Json(state.book.status_log(&department, sunday)))
}

async fn handle_get_report(
    State(state): State<AppState>,
    Path((department, date)): Path<(String, String)>,
) -> Result<Json<AttendanceReport>, AppError> {
    let sunday = week_of(&date)?;
    let report = state
        .book
        .report(&department, sunday)
        .ok_or_else(|| BookError::ReportNotFound {
            department: state.book.aliases().resolve(&department).to_string(),
            sunday,
        })?;
    Ok(Json(report))
}

async fn handle_finalize_report(
    State(state): State<AppState>,
    actor: Actor,
    Path((department, date)): Path<(String, String)>,
) -> Result<impl IntoResponse, AppError> {
    let sunday = week_of(&date)?;
    let report = state.book.finalize_report(&actor, &department, sunday)?;
    Ok((StatusCode::CREATED, Json(report)))
}

async fn handle_reopen_report(
    State(state): State<AppState>,
    actor: Actor,
    Path((department, date)): Path<(String, String)>,
) -> Result<Json<AttendanceReport>, AppError> {
    let sunday = week_of(&date)?;
    Ok(Json(state.book.reopen_report(&actor, &department, sunday)?))
}

async fn handle_yearly_report(
    State(state): State<AppState>,
    Path((department, year)): Path<(String, i32)>,
) -> Result<Json<YearlyReport>, AppError> {
    if sundays_for_year(year).is_empty() {
        return Err(CalendarError::YearOutOfRange(year).into());
    }
    Ok(Json(state.book.yearly_report(&department, year)))
}
