// src/models.rs
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::calendar::Sunday;
use crate::department::DepartmentAliases;

pub type MemberId = String;
pub type RecordKey = (MemberId, NaiveDate);
/// Sparse attendance data: only dates someone actually touched have a row.
pub type RecordIndex = HashMap<RecordKey, AttendanceRecord>;

// --- Members ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
}

impl FromStr for Gender {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "남" | "남자" | "m" | "male" => Ok(Gender::Male),
            "여" | "여자" | "f" | "female" => Ok(Gender::Female),
            other => Err(format!("Unknown gender '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceMember {
    pub id: MemberId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<Gender>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub birth_date: Option<NaiveDate>,
    pub department: String,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn default_active() -> bool {
    true
}

/// Input for creating a member. `id` is generated when absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewMember {
    #[serde(default)]
    pub id: Option<MemberId>,
    pub name: String,
    #[serde(default)]
    pub gender: Option<Gender>,
    #[serde(default)]
    pub birth_date: Option<NaiveDate>,
    pub department: String,
}

/// Partial update; `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemberUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub gender: Option<Gender>,
    #[serde(default)]
    pub birth_date: Option<NaiveDate>,
    #[serde(default)]
    pub department: Option<String>,
}

// --- Attendance ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub member_id: MemberId,
    pub date: NaiveDate,
    pub attended: bool,
    /// Current status / prayer request, independent of `attended`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_note: Option<String>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl AttendanceRecord {
    pub fn key(&self) -> RecordKey {
        (self.member_id.clone(), self.date)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceReport {
    /// Always stored resolved through the alias table.
    pub department: String,
    pub sunday: Sunday,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted_by: Option<String>,
    #[serde(default = "Utc::now")]
    pub submitted_at: DateTime<Utc>,
}

// --- Actors ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Manager,
    Member,
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "admin" => Ok(Role::Admin),
            "manager" => Ok(Role::Manager),
            "member" => Ok(Role::Member),
            other => Err(format!("Unknown role '{}'", other)),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Admin => "admin",
            Role::Manager => "manager",
            Role::Member => "member",
        };
        f.write_str(name)
    }
}

/// The authenticated user behind a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub user_id: String,
    pub role: Role,
    /// Department a manager is responsible for.
    pub department: Option<String>,
}

impl Actor {
    pub fn admin(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            role: Role::Admin,
            department: None,
        }
    }

    pub fn manager(user_id: &str, department: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            role: Role::Manager,
            department: Some(department.to_string()),
        }
    }

    pub fn member(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            role: Role::Member,
            department: None,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn can_manage(&self, department: &str, aliases: &DepartmentAliases) -> bool {
        match self.role {
            Role::Admin => true,
            Role::Manager => self
                .department
                .as_deref()
                .is_some_and(|own| aliases.matches(own, department)),
            Role::Member => false,
        }
    }
}
