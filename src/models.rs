use chrono::NaiveDate;
use serde::Serialize;

pub const ROLE_ADMIN: &str = "admin";
pub const ROLE_CLIENT: &str = "client";
pub const ROLE_TECHNICIAN: &str = "technician";

pub const DAY_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Completed,
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(BookingStatus::Pending),
            "confirmed" => Some(BookingStatus::Confirmed),
            "completed" => Some(BookingStatus::Completed),
            "cancelled" => Some(BookingStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VisitKind {
    OnSite,
    Consultation,
}

impl VisitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            VisitKind::OnSite => "on_site",
            VisitKind::Consultation => "consultation",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "on_site" => Some(VisitKind::OnSite),
            "consultation" => Some(VisitKind::Consultation),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Postponed,
    Completed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Postponed => "postponed",
            TaskStatus::Completed => "completed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(TaskStatus::Pending),
            "postponed" => Some(TaskStatus::Postponed),
            "completed" => Some(TaskStatus::Completed),
            "cancelled" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Standard,
    ClientRequest,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Standard => "standard",
            TaskKind::ClientRequest => "client_request",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "standard" => Some(TaskKind::Standard),
            "client_request" => Some(TaskKind::ClientRequest),
            _ => None,
        }
    }
}

/// Whether a task is attached to a concrete visit. A cleared link and a
/// never-assigned link are the same state on purpose: both land the task
/// in the general pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskLink {
    Unscheduled,
    LinkedTo(String),
}

impl TaskLink {
    pub fn booking_id(&self) -> Option<&str> {
        match self {
            TaskLink::Unscheduled => None,
            TaskLink::LinkedTo(id) => Some(id.as_str()),
        }
    }

    pub fn from_booking_id(value: Option<String>) -> Self {
        match value {
            Some(id) if !id.trim().is_empty() => TaskLink::LinkedTo(id),
            _ => TaskLink::Unscheduled,
        }
    }
}

/// A visit time slot. `minutes` is minutes since midnight, normalized from
/// the display label at the write boundary; all ordering uses it, never the
/// label text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    pub label: String,
    pub minutes: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Booking {
    pub id: String,
    pub client_id: Option<String>,
    pub client_name: String,
    pub date: NaiveDate,
    pub slot: Option<Slot>,
    pub kind: VisitKind,
    pub status: BookingStatus,
    pub branch_id: Option<String>,
    pub branch_name: Option<String>,
    pub created_at: String,
}

/// A calendar exclusion. Stored in the bookings table with `is_blocked = 1`
/// but handled as its own type everywhere above the store.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockRecord {
    pub id: String,
    pub date: NaiveDate,
    pub client_id: Option<String>,
    pub created_at: String,
}

impl BlockRecord {
    pub fn is_global(&self) -> bool {
        self.client_id.is_none()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VisitTask {
    pub id: String,
    pub link: TaskLink,
    pub client_id: String,
    pub text: String,
    pub notes: Option<String>,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub viewed_by_admin: bool,
    pub visit_date: Option<NaiveDate>,
    pub reason: Option<String>,
    pub created_at: String,
}

impl VisitTask {
    /// Derived, never stored. Status is the single source of truth.
    pub fn is_completed(&self) -> bool {
        self.status == TaskStatus::Completed
    }
}

#[allow(dead_code)]
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UserRow {
    pub id: String,
    pub username: String,
    pub display_name: String,
    pub role: String,
    pub client_id: Option<String>,
    pub password_hash: String,
    pub active: i64,
    pub created_at: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BookingRow {
    pub id: String,
    pub client_id: Option<String>,
    pub client_name: String,
    pub date: String,
    pub time: Option<String>,
    pub slot_minutes: Option<i64>,
    pub kind: String,
    pub status: String,
    pub branch_id: Option<String>,
    pub branch_name: Option<String>,
    pub is_blocked: i64,
    pub created_at: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TaskRow {
    pub id: String,
    pub booking_id: Option<String>,
    pub client_id: String,
    pub text: String,
    pub notes: Option<String>,
    pub kind: String,
    pub status: String,
    pub is_viewed_by_admin: i64,
    pub visit_date: Option<String>,
    pub reason: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ClientRow {
    pub id: String,
    pub name: String,
    pub phone: String,
    pub email: Option<String>,
    pub branch_id: Option<String>,
    pub branch_name: Option<String>,
    pub visits_limit: i64,
    pub visits_used: i64,
    pub tickets_limit: i64,
    pub tickets_used: i64,
    pub users_limit: i64,
    pub contract_start: Option<String>,
    pub contract_end: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TicketRow {
    pub id: String,
    pub client_id: String,
    pub subject: String,
    pub body: String,
    pub kind: String,
    pub status: String,
    pub created_at: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct InvoiceRow {
    pub id: String,
    pub client_id: String,
    pub ticket_id: Option<String>,
    pub amount_cents: i64,
    pub currency: String,
    pub status: String,
    pub issued_at: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ActivityRow {
    pub message: String,
    pub created_at: String,
}
