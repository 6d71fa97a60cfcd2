use std::sync::Arc;

use chrono::NaiveDate;
use serde::Serialize;
use sqlx::SqlitePool;
use tokio::sync::broadcast;

use crate::{
    models::{Booking, VisitTask, DAY_FORMAT},
    orchestrator::Orchestrator,
    store::SqliteStore,
};

#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub portal: Arc<Orchestrator<SqliteStore>>,
    pub events: broadcast::Sender<ChangeEvent>,
}

/// Broadcast to every subscribed dashboard whenever a row changes. Carries
/// identifiers only; subscribers refetch through the API on receipt.
#[derive(Clone, Debug, Serialize)]
pub struct ChangeEvent {
    pub kind: String,
    pub booking_id: Option<String>,
    pub task_id: Option<String>,
    pub client_id: Option<String>,
    pub status: Option<String>,
    pub date: Option<String>,
}

impl ChangeEvent {
    pub fn bare(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            booking_id: None,
            task_id: None,
            client_id: None,
            status: None,
            date: None,
        }
    }

    pub fn booking(kind: &str, booking: &Booking) -> Self {
        Self {
            kind: kind.to_string(),
            booking_id: Some(booking.id.clone()),
            task_id: None,
            client_id: booking.client_id.clone(),
            status: Some(booking.status.as_str().to_string()),
            date: Some(booking.date.format(DAY_FORMAT).to_string()),
        }
    }

    pub fn task(kind: &str, task: &VisitTask) -> Self {
        Self {
            kind: kind.to_string(),
            booking_id: task.link.booking_id().map(str::to_string),
            task_id: Some(task.id.clone()),
            client_id: Some(task.client_id.clone()),
            status: Some(task.status.as_str().to_string()),
            date: task.visit_date.map(|date| date.format(DAY_FORMAT).to_string()),
        }
    }

    pub fn block(kind: &str, date: NaiveDate, client_id: Option<&str>) -> Self {
        Self {
            kind: kind.to_string(),
            booking_id: None,
            task_id: None,
            client_id: client_id.map(str::to_string),
            status: None,
            date: Some(date.format(DAY_FORMAT).to_string()),
        }
    }

    pub fn for_client(kind: &str, client_id: &str) -> Self {
        Self {
            kind: kind.to_string(),
            booking_id: None,
            task_id: None,
            client_id: Some(client_id.to_string()),
            status: None,
            date: None,
        }
    }
}
