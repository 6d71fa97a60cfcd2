use actix_web::{web, HttpResponse};
use actix_web_httpauth::middleware::HttpAuthentication;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    auth::{admin_validator, new_id, AuthUser},
    db::{insert_user, log_activity},
    error::PortalError,
    models::{
        ActivityRow, BlockRecord, Booking, BookingStatus, ClientRow, InvoiceRow, TaskKind,
        TaskLink, TaskStatus, TicketRow, VisitKind, VisitTask, DAY_FORMAT, ROLE_CLIENT,
    },
    orchestrator::{NewBooking, NewTask, TaskPatch},
    routes::{parse_day, today},
    state::{AppState, ChangeEvent},
    tasks::{group_for, PostponeTarget, TaskGroup},
};

#[derive(Debug, Serialize)]
pub(crate) struct BookingView {
    pub id: String,
    pub client_id: Option<String>,
    pub client_name: String,
    pub date: String,
    pub time: Option<String>,
    pub slot_minutes: Option<u16>,
    pub kind: VisitKind,
    pub status: BookingStatus,
    pub branch_id: Option<String>,
    pub branch_name: Option<String>,
    pub created_at: String,
}

impl BookingView {
    pub(crate) fn from(booking: &Booking) -> Self {
        Self {
            id: booking.id.clone(),
            client_id: booking.client_id.clone(),
            client_name: booking.client_name.clone(),
            date: booking.date.format(DAY_FORMAT).to_string(),
            time: booking.slot.as_ref().map(|slot| slot.label.clone()),
            slot_minutes: booking.slot.as_ref().map(|slot| slot.minutes),
            kind: booking.kind,
            status: booking.status,
            branch_id: booking.branch_id.clone(),
            branch_name: booking.branch_name.clone(),
            created_at: booking.created_at.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct TaskView {
    pub id: String,
    pub booking_id: Option<String>,
    pub client_id: String,
    pub text: String,
    pub notes: Option<String>,
    pub kind: TaskKind,
    pub status: TaskStatus,
    /// Derived from status at this boundary; not a stored column.
    pub is_completed: bool,
    pub is_viewed_by_admin: bool,
    pub visit_date: Option<String>,
    pub reason: Option<String>,
    pub group: &'static str,
    pub created_at: String,
}

impl TaskView {
    pub(crate) fn from(task: &VisitTask) -> Self {
        let group = match group_for(task) {
            TaskGroup::ActionRequired => "action_required",
            TaskGroup::Scheduled => "scheduled",
            TaskGroup::History => "history",
        };
        Self {
            id: task.id.clone(),
            booking_id: task.link.booking_id().map(str::to_string),
            client_id: task.client_id.clone(),
            text: task.text.clone(),
            notes: task.notes.clone(),
            kind: task.kind,
            status: task.status,
            is_completed: task.is_completed(),
            is_viewed_by_admin: task.viewed_by_admin,
            visit_date: task.visit_date.map(|date| date.format(DAY_FORMAT).to_string()),
            reason: task.reason.clone(),
            group,
            created_at: task.created_at.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct BlockView {
    id: String,
    date: String,
    client_id: Option<String>,
    scope: &'static str,
}

impl BlockView {
    fn from(block: &BlockRecord) -> Self {
        Self {
            id: block.id.clone(),
            date: block.date.format(DAY_FORMAT).to_string(),
            client_id: block.client_id.clone(),
            scope: if block.is_global() { "global" } else { "client" },
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct ClientView {
    pub id: String,
    pub name: String,
    pub phone: String,
    pub email: Option<String>,
    pub branch_id: Option<String>,
    pub branch_name: Option<String>,
    pub visits_limit: i64,
    pub visits_used: i64,
    pub visits_remaining: i64,
    pub tickets_limit: i64,
    pub tickets_used: i64,
    pub tickets_remaining: i64,
    pub users_limit: i64,
    pub contract_start: Option<String>,
    pub contract_end: Option<String>,
}

impl ClientView {
    pub(crate) fn from(row: ClientRow) -> Self {
        Self {
            visits_remaining: row.visits_limit - row.visits_used,
            tickets_remaining: row.tickets_limit - row.tickets_used,
            id: row.id,
            name: row.name,
            phone: row.phone,
            email: row.email,
            branch_id: row.branch_id,
            branch_name: row.branch_name,
            visits_limit: row.visits_limit,
            visits_used: row.visits_used,
            tickets_limit: row.tickets_limit,
            tickets_used: row.tickets_used,
            users_limit: row.users_limit,
            contract_start: row.contract_start,
            contract_end: row.contract_end,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct StatCard {
    label: String,
    value: i64,
}

#[derive(Deserialize)]
struct BookingFilter {
    status: Option<String>,
    date: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct BookingCreateForm {
    pub client_id: Option<String>,
    pub client_name: String,
    pub date: String,
    pub time: String,
    pub kind: Option<String>,
    pub status: Option<String>,
    pub branch_id: Option<String>,
    pub branch_name: Option<String>,
}

#[derive(Deserialize)]
struct StatusForm {
    status: String,
}

#[derive(Deserialize)]
struct RescheduleForm {
    date: String,
    time: String,
}

#[derive(Deserialize)]
struct BlockToggleForm {
    date: String,
    client_id: Option<String>,
}

#[derive(Deserialize)]
struct TaskCreateForm {
    booking_id: Option<String>,
    client_id: String,
    text: String,
    notes: Option<String>,
    kind: Option<String>,
    visit_date: Option<String>,
}

#[derive(Deserialize)]
struct TaskUpdateForm {
    text: Option<String>,
    notes: Option<String>,
    status: Option<String>,
    visit_date: Option<String>,
}

#[derive(Deserialize)]
struct PostponeForm {
    /// Target visit date; when present the task is reassigned.
    date: Option<String>,
    reason: Option<String>,
}

#[derive(Deserialize)]
struct ClientForm {
    name: String,
    phone: String,
    email: Option<String>,
    branch_id: Option<String>,
    branch_name: Option<String>,
    visits_limit: Option<i64>,
    tickets_limit: Option<i64>,
    users_limit: Option<i64>,
    contract_start: Option<String>,
    contract_end: Option<String>,
}

#[derive(Deserialize)]
struct ClientUserForm {
    username: String,
    display_name: String,
    password: String,
}

#[derive(Deserialize)]
struct InvoiceForm {
    client_id: String,
    amount_cents: i64,
    currency: Option<String>,
}

#[derive(Deserialize)]
struct TicketFilter {
    status: Option<String>,
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/admin")
            .wrap(HttpAuthentication::basic(admin_validator))
            .service(web::resource("/dashboard").route(web::get().to(dashboard)))
            .service(
                web::resource("/bookings")
                    .route(web::get().to(list_bookings))
                    .route(web::post().to(create_booking)),
            )
            .service(web::resource("/bookings/{id}/status").route(web::post().to(update_booking_status)))
            .service(
                web::resource("/bookings/{id}/reschedule").route(web::post().to(reschedule_booking)),
            )
            .service(web::resource("/bookings/{id}").route(web::delete().to(delete_booking)))
            .service(web::resource("/schedule/{date}").route(web::get().to(day_schedule)))
            .service(web::resource("/blocks").route(web::get().to(list_blocks)))
            .service(web::resource("/blocks/toggle").route(web::post().to(toggle_block)))
            .service(web::resource("/blocks/clear").route(web::post().to(clear_blocks)))
            .service(
                web::resource("/tasks")
                    .route(web::get().to(list_tasks))
                    .route(web::post().to(create_task)),
            )
            .service(web::resource("/tasks/viewed").route(web::post().to(mark_tasks_viewed)))
            .service(web::resource("/tasks/{id}/toggle").route(web::post().to(toggle_task)))
            .service(web::resource("/tasks/{id}/postpone").route(web::post().to(postpone_task)))
            .service(
                web::resource("/tasks/{id}")
                    .route(web::put().to(update_task))
                    .route(web::delete().to(delete_task)),
            )
            .service(
                web::resource("/clients")
                    .route(web::get().to(list_clients))
                    .route(web::post().to(create_client)),
            )
            .service(
                web::resource("/clients/{id}")
                    .route(web::get().to(client_detail))
                    .route(web::put().to(update_client)),
            )
            .service(web::resource("/clients/{id}/users").route(web::post().to(create_client_user)))
            .service(web::resource("/tickets").route(web::get().to(list_tickets)))
            .service(web::resource("/tickets/{id}/approve").route(web::post().to(approve_ticket)))
            .service(web::resource("/tickets/{id}/reject").route(web::post().to(reject_ticket)))
            .service(web::resource("/tickets/{id}/resolve").route(web::post().to(resolve_ticket)))
            .service(
                web::resource("/invoices")
                    .route(web::get().to(list_invoices))
                    .route(web::post().to(create_invoice)),
            )
            .service(web::resource("/reports/summary").route(web::get().to(financial_summary))),
    );
}

async fn count(state: &AppState, query: &str) -> i64 {
    sqlx::query_scalar::<_, i64>(query)
        .fetch_one(&state.db)
        .await
        .unwrap_or(0)
}

async fn dashboard(state: web::Data<AppState>, auth: web::ReqData<AuthUser>) -> Result<HttpResponse, PortalError> {
    let total = count(&state, "SELECT COUNT(*) FROM bookings WHERE is_blocked = 0").await;
    let pending = count(
        &state,
        "SELECT COUNT(*) FROM bookings WHERE is_blocked = 0 AND status = 'pending'",
    )
    .await;
    let open_tickets = count(&state, "SELECT COUNT(*) FROM tickets WHERE status = 'pending'").await;
    let unviewed_tasks = count(
        &state,
        "SELECT COUNT(*) FROM visit_tasks WHERE is_viewed_by_admin = 0",
    )
    .await;

    let stats = vec![
        StatCard {
            label: "Total visits".to_string(),
            value: total,
        },
        StatCard {
            label: "Pending requests".to_string(),
            value: pending,
        },
        StatCard {
            label: "Open tickets".to_string(),
            value: open_tickets,
        },
        StatCard {
            label: "Unreviewed tasks".to_string(),
            value: unviewed_tasks,
        },
    ];

    let activities = sqlx::query_as::<_, ActivityRow>(
        "SELECT message, created_at FROM activities ORDER BY created_at DESC LIMIT 10",
    )
    .fetch_all(&state.db)
    .await
    .unwrap_or_default();

    let activities: Vec<_> = activities
        .into_iter()
        .map(|row| json!({ "message": row.message, "created_at": row.created_at }))
        .collect();

    Ok(HttpResponse::Ok().json(json!({
        "admin_name": auth.display_name,
        "stats": stats,
        "activities": activities,
    })))
}

async fn list_bookings(
    state: web::Data<AppState>,
    query: web::Query<BookingFilter>,
) -> Result<HttpResponse, PortalError> {
    let status = match query.status.as_deref().filter(|s| !s.is_empty()) {
        Some(value) => Some(
            BookingStatus::parse(value)
                .ok_or_else(|| PortalError::validation(format!("unknown status: {value}")))?,
        ),
        None => None,
    };
    let date = match query.date.as_deref() {
        Some(value) => Some(parse_day(value)?),
        None => None,
    };

    let bookings = match date {
        Some(date) => state.portal.day_schedule(date).await,
        None => state.portal.bookings().await,
    };
    let views: Vec<BookingView> = bookings
        .iter()
        .filter(|booking| status.is_none_or(|wanted| booking.status == wanted))
        .map(BookingView::from)
        .collect();
    Ok(HttpResponse::Ok().json(views))
}

async fn create_booking(
    state: web::Data<AppState>,
    auth: web::ReqData<AuthUser>,
    form: web::Json<BookingCreateForm>,
) -> Result<HttpResponse, PortalError> {
    let form = form.into_inner();
    let status = match form.status.as_deref() {
        Some(value) => BookingStatus::parse(value)
            .ok_or_else(|| PortalError::validation(format!("unknown status: {value}")))?,
        None => BookingStatus::Confirmed,
    };
    let kind = match form.kind.as_deref() {
        Some(value) => VisitKind::parse(value)
            .ok_or_else(|| PortalError::validation(format!("unknown visit kind: {value}")))?,
        None => VisitKind::OnSite,
    };

    let booking = state
        .portal
        .create(NewBooking {
            client_id: form.client_id.filter(|id| !id.trim().is_empty()),
            client_name: form.client_name,
            date: parse_day(&form.date)?,
            time: form.time,
            kind,
            status,
            branch_id: form.branch_id,
            branch_name: form.branch_name,
        })
        .await?;

    log_activity(
        &state.db,
        "booking_created",
        &format!("{} booked a visit for {}.", auth.display_name, booking.client_name),
        Some(&auth.id),
        Some(&booking.id),
    )
    .await;

    Ok(HttpResponse::Created().json(BookingView::from(&booking)))
}

async fn update_booking_status(
    state: web::Data<AppState>,
    auth: web::ReqData<AuthUser>,
    path: web::Path<String>,
    form: web::Json<StatusForm>,
) -> Result<HttpResponse, PortalError> {
    let id = path.into_inner();
    let status = BookingStatus::parse(&form.status)
        .ok_or_else(|| PortalError::validation(format!("unknown status: {}", form.status)))?;

    let booking = state.portal.update_status(&id, status).await?;
    log_activity(
        &state.db,
        "booking_updated",
        &format!("{} set visit {} to {}.", auth.display_name, id, status.as_str()),
        Some(&auth.id),
        Some(&id),
    )
    .await;
    Ok(HttpResponse::Ok().json(BookingView::from(&booking)))
}

async fn reschedule_booking(
    state: web::Data<AppState>,
    auth: web::ReqData<AuthUser>,
    path: web::Path<String>,
    form: web::Json<RescheduleForm>,
) -> Result<HttpResponse, PortalError> {
    let id = path.into_inner();
    let date = parse_day(&form.date)?;
    let booking = state.portal.reschedule(&id, date, &form.time, today()).await?;

    log_activity(
        &state.db,
        "booking_rescheduled",
        &format!(
            "{} moved visit {} to {} {}.",
            auth.display_name, id, form.date, form.time
        ),
        Some(&auth.id),
        Some(&id),
    )
    .await;
    Ok(HttpResponse::Ok().json(BookingView::from(&booking)))
}

async fn delete_booking(
    state: web::Data<AppState>,
    auth: web::ReqData<AuthUser>,
    path: web::Path<String>,
) -> Result<HttpResponse, PortalError> {
    let id = path.into_inner();
    state.portal.delete(&id).await?;
    log_activity(
        &state.db,
        "booking_deleted",
        &format!("{} deleted visit {}.", auth.display_name, id),
        Some(&auth.id),
        Some(&id),
    )
    .await;
    Ok(HttpResponse::Ok().json(json!({ "ok": true })))
}

async fn day_schedule(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, PortalError> {
    let date = parse_day(&path.into_inner())?;
    let schedule = state.portal.day_schedule(date).await;
    let views: Vec<BookingView> = schedule.iter().map(BookingView::from).collect();
    Ok(HttpResponse::Ok().json(views))
}

async fn list_blocks(state: web::Data<AppState>) -> Result<HttpResponse, PortalError> {
    let blocks = state.portal.blocks().await;
    let views: Vec<BlockView> = blocks.iter().map(BlockView::from).collect();
    Ok(HttpResponse::Ok().json(views))
}

async fn toggle_block(
    state: web::Data<AppState>,
    auth: web::ReqData<AuthUser>,
    form: web::Json<BlockToggleForm>,
) -> Result<HttpResponse, PortalError> {
    let date = parse_day(&form.date)?;
    let client_id = form.client_id.clone().filter(|id| !id.trim().is_empty());
    let blocked = state.portal.toggle_block(date, client_id).await?;

    log_activity(
        &state.db,
        if blocked { "date_blocked" } else { "date_unblocked" },
        &format!(
            "{} {} {}.",
            auth.display_name,
            if blocked { "blocked" } else { "unblocked" },
            form.date
        ),
        Some(&auth.id),
        None,
    )
    .await;
    Ok(HttpResponse::Ok().json(json!({ "date": form.date, "blocked": blocked })))
}

async fn clear_blocks(
    state: web::Data<AppState>,
    auth: web::ReqData<AuthUser>,
) -> Result<HttpResponse, PortalError> {
    let removed = state.portal.unblock_all().await?;
    log_activity(
        &state.db,
        "blocks_cleared",
        &format!("{} cleared all blocked dates.", auth.display_name),
        Some(&auth.id),
        None,
    )
    .await;
    Ok(HttpResponse::Ok().json(json!({ "removed": removed })))
}

async fn list_tasks(state: web::Data<AppState>) -> Result<HttpResponse, PortalError> {
    let tasks = state.portal.tasks().await;
    let mut action_required = Vec::new();
    let mut scheduled = Vec::new();
    let mut history = Vec::new();
    for task in &tasks {
        let view = TaskView::from(task);
        match group_for(task) {
            TaskGroup::ActionRequired => action_required.push(view),
            TaskGroup::Scheduled => scheduled.push(view),
            TaskGroup::History => history.push(view),
        }
    }
    Ok(HttpResponse::Ok().json(json!({
        "action_required": action_required,
        "scheduled": scheduled,
        "history": history,
    })))
}

async fn create_task(
    state: web::Data<AppState>,
    auth: web::ReqData<AuthUser>,
    form: web::Json<TaskCreateForm>,
) -> Result<HttpResponse, PortalError> {
    let form = form.into_inner();
    let kind = match form.kind.as_deref() {
        Some(value) => TaskKind::parse(value)
            .ok_or_else(|| PortalError::validation(format!("unknown task kind: {value}")))?,
        None => TaskKind::Standard,
    };
    let visit_date = match form.visit_date.as_deref() {
        Some(value) if !value.trim().is_empty() => Some(parse_day(value)?),
        _ => None,
    };

    let task = state
        .portal
        .add_task(NewTask {
            link: TaskLink::from_booking_id(form.booking_id),
            client_id: form.client_id,
            text: form.text,
            notes: form.notes,
            kind,
            visit_date,
        })
        .await?;

    log_activity(
        &state.db,
        "task_created",
        &format!("{} added a task: {}.", auth.display_name, task.text),
        Some(&auth.id),
        task.link.booking_id(),
    )
    .await;
    Ok(HttpResponse::Created().json(TaskView::from(&task)))
}

async fn toggle_task(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, PortalError> {
    let id = path.into_inner();
    let task = state.portal.toggle_task_completion(&id).await?;
    Ok(HttpResponse::Ok().json(TaskView::from(&task)))
}

async fn update_task(
    state: web::Data<AppState>,
    path: web::Path<String>,
    form: web::Json<TaskUpdateForm>,
) -> Result<HttpResponse, PortalError> {
    let id = path.into_inner();
    let form = form.into_inner();
    let status = match form.status.as_deref() {
        Some(value) => Some(
            TaskStatus::parse(value)
                .ok_or_else(|| PortalError::validation(format!("unknown task status: {value}")))?,
        ),
        None => None,
    };
    let visit_date = match form.visit_date.as_deref() {
        Some(value) if !value.trim().is_empty() => Some(parse_day(value)?),
        _ => None,
    };

    let task = state
        .portal
        .update_task(
            &id,
            TaskPatch {
                text: form.text,
                notes: form.notes,
                status,
                visit_date,
            },
        )
        .await?;
    Ok(HttpResponse::Ok().json(TaskView::from(&task)))
}

async fn postpone_task(
    state: web::Data<AppState>,
    auth: web::ReqData<AuthUser>,
    path: web::Path<String>,
    form: web::Json<PostponeForm>,
) -> Result<HttpResponse, PortalError> {
    let id = path.into_inner();
    let target = match form.date.as_deref().filter(|d| !d.trim().is_empty()) {
        Some(date) => PostponeTarget::Reassign {
            date: parse_day(date)?,
        },
        None => {
            let reason = form
                .reason
                .clone()
                .filter(|r| !r.trim().is_empty())
                .ok_or_else(|| PortalError::validation("a reason or a target date is required"))?;
            PostponeTarget::GeneralPool { reason }
        }
    };

    let (task, outcome) = state.portal.postpone_task(&id, target).await?;
    log_activity(
        &state.db,
        "task_postponed",
        &format!("{} postponed task {}.", auth.display_name, id),
        Some(&auth.id),
        task.link.booking_id(),
    )
    .await;
    Ok(HttpResponse::Ok().json(json!({
        "task": TaskView::from(&task),
        "outcome": match outcome {
            crate::tasks::PostponeOutcome::MovedToPool => "moved_to_pool",
            crate::tasks::PostponeOutcome::Linked { .. } => "linked",
            crate::tasks::PostponeOutcome::Unmatched { .. } => "unmatched",
        },
    })))
}

async fn delete_task(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, PortalError> {
    let id = path.into_inner();
    state.portal.delete_task(&id).await?;
    Ok(HttpResponse::Ok().json(json!({ "ok": true })))
}

async fn mark_tasks_viewed(state: web::Data<AppState>) -> Result<HttpResponse, PortalError> {
    let changed = state.portal.mark_tasks_viewed().await?;
    Ok(HttpResponse::Ok().json(json!({ "changed": changed })))
}

const CLIENT_COLUMNS: &str = "id, name, phone, email, branch_id, branch_name, visits_limit, visits_used, tickets_limit, tickets_used, users_limit, contract_start, contract_end, created_at";

async fn list_clients(state: web::Data<AppState>) -> Result<HttpResponse, PortalError> {
    let rows = sqlx::query_as::<_, ClientRow>(&format!(
        "SELECT {CLIENT_COLUMNS} FROM clients ORDER BY name"
    ))
    .fetch_all(&state.db)
    .await?;
    let views: Vec<ClientView> = rows.into_iter().map(ClientView::from).collect();
    Ok(HttpResponse::Ok().json(views))
}

async fn create_client(
    state: web::Data<AppState>,
    auth: web::ReqData<AuthUser>,
    form: web::Json<ClientForm>,
) -> Result<HttpResponse, PortalError> {
    let form = form.into_inner();
    if form.name.trim().is_empty() {
        return Err(PortalError::validation("client name is required"));
    }
    if form.phone.trim().is_empty() {
        return Err(PortalError::validation("client phone is required"));
    }

    let id = new_id();
    sqlx::query(
        r#"INSERT INTO clients
           (id, name, phone, email, branch_id, branch_name, visits_limit, visits_used, tickets_limit, tickets_used, users_limit, contract_start, contract_end, created_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, 0, ?, ?, ?, ?)"#,
    )
    .bind(&id)
    .bind(form.name.trim())
    .bind(form.phone.trim())
    .bind(&form.email)
    .bind(&form.branch_id)
    .bind(&form.branch_name)
    .bind(form.visits_limit.unwrap_or(0))
    .bind(form.tickets_limit.unwrap_or(0))
    .bind(form.users_limit.unwrap_or(0))
    .bind(&form.contract_start)
    .bind(&form.contract_end)
    .bind(Utc::now().to_rfc3339())
    .execute(&state.db)
    .await?;

    log_activity(
        &state.db,
        "client_created",
        &format!("{} onboarded client {}.", auth.display_name, form.name.trim()),
        Some(&auth.id),
        None,
    )
    .await;

    let row = fetch_client(&state, &id).await?;
    Ok(HttpResponse::Created().json(ClientView::from(row)))
}

async fn client_detail(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, PortalError> {
    let row = fetch_client(&state, &path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(ClientView::from(row)))
}

async fn update_client(
    state: web::Data<AppState>,
    path: web::Path<String>,
    form: web::Json<ClientForm>,
) -> Result<HttpResponse, PortalError> {
    let id = path.into_inner();
    fetch_client(&state, &id).await?;
    let form = form.into_inner();

    sqlx::query(
        r#"UPDATE clients
           SET name = ?, phone = ?, email = ?, branch_id = ?, branch_name = ?,
               visits_limit = ?, tickets_limit = ?, users_limit = ?, contract_start = ?, contract_end = ?
           WHERE id = ?"#,
    )
    .bind(form.name.trim())
    .bind(form.phone.trim())
    .bind(&form.email)
    .bind(&form.branch_id)
    .bind(&form.branch_name)
    .bind(form.visits_limit.unwrap_or(0))
    .bind(form.tickets_limit.unwrap_or(0))
    .bind(form.users_limit.unwrap_or(0))
    .bind(&form.contract_start)
    .bind(&form.contract_end)
    .bind(&id)
    .execute(&state.db)
    .await?;

    let row = fetch_client(&state, &id).await?;
    Ok(HttpResponse::Ok().json(ClientView::from(row)))
}

async fn create_client_user(
    state: web::Data<AppState>,
    auth: web::ReqData<AuthUser>,
    path: web::Path<String>,
    form: web::Json<ClientUserForm>,
) -> Result<HttpResponse, PortalError> {
    let client_id = path.into_inner();
    let client = fetch_client(&state, &client_id).await?;
    let form = form.into_inner();
    if form.username.trim().is_empty() {
        return Err(PortalError::validation("username is required"));
    }
    if form.password.trim().len() < 6 {
        return Err(PortalError::validation("password must be at least 6 characters"));
    }

    let seats = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM users WHERE client_id = ? AND active = 1",
    )
    .bind(&client_id)
    .fetch_one(&state.db)
    .await?;
    if client.users_limit > 0 && seats >= client.users_limit {
        return Err(PortalError::validation("client user limit reached"));
    }

    insert_user(
        &state.db,
        form.username.trim(),
        form.display_name.trim(),
        ROLE_CLIENT,
        Some(&client_id),
        &form.password,
    )
    .await?;

    log_activity(
        &state.db,
        "client_user_created",
        &format!(
            "{} created portal access for {}.",
            auth.display_name, client.name
        ),
        Some(&auth.id),
        None,
    )
    .await;
    Ok(HttpResponse::Created().json(json!({ "ok": true })))
}

async fn fetch_client(state: &AppState, id: &str) -> Result<ClientRow, PortalError> {
    sqlx::query_as::<_, ClientRow>(&format!(
        "SELECT {CLIENT_COLUMNS} FROM clients WHERE id = ? LIMIT 1"
    ))
    .bind(id)
    .fetch_optional(&state.db)
    .await?
    .ok_or(PortalError::NotFound("client"))
}

async fn list_tickets(
    state: web::Data<AppState>,
    query: web::Query<TicketFilter>,
) -> Result<HttpResponse, PortalError> {
    let status = query.status.clone().unwrap_or_default();
    let rows = if status.is_empty() {
        sqlx::query_as::<_, TicketRow>(
            "SELECT id, client_id, subject, body, kind, status, created_at FROM tickets ORDER BY created_at DESC",
        )
        .fetch_all(&state.db)
        .await?
    } else {
        sqlx::query_as::<_, TicketRow>(
            "SELECT id, client_id, subject, body, kind, status, created_at FROM tickets WHERE status = ? ORDER BY created_at DESC",
        )
        .bind(&status)
        .fetch_all(&state.db)
        .await?
    };
    Ok(HttpResponse::Ok().json(rows.into_iter().map(ticket_json).collect::<Vec<_>>()))
}

fn ticket_json(row: TicketRow) -> serde_json::Value {
    json!({
        "id": row.id,
        "client_id": row.client_id,
        "subject": row.subject,
        "body": row.body,
        "kind": row.kind,
        "status": row.status,
        "created_at": row.created_at,
    })
}

async fn fetch_ticket(state: &AppState, id: &str) -> Result<TicketRow, PortalError> {
    sqlx::query_as::<_, TicketRow>(
        "SELECT id, client_id, subject, body, kind, status, created_at FROM tickets WHERE id = ? LIMIT 1",
    )
    .bind(id)
    .fetch_optional(&state.db)
    .await?
    .ok_or(PortalError::NotFound("ticket"))
}

async fn set_ticket_status(
    state: &AppState,
    auth: &AuthUser,
    id: &str,
    from: &str,
    to: &str,
) -> Result<TicketRow, PortalError> {
    let ticket = fetch_ticket(state, id).await?;
    if ticket.status != from {
        return Err(PortalError::validation(format!(
            "ticket is {}, expected {from}",
            ticket.status
        )));
    }
    sqlx::query("UPDATE tickets SET status = ? WHERE id = ?")
        .bind(to)
        .bind(id)
        .execute(&state.db)
        .await?;

    log_activity(
        &state.db,
        "ticket_updated",
        &format!("{} marked ticket {} as {}.", auth.display_name, id, to),
        Some(&auth.id),
        None,
    )
    .await;
    let _ = state
        .events
        .send(ChangeEvent::for_client("ticket_updated", &ticket.client_id));

    let mut updated = ticket;
    updated.status = to.to_string();
    Ok(updated)
}

/// Approving an order ticket issues its invoice in the same breath. The
/// invoice amount starts at zero and is finalized manually; billing
/// amounts are not derived from ticket text.
async fn approve_ticket(
    state: web::Data<AppState>,
    auth: web::ReqData<AuthUser>,
    path: web::Path<String>,
) -> Result<HttpResponse, PortalError> {
    let id = path.into_inner();
    let ticket = set_ticket_status(&state, &auth, &id, "pending", "approved").await?;

    if ticket.kind == "order" {
        sqlx::query(
            r#"INSERT INTO invoices (id, client_id, ticket_id, amount_cents, currency, status, issued_at)
               VALUES (?, ?, ?, 0, 'USD', 'issued', ?)"#,
        )
        .bind(new_id())
        .bind(&ticket.client_id)
        .bind(&ticket.id)
        .bind(Utc::now().to_rfc3339())
        .execute(&state.db)
        .await?;
    }
    Ok(HttpResponse::Ok().json(ticket_json(ticket)))
}

async fn reject_ticket(
    state: web::Data<AppState>,
    auth: web::ReqData<AuthUser>,
    path: web::Path<String>,
) -> Result<HttpResponse, PortalError> {
    let id = path.into_inner();
    let ticket = set_ticket_status(&state, &auth, &id, "pending", "rejected").await?;
    Ok(HttpResponse::Ok().json(ticket_json(ticket)))
}

async fn resolve_ticket(
    state: web::Data<AppState>,
    auth: web::ReqData<AuthUser>,
    path: web::Path<String>,
) -> Result<HttpResponse, PortalError> {
    let id = path.into_inner();
    let ticket = set_ticket_status(&state, &auth, &id, "approved", "resolved").await?;
    Ok(HttpResponse::Ok().json(ticket_json(ticket)))
}

async fn list_invoices(state: web::Data<AppState>) -> Result<HttpResponse, PortalError> {
    let rows = sqlx::query_as::<_, InvoiceRow>(
        "SELECT id, client_id, ticket_id, amount_cents, currency, status, issued_at FROM invoices ORDER BY issued_at DESC",
    )
    .fetch_all(&state.db)
    .await?;
    Ok(HttpResponse::Ok().json(rows.into_iter().map(invoice_json).collect::<Vec<_>>()))
}

fn invoice_json(row: InvoiceRow) -> serde_json::Value {
    json!({
        "id": row.id,
        "client_id": row.client_id,
        "ticket_id": row.ticket_id,
        "amount_cents": row.amount_cents,
        "currency": row.currency,
        "status": row.status,
        "issued_at": row.issued_at,
    })
}

async fn create_invoice(
    state: web::Data<AppState>,
    auth: web::ReqData<AuthUser>,
    form: web::Json<InvoiceForm>,
) -> Result<HttpResponse, PortalError> {
    let form = form.into_inner();
    fetch_client(&state, &form.client_id).await?;
    if form.amount_cents < 0 {
        return Err(PortalError::validation("invoice amount cannot be negative"));
    }

    let id = new_id();
    sqlx::query(
        r#"INSERT INTO invoices (id, client_id, ticket_id, amount_cents, currency, status, issued_at)
           VALUES (?, ?, NULL, ?, ?, 'issued', ?)"#,
    )
    .bind(&id)
    .bind(&form.client_id)
    .bind(form.amount_cents)
    .bind(form.currency.as_deref().unwrap_or("USD"))
    .bind(Utc::now().to_rfc3339())
    .execute(&state.db)
    .await?;

    log_activity(
        &state.db,
        "invoice_issued",
        &format!("{} issued an invoice for client {}.", auth.display_name, form.client_id),
        Some(&auth.id),
        None,
    )
    .await;
    let _ = state
        .events
        .send(ChangeEvent::for_client("invoice_issued", &form.client_id));
    Ok(HttpResponse::Created().json(json!({ "id": id })))
}

async fn financial_summary(state: web::Data<AppState>) -> Result<HttpResponse, PortalError> {
    let invoiced = count(&state, "SELECT COALESCE(SUM(amount_cents), 0) FROM invoices WHERE status != 'void'").await;
    let collected = count(&state, "SELECT COALESCE(SUM(amount_cents), 0) FROM invoices WHERE status = 'paid'").await;
    let outstanding = count(&state, "SELECT COALESCE(SUM(amount_cents), 0) FROM invoices WHERE status = 'issued'").await;
    let completed_visits = count(
        &state,
        "SELECT COUNT(*) FROM bookings WHERE is_blocked = 0 AND status = 'completed'",
    )
    .await;
    let resolved_tickets =
        count(&state, "SELECT COUNT(*) FROM tickets WHERE status = 'resolved'").await;

    Ok(HttpResponse::Ok().json(json!({
        "invoiced_cents": invoiced,
        "collected_cents": collected,
        "outstanding_cents": outstanding,
        "completed_visits": completed_visits,
        "resolved_tickets": resolved_tickets,
    })))
}
