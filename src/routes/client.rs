use actix_web::{web, HttpResponse};
use actix_web_httpauth::middleware::HttpAuthentication;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use crate::{
    auth::{client_validator, new_id, AuthUser},
    db::log_activity,
    error::PortalError,
    models::{BookingStatus, ClientRow, InvoiceRow, TaskKind, TaskLink, TicketRow, VisitKind},
    orchestrator::{NewBooking, NewTask},
    routes::{
        admin::{BookingView, ClientView, TaskView},
        parse_day,
    },
    state::{AppState, ChangeEvent},
    tasks::{group_for, TaskGroup},
};

#[derive(Deserialize)]
struct VisitRequestForm {
    date: String,
    time: String,
    kind: Option<String>,
    branch_id: Option<String>,
    branch_name: Option<String>,
}

#[derive(Deserialize)]
struct TaskRequestForm {
    text: String,
    notes: Option<String>,
    booking_id: Option<String>,
}

#[derive(Deserialize)]
struct TicketForm {
    subject: String,
    body: Option<String>,
    kind: Option<String>,
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/client")
            .wrap(HttpAuthentication::basic(client_validator))
            .service(web::resource("/profile").route(web::get().to(profile)))
            .service(
                web::resource("/bookings")
                    .route(web::get().to(list_bookings))
                    .route(web::post().to(request_visit)),
            )
            .service(
                web::resource("/tasks")
                    .route(web::get().to(list_tasks))
                    .route(web::post().to(request_task)),
            )
            .service(
                web::resource("/tickets")
                    .route(web::get().to(list_tickets))
                    .route(web::post().to(open_ticket)),
            )
            .service(web::resource("/invoices").route(web::get().to(list_invoices))),
    );
}

fn client_id(auth: &AuthUser) -> Result<String, PortalError> {
    auth.client_id.clone().ok_or(PortalError::Forbidden {
        hint: "this account is not linked to a client profile",
    })
}

async fn profile(
    state: web::Data<AppState>,
    auth: web::ReqData<AuthUser>,
) -> Result<HttpResponse, PortalError> {
    let client_id = client_id(&auth)?;
    let row = sqlx::query_as::<_, ClientRow>(
        r#"SELECT id, name, phone, email, branch_id, branch_name, visits_limit, visits_used,
                  tickets_limit, tickets_used, users_limit, contract_start, contract_end, created_at
           FROM clients WHERE id = ? LIMIT 1"#,
    )
    .bind(&client_id)
    .fetch_optional(&state.db)
    .await?
    .ok_or(PortalError::NotFound("client"))?;
    Ok(HttpResponse::Ok().json(ClientView::from(row)))
}

async fn list_bookings(
    state: web::Data<AppState>,
    auth: web::ReqData<AuthUser>,
) -> Result<HttpResponse, PortalError> {
    let client_id = client_id(&auth)?;
    let bookings = state.portal.bookings().await;
    let views: Vec<BookingView> = bookings
        .iter()
        .filter(|booking| booking.client_id.as_deref() == Some(client_id.as_str()))
        .map(BookingView::from)
        .collect();
    Ok(HttpResponse::Ok().json(views))
}

/// Self-service visit requests always start pending; an admin confirms
/// them. Availability checks include this client's own blocked dates.
async fn request_visit(
    state: web::Data<AppState>,
    auth: web::ReqData<AuthUser>,
    form: web::Json<VisitRequestForm>,
) -> Result<HttpResponse, PortalError> {
    let client_id = client_id(&auth)?;
    let form = form.into_inner();
    let kind = match form.kind.as_deref() {
        Some(value) => VisitKind::parse(value)
            .ok_or_else(|| PortalError::validation(format!("unknown visit kind: {value}")))?,
        None => VisitKind::OnSite,
    };

    let booking = state
        .portal
        .create(NewBooking {
            client_id: Some(client_id.clone()),
            client_name: auth.display_name.clone(),
            date: parse_day(&form.date)?,
            time: form.time,
            kind,
            status: BookingStatus::Pending,
            branch_id: form.branch_id,
            branch_name: form.branch_name,
        })
        .await?;

    log_activity(
        &state.db,
        "visit_requested",
        &format!("{} requested a visit on {}.", auth.display_name, form.date),
        Some(&auth.id),
        Some(&booking.id),
    )
    .await;
    Ok(HttpResponse::Created().json(BookingView::from(&booking)))
}

async fn list_tasks(
    state: web::Data<AppState>,
    auth: web::ReqData<AuthUser>,
) -> Result<HttpResponse, PortalError> {
    let client_id = client_id(&auth)?;
    let tasks = state.portal.tasks().await;
    let mut action_required = Vec::new();
    let mut scheduled = Vec::new();
    let mut history = Vec::new();
    for task in tasks.iter().filter(|task| task.client_id == client_id) {
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

async fn request_task(
    state: web::Data<AppState>,
    auth: web::ReqData<AuthUser>,
    form: web::Json<TaskRequestForm>,
) -> Result<HttpResponse, PortalError> {
    let client_id = client_id(&auth)?;
    let form = form.into_inner();

    // A client may only attach a task to one of its own visits.
    let link = match TaskLink::from_booking_id(form.booking_id) {
        TaskLink::LinkedTo(booking_id) => {
            let booking = state
                .portal
                .booking(&booking_id)
                .await
                .ok_or(PortalError::NotFound("booking"))?;
            if booking.client_id.as_deref() != Some(client_id.as_str()) {
                return Err(PortalError::Forbidden {
                    hint: "the visit belongs to another client",
                });
            }
            TaskLink::LinkedTo(booking_id)
        }
        TaskLink::Unscheduled => TaskLink::Unscheduled,
    };

    let task = state
        .portal
        .add_task(NewTask {
            link,
            client_id,
            text: form.text,
            notes: form.notes,
            kind: TaskKind::ClientRequest,
            visit_date: None,
        })
        .await?;

    log_activity(
        &state.db,
        "task_requested",
        &format!("{} submitted a request: {}.", auth.display_name, task.text),
        Some(&auth.id),
        task.link.booking_id(),
    )
    .await;
    Ok(HttpResponse::Created().json(TaskView::from(&task)))
}

async fn list_tickets(
    state: web::Data<AppState>,
    auth: web::ReqData<AuthUser>,
) -> Result<HttpResponse, PortalError> {
    let client_id = client_id(&auth)?;
    let rows = sqlx::query_as::<_, TicketRow>(
        "SELECT id, client_id, subject, body, kind, status, created_at FROM tickets WHERE client_id = ? ORDER BY created_at DESC",
    )
    .bind(&client_id)
    .fetch_all(&state.db)
    .await?;
    let tickets: Vec<_> = rows
        .into_iter()
        .map(|row| {
            json!({
                "id": row.id,
                "subject": row.subject,
                "body": row.body,
                "kind": row.kind,
                "status": row.status,
                "created_at": row.created_at,
            })
        })
        .collect();
    Ok(HttpResponse::Ok().json(tickets))
}

async fn open_ticket(
    state: web::Data<AppState>,
    auth: web::ReqData<AuthUser>,
    form: web::Json<TicketForm>,
) -> Result<HttpResponse, PortalError> {
    let client_id = client_id(&auth)?;
    let form = form.into_inner();
    if form.subject.trim().is_empty() {
        return Err(PortalError::validation("ticket subject is required"));
    }
    let kind = match form.kind.as_deref().unwrap_or("standard") {
        "standard" => "standard",
        "order" => "order",
        other => {
            return Err(PortalError::validation(format!("unknown ticket kind: {other}")));
        }
    };

    let id = new_id();
    sqlx::query(
        r#"INSERT INTO tickets (id, client_id, subject, body, kind, status, created_at)
           VALUES (?, ?, ?, ?, ?, 'pending', ?)"#,
    )
    .bind(&id)
    .bind(&client_id)
    .bind(form.subject.trim())
    .bind(form.body.as_deref().unwrap_or(""))
    .bind(kind)
    .bind(Utc::now().to_rfc3339())
    .execute(&state.db)
    .await?;

    log_activity(
        &state.db,
        "ticket_opened",
        &format!("{} opened a ticket: {}.", auth.display_name, form.subject.trim()),
        Some(&auth.id),
        None,
    )
    .await;
    let _ = state
        .events
        .send(ChangeEvent::for_client("ticket_opened", &client_id));
    Ok(HttpResponse::Created().json(json!({ "id": id })))
}

async fn list_invoices(
    state: web::Data<AppState>,
    auth: web::ReqData<AuthUser>,
) -> Result<HttpResponse, PortalError> {
    let client_id = client_id(&auth)?;
    let rows = sqlx::query_as::<_, InvoiceRow>(
        "SELECT id, client_id, ticket_id, amount_cents, currency, status, issued_at FROM invoices WHERE client_id = ? ORDER BY issued_at DESC",
    )
    .bind(&client_id)
    .fetch_all(&state.db)
    .await?;
    let invoices: Vec<_> = rows
        .into_iter()
        .map(|row| {
            json!({
                "id": row.id,
                "amount_cents": row.amount_cents,
                "currency": row.currency,
                "status": row.status,
                "issued_at": row.issued_at,
            })
        })
        .collect();
    Ok(HttpResponse::Ok().json(invoices))
}
