use actix_web::{web, HttpResponse};
use actix_web_httpauth::middleware::HttpAuthentication;
use serde::Deserialize;

use crate::{
    auth::{technician_validator, AuthUser},
    db::log_activity,
    error::PortalError,
    models::BookingStatus,
    routes::{
        admin::{BookingView, TaskView},
        parse_day, today,
    },
    state::AppState,
};

#[derive(Deserialize)]
struct ScheduleQuery {
    date: Option<String>,
}

#[derive(Deserialize)]
struct VisitFilter {
    status: Option<String>,
}

#[derive(Deserialize)]
struct StatusForm {
    status: String,
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/technician")
            .wrap(HttpAuthentication::basic(technician_validator))
            .service(web::resource("/schedule").route(web::get().to(schedule)))
            .service(web::resource("/visits").route(web::get().to(list_visits)))
            .service(web::resource("/visits/{id}/status").route(web::post().to(update_visit_status)))
            .service(web::resource("/visits/{id}/tasks").route(web::get().to(visit_tasks)))
            .service(web::resource("/tasks/{id}/toggle").route(web::post().to(toggle_task))),
    );
}

async fn schedule(
    state: web::Data<AppState>,
    query: web::Query<ScheduleQuery>,
) -> Result<HttpResponse, PortalError> {
    let date = match query.date.as_deref() {
        Some(value) => parse_day(value)?,
        None => today(),
    };
    let schedule = state.portal.day_schedule(date).await;
    let views: Vec<BookingView> = schedule.iter().map(BookingView::from).collect();
    Ok(HttpResponse::Ok().json(views))
}

async fn list_visits(
    state: web::Data<AppState>,
    query: web::Query<VisitFilter>,
) -> Result<HttpResponse, PortalError> {
    let status = match query.status.as_deref().filter(|s| !s.is_empty()) {
        Some(value) => Some(
            BookingStatus::parse(value)
                .ok_or_else(|| PortalError::validation(format!("unknown status: {value}")))?,
        ),
        None => None,
    };
    let bookings = state.portal.bookings().await;
    let views: Vec<BookingView> = bookings
        .iter()
        .filter(|booking| status.is_none_or(|wanted| booking.status == wanted))
        .map(BookingView::from)
        .collect();
    Ok(HttpResponse::Ok().json(views))
}

/// Technicians confirm and complete visits; cancellations stay with the
/// office.
async fn update_visit_status(
    state: web::Data<AppState>,
    auth: web::ReqData<AuthUser>,
    path: web::Path<String>,
    form: web::Json<StatusForm>,
) -> Result<HttpResponse, PortalError> {
    let id = path.into_inner();
    let status = BookingStatus::parse(&form.status)
        .ok_or_else(|| PortalError::validation(format!("unknown status: {}", form.status)))?;
    if !matches!(status, BookingStatus::Confirmed | BookingStatus::Completed) {
        return Err(PortalError::Forbidden {
            hint: "technicians may only confirm or complete visits",
        });
    }

    let booking = state.portal.update_status(&id, status).await?;
    log_activity(
        &state.db,
        "visit_updated",
        &format!(
            "{} marked visit {} as {}.",
            auth.display_name,
            id,
            status.as_str()
        ),
        Some(&auth.id),
        Some(&id),
    )
    .await;
    Ok(HttpResponse::Ok().json(BookingView::from(&booking)))
}

async fn visit_tasks(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, PortalError> {
    let booking_id = path.into_inner();
    if state.portal.booking(&booking_id).await.is_none() {
        return Err(PortalError::NotFound("booking"));
    }
    let tasks = state.portal.tasks().await;
    let views: Vec<TaskView> = tasks
        .iter()
        .filter(|task| task.link.booking_id() == Some(booking_id.as_str()))
        .map(TaskView::from)
        .collect();
    Ok(HttpResponse::Ok().json(views))
}

async fn toggle_task(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, PortalError> {
    let id = path.into_inner();
    let task = state.portal.toggle_task_completion(&id).await?;
    Ok(HttpResponse::Ok().json(TaskView::from(&task)))
}
