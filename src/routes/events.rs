use actix_web::{http::header, web, HttpMessage, HttpRequest, HttpResponse};
use actix_web_httpauth::middleware::HttpAuthentication;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::{
    auth::{client_validator, staff_validator, AuthUser},
    state::{AppState, ChangeEvent},
};

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::resource("/api/events")
            .wrap(HttpAuthentication::basic(staff_validator))
            .route(web::get().to(stream_events)),
    )
    .service(
        web::resource("/api/events/client")
            .wrap(HttpAuthentication::basic(client_validator))
            .route(web::get().to(stream_client_events)),
    );
}

/// Full change feed for staff dashboards. Subscribers refetch through the
/// API whenever an event arrives.
async fn stream_events(state: web::Data<AppState>) -> HttpResponse {
    let rx = state.events.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|result| match result {
        Ok(event) => Some(Ok::<web::Bytes, actix_web::Error>(event_to_bytes(&event))),
        Err(_) => None,
    });

    HttpResponse::Ok()
        .insert_header((header::CONTENT_TYPE, "text/event-stream"))
        .insert_header((header::CACHE_CONTROL, "no-cache"))
        .streaming(stream)
}

/// Per-client feed: only events scoped to the caller's own profile.
async fn stream_client_events(state: web::Data<AppState>, req: HttpRequest) -> HttpResponse {
    let client_id = req
        .extensions()
        .get::<AuthUser>()
        .and_then(|user| user.client_id.clone());
    let Some(client_id) = client_id else {
        return HttpResponse::Forbidden().finish();
    };

    let rx = state.events.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(move |result| {
        let event = match result {
            Ok(event) => event,
            Err(_) => return None,
        };
        if event.client_id.as_deref() != Some(&client_id) {
            return None;
        }
        Some(Ok::<web::Bytes, actix_web::Error>(event_to_bytes(&event)))
    });

    HttpResponse::Ok()
        .insert_header((header::CONTENT_TYPE, "text/event-stream"))
        .insert_header((header::CACHE_CONTROL, "no-cache"))
        .streaming(stream)
}

fn event_to_bytes(event: &ChangeEvent) -> web::Bytes {
    let payload = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    web::Bytes::from(format!("event: update\ndata: {}\n\n", payload))
}
