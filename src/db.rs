use std::{env, fs, path::Path};

use chrono::Utc;
use sqlx::SqlitePool;

use crate::{
    auth::{hash_password, new_id},
    models::{ROLE_ADMIN, ROLE_TECHNICIAN},
};

pub async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

pub fn ensure_sqlite_dir(db_url: &str) -> std::io::Result<()> {
    let path = if let Some(path) = db_url.strip_prefix("sqlite://") {
        Some(path)
    } else if let Some(path) = db_url.strip_prefix("sqlite:") {
        Some(path)
    } else {
        None
    };

    let Some(path) = path else {
        return Ok(());
    };

    let path = path.split('?').next().unwrap_or(path);
    if path == ":memory:" || path.is_empty() {
        return Ok(());
    }

    let path = path.strip_prefix("file:").unwrap_or(path);
    let db_path = Path::new(path);
    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

pub async fn seed_defaults(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    seed_admin(pool).await?;
    seed_technician(pool).await?;
    Ok(())
}

/// Notification sink: every mutation leaves a human-readable trail entry
/// behind. Never fails the calling operation.
pub async fn log_activity(
    pool: &SqlitePool,
    kind: &str,
    message: &str,
    user_id: Option<&str>,
    booking_id: Option<&str>,
) {
    let _ = sqlx::query(
        r#"INSERT INTO activities (id, kind, message, created_at, user_id, booking_id)
           VALUES (?, ?, ?, ?, ?, ?)"#,
    )
    .bind(new_id())
    .bind(kind)
    .bind(message)
    .bind(Utc::now().to_rfc3339())
    .bind(user_id)
    .bind(booking_id)
    .execute(pool)
    .await;
}

async fn seed_admin(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    let existing =
        sqlx::query_as::<_, (String,)>("SELECT id FROM users WHERE role = ? LIMIT 1")
            .bind(ROLE_ADMIN)
            .fetch_optional(pool)
            .await?;

    if existing.is_some() {
        return Ok(());
    }

    let username = env::var("ADMIN_USER").unwrap_or_else(|_| "admin".to_string());
    let password = env::var("ADMIN_PASSWORD").unwrap_or_else(|_| "admin".to_string());
    let display_name =
        env::var("ADMIN_DISPLAY_NAME").unwrap_or_else(|_| "Portal Admin".to_string());

    if password == "admin" {
        log::warn!("ADMIN_PASSWORD not set. Using default password 'admin'. Set ADMIN_PASSWORD in production.");
    }

    insert_user(pool, &username, &display_name, ROLE_ADMIN, None, &password).await
}

async fn seed_technician(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    let wanted = env::var("SEED_TECHNICIAN").unwrap_or_else(|_| "false".to_string());
    if wanted != "true" {
        return Ok(());
    }

    let existing =
        sqlx::query_as::<_, (String,)>("SELECT id FROM users WHERE role = ? LIMIT 1")
            .bind(ROLE_TECHNICIAN)
            .fetch_optional(pool)
            .await?;
    if existing.is_some() {
        return Ok(());
    }

    let username = env::var("TECHNICIAN_USER").unwrap_or_else(|_| "tech1".to_string());
    let password = env::var("TECHNICIAN_PASSWORD").unwrap_or_else(|_| "change-me".to_string());
    let display_name =
        env::var("TECHNICIAN_DISPLAY_NAME").unwrap_or_else(|_| "Technician One".to_string());
    if password == "change-me" {
        log::warn!("TECHNICIAN_PASSWORD not set. Using default password 'change-me'. Set TECHNICIAN_PASSWORD in production.");
    }

    insert_user(pool, &username, &display_name, ROLE_TECHNICIAN, None, &password).await
}

pub async fn insert_user(
    pool: &SqlitePool,
    username: &str,
    display_name: &str,
    role: &str,
    client_id: Option<&str>,
    password: &str,
) -> Result<(), sqlx::Error> {
    let password_hash = hash_password(password)
        .map_err(|_| sqlx::Error::Protocol("password hash failed".into()))?;
    let now = Utc::now().to_rfc3339();

    sqlx::query(
        r#"INSERT INTO users (id, username, display_name, role, client_id, password_hash, active, created_at)
           VALUES (?, ?, ?, ?, ?, ?, 1, ?)"#,
    )
    .bind(new_id())
    .bind(username)
    .bind(display_name)
    .bind(role)
    .bind(client_id)
    .bind(password_hash)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(())
}
