use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::SqlitePool;

use crate::{
    availability,
    models::{
        BlockRecord, Booking, BookingRow, BookingStatus, Slot, TaskKind, TaskLink, TaskRow,
        TaskStatus, VisitKind, VisitTask, DAY_FORMAT,
    },
};

/// Persistence seam for the three orchestrated collections. The orchestrator
/// only talks to this trait, so failure behavior can be exercised with a
/// wrapped store in tests.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    async fn load_bookings(&self) -> Result<Vec<Booking>, sqlx::Error>;
    async fn load_blocks(&self) -> Result<Vec<BlockRecord>, sqlx::Error>;
    async fn load_tasks(&self) -> Result<Vec<VisitTask>, sqlx::Error>;

    async fn insert_booking(&self, booking: &Booking) -> Result<(), sqlx::Error>;
    async fn set_booking_status(&self, id: &str, status: BookingStatus) -> Result<u64, sqlx::Error>;
    async fn reschedule_booking(
        &self,
        id: &str,
        date: NaiveDate,
        slot: &Slot,
    ) -> Result<u64, sqlx::Error>;
    async fn delete_booking(&self, id: &str) -> Result<u64, sqlx::Error>;

    async fn insert_block(&self, block: &BlockRecord) -> Result<(), sqlx::Error>;
    async fn delete_block(&self, date: NaiveDate, client_id: Option<&str>)
        -> Result<u64, sqlx::Error>;
    async fn clear_blocks(&self) -> Result<u64, sqlx::Error>;

    async fn insert_task(&self, task: &VisitTask) -> Result<(), sqlx::Error>;
    async fn update_task(&self, task: &VisitTask) -> Result<u64, sqlx::Error>;
    async fn delete_task(&self, id: &str) -> Result<u64, sqlx::Error>;
    async fn mark_tasks_viewed(&self) -> Result<u64, sqlx::Error>;
}

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn parse_day(value: &str) -> Result<NaiveDate, sqlx::Error> {
    NaiveDate::parse_from_str(value, DAY_FORMAT)
        .map_err(|_| sqlx::Error::Protocol(format!("invalid calendar day: {value}")))
}

fn booking_from_row(row: BookingRow) -> Result<Booking, sqlx::Error> {
    let slot = match row.time {
        Some(label) if !label.trim().is_empty() => {
            let minutes = match row.slot_minutes {
                Some(minutes) => u16::try_from(minutes).map_err(|_| {
                    sqlx::Error::Protocol(format!("unreadable slot minutes: {minutes}"))
                })?,
                // Older rows predate normalized minutes; recover from the label.
                None => availability::slot_minutes(&label).ok_or_else(|| {
                    sqlx::Error::Protocol(format!("unreadable slot label: {label}"))
                })?,
            };
            Some(Slot { label, minutes })
        }
        _ => None,
    };
    Ok(Booking {
        id: row.id,
        client_id: row.client_id,
        client_name: row.client_name,
        date: parse_day(&row.date)?,
        slot,
        kind: VisitKind::parse(&row.kind)
            .ok_or_else(|| sqlx::Error::Protocol(format!("unknown visit kind: {}", row.kind)))?,
        status: BookingStatus::parse(&row.status)
            .ok_or_else(|| sqlx::Error::Protocol(format!("unknown booking status: {}", row.status)))?,
        branch_id: row.branch_id,
        branch_name: row.branch_name,
        created_at: row.created_at,
    })
}

fn block_from_row(row: BookingRow) -> Result<BlockRecord, sqlx::Error> {
    Ok(BlockRecord {
        id: row.id,
        date: parse_day(&row.date)?,
        client_id: row.client_id,
        created_at: row.created_at,
    })
}

fn task_from_row(row: TaskRow) -> Result<VisitTask, sqlx::Error> {
    let visit_date = match row.visit_date {
        Some(value) if !value.trim().is_empty() => Some(parse_day(&value)?),
        _ => None,
    };
    Ok(VisitTask {
        id: row.id,
        link: TaskLink::from_booking_id(row.booking_id),
        client_id: row.client_id,
        text: row.text,
        notes: row.notes,
        kind: TaskKind::parse(&row.kind)
            .ok_or_else(|| sqlx::Error::Protocol(format!("unknown task kind: {}", row.kind)))?,
        status: TaskStatus::parse(&row.status)
            .ok_or_else(|| sqlx::Error::Protocol(format!("unknown task status: {}", row.status)))?,
        viewed_by_admin: row.is_viewed_by_admin != 0,
        visit_date,
        reason: row.reason,
        created_at: row.created_at,
    })
}

const BOOKING_COLUMNS: &str = "id, client_id, client_name, date, time, slot_minutes, kind, status, branch_id, branch_name, is_blocked, created_at";

#[async_trait]
impl Store for SqliteStore {
    async fn load_bookings(&self) -> Result<Vec<Booking>, sqlx::Error> {
        let rows = sqlx::query_as::<_, BookingRow>(&format!(
            "SELECT {BOOKING_COLUMNS} FROM bookings WHERE is_blocked = 0 ORDER BY date, slot_minutes"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(booking_from_row).collect()
    }

    async fn load_blocks(&self) -> Result<Vec<BlockRecord>, sqlx::Error> {
        let rows = sqlx::query_as::<_, BookingRow>(&format!(
            "SELECT {BOOKING_COLUMNS} FROM bookings WHERE is_blocked = 1 ORDER BY date"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(block_from_row).collect()
    }

    async fn load_tasks(&self) -> Result<Vec<VisitTask>, sqlx::Error> {
        let rows = sqlx::query_as::<_, TaskRow>(
            r#"SELECT id, booking_id, client_id, text, notes, kind, status,
                      is_viewed_by_admin, visit_date, reason, created_at
               FROM visit_tasks
               ORDER BY created_at"#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(task_from_row).collect()
    }

    async fn insert_booking(&self, booking: &Booking) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"INSERT INTO bookings
               (id, client_id, client_name, date, time, slot_minutes, kind, status, branch_id, branch_name, is_blocked, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?)"#,
        )
        .bind(&booking.id)
        .bind(&booking.client_id)
        .bind(&booking.client_name)
        .bind(booking.date.format(DAY_FORMAT).to_string())
        .bind(booking.slot.as_ref().map(|slot| slot.label.clone()))
        .bind(booking.slot.as_ref().map(|slot| slot.minutes as i64))
        .bind(booking.kind.as_str())
        .bind(booking.status.as_str())
        .bind(&booking.branch_id)
        .bind(&booking.branch_name)
        .bind(&booking.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_booking_status(&self, id: &str, status: BookingStatus) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("UPDATE bookings SET status = ? WHERE id = ? AND is_blocked = 0")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn reschedule_booking(
        &self,
        id: &str,
        date: NaiveDate,
        slot: &Slot,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE bookings SET date = ?, time = ?, slot_minutes = ? WHERE id = ? AND is_blocked = 0",
        )
        .bind(date.format(DAY_FORMAT).to_string())
        .bind(&slot.label)
        .bind(slot.minutes as i64)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn delete_booking(&self, id: &str) -> Result<u64, sqlx::Error> {
        // Cascade-null: tasks referencing the visit drop to the general pool
        // in the same transaction, so no dangling links survive.
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE visit_tasks SET booking_id = NULL WHERE booking_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM bookings WHERE id = ? AND is_blocked = 0")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }

    async fn insert_block(&self, block: &BlockRecord) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"INSERT INTO bookings
               (id, client_id, client_name, date, time, slot_minutes, kind, status, branch_id, branch_name, is_blocked, created_at)
               VALUES (?, ?, '', ?, NULL, NULL, 'on_site', 'pending', NULL, NULL, 1, ?)"#,
        )
        .bind(&block.id)
        .bind(&block.client_id)
        .bind(block.date.format(DAY_FORMAT).to_string())
        .bind(&block.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_block(
        &self,
        date: NaiveDate,
        client_id: Option<&str>,
    ) -> Result<u64, sqlx::Error> {
        let query = match client_id {
            Some(_) => "DELETE FROM bookings WHERE is_blocked = 1 AND date = ? AND client_id = ?",
            None => "DELETE FROM bookings WHERE is_blocked = 1 AND date = ? AND client_id IS NULL",
        };
        let mut statement = sqlx::query(query).bind(date.format(DAY_FORMAT).to_string());
        if let Some(client_id) = client_id {
            statement = statement.bind(client_id);
        }
        let result = statement.execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn clear_blocks(&self) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM bookings WHERE is_blocked = 1")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn insert_task(&self, task: &VisitTask) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"INSERT INTO visit_tasks
               (id, booking_id, client_id, text, notes, kind, status, is_viewed_by_admin, visit_date, reason, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&task.id)
        .bind(task.link.booking_id())
        .bind(&task.client_id)
        .bind(&task.text)
        .bind(&task.notes)
        .bind(task.kind.as_str())
        .bind(task.status.as_str())
        .bind(task.viewed_by_admin as i64)
        .bind(task.visit_date.map(|date| date.format(DAY_FORMAT).to_string()))
        .bind(&task.reason)
        .bind(&task.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_task(&self, task: &VisitTask) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"UPDATE visit_tasks
               SET booking_id = ?, text = ?, notes = ?, status = ?, is_viewed_by_admin = ?, visit_date = ?, reason = ?
               WHERE id = ?"#,
        )
        .bind(task.link.booking_id())
        .bind(&task.text)
        .bind(&task.notes)
        .bind(task.status.as_str())
        .bind(task.viewed_by_admin as i64)
        .bind(task.visit_date.map(|date| date.format(DAY_FORMAT).to_string()))
        .bind(&task.reason)
        .bind(&task.id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn delete_task(&self, id: &str) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM visit_tasks WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn mark_tasks_viewed(&self) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("UPDATE visit_tasks SET is_viewed_by_admin = 1 WHERE is_viewed_by_admin = 0")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_store() -> SqliteStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        SqliteStore::new(pool)
    }

    async fn insert_raw_booking(store: &SqliteStore, id: &str, time: &str, minutes: Option<i64>) {
        sqlx::query(
            r#"INSERT INTO bookings
               (id, client_id, client_name, date, time, slot_minutes, kind, status, is_blocked, created_at)
               VALUES (?, 'c1', 'Acme', '2024-05-10', ?, ?, 'on_site', 'confirmed', 0, '')"#,
        )
        .bind(id)
        .bind(time)
        .bind(minutes)
        .execute(&store.pool)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn out_of_range_slot_minutes_is_rejected_not_wrapped() {
        let store = test_store().await;
        // 65836 would wrap to 300 through a plain cast.
        insert_raw_booking(&store, "b1", "05:00 AM", Some(65836)).await;

        let loaded = store.load_bookings().await;
        assert!(matches!(loaded, Err(sqlx::Error::Protocol(_))));
    }

    #[tokio::test]
    async fn missing_slot_minutes_recovers_from_the_label() {
        let store = test_store().await;
        insert_raw_booking(&store, "b1", "01:30 PM", None).await;

        let loaded = store.load_bookings().await.unwrap();
        assert_eq!(loaded[0].slot.as_ref().unwrap().minutes, 810);
    }
}
