use std::collections::HashMap;

use chrono::{NaiveDate, Utc};
use tokio::sync::{broadcast, RwLock};

use crate::{
    auth::new_id,
    availability,
    error::PortalError,
    models::{
        BlockRecord, Booking, BookingStatus, Slot, TaskKind, TaskLink, TaskStatus, VisitKind,
        VisitTask, DAY_FORMAT,
    },
    state::ChangeEvent,
    store::Store,
    tasks::{self, PostponeOutcome, PostponeTarget},
};

#[derive(Debug, Clone)]
pub struct NewBooking {
    pub client_id: Option<String>,
    pub client_name: String,
    pub date: NaiveDate,
    pub time: String,
    pub kind: VisitKind,
    pub status: BookingStatus,
    pub branch_id: Option<String>,
    pub branch_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewTask {
    pub link: TaskLink,
    pub client_id: String,
    pub text: String,
    pub notes: Option<String>,
    pub kind: TaskKind,
    pub visit_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub text: Option<String>,
    pub notes: Option<String>,
    pub status: Option<TaskStatus>,
    pub visit_date: Option<NaiveDate>,
}

#[derive(Default)]
struct Cache {
    bookings: Vec<Booking>,
    blocks: Vec<BlockRecord>,
    tasks: Vec<VisitTask>,
    // Ids with a local write still in flight, mapped to the generation that
    // issued it. A refresh never overwrites these entries, so a push-driven
    // reload cannot clobber an optimistic update mid-round-trip.
    in_flight: HashMap<String, u64>,
    write_gen: u64,
}

/// The single coordination point between API handlers and the store. Owns
/// an in-memory copy of bookings, tasks and block records; every successful
/// mutation refreshes it and emits a [`ChangeEvent`].
pub struct Orchestrator<S: Store> {
    store: S,
    cache: RwLock<Cache>,
    events: broadcast::Sender<ChangeEvent>,
}

impl<S: Store> Orchestrator<S> {
    pub fn new(store: S, events: broadcast::Sender<ChangeEvent>) -> Self {
        Self {
            store,
            cache: RwLock::new(Cache::default()),
            events,
        }
    }

    fn emit(&self, event: ChangeEvent) {
        let _ = self.events.send(event);
    }

    /// Reloads all three collections from the store. Records with an
    /// in-flight local write keep their local version until that write's
    /// own round-trip settles.
    pub async fn refresh(&self) -> Result<(), PortalError> {
        let bookings = self.store.load_bookings().await?;
        let blocks = self.store.load_blocks().await?;
        let tasks = self.store.load_tasks().await?;

        let mut guard = self.cache.write().await;
        let cache = &mut *guard;
        cache.bookings = merge_pending(bookings, &cache.bookings, &cache.in_flight, |b| &b.id);
        cache.tasks = merge_pending(tasks, &cache.tasks, &cache.in_flight, |t| &t.id);
        cache.blocks = blocks;
        Ok(())
    }

    pub async fn bookings(&self) -> Vec<Booking> {
        self.cache.read().await.bookings.clone()
    }

    pub async fn blocks(&self) -> Vec<BlockRecord> {
        self.cache.read().await.blocks.clone()
    }

    pub async fn tasks(&self) -> Vec<VisitTask> {
        self.cache.read().await.tasks.clone()
    }

    pub async fn booking(&self, id: &str) -> Option<Booking> {
        self.cache
            .read()
            .await
            .bookings
            .iter()
            .find(|booking| booking.id == id)
            .cloned()
    }

    pub async fn task(&self, id: &str) -> Option<VisitTask> {
        self.cache
            .read()
            .await
            .tasks
            .iter()
            .find(|task| task.id == id)
            .cloned()
    }

    pub async fn day_schedule(&self, date: NaiveDate) -> Vec<Booking> {
        availability::day_schedule(date, &self.cache.read().await.bookings)
    }

    pub async fn is_date_blocked(&self, date: NaiveDate, client_id: Option<&str>) -> bool {
        availability::is_date_blocked(date, client_id, &self.cache.read().await.blocks)
    }

    /// Books a visit. The availability pre-checks run against the cache
    /// before anything is persisted; a rejected create leaves no state
    /// behind. The created-at stamp is always assigned here.
    pub async fn create(&self, new: NewBooking) -> Result<Booking, PortalError> {
        let label = new.time.trim().to_string();
        if label.is_empty() {
            return Err(PortalError::validation("a time slot is required"));
        }
        let minutes = availability::slot_minutes(&label)
            .ok_or_else(|| PortalError::validation(format!("unreadable time slot: {label}")))?;

        {
            let cache = self.cache.read().await;
            if availability::is_date_blocked(new.date, new.client_id.as_deref(), &cache.blocks) {
                return Err(PortalError::DateBlocked {
                    date: new.date.format(DAY_FORMAT).to_string(),
                });
            }
            if availability::is_slot_taken(new.date, &label, &cache.bookings) {
                return Err(PortalError::SlotTaken {
                    date: new.date.format(DAY_FORMAT).to_string(),
                    time: label,
                });
            }
        }

        let booking = Booking {
            id: new_id(),
            client_id: new.client_id,
            client_name: new.client_name,
            date: new.date,
            slot: Some(Slot { label, minutes }),
            kind: new.kind,
            status: new.status,
            branch_id: new.branch_id,
            branch_name: new.branch_name,
            created_at: Utc::now().to_rfc3339(),
        };

        self.store.insert_booking(&booking).await?;
        self.refresh().await?;
        self.emit(ChangeEvent::booking("booking_created", &booking));
        Ok(booking)
    }

    pub async fn update_status(
        &self,
        id: &str,
        status: BookingStatus,
    ) -> Result<Booking, PortalError> {
        let mut booking = self.booking(id).await.ok_or(PortalError::NotFound("booking"))?;
        let changed = self.store.set_booking_status(id, status).await?;
        if changed == 0 {
            return Err(PortalError::NotFound("booking"));
        }
        self.refresh().await?;
        booking.status = status;
        self.emit(ChangeEvent::booking("booking_updated", &booking));
        Ok(booking)
    }

    pub async fn reschedule(
        &self,
        id: &str,
        date: NaiveDate,
        time: &str,
        today: NaiveDate,
    ) -> Result<Booking, PortalError> {
        let booking = self.booking(id).await.ok_or(PortalError::NotFound("booking"))?;
        if !availability::is_editable(booking.date, today) {
            return Err(PortalError::NotEditable);
        }

        let label = time.trim().to_string();
        let minutes = availability::slot_minutes(&label)
            .ok_or_else(|| PortalError::validation(format!("unreadable time slot: {time}")))?;

        {
            let cache = self.cache.read().await;
            if availability::is_date_blocked(date, booking.client_id.as_deref(), &cache.blocks) {
                return Err(PortalError::DateBlocked {
                    date: date.format(DAY_FORMAT).to_string(),
                });
            }
            let taken = cache.bookings.iter().any(|other| {
                other.id != id
                    && other.status != BookingStatus::Cancelled
                    && other.date == date
                    && other.slot.as_ref().is_some_and(|slot| slot.label == label)
            });
            if taken {
                return Err(PortalError::SlotTaken {
                    date: date.format(DAY_FORMAT).to_string(),
                    time: label,
                });
            }
        }

        let slot = Slot { label, minutes };
        let changed = self.store.reschedule_booking(id, date, &slot).await?;
        if changed == 0 {
            return Err(PortalError::NotFound("booking"));
        }
        self.refresh().await?;
        let mut updated = booking;
        updated.date = date;
        updated.slot = Some(slot);
        self.emit(ChangeEvent::booking("booking_rescheduled", &updated));
        Ok(updated)
    }

    /// Hard delete. The row (and, in the same transaction, every task link
    /// pointing at it) goes first; the cache is then patched directly
    /// instead of refreshed, since a refresh could race the deletion.
    pub async fn delete(&self, id: &str) -> Result<(), PortalError> {
        let booking = self.booking(id).await.ok_or(PortalError::NotFound("booking"))?;
        let deleted = self.store.delete_booking(id).await?;
        if deleted == 0 {
            return Err(PortalError::NotFound("booking"));
        }

        {
            let mut guard = self.cache.write().await;
            let cache = &mut *guard;
            cache.bookings.retain(|entry| entry.id != id);
            for task in cache.tasks.iter_mut() {
                if task.link.booking_id() == Some(id) {
                    task.link = TaskLink::Unscheduled;
                }
            }
        }
        self.emit(ChangeEvent::booking("booking_deleted", &booking));
        Ok(())
    }

    /// Flips the block state for an exact (date, client) pair and reports
    /// the new state. While a global block covers the date, per-client
    /// toggles are rejected: unblocking one client of a closed day would
    /// silently mean nothing.
    pub async fn toggle_block(
        &self,
        date: NaiveDate,
        client_id: Option<String>,
    ) -> Result<bool, PortalError> {
        let (exists, globally_blocked) = {
            let cache = self.cache.read().await;
            let exists = cache
                .blocks
                .iter()
                .any(|block| block.date == date && block.client_id == client_id);
            (exists, availability::is_globally_blocked(date, &cache.blocks))
        };

        if exists {
            self.store.delete_block(date, client_id.as_deref()).await?;
            self.refresh().await?;
            self.emit(ChangeEvent::block("date_unblocked", date, client_id.as_deref()));
            return Ok(false);
        }

        if client_id.is_some() && globally_blocked {
            return Err(PortalError::validation(
                "a global block already covers this date",
            ));
        }

        let block = BlockRecord {
            id: new_id(),
            date,
            client_id,
            created_at: Utc::now().to_rfc3339(),
        };
        self.store.insert_block(&block).await?;
        self.refresh().await?;
        self.emit(ChangeEvent::block("date_blocked", date, block.client_id.as_deref()));
        Ok(true)
    }

    /// Administrative reset: removes every block record, global and
    /// per-client alike.
    pub async fn unblock_all(&self) -> Result<u64, PortalError> {
        let removed = self.store.clear_blocks().await?;
        self.refresh().await?;
        self.emit(ChangeEvent::bare("blocks_cleared"));
        Ok(removed)
    }

    pub async fn add_task(&self, new: NewTask) -> Result<VisitTask, PortalError> {
        if new.text.trim().is_empty() {
            return Err(PortalError::validation("task text is required"));
        }
        if let TaskLink::LinkedTo(booking_id) = &new.link {
            if self.booking(booking_id).await.is_none() {
                return Err(PortalError::validation("linked visit does not exist"));
            }
        }

        let task = VisitTask {
            id: new_id(),
            link: new.link,
            client_id: new.client_id,
            text: new.text,
            notes: new.notes,
            kind: new.kind,
            status: TaskStatus::Pending,
            // Admin-created tasks need no admin review; client requests do.
            viewed_by_admin: new.kind == TaskKind::Standard,
            visit_date: new.visit_date,
            reason: None,
            created_at: Utc::now().to_rfc3339(),
        };
        self.store.insert_task(&task).await?;
        self.refresh().await?;
        self.emit(ChangeEvent::task("task_created", &task));
        Ok(task)
    }

    /// Completion toggles are high-frequency, so they apply optimistically:
    /// the cache changes first, and a failed persistence call restores the
    /// pre-call snapshot field for field.
    pub async fn toggle_task_completion(&self, id: &str) -> Result<VisitTask, PortalError> {
        let current = self.task(id).await.ok_or(PortalError::NotFound("task"))?;
        let mut updated = current.clone();
        let next = if current.is_completed() {
            TaskStatus::Pending
        } else {
            TaskStatus::Completed
        };
        if !tasks::allowed_transition(current.status, next) {
            return Err(PortalError::validation(format!(
                "cannot move a {} task to {}",
                current.status.as_str(),
                next.as_str()
            )));
        }
        updated.status = next;
        let updated = self.commit_task_update(updated).await?;
        self.emit(ChangeEvent::task("task_updated", &updated));
        Ok(updated)
    }

    pub async fn update_task(&self, id: &str, patch: TaskPatch) -> Result<VisitTask, PortalError> {
        let current = self.task(id).await.ok_or(PortalError::NotFound("task"))?;
        let mut updated = current.clone();
        if let Some(text) = patch.text {
            if text.trim().is_empty() {
                return Err(PortalError::validation("task text is required"));
            }
            updated.text = text;
        }
        if let Some(notes) = patch.notes {
            updated.notes = if notes.trim().is_empty() { None } else { Some(notes) };
        }
        if let Some(visit_date) = patch.visit_date {
            updated.visit_date = Some(visit_date);
        }
        if let Some(status) = patch.status {
            if !tasks::allowed_transition(current.status, status) {
                return Err(PortalError::validation(format!(
                    "cannot move a {} task to {}",
                    current.status.as_str(),
                    status.as_str()
                )));
            }
            updated.status = status;
        }

        let updated = self.commit_task_update(updated).await?;
        self.emit(ChangeEvent::task("task_updated", &updated));
        Ok(updated)
    }

    pub async fn postpone_task(
        &self,
        id: &str,
        target: PostponeTarget,
    ) -> Result<(VisitTask, PostponeOutcome), PortalError> {
        let current = self.task(id).await.ok_or(PortalError::NotFound("task"))?;
        if current.status.is_terminal() {
            return Err(PortalError::validation("closed tasks cannot be postponed"));
        }
        let (updated, outcome) = {
            let cache = self.cache.read().await;
            tasks::plan_postponement(&current, &target, &cache.bookings)
        };
        let updated = self.commit_task_update(updated).await?;
        self.emit(ChangeEvent::task("task_postponed", &updated));
        Ok((updated, outcome))
    }

    /// Optimistic removal with restore on failure.
    pub async fn delete_task(&self, id: &str) -> Result<(), PortalError> {
        let snapshot = {
            let mut cache = self.cache.write().await;
            let position = cache
                .tasks
                .iter()
                .position(|task| task.id == id)
                .ok_or(PortalError::NotFound("task"))?;
            cache.tasks.remove(position)
        };

        match self.store.delete_task(id).await {
            Ok(deleted) if deleted > 0 => {
                self.emit(ChangeEvent::task("task_deleted", &snapshot));
                Ok(())
            }
            Ok(_) => {
                self.restore_task(snapshot).await;
                Err(PortalError::NotFound("task"))
            }
            Err(err) => {
                self.restore_task(snapshot).await;
                Err(PortalError::Store(err))
            }
        }
    }

    /// Marks every unseen task as reviewed. Only refreshes when the store
    /// reports changed rows, so repeated calls do not trigger refresh storms.
    pub async fn mark_tasks_viewed(&self) -> Result<u64, PortalError> {
        let changed = self.store.mark_tasks_viewed().await?;
        if changed > 0 {
            self.refresh().await?;
            self.emit(ChangeEvent::bare("tasks_viewed"));
        }
        Ok(changed)
    }

    async fn commit_task_update(&self, updated: VisitTask) -> Result<VisitTask, PortalError> {
        let snapshot = {
            let mut guard = self.cache.write().await;
            let cache = &mut *guard;
            let slot = cache
                .tasks
                .iter_mut()
                .find(|task| task.id == updated.id)
                .ok_or(PortalError::NotFound("task"))?;
            let snapshot = slot.clone();
            *slot = updated.clone();
            cache.write_gen += 1;
            let generation = cache.write_gen;
            cache.in_flight.insert(updated.id.clone(), generation);
            snapshot
        };

        match self.store.update_task(&updated).await {
            Ok(changed) if changed > 0 => {
                self.cache.write().await.in_flight.remove(&updated.id);
                self.refresh().await?;
                Ok(updated)
            }
            Ok(_) => {
                self.rollback_task(snapshot).await;
                Err(PortalError::NotFound("task"))
            }
            Err(err) => {
                self.rollback_task(snapshot).await;
                Err(PortalError::Store(err))
            }
        }
    }

    async fn rollback_task(&self, snapshot: VisitTask) {
        let mut guard = self.cache.write().await;
        let cache = &mut *guard;
        cache.in_flight.remove(&snapshot.id);
        if let Some(slot) = cache.tasks.iter_mut().find(|task| task.id == snapshot.id) {
            *slot = snapshot;
        }
    }

    async fn restore_task(&self, snapshot: VisitTask) {
        let mut cache = self.cache.write().await;
        cache.tasks.push(snapshot);
        cache.tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    }
}

fn merge_pending<T: Clone, F>(
    mut fetched: Vec<T>,
    local: &[T],
    in_flight: &HashMap<String, u64>,
    id_of: F,
) -> Vec<T>
where
    F: Fn(&T) -> &str,
{
    if in_flight.is_empty() {
        return fetched;
    }
    for item in fetched.iter_mut() {
        if in_flight.contains_key(id_of(item)) {
            if let Some(pending) = local.iter().find(|entry| id_of(entry) == id_of(item)) {
                *item = pending.clone();
            }
        }
    }
    fetched
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::sync::atomic::{AtomicBool, Ordering};

    async fn test_pool() -> sqlx::SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    async fn test_orchestrator() -> Orchestrator<SqliteStore> {
        let (sender, _) = broadcast::channel(32);
        let orchestrator = Orchestrator::new(SqliteStore::new(test_pool().await), sender);
        orchestrator.refresh().await.unwrap();
        orchestrator
    }

    fn day(value: &str) -> NaiveDate {
        NaiveDate::parse_from_str(value, DAY_FORMAT).unwrap()
    }

    fn new_booking(client_id: &str, date: &str, time: &str) -> NewBooking {
        NewBooking {
            client_id: Some(client_id.to_string()),
            client_name: "Acme Retail".to_string(),
            date: day(date),
            time: time.to_string(),
            kind: VisitKind::OnSite,
            status: BookingStatus::Confirmed,
            branch_id: None,
            branch_name: None,
        }
    }

    fn new_task(client_id: &str, link: TaskLink) -> NewTask {
        NewTask {
            link,
            client_id: client_id.to_string(),
            text: "swap UPS battery".to_string(),
            notes: None,
            kind: TaskKind::Standard,
            visit_date: None,
        }
    }

    /// Store wrapper that fails task writes on demand.
    struct FlakyStore {
        inner: SqliteStore,
        fail_task_updates: AtomicBool,
    }

    impl FlakyStore {
        fn new(inner: SqliteStore) -> Self {
            Self {
                inner,
                fail_task_updates: AtomicBool::new(false),
            }
        }
    }

    #[async_trait::async_trait]
    impl Store for FlakyStore {
        async fn load_bookings(&self) -> Result<Vec<Booking>, sqlx::Error> {
            self.inner.load_bookings().await
        }
        async fn load_blocks(&self) -> Result<Vec<BlockRecord>, sqlx::Error> {
            self.inner.load_blocks().await
        }
        async fn load_tasks(&self) -> Result<Vec<VisitTask>, sqlx::Error> {
            self.inner.load_tasks().await
        }
        async fn insert_booking(&self, booking: &Booking) -> Result<(), sqlx::Error> {
            self.inner.insert_booking(booking).await
        }
        async fn set_booking_status(
            &self,
            id: &str,
            status: BookingStatus,
        ) -> Result<u64, sqlx::Error> {
            self.inner.set_booking_status(id, status).await
        }
        async fn reschedule_booking(
            &self,
            id: &str,
            date: NaiveDate,
            slot: &Slot,
        ) -> Result<u64, sqlx::Error> {
            self.inner.reschedule_booking(id, date, slot).await
        }
        async fn delete_booking(&self, id: &str) -> Result<u64, sqlx::Error> {
            self.inner.delete_booking(id).await
        }
        async fn insert_block(&self, block: &BlockRecord) -> Result<(), sqlx::Error> {
            self.inner.insert_block(block).await
        }
        async fn delete_block(
            &self,
            date: NaiveDate,
            client_id: Option<&str>,
        ) -> Result<u64, sqlx::Error> {
            self.inner.delete_block(date, client_id).await
        }
        async fn clear_blocks(&self) -> Result<u64, sqlx::Error> {
            self.inner.clear_blocks().await
        }
        async fn insert_task(&self, task: &VisitTask) -> Result<(), sqlx::Error> {
            self.inner.insert_task(task).await
        }
        async fn update_task(&self, task: &VisitTask) -> Result<u64, sqlx::Error> {
            if self.fail_task_updates.load(Ordering::SeqCst) {
                return Err(sqlx::Error::PoolClosed);
            }
            self.inner.update_task(task).await
        }
        async fn delete_task(&self, id: &str) -> Result<u64, sqlx::Error> {
            self.inner.delete_task(id).await
        }
        async fn mark_tasks_viewed(&self) -> Result<u64, sqlx::Error> {
            self.inner.mark_tasks_viewed().await
        }
    }

    #[tokio::test]
    async fn create_rejects_duplicate_slot_before_persisting() {
        let portal = test_orchestrator().await;
        portal
            .create(new_booking("c1", "2024-05-10", "10:00 AM"))
            .await
            .unwrap();

        let second = portal.create(new_booking("c2", "2024-05-10", "10:00 AM")).await;
        assert!(matches!(second, Err(PortalError::SlotTaken { .. })));
        assert_eq!(portal.bookings().await.len(), 1);
    }

    #[tokio::test]
    async fn cancelled_booking_frees_its_slot() {
        let portal = test_orchestrator().await;
        let first = portal
            .create(new_booking("c1", "2024-05-10", "10:00 AM"))
            .await
            .unwrap();
        portal
            .update_status(&first.id, BookingStatus::Cancelled)
            .await
            .unwrap();

        portal
            .create(new_booking("c2", "2024-05-10", "10:00 AM"))
            .await
            .unwrap();
        assert_eq!(portal.bookings().await.len(), 2);
    }

    #[tokio::test]
    async fn day_schedule_orders_morning_before_afternoon() {
        let portal = test_orchestrator().await;
        portal
            .create(new_booking("c1", "2024-05-10", "11:00 AM"))
            .await
            .unwrap();
        portal
            .create(new_booking("c2", "2024-05-10", "01:00 PM"))
            .await
            .unwrap();
        portal
            .create(new_booking("c3", "2024-05-10", "10:00 AM"))
            .await
            .unwrap();

        let schedule = portal.day_schedule(day("2024-05-10")).await;
        let labels: Vec<String> = schedule
            .iter()
            .map(|b| b.slot.as_ref().unwrap().label.clone())
            .collect();
        assert_eq!(labels, vec!["10:00 AM", "11:00 AM", "01:00 PM"]);
    }

    #[tokio::test]
    async fn global_block_shadows_per_client_toggles() {
        let portal = test_orchestrator().await;
        assert!(portal.toggle_block(day("2024-05-12"), None).await.unwrap());
        assert!(portal.is_date_blocked(day("2024-05-12"), Some("any-client")).await);

        // While the global block stands, per-client toggles are refused.
        let result = portal
            .toggle_block(day("2024-05-12"), Some("c1".to_string()))
            .await;
        assert!(matches!(result, Err(PortalError::Validation(_))));
        assert!(portal.is_date_blocked(day("2024-05-12"), Some("c1")).await);

        // Toggling the same pair again unblocks.
        assert!(!portal.toggle_block(day("2024-05-12"), None).await.unwrap());
        assert!(!portal.is_date_blocked(day("2024-05-12"), Some("any-client")).await);
    }

    #[tokio::test]
    async fn client_scoped_block_events_carry_the_client_id() {
        let (sender, mut rx) = broadcast::channel(32);
        let portal = Orchestrator::new(SqliteStore::new(test_pool().await), sender);
        portal.refresh().await.unwrap();

        portal
            .toggle_block(day("2024-05-12"), Some("c1".to_string()))
            .await
            .unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, "date_blocked");
        assert_eq!(event.client_id.as_deref(), Some("c1"));
        assert_eq!(event.date.as_deref(), Some("2024-05-12"));

        portal
            .toggle_block(day("2024-05-12"), Some("c1".to_string()))
            .await
            .unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, "date_unblocked");
        assert_eq!(event.client_id.as_deref(), Some("c1"));

        // Global blocks stay unscoped.
        portal.toggle_block(day("2024-05-13"), None).await.unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, "date_blocked");
        assert_eq!(event.client_id, None);
    }

    #[tokio::test]
    async fn blocked_dates_refuse_bookings() {
        let portal = test_orchestrator().await;
        portal
            .toggle_block(day("2024-05-12"), Some("c1".to_string()))
            .await
            .unwrap();

        let refused = portal.create(new_booking("c1", "2024-05-12", "09:00 AM")).await;
        assert!(matches!(refused, Err(PortalError::DateBlocked { .. })));

        // The block is scoped to c1; other clients may still book.
        portal
            .create(new_booking("c2", "2024-05-12", "09:00 AM"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unblock_all_clears_every_scope() {
        let portal = test_orchestrator().await;
        portal.toggle_block(day("2024-05-12"), None).await.unwrap();
        portal
            .toggle_block(day("2024-05-13"), Some("c1".to_string()))
            .await
            .unwrap();

        assert_eq!(portal.unblock_all().await.unwrap(), 2);
        assert!(portal.blocks().await.is_empty());
    }

    #[tokio::test]
    async fn reschedule_refuses_past_visits() {
        let portal = test_orchestrator().await;
        let booking = portal
            .create(new_booking("c1", "2024-05-10", "10:00 AM"))
            .await
            .unwrap();

        let result = portal
            .reschedule(&booking.id, day("2024-05-20"), "11:00 AM", day("2024-05-11"))
            .await;
        assert!(matches!(result, Err(PortalError::NotEditable)));

        portal
            .reschedule(&booking.id, day("2024-05-20"), "11:00 AM", day("2024-05-10"))
            .await
            .unwrap();
        let reloaded = portal.booking(&booking.id).await.unwrap();
        assert_eq!(reloaded.date, day("2024-05-20"));
        assert_eq!(reloaded.slot.unwrap().label, "11:00 AM");
    }

    #[tokio::test]
    async fn completion_toggle_keeps_flag_and_status_in_step() {
        let portal = test_orchestrator().await;
        let task = portal
            .add_task(new_task("c1", TaskLink::Unscheduled))
            .await
            .unwrap();
        assert!(!task.is_completed());

        let done = portal.toggle_task_completion(&task.id).await.unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert!(done.is_completed());

        let reopened = portal.toggle_task_completion(&task.id).await.unwrap();
        assert_eq!(reopened.status, TaskStatus::Pending);
        assert!(!reopened.is_completed());
    }

    #[tokio::test]
    async fn toggle_refuses_cancelled_tasks() {
        let portal = test_orchestrator().await;
        let task = portal
            .add_task(new_task("c1", TaskLink::Unscheduled))
            .await
            .unwrap();
        portal
            .update_task(
                &task.id,
                TaskPatch {
                    status: Some(TaskStatus::Cancelled),
                    ..TaskPatch::default()
                },
            )
            .await
            .unwrap();

        // Cancelled is a dead end on every mutation path, the toggle included.
        let toggled = portal.toggle_task_completion(&task.id).await;
        assert!(matches!(toggled, Err(PortalError::Validation(_))));
        assert_eq!(
            portal.task(&task.id).await.unwrap().status,
            TaskStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn failed_toggle_rolls_back_to_the_snapshot() {
        let (sender, _) = broadcast::channel(32);
        let store = FlakyStore::new(SqliteStore::new(test_pool().await));
        let portal = Orchestrator::new(store, sender);
        portal.refresh().await.unwrap();

        let task = portal
            .add_task(new_task("c1", TaskLink::Unscheduled))
            .await
            .unwrap();
        let before = portal.tasks().await;

        portal.store.fail_task_updates.store(true, Ordering::SeqCst);
        let result = portal.toggle_task_completion(&task.id).await;
        assert!(matches!(result, Err(PortalError::Store(_))));

        let after = portal.tasks().await;
        assert_eq!(before, after);
        assert!(portal.cache.read().await.in_flight.is_empty());
    }

    #[tokio::test]
    async fn refresh_is_idempotent() {
        let portal = test_orchestrator().await;
        portal
            .create(new_booking("c1", "2024-05-10", "10:00 AM"))
            .await
            .unwrap();
        portal
            .add_task(new_task("c1", TaskLink::Unscheduled))
            .await
            .unwrap();
        portal.toggle_block(day("2024-05-12"), None).await.unwrap();

        portal.refresh().await.unwrap();
        let bookings = portal.bookings().await;
        let tasks = portal.tasks().await;
        let blocks = portal.blocks().await;

        portal.refresh().await.unwrap();
        assert_eq!(portal.bookings().await, bookings);
        assert_eq!(portal.tasks().await, tasks);
        assert_eq!(portal.blocks().await, blocks);
    }

    #[tokio::test]
    async fn refresh_keeps_in_flight_records() {
        let portal = test_orchestrator().await;
        let task = portal
            .add_task(new_task("c1", TaskLink::Unscheduled))
            .await
            .unwrap();

        // Simulate a local optimistic write still in flight.
        {
            let mut guard = portal.cache.write().await;
            let cache = &mut *guard;
            let entry = cache.tasks.iter_mut().find(|t| t.id == task.id).unwrap();
            entry.status = TaskStatus::Completed;
            cache.write_gen += 1;
            let generation = cache.write_gen;
            cache.in_flight.insert(task.id.clone(), generation);
        }

        portal.refresh().await.unwrap();
        let cached = portal.task(&task.id).await.unwrap();
        assert_eq!(cached.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn postponement_links_only_matching_visits() {
        let portal = test_orchestrator().await;
        let visit = portal
            .create(new_booking("c1", "2024-06-01", "10:00 AM"))
            .await
            .unwrap();
        let matched = portal
            .add_task(new_task("c1", TaskLink::Unscheduled))
            .await
            .unwrap();
        let unmatched = portal
            .add_task(new_task("c1", TaskLink::Unscheduled))
            .await
            .unwrap();

        let (linked, outcome) = portal
            .postpone_task(
                &matched.id,
                PostponeTarget::Reassign {
                    date: day("2024-06-01"),
                },
            )
            .await
            .unwrap();
        assert_eq!(
            outcome,
            PostponeOutcome::Linked {
                booking_id: visit.id.clone()
            }
        );
        assert_eq!(linked.link, TaskLink::LinkedTo(visit.id.clone()));
        assert_eq!(linked.status, TaskStatus::Pending);

        let (noted, outcome) = portal
            .postpone_task(
                &unmatched.id,
                PostponeTarget::Reassign {
                    date: day("2024-07-01"),
                },
            )
            .await
            .unwrap();
        assert_eq!(
            outcome,
            PostponeOutcome::Unmatched {
                noted_date: day("2024-07-01")
            }
        );
        assert_eq!(noted.link, TaskLink::Unscheduled);
        assert!(noted.reason.as_deref().unwrap().contains("2024-07-01"));
    }

    #[tokio::test]
    async fn deleting_a_visit_detaches_its_tasks() {
        let portal = test_orchestrator().await;
        let visit = portal
            .create(new_booking("c1", "2024-06-01", "10:00 AM"))
            .await
            .unwrap();
        let task = portal
            .add_task(new_task("c1", TaskLink::LinkedTo(visit.id.clone())))
            .await
            .unwrap();

        portal.delete(&visit.id).await.unwrap();
        assert!(portal.booking(&visit.id).await.is_none());
        assert_eq!(
            portal.task(&task.id).await.unwrap().link,
            TaskLink::Unscheduled
        );

        // The detachment is persisted, not just a cache patch.
        portal.refresh().await.unwrap();
        assert_eq!(
            portal.task(&task.id).await.unwrap().link,
            TaskLink::Unscheduled
        );
    }

    #[tokio::test]
    async fn mark_viewed_reports_zero_on_repeat() {
        let portal = test_orchestrator().await;
        let mut request = new_task("c1", TaskLink::Unscheduled);
        request.kind = TaskKind::ClientRequest;
        portal.add_task(request).await.unwrap();

        assert_eq!(portal.mark_tasks_viewed().await.unwrap(), 1);
        assert_eq!(portal.mark_tasks_viewed().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn delete_task_restores_on_missing_row() {
        let portal = test_orchestrator().await;
        let task = portal
            .add_task(new_task("c1", TaskLink::Unscheduled))
            .await
            .unwrap();

        // Remove the row behind the cache's back; the optimistic removal
        // must then restore the cached entry.
        portal.store.delete_task(&task.id).await.unwrap();
        let result = portal.delete_task(&task.id).await;
        assert!(matches!(result, Err(PortalError::NotFound("task"))));
        assert!(portal.task(&task.id).await.is_some());
    }
}
