use std::sync::Arc;

use serde_json::{json, Map, Value};
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{now_ms, validate_booking_conflict, validate_span};
use super::{Engine, EngineError};

const AUDIT_TARGET: &str = "baybook::audit";

/// Fields of a booking to be created. Status defaults to `open`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewBooking {
    pub bay_id: Ulid,
    pub vehicle_id: String,
    pub company_id: Option<String>,
    pub technician_ids: Vec<String>,
    pub start: Ms,
    pub end: Option<Ms>,
    pub status: Option<BookingStatus>,
    pub title: String,
    pub complaint: String,
    pub description: String,
    pub notes: String,
    pub service_ref: String,
    pub created_by: Option<String>,
}

/// Partial update. `None` leaves a field unchanged; the nested options on
/// `company_id` and `end` let callers clear the value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingPatch {
    pub bay_id: Option<Ulid>,
    pub vehicle_id: Option<String>,
    pub company_id: Option<Option<String>>,
    pub technician_ids: Option<Vec<String>>,
    pub start: Option<Ms>,
    pub end: Option<Option<Ms>>,
    pub status: Option<BookingStatus>,
    pub title: Option<String>,
    pub complaint: Option<String>,
    pub description: Option<String>,
    pub notes: Option<String>,
    pub service_ref: Option<String>,
}

fn check_text(value: &str, max: usize, what: &'static str) -> Result<(), EngineError> {
    if value.len() > max {
        return Err(EngineError::LimitExceeded(what));
    }
    Ok(())
}

fn check_ref(value: &str, what: &str) -> Result<(), EngineError> {
    if value.trim().is_empty() {
        return Err(EngineError::InvalidInput(format!("{what} must not be empty")));
    }
    check_text(value, MAX_NAME_LEN, "reference id too long")
}

fn check_technicians(ids: &[String]) -> Result<(), EngineError> {
    if ids.len() > MAX_TECHNICIANS {
        return Err(EngineError::LimitExceeded("too many technicians"));
    }
    ids.iter().try_for_each(|t| check_ref(t, "technician id"))
}

fn check_initial_status(status: BookingStatus) -> Result<(), EngineError> {
    if status.is_terminal() {
        return Err(EngineError::InvalidInput(format!(
            "status {status} is reached through close or cancel"
        )));
    }
    Ok(())
}

impl NewBooking {
    fn validate(&self) -> Result<(), EngineError> {
        check_ref(&self.vehicle_id, "vehicle id")?;
        if let Some(c) = &self.company_id {
            check_ref(c, "company id")?;
        }
        check_technicians(&self.technician_ids)?;
        check_text(&self.title, MAX_NAME_LEN, "title too long")?;
        for text in [&self.complaint, &self.description, &self.notes] {
            check_text(text, MAX_TEXT_LEN, "text field too long")?;
        }
        check_text(&self.service_ref, MAX_NAME_LEN, "service reference too long")?;
        if let Some(status) = self.status {
            check_initial_status(status)?;
        }
        validate_span(&Span::new(self.start, self.end))
    }
}

impl BookingPatch {
    fn validate(&self) -> Result<(), EngineError> {
        if let Some(v) = &self.vehicle_id {
            check_ref(v, "vehicle id")?;
        }
        if let Some(Some(c)) = &self.company_id {
            check_ref(c, "company id")?;
        }
        if let Some(t) = &self.technician_ids {
            check_technicians(t)?;
        }
        if let Some(t) = &self.title {
            check_text(t, MAX_NAME_LEN, "title too long")?;
        }
        for text in [&self.complaint, &self.description, &self.notes].into_iter().flatten() {
            check_text(text, MAX_TEXT_LEN, "text field too long")?;
        }
        if let Some(s) = &self.service_ref {
            check_text(s, MAX_NAME_LEN, "service reference too long")?;
        }
        if let Some(status) = self.status {
            check_initial_status(status)?;
        }
        Ok(())
    }

    fn apply(&self, booking: &mut Booking) {
        if let Some(v) = self.bay_id {
            booking.bay_id = v;
        }
        if let Some(v) = &self.vehicle_id {
            booking.vehicle_id = v.clone();
        }
        if let Some(v) = &self.company_id {
            booking.company_id = v.clone();
        }
        if let Some(v) = &self.technician_ids {
            booking.technician_ids = v.clone();
        }
        if let Some(v) = self.start {
            booking.start = v;
        }
        if let Some(v) = self.end {
            booking.end = v;
        }
        if let Some(v) = self.status {
            booking.status = v;
        }
        let texts = [
            (&self.title, &mut booking.title),
            (&self.complaint, &mut booking.complaint),
            (&self.description, &mut booking.description),
            (&self.notes, &mut booking.notes),
            (&self.service_ref, &mut booking.service_ref),
        ];
        for (patch, field) in texts {
            if let Some(v) = patch {
                *field = v.clone();
            }
        }
    }
}

/// Field-level change set between two versions of a booking.
fn audit_changes(before: &Booking, after: &Booking) -> Value {
    let mut changes = Map::new();
    let mut diff = |field: &str, a: Value, b: Value| {
        if a != b {
            changes.insert(field.to_string(), json!({ "from": a, "to": b }));
        }
    };
    diff("vehicle_id", json!(before.vehicle_id), json!(after.vehicle_id));
    diff("bay_id", json!(before.bay_id.to_string()), json!(after.bay_id.to_string()));
    diff("company_id", json!(before.company_id), json!(after.company_id));
    diff("start", json!(before.start), json!(after.start));
    diff("end", json!(before.end), json!(after.end));
    diff("status", json!(before.status), json!(after.status));
    diff("complaint", json!(before.complaint), json!(after.complaint));
    diff("description", json!(before.description), json!(after.description));

    let added: Vec<&String> = after
        .technician_ids
        .iter()
        .filter(|t| !before.technician_ids.contains(t))
        .collect();
    let removed: Vec<&String> = before
        .technician_ids
        .iter()
        .filter(|t| !after.technician_ids.contains(t))
        .collect();
    if !added.is_empty() || !removed.is_empty() {
        changes.insert(
            "technicians".into(),
            json!({ "added": added, "removed": removed }),
        );
    }
    Value::Object(changes)
}

fn count_mutation(op: &'static str, result: &Result<Booking, EngineError>) {
    if let Err(EngineError::Conflict { .. }) = result {
        metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL, "op" => op).increment(1);
    }
}

impl Engine {
    // ── Bays ─────────────────────────────────────────────────

    pub async fn create_bay(&self, key: String, name: String) -> Result<Bay, EngineError> {
        check_ref(&key, "bay key")?;
        check_ref(&name, "bay name")?;

        let _admin = self.bay_admin.lock().await;
        if self.state.len() >= MAX_BAYS {
            return Err(EngineError::LimitExceeded("too many bays"));
        }
        if self.bay_keys.contains_key(&key) {
            return Err(EngineError::AlreadyExists(key));
        }

        let id = Ulid::new();
        let at = now_ms();
        let event = Event::BayCreated { id, key: key.clone(), name: name.clone(), at };
        self.wal_append(&event).await?;
        let rs = BayState::new(id, key.clone(), name, at);
        let bay = rs.info();
        self.state.insert(id, Arc::new(RwLock::new(rs)));
        self.bay_keys.insert(key, id);
        self.notify.publish(RealtimeEvent::bay(EventKind::BayCreated, bay.clone()));
        tracing::info!(%id, key = %bay.key, "bay created");
        Ok(bay)
    }

    pub async fn update_bay(&self, id: Ulid, name: String) -> Result<Bay, EngineError> {
        check_ref(&name, "bay name")?;
        let mut guard = self.lock_bay(id).await?;
        let at = now_ms();
        let event = Event::BayUpdated { id, name: name.clone(), at };
        let mut bay = guard.info();
        bay.name = name;
        bay.updated_at = at;
        let realtime = RealtimeEvent::bay(EventKind::BayUpdated, bay.clone());
        self.persist_and_apply(std::slice::from_mut(&mut guard), &event, realtime)
            .await?;
        Ok(bay)
    }

    /// Fails while the bay still holds open or in-progress bookings.
    /// Closed and canceled history on the bay goes with it.
    pub async fn delete_bay(&self, id: Ulid) -> Result<(), EngineError> {
        let _admin = self.bay_admin.lock().await;
        let guard = self.lock_bay(id).await?;
        if guard.has_active() {
            return Err(EngineError::HasBookings(id));
        }

        let event = Event::BayDeleted { id };
        self.wal_append(&event).await?;
        self.state.remove(&id);
        self.bay_keys.remove(&guard.key);
        for b in &guard.bookings {
            self.booking_to_bay.remove(&b.id);
        }
        self.notify.publish(RealtimeEvent::bay(EventKind::BayDeleted, guard.info()));
        self.notify.remove(&id);
        tracing::info!(%id, key = %guard.key, "bay deleted");
        Ok(())
    }

    // ── Bookings ─────────────────────────────────────────────

    pub async fn create_booking(&self, draft: NewBooking) -> Result<Booking, EngineError> {
        let result = self.create_booking_inner(draft).await;
        count_mutation("create", &result);
        result
    }

    async fn create_booking_inner(&self, draft: NewBooking) -> Result<Booking, EngineError> {
        draft.validate()?;
        let mut guard = self.lock_bay(draft.bay_id).await?;
        if guard.bookings.len() >= MAX_BOOKINGS_PER_BAY {
            return Err(EngineError::LimitExceeded("too many bookings on bay"));
        }

        let span = Span::new(draft.start, draft.end);
        if !guard.is_waiting_list() {
            validate_booking_conflict(guard.id, &span, &guard.bookings)?;
        }

        let at = now_ms();
        let booking = Booking {
            id: Ulid::new(),
            number: self.take_number(),
            bay_id: draft.bay_id,
            vehicle_id: draft.vehicle_id,
            company_id: draft.company_id,
            technician_ids: draft.technician_ids,
            start: draft.start,
            end: draft.end,
            status: draft.status.unwrap_or(BookingStatus::Open),
            title: draft.title,
            complaint: draft.complaint,
            description: draft.description,
            notes: draft.notes,
            service_ref: draft.service_ref,
            created_by: draft.created_by,
            created_at: at,
            updated_at: at,
        };

        let event = Event::BookingCreated { booking: booking.clone() };
        let realtime = RealtimeEvent::booking(EventKind::BookingCreated, booking.clone());
        self.persist_and_apply(std::slice::from_mut(&mut guard), &event, realtime)
            .await?;

        tracing::info!(
            target: AUDIT_TARGET,
            action = "create",
            booking_id = %booking.id,
            number = %booking.display_number(),
            bay_id = %booking.bay_id,
            actor = booking.created_by.as_deref().unwrap_or("-"),
            "booking created"
        );
        Ok(booking)
    }

    /// Amend a non-terminal booking. A bay or time change is re-validated against
    /// the target bay with this booking's own prior record excluded.
    pub async fn update_booking(
        &self,
        id: Ulid,
        patch: BookingPatch,
        actor: Option<&str>,
    ) -> Result<Booking, EngineError> {
        let result = self.update_booking_inner(id, patch, actor).await;
        count_mutation("update", &result);
        result
    }

    async fn update_booking_inner(
        &self,
        id: Ulid,
        patch: BookingPatch,
        actor: Option<&str>,
    ) -> Result<Booking, EngineError> {
        patch.validate()?;

        for _ in 0..super::RESOLVE_ATTEMPTS {
            let current_bay = self.bay_for_booking(&id).ok_or(EngineError::NotFound(id))?;
            let target_bay = patch.bay_id.unwrap_or(current_bay);
            let mut guards = self.lock_bays(&[current_bay, target_bay]).await?;

            let Some(before) = guards
                .iter()
                .find(|g| g.id == current_bay)
                .and_then(|g| g.booking(id))
                .cloned()
            else {
                // Moved between lookup and lock; look it up again.
                continue;
            };
            if before.status.is_terminal() {
                return Err(EngineError::InvalidState(format!(
                    "booking {id} is {}",
                    before.status
                )));
            }

            let mut after = before.clone();
            patch.apply(&mut after);
            validate_span(&after.span())?;

            let Some(target) = guards.iter().find(|g| g.id == target_bay) else {
                return Err(EngineError::NotFound(target_bay));
            };
            if !target.is_waiting_list() {
                if target_bay != current_bay && target.bookings.len() >= MAX_BOOKINGS_PER_BAY {
                    return Err(EngineError::LimitExceeded("too many bookings on bay"));
                }
                validate_booking_conflict(
                    target_bay,
                    &after.span(),
                    target.bookings.iter().filter(|b| b.id != id),
                )?;
            }

            after.updated_at = now_ms();
            let event = Event::BookingUpdated {
                previous_bay: current_bay,
                booking: after.clone(),
            };
            let realtime = RealtimeEvent::booking(EventKind::BookingUpdated, after.clone())
                .with_previous(before.span())
                .moved_from(current_bay);
            self.persist_and_apply(&mut guards, &event, realtime).await?;

            tracing::info!(
                target: AUDIT_TARGET,
                action = "update",
                booking_id = %id,
                actor = actor.unwrap_or("-"),
                changes = %audit_changes(&before, &after),
                "booking updated"
            );
            return Ok(after);
        }
        Err(EngineError::NotFound(id))
    }

    pub async fn close_booking(&self, id: Ulid, actor: Option<&str>) -> Result<Booking, EngineError> {
        self.finish(id, Finish::Close, actor).await
    }

    pub async fn cancel_booking(&self, id: Ulid, actor: Option<&str>) -> Result<Booking, EngineError> {
        self.finish(id, Finish::Cancel, actor).await
    }

    /// Terminal transition. Stamps `end` with the action instant unless already set;
    /// the stamp never precedes `start`.
    async fn finish(
        &self,
        id: Ulid,
        finish: Finish,
        actor: Option<&str>,
    ) -> Result<Booking, EngineError> {
        let mut guard = self.resolve_booking_write(id).await?;
        let before = guard.booking(id).cloned().ok_or(EngineError::NotFound(id))?;
        if before.status.is_terminal() {
            return Err(EngineError::InvalidState(format!(
                "booking {id} is already {}",
                before.status
            )));
        }

        let at = now_ms();
        let end = before.end.unwrap_or(at.max(before.start));
        let bay_id = guard.id;
        let (status, event, kind) = match finish {
            Finish::Close => (
                BookingStatus::Closed,
                Event::BookingClosed { id, bay_id, end, at },
                EventKind::BookingClosed,
            ),
            Finish::Cancel => (
                BookingStatus::Canceled,
                Event::BookingCanceled { id, bay_id, end, at },
                EventKind::BookingCanceled,
            ),
        };

        let mut after = before.clone();
        after.status = status;
        after.end = Some(end);
        after.updated_at = at;
        let realtime = RealtimeEvent::booking(kind, after.clone());
        self.persist_and_apply(std::slice::from_mut(&mut guard), &event, realtime)
            .await?;

        tracing::info!(
            target: AUDIT_TARGET,
            action = status.as_str(),
            booking_id = %id,
            actor = actor.unwrap_or("-"),
            changes = %audit_changes(&before, &after),
            "booking finished"
        );
        Ok(after)
    }

    /// Administrative hard delete. Works in any status.
    pub async fn delete_booking(&self, id: Ulid, actor: Option<&str>) -> Result<(), EngineError> {
        let mut guard = self.resolve_booking_write(id).await?;
        let bay_id = guard.id;
        let event = Event::BookingDeleted { id, bay_id };
        let realtime = RealtimeEvent::booking_deleted(id, bay_id);
        self.persist_and_apply(std::slice::from_mut(&mut guard), &event, realtime)
            .await?;
        tracing::info!(
            target: AUDIT_TARGET,
            action = "delete",
            booking_id = %id,
            actor = actor.unwrap_or("-"),
            "booking deleted"
        );
        Ok(())
    }
}

/// The two terminal transitions a booking can take.
#[derive(Debug, Clone, Copy)]
enum Finish {
    Close,
    Cancel,
}
