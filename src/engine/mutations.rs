use std::sync::Arc;

use chrono::NaiveDate;
use tokio::sync::RwLock;
use tracing::info;
use ulid::Ulid;

use crate::identity::Actor;
use crate::limits::*;
use crate::mailer::Template;
use crate::model::*;
use crate::observability;
use crate::timeutil::now_ms;

use super::conflict::*;
use super::notices::Notice;
use super::requests::{BookingUpdate, InstrumentUpdate, NewBooking, NewInstrument};
use super::{Engine, EngineError, InstrumentGuard, guard_position};

/// Which message, if any, an edit from `before` to `after` deserves.
fn update_template(before: &Booking, after: &Booking) -> Option<Template> {
    if !before.differs_materially(after) {
        return None;
    }
    if after.is_cancelled() && !before.is_cancelled() {
        Some(Template::BookingCancelled)
    } else if after.approval == Approval::Approved && before.approval != Approval::Approved {
        Some(Template::BookingConfirmed)
    } else {
        Some(Template::BookingUpdated)
    }
}

fn record_error<T>(op: &'static str, result: Result<T, EngineError>) -> Result<T, EngineError> {
    if let Err(e) = &result {
        metrics::counter!(observability::OPERATION_ERRORS_TOTAL, "op" => op, "kind" => e.kind())
            .increment(1);
    }
    result
}

impl Engine {
    // ── Bookings ─────────────────────────────────────────────

    pub async fn create_booking(&self, actor: &Actor, req: NewBooking) -> Result<Booking, EngineError> {
        record_error("create_booking", self.create_booking_inner(actor, req).await)
    }

    async fn create_booking_inner(&self, actor: &Actor, req: NewBooking) -> Result<Booking, EngineError> {
        let purpose = required_text("purpose", &req.purpose, MAX_PURPOSE_LEN)?;
        let mut details = optional_text(req.details, MAX_DETAILS_LEN)?;
        let (end, samples) = req.end.resolve(req.start, req.flow)?;
        let span = checked_span(req.start, end)?;
        if let Some(samples) = samples {
            details = Some(samples.embed(details.as_deref()));
        }

        let user_id = req.user_id.unwrap_or(actor.id);
        if user_id != actor.id && !actor.is_admin() {
            return Err(EngineError::Forbidden("only admins book for other users"));
        }
        let user_name = match self.directory.resolve_user_name(user_id) {
            Some(name) => name,
            None if user_id == actor.id => actor.name.clone(),
            None => return Err(EngineError::NotFound(user_id)),
        };

        let rs = self
            .get_instrument_state(&req.instrument_id)
            .ok_or(EngineError::NotFound(req.instrument_id))?;
        let mut guard = rs.write().await;
        if guard.bookings.len() >= MAX_BOOKINGS_PER_INSTRUMENT {
            return Err(EngineError::LimitExceeded("too many bookings on instrument"));
        }

        let now = now_ms();
        let booking = Booking {
            id: Ulid::new(),
            instrument_id: req.instrument_id,
            instrument_name: guard.instrument.name.clone(),
            user_id,
            user_name,
            span,
            purpose,
            details,
            approval: req.flow.initial_approval(),
            progress: Progress::NotStarted,
            comments: Vec::new(),
            created_at: now,
            updated_at: now,
            version: 1,
        };
        check_overlap(self.policy.overlap, &guard, &booking)?;

        let event = Event::BookingCreated {
            booking: booking.clone(),
        };
        self.persist_and_apply(&mut [&mut *guard], &event).await?;
        drop(guard);

        info!(booking = %booking.id, instrument = %booking.instrument_id, flow = req.flow.label(), "booking created");
        metrics::counter!(observability::BOOKINGS_CREATED_TOTAL, "flow" => req.flow.label()).increment(1);
        self.deliver(Notice::to_owner(&booking, Template::BookingConfirmation))
            .await;
        Ok(booking)
    }

    /// Persist `build(before)` as the new version of a booking, optionally
    /// moving it to `target` instrument. Returns `(before, after)`.
    async fn commit_update<F>(
        &self,
        id: Ulid,
        target: Option<Ulid>,
        build: F,
    ) -> Result<(Booking, Booking), EngineError>
    where
        F: FnOnce(&Booking) -> Result<Booking, EngineError>,
    {
        let mut attempts = 0;
        let (mut guards, current, target, before) = loop {
            let current = self.instrument_of_booking(&id).ok_or(EngineError::NotFound(id))?;
            let target = target.unwrap_or(current);
            let guards = self.lock_instruments(&[current, target]).await?;
            let found = guard_position(&guards, current).and_then(|i| guards[i].booking(id).cloned());
            if let Some(before) = found {
                break (guards, current, target, before);
            }
            // moved between lookup and lock
            attempts += 1;
            if attempts >= 3 {
                return Err(EngineError::NotFound(id));
            }
        };
        let ti = guard_position(&guards, target).ok_or(EngineError::NotFound(target))?;

        let mut after = build(&before)?;
        after.id = before.id;
        after.created_at = before.created_at;
        after.instrument_id = target;
        after.instrument_name = guards[ti].instrument.name.clone();
        after.version = before.version + 1;
        after.updated_at = now_ms();

        if target != current && guards[ti].bookings.len() >= MAX_BOOKINGS_PER_INSTRUMENT {
            return Err(EngineError::LimitExceeded("too many bookings on instrument"));
        }
        let placement_changed = after.span != before.span
            || target != current
            || (after.approval == Approval::Approved && before.approval != Approval::Approved)
            || (before.is_cancelled() && !after.is_cancelled());
        if placement_changed {
            check_overlap(self.policy.overlap, &guards[ti], &after)?;
        }

        let event = Event::BookingUpdated {
            booking: after.clone(),
            from_instrument: current,
        };
        let mut targets: Vec<&mut InstrumentState> = guards.iter_mut().map(|g| &mut **g).collect();
        self.persist_and_apply(&mut targets, &event).await?;
        drop(guards);

        if before.status() != after.status() {
            metrics::counter!(observability::BOOKING_TRANSITIONS_TOTAL, "to" => after.status().as_str())
                .increment(1);
        }
        Ok((before, after))
    }

    /// Edit a booking. Comment-only edits are persisted silently. A `length`
    /// re-derives the end, reusing the sample fields stored in `details` when
    /// the edit brings none.
    pub async fn update_booking(
        &self,
        actor: &Actor,
        id: Ulid,
        update: BookingUpdate,
    ) -> Result<Booking, EngineError> {
        record_error("update_booking", self.update_booking_inner(actor, id, update).await)
    }

    async fn update_booking_inner(
        &self,
        actor: &Actor,
        id: Ulid,
        update: BookingUpdate,
    ) -> Result<Booking, EngineError> {
        let purpose = update
            .purpose
            .as_deref()
            .map(|p| required_text("purpose", p, MAX_PURPOSE_LEN))
            .transpose()?;
        let details = update
            .details
            .map(|d| optional_text(d, MAX_DETAILS_LEN))
            .transpose()?;
        if let Some(comments) = &update.comments
            && comments.len() > MAX_COMMENTS_PER_BOOKING
        {
            return Err(EngineError::LimitExceeded("too many comments"));
        }
        let mode = self.policy.concurrency;

        let (before, after) = self
            .commit_update(id, update.instrument_id, |before| {
                require_owner_or_admin(actor, before)?;
                check_version(mode, before, update.expected_version)?;
                let mut after = before.clone();
                if let Some(status) = update.status {
                    check_owner_status_change(actor, before, status)?;
                    (after.approval, after.progress) = status.apply(before.approval, before.progress);
                    if after.status() != status.reads_back_as() {
                        return Err(EngineError::validation(format!(
                            "cannot set {status} on a {} booking",
                            before.status()
                        )));
                    }
                }
                if let Some(purpose) = purpose {
                    after.purpose = purpose;
                }
                if let Some(details) = details {
                    after.details = details;
                }
                let start = update.start.unwrap_or(before.span.start);
                let end = match &update.length {
                    Some(length) => {
                        let (end, samples) = length.resolve_edit(start, after.details.as_deref())?;
                        if let Some(samples) = samples {
                            after.details = Some(samples.embed(after.details.as_deref()));
                        }
                        end
                    }
                    None => update.end.unwrap_or(before.span.end),
                };
                after.span = checked_span(start, end)?;
                if let Some(details) = &after.details
                    && details.len() > MAX_DETAILS_LEN
                {
                    return Err(EngineError::LimitExceeded("text too long"));
                }
                if let Some(comments) = update.comments {
                    after.comments = comments;
                }
                Ok(after)
            })
            .await?;

        info!(booking = %id, by = %actor.id, status = %after.status(), "booking updated");
        if let Some(template) = update_template(&before, &after) {
            self.deliver(Notice::to_owner(&after, template)).await;
        }
        Ok(after)
    }

    /// Admin approval of a pending request.
    pub async fn approve_booking(&self, actor: &Actor, id: Ulid) -> Result<Booking, EngineError> {
        require_admin(actor, "only admins approve bookings")?;
        self.decide(actor, id, Approval::Approved).await
    }

    /// Admin denial of a pending request.
    pub async fn deny_booking(&self, actor: &Actor, id: Ulid) -> Result<Booking, EngineError> {
        require_admin(actor, "only admins deny bookings")?;
        self.decide(actor, id, Approval::Denied).await
    }

    async fn decide(&self, actor: &Actor, id: Ulid, to: Approval) -> Result<Booking, EngineError> {
        let (before, after) = self
            .commit_update(id, None, |before| {
                if before.approval != Approval::Pending || before.is_cancelled() {
                    return Err(EngineError::validation("booking is not pending"));
                }
                let mut after = before.clone();
                after.approval = to;
                Ok(after)
            })
            .await?;
        info!(booking = %id, by = %actor.id, status = %after.status(), "booking decided");
        if let Some(template) = update_template(&before, &after) {
            self.deliver(Notice::to_owner(&after, template)).await;
        }
        Ok(after)
    }

    /// Cancel by owner or admin. Cancelling a pending request counts as a denial.
    pub async fn cancel_booking(&self, actor: &Actor, id: Ulid) -> Result<Booking, EngineError> {
        let (before, after) = self
            .commit_update(id, None, |before| {
                require_owner_or_admin(actor, before)?;
                if before.is_cancelled() {
                    return Err(EngineError::validation("booking is already cancelled"));
                }
                let mut after = before.clone();
                (after.approval, after.progress) =
                    BookingStatus::Cancelled.apply(before.approval, before.progress);
                Ok(after)
            })
            .await?;
        info!(booking = %id, by = %actor.id, "booking cancelled");
        if let Some(template) = update_template(&before, &after) {
            self.deliver(Notice::to_owner(&after, template)).await;
        }
        Ok(after)
    }

    /// Move a live booking along the progress axis. Approval is untouched.
    pub async fn set_progress(
        &self,
        actor: &Actor,
        id: Ulid,
        progress: Progress,
    ) -> Result<Booking, EngineError> {
        if progress == Progress::Cancelled {
            return Err(EngineError::validation("use cancel_booking to cancel"));
        }
        let (before, after) = self
            .commit_update(id, None, |before| {
                require_owner_or_admin(actor, before)?;
                if before.is_cancelled() {
                    return Err(EngineError::validation("booking is cancelled"));
                }
                let mut after = before.clone();
                after.progress = progress;
                Ok(after)
            })
            .await?;
        info!(booking = %id, by = %actor.id, status = %after.status(), "booking progress");
        if let Some(template) = update_template(&before, &after) {
            self.deliver(Notice::to_owner(&after, template)).await;
        }
        Ok(after)
    }

    /// Irreversible removal of a booking and its comments. Admin only.
    pub async fn delete_booking(&self, actor: &Actor, id: Ulid) -> Result<Booking, EngineError> {
        require_admin(actor, "only admins delete bookings")?;
        let mut guard = self.resolve_booking_write(&id).await?;
        let removed = guard.booking(id).cloned().ok_or(EngineError::NotFound(id))?;
        let event = Event::BookingDeleted {
            id,
            instrument_id: guard.id(),
        };
        self.persist_and_apply(&mut [&mut *guard], &event).await?;
        info!(booking = %id, by = %actor.id, "booking deleted");
        Ok(removed)
    }

    // ── Comments ─────────────────────────────────────────────

    /// Append a comment. A comment by anyone but the owner notifies the owner.
    pub async fn add_comment(
        &self,
        actor: &Actor,
        booking_id: Ulid,
        content: &str,
    ) -> Result<Comment, EngineError> {
        let content = required_text("comment", content, MAX_COMMENT_LEN)?;
        let mut guard = self.resolve_booking_write(&booking_id).await?;
        let booking = guard
            .booking(booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;
        if booking.comments.len() >= MAX_COMMENTS_PER_BOOKING {
            return Err(EngineError::LimitExceeded("too many comments"));
        }
        let comment = Comment {
            id: Ulid::new(),
            user_id: actor.id,
            user_name: actor.name.clone(),
            content,
            created_at: now_ms(),
        };
        let event = Event::CommentAdded {
            booking_id,
            comment: comment.clone(),
        };
        self.persist_and_apply(&mut [&mut *guard], &event).await?;
        drop(guard);

        if actor.id != booking.user_id {
            let notice = Notice::to_owner(&booking, Template::NewComment)
                .with("commenter", actor.name.clone())
                .with("comment", comment.content.clone());
            self.deliver(notice).await;
        }
        Ok(comment)
    }

    /// Remove a comment; allowed for its author or an admin.
    pub async fn delete_comment(
        &self,
        actor: &Actor,
        booking_id: Ulid,
        comment_id: Ulid,
    ) -> Result<(), EngineError> {
        let mut guard = self.resolve_booking_write(&booking_id).await?;
        let booking = guard.booking(booking_id).ok_or(EngineError::NotFound(booking_id))?;
        let comment = booking
            .comments
            .iter()
            .find(|c| c.id == comment_id)
            .ok_or(EngineError::NotFound(comment_id))?;
        if comment.user_id != actor.id && !actor.is_admin() {
            return Err(EngineError::Forbidden("only the author or an admin may delete a comment"));
        }
        let event = Event::CommentDeleted {
            booking_id,
            comment_id,
        };
        self.persist_and_apply(&mut [&mut *guard], &event).await
    }

    // ── Instruments ──────────────────────────────────────────

    pub async fn create_instrument(
        &self,
        actor: &Actor,
        req: NewInstrument,
    ) -> Result<Instrument, EngineError> {
        require_admin(actor, "only admins manage instruments")?;
        let _catalog = self.catalog.write().await;
        if self.instruments.len() >= MAX_INSTRUMENTS {
            return Err(EngineError::LimitExceeded("too many instruments"));
        }
        let instrument = Instrument {
            id: Ulid::new(),
            name: required_text("name", &req.name, MAX_NAME_LEN)?,
            kind: optional_text(req.kind, MAX_NAME_LEN)?,
            model: optional_text(req.model, MAX_NAME_LEN)?,
            location: required_text("location", &req.location, MAX_NAME_LEN)?,
            status: InstrumentStatus::Available,
            calibration_due: req.calibration_due,
            maintenance_history: Vec::new(),
        };

        let event = Event::InstrumentCreated {
            instrument: instrument.clone(),
        };
        self.wal_append(&event).await?;
        let rs = InstrumentState::new(instrument.clone());
        self.instruments.insert(instrument.id, Arc::new(RwLock::new(rs)));
        self.notify.send(&[instrument.id], &event);
        metrics::gauge!(observability::INSTRUMENTS_ACTIVE).set(self.instruments.len() as f64);
        info!(instrument = %instrument.id, name = %instrument.name, "instrument created");
        Ok(instrument)
    }

    pub async fn update_instrument(
        &self,
        actor: &Actor,
        id: Ulid,
        update: InstrumentUpdate,
    ) -> Result<Instrument, EngineError> {
        require_admin(actor, "only admins manage instruments")?;
        let rs = self.get_instrument_state(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = rs.write_owned().await;

        let mut instrument = guard.instrument.clone();
        if let Some(name) = update.name {
            instrument.name = required_text("name", &name, MAX_NAME_LEN)?;
        }
        if let Some(kind) = update.kind {
            instrument.kind = optional_text(kind, MAX_NAME_LEN)?;
        }
        if let Some(model) = update.model {
            instrument.model = optional_text(model, MAX_NAME_LEN)?;
        }
        if let Some(location) = update.location {
            instrument.location = required_text("location", &location, MAX_NAME_LEN)?;
        }
        if let Some(status) = update.status {
            instrument.status = status;
        }
        if let Some(due) = update.calibration_due {
            instrument.calibration_due = due;
        }

        let event = Event::InstrumentUpdated {
            instrument: instrument.clone(),
        };
        self.persist_and_apply(&mut [&mut *guard], &event).await?;
        info!(instrument = %id, status = instrument.status.as_str(), "instrument updated");
        Ok(instrument)
    }

    /// Operational status is set by hand; bookings never change it.
    pub async fn set_instrument_status(
        &self,
        actor: &Actor,
        id: Ulid,
        status: InstrumentStatus,
    ) -> Result<Instrument, EngineError> {
        let update = InstrumentUpdate {
            status: Some(status),
            ..Default::default()
        };
        self.update_instrument(actor, id, update).await
    }

    pub async fn log_maintenance(
        &self,
        actor: &Actor,
        id: Ulid,
        date: NaiveDate,
        description: &str,
    ) -> Result<MaintenanceEntry, EngineError> {
        require_admin(actor, "only admins manage instruments")?;
        let entry = MaintenanceEntry {
            date,
            description: required_text("description", description, MAX_COMMENT_LEN)?,
        };
        let rs = self.get_instrument_state(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard: InstrumentGuard = rs.write_owned().await;
        let event = Event::MaintenanceLogged {
            instrument_id: id,
            entry: entry.clone(),
        };
        self.persist_and_apply(&mut [&mut *guard], &event).await?;
        Ok(entry)
    }

    /// Refused while any booking, cancelled or not, still references it.
    pub async fn delete_instrument(&self, actor: &Actor, id: Ulid) -> Result<(), EngineError> {
        require_admin(actor, "only admins manage instruments")?;
        let _catalog = self.catalog.write().await;
        let rs = self.get_instrument_state(&id).ok_or(EngineError::NotFound(id))?;
        let guard = rs.write().await;
        if !guard.bookings.is_empty() {
            return Err(EngineError::HasBookings(id));
        }
        let event = Event::InstrumentDeleted { id };
        self.wal_append(&event).await?;
        self.instruments.remove(&id);
        drop(guard);
        self.notify.send(&[id], &event);
        self.notify.remove(&id);
        metrics::gauge!(observability::INSTRUMENTS_ACTIVE).set(self.instruments.len() as f64);
        info!(instrument = %id, "instrument deleted");
        Ok(())
    }
}
