use ulid::Ulid;

use crate::limits::{MAX_QUERY_WINDOW_MS, MAX_SHIFT_MS};
use crate::model::*;

use super::conflict::{validate_at, validate_window};
use super::{Engine, EngineError};

impl Engine {
    pub(super) fn open_time_entry(&self, staff_id: &Ulid) -> Option<Ulid> {
        self.time_entries
            .iter()
            .find(|e| e.staff_id == *staff_id && e.clock_out.is_none())
            .map(|e| e.id)
    }

    fn require_active_staff(&self, staff_id: &Ulid) -> Result<(), EngineError> {
        match self.staff.get(staff_id) {
            Some(m) if m.active => Ok(()),
            Some(_) => Err(EngineError::Unauthorized("staff member is inactive")),
            None => Err(EngineError::NotFound(*staff_id)),
        }
    }

    pub async fn clock_in(&self, id: Ulid, staff_id: Ulid, at: Ms) -> Result<(), EngineError> {
        validate_at(at)?;
        let _roster = self.roster.lock().await;
        self.require_active_staff(&staff_id)?;
        if self.time_entries.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if self.open_time_entry(&staff_id).is_some() {
            return Err(EngineError::AlreadyClockedIn(staff_id));
        }
        let entry = TimeEntry {
            id,
            staff_id,
            clock_in: at,
            clock_out: None,
        };
        self.commit(Event::ClockedIn { entry }, &mut [], None).await
    }

    pub async fn clock_out(&self, id: Ulid, staff_id: Ulid, at: Ms) -> Result<(), EngineError> {
        validate_at(at)?;
        let _roster = self.roster.lock().await;
        let entry = self
            .time_entries
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(id))?;
        if entry.staff_id != staff_id {
            return Err(EngineError::Unauthorized("time entry belongs to someone else"));
        }
        if entry.clock_out.is_some() {
            return Err(EngineError::NotClockedIn(id));
        }
        if at <= entry.clock_in {
            return Err(EngineError::InvalidArgument("clock-out must be after clock-in"));
        }
        self.commit(Event::ClockedOut { id, staff_id, at }, &mut [], None)
            .await
    }

    pub async fn schedule_shift(
        &self,
        id: Ulid,
        staff_id: Ulid,
        start: Ms,
        end: Ms,
    ) -> Result<(), EngineError> {
        let span = validate_window(start, end, MAX_SHIFT_MS)?;
        let _roster = self.roster.lock().await;
        self.require_active_staff(&staff_id)?;
        if self.shifts.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if let Some(clash) = self
            .shifts
            .iter()
            .find(|s| s.staff_id == staff_id && s.span.overlaps(&span))
        {
            return Err(EngineError::ShiftOverlap(clash.id));
        }
        let shift = ShiftSlot { id, staff_id, span };
        self.commit(Event::ShiftScheduled { shift }, &mut [], None).await
    }

    pub async fn remove_shift(&self, id: Ulid) -> Result<(), EngineError> {
        let _roster = self.roster.lock().await;
        let staff_id = self
            .shifts
            .get(&id)
            .map(|s| s.staff_id)
            .ok_or(EngineError::NotFound(id))?;
        self.commit(Event::ShiftRemoved { id, staff_id }, &mut [], None)
            .await
    }

    /// Entries overlapping `[start, end)` and the time worked inside it. An
    /// entry still open counts up to `now`.
    pub fn timesheet(&self, staff_id: Ulid, start: Ms, end: Ms, now: Ms) -> Result<Timesheet, EngineError> {
        let window = validate_window(start, end, MAX_QUERY_WINDOW_MS)?;
        let mut entries: Vec<TimeEntry> = self
            .time_entries
            .iter()
            .filter(|e| {
                e.staff_id == staff_id
                    && e.clock_in < window.end
                    && e.clock_out.unwrap_or(Ms::MAX) > window.start
            })
            .map(|e| e.value().clone())
            .collect();
        entries.sort_by_key(|e| e.clock_in);
        let worked_ms = entries.iter().map(|e| e.worked_within(&window, now)).sum();
        Ok(Timesheet {
            staff_id,
            entries,
            worked_ms,
        })
    }

    /// Shifts overlapping `[start, end)`, optionally for one member.
    pub fn schedule(&self, start: Ms, end: Ms, staff_id: Option<Ulid>) -> Result<Vec<ShiftSlot>, EngineError> {
        let window = validate_window(start, end, MAX_QUERY_WINDOW_MS)?;
        let mut shifts: Vec<ShiftSlot> = self
            .shifts
            .iter()
            .filter(|s| s.span.overlaps(&window) && staff_id.is_none_or(|id| s.staff_id == id))
            .map(|s| s.value().clone())
            .collect();
        shifts.sort_by_key(|s| (s.span.start, s.id));
        Ok(shifts)
    }
}
