mod billing;
mod conflict;
mod error;
mod expiry;
mod inventory;
mod lanes;
mod occupancy;
mod queries;
mod staff;
mod timeclock;
mod waitlist;

pub use billing::late_fee;
pub use conflict::now_ms;
pub use error::EngineError;
pub use expiry::ReapReport;

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::policy::Policy;
use crate::wal::{Wal, WalHandle};

pub type SharedResourceState = Arc<RwLock<ResourceState>>;
pub type ResourceGuard = OwnedRwLockWriteGuard<ResourceState>;

/// All state for one site.
///
/// Lock order: one of `desk`, `roster` or `catalog`, then `waitlist`, then
/// resource locks in ascending id order, then `gate`.
/// Every mutation appends its event to the WAL before touching memory.
pub struct Engine {
    resources: DashMap<Ulid, SharedResourceState>,
    /// Resource number → id.
    numbers: DashMap<String, Ulid>,
    /// Open visit → resource it occupies.
    visit_index: DashMap<Ulid, Ulid>,
    /// Customer → their open visit.
    customer_visits: DashMap<Ulid, Ulid>,
    lanes: DashMap<String, LaneSession>,
    /// FIFO; entries stay after closing until the next compaction.
    waitlist: Mutex<Vec<WaitlistEntry>>,
    ledger: DashMap<Ulid, Vec<LineItem>>,
    staff: DashMap<Ulid, StaffMember>,
    sessions: DashMap<Ulid, StaffSession>,
    time_entries: DashMap<Ulid, TimeEntry>,
    shifts: DashMap<Ulid, ShiftSlot>,
    /// Held across check and commit of lane and check-in uniqueness
    /// (lane, customer, visit id).
    desk: Mutex<()>,
    /// Same for staff, sessions, time entries and shifts.
    roster: Mutex<()>,
    /// Same for resource ids and numbers.
    catalog: Mutex<()>,
    /// Shared by commits, exclusive for compaction, so a snapshot never misses
    /// an event that is already in the log.
    gate: RwLock<()>,
    wal: WalHandle,
    pub notify: Arc<NotifyHub>,
    pub policy: Policy,
}

/// Resource-local part of an event. Ignores events that don't concern `rs`.
fn apply_to_resource(rs: &mut ResourceState, event: &Event) {
    match event {
        Event::StatusChanged {
            resource_id, to, at, ..
        } if *resource_id == rs.id => {
            rs.status = *to;
            rs.status_changed_at = *at;
        }
        Event::LaneOpened { session } if session.resource_id == rs.id => {
            rs.hold = Some(Hold {
                id: session.hold_id,
                owner: HoldOwner::Lane(session.lane.clone()),
                customer_id: session.customer_id,
                expires_at: session.expires_at,
            });
        }
        Event::LaneClosed {
            resource_id,
            hold_id,
            ..
        }
        | Event::OfferExpired {
            resource_id,
            hold_id,
            ..
        } if *resource_id == rs.id => {
            rs.release_hold(*hold_id);
        }
        Event::CheckedIn {
            visit_id,
            customer_id,
            resource_id,
            hold_id,
            block,
            ..
        } if *resource_id == rs.id => {
            rs.release_hold(*hold_id);
            rs.visit = Some(Visit {
                id: *visit_id,
                customer_id: *customer_id,
                blocks: vec![*block],
            });
        }
        Event::Renewed {
            visit_id,
            resource_id,
            block,
            ..
        } if *resource_id == rs.id => {
            if let Some(visit) = rs.visit.as_mut()
                && visit.id == *visit_id
            {
                visit.blocks.push(*block);
            }
        }
        Event::CheckedOut {
            visit_id,
            resource_id,
            at,
            withdrawn,
            ..
        } => {
            if *resource_id == rs.id && rs.visit.as_ref().is_some_and(|v| v.id == *visit_id) {
                rs.visit = None;
                rs.status = CleanStatus::Dirty;
                rs.status_changed_at = *at;
            }
            for w in withdrawn {
                if let Some((rid, hold_id)) = w.offer
                    && rid == rs.id
                {
                    rs.release_hold(hold_id);
                }
            }
        }
        Event::WaitlistLeft {
            offer: Some((rid, hold_id)),
            ..
        } if *rid == rs.id => {
            rs.release_hold(*hold_id);
        }
        Event::UpgradeOffered {
            resource_id, hold, ..
        } if *resource_id == rs.id => {
            rs.hold = Some(hold.clone());
        }
        Event::Upgraded {
            visit,
            from_resource,
            to_resource,
            hold_id,
            at,
            ..
        } => {
            if rs.id == *to_resource {
                rs.release_hold(*hold_id);
                rs.visit = Some(visit.clone());
            } else if rs.id == *from_resource {
                rs.visit = None;
                rs.status = CleanStatus::Dirty;
                rs.status_changed_at = *at;
            }
        }
        _ => {}
    }
}

fn set_waitlist_status(queue: &mut [WaitlistEntry], id: &Ulid, status: WaitlistStatus) {
    if let Some(entry) = queue.iter_mut().find(|e| e.id == *id) {
        entry.status = status;
    }
}

/// Waitlist part of an event.
fn apply_to_waitlist(queue: &mut Vec<WaitlistEntry>, event: &Event) {
    match event {
        Event::WaitlistJoined { entry } => queue.push(entry.clone()),
        Event::WaitlistLeft { id, .. } => set_waitlist_status(queue, id, WaitlistStatus::Cancelled),
        Event::UpgradeOffered {
            waitlist_id,
            resource_id,
            hold,
        } => set_waitlist_status(
            queue,
            waitlist_id,
            WaitlistStatus::Offered {
                resource_id: *resource_id,
                hold_id: hold.id,
                expires_at: hold.expires_at,
            },
        ),
        Event::OfferExpired { waitlist_id, .. } => {
            set_waitlist_status(queue, waitlist_id, WaitlistStatus::Expired)
        }
        Event::Upgraded { waitlist_id, .. } => {
            set_waitlist_status(queue, waitlist_id, WaitlistStatus::Accepted)
        }
        Event::CheckedOut { withdrawn, .. } => {
            for w in withdrawn {
                set_waitlist_status(queue, &w.waitlist_id, WaitlistStatus::Cancelled);
            }
        }
        _ => {}
    }
}

fn touches_waitlist(event: &Event) -> bool {
    match event {
        Event::WaitlistJoined { .. }
        | Event::WaitlistLeft { .. }
        | Event::UpgradeOffered { .. }
        | Event::OfferExpired { .. }
        | Event::Upgraded { .. } => true,
        Event::CheckedOut { withdrawn, .. } => !withdrawn.is_empty(),
        _ => false,
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>, policy: Policy) -> std::io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = WalHandle::spawn(Wal::open(&wal_path)?);

        let mut engine = Self {
            resources: DashMap::new(),
            numbers: DashMap::new(),
            visit_index: DashMap::new(),
            customer_visits: DashMap::new(),
            lanes: DashMap::new(),
            waitlist: Mutex::new(Vec::new()),
            ledger: DashMap::new(),
            staff: DashMap::new(),
            sessions: DashMap::new(),
            time_entries: DashMap::new(),
            shifts: DashMap::new(),
            desk: Mutex::new(()),
            roster: Mutex::new(()),
            catalog: Mutex::new(()),
            gate: RwLock::new(()),
            wal,
            notify,
            policy,
        };
        for event in &events {
            engine.replay(event);
        }
        if !events.is_empty() {
            tracing::info!(
                "replayed {} events: {} resources, {} open visits",
                events.len(),
                engine.resources.len(),
                engine.visit_index.len()
            );
        }
        Ok(engine)
    }

    /// Apply a logged event while we are still the sole owner of every lock.
    fn replay(&mut self, event: &Event) {
        if let Event::Snapshot(snapshot) = event {
            self.restore(snapshot);
            return;
        }
        for rid in event.resource_ids() {
            if let Some(mut entry) = self.resources.get_mut(&rid)
                && let Some(lock) = Arc::get_mut(entry.value_mut())
            {
                apply_to_resource(lock.get_mut(), event);
            }
        }
        apply_to_waitlist(self.waitlist.get_mut(), event);
        self.apply_to_tables(event);
    }

    fn restore(&mut self, snapshot: &Snapshot) {
        self.resources.clear();
        self.numbers.clear();
        self.visit_index.clear();
        self.customer_visits.clear();
        for rs in &snapshot.resources {
            if let Some(visit) = &rs.visit {
                self.visit_index.insert(visit.id, rs.id);
                self.customer_visits.insert(visit.customer_id, visit.id);
            }
            self.numbers.insert(rs.number.clone(), rs.id);
            self.resources.insert(rs.id, Arc::new(RwLock::new(rs.clone())));
        }
        self.lanes = snapshot.lanes.iter().map(|s| (s.lane.clone(), s.clone())).collect();
        *self.waitlist.get_mut() = snapshot.waitlist.clone();
        self.ledger.clear();
        for item in &snapshot.ledger {
            self.post(item.clone());
        }
        self.staff = snapshot.staff.iter().map(|m| (m.id, m.clone())).collect();
        self.sessions = snapshot.sessions.iter().map(|s| (s.id, s.clone())).collect();
        self.time_entries = snapshot.time_entries.iter().map(|e| (e.id, e.clone())).collect();
        self.shifts = snapshot.shifts.iter().map(|s| (s.id, s.clone())).collect();
    }

    /// Everything outside resource locks and the waitlist.
    fn apply_to_tables(&self, event: &Event) {
        match event {
            Event::ResourceAdded { id, number, tier, at } => {
                let rs = ResourceState::new(*id, number.clone(), *tier, *at);
                self.resources.insert(*id, Arc::new(RwLock::new(rs)));
                self.numbers.insert(number.clone(), *id);
            }
            Event::ResourceRetired { id } => {
                self.resources.remove(id);
                self.numbers.retain(|_, rid| rid != id);
            }
            Event::LaneOpened { session } => {
                self.lanes.insert(session.lane.clone(), session.clone());
            }
            Event::LaneClosed { lane, hold_id, .. } => {
                self.lanes.remove_if(lane, |_, s| s.hold_id == *hold_id);
            }
            Event::CheckedIn {
                visit_id,
                customer_id,
                resource_id,
                lane,
                charge,
                ..
            } => {
                self.lanes.remove(lane);
                self.visit_index.insert(*visit_id, *resource_id);
                self.customer_visits.insert(*customer_id, *visit_id);
                self.post(charge.clone());
            }
            Event::Renewed { charge, .. } => self.post(charge.clone()),
            Event::CheckedOut {
                visit_id,
                customer_id,
                late_fee,
                ..
            } => {
                self.visit_index.remove(visit_id);
                self.customer_visits.remove_if(customer_id, |_, v| v == visit_id);
                if let Some(fee) = late_fee {
                    self.post(fee.clone());
                }
            }
            Event::Upgraded {
                visit,
                to_resource,
                charge,
                ..
            } => {
                self.visit_index.insert(visit.id, *to_resource);
                if let Some(charge) = charge {
                    self.post(charge.clone());
                }
            }
            Event::LineItemAdded { item } => self.post(item.clone()),
            Event::StaffAdded { member } => {
                self.staff.insert(member.id, member.clone());
            }
            Event::StaffDeactivated { id } => {
                if let Some(mut member) = self.staff.get_mut(id) {
                    member.active = false;
                }
                self.sessions.retain(|_, s| s.staff_id != *id);
            }
            Event::SessionOpened { session } => {
                self.sessions.insert(session.id, session.clone());
            }
            Event::SessionClosed { id, .. } => {
                self.sessions.remove(id);
            }
            Event::ClockedIn { entry } => {
                self.time_entries.insert(entry.id, entry.clone());
            }
            Event::ClockedOut { id, at, .. } => {
                if let Some(mut entry) = self.time_entries.get_mut(id) {
                    entry.clock_out = Some(*at);
                }
            }
            Event::ShiftScheduled { shift } => {
                self.shifts.insert(shift.id, shift.clone());
            }
            Event::ShiftRemoved { id, .. } => {
                self.shifts.remove(id);
            }
            _ => {}
        }
    }

    fn post(&self, item: LineItem) {
        self.ledger.entry(item.visit_id).or_default().push(item);
    }

    /// WAL-append, apply to the locked state the caller passes in, then notify.
    ///
    /// `resources` must hold write guards for every id in `event.resource_ids()`,
    /// and `queue` must be the locked waitlist when the event touches it.
    async fn commit(
        &self,
        event: Event,
        resources: &mut [&mut ResourceState],
        queue: Option<&mut Vec<WaitlistEntry>>,
    ) -> Result<(), EngineError> {
        debug_assert!(queue.is_some() || !touches_waitlist(&event));
        let _gate = self.gate.read().await;
        self.wal
            .append(&event)
            .await
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        for rs in resources.iter_mut() {
            apply_to_resource(rs, &event);
        }
        if let Some(queue) = queue {
            apply_to_waitlist(queue, &event);
        }
        self.apply_to_tables(&event);
        self.notify.send(&event);
        Ok(())
    }

    pub fn get_resource(&self, id: &Ulid) -> Option<SharedResourceState> {
        self.resources.get(id).map(|e| e.value().clone())
    }

    /// Resource currently occupied by an open visit.
    pub fn resource_for_visit(&self, visit_id: &Ulid) -> Option<Ulid> {
        self.visit_index.get(visit_id).map(|e| *e.value())
    }

    fn resource_handles(&self) -> Vec<SharedResourceState> {
        self.resources.iter().map(|e| e.value().clone()).collect()
    }

    /// Write-lock several resources in ascending id order.
    async fn lock_resources(&self, ids: &[Ulid]) -> Result<Vec<ResourceGuard>, EngineError> {
        let mut ids = ids.to_vec();
        ids.sort();
        ids.dedup();
        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            guards.push(self.lock_resource(id).await?);
        }
        Ok(guards)
    }

    async fn lock_resource(&self, id: Ulid) -> Result<ResourceGuard, EngineError> {
        let rs = self.get_resource(&id).ok_or(EngineError::NotFound(id))?;
        let guard = rs.write_owned().await;
        // Retirement removes the entry while holding this lock.
        if !self.resources.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        Ok(guard)
    }

    /// Write-lock the assignable resource of `tier` that has been clean the longest.
    /// Never holds more than one resource lock at a time.
    async fn claim_assignable(&self, tier: Tier) -> Option<ResourceGuard> {
        let mut candidates = Vec::new();
        for rs in self.resource_handles() {
            let guard = rs.read().await;
            if guard.tier == tier && guard.is_assignable() {
                candidates.push((guard.status_changed_at, guard.id, rs.clone()));
            }
        }
        candidates.sort_by_key(|(at, id, _)| (*at, *id));
        for (_, _, rs) in candidates {
            let guard = rs.write_owned().await;
            // Re-check: someone may have taken it between the scan and the lock.
            if guard.tier == tier && guard.is_assignable() && self.resources.contains_key(&guard.id) {
                return Some(guard);
            }
        }
        None
    }

    /// Read-lock every resource in ascending id order.
    async fn read_all(&self) -> Vec<OwnedRwLockReadGuard<ResourceState>> {
        let mut handles: Vec<(Ulid, SharedResourceState)> =
            self.resources.iter().map(|e| (*e.key(), e.value().clone())).collect();
        handles.sort_by_key(|(id, _)| *id);
        let mut guards = Vec::with_capacity(handles.len());
        for (_, rs) in handles {
            guards.push(rs.read_owned().await);
        }
        guards
    }

    /// Rewrite the WAL as a single snapshot of the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut queue = self.waitlist.lock().await;
        let guards = self.read_all().await;
        let _gate = self.gate.write().await;

        queue.retain(|e| e.status.is_open());
        let snapshot = Snapshot {
            resources: guards.iter().map(|g| (**g).clone()).collect(),
            lanes: self.lanes.iter().map(|e| e.value().clone()).collect(),
            waitlist: queue.clone(),
            ledger: self.ledger.iter().flat_map(|e| e.value().clone()).collect(),
            staff: self.staff.iter().map(|e| e.value().clone()).collect(),
            sessions: self.sessions.iter().map(|e| e.value().clone()).collect(),
            time_entries: self.time_entries.iter().map(|e| e.value().clone()).collect(),
            shifts: self.shifts.iter().map(|e| e.value().clone()).collect(),
        };
        self.wal
            .compact(vec![Event::Snapshot(Box::new(snapshot))])
            .await
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        self.wal.appends_since_compact().await
    }
}
