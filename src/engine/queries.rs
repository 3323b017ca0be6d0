use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

fn resource_info(rs: &ResourceState) -> ResourceInfo {
    ResourceInfo {
        id: rs.id,
        number: rs.number.clone(),
        tier: rs.tier,
        status: rs.status,
        status_changed_at: rs.status_changed_at,
        visit_id: rs.visit.as_ref().map(|v| v.id),
        customer_id: rs.visit.as_ref().map(|v| v.customer_id),
        ends_at: rs.visit.as_ref().map(|v| v.ends_at()),
        hold_id: rs.hold.as_ref().map(|h| h.id),
        hold_expires_at: rs.hold.as_ref().map(|h| h.expires_at),
    }
}

fn visit_info(rs: &ResourceState, visit: &Visit, now: Ms) -> VisitInfo {
    VisitInfo {
        id: visit.id,
        customer_id: visit.customer_id,
        resource_id: rs.id,
        number: rs.number.clone(),
        tier: rs.tier,
        started_at: visit.started_at(),
        ends_at: visit.ends_at(),
        renewals: visit.blocks.len().saturating_sub(1) as u32,
        overdue: visit.is_overdue(now),
    }
}

impl Engine {
    /// Every resource, ordered by tier then number.
    pub async fn inventory(&self) -> Vec<ResourceInfo> {
        let mut out = Vec::with_capacity(self.resources.len());
        for rs in self.resource_handles() {
            out.push(resource_info(&*rs.read().await));
        }
        out.sort_by(|a, b| (a.tier, &a.number).cmp(&(b.tier, &b.number)));
        out
    }

    pub async fn resource(&self, id: &Ulid) -> Result<ResourceInfo, EngineError> {
        let rs = self.get_resource(id).ok_or(EngineError::NotFound(*id))?;
        let guard = rs.read().await;
        Ok(resource_info(&guard))
    }

    /// Supply and demand per tier.
    pub async fn availability(&self) -> Vec<TierAvailability> {
        let mut rows: Vec<TierAvailability> = Tier::ALL
            .iter()
            .map(|&tier| TierAvailability {
                tier,
                total: 0,
                assignable: 0,
                occupied: 0,
                held: 0,
                dirty: 0,
                cleaning: 0,
                waiting: 0,
            })
            .collect();

        for rs in self.resource_handles() {
            let guard = rs.read().await;
            let row = &mut rows[guard.tier as usize];
            row.total += 1;
            if guard.is_assignable() {
                row.assignable += 1;
            }
            if guard.is_occupied() {
                row.occupied += 1;
            }
            if guard.hold.is_some() {
                row.held += 1;
            }
            match guard.status {
                CleanStatus::Dirty => row.dirty += 1,
                CleanStatus::Cleaning => row.cleaning += 1,
                CleanStatus::Clean => {}
            }
        }

        let queue = self.waitlist.lock().await;
        for entry in queue.iter().filter(|e| e.status == WaitlistStatus::Waiting) {
            rows[entry.tier as usize].waiting += 1;
        }
        rows
    }

    /// Open visits ordered by scheduled end. `overdue_only` keeps those past
    /// their end at `now`.
    pub async fn visits(&self, now: Ms, overdue_only: bool) -> Vec<VisitInfo> {
        let mut out = Vec::new();
        for rs in self.resource_handles() {
            let guard = rs.read().await;
            let Some(visit) = guard.visit.as_ref() else {
                continue;
            };
            if overdue_only && !visit.is_overdue(now) {
                continue;
            }
            out.push(visit_info(&guard, visit, now));
        }
        out.sort_by_key(|v| (v.ends_at, v.id));
        out
    }

    pub async fn visit(&self, visit_id: &Ulid, now: Ms) -> Result<VisitInfo, EngineError> {
        let rid = self
            .resource_for_visit(visit_id)
            .ok_or(EngineError::NotFound(*visit_id))?;
        let rs = self.get_resource(&rid).ok_or(EngineError::NotFound(rid))?;
        let guard = rs.read().await;
        let visit = guard
            .visit
            .as_ref()
            .filter(|v| v.id == *visit_id)
            .ok_or(EngineError::NotFound(*visit_id))?;
        Ok(visit_info(&guard, visit, now))
    }
}
