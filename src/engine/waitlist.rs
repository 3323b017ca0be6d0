use ulid::Ulid;

use crate::limits::MAX_OPEN_WAITLIST;
use crate::model::*;
use crate::observability::UPGRADES_TOTAL;

use super::conflict::{check_hold, validate_at};
use super::{Engine, EngineError};

impl Engine {
    /// Queue an upgrade request for an open visit.
    pub async fn join_waitlist(
        &self,
        id: Ulid,
        visit_id: Ulid,
        tier: Tier,
        at: Ms,
    ) -> Result<(), EngineError> {
        validate_at(at)?;
        let mut queue = self.waitlist.lock().await;
        if queue.iter().filter(|e| e.status.is_open()).count() >= MAX_OPEN_WAITLIST {
            return Err(EngineError::LimitExceeded("waitlist is full"));
        }
        if queue.iter().any(|e| e.id == id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if queue.iter().any(|e| e.visit_id == visit_id && e.status.is_open()) {
            return Err(EngineError::AlreadyWaiting(visit_id));
        }

        let rid = self
            .resource_for_visit(&visit_id)
            .ok_or(EngineError::NotFound(visit_id))?;
        let rs = self.get_resource(&rid).ok_or(EngineError::NotFound(rid))?;
        let (current, customer_id) = {
            let guard = rs.read().await;
            let visit = guard
                .visit
                .as_ref()
                .filter(|v| v.id == visit_id)
                .ok_or(EngineError::NotFound(visit_id))?;
            (guard.tier, visit.customer_id)
        };
        if tier <= current {
            return Err(EngineError::NotAnUpgrade { from: current, to: tier });
        }

        let entry = WaitlistEntry {
            id,
            visit_id,
            customer_id,
            tier,
            created_at: at,
            status: WaitlistStatus::Waiting,
        };
        self.commit(Event::WaitlistJoined { entry }, &mut [], Some(&mut *queue))
            .await?;
        drop(queue);
        self.offer_upgrades(at).await?;
        Ok(())
    }

    /// Cancel an open entry, giving back any unit it was offered.
    pub async fn leave_waitlist(&self, id: Ulid, at: Ms) -> Result<(), EngineError> {
        let mut queue = self.waitlist.lock().await;
        let entry = queue
            .iter()
            .find(|e| e.id == id && e.status.is_open())
            .ok_or(EngineError::NotFound(id))?;
        let offer = match entry.status {
            WaitlistStatus::Offered {
                resource_id,
                hold_id,
                ..
            } => Some((resource_id, hold_id)),
            _ => None,
        };

        let event = Event::WaitlistLeft { id, offer };
        match offer {
            Some((rid, _)) => {
                let mut guard = self.lock_resource(rid).await?;
                self.commit(event, &mut [&mut *guard], Some(&mut *queue))
                    .await?;
            }
            None => self.commit(event, &mut [], Some(&mut *queue)).await?,
        }
        drop(queue);
        if offer.is_some() {
            self.offer_upgrades(at).await?;
        }
        Ok(())
    }

    /// Walk waiting entries oldest first and hold a unit of the requested tier
    /// for each one that can be served. Returns the number of offers made.
    pub async fn offer_upgrades(&self, at: Ms) -> Result<usize, EngineError> {
        let mut queue = self.waitlist.lock().await;
        let waiting: Vec<(Ulid, Ulid, Tier)> = queue
            .iter()
            .filter(|e| e.status == WaitlistStatus::Waiting)
            .map(|e| (e.id, e.customer_id, e.tier))
            .collect();

        let mut exhausted: Vec<Tier> = Vec::new();
        let mut offered = 0;
        for (waitlist_id, customer_id, tier) in waiting {
            if exhausted.contains(&tier) {
                continue;
            }
            let Some(mut guard) = self.claim_assignable(tier).await else {
                exhausted.push(tier);
                continue;
            };
            let hold = Hold {
                id: Ulid::new(),
                owner: HoldOwner::Waitlist(waitlist_id),
                customer_id,
                expires_at: at + self.policy.offer_hold_ms,
            };
            let event = Event::UpgradeOffered {
                waitlist_id,
                resource_id: guard.id,
                hold,
            };
            self.commit(event, &mut [&mut *guard], Some(&mut *queue))
                .await?;
            tracing::debug!("offered {tier} {} to waitlist entry {waitlist_id}", guard.number);
            offered += 1;
        }
        Ok(offered)
    }

    /// Move the visit onto the offered unit. Blocks stay as they were; the old
    /// unit goes DIRTY and the tier price difference is charged.
    pub async fn accept_upgrade(&self, waitlist_id: Ulid, at: Ms) -> Result<Visit, EngineError> {
        validate_at(at)?;
        let mut queue = self.waitlist.lock().await;
        let entry = queue
            .iter()
            .find(|e| e.id == waitlist_id)
            .ok_or(EngineError::NotFound(waitlist_id))?;
        let WaitlistStatus::Offered {
            resource_id: to_resource,
            hold_id,
            ..
        } = entry.status
        else {
            return Err(EngineError::NotOffered(waitlist_id));
        };
        let visit_id = entry.visit_id;
        let from_resource = self
            .resource_for_visit(&visit_id)
            .ok_or(EngineError::NotFound(visit_id))?;

        let mut guards = self.lock_resources(&[from_resource, to_resource]).await?;
        let (visit, from_tier, to_tier, to_number) = {
            let from = guards
                .iter()
                .find(|g| g.id == from_resource)
                .ok_or(EngineError::NotFound(from_resource))?;
            let to = guards
                .iter()
                .find(|g| g.id == to_resource)
                .ok_or(EngineError::NotFound(to_resource))?;
            check_hold(to, hold_id, at)?;
            let visit = from
                .visit
                .clone()
                .filter(|v| v.id == visit_id)
                .ok_or(EngineError::NotFound(visit_id))?;
            (visit, from.tier, to.tier, to.number.clone())
        };

        let difference = self.policy.price(to_tier) - self.policy.price(from_tier);
        let charge = (difference > 0).then(|| LineItem {
            id: Ulid::new(),
            visit_id,
            kind: LineItemKind::Upgrade,
            description: format!("upgrade {from_tier} to {to_tier} {to_number}"),
            amount: difference,
            created_at: at,
        });
        let event = Event::Upgraded {
            waitlist_id,
            visit: visit.clone(),
            from_resource,
            to_resource,
            hold_id,
            charge,
            at,
        };
        let mut refs: Vec<&mut ResourceState> = guards.iter_mut().map(|g| &mut **g).collect();
        self.commit(event, &mut refs, Some(&mut *queue)).await?;
        metrics::counter!(UPGRADES_TOTAL, "tier" => to_tier.as_str()).increment(1);
        tracing::info!("visit {visit_id} upgraded {from_tier} -> {to_tier}");
        Ok(visit)
    }

    /// Open entries in queue order.
    pub async fn waitlist(&self) -> Vec<WaitlistEntry> {
        let queue = self.waitlist.lock().await;
        queue.iter().filter(|e| e.status.is_open()).cloned().collect()
    }

    pub async fn waitlist_entry(&self, id: &Ulid) -> Option<WaitlistEntry> {
        let queue = self.waitlist.lock().await;
        queue.iter().find(|e| e.id == *id).cloned()
    }
}
