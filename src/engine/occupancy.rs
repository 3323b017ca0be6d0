use ulid::Ulid;

use crate::model::*;
use crate::observability::{CHECKOUTS_TOTAL, LATE_FEES_CENTS_TOTAL};

use super::billing::late_fee;
use super::conflict::{next_block, validate_at};
use super::{Engine, EngineError, ResourceGuard};

/// An upgrade can move a visit between lookup and lock; retry that many times.
const VISIT_LOCK_ATTEMPTS: usize = 3;

impl Engine {
    /// Write-lock the resource currently holding `visit_id`.
    async fn lock_visit(&self, visit_id: Ulid) -> Result<ResourceGuard, EngineError> {
        for _ in 0..VISIT_LOCK_ATTEMPTS {
            let rid = self
                .resource_for_visit(&visit_id)
                .ok_or(EngineError::NotFound(visit_id))?;
            let guard = match self.lock_resource(rid).await {
                Ok(g) => g,
                Err(EngineError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            if guard.visit.as_ref().is_some_and(|v| v.id == visit_id) {
                return Ok(guard);
            }
        }
        Err(EngineError::NotFound(visit_id))
    }

    /// Extend a visit by one block, contiguous with its current end.
    pub async fn renew(&self, visit_id: Ulid, at: Ms) -> Result<Visit, EngineError> {
        validate_at(at)?;
        let mut guard = self.lock_visit(visit_id).await?;
        let visit = guard
            .visit
            .as_ref()
            .ok_or(EngineError::NotFound(visit_id))?;
        let block = next_block(visit, self.policy.block_ms, self.policy.max_stay_ms)?;

        let charge = LineItem {
            id: Ulid::new(),
            visit_id,
            kind: LineItemKind::Renewal,
            description: format!("renewal {} {}", guard.tier, guard.number),
            amount: self.policy.price(guard.tier),
            created_at: at,
        };
        let event = Event::Renewed {
            visit_id,
            resource_id: guard.id,
            block,
            charge,
        };
        self.commit(event, &mut [&mut *guard], None).await?;
        guard
            .visit
            .clone()
            .ok_or_else(|| EngineError::Internal("visit missing after renewal".into()))
    }

    /// Close a visit. The unit goes DIRTY, lateness is charged, and any
    /// upgrade request the visit still had open is withdrawn.
    pub async fn check_out(&self, visit_id: Ulid, at: Ms) -> Result<CheckoutReceipt, EngineError> {
        validate_at(at)?;
        // Upgrades move visits only under the waitlist lock, so the mapping is
        // stable while we hold it.
        let queue = self.waitlist.lock().await;
        let resource_id = self
            .resource_for_visit(&visit_id)
            .ok_or(EngineError::NotFound(visit_id))?;

        let withdrawn: Vec<Withdrawn> = queue
            .iter()
            .filter(|e| e.visit_id == visit_id && e.status.is_open())
            .map(|e| Withdrawn {
                waitlist_id: e.id,
                offer: match e.status {
                    WaitlistStatus::Offered {
                        resource_id,
                        hold_id,
                        ..
                    } => Some((resource_id, hold_id)),
                    _ => None,
                },
            })
            .collect();
        let mut ids = vec![resource_id];
        ids.extend(withdrawn.iter().filter_map(|w| w.offer.map(|(rid, _)| rid)));
        let mut guards = self.lock_resources(&ids).await?;

        let (customer_id, ends_at, tier) = {
            let rs = guards
                .iter()
                .find(|g| g.id == resource_id)
                .ok_or(EngineError::NotFound(resource_id))?;
            let visit = rs
                .visit
                .as_ref()
                .filter(|v| v.id == visit_id)
                .ok_or(EngineError::NotFound(visit_id))?;
            (visit.customer_id, visit.ends_at(), rs.tier)
        };

        let late_ms = (at - ends_at).max(0);
        let fee = late_fee(late_ms, &self.policy.late_fees).map(|amount| LineItem {
            id: Ulid::new(),
            visit_id,
            kind: LineItemKind::LateFee,
            description: format!("late checkout, {} min", late_ms / 60_000),
            amount,
            created_at: at,
        });
        let released_offer = withdrawn.iter().any(|w| w.offer.is_some());
        // With nothing to withdraw the waitlist is not needed past this point;
        // the locked unit already keeps joins for this visit out.
        let mut queue = if withdrawn.is_empty() {
            drop(queue);
            None
        } else {
            Some(queue)
        };
        let event = Event::CheckedOut {
            visit_id,
            customer_id,
            resource_id,
            at,
            late_ms,
            late_fee: fee.clone(),
            withdrawn,
        };
        let mut refs: Vec<&mut ResourceState> = guards.iter_mut().map(|g| &mut **g).collect();
        self.commit(event, &mut refs, queue.as_deref_mut()).await?;
        drop(refs);
        drop(guards);
        drop(queue);

        metrics::counter!(CHECKOUTS_TOTAL, "tier" => tier.as_str()).increment(1);
        let late_fee = fee.map(|f| f.amount);
        if let Some(amount) = late_fee {
            metrics::counter!(LATE_FEES_CENTS_TOTAL).increment(amount as u64);
            tracing::info!("visit {visit_id} checked out {late_ms} ms late, fee {amount}");
        }
        if released_offer {
            self.offer_upgrades(at).await?;
        }
        Ok(CheckoutReceipt {
            visit_id,
            resource_id,
            late_ms,
            late_fee,
        })
    }
}
