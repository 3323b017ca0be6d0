use crate::model::*;
use crate::observability::HOLDS_EXPIRED_TOTAL;

use super::{Engine, EngineError};

/// What one reaper pass released.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReapReport {
    pub lane_holds: usize,
    pub offers: usize,
    pub sessions: usize,
}

impl ReapReport {
    pub fn is_empty(&self) -> bool {
        self.lane_holds == 0 && self.offers == 0 && self.sessions == 0
    }
}

impl Engine {
    /// Release every hold and staff session that expired at or before `now`,
    /// then re-offer freed units to the waitlist.
    pub async fn reap_expired(&self, now: Ms) -> Result<ReapReport, EngineError> {
        let mut report = ReapReport::default();

        let expired_lanes: Vec<LaneSession> = self
            .lanes
            .iter()
            .filter(|s| s.expires_at <= now)
            .map(|s| s.value().clone())
            .collect();
        for session in expired_lanes {
            let mut guard = match self.lock_resource(session.resource_id).await {
                Ok(g) => g,
                Err(EngineError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            // Checked in or closed while we waited for the lock.
            if !self
                .lanes
                .get(&session.lane)
                .is_some_and(|s| s.hold_id == session.hold_id)
            {
                continue;
            }
            let event = Event::LaneClosed {
                lane: session.lane,
                resource_id: session.resource_id,
                hold_id: session.hold_id,
                expired: true,
            };
            self.commit(event, &mut [&mut *guard], None).await?;
            report.lane_holds += 1;
        }

        {
            let mut queue = self.waitlist.lock().await;
            let expired_offers: Vec<_> = queue
                .iter()
                .filter_map(|e| match e.status {
                    WaitlistStatus::Offered {
                        resource_id,
                        hold_id,
                        expires_at,
                    } if expires_at <= now => Some((e.id, resource_id, hold_id)),
                    _ => None,
                })
                .collect();
            for (waitlist_id, resource_id, hold_id) in expired_offers {
                let event = Event::OfferExpired {
                    waitlist_id,
                    resource_id,
                    hold_id,
                };
                match self.lock_resource(resource_id).await {
                    Ok(mut guard) => {
                        self.commit(event, &mut [&mut *guard], Some(&mut *queue))
                            .await?
                    }
                    Err(EngineError::NotFound(_)) => {
                        self.commit(event, &mut [], Some(&mut *queue)).await?
                    }
                    Err(e) => return Err(e),
                }
                report.offers += 1;
            }
        }

        let roster = self.roster.lock().await;
        let expired_sessions: Vec<(ulid::Ulid, ulid::Ulid)> = self
            .sessions
            .iter()
            .filter(|s| s.expires_at <= now)
            .map(|s| (s.id, s.staff_id))
            .collect();
        for (id, staff_id) in expired_sessions {
            self.commit(Event::SessionClosed { id, staff_id }, &mut [], None)
                .await?;
            report.sessions += 1;
        }
        drop(roster);

        let holds = report.lane_holds + report.offers;
        if holds > 0 {
            metrics::counter!(HOLDS_EXPIRED_TOTAL).increment(holds as u64);
        }
        if report.offers > 0 || report.lane_holds > 0 {
            self.offer_upgrades(now).await?;
        }
        Ok(report)
    }
}
