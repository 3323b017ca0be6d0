use ulid::Ulid;

use crate::model::*;
use crate::notify::is_valid_lane_name;
use crate::observability::CHECKINS_TOTAL;

use super::conflict::{check_hold, validate_at};
use super::{Engine, EngineError};

impl Engine {
    /// Start serving a customer at a lane: reserve the unit of `tier` that has
    /// been clean the longest until they finish at the desk.
    pub async fn open_lane(
        &self,
        lane: String,
        customer_id: Ulid,
        tier: Tier,
        at: Ms,
    ) -> Result<LaneSession, EngineError> {
        validate_at(at)?;
        if !is_valid_lane_name(&lane) {
            return Err(EngineError::InvalidArgument("invalid lane name"));
        }

        let _desk = self.desk.lock().await;
        if self.lanes.contains_key(&lane) {
            return Err(EngineError::LaneBusy(lane));
        }
        if self.customer_visits.contains_key(&customer_id)
            || self.lanes.iter().any(|s| s.customer_id == customer_id)
        {
            return Err(EngineError::AlreadyCheckedIn(customer_id));
        }

        let mut guard = self
            .claim_assignable(tier)
            .await
            .ok_or(EngineError::NoneAvailable(tier))?;

        let session = LaneSession {
            lane,
            customer_id,
            tier,
            resource_id: guard.id,
            hold_id: Ulid::new(),
            started_at: at,
            expires_at: at + self.policy.lane_hold_ms,
        };
        let event = Event::LaneOpened {
            session: session.clone(),
        };
        self.commit(event, &mut [&mut *guard], None).await?;
        tracing::debug!(
            "lane {} holding {} {} for {}",
            session.lane,
            tier,
            guard.number,
            customer_id
        );
        Ok(session)
    }

    /// Abandon a lane session and give its unit back.
    pub async fn close_lane(&self, lane: &str, at: Ms) -> Result<(), EngineError> {
        let session = self
            .lanes
            .get(lane)
            .map(|s| s.value().clone())
            .ok_or_else(|| EngineError::LaneNotFound(lane.to_string()))?;
        let mut guard = self.lock_resource(session.resource_id).await?;
        let event = Event::LaneClosed {
            lane: session.lane,
            resource_id: session.resource_id,
            hold_id: session.hold_id,
            expired: false,
        };
        self.commit(event, &mut [&mut *guard], None).await?;
        drop(guard);
        self.offer_upgrades(at).await?;
        Ok(())
    }

    /// Turn the lane's hold into an occupancy of one block starting at `at`.
    pub async fn check_in(&self, visit_id: Ulid, lane: &str, at: Ms) -> Result<Visit, EngineError> {
        validate_at(at)?;
        let _desk = self.desk.lock().await;
        let session = self
            .lanes
            .get(lane)
            .map(|s| s.value().clone())
            .ok_or_else(|| EngineError::LaneNotFound(lane.to_string()))?;
        if self.visit_index.contains_key(&visit_id) || self.ledger.contains_key(&visit_id) {
            return Err(EngineError::AlreadyExists(visit_id));
        }
        if self.customer_visits.contains_key(&session.customer_id) {
            return Err(EngineError::AlreadyCheckedIn(session.customer_id));
        }

        let mut guard = self.lock_resource(session.resource_id).await?;
        check_hold(&guard, session.hold_id, at)?;

        let block = Span::new(at, at + self.policy.block_ms);
        let charge = LineItem {
            id: Ulid::new(),
            visit_id,
            kind: LineItemKind::Rental,
            description: format!("{} {}", guard.tier, guard.number),
            amount: self.policy.price(guard.tier),
            created_at: at,
        };
        let event = Event::CheckedIn {
            visit_id,
            customer_id: session.customer_id,
            resource_id: session.resource_id,
            lane: session.lane,
            hold_id: session.hold_id,
            block,
            charge,
        };
        self.commit(event, &mut [&mut *guard], None).await?;
        metrics::counter!(CHECKINS_TOTAL, "tier" => guard.tier.as_str()).increment(1);

        guard
            .visit
            .clone()
            .ok_or_else(|| EngineError::Internal("visit missing after check-in".into()))
    }

    pub fn lane_sessions(&self) -> Vec<LaneSession> {
        let mut sessions: Vec<LaneSession> = self.lanes.iter().map(|s| s.value().clone()).collect();
        sessions.sort_by(|a, b| a.lane.cmp(&b.lane));
        sessions
    }
}
