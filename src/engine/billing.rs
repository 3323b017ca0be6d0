use ulid::Ulid;

use crate::limits::MAX_LINE_ITEM_CENTS;
use crate::model::*;
use crate::policy::LateFeeTier;

use super::conflict::{validate_at, validate_description};
use super::{Engine, EngineError};

/// Fee for checking out `late_ms` after the scheduled end. `tiers` is sorted by
/// threshold; the highest threshold reached applies, anything below the first
/// is grace.
pub fn late_fee(late_ms: Ms, tiers: &[LateFeeTier]) -> Option<Cents> {
    if late_ms <= 0 {
        return None;
    }
    tiers
        .iter()
        .take_while(|t| t.after_ms <= late_ms)
        .last()
        .map(|t| t.fee)
        .filter(|fee| *fee > 0)
}

impl Engine {
    /// Manual adjustment on a visit's bill. Negative amounts are credits.
    pub async fn add_line_item(
        &self,
        id: Ulid,
        visit_id: Ulid,
        description: String,
        amount: Cents,
        at: Ms,
    ) -> Result<(), EngineError> {
        validate_at(at)?;
        validate_description(&description)?;
        if amount == 0 {
            return Err(EngineError::InvalidArgument("amount must be non-zero"));
        }
        if amount.abs() > MAX_LINE_ITEM_CENTS {
            return Err(EngineError::LimitExceeded("amount too large"));
        }
        match self.ledger.get(&visit_id) {
            None => return Err(EngineError::NotFound(visit_id)),
            Some(items) if items.iter().any(|i| i.id == id) => {
                return Err(EngineError::AlreadyExists(id));
            }
            Some(_) => {}
        }

        let item = LineItem {
            id,
            visit_id,
            kind: LineItemKind::Adjustment,
            description,
            amount,
            created_at: at,
        };
        self.commit(Event::LineItemAdded { item }, &mut [], None).await
    }

    pub fn line_items(&self, visit_id: &Ulid) -> Vec<LineItem> {
        self.ledger
            .get(visit_id)
            .map(|items| items.value().clone())
            .unwrap_or_default()
    }

    /// What checking out at `at` would cost, without doing it.
    pub async fn checkout_quote(&self, visit_id: Ulid, at: Ms) -> Result<CheckoutQuote, EngineError> {
        let rid = self
            .resource_for_visit(&visit_id)
            .ok_or(EngineError::NotFound(visit_id))?;
        let rs = self.get_resource(&rid).ok_or(EngineError::NotFound(rid))?;
        let ends_at = {
            let guard = rs.read().await;
            guard
                .visit
                .as_ref()
                .filter(|v| v.id == visit_id)
                .map(|v| v.ends_at())
                .ok_or(EngineError::NotFound(visit_id))?
        };
        let late_ms = (at - ends_at).max(0);
        let fee = late_fee(late_ms, &self.policy.late_fees);
        let billed: Cents = self.line_items(&visit_id).iter().map(|i| i.amount).sum();
        Ok(CheckoutQuote {
            visit_id,
            ends_at,
            late_ms,
            late_fee: fee,
            balance: billed + fee.unwrap_or(0),
        })
    }
}
