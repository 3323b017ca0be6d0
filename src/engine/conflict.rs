use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as Ms)
}

pub(crate) fn validate_at(at: Ms) -> Result<(), EngineError> {
    if !(MIN_VALID_TIMESTAMP_MS..MAX_VALID_TIMESTAMP_MS).contains(&at) {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(())
}

/// Bounds check for client-supplied intervals; `max_ms` caps the width.
pub(crate) fn validate_window(start: Ms, end: Ms, max_ms: Ms) -> Result<Span, EngineError> {
    validate_at(start)?;
    validate_at(end)?;
    if start >= end {
        return Err(EngineError::InvalidArgument("start must be before end"));
    }
    if end - start > max_ms {
        return Err(EngineError::LimitExceeded("window too wide"));
    }
    Ok(Span::new(start, end))
}

/// Housekeeping transition, with the extra rules for resources in use.
pub(crate) fn check_transition(rs: &ResourceState, to: CleanStatus) -> Result<(), EngineError> {
    let from = rs.status;
    if !from.can_transition(to) {
        return Err(EngineError::InvalidTransition { from, to });
    }
    if to == CleanStatus::Cleaning && rs.is_occupied() {
        return Err(EngineError::Occupied(rs.id));
    }
    if from == CleanStatus::Clean && rs.hold.is_some() {
        return Err(EngineError::Held(rs.id));
    }
    Ok(())
}

/// The hold on `rs` must be `hold_id` and still live at `at`.
pub(crate) fn check_hold(rs: &ResourceState, hold_id: Ulid, at: Ms) -> Result<&Hold, EngineError> {
    match &rs.hold {
        Some(hold) if hold.id == hold_id => {
            if hold.is_expired(at) {
                Err(EngineError::HoldExpired(hold_id))
            } else {
                Ok(hold)
            }
        }
        // Reaped already, or replaced after a reap.
        _ => Err(EngineError::HoldExpired(hold_id)),
    }
}

/// Next block for `visit`, rejected when the whole stay would pass `max_stay_ms`.
pub(crate) fn next_block(visit: &Visit, block_ms: Ms, max_stay_ms: Ms) -> Result<Span, EngineError> {
    let start = visit.ends_at();
    let block = Span::new(start, start + block_ms);
    if Span::new(visit.started_at(), block.end).duration_ms() > max_stay_ms {
        return Err(EngineError::StayLimitExceeded { max_ms: max_stay_ms });
    }
    Ok(block)
}

pub(crate) fn validate_description(description: &str) -> Result<(), EngineError> {
    if description.is_empty() {
        return Err(EngineError::InvalidArgument("description is empty"));
    }
    if description.len() > MAX_DESCRIPTION_LEN {
        return Err(EngineError::LimitExceeded("description too long"));
    }
    Ok(())
}
