use ulid::Ulid;

use crate::model::{CleanStatus, Ms, Tier};

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    LaneNotFound(String),
    AlreadyExists(Ulid),
    DuplicateName(String),
    Occupied(Ulid),
    Held(Ulid),
    NoneAvailable(Tier),
    InvalidTransition {
        from: CleanStatus,
        to: CleanStatus,
    },
    LaneBusy(String),
    AlreadyCheckedIn(Ulid),
    HoldExpired(Ulid),
    StayLimitExceeded {
        max_ms: Ms,
    },
    NotAnUpgrade {
        from: Tier,
        to: Tier,
    },
    AlreadyWaiting(Ulid),
    NotOffered(Ulid),
    InvalidPin,
    Unauthorized(&'static str),
    SessionExpired(Ulid),
    AlreadyClockedIn(Ulid),
    NotClockedIn(Ulid),
    ShiftOverlap(Ulid),
    InvalidArgument(&'static str),
    LimitExceeded(&'static str),
    Internal(String),
    WalError(String),
}

impl EngineError {
    /// SQLSTATE reported to the client.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) | EngineError::LaneNotFound(_) => "02000",
            EngineError::AlreadyExists(_)
            | EngineError::DuplicateName(_)
            | EngineError::Occupied(_)
            | EngineError::Held(_)
            | EngineError::LaneBusy(_)
            | EngineError::AlreadyCheckedIn(_)
            | EngineError::AlreadyWaiting(_)
            | EngineError::AlreadyClockedIn(_)
            | EngineError::ShiftOverlap(_) => "23505",
            EngineError::InvalidPin
            | EngineError::Unauthorized(_)
            | EngineError::SessionExpired(_) => "28000",
            EngineError::InvalidArgument(_) => "22023",
            EngineError::LimitExceeded(_) => "54000",
            EngineError::Internal(_) | EngineError::WalError(_) => "XX000",
            _ => "P0001",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::LaneNotFound(lane) => write!(f, "no session on lane {lane}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::DuplicateName(name) => write!(f, "name already in use: {name}"),
            EngineError::Occupied(id) => write!(f, "resource {id} is occupied"),
            EngineError::Held(id) => write!(f, "resource {id} is held"),
            EngineError::NoneAvailable(tier) => write!(f, "no {tier} available"),
            EngineError::InvalidTransition { from, to } => {
                write!(f, "cannot change status from {from} to {to}")
            }
            EngineError::LaneBusy(lane) => write!(f, "lane {lane} already has a session"),
            EngineError::AlreadyCheckedIn(customer) => {
                write!(f, "customer {customer} already has an open visit or lane session")
            }
            EngineError::HoldExpired(id) => write!(f, "hold {id} has expired"),
            EngineError::StayLimitExceeded { max_ms } => {
                write!(f, "stay would exceed the maximum of {} minutes", max_ms / 60_000)
            }
            EngineError::NotAnUpgrade { from, to } => {
                write!(f, "{to} is not an upgrade from {from}")
            }
            EngineError::AlreadyWaiting(visit) => {
                write!(f, "visit {visit} already has an open waitlist entry")
            }
            EngineError::NotOffered(id) => write!(f, "waitlist entry {id} has no open offer"),
            EngineError::InvalidPin => write!(f, "invalid staff credentials"),
            EngineError::Unauthorized(what) => write!(f, "unauthorized: {what}"),
            EngineError::SessionExpired(id) => write!(f, "staff session {id} has expired"),
            EngineError::AlreadyClockedIn(staff) => write!(f, "staff {staff} is already clocked in"),
            EngineError::NotClockedIn(id) => write!(f, "time entry {id} is not open"),
            EngineError::ShiftOverlap(id) => write!(f, "overlaps scheduled shift {id}"),
            EngineError::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Internal(e) => write!(f, "internal error: {e}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
