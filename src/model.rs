use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

/// Money in integer cents.
pub type Cents = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

// ── Inventory ────────────────────────────────────────────────────

/// Resource class. Ordered by rank: an upgrade always moves up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Tier {
    Locker,
    Standard,
    Double,
    Special,
}

impl Tier {
    pub const ALL: [Tier; 4] = [Tier::Locker, Tier::Standard, Tier::Double, Tier::Special];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Locker => "locker",
            Tier::Standard => "standard",
            Tier::Double => "double",
            Tier::Special => "special",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "locker" => Ok(Tier::Locker),
            "standard" => Ok(Tier::Standard),
            "double" => Ok(Tier::Double),
            "special" => Ok(Tier::Special),
            other => Err(format!("unknown tier: {other}")),
        }
    }
}

/// Housekeeping state of a room or locker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CleanStatus {
    Clean,
    Cleaning,
    Dirty,
}

impl CleanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CleanStatus::Clean => "clean",
            CleanStatus::Cleaning => "cleaning",
            CleanStatus::Dirty => "dirty",
        }
    }

    /// DIRTY never goes straight back to CLEAN; it has to be cleaned first.
    pub fn can_transition(&self, to: CleanStatus) -> bool {
        use CleanStatus::*;
        matches!(
            (self, to),
            (Clean, Cleaning) | (Clean, Dirty) | (Cleaning, Clean) | (Cleaning, Dirty) | (Dirty, Cleaning)
        )
    }
}

impl fmt::Display for CleanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CleanStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "clean" => Ok(CleanStatus::Clean),
            "cleaning" => Ok(CleanStatus::Cleaning),
            "dirty" => Ok(CleanStatus::Dirty),
            other => Err(format!("unknown status: {other}")),
        }
    }
}

/// Who a hold is reserved for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HoldOwner {
    Lane(String),
    Waitlist(Ulid),
}

/// Temporary reservation of one resource for one customer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hold {
    pub id: Ulid,
    pub owner: HoldOwner,
    pub customer_id: Ulid,
    pub expires_at: Ms,
}

impl Hold {
    pub fn is_expired(&self, now: Ms) -> bool {
        self.expires_at <= now
    }
}

/// Occupancy record: the initial check-in block plus any renewals, contiguous.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Visit {
    pub id: Ulid,
    pub customer_id: Ulid,
    pub blocks: Vec<Span>,
}

impl Visit {
    pub fn started_at(&self) -> Ms {
        self.blocks.first().map_or(0, |b| b.start)
    }

    pub fn ends_at(&self) -> Ms {
        self.blocks.last().map_or(0, |b| b.end)
    }

    pub fn is_overdue(&self, now: Ms) -> bool {
        now >= self.ends_at()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceState {
    pub id: Ulid,
    /// Door or locker number shown to customers.
    pub number: String,
    pub tier: Tier,
    pub status: CleanStatus,
    pub status_changed_at: Ms,
    pub visit: Option<Visit>,
    pub hold: Option<Hold>,
}

impl ResourceState {
    pub fn new(id: Ulid, number: String, tier: Tier, at: Ms) -> Self {
        Self {
            id,
            number,
            tier,
            status: CleanStatus::Clean,
            status_changed_at: at,
            visit: None,
            hold: None,
        }
    }

    /// Clean, empty and unheld. An expired hold still blocks until it is reaped.
    pub fn is_assignable(&self) -> bool {
        self.status == CleanStatus::Clean && self.visit.is_none() && self.hold.is_none()
    }

    pub fn is_occupied(&self) -> bool {
        self.visit.is_some()
    }

    /// Clear the hold only if it is still the one we expect.
    pub fn release_hold(&mut self, hold_id: Ulid) -> Option<Hold> {
        if self.hold.as_ref().is_some_and(|h| h.id == hold_id) {
            self.hold.take()
        } else {
            None
        }
    }
}

// ── Front desk ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneSession {
    pub lane: String,
    pub customer_id: Ulid,
    pub tier: Tier,
    pub resource_id: Ulid,
    pub hold_id: Ulid,
    pub started_at: Ms,
    pub expires_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaitlistStatus {
    Waiting,
    Offered {
        resource_id: Ulid,
        hold_id: Ulid,
        expires_at: Ms,
    },
    Accepted,
    Cancelled,
    Expired,
}

impl WaitlistStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WaitlistStatus::Waiting => "waiting",
            WaitlistStatus::Offered { .. } => "offered",
            WaitlistStatus::Accepted => "accepted",
            WaitlistStatus::Cancelled => "cancelled",
            WaitlistStatus::Expired => "expired",
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, WaitlistStatus::Waiting | WaitlistStatus::Offered { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitlistEntry {
    pub id: Ulid,
    pub visit_id: Ulid,
    pub customer_id: Ulid,
    pub tier: Tier,
    pub created_at: Ms,
    pub status: WaitlistStatus,
}

// ── Billing ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LineItemKind {
    Rental,
    Renewal,
    Upgrade,
    LateFee,
    Adjustment,
}

impl LineItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LineItemKind::Rental => "rental",
            LineItemKind::Renewal => "renewal",
            LineItemKind::Upgrade => "upgrade",
            LineItemKind::LateFee => "late_fee",
            LineItemKind::Adjustment => "adjustment",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub id: Ulid,
    pub visit_id: Ulid,
    pub kind: LineItemKind,
    pub description: String,
    pub amount: Cents,
    pub created_at: Ms,
}

// ── Staff ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Role {
    Staff,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Staff => "staff",
            Role::Admin => "admin",
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "staff" => Ok(Role::Staff),
            "admin" => Ok(Role::Admin),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaffMember {
    pub id: Ulid,
    pub name: String,
    pub role: Role,
    /// Argon2 PHC string.
    pub pin_hash: String,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaffSession {
    pub id: Ulid,
    pub staff_id: Ulid,
    pub started_at: Ms,
    pub expires_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeEntry {
    pub id: Ulid,
    pub staff_id: Ulid,
    pub clock_in: Ms,
    pub clock_out: Option<Ms>,
}

impl TimeEntry {
    /// Worked time inside `window`; an open entry counts up to `now`.
    pub fn worked_within(&self, window: &Span, now: Ms) -> Ms {
        let end = self.clock_out.unwrap_or(now);
        let start = self.clock_in.max(window.start);
        let end = end.min(window.end);
        (end - start).max(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShiftSlot {
    pub id: Ulid,
    pub staff_id: Ulid,
    pub span: Span,
}

// ── Log records ──────────────────────────────────────────────────

/// Entire site state, written by compaction as a single record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub resources: Vec<ResourceState>,
    pub lanes: Vec<LaneSession>,
    pub waitlist: Vec<WaitlistEntry>,
    pub ledger: Vec<LineItem>,
    pub staff: Vec<StaffMember>,
    pub sessions: Vec<StaffSession>,
    pub time_entries: Vec<TimeEntry>,
    pub shifts: Vec<ShiftSlot>,
}

/// Waitlist entry closed as a side effect of checkout, with the offer hold it carried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Withdrawn {
    pub waitlist_id: Ulid,
    pub offer: Option<(Ulid, Ulid)>,
}

/// One record per committed operation. This is the WAL record format and the
/// notification payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ResourceAdded {
        id: Ulid,
        number: String,
        tier: Tier,
        at: Ms,
    },
    ResourceRetired {
        id: Ulid,
    },
    StatusChanged {
        resource_id: Ulid,
        from: CleanStatus,
        to: CleanStatus,
        staff_id: Option<Ulid>,
        at: Ms,
    },
    LaneOpened {
        session: LaneSession,
    },
    LaneClosed {
        lane: String,
        resource_id: Ulid,
        hold_id: Ulid,
        expired: bool,
    },
    CheckedIn {
        visit_id: Ulid,
        customer_id: Ulid,
        resource_id: Ulid,
        lane: String,
        hold_id: Ulid,
        block: Span,
        charge: LineItem,
    },
    Renewed {
        visit_id: Ulid,
        resource_id: Ulid,
        block: Span,
        charge: LineItem,
    },
    CheckedOut {
        visit_id: Ulid,
        customer_id: Ulid,
        resource_id: Ulid,
        at: Ms,
        late_ms: Ms,
        late_fee: Option<LineItem>,
        withdrawn: Vec<Withdrawn>,
    },
    WaitlistJoined {
        entry: WaitlistEntry,
    },
    WaitlistLeft {
        id: Ulid,
        offer: Option<(Ulid, Ulid)>,
    },
    UpgradeOffered {
        waitlist_id: Ulid,
        resource_id: Ulid,
        hold: Hold,
    },
    OfferExpired {
        waitlist_id: Ulid,
        resource_id: Ulid,
        hold_id: Ulid,
    },
    Upgraded {
        waitlist_id: Ulid,
        visit: Visit,
        from_resource: Ulid,
        to_resource: Ulid,
        hold_id: Ulid,
        charge: Option<LineItem>,
        at: Ms,
    },
    LineItemAdded {
        item: LineItem,
    },
    StaffAdded {
        member: StaffMember,
    },
    StaffDeactivated {
        id: Ulid,
    },
    SessionOpened {
        session: StaffSession,
    },
    SessionClosed {
        id: Ulid,
        staff_id: Ulid,
    },
    ClockedIn {
        entry: TimeEntry,
    },
    ClockedOut {
        id: Ulid,
        staff_id: Ulid,
        at: Ms,
    },
    ShiftScheduled {
        shift: ShiftSlot,
    },
    ShiftRemoved {
        id: Ulid,
        staff_id: Ulid,
    },
    Snapshot(Box<Snapshot>),
}

impl Event {
    /// Resources whose state this event touches, in no particular order.
    pub fn resource_ids(&self) -> Vec<Ulid> {
        match self {
            Event::StatusChanged { resource_id, .. }
            | Event::LaneClosed { resource_id, .. }
            | Event::CheckedIn { resource_id, .. }
            | Event::Renewed { resource_id, .. }
            | Event::UpgradeOffered { resource_id, .. }
            | Event::OfferExpired { resource_id, .. } => vec![*resource_id],
            Event::LaneOpened { session } => vec![session.resource_id],
            Event::CheckedOut {
                resource_id,
                withdrawn,
                ..
            } => {
                let mut ids = vec![*resource_id];
                ids.extend(withdrawn.iter().filter_map(|w| w.offer.map(|(rid, _)| rid)));
                ids
            }
            Event::WaitlistLeft { offer, .. } => offer.iter().map(|(rid, _)| *rid).collect(),
            Event::Upgraded {
                from_resource,
                to_resource,
                ..
            } => vec![*from_resource, *to_resource],
            _ => Vec::new(),
        }
    }

    /// Copy safe to broadcast: PIN hashes and live session ids never leave
    /// the engine.
    pub fn redacted(&self) -> Event {
        match self {
            Event::StaffAdded { member } => Event::StaffAdded {
                member: StaffMember {
                    pin_hash: String::new(),
                    ..member.clone()
                },
            },
            Event::SessionOpened { session } => Event::SessionOpened {
                session: StaffSession {
                    id: Ulid::nil(),
                    ..session.clone()
                },
            },
            other => other.clone(),
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceInfo {
    pub id: Ulid,
    pub number: String,
    pub tier: Tier,
    pub status: CleanStatus,
    pub status_changed_at: Ms,
    pub visit_id: Option<Ulid>,
    pub customer_id: Option<Ulid>,
    pub ends_at: Option<Ms>,
    pub hold_id: Option<Ulid>,
    pub hold_expires_at: Option<Ms>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierAvailability {
    pub tier: Tier,
    pub total: u32,
    pub assignable: u32,
    pub occupied: u32,
    pub held: u32,
    pub dirty: u32,
    pub cleaning: u32,
    pub waiting: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisitInfo {
    pub id: Ulid,
    pub customer_id: Ulid,
    pub resource_id: Ulid,
    pub number: String,
    pub tier: Tier,
    pub started_at: Ms,
    pub ends_at: Ms,
    pub renewals: u32,
    pub overdue: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutQuote {
    pub visit_id: Ulid,
    pub ends_at: Ms,
    pub late_ms: Ms,
    pub late_fee: Option<Cents>,
    /// Ledger total including the prospective late fee.
    pub balance: Cents,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutReceipt {
    pub visit_id: Ulid,
    pub resource_id: Ulid,
    pub late_ms: Ms,
    pub late_fee: Option<Cents>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaffInfo {
    pub id: Ulid,
    pub name: String,
    pub role: Role,
    pub active: bool,
    pub clocked_in: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timesheet {
    pub staff_id: Ulid,
    pub entries: Vec<TimeEntry>,
    pub worked_ms: Ms,
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: Ms = 3_600_000;

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
    }

    #[test]
    fn tier_rank_orders_upgrades() {
        assert!(Tier::Locker < Tier::Standard);
        assert!(Tier::Standard < Tier::Double);
        assert!(Tier::Double < Tier::Special);
    }

    #[test]
    fn tier_parse_case_insensitive() {
        assert_eq!("DOUBLE".parse::<Tier>().unwrap(), Tier::Double);
        assert_eq!("locker".parse::<Tier>().unwrap(), Tier::Locker);
        assert!("suite".parse::<Tier>().is_err());
    }

    #[test]
    fn status_transition_table() {
        use CleanStatus::*;
        assert!(Clean.can_transition(Cleaning));
        assert!(Clean.can_transition(Dirty));
        assert!(Cleaning.can_transition(Clean));
        assert!(Cleaning.can_transition(Dirty));
        assert!(Dirty.can_transition(Cleaning));
        assert!(!Dirty.can_transition(Clean));
        for s in [Clean, Cleaning, Dirty] {
            assert!(!s.can_transition(s), "{s} -> {s} must be rejected");
        }
    }

    #[test]
    fn resource_assignable_only_when_clean_empty_unheld() {
        let mut rs = ResourceState::new(Ulid::new(), "101".into(), Tier::Standard, 0);
        assert!(rs.is_assignable());

        rs.status = CleanStatus::Dirty;
        assert!(!rs.is_assignable());
        rs.status = CleanStatus::Clean;

        rs.hold = Some(Hold {
            id: Ulid::new(),
            owner: HoldOwner::Lane("1".into()),
            customer_id: Ulid::new(),
            expires_at: 10,
        });
        assert!(!rs.is_assignable());
        rs.hold = None;

        rs.visit = Some(Visit {
            id: Ulid::new(),
            customer_id: Ulid::new(),
            blocks: vec![Span::new(0, 6 * H)],
        });
        assert!(!rs.is_assignable());
        assert!(rs.is_occupied());
    }

    #[test]
    fn release_hold_checks_id() {
        let mut rs = ResourceState::new(Ulid::new(), "L1".into(), Tier::Locker, 0);
        let hold_id = Ulid::new();
        rs.hold = Some(Hold {
            id: hold_id,
            owner: HoldOwner::Waitlist(Ulid::new()),
            customer_id: Ulid::new(),
            expires_at: 10,
        });
        assert!(rs.release_hold(Ulid::new()).is_none());
        assert!(rs.hold.is_some());
        assert_eq!(rs.release_hold(hold_id).map(|h| h.id), Some(hold_id));
        assert!(rs.hold.is_none());
    }

    #[test]
    fn visit_bounds_follow_blocks() {
        let v = Visit {
            id: Ulid::new(),
            customer_id: Ulid::new(),
            blocks: vec![Span::new(0, 6 * H), Span::new(6 * H, 12 * H)],
        };
        assert_eq!(v.started_at(), 0);
        assert_eq!(v.ends_at(), 12 * H);
        assert!(!v.is_overdue(12 * H - 1));
        assert!(v.is_overdue(12 * H));
    }

    #[test]
    fn hold_expiry_is_inclusive() {
        let h = Hold {
            id: Ulid::new(),
            owner: HoldOwner::Lane("2".into()),
            customer_id: Ulid::new(),
            expires_at: 1000,
        };
        assert!(!h.is_expired(999));
        assert!(h.is_expired(1000));
    }

    #[test]
    fn worked_within_clamps_to_window() {
        let e = TimeEntry {
            id: Ulid::new(),
            staff_id: Ulid::new(),
            clock_in: 2 * H,
            clock_out: Some(10 * H),
        };
        assert_eq!(e.worked_within(&Span::new(0, 24 * H), 0), 8 * H);
        assert_eq!(e.worked_within(&Span::new(4 * H, 6 * H), 0), 2 * H);
        assert_eq!(e.worked_within(&Span::new(12 * H, 14 * H), 0), 0);

        let open = TimeEntry { clock_out: None, ..e };
        assert_eq!(open.worked_within(&Span::new(0, 24 * H), 5 * H), 3 * H);
    }

    #[test]
    fn event_resource_ids_cover_every_touched_resource() {
        let from = Ulid::new();
        let to = Ulid::new();
        let ev = Event::Upgraded {
            waitlist_id: Ulid::new(),
            visit: Visit {
                id: Ulid::new(),
                customer_id: Ulid::new(),
                blocks: vec![Span::new(0, H)],
            },
            from_resource: from,
            to_resource: to,
            hold_id: Ulid::new(),
            charge: None,
            at: 0,
        };
        assert_eq!(ev.resource_ids(), vec![from, to]);

        let offered = Ulid::new();
        let ev = Event::CheckedOut {
            visit_id: Ulid::new(),
            customer_id: Ulid::new(),
            resource_id: from,
            at: 0,
            late_ms: 0,
            late_fee: None,
            withdrawn: vec![
                Withdrawn { waitlist_id: Ulid::new(), offer: None },
                Withdrawn { waitlist_id: Ulid::new(), offer: Some((offered, Ulid::new())) },
            ],
        };
        assert_eq!(ev.resource_ids(), vec![from, offered]);
    }

    #[test]
    fn redacted_strips_pin_hash() {
        let ev = Event::StaffAdded {
            member: StaffMember {
                id: Ulid::new(),
                name: "Sam".into(),
                role: Role::Staff,
                pin_hash: "$argon2id$v=19$secret".into(),
                active: true,
            },
        };
        match ev.redacted() {
            Event::StaffAdded { member } => assert!(member.pin_hash.is_empty()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::ResourceAdded {
            id: Ulid::new(),
            number: "204".into(),
            tier: Tier::Double,
            at: 1,
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
