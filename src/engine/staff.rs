use ulid::Ulid;

use crate::auth::{hash_pin, is_valid_pin, verify_pin};
use crate::limits::*;
use crate::model::*;

use super::conflict::validate_at;
use super::{Engine, EngineError};

impl Engine {
    pub fn has_staff(&self) -> bool {
        !self.staff.is_empty()
    }

    /// Register a staff member. The PIN is hashed before anything is logged.
    pub async fn add_staff(
        &self,
        id: Ulid,
        name: String,
        role: Role,
        pin: String,
    ) -> Result<(), EngineError> {
        self.insert_staff(id, name, role, pin, false).await
    }

    /// Register the first member of an empty site. Fails once anyone exists.
    pub async fn bootstrap_staff(
        &self,
        id: Ulid,
        name: String,
        role: Role,
        pin: String,
    ) -> Result<(), EngineError> {
        self.insert_staff(id, name, role, pin, true).await
    }

    async fn insert_staff(
        &self,
        id: Ulid,
        name: String,
        role: Role,
        pin: String,
        first_only: bool,
    ) -> Result<(), EngineError> {
        if name.trim().is_empty() {
            return Err(EngineError::InvalidArgument("staff name is empty"));
        }
        if name.len() > MAX_STAFF_NAME_LEN {
            return Err(EngineError::LimitExceeded("staff name too long"));
        }
        if !is_valid_pin(&pin) {
            return Err(EngineError::InvalidArgument("PIN must be 4 to 8 digits"));
        }
        let pin_hash = hash_pin(pin).await?;

        let _roster = self.roster.lock().await;
        if first_only && self.has_staff() {
            return Err(EngineError::Unauthorized("site already has staff"));
        }
        if self.staff.len() >= MAX_STAFF_PER_SITE {
            return Err(EngineError::LimitExceeded("too many staff members"));
        }
        if self.staff.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if self.staff.iter().any(|m| m.name.eq_ignore_ascii_case(&name)) {
            return Err(EngineError::DuplicateName(name));
        }

        let member = StaffMember {
            id,
            name,
            role,
            pin_hash,
            active: true,
        };
        self.commit(Event::StaffAdded { member }, &mut [], None).await?;
        tracing::info!("added {} {id}", role.as_str());
        Ok(())
    }

    /// Deactivation is permanent and ends every open session of the member.
    pub async fn deactivate_staff(&self, id: Ulid) -> Result<(), EngineError> {
        let _roster = self.roster.lock().await;
        match self.staff.get(&id) {
            None => return Err(EngineError::NotFound(id)),
            Some(m) if !m.active => return Ok(()),
            Some(_) => {}
        }
        self.commit(Event::StaffDeactivated { id }, &mut [], None).await
    }

    /// PIN login. Unknown, inactive and wrong-PIN all fail the same way.
    pub async fn open_session(
        &self,
        id: Ulid,
        staff_id: Ulid,
        pin: String,
        at: Ms,
    ) -> Result<StaffSession, EngineError> {
        validate_at(at)?;
        let pin_hash = match self.staff.get(&staff_id) {
            Some(m) if m.active => m.pin_hash.clone(),
            _ => return Err(EngineError::InvalidPin),
        };
        if !verify_pin(pin, pin_hash).await {
            tracing::warn!("failed PIN login for staff {staff_id}");
            return Err(EngineError::InvalidPin);
        }

        let _roster = self.roster.lock().await;
        if self.sessions.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        // Deactivated while the PIN was being checked.
        if !self.staff.get(&staff_id).is_some_and(|m| m.active) {
            return Err(EngineError::InvalidPin);
        }

        let session = StaffSession {
            id,
            staff_id,
            started_at: at,
            expires_at: at + self.policy.session_ttl_ms,
        };
        self.commit(
            Event::SessionOpened {
                session: session.clone(),
            },
            &mut [],
            None,
        )
        .await?;
        Ok(session)
    }

    pub async fn close_session(&self, id: Ulid) -> Result<(), EngineError> {
        let _roster = self.roster.lock().await;
        let staff_id = self
            .sessions
            .get(&id)
            .map(|s| s.staff_id)
            .ok_or(EngineError::NotFound(id))?;
        self.commit(Event::SessionClosed { id, staff_id }, &mut [], None)
            .await
    }

    /// Resolve a session to its active member, requiring at least `role`.
    pub fn authorize(&self, session_id: &Ulid, at: Ms, role: Role) -> Result<StaffMember, EngineError> {
        let session = self
            .sessions
            .get(session_id)
            .map(|s| s.value().clone())
            .ok_or(EngineError::Unauthorized("no staff session"))?;
        if session.expires_at <= at {
            return Err(EngineError::SessionExpired(*session_id));
        }
        let member = self
            .staff
            .get(&session.staff_id)
            .map(|m| m.value().clone())
            .ok_or(EngineError::Unauthorized("staff member not found"))?;
        if !member.active {
            return Err(EngineError::Unauthorized("staff member is inactive"));
        }
        if member.role < role {
            return Err(EngineError::Unauthorized("admin role required"));
        }
        Ok(member)
    }

    pub fn staff_members(&self) -> Vec<StaffInfo> {
        let mut members: Vec<StaffInfo> = self
            .staff
            .iter()
            .map(|m| StaffInfo {
                id: m.id,
                name: m.name.clone(),
                role: m.role,
                active: m.active,
                clocked_in: self.open_time_entry(&m.id).is_some(),
            })
            .collect();
        members.sort_by(|a, b| a.name.cmp(&b.name));
        members
    }
}
