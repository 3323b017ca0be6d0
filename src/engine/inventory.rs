use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_transition, validate_at};
use super::{Engine, EngineError};

impl Engine {
    pub async fn add_resource(
        &self,
        id: Ulid,
        number: String,
        tier: Tier,
        at: Ms,
    ) -> Result<(), EngineError> {
        validate_at(at)?;
        if number.is_empty() {
            return Err(EngineError::InvalidArgument("resource number is empty"));
        }
        if number.len() > MAX_NUMBER_LEN {
            return Err(EngineError::LimitExceeded("resource number too long"));
        }

        let catalog = self.catalog.lock().await;
        if self.resources.len() >= MAX_RESOURCES_PER_SITE {
            return Err(EngineError::LimitExceeded("too many resources"));
        }
        if self.resources.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if self.numbers.contains_key(&number) {
            return Err(EngineError::DuplicateName(number));
        }

        let event = Event::ResourceAdded { id, number, tier, at };
        self.commit(event, &mut [], None).await?;
        drop(catalog);
        tracing::debug!("added {tier} resource {id}");
        // A new clean unit may satisfy someone already waiting.
        self.offer_upgrades(at).await?;
        Ok(())
    }

    pub async fn retire_resource(&self, id: Ulid) -> Result<(), EngineError> {
        let _catalog = self.catalog.lock().await;
        let mut guard = self.lock_resource(id).await?;
        if guard.is_occupied() {
            return Err(EngineError::Occupied(id));
        }
        if guard.hold.is_some() {
            return Err(EngineError::Held(id));
        }
        self.commit(Event::ResourceRetired { id }, &mut [&mut *guard], None)
            .await
    }

    /// Housekeeping status change. Reaching CLEAN makes the unit offerable again.
    pub async fn change_status(
        &self,
        resource_id: Ulid,
        to: CleanStatus,
        staff_id: Option<Ulid>,
        at: Ms,
    ) -> Result<(), EngineError> {
        validate_at(at)?;
        let mut guard = self.lock_resource(resource_id).await?;
        check_transition(&guard, to)?;
        let event = Event::StatusChanged {
            resource_id,
            from: guard.status,
            to,
            staff_id,
            at,
        };
        self.commit(event, &mut [&mut *guard], None).await?;
        drop(guard);

        if to == CleanStatus::Clean {
            self.offer_upgrades(at).await?;
        }
        Ok(())
    }
}
