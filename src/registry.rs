//! Survey sessions keyed by radio device
//!
//! At most one session exists per device. Creating a session for a device that already has
//! one with the same node count re-applies the configuration and returns the existing
//! session, so repeated initialisation is harmless.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cell::RefCell;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use log::{Level, log};

use crate::radio_devices::{RangingEngine, SurveyRadio};
use crate::session::{SurveySession, validate_node_count};
use crate::{DeviceId, NodeIdentity, SurveyConfiguration, SurveyError};

pub struct SurveyRegistry<R, E> {
    sessions: Mutex<CriticalSectionRawMutex, RefCell<Vec<Arc<SurveySession<R, E>>>>>,
}

impl<R, E> Default for SurveyRegistry<R, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R, E> SurveyRegistry<R, E> {
    pub const fn new() -> Self {
        SurveyRegistry {
            sessions: Mutex::new(RefCell::new(Vec::new())),
        }
    }

    pub fn get(&self, device: DeviceId) -> Option<Arc<SurveySession<R, E>>> {
        self.sessions
            .lock(|sessions| sessions.borrow().iter().find(|session| session.device() == device).cloned())
    }

    pub fn len(&self) -> usize {
        self.sessions.lock(|sessions| sessions.borrow().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<R, E> SurveyRegistry<R, E>
where
    R: SurveyRadio + Send + 'static,
    E: RangingEngine + Send + 'static,
{
    /// Creates (or re-initialises) the session of `device`
    ///
    /// `devices` is only called when a new session has to be built.
    ///
    /// # Errors
    /// - `InvalidNodeCount` if `node_count` is outside `2..=32`
    /// - `NodeCountMismatch` if the device already runs a survey of another size; the
    ///   existing session is left untouched
    /// - `IdentityMismatch` if the device already runs with another slot id, cell id or
    ///   short address; the existing session is left untouched
    /// - `SlotIdOutOfRange` if the identity's slot id does not index a row
    /// - `AllocationFailed` if the matrix or frame buffer cannot be allocated
    pub fn create(
        &self,
        device: DeviceId,
        node_count: u16,
        identity: NodeIdentity,
        config: SurveyConfiguration,
        devices: impl FnOnce() -> (R, E),
    ) -> Result<Arc<SurveySession<R, E>>, SurveyError> {
        validate_node_count(node_count)?;

        if let Some(existing) = self.get(device) {
            if existing.node_count() != node_count {
                log!(
                    Level::Warn,
                    "Survey on device {} already runs with {} nodes, {} requested",
                    device,
                    existing.node_count(),
                    node_count
                );
                return Err(SurveyError::NodeCountMismatch {
                    existing: existing.node_count(),
                    requested: node_count,
                });
            }
            if existing.identity() != identity {
                log!(
                    Level::Warn,
                    "Survey on device {} already runs as slot {} in cell {}, slot {} in cell {} requested",
                    device,
                    existing.identity().slot_id,
                    existing.identity().cell_id,
                    identity.slot_id,
                    identity.cell_id
                );
                return Err(SurveyError::IdentityMismatch {
                    existing: existing.identity(),
                    requested: identity,
                });
            }
            existing.apply_configuration(config);
            existing.register_handlers();
            log!(Level::Info, "Survey on device {} re-initialised", device);
            return Ok(existing);
        }

        let (radio, engine) = devices();
        let session = Arc::new(SurveySession::allocate(device, node_count, identity, config, radio, engine)?);
        self.install(session.clone(), config)?;
        log!(
            Level::Info,
            "Survey created on device {}: {} nodes, slot {}, cell {}",
            device,
            node_count,
            identity.slot_id,
            identity.cell_id
        );
        Ok(session)
    }

    /// Registers a session built from caller-owned storage
    ///
    /// # Errors
    /// `DeviceInUse` if another session is already bound to the device
    pub fn attach(&self, session: Arc<SurveySession<R, E>>) -> Result<(), SurveyError> {
        let config = session.configuration();
        if let Some(existing) = self.get(session.device()) {
            if Arc::ptr_eq(&existing, &session) {
                existing.apply_configuration(config);
                existing.register_handlers();
                return Ok(());
            }
            return Err(SurveyError::DeviceInUse(session.device()));
        }
        let device = session.device();
        self.install(session, config)?;
        log!(Level::Info, "Survey attached on device {}", device);
        Ok(())
    }

    fn install(&self, session: Arc<SurveySession<R, E>>, config: SurveyConfiguration) -> Result<(), SurveyError> {
        let device = session.device();
        self.sessions.lock(|sessions| {
            let mut sessions = sessions.borrow_mut();
            if sessions.iter().any(|existing| existing.device() == device) {
                return Err(SurveyError::DeviceInUse(device));
            }
            sessions.try_reserve(1).map_err(|_| SurveyError::AllocationFailed)?;
            sessions.push(session.clone());
            Ok(())
        })?;
        session.apply_configuration(config);
        session.register_handlers();
        Ok(())
    }

    /// Tears the session down
    ///
    /// A self-allocated session is dropped from the registry and unhooked from the radio.
    /// A session over caller-owned storage stays registered and only becomes uninitialized,
    /// so the slot router skips it until it is created again.
    pub fn destroy(&self, session: &Arc<SurveySession<R, E>>) {
        let device = session.device();
        session.mark_uninitialized();
        if !session.is_self_allocated() {
            log!(Level::Info, "Survey on device {} deinitialised", device);
            return;
        }

        self.sessions.lock(|sessions| {
            sessions.borrow_mut().retain(|existing| !Arc::ptr_eq(existing, session));
        });
        session.remove_handlers();
        log!(Level::Info, "Survey on device {} destroyed", device);
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::radio_devices::mock::{MockEngine, MockRadio};
    use crate::radio_devices::{InterfaceId, RangingMode};
    use crate::session::SurveyStorage;

    fn identity(slot_id: u16) -> NodeIdentity {
        NodeIdentity {
            short_address: 0x2000 + slot_id,
            slot_id,
            cell_id: 1,
        }
    }

    #[test]
    fn create_is_idempotent_per_device() {
        let registry = SurveyRegistry::new();
        let radio = MockRadio::new();
        let first = registry
            .create(1, 4, identity(0), SurveyConfiguration::default(), || (radio.clone(), MockEngine::new()))
            .unwrap();
        assert!(first.is_initialized());
        assert!(first.is_self_allocated());

        let config = SurveyConfiguration::new(0x200, 2, RangingMode::DoubleSidedNrng);
        let second = registry
            .create(1, 4, identity(0), config, || panic!("existing session must be reused"))
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.configuration(), config);
        assert_eq!(registry.len(), 1);
        assert_eq!(radio.with(|log| log.dispatcher.len()), 1);
    }

    #[test]
    fn node_count_mismatch_keeps_existing_session() {
        let registry = SurveyRegistry::new();
        let first = registry
            .create(1, 4, identity(0), SurveyConfiguration::default(), || (MockRadio::new(), MockEngine::new()))
            .unwrap();

        let result = registry.create(1, 5, identity(0), SurveyConfiguration::default(), || (MockRadio::new(), MockEngine::new()));
        assert_eq!(result.err(), Some(SurveyError::NodeCountMismatch { existing: 4, requested: 5 }));
        assert!(first.is_initialized());
        assert_eq!(first.node_count(), 4);
    }

    #[test]
    fn identity_change_keeps_existing_session() {
        let registry = SurveyRegistry::new();
        let first = registry
            .create(1, 4, identity(0), SurveyConfiguration::default(), || (MockRadio::new(), MockEngine::new()))
            .unwrap();

        let moved = NodeIdentity { cell_id: 2, ..identity(0) };
        let result = registry.create(1, 4, identity(1), SurveyConfiguration::default(), || (MockRadio::new(), MockEngine::new()));
        assert_eq!(result.err(), Some(SurveyError::IdentityMismatch { existing: identity(0), requested: identity(1) }));
        let result = registry.create(1, 4, moved, SurveyConfiguration::default(), || (MockRadio::new(), MockEngine::new()));
        assert_eq!(result.err(), Some(SurveyError::IdentityMismatch { existing: identity(0), requested: moved }));

        assert!(first.is_initialized());
        assert_eq!(first.identity(), identity(0));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn invalid_node_counts_are_rejected() {
        let registry: SurveyRegistry<MockRadio, MockEngine> = SurveyRegistry::new();
        for node_count in [0, 1, 33] {
            let result = registry.create(1, node_count, identity(0), SurveyConfiguration::default(), || (MockRadio::new(), MockEngine::new()));
            assert_eq!(result.err(), Some(SurveyError::InvalidNodeCount(node_count)));
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn destroy_unhooks_self_allocated_sessions() {
        let registry = SurveyRegistry::new();
        let radio = MockRadio::new();
        let session = registry
            .create(3, 2, identity(1), SurveyConfiguration::default(), || (radio.clone(), MockEngine::new()))
            .unwrap();
        assert!(radio.with(|log| log.dispatcher.contains(InterfaceId::SURVEY)));

        registry.destroy(&session);
        assert!(registry.get(3).is_none());
        assert!(!session.is_initialized());
        assert!(!radio.with(|log| log.dispatcher.contains(InterfaceId::SURVEY)));
    }

    #[test]
    fn caller_owned_sessions_survive_destroy() {
        let registry = SurveyRegistry::new();
        let storage = SurveyStorage::try_new(3).unwrap();
        let session = Arc::new(
            SurveySession::from_storage(9, storage, identity(2), SurveyConfiguration::default(), MockRadio::new(), MockEngine::new()).unwrap(),
        );
        registry.attach(session.clone()).unwrap();
        assert!(session.is_initialized());
        assert!(!session.is_self_allocated());

        registry.destroy(&session);
        let kept = registry.get(9).unwrap();
        assert!(Arc::ptr_eq(&kept, &session));
        assert!(!kept.is_initialized());

        // re-creation revives the same storage
        let revived = registry
            .create(9, 3, identity(2), SurveyConfiguration::default(), || panic!("storage must be reused"))
            .unwrap();
        assert!(Arc::ptr_eq(&revived, &session));
        assert!(revived.is_initialized());

        let other = Arc::new(
            SurveySession::from_storage(9, SurveyStorage::try_new(3).unwrap(), identity(0), SurveyConfiguration::default(), MockRadio::new(), MockEngine::new())
                .unwrap(),
        );
        assert_eq!(registry.attach(other).err(), Some(SurveyError::DeviceInUse(9)));
    }
}
