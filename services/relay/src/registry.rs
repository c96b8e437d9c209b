//! Registry of live relays, keyed by identity.
//!
//! Start and stop for the same identity are serialized on a per-identity
//! slot lock, so concurrent callers always see one instance or none.
//! Different identities never block each other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info};

use crate::error::Result;
use crate::identity::RelayIdentity;
use crate::relay::{RelayInstance, RelayOptions, RelayState};

#[derive(Default)]
struct Slot {
    instance: Option<Arc<RelayInstance>>,
    /// Set once the slot has left the map; callers holding it must retry.
    retired: bool,
}

type SlotRef = Arc<tokio::sync::Mutex<Slot>>;

/// Process-wide (or test-local) set of running relays.
pub struct RelayRegistry {
    slots: Mutex<HashMap<RelayIdentity, SlotRef>>,
    options: RelayOptions,
}

impl Default for RelayRegistry {
    fn default() -> Self {
        Self::new(RelayOptions::default())
    }
}

impl RelayRegistry {
    pub fn new(options: RelayOptions) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            options,
        }
    }

    pub fn options(&self) -> &RelayOptions {
        &self.options
    }

    /// Start a relay for `identity`, or return the status of the one
    /// already running.
    pub async fn start(&self, identity: RelayIdentity) -> Result<String> {
        self.start_with(identity, self.options.clone()).await
    }

    /// Like `start`, with options for this relay only. Options are ignored
    /// if the relay is already running.
    pub async fn start_with(&self, identity: RelayIdentity, options: RelayOptions) -> Result<String> {
        // Reject bad input before touching the map.
        identity.validate()?;

        loop {
            let slot = self.slot_or_insert(&identity);
            let mut guard = slot.lock().await;

            if guard.retired {
                continue;
            }

            if let Some(instance) = &guard.instance {
                if instance.state() == RelayState::Running {
                    debug!(relay = %identity, status = instance.status(), "Relay already running");
                    return Ok(instance.status().to_string());
                }
            }
            if let Some(stale) = guard.instance.take() {
                stale.stop().await;
            }

            return match RelayInstance::start(identity.clone(), options).await {
                Ok(instance) => {
                    let status = instance.status().to_string();
                    info!(relay = %identity, status = %status, "Relay registered");
                    guard.instance = Some(instance);
                    Ok(status)
                }
                Err(e) => {
                    guard.retired = true;
                    self.remove_slot(&identity, &slot);
                    Err(e)
                }
            };
        }
    }

    /// Stop the relay for `identity`. A no-op if none is registered.
    pub async fn stop(&self, identity: &RelayIdentity) {
        let Some(slot) = self.slot(identity) else {
            debug!(relay = %identity, "No relay to stop");
            return;
        };

        let mut guard = slot.lock().await;
        if guard.retired {
            return;
        }

        // Drain before leaving the map, so a racing start binds after the
        // old listener is gone.
        if let Some(instance) = guard.instance.take() {
            instance.stop().await;
        }
        guard.retired = true;
        self.remove_slot(identity, &slot);
        info!(relay = %identity, "Relay unregistered");
    }

    /// Stop every registered relay.
    pub async fn stop_all(&self) {
        let identities: Vec<RelayIdentity> = self.lock_slots().keys().cloned().collect();
        for identity in identities {
            self.stop(&identity).await;
        }
    }

    /// The running instance for `identity`, if any.
    pub async fn get(&self, identity: &RelayIdentity) -> Option<Arc<RelayInstance>> {
        let slot = self.slot(identity)?;
        let guard = slot.lock().await;
        guard.instance.clone()
    }

    pub fn contains(&self, identity: &RelayIdentity) -> bool {
        self.lock_slots().contains_key(identity)
    }

    pub fn len(&self) -> usize {
        self.lock_slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_slots().is_empty()
    }

    fn lock_slots(&self) -> std::sync::MutexGuard<'_, HashMap<RelayIdentity, SlotRef>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn slot(&self, identity: &RelayIdentity) -> Option<SlotRef> {
        self.lock_slots().get(identity).cloned()
    }

    fn slot_or_insert(&self, identity: &RelayIdentity) -> SlotRef {
        self.lock_slots()
            .entry(identity.clone())
            .or_default()
            .clone()
    }

    /// Remove `slot` from the map, unless a newer slot replaced it.
    fn remove_slot(&self, identity: &RelayIdentity, slot: &SlotRef) {
        let mut slots = self.lock_slots();
        if slots.get(identity).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            slots.remove(identity);
        }
    }
}
