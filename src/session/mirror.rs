//! Local copy of the engine's loops and mappings, fed from the bus

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use super::{ChangeKind, EngineBus, EngineUpdate, Topic};
use crate::bus::{subscriber, Subscriber};
use crate::mapping::MidiMappingInfo;

/// Mirrors engine state from `loops` / `mappings` updates
///
/// Loop names are unique, as on the engine. Adds and removes are idempotent,
/// so the snapshot replies and the auto-updates may overlap.
#[derive(Default)]
pub struct EngineMirror {
    loops: RwLock<BTreeSet<String>>,
    mappings: RwLock<Vec<MidiMappingInfo>>,
    subscription: RwLock<Option<Subscriber<EngineUpdate>>>,
}

impl EngineMirror {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Subscribe to both topics of `bus`
    pub fn attach(self: &Arc<Self>, bus: &EngineBus) {
        let mirror = Arc::downgrade(self);
        let sub = subscriber(move |update: &EngineUpdate| {
            if let Some(mirror) = mirror.upgrade() {
                mirror.apply(update);
            }
        });
        for topic in Topic::ALL {
            bus.subscribe(topic, Arc::clone(&sub));
        }
        *self.subscription.write() = Some(sub);
    }

    pub fn detach(&self, bus: &EngineBus) {
        if let Some(sub) = self.subscription.write().take() {
            for topic in Topic::ALL {
                bus.unsubscribe(topic, &sub);
            }
        }
    }

    pub fn apply(&self, update: &EngineUpdate) {
        match update {
            EngineUpdate::Loop { change: ChangeKind::Add, name } => {
                self.loops.write().insert(name.clone());
            }
            EngineUpdate::Loop { change: ChangeKind::Remove, name } => {
                self.loops.write().remove(name);
            }
            EngineUpdate::Mapping { change: ChangeKind::Add, mapping } => {
                let mut mappings = self.mappings.write();
                if !mappings.contains(mapping) {
                    mappings.push(mapping.clone());
                }
            }
            EngineUpdate::Mapping { change: ChangeKind::Remove, mapping } => {
                self.mappings.write().retain(|m| m != mapping);
            }
        }
        debug!("Mirror applied {:?}", update);
    }

    /// Loop names in sorted order
    pub fn loops(&self) -> Vec<String> {
        self.loops.read().iter().cloned().collect()
    }

    /// Mappings in arrival order
    pub fn mappings(&self) -> Vec<MidiMappingInfo> {
        self.mappings.read().clone()
    }

    /// Mappings bound to `loop_name`
    pub fn mappings_for(&self, loop_name: &str) -> Vec<MidiMappingInfo> {
        self.mappings
            .read()
            .iter()
            .filter(|m| m.loop_name() == loop_name)
            .cloned()
            .collect()
    }
}
