use std::sync::Arc;

use stagerun_core::error::{Result, StagerunError};
use stagerun_core::event::EventBus;
use stagerun_core::traits::Unit;
use stagerun_core::types::PlanId;

use crate::plan::Plan;

/// Assembles a plan from numbered unit slots.
///
/// A graph compiler reserves a slot per node up front so units can refer to
/// each other by index, then fills the slots as units are constructed.
/// `build` refuses a plan with any slot left empty.
pub struct PlanBuilder {
    id: PlanId,
    slots: Vec<Option<Arc<dyn Unit>>>,
    event_bus: Option<Arc<EventBus>>,
}

impl PlanBuilder {
    pub fn new(id: impl Into<PlanId>) -> Self {
        Self {
            id: id.into(),
            slots: Vec::new(),
            event_bus: None,
        }
    }

    /// Reserve an empty slot and return its index.
    pub fn reserve(&mut self) -> usize {
        self.slots.push(None);
        self.slots.len() - 1
    }

    /// Put `unit` into a previously reserved slot.
    pub fn fill(&mut self, slot: usize, unit: Arc<dyn Unit>) -> Result<()> {
        match self.slots.get_mut(slot) {
            None => Err(StagerunError::Construction(format!(
                "slot {} was never reserved",
                slot
            ))),
            Some(Some(existing)) => Err(StagerunError::Construction(format!(
                "slot {} already holds unit {}",
                slot,
                existing.id()
            ))),
            Some(entry) => {
                *entry = Some(unit);
                Ok(())
            }
        }
    }

    /// Append a unit in a new slot and return the slot index.
    pub fn push(&mut self, unit: Arc<dyn Unit>) -> usize {
        self.slots.push(Some(unit));
        self.slots.len() - 1
    }

    pub fn event_bus(&mut self, bus: Arc<EventBus>) -> &mut Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Build the plan, in slot order.
    pub fn build(self) -> Result<Plan> {
        let mut units = Vec::with_capacity(self.slots.len());
        for (slot, unit) in self.slots.into_iter().enumerate() {
            match unit {
                Some(unit) => units.push(unit),
                None => {
                    return Err(StagerunError::Construction(format!(
                        "plan {}: no absent units allowed, slot {} is empty",
                        self.id, slot
                    )))
                }
            }
        }

        let plan = Plan::new(self.id, units)?;
        Ok(match self.event_bus {
            Some(bus) => plan.with_event_bus(bus),
            None => plan,
        })
    }
}
