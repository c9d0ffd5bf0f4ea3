//! Interfaces between the bridge and the host simulation

use simlink_core::{Action, Command, EntityId, EntityState, ValidationError};

/// View of the host simulation, borrowed by the bridge during a tick.
///
/// Every method is called on the simulation thread between simulation
/// steps, so implementations may touch live state without synchronisation.
pub trait SimulationState {
    /// Copy out every entity the optimizer should see
    fn entities(&self) -> Vec<EntityState>;

    fn entity_exists(&self, id: EntityId) -> bool;

    /// Whether this simulation can carry out the action at all
    fn supports(&self, action: Action) -> bool {
        action != Action::Unknown
    }

    /// Apply a command that passed validation.
    ///
    /// A returned error is reported to the optimizer; the implementation must
    /// leave state untouched in that case.
    fn apply(&mut self, command: &Command) -> Result<(), ValidationError>;
}

/// Callback invoked by the host once per simulation tick
pub trait TickHook {
    fn on_tick(&mut self, tick: u64, sim: &mut dyn SimulationState);
}
