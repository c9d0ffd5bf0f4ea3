//! Toy pasture simulation used by the `host` subcommand

use simlink_bridge::SimulationState;
use simlink_core::{Action, Command, EntityId, EntityState, ParamValue, ValidationError};
use std::collections::BTreeMap;

const DEFAULT_GROWTH: f64 = 0.5;

struct Grazer {
    position: [f64; 3],
    hunger: f64,
}

/// A pasture of grazers wandering on a flat plane
pub struct Pasture {
    grazers: BTreeMap<EntityId, Grazer>,
    /// World parameters set by optimizers
    parameters: BTreeMap<String, ParamValue>,
    tick: u64,
}

impl Pasture {
    pub fn new(herd: u64) -> Self {
        let grazers = (1..=herd)
            .map(|id| {
                let offset = id as f64 * 3.0;
                (
                    id,
                    Grazer {
                        position: [offset, 0.0, -offset],
                        hunger: 0.0,
                    },
                )
            })
            .collect();
        Self {
            grazers,
            parameters: BTreeMap::new(),
            tick: 0,
        }
    }

    /// Advance the world by one tick
    pub fn step(&mut self) {
        self.tick += 1;
        let growth = self
            .parameters
            .get("GrassGrowth")
            .and_then(ParamValue::as_f64)
            .unwrap_or(DEFAULT_GROWTH);

        for (id, grazer) in self.grazers.iter_mut() {
            // Deterministic wander so runs are reproducible
            let phase = (self.tick + id) as f64 * 0.1;
            grazer.position[0] += phase.sin() * 0.2;
            grazer.position[2] += phase.cos() * 0.2;
            grazer.hunger = (grazer.hunger + 0.01 - growth * 0.005).clamp(0.0, 1.0);
        }
    }

    pub fn len(&self) -> usize {
        self.grazers.len()
    }
}

fn invalid(name: &str, reason: &str) -> ValidationError {
    ValidationError::InvalidParameter {
        name: name.into(),
        reason: reason.into(),
    }
}

fn entity_param(command: &Command) -> Result<EntityId, ValidationError> {
    command
        .param("Entity")?
        .as_entity()
        .ok_or_else(|| invalid("Entity", "expected an entity reference"))
}

fn text_param<'a>(command: &'a Command, name: &str) -> Result<&'a str, ValidationError> {
    match command.param(name)? {
        ParamValue::Text(text) => Ok(text.as_str()),
        _ => Err(invalid(name, "expected text")),
    }
}

impl SimulationState for Pasture {
    fn entities(&self) -> Vec<EntityState> {
        self.grazers
            .iter()
            .map(|(id, grazer)| {
                EntityState::new(*id, "grazer", grazer.position)
                    .with_attribute("Hunger", ParamValue::Float(grazer.hunger))
            })
            .collect()
    }

    fn entity_exists(&self, id: EntityId) -> bool {
        self.grazers.contains_key(&id)
    }

    fn apply(&mut self, command: &Command) -> Result<(), ValidationError> {
        match command.action {
            Action::MoveEntity => {
                let id = entity_param(command)?;
                let position = command
                    .param("Position")?
                    .as_vec3()
                    .ok_or_else(|| invalid("Position", "expected Vec3"))?;
                if let Some(grazer) = self.grazers.get_mut(&id) {
                    grazer.position = position;
                }
            }
            Action::SetAttribute => {
                let id = entity_param(command)?;
                if text_param(command, "Name")? != "Hunger" {
                    return Err(invalid("Name", "grazers only have Hunger"));
                }
                let hunger = command
                    .param("Value")?
                    .as_f64()
                    .ok_or_else(|| invalid("Value", "expected a number"))?;
                if !(0.0..=1.0).contains(&hunger) {
                    return Err(invalid("Value", "hunger must be within 0..=1"));
                }
                if let Some(grazer) = self.grazers.get_mut(&id) {
                    grazer.hunger = hunger;
                }
            }
            Action::RemoveEntity => {
                let id = entity_param(command)?;
                if self.grazers.len() == 1 {
                    return Err(ValidationError::Rejected("the last grazer stays".into()));
                }
                self.grazers.remove(&id);
            }
            Action::SetWorldParameter => {
                let name = text_param(command, "Name")?.to_string();
                let value = command.param("Value")?.clone();
                self.parameters.insert(name, value);
            }
            Action::Noop => {}
            Action::Unknown => return Err(ValidationError::UnknownAction),
        }
        Ok(())
    }
}
