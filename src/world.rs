//! World-model entities and name resolution.
//!
//! Entities are a closed set of variants; resolution pattern-matches on them
//! instead of testing types at runtime.

use std::collections::BTreeMap;

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::error::{CollaborationError, Result};
use crate::geometry::Pose3;

/// Default on-disk world model location (Sled).
pub const WORLD_MODEL_PATH: &str = "collaboration_world_model";

const ENTITIES_TREE: &str = "entities";

/// Value written to an object's attribute when a controller claims it.
pub const CLAIM_VALUE: f64 = -1.0;

/// A perceived object in the robot's egocentric frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectEntity {
    pub name: String,
    pub ego_position: Vector3<f64>,
    /// Mutable scalar attribute. [`CLAIM_VALUE`] marks a claimed object.
    pub value: f64,
}

impl ObjectEntity {
    pub fn is_claimed(&self) -> bool {
        self.value == CLAIM_VALUE
    }
}

/// A tracked agent and the positions of its body parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentEntity {
    pub name: String,
    pub body_parts: BTreeMap<String, Vector3<f64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum WorldEntity {
    Object(ObjectEntity),
    Agent(AgentEntity),
}

impl WorldEntity {
    pub fn name(&self) -> &str {
        match self {
            WorldEntity::Object(o) => &o.name,
            WorldEntity::Agent(a) => &a.name,
        }
    }
}

/// The world-model service as seen by the controller.
pub trait WorldModel: Send + Sync {
    fn lookup(&self, name: &str) -> Result<Option<WorldEntity>>;

    /// Persists the entity, replacing any previous state under the same name.
    fn commit(&self, entity: &WorldEntity) -> Result<()>;
}

impl<T: WorldModel + ?Sized> WorldModel for std::sync::Arc<T> {
    fn lookup(&self, name: &str) -> Result<Option<WorldEntity>> {
        (**self).lookup(name)
    }

    fn commit(&self, entity: &WorldEntity) -> Result<()> {
        (**self).commit(entity)
    }
}

/// [`WorldModel`] persisted in an embedded Sled database.
pub struct SledWorldModel {
    db: sled::Db,
}

impl std::fmt::Debug for SledWorldModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledWorldModel")
            .field("entities", &self.db.open_tree(ENTITIES_TREE).map(|t| t.len()).ok())
            .finish()
    }
}

impl SledWorldModel {
    pub fn open(path: &str) -> Result<Self> {
        Ok(Self::from_db(sled::open(path)?))
    }

    /// Wraps an already-open Sled handle.
    pub fn from_db(db: sled::Db) -> Self {
        Self { db }
    }

    /// Every stored entity, skipping records that fail to decode.
    pub fn entities(&self) -> Result<Vec<WorldEntity>> {
        let tree = self.db.open_tree(ENTITIES_TREE)?;
        Ok(tree
            .iter()
            .filter_map(|res| res.ok())
            .filter_map(|(_, v)| serde_json::from_slice::<WorldEntity>(&v).ok())
            .collect())
    }
}

impl WorldModel for SledWorldModel {
    fn lookup(&self, name: &str) -> Result<Option<WorldEntity>> {
        let tree = self.db.open_tree(ENTITIES_TREE)?;
        match tree.get(name.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn commit(&self, entity: &WorldEntity) -> Result<()> {
        let tree = self.db.open_tree(ENTITIES_TREE)?;
        let value = serde_json::to_vec(entity)?;
        tree.insert(entity.name().as_bytes(), value)?;
        tree.flush()?;
        Ok(())
    }
}

/// A pose extracted from the world model, still in the egocentric frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ResolvedTarget {
    ObjectPose(Pose3),
    AgentPartPose(Pose3),
}

impl ResolvedTarget {
    pub fn pose(&self) -> Pose3 {
        match self {
            ResolvedTarget::ObjectPose(p) | ResolvedTarget::AgentPartPose(p) => *p,
        }
    }
}

/// Looks entities up by name and extracts the pose an action should target.
pub struct EntityResolver<W> {
    world: W,
}

impl<W: WorldModel> EntityResolver<W> {
    pub fn new(world: W) -> Self {
        Self { world }
    }

    pub fn world(&self) -> &W {
        &self.world
    }

    /// Resolves an object and claims it.
    ///
    /// The claim is committed before the pose is returned, so it stays in the
    /// world model even if the caller later aborts.
    pub fn resolve_object(&self, name: &str) -> Result<ResolvedTarget> {
        let mut object = match self.world.lookup(name)? {
            Some(WorldEntity::Object(o)) => o,
            Some(other) => {
                error!(entity = other.name(), "could not use entity as an object");
                return Err(CollaborationError::TypeMismatch {
                    name: name.to_string(),
                    expected: "an object",
                });
            }
            None => {
                error!(entity = name, "not an entity");
                return Err(CollaborationError::NotFound(name.to_string()));
            }
        };

        object.value = CLAIM_VALUE;
        let pose = Pose3::from_position(object.ego_position);
        self.world.commit(&WorldEntity::Object(object))?;
        debug!(entity = name, position = %pose, "claimed object");
        Ok(ResolvedTarget::ObjectPose(pose))
    }

    /// Resolves the position of `part` on the agent called `agent`.
    pub fn resolve_agent_part(&self, agent: &str, part: &str) -> Result<ResolvedTarget> {
        let agent_entity = match self.world.lookup(agent)? {
            Some(WorldEntity::Agent(a)) => a,
            Some(other) => {
                error!(entity = other.name(), "could not use entity as an agent");
                return Err(CollaborationError::TypeMismatch {
                    name: agent.to_string(),
                    expected: "an agent",
                });
            }
            None => {
                error!(entity = agent, "not an entity");
                return Err(CollaborationError::NotFound(agent.to_string()));
            }
        };

        match agent_entity.body_parts.get(part) {
            Some(position) => Ok(ResolvedTarget::AgentPartPose(Pose3::from_position(*position))),
            None => {
                error!(entity = agent, part, "agent has no such body part");
                Err(CollaborationError::TypeMismatch {
                    name: format!("{agent}/{part}"),
                    expected: "a tracked body part",
                })
            }
        }
    }
}
