//! Spatial primitives shared by the gate, the monitor and the dispatcher.
//!
//! Positions are robot-egocentric: x forward/back (negative is in front of the
//! robot), y left/right (positive is the robot's right) and z up/down, in meters.

use std::fmt;
use std::str::FromStr;

use nalgebra::{Vector3, Vector4};
use serde::{Deserialize, Serialize};

use crate::error::CollaborationError;

/// A 3D target, optionally paired with an axis-angle orientation `[ax, ay, az, angle]`.
///
/// Internally uses [`nalgebra::Vector3<f64>`] so offsets and distances are plain vector math.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose3 {
    pub position: Vector3<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orientation: Option<Vector4<f64>>,
}

impl Pose3 {
    /// Convenience constructor for a position-only pose.
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self::from_position(Vector3::new(x, y, z))
    }

    pub fn from_position(position: Vector3<f64>) -> Self {
        Self {
            position,
            orientation: None,
        }
    }

    pub fn with_orientation(mut self, axis_angle: Vector4<f64>) -> Self {
        self.orientation = Some(axis_angle);
        self
    }

    pub fn x(&self) -> f64 {
        self.position.x
    }

    pub fn y(&self) -> f64 {
        self.position.y
    }

    pub fn z(&self) -> f64 {
        self.position.z
    }

    /// Returns a new pose translated by `offset`; orientation is carried over.
    pub fn offset_by(&self, offset: &Vector3<f64>) -> Self {
        Self {
            position: self.position + offset,
            orientation: self.orientation,
        }
    }

    /// Euclidean distance between the two positions.
    pub fn distance_to(&self, other: &Pose3) -> f64 {
        (self.position - other.position).norm()
    }
}

impl fmt::Display for Pose3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({:.3}, {:.3}, {:.3})",
            self.position.x, self.position.y, self.position.z
        )
    }
}

/// The arm that performs an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Arm {
    Left,
    Right,
}

impl Arm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Arm::Left => "left",
            Arm::Right => "right",
        }
    }

    /// Maps a controlled part name (`left_arm` / `right_arm`) to its arm.
    pub fn from_part(part: &str) -> Option<Self> {
        match part {
            "left_arm" => Some(Arm::Left),
            "right_arm" => Some(Arm::Right),
            _ => None,
        }
    }

    /// Sign of the lateral axis on this arm's side of the body.
    pub fn lateral_sign(&self) -> f64 {
        match self {
            Arm::Left => -1.0,
            Arm::Right => 1.0,
        }
    }
}

impl fmt::Display for Arm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Arm {
    type Err = CollaborationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "left" => Ok(Arm::Left),
            "right" => Ok(Arm::Right),
            other => Err(CollaborationError::Config(format!("unknown arm `{other}`"))),
        }
    }
}

/// Which kind of approach an action makes toward its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApproachKind {
    Reach,
    Take,
    Give,
    Grasp,
    Drop,
}

/// Offsets applied before gating so the hand targets a point near the entity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApproachOffsets {
    /// Distance toward the robot (+x), meters.
    pub forward: f64,
    /// Lateral distance toward the acting arm's side, meters. Reaching only.
    pub lateral: f64,
}

impl Default for ApproachOffsets {
    fn default() -> Self {
        Self {
            forward: 0.05,
            lateral: 0.05,
        }
    }
}

impl ApproachOffsets {
    pub fn for_action(&self, kind: ApproachKind, arm: Arm) -> Vector3<f64> {
        match kind {
            ApproachKind::Reach => {
                Vector3::new(self.forward, arm.lateral_sign() * self.lateral, 0.0)
            }
            ApproachKind::Take | ApproachKind::Give => Vector3::new(self.forward, 0.0, 0.0),
            ApproachKind::Grasp | ApproachKind::Drop => Vector3::zeros(),
        }
    }
}
