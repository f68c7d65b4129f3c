//! Workspace reachability gate.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::geometry::{Arm, Pose3};

/// Box the arms are allowed to reach, in the robot frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceBounds {
    /// Lower bound on x. Negative: targets further out than this are rejected.
    pub x_min: f64,
    pub y_half_width: f64,
    pub z_low: f64,
    pub z_high: f64,
}

impl Default for WorkspaceBounds {
    fn default() -> Self {
        Self {
            x_min: -0.5,
            y_half_width: 0.3,
            z_low: -0.1,
            z_high: 0.35,
        }
    }
}

/// Pure geometric predicate over a fixed set of [`WorkspaceBounds`].
#[derive(Debug, Clone, Copy)]
pub struct WorkspaceGate {
    bounds: WorkspaceBounds,
}

impl WorkspaceGate {
    pub fn new(bounds: WorkspaceBounds) -> Self {
        Self { bounds }
    }

    pub fn bounds(&self) -> &WorkspaceBounds {
        &self.bounds
    }

    /// Whether `pos` lies inside the workspace of `arm`.
    ///
    /// Each arm's lateral band favors its own side and overlaps the midline by
    /// half a band: left covers `[-w, w/2]`, right covers `[-w/2, w]`.
    /// Orientation is ignored.
    pub fn reachable(&self, pos: &Pose3, arm: Arm) -> bool {
        let b = &self.bounds;
        let (y_low, y_high) = match arm {
            Arm::Left => (-b.y_half_width, 0.5 * b.y_half_width),
            Arm::Right => (-0.5 * b.y_half_width, b.y_half_width),
        };

        let ok = pos.x() >= b.x_min
            && pos.z() >= b.z_low
            && pos.z() <= b.z_high
            && pos.y() >= y_low
            && pos.y() <= y_high;

        debug!(target_pos = %pos, %arm, reachable = ok, "checked workspace");
        debug!(
            x_min = b.x_min,
            y_half_width = b.y_half_width,
            z_low = b.z_low,
            z_high = b.z_high,
            "workspace bounds"
        );
        ok
    }

    /// String-keyed variant for callers that have not parsed the side yet.
    /// Anything other than `left` or `right` is unreachable.
    pub fn reachable_side(&self, pos: &Pose3, side: &str) -> bool {
        match side.parse::<Arm>() {
            Ok(arm) => self.reachable(pos, arm),
            Err(_) => {
                debug!(side, "unknown arm side, failing closed");
                false
            }
        }
    }
}
