//! Contracts of the external collaborators.
//!
//! Every call is one synchronous request/response round trip. `Err(_)` means no
//! reply was obtained; a reply that declines the request is an `Ok` value.

use std::time::Duration;

use async_trait::async_trait;
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::action::{ExecutorCommand, ExecutorReply};
use crate::error::Result;
use crate::geometry::Pose3;

/// Reactive Cartesian controller: drives the hand toward a target while
/// avoiding obstacles and joint limits.
#[async_trait]
pub trait ReactiveController: Send + Sync {
    /// Sets a new target position. Returns the controller's boolean ack.
    async fn set_target(&self, position: &Vector3<f64>) -> Result<bool>;

    /// Stops chasing the current target.
    async fn stop(&self) -> Result<bool>;
}

/// Live end-effector pose of the controlled arm.
#[async_trait]
pub trait CartesianPoseSource: Send + Sync {
    async fn current_pose(&self) -> Result<Pose3>;
}

/// Action-rendering executor for the manipulation primitives.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, command: &ExecutorCommand) -> Result<ExecutorReply>;
}

/// Opaque handle to a stored gaze controller configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GazeContext(pub u32);

/// Trajectory settings applied to the gaze controller before a gesture.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GazeSettings {
    pub saccades: bool,
    pub neck_traj_time: f64,
    pub eyes_traj_time: f64,
}

impl Default for GazeSettings {
    fn default() -> Self {
        Self {
            saccades: false,
            neck_traj_time: 0.75,
            eyes_traj_time: 0.5,
        }
    }
}

/// Gaze controller, used only for the home/reset gesture.
#[async_trait]
pub trait GazeController: Send + Sync {
    async fn store_context(&self) -> Result<GazeContext>;
    async fn restore_context(&self, context: GazeContext) -> Result<()>;
    async fn configure(&self, settings: &GazeSettings) -> Result<()>;
    /// Absolute azimuth, elevation and vergence, in degrees.
    async fn look_at_angles(&self, angles: &Vector3<f64>) -> Result<()>;
    /// Returns `true` if the motion finished before `timeout`.
    async fn wait_motion_done(&self, poll: Duration, timeout: Duration) -> Result<bool>;
    async fn angles(&self) -> Result<Vector3<f64>>;
    async fn stop_control(&self) -> Result<()>;
}
