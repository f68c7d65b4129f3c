//! Process configuration, loaded once at startup from a TOML file.
//!
//! Every section has defaults, so an empty file (or no file) yields a working
//! configuration for the right arm.

use std::path::Path;
use std::time::Duration;

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::devices::GazeSettings;
use crate::error::{CollaborationError, Result};
use crate::geometry::{ApproachOffsets, Arm, Pose3};
use crate::monitor::{seconds, MonitorSettings};
use crate::workspace::WorkspaceBounds;
use crate::world::WORLD_MODEL_PATH;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollaborationConfig {
    pub name: String,
    pub robot: String,
    /// Controlled arm part, `left_arm` or `right_arm`.
    pub part: String,
    pub workspace: WorkspaceBounds,
    pub motion: MotionSection,
    pub approach: ApproachOffsets,
    pub world: WorldSection,
    pub poses: PosesSection,
    pub gaze: GazeSection,
    pub ipc: IpcSection,
}

impl Default for CollaborationConfig {
    fn default() -> Self {
        Self {
            name: "collaboration".to_string(),
            robot: "icub".to_string(),
            part: "right_arm".to_string(),
            workspace: WorkspaceBounds::default(),
            motion: MotionSection::default(),
            approach: ApproachOffsets::default(),
            world: WorldSection::default(),
            poses: PosesSection::default(),
            gaze: GazeSection::default(),
            ipc: IpcSection::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionSection {
    #[serde(flatten)]
    pub monitor: MonitorSettings,
    /// Reach timeout used when a command does not carry one, seconds.
    pub default_timeout: f64,
}

impl Default for MotionSection {
    fn default() -> Self {
        Self {
            monitor: MonitorSettings::default(),
            default_timeout: 10.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldSection {
    pub path: String,
    /// Agent whose body parts `give` targets.
    pub partner_default_name: String,
}

impl Default for WorldSection {
    fn default() -> Self {
        Self {
            path: WORLD_MODEL_PATH.to_string(),
            partner_default_name: "partner".to_string(),
        }
    }
}

/// Fixed robot-frame points.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PosesSection {
    pub home_left: [f64; 3],
    pub home_right: [f64; 3],
    pub basket: [f64; 3],
}

impl Default for PosesSection {
    fn default() -> Self {
        Self {
            home_left: [-0.2, -0.3, 0.05],
            home_right: [-0.2, 0.3, 0.05],
            basket: [-0.3, 0.25, 0.05],
        }
    }
}

impl PosesSection {
    pub fn home(&self, arm: Arm) -> Pose3 {
        let [x, y, z] = match arm {
            Arm::Left => self.home_left,
            Arm::Right => self.home_right,
        };
        Pose3::new(x, y, z)
    }

    pub fn basket(&self) -> Pose3 {
        let [x, y, z] = self.basket;
        Pose3::new(x, y, z)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GazeSection {
    /// Azimuth, elevation and vergence of the home gaze, degrees.
    pub home_angles: [f64; 3],
    pub saccades: bool,
    pub neck_traj_time: f64,
    pub eyes_traj_time: f64,
    /// Polling period while waiting for a gaze motion, seconds.
    pub wait_period: f64,
    pub home_timeout: f64,
}

impl Default for GazeSection {
    fn default() -> Self {
        let settings = GazeSettings::default();
        Self {
            home_angles: [0.0, -25.0, 0.0],
            saccades: settings.saccades,
            neck_traj_time: settings.neck_traj_time,
            eyes_traj_time: settings.eyes_traj_time,
            wait_period: 0.1,
            home_timeout: 5.0,
        }
    }
}

impl GazeSection {
    pub fn settings(&self) -> GazeSettings {
        GazeSettings {
            saccades: self.saccades,
            neck_traj_time: self.neck_traj_time,
            eyes_traj_time: self.eyes_traj_time,
        }
    }

    pub fn home_angles(&self) -> Vector3<f64> {
        Vector3::from(self.home_angles)
    }
}

/// Local socket names of the command server and of each collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcSection {
    pub command_socket: String,
    pub reactive_controller: String,
    pub action_executor: String,
    pub cartesian: String,
    pub gaze: String,
}

impl Default for IpcSection {
    fn default() -> Self {
        Self {
            command_socket: socket_name("collaboration_rpc"),
            reactive_controller: socket_name("react_controller_rpc"),
            action_executor: socket_name("actions_rendering_engine_cmd"),
            cartesian: socket_name("cartesian_controller_rpc"),
            gaze: socket_name("gaze_controller_rpc"),
        }
    }
}

/// On Unix, local sockets live in `/tmp` so separate processes can discover them.
#[cfg(unix)]
fn socket_name(stem: &str) -> String {
    format!("/tmp/{stem}")
}

#[cfg(not(unix))]
fn socket_name(stem: &str) -> String {
    stem.to_string()
}

impl CollaborationConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| CollaborationError::Config(e.to_string()))
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            CollaborationError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Loads `path` if given, otherwise the defaults; then validates.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(p) => Self::from_path(p)?,
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn arm(&self) -> Result<Arm> {
        Arm::from_part(&self.part)
            .ok_or_else(|| CollaborationError::Config(format!("unsupported part `{}`", self.part)))
    }

    /// Falls back to ten seconds if the configured value is not a valid duration.
    pub fn default_timeout(&self) -> Duration {
        seconds(self.motion.default_timeout).unwrap_or(Duration::from_secs(10))
    }

    pub fn validate(&self) -> Result<()> {
        self.arm()?;

        let w = &self.workspace;
        let a = &self.approach;
        let mut finite = vec![
            ("workspace.x_min", w.x_min),
            ("workspace.y_half_width", w.y_half_width),
            ("workspace.z_low", w.z_low),
            ("workspace.z_high", w.z_high),
            ("approach.forward", a.forward),
            ("approach.lateral", a.lateral),
            ("motion.position_tolerance", self.motion.monitor.position_tolerance),
        ];
        let p = &self.poses;
        for (field, point) in [
            ("poses.home_left", p.home_left),
            ("poses.home_right", p.home_right),
            ("poses.basket", p.basket),
            ("gaze.home_angles", self.gaze.home_angles),
        ] {
            finite.extend(point.iter().map(|v| (field, *v)));
        }
        for (field, value) in finite {
            if !value.is_finite() {
                return Err(CollaborationError::Config(format!("{field} must be finite")));
            }
        }

        if w.y_half_width <= 0.0 {
            return Err(CollaborationError::Config(
                "workspace.y_half_width must be positive".to_string(),
            ));
        }
        if w.z_low > w.z_high {
            return Err(CollaborationError::Config(format!(
                "workspace.z_low ({}) is above workspace.z_high ({})",
                w.z_low, w.z_high
            )));
        }

        let m = &self.motion.monitor;
        if m.position_tolerance <= 0.0 {
            return Err(CollaborationError::Config(
                "motion.position_tolerance must be positive".to_string(),
            ));
        }
        if !seconds(m.polling_period).is_some_and(|p| !p.is_zero()) {
            return Err(CollaborationError::Config(
                "motion.polling_period must be a positive number of seconds".to_string(),
            ));
        }
        for (field, value) in [
            ("motion.settle_delay", m.settle_delay),
            ("motion.settle_margin", m.settle_margin),
            ("motion.default_timeout", self.motion.default_timeout),
            ("gaze.neck_traj_time", self.gaze.neck_traj_time),
            ("gaze.eyes_traj_time", self.gaze.eyes_traj_time),
            ("gaze.wait_period", self.gaze.wait_period),
            ("gaze.home_timeout", self.gaze.home_timeout),
        ] {
            if seconds(value).is_none() {
                return Err(CollaborationError::Config(format!(
                    "{field} must be a finite, non-negative number of seconds"
                )));
            }
        }
        Ok(())
    }
}
