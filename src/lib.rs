//! Human-robot collaboration core.
//!
//! This crate coordinates a robot's arm and gaze to take, grasp, give and drop
//! objects with a human partner:
//! - [`workspace::WorkspaceGate`]: decides whether an arm can reach a target.
//! - [`monitor::MotionCompletionMonitor`]: supervises a reactive reach until the hand
//!   arrives or the timeout elapses, and always stops the controller.
//! - [`action::ActionDispatcher`]: turns an [`action::ActionRequest`] into a command for
//!   the reactive controller or the action-rendering executor.
//! - [`world::EntityResolver`]: resolves object and agent names through a [`world::WorldModel`].
//! - [`controller::CollaborationController`]: composes all of the above.
//!
//! External services are reached through the traits in [`devices`]; [`ipc`]
//! implements them over local sockets and exposes the controller's own command surface.

pub mod action;
pub mod config;
pub mod controller;
pub mod devices;
pub mod error;
pub mod geometry;
pub mod ipc;
pub mod monitor;
pub mod workspace;
pub mod world;

pub use action::{ActionDispatcher, ActionRequest, ActionResult};
pub use config::CollaborationConfig;
pub use controller::{CollaborationController, Collaborators};
pub use error::{CollaborationError, Result};
pub use geometry::{Arm, Pose3};
pub use monitor::{MotionCompletionMonitor, MotionOutcome};
pub use workspace::{WorkspaceBounds, WorkspaceGate};
pub use world::{EntityResolver, SledWorldModel, WorldEntity, WorldModel};
