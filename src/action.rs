//! Translation of high-level intents into executor requests.

use std::sync::Arc;
use std::time::Duration;

use nalgebra::{Matrix3, Rotation3, UnitQuaternion, Vector3, Vector4};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::devices::{ActionExecutor, CartesianPoseSource, ReactiveController};
use crate::geometry::{Arm, Pose3};
use crate::monitor::{MotionCompletionMonitor, MotionOutcome, StartFailure};

/// Reply token the action-rendering executor uses to acknowledge a command.
pub const ACK_TOKEN: &str = "ack";

/// One manipulation intent with its robot-frame target.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionRequest {
    Home,
    Reach { target: Pose3, timeout: Duration },
    Take { target: Pose3, arm: Arm },
    Grasp { target: Pose3, arm: Arm },
    Give { target: Pose3, arm: Arm },
    Drop { target: Pose3, arm: Arm },
}

impl ActionRequest {
    pub fn name(&self) -> &'static str {
        match self {
            ActionRequest::Home => "home",
            ActionRequest::Reach { .. } => "reach",
            ActionRequest::Take { .. } => "take",
            ActionRequest::Grasp { .. } => "grasp",
            ActionRequest::Give { .. } => "give",
            ActionRequest::Drop { .. } => "drop",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionResult {
    Acknowledged,
    Rejected,
    CommunicationFailure,
    /// A reach was accepted but the hand never got within tolerance.
    TimedOut,
}

impl ActionResult {
    pub fn is_acknowledged(&self) -> bool {
        matches!(self, ActionResult::Acknowledged)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verb {
    Home,
    Take,
    Grasp,
    Give,
    Drop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modifier {
    /// Every effector (home).
    All,
    /// Approach the target from the side.
    Side,
    /// Approach the target from above (drop).
    Over,
    /// Keep the head and torso still.
    Still,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frame {
    Cartesian,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetDescriptor {
    pub frame: Frame,
    pub position: Vector3<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orientation: Option<Vector4<f64>>,
}

impl TargetDescriptor {
    fn cartesian(pose: &Pose3) -> Self {
        Self {
            frame: Frame::Cartesian,
            position: pose.position,
            orientation: pose.orientation,
        }
    }
}

/// Request sent to the action-rendering executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorCommand {
    pub verb: Verb,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<TargetDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arm: Option<Arm>,
    #[serde(default)]
    pub modifiers: Vec<Modifier>,
}

impl ExecutorCommand {
    fn verb_only(verb: Verb, modifiers: Vec<Modifier>) -> Self {
        Self {
            verb,
            target: None,
            arm: None,
            modifiers,
        }
    }

    fn targeted(verb: Verb, target: &Pose3, arm: Arm, modifiers: Vec<Modifier>) -> Self {
        Self {
            verb,
            target: Some(TargetDescriptor::cartesian(target)),
            arm: Some(arm),
            modifiers,
        }
    }
}

/// A reply without a status token counts as a refusal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorReply {
    #[serde(default)]
    pub status: String,
}

impl ExecutorReply {
    pub fn ack() -> Self {
        Self {
            status: ACK_TOKEN.to_string(),
        }
    }

    pub fn is_ack(&self) -> bool {
        self.status == ACK_TOKEN
    }
}

/// Palm-inward, fingers-forward grasp rotation as axis-angle `[ax, ay, az, angle]`.
///
/// The left hand uses the right-hand rotation mirrored through the sagittal
/// plane, so the two descriptors differ only in the sign of the lateral axis
/// component.
pub fn grasp_orientation(arm: Arm) -> Vector4<f64> {
    let s = -arm.lateral_sign();
    #[rustfmt::skip]
    let dcm = Matrix3::new(
        -1.0, 0.0, 0.0,
         0.0, 0.0,   s,
         0.0,   s, 0.0,
    );
    let rotation = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(dcm));
    match rotation.axis_angle() {
        Some((axis, angle)) => Vector4::new(axis.x, axis.y, axis.z, angle),
        None => Vector4::new(0.0, 0.0, 1.0, 0.0),
    }
}

/// Sends [`ActionRequest`]s to the reactive controller or the action-rendering
/// executor and interprets the replies.
pub struct ActionDispatcher {
    reactive: Arc<dyn ReactiveController>,
    poses: Arc<dyn CartesianPoseSource>,
    executor: Arc<dyn ActionExecutor>,
    monitor: MotionCompletionMonitor,
    /// Arm driven by the reactive controller.
    reactive_arm: Arm,
}

impl ActionDispatcher {
    pub fn new(
        reactive: Arc<dyn ReactiveController>,
        poses: Arc<dyn CartesianPoseSource>,
        executor: Arc<dyn ActionExecutor>,
        monitor: MotionCompletionMonitor,
        reactive_arm: Arm,
    ) -> Self {
        Self {
            reactive,
            poses,
            executor,
            monitor,
            reactive_arm,
        }
    }

    pub async fn dispatch(&self, request: &ActionRequest) -> ActionResult {
        let command = match request {
            ActionRequest::Home => ExecutorCommand::verb_only(Verb::Home, vec![Modifier::All]),
            ActionRequest::Reach { target, timeout } => {
                return self.reach(target, *timeout).await;
            }
            ActionRequest::Take { target, arm } => {
                let modifiers = vec![Modifier::Side, Modifier::Still];
                ExecutorCommand::targeted(Verb::Take, target, *arm, modifiers)
            }
            ActionRequest::Give { target, arm } => {
                let modifiers = vec![Modifier::Side, Modifier::Still];
                ExecutorCommand::targeted(Verb::Give, target, *arm, modifiers)
            }
            ActionRequest::Drop { target, arm } => {
                let modifiers = vec![Modifier::Over, Modifier::Still];
                ExecutorCommand::targeted(Verb::Drop, target, *arm, modifiers)
            }
            ActionRequest::Grasp { target, arm } => {
                let rot = grasp_orientation(*arm);
                debug!(?rot, "grasp rotation");
                let oriented = target.with_orientation(rot);
                ExecutorCommand::targeted(Verb::Grasp, &oriented, *arm, vec![Modifier::Still])
            }
        };
        self.send(request.name(), &command).await
    }

    async fn reach(&self, target: &Pose3, timeout: Duration) -> ActionResult {
        let outcome = self
            .monitor
            .reach(
                self.reactive.as_ref(),
                self.poses.as_ref(),
                target,
                self.reactive_arm,
                timeout,
            )
            .await;
        match outcome {
            MotionOutcome::Completed { .. } => ActionResult::Acknowledged,
            MotionOutcome::TimedOut { .. } => ActionResult::TimedOut,
            MotionOutcome::NotStarted(StartFailure::Rejected) => ActionResult::Rejected,
            MotionOutcome::NotStarted(StartFailure::CommunicationFailure(_)) => {
                ActionResult::CommunicationFailure
            }
        }
    }

    /// Stops the reactive controller outside of a supervised reach.
    pub async fn stop_reactive(&self) -> ActionResult {
        match self.reactive.stop().await {
            Ok(true) => ActionResult::Acknowledged,
            Ok(false) => ActionResult::Rejected,
            Err(e) => {
                warn!(error = %e, "failed to stop reactive controller");
                ActionResult::CommunicationFailure
            }
        }
    }

    async fn send(&self, action: &str, command: &ExecutorCommand) -> ActionResult {
        debug!(action, ?command, "command sent to action executor");
        match self.executor.execute(command).await {
            Ok(reply) => {
                debug!(action, status = %reply.status, "reply from action executor");
                if reply.is_ack() {
                    ActionResult::Acknowledged
                } else {
                    ActionResult::Rejected
                }
            }
            Err(e) => {
                warn!(action, error = %e, "action executor unreachable");
                ActionResult::CommunicationFailure
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CollaborationError, Result};
    use crate::monitor::MonitorSettings;
    use async_trait::async_trait;
    use nalgebra::Unit;
    use std::sync::Mutex;

    struct NullReactive;

    #[async_trait]
    impl ReactiveController for NullReactive {
        async fn set_target(&self, _position: &Vector3<f64>) -> Result<bool> {
            Ok(true)
        }

        async fn stop(&self) -> Result<bool> {
            Ok(true)
        }
    }

    struct AtTarget(Pose3);

    #[async_trait]
    impl CartesianPoseSource for AtTarget {
        async fn current_pose(&self) -> Result<Pose3> {
            Ok(self.0)
        }
    }

    struct ScriptedExecutor {
        status: Option<&'static str>,
        sent: Mutex<Vec<ExecutorCommand>>,
    }

    #[async_trait]
    impl ActionExecutor for ScriptedExecutor {
        async fn execute(&self, command: &ExecutorCommand) -> Result<ExecutorReply> {
            self.sent.lock().unwrap().push(command.clone());
            match self.status {
                Some(status) => Ok(ExecutorReply {
                    status: status.to_string(),
                }),
                None => Err(CollaborationError::communication("executor", "closed")),
            }
        }
    }

    fn build_dispatcher(status: Option<&'static str>) -> (ActionDispatcher, Arc<ScriptedExecutor>) {
        let executor = Arc::new(ScriptedExecutor {
            status,
            sent: Mutex::new(Vec::new()),
        });
        let dispatcher = ActionDispatcher::new(
            Arc::new(NullReactive),
            Arc::new(AtTarget(Pose3::new(-0.3, 0.1, 0.1))),
            executor.clone(),
            MotionCompletionMonitor::new(&MonitorSettings::default()),
            Arm::Right,
        );
        (dispatcher, executor)
    }

    #[test]
    fn grasp_rotation_mirrors_the_lateral_component_only() {
        let right = grasp_orientation(Arm::Right);
        let left = grasp_orientation(Arm::Left);

        assert!((right.x - left.x).abs() < 1e-12);
        assert!((right.z - left.z).abs() < 1e-12);
        assert!((right.w - left.w).abs() < 1e-12);
        assert!(right.y.abs() > 0.5);
        assert!((right.y + left.y).abs() < 1e-12);
    }

    #[test]
    fn grasp_rotation_reproduces_the_palm_inward_matrix() {
        let rot = grasp_orientation(Arm::Right);
        let axis = Unit::new_normalize(Vector3::new(rot.x, rot.y, rot.z));
        let rebuilt = Rotation3::from_axis_angle(&axis, rot.w);
        #[rustfmt::skip]
        let expected = Matrix3::new(
            -1.0,  0.0,  0.0,
             0.0,  0.0, -1.0,
             0.0, -1.0,  0.0,
        );
        assert!((rebuilt.matrix() - expected).norm() < 1e-9);
    }

    #[tokio::test]
    async fn take_builds_side_still_command() {
        let (dispatcher, executor) = build_dispatcher(Some("ack"));
        let target = Pose3::new(-0.2, 0.1, 0.05);

        let result = dispatcher
            .dispatch(&ActionRequest::Take { target, arm: Arm::Right })
            .await;

        assert_eq!(result, ActionResult::Acknowledged);
        let sent = executor.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].verb, Verb::Take);
        assert_eq!(sent[0].arm, Some(Arm::Right));
        assert_eq!(sent[0].modifiers, vec![Modifier::Side, Modifier::Still]);
        let descriptor = sent[0].target.as_ref().unwrap();
        assert_eq!(descriptor.frame, Frame::Cartesian);
        assert_eq!(descriptor.position, target.position);
        assert_eq!(descriptor.orientation, None);
    }

    #[tokio::test]
    async fn grasp_and_drop_carry_their_qualifiers() {
        let (dispatcher, executor) = build_dispatcher(Some("ack"));
        let target = Pose3::new(-0.3, -0.1, 0.05);

        dispatcher
            .dispatch(&ActionRequest::Grasp { target, arm: Arm::Left })
            .await;
        dispatcher
            .dispatch(&ActionRequest::Drop { target, arm: Arm::Left })
            .await;

        let sent = executor.sent.lock().unwrap();
        assert_eq!(sent[0].modifiers, vec![Modifier::Still]);
        assert_eq!(
            sent[0].target.as_ref().unwrap().orientation,
            Some(grasp_orientation(Arm::Left))
        );
        assert_eq!(sent[1].verb, Verb::Drop);
        assert_eq!(sent[1].modifiers, vec![Modifier::Over, Modifier::Still]);
    }

    #[tokio::test]
    async fn home_addresses_all_effectors() {
        let (dispatcher, executor) = build_dispatcher(Some("ack"));
        assert!(dispatcher.dispatch(&ActionRequest::Home).await.is_acknowledged());

        let sent = executor.sent.lock().unwrap();
        assert_eq!(sent[0].verb, Verb::Home);
        assert_eq!(sent[0].modifiers, vec![Modifier::All]);
        assert!(sent[0].target.is_none());
    }

    #[tokio::test]
    async fn reply_without_ack_is_rejected_and_silence_is_a_communication_failure() {
        let (dispatcher, _) = build_dispatcher(Some("nack"));
        let give = ActionRequest::Give {
            target: Pose3::new(-0.3, 0.1, 0.1),
            arm: Arm::Right,
        };
        assert_eq!(dispatcher.dispatch(&give).await, ActionResult::Rejected);

        let (dispatcher, _) = build_dispatcher(None);
        assert_eq!(
            dispatcher.dispatch(&give).await,
            ActionResult::CommunicationFailure
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reach_result_reflects_arrival() {
        let (dispatcher, executor) = build_dispatcher(Some("ack"));
        let reach = ActionRequest::Reach {
            target: Pose3::new(-0.3, 0.1, 0.1),
            timeout: Duration::from_secs(3),
        };
        assert_eq!(dispatcher.dispatch(&reach).await, ActionResult::Acknowledged);

        let far = ActionRequest::Reach {
            target: Pose3::new(-0.1, 0.2, 0.2),
            timeout: Duration::from_secs(3),
        };
        assert_eq!(dispatcher.dispatch(&far).await, ActionResult::TimedOut);
        assert!(executor.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn executor_command_wire_shape() {
        let command = ExecutorCommand::targeted(
            Verb::Give,
            &Pose3::new(-0.3, 0.1, 0.1),
            Arm::Left,
            vec![Modifier::Side, Modifier::Still],
        );
        let json = serde_json::to_value(&command).unwrap();
        assert_eq!(json["verb"], "give");
        assert_eq!(json["arm"], "left");
        assert_eq!(json["target"]["frame"], "cartesian");
        assert_eq!(json["modifiers"], serde_json::json!(["side", "still"]));
        assert!(json["target"].get("orientation").is_none());
    }
}
