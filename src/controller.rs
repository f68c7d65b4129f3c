//! Orchestration of pick/give/drop interactions.
//!
//! Every entry point runs the same pipeline: resolve a name to a pose (named
//! variants only), apply the action's approach offset, check the workspace of
//! the acting arm, then dispatch. Reachability and resolution failures abort
//! before any command reaches an executor.

use std::sync::Arc;
use std::time::Duration;

use nalgebra::Vector3;
use tracing::{debug, info, warn};

use crate::action::{ActionDispatcher, ActionRequest, ActionResult};
use crate::config::{CollaborationConfig, GazeSection, PosesSection};
use crate::devices::{
    ActionExecutor, CartesianPoseSource, GazeContext, GazeController, ReactiveController,
};
use crate::error::{CollaborationError, Result};
use crate::geometry::{ApproachKind, ApproachOffsets, Arm, Pose3};
use crate::monitor::{seconds, MotionCompletionMonitor};
use crate::workspace::WorkspaceGate;
use crate::world::{EntityResolver, WorldModel};

/// Handles to every external collaborator.
#[derive(Clone)]
pub struct Collaborators {
    pub reactive: Arc<dyn ReactiveController>,
    pub poses: Arc<dyn CartesianPoseSource>,
    pub executor: Arc<dyn ActionExecutor>,
    pub gaze: Arc<dyn GazeController>,
}

#[derive(Debug, Clone, Copy)]
enum Intent {
    Reach(Duration),
    Take,
    Grasp,
    Give,
    Drop,
}

impl Intent {
    fn approach(&self) -> ApproachKind {
        match self {
            Intent::Reach(_) => ApproachKind::Reach,
            Intent::Take => ApproachKind::Take,
            Intent::Grasp => ApproachKind::Grasp,
            Intent::Give => ApproachKind::Give,
            Intent::Drop => ApproachKind::Drop,
        }
    }

    fn request(self, target: Pose3, arm: Arm) -> ActionRequest {
        match self {
            Intent::Reach(timeout) => ActionRequest::Reach { target, timeout },
            Intent::Take => ActionRequest::Take { target, arm },
            Intent::Grasp => ActionRequest::Grasp { target, arm },
            Intent::Give => ActionRequest::Give { target, arm },
            Intent::Drop => ActionRequest::Drop { target, arm },
        }
    }
}

pub struct CollaborationController {
    arm: Arm,
    gate: WorkspaceGate,
    offsets: ApproachOffsets,
    partner: String,
    poses: PosesSection,
    gaze_config: GazeSection,
    gaze_wait_period: Duration,
    gaze_home_timeout: Duration,
    default_timeout: Duration,
    resolver: EntityResolver<Arc<dyn WorldModel>>,
    dispatcher: ActionDispatcher,
    gaze: Arc<dyn GazeController>,
}

impl std::fmt::Debug for CollaborationController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollaborationController")
            .field("arm", &self.arm)
            .field("bounds", self.gate.bounds())
            .field("partner", &self.partner)
            .finish()
    }
}

impl CollaborationController {
    pub fn new(
        config: &CollaborationConfig,
        world: Arc<dyn WorldModel>,
        collaborators: Collaborators,
    ) -> Result<Self> {
        config.validate()?;
        let arm = config.arm()?;
        let monitor = MotionCompletionMonitor::new(&config.motion.monitor);
        let dispatcher = ActionDispatcher::new(
            collaborators.reactive,
            collaborators.poses,
            collaborators.executor,
            monitor,
            arm,
        );

        Ok(Self {
            arm,
            gate: WorkspaceGate::new(config.workspace),
            offsets: config.approach,
            partner: config.world.partner_default_name.clone(),
            poses: config.poses,
            gaze_config: config.gaze,
            gaze_wait_period: seconds(config.gaze.wait_period).unwrap_or_default(),
            gaze_home_timeout: seconds(config.gaze.home_timeout).unwrap_or_default(),
            default_timeout: config.default_timeout(),
            resolver: EntityResolver::new(world),
            dispatcher,
            gaze: collaborators.gaze,
        })
    }

    /// Arm driven by the reactive controller.
    pub fn arm(&self) -> Arm {
        self.arm
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Returns every effector to rest. No resolution, no gating.
    pub async fn home(&self) -> Result<ActionResult> {
        info!("homing all effectors");
        Ok(self.dispatcher.dispatch(&ActionRequest::Home).await)
    }

    /// Reaching only drives [`CollaborationController::arm`]; any other arm is refused.
    pub async fn reach_entity(
        &self,
        name: &str,
        arm: Arm,
        timeout: Duration,
    ) -> Result<ActionResult> {
        self.ensure_reactive_arm(arm)?;
        let base = self.resolver.resolve_object(name)?.pose();
        self.approach(base, Intent::Reach(timeout), arm).await
    }

    pub async fn reach_pose(
        &self,
        pose: Pose3,
        arm: Arm,
        timeout: Duration,
    ) -> Result<ActionResult> {
        self.ensure_reactive_arm(arm)?;
        self.approach(pose, Intent::Reach(timeout), arm).await
    }

    /// Reaches the configured rest point of `arm`, which is already a robot-frame target.
    pub async fn reach_home(&self, arm: Arm, timeout: Duration) -> Result<ActionResult> {
        self.ensure_reactive_arm(arm)?;
        let target = self.poses.home(arm);
        self.gated_dispatch(target, Intent::Reach(timeout), arm).await
    }

    pub async fn take_entity(&self, name: &str, arm: Arm) -> Result<ActionResult> {
        let base = self.resolver.resolve_object(name)?.pose();
        self.approach(base, Intent::Take, arm).await
    }

    pub async fn take_pose(&self, pose: Pose3, arm: Arm) -> Result<ActionResult> {
        self.approach(pose, Intent::Take, arm).await
    }

    pub async fn grasp_entity(&self, name: &str, arm: Arm) -> Result<ActionResult> {
        let base = self.resolver.resolve_object(name)?.pose();
        self.approach(base, Intent::Grasp, arm).await
    }

    pub async fn grasp_pose(&self, pose: Pose3, arm: Arm) -> Result<ActionResult> {
        self.approach(pose, Intent::Grasp, arm).await
    }

    /// Hands the held object to the partner's `body_part` (usually an empty hand).
    pub async fn give_to_partner(&self, body_part: &str, arm: Arm) -> Result<ActionResult> {
        let base = self
            .resolver
            .resolve_agent_part(&self.partner, body_part)?
            .pose();
        self.approach(base, Intent::Give, arm).await
    }

    pub async fn give_pose(&self, pose: Pose3, arm: Arm) -> Result<ActionResult> {
        self.approach(pose, Intent::Give, arm).await
    }

    pub async fn drop_pose(&self, pose: Pose3, arm: Arm) -> Result<ActionResult> {
        self.approach(pose, Intent::Drop, arm).await
    }

    pub async fn drop_in_basket(&self, arm: Arm) -> Result<ActionResult> {
        self.approach(self.poses.basket(), Intent::Drop, arm).await
    }

    pub fn check_reachable(&self, pose: &Pose3, side: &str) -> bool {
        self.gate.reachable_side(pose, side)
    }

    pub async fn stop_reaching(&self) -> ActionResult {
        self.dispatcher.stop_reactive().await
    }

    async fn approach(&self, base: Pose3, intent: Intent, arm: Arm) -> Result<ActionResult> {
        let offset = self.offsets.for_action(intent.approach(), arm);
        let target = base.offset_by(&offset);
        debug!(base = %base, target_pos = %target, ?intent, "applied approach offset");
        self.gated_dispatch(target, intent, arm).await
    }

    fn ensure_reactive_arm(&self, arm: Arm) -> Result<()> {
        if arm == self.arm {
            return Ok(());
        }
        Err(CollaborationError::UncontrolledArm {
            requested: arm.to_string(),
            controlled: self.arm.to_string(),
        })
    }

    async fn gated_dispatch(
        &self,
        target: Pose3,
        intent: Intent,
        arm: Arm,
    ) -> Result<ActionResult> {
        if !self.gate.reachable(&target, arm) {
            debug!(target_pos = %target, "target is unreachable");
            return Err(CollaborationError::Unreachable {
                position: target.to_string(),
                arm: arm.to_string(),
            });
        }
        let request = intent.request(target, arm);
        let result = self.dispatcher.dispatch(&request).await;
        info!(action = request.name(), %arm, target_pos = %target, ?result, "dispatched");
        Ok(result)
    }

    /// Acquires the gaze controller: stores the configuration found at
    /// startup, applies ours and looks at the home angles. The returned
    /// context must be handed back to [`CollaborationController::shutdown`].
    pub async fn prepare_gaze(&self) -> Result<GazeContext> {
        let startup = self.gaze.store_context().await?;
        let prepared = async {
            self.gaze.configure(&self.gaze_config.settings()).await?;
            self.home_gaze_gesture(self.gaze_home_timeout()).await?;
            let current = self.gaze.angles().await?;
            debug!(?current, "gaze angles after homing");
            Ok::<(), CollaborationError>(())
        }
        .await;
        if let Err(e) = prepared {
            self.gaze.restore_context(startup).await?;
            return Err(e);
        }
        Ok(startup)
    }

    /// Looks at the home angles inside a scoped gaze context; the context in
    /// place before the call is restored whether or not the gesture succeeds.
    pub async fn look_at_home(&self, timeout: Duration) -> Result<bool> {
        let context = self.gaze.store_context().await?;
        let gesture = async {
            self.gaze.configure(&self.gaze_config.settings()).await?;
            self.home_gaze_gesture(timeout).await
        }
        .await;
        let restored = self.gaze.restore_context(context).await;
        let done = gesture?;
        restored?;
        Ok(done)
    }

    pub fn gaze_home_timeout(&self) -> Duration {
        self.gaze_home_timeout
    }

    async fn home_gaze_gesture(&self, timeout: Duration) -> Result<bool> {
        self.gaze
            .look_at_angles(&self.gaze_config.home_angles())
            .await?;
        let done = self
            .gaze
            .wait_motion_done(self.gaze_wait_period, timeout)
            .await?;
        if !done {
            warn!(timeout_s = timeout.as_secs_f64(), "gaze did not reach home");
        }
        Ok(done)
    }

    /// Homes the effectors, then releases the gaze controller in the state it
    /// was found at startup. Every step is attempted; the first failure is returned.
    pub async fn shutdown(&self, startup_gaze: GazeContext) -> Result<()> {
        info!("shutting down collaboration controller");
        let mut first_error = None;

        match self.home().await {
            Ok(ActionResult::Acknowledged) => {}
            Ok(other) => warn!(result = ?other, "home during shutdown not acknowledged"),
            Err(e) => first_error = Some(e),
        }

        let steps = [
            self.gaze.look_at_angles(&Vector3::zeros()).await,
            self.gaze.restore_context(startup_gaze).await,
            self.gaze.stop_control().await,
        ];
        for step in steps {
            if let Err(e) = step {
                warn!(error = %e, "gaze release step failed");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ExecutorCommand, ExecutorReply};
    use crate::world::{ObjectEntity, SledWorldModel, WorldEntity};
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        log: Mutex<Vec<String>>,
        fail_look: bool,
    }

    impl Recorder {
        fn push(&self, entry: impl Into<String>) {
            self.log.lock().unwrap().push(entry.into());
        }

        fn entries(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ReactiveController for Recorder {
        async fn set_target(&self, _position: &Vector3<f64>) -> Result<bool> {
            self.push("set_xd");
            Ok(true)
        }

        async fn stop(&self) -> Result<bool> {
            self.push("stop");
            Ok(true)
        }
    }

    #[async_trait]
    impl CartesianPoseSource for Recorder {
        async fn current_pose(&self) -> Result<Pose3> {
            Ok(Pose3::new(0.0, 0.0, 0.0))
        }
    }

    #[async_trait]
    impl ActionExecutor for Recorder {
        async fn execute(&self, command: &ExecutorCommand) -> Result<ExecutorReply> {
            self.push(format!("{:?}", command.verb));
            Ok(ExecutorReply::ack())
        }
    }

    #[async_trait]
    impl GazeController for Recorder {
        async fn store_context(&self) -> Result<GazeContext> {
            self.push("store");
            Ok(GazeContext(7))
        }

        async fn restore_context(&self, context: GazeContext) -> Result<()> {
            self.push(format!("restore {}", context.0));
            Ok(())
        }

        async fn configure(&self, _settings: &crate::devices::GazeSettings) -> Result<()> {
            self.push("configure");
            Ok(())
        }

        async fn look_at_angles(&self, angles: &Vector3<f64>) -> Result<()> {
            if self.fail_look {
                return Err(CollaborationError::communication("gaze", "closed"));
            }
            self.push(format!("look {}", angles.y));
            Ok(())
        }

        async fn wait_motion_done(&self, _poll: Duration, _timeout: Duration) -> Result<bool> {
            Ok(true)
        }

        async fn angles(&self) -> Result<Vector3<f64>> {
            Ok(Vector3::zeros())
        }

        async fn stop_control(&self) -> Result<()> {
            self.push("stop_control");
            Ok(())
        }
    }

    fn build_controller(recorder: Arc<Recorder>) -> CollaborationController {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .expect("failed to open temporary sled db");
        let world = SledWorldModel::from_db(db);
        world
            .commit(&WorldEntity::Object(ObjectEntity {
                name: "cup".to_string(),
                ego_position: Vector3::new(-0.25, 0.1, 0.05),
                value: 0.0,
            }))
            .unwrap();
        let collaborators = Collaborators {
            reactive: recorder.clone(),
            poses: recorder.clone(),
            executor: recorder.clone(),
            gaze: recorder,
        };
        let config = CollaborationConfig::default();
        CollaborationController::new(&config, Arc::new(world), collaborators).unwrap()
    }

    #[tokio::test]
    async fn home_bypasses_gating() {
        let recorder = Arc::new(Recorder::default());
        let controller = build_controller(recorder.clone());

        assert_eq!(controller.home().await.unwrap(), ActionResult::Acknowledged);
        assert_eq!(recorder.entries(), vec!["Home"]);
    }

    #[tokio::test]
    async fn unreachable_pose_sends_nothing() {
        let recorder = Arc::new(Recorder::default());
        let controller = build_controller(recorder.clone());

        let err = controller
            .drop_pose(Pose3::new(-0.3, 0.0, 0.5), Arm::Right)
            .await
            .unwrap_err();

        assert!(matches!(err, CollaborationError::Unreachable { .. }));
        assert!(recorder.entries().is_empty());
    }

    #[tokio::test]
    async fn unknown_entity_aborts_before_dispatch() {
        let recorder = Arc::new(Recorder::default());
        let controller = build_controller(recorder.clone());

        let err = controller.grasp_entity("ball", Arm::Right).await.unwrap_err();

        assert!(matches!(err, CollaborationError::NotFound(_)));
        assert!(recorder.entries().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reach_home_times_out_and_releases_the_controller() {
        let recorder = Arc::new(Recorder::default());
        let controller = build_controller(recorder.clone());

        let result = controller
            .reach_home(Arm::Right, Duration::from_millis(200))
            .await
            .unwrap();

        assert_eq!(result, ActionResult::TimedOut);
        assert_eq!(recorder.entries(), vec!["set_xd", "stop"]);
    }

    #[tokio::test]
    async fn reaching_with_the_other_arm_is_refused() {
        let recorder = Arc::new(Recorder::default());
        let controller = build_controller(recorder.clone());
        let timeout = Duration::from_secs(1);

        let err = controller
            .reach_pose(Pose3::new(-0.3, -0.1, 0.1), Arm::Left, timeout)
            .await
            .unwrap_err();
        assert!(matches!(err, CollaborationError::UncontrolledArm { .. }));
        assert!(controller.reach_home(Arm::Left, timeout).await.is_err());
        assert!(controller.reach_entity("cup", Arm::Left, timeout).await.is_err());
        assert!(recorder.entries().is_empty());
    }

    #[test]
    fn check_reachable_fails_closed_on_unknown_side() {
        let controller = build_controller(Arc::new(Recorder::default()));
        let pose = Pose3::new(-0.3, 0.0, 0.1);

        assert!(controller.check_reachable(&pose, "left"));
        assert!(!controller.check_reachable(&pose, "middle"));
    }

    #[tokio::test]
    async fn look_at_home_restores_context_even_on_failure() {
        let recorder = Arc::new(Recorder::default());
        let controller = build_controller(recorder.clone());
        assert!(controller.look_at_home(Duration::from_secs(1)).await.unwrap());
        assert_eq!(
            recorder.entries(),
            vec!["store", "configure", "look -25", "restore 7"]
        );

        let failing = Arc::new(Recorder {
            fail_look: true,
            ..Default::default()
        });
        let controller = build_controller(failing.clone());
        assert!(controller.look_at_home(Duration::from_secs(1)).await.is_err());
        assert_eq!(failing.entries(), vec!["store", "configure", "restore 7"]);
    }

    #[tokio::test]
    async fn shutdown_hands_back_the_startup_gaze_context() {
        let recorder = Arc::new(Recorder::default());
        let controller = build_controller(recorder.clone());

        let startup = controller.prepare_gaze().await.unwrap();
        assert_eq!(startup, GazeContext(7));
        controller.shutdown(startup).await.unwrap();

        assert_eq!(
            recorder.entries(),
            vec![
                "store",
                "configure",
                "look -25",
                "Home",
                "look 0",
                "restore 7",
                "stop_control"
            ]
        );
    }
}
