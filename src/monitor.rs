//! Reach/verify completion loop.
//!
//! The monitor starts a reactive reach, samples the live hand pose at a fixed
//! period and stops the controller on every exit path. Time is read through
//! `tokio::time`, so tests can drive the loop with a paused clock.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{sleep, timeout as deadline, Instant};
use tracing::{debug, warn};

use crate::devices::{CartesianPoseSource, ReactiveController};
use crate::geometry::{Arm, Pose3};

/// Parameters of the completion loop.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    /// Distance to target under which the reach counts as done, meters.
    pub position_tolerance: f64,
    /// Sampling period, seconds.
    pub polling_period: f64,
    /// Pause after a completed reach to let residual motion damp out, seconds.
    pub settle_delay: f64,
    /// The settle pause only happens if this much time remains before the timeout.
    pub settle_margin: f64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            position_tolerance: 0.001,
            polling_period: 0.01,
            settle_delay: 1.0,
            settle_margin: 1.0,
        }
    }
}

const DEFAULT_POLLING_PERIOD: Duration = Duration::from_millis(10);

/// Upper bound on the `stop` round trip that ends every reach.
const STOP_TIMEOUT: Duration = Duration::from_secs(1);

/// Converts seconds to a [`Duration`]. `None` for negative, non-finite or
/// out-of-range values.
pub fn seconds(value: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(value).ok()
}

/// Why a reach never entered the polling loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartFailure {
    Rejected,
    CommunicationFailure(String),
}

/// Result of one supervised reach.
#[derive(Debug, Clone, PartialEq)]
pub enum MotionOutcome {
    Completed { elapsed: Duration },
    TimedOut { elapsed: Duration },
    NotStarted(StartFailure),
}

impl MotionOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, MotionOutcome::Completed { .. })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MotionCompletionMonitor {
    tolerance: f64,
    period: Duration,
    settle_delay: Duration,
    settle_margin: Duration,
}

impl MotionCompletionMonitor {
    pub fn new(settings: &MonitorSettings) -> Self {
        Self {
            tolerance: settings.position_tolerance,
            period: seconds(settings.polling_period)
                .filter(|p| !p.is_zero())
                .unwrap_or(DEFAULT_POLLING_PERIOD),
            settle_delay: seconds(settings.settle_delay).unwrap_or(Duration::ZERO),
            settle_margin: seconds(settings.settle_margin).unwrap_or(Duration::ZERO),
        }
    }

    /// Commands `target` on the reactive controller and waits for the hand to
    /// get there. The controller receives exactly one `stop` before this returns,
    /// whatever the outcome. A collaborator that never answers counts against
    /// `timeout`.
    pub async fn reach(
        &self,
        controller: &dyn ReactiveController,
        poses: &dyn CartesianPoseSource,
        target: &Pose3,
        arm: Arm,
        timeout: Duration,
    ) -> MotionOutcome {
        debug!(target_pos = %target, %arm, "reactive set_xd");
        let start = Instant::now();
        let outcome = match deadline(timeout, controller.set_target(&target.position)).await {
            Ok(Ok(true)) => {
                let remaining = timeout.saturating_sub(start.elapsed());
                self.await_completion(poses, target, remaining).await
            }
            Ok(Ok(false)) => {
                warn!(target_pos = %target, "reactive controller refused the target");
                MotionOutcome::NotStarted(StartFailure::Rejected)
            }
            Ok(Err(e)) => {
                warn!(error = %e, "reactive controller unreachable");
                MotionOutcome::NotStarted(StartFailure::CommunicationFailure(e.to_string()))
            }
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "set_xd got no reply");
                MotionOutcome::TimedOut {
                    elapsed: start.elapsed(),
                }
            }
        };

        match deadline(STOP_TIMEOUT, controller.stop()).await {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) => warn!("reactive controller did not ack stop"),
            Ok(Err(e)) => warn!(error = %e, "failed to stop reactive controller"),
            Err(_) => warn!("stop got no reply"),
        }
        outcome
    }

    /// Polls `poses` until the hand is within tolerance of `target` or `timeout`
    /// elapses. Does not touch the controller.
    pub async fn await_completion(
        &self,
        poses: &dyn CartesianPoseSource,
        target: &Pose3,
        timeout: Duration,
    ) -> MotionOutcome {
        let start = Instant::now();
        loop {
            let remaining = timeout.saturating_sub(start.elapsed());
            let current = match deadline(remaining, poses.current_pose()).await {
                Ok(Ok(pose)) => Some(pose),
                Ok(Err(e)) => {
                    warn!(error = %e, "missed pose sample");
                    None
                }
                Err(_) => {
                    warn!(target_pos = %target, "pose source got no reply before the timeout");
                    return MotionOutcome::TimedOut {
                        elapsed: start.elapsed(),
                    };
                }
            };
            sleep(self.period).await;
            let elapsed = start.elapsed();

            let completed = current
                .map(|pose| pose.distance_to(target) <= self.tolerance)
                .unwrap_or(false);

            if completed || elapsed >= timeout {
                debug!(
                    target_pos = %target,
                    current = ?current.map(|p| p.to_string()),
                    elapsed_ms = elapsed.as_millis() as u64,
                    completed,
                    "completion loop done"
                );
                if !completed {
                    return MotionOutcome::TimedOut { elapsed };
                }
                if elapsed + self.settle_margin <= timeout {
                    sleep(self.settle_delay).await;
                }
                return MotionOutcome::Completed { elapsed };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CollaborationError, Result};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingController {
        refuse: bool,
        offline: bool,
        targets: AtomicUsize,
        stops: AtomicUsize,
    }

    #[async_trait]
    impl ReactiveController for RecordingController {
        async fn set_target(&self, _position: &nalgebra::Vector3<f64>) -> Result<bool> {
            self.targets.fetch_add(1, Ordering::SeqCst);
            if self.offline {
                return Err(CollaborationError::communication("react", "closed"));
            }
            Ok(!self.refuse)
        }

        async fn stop(&self) -> Result<bool> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }
    }

    /// Replays `samples` in order, then repeats the last one.
    struct ScriptedPoses {
        samples: Mutex<Vec<Pose3>>,
        reads: AtomicUsize,
    }

    impl ScriptedPoses {
        fn new(mut samples: Vec<Pose3>) -> Self {
            samples.reverse();
            Self {
                samples: Mutex::new(samples),
                reads: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl CartesianPoseSource for ScriptedPoses {
        async fn current_pose(&self) -> Result<Pose3> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            let mut samples = self.samples.lock().unwrap();
            let pose = if samples.len() > 1 {
                samples.pop().unwrap()
            } else {
                samples[0]
            };
            Ok(pose)
        }
    }

    /// Accepts the connection and never answers.
    struct SilentPoses;

    #[async_trait]
    impl CartesianPoseSource for SilentPoses {
        async fn current_pose(&self) -> Result<Pose3> {
            std::future::pending().await
        }
    }

    struct SilentController {
        stops: AtomicUsize,
    }

    #[async_trait]
    impl ReactiveController for SilentController {
        async fn set_target(&self, _position: &nalgebra::Vector3<f64>) -> Result<bool> {
            std::future::pending().await
        }

        async fn stop(&self) -> Result<bool> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }
    }

    fn monitor() -> MotionCompletionMonitor {
        MotionCompletionMonitor::new(&MonitorSettings {
            position_tolerance: 0.01,
            ..MonitorSettings::default()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn completes_when_within_tolerance_and_stops_once() {
        let target = Pose3::new(-0.3, 0.1, 0.1);
        let controller = RecordingController::default();
        let poses = ScriptedPoses::new(vec![
            Pose3::new(-0.2, 0.2, 0.0),
            Pose3::new(-0.25, 0.15, 0.05),
            Pose3::new(-0.301, 0.1, 0.1),
        ]);

        let outcome = monitor()
            .reach(&controller, &poses, &target, Arm::Right, Duration::from_secs(10))
            .await;

        assert!(outcome.is_completed(), "{outcome:?}");
        assert_eq!(poses.reads.load(Ordering::SeqCst), 3);
        assert_eq!(controller.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn settles_only_with_spare_time() {
        let target = Pose3::new(-0.3, 0.1, 0.1);
        let controller = RecordingController::default();

        let poses = ScriptedPoses::new(vec![target]);
        let start = Instant::now();
        monitor()
            .reach(&controller, &poses, &target, Arm::Right, Duration::from_secs(5))
            .await;
        assert!(start.elapsed() >= Duration::from_secs(1));

        let poses = ScriptedPoses::new(vec![target]);
        let start = Instant::now();
        monitor()
            .reach(&controller, &poses, &target, Arm::Right, Duration::from_millis(500))
            .await;
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_when_never_within_tolerance() {
        let target = Pose3::new(-0.3, 0.1, 0.1);
        let controller = RecordingController::default();
        let poses = ScriptedPoses::new(vec![Pose3::new(-0.1, 0.0, 0.0)]);
        let timeout = Duration::from_secs(2);

        let outcome = monitor()
            .reach(&controller, &poses, &target, Arm::Left, timeout)
            .await;

        match outcome {
            MotionOutcome::TimedOut { elapsed } => assert!(elapsed >= timeout),
            other => panic!("expected timeout, got {other:?}"),
        }
        assert_eq!(controller.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn refused_target_skips_polling_but_still_stops() {
        let target = Pose3::new(-0.3, 0.1, 0.1);
        let poses = ScriptedPoses::new(vec![target]);

        let refusing = RecordingController {
            refuse: true,
            ..Default::default()
        };
        let outcome = monitor()
            .reach(&refusing, &poses, &target, Arm::Right, Duration::from_secs(1))
            .await;
        assert_eq!(outcome, MotionOutcome::NotStarted(StartFailure::Rejected));
        assert_eq!(refusing.stops.load(Ordering::SeqCst), 1);

        let offline = RecordingController {
            offline: true,
            ..Default::default()
        };
        let outcome = monitor()
            .reach(&offline, &poses, &target, Arm::Right, Duration::from_secs(1))
            .await;
        assert!(matches!(
            outcome,
            MotionOutcome::NotStarted(StartFailure::CommunicationFailure(_))
        ));
        assert_eq!(offline.stops.load(Ordering::SeqCst), 1);
        assert_eq!(poses.reads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_pose_source_times_out_and_stops() {
        let target = Pose3::new(-0.3, 0.1, 0.1);
        let controller = RecordingController::default();

        let outcome = tokio::time::timeout(
            Duration::from_secs(60),
            monitor().reach(&controller, &SilentPoses, &target, Arm::Right, Duration::from_secs(1)),
        )
        .await
        .expect("reach must honor its own timeout");

        match outcome {
            MotionOutcome::TimedOut { elapsed } => assert!(elapsed <= Duration::from_secs(2)),
            other => panic!("expected timeout, got {other:?}"),
        }
        assert_eq!(controller.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_controller_still_gets_stop() {
        let target = Pose3::new(-0.3, 0.1, 0.1);
        let controller = SilentController {
            stops: AtomicUsize::new(0),
        };
        let poses = ScriptedPoses::new(vec![target]);

        let outcome = tokio::time::timeout(
            Duration::from_secs(60),
            monitor().reach(&controller, &poses, &target, Arm::Right, Duration::from_secs(1)),
        )
        .await
        .expect("reach must honor its own timeout");

        assert!(matches!(outcome, MotionOutcome::TimedOut { .. }));
        assert_eq!(controller.stops.load(Ordering::SeqCst), 1);
        assert_eq!(poses.reads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn out_of_range_settings_fall_back() {
        assert_eq!(seconds(1e20), None);
        assert_eq!(seconds(f64::NAN), None);
        assert_eq!(seconds(-1.0), None);
        assert_eq!(seconds(0.25), Some(Duration::from_millis(250)));

        let monitor = MotionCompletionMonitor::new(&MonitorSettings {
            polling_period: f64::NAN,
            settle_delay: 1e20,
            ..MonitorSettings::default()
        });
        assert_eq!(monitor.period, DEFAULT_POLLING_PERIOD);
        assert_eq!(monitor.settle_delay, Duration::ZERO);
    }
}
