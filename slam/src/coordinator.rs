use common::robot::{LineObservations, OdometryMessage, Pose};
use nalgebra::DVector;

use crate::ekf::{EkfSlam, EkfSlamConfig, MotionDelta};
use crate::error::{Result, SlamError};
use crate::state::LandmarkRecord;

/// A deep copy of the estimate, published for visualization after every
/// prediction step.
#[derive(Clone, Debug)]
pub struct SnapshotMessage {
    /// Joint state mean: the pose followed by two entries per landmark.
    pub state: DVector<f64>,

    /// Registry entries of all discovered landmarks, in discovery order.
    pub landmarks: Vec<LandmarkRecord>,

    /// Most recent absolute position reported by the odometry source.
    pub real_pose: (f64, f64),
}

/// Serializes the odometry and landmark streams into one shared estimator.
///
/// The coordinator owns initialization (the filter exists only after the
/// first odometry fix), the odometry time-delta bookkeeping, and snapshot
/// assembly. It handles one event at a time; mutual exclusion between the two
/// streams is provided by the caller, a dedicated worker thread in
/// [`crate::SlamNode`].
#[derive(Debug)]
pub struct SlamCoordinator {
    config: EkfSlamConfig,
    slam: Option<EkfSlam>,

    /// Stamp of the last processed odometry message, in seconds.
    last_stamp: Option<f64>,
    real_pose: (f64, f64),
}

impl SlamCoordinator {
    pub fn new(config: EkfSlamConfig) -> Self {
        Self {
            config,
            slam: None,
            last_stamp: None,
            real_pose: (0.0, 0.0),
        }
    }

    fn estimator(&mut self) -> Result<&mut EkfSlam> {
        self.slam.as_mut().ok_or(SlamError::Uninitialized)
    }

    /// Handles one odometry message. The first message seeds the filter from
    /// its absolute pose, every later one drives a prediction step scaled by
    /// the stamp delta. Returns the snapshot to publish.
    pub fn handle_odometry(&mut self, msg: &OdometryMessage) -> Option<SnapshotMessage> {
        // the reported position is remembered even before initialization so
        // the first snapshot already carries it
        self.real_pose = (msg.position_x, msg.position_y);
        let now = msg.stamp.to_seconds();

        match &mut self.slam {
            Some(slam) => {
                // arrival order is authoritative: a stale stamp simply yields
                // a negative interval
                let interval = now - self.last_stamp.unwrap_or(now);
                let motion = MotionDelta {
                    dx: interval * msg.linear_x,
                    dy: interval * msg.linear_y,
                    dtheta: interval * msg.angular_z,
                };

                if let Err(e) = slam.predict(motion, interval) {
                    log::warn!("prediction dropped: {e}");
                }
            }
            None => {
                let pose = Pose {
                    x: msg.position_x,
                    y: msg.position_y,
                    theta: 2.0 * msg.orientation_w.clamp(-1.0, 1.0).acos(),
                };
                log::info!(
                    "seeding pose at ({:.3}, {:.3}, {:.3})",
                    pose.x,
                    pose.y,
                    pose.theta
                );
                self.slam = Some(EkfSlam::new(self.config.clone(), pose));
            }
        }

        self.last_stamp = Some(now);
        self.snapshot()
    }

    /// Handles one landmark batch. Batches arriving before the first odometry
    /// fix are dropped.
    pub fn handle_landmarks(&mut self, batch: &LineObservations) {
        match self.estimator() {
            Ok(slam) => {
                if let Err(e) = slam.process_landmarks(batch) {
                    log::error!("landmark batch aborted: {e}");
                }
            }
            Err(e) => {
                log::debug!(
                    "dropping batch of {} landmark observations: {e}",
                    batch.landmarks.len()
                );
            }
        }
    }

    /// A deep copy of the current estimate, or `None` before initialization.
    pub fn snapshot(&self) -> Option<SnapshotMessage> {
        let slam = self.slam.as_ref()?;

        Some(SnapshotMessage {
            state: slam.state().mean().clone(),
            landmarks: slam.state().records().to_vec(),
            real_pose: self.real_pose,
        })
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use common::robot::{LineObservation, Stamp};
    use nalgebra::{Matrix3, Vector3};
    use std::f64::consts::{FRAC_PI_2, FRAC_PI_4, PI};

    use super::*;

    fn odometry_at(t: f64) -> OdometryMessage {
        OdometryMessage {
            stamp: Stamp::from_seconds(t),
            orientation_w: 1.0,
            ..Default::default()
        }
    }

    #[test]
    fn landmarks_before_first_fix_are_dropped() {
        let mut coordinator = SlamCoordinator::new(EkfSlamConfig::default());

        coordinator.handle_landmarks(&LineObservations {
            landmarks: vec![LineObservation {
                radius: 0.1,
                angle: FRAC_PI_2,
                x: 2.0,
                y: 0.0,
            }],
        });

        assert!(coordinator.snapshot().is_none());
        assert!(coordinator.slam.is_none());
    }

    #[test]
    fn first_odometry_seeds_pose_and_covariance() {
        let mut coordinator = SlamCoordinator::new(EkfSlamConfig::default());

        let snapshot = coordinator
            .handle_odometry(&OdometryMessage {
                stamp: Stamp::from_seconds(0.0),
                position_x: 1.0,
                position_y: 2.0,
                orientation_w: (PI / 8.0).cos(),
                ..Default::default()
            })
            .expect("initialization must produce a snapshot");

        assert_eq!(snapshot.state.len(), 3);
        assert_relative_eq!(snapshot.state[0], 1.0);
        assert_relative_eq!(snapshot.state[1], 2.0);
        assert_relative_eq!(snapshot.state[2], FRAC_PI_4, epsilon = 1e-12);
        assert!(snapshot.landmarks.is_empty());
        assert_eq!(snapshot.real_pose, (1.0, 2.0));

        let slam = coordinator.slam.as_ref().unwrap();
        assert_relative_eq!(
            slam.state().pose_cov(),
            Matrix3::from_diagonal(&Vector3::new(0.1, 0.1, FRAC_PI_4))
        );
    }

    #[test]
    fn twist_is_scaled_by_stamp_delta() {
        let mut coordinator = SlamCoordinator::new(EkfSlamConfig::default());
        coordinator.handle_odometry(&odometry_at(0.0));

        let snapshot = coordinator
            .handle_odometry(&OdometryMessage {
                stamp: Stamp::from_seconds(0.5),
                linear_x: 1.0,
                angular_z: FRAC_PI_2,
                ..Default::default()
            })
            .unwrap();

        // half a second at 1 m/s and PI/2 rad/s
        assert_relative_eq!(snapshot.state[0], 0.5, epsilon = 1e-12);
        assert_relative_eq!(snapshot.state[1], 0.0);
        assert_relative_eq!(snapshot.state[2], FRAC_PI_4, epsilon = 1e-12);
    }

    #[test]
    fn snapshot_follows_discovered_landmarks() {
        let mut coordinator = SlamCoordinator::new(EkfSlamConfig::default());
        coordinator.handle_odometry(&odometry_at(0.0));

        coordinator.handle_landmarks(&LineObservations {
            landmarks: vec![LineObservation {
                radius: 0.1,
                angle: FRAC_PI_2,
                x: 2.0,
                y: 0.0,
            }],
        });

        let snapshot = coordinator.snapshot().unwrap();
        assert_eq!(snapshot.state.len(), 5);
        assert_eq!(snapshot.landmarks.len(), 1);
        assert_relative_eq!(snapshot.state[3], 2.0, epsilon = 1e-9);
        assert_relative_eq!(snapshot.state[4], 0.0, epsilon = 1e-9);
    }

    #[test]
    fn stale_stamps_are_applied_in_arrival_order() {
        let mut coordinator = SlamCoordinator::new(EkfSlamConfig::default());
        coordinator.handle_odometry(&odometry_at(10.0));

        // an older stamp yields a negative interval and walks the pose back
        let snapshot = coordinator
            .handle_odometry(&OdometryMessage {
                stamp: Stamp::from_seconds(9.0),
                linear_x: 1.0,
                ..Default::default()
            })
            .unwrap();

        assert_relative_eq!(snapshot.state[0], -1.0, epsilon = 1e-12);
    }
}
