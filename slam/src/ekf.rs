use std::f64::consts::FRAC_PI_4;

use common::{
    math::wrap_angle,
    robot::{LineObservation, LineObservations, Pose},
};
use nalgebra::{DMatrix, DVector, Matrix3, Vector2, Vector3};
use serde::Deserialize;

use crate::error::{Result, SlamError};
use crate::state::{JointState, LandmarkRecord};

/// Tuning parameters for the landmark EKF.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct EkfSlamConfig {
    /// Association gate: an observation whose smallest association distance
    /// is at or above this seeds a new landmark. The default of 0.0 makes
    /// every observation a new landmark and has to be raised before any
    /// matching can happen at all.
    pub association_gate: f64,

    /// Range measurement noise per meter of range.
    pub range_noise: f64,

    /// Bearing measurement noise per meter of range.
    pub bearing_noise: f64,

    /// Process noise intensity applied to the motion increment.
    pub process_noise: f64,

    /// Drop the bearing row and treat measurements as range-only.
    pub no_bearing: bool,
}

impl Default for EkfSlamConfig {
    fn default() -> Self {
        Self {
            association_gate: 0.0,
            range_noise: 3.0,
            bearing_noise: 0.45,
            process_noise: 1.65,
            no_bearing: false,
        }
    }
}

/// A world-frame motion increment accumulated over one odometry interval.
#[derive(Copy, Clone, Debug, Default)]
pub struct MotionDelta {
    pub dx: f64,
    pub dy: f64,
    pub dtheta: f64,
}

/// A raw line report converted into its canonical world-frame form.
#[derive(Copy, Clone, Debug)]
struct CanonicalObservation {
    /// Foot of the perpendicular from the world origin onto the observed
    /// line. This point is the measurement used everywhere downstream.
    mx: f64,
    my: f64,

    /// Range and bearing of the canonical point relative to the current pose.
    range: f64,
    bearing: f64,

    /// World-frame direction of the observed line.
    line_angle: f64,

    /// World-frame location of the reported point on the line.
    anchor_x: f64,
    anchor_y: f64,
}

/// Extended Kalman filter over the joint robot-pose / landmark state with
/// on-line landmark discovery.
///
/// Landmarks are lines observed as (range, bearing, direction) reports; each
/// is reduced to the foot of the perpendicular from the world origin onto the
/// line, which makes the landmark a plain point in the state vector.
#[derive(Debug)]
pub struct EkfSlam {
    config: EkfSlamConfig,
    state: JointState,

    /// Motion increment applied by the most recent prediction step.
    last_motion: MotionDelta,

    /// Odometry interval that produced `last_motion`, in seconds.
    last_interval: f64,
}

impl EkfSlam {
    /// Creates a filter seeded with an absolute pose and the fixed initial
    /// pose covariance `diag(0.1, 0.1, PI/4)`.
    pub fn new(config: EkfSlamConfig, initial_pose: Pose) -> Self {
        let pose_covariance = Matrix3::from_diagonal(&Vector3::new(0.1, 0.1, FRAC_PI_4));

        Self {
            config,
            state: JointState::new(initial_pose, pose_covariance),
            last_motion: MotionDelta::default(),
            last_interval: 0.0,
        }
    }

    pub fn state(&self) -> &JointState {
        &self.state
    }

    /// Propagates pose and covariance by a world-frame motion increment.
    ///
    /// `interval` is the odometry time delta that produced the increment; it
    /// is remembered because the augmentation jacobian of later landmark
    /// discoveries scales with it.
    pub fn predict(&mut self, motion: MotionDelta, interval: f64) -> Result<()> {
        if !(motion.dx.is_finite() && motion.dy.is_finite() && motion.dtheta.is_finite()) {
            return Err(SlamError::Numeric("non-finite motion increment"));
        }

        let mut pose = self.state.pose();
        log::trace!(
            "prediction from ({:.3}, {:.3}, {:.3}) by ({:.4}, {:.4}, {:.4})",
            pose.x,
            pose.y,
            pose.theta,
            motion.dx,
            motion.dy,
            motion.dtheta
        );

        pose.x += motion.dx;
        pose.y += motion.dy;
        pose.theta = wrap_angle(pose.theta + motion.dtheta);
        self.state.set_pose(pose);

        let phi = transition_jacobian(&motion);

        // the process noise grows with the commanded motion itself, so a
        // resting robot accumulates no pose uncertainty
        let w = Vector3::new(motion.dx, motion.dy, motion.dtheta);
        let q = (&w * self.config.process_noise) * w.transpose();

        let p3 = self.state.pose_cov();
        self.state.set_pose_cov(&(&phi * p3 * phi.transpose() + q));

        // carry the pose transition into the pose / landmark cross covariance
        self.state.transform_cross_cov(&phi);

        self.last_motion = motion;
        self.last_interval = interval;
        Ok(())
    }

    /// Folds an ordered batch of line observations into the estimate.
    ///
    /// Observations are processed in batch order so that later entries see
    /// the effect of earlier ones. Numerically or geometrically unusable
    /// observations are skipped, shape errors abort the remainder of the
    /// batch.
    pub fn process_landmarks(&mut self, batch: &LineObservations) -> Result<()> {
        for (i, observation) in batch.landmarks.iter().enumerate() {
            match self.process_landmark(observation) {
                Ok(()) => {}
                Err(e @ SlamError::Dimension { .. }) => return Err(e),
                Err(e) => log::warn!("skipping landmark observation {i}: {e}"),
            }
        }
        Ok(())
    }

    fn process_landmark(&mut self, observation: &LineObservation) -> Result<()> {
        let canonical = self.canonicalize(observation)?;
        let noise = self.measurement_noise(canonical.range);

        match self.find_best_match(&canonical) {
            Some(index) => self.correct(index, &canonical, &noise),
            None => self.augment(observation, &canonical, &noise),
        }
    }

    /// Converts a robot-frame line report into the canonical world-frame
    /// measurement: the foot of the perpendicular from the world origin onto
    /// the observed line.
    fn canonicalize(&self, observation: &LineObservation) -> Result<CanonicalObservation> {
        let pose = self.state.pose();
        let (sin_t, cos_t) = pose.theta.sin_cos();

        let line_angle = observation.angle + pose.theta;

        // reported point on the line, rotated and translated into the world frame
        let anchor_x = pose.x + cos_t * observation.x - sin_t * observation.y;
        let anchor_y = pose.y + cos_t * observation.y + sin_t * observation.x;

        // drop the along-line component of the anchor to get the foot of the
        // perpendicular through the origin
        let (sin_a, cos_a) = line_angle.sin_cos();
        let along = anchor_x * cos_a + anchor_y * sin_a;
        let mx = anchor_x - along * cos_a;
        let my = anchor_y - along * sin_a;

        if !(mx.is_finite() && my.is_finite()) {
            return Err(SlamError::Numeric("non-finite canonical measurement"));
        }

        let dx = mx - pose.x;
        let dy = my - pose.y;
        let range = (dx * dx + dy * dy).sqrt();
        if range == 0.0 {
            return Err(SlamError::Degenerate(
                "canonical measurement coincides with the pose",
            ));
        }
        let bearing = dy.atan2(dx) - pose.theta;

        Ok(CanonicalObservation {
            mx,
            my,
            range,
            bearing,
            line_angle,
            anchor_x,
            anchor_y,
        })
    }

    /// Number of measurement rows, 1 in range-only mode.
    fn measurement_rows(&self) -> usize {
        if self.config.no_bearing {
            1
        } else {
            2
        }
    }

    /// Range-proportional measurement noise.
    fn measurement_noise(&self, range: f64) -> DMatrix<f64> {
        if self.config.no_bearing {
            DMatrix::from_element(1, 1, self.config.range_noise * range)
        } else {
            DMatrix::from_diagonal(&DVector::from_vec(vec![
                self.config.range_noise * range,
                self.config.bearing_noise * range,
            ]))
        }
    }

    /// Nearest-neighbor association of the canonical measurement against all
    /// known landmarks. Returns the landmark to update, or `None` when the
    /// observation has to seed a new one. Ties keep the lowest index because
    /// only a strictly smaller distance replaces the candidate.
    fn find_best_match(&self, canonical: &CanonicalObservation) -> Option<usize> {
        let mut best: Option<(usize, f64)> = None;

        for i in 0..self.state.num_landmarks() {
            let landmark = self.state.landmark(i);
            let distance =
                0.5 * f64::hypot(canonical.mx - landmark.x, canonical.my - landmark.y);

            if best.map_or(true, |(_, d)| distance < d) {
                best = Some((i, distance));
            }
        }

        best.filter(|&(_, distance)| distance < self.config.association_gate)
            .map(|(i, _)| i)
    }

    /// Observation jacobian for landmark `index`, non-zero only in the pose
    /// block and the landmark's own block.
    fn observation_jacobian(
        &self,
        index: usize,
        landmark: Vector2<f64>,
        pred_range: f64,
    ) -> DMatrix<f64> {
        let pose = self.state.pose();
        let mut h = DMatrix::zeros(self.measurement_rows(), self.state.dim());
        let col = 3 + 2 * index;

        h[(0, 0)] = (pose.x - landmark.x) / pred_range;
        h[(0, 1)] = (pose.y - landmark.y) / pred_range;
        h[(0, col)] = -h[(0, 0)];
        h[(0, col + 1)] = -h[(0, 1)];

        if !self.config.no_bearing {
            let q = pred_range * pred_range;
            h[(1, 0)] = (landmark.y - pose.y) / q;
            h[(1, 1)] = (landmark.x - pose.x) / q;
            h[(1, 2)] = -1.0;
            h[(1, col)] = -h[(1, 0)];
            h[(1, col + 1)] = -h[(1, 1)];
        }

        h
    }

    /// Kalman update of a matched landmark. The new mean and covariance are
    /// committed only when every entry is finite, otherwise the state is left
    /// untouched.
    fn correct(
        &mut self,
        index: usize,
        canonical: &CanonicalObservation,
        noise: &DMatrix<f64>,
    ) -> Result<()> {
        let pose = self.state.pose();
        let landmark = self.state.landmark(index);

        let dx = landmark.x - pose.x;
        let dy = landmark.y - pose.y;
        let pred_range = (dx * dx + dy * dy).sqrt();
        if pred_range == 0.0 {
            return Err(SlamError::Degenerate(
                "matched landmark coincides with the pose",
            ));
        }
        let pred_bearing = dy.atan2(dx) - pose.theta;

        let h = self.observation_jacobian(index, landmark, pred_range);
        let s = &h * self.state.covariance() * h.transpose() + noise;
        let s_inv = s
            .try_inverse()
            .ok_or(SlamError::Numeric("singular innovation covariance"))?;

        let gain = self.state.covariance() * h.transpose() * s_inv;

        let innovation = if self.config.no_bearing {
            DVector::from_element(1, canonical.range - pred_range)
        } else {
            DVector::from_vec(vec![
                canonical.range - pred_range,
                wrap_angle(canonical.bearing - pred_bearing),
            ])
        };
        log::debug!(
            "updating landmark {index}, innovation norm {:.5}",
            innovation.norm()
        );

        let n = self.state.dim();
        let mean = self.state.mean() + &gain * innovation;
        let covariance = (DMatrix::identity(n, n) - gain * h) * self.state.covariance();

        if mean.iter().any(|v| !v.is_finite()) || covariance.iter().any(|v| !v.is_finite()) {
            return Err(SlamError::Numeric("non-finite measurement update"));
        }

        self.state.replace(mean, covariance);
        Ok(())
    }

    /// Grows the joint state with a newly discovered landmark.
    fn augment(
        &mut self,
        observation: &LineObservation,
        canonical: &CanonicalObservation,
        noise: &DMatrix<f64>,
    ) -> Result<()> {
        let pose = self.state.pose();
        let phi = transition_jacobian(&self.last_motion);
        let phi_xy = phi.fixed_rows::<2>(0).into_owned();

        // discovery noise enters through the motion model evaluated at the
        // heading the last increment steered towards; the interval scaling of
        // the second column couples it to the most recent odometry cadence
        let heading = pose.theta + self.last_motion.dtheta;
        let (sin_h, cos_h) = heading.sin_cos();
        let dt = self.last_interval;
        let jz: DMatrix<f64> = if self.config.no_bearing {
            DMatrix::from_column_slice(2, 1, &[cos_h, sin_h])
        } else {
            DMatrix::from_row_slice(2, 2, &[cos_h, -dt * sin_h, sin_h, dt * cos_h])
        };

        let p3 = self.state.pose_cov();
        let g_top = p3 * phi_xy.transpose();
        let jrj = (&jz * noise * jz.transpose()).fixed_view::<2, 2>(0, 0).into_owned();
        let corner = &phi_xy * &g_top + jrj;

        let mut g = DMatrix::zeros(self.state.dim(), 2);
        g.view_mut((0, 0), (3, 2)).copy_from(&g_top);

        log::info!(
            "discovered landmark {} at ({:.3}, {:.3})",
            self.state.num_landmarks(),
            canonical.mx,
            canonical.my
        );

        self.state.grow(
            Vector2::new(canonical.mx, canonical.my),
            &g,
            &corner,
            LandmarkRecord {
                radius: observation.radius,
                angle: canonical.line_angle,
                anchor_x: canonical.anchor_x,
                anchor_y: canonical.anchor_y,
            },
        )
    }
}

/// Jacobian of the motion model with respect to the pose.
fn transition_jacobian(motion: &MotionDelta) -> Matrix3<f64> {
    Matrix3::new(
        1.0, 0.0, -motion.dy, //
        0.0, 1.0, motion.dx, //
        0.0, 0.0, 1.0,
    )
}
