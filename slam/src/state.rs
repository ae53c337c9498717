use common::{math::wrap_angle, robot::Pose};
use nalgebra::{DMatrix, DVector, Matrix2, Matrix3, Matrix3x2, Vector2};

use crate::error::{Result, SlamError};

/// World-frame description of a discovered line landmark, kept only for
/// downstream visualization. The filter itself reads the state columns.
#[derive(Clone, Debug)]
pub struct LandmarkRecord {
    /// Half-extent of the observed segment.
    pub radius: f64,

    /// World-frame direction of the line, in radians.
    pub angle: f64,

    /// World-frame point on the line at the time of discovery.
    pub anchor_x: f64,
    pub anchor_y: f64,
}

/// The joint mean and covariance over the robot pose and all discovered
/// landmarks.
///
/// Layout: indices `0..3` hold `(x, y, theta)`, landmark `i` occupies indices
/// `3 + 2i` and `4 + 2i`. The covariance is indexed identically. Both only
/// ever grow, two entries per discovered landmark.
#[derive(Clone, Debug)]
pub struct JointState {
    mean: DVector<f64>,
    covariance: DMatrix<f64>,
    records: Vec<LandmarkRecord>,
}

impl JointState {
    /// Creates a pose-only state with the given absolute pose and pose
    /// covariance. The heading is wrapped to `(-PI, PI]`.
    pub fn new(pose: Pose, pose_covariance: Matrix3<f64>) -> Self {
        let mean = DVector::from_vec(vec![pose.x, pose.y, wrap_angle(pose.theta)]);
        let mut covariance = DMatrix::zeros(3, 3);
        covariance
            .fixed_view_mut::<3, 3>(0, 0)
            .copy_from(&pose_covariance);

        Self {
            mean,
            covariance,
            records: Vec::new(),
        }
    }

    /// Length of the state vector, `3 + 2 * num_landmarks()`.
    pub fn dim(&self) -> usize {
        self.mean.len()
    }

    pub fn num_landmarks(&self) -> usize {
        self.records.len()
    }

    pub fn pose(&self) -> Pose {
        Pose {
            x: self.mean[0],
            y: self.mean[1],
            theta: self.mean[2],
        }
    }

    pub fn set_pose(&mut self, pose: Pose) {
        self.mean[0] = pose.x;
        self.mean[1] = pose.y;
        self.mean[2] = wrap_angle(pose.theta);
    }

    /// Estimated position of landmark `i`.
    pub fn landmark(&self, i: usize) -> Vector2<f64> {
        self.mean.fixed_rows::<2>(3 + 2 * i).into_owned()
    }

    pub fn mean(&self) -> &DVector<f64> {
        &self.mean
    }

    pub fn covariance(&self) -> &DMatrix<f64> {
        &self.covariance
    }

    /// The pose block `P[0:3, 0:3]`.
    pub fn pose_cov(&self) -> Matrix3<f64> {
        self.covariance.fixed_view::<3, 3>(0, 0).into_owned()
    }

    pub(crate) fn set_pose_cov(&mut self, block: &Matrix3<f64>) {
        self.covariance.fixed_view_mut::<3, 3>(0, 0).copy_from(block);
    }

    /// The pose / landmark-`i` cross block `P[0:3, 3+2i:5+2i]`.
    pub fn cross_cov(&self, i: usize) -> Matrix3x2<f64> {
        self.covariance
            .fixed_view::<3, 2>(0, 3 + 2 * i)
            .into_owned()
    }

    pub fn records(&self) -> &[LandmarkRecord] {
        &self.records
    }

    /// Applies the pose-block transition to the pose / landmark cross
    /// covariance, writing the transposed block back so the matrix stays
    /// symmetric.
    pub(crate) fn transform_cross_cov(&mut self, phi: &Matrix3<f64>) {
        let n = self.dim();
        if n == 3 {
            return;
        }

        let cross = phi * self.covariance.view((0, 3), (3, n - 3));
        self.covariance.view_mut((0, 3), (3, n - 3)).copy_from(&cross);
        self.covariance
            .view_mut((3, 0), (n - 3, 3))
            .copy_from(&cross.transpose());
    }

    /// Appends a new landmark with mean `new_mean` and extends the covariance
    /// with the border column `g` and corner `c`:
    ///
    /// ```text
    /// P' = | P   g |
    ///      | gᵀ  c |
    /// ```
    pub fn grow(
        &mut self,
        new_mean: Vector2<f64>,
        g: &DMatrix<f64>,
        c: &Matrix2<f64>,
        record: LandmarkRecord,
    ) -> Result<()> {
        let n = self.dim();
        if g.shape() != (n, 2) {
            return Err(SlamError::Dimension {
                context: "covariance border",
                expected: (n, 2),
                actual: g.shape(),
            });
        }

        let mut mean = DVector::zeros(n + 2);
        mean.rows_mut(0, n).copy_from(&self.mean);
        mean[n] = new_mean.x;
        mean[n + 1] = new_mean.y;

        let mut covariance = DMatrix::zeros(n + 2, n + 2);
        covariance.view_mut((0, 0), (n, n)).copy_from(&self.covariance);
        covariance.view_mut((0, n), (n, 2)).copy_from(g);
        covariance.view_mut((n, 0), (2, n)).copy_from(&g.transpose());
        covariance.fixed_view_mut::<2, 2>(n, n).copy_from(c);

        self.mean = mean;
        self.covariance = covariance;
        self.records.push(record);
        Ok(())
    }

    /// Replaces mean and covariance after a measurement update. Wraps the
    /// heading and removes accumulated asymmetry.
    pub(crate) fn replace(&mut self, mean: DVector<f64>, covariance: DMatrix<f64>) {
        debug_assert_eq!(mean.len(), self.mean.len());
        debug_assert_eq!(covariance.shape(), self.covariance.shape());

        self.mean = mean;
        self.mean[2] = wrap_angle(self.mean[2]);
        self.covariance = covariance;
        self.symmetrize();
    }

    /// `P <- (P + Pᵀ) / 2`, countering numerical drift.
    pub(crate) fn symmetrize(&mut self) {
        let transposed = self.covariance.transpose();
        self.covariance += transposed;
        self.covariance *= 0.5;
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use nalgebra::Vector3;
    use std::f64::consts::PI;

    use super::*;

    fn pose_cov() -> Matrix3<f64> {
        Matrix3::from_diagonal(&Vector3::new(0.1, 0.1, PI / 4.0))
    }

    #[test]
    fn new_state_is_pose_only() {
        let state = JointState::new(
            Pose {
                x: 1.0,
                y: 2.0,
                theta: 0.5,
            },
            pose_cov(),
        );

        assert_eq!(state.dim(), 3);
        assert_eq!(state.num_landmarks(), 0);
        assert_relative_eq!(state.pose().x, 1.0);
        assert_relative_eq!(state.pose().y, 2.0);
        assert_relative_eq!(state.pose().theta, 0.5);
        assert_relative_eq!(state.pose_cov(), pose_cov());
    }

    #[test]
    fn set_pose_wraps_heading() {
        let mut state = JointState::new(Pose::default(), pose_cov());
        state.set_pose(Pose {
            x: 0.0,
            y: 0.0,
            theta: 3.0 * PI,
        });

        assert_relative_eq!(state.pose().theta, PI);
    }

    #[test]
    fn grow_appends_mean_and_borders_covariance() {
        let mut state = JointState::new(Pose::default(), pose_cov());

        let mut g = DMatrix::zeros(3, 2);
        g[(0, 0)] = 0.3;
        g[(2, 1)] = -0.1;
        let c = Matrix2::new(2.0, 0.5, 0.5, 1.0);

        state
            .grow(
                Vector2::new(4.0, -1.0),
                &g,
                &c,
                LandmarkRecord {
                    radius: 0.1,
                    angle: 0.0,
                    anchor_x: 4.0,
                    anchor_y: -1.0,
                },
            )
            .unwrap();

        assert_eq!(state.dim(), 5);
        assert_eq!(state.num_landmarks(), 1);
        assert_relative_eq!(state.landmark(0), Vector2::new(4.0, -1.0));

        // border column and its mirror
        assert_relative_eq!(state.cross_cov(0), g.fixed_view::<3, 2>(0, 0).into_owned());
        assert_relative_eq!(state.covariance()[(3, 0)], 0.3);
        assert_relative_eq!(state.covariance()[(4, 2)], -0.1);
        assert_relative_eq!(state.covariance().fixed_view::<2, 2>(3, 3).into_owned(), c);

        // the existing pose block is untouched
        assert_relative_eq!(state.pose_cov(), pose_cov());
    }

    #[test]
    fn grow_rejects_wrong_border_height() {
        let mut state = JointState::new(Pose::default(), pose_cov());

        let g = DMatrix::zeros(5, 2);
        let result = state.grow(
            Vector2::zeros(),
            &g,
            &Matrix2::identity(),
            LandmarkRecord {
                radius: 0.0,
                angle: 0.0,
                anchor_x: 0.0,
                anchor_y: 0.0,
            },
        );

        assert!(matches!(result, Err(SlamError::Dimension { .. })));
        assert_eq!(state.dim(), 3);
        assert_eq!(state.num_landmarks(), 0);
    }

    #[test]
    fn symmetrize_averages_off_diagonal() {
        let mut state = JointState::new(Pose::default(), pose_cov());
        state.covariance[(0, 1)] = 1.0;
        state.covariance[(1, 0)] = 0.0;

        state.symmetrize();

        assert_relative_eq!(state.covariance()[(0, 1)], 0.5);
        assert_relative_eq!(state.covariance()[(1, 0)], 0.5);
    }
}
