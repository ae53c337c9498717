/// The pose of a robot in the 2D plane.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Pose {
    /// The x position of the robot
    pub x: f64,

    /// The y position of the robot
    pub y: f64,

    /// The rotation of the robot, measured in radians counter-clockwise from the positive x-axis.
    pub theta: f64,
}

impl From<Pose> for (f64, f64) {
    fn from(val: Pose) -> Self {
        (val.x, val.y)
    }
}

/// A message timestamp, split into whole seconds and nanoseconds.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Stamp {
    pub secs: i64,
    pub nanos: u32,
}

impl Stamp {
    pub fn from_seconds(t: f64) -> Self {
        let secs = t.floor();
        Self {
            secs: secs as i64,
            nanos: ((t - secs) * 1e9).round() as u32,
        }
    }

    pub fn to_seconds(self) -> f64 {
        self.secs as f64 + self.nanos as f64 * 1e-9
    }
}

/// A single wheel-odometry report.
///
/// The first message seen by the estimator supplies the absolute pose used to
/// seed the state; all later messages contribute only their body-frame
/// velocities and timestamp.
#[derive(Copy, Clone, Debug, Default)]
pub struct OdometryMessage {
    pub stamp: Stamp,

    /// Absolute x position reported by the odometry source (meters).
    pub position_x: f64,

    /// Absolute y position reported by the odometry source (meters).
    pub position_y: f64,

    /// The w component of the unit quaternion describing the heading.
    pub orientation_w: f64,

    /// Linear velocity along the robot x axis (m/s).
    pub linear_x: f64,

    /// Linear velocity along the robot y axis (m/s).
    pub linear_y: f64,

    /// Angular velocity around the vertical axis (rad/s).
    pub angular_z: f64,
}

/// A single observed line feature, reported in the robot frame.
#[derive(Copy, Clone, Debug)]
pub struct LineObservation {
    /// Half-extent of the observed segment, kept for visualization.
    pub radius: f64,

    /// Direction of the observed line relative to the robot heading, in radians.
    pub angle: f64,

    /// A point on the observed line (robot frame, meters).
    pub x: f64,

    /// A point on the observed line (robot frame, meters).
    pub y: f64,
}

/// An ordered batch of line features extracted from one sensor sweep.
#[derive(Clone, Debug, Default)]
pub struct LineObservations {
    pub landmarks: Vec<LineObservation>,
}
