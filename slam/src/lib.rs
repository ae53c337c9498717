mod coordinator;
mod ekf;
mod error;
mod node;
mod state;

pub use coordinator::{SlamCoordinator, SnapshotMessage};
pub use ekf::{EkfSlam, EkfSlamConfig, MotionDelta};
pub use error::{Result, SlamError};
pub use node::{SlamNode, SlamNodeConfig};
pub use state::{JointState, LandmarkRecord};
