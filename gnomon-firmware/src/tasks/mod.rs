//! Embassy tasks for the follower node

mod bus;
mod motion;

pub use bus::{bus_task, DirectionGate};
pub use motion::motion_task;
