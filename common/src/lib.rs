pub mod cloud;
pub mod math;

pub use cloud::{Aabb, PointCloud};
