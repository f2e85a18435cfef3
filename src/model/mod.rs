pub mod action;
pub mod banner;
pub mod limits;
pub mod targeting;
pub mod timetable;

pub use action::Action;
pub use banner::{Banner, Image, Tier, Tiered, TrackerInfo, Window};
pub use limits::{Budget, Capping, Limit, Metric};
pub use targeting::Targeting;
pub use timetable::Timetable;
