//! Schedule supervision and source arbitration
//!
//! [`ScheduleSupervisor`] decides which schedule window is active;
//! [`PriorityArbiter`] decides which source may be audible;
//! [`AnnouncementPlanner`] decides when recurring announcements fire.

pub mod announcer;
pub mod arbiter;
pub mod supervisor;

pub use announcer::AnnouncementPlanner;
pub use arbiter::{ArbiterAction, PriorityArbiter};
pub use supervisor::{ScheduleSupervisor, SupervisorAction, SupervisorState};
