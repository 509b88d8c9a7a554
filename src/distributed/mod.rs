pub mod comm_scheduler;
pub mod comm_utils;
pub mod local_group;
pub mod process_group;

pub use comm_scheduler::{AllGatherComm, CommScheduler, RING_TAG_SPAN, RingComm};
pub use local_group::LocalProcessGroup;
pub use process_group::{CommWork, CommunicatorProcessGroup, ProcessGroup};
