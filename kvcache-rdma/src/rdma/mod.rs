mod context;
mod mr;
mod qp;
mod work;

pub use context::{PortInfo, RdmaContext, device_names};
pub use mr::{ForeignRegion, MrRegistry, RegionIndex, RegisteredBuffer};
pub use qp::QueuePair;
pub use work::{SendChain, WriteSegment};
