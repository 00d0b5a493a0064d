pub mod remap;
pub mod topology;
pub mod types;

pub use remap::{LaneRemap, RemapCodec, RemapEncoding, RemapEntry, RemapValue};
pub use topology::{topology_for, Hbm2eTopology, Hbm3Topology, Topology};
pub use types::*;
