//! Parallel consistency layer: communicators, collectives, wire records,
//! global ids, migration and ghosting, plus the box mesh generator.

pub mod communicator;
pub mod exchange;
pub mod ghost;
pub mod global_ids;
pub mod meshgen;
pub mod migrate;
pub mod wire;

pub use communicator::{CommTag, Communicator, NoComm};
pub use meshgen::build_box;
