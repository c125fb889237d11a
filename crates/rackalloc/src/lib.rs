//! Bucketed tiny/small allocator built from magazines, regions and a
//! recirculation depot.
//!
//! A [`Rack`] serves one size class. Threads hash onto magazines; each
//! magazine carves size-aligned regions into quanta tracked by boundary tags
//! and segregated free lists. Sparse regions drift to a shared depot, where
//! their free pages go back to the OS.

#[cfg(not(target_pointer_width = "64"))]
compile_error!("rackalloc packs link words into 64-bit pointers and needs a 64-bit target");

extern crate libc;

mod checksum;
pub mod config;
mod consistency;
pub mod fatal;
mod free_entry;
mod free_list;
pub mod introspect;
mod magazine;
pub mod platform;
mod rack;
mod region;
mod registry;
pub mod size_class;
mod stats;
pub mod sync;
mod tag;
pub mod util;

pub use config::{ConfigError, RackConfig};
pub use consistency::ConsistencyReport;
pub use rack::{Rack, RackError};
pub use region::Region;
pub use size_class::{Geometry, ParamsError, SizeClassParams, SMALL, TINY};
pub use stats::RackStats;
