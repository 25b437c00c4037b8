//! This library implements the core of a distributed spatial simulation
//! substrate.
//!
//! A rectangular domain is recursively split into leaf regions, each owned
//! by exactly one participating process. The [`PartitionTree`] is the single
//! source of truth for geometry and neighbor topology. On top of it this
//! crate provides:
//!
//! - [`HaloField`], per-process storage padded with ghost cells that are
//!   kept in sync with neighboring processes, over dense grids or objects
//!   at continuous locations,
//! - [`Rebalancer`], which measures load and moves partition boundaries
//!   using an all-or-nothing commit protocol,
//! - [`Migrator`], which routes entities that crossed a boundary to their
//!   new owner, possibly over multiple hops,
//! - [`Registry`], a lazily synchronized cross-process name map,
//! - [`Inspector`], a read-only query surface for debugging and
//!   visualization tools.
//!
//! # Communication
//!
//! All cross-process operations are blocking collectives expressed in terms
//! of the [`Communicator`] trait. This library only ships an in-process
//! implementation, [`LocalCluster`], which runs every participant on its own
//! thread. For an implementation working over the network see `dspace-net`.
//!
//! ## Example
//!
//! ```ignore
//! use dspace_core::{LocalCluster, Partition, PartitionTree, Region};
//!
//! let results = LocalCluster::run(4, |mut comm| {
//!     let domain = Region::new(vec![0, 0], vec![100, 100])?;
//!     let tree = PartitionTree::uniform(domain, 1, 4)?;
//!     let partition = Partition::new(tree, 2, false, &mut comm)?;
//!     Ok(partition.neighbors().to_vec())
//! });
//! ```
//!
//! [`PartitionTree`]: tree/struct.PartitionTree.html
//! [`HaloField`]: halo/struct.HaloField.html
//! [`Rebalancer`]: balance/struct.Rebalancer.html
//! [`Migrator`]: migrate/struct.Migrator.html
//! [`Registry`]: registry/struct.Registry.html
//! [`Inspector`]: query/struct.Inspector.html
//! [`Communicator`]: comm/trait.Communicator.html
//! [`LocalCluster`]: comm/local/struct.LocalCluster.html

#[macro_use]
extern crate serde;
#[macro_use]
extern crate log;

// reexports
pub use balance::Rebalancer;
pub use comm::local::LocalCluster;
pub use comm::{Communicator, Tag};
pub use config::Config;
pub use error::{Error, Result};
pub use geom::Region;
pub use halo::{ContinuousStorage, FieldStorage, GridStorage, HaloField};
pub use migrate::{MigratingEntity, Migrator};
pub use partition::{CommitHook, CommitOutcome, Partition};
pub use query::{Inspector, RemoteQuery};
pub use registry::Registry;
pub use sched::{EventQueue, Scheduler};
pub use tree::{BalanceAction, PartitionTree};

pub mod balance;
pub mod comm;
pub mod config;
pub mod error;
pub mod geom;
pub mod halo;
pub mod migrate;
pub mod partition;
pub mod query;
pub mod registry;
pub mod sched;
pub mod tree;

pub mod util;

pub const VERSION: &'static str = env!("CARGO_PKG_VERSION");

/// Integer coordinate type used for all grid geometry.
pub type Coord = i64;

/// Process identifier, also the index of the leaf owned by that process.
pub type Pid = usize;

/// Index of a node within the partition tree arena.
pub type NodeId = usize;
