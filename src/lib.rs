#![cfg_attr(docsrs, feature(doc_cfg))]
//! # mesh-adapt
//!
//! mesh-adapt adapts distributed triangle and tetrahedral meshes to an
//! anisotropic metric field. A metric tensor per vertex states the desired
//! edge lengths by direction; adaptation refines, coarsens, swaps and moves
//! until edges measure about one in that metric, while element fields are
//! carried over with optional conservation of integrals and momentum.
//!
//! ## Features
//! - Metric generation from Hessian, given, implied, proximity and curvature
//!   sources, with length clamping, gradation and element-count limiting
//! - Cavity-based refine, coarsen, swap and vertex-move operators with
//!   quality and volume guards
//! - Field transfer (inherit, linear interpolation, metric interpolation,
//!   conservative density, momentum-corrected velocity, pointwise)
//! - Pluggable communication backends (serial, Rayon threads, MPI) behind a
//!   single [`Communicator`](crate::algs::communicator::Communicator) trait
//! - Parameter-tree configuration loadable from any serde format
//!
//! ## Determinism
//!
//! Candidate selection is ordered by priority and global id, never by thread
//! or message timing, so repeated runs on the same partition produce the
//! same mesh.
//!
//! ## Usage
//!
//! ```toml
//! [dependencies]
//! mesh-adapt = "0.1"
//! # Optional features:
//! # features = ["mpi-support", "rayon"]
//! ```
//!
//! ```
//! use mesh_adapt::prelude::*;
//!
//! let mut mesh = build_box(NoComm, 2, [1.0, 1.0, 0.0], [2, 2, 0]).unwrap();
//! let mut input = MetricInput::default();
//! input.add_source(MetricSource::new(MetricSourceKind::Implied, false, ""));
//! input.should_limit_lengths = true;
//! input.max_length = 0.25;
//! generate_metric(&mut mesh, &input).unwrap();
//! let report = adapt(&mut mesh, &AdaptOpts::default()).unwrap();
//! assert!(report.refined > 0);
//! ```

pub mod adapt;
pub mod algs;
pub mod config;
pub mod data;
pub mod debug_invariants;
pub mod geometry;
pub mod mesh_error;
pub mod metric;
pub mod partitioning;
pub mod topology;
pub mod transfer;

pub use debug_invariants::DebugInvariants;

/// A convenient prelude to import the most-used traits & types:
pub mod prelude {
    pub use crate::adapt::{adapt, adapt_with_metric_input, AdaptOpts, AdaptReport, Verbosity};
    pub use crate::algs::communicator::{Communicator, NoComm, RayonComm};
    #[cfg(feature = "mpi-support")]
    pub use crate::algs::communicator::MpiComm;
    pub use crate::algs::meshgen::build_box;
    pub use crate::config::{
        update_adapt_opts, update_metric_input, update_transfer_opts, ConfigError, ParamList, ParamValue,
    };
    pub use crate::data::tags::{TagSet, TagValue};
    pub use crate::debug_invariants::DebugInvariants;
    pub use crate::mesh_error::{ConvergenceFailure, MeshAdaptError};
    pub use crate::metric::{generate_metric, MetricInput, MetricOutput, MetricSource, MetricSourceKind};
    pub use crate::partitioning::PartitionPolicy;
    pub use crate::topology::classify::classify_by_angles;
    pub use crate::topology::mesh::{Mesh, METRIC};
    pub use crate::topology::point::GlobalId;
    pub use crate::transfer::{TransferOpts, TransferPolicy, VarCompareOpts};
}
