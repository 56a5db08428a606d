//! Mesh topology: simplex templates, entity arenas, ownership and the local
//! modification operators.
//!
//! The operators (`refine`, `coarsen`, `swap`, `motion`) are pure functions
//! of an [`cavity::AdaptView`]; they return an [`cavity::EditPlan`] or a
//! [`cavity::Rejection`] and never touch the mesh themselves.

pub mod cavity;
pub mod classify;
pub mod coarsen;
pub mod mesh;
pub mod motion;
pub mod ownership;
pub mod point;
pub mod refine;
pub mod simplex;
pub mod swap;

pub use cavity::{AdaptView, EditPlan, OpKind, Rejection};
pub use mesh::Mesh;
pub use point::GlobalId;
