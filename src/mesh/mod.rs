//! Adaptive cell trees for Dual Contouring
//!
//! This module implements the spatial half of
//! [Dual Contouring](https://www.cs.rice.edu/~jwarren/papers/dualcontour.pdf):
//! an octree (or quadtree) which classifies cells against an implicit
//! surface, positions one vertex per surface cell by minimizing a quadric
//! error function, and merges subtrees bottom-up where the merged QEF stays
//! accurate and the merge cannot change surface topology (per the
//! simplification rules of Ju et al. 2002).
//!
//! The output is a tree of [`XTree`] cells; walking its dual to emit
//! triangles or contour segments is left to downstream consumers, which
//! traverse the finished tree through its accessor methods.
mod cell;
mod qef;
mod region;
mod xtree;

pub use cell::CellType;
pub use qef::{QefSolution, QuadraticErrorSolver, EIGENVALUE_CUTOFF};
pub use region::Region;
pub use xtree::{XTree, MAX_COLLAPSE_ERROR, MIN_CELL_VOLUME};
