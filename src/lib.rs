//! Adaptive spatial structures for meshing closed-form implicit surfaces.
//!
//! The pipeline runs in three stages:
//!
//! - A [`context::Context`] holds a deduplicated math expression
//!   representing the scalar field (negative inside, positive outside).
//! - An [`eval::Evaluator`] backend evaluates that field over boxes
//!   (interval arithmetic) and batches of points (values and gradients),
//!   specializing itself per spatial branch via scoped `push`/`pop` frames.
//!   [`eval::VmEvaluator`] is the built-in interpreted backend.
//! - [`mesh::XTree`] recursively subdivides a [`mesh::Region`], placing one
//!   vertex per surface cell by QEF minimization and collapsing subtrees
//!   where doing so is topologically safe and numerically negligible.
//!
//! ```
//! use isotree::{eval::VmEvaluator, context::Context, mesh::{CellType, Region, XTree}};
//! use nalgebra::Vector2;
//!
//! // A circle of radius 0.5, evaluated on the z = 0 plane
//! let mut ctx = Context::new();
//! let (x, y, _) = ctx.axes();
//! let x2 = ctx.square(x)?;
//! let y2 = ctx.square(y)?;
//! let r2 = ctx.add(x2, y2)?;
//! let r = ctx.sqrt(r2)?;
//! let half = ctx.constant(0.5);
//! let circle = ctx.sub(r, half)?;
//!
//! let mut eval = VmEvaluator::new(&ctx, circle)?;
//! let region = Region::<2>::with_perp(
//!     Vector2::new(-1.0, -1.0),
//!     Vector2::new(1.0, 1.0),
//!     &[0.0],
//! );
//! let tree = XTree::build(&mut eval, region);
//! assert_eq!(tree.cell_type(), CellType::Ambiguous);
//! assert!(tree.is_branch());
//! # Ok::<(), isotree::Error>(())
//! ```
pub mod context;
pub mod eval;
pub mod mesh;
pub mod types;

mod error;
pub use error::Error;
