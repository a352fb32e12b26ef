//! Auto-differentiation.
//!
//! Computations on [`reverse::Var`] are recorded on a [`reverse::Tape`] and can then be
//! differentiated with [`reverse::Var::gradients`].

mod ops;
pub mod reverse;

pub use reverse::{Gradients, Tape, Var};
