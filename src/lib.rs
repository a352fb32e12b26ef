//! Permutation-invariant regression on variable-size sets.
//!
//! Sets of vectors are generated ([`dataset`]), packed into fixed-size padded batches with a sparse
//! incidence relation from set slots to element slots ([`batch`], [`tensor::sparse`]), and fed to
//! a deep-set model ([`nn`]) trained with Adam ([`optim`], [`train`]). The hyperparameters of the
//! model are tuned by a resumable search whose trials live in SQLite ([`search`]).

#![deny(unsafe_code, rust_2018_idioms, rust_2021_compatibility)]
#![warn(missing_docs)]

pub mod autodiff;
pub mod batch;
pub mod config;
pub mod dataset;
pub mod nn;
pub mod optim;
pub mod search;
pub mod tensor;
pub mod train;
