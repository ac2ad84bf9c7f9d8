#![cfg_attr(not(feature = "std"), no_std)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Burn sharding propagation.
//!
//! Given an operator and the sharding of its operands, computes the sharding of its
//! results, or the input shardings the operands must be redistributed to first.

extern crate alloc;

mod cache;
mod config;
mod error;
mod output;
mod propagator;
mod schema;
mod tensor;

pub mod graph;
pub mod ops;
pub mod rules;
pub mod sharding;

pub use cache::*;
pub use config::*;
pub use error::*;
pub use output::*;
pub use propagator::*;
pub use schema::*;
pub use tensor::*;
