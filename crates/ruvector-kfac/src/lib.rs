//! # RuVector K-FAC
//!
//! Kronecker-factored Fisher blocks for second-order (natural gradient)
//! optimization of neural networks.
//!
//! Each layer gets a [`FisherBlock`] approximating its block of the Fisher
//! information matrix. Kronecker-factored blocks use
//!
//! ```text
//! F_layer ≈ E[a aᵀ] ⊗ E[g gᵀ]
//! ```
//!
//! for layer inputs `a` and output gradients `g`, so the damped inverse only
//! needs the inverses of the two small factors.
//!
//! ## Modules
//!
//! - **Linear operators**: diagonal, dense and Kronecker-product operators
//! - **Factors**: moving-average covariance statistics with cached damped
//!   inverses, shared between blocks through a [`FactorRegistry`]
//! - **Blocks**: naive, diagonal and Kronecker-factored blocks for dense,
//!   sequence, multi-use, convolutional and depthwise layers
//! - **Damping**: π-tracenorm split of a damping term across two factors
//! - **Packing**: conversions between parameter tensors, flat columns and
//!   the 2-D `[in(+1), out]` layer form
//!
//! ## Lifecycle
//!
//! ```text
//! register_additional_tower ─▶ instantiate_factors ─▶ register_inverse
//!                                                          │
//!        multiply_inverse ◀── make_inverse_updates ◀── make_covariance_updates
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use ndarray::array;
//! use ruvector_kfac::prelude::*;
//!
//! let registry = FactorRegistry::with_config(FactorConfig::default())?;
//!
//! // One dense layer, 2 inputs -> 1 output, batch of 2
//! let inputs = Tensor::from(array![[1.0, 0.0], [0.0, 2.0]]);
//! let outputs = Tensor::from(array![[0.5], [-1.0]]);
//! let mut block = FullyConnectedKFACBasicFB::new(&registry, false);
//! block.register_additional_tower(inputs, outputs)?;
//!
//! // Gradients of the loss w.r.t. the outputs, supplied by the host
//! let grads = Tensor::from(array![[0.1], [0.2]]);
//! block.instantiate_factors(&[vec![vec![grads]]], 1e-3)?;
//! block.register_inverse()?;
//!
//! registry.make_covariance_updates_default()?;
//! registry.make_inverse_updates()?;
//!
//! let gradient = Params::Weight(array![[1.0], [1.0]].into_dyn());
//! let step = block.multiply_inverse(&gradient)?;
//! assert_eq!(step.weight().shape(), &[2, 1]);
//! # Ok::<(), ruvector_kfac::KfacError>(())
//! ```
//!
//! ## References
//!
//! - Martens & Grosse (2015): "Optimizing Neural Networks with
//!   Kronecker-factored Approximate Curvature"
//! - Grosse & Martens (2016): "A Kronecker-factored approximate Fisher matrix
//!   for convolution layers"

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod blocks;
pub mod config;
pub mod damping;
pub mod error;
pub mod factors;
pub mod linear_operator;
pub mod params;
pub mod patches;
pub mod registry;
pub mod tensor;
pub mod utils;

// Re-exports for convenience
pub use blocks::{
    ConvDiagonalFB, ConvKFCBasicFB, DepthwiseConvKFCBasicFB, FisherBlock,
    FullyConnectedDiagonalFB, FullyConnectedKFACBasicFB, FullyConnectedMultiIndepFB,
    FullyConnectedSeriesFB, NaiveDiagonalFB, NaiveFullFB,
};
pub use config::FactorConfig;
pub use damping::{
    compute_pi_adjusted_damping, compute_pi_tracenorm, normalize_damping, Damping, FactorSide,
};
pub use error::{KfacError, Result};
pub use factors::{
    CovLayout, Factor, FactorId, FactorKey, FactorKind, FactorRef, FactorSpec, FactorTower,
    MovingAverage, RowSource,
};
pub use linear_operator::LinearOperator;
pub use params::{
    column_to_tensors, layer_params_to_mat2d, mat2d_to_layer_params, tensors_to_column, Params,
};
pub use patches::{ConvGeometry, Padding};
pub use registry::FactorRegistry;
pub use tensor::{Input, SparseRows, Tensor, TensorId};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::blocks::*;
    pub use crate::config::*;
    pub use crate::damping::*;
    pub use crate::error::*;
    pub use crate::factors::*;
    pub use crate::linear_operator::*;
    pub use crate::params::*;
    pub use crate::patches::*;
    pub use crate::registry::*;
    pub use crate::tensor::*;
}
