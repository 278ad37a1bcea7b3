//! Coupled non-negative matrix factorisation of two data domains that share
//! the same observations.
//!
//! Both domains are factorised as `Dᵗ ≈ W * H` with a shared coefficient
//! matrix `H`. The entry point is [`coupled_nmf`]; the [`JointNmfSolver`]
//! can also be driven directly with caller supplied factors.

pub mod core;
pub mod utils;

pub use crate::core::base::utils::{parse_embedding_norm, EmbeddingNorm};
pub use crate::core::data::domain::{prepare_domain, DomainMatrix};
pub use crate::core::data::sparse_structures::{CompressedSparseData, CompressedSparseFormat};
pub use crate::core::error::NmfError;
pub use crate::core::methods::balance::estimate_lambda;
pub use crate::core::methods::coupled_nmf::{coupled_nmf, CoupledNmfResult};
pub use crate::core::methods::joint_nmf::{
    JointFactors, JointNmfSolver, MinibatchPartition, SolverReport,
};
pub use crate::core::methods::nmf::{nmf_single_domain, SingleDomainNmf};
pub use crate::core::params::{BatchSize, CoupledNmfParams, InitStrategy, SolverParams};
