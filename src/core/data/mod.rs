//! Module containing the sparse data structures and the preparation of the
//! domain matrices

pub mod domain;
pub mod sparse_structures;
