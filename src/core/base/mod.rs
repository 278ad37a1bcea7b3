//! Dense matrix helpers shared by the factorisation methods

pub mod utils;
