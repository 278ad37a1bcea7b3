//! Core of the coupled factorisation: errors, parameters, dense helpers,
//! sparse data structures and the factorisation methods

pub mod base;
pub mod data;
pub mod error;
pub mod methods;
pub mod params;
