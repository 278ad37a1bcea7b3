//! Single-domain and coupled NMF, the balance estimator and the initial
//! factor strategies

pub mod balance;
pub mod coupled_nmf;
pub mod initialisation;
pub mod joint_nmf;
pub mod nmf;
