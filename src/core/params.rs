use serde::Deserialize;

use crate::core::error::NmfError;
use crate::core::methods::joint_nmf::JointFactors;

///////////
// Enums //
///////////

/// How the observation axis is split into minibatches
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchSize {
    /// One batch holding all observations in their input order
    Full,
    /// `floor(2^log10(N) * 128)` observations per batch
    Heuristic,
    /// Fixed number of observations per batch
    Fixed(usize),
}

impl BatchSize {
    /// Resolve the batch size for `n_obs` observations
    ///
    /// ### Returns
    ///
    /// Number of observations per batch, capped at `n_obs`.
    pub fn resolve(&self, n_obs: usize) -> usize {
        let size = match self {
            BatchSize::Full => n_obs,
            BatchSize::Heuristic => heuristic_batch_size(n_obs),
            BatchSize::Fixed(n) => *n,
        };
        size.clamp(1, n_obs.max(1))
    }
}

/// Default minibatch size heuristic
///
/// Grows sub-linearly with the number of observations.
pub fn heuristic_batch_size(n_obs: usize) -> usize {
    if n_obs == 0 {
        return 1;
    }
    let size = 2_f64.powf((n_obs as f64).log10()) * 128.0;
    (size.floor() as usize).max(1)
}

/// Strategy to build the initial joint factors
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitStrategy {
    /// Seed W1, W2 and H from the single-domain factorisations
    WarmStart,
    /// Random factors, augmented with per-batch mean columns and one-hot
    /// batch indicator rows when batch labels are supplied
    #[default]
    BatchAwareRandom,
    /// Use the supplied factors (rank K, no batch augmentation)
    #[serde(skip)]
    Custom(JointFactors),
}

////////////
// Params //
////////////

/// Parameters of the joint multiplicative-update solver
///
/// ### Fields
///
/// * `max_iter` - Outer iteration budget.
/// * `batch_size` - Minibatch strategy over the observation axis.
/// * `tol` - Optional relative improvement threshold for early stopping.
/// * `loss_every` - Spacing of the loss checkpoints in outer iterations.
/// * `track_loss` - Record loss checkpoints even without early stopping.
/// * `seed` - Seed of the minibatch permutation.
/// * `verbose` - Report iteration progress at info level.
#[derive(Debug, Clone, PartialEq)]
pub struct SolverParams {
    pub max_iter: usize,
    pub batch_size: BatchSize,
    pub tol: Option<f64>,
    pub loss_every: usize,
    pub track_loss: bool,
    pub seed: u64,
    pub verbose: bool,
}

impl Default for SolverParams {
    fn default() -> Self {
        Self {
            max_iter: 50,
            batch_size: BatchSize::Heuristic,
            tol: None,
            loss_every: 20,
            track_loss: false,
            seed: 42,
            verbose: false,
        }
    }
}

impl SolverParams {
    /// Check the parameter ranges
    pub fn validate(&self) -> Result<(), NmfError> {
        if let BatchSize::Fixed(0) = self.batch_size {
            return Err(NmfError::invalid_param("batch_size", "must be at least 1"));
        }
        if self.loss_every == 0 {
            return Err(NmfError::invalid_param("loss_every", "must be at least 1"));
        }
        if let Some(tol) = self.tol {
            if !tol.is_finite() || tol <= 0.0 {
                return Err(NmfError::invalid_param(
                    "tol",
                    format!("must be finite and > 0, got {}", tol),
                ));
            }
        }
        Ok(())
    }
}

/// Parameters of the full coupled NMF run
///
/// Missing fields fall back to their defaults when deserialising.
///
/// ### Fields
///
/// * `k` - Target rank.
/// * `feature_cutperc` - Minimum fraction of observations a feature must be
///   present in.
/// * `max_iter` - Outer iterations of the joint solver.
/// * `init_max_iter` - Iterations of each single-domain NMF.
/// * `init_tol` - Optional early exit tolerance of the single-domain NMF.
/// * `beta` - Scaling of the balance parameter.
/// * `lambda1` - Fixed balance parameter; skips the estimator if set.
/// * `batch_size` - Minibatch strategy.
/// * `tol` - Optional early stopping tolerance of the joint solver.
/// * `loss_every` - Spacing of the loss checkpoints.
/// * `track_loss` - Record loss checkpoints without early stopping.
/// * `init` - Initial factor strategy.
/// * `seed` - Seed for all random components.
/// * `verbose` - Report progress at info level.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoupledNmfParams {
    pub k: usize,
    pub feature_cutperc: f64,
    pub max_iter: usize,
    pub init_max_iter: usize,
    pub init_tol: Option<f64>,
    pub beta: f64,
    pub lambda1: Option<f64>,
    pub batch_size: BatchSize,
    pub tol: Option<f64>,
    pub loss_every: usize,
    pub track_loss: bool,
    pub init: InitStrategy,
    pub seed: u64,
    pub verbose: bool,
}

impl Default for CoupledNmfParams {
    fn default() -> Self {
        let solver = SolverParams::default();
        Self {
            k: 100,
            feature_cutperc: 0.01,
            max_iter: solver.max_iter,
            init_max_iter: 200,
            init_tol: None,
            beta: 1.0,
            lambda1: None,
            batch_size: solver.batch_size,
            tol: solver.tol,
            loss_every: solver.loss_every,
            track_loss: solver.track_loss,
            init: InitStrategy::default(),
            seed: solver.seed,
            verbose: solver.verbose,
        }
    }
}

impl CoupledNmfParams {
    /// Parse the parameters from a JSON string
    ///
    /// ### Params
    ///
    /// * `json` - JSON object; absent keys use the defaults.
    ///
    /// ### Returns
    ///
    /// The validated `CoupledNmfParams`.
    pub fn from_json(json: &str) -> Result<Self, NmfError> {
        let params: Self = serde_json::from_str(json)?;
        params.validate()?;
        Ok(params)
    }

    /// The subset of parameters driving the joint solver
    pub fn solver_params(&self) -> SolverParams {
        SolverParams {
            max_iter: self.max_iter,
            batch_size: self.batch_size,
            tol: self.tol,
            loss_every: self.loss_every,
            track_loss: self.track_loss,
            seed: self.seed,
            verbose: self.verbose,
        }
    }

    /// Check the parameter ranges that do not depend on the data
    pub fn validate(&self) -> Result<(), NmfError> {
        if self.k == 0 {
            return Err(NmfError::invalid_param("k", "must be at least 1"));
        }
        if !self.feature_cutperc.is_finite() || self.feature_cutperc < 0.0 {
            return Err(NmfError::invalid_param(
                "feature_cutperc",
                format!("must be finite and >= 0, got {}", self.feature_cutperc),
            ));
        }
        if !self.beta.is_finite() || self.beta <= 0.0 {
            return Err(NmfError::invalid_param(
                "beta",
                format!("must be finite and > 0, got {}", self.beta),
            ));
        }
        if let Some(lambda1) = self.lambda1 {
            if !lambda1.is_finite() || lambda1 <= 0.0 {
                return Err(NmfError::invalid_param(
                    "lambda1",
                    format!("must be finite and > 0, got {}", lambda1),
                ));
            }
        }
        if let Some(tol) = self.init_tol {
            if !tol.is_finite() || tol <= 0.0 {
                return Err(NmfError::invalid_param(
                    "init_tol",
                    format!("must be finite and > 0, got {}", tol),
                ));
            }
        }
        self.solver_params().validate()
    }
}

///////////
// Tests //
///////////
