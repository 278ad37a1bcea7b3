use faer::{Mat, MatRef};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::core::base::utils::{
    multiplicative_update, residual_sq, scatter_columns, select_columns,
};
use crate::core::data::domain::{validate_domain, validate_pair};
use crate::core::data::sparse_structures::{CompressedSparseData, CompressedSparseFormat};
use crate::core::error::NmfError;
use crate::core::methods::initialisation::validate_factors;
use crate::core::params::{BatchSize, SolverParams};
use crate::ensure_finite;

////////////////
// Structures //
////////////////

/// Factor matrices of the joint model
///
/// `O ≈ W1 * H` and `X ≈ W2 * H` with `O`, `X` the features x observations
/// views of both domains.
///
/// ### Fields
///
/// * `w1` - Basis of domain 1 (features_1 x rank)
/// * `w2` - Basis of domain 2 (features_2 x rank)
/// * `h` - Shared coefficients (rank x observations)
#[derive(Debug, Clone)]
pub struct JointFactors {
    pub w1: Mat<f64>,
    pub w2: Mat<f64>,
    pub h: Mat<f64>,
}

/// Disjoint partition of the observation axis into minibatches
///
/// ### Fields
///
/// * `batches` - Observation indices of every batch.
#[derive(Debug, Clone, PartialEq)]
pub struct MinibatchPartition {
    pub batches: Vec<Vec<usize>>,
}

/// Summary of a solver run
///
/// ### Fields
///
/// * `iterations` - Outer iterations performed by this call.
/// * `total_iterations` - Outer iterations performed since construction.
/// * `converged` - Whether the early stopping criterion fired.
/// * `loss_history` - `(iteration, joint loss)` checkpoints.
#[derive(Debug, Clone, PartialEq)]
pub struct SolverReport {
    pub iterations: usize,
    pub total_iterations: usize,
    pub converged: bool,
    pub loss_history: Vec<(usize, f64)>,
}

//////////////////
// Partitioning //
//////////////////

impl MinibatchPartition {
    /// Generate the minibatch partition
    ///
    /// `BatchSize::Full` keeps all observations in their input order in one
    /// batch. Otherwise the observations are permuted once and cut into
    /// `ceil(N / batch_size)` contiguous batches.
    ///
    /// ### Params
    ///
    /// * `n_obs` - Number of observations
    /// * `batch_size` - Minibatch strategy
    /// * `seed` - Seed of the permutation
    ///
    /// ### Returns
    ///
    /// The `MinibatchPartition`.
    pub fn new(n_obs: usize, batch_size: BatchSize, seed: u64) -> Self {
        if let BatchSize::Full = batch_size {
            return Self {
                batches: vec![(0..n_obs).collect()],
            };
        }

        let size = batch_size.resolve(n_obs);
        let mut order: Vec<usize> = (0..n_obs).collect();
        let mut rng = StdRng::seed_from_u64(seed);
        order.shuffle(&mut rng);

        Self {
            batches: order.chunks(size).map(|chunk| chunk.to_vec()).collect(),
        }
    }

    /// Number of batches
    pub fn len(&self) -> usize {
        self.batches.len()
    }

    /// Is the partition empty
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}

//////////////////////
// Update equations //
//////////////////////

impl JointFactors {
    /// Rank of the factorisation
    pub fn rank(&self) -> usize {
        self.h.nrows()
    }

    /// One multiplicative update of H, W1 and W2 restricted to a minibatch
    ///
    /// ```text
    /// H_b <- H_b * (W1ᵗO_b + λ W2ᵗX_b) / ((W1ᵗW1 + λ W2ᵗW2) H_b + ε)
    /// W1  <- W1 * (O_b H_bᵗ) / (W1 H_b H_bᵗ + ε)
    /// W2  <- W2 * (X_b H_bᵗ) / (W2 H_b H_bᵗ + ε)
    /// ```
    ///
    /// ### Params
    ///
    /// * `batch` - Observation indices of the batch
    /// * `o_b` - Dense block of domain 1 (features_1 x batch)
    /// * `x_b` - Dense block of domain 2 (features_2 x batch)
    /// * `lambda1` - Balance parameter
    /// * `iteration` - 1-based outer iteration, used in error reports
    ///
    /// ### Returns
    ///
    /// `NumericalInstability` if any updated factor turns non-finite.
    pub fn update_batch(
        &mut self,
        batch: &[usize],
        o_b: MatRef<f64>,
        x_b: MatRef<f64>,
        lambda1: f64,
        iteration: usize,
    ) -> Result<(), NmfError> {
        let mut h_b = select_columns(self.h.as_ref(), batch);

        let wt_o = self.w1.transpose() * o_b;
        let wt_x = self.w2.transpose() * x_b;
        let numer_h = Mat::from_fn(h_b.nrows(), h_b.ncols(), |i, j| {
            wt_o[(i, j)] + lambda1 * wt_x[(i, j)]
        });

        let gram_1 = self.w1.transpose() * &self.w1;
        let gram_2 = self.w2.transpose() * &self.w2;
        let gram = Mat::from_fn(gram_1.nrows(), gram_1.ncols(), |i, j| {
            gram_1[(i, j)] + lambda1 * gram_2[(i, j)]
        });
        let denom_h = &gram * &h_b;

        multiplicative_update(&mut h_b, numer_h.as_ref(), denom_h.as_ref());
        ensure_finite!(h_b, iteration, "H");
        scatter_columns(&mut self.h, h_b.as_ref(), batch);

        let hh = &h_b * h_b.transpose();

        let numer_w1 = o_b * h_b.transpose();
        let denom_w1 = &self.w1 * &hh;
        multiplicative_update(&mut self.w1, numer_w1.as_ref(), denom_w1.as_ref());
        ensure_finite!(self.w1, iteration, "W1");

        let numer_w2 = x_b * h_b.transpose();
        let denom_w2 = &self.w2 * &hh;
        multiplicative_update(&mut self.w2, numer_w2.as_ref(), denom_w2.as_ref());
        ensure_finite!(self.w2, iteration, "W2");

        Ok(())
    }
}

////////////
// Solver //
////////////

/// Joint multiplicative-update solver
///
/// Owns the factor matrices, the minibatch partition and the iteration
/// counter. `run()` can be called repeatedly; the partition is drawn once at
/// construction, so `run(n)` followed by `run(m)` matches `run(n + m)`.
///
/// ### Fields
///
/// * `matrix_1` - First domain (observations x features_1, CSR)
/// * `matrix_2` - Second domain (observations x features_2, CSR)
/// * `factors` - Current factor matrices
/// * `lambda1` - Balance parameter
/// * `params` - Solver parameters
/// * `partition` - The minibatch partition
/// * `dense_blocks` - Cached dense blocks when there is only one batch
/// * `iteration` - Outer iterations performed so far
/// * `loss_history` - Loss checkpoints
/// * `converged` - Whether early stopping fired
#[derive(Debug)]
pub struct JointNmfSolver<'a> {
    matrix_1: &'a CompressedSparseData<f64>,
    matrix_2: &'a CompressedSparseData<f64>,
    factors: JointFactors,
    lambda1: f64,
    params: SolverParams,
    partition: MinibatchPartition,
    dense_blocks: Option<(Mat<f64>, Mat<f64>)>,
    iteration: usize,
    loss_history: Vec<(usize, f64)>,
    converged: bool,
}

impl<'a> JointNmfSolver<'a> {
    /// Set up a new solver
    ///
    /// ### Params
    ///
    /// * `matrix_1` - First domain, observations x features_1 in CSR layout
    /// * `matrix_2` - Second domain, observations x features_2 in CSR layout
    /// * `init` - Initial, non-negative factors of any rank
    /// * `lambda1` - Balance parameter (finite, >= 0)
    /// * `params` - Solver parameters
    ///
    /// ### Returns
    ///
    /// The solver, ready to `run()`.
    pub fn new(
        matrix_1: &'a CompressedSparseData<f64>,
        matrix_2: &'a CompressedSparseData<f64>,
        init: JointFactors,
        lambda1: f64,
        params: SolverParams,
    ) -> Result<Self, NmfError> {
        params.validate()?;
        for (name, m) in [("domain 1", matrix_1), ("domain 2", matrix_2)] {
            if m.cs_type != CompressedSparseFormat::Csr {
                return Err(NmfError::invalid_input(
                    name,
                    "the solver expects observations x features in CSR layout",
                ));
            }
            validate_domain(name, m)?;
        }
        validate_pair(matrix_1, matrix_2)?;
        if !lambda1.is_finite() || lambda1 < 0.0 {
            return Err(NmfError::invalid_param(
                "lambda1",
                format!("must be finite and >= 0, got {}", lambda1),
            ));
        }

        let n_obs = matrix_1.nrows();
        validate_factors(
            &init,
            matrix_1.ncols(),
            matrix_2.ncols(),
            n_obs,
            init.rank(),
        )?;

        let partition = MinibatchPartition::new(n_obs, params.batch_size, params.seed);
        let dense_blocks = if partition.len() == 1 {
            let batch = &partition.batches[0];
            Some((
                matrix_1.dense_rows_transposed(batch),
                matrix_2.dense_rows_transposed(batch),
            ))
        } else {
            None
        };

        Ok(Self {
            matrix_1,
            matrix_2,
            factors: init,
            lambda1,
            params,
            partition,
            dense_blocks,
            iteration: 0,
            loss_history: Vec::new(),
            converged: false,
        })
    }

    /// Current factors
    pub fn factors(&self) -> &JointFactors {
        &self.factors
    }

    /// Consume the solver and return the factors
    pub fn into_factors(self) -> JointFactors {
        self.factors
    }

    /// The balance parameter
    pub fn lambda1(&self) -> f64 {
        self.lambda1
    }

    /// Outer iterations performed so far
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    /// The minibatch partition
    pub fn partition(&self) -> &MinibatchPartition {
        &self.partition
    }

    /// Joint reconstruction loss
    ///
    /// `||O - W1 H||² + λ ||X - W2 H||²`, accumulated batch by batch.
    pub fn joint_loss(&self) -> f64 {
        self.partition
            .batches
            .iter()
            .map(|batch| {
                let h_b = select_columns(self.factors.h.as_ref(), batch);
                let (loss_1, loss_2) = match &self.dense_blocks {
                    Some((o_b, x_b)) => (
                        residual_sq(o_b.as_ref(), self.factors.w1.as_ref(), h_b.as_ref()),
                        residual_sq(x_b.as_ref(), self.factors.w2.as_ref(), h_b.as_ref()),
                    ),
                    None => {
                        let o_b = self.matrix_1.dense_rows_transposed(batch);
                        let x_b = self.matrix_2.dense_rows_transposed(batch);
                        (
                            residual_sq(o_b.as_ref(), self.factors.w1.as_ref(), h_b.as_ref()),
                            residual_sq(x_b.as_ref(), self.factors.w2.as_ref(), h_b.as_ref()),
                        )
                    }
                };
                loss_1 + self.lambda1 * loss_2
            })
            .sum()
    }

    /// Run the solver for the configured `max_iter` iterations
    pub fn fit(&mut self) -> Result<SolverReport, NmfError> {
        self.run(self.params.max_iter)
    }

    /// Run the solver for `n_iter` outer iterations
    ///
    /// Every outer iteration visits all minibatches sequentially; the bases
    /// are therefore updated once per batch. Loss checkpoints are taken
    /// every `loss_every` iterations if early stopping or loss tracking is
    /// enabled. Once early stopping has fired, further calls return
    /// immediately.
    ///
    /// ### Params
    ///
    /// * `n_iter` - Number of outer iterations
    ///
    /// ### Returns
    ///
    /// The `SolverReport` or `NumericalInstability` if an update broke down.
    #[instrument(skip_all, fields(n_iter = n_iter))]
    pub fn run(&mut self, n_iter: usize) -> Result<SolverReport, NmfError> {
        let start_run = Instant::now();
        let mut performed = 0;

        for _ in 0..n_iter {
            if self.converged {
                break;
            }

            let start_iter = Instant::now();
            let iteration = self.iteration + 1;

            for batch in &self.partition.batches {
                match &self.dense_blocks {
                    Some((o_b, x_b)) => self.factors.update_batch(
                        batch,
                        o_b.as_ref(),
                        x_b.as_ref(),
                        self.lambda1,
                        iteration,
                    )?,
                    None => {
                        let o_b = self.matrix_1.dense_rows_transposed(batch);
                        let x_b = self.matrix_2.dense_rows_transposed(batch);
                        self.factors.update_batch(
                            batch,
                            o_b.as_ref(),
                            x_b.as_ref(),
                            self.lambda1,
                            iteration,
                        )?
                    }
                }
            }

            self.iteration = iteration;
            performed += 1;

            if self.params.verbose {
                info!(
                    "Joint NMF iteration {} finished in {:.2?}",
                    iteration,
                    start_iter.elapsed()
                );
            } else {
                debug!(
                    iteration,
                    n_batches = self.partition.len(),
                    elapsed = ?start_iter.elapsed(),
                    "joint NMF iteration"
                );
            }

            let checkpoint = (self.params.tol.is_some() || self.params.track_loss)
                && iteration % self.params.loss_every == 0;
            if checkpoint {
                let loss = self.joint_loss();
                debug!(iteration, loss, "joint loss checkpoint");

                let previous = self.loss_history.last().map(|&(_, l)| l);
                self.loss_history.push((iteration, loss));

                if let (Some(tol), Some(previous)) = (self.params.tol, previous) {
                    if previous - loss < tol * previous.abs() {
                        warn!(
                            iteration,
                            previous, loss, "relative improvement below tolerance, stopping"
                        );
                        self.converged = true;
                    }
                }
            }
        }

        if self.params.verbose {
            info!(
                "Joint NMF: {} iterations in {:.2?}",
                performed,
                start_run.elapsed()
            );
        }

        Ok(SolverReport {
            iterations: performed,
            total_iterations: self.iteration,
            converged: self.converged,
            loss_history: self.loss_history.clone(),
        })
    }
}

///////////
// Tests //
///////////
