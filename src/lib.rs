//! Approximate k-nearest-neighbor search over dense vectors with Prioritized
//! Dynamic Continuous Indexing
//!
//! The index projects every point onto a family of random unit directions and
//! keeps each one-dimensional projection sorted. Directions are grouped into
//! composite indices of simple indices; a query walks all projections at once
//! through per-composite priority queues, visiting points in order of their
//! projected distance to the query and stopping on configurable budgets. For
//! large datasets an optional coarse-to-fine hierarchy keeps the traversed
//! populations small.
//!
//! The dataset is borrowed, not copied: the index holds projections, sorted
//! tables and hierarchy structure, while point coordinates stay with the
//! caller in one column-major buffer.
//!
//! # Example
//!
//! ```
//! use dci::{Dci, QueryConfig};
//!
//! // Four points on the unit square, column-major with two rows per point.
//! let data = vec![0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 1.0, 1.0];
//! let mut index = Dci::builder()
//!     .comp_indices(2)
//!     .simp_indices(2)
//!     .seed(7)
//!     .build(2)?;
//! index.add(&data, 1, &QueryConfig::default())?;
//!
//! let exhaustive = QueryConfig {
//!     num_to_visit: usize::MAX,
//!     prop_to_retrieve: 1.0,
//!     ..QueryConfig::default()
//! };
//! let found = index.query(&[0.1, 0.1], 1, &exhaustive)?;
//! assert_eq!(found[0][0].id.into_inner(), 0);
//! # Ok::<(), dci::DciError>(())
//! ```

use std::ops;

#[cfg(feature = "indicatif")]
use indicatif::ProgressBar;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use rayon::iter::{IntoParallelIterator, ParallelIterator};

mod hierarchy;
mod projection;
mod query;
mod types;

use hierarchy::{Level, Progress};
pub use projection::{Gemm, ReferenceGemm};
use query::{query_point, Budgets, ScratchPool};
pub use types::PointId;

// XOR'd into the seed of the coarse subset sampling stream so that it stays
// decoupled from the projection stream; rebuilding after `clear` then yields
// the same layout even though the projections were not redrawn.
const SUBSET_STREAM: u64 = 0x9E37_79B9_7F4A_7C15;

/// Errors surfaced by index construction and queries
#[derive(Debug, thiserror::Error)]
pub enum DciError {
    /// A data or query buffer does not match the dimensionality fixed at build
    #[error("buffer of {actual} values is not a non-empty multiple of dimensionality {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    /// The index holds no points
    #[error("query issued against an empty index")]
    EmptyIndex,
    /// A structural or budget parameter is out of range
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Budgets and traversal options, both for queries and for construction
///
/// The traversal of one level terminates as soon as it has visited
/// `max(num_to_visit, prop_to_visit * population)` distinct points or
/// retrieved `max(num_to_retrieve, prop_to_retrieve * population)` points,
/// whichever happens first. The retrieval threshold has no effect when
/// `blind` is set.
#[derive(Clone, Debug)]
pub struct QueryConfig {
    /// Skip the retrieval budget and return every candidate; `k` is ignored
    pub blind: bool,
    /// Absolute floor on visited points per level
    pub num_to_visit: usize,
    /// Absolute floor on retrieved points per level
    pub num_to_retrieve: usize,
    /// Visited floor as a proportion of the level population
    pub prop_to_visit: f64,
    /// Retrieved floor as a proportion of the level population
    pub prop_to_retrieve: f64,
    /// Retrieved points carried from one level to seed the next; ignored for
    /// single-level indices
    pub field_of_view: usize,
    /// Internal use only; the engine overwrites whatever is set here
    pub min_num_finest_level_points: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            blind: false,
            num_to_visit: 0,
            num_to_retrieve: 0,
            prop_to_visit: 1.0,
            prop_to_retrieve: 0.05,
            field_of_view: 10,
            min_num_finest_level_points: 0,
        }
    }
}

fn validate_config(config: &QueryConfig, num_levels: usize) -> Result<(), DciError> {
    for prop in [config.prop_to_visit, config.prop_to_retrieve] {
        if !prop.is_finite() || prop < 0.0 {
            return Err(DciError::InvalidConfig(
                "proportional budgets must be finite and non-negative",
            ));
        }
    }
    if config.num_to_visit == 0 && config.prop_to_visit <= 0.0 {
        return Err(DciError::InvalidConfig("the visit budget must be positive"));
    }
    if !config.blind && config.num_to_retrieve == 0 && config.prop_to_retrieve <= 0.0 {
        return Err(DciError::InvalidConfig(
            "the retrieval budget must be positive unless blind is set",
        ));
    }
    if num_levels > 1 && config.field_of_view == 0 {
        return Err(DciError::InvalidConfig(
            "field_of_view must be positive for a hierarchical index",
        ));
    }
    Ok(())
}

/// Parameters for building a [`Dci`] index
pub struct Builder {
    num_comp_indices: usize,
    num_simp_indices: usize,
    seed: u64,
    gemm: Box<dyn Gemm>,
    #[cfg(feature = "indicatif")]
    progress: Option<ProgressBar>,
}

impl Builder {
    /// Set the number of composite indices
    pub fn comp_indices(mut self, num: usize) -> Self {
        self.num_comp_indices = num;
        self
    }

    /// Set the number of simple indices within each composite index
    pub fn simp_indices(mut self, num: usize) -> Self {
        self.num_simp_indices = num;
        self
    }

    /// Set the seed for projection sampling and coarse subset selection
    ///
    /// If this value is left unset, a seed is generated from entropy.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Replace the matrix multiply primitive used for projections
    pub fn gemm(mut self, gemm: impl Gemm + 'static) -> Self {
        self.gemm = Box::new(gemm);
        self
    }

    /// A `ProgressBar` to track index construction progress
    #[cfg(feature = "indicatif")]
    pub fn progress(mut self, bar: ProgressBar) -> Self {
        self.progress = Some(bar);
        self
    }

    /// Create an empty index over points of dimensionality `dim`
    ///
    /// Projection directions are drawn lazily by the first [`Dci::add`].
    pub fn build<'a>(self, dim: usize) -> Result<Dci<'a>, DciError> {
        if dim == 0 {
            return Err(DciError::InvalidConfig("dimensionality must be positive"));
        }
        if self.num_comp_indices == 0 || self.num_simp_indices == 0 {
            return Err(DciError::InvalidConfig(
                "at least one composite and one simple index are required",
            ));
        }

        Ok(Dci {
            dim,
            num_comp_indices: self.num_comp_indices,
            num_simp_indices: self.num_simp_indices,
            seed: self.seed,
            gemm: self.gemm,
            proj: Vec::new(),
            levels: Vec::new(),
            data: None,
            pool: ScratchPool::new(),
            #[cfg(feature = "indicatif")]
            progress: self.progress,
        })
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            num_comp_indices: 10,
            num_simp_indices: 10,
            seed: rand::random(),
            gemm: Box::new(ReferenceGemm),
            #[cfg(feature = "indicatif")]
            progress: None,
        }
    }
}

/// One query result: a point and its exact distance to the query
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Neighbor {
    pub id: PointId,
    pub distance: f64,
}

/// Prioritized DCI index over a borrowed column-major dataset
///
/// The index owns its projection directions, sorted tables and hierarchy,
/// and borrows the dataset for its whole lifetime; the borrow checker keeps
/// the caller from moving or mutating the points under a live index.
/// Queries take `&self` and may run in parallel; `add`, `clear` and `reset`
/// require exclusive access.
pub struct Dci<'a> {
    dim: usize,
    num_comp_indices: usize,
    num_simp_indices: usize,
    seed: u64,
    gemm: Box<dyn Gemm>,
    proj: Vec<f64>,
    levels: Vec<Level>,
    data: Option<&'a [f64]>,
    pool: ScratchPool,
    #[cfg(feature = "indicatif")]
    progress: Option<ProgressBar>,
}

impl<'a> std::fmt::Debug for Dci<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dci")
            .field("dim", &self.dim)
            .field("num_comp_indices", &self.num_comp_indices)
            .field("num_simp_indices", &self.num_simp_indices)
            .field("seed", &self.seed)
            .field("proj", &self.proj)
            .field("levels", &self.levels)
            .field("data", &self.data)
            .finish_non_exhaustive()
    }
}

impl<'a> Dci<'a> {
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// Dimensionality fixed when the index was built
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Number of hierarchy levels, zero before `add`
    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    /// Number of indexed points
    pub fn len(&self) -> usize {
        self.levels.last().map_or(0, Level::len)
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    /// Populate the index with a column-major `dim x N` dataset
    ///
    /// The buffer must stay valid and untouched for the index's lifetime; the
    /// index keeps a reference instead of copying the points. Projection
    /// directions are sampled on the first call (and after [`Dci::reset`]);
    /// `config` controls the budget of the parent-assignment queries used
    /// while building the hierarchy. Populating an already populated index is
    /// an error; call [`Dci::clear`] first.
    pub fn add(
        &mut self,
        data: &'a [f64],
        num_levels: usize,
        config: &QueryConfig,
    ) -> Result<(), DciError> {
        if !self.levels.is_empty() {
            return Err(DciError::InvalidConfig(
                "the index is already populated; clear it first",
            ));
        }
        if data.is_empty() || data.len() % self.dim != 0 {
            return Err(DciError::DimensionMismatch {
                expected: self.dim,
                actual: data.len(),
            });
        }
        if num_levels == 0 {
            return Err(DciError::InvalidConfig(
                "a populated index needs at least one level",
            ));
        }
        validate_config(config, num_levels)?;

        let num_points = data.len() / self.dim;
        assert!(num_points < u32::MAX as usize);

        let num_tables = self.num_comp_indices * self.num_simp_indices;
        if self.proj.is_empty() {
            let mut rng = SmallRng::seed_from_u64(self.seed);
            self.proj = projection::sample_projections(self.dim, num_tables, &mut rng);
        }

        let mut proj_data = vec![0.0; num_tables * num_points];
        self.gemm.transpose_multiply(
            num_tables,
            num_points,
            self.dim,
            &self.proj,
            data,
            &mut proj_data,
        );

        let progress = Progress::default();
        #[cfg(feature = "indicatif")]
        let progress = match self.progress.take() {
            Some(bar) => Progress::with_bar(bar),
            None => progress,
        };

        let mut rng = SmallRng::seed_from_u64(self.seed ^ SUBSET_STREAM);
        self.levels = hierarchy::build_levels(
            data,
            self.dim,
            &proj_data,
            num_levels,
            config,
            self.num_comp_indices,
            self.num_simp_indices,
            &mut rng,
            &self.pool,
            &progress,
        );
        self.data = Some(data);
        Ok(())
    }

    /// Search the index for the points nearest to each query
    ///
    /// `queries` is column-major, `dim` rows per query. Each result list is
    /// sorted ascending by exact distance and holds at most `k` points; it
    /// may hold fewer when the budget runs out first. In blind mode `k` is
    /// ignored and every candidate surfaced by the traversal is returned.
    /// Queries of one batch run in parallel; the output order matches the
    /// input order.
    pub fn query(
        &self,
        queries: &[f64],
        k: usize,
        config: &QueryConfig,
    ) -> Result<Vec<Vec<Neighbor>>, DciError> {
        if self.levels.is_empty() {
            return Err(DciError::EmptyIndex);
        }
        let data = self.data.ok_or(DciError::EmptyIndex)?;
        if queries.is_empty() || queries.len() % self.dim != 0 {
            return Err(DciError::DimensionMismatch {
                expected: self.dim,
                actual: queries.len(),
            });
        }
        validate_config(config, self.levels.len())?;

        let num_queries = queries.len() / self.dim;
        let num_tables = self.num_comp_indices * self.num_simp_indices;
        let budgets = Budgets::new(config, k, self.num_comp_indices, self.num_simp_indices);

        let mut qproj = vec![0.0; num_tables * num_queries];
        self.gemm.transpose_multiply(
            num_tables,
            num_queries,
            self.dim,
            &self.proj,
            queries,
            &mut qproj,
        );

        Ok((0..num_queries)
            .into_par_iter()
            .map(|at| {
                let mut scratch = self.pool.pop();
                let neighbors = query_point(
                    &self.levels,
                    data,
                    self.dim,
                    &queries[at * self.dim..][..self.dim],
                    &qproj[at * num_tables..][..num_tables],
                    k,
                    &budgets,
                    &mut scratch,
                );
                self.pool.push(scratch);
                neighbors
            })
            .collect())
    }

    /// Drop the points, tables and hierarchy but keep the projections
    pub fn clear(&mut self) {
        self.levels.clear();
        self.data = None;
    }

    /// Like [`Dci::clear`], but also redraws the projection directions
    pub fn reset(&mut self) {
        self.clear();
        let num_tables = self.num_comp_indices * self.num_simp_indices;
        let mut rng = SmallRng::seed_from_u64(self.seed);
        self.proj = projection::sample_projections(self.dim, num_tables, &mut rng);
    }

    /// Iterate over the indexed points
    pub fn iter(&self) -> impl Iterator<Item = (PointId, &'a [f64])> + '_ {
        let data = self.data.unwrap_or(&[]);
        let dim = self.dim;
        (0..self.len()).map(move |at| (PointId(at as u32), &data[at * dim..][..dim]))
    }
}

impl<'a> ops::Index<PointId> for Dci<'a> {
    type Output = [f64];

    fn index(&self, id: PointId) -> &Self::Output {
        let data = self.data.expect("the index holds no points");
        &data[id.0 as usize * self.dim..][..self.dim]
    }
}
