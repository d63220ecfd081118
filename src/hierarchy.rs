#[cfg(feature = "indicatif")]
use std::sync::atomic::{self, AtomicUsize};

#[cfg(feature = "indicatif")]
use indicatif::ProgressBar;
use ordered_float::OrderedFloat;
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rayon::iter::{IntoParallelIterator, ParallelIterator};
use rayon::slice::ParallelSliceMut;

use crate::query::{nearest_slot, Budgets, ScratchPool};
use crate::types::{IndexElement, SlotRange};
use crate::QueryConfig;

/// One stratum of the coarse-to-fine hierarchy
///
/// `tables` is a single flat buffer holding `C * S` sorted segments of equal
/// length, one per simple index; `proj` holds the same keys in slot order so
/// sub-populations can be gathered without touching the sorted segments.
/// `child_ranges` and `finest_counts` are empty at the finest level.
#[derive(Debug)]
pub(crate) struct Level {
    /// Slot order of this level: slot -> dataset column
    pub(crate) globals: Vec<u32>,
    /// Slot-major projected keys, `proj[table * len + slot]`
    pub(crate) proj: Vec<f64>,
    /// Sorted projection tables, one segment of `len` per simple index
    pub(crate) tables: Vec<IndexElement>,
    /// Block of next-finer slots assigned to each slot of this level
    pub(crate) child_ranges: Vec<SlotRange>,
    /// Finest-level descendants under each slot of this level
    pub(crate) finest_counts: Vec<u32>,
}

impl Level {
    pub(crate) fn len(&self) -> usize {
        self.globals.len()
    }
}

/// Position of the largest key at or below `target`, or 0 when `target`
/// precedes every key
///
/// The strictly next larger key, when it exists, sits at the returned
/// position plus one unless the target precedes the whole table; callers
/// disambiguate that case by re-checking the key at the returned position.
pub(crate) fn closest_index(table: &[IndexElement], target: f64) -> usize {
    table.partition_point(|e| e.key <= target).saturating_sub(1)
}

/// Progress reporting for `add`, a no-op unless the `indicatif` feature is on
#[derive(Default)]
pub(crate) struct Progress {
    #[cfg(feature = "indicatif")]
    bar: Option<ProgressBar>,
    #[cfg(feature = "indicatif")]
    done: AtomicUsize,
}

impl Progress {
    #[cfg(feature = "indicatif")]
    pub(crate) fn with_bar(bar: ProgressBar) -> Self {
        Self {
            bar: Some(bar),
            done: AtomicUsize::new(0),
        }
    }

    fn begin(&self, total: usize) {
        #[cfg(feature = "indicatif")]
        if let Some(bar) = &self.bar {
            bar.set_length(total as u64);
            bar.set_message("Assigning points to coarse parents");
        }
        #[cfg(not(feature = "indicatif"))]
        let _ = total;
    }

    fn tick(&self) {
        #[cfg(feature = "indicatif")]
        if let Some(bar) = &self.bar {
            let done = self.done.fetch_add(1, atomic::Ordering::Relaxed);
            if done % 1000 == 0 {
                bar.set_position(done as u64);
            }
        }
    }

    fn finish(&self) {
        #[cfg(feature = "indicatif")]
        if let Some(bar) = &self.bar {
            bar.finish();
        }
    }
}

/// Size of level `level` out of `num_levels` over `num_points` points
///
/// Geometric progression: the coarsest level holds about `N^(1/L)` points and
/// each finer level multiplies that by the same factor.
fn level_size(num_points: usize, level: usize, num_levels: usize) -> usize {
    let exponent = (level + 1) as f64 / num_levels as f64;
    (num_points as f64).powf(exponent).ceil() as usize
}

fn build_level(globals: Vec<u32>, proj_data: &[f64], num_tables: usize) -> Level {
    let len = globals.len();
    let mut proj = vec![0.0; num_tables * len];
    for (slot, &global) in globals.iter().enumerate() {
        let column = &proj_data[global as usize * num_tables..][..num_tables];
        for (table, &value) in column.iter().enumerate() {
            proj[table * len + slot] = value;
        }
    }

    let mut tables = Vec::with_capacity(num_tables * len);
    for table in 0..num_tables {
        for (slot, &global) in globals.iter().enumerate() {
            tables.push(IndexElement {
                key: proj[table * len + slot],
                local: slot as u32,
                global,
            });
        }
    }
    tables
        .par_chunks_mut(len)
        .for_each(|segment| segment.sort_unstable_by_key(|e| (OrderedFloat(e.key), e.global)));

    Level {
        globals,
        proj,
        tables,
        child_ranges: Vec::new(),
        finest_counts: Vec::new(),
    }
}

/// Build all levels of the index, coarsest first
///
/// The finest level holds the whole dataset; each coarser level is a uniform
/// random subset of the next finer one. Every finer point is assigned to its
/// nearest coarse point under the prioritized traversal, and siblings are
/// regrouped into contiguous slot ranges so a query can descend through
/// `child_ranges` without indirection.
#[allow(clippy::too_many_arguments)]
pub(crate) fn build_levels(
    data: &[f64],
    dim: usize,
    proj_data: &[f64],
    num_levels: usize,
    config: &QueryConfig,
    num_comp: usize,
    num_simp: usize,
    rng: &mut SmallRng,
    pool: &ScratchPool,
    progress: &Progress,
) -> Vec<Level> {
    let num_points = data.len() / dim;
    let num_tables = num_comp * num_simp;
    let budgets = Budgets::new(config, 1, num_comp, num_simp);

    // Memberships are sampled finest-first, then reversed so that the
    // assignment pass below can fix each level's slot order before any finer
    // level refers to it.
    let mut memberships: Vec<Vec<u32>> = Vec::with_capacity(num_levels);
    memberships.push((0..num_points as u32).collect());
    for level in (0..num_levels - 1).rev() {
        let mut finer = memberships.last().unwrap().clone();
        let size = level_size(num_points, level, num_levels)
            .min(finer.len())
            .max(1);
        let (subset, _) = finer.partial_shuffle(rng, size);
        let mut subset = subset.to_vec();
        subset.sort_unstable();
        memberships.push(subset);
    }
    memberships.reverse();

    progress.begin(memberships[1..].iter().map(Vec::len).sum());

    let mut levels: Vec<Level> = Vec::with_capacity(num_levels);
    let mut memberships = memberships.into_iter();
    levels.push(build_level(memberships.next().unwrap(), proj_data, num_tables));

    for members in memberships {
        let parents: Vec<u32> = {
            let coarse = levels.last().unwrap();
            members[..]
                .into_par_iter()
                .map(|&global| {
                    let mut scratch = pool.pop();
                    let qproj = &proj_data[global as usize * num_tables..][..num_tables];
                    let point = &data[global as usize * dim..][..dim];
                    let slot = nearest_slot(
                        coarse,
                        qproj,
                        point,
                        data,
                        dim,
                        &budgets,
                        &mut scratch.engine,
                    );
                    pool.push(scratch);
                    progress.tick();
                    slot
                })
                .collect()
        };

        // Counting sort by parent slot. Stability keeps siblings in
        // ascending dataset order, which makes the layout deterministic.
        let coarse_len = levels.last().unwrap().len();
        let mut counts = vec![0u32; coarse_len];
        for &parent in &parents {
            counts[parent as usize] += 1;
        }
        let mut starts = vec![0u32; coarse_len];
        let mut acc = 0u32;
        for (slot, &count) in counts.iter().enumerate() {
            starts[slot] = acc;
            acc += count;
        }
        let mut ordered = vec![0u32; members.len()];
        let mut write = starts.clone();
        for (&global, &parent) in members.iter().zip(&parents) {
            let at = &mut write[parent as usize];
            ordered[*at as usize] = global;
            *at += 1;
        }

        levels.last_mut().unwrap().child_ranges = starts
            .iter()
            .zip(&counts)
            .map(|(&start, &len)| SlotRange { start, len })
            .collect();
        levels.push(build_level(ordered, proj_data, num_tables));
    }

    // Finest-level descendant counts, folded upward from the leaf
    for level in (0..num_levels.saturating_sub(1)).rev() {
        let (head, tail) = levels.split_at_mut(level + 1);
        let current = &mut head[level];
        let finer = &tail[0];
        current.finest_counts = current
            .child_ranges
            .iter()
            .map(|range| {
                let children = range.start as usize..(range.start + range.len) as usize;
                if finer.finest_counts.is_empty() {
                    range.len
                } else {
                    finer.finest_counts[children].iter().sum()
                }
            })
            .collect();
    }

    progress.finish();
    levels
}
