use std::cmp::Reverse;
use std::collections::BinaryHeap;

use ordered_float::OrderedFloat;
use parking_lot::Mutex;

use crate::hierarchy::{closest_index, Level};
use crate::projection::euclidean;
use crate::types::{Counters, IndexElement, PointId, PqEntry};
use crate::{Neighbor, QueryConfig};

/// Budgets and vote thresholds derived from a `QueryConfig` once per call
pub(crate) struct Budgets {
    pub(crate) blind: bool,
    pub(crate) num_comp: usize,
    pub(crate) num_simp: usize,
    /// Composite votes needed before a point counts as retrieved
    pub(crate) majority: u32,
    pub(crate) field_of_view: usize,
    /// Finest-level points the carried seeds must cover at non-leaf levels
    pub(crate) min_finest: usize,
    num_to_visit: usize,
    prop_to_visit: f64,
    num_to_retrieve: usize,
    prop_to_retrieve: f64,
}

impl Budgets {
    pub(crate) fn new(config: &QueryConfig, k: usize, num_comp: usize, num_simp: usize) -> Self {
        // The caller's min_num_finest_level_points is overwritten: the engine
        // needs at least enough descendants to fill the final result list.
        let min_finest = if config.blind {
            0
        } else {
            k.max(config.num_to_retrieve)
        };

        Self {
            blind: config.blind,
            num_comp,
            num_simp,
            majority: (num_comp as u32 + 1) / 2,
            field_of_view: config.field_of_view,
            min_finest,
            num_to_visit: config.num_to_visit,
            prop_to_visit: config.prop_to_visit,
            num_to_retrieve: config.num_to_retrieve,
            prop_to_retrieve: config.prop_to_retrieve,
        }
    }

    pub(crate) fn num_tables(&self) -> usize {
        self.num_comp * self.num_simp
    }

    fn to_visit(&self, population: usize) -> usize {
        self.num_to_visit
            .max((self.prop_to_visit * population as f64) as usize)
            .max(1)
    }

    fn to_retrieve(&self, population: usize) -> usize {
        self.num_to_retrieve
            .max((self.prop_to_retrieve * population as f64) as usize)
            .max(1)
    }
}

/// Outward-stepping cursor pair over one sorted projection table
///
/// `right` is the smallest position whose key is greater than the projected
/// query; `left` the largest position at or below it. Whichever side is
/// closer is surfaced next and then stepped further outward.
#[derive(Clone, Copy)]
struct Cursor {
    left: isize,
    right: usize,
}

impl Default for Cursor {
    fn default() -> Self {
        Self { left: -1, right: 0 }
    }
}

fn advance(cursor: &mut Cursor, table: &[IndexElement], target: f64, simp: u32) -> Option<PqEntry> {
    let left = (cursor.left >= 0).then(|| {
        let position = cursor.left as usize;
        (OrderedFloat(target - table[position].key), position)
    });
    let right = (cursor.right < table.len()).then(|| {
        let position = cursor.right;
        (OrderedFloat(table[position].key - target), position)
    });

    let (priority, position, from_left) = match (left, right) {
        (None, None) => return None,
        (Some((lp, lpos)), None) => (lp, lpos, true),
        (None, Some((rp, rpos))) => (rp, rpos, false),
        (Some((lp, lpos)), Some((rp, rpos))) => {
            if lp <= rp {
                (lp, lpos, true)
            } else {
                (rp, rpos, false)
            }
        }
    };

    if from_left {
        cursor.left -= 1;
    } else {
        cursor.right += 1;
    }

    Some(PqEntry {
        priority,
        global: table[position].global,
        simp,
        position: position as u32,
    })
}

/// Mutable state for one prioritized traversal of a single level
///
/// All buffers are reused between levels and queries; `Counters` stamps make
/// the per-round reset O(1) regardless of population size.
#[derive(Default)]
pub(crate) struct EngineState {
    cursors: Vec<Cursor>,
    heaps: Vec<BinaryHeap<Reverse<PqEntry>>>,
    /// Pop tally per (composite, slot)
    counts: Counters,
    /// Composites in which a slot has become a candidate
    hits: Counters,
    /// Slots popped at least once on any composite
    seen: Counters,
    /// Slots that became a candidate of at least one composite, in order
    pub(crate) candidates: Vec<u32>,
    /// Slots that passed the majority vote, in retrieval order
    pub(crate) retrieved: Vec<u32>,
}

impl EngineState {
    pub(crate) fn hit_count(&self, slot: usize) -> u32 {
        self.hits.get(slot)
    }

    /// Run the prioritized traversal over one population of `m` points
    ///
    /// `entries` holds `num_comp * num_simp` sorted tables of length `m` each;
    /// the `local` field of every element must lie in `[0, m)`. The traversal
    /// stops when the visit budget is met, when the retrieval budget is met
    /// (skipped in blind mode), or when every cursor has run off both table
    /// ends.
    pub(crate) fn run(&mut self, entries: &[IndexElement], m: usize, qproj: &[f64], budgets: &Budgets) {
        self.candidates.clear();
        self.retrieved.clear();
        if m == 0 {
            return;
        }

        let num_comp = budgets.num_comp;
        let num_simp = budgets.num_simp;
        debug_assert_eq!(entries.len(), num_comp * num_simp * m);

        self.counts.begin(num_comp * m);
        self.hits.begin(m);
        self.seen.begin(m);
        if self.heaps.len() < num_comp {
            self.heaps.resize_with(num_comp, BinaryHeap::new);
        }
        self.cursors.clear();
        self.cursors.resize(num_comp * num_simp, Cursor::default());

        for comp in 0..num_comp {
            self.heaps[comp].clear();
            for simp in 0..num_simp {
                let table_id = comp * num_simp + simp;
                let table = &entries[table_id * m..(table_id + 1) * m];
                let target = qproj[table_id];
                // closest_index cannot signal "everything is larger", so the
                // key at the found position decides which side it lands on.
                let closest = closest_index(table, target);
                let right = if table[closest].key <= target {
                    closest + 1
                } else {
                    closest
                };
                self.cursors[table_id] = Cursor {
                    left: right as isize - 1,
                    right,
                };
                if let Some(entry) = advance(&mut self.cursors[table_id], table, target, simp as u32) {
                    self.heaps[comp].push(Reverse(entry));
                }
            }
        }

        let to_visit = budgets.to_visit(m);
        let to_retrieve = budgets.to_retrieve(m);
        let mut num_visited = 0;
        let mut num_retrieved = 0;

        loop {
            // Tournament over the per-composite heaps. Comparing priorities
            // only (not the full entry) keeps the tie rule at "lower
            // composite first"; within a composite the heap ordering already
            // prefers the lower point id.
            let mut best: Option<(usize, PqEntry)> = None;
            for comp in 0..num_comp {
                if let Some(&Reverse(top)) = self.heaps[comp].peek() {
                    match best {
                        Some((_, leader)) if top.priority >= leader.priority => {}
                        _ => best = Some((comp, top)),
                    }
                }
            }
            let Some((comp, entry)) = best else {
                break; // drained
            };

            self.heaps[comp].pop();
            let table_id = comp * num_simp + entry.simp as usize;
            let table = &entries[table_id * m..(table_id + 1) * m];
            if let Some(next) = advance(&mut self.cursors[table_id], table, qproj[table_id], entry.simp) {
                self.heaps[comp].push(Reverse(next));
            }

            let slot = table[entry.position as usize].local as usize;
            if self.seen.increment(slot) == 1 {
                num_visited += 1;
            }
            if self.counts.increment(comp * m + slot) == num_simp as u32 {
                let votes = self.hits.increment(slot);
                if votes == 1 {
                    self.candidates.push(slot as u32);
                }
                if votes == budgets.majority {
                    self.retrieved.push(slot as u32);
                    num_retrieved += 1;
                }
            }

            if num_visited >= to_visit {
                break;
            }
            if !budgets.blind && num_retrieved >= to_retrieve {
                break;
            }
        }
    }
}

/// Per-query scratch buffers, checked out of the index's pool
#[derive(Default)]
pub(crate) struct Scratch {
    pub(crate) engine: EngineState,
    view_entries: Vec<IndexElement>,
    subpop: Vec<u32>,
}

pub(crate) struct ScratchPool {
    pool: Mutex<Vec<Scratch>>,
}

impl ScratchPool {
    pub(crate) fn new() -> Self {
        Self {
            pool: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn pop(&self) -> Scratch {
        self.pool.lock().pop().unwrap_or_default()
    }

    pub(crate) fn push(&self, scratch: Scratch) {
        self.pool.lock().push(scratch);
    }
}

/// Copy one sub-population out of a level into per-table sorted views
///
/// The gathered element's `local` field is its slot within the view, so the
/// engine's counters stay dense no matter how sparse the sub-population is
/// within the level.
fn gather(level: &Level, subpop: &[u32], num_tables: usize, out: &mut Vec<IndexElement>) {
    let m = subpop.len();
    let len = level.len();
    out.clear();
    out.reserve(num_tables * m);
    for table in 0..num_tables {
        let keys = &level.proj[table * len..(table + 1) * len];
        for (view_slot, &slot) in subpop.iter().enumerate() {
            out.push(IndexElement {
                key: keys[slot as usize],
                local: view_slot as u32,
                global: level.globals[slot as usize],
            });
        }
        out[table * m..].sort_unstable_by_key(|e| (OrderedFloat(e.key), e.global));
    }
}

/// Rank engine output slots by exact distance to the query
///
/// Returns `(distance, global id, level slot)` triples sorted ascending;
/// ties break toward the lower id, keeping results deterministic.
fn rank_slots(
    slots: &[u32],
    view: Option<&[u32]>,
    level: &Level,
    data: &[f64],
    dim: usize,
    query: &[f64],
) -> Vec<(OrderedFloat<f64>, u32, u32)> {
    let mut ranked = slots
        .iter()
        .map(|&view_slot| {
            let slot = match view {
                Some(map) => map[view_slot as usize],
                None => view_slot,
            };
            let global = level.globals[slot as usize];
            let column = &data[global as usize * dim..][..dim];
            (OrderedFloat(euclidean(query, column)), global, slot)
        })
        .collect::<Vec<_>>();
    ranked.sort_unstable();
    ranked
}

/// Answer one query, walking the hierarchy from coarsest to finest
///
/// At the coarsest level the prebuilt tables are used as-is; below it, the
/// children of the carried seeds are gathered into fresh per-query views.
/// The finest level's retrieved set is ranked by exact distance and the top
/// `k` points are returned (all candidates in blind mode).
pub(crate) fn query_point(
    levels: &[Level],
    data: &[f64],
    dim: usize,
    query: &[f64],
    qproj: &[f64],
    k: usize,
    budgets: &Budgets,
    scratch: &mut Scratch,
) -> Vec<Neighbor> {
    let mut chosen: Vec<u32> = Vec::new();
    for (depth, level) in levels.iter().enumerate() {
        let leaf = depth + 1 == levels.len();
        if depth == 0 {
            scratch.subpop.clear();
            scratch.engine.run(&level.tables, level.len(), qproj, budgets);
        } else {
            let parent = &levels[depth - 1];
            scratch.subpop.clear();
            for &slot in &chosen {
                let range = parent.child_ranges[slot as usize];
                scratch.subpop.extend(range.start..range.start + range.len);
            }
            gather(level, &scratch.subpop, budgets.num_tables(), &mut scratch.view_entries);
            scratch
                .engine
                .run(&scratch.view_entries, scratch.subpop.len(), qproj, budgets);
        }

        let view = (depth > 0).then(|| scratch.subpop.as_slice());
        let primary_slots = if budgets.blind {
            &scratch.engine.candidates
        } else {
            &scratch.engine.retrieved
        };
        let mut primary = rank_slots(primary_slots, view, level, data, dim, query);

        if leaf {
            if !budgets.blind {
                primary.truncate(k);
            }
            return primary
                .into_iter()
                .map(|(distance, global, _)| Neighbor {
                    id: PointId(global),
                    distance: distance.into_inner(),
                })
                .collect();
        }

        chosen.clear();
        let mut coverage: u64 = 0;
        for &(_, _, slot) in &primary {
            if chosen.len() >= budgets.field_of_view && coverage >= budgets.min_finest as u64 {
                break;
            }
            chosen.push(slot);
            coverage += level.finest_counts[slot as usize] as u64;
        }
        if !budgets.blind && coverage < budgets.min_finest as u64 {
            // The vote winners don't reach enough finest-level points; fall
            // back to candidates that missed the majority.
            let extra_slots = scratch
                .engine
                .candidates
                .iter()
                .copied()
                .filter(|&view_slot| scratch.engine.hit_count(view_slot as usize) < budgets.majority)
                .collect::<Vec<_>>();
            for (_, _, slot) in rank_slots(&extra_slots, view, level, data, dim, query) {
                if coverage >= budgets.min_finest as u64 {
                    break;
                }
                chosen.push(slot);
                coverage += level.finest_counts[slot as usize] as u64;
            }
        }
        if chosen.is_empty() {
            return Vec::new();
        }
    }

    unreachable!("an index always has at least one level")
}

/// Nearest point of one level under the prioritized traversal
///
/// Used by the hierarchy builder to assign finer points to coarse parents.
/// Falls back from the retrieved set to the candidate set and finally to a
/// linear scan, so every point gets a parent even under a harsh construction
/// budget. Exact-distance ties break toward the lower id.
pub(crate) fn nearest_slot(
    level: &Level,
    qproj: &[f64],
    point: &[f64],
    data: &[f64],
    dim: usize,
    budgets: &Budgets,
    engine: &mut EngineState,
) -> u32 {
    engine.run(&level.tables, level.len(), qproj, budgets);

    let best_of = |slots: &[u32]| {
        slots
            .iter()
            .map(|&slot| {
                let global = level.globals[slot as usize];
                let column = &data[global as usize * dim..][..dim];
                (OrderedFloat(euclidean(point, column)), global, slot)
            })
            .min()
    };

    let best = best_of(&engine.retrieved)
        .or_else(|| best_of(&engine.candidates))
        .or_else(|| best_of(&(0..level.len() as u32).collect::<Vec<_>>()));
    let (_, _, slot) = best.expect("level populations are never empty");
    slot
}
