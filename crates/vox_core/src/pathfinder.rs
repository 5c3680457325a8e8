//! Budgeted incremental breadth-first pathfinder.
//!
//! Searches never block a tick: [`PathFinder::update`] performs at most a
//! fixed number of expansion steps per call across *all* in-flight
//! searches, round-robining between them, and [`PathFinder::tick`]
//! delivers finished results exactly once. Hop-count matrices come from a
//! size-classed pool so same-dimension searches reuse buffers instead of
//! reallocating.
//!
//! Path reconstruction walks the hop matrix backward taking the *first*
//! valid predecessor in [`Direction::SCAN_ORDER`]. Replicas only need *a*
//! valid path, not the most natural one; pinning the scan order is what
//! keeps them in agreement.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::coord::{Coordinate, Direction};
use crate::world::{VoxelId, WorldOracle};

/// Expansion steps performed per [`PathFinder::update`] call, across all
/// active searches.
pub const DEFAULT_STEP_BUDGET: u32 = 100;

/// Sentinel hop value for unvisited cells.
const UNVISITED: u32 = u32::MAX;

/// Outcome of one finished search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SearchResult {
    /// A path from the start cell to the goal, or to the best-reached
    /// cell if the goal was unreachable. Includes both endpoints.
    Found {
        /// The connected path, start first.
        path: Vec<Coordinate>,
    },
    /// The goal cell is occupied by a live voxel; the path ends on it and
    /// the occupant is reported for the attack/interaction case.
    FoundTarget {
        /// The connected path, ending on the occupied goal cell.
        path: Vec<Coordinate>,
        /// The voxel occupying the goal.
        target: VoxelId,
    },
    /// The search was superseded or its unit destroyed.
    Terminated,
}

/// One delivered completion. Each submitted search produces exactly one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathCompletion {
    /// The unit the search belonged to.
    pub unit: VoxelId,
    /// How it ended.
    pub result: SearchResult,
}

/// Size-classed pool of hop matrices.
///
/// Keyed by (rows, cols) so only identical-dimension searches share
/// buffers. Buffers are cleared on acquire, so reuse never leaks hop
/// counts between searches.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct MatrixPool {
    free: BTreeMap<(u32, u32), Vec<Vec<u32>>>,
}

impl MatrixPool {
    fn acquire(&mut self, rows: u32, cols: u32) -> Vec<u32> {
        let size = (rows as usize) * (cols as usize);
        match self.free.get_mut(&(rows, cols)).and_then(Vec::pop) {
            Some(mut buffer) => {
                buffer.fill(UNVISITED);
                buffer
            }
            None => vec![UNVISITED; size],
        }
    }

    fn release(&mut self, rows: u32, cols: u32, buffer: Vec<u32>) {
        self.free.entry((rows, cols)).or_default().push(buffer);
    }
}

/// Per-unit search state.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SearchTask {
    unit: VoxelId,
    origin: Coordinate,
    goal: Coordinate,
    rows: u32,
    cols: u32,
    /// Hop-count matrix, present while the search is running.
    hops: Option<Vec<u32>>,
    /// FIFO frontier of (cell, hop count).
    frontier: VecDeque<(Coordinate, u32)>,
    /// Closest cell reached so far, the fallback target if the goal is
    /// unreachable.
    best: Coordinate,
    best_dist: i64,
    /// Set when finished; delivered (once) by [`PathFinder::tick`].
    result: Option<SearchResult>,
}

impl SearchTask {
    fn is_running(&self) -> bool {
        self.result.is_none()
    }

    fn hop_at(&self, coord: Coordinate) -> u32 {
        let index = (coord.row as usize) * (self.cols as usize) + coord.col as usize;
        self.hops.as_ref().map_or(UNVISITED, |hops| hops[index])
    }

    fn set_hop(&mut self, coord: Coordinate, hop: u32) {
        let index = (coord.row as usize) * (self.cols as usize) + coord.col as usize;
        if let Some(hops) = self.hops.as_mut() {
            hops[index] = hop;
        }
    }
}

/// The incremental pathfinder. One instance serves the whole match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathFinder {
    tasks: Vec<SearchTask>,
    pool: MatrixPool,
    /// Round-robin position across update calls.
    cursor: usize,
    step_budget: u32,
}

impl Default for PathFinder {
    fn default() -> Self {
        Self::new(DEFAULT_STEP_BUDGET)
    }
}

impl PathFinder {
    /// Create a pathfinder with the given per-update step budget.
    #[must_use]
    pub fn new(step_budget: u32) -> Self {
        Self {
            tasks: Vec::new(),
            pool: MatrixPool::default(),
            cursor: 0,
            step_budget,
        }
    }

    /// Number of searches still expanding.
    #[must_use]
    pub fn active_searches(&self) -> usize {
        self.tasks.iter().filter(|t| t.is_running()).count()
    }

    /// Whether a search (running or awaiting delivery) exists for `unit`.
    #[must_use]
    pub fn has_search(&self, unit: VoxelId) -> bool {
        self.tasks.iter().any(|t| t.unit == unit)
    }

    /// Start a search from `start` to `goal` for `unit`.
    ///
    /// At most one active search per unit: a prior search for the same
    /// unit is terminated (its completion is still delivered, as
    /// [`SearchResult::Terminated`]).
    pub fn submit<W: WorldOracle>(
        &mut self,
        world: &W,
        unit: VoxelId,
        start: Coordinate,
        goal: Coordinate,
    ) {
        self.terminate(unit);

        let goal = Coordinate {
            altitude: start.altitude,
            ..goal.to_weight(start.weight)
        };
        let (rows, cols) = world.dimensions(start.weight);

        let mut task = SearchTask {
            unit,
            origin: start,
            goal,
            rows,
            cols,
            hops: None,
            frontier: VecDeque::new(),
            best: start,
            best_dist: start.distance_squared(goal),
            result: None,
        };

        if start.same_cell(goal) {
            task.result = Some(SearchResult::Found { path: vec![start] });
        } else if !world.in_bounds(start) {
            task.result = Some(SearchResult::Found { path: vec![start] });
        } else {
            task.hops = Some(self.pool.acquire(rows, cols));
            task.set_hop(start, 0);
            task.frontier.push_back((start, 0));
        }
        self.tasks.push(task);
    }

    /// Terminate any search for `unit`, releasing its buffers
    /// synchronously. Safe to call when no search exists, and safe when
    /// the search already finished but was not delivered yet (the
    /// delivery then reports `Terminated` instead of the stale path).
    pub fn terminate(&mut self, unit: VoxelId) {
        for task in self.tasks.iter_mut().filter(|t| t.unit == unit) {
            if let Some(hops) = task.hops.take() {
                self.pool.release(task.rows, task.cols, hops);
            }
            task.frontier.clear();
            task.result = Some(SearchResult::Terminated);
        }
    }

    /// Perform up to the configured number of expansion steps, shared
    /// round-robin across all running searches. Called once per tick (or
    /// more often when idle time allows); never does unbounded work.
    pub fn update<W: WorldOracle>(&mut self, world: &W) {
        let mut budget = self.step_budget;
        while budget > 0 {
            let Some(index) = self.next_running() else {
                return;
            };
            self.step_task(world, index);
            budget -= 1;
        }
    }

    /// Deliver every finished search exactly once and drop its task.
    pub fn tick(&mut self) -> Vec<PathCompletion> {
        let mut completions = Vec::new();
        let mut index = 0;
        while index < self.tasks.len() {
            if self.tasks[index].result.is_some() {
                let task = self.tasks.remove(index);
                if index < self.cursor {
                    self.cursor -= 1;
                }
                completions.push(PathCompletion {
                    unit: task.unit,
                    result: task.result.expect("checked above"),
                });
            } else {
                index += 1;
            }
        }
        completions
    }

    /// Index of the next running task at or after the cursor, advancing
    /// the cursor past it. None if nothing is running.
    fn next_running(&mut self) -> Option<usize> {
        if self.tasks.is_empty() {
            return None;
        }
        let len = self.tasks.len();
        for offset in 0..len {
            let index = (self.cursor + offset) % len;
            if self.tasks[index].is_running() {
                self.cursor = (index + 1) % len;
                return Some(index);
            }
        }
        None
    }

    /// One expansion step for one task.
    fn step_task<W: WorldOracle>(&mut self, world: &W, index: usize) {
        let task = &mut self.tasks[index];
        let Some((cell, hop)) = task.frontier.pop_front() else {
            // Frontier drained without reaching the goal: complete using
            // the best-reached fallback.
            let result = Self::finish(task, world, task.best, false);
            Self::release_buffers(&mut self.pool, task, result);
            return;
        };

        if cell.same_cell(task.goal) {
            let result = Self::finish(task, world, cell, false);
            Self::release_buffers(&mut self.pool, task, result);
            return;
        }

        let next_hop = hop + 1;
        for direction in Direction::SCAN_ORDER {
            let neighbor = cell.step(direction);
            if !world.in_bounds(neighbor) {
                continue;
            }
            if task.hop_at(neighbor) <= next_hop {
                continue;
            }
            if neighbor.same_cell(task.goal) {
                if let Some(target) = world.voxel_at(neighbor) {
                    // Destination occupied by a live target: report the
                    // path onto it with the occupant attached.
                    task.set_hop(neighbor, next_hop);
                    let result = Self::finish(task, world, neighbor, true);
                    Self::release_buffers(&mut self.pool, task, result);
                    return;
                }
            }
            if !world.can_move(task.unit, cell, neighbor) {
                continue;
            }
            task.set_hop(neighbor, next_hop);
            task.frontier.push_back((neighbor, next_hop));

            let dist = neighbor.distance_squared(task.goal);
            if dist < task.best_dist {
                task.best = neighbor;
                task.best_dist = dist;
            }
        }
    }

    /// Reconstruct the path ending at `end` and build the search result.
    fn finish<W: WorldOracle>(
        task: &SearchTask,
        world: &W,
        end: Coordinate,
        onto_target: bool,
    ) -> SearchResult {
        let path = Self::reconstruct(task, world, end, onto_target);
        if onto_target {
            let target = world.voxel_at(end).expect("occupied goal checked");
            SearchResult::FoundTarget { path, target }
        } else {
            SearchResult::Found { path }
        }
    }

    fn release_buffers(pool: &mut MatrixPool, task: &mut SearchTask, result: SearchResult) {
        if let Some(hops) = task.hops.take() {
            pool.release(task.rows, task.cols, hops);
        }
        task.frontier.clear();
        task.result = Some(result);
    }

    /// Walk the hop matrix backward from `end`, picking at every step the
    /// first adjacent cell (pinned scan order) whose hop count is exactly
    /// one less and whose move into the current cell is valid.
    fn reconstruct<W: WorldOracle>(
        task: &SearchTask,
        world: &W,
        end: Coordinate,
        end_is_target: bool,
    ) -> Vec<Coordinate> {
        let mut path = vec![end];
        let mut current = end;
        let mut skip_validity = end_is_target;

        while current != task.origin {
            let hop = task.hop_at(current);
            let mut predecessor = None;
            for direction in Direction::SCAN_ORDER {
                let candidate = current.step(direction);
                if !world.in_bounds(candidate) {
                    continue;
                }
                let candidate_hop = task.hop_at(candidate);
                if candidate_hop == UNVISITED || candidate_hop + 1 != hop {
                    continue;
                }
                if !skip_validity && !world.can_move(task.unit, candidate, current) {
                    continue;
                }
                predecessor = Some(candidate);
                break;
            }
            // The matrix always records a connected wavefront, so a
            // predecessor exists; bail out defensively if it does not.
            let Some(predecessor) = predecessor else {
                break;
            };
            skip_validity = false;
            path.push(predecessor);
            current = predecessor;
        }

        path.reverse();
        path
    }
}
