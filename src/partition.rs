//! Spatial partitioning of the global box across the peer group.
//!
//! The global axis-aligned box is factored into an `Ix * Iy * Iz` grid of
//! rectilinear sub-boxes, one per rank. Ranks are laid out x-fastest:
//! `rank = i + j * Ix + k * Ix * Iy`. Each rank sees the whole table so
//! any rank can answer the owner-of-point query for any point.
//!
//! Face/neighbor indexing convention: `0` lower x, `1` upper x, `2` lower
//! y, `3` upper y, `4` lower z, `5` upper z.

use glam::{UVec3, Vec3};
use serde::{Deserialize, Serialize};

use crate::geometry::Box3;

/// Relative scale of the face-crossing epsilon. The epsilon used to push
/// exit points strictly into the neighbor is this fraction of the
/// smallest sub-box extent.
pub const DEFAULT_EPSILON_SCALE: f32 = 1e-6;

/// Replicated partition metadata: the global box and how many ranks share
/// it. Each rank derives its own sub-box and neighbor table from this.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PartitionMeta {
    pub global_box: Box3,
    pub n_partitions: usize,
}

/// One rank's view of the spatial partition.
#[derive(Debug, Clone)]
pub struct Partition {
    global_box: Box3,
    grid: UVec3,
    slab: Vec3,
    rank: usize,
    n_partitions: usize,
    local_box: Box3,
    neighbors: [Option<usize>; 6],
    epsilon: f32,
}

impl Partition {
    /// Build the partition for `rank` out of `meta.n_partitions` ranks.
    #[must_use]
    pub fn new(meta: &PartitionMeta, rank: usize) -> Self {
        let grid = factor(meta.n_partitions);
        let gsize = meta.global_box.extent();
        let slab = Vec3::new(
            gsize.x / grid.x as f32,
            gsize.y / grid.y as f32,
            gsize.z / grid.z as f32,
        );

        let (i, j, k) = rank_to_ijk(rank, grid);
        let local_box = cell_box(&meta.global_box, grid, slab, i, j, k);

        let neighbors = [
            (i > 0).then(|| ijk_to_rank(i - 1, j, k, grid)),
            (i + 1 < grid.x).then(|| ijk_to_rank(i + 1, j, k, grid)),
            (j > 0).then(|| ijk_to_rank(i, j - 1, k, grid)),
            (j + 1 < grid.y).then(|| ijk_to_rank(i, j + 1, k, grid)),
            (k > 0).then(|| ijk_to_rank(i, j, k - 1, grid)),
            (k + 1 < grid.z).then(|| ijk_to_rank(i, j, k + 1, grid)),
        ];

        let epsilon = local_box.smallest_extent() * DEFAULT_EPSILON_SCALE;

        Self {
            global_box: meta.global_box,
            grid,
            slab,
            rank,
            n_partitions: meta.n_partitions,
            local_box,
            neighbors,
            epsilon,
        }
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.rank
    }

    #[must_use]
    pub fn global_box(&self) -> Box3 {
        self.global_box
    }

    #[must_use]
    pub fn local_box(&self) -> Box3 {
        self.local_box
    }

    /// The sub-box owned by an arbitrary rank.
    #[must_use]
    pub fn box_of(&self, rank: usize) -> Box3 {
        let (i, j, k) = rank_to_ijk(rank, self.grid);
        cell_box(&self.global_box, self.grid, self.slab, i, j, k)
    }

    /// The grid factorization `(Ix, Iy, Iz)`.
    #[must_use]
    pub fn grid(&self) -> UVec3 {
        self.grid
    }

    /// The epsilon used to push a migrating ray strictly into its
    /// destination sub-box.
    #[must_use]
    pub fn epsilon(&self) -> f32 {
        self.epsilon
    }

    /// The six face neighbors of this rank, `None` where the face is on
    /// the outside of the global box.
    #[must_use]
    pub fn neighbors(&self) -> [Option<usize>; 6] {
        self.neighbors
    }

    /// The neighbor across the given face.
    #[must_use]
    pub fn neighbor(&self, face: usize) -> Option<usize> {
        self.neighbors[face]
    }

    /// The rank owning `p`, or `None` when `p` is outside the global box.
    ///
    /// Points exactly on an internal face land in the lower-index cell:
    /// the floor of the scaled coordinate, clamped to the grid.
    #[must_use]
    pub fn owner(&self, p: Vec3) -> Option<usize> {
        if !self.global_box.contains(p, 0.0) {
            return None;
        }
        let rel = p - self.global_box.min;
        let i = cell_index(rel.x, self.slab.x, self.grid.x);
        let j = cell_index(rel.y, self.slab.y, self.grid.y);
        let k = cell_index(rel.z, self.slab.z, self.grid.z);
        Some(ijk_to_rank(i, j, k, self.grid))
    }

    /// Whether this rank's sub-box contains `p`, widened by `fuzz`.
    #[must_use]
    pub fn owns(&self, p: Vec3, fuzz: f32) -> bool {
        self.local_box.contains(p, fuzz)
    }

    /// The first local face crossed by a ray leaving this rank's sub-box.
    #[must_use]
    pub fn exit_face(&self, origin: Vec3, dir: Vec3) -> usize {
        self.local_box.exit_face(origin, dir)
    }

    #[must_use]
    pub fn n_partitions(&self) -> usize {
        self.n_partitions
    }
}

/// Factor `n` into a 3D grid `Ix * Iy * Iz == n` minimizing `Ix + Iy + Iz`.
#[must_use]
pub fn factor(n: usize) -> UVec3 {
    if n == 1 {
        return UVec3::ONE;
    }

    let mut best = UVec3::new(1, 1, n as u32);
    let mut best_sum = n + 2;

    for i in 1..=n {
        if n % i != 0 {
            continue;
        }
        let jk = n / i;
        for j in 1..=jk {
            if jk % j != 0 {
                continue;
            }
            let k = jk / j;
            let sum = i + j + k;
            if sum < best_sum {
                best_sum = sum;
                best = UVec3::new(i as u32, j as u32, k as u32);
            }
        }
    }

    best
}

/// Grid index along one axis. A coordinate exactly on an internal cut
/// belongs to the lower cell.
fn cell_index(rel: f32, slab: f32, cells: u32) -> u32 {
    let f = rel / slab;
    let mut i = f.floor() as u32;
    if i > 0 && f == i as f32 {
        i -= 1;
    }
    i.min(cells - 1)
}

fn ijk_to_rank(i: u32, j: u32, k: u32, grid: UVec3) -> usize {
    (i + j * grid.x + k * grid.x * grid.y) as usize
}

fn rank_to_ijk(rank: usize, grid: UVec3) -> (u32, u32, u32) {
    let r = rank as u32;
    let i = r % grid.x;
    let j = (r / grid.x) % grid.y;
    let k = r / (grid.x * grid.y);
    (i, j, k)
}

/// The sub-box of cell `(i, j, k)`. Interior cuts are at uniform slab
/// spacing; the last slab along each axis absorbs the remainder so the
/// union exactly tiles the global box.
fn cell_box(global: &Box3, grid: UVec3, slab: Vec3, i: u32, j: u32, k: u32) -> Box3 {
    let lo = Vec3::new(
        global.min.x + i as f32 * slab.x,
        global.min.y + j as f32 * slab.y,
        global.min.z + k as f32 * slab.z,
    );
    let hi = Vec3::new(
        if i + 1 == grid.x { global.max.x } else { lo.x + slab.x },
        if j + 1 == grid.y { global.max.y } else { lo.y + slab.y },
        if k + 1 == grid.z { global.max.z } else { lo.z + slab.z },
    );
    Box3::new(lo, hi)
}
