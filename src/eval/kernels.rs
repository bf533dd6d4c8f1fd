// eval/kernels.rs — reference sampling kernels
//
// Pure functions over grid buffers. Nodes run them inside jobs; each one
// fills its rows in parallel with rayon, so a kernel started on the job pool
// spreads over the same pool.
//
// Grid convention: a tile at resolution `r` has (r+1)×(r+1) samples. Sample
// (x, y) sits at world X = origin.x + x·step and world Z = origin.z + y·step,
// with step = tile_size / r. Neighbouring tiles therefore share their edge
// samples.

use crate::eval::branch::{MeshSettings, TerrainConfig};
use crate::eval::value::{Buffer, BufferLease};
use rayon::prelude::*;

// ── Grid sampling ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridSampler {
    pub origin: [f64; 2],
    pub step: f64,
    /// World Y of the tile plane.
    pub y: f64,
}

impl GridSampler {
    pub fn new(mesh: MeshSettings, terrain: &TerrainConfig) -> Self {
        GridSampler {
            origin: terrain.origin_xz(),
            step: terrain.tile_size / mesh.resolution.max(1) as f64,
            y: terrain.world_offset[1],
        }
    }

    #[inline]
    pub fn world(&self, x: u32, y: u32) -> (f64, f64) {
        (
            self.origin[0] + x as f64 * self.step,
            self.origin[1] + y as f64 * self.step,
        )
    }
}

/// Fill every cell of `lease` with `f(world_x, world_z, cell)`. `cell` is the
/// cell's channel slice. Rows run in parallel.
pub fn fill_grid<F>(lease: &mut BufferLease, sampler: &GridSampler, f: F)
where
    F: Fn(f64, f64, &mut [f32]) + Sync,
{
    let shape = lease.shape();
    let channels = shape.channels as usize;
    let row_len = shape.width as usize * channels;
    if row_len == 0 {
        return;
    }
    lease
        .data_mut()
        .par_chunks_mut(row_len)
        .enumerate()
        .for_each(|(row, values)| {
            for (x, cell) in values.chunks_mut(channels).enumerate() {
                let (wx, wz) = sampler.world(x as u32, row as u32);
                f(wx, wz, cell);
            }
        });
}

/// Same as [`fill_grid`] but `f` sees the cell's grid coordinates.
pub fn fill_cells<F>(lease: &mut BufferLease, f: F)
where
    F: Fn(u32, u32, &mut [f32]) + Sync,
{
    let shape = lease.shape();
    let channels = shape.channels as usize;
    let row_len = shape.width as usize * channels;
    if row_len == 0 {
        return;
    }
    lease
        .data_mut()
        .par_chunks_mut(row_len)
        .enumerate()
        .for_each(|(row, values)| {
            for (x, cell) in values.chunks_mut(channels).enumerate() {
                f(x as u32, row as u32, cell);
            }
        });
}

// ── Simplex noise ───────────────────────────────────────────────────

const GRAD2: [[f64; 2]; 8] = [
    [1.0, 0.0],
    [-1.0, 0.0],
    [0.0, 1.0],
    [0.0, -1.0],
    [1.0, 1.0],
    [-1.0, 1.0],
    [1.0, -1.0],
    [-1.0, -1.0],
];

const SKEW: f64 = 0.366_025_403_784_438_6; // (√3 − 1) / 2
const UNSKEW: f64 = 0.211_324_865_405_187_1; // (3 − √3) / 6

/// Seeded permutation for [`simplex_2d`].
#[derive(Clone)]
pub struct Permutation([u8; 512]);

impl Permutation {
    pub fn new(seed: u64) -> Self {
        let mut table = [0u8; 512];
        for (i, slot) in table.iter_mut().take(256).enumerate() {
            *slot = i as u8;
        }
        let mut state = seed;
        for i in (1..256usize).rev() {
            let j = (splitmix64(&mut state) % (i as u64 + 1)) as usize;
            table.swap(i, j);
        }
        let (low, high) = table.split_at_mut(256);
        high.copy_from_slice(low);
        Permutation(table)
    }

    #[inline]
    fn at(&self, i: usize) -> usize {
        self.0[i] as usize
    }
}

fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// 2D simplex noise, roughly in [-1, 1].
pub fn simplex_2d(perm: &Permutation, x: f64, y: f64) -> f64 {
    let s = (x + y) * SKEW;
    let i = (x + s).floor() as i64;
    let j = (y + s).floor() as i64;
    let t = (i + j) as f64 * UNSKEW;
    let x0 = x - (i as f64 - t);
    let y0 = y - (j as f64 - t);

    let (i1, j1) = if x0 > y0 { (1, 0) } else { (0, 1) };
    let corners = [
        (x0, y0, 0, 0),
        (x0 - i1 as f64 + UNSKEW, y0 - j1 as f64 + UNSKEW, i1, j1),
        (x0 - 1.0 + 2.0 * UNSKEW, y0 - 1.0 + 2.0 * UNSKEW, 1, 1),
    ];

    let ii = (i & 255) as usize;
    let jj = (j & 255) as usize;
    let mut sum = 0.0;
    for (cx, cy, di, dj) in corners {
        let falloff = 0.5 - cx * cx - cy * cy;
        if falloff < 0.0 {
            continue;
        }
        let g = GRAD2[perm.at(ii + di + perm.at(jj + dj)) % 8];
        let f2 = falloff * falloff;
        sum += f2 * f2 * (g[0] * cx + g[1] * cy);
    }
    70.0 * sum
}

// ── Resampling ──────────────────────────────────────────────────────

/// Bilinear resample of `src` onto `dst`'s grid. Both grids span the same
/// tile, so corners map onto corners. Channels beyond `src`'s repeat its
/// last channel.
pub fn resample(src: &Buffer, dst: &mut BufferLease) {
    let s = src.shape();
    let d = dst.shape();
    let sx = if d.width > 1 {
        (s.width.max(1) - 1) as f64 / (d.width - 1) as f64
    } else {
        0.0
    };
    let sy = if d.height > 1 {
        (s.height.max(1) - 1) as f64 / (d.height - 1) as f64
    } else {
        0.0
    };
    let max_c = s.channels.max(1) - 1;

    fill_cells(dst, |x, y, cell| {
        let fx = x as f64 * sx;
        let fy = y as f64 * sy;
        let x0 = (fx.floor() as u32).min(s.width - 1);
        let y0 = (fy.floor() as u32).min(s.height - 1);
        let x1 = (x0 + 1).min(s.width - 1);
        let y1 = (y0 + 1).min(s.height - 1);
        let tx = (fx - x0 as f64) as f32;
        let ty = (fy - y0 as f64) as f32;
        for (c, out) in cell.iter_mut().enumerate() {
            let c = (c as u8).min(max_c);
            let top = lerp(src.get(x0, y0, c), src.get(x1, y0, c), tx);
            let bottom = lerp(src.get(x0, y1, c), src.get(x1, y1, c), tx);
            *out = lerp(top, bottom, ty);
        }
    });
}

#[inline]
fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

// ── Normals ─────────────────────────────────────────────────────────

/// Unit normals of a single-channel height grid into a 3-channel `dst` of
/// the same size. Forward differences use the east neighbour's second
/// column and the north neighbour's second row past the last sample; without
/// a neighbour the edge difference is repeated.
pub fn normals(
    height: &Buffer,
    east: Option<&Buffer>,
    north: Option<&Buffer>,
    step: f64,
    dst: &mut BufferLease,
) {
    let shape = height.shape();
    let (w, h) = (shape.width, shape.height);
    let step = step.max(f64::EPSILON) as f32;

    let sample = |x: u32, y: u32| -> f32 {
        if x < w && y < h {
            height.get(x, y, 0)
        } else if x >= w {
            match east {
                Some(e) if e.shape().width > 1 => e.get(1, y.min(e.shape().height - 1), 0),
                _ => 2.0 * height.get(w - 1, y.min(h - 1), 0) - height.get(w.saturating_sub(2), y.min(h - 1), 0),
            }
        } else {
            match north {
                Some(n) if n.shape().height > 1 => n.get(x.min(n.shape().width - 1), 1, 0),
                _ => 2.0 * height.get(x, h - 1, 0) - height.get(x, h.saturating_sub(2), 0),
            }
        }
    };

    fill_cells(dst, |x, y, cell| {
        let here = sample(x, y);
        let dx = (sample(x + 1, y) - here) / step;
        let dz = (sample(x, y + 1) - here) / step;
        let (nx, ny, nz) = (-dx, 1.0, -dz);
        let len = (nx * nx + ny * ny + nz * nz).sqrt();
        cell[0] = nx / len;
        cell[1] = ny / len;
        cell[2] = nz / len;
    });
}

// ── Combination ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CombineOp {
    Sum,
    Product,
    Min,
    Max,
}

impl CombineOp {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "Sum" | "Add" => Some(CombineOp::Sum),
            "Product" | "Multiply" => Some(CombineOp::Product),
            "Min" => Some(CombineOp::Min),
            "Max" => Some(CombineOp::Max),
            _ => None,
        }
    }

    /// Neutral starting value, if the operation has one.
    pub fn identity(self) -> Option<f64> {
        match self {
            CombineOp::Sum => Some(0.0),
            CombineOp::Product => Some(1.0),
            CombineOp::Min | CombineOp::Max => None,
        }
    }

    #[inline]
    pub fn apply(self, a: f64, b: f64) -> f64 {
        match self {
            CombineOp::Sum => a + b,
            CombineOp::Product => a * b,
            CombineOp::Min => a.min(b),
            CombineOp::Max => a.max(b),
        }
    }
}
