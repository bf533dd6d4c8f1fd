// eval/value.rs — values carried on ports
//
// Scalars travel by value. Grids travel as `SharedBuffer` (an `Arc<Buffer>`),
// so handing a height map to several consumers is a reference-count bump.
// A buffer is written while it is a `BufferLease` (owned, usually inside a
// job) and frozen into a `Buffer` once finished.

use crate::error::{EngineError, Result};
use serde::Serialize;
use std::sync::Arc;

/// Dimensions of a grid buffer. Cells are row-major, channels interleaved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct GridShape {
    pub width: u32,
    pub height: u32,
    pub channels: u8,
}

impl GridShape {
    pub fn new(width: u32, height: u32, channels: u8) -> Self {
        GridShape {
            width,
            height,
            channels,
        }
    }

    /// Vertex grid for a tile sampled at `resolution`: (res+1)×(res+1).
    pub fn for_resolution(resolution: u32, channels: u8) -> Self {
        GridShape::new(resolution + 1, resolution + 1, channels)
    }

    pub fn cells(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Number of f32 values.
    pub fn len(&self) -> usize {
        self.cells() * self.channels as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn with_channels(&self, channels: u8) -> Self {
        GridShape { channels, ..*self }
    }
}

/// A finished, immutable grid.
#[derive(Debug, Clone, Serialize)]
pub struct Buffer {
    shape: GridShape,
    data: Vec<f32>,
}

pub type SharedBuffer = Arc<Buffer>;

impl Buffer {
    pub fn new(shape: GridShape, data: Vec<f32>) -> Result<Self> {
        if data.len() != shape.len() {
            return Err(EngineError::BufferShape {
                expected: shape.len(),
                got: data.len(),
            });
        }
        Ok(Buffer { shape, data })
    }

    pub fn shape(&self) -> GridShape {
        self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Value at cell (x, y), channel `c`.
    #[inline]
    pub fn get(&self, x: u32, y: u32, c: u8) -> f32 {
        let cell = y as usize * self.shape.width as usize + x as usize;
        self.data[cell * self.shape.channels as usize + c as usize]
    }

    pub fn min_max(&self) -> (f32, f32) {
        self.data
            .iter()
            .fold((f32::MAX, f32::MIN), |(lo, hi), &v| (lo.min(v), hi.max(v)))
    }

    pub(crate) fn into_parts(self) -> (GridShape, Vec<f32>) {
        (self.shape, self.data)
    }
}

/// A writable buffer handed out by the buffer pool.
#[derive(Debug)]
pub struct BufferLease {
    shape: GridShape,
    data: Vec<f32>,
}

impl BufferLease {
    pub(crate) fn new(shape: GridShape, data: Vec<f32>) -> Self {
        BufferLease { shape, data }
    }

    pub fn shape(&self) -> GridShape {
        self.shape
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn freeze(self) -> Result<Buffer> {
        Buffer::new(self.shape, self.data)
    }
}

// ── Port values ─────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum PortValue {
    Float(f64),
    Buffer(SharedBuffer),
    List(Vec<PortValue>),
}

impl PortValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PortValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_buffer(&self) -> Option<&SharedBuffer> {
        match self {
            PortValue::Buffer(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[PortValue]> {
        match self {
            PortValue::List(items) => Some(items),
            _ => None,
        }
    }

    /// Short type name for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            PortValue::Float(_) => "float",
            PortValue::Buffer(_) => "buffer",
            PortValue::List(_) => "list",
        }
    }
}

/// Conversion used by `try_get_output::<T>`.
pub trait FromPortValue: Sized {
    fn from_port_value(value: &PortValue) -> Option<Self>;
}

impl FromPortValue for PortValue {
    fn from_port_value(value: &PortValue) -> Option<Self> {
        Some(value.clone())
    }
}

impl FromPortValue for f64 {
    fn from_port_value(value: &PortValue) -> Option<Self> {
        value.as_f64()
    }
}

impl FromPortValue for f32 {
    fn from_port_value(value: &PortValue) -> Option<Self> {
        value.as_f64().map(|v| v as f32)
    }
}

impl FromPortValue for SharedBuffer {
    fn from_port_value(value: &PortValue) -> Option<Self> {
        value.as_buffer().cloned()
    }
}

impl FromPortValue for Vec<PortValue> {
    fn from_port_value(value: &PortValue) -> Option<Self> {
        value.as_list().map(|items| items.to_vec())
    }
}
