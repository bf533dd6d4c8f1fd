// eval/pool.rs — engine-wide pools
//
// Three kinds of recycling, all owned by the `Engine` and shared by every
// tree it builds:
//
//   NodePool     — node instances keyed by definition id and kind
//   BufferPool   — f32 backing stores keyed by grid shape
//   ObjectPool   — generic storage (branch storage, tree branch lists)
//
// Everything handed back is reset before it is stored, so a reused object is
// indistinguishable from a fresh one.

use crate::error::{EngineError, Result};
use crate::eval::graph::{NodeDefinition, NodeGuid};
use crate::eval::node::{NodeInstance, NodeRegistry};
use crate::eval::value::{BufferLease, GridShape, SharedBuffer};
use log::trace;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Generic object pool ─────────────────────────────────────────────

/// Anything that can be cleared back to its pristine state.
pub trait Poolable: Default + Send {
    fn reset(&mut self);
}

impl<T: Send> Poolable for Vec<T> {
    fn reset(&mut self) {
        self.clear();
    }
}

pub struct ObjectPool<T: Poolable> {
    free: Mutex<Vec<T>>,
    capacity: usize,
}

impl<T: Poolable> ObjectPool<T> {
    pub fn new(capacity: usize) -> Self {
        ObjectPool {
            free: Mutex::new(Vec::new()),
            capacity,
        }
    }

    pub fn take(&self) -> T {
        lock(&self.free).pop().unwrap_or_default()
    }

    pub fn give(&self, mut item: T) {
        item.reset();
        let mut free = lock(&self.free);
        if free.len() < self.capacity {
            free.push(item);
        }
    }

    pub fn available(&self) -> usize {
        lock(&self.free).len()
    }
}

// ── Node pool ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub created: usize,
    pub reused: usize,
    pub returned: usize,
}

/// Two graphs may author the same id for different kinds, so the kind is
/// part of the key.
type NodeKey = (NodeGuid, &'static str);

pub struct NodePool {
    free: Mutex<FxHashMap<NodeKey, Vec<NodeInstance>>>,
    per_node: usize,
    created: AtomicUsize,
    reused: AtomicUsize,
    returned: AtomicUsize,
}

impl NodePool {
    pub fn new(per_node: usize) -> Self {
        NodePool {
            free: Mutex::new(FxHashMap::default()),
            per_node,
            created: AtomicUsize::new(0),
            reused: AtomicUsize::new(0),
            returned: AtomicUsize::new(0),
        }
    }

    /// An idle instance for `def`, or a new one from the registry.
    ///
    /// An instance filed under the wrong kind is a bookkeeping bug and a
    /// fatal `PoolMismatch`.
    pub fn take(&self, def: &Arc<NodeDefinition>, registry: &NodeRegistry) -> Result<NodeInstance> {
        let kind = registry.get(def.kind())?.type_name();
        let pooled = lock(&self.free)
            .get_mut(&(def.guid().clone(), kind))
            .and_then(|list| list.pop());

        match pooled {
            Some(mut instance) => {
                let found = instance.core().kind().type_name();
                if found != kind {
                    return Err(EngineError::PoolMismatch {
                        expected: kind.to_string(),
                        found: found.to_string(),
                    });
                }
                instance.rebind(def.clone());
                self.reused.fetch_add(1, Ordering::Relaxed);
                trace!("reused pooled instance of {}", def.guid());
                Ok(instance)
            }
            None => {
                let instance = registry.instantiate(def.clone())?;
                self.created.fetch_add(1, Ordering::Relaxed);
                Ok(instance)
            }
        }
    }

    /// Reset `instance` and keep it for the next request of the same id and
    /// kind.
    pub fn give(&self, mut instance: NodeInstance) {
        instance.reset_state();
        self.returned.fetch_add(1, Ordering::Relaxed);
        let key = (
            instance.core().guid().clone(),
            instance.core().kind().type_name(),
        );
        let mut free = lock(&self.free);
        let list = free.entry(key).or_default();
        if list.len() < self.per_node {
            list.push(instance);
        }
    }

    /// Idle instances held for `guid`, across kinds.
    pub fn pooled(&self, guid: &NodeGuid) -> usize {
        lock(&self.free)
            .iter()
            .filter(|((g, _), _)| g == guid)
            .map(|(_, list)| list.len())
            .sum()
    }

    /// Number of distinct (id, kind) entries the pool has seen.
    pub fn keys(&self) -> usize {
        lock(&self.free).len()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            created: self.created.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            returned: self.returned.load(Ordering::Relaxed),
        }
    }
}

// ── Buffer pool ─────────────────────────────────────────────────────

pub struct BufferPool {
    free: Mutex<FxHashMap<GridShape, Vec<Vec<f32>>>>,
    per_shape: usize,
}

impl BufferPool {
    pub fn new(per_shape: usize) -> Self {
        BufferPool {
            free: Mutex::new(FxHashMap::default()),
            per_shape,
        }
    }

    /// A zeroed buffer of `shape`.
    pub fn lease(&self, shape: GridShape) -> BufferLease {
        let recycled = lock(&self.free)
            .get_mut(&shape)
            .and_then(|list| list.pop());
        let data = match recycled {
            Some(mut data) => {
                data.fill(0.0);
                data
            }
            None => vec![0.0; shape.len()],
        };
        BufferLease::new(shape, data)
    }

    /// Take the storage back if nobody else holds the buffer. Returns whether
    /// it was recycled.
    pub fn recycle(&self, buffer: SharedBuffer) -> bool {
        let Ok(buffer) = Arc::try_unwrap(buffer) else {
            return false;
        };
        let (shape, data) = buffer.into_parts();
        let mut free = lock(&self.free);
        let list = free.entry(shape).or_default();
        if list.len() < self.per_shape {
            list.push(data);
        }
        true
    }

    pub fn available(&self, shape: GridShape) -> usize {
        lock(&self.free).get(&shape).map_or(0, Vec::len)
    }
}
