// eval/store.rs — keyed get-or-create store
//
// Used as the tree-wide global store (shared by every branch of one request)
// and as each branch's memo table. Each key owns a `OnceLock`, so concurrent
// callers racing on the same key run the factory exactly once while callers
// on other keys never wait for it.

use crate::error::{EngineError, Result};
use rustc_hash::FxHashMap;
use std::any::{type_name, Any, TypeId};
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

#[derive(Clone, PartialEq, Eq, Hash)]
pub enum StoreKey {
    Named(Arc<str>),
    Type(TypeId),
}

impl StoreKey {
    pub fn named(key: &str) -> Self {
        StoreKey::Named(key.into())
    }

    pub fn of<T: 'static>() -> Self {
        StoreKey::Type(TypeId::of::<T>())
    }
}

impl fmt::Debug for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreKey::Named(k) => write!(f, "{k}"),
            StoreKey::Type(t) => write!(f, "{t:?}"),
        }
    }
}

type Payload = Arc<dyn Any + Send + Sync>;
type Slot = Arc<OnceLock<Payload>>;

#[derive(Default)]
pub struct KeyedStore {
    entries: Mutex<FxHashMap<StoreKey, Slot>>,
}

impl KeyedStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: StoreKey) -> Slot {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.entry(key).or_default().clone()
    }

    fn downcast<T: Any + Send + Sync>(key: &StoreKey, payload: &Payload) -> Result<Arc<T>> {
        payload.clone().downcast::<T>().map_err(|_| {
            EngineError::StoreType(format!("{key:?} (wanted {})", type_name::<T>()))
        })
    }

    /// Return the value under `key`, creating it with `factory` if absent.
    /// Creation is atomic per key.
    pub fn get_or_create<T, F>(&self, key: &str, factory: F) -> Result<Arc<T>>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        self.get_or_create_keyed(StoreKey::named(key), factory)
    }

    /// Same as [`get_or_create`](Self::get_or_create), keyed by the type itself.
    pub fn get_or_create_typed<T, F>(&self, factory: F) -> Result<Arc<T>>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        self.get_or_create_keyed(StoreKey::of::<T>(), factory)
    }

    pub fn get_or_create_keyed<T, F>(&self, key: StoreKey, factory: F) -> Result<Arc<T>>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        let slot = self.slot(key.clone());
        let payload = slot.get_or_init(|| Arc::new(factory()) as Payload);
        Self::downcast(&key, payload)
    }

    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Result<Option<Arc<T>>> {
        self.get_keyed(&StoreKey::named(key))
    }

    pub fn get_typed<T: Any + Send + Sync>(&self) -> Result<Option<Arc<T>>> {
        self.get_keyed(&StoreKey::of::<T>())
    }

    pub fn get_keyed<T: Any + Send + Sync>(&self, key: &StoreKey) -> Result<Option<Arc<T>>> {
        let slot = {
            let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            entries.get(key).cloned()
        };
        match slot.as_ref().and_then(|s| s.get()) {
            Some(payload) => Self::downcast(key, payload).map(Some),
            None => Ok(None),
        }
    }

    /// Store `value` under `key`, replacing whatever was there.
    pub fn insert<T: Any + Send + Sync>(&self, key: &str, value: T) -> Arc<T> {
        self.insert_shared(StoreKey::named(key), Arc::new(value))
    }

    pub fn insert_shared<T: Any + Send + Sync>(&self, key: StoreKey, value: Arc<T>) -> Arc<T> {
        let slot: Slot = Arc::new(OnceLock::new());
        let _ = slot.set(value.clone() as Payload);
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, slot);
        value
    }

    pub fn remove(&self, key: &str) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&StoreKey::named(key))
            .is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&StoreKey::named(key))
            .is_some_and(|s| s.get().is_some())
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|s| s.get().is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
