//! Typed, write-once data channels between variants.
//!
//! A provider key is allocated once, up front, from a process-global
//! registry. Each variant stores provider values in a sparse table indexed by
//! the key's integer id. The registry keeps a tiny vtable per id (hash,
//! encode, decode) so untyped storage can round-trip through the incremental
//! cache and be re-checked for post-set mutation.

use crate::hash::hash_bytes;
use lazy_static::lazy_static;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::{type_name, Any, TypeId};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// An untyped provider value as stored in a variant's table.
pub type DynValue = Arc<dyn Any + Send + Sync>;

/// Data that can be attached to a variant through a provider. Serialization
/// is required so values can participate in the incremental cache.
pub trait ProviderData: Any + Send + Sync + Serialize + DeserializeOwned {}
impl<T: Any + Send + Sync + Serialize + DeserializeOwned> ProviderData for T {}

pub(crate) struct ProviderDesc {
    pub type_name: &'static str,
    pub type_id: TypeId,
    /// When set, only the named mutator may write this provider.
    pub mutator: Option<String>,
    pub hash: fn(&DynValue) -> Result<u64, String>,
    pub encode: fn(&DynValue) -> Result<Vec<u8>, String>,
    pub decode: fn(&[u8]) -> Result<DynValue, String>,
}

lazy_static! {
    /// Append-only; ids are indices into this list.
    static ref REGISTRY: RwLock<Vec<ProviderDesc>> = RwLock::new(Vec::new());
}

/// A typed handle to a registered provider. Cheap to copy; the type parameter
/// is the only place the value type is spelled out.
pub struct ProviderKey<T> {
    id: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ProviderKey<T> {
    pub fn id(&self) -> usize {
        self.id
    }
}

impl<T> Clone for ProviderKey<T> {
    fn clone(&self) -> ProviderKey<T> {
        *self
    }
}

impl<T> Copy for ProviderKey<T> {}

impl<T> fmt::Debug for ProviderKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProviderKey<{}>({})", type_name::<T>(), self.id)
    }
}

/// Registers a provider usable from any phase. Call before analysis starts.
pub fn new_provider<T: ProviderData>() -> ProviderKey<T> {
    register::<T>(None)
}

/// Registers a provider writable only while the named mutator is running.
pub fn new_mutator_provider<T: ProviderData>(mutator: &str) -> ProviderKey<T> {
    register::<T>(Some(mutator.to_string()))
}

fn register<T: ProviderData>(mutator: Option<String>) -> ProviderKey<T> {
    let mut reg = REGISTRY.write();
    let id = reg.len();
    reg.push(ProviderDesc {
        type_name: type_name::<T>(),
        type_id: TypeId::of::<T>(),
        mutator,
        hash: hash_value::<T>,
        encode: encode_value::<T>,
        decode: decode_value::<T>,
    });
    ProviderKey { id, _marker: PhantomData }
}

fn encode_value<T: ProviderData>(v: &DynValue) -> Result<Vec<u8>, String> {
    let v = v
        .downcast_ref::<T>()
        .ok_or_else(|| format!("provider value is not a {}", type_name::<T>()))?;
    bincode::serialize(v).map_err(|e| e.to_string())
}

fn hash_value<T: ProviderData>(v: &DynValue) -> Result<u64, String> {
    encode_value::<T>(v).map(|bytes| hash_bytes(&bytes))
}

fn decode_value<T: ProviderData>(bytes: &[u8]) -> Result<DynValue, String> {
    bincode::deserialize::<T>(bytes)
        .map(|v| Arc::new(v) as DynValue)
        .map_err(|e| e.to_string())
}

pub(crate) fn with_descriptor<R>(id: usize, f: impl FnOnce(&ProviderDesc) -> R) -> R {
    let reg = REGISTRY.read();
    f(&reg[id])
}

/// Finds the current id for a type name; used when restoring cache entries
/// written by a process whose registration order may have differed.
pub(crate) fn id_for_type_name(name: &str) -> Option<usize> {
    let reg = REGISTRY.read();
    reg.iter().position(|d| d.type_name == name)
}

pub(crate) fn downcast<T: ProviderData>(v: DynValue) -> Arc<T> {
    v.downcast::<T>().expect("provider value type checked at registration")
}

/// Per-variant sparse storage. Indexed by provider id; an unset slot reads as
/// absent.
#[derive(Default)]
pub(crate) struct ProviderTable {
    values: Vec<Option<DynValue>>,
    initial_hashes: Vec<Option<u64>>,
}

impl ProviderTable {
    pub fn get(&self, id: usize) -> Option<DynValue> {
        self.values.get(id).and_then(|slot| slot.clone())
    }

    pub fn is_set(&self, id: usize) -> bool {
        self.values.get(id).map_or(false, Option::is_some)
    }

    /// Stores a value, enforcing the write-once and mutator-scope rules, and
    /// records the value's initial hash. Returns that hash.
    pub fn set(
        &mut self,
        id: usize,
        value: DynValue,
        current_mutator: Option<&str>,
    ) -> Result<u64, String> {
        let (hash, scope_err) = with_descriptor(id, |desc| {
            if value.as_ref().type_id() != desc.type_id {
                return (Err(format!("provider value is not a {}", desc.type_name)), None);
            }
            let scope_err = match &desc.mutator {
                Some(required) if current_mutator != Some(required.as_str()) => Some(format!(
                    "provider {} may only be set by mutator {:?}, currently in {}",
                    desc.type_name,
                    required,
                    current_mutator.map_or("no mutator".to_string(), |m| format!("{:?}", m)),
                )),
                _ => None,
            };
            ((desc.hash)(&value), scope_err)
        });
        if let Some(err) = scope_err {
            return Err(err);
        }
        let hash = hash?;
        if self.is_set(id) {
            return Err(with_descriptor(id, |desc| {
                format!("provider {} is already set", desc.type_name)
            }));
        }
        self.ensure(id);
        self.values[id] = Some(value);
        self.initial_hashes[id] = Some(hash);
        Ok(hash)
    }

    /// Cache-restore path: trusts the recorded hash and skips scope checks.
    pub fn set_restored(&mut self, id: usize, value: DynValue, hash: u64) {
        self.ensure(id);
        self.values[id] = Some(value);
        self.initial_hashes[id] = Some(hash);
    }

    pub fn initial_hash(&self, id: usize) -> Option<u64> {
        self.initial_hashes.get(id).copied().flatten()
    }

    pub fn initial_hashes(&self) -> Vec<Option<u64>> {
        self.initial_hashes.clone()
    }

    pub fn set_ids(&self) -> Vec<usize> {
        self.values
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| slot.as_ref().map(|_| id))
            .collect()
    }

    /// Re-hashes every stored value and returns the type names of those whose
    /// hash no longer matches the recorded initial hash.
    pub fn find_mutated(&self) -> Vec<&'static str> {
        let mut mutated = Vec::new();
        for id in self.set_ids() {
            let value = self.get(id).expect("set_ids returned an unset slot");
            let expected = self.initial_hash(id);
            with_descriptor(id, |desc| {
                let now = (desc.hash)(&value).ok();
                if now != expected {
                    mutated.push(desc.type_name);
                }
            });
        }
        mutated
    }

    /// Deep-copies the table for a split variant. Values are shared
    /// (immutable by contract), hashes are copied.
    pub fn clone_for_split(&self) -> ProviderTable {
        ProviderTable { values: self.values.clone(), initial_hashes: self.initial_hashes.clone() }
    }

    fn ensure(&mut self, id: usize) {
        if self.values.len() <= id {
            self.values.resize_with(id + 1, || None);
            self.initial_hashes.resize(id + 1, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Paths {
        paths: Vec<String>,
    }

    fn paths(items: &[&str]) -> Paths {
        Paths { paths: items.iter().map(|s| s.to_string()).collect() }
    }

    #[test]
    fn set_then_get_round_trips() {
        let key = new_provider::<Paths>();
        let mut table = ProviderTable::default();
        assert!(table.get(key.id()).is_none());
        table.set(key.id(), Arc::new(paths(&["a", "b"])), None).unwrap();
        let got = downcast::<Paths>(table.get(key.id()).unwrap());
        assert_eq!(*got, paths(&["a", "b"]));
    }

    #[test]
    fn second_write_fails() {
        let key = new_provider::<Paths>();
        let mut table = ProviderTable::default();
        table.set(key.id(), Arc::new(paths(&["a"])), None).unwrap();
        let err = table.set(key.id(), Arc::new(paths(&["b"])), None).unwrap_err();
        assert!(err.contains("already set"), "{}", err);
    }

    #[test]
    fn wrong_type_fails() {
        let key = new_provider::<Paths>();
        let mut table = ProviderTable::default();
        let err = table.set(key.id(), Arc::new("not paths".to_string()), None).unwrap_err();
        assert!(err.contains("is not a"), "{}", err);
    }

    #[test]
    fn mutator_scope_is_enforced() {
        let key = new_mutator_provider::<Paths>("arch");
        let mut table = ProviderTable::default();
        let err = table.set(key.id(), Arc::new(paths(&["a"])), Some("link")).unwrap_err();
        assert!(err.contains("may only be set by mutator"), "{}", err);
        table.set(key.id(), Arc::new(paths(&["a"])), Some("arch")).unwrap();
    }

    #[test]
    fn encode_decode_round_trips() {
        let key = new_provider::<Paths>();
        let value: DynValue = Arc::new(paths(&["x"]));
        let bytes = with_descriptor(key.id(), |d| (d.encode)(&value)).unwrap();
        let back = with_descriptor(key.id(), |d| (d.decode)(&bytes)).unwrap();
        assert_eq!(*downcast::<Paths>(back), paths(&["x"]));
    }

    #[test]
    fn initial_hash_matches_rehash() {
        let key = new_provider::<Paths>();
        let mut table = ProviderTable::default();
        let hash = table.set(key.id(), Arc::new(paths(&["a"])), None).unwrap();
        assert_eq!(table.initial_hash(key.id()), Some(hash));
        assert!(table.find_mutated().is_empty());
    }
}
