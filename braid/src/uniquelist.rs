//! Interned immutable sequences.
//!
//! A `UniqueList` is an unrolled linked list of fixed-width nodes. Every node
//! is interned in a process-global table, so two lists built from equal
//! contents share all of their nodes and compare equal by a single pointer
//! comparison. That property is what lets order-only input sets and DepSet
//! node contents participate in content-addressed maps cheaply.

use lazy_static::lazy_static;
use parking_lot::Mutex;
use serde::de::{Deserialize, Deserializer};
use serde::ser::{Serialize, SerializeSeq, Serializer};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Element types storable in a `UniqueList`.
pub trait UniqueElem: Any + Clone + Eq + Hash + Send + Sync {}
impl<T: Any + Clone + Eq + Hash + Send + Sync> UniqueElem for T {}

/// Elements per node. With the cumulative length and the next handle this
/// keeps a node of pointer-sized elements within one 64-byte cache line.
const NODE_CAP: usize = 7;

struct Node<T> {
    /// Up to `NODE_CAP` elements.
    elems: Vec<T>,
    /// Number of elements from this node to the end of the list.
    len: usize,
    next: Option<Arc<Node<T>>>,
}

#[derive(PartialEq, Eq, Hash)]
struct NodeKey<T> {
    elems: Vec<T>,
    next: usize,
}

type Interner<T> = HashMap<NodeKey<T>, Arc<Node<T>>>;

lazy_static! {
    /// One interner per element type, keyed by `TypeId`. Entries live for the
    /// whole process; nothing is ever removed.
    static ref INTERNERS: Mutex<HashMap<TypeId, Box<dyn Any + Send>>> = Mutex::new(HashMap::new());
}

fn intern_node<T: UniqueElem>(
    elems: Vec<T>,
    len: usize,
    next: Option<Arc<Node<T>>>,
) -> Arc<Node<T>> {
    let next_ptr = next.as_ref().map_or(0usize, |n| Arc::as_ptr(n) as usize);
    let key = NodeKey { elems: elems.clone(), next: next_ptr };
    let mut map = INTERNERS.lock();
    let entry = map
        .entry(TypeId::of::<T>())
        .or_insert_with(|| Box::new(Interner::<T>::new()) as Box<dyn Any + Send>);
    let interner = entry.downcast_mut::<Interner<T>>().expect("interner element type");
    interner.entry(key).or_insert_with(|| Arc::new(Node { elems, len, next })).clone()
}

/// An interned immutable sequence. Cheap to clone, cheap to compare.
pub struct UniqueList<T: UniqueElem> {
    head: Option<Arc<Node<T>>>,
}

impl<T: UniqueElem> UniqueList<T> {
    pub fn empty() -> UniqueList<T> {
        UniqueList { head: None }
    }

    /// Interns a sequence. Nodes are built back to front so each node's
    /// `next` handle exists before the node itself is interned; chunk
    /// boundaries are aligned from the front, so equal contents always chunk
    /// identically.
    pub fn make(elems: &[T]) -> UniqueList<T> {
        let len = elems.len();
        let mut next: Option<Arc<Node<T>>> = None;
        let mut end = len;
        while end > 0 {
            let start = if end % NODE_CAP == 0 { end - NODE_CAP } else { end - end % NODE_CAP };
            next = Some(intern_node(elems[start..end].to_vec(), len - start, next));
            end = start;
        }
        UniqueList { head: next }
    }

    pub fn len(&self) -> usize {
        self.head.as_ref().map_or(0, |n| n.len)
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn iter(&self) -> Iter<'_, T> {
        Iter { node: self.head.as_deref(), idx: 0 }
    }

    /// Grows `dest` by `len()` and appends node by node.
    pub fn append_to(&self, dest: &mut Vec<T>) {
        dest.reserve(self.len());
        let mut node = self.head.as_deref();
        while let Some(n) = node {
            dest.extend(n.elems.iter().cloned());
            node = n.next.as_deref();
        }
    }

    pub fn to_vec(&self) -> Vec<T> {
        let mut out = Vec::new();
        self.append_to(&mut out);
        out
    }

    /// The address of the head node; the content-addressed identity of the
    /// list within this process.
    pub(crate) fn handle(&self) -> usize {
        self.head.as_ref().map_or(0, |n| Arc::as_ptr(n) as usize)
    }
}

pub struct Iter<'a, T> {
    node: Option<&'a Node<T>>,
    idx: usize,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        loop {
            let node = self.node?;
            if self.idx < node.elems.len() {
                let item = &node.elems[self.idx];
                self.idx += 1;
                return Some(item);
            }
            self.node = node.next.as_deref();
            self.idx = 0;
        }
    }
}

impl<T: UniqueElem> Clone for UniqueList<T> {
    fn clone(&self) -> UniqueList<T> {
        UniqueList { head: self.head.clone() }
    }
}

impl<T: UniqueElem> Default for UniqueList<T> {
    fn default() -> UniqueList<T> {
        UniqueList::empty()
    }
}

impl<T: UniqueElem> PartialEq for UniqueList<T> {
    fn eq(&self, other: &UniqueList<T>) -> bool {
        self.handle() == other.handle()
    }
}

impl<T: UniqueElem> Eq for UniqueList<T> {}

impl<T: UniqueElem> Hash for UniqueList<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_usize(self.handle());
    }
}

impl<T: UniqueElem + fmt::Debug> fmt::Debug for UniqueList<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl<T: UniqueElem + Serialize> Serialize for UniqueList<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.len()))?;
        for elem in self.iter() {
            seq.serialize_element(elem)?;
        }
        seq.end()
    }
}

impl<'de, T: UniqueElem + Deserialize<'de>> Deserialize<'de> for UniqueList<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<UniqueList<T>, D::Error> {
        let elems = Vec::<T>::deserialize(deserializer)?;
        Ok(UniqueList::make(&elems))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strs(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn equal_contents_share_a_handle() {
        let a = UniqueList::make(&strs(&["x", "y", "z"]));
        let b = UniqueList::make(&strs(&["x", "y", "z"]));
        assert_eq!(a, b);
        assert_eq!(a.handle(), b.handle());
        assert_ne!(a, UniqueList::make(&strs(&["x", "y"])));
    }

    #[test]
    fn make_then_to_vec_is_identity() {
        for n in 0..25 {
            let elems: Vec<String> = (0..n).map(|i| format!("e{}", i)).collect();
            let list = UniqueList::make(&elems);
            assert_eq!(list.to_vec(), elems);
            assert_eq!(list.len(), elems.len());
        }
    }

    #[test]
    fn spans_multiple_nodes() {
        let elems: Vec<u32> = (0..NODE_CAP as u32 * 3 + 2).collect();
        let list = UniqueList::make(&elems);
        assert_eq!(list.iter().copied().collect::<Vec<_>>(), elems);
    }

    #[test]
    fn append_to_grows_destination() {
        let list = UniqueList::make(&strs(&["b", "c"]));
        let mut dest = strs(&["a"]);
        list.append_to(&mut dest);
        assert_eq!(dest, strs(&["a", "b", "c"]));
    }

    #[test]
    fn empty_list() {
        let e = UniqueList::<String>::empty();
        assert!(e.is_empty());
        assert_eq!(e.len(), 0);
        assert_eq!(e, UniqueList::make(&[]));
        assert_eq!(e.to_vec(), Vec::<String>::new());
    }

    #[test]
    fn usable_as_map_key() {
        use std::collections::HashMap;
        let mut map = HashMap::new();
        map.insert(UniqueList::make(&strs(&["a"])), 1);
        assert_eq!(map.get(&UniqueList::make(&strs(&["a"]))), Some(&1));
        assert_eq!(map.get(&UniqueList::make(&strs(&["b"]))), None);
    }
}
