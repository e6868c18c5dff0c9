//! Module naming.
//!
//! The name interface maps declared module names to groups and owns the
//! "what did you mean" policy for unknown names. It is pluggable so an
//! embedder can layer namespaces on top; the default implementation is one
//! flat namespace.

use crate::module::GroupId;
use braid_syntax::Position;
use std::collections::BTreeMap;

pub trait NameInterface: Send + Sync {
    /// Registers a new module name. `dir` is the directory of the braid file
    /// declaring the module, for namespace-aware implementations.
    fn new_module(&mut self, name: &str, dir: &str, group: GroupId, pos: &Position)
        -> Result<(), String>;

    /// Changes a group's visible name.
    fn rename(&mut self, old: &str, new: &str, group: GroupId) -> Result<(), String>;

    /// Resolves a name as seen from a module in `from_dir`.
    fn module_from_name(&self, name: &str, from_dir: &str) -> Option<GroupId>;

    /// Every group in the stable total order used for traversal and
    /// emission.
    fn all_modules(&self) -> Vec<GroupId>;

    /// The error text for a dependency on an unknown module, including
    /// suggestions.
    fn missing_dependency_error(&self, depender: &str, dep: &str) -> String;
}

/// One flat namespace; names are globally unique.
#[derive(Default)]
pub struct SimpleNameInterface {
    // BTreeMap so all_modules is sorted by name with no extra work.
    modules: BTreeMap<String, (GroupId, Position)>,
}

impl SimpleNameInterface {
    pub fn new() -> SimpleNameInterface {
        SimpleNameInterface::default()
    }
}

impl NameInterface for SimpleNameInterface {
    fn new_module(
        &mut self,
        name: &str,
        _dir: &str,
        group: GroupId,
        pos: &Position,
    ) -> Result<(), String> {
        if let Some((_, prev)) = self.modules.get(name) {
            return Err(format!("module {:?} already defined at {}", name, prev));
        }
        self.modules.insert(name.to_string(), (group, pos.clone()));
        Ok(())
    }

    fn rename(&mut self, old: &str, new: &str, group: GroupId) -> Result<(), String> {
        let entry = match self.modules.get(old) {
            Some((g, _)) if *g == group => self.modules.remove(old).expect("checked above"),
            _ => return Err(format!("renaming unknown module {:?}", old)),
        };
        if let Some((_, prev)) = self.modules.get(new) {
            let err = format!("renaming {:?} to {:?}: already defined at {}", old, new, prev);
            self.modules.insert(old.to_string(), entry);
            return Err(err);
        }
        self.modules.insert(new.to_string(), entry);
        Ok(())
    }

    fn module_from_name(&self, name: &str, _from_dir: &str) -> Option<GroupId> {
        self.modules.get(name).map(|(g, _)| *g)
    }

    fn all_modules(&self) -> Vec<GroupId> {
        self.modules.values().map(|(g, _)| *g).collect()
    }

    fn missing_dependency_error(&self, depender: &str, dep: &str) -> String {
        let guesses = names_like(dep, self.modules.keys().map(String::as_str));
        if guesses.is_empty() {
            format!("{:?} depends on undefined module {:?}", depender, dep)
        } else {
            format!(
                "{:?} depends on undefined module {:?}; did you mean {}?",
                depender,
                dep,
                guesses.iter().map(|g| format!("{:?}", g)).collect::<Vec<_>>().join(", "),
            )
        }
    }
}

/// Candidates within edit distance 2, closest first, at most three.
pub(crate) fn names_like<'a>(name: &str, candidates: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut scored: Vec<(usize, &str)> = candidates
        .filter_map(|c| {
            let d = levenshtein(name, c);
            (d > 0 && d <= 2).then(|| (d, c))
        })
        .collect();
    scored.sort();
    scored.into_iter().take(3).map(|(_, c)| c.to_string()).collect()
}

fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut cur = vec![0; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        cur[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let sub = prev[j] + usize::from(ca != cb);
            cur[j + 1] = sub.min(prev[j + 1] + 1).min(cur[j] + 1);
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pos() -> Position {
        Position::new("Braidfile", 1, 1)
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut names = SimpleNameInterface::new();
        names.new_module("foo", ".", GroupId(0), &pos()).unwrap();
        let err = names.new_module("foo", "sub", GroupId(1), &pos()).unwrap_err();
        assert!(err.contains("already defined"));
    }

    #[test]
    fn all_modules_is_name_sorted() {
        let mut names = SimpleNameInterface::new();
        names.new_module("zebra", ".", GroupId(0), &pos()).unwrap();
        names.new_module("apple", ".", GroupId(1), &pos()).unwrap();
        names.new_module("mango", ".", GroupId(2), &pos()).unwrap();
        assert_eq!(names.all_modules(), vec![GroupId(1), GroupId(2), GroupId(0)]);
    }

    #[test]
    fn rename_moves_the_entry() {
        let mut names = SimpleNameInterface::new();
        names.new_module("old", ".", GroupId(0), &pos()).unwrap();
        names.rename("old", "new", GroupId(0)).unwrap();
        assert_eq!(names.module_from_name("new", "."), Some(GroupId(0)));
        assert_eq!(names.module_from_name("old", "."), None);
    }

    #[test]
    fn rename_conflict_restores_old_name() {
        let mut names = SimpleNameInterface::new();
        names.new_module("a", ".", GroupId(0), &pos()).unwrap();
        names.new_module("b", ".", GroupId(1), &pos()).unwrap();
        assert!(names.rename("a", "b", GroupId(0)).is_err());
        assert_eq!(names.module_from_name("a", "."), Some(GroupId(0)));
    }

    #[test]
    fn missing_dep_suggests_close_names() {
        let mut names = SimpleNameInterface::new();
        names.new_module("libfoo", ".", GroupId(0), &pos()).unwrap();
        names.new_module("libbar", ".", GroupId(1), &pos()).unwrap();
        let msg = names.missing_dependency_error("app", "libfo");
        assert!(msg.contains("undefined module \"libfo\""));
        assert!(msg.contains("did you mean \"libfoo\"?"), "{}", msg);
        let msg = names.missing_dependency_error("app", "zzz");
        assert!(!msg.contains("did you mean"));
    }

    #[test]
    fn edit_distance() {
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("same", "same"), 0);
    }
}
