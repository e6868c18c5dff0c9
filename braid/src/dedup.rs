//! Order-only input dedup.
//!
//! Two build-defs ordering themselves after the same set of targets should
//! share one synthetic phony instead of repeating the list. Sets are
//! normalized, interned, and counted; any set used at least twice becomes a
//! `dedup-<hex16>` phony and every use site's order-only list collapses to
//! that single name.

use crate::context::Context;
use crate::errors::{Error, ErrorCollector};
use crate::generate::{BuildDef, RuleRef};
use crate::hash::{hex16, ContentHasher};
use crate::uniquelist::UniqueList;
use log::debug;
use std::collections::BTreeMap;
use std::collections::HashMap;

pub(crate) fn dedup_name(strings: &[String]) -> String {
    let mut h = ContentHasher::new();
    h.write_str_slice(strings);
    format!("dedup-{}", hex16(h.finish()))
}

/// Normalizes an order-only list into a set: sorted, duplicate-free.
fn normalize(order_only: &[String]) -> Vec<String> {
    let mut set = order_only.to_vec();
    set.sort();
    set.dedup();
    set
}

impl Context {
    pub(crate) fn dedup_order_only(&mut self, errors: &mut ErrorCollector) {
        // Intern each distinct set; count use sites across every variant and
        // singleton. UniqueList handles make the map keys single pointers.
        let mut uses: HashMap<UniqueList<String>, usize> = HashMap::new();
        let ids = self.active_variant_ids();

        let scan = |defs: &[BuildDef], uses: &mut HashMap<UniqueList<String>, usize>| {
            for def in defs {
                if def.order_only.is_empty() {
                    continue;
                }
                let set = UniqueList::make(&normalize(&def.order_only));
                *uses.entry(set).or_insert(0) += 1;
            }
        };
        for &id in &ids {
            self.with_variant(id, |v| scan(&v.actions.build_defs, &mut uses));
        }
        for rec in &self.singletons {
            scan(&rec.actions.build_defs, &mut uses);
        }

        // Promote shared sets. BTreeMap gives name-sorted phony emission.
        let mut promoted: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (set, count) in &uses {
            if *count < 2 {
                continue;
            }
            let strings = set.to_vec();
            promoted.insert(dedup_name(&strings), strings);
        }

        // Phonies recovered from incrementally restored variants stay alive
        // even if only one fresh build-def (or none) uses them this run.
        for (name, strings) in &self.dedup_strings {
            promoted.entry(name.clone()).or_insert_with(|| strings.clone());
        }
        debug!("order-only dedup: {} sets, {} promoted", uses.len(), promoted.len());

        // Rewrite use sites.
        let rewrite = |defs: &mut Vec<BuildDef>, dedup_names: Option<&mut Vec<String>>| {
            let mut names_out: Vec<String> = Vec::new();
            for def in defs.iter_mut() {
                if def.order_only.is_empty() {
                    continue;
                }
                let strings = normalize(&def.order_only);
                let name = dedup_name(&strings);
                if promoted.contains_key(&name) {
                    def.order_only = vec![name.clone()];
                    names_out.push(name);
                }
            }
            if let Some(dedup_names) = dedup_names {
                names_out.sort();
                names_out.dedup();
                *dedup_names = names_out;
            }
        };
        for &id in &ids {
            self.with_variant_mut(id, |v| {
                if v.restored_from_cache {
                    // Cached dedup names were recovered during restore;
                    // there are no fresh build-defs to rewrite.
                    return;
                }
                rewrite(&mut v.actions.build_defs, Some(&mut v.dedup_names));
            });
        }
        for rec in &mut self.singletons {
            rewrite(&mut rec.actions.build_defs, None);
        }

        // The name→strings table feeds the cache and must stay append-only;
        // a name mapping to different contents means the hash lied.
        for (name, strings) in &promoted {
            match self.dedup_strings.get(name) {
                Some(prev) if prev != strings => {
                    errors.add(Error::Internal {
                        phase: "order-only dedup".to_string(),
                        message: format!("dedup name {} maps to two different sets", name),
                    });
                }
                _ => {
                    self.dedup_strings.insert(name.clone(), strings.clone());
                }
            }
        }

        // Emit one phony per promoted set, sorted by output name.
        self.dedup_actions = promoted
            .into_iter()
            .map(|(name, strings)| BuildDef {
                comment: None,
                rule: RuleRef::Phony,
                outputs: vec![name],
                implicit_outputs: Vec::new(),
                inputs: strings,
                implicits: Vec::new(),
                order_only: Vec::new(),
                args: BTreeMap::new(),
            })
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_name_is_stable_and_order_insensitive_after_normalize() {
        let a = dedup_name(&normalize(&["b".to_string(), "a".to_string()]));
        let b = dedup_name(&normalize(&["a".to_string(), "b".to_string(), "a".to_string()]));
        assert_eq!(a, b);
        assert!(a.starts_with("dedup-"));
        assert_eq!(a.len(), "dedup-".len() + 16);
    }

    #[test]
    fn distinct_sets_get_distinct_names() {
        let a = dedup_name(&["a".to_string(), "b".to_string()]);
        let b = dedup_name(&["a".to_string(), "c".to_string()]);
        assert_ne!(a, b);
    }
}
