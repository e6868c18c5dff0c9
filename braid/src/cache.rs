//! The incremental analysis cache.
//!
//! A variant that opts in (`IncrementalSupported`) is keyed by where and
//! what it is, and its inputs are hashed as its own properties plus the
//! initial hashes of every provider its direct deps published. On a hit the
//! variant's generator is skipped entirely: cached providers are replayed
//! and its order-only dedup names are re-interned so downstream output is
//! byte-identical to a fresh run.

use crate::context::Context;
use crate::errors::{Error, ErrorCollector};
use crate::hash::{hex16, ContentHasher};
use crate::module::VariantId;
use crate::properties::hash_properties;
use crate::provider;
use braid_syntax::Position;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

const BUILD_ACTIONS_FILE: &str = "build_actions.bin";
const ORDER_ONLY_FILE: &str = "order_only_strings.bin";

#[derive(Clone, Serialize, Deserialize)]
pub(crate) struct CachedProvider {
    pub type_name: String,
    pub bytes: Vec<u8>,
    pub hash: u64,
}

#[derive(Clone, Serialize, Deserialize)]
pub(crate) struct CachedVariant {
    /// Source position at store time; a moved definition invalidates the
    /// entry even when the content hash matches.
    pub pos: Position,
    pub input_hash: u64,
    pub providers: Vec<CachedProvider>,
    pub dedup_names: Vec<String>,
}

#[derive(Default, Serialize, Deserialize)]
pub(crate) struct CacheStore {
    pub build_actions: HashMap<String, CachedVariant>,
    pub order_only_strings: HashMap<String, Vec<String>>,
}

impl CacheStore {
    fn load(dir: &Path) -> Option<CacheStore> {
        let actions = std::fs::read(dir.join(BUILD_ACTIONS_FILE)).ok()?;
        let strings = std::fs::read(dir.join(ORDER_ONLY_FILE)).ok()?;
        let build_actions = match bincode::deserialize(&actions) {
            Ok(map) => map,
            Err(e) => {
                warn!("discarding unreadable build actions cache: {}", e);
                return None;
            }
        };
        let order_only_strings = match bincode::deserialize(&strings) {
            Ok(map) => map,
            Err(e) => {
                warn!("discarding unreadable order-only cache: {}", e);
                return None;
            }
        };
        Some(CacheStore { build_actions, order_only_strings })
    }

    fn save(&self, dir: &Path) -> std::io::Result<()> {
        std::fs::create_dir_all(dir)?;
        let actions =
            bincode::serialize(&self.build_actions).expect("cache serialization cannot fail");
        let strings =
            bincode::serialize(&self.order_only_strings).expect("cache serialization cannot fail");
        std::fs::write(dir.join(BUILD_ACTIONS_FILE), actions)?;
        std::fs::write(dir.join(ORDER_ONLY_FILE), strings)
    }
}

fn cache_dir(ctx: &Context) -> PathBuf {
    PathBuf::from(ctx.config.out_dir())
}

/// The identity half of the key: where the module lives, its name, variant,
/// and type.
pub(crate) fn cache_id(dir: &str, name: &str, variant: &str, type_name: &str) -> String {
    let mut h = ContentHasher::new();
    h.write_str(dir);
    h.write_str(name);
    h.write_str(variant);
    h.write_str(type_name);
    hex16(h.finish())
}

pub(crate) fn load_cache(ctx: &mut Context, _errors: &mut ErrorCollector) {
    if !ctx.incremental_analysis && !ctx.incremental_cache {
        return;
    }
    ctx.cache = CacheStore::load(&cache_dir(ctx));
    debug!(
        "loaded {} cached variants",
        ctx.cache.as_ref().map_or(0, |c| c.build_actions.len()),
    );
}

/// Computes and records the input hash for an eligible variant. Runs after
/// the variant's deps finished generation, so their provider hashes are
/// final.
pub(crate) fn prepare_incremental(ctx: &Context, id: VariantId) {
    if !ctx.incremental_analysis && !ctx.incremental_cache {
        return;
    }
    let supported = ctx.with_variant(id, |v| {
        v.module.as_ref().map_or(false, |m| m.incremental_supported())
    });
    if !supported {
        return;
    }

    let mut h = ContentHasher::new();
    let props_hash = ctx.with_variant_mut(id, |v| {
        let mut ph = ContentHasher::new();
        ph.write_str_map(&v.variations.0);
        let module = v.module.as_mut().expect("module present during generation");
        for ps in module.property_structs() {
            hash_properties(ps, &mut ph);
        }
        ph.finish()
    });
    h.write_u64(props_hash);
    let deps = ctx.with_variant(id, |v| v.direct_deps.clone());
    for dep in deps {
        let (dep_key, hashes) = ctx.with_variant(dep.target, |t| {
            (format!("{}:{}", t.name, t.variant_label), t.providers.initial_hashes())
        });
        h.write_str(&dep_key);
        for hash in hashes {
            h.write_option_u64(hash);
        }
    }
    let input_hash = h.finish();
    ctx.with_variant_mut(id, |v| v.cache_input_hash = Some(input_hash));
}

/// Restores a variant from the cache when identity, position and inputs all
/// match. Returns true when generation should be skipped.
pub(crate) fn try_restore(ctx: &Context, id: VariantId) -> bool {
    let store = match &ctx.cache {
        Some(s) => s,
        None => return false,
    };
    let (key, input_hash, pos) = match ctx.with_variant(id, |v| {
        v.cache_input_hash.map(|h| {
            (cache_id(&v.dir, &v.name, &v.variant_label, &v.type_name), h, v.pos.clone())
        })
    }) {
        Some(parts) => parts,
        None => return false,
    };
    let entry = match store.build_actions.get(&key) {
        Some(e) => e,
        None => return false,
    };
    if entry.input_hash != input_hash || entry.pos != pos {
        return false;
    }

    // Decode providers before touching the variant so a stale entry (e.g. a
    // provider type that no longer exists) leaves it untouched.
    let mut decoded = Vec::with_capacity(entry.providers.len());
    for cached in &entry.providers {
        let pid = match provider::id_for_type_name(&cached.type_name) {
            Some(pid) => pid,
            None => return false,
        };
        let value = match provider::with_descriptor(pid, |d| (d.decode)(&cached.bytes)) {
            Ok(v) => v,
            Err(_) => return false,
        };
        decoded.push((pid, value, cached.hash));
    }

    ctx.with_variant_mut(id, |v| {
        for (pid, value, hash) in decoded {
            v.providers.set_restored(pid, value, hash);
        }
        v.dedup_names = entry.dedup_names.clone();
        v.restored_from_cache = true;
    });
    debug!("restored {} from cache", ctx.variant_display(id));
    true
}

/// Re-interns the order-only string sets behind every restored variant's
/// dedup names. Entries are never removed during analysis; a missing or
/// conflicting entry means the cache files disagree with each other.
pub(crate) fn recover_restored_dedup(ctx: &mut Context, errors: &mut ErrorCollector) {
    let store_strings: HashMap<String, Vec<String>> = match &ctx.cache {
        Some(s) => s.order_only_strings.clone(),
        None => return,
    };
    for id in ctx.active_variant_ids() {
        let (restored, names) =
            ctx.with_variant(id, |v| (v.restored_from_cache, v.dedup_names.clone()));
        if !restored {
            continue;
        }
        for name in names {
            match store_strings.get(&name) {
                None => errors.add(Error::Internal {
                    phase: "incremental restore".to_string(),
                    message: format!("order-only set {} missing from cache", name),
                }),
                Some(strings) => match ctx.dedup_strings.get(&name) {
                    Some(prev) if prev != strings => errors.add(Error::Internal {
                        phase: "incremental restore".to_string(),
                        message: format!("order-only set {} changed contents", name),
                    }),
                    _ => {
                        ctx.dedup_strings.insert(name, strings.clone());
                    }
                },
            }
        }
    }
}

/// Writes the whole-map cache files at end of analysis.
pub(crate) fn store_cache(ctx: &Context, errors: &mut ErrorCollector) {
    let mut store = CacheStore::default();
    for id in ctx.active_variant_ids() {
        let entry = ctx.with_variant(id, |v| {
            let input_hash = v.cache_input_hash?;
            let mut providers = Vec::new();
            for pid in v.providers.set_ids() {
                let keep = provider::with_descriptor(pid, |d| d.mutator.is_none());
                if !keep {
                    // Mutator-scoped providers are replayed by their mutator
                    // on the next run, not by the cache.
                    continue;
                }
                let value = v.providers.get(pid).expect("set_ids returned an unset slot");
                let encoded = provider::with_descriptor(pid, |d| ((d.encode)(&value), d.type_name));
                match encoded {
                    (Ok(bytes), type_name) => providers.push(CachedProvider {
                        type_name: type_name.to_string(),
                        bytes,
                        hash: v.providers.initial_hash(pid).expect("hash recorded on set"),
                    }),
                    (Err(_), _) => {}
                }
            }
            Some((
                cache_id(&v.dir, &v.name, &v.variant_label, &v.type_name),
                CachedVariant {
                    pos: v.pos.clone(),
                    input_hash,
                    providers,
                    dedup_names: v.dedup_names.clone(),
                },
            ))
        });
        if let Some((key, cached)) = entry {
            store.build_actions.insert(key, cached);
        }
    }
    store.order_only_strings = ctx.dedup_strings.clone();
    if let Err(e) = store.save(&cache_dir(ctx)) {
        errors.add(Error::Internal {
            phase: "cache store".to_string(),
            message: format!("failed to write cache: {}", e),
        });
    } else {
        debug!("stored {} cached variants", store.build_actions.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_id_depends_on_every_component() {
        let base = cache_id("dir", "name", "var", "type");
        assert_ne!(base, cache_id("dir2", "name", "var", "type"));
        assert_ne!(base, cache_id("dir", "name2", "var", "type"));
        assert_ne!(base, cache_id("dir", "name", "var2", "type"));
        assert_ne!(base, cache_id("dir", "name", "var", "type2"));
        assert_eq!(base, cache_id("dir", "name", "var", "type"));
    }

    #[test]
    fn cache_store_round_trips_through_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = CacheStore::default();
        store.build_actions.insert(
            "abc".to_string(),
            CachedVariant {
                pos: Position::new("Braidfile", 3, 1),
                input_hash: 42,
                providers: vec![CachedProvider {
                    type_name: "test::T".to_string(),
                    bytes: vec![1, 2, 3],
                    hash: 7,
                }],
                dedup_names: vec!["dedup-00ff".to_string()],
            },
        );
        store
            .order_only_strings
            .insert("dedup-00ff".to_string(), vec!["a".to_string(), "b".to_string()]);
        store.save(tmp.path()).unwrap();

        let back = CacheStore::load(tmp.path()).unwrap();
        assert_eq!(back.build_actions.len(), 1);
        let entry = &back.build_actions["abc"];
        assert_eq!(entry.input_hash, 42);
        assert_eq!(entry.pos, Position::new("Braidfile", 3, 1));
        assert_eq!(entry.providers[0].bytes, vec![1, 2, 3]);
        assert_eq!(back.order_only_strings["dedup-00ff"], vec!["a", "b"]);
    }

    #[test]
    fn missing_cache_files_load_as_none() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(CacheStore::load(tmp.path()).is_none());
    }
}
