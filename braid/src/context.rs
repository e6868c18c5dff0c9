//! The `Context` owns everything the pipeline builds: registered module
//! types, mutators, singletons, the group list, and the variant arena.
//!
//! Phases run in order: `parse_file_list`, `resolve_dependencies` (which
//! also runs the mutators), `prepare_build_actions`, `write_build_file`.
//! Any phase returning errors skips the phases after it.

use crate::cache::CacheStore;
use crate::config::Config;
use crate::fs::{FileSystem, RealFs};
use crate::generate::SingletonRecord;
use crate::module::{GroupId, ModuleFactory, ModuleGroup, Variant, VariantId};
use crate::mutator::MutatorInfo;
use crate::name::{NameInterface, SimpleNameInterface};
use crate::transition::TransitionMutatorRecord;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Concurrency cap for mutator passes.
pub(crate) const MUTATOR_PARALLELISM: usize = 1000;

pub struct Context {
    pub(crate) config: Arc<dyn Config>,
    pub(crate) fs: Arc<dyn FileSystem>,

    pub(crate) module_factories: HashMap<String, ModuleFactory>,
    pub(crate) groups: Vec<ModuleGroup>,
    pub(crate) variants: RwLock<Vec<Arc<Mutex<Variant>>>>,
    pub(crate) names: Box<dyn NameInterface>,

    pub(crate) mutators: Vec<MutatorInfo>,
    pub(crate) transition_mutators: Vec<TransitionMutatorRecord>,
    pub(crate) singletons: Vec<SingletonRecord>,

    pub(crate) allow_missing_deps: bool,
    pub(crate) source_root_dirs: SourceRootDirs,
    include_tags: HashSet<String>,

    /// Files read during parsing; the emitted manifest depends on them.
    pub(crate) parsed_files: Vec<String>,
    /// Directories skipped by the source-root allowlist, with reasons.
    pub(crate) skipped_dirs: Vec<(String, String)>,

    pub(crate) incremental_analysis: bool,
    pub(crate) incremental_cache: bool,
    pub(crate) cache: Option<CacheStore>,

    /// Set when a pass adds direct-dep edges, so forward/reverse deps are
    /// recomputed before the next pass even without structural deltas.
    pub(crate) deps_modified: std::sync::atomic::AtomicBool,

    // Manifest-level state singletons may adjust.
    pub(crate) required_version: (u32, u32),
    pub(crate) build_dir: Option<String>,
    pub(crate) extra_subninjas: Vec<String>,

    /// Synthetic phony build-defs from order-only dedup.
    pub(crate) dedup_actions: Vec<crate::generate::BuildDef>,
    /// dedup name → original order-only string set, including names
    /// recovered from the incremental cache. Entries are never removed
    /// during analysis.
    pub(crate) dedup_strings: HashMap<String, Vec<String>>,
}

impl Context {
    /// A context reading from the real filesystem rooted at `src_root`.
    pub fn new(config: Arc<dyn Config>, src_root: &str) -> Context {
        Context::with_fs(config, Arc::new(RealFs::new(src_root)))
    }

    /// A context over an arbitrary filesystem; tests use `MockFs`.
    pub fn with_fs(config: Arc<dyn Config>, fs: Arc<dyn FileSystem>) -> Context {
        Context {
            config,
            fs,
            module_factories: HashMap::new(),
            groups: Vec::new(),
            variants: RwLock::new(Vec::new()),
            names: Box::new(SimpleNameInterface::new()),
            mutators: Vec::new(),
            transition_mutators: Vec::new(),
            singletons: Vec::new(),
            allow_missing_deps: false,
            source_root_dirs: SourceRootDirs::default(),
            include_tags: HashSet::new(),
            parsed_files: Vec::new(),
            skipped_dirs: Vec::new(),
            incremental_analysis: false,
            incremental_cache: false,
            cache: None,
            deps_modified: std::sync::atomic::AtomicBool::new(false),
            required_version: (1, 7),
            build_dir: None,
            extra_subninjas: Vec::new(),
            dedup_actions: Vec::new(),
            dedup_strings: HashMap::new(),
        }
    }

    pub fn config(&self) -> &Arc<dyn Config> {
        &self.config
    }

    // ---- registration ----------------------------------------------------

    /// Registers a module type. Panics on duplicate registration; type names
    /// are fixed at startup and a duplicate is a programming error.
    pub fn register_module_type(&mut self, name: &str, factory: ModuleFactory) {
        if self.module_factories.insert(name.to_string(), factory).is_some() {
            panic!("module type {:?} registered twice", name);
        }
    }

    /// Replaces the default single-namespace name interface.
    pub fn set_name_interface(&mut self, names: Box<dyn NameInterface>) {
        self.names = names;
    }

    /// Missing dependencies become per-module records instead of errors.
    pub fn set_allow_missing_dependencies(&mut self, allow: bool) {
        self.allow_missing_deps = allow;
    }

    pub fn add_include_tags<'a>(&mut self, tags: impl IntoIterator<Item = &'a str>) {
        self.include_tags.extend(tags.into_iter().map(str::to_string));
    }

    pub fn contains_include_tag(&self, tag: &str) -> bool {
        self.include_tags.contains(tag)
    }

    /// Directories whose modules the source-root allowlist skipped, with the
    /// deciding entry.
    pub fn skipped_dirs(&self) -> &[(String, String)] {
        &self.skipped_dirs
    }

    /// Adds allowlist entries; a leading `-` negates. The longest matching
    /// prefix decides, an empty list allows everything.
    pub fn add_source_root_dirs<'a>(&mut self, dirs: impl IntoIterator<Item = &'a str>) {
        for dir in dirs {
            self.source_root_dirs.add(dir);
        }
    }

    /// Try restoring variants from the on-disk cache during analysis.
    pub fn set_incremental_analysis(&mut self, enabled: bool) {
        self.incremental_analysis = enabled;
    }

    /// Store analysis artifacts into the on-disk cache.
    pub fn set_incremental_cache(&mut self, enabled: bool) {
        self.incremental_cache = enabled;
    }

    // ---- arena access ----------------------------------------------------

    pub(crate) fn variant_count(&self) -> usize {
        self.variants.read().len()
    }

    pub(crate) fn variant(&self, id: VariantId) -> Arc<Mutex<Variant>> {
        self.variants.read()[id.idx()].clone()
    }

    pub(crate) fn with_variant<R>(&self, id: VariantId, f: impl FnOnce(&Variant) -> R) -> R {
        let v = self.variant(id);
        let guard = v.lock();
        f(&guard)
    }

    pub(crate) fn with_variant_mut<R>(
        &self,
        id: VariantId,
        f: impl FnOnce(&mut Variant) -> R,
    ) -> R {
        let v = self.variant(id);
        let mut guard = v.lock();
        f(&mut guard)
    }

    pub(crate) fn push_variant_record(&self, make: impl FnOnce(VariantId) -> Variant) -> VariantId {
        let mut arena = self.variants.write();
        let id = VariantId(arena.len() as u32);
        arena.push(Arc::new(Mutex::new(make(id))));
        id
    }

    pub(crate) fn group(&self, id: GroupId) -> &ModuleGroup {
        &self.groups[id.idx()]
    }

    /// Groups in the name interface's stable total order.
    pub(crate) fn sorted_groups(&self) -> Vec<GroupId> {
        self.names.all_modules()
    }

    /// Live (non-tombstone) variants: group order, then variant order within
    /// each group.
    pub(crate) fn active_variant_ids(&self) -> Vec<VariantId> {
        let mut out = Vec::new();
        for group in self.sorted_groups() {
            for &vid in &self.group(group).variants {
                if !self.with_variant(vid, |v| v.obsoleted_by_new_variants) {
                    out.push(vid);
                }
            }
        }
        out
    }

    pub(crate) fn variant_display(&self, id: VariantId) -> String {
        self.with_variant(id, |v| v.display_name())
    }
}

/// Longest-prefix allowlist over source directories, with `-` negation.
#[derive(Default)]
pub(crate) struct SourceRootDirs {
    entries: Vec<(String, bool)>,
}

impl SourceRootDirs {
    fn add(&mut self, entry: &str) {
        match entry.strip_prefix('-') {
            Some(dir) => self.entries.push((dir.to_string(), false)),
            None => self.entries.push((entry.to_string(), true)),
        }
    }

    /// Whether modules in `dir` participate. Returns the deciding entry for
    /// skip diagnostics.
    pub fn allowed(&self, dir: &str) -> (bool, Option<String>) {
        if self.entries.is_empty() {
            return (true, None);
        }
        let mut best: Option<(&str, bool)> = None;
        for (prefix, allow) in &self.entries {
            if !dir_has_prefix(dir, prefix) {
                continue;
            }
            if best.map_or(true, |(b, _)| prefix.len() > b.len()) {
                best = Some((prefix, *allow));
            }
        }
        match best {
            Some((prefix, allow)) => (allow, Some(prefix.to_string())),
            None => (false, None),
        }
    }
}

/// Segment-aware prefix test: "a/b" is a prefix of "a/b/c" but not "a/bc".
/// The empty prefix matches everything.
fn dir_has_prefix(dir: &str, prefix: &str) -> bool {
    if prefix.is_empty() {
        return true;
    }
    dir == prefix || (dir.starts_with(prefix) && dir.as_bytes()[prefix.len()] == b'/')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dirs(entries: &[&str]) -> SourceRootDirs {
        let mut d = SourceRootDirs::default();
        for e in entries {
            d.add(e);
        }
        d
    }

    #[test]
    fn empty_allowlist_allows_all() {
        assert_eq!(dirs(&[]).allowed("any/dir"), (true, None));
    }

    #[test]
    fn longest_prefix_wins() {
        let d = dirs(&["vendor", "-vendor/private"]);
        assert_eq!(d.allowed("vendor/a").0, true);
        assert_eq!(d.allowed("vendor/private/x").0, false);
        // Unlisted dirs are excluded once an allowlist exists.
        assert_eq!(d.allowed("other").0, false);
    }

    #[test]
    fn empty_entry_is_allow_everything() {
        let d = dirs(&["", "-vendor"]);
        assert_eq!(d.allowed("anything/else").0, true);
        assert_eq!(d.allowed("vendor/x").0, false);
        assert_eq!(d.allowed("vendorx").0, true, "segment boundary respected");
    }
}
