//! The variant data model.
//!
//! Modules declared in braid files become groups; each group holds one or
//! more variants, created as mutators split modules along variation axes.
//! Variants live in a single arena owned by the `Context` and refer to each
//! other exclusively by `VariantId`, so reverse-dependency lists never create
//! ownership cycles.

use crate::generate::{LocalBuildActions, ModuleContext};
use crate::parse::LoadHook;
use crate::properties::{PropertyPositions, PropertyStruct};
use crate::provider::ProviderTable;
use crate::resolve::DynamicDependerContext;
use crate::transition::TransitionInfoRef;
use braid_syntax::Position;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// Index of a variant in the context's arena.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct VariantId(pub u32);

impl VariantId {
    pub(crate) fn idx(self) -> usize {
        self.0 as usize
    }
}

/// Index of a module group in the context's group list.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct GroupId(pub u32);

impl GroupId {
    pub(crate) fn idx(self) -> usize {
        self.0 as usize
    }
}

/// The logic half of a module: behavior supplied by the module type.
/// Property state lives in the property structs the module exposes.
pub trait Module: Any + Send {
    /// The property structs parsed properties unpack into. The engine also
    /// walks these to copy state into split variants and to hash inputs for
    /// the incremental cache; state kept outside them does not survive the
    /// post-mutator clone.
    fn property_structs(&mut self) -> Vec<&mut dyn PropertyStruct>;

    fn generate_build_actions(&mut self, ctx: &mut ModuleContext<'_>);

    /// Extra dependency names resolved by the built-in deps mutator. An
    /// empty list means no dynamic dependencies.
    fn dynamic_dependencies(&mut self, _ctx: &mut DynamicDependerContext<'_>) -> Vec<String> {
        Vec::new()
    }

    /// Hooks run by the parse driver right after this module is registered.
    fn load_hooks(&mut self) -> Vec<LoadHook> {
        Vec::new()
    }

    /// Opts this module into incremental analysis.
    fn incremental_supported(&self) -> bool {
        false
    }

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Factory functions are plain `fn` pointers so they can be compared and
/// printed in module header comments.
pub type ModuleFactory = fn() -> Box<dyn Module>;

/// Marker capability for dependency tags. Tags compare by reference: two
/// tags are the same dependency kind iff they are the same allocation.
pub trait DependencyTag: Any + Send + Sync + fmt::Debug {}

pub type Tag = Arc<dyn DependencyTag>;

pub(crate) fn tags_equal(a: &Option<Tag>, b: &Option<Tag>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        _ => false,
    }
}

/// A generic tag for callers that don't need to distinguish edge kinds.
#[derive(Debug)]
pub struct BaseDependencyTag;
impl DependencyTag for BaseDependencyTag {}

/// A direct dependency edge.
#[derive(Clone)]
pub struct Dep {
    pub target: VariantId,
    pub tag: Option<Tag>,
}

/// mutator name → variation label. Two keys are equal iff the mappings are
/// equal; insertion order does not matter. An absent axis is equivalent to
/// the empty label on that axis.
#[derive(Clone, Default, PartialEq, Eq, Hash, Debug)]
pub struct VariationMap(pub(crate) BTreeMap<String, String>);

impl VariationMap {
    pub fn new() -> VariationMap {
        VariationMap::default()
    }

    pub fn get(&self, axis: &str) -> Option<&str> {
        self.0.get(axis).map(String::as_str)
    }

    pub fn insert(&mut self, axis: impl Into<String>, label: impl Into<String>) {
        self.0.insert(axis.into(), label.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    fn label(&self, axis: &str) -> &str {
        self.get(axis).unwrap_or("")
    }

    /// Exact equality treating an absent axis as the empty label.
    pub(crate) fn matches_exact(&self, want: &VariationMap) -> bool {
        self.0
            .keys()
            .chain(want.0.keys())
            .all(|axis| self.label(axis) == want.label(axis))
    }

    /// Far matching: only the axes `want` names are checked, plus any
    /// `never_far` axes, which are held to exact equality.
    pub(crate) fn matches_far(&self, want: &VariationMap, never_far_axes: &[String]) -> bool {
        want.0.iter().all(|(axis, label)| self.label(axis) == label)
            && never_far_axes.iter().all(|axis| self.label(axis) == want.label(axis))
    }

    /// How many axes agree with `want`, counting over the union of axes.
    /// Used to pick the closest existing variant for late-added deps.
    pub(crate) fn closeness(&self, want: &VariationMap) -> usize {
        self.0
            .keys()
            .chain(want.0.keys())
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .filter(|axis| self.label(axis) == want.label(axis))
            .count()
    }

    /// Returns a copy with `overlay`'s axes replacing this map's.
    pub(crate) fn overlaid(&self, overlay: &VariationMap) -> VariationMap {
        let mut out = self.clone();
        for (axis, label) in &overlay.0 {
            out.0.insert(axis.clone(), label.clone());
        }
        out
    }
}

impl fmt::Display for VariationMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries: Vec<String> =
            self.0.iter().map(|(axis, label)| format!("{}:{}", axis, label)).collect();
        write!(f, "{}", entries.join(","))
    }
}

/// All variants sharing one declared name.
pub(crate) struct ModuleGroup {
    pub name: String,
    /// Directory of the defining braid file; doubles as the namespace hint
    /// passed to the name interface.
    pub dir: String,
    /// In variant order: intrinsic split order first, deterministic.
    pub variants: Vec<VariantId>,
}

/// One analyzed module instance. Everything the pipeline learns about a
/// module lives here; the boxed logic module only carries type behavior and
/// property state.
pub(crate) struct Variant {
    pub id: VariantId,
    pub group: GroupId,
    /// Snapshot of the group name, updated on rename.
    pub name: String,
    pub type_name: String,
    pub factory: ModuleFactory,
    pub pos: Position,
    pub dir: String,

    pub variations: VariationMap,
    /// Labels joined with `_` in mutator application order; the stable
    /// display name of this variant.
    pub variant_label: String,

    /// Taken (left `None`) while a visitor runs this variant's module.
    pub module: Option<Box<dyn Module>>,
    pub property_positions: PropertyPositions,

    pub direct_deps: Vec<Dep>,
    pub forward_deps: Vec<VariantId>,
    pub reverse_deps: Vec<VariantId>,
    pub missing_deps: Vec<String>,
    pub missing_deps_consulted: bool,

    pub started_mutator: Option<usize>,
    pub finished_mutator: Option<usize>,
    pub obsoleted_by_new_variants: bool,
    pub split_modules: Vec<VariantId>,

    /// Per-transition-mutator final info, by mutator index.
    pub transition_infos: HashMap<usize, TransitionInfoRef>,
    /// Transient: infos demanded by reverse dependencies during propagate.
    pub incoming_transition_infos: Vec<TransitionInfoRef>,
    /// Transient: this module's own Split() infos.
    pub split_transition_infos: Vec<TransitionInfoRef>,
    /// Transient: source-variation label → per-direct-dep final label.
    pub outgoing_transition_cache: HashMap<String, Vec<String>>,

    pub providers: ProviderTable,

    pub actions: LocalBuildActions,

    pub cache_input_hash: Option<u64>,
    pub restored_from_cache: bool,
    pub dedup_names: Vec<String>,
}

impl Variant {
    pub fn new(
        id: VariantId,
        group: GroupId,
        name: String,
        type_name: String,
        factory: ModuleFactory,
        pos: Position,
        dir: String,
        module: Box<dyn Module>,
        property_positions: PropertyPositions,
    ) -> Variant {
        Variant {
            id,
            group,
            name,
            type_name,
            factory,
            pos,
            dir,
            variations: VariationMap::new(),
            variant_label: String::new(),
            module: Some(module),
            property_positions,
            direct_deps: Vec::new(),
            forward_deps: Vec::new(),
            reverse_deps: Vec::new(),
            missing_deps: Vec::new(),
            missing_deps_consulted: false,
            started_mutator: None,
            finished_mutator: None,
            obsoleted_by_new_variants: false,
            split_modules: Vec::new(),
            transition_infos: HashMap::new(),
            incoming_transition_infos: Vec::new(),
            split_transition_infos: Vec::new(),
            outgoing_transition_cache: HashMap::new(),
            providers: ProviderTable::default(),
            actions: LocalBuildActions::default(),
            cache_input_hash: None,
            restored_from_cache: false,
            dedup_names: Vec::new(),
        }
    }

    /// "name" or "name(variant)" for error messages.
    pub fn display_name(&self) -> String {
        if self.variant_label.is_empty() {
            self.name.clone()
        } else {
            format!("{}({})", self.name, self.variant_label)
        }
    }

    /// Appends a variation label in application order.
    pub fn push_variation(&mut self, axis: &str, label: &str) {
        self.variations.insert(axis, label);
        if !label.is_empty() {
            if !self.variant_label.is_empty() {
                self.variant_label.push('_');
            }
            self.variant_label.push_str(label);
        }
    }

    pub fn take_module(&mut self) -> Box<dyn Module> {
        self.module.take().expect("module already taken by another visitor")
    }

    pub fn put_module(&mut self, module: Box<dyn Module>) {
        debug_assert!(self.module.is_none());
        self.module = Some(module);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vmap(entries: &[(&str, &str)]) -> VariationMap {
        let mut m = VariationMap::new();
        for (axis, label) in entries {
            m.insert(*axis, *label);
        }
        m
    }

    #[test]
    fn variation_equality_ignores_insertion_order() {
        let a = vmap(&[("arch", "arm"), ("os", "linux")]);
        let b = vmap(&[("os", "linux"), ("arch", "arm")]);
        assert_eq!(a, b);
    }

    #[test]
    fn absent_axis_equals_empty_label() {
        let a = vmap(&[("arch", "arm"), ("link", "")]);
        let b = vmap(&[("arch", "arm")]);
        assert!(a.matches_exact(&b));
        assert!(b.matches_exact(&a));
        assert!(!a.matches_exact(&vmap(&[("arch", "x86")])));
    }

    #[test]
    fn far_matching_checks_only_named_axes() {
        let candidate = vmap(&[("arch", "arm"), ("os", "linux")]);
        assert!(candidate.matches_far(&vmap(&[("arch", "arm")]), &[]));
        assert!(!candidate.matches_far(&vmap(&[("arch", "x86")]), &[]));
        // A never-far axis is held to equality even when unnamed.
        assert!(!candidate.matches_far(&vmap(&[("arch", "arm")]), &["os".to_string()]));
        assert!(candidate
            .matches_far(&vmap(&[("arch", "arm"), ("os", "linux")]), &["os".to_string()]));
    }

    #[test]
    fn closeness_counts_agreeing_axes() {
        let want = vmap(&[("arch", "arm"), ("os", "linux")]);
        assert_eq!(vmap(&[("arch", "arm"), ("os", "linux")]).closeness(&want), 2);
        assert_eq!(vmap(&[("arch", "arm")]).closeness(&want), 1);
        assert_eq!(vmap(&[("arch", "x86"), ("os", "musl")]).closeness(&want), 0);
    }

    #[test]
    fn tags_compare_by_reference() {
        let a: Tag = Arc::new(BaseDependencyTag);
        let b: Tag = Arc::new(BaseDependencyTag);
        assert!(tags_equal(&Some(a.clone()), &Some(a.clone())));
        assert!(!tags_equal(&Some(a), &Some(b)));
        assert!(tags_equal(&None, &None));
    }

    struct Nop;

    impl Module for Nop {
        fn property_structs(&mut self) -> Vec<&mut dyn crate::properties::PropertyStruct> {
            Vec::new()
        }
        fn generate_build_actions(&mut self, _ctx: &mut ModuleContext<'_>) {}
        fn as_any(&self) -> &dyn Any {
            self
        }
        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    fn nop_factory() -> Box<dyn Module> {
        Box::new(Nop)
    }

    #[test]
    fn variant_label_joins_in_application_order() {
        let mut v = Variant::new(
            VariantId(0),
            GroupId(0),
            "m".to_string(),
            "t".to_string(),
            nop_factory,
            Position::default(),
            String::new(),
            nop_factory(),
            PropertyPositions::default(),
        );
        // The zz/aa axis names sort against application order; the label must
        // follow application order regardless.
        v.push_variation("zz", "first");
        v.push_variation("mm", "");
        v.push_variation("aa", "second");
        assert_eq!(v.variant_label, "first_second");
        assert_eq!(v.display_name(), "m(first_second)");
        assert_eq!(v.variations.get("mm"), Some(""));
    }
}
