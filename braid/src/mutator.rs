//! The mutator engine.
//!
//! Mutators run in registration order over every live variant. Adjacent
//! bottom-up mutators with no cross-module side effects are coalesced into a
//! single scheduler pass. Within a pass, visitors may add dependencies and
//! pause until the new dependency has itself been processed; structural
//! changes (splits, reverse deps, replacements, renames, new modules) are
//! accumulated as deltas and applied once the pass completes.

use crate::config::Config;
use crate::context::{Context, MUTATOR_PARALLELISM};
use crate::errors::{Error, ErrorCollector};
use crate::module::{
    Dep, GroupId, Module, ModuleFactory, Tag, Variant, VariantId, VariationMap,
};
use crate::properties::copy_properties;
use crate::provider::{downcast, DynValue, ProviderData, ProviderKey};
use crate::visitor::{parallel_visit, PauseHandle};
use braid_syntax::Position;
use crossbeam_channel::{unbounded, Sender};
use log::{debug, info};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub(crate) enum MutatorKind {
    BottomUp,
    TopDown,
}

pub(crate) type MutatorFn = Arc<dyn Fn(&mut MutatorContext<'_>) + Send + Sync>;

/// One registered mutator. The capability flags gate coalescing: a mutator
/// that renames, reaches across modules, or changes global state must run as
/// its own pass.
pub struct MutatorInfo {
    pub(crate) name: String,
    pub(crate) kind: MutatorKind,
    pub(crate) func: MutatorFn,
    pub(crate) transition_index: Option<usize>,
    /// Set on a transition's propagate mutator: snapshot input variants
    /// after its pass.
    pub(crate) transition_snapshot: Option<usize>,
    /// Set on a transition's mutate mutator: clear transient state after
    /// its pass.
    pub(crate) transition_finalize: Option<usize>,
    pub(crate) uses_rename: bool,
    pub(crate) uses_reverse_dependencies: bool,
    pub(crate) uses_replace_dependencies: bool,
    pub(crate) uses_create_module: bool,
    pub(crate) mutates_dependencies: bool,
    pub(crate) mutates_global_state: bool,
}

impl MutatorInfo {
    pub(crate) fn new(name: &str, kind: MutatorKind, func: MutatorFn) -> MutatorInfo {
        MutatorInfo {
            name: name.to_string(),
            kind,
            func,
            transition_index: None,
            transition_snapshot: None,
            transition_finalize: None,
            uses_rename: false,
            uses_reverse_dependencies: false,
            uses_replace_dependencies: false,
            uses_create_module: false,
            mutates_dependencies: false,
            mutates_global_state: false,
        }
    }

    pub fn uses_rename(&mut self) -> &mut MutatorInfo {
        self.uses_rename = true;
        self
    }

    pub fn uses_reverse_dependencies(&mut self) -> &mut MutatorInfo {
        self.uses_reverse_dependencies = true;
        self
    }

    pub fn uses_replace_dependencies(&mut self) -> &mut MutatorInfo {
        self.uses_replace_dependencies = true;
        self
    }

    pub fn uses_create_module(&mut self) -> &mut MutatorInfo {
        self.uses_create_module = true;
        self
    }

    /// Declares that this mutator reads or writes dependency modules'
    /// state. Required for `with_other_module_mut`.
    pub fn mutates_dependencies(&mut self) -> &mut MutatorInfo {
        self.mutates_dependencies = true;
        self
    }

    pub fn mutates_global_state(&mut self) -> &mut MutatorInfo {
        self.mutates_global_state = true;
        self
    }

    fn coalescable(&self) -> bool {
        matches!(self.kind, MutatorKind::BottomUp)
            && self.transition_index.is_none()
            && !self.uses_rename
            && !self.uses_reverse_dependencies
            && !self.uses_replace_dependencies
            && !self.uses_create_module
            && !self.mutates_dependencies
            && !self.mutates_global_state
    }
}

/// Tag-based predicate for `replace_dependencies_if`.
pub type ReplacePredicate = Arc<dyn Fn(Option<&Tag>) -> bool + Send + Sync>;

/// Structural changes applied after the pass.
pub(crate) enum Delta {
    Split {
        orig: VariantId,
        news: Vec<VariantId>,
    },
    ReverseDep {
        from: VariantId,
        target_name: String,
        variations: VariationMap,
        tag: Option<Tag>,
    },
    Replace {
        from: VariantId,
        target_name: String,
        pred: Option<ReplacePredicate>,
    },
    Rename {
        from: VariantId,
        new_name: String,
    },
    NewModule {
        factory: ModuleFactory,
        type_name: String,
        dir: String,
        pos: Position,
        configure: Box<dyn FnOnce(&mut dyn Module) + Send>,
    },
    Errors(Vec<Error>),
}

/// A handle to one variant produced by `create_variations`.
#[derive(Clone, Copy, Debug)]
pub struct SplitModule {
    pub id: VariantId,
}

/// The context a mutator function runs with, scoped to one variant.
pub struct MutatorContext<'a> {
    pub(crate) ctx: &'a Context,
    pub(crate) id: VariantId,
    pub(crate) mutator_index: usize,
    pub(crate) mutator_name: &'a str,
    pub(crate) kind: &'a MutatorKind,
    pub(crate) module: &'a mut Box<dyn Module>,
    pub(crate) errors: Vec<Error>,
    pub(crate) deltas: &'a Sender<Delta>,
    pub(crate) pause: &'a (dyn Fn(VariantId) -> bool + Sync),
    pub(crate) split: bool,
}

impl MutatorContext<'_> {
    pub fn module_name(&self) -> String {
        self.ctx.with_variant(self.id, |v| v.name.clone())
    }

    pub fn module_dir(&self) -> String {
        self.ctx.with_variant(self.id, |v| v.dir.clone())
    }

    pub fn module_type(&self) -> String {
        self.ctx.with_variant(self.id, |v| v.type_name.clone())
    }

    pub fn module_id(&self) -> VariantId {
        self.id
    }

    pub fn mutator_name(&self) -> &str {
        self.mutator_name
    }

    pub fn config(&self) -> Arc<dyn Config> {
        self.ctx.config.clone()
    }

    /// The logic module being mutated; downcast via `as_any_mut`.
    pub fn module(&mut self) -> &mut dyn Module {
        self.module.as_mut()
    }

    pub fn errorf(&mut self, message: impl Into<String>) {
        let (pos, name) = self.ctx.with_variant(self.id, |v| (v.pos.clone(), v.display_name()));
        self.errors.push(Error::module(pos, name, message));
    }

    fn bottom_up_only(&self, what: &str) {
        if !matches!(self.kind, MutatorKind::BottomUp) {
            panic!("{} may only be called from a bottom-up mutator", what);
        }
    }

    // ---- dependency edges ------------------------------------------------

    /// Adds dependencies on the named modules in this variant's own
    /// configuration, pausing until each target has been processed by the
    /// current pass.
    pub fn add_dependency(&mut self, tag: Option<Tag>, names: &[&str]) -> Vec<VariantId> {
        self.add_with_variations(&VariationMap::new(), tag, names, false)
    }

    /// Like `add_dependency` with explicit variation requirements layered on
    /// this variant's configuration.
    pub fn add_variation_dependencies(
        &mut self,
        variations: &[(&str, &str)],
        tag: Option<Tag>,
        names: &[&str],
    ) -> Vec<VariantId> {
        self.add_with_variations(&vmap(variations), tag, names, false)
    }

    /// Explicit variations only; the target need not match this variant's
    /// other axes (`never_far` mutators excepted).
    pub fn add_far_variation_dependencies(
        &mut self,
        variations: &[(&str, &str)],
        tag: Option<Tag>,
        names: &[&str],
    ) -> Vec<VariantId> {
        self.add_with_variations(&vmap(variations), tag, names, true)
    }

    fn add_with_variations(
        &mut self,
        variations: &VariationMap,
        tag: Option<Tag>,
        names: &[&str],
        far: bool,
    ) -> Vec<VariantId> {
        self.bottom_up_only("add_dependency");
        let mut out = Vec::new();
        for name in names {
            match self.ctx.add_resolved_dep(self.id, name, tag.clone(), variations, far) {
                Ok(Some(target)) => {
                    if !(self.pause)(target) {
                        return out; // pass is aborting
                    }
                    out.push(target);
                }
                Ok(None) => {}
                Err(e) => self.errors.push(e),
            }
        }
        out
    }

    /// Makes the named module depend on the current one. Applied after the
    /// pass, in deterministic name order.
    pub fn add_reverse_dependency(&mut self, tag: Option<Tag>, name: &str) {
        self.add_reverse_variation_dependency(&[], tag, name)
    }

    pub fn add_reverse_variation_dependency(
        &mut self,
        variations: &[(&str, &str)],
        tag: Option<Tag>,
        name: &str,
    ) {
        self.require_flag("add_reverse_dependency", |m| m.uses_reverse_dependencies);
        let _ = self.deltas.send(Delta::ReverseDep {
            from: self.id,
            target_name: name.to_string(),
            variations: vmap(variations),
            tag,
        });
    }

    /// Rewrites every incoming edge of the named module (in this variant's
    /// configuration) to point at this variant instead.
    pub fn replace_dependencies(&mut self, name: &str) {
        self.require_flag("replace_dependencies", |m| m.uses_replace_dependencies);
        let _ = self.deltas.send(Delta::Replace {
            from: self.id,
            target_name: name.to_string(),
            pred: None,
        });
    }

    pub fn replace_dependencies_if(&mut self, name: &str, pred: ReplacePredicate) {
        self.require_flag("replace_dependencies_if", |m| m.uses_replace_dependencies);
        let _ = self.deltas.send(Delta::Replace {
            from: self.id,
            target_name: name.to_string(),
            pred: Some(pred),
        });
    }

    /// Changes this module's visible name once the pass completes.
    pub fn rename(&mut self, new_name: &str) {
        self.require_flag("rename", |m| m.uses_rename);
        let _ = self.deltas.send(Delta::Rename { from: self.id, new_name: new_name.to_string() });
    }

    /// Registers a new module that participates in subsequent mutators.
    /// `configure` must set the `name` property.
    pub fn create_module(
        &mut self,
        factory: ModuleFactory,
        type_name: &str,
        configure: impl FnOnce(&mut dyn Module) + Send + 'static,
    ) {
        self.require_flag("create_module", |m| m.uses_create_module);
        let (dir, pos) = self.ctx.with_variant(self.id, |v| (v.dir.clone(), v.pos.clone()));
        let _ = self.deltas.send(Delta::NewModule {
            factory,
            type_name: type_name.to_string(),
            dir,
            pos,
            configure: Box::new(configure),
        });
    }

    fn require_flag(&self, what: &str, flag: impl Fn(&MutatorInfo) -> bool) {
        if !flag(&self.ctx.mutators[self.mutator_index]) {
            panic!("{} requires the corresponding mutator capability flag", what);
        }
    }

    // ---- splitting -------------------------------------------------------

    /// Splits this variant into one clone per label on the axis named after
    /// the current mutator. The original becomes a tombstone; edges pointing
    /// at it are rewritten to the first clone after the pass.
    pub fn create_variations(&mut self, labels: &[&str]) -> Vec<SplitModule> {
        self.bottom_up_only("create_variations");
        if self.split {
            panic!("create_variations called twice for one module");
        }
        self.split = true;
        let labels: Vec<String> = labels.iter().map(|l| l.to_string()).collect();
        let news =
            self.ctx.create_variant_splits(self.id, self.mutator_name, &labels, &mut *self.module);
        let _ = self.deltas.send(Delta::Split { orig: self.id, news: news.clone() });
        news.into_iter().map(|id| SplitModule { id }).collect()
    }

    /// Runs `f` against a split variant's logic module.
    pub fn with_variation_module<R>(
        &self,
        split: &SplitModule,
        f: impl FnOnce(&mut dyn Module) -> R,
    ) -> R {
        self.ctx.with_variant_mut(split.id, |v| {
            f(v.module.as_mut().expect("split module present").as_mut())
        })
    }

    // ---- providers -------------------------------------------------------

    /// Attaches a provider value to this variant. Write-once; panics on
    /// misuse, which is a module-type bug rather than an input error.
    pub fn set_provider<T: ProviderData>(&mut self, key: ProviderKey<T>, value: T) {
        let mutator = Some(self.mutator_name);
        let result = self.ctx.with_variant_mut(self.id, |v| {
            v.providers.set(key.id(), Arc::new(value) as DynValue, mutator)
        });
        if let Err(msg) = result {
            panic!("set_provider for {}: {}", self.module_name(), msg);
        }
    }

    /// Sets a provider on one of this module's split variants.
    pub fn set_variation_provider<T: ProviderData>(
        &mut self,
        split: &SplitModule,
        key: ProviderKey<T>,
        value: T,
    ) {
        let mutator = Some(self.mutator_name);
        let result = self.ctx.with_variant_mut(split.id, |v| {
            v.providers.set(key.id(), Arc::new(value) as DynValue, mutator)
        });
        if let Err(msg) = result {
            panic!("set_variation_provider: {}", msg);
        }
    }

    pub fn provider<T: ProviderData>(&self, key: ProviderKey<T>) -> Option<Arc<T>> {
        self.other_module_provider(self.id, key)
    }

    /// Reads a provider from another variant, normally a dependency that the
    /// pass ordering guarantees has finished.
    pub fn other_module_provider<T: ProviderData>(
        &self,
        id: VariantId,
        key: ProviderKey<T>,
    ) -> Option<Arc<T>> {
        self.ctx.with_variant(id, |v| v.providers.get(key.id())).map(downcast::<T>)
    }

    // ---- graph inspection ------------------------------------------------

    pub fn visit_direct_deps(&self, mut f: impl FnMut(VariantId, Option<&Tag>)) {
        let deps = self.ctx.with_variant(self.id, |v| v.direct_deps.clone());
        for dep in &deps {
            f(dep.target, dep.tag.as_ref());
        }
    }

    pub fn other_module_name(&self, id: VariantId) -> String {
        self.ctx.with_variant(id, |v| v.name.clone())
    }

    pub fn other_module_type(&self, id: VariantId) -> String {
        self.ctx.with_variant(id, |v| v.type_name.clone())
    }

    /// Read-only access to a dependency's logic module.
    pub fn with_other_module<R>(&self, id: VariantId, f: impl FnOnce(&dyn Module) -> R) -> R {
        self.ctx.with_variant(id, |v| {
            f(v.module.as_ref().expect("dependency module present").as_ref())
        })
    }

    /// Mutable access to a dependency's logic module; only mutators declared
    /// with `mutates_dependencies` (which disables coalescing) may do this.
    pub fn with_other_module_mut<R>(
        &self,
        id: VariantId,
        f: impl FnOnce(&mut dyn Module) -> R,
    ) -> R {
        self.require_flag("with_other_module_mut", |m| m.mutates_dependencies);
        self.ctx.with_variant_mut(id, |v| {
            f(v.module.as_mut().expect("dependency module present").as_mut())
        })
    }

    /// Missing dependencies recorded for this variant. Consulting them here
    /// or in generation keeps them from being reported as errors.
    pub fn get_missing_dependencies(&mut self) -> Vec<String> {
        self.ctx.with_variant_mut(self.id, |v| {
            v.missing_deps_consulted = true;
            v.missing_deps.clone()
        })
    }
}

fn vmap(entries: &[(&str, &str)]) -> VariationMap {
    let mut m = VariationMap::new();
    for (axis, label) in entries {
        m.insert(*axis, *label);
    }
    m
}

impl Context {
    pub fn register_bottom_up_mutator(
        &mut self,
        name: &str,
        f: impl Fn(&mut MutatorContext<'_>) + Send + Sync + 'static,
    ) -> &mut MutatorInfo {
        self.register_mutator(MutatorInfo::new(name, MutatorKind::BottomUp, Arc::new(f)))
    }

    pub fn register_top_down_mutator(
        &mut self,
        name: &str,
        f: impl Fn(&mut MutatorContext<'_>) + Send + Sync + 'static,
    ) -> &mut MutatorInfo {
        self.register_mutator(MutatorInfo::new(name, MutatorKind::TopDown, Arc::new(f)))
    }

    pub(crate) fn register_mutator(&mut self, info: MutatorInfo) -> &mut MutatorInfo {
        if self.mutators.iter().any(|m| m.name == info.name) {
            panic!("mutator {:?} registered twice", info.name);
        }
        self.mutators.push(info);
        self.mutators.last_mut().expect("just pushed")
    }

    /// Runs every registered mutator, coalescing adjacent side-effect-free
    /// bottom-up mutators into single passes.
    pub(crate) fn run_mutators(&mut self, errors: &mut ErrorCollector) {
        let groups = coalesce(&self.mutators);
        info!("running {} mutators in {} passes", self.mutators.len(), groups.len());
        for group in groups {
            if !errors.keep_going() {
                return;
            }
            let had_deltas = self.run_mutator_pass(&group, errors)
                | self.deps_modified.swap(false, Ordering::AcqRel);
            if errors.has_errors() {
                return;
            }
            if had_deltas {
                if let Err(errs) = self.update_dependencies() {
                    errors.extend(errs);
                    return;
                }
            }
            let first = group[0];
            if let Some(t) = self.mutators[first].transition_snapshot {
                self.snapshot_transition_inputs(t);
            }
            if let Some(t) = self.mutators[first].transition_finalize {
                self.finalize_transition(t);
            }
        }
    }

    /// One scheduler pass over all live variants. Returns whether deltas
    /// changed the graph.
    fn run_mutator_pass(&mut self, group: &[usize], errors: &mut ErrorCollector) -> bool {
        let first = group[0];
        let bottom_up = matches!(self.mutators[first].kind, MutatorKind::BottomUp);
        debug!(
            "mutator pass: {}",
            group.iter().map(|&i| self.mutators[i].name.as_str()).collect::<Vec<_>>().join("+"),
        );

        let ids = self.active_variant_ids();
        let local_of: HashMap<VariantId, usize> =
            ids.iter().enumerate().map(|(i, &id)| (id, i)).collect();
        let deps: Vec<Vec<usize>> = ids
            .iter()
            .map(|&id| {
                self.with_variant(id, |v| {
                    let edge_ids = if bottom_up { &v.forward_deps } else { &v.reverse_deps };
                    edge_ids.iter().filter_map(|d| local_of.get(d).copied()).collect()
                })
            })
            .collect();

        let processed: Vec<AtomicBool> = ids.iter().map(|_| AtomicBool::new(false)).collect();
        let (delta_tx, delta_rx) = unbounded::<Delta>();

        {
            let ids = &ids;
            let local_of = &local_of;
            let processed = &processed;
            let delta_tx = &delta_tx;
            let this = &*self;
            let name_of = move |i: usize| this.variant_display(ids[i]);
            let visit = move |i: usize, handle: &PauseHandle<'_>| -> bool {
                let id = ids[i];
                let pause = |target: VariantId| -> bool {
                    match local_of.get(&target) {
                        // Targets outside the pass are treated as processed.
                        None => true,
                        Some(&l) => {
                            if processed[l].load(Ordering::Acquire) {
                                true
                            } else {
                                handle.pause(l)
                            }
                        }
                    }
                };
                let mut cancel = false;
                for &mutator_index in group {
                    if this.with_variant(id, |v| v.obsoleted_by_new_variants) {
                        break; // split by an earlier mutator in this group
                    }
                    let info = &this.mutators[mutator_index];
                    this.with_variant_mut(id, |v| v.started_mutator = Some(mutator_index));
                    let mut module = this.with_variant_mut(id, |v| v.take_module());
                    let mut mctx = MutatorContext {
                        ctx: this,
                        id,
                        mutator_index,
                        mutator_name: &info.name,
                        kind: &info.kind,
                        module: &mut module,
                        errors: Vec::new(),
                        deltas: delta_tx,
                        pause: &pause,
                        split: false,
                    };
                    let result = catch_unwind(AssertUnwindSafe(|| (info.func)(&mut mctx)));
                    let visit_errors = std::mem::take(&mut mctx.errors);
                    drop(mctx);
                    this.with_variant_mut(id, |v| {
                        v.put_module(module);
                        v.finished_mutator = Some(mutator_index);
                    });
                    if !visit_errors.is_empty() {
                        let _ = delta_tx.send(Delta::Errors(visit_errors));
                    }
                    if let Err(payload) = result {
                        let _ = delta_tx.send(Delta::Errors(vec![Error::internal(
                            format!("mutator {} for {}", info.name, this.variant_display(id)),
                            payload,
                        )]));
                        cancel = true;
                        break;
                    }
                }
                processed[i].store(true, Ordering::Release);
                cancel
            };

            if let Err(errs) = parallel_visit(&deps, MUTATOR_PARALLELISM, &name_of, &visit) {
                for e in errs {
                    errors.add(e);
                }
            }
        }

        drop(delta_tx);
        let deltas: Vec<Delta> = delta_rx.try_iter().collect();
        let had_structural = deltas.iter().any(|d| !matches!(d, Delta::Errors(_)));
        self.apply_deltas(deltas, group, errors);
        had_structural
    }

    /// Applies post-pass deltas in a fixed order: splits first so later
    /// resolutions see the new variants, then reverse deps (sorted), then
    /// replacements, renames, and new modules.
    fn apply_deltas(&mut self, deltas: Vec<Delta>, group: &[usize], errors: &mut ErrorCollector) {
        let mut splits = Vec::new();
        let mut reverses = Vec::new();
        let mut replaces = Vec::new();
        let mut renames = Vec::new();
        let mut creations = Vec::new();
        for delta in deltas {
            match delta {
                Delta::Split { orig, news } => splits.push((orig, news)),
                Delta::ReverseDep { .. } => reverses.push(delta),
                Delta::Replace { .. } => replaces.push(delta),
                Delta::Rename { .. } => renames.push(delta),
                Delta::NewModule { .. } => creations.push(delta),
                Delta::Errors(errs) => errors.extend(errs),
            }
        }

        self.apply_splits(splits);

        // Deterministic application order regardless of visit scheduling.
        reverses.sort_by_key(|d| match d {
            Delta::ReverseDep { target_name, from, .. } => {
                (target_name.clone(), self.variant_display(*from))
            }
            _ => unreachable!(),
        });
        for delta in reverses {
            if let Delta::ReverseDep { from, target_name, variations, tag } = delta {
                match self.find_variant_for_dep(from, &target_name, &variations, false) {
                    Ok(Some(target)) => {
                        self.with_variant_mut(target, |v| {
                            v.direct_deps.push(Dep { target: from, tag });
                        });
                    }
                    Ok(None) => {}
                    Err(e) => errors.add(e),
                }
            }
        }

        for delta in replaces {
            if let Delta::Replace { from, target_name, pred } = delta {
                self.apply_replacement(from, &target_name, pred, errors);
            }
        }

        for delta in renames {
            if let Delta::Rename { from, new_name } = delta {
                self.apply_rename(from, &new_name, errors);
            }
        }

        let last_mutator = *group.last().expect("group is non-empty");
        for delta in creations {
            if let Delta::NewModule { factory, type_name, dir, pos, configure } = delta {
                let created = self.register_programmatic_module(
                    factory,
                    &type_name,
                    &dir,
                    pos,
                    configure,
                    errors,
                );
                if let Some(id) = created {
                    // Participates in subsequent mutators only.
                    self.with_variant_mut(id, |v| {
                        v.started_mutator = Some(last_mutator);
                        v.finished_mutator = Some(last_mutator);
                    });
                }
            }
        }
    }

    fn apply_splits(&mut self, splits: Vec<(VariantId, Vec<VariantId>)>) {
        if splits.is_empty() {
            return;
        }
        for (orig, news) in &splits {
            let group = self.with_variant(*orig, |v| v.group);
            let variants = &mut self.groups[group.idx()].variants;
            let at = variants.iter().position(|v| v == orig).expect("split source in its group");
            variants.splice(at..=at, news.iter().copied());
        }
        // Rewrite edges that still point at a tombstone to its first clone.
        let replacement: HashMap<VariantId, VariantId> =
            splits.iter().map(|(orig, news)| (*orig, news[0])).collect();
        let count = self.variant_count();
        for idx in 0..count {
            let id = VariantId(idx as u32);
            self.with_variant_mut(id, |v| {
                if v.obsoleted_by_new_variants {
                    return;
                }
                for dep in &mut v.direct_deps {
                    if let Some(&new) = replacement.get(&dep.target) {
                        dep.target = new;
                    }
                }
            });
        }
    }

    fn apply_replacement(
        &mut self,
        from: VariantId,
        target_name: &str,
        pred: Option<ReplacePredicate>,
        errors: &mut ErrorCollector,
    ) {
        let target = match self.find_variant_for_dep(from, target_name, &VariationMap::new(), false)
        {
            Ok(Some(t)) => t,
            Ok(None) => return,
            Err(e) => {
                errors.add(e);
                return;
            }
        };
        if target == from {
            let (pos, name) = self.with_variant(from, |v| (v.pos.clone(), v.display_name()));
            errors.add(Error::module(pos, name, "replacing a dependency on itself"));
            return;
        }
        for id in self.active_variant_ids() {
            self.with_variant_mut(id, |v| {
                for dep in &mut v.direct_deps {
                    if dep.target == target && pred.as_ref().map_or(true, |p| p(dep.tag.as_ref())) {
                        dep.target = from;
                    }
                }
            });
        }
    }

    fn apply_rename(&mut self, from: VariantId, new_name: &str, errors: &mut ErrorCollector) {
        let (group, old_name, pos) =
            self.with_variant(from, |v| (v.group, v.name.clone(), v.pos.clone()));
        if let Err(msg) = self.names.rename(&old_name, new_name, group) {
            errors.add(Error::module(pos, old_name, msg));
            return;
        }
        self.groups[group.idx()].name = new_name.to_string();
        let variants = self.groups[group.idx()].variants.clone();
        for vid in variants {
            self.with_variant_mut(vid, |v| v.name = new_name.to_string());
        }
    }

    /// Clones one variant per label. Shared by `create_variations` and the
    /// transition splitter. The group splice happens post-pass; until then
    /// the original is a tombstone other visitors may still resolve to.
    ///
    /// `module` is the original's logic module, checked out by the running
    /// visitor; its property state seeds every clone.
    pub(crate) fn create_variant_splits(
        &self,
        orig: VariantId,
        axis: &str,
        labels: &[String],
        module: &mut Box<dyn Module>,
    ) -> Vec<VariantId> {
        // Snapshot outside the arena write lock; locks here do not nest.
        let src = self.with_variant(orig, |src| SplitSeed {
            group: src.group,
            name: src.name.clone(),
            type_name: src.type_name.clone(),
            factory: src.factory,
            pos: src.pos.clone(),
            dir: src.dir.clone(),
            property_positions: src.property_positions.clone(),
            variations: src.variations.clone(),
            variant_label: src.variant_label.clone(),
            direct_deps: src.direct_deps.clone(),
            providers: src.providers.clone_for_split(),
            transition_infos: src.transition_infos.clone(),
            missing_deps: src.missing_deps.clone(),
            started_mutator: src.started_mutator,
            finished_mutator: src.finished_mutator,
        });

        let mut news = Vec::with_capacity(labels.len());
        for label in labels {
            let mut new_module = (src.factory)();
            copy_module_properties(module.as_mut(), new_module.as_mut());
            let id = self.push_variant_record(|id| {
                let mut clone = Variant::new(
                    id,
                    src.group,
                    src.name.clone(),
                    src.type_name.clone(),
                    src.factory,
                    src.pos.clone(),
                    src.dir.clone(),
                    new_module,
                    src.property_positions.clone(),
                );
                clone.variations = src.variations.clone();
                clone.variant_label = src.variant_label.clone();
                clone.push_variation(axis, label);
                clone.direct_deps = src.direct_deps.clone();
                clone.providers = src.providers.clone_for_split();
                clone.transition_infos = src.transition_infos.clone();
                clone.missing_deps = src.missing_deps.clone();
                clone.started_mutator = src.started_mutator;
                clone.finished_mutator = src.finished_mutator;
                clone
            });
            news.push(id);
        }
        self.with_variant_mut(orig, |v| {
            v.obsoleted_by_new_variants = true;
            v.split_modules = news.clone();
        });
        news
    }

    /// Replaces every live module with a fresh clone of its property state
    /// so post-mutator code cannot mutate what other variants observed.
    pub(crate) fn clone_modules_after_mutators(&mut self) {
        for id in self.active_variant_ids() {
            let factory = self.with_variant(id, |v| v.factory);
            let mut old = self.with_variant_mut(id, |v| v.take_module());
            let mut fresh = factory();
            copy_module_properties(old.as_mut(), fresh.as_mut());
            self.with_variant_mut(id, |v| v.put_module(fresh));
            drop(old);
        }
    }
}

/// Everything a split clone inherits from its original.
struct SplitSeed {
    group: GroupId,
    name: String,
    type_name: String,
    factory: ModuleFactory,
    pos: Position,
    dir: String,
    property_positions: crate::properties::PropertyPositions,
    variations: VariationMap,
    variant_label: String,
    direct_deps: Vec<Dep>,
    providers: crate::provider::ProviderTable,
    transition_infos: HashMap<usize, crate::transition::TransitionInfoRef>,
    missing_deps: Vec<String>,
    started_mutator: Option<usize>,
    finished_mutator: Option<usize>,
}

/// Field-by-field property copy between two modules from the same factory.
pub(crate) fn copy_module_properties(src: &mut dyn Module, dst: &mut dyn Module) {
    let mut src_structs = src.property_structs();
    let mut dst_structs = dst.property_structs();
    assert_eq!(src_structs.len(), dst_structs.len(), "modules differ in property struct count");
    for (s, d) in src_structs.iter_mut().zip(dst_structs.iter_mut()) {
        copy_properties(&mut **s, &mut **d);
    }
}

/// Groups adjacent coalescable mutators; every other mutator forms its own
/// singleton group.
fn coalesce(mutators: &[MutatorInfo]) -> Vec<Vec<usize>> {
    let mut groups: Vec<Vec<usize>> = Vec::new();
    for (i, m) in mutators.iter().enumerate() {
        match groups.last_mut() {
            Some(last) if m.coalescable() && mutators[*last.last().expect("non-empty")].coalescable() => {
                last.push(i)
            }
            _ => groups.push(vec![i]),
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flag_info(name: &str, f: impl FnOnce(&mut MutatorInfo)) -> MutatorInfo {
        let mut info =
            MutatorInfo::new(name, MutatorKind::BottomUp, Arc::new(|_: &mut MutatorContext<'_>| {}));
        f(&mut info);
        info
    }

    #[test]
    fn coalescing_groups_adjacent_simple_mutators() {
        let mutators = vec![
            flag_info("a", |_| {}),
            flag_info("b", |_| {}),
            flag_info("c", |m| {
                m.uses_rename();
            }),
            flag_info("d", |_| {}),
            flag_info("e", |_| {}),
        ];
        assert_eq!(coalesce(&mutators), vec![vec![0, 1], vec![2], vec![3, 4]]);
    }

    #[test]
    fn top_down_is_never_coalesced() {
        let mut td =
            MutatorInfo::new("td", MutatorKind::TopDown, Arc::new(|_: &mut MutatorContext<'_>| {}));
        td.transition_index = None;
        let mutators = vec![flag_info("a", |_| {}), td, flag_info("b", |_| {})];
        assert_eq!(coalesce(&mutators), vec![vec![0], vec![1], vec![2]]);
    }
}
