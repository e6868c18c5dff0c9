//! Transition mutators.
//!
//! A transition mutator decides, per dependency edge, which variation of the
//! target a source takes: the source computes an outgoing transition, the
//! destination accepts or rewrites it via its incoming transition, and the
//! destination later splits into exactly the set of variations someone
//! demanded. Registration expands into three ordinary mutators: a top-down
//! propagate, a bottom-up splitter, and a bottom-up mutate.

use crate::config::Config;
use crate::context::Context;
use crate::module::{Module, Tag, VariantId};
use crate::mutator::{MutatorContext, MutatorInfo, MutatorKind};
use std::any::Any;
use std::collections::HashSet;
use std::sync::Arc;

/// One selected variation plus whatever extra payload the mutator wants to
/// carry between its phases.
pub trait TransitionInfo: Any + Send + Sync {
    /// The variation label this info selects. Empty means "unsplit".
    fn variation(&self) -> String;
    fn as_any(&self) -> &dyn Any;
}

pub type TransitionInfoRef = Arc<dyn TransitionInfo>;

/// The simplest info: just a label.
#[derive(Clone, Debug)]
pub struct VariationLabel(pub String);

impl TransitionInfo for VariationLabel {
    fn variation(&self) -> String {
        self.0.clone()
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub trait TransitionMutator: Send + Sync {
    /// The module's intrinsic variations, in the order its variants should
    /// appear. Empty means the module only splits if a dependent demands it.
    fn split(&self, ctx: &TransitionContext<'_>) -> Vec<TransitionInfoRef>;

    /// Source-side rewrite of the variation a dependency edge carries.
    fn outgoing_transition(
        &self,
        ctx: &TransitionContext<'_>,
        source_info: &TransitionInfoRef,
    ) -> TransitionInfoRef;

    /// Destination-side accept/reject, yielding the final variation.
    fn incoming_transition(
        &self,
        ctx: &TransitionContext<'_>,
        incoming: TransitionInfoRef,
    ) -> TransitionInfoRef;

    /// Per-variant side effects once splitting is done, e.g. setting
    /// providers.
    fn mutate(&self, ctx: &mut MutatorContext<'_>, info: TransitionInfoRef);

    /// Reverse lookup for dependencies added after this mutator ran.
    fn transition_info_from_variation(&self, label: &str) -> TransitionInfoRef;

    /// When true, even `far` dependencies must agree on this mutator's
    /// label.
    fn never_far(&self) -> bool {
        false
    }
}

/// Read-only view of one module for transition callbacks.
pub struct TransitionContext<'a> {
    pub(crate) ctx: &'a Context,
    pub(crate) id: VariantId,
    pub(crate) dep_tag: Option<&'a Tag>,
}

impl TransitionContext<'_> {
    pub fn module_name(&self) -> String {
        self.ctx.with_variant(self.id, |v| v.name.clone())
    }

    pub fn module_type(&self) -> String {
        self.ctx.with_variant(self.id, |v| v.type_name.clone())
    }

    pub fn module_dir(&self) -> String {
        self.ctx.with_variant(self.id, |v| v.dir.clone())
    }

    pub fn config(&self) -> Arc<dyn Config> {
        self.ctx.config.clone()
    }

    /// The tag of the edge being transitioned; `None` in split contexts.
    pub fn dep_tag(&self) -> Option<&Tag> {
        self.dep_tag
    }

    pub fn with_module<R>(&self, f: impl FnOnce(&dyn Module) -> R) -> R {
        self.ctx.with_variant(self.id, |v| {
            f(v.module.as_ref().expect("module present").as_ref())
        })
    }
}

pub(crate) struct TransitionMutatorRecord {
    pub name: String,
    pub imp: Arc<dyn TransitionMutator>,
    pub never_far: bool,
    /// Set after the mutate phase; gates replay for late-added deps.
    pub finished: bool,
    /// Snapshot of the variants that existed when propagate finished.
    pub input_variants: Vec<VariantId>,
}

impl Context {
    /// Registers a transition mutator as its propagate/split/mutate trio.
    /// The split mutator carries the transition's name, so that name is also
    /// the variation axis.
    pub fn register_transition_mutator(&mut self, name: &str, imp: Arc<dyn TransitionMutator>) {
        let t_index = self.transition_mutators.len();
        self.transition_mutators.push(TransitionMutatorRecord {
            name: name.to_string(),
            never_far: imp.never_far(),
            imp,
            finished: false,
            input_variants: Vec::new(),
        });

        let propagate_name = format!("{}_propagate", name);
        let info = self.register_mutator(MutatorInfo::new(
            &propagate_name,
            MutatorKind::TopDown,
            Arc::new(move |mctx: &mut MutatorContext<'_>| transition_propagate(mctx, t_index)),
        ));
        info.transition_index = Some(t_index);
        info.transition_snapshot = Some(t_index);

        let info = self.register_mutator(MutatorInfo::new(
            name,
            MutatorKind::BottomUp,
            Arc::new(move |mctx: &mut MutatorContext<'_>| transition_split(mctx, t_index)),
        ));
        info.transition_index = Some(t_index);

        let mutate_name = format!("{}_mutate", name);
        let info = self.register_mutator(MutatorInfo::new(
            &mutate_name,
            MutatorKind::BottomUp,
            Arc::new(move |mctx: &mut MutatorContext<'_>| transition_mutate(mctx, t_index)),
        ));
        info.transition_index = Some(t_index);
        info.transition_finalize = Some(t_index);
    }

    /// After propagate: remember which variants fed the split phase.
    pub(crate) fn snapshot_transition_inputs(&mut self, t_index: usize) {
        let ids = self.active_variant_ids();
        self.transition_mutators[t_index].input_variants = ids;
        log::debug!(
            "transition {}: {} input variants",
            self.transition_mutators[t_index].name,
            self.transition_mutators[t_index].input_variants.len(),
        );
    }

    /// After mutate: drop transient per-variant state and open the mutator
    /// up for replay on late-added dependencies.
    pub(crate) fn finalize_transition(&mut self, t_index: usize) {
        for idx in 0..self.variant_count() {
            self.with_variant_mut(VariantId(idx as u32), |v| {
                v.incoming_transition_infos.clear();
                v.split_transition_infos.clear();
                v.outgoing_transition_cache.clear();
            });
        }
        self.transition_mutators[t_index].finished = true;
    }

    /// Replays finished transition mutators for a dependency added after
    /// they ran: explicit variations win, otherwise the source's stored info
    /// flows through outgoing+incoming, and the caller picks the closest
    /// existing variant.
    pub(crate) fn replay_transitions(
        &self,
        from: VariantId,
        group: crate::module::GroupId,
        from_variations: &crate::module::VariationMap,
        explicit: &crate::module::VariationMap,
        far: bool,
        want: &mut crate::module::VariationMap,
    ) {
        // The incoming transition runs in the context of the target; any
        // live variant of the group serves as that context.
        let target_ctx_id = self
            .group(group)
            .variants
            .iter()
            .copied()
            .find(|&vid| !self.with_variant(vid, |v| v.obsoleted_by_new_variants));

        for (t_index, rec) in self.transition_mutators.iter().enumerate() {
            if !rec.finished {
                continue;
            }
            let axis = rec.name.as_str();
            if let Some(label) = explicit.get(axis) {
                want.insert(axis, label.to_string());
                continue;
            }
            if far && !rec.never_far {
                want.0.remove(axis);
                continue;
            }
            let source_info = self
                .with_variant(from, |v| v.transition_infos.get(&t_index).cloned())
                .unwrap_or_else(|| {
                    rec.imp
                        .transition_info_from_variation(from_variations.get(axis).unwrap_or(""))
                });
            let out = rec.imp.outgoing_transition(
                &TransitionContext { ctx: self, id: from, dep_tag: None },
                &source_info,
            );
            let target_id = target_ctx_id.unwrap_or(from);
            let fin = rec.imp.incoming_transition(
                &TransitionContext { ctx: self, id: target_id, dep_tag: None },
                out,
            );
            want.insert(axis, fin.variation());
        }
    }
}

/// Top-down phase: compute this variant's demanded variations, push the
/// outgoing/incoming composition onto each direct dep, and cache the labels
/// for the split phase.
fn transition_propagate(mctx: &mut MutatorContext<'_>, t_index: usize) {
    let ctx = mctx.ctx;
    let id = mctx.module_id();
    let imp = ctx.transition_mutators[t_index].imp.clone();

    let split_infos = imp.split(&TransitionContext { ctx, id, dep_tag: None });
    let incoming = ctx.with_variant_mut(id, |v| {
        v.split_transition_infos = split_infos.clone();
        v.incoming_transition_infos.clone()
    });
    let source_infos = ordered_infos(&imp, split_infos, incoming);

    let deps = ctx.with_variant(id, |v| v.direct_deps.clone());
    for si in &source_infos {
        let mut labels = Vec::with_capacity(deps.len());
        for dep in &deps {
            let out = imp.outgoing_transition(
                &TransitionContext { ctx, id, dep_tag: dep.tag.as_ref() },
                si,
            );
            let fin = imp.incoming_transition(
                &TransitionContext { ctx, id: dep.target, dep_tag: dep.tag.as_ref() },
                out,
            );
            labels.push(fin.variation());
            // Many sources may demand variations of one target concurrently;
            // the per-variant lock serializes them.
            ctx.with_variant_mut(dep.target, |t| t.incoming_transition_infos.push(fin.clone()));
        }
        let key = si.variation();
        ctx.with_variant_mut(id, |v| {
            v.outgoing_transition_cache.insert(key, labels);
        });
    }
}

/// Bottom-up phase: split into the demanded variations, or just retarget
/// deps when only the empty variation is needed.
fn transition_split(mctx: &mut MutatorContext<'_>, t_index: usize) {
    let ctx = mctx.ctx;
    let id = mctx.module_id();
    let imp = ctx.transition_mutators[t_index].imp.clone();
    let axis = ctx.transition_mutators[t_index].name.clone();

    let (split_infos, incoming, cache) = ctx.with_variant(id, |v| {
        (
            v.split_transition_infos.clone(),
            v.incoming_transition_infos.clone(),
            v.outgoing_transition_cache.clone(),
        )
    });
    let infos = ordered_infos(&imp, split_infos, incoming);
    let labels: Vec<String> = infos.iter().map(|i| i.variation()).collect();

    if labels.len() == 1 && labels[0].is_empty() {
        ctx.with_variant_mut(id, |v| {
            v.transition_infos.insert(t_index, infos[0].clone());
        });
        retarget_deps(ctx, id, &axis, cache.get(""));
    } else {
        let label_strs: Vec<&str> = labels.iter().map(String::as_str).collect();
        let splits = mctx.create_variations(&label_strs);
        for (sm, info) in splits.iter().zip(&infos) {
            ctx.with_variant_mut(sm.id, |v| {
                v.transition_infos.insert(t_index, info.clone());
            });
            retarget_deps(ctx, sm.id, &axis, cache.get(&info.variation()));
        }
    }
}

/// Bottom-up phase: hand the chosen info to the mutator for side effects.
fn transition_mutate(mctx: &mut MutatorContext<'_>, t_index: usize) {
    let imp = mctx.ctx.transition_mutators[t_index].imp.clone();
    let info = mctx
        .ctx
        .with_variant(mctx.module_id(), |v| v.transition_infos.get(&t_index).cloned())
        .unwrap_or_else(|| imp.transition_info_from_variation(""));
    imp.mutate(mctx, info);
}

/// Deterministic demanded-variation order: intrinsic split infos first in
/// declared order, then propagate-requested extras sorted by label. A module
/// nobody constrains gets the single empty variation.
fn ordered_infos(
    imp: &Arc<dyn TransitionMutator>,
    split: Vec<TransitionInfoRef>,
    incoming: Vec<TransitionInfoRef>,
) -> Vec<TransitionInfoRef> {
    let mut out: Vec<TransitionInfoRef> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    for info in split {
        if seen.insert(info.variation()) {
            out.push(info);
        }
    }
    let mut extras: Vec<TransitionInfoRef> = Vec::new();
    let mut extra_seen: HashSet<String> = HashSet::new();
    for info in incoming {
        let label = info.variation();
        if !seen.contains(&label) && extra_seen.insert(label) {
            extras.push(info);
        }
    }
    extras.sort_by_key(|i| i.variation());
    out.extend(extras);
    if out.is_empty() {
        out.push(imp.transition_info_from_variation(""));
    }
    out
}

/// Points each direct dep at the target variant carrying the label the
/// propagate phase chose for that edge.
fn retarget_deps(ctx: &Context, id: VariantId, axis: &str, labels: Option<&Vec<String>>) {
    let labels = match labels {
        Some(l) => l,
        None => return,
    };
    let deps = ctx.with_variant(id, |v| v.direct_deps.clone());
    for (i, dep) in deps.iter().enumerate() {
        let label = match labels.get(i) {
            Some(l) => l,
            None => break,
        };
        let new_target = resolve_split_target(ctx, dep.target, axis, label);
        if new_target != dep.target {
            ctx.with_variant_mut(id, |v| v.direct_deps[i].target = new_target);
        }
    }
}

/// Follows a split tombstone to the clone carrying `label` on `axis`. An
/// unsplit target stands for the empty label on every axis.
fn resolve_split_target(ctx: &Context, target: VariantId, axis: &str, label: &str) -> VariantId {
    let (obsoleted, splits) =
        ctx.with_variant(target, |t| (t.obsoleted_by_new_variants, t.split_modules.clone()));
    if !obsoleted {
        return target;
    }
    for &s in &splits {
        if ctx.with_variant(s, |v| v.variations.get(axis).unwrap_or("") == label) {
            return s;
        }
    }
    splits.first().copied().unwrap_or(target)
}
