//! Dependency resolution.
//!
//! Seeds each variant's direct dependencies from the built-in deps pass
//! (`Module::dynamic_dependencies`), then derives forward and reverse
//! dependency lists and checks the graph for cycles. Forward deps order a
//! variant after its dependencies *and* after its earlier siblings in the
//! group, so split variants of one module never run concurrently.

use crate::config::Config;
use crate::context::Context;
use crate::errors::{Error, ErrorCollector};
use crate::module::{Dep, Tag, VariantId, VariationMap};
use log::debug;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Context handed to `Module::dynamic_dependencies`.
pub struct DynamicDependerContext<'a> {
    pub(crate) ctx: &'a Context,
    pub(crate) id: VariantId,
    pub(crate) errors: Vec<Error>,
}

impl DynamicDependerContext<'_> {
    pub fn module_name(&self) -> String {
        self.ctx.with_variant(self.id, |v| v.name.clone())
    }

    pub fn module_dir(&self) -> String {
        self.ctx.with_variant(self.id, |v| v.dir.clone())
    }

    pub fn config(&self) -> Arc<dyn Config> {
        self.ctx.config.clone()
    }

    pub fn errorf(&mut self, message: impl Into<String>) {
        let (pos, name) = self.ctx.with_variant(self.id, |v| (v.pos.clone(), v.name.clone()));
        self.errors.push(Error::module(pos, name, message));
    }
}

impl Context {
    /// Seeds direct deps, computes forward/reverse deps, then runs the
    /// registered mutators. The usual second phase of the pipeline.
    pub fn resolve_dependencies(&mut self) -> Result<(), Vec<Error>> {
        let mut errors = ErrorCollector::new();
        self.seed_dynamic_deps(&mut errors);
        if errors.has_errors() {
            return errors.into_result();
        }
        if let Err(errs) = self.update_dependencies() {
            errors.extend(errs);
            return errors.into_result();
        }
        self.run_mutators(&mut errors);
        if !errors.has_errors() {
            self.clone_modules_after_mutators();
        }
        errors.into_result()
    }

    fn seed_dynamic_deps(&mut self, errors: &mut ErrorCollector) {
        for id in self.active_variant_ids() {
            if !errors.keep_going() {
                return;
            }
            let mut module = self.with_variant_mut(id, |v| v.take_module());
            let mut dctx = DynamicDependerContext { ctx: self, id, errors: Vec::new() };
            let names = module.dynamic_dependencies(&mut dctx);
            let dep_errors = dctx.errors;
            self.with_variant_mut(id, |v| v.put_module(module));
            errors.extend(dep_errors);
            for name in names {
                // Dynamic deps carry no tag.
                match self.add_resolved_dep(id, &name, None, &VariationMap::new(), false) {
                    Ok(_) => {}
                    Err(e) => errors.add(e),
                }
            }
        }
    }

    /// Resolves `name` to a variant as seen from `from` and appends a direct
    /// dep edge. `Ok(None)` means the dependency was missing but allowed and
    /// has been recorded on the variant.
    pub(crate) fn add_resolved_dep(
        &self,
        from: VariantId,
        name: &str,
        tag: Option<Tag>,
        variations: &VariationMap,
        far: bool,
    ) -> Result<Option<VariantId>, Error> {
        match self.find_variant_for_dep(from, name, variations, far)? {
            Some(target) => {
                self.with_variant_mut(from, |v| v.direct_deps.push(Dep { target, tag }));
                self.deps_modified.store(true, std::sync::atomic::Ordering::Release);
                Ok(Some(target))
            }
            None => {
                self.with_variant_mut(from, |v| v.missing_deps.push(name.to_string()));
                Ok(None)
            }
        }
    }

    /// Picks the variant of module `name` matching the requesting variant's
    /// configuration: explicit variations are hard requirements, completed
    /// transition mutators are replayed, and the closest existing variant
    /// wins among what remains.
    pub(crate) fn find_variant_for_dep(
        &self,
        from: VariantId,
        name: &str,
        variations: &VariationMap,
        far: bool,
    ) -> Result<Option<VariantId>, Error> {
        let (from_name, from_dir, from_pos, from_variations) = self.with_variant(from, |v| {
            (v.name.clone(), v.dir.clone(), v.pos.clone(), v.variations.clone())
        });

        let group = match self.names.module_from_name(name, &from_dir) {
            Some(g) => g,
            None => {
                if self.allow_missing_deps {
                    debug!("allowing missing dependency {:?} of {:?}", name, from_name);
                    return Ok(None);
                }
                return Err(Error::module(
                    from_pos,
                    from_name.clone(),
                    self.names.missing_dependency_error(&from_name, name),
                ));
            }
        };

        let base = if far { VariationMap::new() } else { from_variations.clone() };
        let mut want = base.overlaid(variations);
        self.replay_transitions(from, group, &from_variations, variations, far, &mut want);

        let never_far = self.never_far_axes();
        let candidates: Vec<VariantId> = self
            .group(group)
            .variants
            .iter()
            .copied()
            .filter(|&vid| !self.with_variant(vid, |v| v.obsoleted_by_new_variants))
            .collect();

        let viable: Vec<VariantId> = candidates
            .iter()
            .copied()
            .filter(|&vid| {
                self.with_variant(vid, |v| {
                    if far {
                        let mut far_want = variations.clone();
                        for axis in &never_far {
                            if let Some(label) = want.get(axis) {
                                far_want.insert(axis.clone(), label.to_string());
                            }
                        }
                        v.variations.matches_far(&far_want, &never_far)
                    } else {
                        // Explicitly requested axes are hard requirements.
                        variations
                            .iter()
                            .all(|(axis, label)| v.variations.get(axis).unwrap_or("") == label)
                    }
                })
            })
            .collect();

        if viable.is_empty() {
            return Err(Error::module(
                from_pos,
                from_name,
                format!("dependency {:?} of variant ({}) not found", name, want),
            ));
        }

        let chosen = viable
            .iter()
            .copied()
            .max_by_key(|&vid| self.with_variant(vid, |v| v.variations.closeness(&want)))
            .expect("viable is non-empty");
        // max_by_key returns the last maximum; prefer the first for
        // determinism with group order.
        let best = self.with_variant(chosen, |v| v.variations.closeness(&want));
        let chosen = viable
            .into_iter()
            .find(|&vid| self.with_variant(vid, |v| v.variations.closeness(&want)) == best)
            .expect("a best candidate exists");

        if chosen == from {
            return Err(Error::module(from_pos, from_name, "depends on itself"));
        }
        Ok(Some(chosen))
    }

    /// Recomputes forward deps (earlier siblings ∪ direct-dep targets) and
    /// reverse deps for every live variant, then checks for cycles.
    pub(crate) fn update_dependencies(&mut self) -> Result<(), Vec<Error>> {
        let ids = self.active_variant_ids();
        let live: HashSet<VariantId> = ids.iter().copied().collect();

        for group_idx in 0..self.groups.len() {
            let variants: Vec<VariantId> = self.groups[group_idx]
                .variants
                .iter()
                .copied()
                .filter(|v| live.contains(v))
                .collect();
            for (i, &vid) in variants.iter().enumerate() {
                let mut forward: Vec<VariantId> = variants[..i].to_vec();
                self.with_variant(vid, |v| {
                    for dep in &v.direct_deps {
                        forward.push(dep.target);
                    }
                });
                let forward = first_unique_ids(forward);
                self.with_variant_mut(vid, |v| {
                    v.forward_deps = forward;
                    v.reverse_deps.clear();
                });
            }
        }

        let mut reverse: HashMap<VariantId, Vec<VariantId>> = HashMap::new();
        for &vid in &ids {
            let forward = self.with_variant(vid, |v| v.forward_deps.clone());
            for dep in forward {
                reverse.entry(dep).or_default().push(vid);
            }
        }
        for (vid, mut rdeps) in reverse {
            rdeps.sort();
            self.with_variant_mut(vid, |v| v.reverse_deps = rdeps);
        }

        self.check_cycles(&ids)
    }

    fn check_cycles(&self, ids: &[VariantId]) -> Result<(), Vec<Error>> {
        let mut color: HashMap<VariantId, u8> = HashMap::new();
        let mut errors = Vec::new();
        for &start in ids {
            if color.get(&start).copied().unwrap_or(0) != 0 {
                continue;
            }
            let mut stack = Vec::new();
            self.cycle_dfs(start, &mut color, &mut stack, &mut errors);
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn cycle_dfs(
        &self,
        node: VariantId,
        color: &mut HashMap<VariantId, u8>,
        stack: &mut Vec<VariantId>,
        errors: &mut Vec<Error>,
    ) {
        color.insert(node, 1);
        stack.push(node);
        let deps = self.with_variant(node, |v| v.forward_deps.clone());
        for dep in deps {
            match color.get(&dep).copied().unwrap_or(0) {
                0 => self.cycle_dfs(dep, color, stack, errors),
                1 => {
                    let at = stack.iter().position(|&s| s == dep).expect("grey node on stack");
                    let cycle = &stack[at..];
                    errors.push(Error::misc("encountered dependency cycle"));
                    for (i, &a) in cycle.iter().enumerate() {
                        let b = cycle[(i + 1) % cycle.len()];
                        let (pos, a_name) =
                            self.with_variant(a, |v| (v.pos.clone(), v.display_name()));
                        let b_name = self.variant_display(b);
                        errors.push(Error::module(
                            pos,
                            a_name,
                            format!("depends on {}", b_name),
                        ));
                    }
                }
                _ => {}
            }
        }
        stack.pop();
        color.insert(node, 2);
    }

    /// Axes whose labels must match even across `far` dependencies.
    pub(crate) fn never_far_axes(&self) -> Vec<String> {
        self.transition_mutators
            .iter()
            .filter(|t| t.never_far)
            .map(|t| t.name.clone())
            .collect()
    }
}

fn first_unique_ids(ids: Vec<VariantId>) -> Vec<VariantId> {
    let mut seen = HashSet::new();
    ids.into_iter().filter(|id| seen.insert(*id)).collect()
}
