//! Build-action generation.
//!
//! Stage one walks variants bottom-up, giving each logic module a scoped
//! `ModuleContext` to emit local variables, local rules, and build-defs.
//! Stage two runs singletons over the finished graph. Incremental restore
//! happens at the top of stage one, before a module's generator would run.

use crate::config::Config;
use crate::context::{Context, MUTATOR_PARALLELISM};
use crate::errors::{Error, ErrorCollector};
use crate::module::{Dep, Tag, VariantId};
use crate::package::{NinjaValue, RuleHandle, RuleParams};
use crate::provider::{downcast, DynValue, ProviderData, ProviderKey};
use crate::visitor::{parallel_visit, PauseHandle};
use braid_ninja::is_valid_identifier;
use crossbeam_channel::unbounded;
use log::info;
use rayon::prelude::*;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// How a build-def names its rule.
#[derive(Clone, Debug, PartialEq)]
pub enum RuleRef {
    /// The built-in `phony` rule.
    Phony,
    /// A rule registered through a `PackageContext`.
    Global(RuleHandle),
    /// A rule declared by this module or singleton via `rule()`.
    Local(String),
}

/// One build statement as a module type emits it.
#[derive(Clone, Debug)]
pub struct BuildParams {
    pub comment: Option<String>,
    pub rule: RuleRef,
    pub outputs: Vec<String>,
    pub implicit_outputs: Vec<String>,
    pub inputs: Vec<String>,
    pub implicits: Vec<String>,
    pub order_only: Vec<String>,
    pub args: Vec<(String, String)>,
}

impl Default for BuildParams {
    fn default() -> BuildParams {
        BuildParams {
            comment: None,
            rule: RuleRef::Phony,
            outputs: Vec::new(),
            implicit_outputs: Vec::new(),
            inputs: Vec::new(),
            implicits: Vec::new(),
            order_only: Vec::new(),
            args: Vec::new(),
        }
    }
}

/// The parsed internal form of a build statement.
#[derive(Clone, Debug)]
pub(crate) struct BuildDef {
    pub comment: Option<String>,
    pub rule: RuleRef,
    pub outputs: Vec<String>,
    pub implicit_outputs: Vec<String>,
    pub inputs: Vec<String>,
    pub implicits: Vec<String>,
    pub order_only: Vec<String>,
    /// Sorted by arg name, which is the emission order.
    pub args: BTreeMap<String, NinjaValue>,
}

/// Everything one variant or singleton emitted.
#[derive(Default)]
pub struct LocalBuildActions {
    pub(crate) variables: Vec<(String, NinjaValue)>,
    pub(crate) rules: Vec<(String, RuleParams)>,
    pub(crate) build_defs: Vec<BuildDef>,
}

impl LocalBuildActions {
    pub(crate) fn is_empty(&self) -> bool {
        self.variables.is_empty() && self.rules.is_empty() && self.build_defs.is_empty()
    }
}

/// Local names live in a namespace derived from the module name and variant
/// so two variants never collide.
pub(crate) fn scope_prefix(name: &str, variant: &str) -> String {
    format!("{}_{}", sanitize(name), sanitize(variant))
}

pub(crate) fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' { c } else { '_' })
        .collect()
}

/// Shared emit surface for module and singleton contexts.
fn emit_variable(
    actions: &mut LocalBuildActions,
    errors: &mut Vec<Error>,
    mk_error: &dyn Fn(String) -> Error,
    name: &str,
    value: &str,
) {
    if !is_valid_identifier(name) {
        errors.push(mk_error(format!("invalid variable name {:?}", name)));
        return;
    }
    if actions.variables.iter().any(|(n, _)| n == name) {
        errors.push(mk_error(format!("variable {:?} already defined", name)));
        return;
    }
    match NinjaValue::parse(value) {
        Ok(v) => actions.variables.push((name.to_string(), v)),
        Err(e) => errors.push(mk_error(e)),
    }
}

fn emit_rule(
    actions: &mut LocalBuildActions,
    errors: &mut Vec<Error>,
    mk_error: &dyn Fn(String) -> Error,
    name: &str,
    params: RuleParams,
) -> RuleRef {
    if !is_valid_identifier(name) {
        errors.push(mk_error(format!("invalid rule name {:?}", name)));
        return RuleRef::Local(name.to_string());
    }
    if actions.rules.iter().any(|(n, _)| n == name) {
        errors.push(mk_error(format!("rule {:?} already defined", name)));
    } else if params.command.is_empty() {
        errors.push(mk_error(format!("rule {:?} has no command", name)));
    } else {
        actions.rules.push((name.to_string(), params));
    }
    RuleRef::Local(name.to_string())
}

fn emit_build(
    actions: &mut LocalBuildActions,
    errors: &mut Vec<Error>,
    mk_error: &dyn Fn(String) -> Error,
    params: BuildParams,
) {
    if params.outputs.is_empty() && params.implicit_outputs.is_empty() {
        errors.push(mk_error("build statement has no outputs".to_string()));
        return;
    }
    if let RuleRef::Local(name) = &params.rule {
        if !actions.rules.iter().any(|(n, _)| n == name) {
            errors.push(mk_error(format!("build statement references undefined rule {:?}", name)));
            return;
        }
    }
    let mut args = BTreeMap::new();
    for (name, value) in params.args {
        match NinjaValue::parse(&value) {
            Ok(v) => {
                if args.insert(name.clone(), v).is_some() {
                    errors.push(mk_error(format!("duplicate build arg {:?}", name)));
                }
            }
            Err(e) => errors.push(mk_error(e)),
        }
    }
    actions.build_defs.push(BuildDef {
        comment: params.comment,
        rule: params.rule,
        outputs: params.outputs,
        implicit_outputs: params.implicit_outputs,
        inputs: params.inputs,
        implicits: params.implicits,
        order_only: params.order_only,
        args,
    });
}

/// Per-variant generation context.
pub struct ModuleContext<'a> {
    pub(crate) ctx: &'a Context,
    pub(crate) id: VariantId,
    pub(crate) errors: Vec<Error>,
    pub(crate) actions: LocalBuildActions,
}

impl ModuleContext<'_> {
    pub fn module_name(&self) -> String {
        self.ctx.with_variant(self.id, |v| v.name.clone())
    }

    pub fn module_dir(&self) -> String {
        self.ctx.with_variant(self.id, |v| v.dir.clone())
    }

    pub fn module_type(&self) -> String {
        self.ctx.with_variant(self.id, |v| v.type_name.clone())
    }

    pub fn module_variant(&self) -> String {
        self.ctx.with_variant(self.id, |v| v.variant_label.clone())
    }

    pub fn module_id(&self) -> VariantId {
        self.id
    }

    pub fn config(&self) -> Arc<dyn Config> {
        self.ctx.config.clone()
    }

    fn mk_error(&self) -> impl Fn(String) -> Error {
        let (pos, name) = self.ctx.with_variant(self.id, |v| (v.pos.clone(), v.display_name()));
        move |message| Error::Module { pos: pos.clone(), module: name.clone(), message }
    }

    pub fn module_errorf(&mut self, message: impl Into<String>) {
        let err = (self.mk_error())(message.into());
        self.errors.push(err);
    }

    pub fn property_errorf(&mut self, property: &str, message: impl Into<String>) {
        let (default_pos, name) =
            self.ctx.with_variant(self.id, |v| (v.pos.clone(), v.display_name()));
        let pos = self
            .ctx
            .with_variant(self.id, |v| v.property_positions.get(property).cloned())
            .unwrap_or(default_pos);
        self.errors.push(Error::Property {
            pos,
            module: name,
            property: property.to_string(),
            message: message.into(),
        });
    }

    // ---- emission --------------------------------------------------------

    pub fn variable(&mut self, name: &str, value: &str) {
        let mk = self.mk_error();
        emit_variable(&mut self.actions, &mut self.errors, &mk, name, value);
    }

    pub fn rule(&mut self, name: &str, params: RuleParams) -> RuleRef {
        let mk = self.mk_error();
        emit_rule(&mut self.actions, &mut self.errors, &mk, name, params)
    }

    pub fn build(&mut self, params: BuildParams) {
        let mk = self.mk_error();
        emit_build(&mut self.actions, &mut self.errors, &mk, params);
    }

    // ---- providers -------------------------------------------------------

    /// Providers without a mutator restriction may also be set during
    /// generation.
    pub fn set_provider<T: ProviderData>(&mut self, key: ProviderKey<T>, value: T) {
        let result = self
            .ctx
            .with_variant_mut(self.id, |v| v.providers.set(key.id(), Arc::new(value) as DynValue, None));
        if let Err(msg) = result {
            panic!("set_provider for {}: {}", self.module_name(), msg);
        }
    }

    pub fn provider<T: ProviderData>(&self, key: ProviderKey<T>) -> Option<Arc<T>> {
        self.other_module_provider(self.id, key)
    }

    pub fn other_module_provider<T: ProviderData>(
        &self,
        id: VariantId,
        key: ProviderKey<T>,
    ) -> Option<Arc<T>> {
        self.ctx.with_variant(id, |v| v.providers.get(key.id())).map(downcast::<T>)
    }

    // ---- graph inspection ------------------------------------------------

    pub fn other_module_name(&self, id: VariantId) -> String {
        self.ctx.with_variant(id, |v| v.name.clone())
    }

    pub fn other_module_type(&self, id: VariantId) -> String {
        self.ctx.with_variant(id, |v| v.type_name.clone())
    }

    pub fn visit_direct_deps(&self, mut f: impl FnMut(VariantId, Option<&Tag>)) {
        let deps = self.ctx.with_variant(self.id, |v| v.direct_deps.clone());
        for dep in &deps {
            f(dep.target, dep.tag.as_ref());
        }
    }

    pub fn visit_direct_deps_with_tag(&self, tag: &Tag, mut f: impl FnMut(VariantId)) {
        self.visit_direct_deps(|id, t| {
            if let Some(t) = t {
                if Arc::ptr_eq(t, tag) {
                    f(id);
                }
            }
        });
    }

    pub fn get_direct_dep_with_tag(&self, name: &str, tag: &Tag) -> Option<VariantId> {
        let mut found = None;
        self.visit_direct_deps(|id, t| {
            if found.is_none()
                && t.map_or(false, |t| Arc::ptr_eq(t, tag))
                && self.other_module_name(id) == name
            {
                found = Some(id);
            }
        });
        found
    }

    /// Depth-first visit of the transitive dependency closure, children
    /// before parents, each target once.
    pub fn visit_deps_depth_first(&self, mut f: impl FnMut(VariantId)) {
        self.ctx.walk_deps_impl(self.id, false, &mut |_, _| true, &mut |id| f(id));
    }

    /// Full walk: `visit_down` runs on descent and gates recursion into that
    /// target's deps, `visit_up` on ascent. With `allow_duplicates`,
    /// repeated edges revisit the target without re-walking its deps.
    pub fn walk_deps(
        &self,
        allow_duplicates: bool,
        mut visit_down: impl FnMut(&Dep, VariantId) -> bool,
        mut visit_up: impl FnMut(VariantId),
    ) {
        self.ctx.walk_deps_impl(self.id, allow_duplicates, &mut visit_down, &mut visit_up);
    }

    pub fn get_missing_dependencies(&mut self) -> Vec<String> {
        self.ctx.with_variant_mut(self.id, |v| {
            v.missing_deps_consulted = true;
            v.missing_deps.clone()
        })
    }
}

/// A generator that runs once over the whole post-mutator graph. `Sync` is
/// required because singleton records live in the context that parallel
/// passes share; the record itself is only ever run from one thread.
pub trait Singleton: Send + Sync {
    fn generate_build_actions(&mut self, ctx: &mut SingletonContext<'_>);
}

pub(crate) struct SingletonRecord {
    pub name: String,
    pub parallel: bool,
    pub singleton: Box<dyn Singleton>,
    pub actions: LocalBuildActions,
}

pub struct SingletonContext<'a> {
    pub(crate) ctx: &'a Context,
    pub(crate) name: String,
    pub(crate) errors: Vec<Error>,
    pub(crate) actions: LocalBuildActions,
    pub(crate) required_version: Option<(u32, u32)>,
    pub(crate) build_dir: Option<String>,
    pub(crate) subninjas: Vec<String>,
}

impl SingletonContext<'_> {
    pub fn config(&self) -> Arc<dyn Config> {
        self.ctx.config.clone()
    }

    fn mk_error(&self) -> impl Fn(String) -> Error {
        let name = self.name.clone();
        move |message| Error::Misc { message: format!("singleton {:?}: {}", name, message) }
    }

    pub fn errorf(&mut self, message: impl Into<String>) {
        let err = (self.mk_error())(message.into());
        self.errors.push(err);
    }

    pub fn module_errorf(&mut self, id: VariantId, message: impl Into<String>) {
        let (pos, name) = self.ctx.with_variant(id, |v| (v.pos.clone(), v.display_name()));
        self.errors.push(Error::module(pos, name, message));
    }

    pub fn variable(&mut self, name: &str, value: &str) {
        let mk = self.mk_error();
        emit_variable(&mut self.actions, &mut self.errors, &mk, name, value);
    }

    pub fn rule(&mut self, name: &str, params: RuleParams) -> RuleRef {
        let mk = self.mk_error();
        emit_rule(&mut self.actions, &mut self.errors, &mk, name, params)
    }

    pub fn build(&mut self, params: BuildParams) {
        let mk = self.mk_error();
        emit_build(&mut self.actions, &mut self.errors, &mk, params);
    }

    /// Raises the manifest's `ninja_required_version` if above the current.
    pub fn require_ninja_version(&mut self, major: u32, minor: u32) {
        let cur = self.required_version.unwrap_or((0, 0));
        if (major, minor) > cur {
            self.required_version = Some((major, minor));
        }
    }

    /// Sets the manifest's `builddir`.
    pub fn set_out_dir(&mut self, dir: &str) {
        self.build_dir = Some(dir.to_string());
    }

    pub fn add_subninja(&mut self, path: &str) {
        self.subninjas.push(path.to_string());
    }

    /// Every live variant, in group name order then variant order.
    pub fn visit_all_modules(&self, mut f: impl FnMut(VariantId)) {
        for id in self.ctx.active_variant_ids() {
            f(id);
        }
    }

    /// All live variants of the named module.
    pub fn visit_all_module_variants(&self, name: &str, mut f: impl FnMut(VariantId)) {
        if let Some(group) = self.ctx.names.module_from_name(name, "") {
            for &vid in &self.ctx.group(group).variants {
                if !self.ctx.with_variant(vid, |v| v.obsoleted_by_new_variants) {
                    f(vid);
                }
            }
        }
    }

    pub fn module_name(&self, id: VariantId) -> String {
        self.ctx.with_variant(id, |v| v.name.clone())
    }

    pub fn module_type(&self, id: VariantId) -> String {
        self.ctx.with_variant(id, |v| v.type_name.clone())
    }

    pub fn module_variant(&self, id: VariantId) -> String {
        self.ctx.with_variant(id, |v| v.variant_label.clone())
    }

    pub fn visit_direct_deps(&self, id: VariantId, mut f: impl FnMut(VariantId, Option<&Tag>)) {
        let deps = self.ctx.with_variant(id, |v| v.direct_deps.clone());
        for dep in &deps {
            f(dep.target, dep.tag.as_ref());
        }
    }

    pub fn other_module_provider<T: ProviderData>(
        &self,
        id: VariantId,
        key: ProviderKey<T>,
    ) -> Option<Arc<T>> {
        self.ctx.with_variant(id, |v| v.providers.get(key.id())).map(downcast::<T>)
    }

    pub fn walk_deps(
        &self,
        top: VariantId,
        allow_duplicates: bool,
        mut visit_down: impl FnMut(&Dep, VariantId) -> bool,
        mut visit_up: impl FnMut(VariantId),
    ) {
        self.ctx.walk_deps_impl(top, allow_duplicates, &mut visit_down, &mut visit_up);
    }
}

impl Context {
    pub fn register_singleton(&mut self, name: &str, singleton: Box<dyn Singleton>, parallel: bool) {
        if self.singletons.iter().any(|s| s.name == name) {
            panic!("singleton {:?} registered twice", name);
        }
        self.singletons.push(SingletonRecord {
            name: name.to_string(),
            parallel,
            singleton,
            actions: LocalBuildActions::default(),
        });
    }

    /// Third phase: per-module generation, singleton generation, order-only
    /// dedup, provider-mutation checks, cache store.
    pub fn prepare_build_actions(&mut self) -> Result<(), Vec<Error>> {
        let mut errors = ErrorCollector::new();
        crate::cache::load_cache(self, &mut errors);
        self.generate_module_actions(&mut errors);
        if errors.has_errors() {
            return errors.into_result();
        }
        self.generate_singleton_actions(&mut errors);
        if errors.has_errors() {
            return errors.into_result();
        }
        self.dedup_order_only(&mut errors);
        self.verify_provider_hashes(&mut errors);
        if self.incremental_cache && !errors.has_errors() {
            crate::cache::store_cache(self, &mut errors);
        }
        errors.into_result()
    }

    fn generate_module_actions(&mut self, errors: &mut ErrorCollector) {
        let ids = self.active_variant_ids();
        info!("generating build actions for {} variants", ids.len());
        let local_of: HashMap<VariantId, usize> =
            ids.iter().enumerate().map(|(i, &id)| (id, i)).collect();
        let deps: Vec<Vec<usize>> = ids
            .iter()
            .map(|&id| {
                self.with_variant(id, |v| {
                    v.forward_deps.iter().filter_map(|d| local_of.get(d).copied()).collect()
                })
            })
            .collect();

        let (err_tx, err_rx) = unbounded::<Vec<Error>>();
        {
            let this = &*self;
            let ids = &ids;
            let err_tx = &err_tx;
            let name_of = move |i: usize| this.variant_display(ids[i]);
            let visit = move |i: usize, _handle: &PauseHandle<'_>| -> bool {
                let id = ids[i];
                crate::cache::prepare_incremental(this, id);
                if this.incremental_analysis && crate::cache::try_restore(this, id) {
                    return false;
                }

                let mut module = this.with_variant_mut(id, |v| v.take_module());
                let mut mctx = ModuleContext {
                    ctx: this,
                    id,
                    errors: Vec::new(),
                    actions: LocalBuildActions::default(),
                };
                let result =
                    catch_unwind(AssertUnwindSafe(|| module.generate_build_actions(&mut mctx)));
                let ModuleContext { errors: mut verrors, actions, .. } = mctx;
                let mut cancel = false;
                if let Err(payload) = result {
                    verrors.push(Error::internal(
                        format!("GenerateBuildActions for {}", this.variant_display(id)),
                        payload,
                    ));
                    cancel = true;
                }
                this.with_variant_mut(id, |v| {
                    v.put_module(module);
                    v.actions = actions;
                });

                let (missing, consulted, pos, name) = this.with_variant(id, |v| {
                    (
                        v.missing_deps.clone(),
                        v.missing_deps_consulted,
                        v.pos.clone(),
                        v.display_name(),
                    )
                });
                if !missing.is_empty() && !consulted {
                    verrors.push(Error::module(
                        pos,
                        name,
                        format!("missing dependencies: {}", missing.join(", ")),
                    ));
                }
                if !verrors.is_empty() {
                    let _ = err_tx.send(verrors);
                }
                cancel
            };

            if let Err(errs) = parallel_visit(&deps, MUTATOR_PARALLELISM, &name_of, &visit) {
                for e in errs {
                    errors.add(e);
                }
            }
        }
        drop(err_tx);
        for errs in err_rx.try_iter() {
            errors.extend(errs);
        }

        crate::cache::recover_restored_dedup(self, errors);
    }

    fn generate_singleton_actions(&mut self, errors: &mut ErrorCollector) {
        let mut records = std::mem::take(&mut self.singletons);
        info!("running {} singletons", records.len());
        let mut outcomes: Vec<Option<SingletonOutcome>> =
            records.iter().map(|_| None).collect();

        {
            let this = &*self;
            // Parallel singletons first, concurrently; then the rest in
            // registration order.
            records
                .par_iter_mut()
                .zip(outcomes.par_iter_mut())
                .filter(|(rec, _)| rec.parallel)
                .for_each(|(rec, out)| *out = Some(run_singleton(this, rec)));
            for (rec, out) in records.iter_mut().zip(outcomes.iter_mut()) {
                if !rec.parallel {
                    *out = Some(run_singleton(this, rec));
                }
            }
        }

        for outcome in outcomes.into_iter().flatten() {
            errors.extend(outcome.errors);
            if let Some((major, minor)) = outcome.required_version {
                if (major, minor) > self.required_version {
                    self.required_version = (major, minor);
                }
            }
            if let Some(dir) = outcome.build_dir {
                self.build_dir = Some(dir);
            }
            self.extra_subninjas.extend(outcome.subninjas);
        }
        self.singletons = records;
    }

    fn verify_provider_hashes(&self, errors: &mut ErrorCollector) {
        let ids = self.active_variant_ids();
        let mutated: Vec<(VariantId, &'static str)> = ids
            .par_iter()
            .flat_map_iter(|&id| {
                self.with_variant(id, |v| v.providers.find_mutated())
                    .into_iter()
                    .map(move |type_name| (id, type_name))
            })
            .collect();
        for (id, type_name) in mutated {
            let (pos, name) = self.with_variant(id, |v| (v.pos.clone(), v.display_name()));
            errors.add(Error::module(
                pos,
                name,
                format!("provider {} was modified after being set", type_name),
            ));
        }
    }

    /// Depth-first dependency walk shared by module and singleton contexts.
    pub(crate) fn walk_deps_impl(
        &self,
        top: VariantId,
        allow_duplicates: bool,
        visit_down: &mut dyn FnMut(&Dep, VariantId) -> bool,
        visit_up: &mut dyn FnMut(VariantId),
    ) {
        let mut visited = HashSet::new();
        self.walk_deps_rec(top, allow_duplicates, &mut visited, visit_down, visit_up);
    }

    fn walk_deps_rec(
        &self,
        module: VariantId,
        allow_duplicates: bool,
        visited: &mut HashSet<VariantId>,
        visit_down: &mut dyn FnMut(&Dep, VariantId) -> bool,
        visit_up: &mut dyn FnMut(VariantId),
    ) {
        let deps = self.with_variant(module, |v| v.direct_deps.clone());
        for dep in &deps {
            let first = visited.insert(dep.target);
            if !first && !allow_duplicates {
                continue;
            }
            let recurse = visit_down(dep, module);
            if recurse && first {
                self.walk_deps_rec(dep.target, allow_duplicates, visited, visit_down, visit_up);
            }
            visit_up(dep.target);
        }
    }
}

struct SingletonOutcome {
    errors: Vec<Error>,
    required_version: Option<(u32, u32)>,
    build_dir: Option<String>,
    subninjas: Vec<String>,
}

fn run_singleton(ctx: &Context, rec: &mut SingletonRecord) -> SingletonOutcome {
    let mut sctx = SingletonContext {
        ctx,
        name: rec.name.clone(),
        errors: Vec::new(),
        actions: LocalBuildActions::default(),
        required_version: None,
        build_dir: None,
        subninjas: Vec::new(),
    };
    let result =
        catch_unwind(AssertUnwindSafe(|| rec.singleton.generate_build_actions(&mut sctx)));
    let SingletonContext { mut errors, actions, required_version, build_dir, subninjas, .. } = sctx;
    if let Err(payload) = result {
        errors.push(Error::internal(format!("GenerateBuildActions for singleton {}", rec.name), payload));
    }
    rec.actions = actions;
    SingletonOutcome { errors, required_version, build_dir, subninjas }
}
