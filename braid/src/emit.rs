//! Manifest assembly.
//!
//! Emission is a pure function of the analyzed graph: header, required
//! version, subninjas, live globals (variables dependency-first, then pools,
//! then rules), per-variant blocks, the order-only dedup phonies, and
//! finally singleton blocks. Only globals transitively referenced by an
//! emitted build-def are written.

use crate::config::PrimaryBuilderInvocation;
use crate::context::Context;
use crate::generate::{scope_prefix, BuildDef, LocalBuildActions, RuleRef};
use crate::hash::ContentHasher;
use crate::module::VariantId;
use crate::package::{self, NinjaValue, RuleParams};
use braid_ninja::{escape_path, escape_value, Writer};
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::io;
use std::path::Path;

/// Shard count for non-incremental variants.
const SHARDS: usize = 10;

#[derive(Default)]
struct LiveSet {
    variables: HashSet<usize>,
    rules: HashSet<usize>,
    pools: HashSet<usize>,
}

impl Context {
    /// Writes the complete manifest in the canonical order.
    pub fn write_build_file<W: io::Write>(&self, out: W) -> io::Result<()> {
        let mut w = Writer::new(out);
        let live = self.compute_live();
        self.write_globals(&mut w, &live)?;
        for id in self.active_variant_ids() {
            self.write_variant_block(&mut w, id)?;
        }
        self.write_dedup_block(&mut w)?;
        self.write_singleton_blocks(&mut w)?;
        self.write_primary_builder_block(&mut w)?;
        Ok(())
    }

    /// Headers only: used by the CLI's empty-manifest mode.
    pub fn write_empty_build_file<W: io::Write>(&self, out: W) -> io::Result<()> {
        let mut w = Writer::new(out);
        self.write_globals(&mut w, &LiveSet::default())
    }

    fn write_globals<W: io::Write>(&self, w: &mut Writer<W>, live: &LiveSet) -> io::Result<()> {
        package::with_registry(|reg| -> io::Result<()> {
            // 1. Header comment: contributing package names, padded, sorted.
            w.raw_comment("This file is generated by braid. Do not edit.")?;
            let mut pkgs: BTreeSet<&str> = BTreeSet::new();
            for &i in &live.variables {
                pkgs.insert(&reg.packages[reg.variables[i].package]);
            }
            for &i in &live.rules {
                pkgs.insert(&reg.packages[reg.rules[i].package]);
            }
            for &i in &live.pools {
                pkgs.insert(&reg.packages[reg.pools[i].package]);
            }
            if !pkgs.is_empty() {
                w.raw_comment("")?;
                w.raw_comment("Globals below were contributed by these packages:")?;
                w.raw_comment("")?;
                let width = pkgs.iter().map(|p| p.len()).max().unwrap_or(0);
                for pkg in &pkgs {
                    w.raw_comment(&format!("    {:width$}", pkg, width = width))?;
                }
            }
            w.blank_line()?;

            // 2. Required version.
            let (major, minor) = self.required_version;
            w.variable("ninja_required_version", &format!("{}.{}", major, minor), 0)?;
            w.blank_line()?;

            // 3. Subninjas.
            let mut subninjas = self.config.subninjas();
            subninjas.extend(self.extra_subninjas.iter().cloned());
            if !subninjas.is_empty() {
                for sub in &subninjas {
                    w.subninja(&escape_path(sub))?;
                }
                w.blank_line()?;
            }

            // 4. Global variables, sorted, dependency-first.
            let mut sorted_vars: Vec<usize> = live.variables.iter().copied().collect();
            sorted_vars.sort_by_key(|&i| reg.variable_qualified(package::VariableHandle(i)));
            let mut emitted: HashSet<usize> = HashSet::new();
            for var in sorted_vars {
                self.write_variable_dfs(w, reg, var, live, &mut emitted)?;
            }

            // 5. Pools.
            let mut sorted_pools: Vec<usize> = live.pools.iter().copied().collect();
            sorted_pools.sort_by_key(|&i| reg.pool_qualified(package::PoolHandle(i)));
            for i in sorted_pools {
                let def = &reg.pools[i];
                w.blank_line()?;
                w.pool(&reg.pool_qualified(package::PoolHandle(i)), def.depth)?;
            }

            // 6. builddir.
            if let Some(dir) = &self.build_dir {
                w.blank_line()?;
                w.variable("builddir", &escape_path(dir), 0)?;
            }

            // 7. Rules.
            let mut sorted_rules: Vec<usize> = live.rules.iter().copied().collect();
            sorted_rules.sort_by_key(|&i| reg.rule_qualified(package::RuleHandle(i)));
            for i in sorted_rules {
                w.blank_line()?;
                let name = reg.rule_qualified(package::RuleHandle(i));
                write_rule(w, &name, &reg.rules[i].params, reg, &|n| n.to_string())?;
            }
            Ok(())
        })
    }

    fn write_variable_dfs<W: io::Write>(
        &self,
        w: &mut Writer<W>,
        reg: &package::Registry,
        var: usize,
        live: &LiveSet,
        emitted: &mut HashSet<usize>,
    ) -> io::Result<()> {
        if !emitted.insert(var) {
            return Ok(());
        }
        let refs: Vec<usize> = reg.variables[var]
            .value
            .references()
            .filter_map(|r| reg.lookup_variable(r).map(|h| h.0))
            .filter(|i| live.variables.contains(i))
            .collect();
        for dep in refs {
            self.write_variable_dfs(w, reg, dep, live, emitted)?;
        }
        let name = reg.variable_qualified(package::VariableHandle(var));
        let value = reg.variables[var].value.render(&|n| n.to_string());
        w.variable(&name, &value, 0)
    }

    fn write_variant_block<W: io::Write>(&self, w: &mut Writer<W>, id: VariantId) -> io::Result<()> {
        let (name, variant, type_name, factory, pos, empty) = self.with_variant(id, |v| {
            (
                v.name.clone(),
                v.variant_label.clone(),
                v.type_name.clone(),
                v.factory as usize,
                v.pos.clone(),
                v.actions.is_empty(),
            )
        });
        if empty {
            return Ok(());
        }
        w.blank_line()?;
        w.raw_comment(&format!("Module:  {}", name))?;
        w.raw_comment(&format!("Variant: {}", variant))?;
        w.raw_comment(&format!("Type:    {}", type_name))?;
        w.raw_comment(&format!("Factory: 0x{:x}", factory))?;
        w.raw_comment(&format!("Defined: {}", pos))?;

        let prefix = scope_prefix(&name, &variant);
        let v = self.variant(id);
        let guard = v.lock();
        write_actions(w, &guard.actions, &prefix)
    }

    fn write_dedup_block<W: io::Write>(&self, w: &mut Writer<W>) -> io::Result<()> {
        if self.dedup_actions.is_empty() {
            return Ok(());
        }
        w.blank_line()?;
        w.raw_comment("Shared order-only dependency sets")?;
        for def in &self.dedup_actions {
            write_build_def(w, def, &|n| n.to_string())?;
        }
        Ok(())
    }

    fn write_singleton_blocks<W: io::Write>(&self, w: &mut Writer<W>) -> io::Result<()> {
        for rec in &self.singletons {
            if rec.actions.is_empty() {
                continue;
            }
            w.blank_line()?;
            w.raw_comment(&format!("Singleton: {}", rec.name))?;
            let prefix = format!("{}_", crate::generate::sanitize(&rec.name));
            write_actions(w, &rec.actions, &prefix)?;
        }
        Ok(())
    }

    /// Generator rules that rebuild this manifest: one rule + build pair per
    /// config-supplied invocation. Test-suite invocations are gated behind
    /// the config's `run_go_tests`.
    fn write_primary_builder_block<W: io::Write>(&self, w: &mut Writer<W>) -> io::Result<()> {
        let invocations: Vec<PrimaryBuilderInvocation> = self
            .config
            .primary_builder_invocations()
            .into_iter()
            .filter(|inv| !inv.tests || self.config.run_go_tests())
            .filter(|inv| !inv.command.is_empty() && !inv.outputs.is_empty())
            .collect();
        if invocations.is_empty() {
            return Ok(());
        }
        w.blank_line()?;
        w.raw_comment("Primary builder invocations")?;
        // Commands may locate their tools through ${host_tool_dir}.
        w.variable("host_tool_dir", &escape_value(&self.config.host_tool_dir()), 0)?;
        let esc = |paths: &[String]| -> Vec<String> {
            paths.iter().map(|p| escape_path(p)).collect()
        };
        for (i, inv) in invocations.iter().enumerate() {
            let rule_name = format!("primary_builder_{}", i);
            w.blank_line()?;
            w.rule(&rule_name)?;
            let command = match NinjaValue::parse(&inv.command) {
                Ok(v) => v.render(&|n| n.to_string()),
                Err(_) => inv.command.clone(),
            };
            w.variable("command", &command, 1)?;
            w.variable(
                "description",
                inv.description.as_deref().unwrap_or(&inv.command),
                1,
            )?;
            w.variable("generator", "true", 1)?;
            if inv.console {
                w.variable("pool", "console", 1)?;
            }
            w.build(&esc(&inv.outputs), &[], &rule_name, &esc(&inv.inputs), &[], &[])?;
        }
        Ok(())
    }

    /// Every global definition reachable from an emitted build-def.
    fn compute_live(&self) -> LiveSet {
        let mut live = LiveSet::default();
        package::with_registry(|reg| {
            let mut var_stack: Vec<usize> = Vec::new();
            let mark_ref = |name: &str, locals: &HashSet<String>, stack: &mut Vec<usize>| {
                if locals.contains(name) {
                    return;
                }
                if let Some(h) = reg.lookup_variable(name) {
                    stack.push(h.0);
                }
            };

            let mut scan_actions = |actions: &LocalBuildActions, stack: &mut Vec<usize>| {
                let locals: HashSet<String> =
                    actions.variables.iter().map(|(n, _)| n.clone()).collect();
                for (_, value) in &actions.variables {
                    for r in value.references() {
                        mark_ref(r, &locals, stack);
                    }
                }
                for (_, params) in &actions.rules {
                    for value in rule_values(params) {
                        for r in value.references() {
                            mark_ref(r, &locals, stack);
                        }
                    }
                    if let Some(pool) = params.pool {
                        live.pools.insert(pool.0);
                    }
                }
                for def in &actions.build_defs {
                    if let RuleRef::Global(h) = def.rule {
                        live.rules.insert(h.0);
                    }
                    for value in def.args.values() {
                        for r in value.references() {
                            mark_ref(r, &locals, stack);
                        }
                    }
                }
            };

            for id in self.active_variant_ids() {
                self.with_variant(id, |v| scan_actions(&v.actions, &mut var_stack));
            }
            for rec in &self.singletons {
                scan_actions(&rec.actions, &mut var_stack);
            }
            // Dedup phonies only reference paths, not variables.

            // Live rules pull in their own references and pools.
            let rule_set: Vec<usize> = live.rules.iter().copied().collect();
            let no_locals = HashSet::new();
            for i in rule_set {
                let params = &reg.rules[i].params;
                for value in rule_values(params) {
                    for r in value.references() {
                        mark_ref(r, &no_locals, &mut var_stack);
                    }
                }
                if let Some(pool) = params.pool {
                    live.pools.insert(pool.0);
                }
            }

            // Transitive variable closure.
            while let Some(i) = var_stack.pop() {
                if !live.variables.insert(i) {
                    continue;
                }
                for r in reg.variables[i].value.references() {
                    if let Some(h) = reg.lookup_variable(r) {
                        var_stack.push(h.0);
                    }
                }
            }
        });
        live
    }

    /// Splits module blocks across `SHARDS` files plus one file per
    /// incremental variant, and writes a top-level manifest that subninjas
    /// them all. Restored variants' per-variant files are left untouched.
    pub fn write_build_file_sharded(&self, dir: &Path) -> io::Result<()> {
        std::fs::create_dir_all(dir.join("incremental"))?;
        let mut shard_files: Vec<Vec<u8>> = (0..SHARDS).map(|_| Vec::new()).collect();
        let mut incremental_files: Vec<String> = Vec::new();

        for id in self.active_variant_ids() {
            let (incremental_key, restored, name, variant) = self.with_variant(id, |v| {
                (
                    v.cache_input_hash.map(|_| {
                        crate::cache::cache_id(&v.dir, &v.name, &v.variant_label, &v.type_name)
                    }),
                    v.restored_from_cache,
                    v.name.clone(),
                    v.variant_label.clone(),
                )
            });
            match incremental_key {
                Some(key) => {
                    let rel = format!("incremental/{}.ninja", key);
                    if !restored {
                        let mut buf = Vec::new();
                        let mut w = Writer::new(&mut buf);
                        self.write_variant_block(&mut w, id)?;
                        std::fs::write(dir.join(&rel), buf)?;
                    }
                    incremental_files.push(rel);
                }
                None => {
                    let mut h = ContentHasher::new();
                    h.write_str(&name);
                    h.write_str(&variant);
                    let shard = (h.finish() % SHARDS as u64) as usize;
                    let mut w = Writer::new(&mut shard_files[shard]);
                    self.write_variant_block(&mut w, id)?;
                }
            }
        }

        let mut shard_names = Vec::new();
        for (i, contents) in shard_files.into_iter().enumerate() {
            let rel = format!("build-{:02}.ninja", i);
            std::fs::write(dir.join(&rel), contents)?;
            shard_names.push(rel);
        }

        let mut top = Vec::new();
        {
            let mut w = Writer::new(&mut top);
            let live = self.compute_live();
            self.write_globals(&mut w, &live)?;
            for rel in shard_names.iter().chain(incremental_files.iter()) {
                w.subninja(rel)?;
            }
            self.write_dedup_block(&mut w)?;
            self.write_singleton_blocks(&mut w)?;
            self.write_primary_builder_block(&mut w)?;
        }
        std::fs::write(dir.join("build.ninja"), top)
    }

    /// One JSON object per line per live variant, for debugging.
    pub fn write_module_debug<W: io::Write>(&self, mut out: W) -> io::Result<()> {
        #[derive(Serialize)]
        struct DebugModule {
            name: String,
            variant: String,
            type_name: String,
            pos: String,
            restored_from_cache: bool,
            deps: Vec<String>,
        }
        for id in self.active_variant_ids() {
            let entry = self.with_variant(id, |v| DebugModule {
                name: v.name.clone(),
                variant: v.variant_label.clone(),
                type_name: v.type_name.clone(),
                pos: v.pos.to_string(),
                restored_from_cache: v.restored_from_cache,
                deps: v
                    .direct_deps
                    .iter()
                    .map(|d| self.variant_display(d.target))
                    .collect(),
            });
            serde_json::to_writer(&mut out, &entry)?;
            out.write_all(b"\n")?;
        }
        Ok(())
    }

    /// The files the manifest depends on: everything the parse driver read.
    pub fn manifest_deps(&self) -> Vec<String> {
        self.parsed_files.clone()
    }
}

/// Renders one scope's local variables, local rules, and build-defs.
fn write_actions<W: io::Write>(
    w: &mut Writer<W>,
    actions: &LocalBuildActions,
    prefix: &str,
) -> io::Result<()> {
    let locals: HashSet<String> = actions
        .variables
        .iter()
        .map(|(n, _)| n.clone())
        .chain(actions.rules.iter().map(|(n, _)| n.clone()))
        .collect();
    let resolve = move |name: &str| -> String {
        if locals.contains(name) {
            format!("{}.{}", prefix, name)
        } else {
            name.to_string()
        }
    };

    for (name, value) in &actions.variables {
        w.variable(&format!("{}.{}", prefix, name), &value.render(&resolve), 0)?;
    }
    package::with_registry(|reg| -> io::Result<()> {
        for (name, params) in &actions.rules {
            w.blank_line()?;
            write_rule(w, &format!("{}.{}", prefix, name), params, reg, &resolve)?;
        }
        Ok(())
    })?;
    for def in &actions.build_defs {
        let resolve_rule = |rule: &RuleRef| -> String {
            match rule {
                RuleRef::Phony => "phony".to_string(),
                RuleRef::Global(h) => package::with_registry(|reg| reg.rule_qualified(*h)),
                RuleRef::Local(name) => format!("{}.{}", prefix, name),
            }
        };
        write_build_def_with(w, def, &resolve, &resolve_rule)?;
    }
    Ok(())
}

fn rule_values(params: &RuleParams) -> Vec<NinjaValue> {
    let mut out = Vec::new();
    if let Ok(v) = NinjaValue::parse(&params.command) {
        out.push(v);
    }
    let mut push = |s: &Option<String>| {
        if let Some(s) = s {
            if let Ok(v) = NinjaValue::parse(s) {
                out.push(v);
            }
        }
    };
    push(&params.depfile);
    push(&params.deps);
    push(&params.description);
    push(&params.rspfile);
    push(&params.rspfile_content);
    out
}

fn write_rule<W: io::Write>(
    w: &mut Writer<W>,
    name: &str,
    params: &RuleParams,
    reg: &package::Registry,
    resolve: &dyn Fn(&str) -> String,
) -> io::Result<()> {
    let render = |s: &str| match NinjaValue::parse(s) {
        Ok(v) => v.render(resolve),
        Err(_) => s.to_string(),
    };
    w.rule(name)?;
    w.variable("command", &render(&params.command), 1)?;
    if let Some(v) = &params.depfile {
        w.variable("depfile", &render(v), 1)?;
    }
    if let Some(v) = &params.deps {
        w.variable("deps", &render(v), 1)?;
    }
    if let Some(v) = &params.description {
        w.variable("description", &render(v), 1)?;
    }
    if params.generator {
        w.variable("generator", "true", 1)?;
    }
    if params.restat {
        w.variable("restat", "true", 1)?;
    }
    if let Some(v) = &params.rspfile {
        w.variable("rspfile", &render(v), 1)?;
    }
    if let Some(v) = &params.rspfile_content {
        w.variable("rspfile_content", &render(v), 1)?;
    }
    if let Some(pool) = params.pool {
        w.variable("pool", &reg.pool_qualified(pool), 1)?;
    }
    Ok(())
}

fn write_build_def<W: io::Write>(
    w: &mut Writer<W>,
    def: &BuildDef,
    resolve: &dyn Fn(&str) -> String,
) -> io::Result<()> {
    let resolve_rule = |rule: &RuleRef| -> String {
        match rule {
            RuleRef::Phony => "phony".to_string(),
            RuleRef::Global(h) => package::with_registry(|reg| reg.rule_qualified(*h)),
            RuleRef::Local(name) => name.clone(),
        }
    };
    write_build_def_with(w, def, resolve, &resolve_rule)
}

fn write_build_def_with<W: io::Write>(
    w: &mut Writer<W>,
    def: &BuildDef,
    resolve: &dyn Fn(&str) -> String,
    resolve_rule: &dyn Fn(&RuleRef) -> String,
) -> io::Result<()> {
    if let Some(comment) = &def.comment {
        w.comment(comment)?;
    }
    let esc = |paths: &[String]| -> Vec<String> { paths.iter().map(|p| escape_path(p)).collect() };
    w.build(
        &esc(&def.outputs),
        &esc(&def.implicit_outputs),
        &resolve_rule(&def.rule),
        &esc(&def.inputs),
        &esc(&def.implicits),
        &esc(&def.order_only),
    )?;
    // Args in sorted name order; BTreeMap iteration is already sorted.
    for (name, value) in &def.args {
        w.variable(name, &value.render(resolve), 1)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_def_renders_with_sorted_args() {
        let mut def = BuildDef {
            comment: Some("compile it".to_string()),
            rule: RuleRef::Phony,
            outputs: vec!["out dir/a.o".to_string()],
            implicit_outputs: vec![],
            inputs: vec!["a.c".to_string()],
            implicits: vec![],
            order_only: vec!["gen".to_string()],
            args: Default::default(),
        };
        def.args.insert("zflag".to_string(), NinjaValue::parse("z").unwrap());
        def.args.insert("aflag".to_string(), NinjaValue::parse("a").unwrap());

        let mut buf = Vec::new();
        {
            let mut w = Writer::new(&mut buf);
            write_build_def(&mut w, &def, &|n| n.to_string()).unwrap();
        }
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "# compile it");
        assert_eq!(lines[1], "build out$ dir/a.o: phony a.c || gen");
        assert_eq!(lines[2], "    aflag = a");
        assert_eq!(lines[3], "    zflag = z");
    }

    #[test]
    fn local_references_get_the_scope_prefix() {
        let mut actions = LocalBuildActions::default();
        actions.variables.push(("flags".to_string(), NinjaValue::parse("-O2").unwrap()));
        actions.rules.push((
            "cc".to_string(),
            RuleParams { command: "gcc ${flags} -c $in".to_string(), ..Default::default() },
        ));
        actions.build_defs.push(BuildDef {
            comment: None,
            rule: RuleRef::Local("cc".to_string()),
            outputs: vec!["a.o".to_string()],
            implicit_outputs: vec![],
            inputs: vec!["a.c".to_string()],
            implicits: vec![],
            order_only: vec![],
            args: Default::default(),
        });

        let mut buf = Vec::new();
        {
            let mut w = Writer::new(&mut buf);
            write_actions(&mut w, &actions, "mod_x").unwrap();
        }
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("mod_x.flags = -O2"), "{}", text);
        assert!(text.contains("rule mod_x.cc"), "{}", text);
        assert!(text.contains("command = gcc ${mod_x.flags} -c $in"), "{}", text);
        assert!(text.contains("build a.o: mod_x.cc a.c"), "{}", text);
    }
}
