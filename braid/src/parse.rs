//! The parse driver.
//!
//! Walks the file tree ancestors-first so every file is parsed against the
//! scope of the file in its closest ancestor directory, fans parsing out
//! across threads with a fixed cap, and serially registers the modules each
//! file declares. Registration is the only writer into the group list, so
//! name collisions are detected deterministically.

use crate::config::Config;
use crate::context::Context;
use crate::errors::{Error, ErrorCollector};
use crate::fs::parent_dir;
use crate::module::{Module, ModuleFactory, ModuleGroup, GroupId, Variant, VariantId};
use crate::properties::{lookup_string, unpack_properties};
use braid_syntax::{parse, ModuleDef, Position, Scope, Value};
use log::{debug, info};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread;

/// Concurrent parse cap.
const PARSE_PARALLELISM: usize = 200;

/// The file name looked for in directories named by `subdirs`.
pub const MODULE_FILE_NAME: &str = "Braidfile";

/// A hook run by the parse driver right after its module is registered.
/// Lower priorities run first; ties run in declaration order.
pub struct LoadHook {
    pub priority: i32,
    pub hook: Box<dyn FnOnce(&mut LoadHookContext<'_>) + Send>,
}

/// What a load hook may do: inspect the config, reach back into its module,
/// create submodules, and report errors.
pub struct LoadHookContext<'a> {
    ctx: &'a mut Context,
    module_id: VariantId,
    dir: String,
    pos: Position,
    errors: Vec<Error>,
}

impl LoadHookContext<'_> {
    pub fn config(&self) -> Arc<dyn Config> {
        self.ctx.config.clone()
    }

    pub fn with_module<R>(&mut self, f: impl FnOnce(&mut dyn Module) -> R) -> R {
        let module_id = self.module_id;
        self.ctx.with_variant_mut(module_id, |v| {
            f(v.module.as_mut().expect("module present during load hooks").as_mut())
        })
    }

    /// Creates and registers a submodule. `configure` must set the `name`
    /// property; the new module's own load hooks run before this returns.
    pub fn create_module(
        &mut self,
        factory: ModuleFactory,
        type_name: &str,
        configure: impl FnOnce(&mut dyn Module),
    ) {
        let dir = self.dir.clone();
        let pos = self.pos.clone();
        let mut errors = ErrorCollector::new();
        self.ctx.register_programmatic_module(factory, type_name, &dir, pos, configure, &mut errors);
        if let Err(errs) = errors.into_result() {
            self.errors.extend(errs);
        }
    }

    pub fn error(&mut self, message: impl Into<String>) {
        let module = self.ctx.with_variant(self.module_id, |v| v.name.clone());
        self.errors.push(Error::module(self.pos.clone(), module, message));
    }
}

struct Pending {
    path: String,
    scope: Arc<Scope>,
}

impl Context {
    /// Parses every file reachable from the module-list file, registering
    /// each module definition. Returns the list of files read, which the
    /// emitted manifest depends on.
    pub fn parse_file_list(&mut self, list_path: &str) -> Result<Vec<String>, Vec<Error>> {
        let mut errors = ErrorCollector::new();

        let list_text = match self.fs.read_to_string(list_path) {
            Ok(text) => text,
            Err(e) => {
                return Err(vec![Error::source(
                    Position::new(list_path, 1, 1),
                    format!("failed to read module list: {}", e),
                )])
            }
        };
        self.parsed_files.push(list_path.to_string());

        let initial: Vec<String> = list_text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(str::to_string)
            .collect();

        // Ancestors-first: initial files whose directory has an initial file
        // above it wait for that file's scope.
        let dir_to_file: HashMap<&str, &str> = {
            let mut map = HashMap::new();
            for f in &initial {
                map.entry(parent_dir(f)).or_insert(f.as_str());
            }
            map
        };
        let mut children_of: HashMap<String, Vec<String>> = HashMap::new();
        let mut roots: Vec<String> = Vec::new();
        for f in &initial {
            match initial_ancestor(f, &dir_to_file) {
                Some(ancestor) => {
                    children_of.entry(ancestor.to_string()).or_default().push(f.clone())
                }
                None => roots.push(f.clone()),
            }
        }

        let mut queued: HashSet<String> = initial.iter().cloned().collect();
        let top = Arc::new(Scope::new());
        let mut frontier: Vec<Pending> =
            roots.into_iter().map(|path| Pending { path, scope: top.clone() }).collect();

        while !frontier.is_empty() && errors.keep_going() {
            let results = self.parse_wave(&frontier);
            let mut next: Vec<Pending> = Vec::new();
            for (pending, result) in frontier.iter().zip(results) {
                self.parsed_files.push(pending.path.clone());
                let (file, scope) = match result {
                    Ok(parsed) => parsed,
                    Err(err) => {
                        errors.add(err);
                        continue;
                    }
                };
                let scope = Arc::new(scope);
                for def in file.modules() {
                    self.register_parsed_module(def, &pending.path, &mut errors);
                }
                // Initial-list descendants of this file.
                for child in children_of.remove(&pending.path).unwrap_or_default() {
                    next.push(Pending { path: child, scope: scope.clone() });
                }
                self.discover_children(
                    &pending.path,
                    &scope,
                    &mut queued,
                    &mut next,
                    &mut errors,
                );
            }
            frontier = next;
        }

        info!("parsed {} files", self.parsed_files.len());
        let files = self.parsed_files.clone();
        errors.into_result().map(|_| files)
    }

    /// Parses one wave of files, at most `PARSE_PARALLELISM` at a time.
    fn parse_wave(&self, frontier: &[Pending]) -> Vec<Result<(braid_syntax::File, Scope), Error>> {
        let mut results = Vec::with_capacity(frontier.len());
        for chunk in frontier.chunks(PARSE_PARALLELISM) {
            let chunk_results: Vec<_> = thread::scope(|s| {
                let handles: Vec<_> = chunk
                    .iter()
                    .map(|pending| {
                        let fs = self.fs.clone();
                        s.spawn(move || {
                            let text = fs.read_to_string(&pending.path).map_err(|e| {
                                Error::source(
                                    Position::new(pending.path.as_str(), 1, 1),
                                    format!("failed to read file: {}", e),
                                )
                            })?;
                            parse(&pending.path, &text, &pending.scope)
                                .map_err(|e| Error::source(e.pos, e.message))
                        })
                    })
                    .collect();
                handles.into_iter().map(|h| h.join().expect("parse thread panicked")).collect()
            });
            results.extend(chunk_results);
        }
        results
    }

    /// Evaluates `subdirs`, `optional_subdirs` and `build` from a parsed
    /// file's scope and queues the files they name.
    fn discover_children(
        &mut self,
        path: &str,
        scope: &Arc<Scope>,
        queued: &mut HashSet<String>,
        next: &mut Vec<Pending>,
        errors: &mut ErrorCollector,
    ) {
        let dir = parent_dir(path).to_string();

        for (var, optional) in [("subdirs", false), ("optional_subdirs", true)] {
            for (entry, pos) in string_list_var(scope, var, errors) {
                let pattern = join_dir(&dir, &entry);
                if crate::fs::has_glob(&pattern) {
                    for sub in self.fs.glob_dirs(&pattern) {
                        let file = format!("{}/{}", sub, MODULE_FILE_NAME);
                        if self.fs.exists(&file) && queued.insert(file.clone()) {
                            next.push(Pending { path: file, scope: scope.clone() });
                        }
                    }
                } else {
                    let file = format!("{}/{}", pattern, MODULE_FILE_NAME);
                    if self.fs.exists(&file) {
                        if queued.insert(file.clone()) {
                            next.push(Pending { path: file, scope: scope.clone() });
                        }
                    } else if !optional {
                        errors.add(Error::source(
                            pos,
                            format!("no {} in directory {:?}", MODULE_FILE_NAME, pattern),
                        ));
                    }
                }
            }
        }

        for (entry, pos) in string_list_var(scope, "build", errors) {
            let pattern = join_dir(&dir, &entry);
            let matched = self.fs.glob_files(&pattern);
            if matched.is_empty() && !crate::fs::has_glob(&pattern) {
                errors.add(Error::source(pos, format!("file {:?} not found", pattern)));
                continue;
            }
            for file in matched {
                if queued.insert(file.clone()) {
                    next.push(Pending { path: file, scope: scope.clone() });
                }
            }
        }
    }

    /// Registers one parsed module definition: allowlist gate, factory
    /// lookup, property unpacking, naming, then load hooks.
    fn register_parsed_module(
        &mut self,
        def: &ModuleDef,
        file_path: &str,
        errors: &mut ErrorCollector,
    ) {
        let dir = parent_dir(file_path).to_string();
        let (allowed, matched) = self.source_root_dirs.allowed(&dir);
        if !allowed {
            let reason = match matched {
                Some(entry) => format!("excluded by source root dir entry {:?}", entry),
                None => "not under any listed source root dir".to_string(),
            };
            debug!("skipping module at {}: {}", def.pos, reason);
            self.skipped_dirs.push((dir, reason));
            return;
        }

        let factory = match self.module_factories.get(&def.type_name) {
            Some(f) => *f,
            None => {
                errors.add(Error::source(
                    def.pos.clone(),
                    format!("unrecognized module type {:?}", def.type_name),
                ));
                return;
            }
        };

        let mut module = factory();
        let config = self.config.clone();
        let positions = {
            let mut structs = module.property_structs();
            match unpack_properties(&mut structs, &def.properties, &def.type_name, config.as_ref())
            {
                Ok(positions) => positions,
                Err(errs) => {
                    errors.extend(errs);
                    return;
                }
            }
        };

        let name = {
            let mut structs = module.property_structs();
            match lookup_string(&mut structs, "name") {
                Some(name) if !name.is_empty() => name,
                _ => {
                    errors.add(Error::source(
                        def.pos.clone(),
                        format!("module of type {:?} is missing a name property", def.type_name),
                    ));
                    return;
                }
            }
        };

        let id = self.install_module(
            name,
            def.type_name.clone(),
            factory,
            module,
            positions,
            def.pos.clone(),
            dir,
            errors,
        );
        if let Some(id) = id {
            self.run_load_hooks(id, errors);
        }
    }

    /// Creates a module outside parsing: load hooks and the CreateModule
    /// mutator API funnel through here. `configure` sets properties,
    /// including `name`.
    pub(crate) fn register_programmatic_module(
        &mut self,
        factory: ModuleFactory,
        type_name: &str,
        dir: &str,
        pos: Position,
        configure: impl FnOnce(&mut dyn Module),
        errors: &mut ErrorCollector,
    ) -> Option<VariantId> {
        let mut module = factory();
        configure(module.as_mut());
        let name = {
            let mut structs = module.property_structs();
            match lookup_string(&mut structs, "name") {
                Some(name) if !name.is_empty() => name,
                _ => {
                    errors.add(Error::source(
                        pos,
                        format!("created module of type {:?} has no name", type_name),
                    ));
                    return None;
                }
            }
        };
        let id = self.install_module(
            name,
            type_name.to_string(),
            factory,
            module,
            Default::default(),
            pos,
            dir.to_string(),
            errors,
        )?;
        self.run_load_hooks(id, errors);
        Some(id)
    }

    #[allow(clippy::too_many_arguments)]
    fn install_module(
        &mut self,
        name: String,
        type_name: String,
        factory: ModuleFactory,
        module: Box<dyn Module>,
        positions: crate::properties::PropertyPositions,
        pos: Position,
        dir: String,
        errors: &mut ErrorCollector,
    ) -> Option<VariantId> {
        let group_id = GroupId(self.groups.len() as u32);
        if let Err(msg) = self.names.new_module(&name, &dir, group_id, &pos) {
            errors.add(Error::source(pos, msg));
            return None;
        }
        let id = self.push_variant_record(|id| {
            Variant::new(id, group_id, name.clone(), type_name, factory, pos, dir.clone(), module, positions)
        });
        self.groups.push(ModuleGroup { name, dir, variants: vec![id] });
        Some(id)
    }

    fn run_load_hooks(&mut self, id: VariantId, errors: &mut ErrorCollector) {
        let mut hooks = self.with_variant_mut(id, |v| {
            v.module.as_mut().expect("module present at registration").load_hooks()
        });
        if hooks.is_empty() {
            return;
        }
        // Stable: ties keep declaration order.
        hooks.sort_by_key(|h| h.priority);
        let (dir, pos) = self.with_variant(id, |v| (v.dir.clone(), v.pos.clone()));
        for hook in hooks {
            let mut hook_ctx = LoadHookContext {
                ctx: self,
                module_id: id,
                dir: dir.clone(),
                pos: pos.clone(),
                errors: Vec::new(),
            };
            (hook.hook)(&mut hook_ctx);
            let hook_errors = hook_ctx.errors;
            errors.extend(hook_errors);
        }
    }
}

/// The nearest strict-ancestor directory of `file` holding an initial file.
fn initial_ancestor<'a>(file: &str, dir_to_file: &HashMap<&str, &'a str>) -> Option<&'a str> {
    let mut dir = parent_dir(file);
    // Strict ancestors only: a file in the same directory is a sibling.
    while !dir.is_empty() {
        dir = parent_dir(dir);
        if let Some(&f) = dir_to_file.get(dir) {
            if f != file {
                return Some(f);
            }
        }
    }
    None
}

fn join_dir(dir: &str, rel: &str) -> String {
    if dir.is_empty() {
        rel.to_string()
    } else {
        format!("{}/{}", dir, rel)
    }
}

/// Reads a driver variable as a list of strings, reporting element type
/// errors once each.
fn string_list_var(
    scope: &Scope,
    name: &str,
    errors: &mut ErrorCollector,
) -> Vec<(String, Position)> {
    let var = match scope.get(name) {
        Some(v) => v,
        None => return Vec::new(),
    };
    match &var.value.value {
        Value::List(elems) => {
            let mut out = Vec::new();
            for elem in elems {
                match &elem.value {
                    Value::String(s) => out.push((s.clone(), elem.pos.clone())),
                    other => errors.add(Error::source(
                        elem.pos.clone(),
                        format!("{} entries must be strings, found {}", name, other.kind_name()),
                    )),
                }
            }
            out
        }
        other => {
            errors.add(Error::source(
                var.value.pos.clone(),
                format!("{} must be a list of strings, found {}", name, other.kind_name()),
            ));
            Vec::new()
        }
    }
}
