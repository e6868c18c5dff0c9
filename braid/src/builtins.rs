//! Module types registered by the standalone `braid` binary.
//!
//! Embedders bring their own module types; these two exist so the CLI can
//! analyze a tree without embedding braid in a larger build system, and they
//! double as realistic exercises of the provider and dependency APIs.

use crate::generate::{BuildParams, ModuleContext, RuleRef};
use crate::module::Module;
use crate::package::{PackageContext, RuleHandle, RuleParams};
use crate::properties::{Configurable, ConfigurableRef, Field, FieldRef, ListRef, PropertyStruct};
use crate::provider::{new_provider, ProviderKey};
use crate::resolve::DynamicDependerContext;
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::any::Any;

/// File lists published by `filegroup` and consumed by `shell_task`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FileList {
    pub files: Vec<String>,
}

lazy_static! {
    pub static ref FILES: ProviderKey<FileList> = new_provider::<FileList>();
    static ref PKG: PackageContext = PackageContext::new("braid");
    static ref SHELL_RULE: RuleHandle = PKG.static_rule(
        "shell",
        RuleParams {
            command: "${braid.shell} -c ${braid_cmd}".to_string(),
            description: Some("SHELL ${out}".to_string()),
            ..Default::default()
        },
    );
}

lazy_static! {
    static ref SHELL_VAR: crate::package::VariableHandle = PKG.static_variable("shell", "/bin/sh");
}

fn join_dir(dir: &str, rel: &str) -> String {
    if dir.is_empty() {
        rel.to_string()
    } else {
        format!("{}/{}", dir, rel)
    }
}

// ---- filegroup -------------------------------------------------------------

#[derive(Default)]
struct FilegroupProps {
    name: Option<String>,
    srcs: Vec<String>,
}

impl PropertyStruct for FilegroupProps {
    fn fields(&mut self) -> Vec<Field<'_>> {
        vec![
            Field::new("name", FieldRef::String(&mut self.name)),
            Field::new("srcs", FieldRef::List(ListRef::String(&mut self.srcs))),
        ]
    }
}

/// Publishes its sources (module-dir-relative) as a `FileList` provider.
#[derive(Default)]
struct Filegroup {
    props: FilegroupProps,
}

impl Module for Filegroup {
    fn property_structs(&mut self) -> Vec<&mut dyn PropertyStruct> {
        vec![&mut self.props]
    }

    fn generate_build_actions(&mut self, ctx: &mut ModuleContext<'_>) {
        let dir = ctx.module_dir();
        let files = self.props.srcs.iter().map(|s| join_dir(&dir, s)).collect();
        ctx.set_provider(*FILES, FileList { files });
    }

    fn incremental_supported(&self) -> bool {
        true
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

pub fn filegroup_factory() -> Box<dyn Module> {
    Box::new(Filegroup::default())
}

// ---- shell_task ------------------------------------------------------------

#[derive(Default)]
struct ShellTaskProps {
    name: Option<String>,
    /// Configurable so a task can pick its command with `select()`.
    cmd: Configurable<String>,
    srcs: Vec<String>,
    outs: Vec<String>,
    deps: Vec<String>,
}

impl PropertyStruct for ShellTaskProps {
    fn fields(&mut self) -> Vec<Field<'_>> {
        vec![
            Field::new("name", FieldRef::String(&mut self.name)),
            Field::new("cmd", FieldRef::Configurable(ConfigurableRef::String(&mut self.cmd))),
            Field::new("srcs", FieldRef::List(ListRef::String(&mut self.srcs))),
            Field::new("outs", FieldRef::List(ListRef::String(&mut self.outs))),
            Field::new("deps", FieldRef::List(ListRef::String(&mut self.deps))),
        ]
    }
}

/// Runs a shell command over its sources plus every file its `deps`
/// (typically filegroups) publish.
#[derive(Default)]
struct ShellTask {
    props: ShellTaskProps,
}

impl Module for ShellTask {
    fn property_structs(&mut self) -> Vec<&mut dyn PropertyStruct> {
        vec![&mut self.props]
    }

    fn dynamic_dependencies(&mut self, _ctx: &mut DynamicDependerContext<'_>) -> Vec<String> {
        self.props.deps.clone()
    }

    fn generate_build_actions(&mut self, ctx: &mut ModuleContext<'_>) {
        let cmd = match self.props.cmd.get() {
            Some(cmd) => cmd.clone(),
            None => {
                ctx.property_errorf("cmd", "shell_task requires a cmd");
                return;
            }
        };
        if self.props.outs.is_empty() {
            ctx.property_errorf("outs", "shell_task requires at least one output");
            return;
        }

        let dir = ctx.module_dir();
        let inputs: Vec<String> = self.props.srcs.iter().map(|s| join_dir(&dir, s)).collect();
        let mut implicits = Vec::new();
        ctx.visit_direct_deps(|dep, _tag| {
            if let Some(files) = ctx.other_module_provider(dep, *FILES) {
                implicits.extend(files.files.iter().cloned());
            }
        });

        let out_dir = ctx.config().out_dir();
        let outputs: Vec<String> =
            self.props.outs.iter().map(|o| format!("{}/{}", out_dir, o)).collect();
        ctx.build(BuildParams {
            comment: Some(format!("shell_task {}", ctx.module_name())),
            rule: RuleRef::Global(*SHELL_RULE),
            outputs,
            inputs,
            implicits,
            args: vec![("braid_cmd".to_string(), cmd)],
            ..Default::default()
        });
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

pub fn shell_task_factory() -> Box<dyn Module> {
    Box::new(ShellTask::default())
}

/// Registers the built-in module types on a context.
pub fn register(ctx: &mut crate::context::Context) {
    // Touch the package statics so their globals exist before emission.
    lazy_static::initialize(&SHELL_VAR);
    lazy_static::initialize(&SHELL_RULE);
    ctx.register_module_type("filegroup", filegroup_factory);
    ctx.register_module_type("shell_task", shell_task_factory);
}
