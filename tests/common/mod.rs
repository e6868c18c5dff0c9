//! Shared scaffolding for the end-to-end tests: an in-memory context
//! builder and a couple of small module types.

#![allow(dead_code)]

use braid::{
    Context, Field, FieldRef, ListRef, MockFs, Module, ModuleContext, PropertyStruct, SimpleConfig,
};
use std::any::Any;
use std::sync::Arc;

/// A context over an in-memory file tree with `out` as the output dir.
pub fn test_ctx(files: &[(&str, &str)]) -> Context {
    test_ctx_with_out(files, "out")
}

pub fn test_ctx_with_out(files: &[(&str, &str)], out_dir: &str) -> Context {
    test_ctx_with_config(files, SimpleConfig::new(out_dir))
}

pub fn test_ctx_with_config(files: &[(&str, &str)], config: SimpleConfig) -> Context {
    let fs = Arc::new(MockFs::with_files(files.iter().copied()));
    Context::with_fs(Arc::new(config), fs)
}

/// Runs parse + resolve and panics with the error list on failure.
pub fn analyze(ctx: &mut Context, list_file: &str) {
    ctx.parse_file_list(list_file).unwrap_or_else(|e| panic!("parse: {:?}", e));
    ctx.resolve_dependencies().unwrap_or_else(|e| panic!("resolve: {:?}", e));
    ctx.prepare_build_actions().unwrap_or_else(|e| panic!("generate: {:?}", e));
}

pub fn manifest(ctx: &Context) -> String {
    let mut buf = Vec::new();
    ctx.write_build_file(&mut buf).expect("write manifest");
    String::from_utf8(buf).expect("manifest is utf-8")
}

/// Properties shared by the test module types: a name, dependency names,
/// and a free-form value.
#[derive(Default)]
pub struct TestProps {
    pub name: Option<String>,
    pub deps: Vec<String>,
    pub value: Option<String>,
}

impl PropertyStruct for TestProps {
    fn fields(&mut self) -> Vec<Field<'_>> {
        vec![
            Field::new("name", FieldRef::String(&mut self.name)),
            Field::new("deps", FieldRef::List(ListRef::String(&mut self.deps))),
            Field::new("value", FieldRef::String(&mut self.value)),
        ]
    }
}

/// A module that declares its `deps` and emits one phony build-def whose
/// inputs are its direct deps' display names.
#[derive(Default)]
pub struct TestModule {
    pub props: TestProps,
}

impl Module for TestModule {
    fn property_structs(&mut self) -> Vec<&mut dyn PropertyStruct> {
        vec![&mut self.props]
    }

    fn dynamic_dependencies(
        &mut self,
        _ctx: &mut braid::DynamicDependerContext<'_>,
    ) -> Vec<String> {
        self.props.deps.clone()
    }

    fn generate_build_actions(&mut self, ctx: &mut ModuleContext<'_>) {
        let mut inputs = Vec::new();
        ctx.visit_direct_deps(|dep, _| inputs.push(ctx.other_module_name(dep)));
        let variant = ctx.module_variant();
        let output = if variant.is_empty() {
            format!("{}.out", ctx.module_name())
        } else {
            format!("{}.{}.out", ctx.module_name(), variant)
        };
        ctx.build(braid::BuildParams {
            rule: braid::RuleRef::Phony,
            outputs: vec![output],
            inputs,
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

pub fn test_module_factory() -> Box<dyn Module> {
    Box::new(TestModule::default())
}

/// Registers `test_module_factory` under several type names so tests can
/// distinguish modules by type.
pub fn register_test_types(ctx: &mut Context, type_names: &[&str]) {
    for name in type_names {
        ctx.register_module_type(name, test_module_factory);
    }
}
