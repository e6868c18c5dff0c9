//! Braid analyzes declarative module files and generates a Ninja manifest.
//!
//! Embedders register module types, mutators, and singletons on a
//! [`Context`], then drive the pipeline:
//!
//! ```rust,ignore
//! let mut ctx = Context::new(config, ".");
//! ctx.register_module_type("filegroup", filegroup_factory);
//! ctx.parse_file_list("Braidfile.list")?;
//! ctx.resolve_dependencies()?;
//! ctx.prepare_build_actions()?;
//! ctx.write_build_file(std::fs::File::create("build.ninja")?)?;
//! ```
//!
//! Parsing walks files ancestors-first; resolution seeds the dependency
//! graph and runs the mutators, which may split modules into variants;
//! generation visits every variant bottom-up collecting build statements;
//! emission is a deterministic rendering of the result.

#![warn(rust_2018_idioms)]

pub mod builtins;
mod cache;
mod config;
mod context;
mod dedup;
mod depset;
mod emit;
mod errors;
mod fs;
mod generate;
mod hash;
mod module;
mod mutator;
mod name;
mod package;
mod parse;
mod properties;
mod provider;
mod resolve;
mod transition;
mod uniquelist;
mod visitor;

pub use braid_syntax::{Position, SelectBranch, SelectExpr, Value};

pub use config::{Config, PrimaryBuilderInvocation, SimpleConfig};
pub use context::Context;
pub use depset::{DepSet, DepSetBuilder, Order as DepSetOrder};
pub use errors::{Error, MAX_ERRORS};
pub use fs::{FileSystem, MockFs, RealFs};
pub use generate::{
    BuildParams, LocalBuildActions, ModuleContext, RuleRef, Singleton, SingletonContext,
};
pub use module::{
    BaseDependencyTag, Dep, DependencyTag, Module, ModuleFactory, Tag, VariantId, VariationMap,
};
pub use mutator::{MutatorContext, MutatorInfo, ReplacePredicate, SplitModule};
pub use name::{NameInterface, SimpleNameInterface};
pub use package::{PackageContext, PoolHandle, RuleHandle, RuleParams, VariableHandle};
pub use parse::{LoadHook, LoadHookContext, MODULE_FILE_NAME};
pub use properties::{
    Configurable, ConfigurableRef, Field, FieldRef, ListRef, NameProperties, PropertyStruct,
    StructList,
};
pub use provider::{new_mutator_provider, new_provider, ProviderData, ProviderKey};
pub use resolve::DynamicDependerContext;
pub use transition::{
    TransitionContext, TransitionInfo, TransitionInfoRef, TransitionMutator, VariationLabel,
};
pub use uniquelist::UniqueList;
