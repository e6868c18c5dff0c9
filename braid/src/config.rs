//! The opaque configuration object.
//!
//! The engine passes the config through to module types without interpreting
//! it beyond this trait; embedders downcast via `as_any` to reach their own
//! concrete type.

use std::any::Any;
use std::collections::HashMap;

/// One command the emitted manifest runs to regenerate itself: the primary
/// builder that produced the manifest, or one of its companion tools.
#[derive(Clone, Debug, Default)]
pub struct PrimaryBuilderInvocation {
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub command: String,
    pub description: Option<String>,
    /// Run on Ninja's built-in `console` pool.
    pub console: bool,
    /// A generator test-suite run; only emitted when the config's
    /// `run_go_tests` is set.
    pub tests: bool,
}

pub trait Config: Any + Send + Sync {
    /// Directory for analysis outputs: cache files, shard manifests.
    fn out_dir(&self) -> String;

    /// Where host tools the manifest invokes live; emitted as the
    /// `host_tool_dir` variable alongside the primary builder invocations so
    /// their commands can reference `${host_tool_dir}`.
    fn host_tool_dir(&self) -> String {
        format!("{}/host-tools", self.out_dir())
    }

    /// Extra manifests to `subninja` from the emitted one.
    fn subninjas(&self) -> Vec<String> {
        Vec::new()
    }

    /// Commands the manifest includes to rebuild itself.
    fn primary_builder_invocations(&self) -> Vec<PrimaryBuilderInvocation> {
        Vec::new()
    }

    /// Whether invocations flagged as generator test suites (e.g. `go test`
    /// runs for Go-built tools) are emitted too.
    fn run_go_tests(&self) -> bool {
        false
    }

    /// The label a `select()` condition evaluates to, or `None` to take the
    /// default branch. `function` and `args` come straight from the source
    /// expression, e.g. `variable("build_mode")`.
    fn select_value(&self, _function: &str, _args: &[String]) -> Option<String> {
        None
    }

    fn as_any(&self) -> &dyn Any;
}

/// A plain value config, enough for the CLI and for tests. Supports the
/// `variable("name")` select condition backed by `select_values`.
#[derive(Clone, Debug, Default)]
pub struct SimpleConfig {
    pub out_dir: String,
    pub subninjas: Vec<String>,
    pub primary_builder_invocations: Vec<PrimaryBuilderInvocation>,
    pub run_go_tests: bool,
    pub select_values: HashMap<String, String>,
}

impl SimpleConfig {
    pub fn new(out_dir: impl Into<String>) -> SimpleConfig {
        SimpleConfig { out_dir: out_dir.into(), ..SimpleConfig::default() }
    }
}

impl Config for SimpleConfig {
    fn out_dir(&self) -> String {
        self.out_dir.clone()
    }

    fn subninjas(&self) -> Vec<String> {
        self.subninjas.clone()
    }

    fn primary_builder_invocations(&self) -> Vec<PrimaryBuilderInvocation> {
        self.primary_builder_invocations.clone()
    }

    fn run_go_tests(&self) -> bool {
        self.run_go_tests
    }

    fn select_value(&self, function: &str, args: &[String]) -> Option<String> {
        if function != "variable" {
            return None;
        }
        args.first().and_then(|name| self.select_values.get(name).cloned())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_config_resolves_variable_conditions() {
        let mut config = SimpleConfig::new("out");
        config.select_values.insert("mode".to_string(), "debug".to_string());
        assert_eq!(
            config.select_value("variable", &["mode".to_string()]),
            Some("debug".to_string()),
        );
        assert_eq!(config.select_value("variable", &["other".to_string()]), None);
        assert_eq!(config.select_value("release_flag", &["mode".to_string()]), None);
    }

    #[test]
    fn defaults_are_empty() {
        let config = SimpleConfig::new("out");
        assert_eq!(config.host_tool_dir(), "out/host-tools");
        assert!(config.primary_builder_invocations().is_empty());
        assert!(!config.run_go_tests());
    }
}
