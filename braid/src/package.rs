//! Package contexts: process-global Ninja variables, pools, and rules.
//!
//! Each package registers its globals once at startup under a short name;
//! emitted names are `short.name`. Only definitions transitively referenced
//! by an emitted build-def make it into the manifest, so unused packages
//! cost nothing.

use lazy_static::lazy_static;
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct VariableHandle(pub(crate) usize);

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct RuleHandle(pub(crate) usize);

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct PoolHandle(pub(crate) usize);

/// Parameters of a Ninja rule. `command` is mandatory; everything else maps
/// to the rule variable of the same name.
#[derive(Clone, Debug, Default)]
pub struct RuleParams {
    pub command: String,
    pub depfile: Option<String>,
    pub deps: Option<String>,
    pub description: Option<String>,
    pub generator: bool,
    pub restat: bool,
    pub rspfile: Option<String>,
    pub rspfile_content: Option<String>,
    pub pool: Option<PoolHandle>,
}

pub(crate) struct VariableDef {
    pub package: usize,
    pub name: String,
    pub value: NinjaValue,
}

pub(crate) struct RuleDef {
    pub package: usize,
    pub name: String,
    pub params: RuleParams,
}

pub(crate) struct PoolDef {
    pub package: usize,
    pub name: String,
    pub depth: i64,
}

#[derive(Default)]
pub(crate) struct Registry {
    pub packages: Vec<String>,
    pub variables: Vec<VariableDef>,
    pub rules: Vec<RuleDef>,
    pub pools: Vec<PoolDef>,
}

impl Registry {
    pub fn variable_qualified(&self, h: VariableHandle) -> String {
        let def = &self.variables[h.0];
        format!("{}.{}", self.packages[def.package], def.name)
    }

    pub fn rule_qualified(&self, h: RuleHandle) -> String {
        let def = &self.rules[h.0];
        format!("{}.{}", self.packages[def.package], def.name)
    }

    pub fn pool_qualified(&self, h: PoolHandle) -> String {
        let def = &self.pools[h.0];
        format!("{}.{}", self.packages[def.package], def.name)
    }

    pub fn lookup_variable(&self, qualified: &str) -> Option<VariableHandle> {
        (0..self.variables.len())
            .find(|&i| self.variable_qualified(VariableHandle(i)) == qualified)
            .map(VariableHandle)
    }
}

lazy_static! {
    pub(crate) static ref REGISTRY: RwLock<Registry> = RwLock::new(Registry::default());
}

pub(crate) fn with_registry<R>(f: impl FnOnce(&Registry) -> R) -> R {
    f(&REGISTRY.read())
}

/// A handle under which a package registers its globals. Create one per
/// logical package at startup.
pub struct PackageContext {
    index: usize,
}

impl PackageContext {
    /// Panics on a duplicate short name; package names are fixed at startup.
    pub fn new(short_name: &str) -> PackageContext {
        let mut reg = REGISTRY.write();
        if reg.packages.iter().any(|p| p == short_name) {
            panic!("package {:?} registered twice", short_name);
        }
        reg.packages.push(short_name.to_string());
        PackageContext { index: reg.packages.len() - 1 }
    }

    pub fn static_variable(&self, name: &str, value: &str) -> VariableHandle {
        let value = NinjaValue::parse(value)
            .unwrap_or_else(|e| panic!("variable {}: {}", name, e));
        let mut reg = REGISTRY.write();
        if reg.variables.iter().any(|v| v.package == self.index && v.name == name) {
            panic!("variable {:?} registered twice in one package", name);
        }
        reg.variables.push(VariableDef { package: self.index, name: name.to_string(), value });
        VariableHandle(reg.variables.len() - 1)
    }

    pub fn static_rule(&self, name: &str, params: RuleParams) -> RuleHandle {
        let mut reg = REGISTRY.write();
        if reg.rules.iter().any(|r| r.package == self.index && r.name == name) {
            panic!("rule {:?} registered twice in one package", name);
        }
        reg.rules.push(RuleDef { package: self.index, name: name.to_string(), params });
        RuleHandle(reg.rules.len() - 1)
    }

    pub fn static_pool(&self, name: &str, depth: i64) -> PoolHandle {
        let mut reg = REGISTRY.write();
        if reg.pools.iter().any(|p| p.package == self.index && p.name == name) {
            panic!("pool {:?} registered twice in one package", name);
        }
        reg.pools.push(PoolDef { package: self.index, name: name.to_string(), depth });
        PoolHandle(reg.pools.len() - 1)
    }
}

/// A string with `${reference}` placeholders split out. `$in`, `$out` and
/// other bare `$x` forms pass through as text for Ninja itself to expand.
#[derive(Clone, Debug, PartialEq)]
pub struct NinjaValue {
    pub(crate) parts: Vec<NinjaPart>,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum NinjaPart {
    Text(String),
    /// A `${name}` reference, resolved at emission: against the module's
    /// local scope first, then the global registry.
    Ref(String),
}

impl NinjaValue {
    pub fn parse(s: &str) -> Result<NinjaValue, String> {
        let mut parts = Vec::new();
        let mut text = String::new();
        let mut rest = s;
        while let Some(at) = rest.find("${") {
            text.push_str(&rest[..at]);
            rest = &rest[at + 2..];
            let end = rest
                .find('}')
                .ok_or_else(|| format!("unterminated ${{ reference in {:?}", s))?;
            let name = &rest[..end];
            if name.is_empty() {
                return Err(format!("empty ${{}} reference in {:?}", s));
            }
            if !text.is_empty() {
                parts.push(NinjaPart::Text(std::mem::take(&mut text)));
            }
            parts.push(NinjaPart::Ref(name.to_string()));
            rest = &rest[end + 1..];
        }
        text.push_str(rest);
        if !text.is_empty() {
            parts.push(NinjaPart::Text(text));
        }
        Ok(NinjaValue { parts })
    }

    /// References appearing in this value, in order.
    pub(crate) fn references(&self) -> impl Iterator<Item = &str> {
        self.parts.iter().filter_map(|p| match p {
            NinjaPart::Ref(name) => Some(name.as_str()),
            NinjaPart::Text(_) => None,
        })
    }

    /// Renders with `resolve` mapping each reference to its emitted name.
    pub(crate) fn render(&self, resolve: &dyn Fn(&str) -> String) -> String {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                NinjaPart::Text(t) => out.push_str(t),
                NinjaPart::Ref(name) => {
                    out.push_str("${");
                    out.push_str(&resolve(name));
                    out.push('}');
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_splits_references() {
        let v = NinjaValue::parse("${cc} -c $in -o $out ${pkg.flags}").unwrap();
        assert_eq!(v.references().collect::<Vec<_>>(), vec!["cc", "pkg.flags"]);
        let rendered = v.render(&|name| format!("g.{}", name));
        assert_eq!(rendered, "${g.cc} -c $in -o $out ${g.pkg.flags}");
    }

    #[test]
    fn parse_rejects_malformed_references() {
        assert!(NinjaValue::parse("${unclosed").is_err());
        assert!(NinjaValue::parse("a ${} b").is_err());
    }

    #[test]
    fn plain_text_round_trips() {
        let v = NinjaValue::parse("gcc -Wall").unwrap();
        assert!(v.references().next().is_none());
        assert_eq!(v.render(&|n| n.to_string()), "gcc -Wall");
    }

    #[test]
    fn package_registration_and_qualified_names() {
        let pkg = PackageContext::new("pkgtest");
        let var = pkg.static_variable("cc", "gcc");
        let rule = pkg.static_rule(
            "compile",
            RuleParams { command: "${pkgtest.cc} -c $in -o $out".to_string(), ..Default::default() },
        );
        let pool = pkg.static_pool("link", 2);
        with_registry(|reg| {
            assert_eq!(reg.variable_qualified(var), "pkgtest.cc");
            assert_eq!(reg.rule_qualified(rule), "pkgtest.compile");
            assert_eq!(reg.pool_qualified(pool), "pkgtest.link");
        });
    }
}
