//! Lexical scopes for braid files.
//!
//! Each file is evaluated in a scope inherited from the file in its closest
//! ancestor directory. A handful of driver-interpreted variables never
//! inherit, so every file states its own file list.

use crate::{Position, ValueAt};
use std::collections::HashMap;

/// Variables that are always local to the file that assigns them.
pub const DONT_INHERIT: &[&str] = &["subdirs", "optional_subdirs", "build"];

#[derive(Clone, Debug)]
pub struct Variable {
    pub name: String,
    pub pos: Position,
    pub value: ValueAt,
    pub inherited: bool,
}

#[derive(Clone, Debug, Default)]
pub struct Scope {
    vars: HashMap<String, Variable>,
}

impl Scope {
    pub fn new() -> Scope {
        Scope::default()
    }

    /// A child scope seeded with the parent's variables, except the
    /// `DONT_INHERIT` set.
    pub fn inherit(parent: &Scope) -> Scope {
        let vars = parent
            .vars
            .iter()
            .filter(|(name, _)| !DONT_INHERIT.contains(&name.as_str()))
            .map(|(name, var)| (name.clone(), Variable { inherited: true, ..var.clone() }))
            .collect();
        Scope { vars }
    }

    pub fn get(&self, name: &str) -> Option<&Variable> {
        self.vars.get(name)
    }

    /// Set-once assignment. Fails if the name already exists, locally or
    /// inherited.
    pub(crate) fn assign(&mut self, name: &str, pos: Position, value: ValueAt) -> Result<(), String> {
        if let Some(existing) = self.vars.get(name) {
            return Err(format!(
                "variable {:?} already defined at {}{}",
                name,
                existing.pos,
                if existing.inherited { " (inherited)" } else { "" },
            ));
        }
        self.vars.insert(
            name.to_string(),
            Variable { name: name.to_string(), pos, value, inherited: false },
        );
        Ok(())
    }

    /// `+=`: concatenates onto an existing variable. An inherited variable is
    /// copied into this scope first, so the parent's value is untouched.
    pub(crate) fn append(&mut self, name: &str, pos: Position, value: ValueAt) -> Result<(), String> {
        let existing = match self.vars.get(name) {
            Some(v) => v.clone(),
            None => return Err(format!("undefined variable {:?}", name)),
        };
        let combined = crate::parser::concat(&existing.value, &value)?;
        self.vars.insert(
            name.to_string(),
            Variable { name: name.to_string(), pos, value: combined, inherited: false },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Value, ValueAt};

    fn str_val(s: &str) -> ValueAt {
        ValueAt { pos: Position::default(), value: Value::String(s.to_string()) }
    }

    #[test]
    fn inherit_skips_driver_vars() {
        let mut parent = Scope::new();
        parent.assign("cflags", Position::default(), str_val("-O2")).unwrap();
        parent
            .assign(
                "subdirs",
                Position::default(),
                ValueAt { pos: Position::default(), value: Value::List(vec![]) },
            )
            .unwrap();
        let child = Scope::inherit(&parent);
        assert!(child.get("cflags").is_some());
        assert!(child.get("cflags").unwrap().inherited);
        assert!(child.get("subdirs").is_none());
    }

    #[test]
    fn assign_is_set_once() {
        let mut s = Scope::new();
        s.assign("x", Position::default(), str_val("a")).unwrap();
        assert!(s.assign("x", Position::default(), str_val("b")).is_err());
    }

    #[test]
    fn append_copies_inherited() {
        let mut parent = Scope::new();
        parent.assign("x", Position::default(), str_val("a")).unwrap();
        let mut child = Scope::inherit(&parent);
        child.append("x", Position::default(), str_val("b")).unwrap();
        assert_eq!(child.get("x").unwrap().value.value, Value::String("ab".to_string()));
        assert_eq!(parent.get("x").unwrap().value.value, Value::String("a".to_string()));
    }

    #[test]
    fn append_requires_definition() {
        let mut s = Scope::new();
        assert!(s.append("nope", Position::default(), str_val("b")).is_err());
    }
}
