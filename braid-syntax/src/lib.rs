//! Surface syntax for braid files.
//!
//! A braid file is a flat sequence of variable assignments and module
//! definitions. The parser here is deliberately small: it lexes, parses and
//! *evaluates* a single file against the lexical scope inherited from its
//! parent directory's file, producing fully-evaluated property values. The
//! analysis engine never sees an unevaluated variable reference.

use serde::{Deserialize, Serialize};
use std::fmt;

mod lexer;
mod parser;
mod scope;

pub use parser::{parse, ParseError};
pub use scope::{Scope, Variable};

/// A location in a braid file. Lines and columns are 1-based.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position {
    pub file: String,
    pub line: u32,
    pub col: u32,
}

impl Position {
    pub fn new(file: impl Into<String>, line: u32, col: u32) -> Position {
        Position { file: file.into(), line, col }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.col)
    }
}

/// A fully-evaluated property value. Variable references and `+` expressions
/// have already been folded away by the parser; `select()` expressions stay
/// unevaluated because their conditions resolve against the configuration,
/// which the parser never sees.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    String(String),
    Bool(bool),
    Int(i64),
    List(Vec<ValueAt>),
    Map(Vec<Property>),
    Select(Box<SelectExpr>),
}

impl Value {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::String(_) => "string",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Select(_) => "select",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Flattens a list of strings. Returns `None` if this is not a list or
    /// any element is not a string.
    pub fn as_string_list(&self) -> Option<Vec<String>> {
        match self {
            Value::List(elems) => {
                let mut out = Vec::with_capacity(elems.len());
                for e in elems {
                    out.push(e.value.as_str()?.to_string());
                }
                Some(out)
            }
            _ => None,
        }
    }
}

/// A value paired with the position it was written at.
#[derive(Clone, Debug, PartialEq)]
pub struct ValueAt {
    pub pos: Position,
    pub value: Value,
}

/// A `select(condition("arg", ...), { "label": value, default: value })`
/// expression. The condition is an opaque (function, args) pair the engine
/// evaluates against its configuration when properties unpack.
#[derive(Clone, Debug, PartialEq)]
pub struct SelectExpr {
    pub function: String,
    pub args: Vec<String>,
    pub branches: Vec<SelectBranch>,
}

/// One branch of a `select()`. `label: None` is the `default` branch.
#[derive(Clone, Debug, PartialEq)]
pub struct SelectBranch {
    pub label: Option<String>,
    pub value: ValueAt,
}

/// One `name: value` entry in a module body or map.
#[derive(Clone, Debug, PartialEq)]
pub struct Property {
    pub name: String,
    pub pos: Position,
    pub value: ValueAt,
}

impl Property {
    pub fn lookup<'a>(props: &'a [Property], name: &str) -> Option<&'a Property> {
        props.iter().find(|p| p.name == name)
    }
}

/// A `type { ... }` module definition.
#[derive(Clone, Debug, PartialEq)]
pub struct ModuleDef {
    pub type_name: String,
    pub pos: Position,
    pub properties: Vec<Property>,
}

/// The operator of an assignment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AssignOp {
    Assign,
    Append,
}

/// A top-level `name = value` or `name += value` assignment.
#[derive(Clone, Debug, PartialEq)]
pub struct Assignment {
    pub name: String,
    pub pos: Position,
    pub op: AssignOp,
    pub value: ValueAt,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Definition {
    Module(ModuleDef),
    Assignment(Assignment),
}

/// A parsed braid file.
#[derive(Clone, Debug, PartialEq)]
pub struct File {
    pub name: String,
    pub defs: Vec<Definition>,
}

impl File {
    pub fn modules(&self) -> impl Iterator<Item = &ModuleDef> {
        self.defs.iter().filter_map(|d| match d {
            Definition::Module(m) => Some(m),
            Definition::Assignment(_) => None,
        })
    }
}
