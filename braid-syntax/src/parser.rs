//! Recursive-descent parser and evaluator.
//!
//! Parsing and evaluation happen in one pass: variable references resolve
//! against the scope as they are encountered, and `+` expressions fold
//! immediately, so the produced `File` contains only concrete values.

use crate::lexer::{LexError, Lexer, Tok};
use crate::{
    AssignOp, Assignment, Definition, File, ModuleDef, Position, Property, Scope, SelectBranch,
    SelectExpr, Value, ValueAt,
};
use thiserror::Error;

#[derive(Clone, Debug, Error)]
#[error("{pos}: {message}")]
pub struct ParseError {
    pub pos: Position,
    pub message: String,
}

impl From<LexError> for ParseError {
    fn from(e: LexError) -> ParseError {
        ParseError { pos: e.pos, message: e.message }
    }
}

/// Parses and evaluates one file. The returned scope holds the file's own
/// variables on top of everything it inherited, and is the scope children of
/// this file's directory inherit from.
pub fn parse(file_name: &str, input: &str, parent: &Scope) -> Result<(File, Scope), ParseError> {
    let mut p = Parser {
        lexer: Lexer::new(file_name, input),
        look: None,
        scope: Scope::inherit(parent),
    };
    let defs = p.parse_defs()?;
    Ok((File { name: file_name.to_string(), defs }, p.scope))
}

struct Parser<'a> {
    lexer: Lexer<'a>,
    look: Option<(Position, Tok)>,
    scope: Scope,
}

impl<'a> Parser<'a> {
    fn peek(&mut self) -> Result<&(Position, Tok), ParseError> {
        if self.look.is_none() {
            self.look = Some(self.lexer.next()?);
        }
        Ok(self.look.as_ref().expect("lookahead"))
    }

    fn bump(&mut self) -> Result<(Position, Tok), ParseError> {
        match self.look.take() {
            Some(t) => Ok(t),
            None => Ok(self.lexer.next()?),
        }
    }

    fn expect(&mut self, want: &Tok) -> Result<Position, ParseError> {
        let (pos, tok) = self.bump()?;
        if &tok == want {
            Ok(pos)
        } else {
            Err(ParseError {
                pos,
                message: format!("expected {}, found {}", want.describe(), tok.describe()),
            })
        }
    }

    fn parse_defs(&mut self) -> Result<Vec<Definition>, ParseError> {
        let mut defs = vec![];
        loop {
            let (pos, tok) = self.bump()?;
            let name = match tok {
                Tok::Eof => return Ok(defs),
                Tok::Ident(name) => name,
                other => {
                    return Err(ParseError {
                        pos,
                        message: format!(
                            "expected module type or variable name, found {}",
                            other.describe()
                        ),
                    })
                }
            };
            let next = self.peek()?.1.clone();
            match next {
                Tok::LBrace => {
                    let properties = self.parse_body()?;
                    defs.push(Definition::Module(ModuleDef { type_name: name, pos, properties }));
                }
                Tok::Assign | Tok::AppendAssign => {
                    let (_, op_tok) = self.bump()?;
                    let op = match op_tok {
                        Tok::Assign => AssignOp::Assign,
                        _ => AssignOp::Append,
                    };
                    let value = self.parse_expr()?;
                    let result = match op {
                        AssignOp::Assign => self.scope.assign(&name, pos.clone(), value.clone()),
                        AssignOp::Append => self.scope.append(&name, pos.clone(), value.clone()),
                    };
                    if let Err(message) = result {
                        return Err(ParseError { pos, message });
                    }
                    defs.push(Definition::Assignment(Assignment { name, pos, op, value }));
                }
                _ => {
                    let (pos, tok) = self.bump()?;
                    return Err(ParseError {
                        pos,
                        message: format!("expected '{{' or '=', found {}", tok.describe()),
                    });
                }
            }
        }
    }

    /// `{ name: value, ... }` — shared by module bodies and map values.
    fn parse_body(&mut self) -> Result<Vec<Property>, ParseError> {
        self.expect(&Tok::LBrace)?;
        let mut props = vec![];
        loop {
            let (pos, tok) = self.bump()?;
            let name = match tok {
                Tok::RBrace => return Ok(props),
                Tok::Ident(name) => name,
                other => {
                    return Err(ParseError {
                        pos,
                        message: format!("expected property name or '}}', found {}", other.describe()),
                    })
                }
            };
            if let Some(prev) = Property::lookup(&props, &name) {
                return Err(ParseError {
                    pos,
                    message: format!("property {:?} already defined at {}", name, prev.pos),
                });
            }
            self.expect(&Tok::Colon)?;
            let value = self.parse_expr()?;
            props.push(Property { name, pos, value });
            let next = self.peek()?.1.clone();
            match next {
                Tok::Comma => {
                    self.bump()?;
                }
                Tok::RBrace => {}
                _ => {
                    let (pos, tok) = self.bump()?;
                    return Err(ParseError {
                        pos,
                        message: format!("expected ',' or '}}', found {}", tok.describe()),
                    });
                }
            }
        }
    }

    fn parse_expr(&mut self) -> Result<ValueAt, ParseError> {
        let mut lhs = self.parse_primary()?;
        while self.peek()?.1 == Tok::Plus {
            let (plus_pos, _) = self.bump()?;
            let rhs = self.parse_primary()?;
            lhs = concat(&lhs, &rhs).map_err(|message| ParseError { pos: plus_pos, message })?;
        }
        Ok(lhs)
    }

    fn parse_primary(&mut self) -> Result<ValueAt, ParseError> {
        let (pos, tok) = self.bump()?;
        let value = match tok {
            Tok::Str(s) => Value::String(s),
            Tok::Int(n) => Value::Int(n),
            Tok::Ident(name) => {
                if name == "true" {
                    Value::Bool(true)
                } else if name == "false" {
                    Value::Bool(false)
                } else if name == "select" && self.peek()?.1 == Tok::LParen {
                    Value::Select(Box::new(self.parse_select()?))
                } else {
                    match self.scope.get(&name) {
                        Some(var) => var.value.value.clone(),
                        None => {
                            return Err(ParseError {
                                pos,
                                message: format!("undefined variable {:?}", name),
                            })
                        }
                    }
                }
            }
            Tok::LBracket => {
                let mut elems = vec![];
                loop {
                    if self.peek()?.1 == Tok::RBracket {
                        self.bump()?;
                        break;
                    }
                    elems.push(self.parse_expr()?);
                    let next = self.peek()?.1.clone();
                    match next {
                        Tok::Comma => {
                            self.bump()?;
                        }
                        Tok::RBracket => {}
                        _ => {
                            let (pos, tok) = self.bump()?;
                            return Err(ParseError {
                                pos,
                                message: format!("expected ',' or ']', found {}", tok.describe()),
                            });
                        }
                    }
                }
                Value::List(elems)
            }
            Tok::LBrace => {
                // Re-enter the body parser: a map literal has the same shape
                // as a module body.
                self.look = Some((pos.clone(), Tok::LBrace));
                Value::Map(self.parse_body()?)
            }
            other => {
                return Err(ParseError {
                    pos,
                    message: format!("expected value, found {}", other.describe()),
                })
            }
        };
        Ok(ValueAt { pos, value })
    }
}

impl<'a> Parser<'a> {
    /// `select(condition("arg", ...), { "label": value, default: value })`.
    /// The leading `select` ident and the lookahead `(` have already been
    /// seen by the caller.
    fn parse_select(&mut self) -> Result<SelectExpr, ParseError> {
        self.expect(&Tok::LParen)?;
        let (fn_pos, fn_tok) = self.bump()?;
        let function = match fn_tok {
            Tok::Ident(f) => f,
            other => {
                return Err(ParseError {
                    pos: fn_pos,
                    message: format!("expected select condition name, found {}", other.describe()),
                })
            }
        };
        self.expect(&Tok::LParen)?;
        let mut args = Vec::new();
        loop {
            if self.peek()?.1 == Tok::RParen {
                self.bump()?;
                break;
            }
            let (pos, tok) = self.bump()?;
            match tok {
                Tok::Str(s) => args.push(s),
                other => {
                    return Err(ParseError {
                        pos,
                        message: format!(
                            "select condition arguments must be strings, found {}",
                            other.describe()
                        ),
                    })
                }
            }
            let next = self.peek()?.1.clone();
            match next {
                Tok::Comma => {
                    self.bump()?;
                }
                Tok::RParen => {}
                _ => {
                    let (pos, tok) = self.bump()?;
                    return Err(ParseError {
                        pos,
                        message: format!("expected ',' or ')', found {}", tok.describe()),
                    });
                }
            }
        }
        if args.is_empty() {
            return Err(ParseError {
                pos: fn_pos,
                message: format!("select condition {:?} needs at least one argument", function),
            });
        }

        self.expect(&Tok::Comma)?;
        self.expect(&Tok::LBrace)?;
        let mut branches: Vec<SelectBranch> = Vec::new();
        loop {
            let (pos, tok) = self.bump()?;
            let label = match tok {
                Tok::RBrace => break,
                Tok::Str(s) => Some(s),
                Tok::Ident(kw) if kw == "default" => None,
                other => {
                    return Err(ParseError {
                        pos,
                        message: format!(
                            "expected branch label, 'default' or '}}', found {}",
                            other.describe()
                        ),
                    })
                }
            };
            if branches.iter().any(|b| b.label == label) {
                return Err(ParseError {
                    pos,
                    message: match &label {
                        Some(l) => format!("select branch {:?} already defined", l),
                        None => "select default branch already defined".to_string(),
                    },
                });
            }
            self.expect(&Tok::Colon)?;
            let value = self.parse_expr()?;
            branches.push(SelectBranch { label, value });
            let next = self.peek()?.1.clone();
            match next {
                Tok::Comma => {
                    self.bump()?;
                }
                Tok::RBrace => {}
                _ => {
                    let (pos, tok) = self.bump()?;
                    return Err(ParseError {
                        pos,
                        message: format!("expected ',' or '}}', found {}", tok.describe()),
                    });
                }
            }
        }
        if branches.is_empty() {
            return Err(ParseError {
                pos: fn_pos,
                message: "select needs at least one branch".to_string(),
            });
        }
        self.expect(&Tok::RParen)?;
        Ok(SelectExpr { function, args, branches })
    }
}

/// `+` on two values. Defined for string+string, list+list and int+int.
pub(crate) fn concat(lhs: &ValueAt, rhs: &ValueAt) -> Result<ValueAt, String> {
    let value = match (&lhs.value, &rhs.value) {
        (Value::String(a), Value::String(b)) => Value::String(format!("{}{}", a, b)),
        (Value::Int(a), Value::Int(b)) => Value::Int(a + b),
        (Value::List(a), Value::List(b)) => {
            Value::List(a.iter().chain(b.iter()).cloned().collect())
        }
        (a, b) => {
            return Err(format!("cannot concatenate {} and {}", a.kind_name(), b.kind_name()))
        }
    };
    Ok(ValueAt { pos: lhs.pos.clone(), value })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(src: &str) -> (File, Scope) {
        parse("test.braid", src, &Scope::new()).expect("parse")
    }

    fn parse_err(src: &str) -> ParseError {
        parse("test.braid", src, &Scope::new()).expect_err("expected parse error")
    }

    #[test]
    fn module_with_properties() {
        let (file, _) = parse_ok(
            r#"
            filegroup {
                name: "sources",
                srcs: ["a.c", "b.c"],
                exported: true,
                weight: 3,
            }
            "#,
        );
        let m = file.modules().next().expect("one module");
        assert_eq!(m.type_name, "filegroup");
        let srcs = Property::lookup(&m.properties, "srcs").unwrap();
        assert_eq!(
            srcs.value.value.as_string_list(),
            Some(vec!["a.c".to_string(), "b.c".to_string()])
        );
        assert_eq!(
            Property::lookup(&m.properties, "exported").unwrap().value.value,
            Value::Bool(true)
        );
        assert_eq!(Property::lookup(&m.properties, "weight").unwrap().value.value, Value::Int(3));
    }

    #[test]
    fn variables_fold_into_values() {
        let (file, scope) = parse_ok(
            r#"
            srcs = ["a.c"]
            srcs += ["b.c"]
            m { name: "m", srcs: srcs + ["c.c"] }
            "#,
        );
        assert_eq!(
            scope.get("srcs").unwrap().value.value.as_string_list().unwrap(),
            vec!["a.c", "b.c"],
        );
        let m = file.modules().next().unwrap();
        assert_eq!(
            Property::lookup(&m.properties, "srcs").unwrap().value.value.as_string_list().unwrap(),
            vec!["a.c", "b.c", "c.c"],
        );
    }

    #[test]
    fn nested_maps() {
        let (file, _) = parse_ok(r#"m { name: "m", nested: { flag: true } }"#);
        let m = file.modules().next().unwrap();
        match &Property::lookup(&m.properties, "nested").unwrap().value.value {
            Value::Map(props) => {
                assert_eq!(Property::lookup(props, "flag").unwrap().value.value, Value::Bool(true));
            }
            other => panic!("expected map, got {:?}", other),
        }
    }

    #[test]
    fn duplicate_property_is_an_error() {
        let err = parse_err(r#"m { name: "a", name: "b" }"#);
        assert!(err.message.contains("already defined"), "{}", err.message);
    }

    #[test]
    fn undefined_variable_reports_position() {
        let err = parse_err("m { name: missing }");
        assert!(err.message.contains("undefined variable"));
        assert_eq!(err.pos.line, 1);
    }

    #[test]
    fn mixed_concat_is_an_error() {
        let err = parse_err(r#"x = "a" + 1"#);
        assert!(err.message.contains("cannot concatenate"));
    }

    #[test]
    fn select_expressions_stay_unevaluated() {
        let (file, _) = parse_ok(
            r#"
            m {
                name: "m",
                mode: select(variable("build_mode"), {
                    "debug": "slow",
                    "release": "fast",
                    default: "plain",
                }),
            }
            "#,
        );
        let m = file.modules().next().unwrap();
        let mode = Property::lookup(&m.properties, "mode").unwrap();
        match &mode.value.value {
            Value::Select(expr) => {
                assert_eq!(expr.function, "variable");
                assert_eq!(expr.args, vec!["build_mode"]);
                assert_eq!(expr.branches.len(), 3);
                assert_eq!(expr.branches[0].label.as_deref(), Some("debug"));
                assert_eq!(expr.branches[2].label, None);
                assert_eq!(expr.branches[1].value.value, Value::String("fast".to_string()));
            }
            other => panic!("expected select, got {:?}", other),
        }
    }

    #[test]
    fn select_duplicate_branch_is_an_error() {
        let err = parse_err(
            r#"m { name: "m", mode: select(variable("x"), { "a": 1, "a": 2 }) }"#,
        );
        assert!(err.message.contains("already defined"), "{}", err.message);
    }

    #[test]
    fn select_condition_args_must_be_strings() {
        let err = parse_err(r#"m { name: "m", mode: select(variable(3), { default: 1 }) }"#);
        assert!(err.message.contains("must be strings"), "{}", err.message);
    }

    #[test]
    fn select_cannot_concatenate() {
        let err = parse_err(
            r#"m { name: "m", mode: "a" + select(variable("x"), { default: "b" }) }"#,
        );
        assert!(err.message.contains("cannot concatenate string and select"), "{}", err.message);
    }

    #[test]
    fn plain_select_variable_still_resolves() {
        // An ordinary variable named `select` only triggers the expression
        // form when followed by '('.
        let (file, _) = parse_ok("select = \"v\"\nm { name: \"m\", mode: select }\n");
        let m = file.modules().next().unwrap();
        assert_eq!(
            Property::lookup(&m.properties, "mode").unwrap().value.value,
            Value::String("v".to_string()),
        );
    }

    #[test]
    fn child_scope_sees_parent_variables() {
        let (_, parent) = parse_ok(r#"common = ["x.c"]"#);
        let (file, _) =
            parse("child.braid", r#"m { name: "m", srcs: common }"#, &parent).unwrap();
        let m = file.modules().next().unwrap();
        assert_eq!(
            Property::lookup(&m.properties, "srcs").unwrap().value.value.as_string_list().unwrap(),
            vec!["x.c"],
        );
    }
}
