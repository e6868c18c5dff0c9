//! Typed property schemas.
//!
//! Instead of runtime reflection, every module type hands the engine a list
//! of property structs that expose their fields through `fields()`. The
//! engine walks those fields to unpack parsed values, to copy properties
//! into split variants, and to feed the incremental input hash. The visitor
//! is written once per kind — string, bool, int, list-of-T, struct, and
//! configurable-of-T — here.

use crate::config::Config;
use crate::errors::Error;
use crate::hash::ContentHasher;
use braid_syntax::{Position, Property, SelectExpr, Value, ValueAt};
use std::collections::HashMap;

/// A mutable view of one property field.
pub enum FieldRef<'a> {
    String(&'a mut Option<String>),
    Bool(&'a mut Option<bool>),
    Int(&'a mut Option<i64>),
    /// A homogeneous list; the element kind lives in the `ListRef`.
    List(ListRef<'a>),
    /// A nested property struct, filled from a map value.
    Struct(&'a mut dyn PropertyStruct),
    /// A field whose value may be chosen by a `select()` expression.
    Configurable(ConfigurableRef<'a>),
}

/// The element kinds a list field can hold.
pub enum ListRef<'a> {
    String(&'a mut Vec<String>),
    Bool(&'a mut Vec<bool>),
    Int(&'a mut Vec<i64>),
    Struct(&'a mut dyn StructList),
}

/// The value kinds a configurable field can hold.
pub enum ConfigurableRef<'a> {
    String(&'a mut Configurable<String>),
    Bool(&'a mut Configurable<bool>),
    Int(&'a mut Configurable<i64>),
    StringList(&'a mut Configurable<Vec<String>>),
}

impl FieldRef<'_> {
    fn kind_name(&self) -> &'static str {
        match self {
            FieldRef::String(_) => "string",
            FieldRef::Bool(_) => "bool",
            FieldRef::Int(_) => "int",
            FieldRef::List(list) => list.kind_name(),
            FieldRef::Struct(_) => "map",
            FieldRef::Configurable(c) => c.kind_name(),
        }
    }
}

impl ListRef<'_> {
    fn kind_name(&self) -> &'static str {
        match self {
            ListRef::String(_) => "list of strings",
            ListRef::Bool(_) => "list of bools",
            ListRef::Int(_) => "list of ints",
            ListRef::Struct(_) => "list of maps",
        }
    }
}

impl ConfigurableRef<'_> {
    fn kind_name(&self) -> &'static str {
        match self {
            ConfigurableRef::String(_) => "configurable string",
            ConfigurableRef::Bool(_) => "configurable bool",
            ConfigurableRef::Int(_) => "configurable int",
            ConfigurableRef::StringList(_) => "configurable list of strings",
        }
    }
}

pub struct Field<'a> {
    pub name: &'static str,
    pub value: FieldRef<'a>,
}

impl<'a> Field<'a> {
    pub fn new(name: &'static str, value: FieldRef<'a>) -> Field<'a> {
        Field { name, value }
    }
}

/// Implemented by each property struct a module type declares.
pub trait PropertyStruct: Send {
    fn fields(&mut self) -> Vec<Field<'_>>;
}

/// A homogeneous list of nested property structs, element-type-erased so
/// the per-kind visitor can walk and grow it. Blanket-implemented for
/// `Vec<T>` of any defaultable property struct.
pub trait StructList: Send {
    /// Pushes a default element and returns it for filling.
    fn append(&mut self) -> &mut dyn PropertyStruct;
    fn elements(&mut self) -> Vec<&mut dyn PropertyStruct>;
    fn clear(&mut self);
    fn len(&self) -> usize;
}

impl<T: PropertyStruct + Default> StructList for Vec<T> {
    fn append(&mut self) -> &mut dyn PropertyStruct {
        self.push(T::default());
        self.last_mut().expect("just pushed")
    }

    fn elements(&mut self) -> Vec<&mut dyn PropertyStruct> {
        self.iter_mut().map(|e| e as &mut dyn PropertyStruct).collect()
    }

    fn clear(&mut self) {
        Vec::clear(self);
    }

    fn len(&self) -> usize {
        Vec::len(self)
    }
}

/// A property whose value a `select()` expression may choose. The choice is
/// resolved against the config while properties unpack, so by the time
/// mutators run a configurable reads like a plain optional field.
#[derive(Clone, Debug)]
pub struct Configurable<T> {
    value: Option<T>,
}

impl<T> Configurable<T> {
    pub fn get(&self) -> Option<&T> {
        self.value.as_ref()
    }

    /// Programmatic assignment, e.g. from a `configure` closure.
    pub fn set(&mut self, value: T) {
        self.value = Some(value);
    }

    pub fn is_set(&self) -> bool {
        self.value.is_some()
    }
}

impl<T> Default for Configurable<T> {
    fn default() -> Configurable<T> {
        Configurable { value: None }
    }
}

/// The one property every module must declare. Module types usually embed
/// this as their first property struct.
#[derive(Clone, Debug, Default)]
pub struct NameProperties {
    pub name: Option<String>,
}

impl PropertyStruct for NameProperties {
    fn fields(&mut self) -> Vec<Field<'_>> {
        vec![Field::new("name", FieldRef::String(&mut self.name))]
    }
}

/// Positions of the properties that were set, keyed by (dotted) property
/// name. Used for property-positioned errors later in the pipeline.
pub type PropertyPositions = HashMap<String, Position>;

/// Unpacks parsed properties into the module's property structs.
///
/// Every parsed property must match a field in exactly one struct; the first
/// struct declaring the name wins. Unmatched names and type mismatches are
/// source-positioned errors. `select()` values resolve against `config` here,
/// and only configurable fields accept them.
pub fn unpack_properties(
    structs: &mut [&mut dyn PropertyStruct],
    props: &[Property],
    module_type: &str,
    config: &dyn Config,
) -> Result<PropertyPositions, Vec<Error>> {
    let mut positions = PropertyPositions::new();
    let mut errors = Vec::new();
    for prop in props {
        match unpack_one(structs, prop, "", &mut positions, config) {
            Ok(true) => {}
            Ok(false) => errors.push(Error::source(
                prop.pos.clone(),
                format!("unrecognized property {:?} in module type {:?}", prop.name, module_type),
            )),
            Err(e) => errors.push(e),
        }
    }
    if errors.is_empty() {
        Ok(positions)
    } else {
        Err(errors)
    }
}

fn unpack_one(
    structs: &mut [&mut dyn PropertyStruct],
    prop: &Property,
    prefix: &str,
    positions: &mut PropertyPositions,
    config: &dyn Config,
) -> Result<bool, Error> {
    for ps in structs.iter_mut() {
        for field in ps.fields() {
            if field.name != prop.name {
                continue;
            }
            let dotted = if prefix.is_empty() {
                prop.name.clone()
            } else {
                format!("{}.{}", prefix, prop.name)
            };
            set_field(field.value, prop, &dotted, positions, config)?;
            positions.insert(dotted, prop.pos.clone());
            return Ok(true);
        }
    }
    Ok(false)
}

fn mismatch(pos: &Position, dotted: &str, want: &str, found: &str) -> Error {
    Error::source(
        pos.clone(),
        format!("property {:?} must be a {}, found {}", dotted, want, found),
    )
}

fn set_field(
    field: FieldRef<'_>,
    prop: &Property,
    dotted: &str,
    positions: &mut PropertyPositions,
    config: &dyn Config,
) -> Result<(), Error> {
    if matches!(prop.value.value, Value::Select(_))
        && !matches!(field, FieldRef::Configurable(_))
    {
        return Err(Error::source(
            prop.pos.clone(),
            format!(
                "property {:?} does not accept select(); only configurable properties do",
                dotted,
            ),
        ));
    }
    let want = field.kind_name();
    let found = prop.value.value.kind_name();
    match field {
        FieldRef::String(slot) => match &prop.value.value {
            Value::String(s) => *slot = Some(s.clone()),
            _ => return Err(mismatch(&prop.pos, dotted, want, found)),
        },
        FieldRef::Bool(slot) => match &prop.value.value {
            Value::Bool(b) => *slot = Some(*b),
            _ => return Err(mismatch(&prop.pos, dotted, want, found)),
        },
        FieldRef::Int(slot) => match &prop.value.value {
            Value::Int(n) => *slot = Some(*n),
            _ => return Err(mismatch(&prop.pos, dotted, want, found)),
        },
        FieldRef::List(list) => set_list(list, prop, dotted, positions, config)?,
        FieldRef::Struct(nested) => match &prop.value.value {
            Value::Map(entries) => {
                fill_struct(nested, entries, dotted, positions, config)?;
            }
            _ => return Err(mismatch(&prop.pos, dotted, want, found)),
        },
        FieldRef::Configurable(slot) => set_configurable(slot, prop, dotted, config)?,
    }
    Ok(())
}

fn fill_struct(
    nested: &mut dyn PropertyStruct,
    entries: &[Property],
    dotted: &str,
    positions: &mut PropertyPositions,
    config: &dyn Config,
) -> Result<(), Error> {
    for entry in entries {
        let mut one: [&mut dyn PropertyStruct; 1] = [&mut *nested];
        if !unpack_one(&mut one, entry, dotted, positions, config)? {
            return Err(Error::source(
                entry.pos.clone(),
                format!("unrecognized property {:?} in {:?}", entry.name, dotted),
            ));
        }
    }
    Ok(())
}

fn set_list(
    list: ListRef<'_>,
    prop: &Property,
    dotted: &str,
    positions: &mut PropertyPositions,
    config: &dyn Config,
) -> Result<(), Error> {
    let want = list.kind_name();
    let elems = match &prop.value.value {
        Value::List(elems) => elems,
        other => return Err(mismatch(&prop.pos, dotted, want, other.kind_name())),
    };
    match list {
        ListRef::String(slot) => {
            let mut out = Vec::with_capacity(elems.len());
            for e in elems {
                match &e.value {
                    Value::String(s) => out.push(s.clone()),
                    other => return Err(mismatch(&e.pos, dotted, "string", other.kind_name())),
                }
            }
            *slot = out;
        }
        ListRef::Bool(slot) => {
            let mut out = Vec::with_capacity(elems.len());
            for e in elems {
                match &e.value {
                    Value::Bool(b) => out.push(*b),
                    other => return Err(mismatch(&e.pos, dotted, "bool", other.kind_name())),
                }
            }
            *slot = out;
        }
        ListRef::Int(slot) => {
            let mut out = Vec::with_capacity(elems.len());
            for e in elems {
                match &e.value {
                    Value::Int(n) => out.push(*n),
                    other => return Err(mismatch(&e.pos, dotted, "int", other.kind_name())),
                }
            }
            *slot = out;
        }
        ListRef::Struct(slot) => {
            slot.clear();
            for (i, e) in elems.iter().enumerate() {
                match &e.value {
                    Value::Map(entries) => {
                        let indexed = format!("{}[{}]", dotted, i);
                        let nested = slot.append();
                        fill_struct(nested, entries, &indexed, positions, config)?;
                    }
                    other => return Err(mismatch(&e.pos, dotted, "map", other.kind_name())),
                }
            }
        }
    }
    Ok(())
}

fn set_configurable(
    slot: ConfigurableRef<'_>,
    prop: &Property,
    dotted: &str,
    config: &dyn Config,
) -> Result<(), Error> {
    let want = slot.kind_name();
    let resolved: &ValueAt = match &prop.value.value {
        Value::Select(expr) => resolve_select(expr, &prop.pos, dotted, config)?,
        _ => &prop.value,
    };
    if matches!(resolved.value, Value::Select(_)) {
        return Err(Error::source(
            resolved.pos.clone(),
            format!("property {:?}: select branches cannot nest another select", dotted),
        ));
    }
    match slot {
        ConfigurableRef::String(c) => match &resolved.value {
            Value::String(s) => c.set(s.clone()),
            other => return Err(mismatch(&resolved.pos, dotted, want, other.kind_name())),
        },
        ConfigurableRef::Bool(c) => match &resolved.value {
            Value::Bool(b) => c.set(*b),
            other => return Err(mismatch(&resolved.pos, dotted, want, other.kind_name())),
        },
        ConfigurableRef::Int(c) => match &resolved.value {
            Value::Int(n) => c.set(*n),
            other => return Err(mismatch(&resolved.pos, dotted, want, other.kind_name())),
        },
        ConfigurableRef::StringList(c) => match resolved.value.as_string_list() {
            Some(items) => c.set(items),
            None => return Err(mismatch(&resolved.pos, dotted, want, resolved.value.kind_name())),
        },
    }
    Ok(())
}

/// Picks the branch a `select()` takes: the config's label if a branch
/// carries it, the default branch otherwise.
fn resolve_select<'a>(
    expr: &'a SelectExpr,
    pos: &Position,
    dotted: &str,
    config: &dyn Config,
) -> Result<&'a ValueAt, Error> {
    let label = config.select_value(&expr.function, &expr.args);
    let chosen = label
        .as_deref()
        .and_then(|l| expr.branches.iter().find(|b| b.label.as_deref() == Some(l)))
        .or_else(|| expr.branches.iter().find(|b| b.label.is_none()));
    match chosen {
        Some(branch) => Ok(&branch.value),
        None => Err(Error::source(
            pos.clone(),
            match label {
                Some(label) => format!(
                    "property {:?}: select has no branch for {:?} and no default",
                    dotted, label,
                ),
                None => format!(
                    "property {:?}: select condition {}() is undefined and there is no default branch",
                    dotted, expr.function,
                ),
            },
        )),
    }
}

/// Copies every field of `src` into `dst`. Both sides must come from the
/// same factory, so the field lists are parallel by construction.
pub fn copy_properties(src: &mut dyn PropertyStruct, dst: &mut dyn PropertyStruct) {
    let mut src_fields = src.fields();
    let mut dst_fields = dst.fields();
    assert_eq!(src_fields.len(), dst_fields.len(), "property structs differ in shape");
    for (s, d) in src_fields.iter_mut().zip(dst_fields.iter_mut()) {
        assert_eq!(s.name, d.name, "property structs differ in shape");
        match (&mut s.value, &mut d.value) {
            (FieldRef::String(s), FieldRef::String(d)) => **d = (**s).clone(),
            (FieldRef::Bool(s), FieldRef::Bool(d)) => **d = **s,
            (FieldRef::Int(s), FieldRef::Int(d)) => **d = **s,
            (FieldRef::List(s), FieldRef::List(d)) => copy_list(s, d),
            (FieldRef::Struct(s), FieldRef::Struct(d)) => copy_properties(&mut **s, &mut **d),
            (FieldRef::Configurable(s), FieldRef::Configurable(d)) => copy_configurable(s, d),
            _ => panic!("property structs differ in field kinds"),
        }
    }
}

fn copy_list(s: &mut ListRef<'_>, d: &mut ListRef<'_>) {
    match (s, d) {
        (ListRef::String(s), ListRef::String(d)) => **d = (**s).clone(),
        (ListRef::Bool(s), ListRef::Bool(d)) => **d = (**s).clone(),
        (ListRef::Int(s), ListRef::Int(d)) => **d = (**s).clone(),
        (ListRef::Struct(s), ListRef::Struct(d)) => {
            d.clear();
            for src in s.elements() {
                let dst = d.append();
                copy_properties(src, dst);
            }
        }
        _ => panic!("property structs differ in list element kinds"),
    }
}

fn copy_configurable(s: &mut ConfigurableRef<'_>, d: &mut ConfigurableRef<'_>) {
    match (s, d) {
        (ConfigurableRef::String(s), ConfigurableRef::String(d)) => d.value = s.value.clone(),
        (ConfigurableRef::Bool(s), ConfigurableRef::Bool(d)) => d.value = s.value,
        (ConfigurableRef::Int(s), ConfigurableRef::Int(d)) => d.value = s.value,
        (ConfigurableRef::StringList(s), ConfigurableRef::StringList(d)) => {
            d.value = s.value.clone()
        }
        _ => panic!("property structs differ in configurable kinds"),
    }
}

/// Feeds every field into the hasher: name, kind tag, presence tag, value.
pub fn hash_properties(ps: &mut dyn PropertyStruct, h: &mut ContentHasher) {
    for field in ps.fields() {
        h.write_str(field.name);
        h.write_str(field.value.kind_name());
        match field.value {
            FieldRef::String(slot) => match slot {
                Some(s) => {
                    h.write_bool(true);
                    h.write_str(s);
                }
                None => h.write_bool(false),
            },
            FieldRef::Bool(slot) => match slot {
                Some(b) => {
                    h.write_bool(true);
                    h.write_bool(*b);
                }
                None => h.write_bool(false),
            },
            FieldRef::Int(slot) => match slot {
                Some(n) => {
                    h.write_bool(true);
                    h.write_i64(*n);
                }
                None => h.write_bool(false),
            },
            FieldRef::List(list) => hash_list(list, h),
            FieldRef::Struct(nested) => hash_properties(nested, h),
            FieldRef::Configurable(c) => hash_configurable(c, h),
        }
    }
}

fn hash_list(list: ListRef<'_>, h: &mut ContentHasher) {
    match list {
        ListRef::String(slot) => h.write_str_slice(slot),
        ListRef::Bool(slot) => {
            h.write_u64(slot.len() as u64);
            for b in slot.iter() {
                h.write_bool(*b);
            }
        }
        ListRef::Int(slot) => {
            h.write_u64(slot.len() as u64);
            for n in slot.iter() {
                h.write_i64(*n);
            }
        }
        ListRef::Struct(slot) => {
            h.write_u64(slot.len() as u64);
            for e in slot.elements() {
                hash_properties(e, h);
            }
        }
    }
}

fn hash_configurable(c: ConfigurableRef<'_>, h: &mut ContentHasher) {
    match c {
        ConfigurableRef::String(c) => match c.get() {
            Some(s) => {
                h.write_bool(true);
                h.write_str(s);
            }
            None => h.write_bool(false),
        },
        ConfigurableRef::Bool(c) => match c.get() {
            Some(b) => {
                h.write_bool(true);
                h.write_bool(*b);
            }
            None => h.write_bool(false),
        },
        ConfigurableRef::Int(c) => match c.get() {
            Some(n) => {
                h.write_bool(true);
                h.write_i64(*n);
            }
            None => h.write_bool(false),
        },
        ConfigurableRef::StringList(c) => match c.get() {
            Some(items) => {
                h.write_bool(true);
                h.write_str_slice(items);
            }
            None => h.write_bool(false),
        },
    }
}

/// Reads a top-level string field by name, e.g. the module name.
pub fn lookup_string(structs: &mut [&mut dyn PropertyStruct], name: &str) -> Option<String> {
    for ps in structs.iter_mut() {
        for field in ps.fields() {
            if field.name == name {
                if let FieldRef::String(slot) = field.value {
                    return slot.clone();
                }
            }
        }
    }
    None
}
