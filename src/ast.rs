//! This module defines the value model shared by programs and their results.
//! The main enum, [`Value`], covers every datum the language manipulates:
//! nil, booleans, numbers, strings, keywords, symbols, lists and vectors,
//! maps, native functions and user-defined functions. Because the language is
//! homoiconic the same type doubles as the expression tree handed to the
//! evaluator.
//!
//! Lists, vectors and maps are reference-counted nodes. Cloning a [`Value`]
//! clones the handle, so metadata stamped on a node by the evaluator is seen by
//! every holder of that node. Ergonomic helpers such as [`sym`], [`kw`],
//! [`val`], [`list`] and [`vector`] build trees in code and tests. The
//! `Display` implementation is the printer.

use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use crate::Error;
use crate::evaluator::Environment;
use crate::evaluator::intooperation::OperationFn;
use crate::metadata::EvalMetadata;

/// Type alias for number values in interpreter
pub(crate) type NumberType = f64;

/// Symbol that introduces the rest parameter in a parameter list
pub(crate) const REST_MARKER: &str = "&";

/// An identifier. Symbols compare by name and are distinct from strings.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol(Rc<str>);

impl Symbol {
    pub fn new(name: impl AsRef<str>) -> Self {
        Symbol(Rc::from(name.as_ref()))
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Symbol({})", self.0)
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Map keys are strings or keywords
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MapKey {
    String(String),
    Keyword(String),
}

impl MapKey {
    pub fn to_value(&self) -> Value {
        match self {
            MapKey::String(s) => Value::String(s.clone()),
            MapKey::Keyword(k) => Value::Keyword(k.clone()),
        }
    }
}

impl TryFrom<&Value> for MapKey {
    type Error = Error;

    fn try_from(value: &Value) -> Result<Self, Error> {
        match value {
            Value::String(s) => Ok(MapKey::String(s.clone())),
            Value::Keyword(k) => Ok(MapKey::Keyword(k.clone())),
            other => Err(Error::TypeError(format!(
                "map keys must be strings or keywords, got {other}"
            ))),
        }
    }
}

/// A list or vector node
pub struct Seq {
    items: Vec<Value>,
    is_vector: bool,
    meta: EvalMetadata,
}

impl Seq {
    pub fn items(&self) -> &[Value] {
        &self.items
    }

    pub fn is_vector(&self) -> bool {
        self.is_vector
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn metadata(&self) -> &EvalMetadata {
        &self.meta
    }
}

/// A map node
pub struct Map {
    entries: BTreeMap<MapKey, Value>,
    meta: EvalMetadata,
}

impl Map {
    pub fn entries(&self) -> &BTreeMap<MapKey, Value> {
        &self.entries
    }

    pub fn get(&self, key: &MapKey) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn metadata(&self) -> &EvalMetadata {
        &self.meta
    }
}

/// A user-defined function or macro: parameter spec, body and the
/// environment it closes over
pub struct Lambda {
    params: Value,
    body: Value,
    env: Environment,
    is_macro: bool,
}

impl Lambda {
    pub(crate) fn new(params: Value, body: Value, env: Environment, is_macro: bool) -> Self {
        Lambda {
            params,
            body,
            env,
            is_macro,
        }
    }

    pub fn params(&self) -> &Value {
        &self.params
    }

    pub fn body(&self) -> &Value {
        &self.body
    }

    /// The environment captured when the function was created
    pub fn env(&self) -> &Environment {
        &self.env
    }

    pub fn is_macro(&self) -> bool {
        self.is_macro
    }
}

/// Core value type
///
/// To build a tree, use the helper functions:
/// - `val(42)` for literals, `sym("name")` for symbols, `kw("name")` for keywords
/// - `list(vec![sym("+"), val(1), val(2)])` for call forms
/// - `vector(vec![sym("x")])` for parameter and binding vectors
#[derive(Clone)]
pub enum Value {
    Nil,
    Bool(bool),
    Number(NumberType),
    String(String),
    Keyword(String),
    Symbol(Symbol),
    /// Lists and vectors share one node type
    List(Rc<Seq>),
    Map(Rc<Map>),
    /// Native functions, compared by id
    BuiltinFunction {
        id: Rc<str>,
        func: Rc<OperationFn>,
    },
    /// User-defined functions and macros, compared by identity
    Function(Rc<Lambda>),
}

impl Value {
    pub fn list(items: Vec<Value>) -> Value {
        Value::List(Rc::new(Seq {
            items,
            is_vector: false,
            meta: EvalMetadata::default(),
        }))
    }

    pub fn vector(items: Vec<Value>) -> Value {
        Value::List(Rc::new(Seq {
            items,
            is_vector: true,
            meta: EvalMetadata::default(),
        }))
    }

    pub fn map(entries: BTreeMap<MapKey, Value>) -> Value {
        Value::Map(Rc::new(Map {
            entries,
            meta: EvalMetadata::default(),
        }))
    }

    pub fn symbol(name: impl AsRef<str>) -> Value {
        Value::Symbol(Symbol::new(name))
    }

    pub fn keyword(name: impl Into<String>) -> Value {
        Value::Keyword(name.into())
    }

    pub(crate) fn builtin(id: &str, func: Rc<OperationFn>) -> Value {
        Value::BuiltinFunction {
            id: Rc::from(id),
            func,
        }
    }

    /// Everything except `nil` and `false` is truthy
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Bool(false))
    }

    /// A list that is not a vector
    pub fn is_list(&self) -> bool {
        matches!(self, Value::List(seq) if !seq.is_vector())
    }

    pub fn is_vector(&self) -> bool {
        matches!(self, Value::List(seq) if seq.is_vector())
    }

    /// Elements of a list or vector
    pub fn as_seq(&self) -> Option<&[Value]> {
        match self {
            Value::List(seq) => Some(seq.items()),
            _ => None,
        }
    }

    pub fn as_symbol(&self) -> Option<&Symbol> {
        match self {
            Value::Symbol(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_symbol_named(&self, name: &str) -> bool {
        matches!(self, Value::Symbol(s) if s.name() == name)
    }

    /// Evaluation metadata of list, vector and map nodes; atoms carry none
    pub fn metadata(&self) -> Option<&EvalMetadata> {
        match self {
            Value::List(seq) => Some(seq.metadata()),
            Value::Map(map) => Some(map.metadata()),
            _ => None,
        }
    }

    /// Whether both values are the very same node (or equal atoms)
    pub(crate) fn same_node(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::List(a), Value::List(b)) => Rc::ptr_eq(a, b),
            (Value::Map(a), Value::Map(b)) => Rc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Runtime kind, used in error messages
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Nil => "Nil",
            Value::Bool(_) => "Boolean",
            Value::Number(_) => "Number",
            Value::String(_) => "String",
            Value::Keyword(_) => "Keyword",
            Value::Symbol(_) => "Symbol",
            Value::List(seq) if seq.is_vector() => "Vector",
            Value::List(_) => "List",
            Value::Map(_) => "Map",
            Value::BuiltinFunction { .. } => "Function",
            Value::Function(lambda) if lambda.is_macro() => "Macro",
            Value::Function(_) => "Function",
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "Nil"),
            Value::Bool(b) => write!(f, "Bool({b})"),
            Value::Number(n) => write!(f, "Number({n})"),
            Value::String(s) => write!(f, "String({s:?})"),
            Value::Keyword(k) => write!(f, "Keyword({k})"),
            Value::Symbol(s) => write!(f, "{s:?}"),
            Value::List(seq) => {
                write!(f, "{}(", if seq.is_vector() { "Vector" } else { "List" })?;
                for (i, v) in seq.items().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v:?}")?;
                }
                write!(f, ")")
            }
            Value::Map(map) => f.debug_map().entries(map.entries().iter()).finish(),
            Value::BuiltinFunction { id, .. } => write!(f, "BuiltinFunction({id})"),
            // The captured environment is left out: it usually reaches this function again
            Value::Function(lambda) => write!(
                f,
                "Function(params={:?}, body={:?}, macro={})",
                lambda.params(),
                lambda.body(),
                lambda.is_macro()
            ),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Keyword(a), Value::Keyword(b)) => a == b,
            (Value::Symbol(a), Value::Symbol(b)) => a == b,
            // Lists and vectors with equal elements are equal
            (Value::List(a), Value::List(b)) => Rc::ptr_eq(a, b) || a.items() == b.items(),
            (Value::Map(a), Value::Map(b)) => Rc::ptr_eq(a, b) || a.entries() == b.entries(),
            (Value::BuiltinFunction { id: id1, .. }, Value::BuiltinFunction { id: id2, .. }) => {
                id1 == id2
            }
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

fn write_items(f: &mut fmt::Formatter<'_>, items: &[Value]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            write!(f, " ")?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Number(n) => write!(f, "{n}"),
            Value::String(s) => {
                write!(f, "\"")?;
                for ch in s.chars() {
                    match ch {
                        '"' => write!(f, "\\\"")?,
                        '\\' => write!(f, "\\\\")?,
                        '\n' => write!(f, "\\n")?,
                        '\t' => write!(f, "\\t")?,
                        '\r' => write!(f, "\\r")?,
                        c => write!(f, "{c}")?,
                    }
                }
                write!(f, "\"")
            }
            Value::Keyword(k) => write!(f, ":{k}"),
            Value::Symbol(s) => write!(f, "{s}"),
            Value::List(seq) if seq.is_vector() => {
                write!(f, "[")?;
                write_items(f, seq.items())?;
                write!(f, "]")
            }
            Value::List(seq) => {
                write!(f, "(")?;
                write_items(f, seq.items())?;
                write!(f, ")")
            }
            Value::Map(map) => {
                write!(f, "{{")?;
                for (i, (key, value)) in map.entries().iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{} {value}", key.to_value())?;
                }
                write!(f, "}}")
            }
            Value::BuiltinFunction { id, .. } => write!(f, "#<builtin-function:{id}>"),
            Value::Function(lambda) if lambda.is_macro() => write!(f, "#<macro>"),
            Value::Function(_) => write!(f, "#<function>"),
        }
    }
}

// From trait implementations for Value - enables .into() conversion
impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<NumberType> for Value {
    fn from(n: NumberType) -> Self {
        Value::Number(n)
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Nil
    }
}

impl From<Symbol> for Value {
    fn from(s: Symbol) -> Self {
        Value::Symbol(s)
    }
}

macro_rules! impl_from_integer {
    ($int_type:ty) => {
        impl From<$int_type> for Value {
            fn from(n: $int_type) -> Self {
                Value::Number(n as NumberType)
            }
        }
    };
}

impl_from_integer!(i8);
impl_from_integer!(i16);
impl_from_integer!(i32);
impl_from_integer!(i64);
impl_from_integer!(u8);
impl_from_integer!(u16);
impl_from_integer!(u32);
impl_from_integer!(usize);

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::list(v.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>, const N: usize> From<[T; N]> for Value {
    fn from(arr: [T; N]) -> Self {
        Value::list(arr.into_iter().map(Into::into).collect())
    }
}

// Fallible conversions from `Value` back into primitive Rust types.

impl TryFrom<Value> for NumberType {
    type Error = Error;

    fn try_from(value: Value) -> Result<NumberType, Error> {
        if let Value::Number(n) = value {
            Ok(n)
        } else {
            Err(Error::TypeError(format!("expected number, got {value}")))
        }
    }
}

impl TryFrom<Value> for bool {
    type Error = Error;

    fn try_from(value: Value) -> Result<bool, Error> {
        if let Value::Bool(b) = value {
            Ok(b)
        } else {
            Err(Error::TypeError(format!("expected boolean, got {value}")))
        }
    }
}

/// Helper for creating symbols
pub fn sym<S: AsRef<str>>(name: S) -> Value {
    Value::symbol(name)
}

/// Helper for creating keywords
pub fn kw<S: Into<String>>(name: S) -> Value {
    Value::keyword(name)
}

/// Helper for creating Values from anything convertible
pub fn val<T: Into<Value>>(value: T) -> Value {
    value.into()
}

/// Helper for creating lists from mixed values
pub fn list(items: Vec<Value>) -> Value {
    Value::list(items)
}

/// Helper for creating vectors from mixed values
pub fn vector(items: Vec<Value>) -> Value {
    Value::vector(items)
}

pub fn nil() -> Value {
    Value::Nil
}
