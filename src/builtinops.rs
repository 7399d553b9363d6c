//! Native functions installed in the global environment.
//!
//! The evaluator treats natives as opaque callables; this registry is the
//! small library a program starts with. Quasiquote expansion relies on
//! `cons` and `concat` being bound, the rest covers arithmetic, comparison,
//! sequence access and `throw`.
//!
//! ```text
//! (+ 1 2 3)              ; => 6
//! (= [1 2] (list 1 2))   ; => true, lists and vectors compare by elements
//! (concat [1] '(2) nil)  ; => (1 2)
//! (throw {:code 1})      ; caught by (try ... (catch e e)) as the map itself
//! ```
//!
//! ## Adding New Operations
//!
//! 1. Write a typed function; parameters use the extractors from
//!    [`crate::evaluator::intooperation`]
//! 2. Add a `BuiltinOp` to `BUILTIN_OPS` with its identifier and arity
//! 3. Add cases to the data-driven test below

use crate::Error;
use crate::ast::{MapKey, NumberType, Value};
use crate::evaluator::intooperation::{
    IntoOperation, IntoVariadicOperation, NumIter, OperationFn, ValueIter,
};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::rc::Rc;

/// Accepted argument counts of a callable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    /// Exactly n arguments
    Exact(usize),
    /// At least n arguments
    AtLeast(usize),
    /// Any number of arguments
    Any,
}

impl Arity {
    pub fn validate(&self, arg_count: usize) -> Result<(), Error> {
        match *self {
            Arity::Exact(n) if arg_count != n => Err(Error::arity_error(n, arg_count)),
            Arity::AtLeast(n) if arg_count < n => Err(Error::arity_error_at_least(n, arg_count)),
            _ => Ok(()),
        }
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arity::Exact(n) => write!(f, "{n}"),
            Arity::AtLeast(n) => write!(f, "at least {n}"),
            Arity::Any => write!(f, "any number of"),
        }
    }
}

/// Definition of a built-in operation
#[derive(Clone)]
pub struct BuiltinOp {
    /// The identifier the operation is bound to
    pub id: &'static str,
    op: Rc<OperationFn>,
    /// Expected number of arguments
    pub arity: Arity,
}

impl fmt::Debug for BuiltinOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuiltinOp")
            .field("id", &self.id)
            .field("arity", &self.arity)
            .finish_non_exhaustive()
    }
}

impl PartialEq for BuiltinOp {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl BuiltinOp {
    /// Validate the argument count, then apply the operation
    pub fn call(&self, args: Vec<Value>) -> Result<Value, Error> {
        self.arity.validate(args.len())?;
        (self.op)(args)
    }

    /// The operation as a callable value, arity checks included
    pub(crate) fn to_value(&self) -> Value {
        let op = Rc::clone(&self.op);
        let arity = self.arity;
        Value::builtin(
            self.id,
            Rc::new(move |args: Vec<Value>| {
                arity.validate(args.len())?;
                op(args)
            }),
        )
    }
}

//
// Builtin Function Implementations
//

macro_rules! numeric_comparison {
    ($name:ident, $op:tt) => {
        fn $name(first: NumberType, rest: NumIter<'_>) -> bool {
            let mut prev = first;
            for current in rest {
                if !(prev $op current) {
                    return false;
                }
                prev = current;
            }
            true
        }
    };
}

numeric_comparison!(builtin_lt, <);
numeric_comparison!(builtin_gt, >);
numeric_comparison!(builtin_le, <=);
numeric_comparison!(builtin_ge, >=);

fn builtin_add(args: NumIter<'_>) -> NumberType {
    args.sum()
}

fn builtin_sub(first: NumberType, rest: NumIter<'_>) -> NumberType {
    if rest.len() == 0 {
        return -first;
    }
    rest.fold(first, |acc, n| acc - n)
}

fn builtin_mul(args: NumIter<'_>) -> NumberType {
    args.product()
}

fn builtin_div(first: NumberType, mut rest: NumIter<'_>) -> Result<NumberType, Error> {
    let divide = |acc: NumberType, n: NumberType| {
        if n == 0.0 {
            Err(Error::EvalError("Division by zero".into()))
        } else {
            Ok(acc / n)
        }
    };
    if rest.len() == 0 {
        return divide(1.0, first);
    }
    rest.try_fold(first, divide)
}

/// Structural equality across all adjacent pairs
fn builtin_equal(first: Value, rest: ValueIter<'_>) -> bool {
    let mut prev = &first;
    for current in rest {
        if prev != current {
            return false;
        }
        prev = current;
    }
    true
}

fn builtin_not(value: Value) -> bool {
    !value.is_truthy()
}

fn builtin_list(args: ValueIter<'_>) -> Value {
    Value::list(args.cloned().collect())
}

fn builtin_vector(args: ValueIter<'_>) -> Value {
    Value::vector(args.cloned().collect())
}

fn builtin_hash_map(args: ValueIter<'_>) -> Result<Value, Error> {
    let items = args.as_slice();
    if items.len() % 2 != 0 {
        return Err(Error::EvalError(
            "hash-map requires an even number of arguments".into(),
        ));
    }
    let mut entries = BTreeMap::new();
    for pair in items.chunks_exact(2) {
        entries.insert(MapKey::try_from(&pair[0])?, pair[1].clone());
    }
    Ok(Value::map(entries))
}

fn builtin_cons(head: Value, tail: ValueIter<'_>) -> Value {
    let mut items = Vec::with_capacity(tail.len() + 1);
    items.push(head);
    items.extend(tail.cloned());
    Value::list(items)
}

fn builtin_concat(args: ValueIter<'_>) -> Result<Value, Error> {
    let mut items = Vec::new();
    for arg in args {
        match arg {
            Value::List(seq) => items.extend(seq.items().iter().cloned()),
            Value::Nil => {}
            other => {
                return Err(Error::TypeError(format!(
                    "concat requires lists or vectors, got {other}"
                )));
            }
        }
    }
    Ok(Value::list(items))
}

fn builtin_first(mut seq: ValueIter<'_>) -> Value {
    seq.next().cloned().unwrap_or(Value::Nil)
}

fn builtin_rest(mut seq: ValueIter<'_>) -> Value {
    seq.next();
    Value::list(seq.cloned().collect())
}

fn builtin_nth(seq: ValueIter<'_>, index: NumberType) -> Result<Value, Error> {
    let items = seq.as_slice();
    if index < 0.0 || index.fract() != 0.0 || index as usize >= items.len() {
        return Err(Error::EvalError(format!(
            "nth: index {index} out of range for sequence of length {}",
            items.len()
        )));
    }
    Ok(items[index as usize].clone())
}

fn builtin_count(value: Value) -> Result<NumberType, Error> {
    let count = match &value {
        Value::Nil => 0,
        Value::List(seq) => seq.len(),
        Value::Map(map) => map.len(),
        Value::String(s) => s.chars().count(),
        other => {
            return Err(Error::TypeError(format!(
                "count requires a collection, got {other}"
            )));
        }
    };
    Ok(count as NumberType)
}

fn builtin_empty(value: Value) -> Result<bool, Error> {
    builtin_count(value).map(|n| n == 0.0)
}

fn builtin_is_list(value: Value) -> bool {
    value.is_list()
}

fn builtin_is_vector(value: Value) -> bool {
    value.is_vector()
}

fn builtin_symbol(name: &str) -> Value {
    Value::symbol(name)
}

fn builtin_keyword(name: &str) -> Value {
    Value::keyword(name)
}

fn builtin_str(args: ValueIter<'_>) -> String {
    let mut result = String::new();
    for arg in args {
        match arg {
            Value::String(s) => result.push_str(s),
            Value::Nil => {}
            other => result.push_str(&other.to_string()),
        }
    }
    result
}

fn builtin_throw(value: Value) -> Result<Value, Error> {
    Err(Error::Thrown(value))
}

/// Build the registry of all built-in operations
fn builtin_ops() -> Vec<BuiltinOp> {
    fn builtin_fixed<Args, F>(f: F) -> Rc<OperationFn>
    where
        F: IntoOperation<Args>,
    {
        <F as IntoOperation<Args>>::into_operation(f)
    }

    fn builtin_variadic<Args, F>(f: F) -> Rc<OperationFn>
    where
        F: IntoVariadicOperation<Args>,
    {
        <F as IntoVariadicOperation<Args>>::into_variadic_operation(f)
    }

    fn op(id: &'static str, arity: Arity, op: Rc<OperationFn>) -> BuiltinOp {
        BuiltinOp { id, op, arity }
    }

    type Num = NumberType;
    type Nums = NumIter<'static>;
    type Values = ValueIter<'static>;

    vec![
        // Arithmetic
        op("+", Arity::Any, builtin_variadic::<(Nums,), _>(builtin_add)),
        op(
            "-",
            Arity::AtLeast(1),
            builtin_variadic::<(Num, Nums), _>(builtin_sub),
        ),
        op("*", Arity::Any, builtin_variadic::<(Nums,), _>(builtin_mul)),
        op(
            "/",
            Arity::AtLeast(1),
            builtin_variadic::<(Num, Nums), _>(builtin_div),
        ),
        // Comparison
        op(
            "=",
            Arity::AtLeast(1),
            builtin_variadic::<(Value, Values), _>(builtin_equal),
        ),
        op(
            "<",
            Arity::AtLeast(1),
            builtin_variadic::<(Num, Nums), _>(builtin_lt),
        ),
        op(
            ">",
            Arity::AtLeast(1),
            builtin_variadic::<(Num, Nums), _>(builtin_gt),
        ),
        op(
            "<=",
            Arity::AtLeast(1),
            builtin_variadic::<(Num, Nums), _>(builtin_le),
        ),
        op(
            ">=",
            Arity::AtLeast(1),
            builtin_variadic::<(Num, Nums), _>(builtin_ge),
        ),
        op("not", Arity::Exact(1), builtin_fixed::<(Value,), _>(builtin_not)),
        // Construction
        op("list", Arity::Any, builtin_variadic::<(Values,), _>(builtin_list)),
        op(
            "vector",
            Arity::Any,
            builtin_variadic::<(Values,), _>(builtin_vector),
        ),
        op(
            "hash-map",
            Arity::Any,
            builtin_variadic::<(Values,), _>(builtin_hash_map),
        ),
        op(
            "cons",
            Arity::Exact(2),
            builtin_fixed::<(Value, Values), _>(builtin_cons),
        ),
        op(
            "concat",
            Arity::Any,
            builtin_variadic::<(Values,), _>(builtin_concat),
        ),
        // Sequence access
        op("first", Arity::Exact(1), builtin_fixed::<(Values,), _>(builtin_first)),
        op("rest", Arity::Exact(1), builtin_fixed::<(Values,), _>(builtin_rest)),
        op(
            "nth",
            Arity::Exact(2),
            builtin_fixed::<(Values, Num), _>(builtin_nth),
        ),
        op("count", Arity::Exact(1), builtin_fixed::<(Value,), _>(builtin_count)),
        op("empty?", Arity::Exact(1), builtin_fixed::<(Value,), _>(builtin_empty)),
        op(
            "list?",
            Arity::Exact(1),
            builtin_fixed::<(Value,), _>(builtin_is_list),
        ),
        op(
            "vector?",
            Arity::Exact(1),
            builtin_fixed::<(Value,), _>(builtin_is_vector),
        ),
        // Names
        op(
            "symbol",
            Arity::Exact(1),
            builtin_fixed::<(&'static str,), _>(builtin_symbol),
        ),
        op(
            "keyword",
            Arity::Exact(1),
            builtin_fixed::<(&'static str,), _>(builtin_keyword),
        ),
        op("str", Arity::Any, builtin_variadic::<(Values,), _>(builtin_str)),
        // Errors
        op("throw", Arity::Exact(1), builtin_fixed::<(Value,), _>(builtin_throw)),
    ]
}

// Natives are `Rc`-based, so each thread builds its own registry on first use
thread_local! {
    static BUILTIN_OPS: Vec<BuiltinOp> = builtin_ops();
    static BUILTIN_BY_ID: HashMap<&'static str, usize> = BUILTIN_OPS.with(|ops| {
        ops.iter().enumerate().map(|(index, op)| (op.id, index)).collect()
    });
}

/// Get all builtin operations
pub fn get_builtin_ops() -> Vec<BuiltinOp> {
    BUILTIN_OPS.with(|ops| ops.clone())
}

/// Find a builtin operation by identifier
pub fn find_builtin_op(id: &str) -> Option<BuiltinOp> {
    let index = BUILTIN_BY_ID.with(|by_id| by_id.get(id).copied())?;
    BUILTIN_OPS.with(|ops| ops.get(index).cloned())
}
