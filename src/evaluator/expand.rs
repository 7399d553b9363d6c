//! Quasiquote and macro expansion.

use super::{EvalContext, eval_with_depth_tracking};
use crate::Error;
use crate::ast::{Symbol, Value, sym};
use crate::evaluator::Environment;

/// Rewrite a quasiquote template into `cons`/`concat`/`quote` calls.
///
/// Lists and non-empty vectors are templated element by element and rebuilt
/// as lists; everything else (including maps) is quoted whole. The input is
/// never mutated.
///
/// A template ending in `unquote x` takes `x` as its tail, so `(a unquote b)`
/// conses `a` onto the value of `b`.
pub fn quasiquote(template: &Value) -> Value {
    match template {
        Value::List(seq) if !seq.is_empty() => match seq.items() {
            [head, x] if head.is_symbol_named("unquote") => x.clone(),
            items => quasiquote_items(items),
        },
        other => quote(other.clone()),
    }
}

fn quasiquote_items(items: &[Value]) -> Value {
    let Some((head, rest)) = items.split_first() else {
        return quote(Value::list(Vec::new()));
    };
    if head.is_symbol_named("unquote")
        && let [tail] = rest
    {
        return tail.clone();
    }
    if let Value::List(seq) = head
        && let [marker, x] = seq.items()
        && marker.is_symbol_named("splice-unquote")
    {
        return Value::list(vec![sym("concat"), x.clone(), quasiquote_items(rest)]);
    }
    Value::list(vec![sym("cons"), quasiquote(head), quasiquote_items(rest)])
}

fn quote(value: Value) -> Value {
    Value::list(vec![sym("quote"), value])
}

/// Expand `exp` while it is a macro call, without evaluating the result.
///
/// With `annotate` on, every call node whose head symbol is bound is stamped
/// with that binding as its applied function, macro or not.
pub fn macroexpand(exp: &Value, env: &Environment, annotate: bool) -> Result<Value, Error> {
    expand_macros(exp, env, EvalContext::new(annotate))
}

/// Head symbol of a non-empty list (vectors are never calls)
fn call_head(exp: &Value) -> Option<Symbol> {
    match exp {
        Value::List(seq) if !seq.is_vector() => seq.items().first()?.as_symbol().cloned(),
        _ => None,
    }
}

pub(crate) fn expand_macros(
    exp: &Value,
    env: &Environment,
    ctx: EvalContext,
) -> Result<Value, Error> {
    let mut current = exp.clone();
    while let Some(head) = call_head(&current) {
        let Some(binding) = env.lookup(head.name()) else {
            break;
        };
        if ctx.annotate
            && let Some(meta) = current.metadata()
        {
            meta.stamp_applied(binding.clone());
        }
        let Value::Function(lambda) = &binding else {
            break;
        };
        if !lambda.is_macro() {
            break;
        }

        let args = current.as_seq().map(|items| items[1..].to_vec()).unwrap_or_default();
        let macro_env = Environment::with_bindings(lambda.env(), lambda.params(), args)?;
        log::trace!("expanding macro {head} in {current}");
        current = eval_with_depth_tracking(lambda.body(), &macro_env, ctx.nested())?;
    }
    Ok(current)
}
