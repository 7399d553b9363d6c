//! The evaluator: special forms, application and tail-call elimination.
//!
//! Evaluation runs a loop over an `(expression, environment)` pair. Forms in
//! tail position replace the pair and loop instead of recursing, so a
//! tail-recursive program runs in constant native stack. Everything else
//! recurses through [`eval_with_depth_tracking`] and counts against
//! [`MAX_EVAL_DEPTH`].

use crate::Error;
use crate::MAX_EVAL_DEPTH;
use crate::ast::{Lambda, Seq, Symbol, Value, sym};
use crate::builtinops::get_builtin_ops;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

mod environment;
mod expand;
pub mod intooperation;

pub use crate::builtinops::Arity;
pub use environment::Environment;
pub use expand::{macroexpand, quasiquote};
pub use intooperation::{NumIter, StringIter, ValueIter};

use expand::expand_macros;

/// Per-call evaluation settings threaded through every recursive call
#[derive(Debug, Clone, Copy)]
pub(crate) struct EvalContext {
    pub(crate) annotate: bool,
    depth: usize,
    max_depth: usize,
}

impl EvalContext {
    pub(crate) fn new(annotate: bool) -> Self {
        Self::with_limit(annotate, MAX_EVAL_DEPTH)
    }

    pub(crate) fn with_limit(annotate: bool, max_depth: usize) -> Self {
        EvalContext {
            annotate,
            depth: 0,
            max_depth,
        }
    }

    /// Context for a non-tail sub-evaluation
    pub(crate) fn nested(self) -> Self {
        EvalContext {
            depth: self.depth + 1,
            ..self
        }
    }
}

/// Outcome of one dispatch step
enum Step {
    Done(Value),
    Tail(Value, Environment),
}

/// Entry count below which [`Visited`] never prunes
const VISITED_PRUNE_MIN: usize = 64;

/// List nodes passed through in tail position, stamped once the loop
/// produces a value.
///
/// Nodes are held weakly and keyed by address. A node that only the loop
/// referenced (a fresh macro expansion, say) can never be inspected, so it
/// is dropped from the ledger instead of kept alive until the loop ends.
/// A `Weak` keeps its allocation reserved, so an address is never reused
/// while its entry is present.
struct Visited {
    annotate: bool,
    nodes: HashMap<*const Seq, Weak<Seq>>,
    prune_at: usize,
}

impl Visited {
    fn new(annotate: bool) -> Self {
        Visited {
            annotate,
            nodes: HashMap::new(),
            prune_at: VISITED_PRUNE_MIN,
        }
    }

    fn record(&mut self, node: &Value) {
        if !self.annotate {
            return;
        }
        let Value::List(seq) = node else {
            return;
        };
        self.nodes
            .entry(Rc::as_ptr(seq))
            .or_insert_with(|| Rc::downgrade(seq));

        if self.nodes.len() > self.prune_at {
            self.nodes.retain(|_, seq| seq.strong_count() > 0);
            self.prune_at = (self.nodes.len() * 2).max(VISITED_PRUNE_MIN);
        }
    }

    fn stamp(&self, value: &Value) {
        for seq in self.nodes.values().filter_map(Weak::upgrade) {
            seq.metadata().stamp_evaluated(value.clone());
        }
    }
}

/// Evaluate an expression (public API)
pub fn eval(expr: &Value, env: &Environment) -> Result<Value, Error> {
    evaluate(expr, env, false)
}

/// Evaluate an expression, stamping every node visited with its results
pub fn eval_annotated(expr: &Value, env: &Environment) -> Result<Value, Error> {
    evaluate(expr, env, true)
}

/// Evaluate an expression, with evaluation metadata recorded when `annotate` is set
pub fn evaluate(expr: &Value, env: &Environment, annotate: bool) -> Result<Value, Error> {
    eval_with_depth_tracking(expr, env, EvalContext::new(annotate))
}

/// Like [`evaluate`], with `max_depth` in place of [`MAX_EVAL_DEPTH`].
///
/// Every non-tail level uses native stack, so the thread running the
/// evaluation must be sized for the limit chosen.
pub fn evaluate_with_limit(
    expr: &Value,
    env: &Environment,
    annotate: bool,
    max_depth: usize,
) -> Result<Value, Error> {
    eval_with_depth_tracking(expr, env, EvalContext::with_limit(annotate, max_depth))
}

/// Evaluate an expression with depth tracking to prevent stack overflow
pub(crate) fn eval_with_depth_tracking(
    expr: &Value,
    env: &Environment,
    ctx: EvalContext,
) -> Result<Value, Error> {
    if ctx.depth >= ctx.max_depth {
        return Err(Error::DepthExceeded(ctx.max_depth));
    }

    let mut visited = Visited::new(ctx.annotate);
    let mut expr = expr.clone();
    let mut env = env.clone();
    let value = loop {
        match eval_step(&expr, &env, ctx, &mut visited)? {
            Step::Done(value) => break value,
            Step::Tail(next_expr, next_env) => {
                log::trace!("tail: {next_expr}");
                expr = next_expr;
                env = next_env;
            }
        }
    };
    visited.stamp(&value);
    Ok(value)
}

fn eval_step(
    expr: &Value,
    env: &Environment,
    ctx: EvalContext,
    visited: &mut Visited,
) -> Result<Step, Error> {
    if !expr.is_list() {
        return eval_atom(expr, env, ctx).map(Step::Done);
    }
    visited.record(expr);

    let expanded = expand_macros(expr, env, ctx)?;
    if !expanded.same_node(expr) {
        log::trace!("macro expansion: {expr} => {expanded}");
        if ctx.annotate
            && let Some(meta) = expr.metadata()
        {
            meta.stamp_expansion(expanded.clone());
        }
    }
    if !expanded.is_list() {
        return eval_atom(&expanded, env, ctx).map(Step::Done);
    }
    visited.record(&expanded);

    let items = expanded.as_seq().unwrap_or_default();
    let Some((head, args)) = items.split_first() else {
        return Ok(Step::Done(expanded.clone()));
    };

    if let Value::Symbol(name) = head {
        match name.name() {
            "def" => return eval_def(args, env, ctx),
            "let" => return eval_let(args, env, ctx),
            "quote" => return eval_quote(args),
            "quasiquote" => return eval_quasiquote(args, env),
            "macro" => return eval_macro(args, env),
            "macroexpand" => return eval_macroexpand(args, env, ctx),
            "try" => return eval_try(args, env, ctx),
            "do" => return eval_do(args, env, ctx),
            "if" => return eval_if(args, env, ctx),
            "fn" => return eval_fn(args, env),
            "eval-when-execute" => return eval_when_execute(args, env, ctx),
            _ => {}
        }
    }

    apply(&expanded, items, env, ctx)
}

/// Evaluate a non-list: symbols are looked up, vectors and maps are evaluated
/// element-wise, everything else evaluates to itself
fn eval_atom(expr: &Value, env: &Environment, ctx: EvalContext) -> Result<Value, Error> {
    let value = match expr {
        Value::Symbol(name) => return env.get(name.name()),
        Value::List(seq) => Value::vector(eval_sequence(seq.items(), env, ctx)?),
        Value::Map(map) => {
            let entries = map
                .entries()
                .iter()
                .map(|(key, value)| {
                    eval_with_depth_tracking(value, env, ctx.nested())
                        .map(|value| (key.clone(), value))
                })
                .collect::<Result<_, Error>>()?;
            Value::map(entries)
        }
        _ => return Ok(expr.clone()),
    };
    if ctx.annotate
        && let Some(meta) = expr.metadata()
    {
        meta.stamp_evaluated(value.clone());
    }
    Ok(value)
}

/// Helper function to evaluate a sequence of expressions with depth tracking
fn eval_sequence(
    items: &[Value],
    env: &Environment,
    ctx: EvalContext,
) -> Result<Vec<Value>, Error> {
    let mut values = Vec::with_capacity(items.len());
    for item in items {
        values.push(eval_with_depth_tracking(item, env, ctx.nested())?);
    }
    Ok(values)
}

/// Apply the evaluated head of a call to its evaluated arguments
fn apply(node: &Value, items: &[Value], env: &Environment, ctx: EvalContext) -> Result<Step, Error> {
    let mut evaluated = eval_sequence(items, env, ctx)?.into_iter();
    let Some(callee) = evaluated.next() else {
        return Ok(Step::Done(node.clone()));
    };
    let args: Vec<Value> = evaluated.collect();

    if ctx.annotate
        && let Some(meta) = node.metadata()
    {
        meta.stamp_applied(callee.clone());
    }

    match &callee {
        Value::Function(lambda) => {
            let call_env = Environment::with_bindings(lambda.env(), lambda.params(), args)?;
            Ok(Step::Tail(lambda.body().clone(), call_env))
        }
        Value::BuiltinFunction { func, .. } => func(args).map(Step::Done),
        other => Err(Error::not_callable(other)),
    }
}

fn invalid_form(form: &str, expected: &str) -> Error {
    Error::InvalidForm(format!("{form}: expected {expected}"))
}

/// Build `(do ...)` around several body forms; a single form stands alone
fn body_form(body: &[Value]) -> Value {
    match body {
        [] => Value::Nil,
        [single] => single.clone(),
        forms => {
            let mut items = Vec::with_capacity(forms.len() + 1);
            items.push(sym("do"));
            items.extend_from_slice(forms);
            Value::list(items)
        }
    }
}

/// Reject parameter specs that can never bind
fn check_params(form: &str, params: &Value) -> Result<(), Error> {
    match params {
        Value::Symbol(_) | Value::List(_) => Ok(()),
        _ => Err(invalid_form(form, "a parameter vector or symbol")),
    }
}

/// `(def name expr)`
fn eval_def(args: &[Value], env: &Environment, ctx: EvalContext) -> Result<Step, Error> {
    match args {
        [Value::Symbol(name), expr] => {
            let value = eval_with_depth_tracking(expr, env, ctx.nested())?;
            Ok(Step::Done(env.set(name.name(), value)))
        }
        _ => Err(invalid_form("def", "a symbol and an expression")),
    }
}

/// `(let [name expr ...] body...)`
fn eval_let(args: &[Value], env: &Environment, ctx: EvalContext) -> Result<Step, Error> {
    let Some((Value::List(bindings), body)) = args.split_first() else {
        return Err(invalid_form("let", "a binding vector"));
    };
    if bindings.len() % 2 != 0 {
        return Err(invalid_form("let", "an even number of binding forms"));
    }

    let let_env = Environment::with_outer(env);
    for pair in bindings.items().chunks_exact(2) {
        let value = eval_with_depth_tracking(&pair[1], &let_env, ctx.nested())?;
        let_env.bind(&pair[0], value)?;
    }

    match body {
        [] => Ok(Step::Done(Value::Nil)),
        _ => Ok(Step::Tail(body_form(body), let_env)),
    }
}

/// `(quote x)`
fn eval_quote(args: &[Value]) -> Result<Step, Error> {
    match args {
        [expr] => Ok(Step::Done(expr.clone())),
        _ => Err(invalid_form("quote", "exactly one form")),
    }
}

/// `(quasiquote template)`
fn eval_quasiquote(args: &[Value], env: &Environment) -> Result<Step, Error> {
    match args {
        [template] => Ok(Step::Tail(quasiquote(template), env.clone())),
        _ => Err(invalid_form("quasiquote", "exactly one form")),
    }
}

/// `(macro [params] body)`, or `(macro name [params] body)` which also binds `name`
fn eval_macro(args: &[Value], env: &Environment) -> Result<Step, Error> {
    let (name, params, body) = match args {
        [params, body] => (None, params, body),
        [Value::Symbol(name), params, body] => (Some(name), params, body),
        _ => return Err(invalid_form("macro", "a parameter vector and a body")),
    };
    check_params("macro", params)?;

    let value = Value::Function(Rc::new(Lambda::new(
        params.clone(),
        body.clone(),
        env.clone(),
        true,
    )));
    if let Some(name) = name {
        env.set(name.name(), value.clone());
    }
    Ok(Step::Done(value))
}

/// `(macroexpand form)`
fn eval_macroexpand(args: &[Value], env: &Environment, ctx: EvalContext) -> Result<Step, Error> {
    match args {
        [form] => expand_macros(form, env, ctx.nested()).map(Step::Done),
        _ => Err(invalid_form("macroexpand", "exactly one form")),
    }
}

/// `(try body)` or `(try body (catch name handler))`.
///
/// The second form is only examined once `body` fails. Anything other than
/// a `catch` clause installs no handler, so the failure propagates unchanged.
fn eval_try(args: &[Value], env: &Environment, ctx: EvalContext) -> Result<Step, Error> {
    let (body, clause) = match args {
        [body] => (body, None),
        [body, clause] => (body, Some(clause)),
        _ => return Err(invalid_form("try", "a body and an optional catch clause")),
    };

    let err = match eval_with_depth_tracking(body, env, ctx.nested()) {
        Ok(value) => return Ok(Step::Done(value)),
        Err(err) => err,
    };
    let Some((name, handler)) = clause.map(catch_clause).transpose()?.flatten() else {
        return Err(err);
    };

    log::debug!("caught error in try: {err}");
    let catch_env = Environment::with_outer(env);
    catch_env.set(name.name(), err.into_catch_value());
    Ok(Step::Tail(handler.clone(), catch_env))
}

/// `(catch name handler)` as a name and handler; `None` for any other form
fn catch_clause(clause: &Value) -> Result<Option<(&Symbol, &Value)>, Error> {
    let Some(items) = clause.as_seq().filter(|_| clause.is_list()) else {
        return Ok(None);
    };
    match items {
        [catch, ..] if !catch.is_symbol_named("catch") => Ok(None),
        [_, Value::Symbol(name), handler] => Ok(Some((name, handler))),
        _ => Err(invalid_form("catch", "a symbol and a handler")),
    }
}

/// `(do form...)`
fn eval_do(args: &[Value], env: &Environment, ctx: EvalContext) -> Result<Step, Error> {
    let Some((last, init)) = args.split_last() else {
        return Ok(Step::Done(Value::Nil));
    };
    for form in init {
        eval_with_depth_tracking(form, env, ctx.nested())?;
    }
    Ok(Step::Tail(last.clone(), env.clone()))
}

/// `(if cond then)` or `(if cond then else)`
fn eval_if(args: &[Value], env: &Environment, ctx: EvalContext) -> Result<Step, Error> {
    let (condition, then_expr, else_expr) = match args {
        [condition, then_expr] => (condition, then_expr, None),
        [condition, then_expr, else_expr] => (condition, then_expr, Some(else_expr)),
        _ => return Err(invalid_form("if", "a condition, a branch and an optional else branch")),
    };

    if eval_with_depth_tracking(condition, env, ctx.nested())?.is_truthy() {
        Ok(Step::Tail(then_expr.clone(), env.clone()))
    } else {
        match else_expr {
            Some(else_expr) => Ok(Step::Tail(else_expr.clone(), env.clone())),
            None => Ok(Step::Done(Value::Nil)),
        }
    }
}

/// `(fn [params] body...)`
fn eval_fn(args: &[Value], env: &Environment) -> Result<Step, Error> {
    let Some((params, body)) = args.split_first() else {
        return Err(invalid_form("fn", "a parameter vector and a body"));
    };
    if body.is_empty() {
        return Err(invalid_form("fn", "a parameter vector and a body"));
    }
    check_params("fn", params)?;

    Ok(Step::Done(Value::Function(Rc::new(Lambda::new(
        params.clone(),
        body_form(body),
        env.clone(),
        false,
    )))))
}

/// `(eval-when-execute form)`: evaluate, then evaluate the result
fn eval_when_execute(args: &[Value], env: &Environment, ctx: EvalContext) -> Result<Step, Error> {
    match args {
        [form] => {
            let expansion = eval_with_depth_tracking(form, env, ctx.nested())?;
            Ok(Step::Tail(expansion, env.clone()))
        }
        _ => Err(invalid_form("eval-when-execute", "exactly one form")),
    }
}

/// Create a global environment with built-in functions
pub fn create_global_env() -> Environment {
    let env = Environment::new();
    for builtin_op in get_builtin_ops() {
        env.set(builtin_op.id, builtin_op.to_value());
    }
    env
}

#[cfg(all(test, feature = "reader"))]
#[expect(clippy::unwrap_used)] // test code OK
mod tests {
    use super::*;
    use crate::ast::{kw, list, nil, val, vector};
    use crate::reader::{parse, parse_all};

    #[test]
    fn test_register_builtin_operation_add() {
        fn add(a: f64, b: f64) -> f64 {
            a + b
        }
        let env = create_global_env();
        env.register_builtin_operation::<_, (f64, f64)>("add2", add);
        let expr = parse("(add2 7 5)").unwrap();
        assert_eq!(eval(&expr, &env).unwrap(), val(12));
    }

    #[test]
    fn test_register_builtin_operation_result_builtin() {
        fn safe_div(a: f64, b: f64) -> Result<f64, crate::Error> {
            if b == 0.0 {
                Err(crate::Error::EvalError("division by zero".into()))
            } else {
                Ok(a / b)
            }
        }

        let env = create_global_env();
        env.register_builtin_operation::<_, (f64, f64)>("safe-div", safe_div);

        let result_ok = eval(&parse("(safe-div 6 3)").unwrap(), &env).unwrap();
        assert_eq!(result_ok, val(2));

        let err = eval(&parse("(safe-div 1 0)").unwrap(), &env).unwrap_err();
        assert!(format!("{err}").contains("division by zero"));
    }

    #[test]
    fn test_register_variadic_builtin_operation_with_explicit_arity() {
        fn weighted_sum(weight: f64, nums: NumIter<'_>) -> f64 {
            weight * nums.sum::<f64>()
        }

        let env = create_global_env();
        env.register_variadic_builtin_operation::<_, (f64, NumIter<'static>)>(
            "weighted-sum",
            Arity::AtLeast(2),
            weighted_sum,
        );

        let result = eval(&parse("(weighted-sum 2 1 2 3)").unwrap(), &env).unwrap();
        assert_eq!(result, val(12));

        let err = eval(&parse("(weighted-sum 2)").unwrap(), &env).unwrap_err();
        match err {
            crate::Error::ArityMismatch { .. } => {}
            other => panic!("expected ArityMismatch, got {other:?}"),
        }
    }

    /// Test result variants for comprehensive testing
    #[derive(Debug)]
    enum TestResult {
        EvalResult(Value),           // Evaluation should succeed with this value
        Success,                     // Evaluation should succeed (value not compared)
        SpecificError(&'static str), // Evaluation should fail with error containing this string
        Error,                       // Evaluation should fail (any error)
    }
    use TestResult::*;

    /// Test environment containing test cases that share state
    struct TestEnvironment(Vec<(&'static str, TestResult)>);

    /// Micro-helper for success cases in comprehensive tests
    fn success<T: Into<Value>>(value: T) -> TestResult {
        EvalResult(val(value))
    }

    /// Macro for setup expressions whose value is a function (def of fn, macro)
    macro_rules! test_setup {
        ($expr:expr) => {
            ($expr, Success)
        };
    }

    /// Run tests in isolated environments with shared state
    fn run_tests_in_environment(test_environments: Vec<TestEnvironment>) {
        for (env_idx, TestEnvironment(test_cases)) in test_environments.iter().enumerate() {
            let env = create_global_env();
            for (test_idx, (input, expected)) in test_cases.iter().enumerate() {
                let test_id = format!("Environment #{} test #{}", env_idx + 1, test_idx + 1);
                execute_test_case(input, expected, &env, &test_id);
            }
        }
    }

    /// Execute a single test case with detailed error reporting
    fn execute_test_case(input: &str, expected: &TestResult, env: &Environment, test_id: &str) {
        let expr = match parse(input) {
            Ok(expr) => expr,
            Err(parse_err) => {
                panic!("{test_id}: unexpected parse error for '{input}': {parse_err:?}");
            }
        };

        match (eval(&expr, env), expected) {
            (Ok(actual), EvalResult(expected_val)) => {
                assert!(
                    actual == *expected_val,
                    "{test_id}: '{input}' expected {expected_val:?}, got {actual:?}"
                );
            }
            (Ok(_), Success) | (Err(_), Error) => {}
            (Err(e), SpecificError(expected_text)) => {
                let error_msg = format!("{e}");
                assert!(
                    error_msg.contains(expected_text),
                    "{test_id}: error should contain '{expected_text}', got: {error_msg}"
                );
            }
            (Ok(actual), Error) => {
                panic!("{test_id}: '{input}' expected error, got {actual:?}");
            }
            (Ok(actual), SpecificError(expected_text)) => {
                panic!(
                    "{test_id}: '{input}' expected error containing '{expected_text}', got {actual:?}"
                );
            }
            (Err(err), EvalResult(_) | Success) => {
                panic!("{test_id}: '{input}' expected success, got error {err:?}");
            }
        }
    }

    /// Simplified test runner with specific error message support
    fn run_comprehensive_tests(test_cases: Vec<(&'static str, TestResult)>) {
        for (i, (input, expected)) in test_cases.iter().enumerate() {
            let env = create_global_env();
            let test_id = format!("#{}", i + 1);
            execute_test_case(input, expected, &env, &test_id);
        }
    }

    #[test]
    #[expect(clippy::too_many_lines)] // Comprehensive test coverage is intentionally thorough
    fn test_comprehensive_operations_data_driven() {
        let test_cases = vec![
            // === SELF-EVALUATING FORMS ===
            ("42", success(42)),
            ("-2.5", success(-2.5)),
            ("\"hello\"", success("hello")),
            ("true", success(true)),
            ("false", success(false)),
            ("nil", success(())),
            (":fill", EvalResult(kw("fill"))),
            ("()", EvalResult(list(vec![]))),
            // === VECTORS AND MAPS EVALUATE THEIR ELEMENTS ===
            ("[1 (+ 1 1) 3]", EvalResult(vector(vec![val(1), val(2), val(3)]))),
            ("[]", EvalResult(vector(vec![]))),
            ("(vector? [(+ 1 1)])", success(true)),
            ("(count {:a (+ 1 2) \"b\" 2})", success(2)),
            ("(= {:a (+ 1 2)} {:a 3})", success(true)),
            // === QUOTE ===
            ("(quote hello)", EvalResult(sym("hello"))),
            ("'(1 2 3)", success([1, 2, 3])),
            ("'(+ 1 2)", success([sym("+"), val(1), val(2)])),
            ("''x", success([sym("quote"), sym("x")])),
            ("'[a (+ 1 2)]", EvalResult(vector(vec![sym("a"), list(vec![sym("+"), val(1), val(2)])]))),
            ("(quote)", SpecificError("quote")),
            ("(quote a b)", Error),
            // === QUASIQUOTE ===
            ("`(1 2 3)", success([1, 2, 3])),
            ("`x", EvalResult(sym("x"))),
            ("(let [x 5] `(a ~x))", success([sym("a"), val(5)])),
            ("(let [xs '(1 2)] `(0 ~@xs 3))", success([0, 1, 2, 3])),
            ("(let [xs [1 2]] `[~@xs])", success([1, 2])),
            ("`()", EvalResult(list(vec![]))),
            ("(= `(a (b c)) '(a (b c)))", success(true)),
            ("(quasiquote)", Error),
            // === IF ===
            ("(if true 1 2)", success(1)),
            ("(if false 1 2)", success(2)),
            ("(if nil 1 2)", success(2)),
            ("(if 0 1 2)", success(1)),
            ("(if \"\" 1 2)", success(1)),
            ("(if false 1)", success(())),
            ("(if (< 1 2) \"yes\" \"no\")", success("yes")),
            ("(if)", Error),
            ("(if true)", Error),
            ("(if true 1 2 3)", Error),
            // === DO ===
            ("(do)", success(())),
            ("(do 1 2 3)", success(3)),
            ("(do (def a 1) (def a (+ a 1)) a)", success(2)),
            // === LET ===
            ("(let [x 1 y (+ x 1)] y)", success(2)),
            ("(let [x 1] (def z 9) (+ x z))", success(10)),
            ("(let [x 1])", success(())),
            ("(let [[a b] [1 2]] (+ a b))", success(3)),
            ("(let [[a & more] '(1 2 3)] more)", success([2, 3])),
            ("(let [x 1 y] y)", Error),
            ("(let [1 2] 3)", Error),
            ("(let x 1)", Error),
            ("(let)", Error),
            // === DEF ===
            ("(def x 42)", success(42)),
            ("(def \"x\" 42)", SpecificError("def")),
            ("(def x)", Error),
            // === FN AND APPLICATION ===
            ("((fn [x] (* x x)) 4)", success(16)),
            ("((fn [a & rest] rest) 1 2 3)", success([2, 3])),
            ("((fn args args) 1 2)", success([1, 2])),
            ("((fn [] (def q 1) (+ q 1)))", success(2)),
            ("((fn [x] x))", SpecificError("expected 1 arguments, got 0")),
            ("((fn [x] x) 1 2)", Error),
            ("((fn [a & r] a))", SpecificError("at least 1")),
            ("(fn [x])", Error),
            ("(fn \"x\" 1)", Error),
            ("(fn [x] x)", Success),
            ("((if true + *) 2 3)", success(5)),
            ("((if false + *) 2 3)", success(6)),
            ("(+ 1 (* 2 3))", success(7)),
            // === NOT CALLABLE ===
            (
                "(:fill 1)",
                SpecificError(
                    "Keyword :fill is not a function. First element of list always should be a function.",
                ),
            ),
            ("(1 2)", SpecificError("Number 1 is not a function")),
            ("(\"s\")", SpecificError("String \"s\" is not a function")),
            ("('(1) 2)", SpecificError("List (1) is not a function")),
            // === UNBOUND SYMBOLS ===
            ("undefined-var", SpecificError("Symbol 'undefined-var' not found")),
            ("(undefined-fn 1)", SpecificError("Symbol 'undefined-fn' not found")),
            // === MACROS ===
            ("(macro [x] x)", Success),
            ("(macro)", Error),
            ("(macro [x])", Error),
            ("(macro 1 x)", Error),
            // === TRY / CATCH ===
            ("(try 1)", success(1)),
            ("(try (throw \"boom\") (catch e e))", success("boom")),
            ("(try (throw {:code 1}) (catch e (count e)))", success(1)),
            ("(try (throw 42) (catch e (+ e 1)))", success(43)),
            ("(try (nope) (catch e e))", success("Symbol 'nope' not found")),
            ("(try (throw \"boom\"))", SpecificError("boom")),
            ("(try (nope))", SpecificError("Symbol 'nope' not found")),
            // the clause is only examined on failure
            ("(try 1 (catch e))", success(1)),
            ("(try (throw 1) (catch e))", SpecificError("catch: expected a symbol and a handler")),
            ("(try (throw 1) (catch 7 e))", SpecificError("catch: expected a symbol and a handler")),
            // a clause that is not catch installs no handler
            ("(try 1 (katch e e))", success(1)),
            ("(try (throw \"x\") (finally 1))", SpecificError("x")),
            ("(try (nope) [catch e e])", SpecificError("Symbol 'nope' not found")),
            ("(try)", Error),
            ("(try (throw 1) (catch e (throw (+ e 1))))", SpecificError("2")),
            // === EVAL-WHEN-EXECUTE ===
            ("(eval-when-execute '(+ 1 2))", success(3)),
            ("(eval-when-execute (list '* 2 3))", success(6)),
            ("(eval-when-execute 5)", success(5)),
            ("(eval-when-execute)", Error),
            // === MACROEXPAND ===
            ("(macroexpand (+ 1 2))", success([sym("+"), val(1), val(2)])),
            ("(macroexpand)", Error),
        ];

        run_comprehensive_tests(test_cases);

        // === ENVIRONMENT-SENSITIVE TESTS ===
        let environment_test_cases = vec![
            TestEnvironment(vec![
                ("(def x 42)", success(42)),
                ("x", success(42)),
                ("(def x 100)", success(100)),
                ("x", success(100)),
                ("y", Error),
            ]),
            // let shadowing is scoped
            TestEnvironment(vec![
                ("(def x 1)", success(1)),
                ("(let [x 2] x)", success(2)),
                ("x", success(1)),
                ("(let [x 2] (def inner 3) inner)", success(3)),
                ("inner", Error),
            ]),
            // builtins as values
            TestEnvironment(vec![
                test_setup!("(def my-add +)"),
                ("(my-add 10 20)", success(30)),
            ]),
            // closures and lexical scope
            TestEnvironment(vec![
                test_setup!("(def make-adder (fn [n] (fn [x] (+ x n))))"),
                test_setup!("(def add5 (make-adder 5))"),
                ("(add5 3)", success(8)),
                test_setup!("(def f (fn [x] (fn [x] (* x 2))))"),
                ("((f 10) 3)", success(6)),
                test_setup!("(def twice (fn [f x] (f (f x))))"),
                ("(twice add5 0)", success(10)),
            ]),
            // closures see later definitions in the scope they captured
            TestEnvironment(vec![
                test_setup!("(def get-later (fn [] later))"),
                ("(get-later)", SpecificError("Symbol 'later' not found")),
                ("(def later 7)", success(7)),
                ("(get-later)", success(7)),
                ("(let [f (fn [] m) m 5] (f))", success(5)),
            ]),
            // recursion through the shared global environment
            TestEnvironment(vec![
                test_setup!("(def fact (fn [n] (if (<= n 1) 1 (* n (fact (- n 1))))))"),
                ("(fact 5)", success(120)),
                test_setup!("(def is-even (fn [n] (if (= n 0) true (is-odd (- n 1)))))"),
                test_setup!("(def is-odd (fn [n] (if (= n 0) false (is-even (- n 1)))))"),
                ("(is-even 10)", success(true)),
                ("(is-odd 7)", success(true)),
            ]),
            // macros
            TestEnvironment(vec![
                test_setup!("(macro unless [c a b] `(if ~c ~b ~a))"),
                ("(unless false 1 2)", success(1)),
                ("(unless true 1 2)", success(2)),
                (
                    "(macroexpand (unless c a b))",
                    success([sym("if"), sym("c"), sym("b"), sym("a")]),
                ),
                test_setup!("(def ignore-first (macro [a b] b))"),
                ("(ignore-first (boom) 7)", success(7)),
                test_setup!("(macro when [c & body] `(if ~c (do ~@body)))"),
                ("(when true 1 2 3)", success(3)),
                ("(when false (boom))", success(())),
                ("(macroexpand (when x y))", success([sym("if"), sym("x"), val([sym("do"), sym("y")])])),
            ]),
            // the caught value is bound only inside the handler
            TestEnvironment(vec![
                ("(def e 1)", success(1)),
                ("(try (throw 2) (catch e e))", success(2)),
                ("e", success(1)),
            ]),
        ];

        run_tests_in_environment(environment_test_cases);
    }

    fn eval_program(program: &str, env: &Environment) -> Result<Value, crate::Error> {
        let mut last = Value::Nil;
        for expr in parse_all(program)? {
            last = eval(&expr, env)?;
        }
        Ok(last)
    }

    #[test]
    fn test_function_values() {
        let env = create_global_env();
        let f = eval(&parse("(fn [x & more] (+ x 1))").unwrap(), &env).unwrap();
        let Value::Function(lambda) = &f else {
            panic!("expected a function, got {f:?}");
        };
        assert!(!lambda.is_macro());
        assert_eq!(*lambda.params(), vector(vec![sym("x"), sym("&"), sym("more")]));
        assert_eq!(*lambda.body(), parse("(+ x 1)").unwrap());
        assert!(lambda.env().ptr_eq(&env));
        assert_eq!(f.to_string(), "#<function>");

        let m = eval(&parse("(macro [x] x)").unwrap(), &env).unwrap();
        assert_eq!(m.kind_name(), "Macro");
        assert_eq!(m.to_string(), "#<macro>");

        let plus = eval(&parse("+").unwrap(), &env).unwrap();
        assert!(matches!(plus, Value::BuiltinFunction { .. }));
        assert_eq!(plus.to_string(), "#<builtin-function:+>");
    }

    #[test]
    fn test_closures_share_their_defining_scope() {
        let env = create_global_env();
        // `get` sees the later `def` made in the scope it captured
        let program = "(let [n 10 get (fn [] n)] (def n 20) (get))";
        assert_eq!(eval_program(program, &env).unwrap(), val(20));

        // A `def` inside a call binds in that call's own scope
        let program = "
            (def pair (let [n 10]
                        [(fn [] n) (fn [] (eval-when-execute '(def n 99)))]))
            ((nth pair 1))
            ((nth pair 0))";
        assert_eq!(eval_program(program, &env).unwrap(), val(10));
        assert!(!env.find("n"));
    }

    #[test]
    fn test_tail_calls_run_in_constant_stack() {
        let env = create_global_env();
        let program = "
            (def count-down (fn [n acc] (if (= n 0) acc (count-down (- n 1) (+ acc 1)))))
            (count-down 50000 0)";
        assert_eq!(eval_program(program, &env).unwrap(), val(50000));

        // do, let and catch handlers are tail positions too
        let program = "
            (def loop-do (fn [n] (do 1 (if (= n 0) :done (loop-do (- n 1))))))
            (def loop-let (fn [n] (let [m (- n 1)] (if (< m 0) :done (loop-let m)))))
            (def loop-try (fn [n] (if (= n 0) :done (try (throw n) (catch e (loop-try (- e 1)))))))
            [(loop-do 10000) (loop-let 10000) (loop-try 10000)]";
        assert_eq!(
            eval_program(program, &env).unwrap(),
            vector(vec![kw("done"), kw("done"), kw("done")])
        );
    }

    /// Run `test` on a thread whose stack fits the full default depth limit
    fn with_deep_stack(test: impl FnOnce() + Send + 'static) {
        std::thread::Builder::new()
            .stack_size(256 * 1024 * 1024)
            .spawn(test)
            .unwrap()
            .join()
            .unwrap();
    }

    #[test]
    fn test_evaluation_depth_limit() {
        with_deep_stack(|| {
            let env = create_global_env();
            eval_program("(def deep (fn [n] (if (= n 0) 0 (+ 1 (deep (- n 1))))))", &env)
                .unwrap();
            assert_eq!(eval_program("(deep 10)", &env).unwrap(), val(10));

            let err = eval_program("(deep 100000)", &env).unwrap_err();
            assert_eq!(err, crate::Error::DepthExceeded(MAX_EVAL_DEPTH));

            // The depth failure is an ordinary catchable error
            let caught = eval_program("(try (deep 100000) (catch e :deep))", &env).unwrap();
            assert_eq!(caught, kw("deep"));
        });
    }

    #[test]
    fn test_deep_non_tail_recursion_succeeds() {
        with_deep_stack(|| {
            let env = create_global_env();
            let program = "
                (def build (fn [n] (if (= n 0) '() (cons n (build (- n 1))))))
                (def deep (fn [n] (if (= n 0) 0 (+ 1 (deep (- n 1))))))
                [(count (build 1000)) (deep 5000)]";
            assert_eq!(
                eval_program(program, &env).unwrap(),
                vector(vec![val(1000), val(5000)])
            );
        });
    }

    #[test]
    fn test_depth_limit_is_configurable() {
        let env = create_global_env();
        eval_program("(def deep (fn [n] (if (= n 0) 0 (+ 1 (deep (- n 1))))))", &env).unwrap();

        let shallow = parse("(deep 10)").unwrap();
        assert_eq!(evaluate_with_limit(&shallow, &env, false, 50).unwrap(), val(10));

        let too_deep = parse("(deep 100)").unwrap();
        assert_eq!(
            evaluate_with_limit(&too_deep, &env, false, 50).unwrap_err(),
            crate::Error::DepthExceeded(50)
        );
        assert_eq!(eval(&too_deep, &env).unwrap(), val(100));
    }

    #[test]
    fn test_try_without_catch_rethrows_original_failure() {
        let env = create_global_env();
        let cases = [
            ("(try (throw \"x\"))", val("x")),
            ("(try (throw \"x\") (finally 1))", val("x")),
            ("(try (throw [1 2]) (katch e e))", val([1, 2])),
        ];
        for (program, thrown) in cases {
            let err = eval_program(program, &env).unwrap_err();
            assert_eq!(err, crate::Error::Thrown(thrown), "{program}");
        }

        // The clause is inert when the body succeeds
        assert_eq!(eval_program("(try (+ 1 2) (finally 1))", &env).unwrap(), val(3));
    }

    #[test]
    fn test_natives_may_capture_environments() {
        let env = create_global_env();
        let captured = env.clone();
        // A native that calls back into the evaluator with the environment it holds
        env.register_builtin_operation::<_, (&str,)>("eval-string", move |source: &str| {
            eval(&parse(source)?, &captured)
        });

        eval_program("(def x 41)", &env).unwrap();
        assert_eq!(eval_program("(eval-string \"(+ x 1)\")", &env).unwrap(), val(42));
    }

    #[test]
    fn test_visited_releases_nodes_nobody_holds() {
        let mut visited = Visited::new(true);
        let kept = list(vec![sym("kept")]);
        visited.record(&kept);
        visited.record(&kept);

        for i in 0..10_000 {
            // dropped as soon as it is recorded, like a fresh expansion
            visited.record(&list(vec![val(i)]));
        }
        assert!(
            visited.nodes.len() <= 2 * VISITED_PRUNE_MIN + 1,
            "ledger grew to {} entries",
            visited.nodes.len()
        );

        visited.stamp(&val(7));
        assert_eq!(kept.metadata().unwrap().last_evaluated(), Some(val(7)));

        let mut quiet = Visited::new(false);
        quiet.record(&kept);
        assert!(quiet.nodes.is_empty());
    }

    #[test]
    fn test_annotated_macro_loop() {
        let env = create_global_env();
        let program = "
            (macro unless [c a b] `(if ~c ~b ~a))
            (def lp (fn [n] (unless (= n 0) (lp (- n 1)) :done)))";
        eval_program(program, &env).unwrap();

        let call = parse("(lp 20000)").unwrap();
        assert_eq!(eval_annotated(&call, &env).unwrap(), kw("done"));
        assert_eq!(call.metadata().unwrap().last_evaluated(), Some(kw("done")));

        // The macro call in the body was visited in tail position on every pass
        let Value::Function(lp) = env.get("lp").unwrap() else {
            panic!("lp should be a function");
        };
        let body_meta = lp.body().metadata().unwrap();
        assert_eq!(body_meta.last_evaluated(), Some(kw("done")));
        assert_eq!(
            body_meta.last_expansion(),
            Some(parse("(if (= n 0) :done (lp (- n 1)))").unwrap())
        );
    }

    #[test]
    fn test_annotation_stamps_nodes() {
        let env = create_global_env();
        let program = parse("(let [a 3] (if (> a 1) (* a 2) 0))").unwrap();
        let value = eval_annotated(&program, &env).unwrap();
        assert_eq!(value, val(6));

        let meta = program.metadata().unwrap();
        assert_eq!(meta.last_evaluated(), Some(val(6)));

        // (if ...) and (* a 2) are in tail position: both carry the final value
        let items = program.as_seq().unwrap();
        let if_node = &items[2];
        assert_eq!(if_node.metadata().unwrap().last_evaluated(), Some(val(6)));
        let then_node = &if_node.as_seq().unwrap()[2];
        assert_eq!(then_node.metadata().unwrap().last_evaluated(), Some(val(6)));
        assert_eq!(
            then_node.metadata().unwrap().last_applied(),
            Some(env.get("*").unwrap())
        );

        // the condition is a non-tail sub-evaluation with its own value
        let cond_node = &if_node.as_seq().unwrap()[1];
        assert_eq!(cond_node.metadata().unwrap().last_evaluated(), Some(val(true)));

        // the binding vector is data to `let`, never evaluated
        assert_eq!(items[1].metadata().unwrap().last_evaluated(), None);
    }

    #[test]
    fn test_annotation_is_optional_and_overwrites() {
        let env = create_global_env();
        let program = parse("(+ 1 2)").unwrap();

        eval(&program, &env).unwrap();
        assert_eq!(program.metadata().unwrap().last_evaluated(), None);

        eval_annotated(&program, &env).unwrap();
        assert_eq!(program.metadata().unwrap().last_evaluated(), Some(val(3)));

        env.set("+", env.get("*").unwrap());
        eval_annotated(&program, &env).unwrap();
        assert_eq!(program.metadata().unwrap().last_evaluated(), Some(val(2)));
    }

    #[test]
    fn test_annotation_of_macro_calls_and_collections() {
        let env = create_global_env();
        eval(&parse("(macro twice [x] `(* 2 ~x))").unwrap(), &env).unwrap();

        let call = parse("(twice (+ 1 2))").unwrap();
        assert_eq!(eval_annotated(&call, &env).unwrap(), val(6));
        let meta = call.metadata().unwrap();
        assert_eq!(meta.last_evaluated(), Some(val(6)));
        assert_eq!(meta.last_expansion(), Some(parse("(* 2 (+ 1 2))").unwrap()));
        assert_eq!(meta.last_applied(), Some(env.get("twice").unwrap()));

        let coll = parse("[(+ 1 1) {:k (+ 2 2)}]").unwrap();
        eval_annotated(&coll, &env).unwrap();
        let items = coll.as_seq().unwrap();
        assert_eq!(items[0].metadata().unwrap().last_evaluated(), Some(val(2)));
        let map_value = items[1].metadata().unwrap().last_evaluated().unwrap();
        assert_eq!(map_value, parse("{:k 4}").unwrap());
        assert_eq!(
            coll.metadata().unwrap().last_evaluated(),
            Some(vector(vec![val(2), map_value]))
        );
    }

    #[test]
    fn test_failed_evaluation_stamps_nothing() {
        let env = create_global_env();
        let program = parse("(do (+ 1 2) (nope))").unwrap();
        eval_annotated(&program, &env).unwrap_err();
        assert_eq!(program.metadata().unwrap().last_evaluated(), None);
        let first = &program.as_seq().unwrap()[1];
        assert_eq!(first.metadata().unwrap().last_evaluated(), Some(val(3)));
    }

    #[test]
    fn test_nil_and_empty_list() {
        let env = create_global_env();
        assert_eq!(eval(&parse("()").unwrap(), &env).unwrap(), list(vec![]));
        assert_eq!(eval(&nil(), &env).unwrap(), nil());
    }
}
