use crate::Error;
use crate::ast::{REST_MARKER, Value};
use crate::builtinops::Arity;
use crate::evaluator::intooperation::{IntoOperation, IntoVariadicOperation, OperationFn};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

struct Frame {
    bindings: HashMap<String, Value>,
    outer: Option<Environment>,
}

/// Lexical scope: a shared, mutable set of bindings chained to an outer scope.
///
/// Cloning an `Environment` clones the handle, so every closure created in a
/// scope sees later `def`s made in that same scope.
#[derive(Clone)]
pub struct Environment(Rc<RefCell<Frame>>);

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment {
    /// Create an empty top-level environment
    pub fn new() -> Self {
        Environment(Rc::new(RefCell::new(Frame {
            bindings: HashMap::new(),
            outer: None,
        })))
    }

    /// Create an empty environment nested inside `outer`
    pub fn with_outer(outer: &Environment) -> Self {
        Environment(Rc::new(RefCell::new(Frame {
            bindings: HashMap::new(),
            outer: Some(outer.clone()),
        })))
    }

    /// Create an environment nested inside `outer` with `params` bound to `args`
    pub fn with_bindings(
        outer: &Environment,
        params: &Value,
        args: Vec<Value>,
    ) -> Result<Self, Error> {
        let env = Self::with_outer(outer);
        env.bind_all(params, args)?;
        Ok(env)
    }

    /// Look a name up through the chain
    pub fn get(&self, name: &str) -> Result<Value, Error> {
        self.lookup(name)
            .ok_or_else(|| Error::UnboundSymbol(name.to_owned()))
    }

    pub fn lookup(&self, name: &str) -> Option<Value> {
        let mut current = self.clone();
        loop {
            let next = {
                let frame = current.0.borrow();
                if let Some(value) = frame.bindings.get(name) {
                    return Some(value.clone());
                }
                frame.outer.clone()
            };
            current = next?;
        }
    }

    /// Whether `name` is bound anywhere in the chain
    pub fn find(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }

    /// Bind `name` in this environment only, returning the value
    pub fn set(&self, name: impl Into<String>, value: Value) -> Value {
        self.0
            .borrow_mut()
            .bindings
            .insert(name.into(), value.clone());
        value
    }

    /// Bind a parameter spec against a list of arguments.
    ///
    /// A symbol spec binds the whole argument list. A list or vector spec
    /// binds positionally; `&` introduces a rest parameter that collects the
    /// remaining arguments as a list. Nested sequence specs destructure.
    pub fn bind_all(&self, params: &Value, args: Vec<Value>) -> Result<(), Error> {
        match params {
            Value::Symbol(name) => {
                self.set(name.name(), Value::list(args));
                Ok(())
            }
            Value::List(seq) => self.bind_positional(seq.items(), args),
            other => Err(Error::InvalidForm(format!(
                "parameter spec must be a symbol, list or vector, got {other}"
            ))),
        }
    }

    fn bind_positional(&self, specs: &[Value], args: Vec<Value>) -> Result<(), Error> {
        let (fixed, rest) = match specs.iter().position(|s| s.is_symbol_named(REST_MARKER)) {
            Some(marker) => match &specs[marker + 1..] {
                [rest] => (&specs[..marker], Some(rest)),
                _ => {
                    return Err(Error::InvalidForm(
                        "& must be followed by exactly one parameter".into(),
                    ));
                }
            },
            None => (specs, None),
        };

        match rest {
            None if args.len() != fixed.len() => {
                return Err(Error::arity_error(fixed.len(), args.len()));
            }
            Some(_) if args.len() < fixed.len() => {
                return Err(Error::arity_error_at_least(fixed.len(), args.len()));
            }
            _ => {}
        }

        let mut args = args.into_iter();
        for spec in fixed {
            if let Some(arg) = args.next() {
                self.bind(spec, arg)?;
            }
        }
        if let Some(rest) = rest {
            self.bind(rest, Value::list(args.collect()))?;
        }
        Ok(())
    }

    /// Bind one spec to one value, destructuring sequence specs
    pub(crate) fn bind(&self, spec: &Value, value: Value) -> Result<(), Error> {
        match spec {
            Value::Symbol(name) => {
                self.set(name.name(), value);
                Ok(())
            }
            Value::List(seq) => match value {
                Value::List(items) => self.bind_positional(seq.items(), items.items().to_vec()),
                Value::Nil => self.bind_positional(seq.items(), Vec::new()),
                other => Err(Error::InvalidForm(format!(
                    "cannot destructure {} {other} with {spec}",
                    other.kind_name()
                ))),
            },
            other => Err(Error::InvalidForm(format!(
                "parameter must be a symbol, list or vector, got {other}"
            ))),
        }
    }

    /// Register a builtin working directly on the argument slice.
    ///
    /// This is the low-level API. For most new code prefer
    /// [`Environment::register_builtin_operation`].
    ///
    /// # Example
    /// ```
    /// use glisp::evaluator::create_global_env;
    /// use glisp::ast::Value;
    /// use glisp::Error;
    ///
    /// fn arg_count(args: &[Value]) -> Result<Value, Error> {
    ///     Ok(Value::from(args.len()))
    /// }
    ///
    /// let env = create_global_env();
    /// env.register_builtin_function("arg-count", arg_count);
    /// ```
    pub fn register_builtin_function(&self, name: &str, func: fn(&[Value]) -> Result<Value, Error>) {
        let wrapped: Rc<OperationFn> = Rc::new(move |args: Vec<Value>| func(&args));
        self.set(name, Value::builtin(name, wrapped));
    }

    /// Register a strongly-typed Rust function as a builtin.
    ///
    /// ```rust,ignore
    /// fn area(w: f64, h: f64) -> f64 { w * h }
    /// let env = glisp::evaluator::create_global_env();
    /// env.register_builtin_operation::<_, (f64, f64)>("area", area);
    /// ```
    ///
    /// Supported parameter types: `f64`, `bool`, `&str`, `Value` and the
    /// borrowed list iterators `ValueIter`, `NumIter`, `StringIter`.
    /// Return types: any `R: Into<Value>` or `Result<R, Error>`.
    ///
    /// Arity is enforced automatically and conversion failures are
    /// `TypeError`s.
    pub fn register_builtin_operation<F, Args>(&self, name: &str, func: F)
    where
        F: IntoOperation<Args> + 'static,
    {
        self.set(name, Value::builtin(name, func.into_operation()));
    }

    /// Register a builtin whose last parameter collects the remaining
    /// arguments through one of the iterator types, e.g.
    /// `fn(f64, NumIter<'_>) -> f64`.
    ///
    /// `arity` validates the total argument count at call time.
    pub fn register_variadic_builtin_operation<F, Args>(&self, name: &str, arity: Arity, func: F)
    where
        F: IntoVariadicOperation<Args> + 'static,
    {
        let inner = func.into_variadic_operation();
        let wrapped: Rc<OperationFn> = Rc::new(move |args: Vec<Value>| {
            arity.validate(args.len())?;
            inner(args)
        });
        self.set(name, Value::builtin(name, wrapped));
    }

    /// Get all bindings in this environment and its parents
    /// Returns a Vec of (name, value) pairs sorted by name
    pub fn get_all_bindings(&self) -> Vec<(String, Value)> {
        let mut bindings = HashMap::new();

        // Start with parent bindings (so they can be overridden by local bindings)
        let frame = self.0.borrow();
        if let Some(outer) = &frame.outer {
            bindings.extend(outer.get_all_bindings());
        }

        for (name, value) in &frame.bindings {
            bindings.insert(name.clone(), value.clone());
        }

        let mut result: Vec<_> = bindings.into_iter().collect();
        result.sort_by(|a, b| a.0.cmp(&b.0));
        result
    }

    /// Whether both handles refer to the same scope
    pub fn ptr_eq(&self, other: &Environment) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl PartialEq for Environment {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let frame = self.0.borrow();
        let mut names: Vec<_> = frame.bindings.keys().collect();
        names.sort();
        f.debug_struct("Environment")
            .field("bindings", &names)
            .field("has_outer", &frame.outer.is_some())
            .finish()
    }
}
