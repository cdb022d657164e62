// File: src/host.rs
//
// Embedding facade (spec §4.8 "Host bridge"): lifecycle, running source, evaluating
// expressions, global get/set, calling script callables from Rust, and registering
// Rust closures as script-visible natives. Grounded on `rufflang-ruff/src/main.rs`'s
// pattern of wiring builtins into an `Environment` before running a script, lifted
// out of `main` into a reusable struct so both the CLI and an external embedder can
// share it.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use ahash::AHasher;

use crate::bytecode::FunctionPrototype;
use crate::compiler::Compiler;
use crate::debugger::Debugger;
use crate::error::SkiffError;
use crate::module::ModuleLoader;
use crate::value::{NativeFn, Obj, Value};
use crate::vm::Vm;

type R<T> = Result<T, SkiffError>;

/// Discriminants for [`Host::compile_cache`], so the same source text compiled both
/// as a script and as a standalone expression doesn't collide in the cache.
const CACHE_KIND_SCRIPT: u8 = 0;
const CACHE_KIND_EVAL: u8 = 1;

/// Default scope name `run`/`eval` use when a caller doesn't need multiple
/// independent top-level scopes in the same `Host`.
const DEFAULT_SCOPE: &str = "main";

fn source_hash(kind: u8, source: &str) -> u64 {
    let mut hasher = AHasher::default();
    kind.hash(&mut hasher);
    source.hash(&mut hasher);
    hasher.finish()
}

/// Converts a Rust value into a script `Value` when returning it from a registered
/// native function.
pub trait IntoValue {
    fn into_value(self) -> Value;
}

impl IntoValue for Value {
    fn into_value(self) -> Value {
        self
    }
}

impl IntoValue for () {
    fn into_value(self) -> Value {
        Value::Null
    }
}

impl IntoValue for f64 {
    fn into_value(self) -> Value {
        Value::Number(self)
    }
}

impl IntoValue for bool {
    fn into_value(self) -> Value {
        Value::Bool(self)
    }
}

impl IntoValue for String {
    fn into_value(self) -> Value {
        Value::str(self)
    }
}

impl IntoValue for &str {
    fn into_value(self) -> Value {
        Value::str(self)
    }
}

impl<T: IntoValue> IntoValue for Option<T> {
    fn into_value(self) -> Value {
        match self {
            Some(v) => v.into_value(),
            None => Value::Null,
        }
    }
}

/// Converts a script `Value` argument into a Rust value for a registered native
/// function. Returns an error message (not a full `SkiffError`) on mismatch so
/// callers can attach their own function name/argument position context.
pub trait FromValue: Sized {
    fn from_value(value: &Value) -> Result<Self, String>;
}

impl FromValue for Value {
    fn from_value(value: &Value) -> Result<Self, String> {
        Ok(value.clone())
    }
}

impl FromValue for f64 {
    fn from_value(value: &Value) -> Result<Self, String> {
        value.as_number().ok_or_else(|| format!("expected a number, got {}", value.type_name()))
    }
}

impl FromValue for bool {
    fn from_value(value: &Value) -> Result<Self, String> {
        Ok(value.is_truthy())
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> Result<Self, String> {
        value.as_str().map(str::to_string).ok_or_else(|| format!("expected a string, got {}", value.type_name()))
    }
}

/// Owns a `Vm` and its debugger, and presents the spec's embedding surface. One
/// `Host` corresponds to one running script instance: `reset` discards all state
/// and starts fresh, `shutdown` simply drops it.
pub struct Host {
    vm: Vm,
    debugger: Debugger,
    /// Compile cache keyed by (kind, source-hash): written on first compile of a
    /// given source text, read on every later `run`/`eval` of the same text,
    /// regardless of which scope it's run against (spec §2/§5 "compile cache").
    compile_cache: HashMap<u64, Rc<FunctionPrototype>>,
}

impl Default for Host {
    fn default() -> Self {
        Self::new()
    }
}

impl Host {
    pub fn new() -> Self {
        Host { vm: Vm::new(), debugger: Debugger::new(), compile_cache: HashMap::new() }
    }

    /// Discards all script state (globals, scopes, loaded modules, the compile
    /// cache, breakpoints, and the interned-string pool) and starts over with a
    /// fresh VM — the spec's `reset` lifecycle operation.
    pub fn reset(&mut self) {
        *self = Host::new();
        crate::intern::reset();
    }

    /// No persistent resources are held beyond process memory, so shutdown is just
    /// dropping the host; kept as an explicit method so callers don't need to know
    /// that, and so a future resource (e.g. an open debug socket) has somewhere to
    /// be closed.
    pub fn shutdown(self) {}

    pub fn debugger(&mut self) -> &mut Debugger {
        &mut self.debugger
    }

    pub fn set_module_loader(&mut self, loader: Box<dyn ModuleLoader>) {
        self.vm.set_module_loader(loader);
    }

    /// Compiles (reusing the compile cache if `source` was seen before) and runs a
    /// complete script against the default scope, returning its implicit result
    /// (`null` unless the script ends with a bare `return`-like final expression).
    pub fn run(&mut self, source: &str) -> R<Value> {
        self.run_scoped(source, DEFAULT_SCOPE, false)
    }

    /// The full Host API `run(source, scopeName, clearScope)` operation (spec §6):
    /// compiles `source` if it isn't already in the compile cache, then executes it
    /// against the named top-level scope. `clear_scope` discards that scope's prior
    /// bindings (but never the root environment's builtins/host globals) before the
    /// run, for a host that wants to re-run a script from a clean slate without
    /// tearing down the whole `Host`.
    pub fn run_scoped(&mut self, source: &str, scope_name: &str, clear_scope: bool) -> R<Value> {
        let proto = self.compile_cached(CACHE_KIND_SCRIPT, source, Compiler::compile_script)?;
        let globals = self.vm.scope(scope_name, clear_scope);
        self.vm.interpret_in(proto, globals)
    }

    /// The Host API `run(bytes, …)` operation (spec §6): executes a prebuilt
    /// prototype, previously produced by [`crate::bytecode::serialize`], against the
    /// default scope, without going through the compiler or the compile cache.
    pub fn run_bytes(&mut self, bytes: &[u8]) -> R<Value> {
        self.run_bytes_scoped(bytes, DEFAULT_SCOPE, false)
    }

    /// As [`Host::run_bytes`], but against an explicit named scope with the same
    /// `clearScope` semantics as [`Host::run_scoped`].
    pub fn run_bytes_scoped(&mut self, bytes: &[u8], scope_name: &str, clear_scope: bool) -> R<Value> {
        let proto = Rc::new(crate::bytecode::deserialize(bytes)?);
        let globals = self.vm.scope(scope_name, clear_scope);
        self.vm.interpret_in(proto, globals)
    }

    /// Compiles (reusing the compile cache) and runs `source` as a standalone
    /// expression, returning its value without requiring an explicit `return` — the
    /// REPL's "bare expression" mode.
    pub fn eval(&mut self, source: &str) -> R<Value> {
        let proto = self.compile_cached(CACHE_KIND_EVAL, source, Compiler::compile_eval_expr)?;
        self.vm.interpret(proto)
    }

    /// Looks up `source` (qualified by `kind` so the same text compiled as a script
    /// and as an eval-expression never collide) in the compile cache, compiling and
    /// inserting it on a miss.
    fn compile_cached(
        &mut self,
        kind: u8,
        source: &str,
        compile: fn(&str) -> R<FunctionPrototype>,
    ) -> R<Rc<FunctionPrototype>> {
        let key = source_hash(kind, source);
        if let Some(proto) = self.compile_cache.get(&key) {
            return Ok(proto.clone());
        }
        let proto = Rc::new(compile(source)?);
        self.compile_cache.insert(key, proto.clone());
        Ok(proto)
    }

    pub fn set_global(&mut self, name: impl Into<Rc<str>>, value: impl IntoValue) {
        self.vm.define_global(name, value.into_value());
    }

    pub fn get_global(&self, name: &str) -> Option<Value> {
        self.vm.get_global(name)
    }

    /// Calls a script-level callable (a function, bound method, or class) from
    /// Rust — e.g. a callback value previously returned from `run`/`eval` or
    /// retrieved via `get_global`.
    pub fn call(&mut self, callee: &Value, args: &[Value]) -> R<Value> {
        self.vm.call_value(callee.clone(), args)
    }

    /// Loads `path` through the host's module loader exactly as an `import`
    /// statement would, returning the module object.
    pub fn load_module(&mut self, path: &str) -> R<Value> {
        self.vm.load_module(path)
    }

    fn register_raw(&mut self, name: &str, arity: Option<u8>, func: NativeFn) {
        self.vm.register_native(name, arity, func);
    }

    /// Registers a zero-argument native function under `name`.
    pub fn register_fn0<R2: IntoValue + 'static>(&mut self, name: &str, f: impl Fn() -> R2 + 'static) {
        self.register_raw(
            name,
            Some(0),
            Rc::new(move |_vm: &mut Vm, _args: &[Value]| Ok(f().into_value())),
        );
    }

    /// Registers a one-argument native function under `name`.
    pub fn register_fn1<A: FromValue, R2: IntoValue + 'static>(
        &mut self,
        name: &str,
        f: impl Fn(A) -> R2 + 'static,
    ) {
        let name_owned = name.to_string();
        self.register_raw(
            name,
            Some(1),
            Rc::new(move |_vm: &mut Vm, args: &[Value]| {
                let a = A::from_value(&args[0]).map_err(|e| SkiffError::runtime(format!("{name_owned}(): {e}")))?;
                Ok(f(a).into_value())
            }),
        );
    }

    /// Registers a two-argument native function under `name`.
    pub fn register_fn2<A: FromValue, B: FromValue, R2: IntoValue + 'static>(
        &mut self,
        name: &str,
        f: impl Fn(A, B) -> R2 + 'static,
    ) {
        let name_owned = name.to_string();
        self.register_raw(
            name,
            Some(2),
            Rc::new(move |_vm: &mut Vm, args: &[Value]| {
                let a = A::from_value(&args[0]).map_err(|e| SkiffError::runtime(format!("{name_owned}(): {e}")))?;
                let b = B::from_value(&args[1]).map_err(|e| SkiffError::runtime(format!("{name_owned}(): {e}")))?;
                Ok(f(a, b).into_value())
            }),
        );
    }

    /// Direct access to the underlying VM, for hosts that need capabilities this
    /// facade doesn't wrap (disassembly, raw bytecode loading).
    pub fn vm(&mut self) -> &mut Vm {
        &mut self.vm
    }

    pub fn vm_ref(&self) -> &Vm {
        &self.vm
    }

    /// Array/dict-aware pretty helper used by the REPL and CLI to echo a value.
    pub fn describe(&self, value: &Value) -> String {
        crate::value::to_display_string(value)
    }
}

/// True if `value` is a script-level exception object created by a native
/// function that wants to `throw` without going through bytecode.
pub fn is_instance_of(value: &Value, class_name: &str) -> bool {
    match value {
        Value::Object(o) => match o.as_ref() {
            Obj::Instance(inst) => match inst.class.as_ref() {
                Obj::Class(cls) => cls.borrow().name.as_ref() == class_name,
                _ => false,
            },
            _ => false,
        },
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_returns_implicit_null() {
        let mut host = Host::new();
        assert!(matches!(host.run("var x = 1;").unwrap(), Value::Null));
    }

    #[test]
    fn eval_returns_expression_value() {
        let mut host = Host::new();
        assert!(matches!(host.eval("2 + 2").unwrap(), Value::Number(n) if n == 4.0));
    }

    #[test]
    fn set_and_get_global_round_trip() {
        let mut host = Host::new();
        host.set_global("limit", 42.0);
        assert!(matches!(host.get_global("limit"), Some(Value::Number(n)) if n == 42.0));
    }

    #[test]
    fn register_fn1_is_callable_from_script() {
        let mut host = Host::new();
        host.register_fn1("doubled", |x: f64| x * 2.0);
        let result = host.eval("doubled(21)").unwrap();
        assert!(matches!(result, Value::Number(n) if n == 42.0));
    }

    #[test]
    fn reset_clears_globals() {
        let mut host = Host::new();
        host.run("var x = 1;").unwrap();
        host.reset();
        assert!(host.get_global("x").is_none());
    }

    #[test]
    fn separate_scopes_do_not_see_each_others_top_level_vars() {
        let mut host = Host::new();
        host.run_scoped("var x = 1;", "a", false).unwrap();
        host.run_scoped("var x = 2;", "b", false).unwrap();
        let a_env = host.vm().scope("a", false);
        let b_env = host.vm().scope("b", false);
        assert!(matches!(a_env.borrow().get("x"), Some(Value::Number(n)) if n == 1.0));
        assert!(matches!(b_env.borrow().get("x"), Some(Value::Number(n)) if n == 2.0));
    }

    #[test]
    fn clear_scope_discards_prior_bindings_in_that_scope() {
        let mut host = Host::new();
        host.run_scoped("var x = 1;", "a", false).unwrap();
        host.run_scoped("var y = 2;", "a", true).unwrap();
        let env = host.vm().scope("a", false);
        assert!(env.borrow().get("x").is_none());
        assert!(matches!(env.borrow().get("y"), Some(Value::Number(n)) if n == 2.0));
    }

    #[test]
    fn same_source_compiled_as_script_and_eval_does_not_collide_in_cache() {
        let mut host = Host::new();
        host.run("1 + 1;").unwrap();
        let v = host.eval("1 + 1").unwrap();
        assert!(matches!(v, Value::Number(n) if n == 2.0));
    }

    #[test]
    fn run_bytes_executes_a_prebuilt_prototype() {
        let proto = Compiler::compile_script("global answer = 40 + 2;").unwrap();
        let bytes = crate::bytecode::serialize(&proto);
        let mut host = Host::new();
        host.run_bytes(&bytes).unwrap();
        assert!(matches!(host.get_global("answer"), Some(Value::Number(n)) if n == 42.0));
    }
}
