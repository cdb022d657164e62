// File: src/value.rs
//
// The runtime value and heap object model (spec §3). A `Value` is a small tagged union;
// anything that needs identity or shared mutability lives behind `Obj` on the heap as an
// `Rc<Obj>`. Reference-counted interior mutability (`Rc<RefCell<_>>`) stands in for the
// teacher's `Arc<Mutex<_>>` collection variants in `interpreter/value.rs`, since this VM
// is single-threaded (spec §5): no atomics or locking are needed, just `Rc`/`RefCell`.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::bytecode::FunctionPrototype;
use crate::environment::EnvRef;
use crate::ordered_map::OrderedMap;

/// A Skiff runtime value. Cloning a `Value` is cheap: scalars copy, and `Object` clones
/// only bump a reference count.
#[derive(Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    Object(ObjRef),
}

pub type ObjRef = Rc<Obj>;

/// Heap-allocated object kinds. Each variant that needs mutability after construction
/// wraps its payload in a `RefCell`; variants that are immutable once built (closures'
/// captured environment reference aside) hold their fields directly.
pub enum Obj {
    Str(Rc<str>),
    Array(RefCell<Vec<Value>>),
    Dict(RefCell<OrderedMap<Rc<str>, Value>>),
    Class(RefCell<ClassObj>),
    Instance(InstanceObj),
    Function(FunctionObj),
    /// A host- or built-in-provided native function (spec §4.8 "Delegate-to-callable
    /// bridge"). Carries its own name for error messages and disassembly.
    Native(NativeObj),
    BoundMethod(BoundMethodObj),
    Module(ModuleObj),
    /// The single root/global binding table exposed to script code as a first-class
    /// value (spec §3 "GlobalTable"), e.g. for `globals()` introspection.
    GlobalTable(EnvRef),
    Range(RangeObj),
}

pub struct ClassObj {
    pub name: Rc<str>,
    pub superclass: Option<ObjRef>,
    pub methods: OrderedMap<Rc<str>, ObjRef>,
    pub static_methods: OrderedMap<Rc<str>, ObjRef>,
    pub static_fields: OrderedMap<Rc<str>, Value>,
}

pub struct InstanceObj {
    pub class: ObjRef,
    pub fields: RefCell<OrderedMap<Rc<str>, Value>>,
}

pub struct FunctionObj {
    pub proto: Rc<FunctionPrototype>,
    pub upvalues: Vec<UpvalueRef>,
    /// The top-level environment `Get/Set/DefineGlobal` resolve against when this
    /// function runs: the script's root environment, or the defining module's own
    /// environment for a function compiled as part of a module body. Carried on the
    /// function value (not looked up via the call frame) so a closure keeps reading
    /// and writing its *defining* module's globals even when invoked from elsewhere.
    pub globals: EnvRef,
}

pub struct BoundMethodObj {
    pub receiver: Value,
    pub method: ObjRef,
}

/// A native function's callable payload. `Vm` is referenced through a crate-local alias
/// to avoid a hard dependency cycle in module wiring; see `src/vm.rs`.
pub type NativeFn = Rc<dyn Fn(&mut crate::vm::Vm, &[Value]) -> Result<Value, crate::error::SkiffError>>;

pub struct NativeObj {
    pub name: Rc<str>,
    pub arity: Option<u8>,
    pub func: NativeFn,
}

pub struct ModuleObj {
    pub name: Rc<str>,
    pub env: EnvRef,
    /// `true` once the module body has finished running top to bottom; a module
    /// observed mid-initialization (an import cycle) has this `false`.
    pub initialized: RefCell<bool>,
    /// Names declared with `export`, or `None` for a module compiled without any
    /// `export` statements (spec §4.2: every top-level binding is then visible).
    /// Drives the `Null`-for-non-exported-member fallback on `GetProperty`.
    pub exports: Option<Vec<Rc<str>>>,
}

#[derive(Clone)]
pub struct RangeObj {
    pub start: f64,
    pub end: f64,
    pub step: f64,
    pub inclusive: bool,
}

/// An upvalue cell. `Open` still points into a live call frame's stack slot; `Close`
/// (called when the owning frame returns) copies the value out so the closure keeps
/// working after the frame is gone. Modeled as a plain `Rc<RefCell<_>>` cell rather than
/// a raw pointer into the operand stack, which would require `unsafe`.
pub enum UpvalueState {
    Open(usize),
    Closed(Value),
}

pub struct Upvalue {
    pub state: RefCell<UpvalueState>,
}

pub type UpvalueRef = Rc<Upvalue>;

impl Upvalue {
    pub fn new_open(stack_index: usize) -> UpvalueRef {
        Rc::new(Upvalue { state: RefCell::new(UpvalueState::Open(stack_index)) })
    }

    pub fn close(&self, value: Value) {
        *self.state.borrow_mut() = UpvalueState::Closed(value);
    }

    pub fn stack_index(&self) -> Option<usize> {
        match *self.state.borrow() {
            UpvalueState::Open(idx) => Some(idx),
            UpvalueState::Closed(_) => None,
        }
    }
}

impl Value {
    pub fn str(s: impl Into<Rc<str>>) -> Value {
        Value::Object(crate::intern::intern(&s.into()))
    }

    pub fn array(items: Vec<Value>) -> Value {
        Value::Object(Rc::new(Obj::Array(RefCell::new(items))))
    }

    pub fn dict(map: OrderedMap<Rc<str>, Value>) -> Value {
        Value::Object(Rc::new(Obj::Dict(RefCell::new(map))))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Truthiness per spec §3: only `null` and `false` are falsy, everything else
    /// (including `0` and `""`) is truthy.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Null | Value::Bool(false))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::Object(o) => match o.as_ref() {
                Obj::Str(_) => "string",
                Obj::Array(_) => "array",
                Obj::Dict(_) => "dict",
                Obj::Class(_) => "class",
                Obj::Instance(i) => return instance_type_name(i),
                Obj::Function(_) => "function",
                Obj::Native(_) => "function",
                Obj::BoundMethod(_) => "function",
                Obj::Module(_) => "module",
                Obj::GlobalTable(_) => "globals",
                Obj::Range(_) => "range",
            },
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Object(o) => match o.as_ref() {
                Obj::Str(s) => Some(s),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Reference/value equality per spec §3: scalars compare by value, heap objects by
    /// `Rc` identity (so two distinct arrays with equal contents are *not* `==`).
    /// Interned strings of equal content share identity, so this still does the
    /// intuitive thing for short strings.
    pub fn values_equal(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                // Strings compare by content even when not the same allocation (e.g.
                // one long, uninterned string vs. an interned one of equal text).
                match (a.as_ref(), b.as_ref()) {
                    (Obj::Str(x), Obj::Str(y)) => x == y,
                    _ => false,
                }
            }
            _ => false,
        }
    }
}

fn instance_type_name(instance: &InstanceObj) -> &'static str {
    // Instances report their class name as the type name at the language level; the
    // generic "instance" tag is only used internally (e.g. panics, debug dumps).
    let _ = instance;
    "instance"
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Number(n) => write!(f, "{n}"),
            Value::Object(o) => write!(f, "{:?}", ObjDebug(o)),
        }
    }
}

struct ObjDebug<'a>(&'a ObjRef);

impl fmt::Debug for ObjDebug<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.as_ref() {
            Obj::Str(s) => write!(f, "{:?}", s),
            Obj::Array(_) => write!(f, "<array>"),
            Obj::Dict(_) => write!(f, "<dict>"),
            Obj::Class(c) => write!(f, "<class {}>", c.borrow().name),
            Obj::Instance(i) => write!(f, "<instance of {}>", class_name(&i.class)),
            Obj::Function(fun) => write!(f, "<function {}>", fun.proto.name),
            Obj::Native(n) => write!(f, "<native function {}>", n.name),
            Obj::BoundMethod(_) => write!(f, "<bound method>"),
            Obj::Module(m) => write!(f, "<module {}>", m.name),
            Obj::GlobalTable(_) => write!(f, "<globals>"),
            Obj::Range(r) => write!(f, "<range {}..{}{}>", r.start, r.end, if r.inclusive { "=" } else { "" }),
        }
    }
}

fn class_name(class: &ObjRef) -> Rc<str> {
    match class.as_ref() {
        Obj::Class(c) => c.borrow().name.clone(),
        _ => "?".into(),
    }
}

/// Script-facing string conversion, used by `print`, string interpolation, and the
/// `+` operator's string-concatenation case (spec §4.4).
pub fn to_display_string(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => format_number(*n),
        Value::Object(o) => match o.as_ref() {
            Obj::Str(s) => s.to_string(),
            Obj::Array(items) => {
                let rendered: Vec<String> = items.borrow().iter().map(display_or_repr).collect();
                format!("[{}]", rendered.join(", "))
            }
            Obj::Dict(map) => {
                let rendered: Vec<String> =
                    map.borrow().iter().map(|(k, v)| format!("{}: {}", k, display_or_repr(v))).collect();
                format!("{{{}}}", rendered.join(", "))
            }
            Obj::Class(c) => format!("<class {}>", c.borrow().name),
            Obj::Instance(i) => format!("<{} instance>", class_name(&i.class)),
            Obj::Function(fun) => format!("<function {}>", fun.proto.name),
            Obj::Native(n) => format!("<native function {}>", n.name),
            Obj::BoundMethod(b) => match b.method.as_ref() {
                Obj::Function(fun) => format!("<bound method {}>", fun.proto.name),
                _ => "<bound method>".to_string(),
            },
            Obj::Module(m) => format!("<module {}>", m.name),
            Obj::GlobalTable(_) => "<globals>".to_string(),
            Obj::Range(r) => format!("{}..{}{}", r.start, r.end, if r.inclusive { "=" } else { "" }),
        },
    }
}

/// Strings embedded in a container's display representation are quoted; everything
/// else uses its own display form, matching the convention seen across the example
/// corpus's container `Display` impls.
fn display_or_repr(value: &Value) -> String {
    match value.as_str() {
        Some(s) => format!("{:?}", s),
        None => to_display_string(value),
    }
}

fn format_number(n: f64) -> String {
    if n.is_nan() {
        "nan".to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "inf".to_string() } else { "-inf".to_string() }
    } else if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn falsy_values_are_only_null_and_false() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::Bool(false).is_truthy());
        assert!(Value::Bool(true).is_truthy());
        assert!(Value::Number(0.0).is_truthy());
        assert!(Value::str("").is_truthy());
    }

    #[test]
    fn arrays_compare_by_reference_not_contents() {
        let a = Value::array(vec![Value::Number(1.0)]);
        let b = Value::array(vec![Value::Number(1.0)]);
        assert!(!a.values_equal(&b));
        assert!(a.values_equal(&a.clone()));
    }

    #[test]
    fn interned_strings_compare_equal_by_content() {
        let a = Value::str("hello");
        let b = Value::str("hello");
        assert!(a.values_equal(&b));
    }

    #[test]
    fn number_display_drops_trailing_zero_for_integral_values() {
        assert_eq!(to_display_string(&Value::Number(3.0)), "3");
        assert_eq!(to_display_string(&Value::Number(3.5)), "3.5");
    }

    #[test]
    fn array_display_quotes_string_elements() {
        let arr = Value::array(vec![Value::str("a"), Value::Number(1.0)]);
        assert_eq!(to_display_string(&arr), "[\"a\", 1]");
    }
}
