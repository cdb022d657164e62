// File: src/vm.rs
//
// The bytecode virtual machine (spec §4.3/§4.4): operand stack, call-frame stack,
// open-upvalue list, exception-handler stack, module cache, and the fetch-decode
// dispatch loop over `OpCode`. Grounded on `rufflang-ruff/src/vm.rs` for overall
// struct shape (call stack, globals table, per-frame instruction pointer) with the
// JIT/dense-int-dict machinery dropped — this VM always walks the raw bytecode.
//
// Call/bind machinery (`push_call_frame`, `call_bound`, `invoke_method`,
// `construct_instance`) is unified around one signature so a plain call, a bound
// method call, and a `super` call all funnel through the same arity/rest-param
// logic instead of three near-duplicate paths.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::bytecode::{Constant, FunctionPrototype, OpCode};
use crate::environment::{EnvRef, Environment};
use crate::error::{FrameInfo, SkiffError, SourceLocation};
use crate::module::{FsModuleLoader, LoadedModule, ModuleCache, ModuleLoader};
use crate::ordered_map::OrderedMap;
use crate::value::{
    to_display_string, BoundMethodObj, ClassObj, FunctionObj, InstanceObj, ModuleObj, NativeFn,
    NativeObj, Obj, ObjRef, Upvalue, UpvalueRef, UpvalueState, Value,
};

type R<T> = Result<T, SkiffError>;

/// Maximum nested call depth before this VM reports a stack overflow (spec §7).
const MAX_FRAMES: usize = 1024;

struct Frame {
    function: ObjRef,
    ip: usize,
    stack_base: usize,
    handler_base: usize,
}

/// One active `try` block. Targets are absolute bytecode offsets, resolved once at
/// `SetupTry` time from the compiler's relative operands (see `compiler.rs`'s
/// `try_statement`, which anchors both offsets at the position right after the
/// instruction's three operands).
#[derive(Clone, Copy)]
struct Handler {
    frame_depth: usize,
    catch_target: Option<usize>,
    finally_target: Option<usize>,
    catch_var_slot: u8,
    stack_height: usize,
}

/// Tracks a rethrow in progress through a `finally` block, so `EndFinally` knows
/// whether falling off the end of the block should resume normal execution or
/// continue propagating the original exception.
enum Pending {
    None,
    Exception(Value),
}

pub struct Vm {
    stack: Vec<Value>,
    frames: Vec<Frame>,
    handlers: Vec<Handler>,
    open_upvalues: Vec<UpvalueRef>,
    /// Set by `Throw` (and by `EndFinally` on a rethrow) for `handle_exception` to
    /// pick up; kept off `SkiffError` itself since the error type is shared with the
    /// lexer/compiler, which never carry a script-level value.
    thrown: Option<Value>,
    pending: Pending,
    root: EnvRef,
    /// Named top-level scopes a host can `run` a script against, each a fresh child
    /// of `root` so builtins and host-registered globals stay visible everywhere
    /// (spec §6 Host API `scopeName`/`clearScope`). Populated lazily by `scope`.
    scopes: HashMap<Rc<str>, EnvRef>,
    module_loader: Box<dyn ModuleLoader>,
    modules: ModuleCache,
    last_line: u32,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    pub fn new() -> Self {
        let root = Environment::new_root();
        let mut vm = Vm {
            stack: Vec::new(),
            frames: Vec::new(),
            handlers: Vec::new(),
            open_upvalues: Vec::new(),
            thrown: None,
            pending: Pending::None,
            root,
            scopes: HashMap::new(),
            module_loader: Box::new(FsModuleLoader::new()),
            modules: ModuleCache::new(),
            last_line: 0,
        };
        crate::builtins::install(&mut vm);
        vm
    }

    pub fn root(&self) -> &EnvRef {
        &self.root
    }

    pub fn set_module_loader(&mut self, loader: Box<dyn ModuleLoader>) {
        self.module_loader = loader;
    }

    pub fn define_global(&mut self, name: impl Into<Rc<str>>, value: Value) {
        self.root.borrow_mut().define(name.into(), value);
    }

    pub fn get_global(&self, name: &str) -> Option<Value> {
        self.root.borrow().get(name)
    }

    /// Registers a native function under `name` in the root environment. Used by
    /// `builtins::install` and by a host embedding this VM (spec §4.8).
    pub fn register_native(&mut self, name: &str, arity: Option<u8>, func: NativeFn) {
        let native = Value::Object(Rc::new(Obj::Native(NativeObj { name: name.into(), arity, func })));
        self.root.borrow_mut().define(Rc::from(name), native);
    }

    /// Loads and runs `path` through the configured `ModuleLoader`, exactly as an
    /// `import` statement would, returning the module object. Exposed for
    /// `Host::load_module`.
    pub fn load_module(&mut self, path: &str) -> R<Value> {
        self.import_module(path)
    }

    /// Returns the named global scope, creating it as a fresh child of `root` on
    /// first use, or discarding its existing bindings (but not `root`'s) and
    /// starting it over when `clear` is set — the Host API's `scopeName`/
    /// `clearScope` run parameters (spec §6).
    pub fn scope(&mut self, name: &str, clear: bool) -> EnvRef {
        if !clear {
            if let Some(env) = self.scopes.get(name) {
                return env.clone();
            }
        }
        let env = Environment::new_child(&self.root);
        self.scopes.insert(Rc::from(name), env.clone());
        env
    }

    /// Runs a compiled top-level prototype (script or module) to completion against
    /// the root environment, returning its implicit `null` (or the `return`ed
    /// eval-expression value for a prototype from `Compiler::compile_eval_expr`).
    pub fn interpret(&mut self, proto: Rc<FunctionPrototype>) -> R<Value> {
        let globals = self.root.clone();
        self.interpret_in(proto, globals)
    }

    /// Runs a compiled top-level prototype against an explicit global scope,
    /// letting a host pick which named scope (or a module's own environment) the
    /// script's top-level `var`s land in.
    pub fn interpret_in(&mut self, proto: Rc<FunctionPrototype>, globals: EnvRef) -> R<Value> {
        let function = FunctionObj { proto, upvalues: Vec::new(), globals };
        let callee = Value::Object(Rc::new(Obj::Function(function)));
        self.stack.push(callee.clone());
        let base = self.stack.len() - 1;
        self.push_call_frame(callee, 0, base, None)?;
        let floor = self.frames.len();
        self.run(floor)
    }

    /// Calls a callable `Value` (function, bound method, class, or native) from Rust
    /// code — the mechanism `Host::call` and callback-accepting natives use to
    /// re-enter the VM (spec §4.8 "Delegate-to-callable bridge").
    pub fn call_value(&mut self, callee: Value, args: &[Value]) -> R<Value> {
        let frames_before = self.frames.len();
        self.stack.push(callee.clone());
        let base = self.stack.len() - 1;
        for a in args {
            self.stack.push(a.clone());
        }
        self.invoke_callee(callee, args.len() as u8, base)?;
        if self.frames.len() > frames_before {
            self.run(frames_before + 1)
        } else {
            Ok(self.stack.pop().unwrap_or(Value::Null))
        }
    }

    /// The fetch-decode loop: dispatches opcodes until the frame stack drops below
    /// `floor`, at which point the frame's result (already sitting on top of the
    /// operand stack) is returned.
    fn run(&mut self, floor: usize) -> R<Value> {
        loop {
            if self.frames.len() < floor {
                return Ok(self.stack.pop().unwrap_or(Value::Null));
            }
            if let Err(e) = self.dispatch() {
                if let Err(e) = self.handle_exception(e, floor) {
                    return Err(self.finalize_error(e));
                }
            }
        }
    }

    // ---- frame/stack plumbing ----

    fn frame(&self) -> &Frame {
        self.frames.last().expect("no active call frame")
    }

    fn frame_mut(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("no active call frame")
    }

    fn proto(&self) -> Rc<FunctionPrototype> {
        match self.frame().function.as_ref() {
            Obj::Function(f) => f.proto.clone(),
            _ => unreachable!("call frame function is always Obj::Function"),
        }
    }

    fn current_globals(&self) -> EnvRef {
        match self.frame().function.as_ref() {
            Obj::Function(f) => f.globals.clone(),
            _ => unreachable!("call frame function is always Obj::Function"),
        }
    }

    fn push(&mut self, v: Value) {
        self.stack.push(v);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("stack underflow")
    }

    fn peek(&self, back: usize) -> &Value {
        &self.stack[self.stack.len() - 1 - back]
    }

    fn read_u8(&mut self) -> u8 {
        let proto = self.proto();
        let frame = self.frames.last_mut().expect("no active call frame");
        let b = proto.code[frame.ip];
        frame.ip += 1;
        b
    }

    fn read_u16(&mut self) -> u16 {
        let hi = self.read_u8() as u16;
        let lo = self.read_u8() as u16;
        (hi << 8) | lo
    }

    fn read_i16(&mut self) -> i16 {
        self.read_u16() as i16
    }

    fn const_at(&self, idx: u16) -> Constant {
        self.proto().constants[idx as usize].clone()
    }

    fn const_name(&self, idx: u16) -> Rc<str> {
        match self.const_at(idx) {
            Constant::Str(s) => s,
            _ => unreachable!("expected string constant"),
        }
    }

    fn value_from_constant(&self, c: Constant) -> Value {
        match c {
            Constant::Null => Value::Null,
            Constant::Bool(b) => Value::Bool(b),
            Constant::Number(n) => Value::Number(n),
            Constant::Str(s) => Value::str(s),
            Constant::Function(_) => unreachable!("function constants only load via Closure"),
        }
    }

    // ---- diagnostics ----

    fn runtime_err(&self, message: impl Into<String>) -> SkiffError {
        SkiffError::runtime(message).with_location(SourceLocation::new(self.last_line, 1))
    }

    fn capture_frames(&self) -> Vec<FrameInfo> {
        self.frames
            .iter()
            .rev()
            .map(|f| match f.function.as_ref() {
                Obj::Function(func) => FrameInfo {
                    function_name: func.proto.name.to_string(),
                    file: None,
                    line: func.proto.line_for_offset(f.ip.saturating_sub(1)) as u32,
                },
                _ => FrameInfo { function_name: "?".to_string(), file: None, line: 0 },
            })
            .collect()
    }

    fn finalize_error(&self, err: SkiffError) -> SkiffError {
        match err {
            SkiffError::Runtime { message, location, frames, source_line } => {
                let frames = if frames.is_empty() { self.capture_frames() } else { frames };
                SkiffError::Runtime { message, location, frames, source_line }
            }
            other => other,
        }
    }

    // ---- call machinery ----

    /// Pushes a new call frame for `callee` (already an `Obj::Function`). `argc` is
    /// always the count of real arguments, never including `receiver` — the uniform
    /// convention that keeps arity checks correct whether this is a plain call, a
    /// bound-method call, or a constructor call.
    fn push_call_frame(&mut self, callee: Value, argc: u8, base: usize, receiver: Option<Value>) -> R<()> {
        let proto = match &callee {
            Value::Object(o) => match o.as_ref() {
                Obj::Function(f) => f.proto.clone(),
                _ => return Err(self.runtime_err(format!("'{}' is not callable", callee.type_name()))),
            },
            _ => return Err(self.runtime_err(format!("'{}' is not callable", callee.type_name()))),
        };
        let has_receiver = receiver.is_some();
        if let Some(r) = receiver {
            self.stack.insert(base + 1, r);
        }
        let param_start = base + 1 + if has_receiver { 1 } else { 0 };
        let have = argc as usize;
        let declared = proto.arity as usize;
        if proto.has_rest_param {
            if have < declared {
                return Err(self.runtime_err(format!(
                    "{}() expected at least {} argument(s), got {}",
                    proto.name, declared, have
                )));
            }
            let rest_start = param_start + declared;
            let rest = self.stack.split_off(rest_start);
            self.stack.push(Value::array(rest));
        } else {
            if have > declared {
                return Err(self.runtime_err(format!(
                    "{}() expected {} argument(s), got {}",
                    proto.name, declared, have
                )));
            }
            while self.stack.len() < param_start + declared {
                self.stack.push(Value::Null);
            }
        }
        if self.frames.len() >= MAX_FRAMES {
            return Err(self.runtime_err("stack overflow"));
        }
        let function = match &callee {
            Value::Object(o) => o.clone(),
            _ => unreachable!(),
        };
        self.frames.push(Frame { function, ip: 0, stack_base: base + 1, handler_base: self.handlers.len() });
        Ok(())
    }

    fn do_return(&mut self, result: Value) {
        let frame = self.frames.pop().expect("no active call frame");
        self.close_upvalues_from(frame.stack_base);
        self.handlers.truncate(frame.handler_base);
        self.stack.truncate(frame.stack_base - 1);
        self.stack.push(result);
    }

    /// Dispatches a value at a call site (`Call` opcode, and anywhere else a bare
    /// callable is invoked) purely by its runtime type — the compiler never
    /// distinguishes a function call from a construction or a stored bound-method
    /// call, so the VM must.
    fn invoke_callee(&mut self, callee: Value, argc: u8, base: usize) -> R<()> {
        match &callee {
            Value::Object(o) => match o.as_ref() {
                Obj::Function(_) => self.push_call_frame(callee, argc, base, None),
                Obj::Native(n) => {
                    let have = argc as usize;
                    if let Some(arity) = n.arity {
                        if have != arity as usize {
                            return Err(self.runtime_err(format!(
                                "{}() expected {} argument(s), got {}",
                                n.name, arity, have
                            )));
                        }
                    }
                    let args: Vec<Value> = self.stack[base + 1..].to_vec();
                    let func = n.func.clone();
                    let result = func(self, &args)?;
                    self.stack.truncate(base);
                    self.push(result);
                    Ok(())
                }
                Obj::BoundMethod(b) => {
                    let method = Value::Object(b.method.clone());
                    let receiver = b.receiver.clone();
                    self.call_bound(base, argc, method, receiver)
                }
                Obj::Class(_) => self.construct_instance(callee, argc, base),
                _ => Err(self.runtime_err(format!("'{}' is not callable", callee.type_name()))),
            },
            _ => Err(self.runtime_err(format!("'{}' is not callable", callee.type_name()))),
        }
    }

    /// Calls `method` with `receiver` bound as `this`. Overwrites the callee slot at
    /// `base` (which may currently hold the original receiver object from an
    /// `Invoke` dispatch, or a freshly-inserted placeholder from `SuperInvoke`) and
    /// delegates to the unified call path.
    fn call_bound(&mut self, base: usize, argc: u8, method: Value, receiver: Value) -> R<()> {
        self.stack[base] = method.clone();
        match &method {
            Value::Object(o) => match o.as_ref() {
                Obj::Function(_) => self.push_call_frame(method, argc, base, Some(receiver)),
                Obj::Native(n) => {
                    let mut args = Vec::with_capacity(argc as usize + 1);
                    args.push(receiver);
                    args.extend(self.stack[base + 1..base + 1 + argc as usize].iter().cloned());
                    let func = n.func.clone();
                    let result = func(self, &args)?;
                    self.stack.truncate(base);
                    self.push(result);
                    Ok(())
                }
                _ => Err(self.runtime_err(format!("'{}' is not callable", method.type_name()))),
            },
            _ => Err(self.runtime_err(format!("'{}' is not callable", method.type_name()))),
        }
    }

    /// Backs the `Invoke` opcode: `name(args)` fused method-call dispatch. A field
    /// holding a callable is invoked as a plain function (the receiver is not bound
    /// as `this`); otherwise the method is resolved up the class chain and called
    /// bound.
    fn invoke_method(&mut self, name: &str, argc: u8, base: usize) -> R<()> {
        let receiver = self.stack[base].clone();
        if let Value::Object(o) = &receiver {
            if let Obj::Instance(inst) = o.as_ref() {
                let field = inst.fields.borrow().get(&Rc::from(name)).cloned();
                if let Some(field) = field {
                    self.stack[base] = field.clone();
                    return self.invoke_callee(field, argc, base);
                }
                return match self.resolve_method_on(&Value::Object(inst.class.clone()), name) {
                    Some(method) => self.call_bound(base, argc, Value::Object(method), receiver),
                    None => Err(self.runtime_err(format!("undefined property '{name}'"))),
                };
            }
        }
        let callee = self.get_property(&receiver, name)?;
        self.stack[base] = callee.clone();
        self.invoke_callee(callee, argc, base)
    }

    fn construct_instance(&mut self, class_value: Value, argc: u8, base: usize) -> R<()> {
        let class_obj = match &class_value {
            Value::Object(o) if matches!(o.as_ref(), Obj::Class(_)) => o.clone(),
            _ => return Err(self.runtime_err(format!("'{}' is not a class", class_value.type_name()))),
        };
        let instance =
            Rc::new(Obj::Instance(InstanceObj { class: class_obj.clone(), fields: RefCell::new(OrderedMap::new()) }));
        self.stack[base] = Value::Object(instance.clone());
        match self.find_initializer(&class_obj) {
            Some(init) => self.call_bound(base, argc, Value::Object(init), Value::Object(instance)),
            None if argc == 0 => {
                self.stack.truncate(base + 1);
                Ok(())
            }
            None => Err(self.runtime_err("class has no constructor but arguments were given")),
        }
    }

    /// Walks the class chain looking for the method flagged `is_initializer`, rather
    /// than by name — a subclass that declares no constructor of its own inherits
    /// one keyed under its *superclass's* name, so looking it up by the constructed
    /// class's own name would miss it.
    fn find_initializer(&self, class_obj: &ObjRef) -> Option<ObjRef> {
        let mut current = Some(class_obj.clone());
        while let Some(c) = current {
            match c.as_ref() {
                Obj::Class(cls) => {
                    let cls_ref = cls.borrow();
                    for (_, method) in cls_ref.methods.iter() {
                        if let Obj::Function(f) = method.as_ref() {
                            if f.proto.is_initializer {
                                return Some(method.clone());
                            }
                        }
                    }
                    current = cls_ref.superclass.clone();
                }
                _ => return None,
            }
        }
        None
    }

    fn resolve_method_on(&self, class_value: &Value, name: &str) -> Option<ObjRef> {
        let mut current = match class_value {
            Value::Object(o) => Some(o.clone()),
            _ => None,
        };
        while let Some(c) = current {
            match c.as_ref() {
                Obj::Class(cls) => {
                    let cls_ref = cls.borrow();
                    if let Some(m) = cls_ref.methods.get(&Rc::from(name)) {
                        return Some(m.clone());
                    }
                    current = cls_ref.superclass.clone();
                }
                _ => return None,
            }
        }
        None
    }

    /// Resolves the superclass visible from the *lexically* enclosing method (not
    /// the instance's dynamic class) — the compiler never pushes a superclass
    /// reference for `super`, so the VM derives it from the running method's own
    /// `class_name` and walks up from the instance's actual class to find it.
    fn super_class_for(&self, this: &Value) -> Option<ObjRef> {
        let defining_name = self.proto().class_name.clone()?;
        let instance_class = match this {
            Value::Object(o) => match o.as_ref() {
                Obj::Instance(i) => i.class.clone(),
                _ => return None,
            },
            _ => return None,
        };
        let mut current = Some(instance_class);
        while let Some(c) = current {
            match c.as_ref() {
                Obj::Class(cls) => {
                    let cls_ref = cls.borrow();
                    if cls_ref.name == defining_name {
                        return cls_ref.superclass.clone();
                    }
                    current = cls_ref.superclass.clone();
                }
                _ => return None,
            }
        }
        None
    }

    // ---- upvalues ----

    fn capture_upvalue(&mut self, stack_index: usize) -> UpvalueRef {
        if let Some(existing) = self.open_upvalues.iter().find(|u| u.stack_index() == Some(stack_index)) {
            return existing.clone();
        }
        let upvalue = Upvalue::new_open(stack_index);
        self.open_upvalues.push(upvalue.clone());
        upvalue
    }

    fn close_upvalues_from(&mut self, from: usize) {
        let mut i = 0;
        while i < self.open_upvalues.len() {
            match self.open_upvalues[i].stack_index() {
                Some(idx) if idx >= from => {
                    let value = self.stack[idx].clone();
                    self.open_upvalues[i].close(value);
                    self.open_upvalues.remove(i);
                }
                _ => i += 1,
            }
        }
    }

    // ---- properties / indexing ----

    fn get_property(&self, receiver: &Value, name: &str) -> R<Value> {
        match receiver {
            Value::Object(o) => match o.as_ref() {
                Obj::Instance(inst) => {
                    if let Some(v) = inst.fields.borrow().get(&Rc::from(name)) {
                        return Ok(v.clone());
                    }
                    match self.resolve_method_on(&Value::Object(inst.class.clone()), name) {
                        Some(m) => Ok(Value::Object(Rc::new(Obj::BoundMethod(BoundMethodObj {
                            receiver: receiver.clone(),
                            method: m,
                        })))),
                        None => Err(self.runtime_err(format!("undefined property '{name}'"))),
                    }
                }
                Obj::Class(cls) => {
                    let cls_ref = cls.borrow();
                    if let Some(v) = cls_ref.static_fields.get(&Rc::from(name)) {
                        return Ok(v.clone());
                    }
                    if let Some(m) = cls_ref.static_methods.get(&Rc::from(name)) {
                        return Ok(Value::Object(m.clone()));
                    }
                    Err(self.runtime_err(format!("undefined static member '{name}'")))
                }
                Obj::Module(m) => {
                    if !m.env.borrow().contains_own(name) {
                        return Err(self.runtime_err(format!("module '{}' has no member '{name}'", m.name)));
                    }
                    if let Some(exports) = &m.exports {
                        if !exports.iter().any(|e| e.as_ref() == name) {
                            return Ok(Value::Null);
                        }
                    }
                    Ok(m.env.borrow().get(name).unwrap_or(Value::Null))
                }
                Obj::GlobalTable(env) => Ok(env.borrow().get(name).unwrap_or(Value::Null)),
                _ => Err(self.runtime_err(format!("'{}' has no properties", receiver.type_name()))),
            },
            _ => Err(self.runtime_err(format!("'{}' has no properties", receiver.type_name()))),
        }
    }

    fn set_property(&self, receiver: &Value, name: &str, value: Value) -> R<()> {
        match receiver {
            Value::Object(o) => match o.as_ref() {
                Obj::Instance(inst) => {
                    inst.fields.borrow_mut().insert(Rc::from(name), value);
                    Ok(())
                }
                Obj::Class(cls) => {
                    cls.borrow_mut().static_fields.insert(Rc::from(name), value);
                    Ok(())
                }
                _ => Err(self.runtime_err(format!("'{}' does not support property assignment", receiver.type_name()))),
            },
            _ => Err(self.runtime_err(format!("'{}' does not support property assignment", receiver.type_name()))),
        }
    }

    fn normalize_index(&self, index: &Value, len: usize) -> R<usize> {
        let n = index.as_number().ok_or_else(|| self.runtime_err("index must be a number"))?;
        let i = n as i64;
        let resolved = if i < 0 { i + len as i64 } else { i };
        if resolved < 0 || resolved as usize >= len {
            return Err(self.runtime_err("index out of bounds"));
        }
        Ok(resolved as usize)
    }

    fn get_index(&self, target: &Value, index: &Value) -> R<Value> {
        match target {
            Value::Object(o) => match o.as_ref() {
                Obj::Array(items) => {
                    let items = items.borrow();
                    let i = self.normalize_index(index, items.len())?;
                    Ok(items[i].clone())
                }
                Obj::Str(s) => {
                    let chars: Vec<char> = s.chars().collect();
                    let i = self.normalize_index(index, chars.len())?;
                    Ok(Value::str(chars[i].to_string()))
                }
                Obj::Dict(map) => {
                    let key = index.as_str().ok_or_else(|| self.runtime_err("dict key must be a string"))?;
                    map.borrow()
                        .get(&Rc::from(key))
                        .cloned()
                        .ok_or_else(|| self.runtime_err(format!("key '{key}' not found")))
                }
                _ => Err(self.runtime_err(format!("'{}' does not support indexing", target.type_name()))),
            },
            _ => Err(self.runtime_err(format!("'{}' does not support indexing", target.type_name()))),
        }
    }

    fn set_index(&self, target: &Value, index: &Value, value: Value) -> R<()> {
        match target {
            Value::Object(o) => match o.as_ref() {
                Obj::Array(items) => {
                    let mut items = items.borrow_mut();
                    let i = self.normalize_index(index, items.len())?;
                    items[i] = value;
                    Ok(())
                }
                Obj::Dict(map) => {
                    let key = index.as_str().ok_or_else(|| self.runtime_err("dict key must be a string"))?;
                    map.borrow_mut().insert(Rc::from(key), value);
                    Ok(())
                }
                _ => {
                    Err(self.runtime_err(format!("'{}' does not support index assignment", target.type_name())))
                }
            },
            _ => Err(self.runtime_err(format!("'{}' does not support index assignment", target.type_name()))),
        }
    }

    // ---- iteration ----

    fn make_iterator(&self, source: Value) -> R<Value> {
        match &source {
            Value::Object(o) if matches!(o.as_ref(), Obj::Array(_) | Obj::Dict(_) | Obj::Range(_) | Obj::Str(_)) => {
                Ok(Value::array(vec![source, Value::Number(0.0)]))
            }
            _ => Err(self.runtime_err(format!("'{}' is not iterable", source.type_name()))),
        }
    }

    fn iterate_step(&self, source: &Value, idx: f64) -> R<Option<(Value, Value)>> {
        let i = idx as usize;
        match source {
            Value::Object(o) => match o.as_ref() {
                Obj::Array(items) => {
                    let items = items.borrow();
                    if i < items.len() { Ok(Some((Value::Number(idx), items[i].clone()))) } else { Ok(None) }
                }
                Obj::Str(s) => match s.chars().nth(i) {
                    Some(c) => Ok(Some((Value::Number(idx), Value::str(c.to_string())))),
                    None => Ok(None),
                },
                Obj::Dict(map) => match map.borrow().iter().nth(i) {
                    Some((k, v)) => Ok(Some((Value::str(k.clone()), v.clone()))),
                    None => Ok(None),
                },
                Obj::Range(r) => {
                    let value = r.start + idx * r.step;
                    let exhausted = if r.step >= 0.0 {
                        if r.inclusive { value > r.end } else { value >= r.end }
                    } else if r.inclusive {
                        value < r.end
                    } else {
                        value <= r.end
                    };
                    if exhausted { Ok(None) } else { Ok(Some((Value::Number(idx), Value::Number(value)))) }
                }
                _ => Err(self.runtime_err(format!("'{}' is not iterable", source.type_name()))),
            },
            _ => Err(self.runtime_err(format!("'{}' is not iterable", source.type_name()))),
        }
    }

    // ---- exception handling ----

    fn pop_frame_for_unwind(&mut self) {
        let frame = self.frames.pop().expect("no active call frame");
        self.close_upvalues_from(frame.stack_base);
        self.stack.truncate(frame.stack_base - 1);
    }

    /// Walks the handler stack outward from the most deeply nested `try`, popping
    /// frames as needed to reach the frame a handler belongs to, and jumps into its
    /// `catch` or `finally` clause. Never unwinds past `floor` — a `call_value`
    /// re-entry with no matching handler in range propagates the error back to Rust
    /// rather than popping frames that belong to an outer, unrelated call.
    fn handle_exception(&mut self, err: SkiffError, floor: usize) -> R<()> {
        let value = self.thrown.take().unwrap_or_else(|| Value::str(err.to_string()));
        loop {
            let handler = match self.handlers.last().copied() {
                Some(h) => h,
                None => return Err(err),
            };
            if handler.frame_depth > self.frames.len() {
                self.handlers.pop();
                continue;
            }
            if self.frames.len() > handler.frame_depth {
                if self.frames.len() <= floor {
                    return Err(err);
                }
                self.pop_frame_for_unwind();
                continue;
            }
            self.handlers.pop();
            if let Some(target) = handler.catch_target {
                self.stack.truncate(handler.stack_height);
                let slot = handler.stack_height + handler.catch_var_slot as usize;
                if self.stack.len() <= slot {
                    self.stack.resize(slot + 1, Value::Null);
                }
                self.stack[slot] = value;
                self.frame_mut().ip = target;
                return Ok(());
            } else if let Some(target) = handler.finally_target {
                self.stack.truncate(handler.stack_height);
                self.pending = Pending::Exception(value);
                self.frame_mut().ip = target;
                return Ok(());
            }
            // Neither clause present: not an actual handler, keep searching outward.
        }
    }

    // ---- modules ----

    fn import_module(&mut self, path: &str) -> R<Value> {
        if let Some(loaded) = self.modules.get(path) {
            return Ok(Value::Object(loaded.object.clone()));
        }
        let source = self.module_loader.load(path).map_err(|e| self.runtime_err(e))?;
        let proto = crate::compiler::Compiler::compile_module(&source).map_err(|e| self.runtime_err(e.to_string()))?;
        let env = Environment::new_child(&self.root);
        let exports = proto.exports.clone();
        let object = Rc::new(Obj::Module(ModuleObj {
            name: Rc::from(path),
            env: env.clone(),
            initialized: RefCell::new(false),
            exports,
        }));
        self.modules.begin_loading(Rc::from(path), LoadedModule { env: env.clone(), object: object.clone() });
        let function = FunctionObj { proto: Rc::new(proto), upvalues: Vec::new(), globals: env };
        let callee = Value::Object(Rc::new(Obj::Function(function)));
        self.stack.push(callee.clone());
        let base = self.stack.len() - 1;
        let frames_before = self.frames.len();
        self.push_call_frame(callee, 0, base, None)?;
        self.run(frames_before + 1)?;
        self.modules.finish_loading(path);
        if let Obj::Module(m) = object.as_ref() {
            *m.initialized.borrow_mut() = true;
        }
        Ok(Value::Object(object))
    }

    // ---- arithmetic ----

    fn numeric_binop(&self, a: &Value, b: &Value, op: &str) -> R<(f64, f64)> {
        match (a.as_number(), b.as_number()) {
            (Some(x), Some(y)) => Ok((x, y)),
            _ => Err(self.runtime_err(format!("'{op}' requires numbers, got {} and {}", a.type_name(), b.type_name()))),
        }
    }

    fn add_values(&self, a: Value, b: Value) -> R<Value> {
        match (&a, &b) {
            (Value::Number(x), Value::Number(y)) => Ok(Value::Number(x + y)),
            _ if a.as_str().is_some() || b.as_str().is_some() => {
                Ok(Value::str(format!("{}{}", to_display_string(&a), to_display_string(&b))))
            }
            _ => Err(self.runtime_err(format!("cannot add {} and {}", a.type_name(), b.type_name()))),
        }
    }

    fn compare(&self, a: &Value, b: &Value) -> R<std::cmp::Ordering> {
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => {
                x.partial_cmp(y).ok_or_else(|| self.runtime_err("cannot compare NaN"))
            }
            _ => match (a.as_str(), b.as_str()) {
                (Some(x), Some(y)) => Ok(x.cmp(y)),
                _ => Err(self.runtime_err(format!("cannot compare {} and {}", a.type_name(), b.type_name()))),
            },
        }
    }

    // ---- dispatch ----

    fn dispatch(&mut self) -> R<()> {
        self.last_line = self.proto().line_for_offset(self.frame().ip) as u32;
        let byte = self.read_u8();
        let op = OpCode::from_byte(byte).ok_or_else(|| self.runtime_err(format!("invalid opcode byte {byte}")))?;
        match op {
            OpCode::Pop => {
                self.pop();
            }
            OpCode::Dup => {
                let v = self.peek(0).clone();
                self.push(v);
            }
            OpCode::Dup2 => {
                let a = self.peek(1).clone();
                let b = self.peek(0).clone();
                self.push(a);
                self.push(b);
            }
            OpCode::Swap => {
                let len = self.stack.len();
                self.stack.swap(len - 1, len - 2);
            }
            OpCode::SwapUnder => {
                let len = self.stack.len();
                self.stack.swap(len - 1, len - 3);
            }
            OpCode::Rot3Under => {
                let len = self.stack.len();
                let top = self.stack.remove(len - 1);
                self.stack.insert(len - 3, top);
            }
            OpCode::Const => {
                let idx = self.read_u16();
                let c = self.const_at(idx);
                let v = self.value_from_constant(c);
                self.push(v);
            }
            OpCode::Null => self.push(Value::Null),
            OpCode::True => self.push(Value::Bool(true)),
            OpCode::False => self.push(Value::Bool(false)),
            OpCode::GetLocal => {
                let slot = self.read_u8();
                let base = self.frame().stack_base;
                self.push(self.stack[base + slot as usize].clone());
            }
            OpCode::SetLocal => {
                let slot = self.read_u8();
                let base = self.frame().stack_base;
                let value = self.peek(0).clone();
                self.stack[base + slot as usize] = value;
            }
            OpCode::GetGlobal => {
                let idx = self.read_u16();
                let name = self.const_name(idx);
                let globals = self.current_globals();
                let found = globals.borrow().get(&name);
                match found {
                    Some(v) => self.push(v),
                    None => {
                        let names: Vec<String> = globals.borrow().names().map(|n| n.to_string()).collect();
                        let suggestion =
                            crate::error::find_closest_match(&name, names.iter().map(|s| s.as_str()));
                        let msg = match suggestion {
                            Some(s) => format!("undefined variable '{name}' (did you mean '{s}'?)"),
                            None => format!("undefined variable '{name}'"),
                        };
                        return Err(self.runtime_err(msg));
                    }
                }
            }
            OpCode::SetGlobal => {
                let idx = self.read_u16();
                let name = self.const_name(idx);
                let value = self.peek(0).clone();
                let globals = self.current_globals();
                globals.borrow_mut().set(&name, value);
            }
            OpCode::DefineGlobal => {
                let idx = self.read_u16();
                let name = self.const_name(idx);
                let value = self.pop();
                self.current_globals().borrow_mut().define(name, value);
            }
            OpCode::DefineRootGlobal => {
                let idx = self.read_u16();
                let name = self.const_name(idx);
                let value = self.pop();
                self.root.borrow_mut().define(name, value);
            }
            OpCode::GetUpvalue => {
                let idx = self.read_u8();
                let up = match self.frame().function.as_ref() {
                    Obj::Function(f) => f.upvalues[idx as usize].clone(),
                    _ => unreachable!(),
                };
                let value = match &*up.state.borrow() {
                    UpvalueState::Open(i) => self.stack[*i].clone(),
                    UpvalueState::Closed(v) => v.clone(),
                };
                self.push(value);
            }
            OpCode::SetUpvalue => {
                let idx = self.read_u8();
                let value = self.peek(0).clone();
                let up = match self.frame().function.as_ref() {
                    Obj::Function(f) => f.upvalues[idx as usize].clone(),
                    _ => unreachable!(),
                };
                let open_index = match &*up.state.borrow() {
                    UpvalueState::Open(i) => Some(*i),
                    UpvalueState::Closed(_) => None,
                };
                match open_index {
                    Some(i) => self.stack[i] = value,
                    None => up.close(value),
                }
            }
            OpCode::CloseUpvalue => {
                let idx = self.stack.len() - 1;
                self.close_upvalues_from(idx);
                self.pop();
            }
            OpCode::Add => {
                let b = self.pop();
                let a = self.pop();
                let v = self.add_values(a, b)?;
                self.push(v);
            }
            OpCode::Sub => {
                let b = self.pop();
                let a = self.pop();
                let (x, y) = self.numeric_binop(&a, &b, "-")?;
                self.push(Value::Number(x - y));
            }
            OpCode::Mul => {
                let b = self.pop();
                let a = self.pop();
                let (x, y) = self.numeric_binop(&a, &b, "*")?;
                self.push(Value::Number(x * y));
            }
            OpCode::Div => {
                let b = self.pop();
                let a = self.pop();
                let (x, y) = self.numeric_binop(&a, &b, "/")?;
                self.push(Value::Number(x / y));
            }
            OpCode::Mod => {
                let b = self.pop();
                let a = self.pop();
                let (x, y) = self.numeric_binop(&a, &b, "%")?;
                self.push(Value::Number(x % y));
            }
            OpCode::Neg => {
                let a = self.pop();
                let n = a.as_number().ok_or_else(|| self.runtime_err(format!("cannot negate {}", a.type_name())))?;
                self.push(Value::Number(-n));
            }
            OpCode::BitAnd => {
                let b = self.pop();
                let a = self.pop();
                let (x, y) = self.numeric_binop(&a, &b, "&")?;
                self.push(Value::Number(((x as i64) & (y as i64)) as f64));
            }
            OpCode::BitOr => {
                let b = self.pop();
                let a = self.pop();
                let (x, y) = self.numeric_binop(&a, &b, "|")?;
                self.push(Value::Number(((x as i64) | (y as i64)) as f64));
            }
            OpCode::BitXor => {
                let b = self.pop();
                let a = self.pop();
                let (x, y) = self.numeric_binop(&a, &b, "^")?;
                self.push(Value::Number(((x as i64) ^ (y as i64)) as f64));
            }
            OpCode::BitNot => {
                let a = self.pop();
                let n = a.as_number().ok_or_else(|| self.runtime_err(format!("cannot apply '~' to {}", a.type_name())))?;
                self.push(Value::Number(!(n as i64) as f64));
            }
            OpCode::Shl => {
                let b = self.pop();
                let a = self.pop();
                let (x, y) = self.numeric_binop(&a, &b, "<<")?;
                self.push(Value::Number(((x as i64) << (y as i64 & 63)) as f64));
            }
            OpCode::Shr => {
                let b = self.pop();
                let a = self.pop();
                let (x, y) = self.numeric_binop(&a, &b, ">>")?;
                self.push(Value::Number(((x as i64) >> (y as i64 & 63)) as f64));
            }
            OpCode::Not => {
                let a = self.pop();
                self.push(Value::Bool(!a.is_truthy()));
            }
            OpCode::And | OpCode::Or => {
                return Err(self.runtime_err("reserved opcode (short-circuit '&&'/'||' compile to jumps, not this)"));
            }
            OpCode::Eq => {
                let b = self.pop();
                let a = self.pop();
                self.push(Value::Bool(a.values_equal(&b)));
            }
            OpCode::Ne => {
                let b = self.pop();
                let a = self.pop();
                self.push(Value::Bool(!a.values_equal(&b)));
            }
            OpCode::Lt => {
                let b = self.pop();
                let a = self.pop();
                let ord = self.compare(&a, &b)?;
                self.push(Value::Bool(ord == std::cmp::Ordering::Less));
            }
            OpCode::Le => {
                let b = self.pop();
                let a = self.pop();
                let ord = self.compare(&a, &b)?;
                self.push(Value::Bool(ord != std::cmp::Ordering::Greater));
            }
            OpCode::Gt => {
                let b = self.pop();
                let a = self.pop();
                let ord = self.compare(&a, &b)?;
                self.push(Value::Bool(ord == std::cmp::Ordering::Greater));
            }
            OpCode::Ge => {
                let b = self.pop();
                let a = self.pop();
                let ord = self.compare(&a, &b)?;
                self.push(Value::Bool(ord != std::cmp::Ordering::Less));
            }
            OpCode::Jump => {
                let off = self.read_i16();
                let ip = self.frame().ip as i64 + off as i64;
                self.frame_mut().ip = ip as usize;
            }
            OpCode::JumpIfFalse => {
                let off = self.read_i16();
                if !self.peek(0).is_truthy() {
                    let ip = self.frame().ip as i64 + off as i64;
                    self.frame_mut().ip = ip as usize;
                }
            }
            OpCode::JumpIfTrue => {
                let off = self.read_i16();
                if self.peek(0).is_truthy() {
                    let ip = self.frame().ip as i64 + off as i64;
                    self.frame_mut().ip = ip as usize;
                }
            }
            OpCode::JumpIfNotNull => {
                let off = self.read_i16();
                if !self.peek(0).is_null() {
                    let ip = self.frame().ip as i64 + off as i64;
                    self.frame_mut().ip = ip as usize;
                }
            }
            OpCode::Loop => {
                let dist = self.read_u16() as usize;
                let ip = self.frame().ip;
                self.frame_mut().ip = ip - dist;
            }
            OpCode::Call => {
                let argc = self.read_u8();
                let base = self.stack.len() - argc as usize - 1;
                let callee = self.stack[base].clone();
                self.invoke_callee(callee, argc, base)?;
            }
            OpCode::Return => {
                let result = self.pop();
                self.do_return(result);
            }
            OpCode::Closure => {
                let proto_idx = self.read_u16();
                let proto = match self.const_at(proto_idx) {
                    Constant::Function(p) => p,
                    _ => unreachable!("Closure operand must be a function constant"),
                };
                let upvalue_count = self.read_u8();
                let base = self.frame().stack_base;
                let mut upvalues = Vec::with_capacity(upvalue_count as usize);
                for _ in 0..upvalue_count {
                    let is_local = self.read_u8() != 0;
                    let index = self.read_u16();
                    if is_local {
                        upvalues.push(self.capture_upvalue(base + index as usize));
                    } else {
                        let up = match self.frame().function.as_ref() {
                            Obj::Function(f) => f.upvalues[index as usize].clone(),
                            _ => unreachable!(),
                        };
                        upvalues.push(up);
                    }
                }
                let globals = self.current_globals();
                self.push(Value::Object(Rc::new(Obj::Function(FunctionObj { proto, upvalues, globals }))));
            }
            OpCode::NewArray => {
                let n = self.read_u16() as usize;
                let items = self.stack.split_off(self.stack.len() - n);
                self.push(Value::array(items));
            }
            OpCode::NewObject => {
                self.push(Value::dict(OrderedMap::new()));
            }
            OpCode::GetField | OpCode::SetField => {
                return Err(self.runtime_err("reserved opcode (dot-access always compiles to GetProperty/SetProperty)"));
            }
            OpCode::GetIndex => {
                let index = self.pop();
                let target = self.pop();
                let value = self.get_index(&target, &index)?;
                self.push(value);
            }
            OpCode::SetIndex => {
                let value = self.pop();
                let index = self.pop();
                let target = self.pop();
                self.set_index(&target, &index, value.clone())?;
                self.push(value);
            }
            OpCode::Class => {
                let idx = self.read_u16();
                let name = self.const_name(idx);
                let cls = ClassObj {
                    name,
                    superclass: None,
                    methods: OrderedMap::new(),
                    static_methods: OrderedMap::new(),
                    static_fields: OrderedMap::new(),
                };
                self.push(Value::Object(Rc::new(Obj::Class(RefCell::new(cls)))));
            }
            OpCode::Inherit => {
                let superclass = self.pop();
                let class_val = self.peek(0).clone();
                match (&class_val, &superclass) {
                    (Value::Object(co), Value::Object(so)) => match (co.as_ref(), so.as_ref()) {
                        (Obj::Class(cls), Obj::Class(_)) => {
                            cls.borrow_mut().superclass = Some(so.clone());
                        }
                        _ => return Err(self.runtime_err("superclass must be a class")),
                    },
                    _ => return Err(self.runtime_err("superclass must be a class")),
                }
            }
            OpCode::Method => {
                let idx = self.read_u16();
                let name = self.const_name(idx);
                let method = self.pop();
                if let Value::Object(co) = self.peek(0) {
                    if let Obj::Class(cls) = co.as_ref() {
                        if let Value::Object(m) = method {
                            cls.borrow_mut().methods.insert(name, m);
                        }
                    }
                }
            }
            OpCode::StaticMethod => {
                let idx = self.read_u16();
                let name = self.const_name(idx);
                let method = self.pop();
                if let Value::Object(co) = self.peek(0) {
                    if let Obj::Class(cls) = co.as_ref() {
                        if let Value::Object(m) = method {
                            cls.borrow_mut().static_methods.insert(name, m);
                        }
                    }
                }
            }
            OpCode::StaticField => {
                let idx = self.read_u16();
                let name = self.const_name(idx);
                let value = self.pop();
                if let Value::Object(co) = self.peek(0) {
                    if let Obj::Class(cls) = co.as_ref() {
                        cls.borrow_mut().static_fields.insert(name, value);
                    }
                }
            }
            OpCode::GetProperty => {
                let idx = self.read_u16();
                let name = self.const_name(idx);
                let target = self.pop();
                let value = self.get_property(&target, &name)?;
                self.push(value);
            }
            OpCode::SetProperty => {
                let idx = self.read_u16();
                let name = self.const_name(idx);
                let value = self.pop();
                let target = self.pop();
                self.set_property(&target, &name, value.clone())?;
                self.push(value);
            }
            OpCode::GetSuper => {
                let idx = self.read_u16();
                let name = self.const_name(idx);
                let this = self.stack[self.frame().stack_base].clone();
                let superclass = self
                    .super_class_for(&this)
                    .ok_or_else(|| self.runtime_err("'super' used outside of a method with a superclass"))?;
                let method = self
                    .resolve_method_on(&Value::Object(superclass), &name)
                    .ok_or_else(|| self.runtime_err(format!("undefined property '{name}' on superclass")))?;
                self.push(Value::Object(Rc::new(Obj::BoundMethod(BoundMethodObj { receiver: this, method }))));
            }
            OpCode::Invoke => {
                let idx = self.read_u16();
                let name = self.const_name(idx);
                let argc = self.read_u8();
                let base = self.stack.len() - argc as usize - 1;
                self.invoke_method(&name, argc, base)?;
            }
            OpCode::SuperInvoke => {
                let idx = self.read_u16();
                let name = self.const_name(idx);
                let argc = self.read_u8();
                let this = self.stack[self.frame().stack_base].clone();
                let superclass = self
                    .super_class_for(&this)
                    .ok_or_else(|| self.runtime_err("'super' used outside of a method with a superclass"))?;
                let method = self
                    .resolve_method_on(&Value::Object(superclass), &name)
                    .ok_or_else(|| self.runtime_err(format!("undefined property '{name}' on superclass")))?;
                let args_start = self.stack.len() - argc as usize;
                self.stack.insert(args_start, Value::Null);
                self.call_bound(args_start, argc, Value::Object(method), this)?;
            }
            OpCode::Import => {
                let path_idx = self.read_u16();
                let _alias_idx = self.read_u16();
                let path = self.const_name(path_idx);
                let module_value = self.import_module(&path)?;
                self.push(module_value);
            }
            OpCode::This => {
                let base = self.frame().stack_base;
                self.push(self.stack[base].clone());
            }
            OpCode::BuildString => {
                let n = self.read_u16() as usize;
                let parts = self.stack.split_off(self.stack.len() - n);
                let mut s = String::new();
                for p in &parts {
                    s.push_str(&to_display_string(p));
                }
                self.push(Value::str(s));
            }
            OpCode::GetIter => {
                let source = self.pop();
                let iter = self.make_iterator(source)?;
                self.push(iter);
            }
            OpCode::ForIter | OpCode::ForIterKV => {
                return Err(self.runtime_err("reserved opcode (for-in always compiles to the *Local variants)"));
            }
            OpCode::ForIterLocal | OpCode::ForIterKVLocal => {
                let kv = op == OpCode::ForIterKVLocal;
                let iter_slot = self.read_u8();
                let exit_offset = self.read_i16();
                let base = self.frame().stack_base;
                let state_idx = base + iter_slot as usize;
                let (source, idx) = match &self.stack[state_idx] {
                    Value::Object(o) => match o.as_ref() {
                        Obj::Array(items) => {
                            let items = items.borrow();
                            (items[0].clone(), items[1].as_number().expect("iterator index slot must be a number"))
                        }
                        _ => return Err(self.runtime_err("internal: corrupt iterator state")),
                    },
                    _ => return Err(self.runtime_err("internal: corrupt iterator state")),
                };
                match self.iterate_step(&source, idx)? {
                    Some((key, value)) => {
                        if let Value::Object(o) = &self.stack[state_idx] {
                            if let Obj::Array(items) = o.as_ref() {
                                items.borrow_mut()[1] = Value::Number(idx + 1.0);
                            }
                        }
                        if kv {
                            self.push(key);
                            self.push(value);
                        } else {
                            let is_dict = matches!(&source, Value::Object(o) if matches!(o.as_ref(), Obj::Dict(_)));
                            self.push(if is_dict { key } else { value });
                        }
                    }
                    None => {
                        let ip = self.frame().ip as i64 + exit_offset as i64;
                        self.frame_mut().ip = ip as usize;
                    }
                }
            }
            OpCode::CloseIter => {
                let _slot = self.read_u8();
            }
            OpCode::SetupTry => {
                let catch_offset = self.read_u16();
                let finally_offset = self.read_u16();
                let catch_var_slot = self.read_u8();
                let ip_base = self.frame().ip;
                let catch_target = if catch_offset == 0xFFFF { None } else { Some(ip_base + catch_offset as usize) };
                let finally_target =
                    if finally_offset == 0xFFFF { None } else { Some(ip_base + finally_offset as usize) };
                self.handlers.push(Handler {
                    frame_depth: self.frames.len(),
                    catch_target,
                    finally_target,
                    catch_var_slot,
                    stack_height: self.stack.len(),
                });
            }
            OpCode::Throw => {
                let value = self.pop();
                self.thrown = Some(value);
                return Err(self.runtime_err("uncaught exception"));
            }
            OpCode::EndTry => {
                self.handlers.pop();
            }
            OpCode::EndFinally => {
                if let Pending::Exception(v) = std::mem::replace(&mut self.pending, Pending::None) {
                    self.thrown = Some(v);
                    return Err(self.runtime_err("uncaught exception"));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::Compiler;

    fn eval(src: &str) -> Value {
        let proto = Compiler::compile_eval_expr(src).expect("should compile");
        let mut vm = Vm::new();
        vm.interpret(Rc::new(proto)).expect("should run")
    }

    fn run_script(src: &str) -> Vm {
        let proto = Compiler::compile_script(src).expect("should compile");
        let mut vm = Vm::new();
        vm.interpret(Rc::new(proto)).expect("should run");
        vm
    }

    #[test]
    fn arithmetic_follows_precedence() {
        assert!(matches!(eval("1 + 2 * 3"), Value::Number(n) if n == 7.0));
    }

    #[test]
    fn recursive_factorial() {
        let vm = run_script(
            "func fact(n) { if (n <= 1) { return 1; } return n * fact(n - 1); } var result = fact(5);",
        );
        assert!(matches!(vm.get_global("result"), Some(Value::Number(n)) if n == 120.0));
    }

    #[test]
    fn closures_keep_independent_counters() {
        let vm = run_script(
            "func make_counter() { var n = 0; return func() { n = n + 1; return n; }; } \
             var a = make_counter(); var b = make_counter(); \
             a(); a(); var a_result = a(); var b_result = b();",
        );
        assert!(matches!(vm.get_global("a_result"), Some(Value::Number(n)) if n == 3.0));
        assert!(matches!(vm.get_global("b_result"), Some(Value::Number(n)) if n == 1.0));
    }

    #[test]
    fn class_inheritance_dispatches_through_super() {
        let vm = run_script(
            "class Animal { speak() { return \"...\"; } } \
             class Dog : Animal { speak() { return super.speak() + \"woof\"; } } \
             var result = Dog().speak();",
        );
        let result = vm.get_global("result").expect("result global");
        assert_eq!(to_display_string(&result), "...woof");
    }

    #[test]
    fn try_catch_finally_runs_in_order() {
        let vm = run_script(
            "var log = []; \
             try { push(log, \"try\"); throw \"boom\"; } \
             catch (e) { push(log, e); } \
             finally { push(log, \"finally\"); }",
        );
        let log = vm.get_global("log").expect("log global");
        assert_eq!(to_display_string(&log), "[\"try\", \"boom\", \"finally\"]");
    }

    #[test]
    fn for_in_over_dict_preserves_insertion_order_in_kv_form() {
        let vm = run_script(
            "var d = {}; d[\"b\"] = 2; d[\"a\"] = 1; var out = []; \
             for k, v in d { push(out, k); push(out, v); }",
        );
        let out = vm.get_global("out").expect("out global");
        assert_eq!(to_display_string(&out), "[\"b\", 2, \"a\", 1]");
    }
}
