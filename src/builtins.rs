// File: src/builtins.rs
//
// Global native functions installed into every VM's root environment (spec §4.5
// "Standard surface"): array/dict/string utilities, math, and `print`/`type_of`
// introspection. Grounded on `rufflang-ruff/src/builtins.rs` for the function-per-
// math-op naming convention (`abs`, `sqrt`, `pow`, ...), with the out-of-scope
// standard-library surface (JSON, JWT, filesystem, process, time) dropped — the
// specification's Non-goals exclude a general-purpose stdlib, only the core data
// operations the language itself needs to be usable.

use std::rc::Rc;

use crate::error::SkiffError;
use crate::value::{to_display_string, Obj, RangeObj, Value};
use crate::vm::Vm;

fn arg_err(name: &str, message: impl Into<String>) -> SkiffError {
    SkiffError::runtime(format!("{name}(): {}", message.into()))
}

/// Installs every built-in global function into `vm`'s root environment. Called
/// once from `Vm::new`.
pub fn install(vm: &mut Vm) {
    macro_rules! native {
        ($name:expr, $arity:expr, $body:expr) => {
            vm.register_native($name, $arity, Rc::new($body));
        };
    }

    native!("print", None, |_vm: &mut Vm, args: &[Value]| {
        let rendered: Vec<String> = args.iter().map(to_display_string).collect();
        println!("{}", rendered.join(" "));
        Ok(Value::Null)
    });

    native!("type_of", Some(1), |_vm: &mut Vm, args: &[Value]| Ok(Value::str(args[0].type_name())));

    native!("str", Some(1), |_vm: &mut Vm, args: &[Value]| Ok(Value::str(to_display_string(&args[0]))));

    native!("number", Some(1), |_vm: &mut Vm, args: &[Value]| match &args[0] {
        Value::Number(n) => Ok(Value::Number(*n)),
        Value::Object(o) => match o.as_ref() {
            Obj::Str(s) => s
                .trim()
                .parse::<f64>()
                .map(Value::Number)
                .map_err(|_| arg_err("number", format!("cannot parse '{s}' as a number"))),
            _ => Err(arg_err("number", format!("cannot convert {} to a number", args[0].type_name()))),
        },
        Value::Bool(b) => Ok(Value::Number(if *b { 1.0 } else { 0.0 })),
        Value::Null => Err(arg_err("number", "cannot convert null to a number")),
    });

    native!("len", Some(1), |_vm: &mut Vm, args: &[Value]| match &args[0] {
        Value::Object(o) => match o.as_ref() {
            Obj::Array(items) => Ok(Value::Number(items.borrow().len() as f64)),
            Obj::Str(s) => Ok(Value::Number(s.chars().count() as f64)),
            Obj::Dict(map) => Ok(Value::Number(map.borrow().len() as f64)),
            _ => Err(arg_err("len", format!("{} has no length", args[0].type_name()))),
        },
        _ => Err(arg_err("len", format!("{} has no length", args[0].type_name()))),
    });

    native!("push", Some(2), |_vm: &mut Vm, args: &[Value]| match &args[0] {
        Value::Object(o) => match o.as_ref() {
            Obj::Array(items) => {
                items.borrow_mut().push(args[1].clone());
                Ok(args[0].clone())
            }
            _ => Err(arg_err("push", "first argument must be an array")),
        },
        _ => Err(arg_err("push", "first argument must be an array")),
    });

    native!("pop", Some(1), |_vm: &mut Vm, args: &[Value]| match &args[0] {
        Value::Object(o) => match o.as_ref() {
            Obj::Array(items) => items.borrow_mut().pop().ok_or_else(|| arg_err("pop", "array is empty")),
            _ => Err(arg_err("pop", "argument must be an array")),
        },
        _ => Err(arg_err("pop", "argument must be an array")),
    });

    native!("keys", Some(1), |_vm: &mut Vm, args: &[Value]| match &args[0] {
        Value::Object(o) => match o.as_ref() {
            Obj::Dict(map) => Ok(Value::array(map.borrow().keys().map(|k| Value::str(k.clone())).collect())),
            _ => Err(arg_err("keys", "argument must be a dict")),
        },
        _ => Err(arg_err("keys", "argument must be a dict")),
    });

    native!("values", Some(1), |_vm: &mut Vm, args: &[Value]| match &args[0] {
        Value::Object(o) => match o.as_ref() {
            Obj::Dict(map) => Ok(Value::array(map.borrow().iter().map(|(_, v)| v.clone()).collect())),
            _ => Err(arg_err("values", "argument must be a dict")),
        },
        _ => Err(arg_err("values", "argument must be a dict")),
    });

    native!("has_key", Some(2), |_vm: &mut Vm, args: &[Value]| match (&args[0], &args[1]) {
        (Value::Object(o), key) => match o.as_ref() {
            Obj::Dict(map) => {
                let k = key.as_str().ok_or_else(|| arg_err("has_key", "key must be a string"))?;
                Ok(Value::Bool(map.borrow().contains_key(&Rc::from(k))))
            }
            _ => Err(arg_err("has_key", "first argument must be a dict")),
        },
        _ => Err(arg_err("has_key", "first argument must be a dict")),
    });

    native!("range", None, |_vm: &mut Vm, args: &[Value]| {
        let (start, end, step) = match args.len() {
            1 => (0.0, args[0].as_number().ok_or_else(|| arg_err("range", "arguments must be numbers"))?, 1.0),
            2 => (
                args[0].as_number().ok_or_else(|| arg_err("range", "arguments must be numbers"))?,
                args[1].as_number().ok_or_else(|| arg_err("range", "arguments must be numbers"))?,
                1.0,
            ),
            3 => (
                args[0].as_number().ok_or_else(|| arg_err("range", "arguments must be numbers"))?,
                args[1].as_number().ok_or_else(|| arg_err("range", "arguments must be numbers"))?,
                args[2].as_number().ok_or_else(|| arg_err("range", "arguments must be numbers"))?,
            ),
            n => return Err(arg_err("range", format!("expected 1 to 3 arguments, got {n}"))),
        };
        Ok(Value::Object(Rc::new(Obj::Range(RangeObj { start, end, step, inclusive: false }))))
    });

    native!("split", Some(2), |_vm: &mut Vm, args: &[Value]| {
        let s = args[0].as_str().ok_or_else(|| arg_err("split", "first argument must be a string"))?;
        let sep = args[1].as_str().ok_or_else(|| arg_err("split", "second argument must be a string"))?;
        let parts: Vec<Value> = if sep.is_empty() {
            s.chars().map(|c| Value::str(c.to_string())).collect()
        } else {
            s.split(sep).map(Value::str).collect()
        };
        Ok(Value::array(parts))
    });

    native!("upper", Some(1), |_vm: &mut Vm, args: &[Value]| {
        let s = args[0].as_str().ok_or_else(|| arg_err("upper", "argument must be a string"))?;
        Ok(Value::str(s.to_uppercase()))
    });

    native!("lower", Some(1), |_vm: &mut Vm, args: &[Value]| {
        let s = args[0].as_str().ok_or_else(|| arg_err("lower", "argument must be a string"))?;
        Ok(Value::str(s.to_lowercase()))
    });

    native!("trim", Some(1), |_vm: &mut Vm, args: &[Value]| {
        let s = args[0].as_str().ok_or_else(|| arg_err("trim", "argument must be a string"))?;
        Ok(Value::str(s.trim().to_string()))
    });

    native!("abs", Some(1), |_vm: &mut Vm, args: &[Value]| {
        let n = args[0].as_number().ok_or_else(|| arg_err("abs", "argument must be a number"))?;
        Ok(Value::Number(n.abs()))
    });

    native!("sqrt", Some(1), |_vm: &mut Vm, args: &[Value]| {
        let n = args[0].as_number().ok_or_else(|| arg_err("sqrt", "argument must be a number"))?;
        Ok(Value::Number(n.sqrt()))
    });

    native!("pow", Some(2), |_vm: &mut Vm, args: &[Value]| {
        let base = args[0].as_number().ok_or_else(|| arg_err("pow", "arguments must be numbers"))?;
        let exp = args[1].as_number().ok_or_else(|| arg_err("pow", "arguments must be numbers"))?;
        Ok(Value::Number(base.powf(exp)))
    });

    native!("floor", Some(1), |_vm: &mut Vm, args: &[Value]| {
        let n = args[0].as_number().ok_or_else(|| arg_err("floor", "argument must be a number"))?;
        Ok(Value::Number(n.floor()))
    });

    native!("ceil", Some(1), |_vm: &mut Vm, args: &[Value]| {
        let n = args[0].as_number().ok_or_else(|| arg_err("ceil", "argument must be a number"))?;
        Ok(Value::Number(n.ceil()))
    });

    native!("round", Some(1), |_vm: &mut Vm, args: &[Value]| {
        let n = args[0].as_number().ok_or_else(|| arg_err("round", "argument must be a number"))?;
        Ok(Value::Number(n.round()))
    });

    native!("min", Some(2), |_vm: &mut Vm, args: &[Value]| {
        let a = args[0].as_number().ok_or_else(|| arg_err("min", "arguments must be numbers"))?;
        let b = args[1].as_number().ok_or_else(|| arg_err("min", "arguments must be numbers"))?;
        Ok(Value::Number(a.min(b)))
    });

    native!("max", Some(2), |_vm: &mut Vm, args: &[Value]| {
        let a = args[0].as_number().ok_or_else(|| arg_err("max", "arguments must be numbers"))?;
        let b = args[1].as_number().ok_or_else(|| arg_err("max", "arguments must be numbers"))?;
        Ok(Value::Number(a.max(b)))
    });

    vm.define_global("PI", Value::Number(std::f64::consts::PI));
    vm.define_global("E", Value::Number(std::f64::consts::E));
}
