// Integration tests exercising the `Host` embedding facade end-to-end: running
// whole scripts, evaluating bare expressions, classes/exceptions/iteration, host
// callbacks, and module imports through a custom in-memory loader.

use skiff::host::Host;
use skiff::module::ModuleLoader;
use skiff::value::{to_display_string, Value};

fn display(host: &Host, name: &str) -> String {
    to_display_string(&host.get_global(name).unwrap_or(Value::Null))
}

#[test]
fn runs_a_script_and_exposes_globals() {
    let mut host = Host::new();
    host.run(
        "var total = 0; \
         for i in range(1, 5) { total = total + i; }",
    )
    .unwrap();
    assert_eq!(display(&host, "total"), "10");
}

#[test]
fn eval_computes_bare_expression() {
    let mut host = Host::new();
    let result = host.eval("(2 + 3) * 4").unwrap();
    assert!(matches!(result, Value::Number(n) if n == 20.0));
}

#[test]
fn classes_support_inheritance_and_fields() {
    let mut host = Host::new();
    host.run(
        "class Shape { \
             Shape(name) { this.name = name; } \
             describe() { return this.name; } \
         } \
         class Circle : Shape { \
             Circle(radius) { super.Shape(\"circle\"); this.radius = radius; } \
             area() { return 3.14159 * this.radius * this.radius; } \
         } \
         var c = Circle(2); \
         var label = c.describe(); \
         var area = c.area();",
    )
    .unwrap();
    assert_eq!(display(&host, "label"), "\"circle\"");
    match host.get_global("area") {
        Some(Value::Number(n)) => assert!((n - 12.56636).abs() < 1e-6),
        other => panic!("expected a number, got {other:?}"),
    }
}

#[test]
fn exceptions_propagate_through_nested_calls_until_caught() {
    let mut host = Host::new();
    host.run(
        "func risky() { throw \"nope\"; } \
         func wrapper() { risky(); } \
         var caught = null; \
         try { wrapper(); } catch (e) { caught = e; }",
    )
    .unwrap();
    assert_eq!(display(&host, "caught"), "\"nope\"");
}

#[test]
fn array_and_dict_builtins_are_free_functions() {
    let mut host = Host::new();
    host.run(
        "var arr = []; \
         push(arr, 1); push(arr, 2); push(arr, 3); \
         var total = 0; \
         for v in arr { total = total + v; } \
         var d = {}; d[\"x\"] = 10; \
         var has_x = has_key(d, \"x\");",
    )
    .unwrap();
    assert_eq!(display(&host, "total"), "6");
    assert!(matches!(host.get_global("has_x"), Some(Value::Bool(true))));
}

#[test]
fn runtime_error_surfaces_through_host_run() {
    let mut host = Host::new();
    let err = host.run("var x = 1 + \"two\";").unwrap_err();
    assert!(!err.to_string().is_empty());
}

#[test]
fn host_can_register_a_native_callback_called_from_script() {
    let mut host = Host::new();
    host.register_fn2("add", |a: f64, b: f64| a + b);
    let result = host.eval("add(19, 23)").unwrap();
    assert!(matches!(result, Value::Number(n) if n == 42.0));
}

#[test]
fn host_reset_clears_prior_script_state() {
    let mut host = Host::new();
    host.run("var counter = 99;").unwrap();
    assert!(host.get_global("counter").is_some());
    host.reset();
    assert!(host.get_global("counter").is_none());
}

struct InMemoryLoader {
    files: Vec<(String, String)>,
}

impl ModuleLoader for InMemoryLoader {
    fn load(&mut self, path: &str) -> Result<String, String> {
        self.files
            .iter()
            .find(|(name, _)| name == path)
            .map(|(_, src)| src.clone())
            .ok_or_else(|| format!("no such module: {path}"))
    }
}

#[test]
fn modules_load_through_a_custom_loader_and_expose_exports() {
    let mut host = Host::new();
    host.set_module_loader(Box::new(InMemoryLoader {
        files: vec![("math_helpers".to_string(), "export func square(n) { return n * n; }".to_string())],
    }));
    host.run(
        "import \"math_helpers\" as math; \
         var nine = math.square(3);",
    )
    .unwrap();
    assert_eq!(display(&host, "nine"), "9");
}
