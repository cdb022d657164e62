// File: src/environment.rs
//
// Lexical environment: a name→value binding table with an optional parent, forming a
// chain rather than the teacher's scope-stack (`Vec<HashMap<String, Value>>` in
// `interpreter/environment.rs`). A parent-chain is what closures need: a closure can
// hold a reference to the exact `Environment` it was defined in without caring how many
// more scopes the enclosing function later pushes and pops (spec §3 "Environment").

use std::cell::RefCell;
use std::rc::Rc;

use crate::ordered_map::OrderedMap;
use crate::value::Value;

pub type EnvRef = Rc<RefCell<Environment>>;

#[derive(Debug)]
pub struct Environment {
    bindings: OrderedMap<Rc<str>, Value>,
    parent: Option<EnvRef>,
}

impl Environment {
    pub fn new_root() -> EnvRef {
        Rc::new(RefCell::new(Environment { bindings: OrderedMap::new(), parent: None }))
    }

    pub fn new_child(parent: &EnvRef) -> EnvRef {
        Rc::new(RefCell::new(Environment { bindings: OrderedMap::new(), parent: Some(parent.clone()) }))
    }

    /// Bind `name` in this environment, shadowing any binding of the same name in an
    /// enclosing environment.
    pub fn define(&mut self, name: Rc<str>, value: Value) {
        self.bindings.insert(name, value);
    }

    /// Look up `name`, walking outward through enclosing environments.
    pub fn get(&self, name: &str) -> Option<Value> {
        if let Some(key) = self.bindings.keys().find(|k| k.as_ref() == name) {
            let key = key.clone();
            return self.bindings.get(&key).cloned();
        }
        match &self.parent {
            Some(parent) => parent.borrow().get(name),
            None => None,
        }
    }

    /// Assign to an existing binding of `name`, walking outward until found; if no
    /// environment in the chain already binds `name`, defines it locally (in the
    /// environment `set` was originally called on) instead of failing — per spec §3,
    /// "`Set` walks up until the name is found (or defines locally if not)."
    pub fn set(&mut self, name: &str, value: Value) {
        if let Some(key) = self.bindings.keys().find(|k| k.as_ref() == name).cloned() {
            self.bindings.insert(key, value);
            return;
        }
        if self.set_in_ancestor(name, value.clone()) {
            return;
        }
        self.define(name.into(), value);
    }

    /// Assigns to `name` in the nearest ancestor that already binds it, without
    /// touching `self`. Returns `false` if no ancestor binds `name`.
    fn set_in_ancestor(&self, name: &str, value: Value) -> bool {
        match &self.parent {
            Some(parent) => {
                let mut parent = parent.borrow_mut();
                if let Some(key) = parent.bindings.keys().find(|k| k.as_ref() == name).cloned() {
                    parent.bindings.insert(key, value);
                    true
                } else {
                    parent.set_in_ancestor(name, value)
                }
            }
            None => false,
        }
    }

    pub fn contains_own(&self, name: &str) -> bool {
        self.bindings.keys().any(|k| k.as_ref() == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &Rc<str>> {
        self.bindings.keys()
    }
}

impl Clone for Environment {
    fn clone(&self) -> Self {
        Environment { bindings: self.bindings.clone(), parent: self.parent.clone() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_sees_parent_bindings() {
        let root = Environment::new_root();
        root.borrow_mut().define("x".into(), Value::Number(1.0));
        let child = Environment::new_child(&root);
        assert!(matches!(child.borrow().get("x"), Some(Value::Number(n)) if n == 1.0));
    }

    #[test]
    fn child_define_shadows_without_mutating_parent() {
        let root = Environment::new_root();
        root.borrow_mut().define("x".into(), Value::Number(1.0));
        let child = Environment::new_child(&root);
        child.borrow_mut().define("x".into(), Value::Number(2.0));
        assert!(matches!(child.borrow().get("x"), Some(Value::Number(n)) if n == 2.0));
        assert!(matches!(root.borrow().get("x"), Some(Value::Number(n)) if n == 1.0));
    }

    #[test]
    fn set_walks_outward_to_find_existing_binding() {
        let root = Environment::new_root();
        root.borrow_mut().define("x".into(), Value::Number(1.0));
        let child = Environment::new_child(&root);
        child.borrow_mut().set("x", Value::Number(9.0));
        assert!(matches!(root.borrow().get("x"), Some(Value::Number(n)) if n == 9.0));
        assert!(!child.borrow().contains_own("x"));
    }

    #[test]
    fn set_on_undefined_name_defines_it_locally() {
        let root = Environment::new_root();
        let child = Environment::new_child(&root);
        child.borrow_mut().set("missing", Value::Number(5.0));
        assert!(child.borrow().contains_own("missing"));
        assert!(root.borrow().get("missing").is_none());
    }
}
