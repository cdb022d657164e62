// File: src/intern.rs
//
// Per-thread short-string intern pool.
//
// Strings of at most `MAX_INTERNED_LEN` code units are content-addressed so that two
// textually-equal short strings produced anywhere in the same VM (the crate is
// single-threaded per DESIGN.md) compare equal by reference. Longer strings are never
// interned and always get a fresh heap allocation. This is the one piece of shared
// state the spec calls for (§5 "Shared resources" / §9 "Global process state"); it's
// `thread_local!`-backed rather than a `Mutex`-guarded `static` because the pool holds
// `Rc<Obj>`, which is neither `Send` nor `Sync`.

use std::cell::RefCell;
use std::collections::HashMap;

use crate::value::{Obj, ObjRef};

/// Strings at or under this length (in UTF-16-ish "code unit" terms, approximated here
/// as `char` count) are eligible for interning.
pub const MAX_INTERNED_LEN: usize = 64;

thread_local! {
    static INTERN_POOL: RefCell<HashMap<String, ObjRef>> = RefCell::new(HashMap::new());
}

/// Look up or create the canonical heap string object for `s`.
///
/// Strings longer than [`MAX_INTERNED_LEN`] always get a fresh, uninterned object so the
/// pool doesn't grow unbounded on large program-generated text.
pub fn intern(s: &str) -> ObjRef {
    if s.chars().count() > MAX_INTERNED_LEN {
        return ObjRef::new(Obj::Str(s.to_string().into()));
    }

    INTERN_POOL.with(|pool| {
        let mut pool = pool.borrow_mut();
        if let Some(existing) = pool.get(s) {
            return existing.clone();
        }
        let obj = ObjRef::new(Obj::Str(s.to_string().into()));
        pool.insert(s.to_string(), obj.clone());
        obj
    })
}

/// Clear the intern pool. Used by `Host::reset` and by tests that need isolation from
/// other tests' interned strings.
pub fn reset() {
    INTERN_POOL.with(|pool| pool.borrow_mut().clear());
}

/// Number of strings currently interned. Exposed for tests.
pub fn len() -> usize {
    INTERN_POOL.with(|pool| pool.borrow().len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_short_strings_share_identity() {
        let a = intern("hello");
        let b = intern("hello");
        assert!(ObjRef::ptr_eq(&a, &b));
    }

    #[test]
    fn long_strings_are_not_interned() {
        let long = "x".repeat(MAX_INTERNED_LEN + 1);
        let a = intern(&long);
        let b = intern(&long);
        assert!(!ObjRef::ptr_eq(&a, &b));
    }

    #[test]
    fn distinct_content_is_distinct_identity() {
        let a = intern("foo");
        let b = intern("bar");
        assert!(!ObjRef::ptr_eq(&a, &b));
    }
}
