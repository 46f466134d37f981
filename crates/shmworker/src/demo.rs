//! Targets served by the `shmworker-demo` binary.
//!
//! The host and the worker must register the same targets, so both sides
//! build their resolver from [`registry`].

use std::convert::Infallible;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bridge::protocol::TypeRef;
use crate::registry::Registry;

pub const MODULE: &str = "shmworker_demo";

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct InvalidOperation(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Color {
    Red,
    Green,
    Blue,
}

/// State held by the hosted `Counter` instance.
#[derive(Debug)]
pub struct Counter {
    value: i64,
}

impl Default for Counter {
    fn default() -> Self {
        Self { value: 1000 }
    }
}

/// Static functions.
pub fn text() -> TypeRef {
    TypeRef::new(MODULE, "Text")
}

/// The hostable type.
pub fn counter() -> TypeRef {
    TypeRef::new(MODULE, "Counter")
}

pub fn registry() -> Registry {
    let mut registry = Registry::new();
    registry
        .register_fn(text(), "append", |(p,): (String,)| {
            Ok::<_, Infallible>(format!("Test123{p}"))
        })
        .register_fn(text(), "concat", |(a, b): (String, String)| {
            Ok::<_, Infallible>(format!("{a}{b}"))
        })
        .register_fn(text(), "fail", |()| {
            Err::<(), _>(InvalidOperation("Remote Exception!".to_string()))
        })
        .register_fn(text(), "next_color", |(color,): (Color,)| {
            Ok::<_, Infallible>(match color {
                Color::Red => Color::Green,
                Color::Green => Color::Blue,
                Color::Blue => Color::Red,
            })
        })
        .register_fn(text(), "sleep", |(ms,): (u64,)| {
            thread::sleep(Duration::from_millis(ms));
            Ok::<_, Infallible>(())
        })
        .register_fn(text(), "pid", |()| Ok::<_, Infallible>(std::process::id()))
        .register_fn(text(), "exit", |(code,): (i32,)| -> Result<(), Infallible> {
            tracing::warn!(code, "Exiting on request");
            std::process::exit(code)
        });

    registry
        .register_hosted(counter(), Counter::default)
        .method("get", |c: &mut Counter, ()| Ok::<_, Infallible>(c.value))
        .method("set", |c: &mut Counter, (value,): (i64,)| {
            c.value = value;
            Ok::<_, Infallible>(())
        });

    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::TargetDescriptor;
    use crate::registry::MethodResolver;

    #[test]
    fn colors_travel_by_name() {
        let registry = registry();
        let handle = registry
            .resolve(&TargetDescriptor::new(text(), "next_color"), 1)
            .unwrap();
        let out = registry
            .invoke(&handle, vec![serde_json::json!("Blue")], None)
            .unwrap();
        assert_eq!(out, serde_json::json!("Red"));
    }

    #[test]
    fn every_target_resolves() {
        let registry = registry();
        for (method, arity) in [
            ("append", 1),
            ("concat", 2),
            ("fail", 0),
            ("next_color", 1),
            ("sleep", 1),
            ("pid", 0),
            ("exit", 1),
        ] {
            let target = TargetDescriptor::new(text(), method);
            assert!(registry.resolve(&target, arity).is_some(), "{method}");
        }
        assert!(registry.is_hostable(&counter()));
    }
}
