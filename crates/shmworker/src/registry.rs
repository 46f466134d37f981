//! Addressable targets.
//!
//! Both sides hold the same [`MethodResolver`]: the host uses it to reject
//! unresolvable commands before anything crosses the channel, the worker to
//! find and invoke the callable.

use std::any::Any;
use std::collections::HashMap;
use std::fmt::{Debug, Display};
use std::marker::PhantomData;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::bridge::protocol::{RemoteError, TargetDescriptor, TypeRef};

/// A lazily constructed object whose instance methods the worker serves.
pub type HostedInstance = Box<dyn Any + Send>;

type StaticFn = dyn Fn(Vec<Value>) -> Result<Value, RemoteError> + Send + Sync;
type InstanceFn =
    dyn Fn(&mut (dyn Any + Send), Vec<Value>) -> Result<Value, RemoteError> + Send + Sync;
type Factory = dyn Fn() -> HostedInstance + Send + Sync;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    Static,
    /// Needs the hosted instance of its declaring type.
    Instance,
}

#[derive(Clone)]
enum Invoker {
    Static(Arc<StaticFn>),
    Instance(Arc<InstanceFn>),
}

/// A resolved callable.
#[derive(Clone)]
pub struct MethodHandle {
    type_ref: TypeRef,
    method: String,
    argument_types: Vec<&'static str>,
    invoker: Invoker,
}

impl MethodHandle {
    pub fn arity(&self) -> usize {
        self.argument_types.len()
    }

    pub fn kind(&self) -> MethodKind {
        match self.invoker {
            Invoker::Static(_) => MethodKind::Static,
            Invoker::Instance(_) => MethodKind::Instance,
        }
    }

    fn matches(&self, target: &TargetDescriptor, arity: usize) -> bool {
        if self.arity() != arity {
            return false;
        }
        match &target.argument_types {
            Some(types) => {
                types.len() == self.argument_types.len()
                    && types.iter().zip(&self.argument_types).all(|(a, b)| a == b)
            }
            None => true,
        }
    }
}

impl Debug for MethodHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodHandle")
            .field("type_ref", &self.type_ref)
            .field("method", &self.method)
            .field("argument_types", &self.argument_types)
            .field("kind", &self.kind())
            .finish()
    }
}

/// Resolves and invokes targets.
pub trait MethodResolver: Send + Sync {
    /// Find the callable a command with `arity` arguments would run.
    fn resolve(&self, target: &TargetDescriptor, arity: usize) -> Option<MethodHandle>;

    /// Construct the hosted instance for `type_ref`, if that type is hostable.
    fn create_instance(&self, type_ref: &TypeRef) -> Option<HostedInstance>;

    fn invoke(
        &self,
        handle: &MethodHandle,
        arguments: Vec<Value>,
        instance: Option<&mut HostedInstance>,
    ) -> Result<Value, RemoteError> {
        match &handle.invoker {
            Invoker::Static(call) => call(arguments),
            Invoker::Instance(call) => {
                let Some(instance) = instance else {
                    return Err(RemoteError::new(
                        "MissingInstance",
                        format!("{} requires a hosted instance", handle.type_ref),
                    ));
                };
                call(&mut **instance, arguments)
            }
        }
    }
}

/// Positional argument lists a registered function can take.
///
/// Implemented for `()` and tuples of up to ten deserializable values.
pub trait Arguments: Sized {
    fn type_names() -> Vec<&'static str>;
    fn from_values(values: Vec<Value>) -> Result<Self, serde_json::Error>;
}

impl Arguments for () {
    fn type_names() -> Vec<&'static str> {
        Vec::new()
    }

    fn from_values(_values: Vec<Value>) -> Result<Self, serde_json::Error> {
        Ok(())
    }
}

macro_rules! tuple_arguments {
    ($($ty:ident),+) => {
        impl<$($ty: DeserializeOwned),+> Arguments for ($($ty,)+) {
            fn type_names() -> Vec<&'static str> {
                vec![$(short_type_name::<$ty>()),+]
            }

            fn from_values(values: Vec<Value>) -> Result<Self, serde_json::Error> {
                serde_json::from_value(Value::Array(values))
            }
        }
    };
}

tuple_arguments!(A);
tuple_arguments!(A, B);
tuple_arguments!(A, B, C);
tuple_arguments!(A, B, C, D);
tuple_arguments!(A, B, C, D, E);
tuple_arguments!(A, B, C, D, E, F);
tuple_arguments!(A, B, C, D, E, F, G);
tuple_arguments!(A, B, C, D, E, F, G, H);
tuple_arguments!(A, B, C, D, E, F, G, H, I);
tuple_arguments!(A, B, C, D, E, F, G, H, I, J);

/// `alloc::string::String` → `String`. Generic types keep their full path.
pub fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    match full.find('<') {
        Some(_) => full,
        None => full.rsplit("::").next().unwrap_or(full),
    }
}

/// Closure-backed [`MethodResolver`].
///
/// ```ignore
/// let mut registry = Registry::new();
/// registry.register_fn(TypeRef::new("demo", "Text"), "append", |(p,): (String,)| {
///     Ok::<_, Infallible>(format!("Test123{p}"))
/// });
/// ```
#[derive(Default)]
pub struct Registry {
    methods: HashMap<(TypeRef, String), Vec<MethodHandle>>,
    factories: HashMap<TypeRef, Arc<Factory>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a free function. Overloads by arity or argument types are allowed.
    pub fn register_fn<A, R, E, F>(&mut self, type_ref: TypeRef, method: &str, f: F) -> &mut Self
    where
        A: Arguments + 'static,
        R: Serialize + 'static,
        E: Display + Debug + 'static,
        F: Fn(A) -> Result<R, E> + Send + Sync + 'static,
    {
        let call: Arc<StaticFn> = Arc::new(move |values: Vec<Value>| {
            let args = A::from_values(values).map_err(argument_error)?;
            let ret = f(args).map_err(|e| error_to_remote(&e))?;
            return_value(ret)
        });
        self.insert(type_ref, method, A::type_names(), Invoker::Static(call));
        self
    }

    /// Register a hostable type with its constructor. Methods are added on
    /// the returned builder.
    pub fn register_hosted<H, C>(&mut self, type_ref: TypeRef, ctor: C) -> HostedMethods<'_, H>
    where
        H: Send + 'static,
        C: Fn() -> H + Send + Sync + 'static,
    {
        let factory: Arc<Factory> = Arc::new(move || Box::new(ctor()) as HostedInstance);
        self.factories.insert(type_ref.clone(), factory);
        HostedMethods {
            registry: self,
            type_ref,
            _marker: PhantomData,
        }
    }

    pub fn is_hostable(&self, type_ref: &TypeRef) -> bool {
        self.factories.contains_key(type_ref)
    }

    fn insert(
        &mut self,
        type_ref: TypeRef,
        method: &str,
        argument_types: Vec<&'static str>,
        invoker: Invoker,
    ) {
        let handle = MethodHandle {
            type_ref: type_ref.clone(),
            method: method.to_string(),
            argument_types,
            invoker,
        };
        tracing::trace!(
            target_type = %type_ref,
            method,
            arity = handle.arity(),
            "Registered method"
        );
        self.methods
            .entry((type_ref, method.to_string()))
            .or_default()
            .push(handle);
    }
}

impl MethodResolver for Registry {
    fn resolve(&self, target: &TargetDescriptor, arity: usize) -> Option<MethodHandle> {
        self.methods
            .get(&(target.type_ref.clone(), target.method.clone()))?
            .iter()
            .find(|handle| handle.matches(target, arity))
            .cloned()
    }

    fn create_instance(&self, type_ref: &TypeRef) -> Option<HostedInstance> {
        self.factories.get(type_ref).map(|factory| factory())
    }
}

impl Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<String> = self
            .methods
            .keys()
            .map(|(t, m)| format!("{t}.{m}"))
            .collect();
        keys.sort();
        f.debug_struct("Registry")
            .field("methods", &keys)
            .field("hosted", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Adds instance methods to a hosted type.
pub struct HostedMethods<'a, H> {
    registry: &'a mut Registry,
    type_ref: TypeRef,
    _marker: PhantomData<fn(H)>,
}

impl<H: Send + 'static> HostedMethods<'_, H> {
    pub fn method<A, R, E, F>(self, name: &str, f: F) -> Self
    where
        A: Arguments + 'static,
        R: Serialize + 'static,
        E: Display + Debug + 'static,
        F: Fn(&mut H, A) -> Result<R, E> + Send + Sync + 'static,
    {
        let type_ref = self.type_ref.clone();
        let call: Arc<InstanceFn> = Arc::new(
            move |instance: &mut (dyn Any + Send), values: Vec<Value>| {
                let Some(this) = instance.downcast_mut::<H>() else {
                    return Err(RemoteError::new(
                        "InstanceMismatch",
                        format!("hosted instance is not a {type_ref}"),
                    ));
                };
                let args = A::from_values(values).map_err(argument_error)?;
                let ret = f(this, args).map_err(|e| error_to_remote(&e))?;
                return_value(ret)
            },
        );
        self.registry
            .insert(self.type_ref.clone(), name, A::type_names(), Invoker::Instance(call));
        self
    }

    /// Register a static function on the hosted type itself.
    pub fn function<A, R, E, F>(self, name: &str, f: F) -> Self
    where
        A: Arguments + 'static,
        R: Serialize + 'static,
        E: Display + Debug + 'static,
        F: Fn(A) -> Result<R, E> + Send + Sync + 'static,
    {
        let type_ref = self.type_ref.clone();
        self.registry.register_fn(type_ref, name, f);
        self
    }
}

fn argument_error(e: serde_json::Error) -> RemoteError {
    RemoteError::new("InvalidArguments", e.to_string())
}

fn return_value<R: Serialize>(ret: R) -> Result<Value, RemoteError> {
    serde_json::to_value(ret).map_err(|e| RemoteError::new("InvalidReturnValue", e.to_string()))
}

fn error_to_remote<E: Display + Debug>(e: &E) -> RemoteError {
    let message = e.to_string();
    let detail = format!("{e:?}");
    let error = RemoteError::new(short_type_name::<E>(), message.clone());
    if detail != message {
        error.with_trace(detail)
    } else {
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    #[derive(Debug, thiserror::Error)]
    #[error("{0}")]
    struct InvalidOperation(String);

    struct Counter {
        value: i64,
    }

    fn text() -> TypeRef {
        TypeRef::new("demo", "Text")
    }

    fn counter() -> TypeRef {
        TypeRef::new("demo", "Counter")
    }

    fn registry() -> Registry {
        let mut registry = Registry::new();
        registry
            .register_fn(text(), "append", |(p,): (String,)| {
                Ok::<_, Infallible>(format!("Test123{p}"))
            })
            .register_fn(text(), "append", |(a, b): (String, String)| {
                Ok::<_, Infallible>(format!("Test123{a}{b}"))
            })
            .register_fn(text(), "fail", |()| {
                Err::<(), _>(InvalidOperation("Remote Exception!".into()))
            });
        registry
            .register_hosted(counter(), || Counter { value: 1000 })
            .method("get", |this: &mut Counter, ()| Ok::<_, Infallible>(this.value))
            .method("set", |this: &mut Counter, (v,): (i64,)| {
                this.value = v;
                Ok::<_, Infallible>(())
            });
        registry
    }

    fn target(type_ref: TypeRef, method: &str) -> TargetDescriptor {
        TargetDescriptor::new(type_ref, method)
    }

    #[test]
    fn resolves_by_arity() {
        let registry = registry();
        let one = registry.resolve(&target(text(), "append"), 1).unwrap();
        let two = registry.resolve(&target(text(), "append"), 2).unwrap();
        assert_eq!(one.arity(), 1);
        assert_eq!(two.arity(), 2);
        assert!(registry.resolve(&target(text(), "append"), 3).is_none());
        assert!(registry.resolve(&target(text(), "missing"), 0).is_none());
        assert!(registry.resolve(&target(TypeRef::new("x", "Y"), "append"), 1).is_none());
    }

    #[test]
    fn argument_types_narrow_overloads() {
        let registry = registry();
        let typed = target(text(), "append").with_argument_types(["String"]);
        assert!(registry.resolve(&typed, 1).is_some());

        let wrong = target(text(), "append").with_argument_types(["i64"]);
        assert!(registry.resolve(&wrong, 1).is_none());
    }

    #[test]
    fn invokes_static_function() {
        let registry = registry();
        let handle = registry.resolve(&target(text(), "append"), 1).unwrap();
        assert_eq!(handle.kind(), MethodKind::Static);
        let value = registry
            .invoke(&handle, vec![serde_json::json!("1")], None)
            .unwrap();
        assert_eq!(value, serde_json::json!("Test1231"));
    }

    #[test]
    fn error_carries_kind_and_message() {
        let registry = registry();
        let handle = registry.resolve(&target(text(), "fail"), 0).unwrap();
        let err = registry.invoke(&handle, vec![], None).unwrap_err();
        assert_eq!(err.kind, "InvalidOperation");
        assert_eq!(err.message, "Remote Exception!");
    }

    #[test]
    fn bad_arguments_are_reported() {
        let registry = registry();
        let handle = registry.resolve(&target(text(), "append"), 1).unwrap();
        let err = registry
            .invoke(&handle, vec![serde_json::json!(42)], None)
            .unwrap_err();
        assert_eq!(err.kind, "InvalidArguments");
    }

    #[test]
    fn hosted_methods_share_one_instance() {
        let registry = registry();
        assert!(registry.is_hostable(&counter()));

        let mut instance = registry.create_instance(&counter()).unwrap();
        let get = registry.resolve(&target(counter(), "get"), 0).unwrap();
        let set = registry.resolve(&target(counter(), "set"), 1).unwrap();
        assert_eq!(get.kind(), MethodKind::Instance);

        let v = registry.invoke(&get, vec![], Some(&mut instance)).unwrap();
        assert_eq!(v, serde_json::json!(1000));

        let v = registry
            .invoke(&set, vec![serde_json::json!(5000)], Some(&mut instance))
            .unwrap();
        assert_eq!(v, Value::Null);

        let v = registry.invoke(&get, vec![], Some(&mut instance)).unwrap();
        assert_eq!(v, serde_json::json!(5000));
    }

    #[test]
    fn instance_method_without_instance_fails() {
        let registry = registry();
        let get = registry.resolve(&target(counter(), "get"), 0).unwrap();
        let err = registry.invoke(&get, vec![], None).unwrap_err();
        assert_eq!(err.kind, "MissingInstance");
    }

    #[test]
    fn wrong_instance_type_fails() {
        let registry = registry();
        let get = registry.resolve(&target(counter(), "get"), 0).unwrap();
        let mut wrong: HostedInstance = Box::new(String::from("not a counter"));
        let err = registry.invoke(&get, vec![], Some(&mut wrong)).unwrap_err();
        assert_eq!(err.kind, "InstanceMismatch");
    }

    #[test]
    fn short_type_names() {
        assert_eq!(short_type_name::<String>(), "String");
        assert_eq!(short_type_name::<i64>(), "i64");
        assert_eq!(short_type_name::<InvalidOperation>(), "InvalidOperation");
        assert_eq!(
            short_type_name::<Vec<String>>(),
            std::any::type_name::<Vec<String>>()
        );
    }

    #[test]
    fn ten_arguments_are_supported() {
        type Ten = (u8, u8, u8, u8, u8, u8, u8, u8, u8, u8);

        let mut registry = Registry::new();
        registry.register_fn(text(), "sum", |args: Ten| {
            let (a, b, c, d, e, f, g, h, i, j) = args;
            let total: u32 = [a, b, c, d, e, f, g, h, i, j].iter().map(|v| u32::from(*v)).sum();
            Ok::<_, Infallible>(total)
        });

        let handle = registry.resolve(&target(text(), "sum"), 10).unwrap();
        assert_eq!(handle.arity(), 10);
        let values = (1..=10).map(|v| serde_json::json!(v)).collect();
        let out = registry.invoke(&handle, values, None).unwrap();
        assert_eq!(out, serde_json::json!(55));
    }
}
