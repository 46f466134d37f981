//! Wire types exchanged between the host and the worker.
//!
//! - **WorkCommand** (host → worker): what to call and with which arguments
//! - **WorkResult** (worker → host): the outcome, correlated by [`RequestId`]

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Correlates a command with its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(uuid::Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        let uuid = uuid::Uuid::parse_str(s)?;
        Ok(Self(uuid))
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Names a type that owns callable methods.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TypeRef {
    pub module: String,
    pub name: String,
}

impl TypeRef {
    pub fn new(module: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for TypeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.module.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}::{}", self.module, self.name)
        }
    }
}

/// A method addressed by declaring type, name, and optionally its parameter types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetDescriptor {
    #[serde(rename = "type")]
    pub type_ref: TypeRef,
    pub method: String,
    /// Used to pick between overloads. Arity alone is used when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub argument_types: Option<Vec<String>>,
}

impl TargetDescriptor {
    pub fn new(type_ref: TypeRef, method: impl Into<String>) -> Self {
        Self {
            type_ref,
            method: method.into(),
            argument_types: None,
        }
    }

    pub fn with_argument_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.argument_types = Some(types.into_iter().map(Into::into).collect());
        self
    }
}

impl std::fmt::Display for TargetDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.type_ref, self.method)
    }
}

/// Request to invoke a target with positional arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkCommand {
    pub id: RequestId,
    pub target: TargetDescriptor,
    #[serde(default)]
    pub arguments: Vec<Value>,
}

impl WorkCommand {
    /// Build a command from an argument tuple, e.g. `("a", 1)` or `(vec![1, 2],)`.
    ///
    /// Each tuple element is one argument; `()` means none.
    pub fn new<A: IntoArguments>(
        target: TargetDescriptor,
        args: A,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::from_values(target, args.into_values()?))
    }

    pub fn from_values(target: TargetDescriptor, arguments: Vec<Value>) -> Self {
        Self {
            id: RequestId::new(),
            target,
            arguments,
        }
    }
}

/// Positional arguments for [`WorkCommand::new`].
///
/// Implemented for `()` and tuples of up to ten serializable values.
pub trait IntoArguments {
    fn into_values(self) -> Result<Vec<Value>, serde_json::Error>;
}

impl IntoArguments for () {
    fn into_values(self) -> Result<Vec<Value>, serde_json::Error> {
        Ok(Vec::new())
    }
}

macro_rules! tuple_into_arguments {
    ($($ty:ident $val:ident),+) => {
        impl<$($ty: Serialize),+> IntoArguments for ($($ty,)+) {
            fn into_values(self) -> Result<Vec<Value>, serde_json::Error> {
                let ($($val,)+) = self;
                Ok(vec![$(serde_json::to_value($val)?),+])
            }
        }
    };
}

tuple_into_arguments!(A a);
tuple_into_arguments!(A a, B b);
tuple_into_arguments!(A a, B b, C c);
tuple_into_arguments!(A a, B b, C c, D d);
tuple_into_arguments!(A a, B b, C c, D d, E e);
tuple_into_arguments!(A a, B b, C c, D d, E e, F f);
tuple_into_arguments!(A a, B b, C c, D d, E e, F f, G g);
tuple_into_arguments!(A a, B b, C c, D d, E e, F f, G g, H h);
tuple_into_arguments!(A a, B b, C c, D d, E e, F f, G g, H h, I i);
tuple_into_arguments!(A a, B b, C c, D d, E e, F f, G g, H h, I i, J j);

/// Error raised by the remote call, carried back verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
}

impl RemoteError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            trace: None,
        }
    }

    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = Some(trace.into());
        self
    }
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for RemoteError {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    /// `value` is absent for calls that return nothing.
    Returned {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<Value>,
    },
    Failed {
        error: RemoteError,
    },
}

/// Outcome of one command, sent back under the command's id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkResult {
    pub id: RequestId,
    pub outcome: Outcome,
}

impl WorkResult {
    pub fn returned(id: RequestId, value: Option<Value>) -> Self {
        Self {
            id,
            outcome: Outcome::Returned { value },
        }
    }

    pub fn failed(id: RequestId, error: RemoteError) -> Self {
        Self {
            id,
            outcome: Outcome::Failed { error },
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, Outcome::Failed { .. })
    }

    pub fn into_value(self) -> Result<Option<Value>, RemoteError> {
        match self.outcome {
            Outcome::Returned { value } => Ok(value),
            Outcome::Failed { error } => Err(error),
        }
    }
}
