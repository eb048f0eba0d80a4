//! Method registry: typed invokers keyed by interface, method and signature.

use crate::address::ServiceKey;
use crate::protocol::RequestPayload;

use std::any::type_name;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Future returned by an invoker: the serialized return value or an error message.
pub type MethodFuture = BoxFuture<'static, Result<Value, String>>;

/// Type-erased method implementation.
pub type Invoker = Arc<dyn Fn(Vec<Value>) -> MethodFuture + Send + Sync>;

/// Identity of one callable method.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MethodKey {
    /// Interface name.
    pub interface: String,
    /// Method name.
    pub method: String,
    /// Parameter type descriptors, in order.
    pub parameter_types: Vec<String>,
}

impl MethodKey {
    /// Key a request payload resolves to.
    #[must_use]
    pub fn of(payload: &RequestPayload) -> Self {
        Self {
            interface: payload.interface_name.clone(),
            method: payload.method_name.clone(),
            parameter_types: payload.parameter_types.clone(),
        }
    }
}

impl fmt::Display for MethodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}({})",
            self.interface,
            self.method,
            self.parameter_types.join(", ")
        )
    }
}

/// Argument tuples that can cross the wire.
///
/// Implemented for tuples of up to four serde types; the descriptor of each
/// parameter is its Rust type name.
pub trait MethodArgs: Sized + Send + 'static {
    /// Descriptors of the tuple's element types.
    fn parameter_types() -> Vec<String>;

    /// Rebuild the tuple from wire values.
    ///
    /// # Errors
    ///
    /// Returns a message if the arity or a value's shape does not match.
    fn from_values(values: Vec<Value>) -> Result<Self, String>;

    /// Convert the tuple to wire values.
    ///
    /// # Errors
    ///
    /// Returns a message if a value cannot be serialized.
    fn into_values(self) -> Result<Vec<Value>, String>;
}

macro_rules! impl_method_args {
    ($count:expr $(, $name:ident)*) => {
        impl<$($name),*> MethodArgs for ($($name,)*)
        where
            $($name: Serialize + DeserializeOwned + Send + 'static,)*
        {
            fn parameter_types() -> Vec<String> {
                vec![$(type_name::<$name>().to_string()),*]
            }

            #[allow(non_snake_case, unused_mut, unused_variables)]
            fn from_values(values: Vec<Value>) -> Result<Self, String> {
                if values.len() != $count {
                    return Err(format!(
                        "expected {} arguments, got {}",
                        $count,
                        values.len()
                    ));
                }

                let mut values = values.into_iter();
                $(
                    let $name: $name = serde_json::from_value(values.next().unwrap_or_default())
                        .map_err(|e| format!("invalid argument: {e}"))?;
                )*

                Ok(($($name,)*))
            }

            #[allow(non_snake_case)]
            fn into_values(self) -> Result<Vec<Value>, String> {
                let ($($name,)*) = self;
                Ok(vec![$(
                    serde_json::to_value($name).map_err(|e| format!("invalid argument: {e}"))?
                ),*])
            }
        }
    };
}

impl_method_args!(0);
impl_method_args!(1, A);
impl_method_args!(2, A, B);
impl_method_args!(3, A, B, C);
impl_method_args!(4, A, B, C, D);

/// Descriptor of a return type.
#[must_use]
pub fn return_type<R>() -> String {
    type_name::<R>().to_string()
}

/// Every method published by this process.
#[derive(Clone, Default)]
pub struct MethodRegistry {
    methods: Arc<DashMap<MethodKey, Invoker>>,
}

impl MethodRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add every method of `service`.
    pub fn publish(&self, service: &ServiceDefinition) {
        for (key, invoker) in &service.methods {
            self.methods.insert(key.clone(), Arc::clone(invoker));
        }
    }

    /// Invoker for `payload`, if published.
    #[must_use]
    pub fn lookup(&self, payload: &RequestPayload) -> Option<Invoker> {
        self.methods
            .get(&MethodKey::of(payload))
            .map(|invoker| Arc::clone(&invoker))
    }

    /// Number of published methods.
    #[must_use]
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    /// Whether nothing is published.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

impl fmt::Debug for MethodRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<String> = self.methods.iter().map(|e| e.key().to_string()).collect();
        keys.sort();
        f.debug_struct("MethodRegistry").field("methods", &keys).finish()
    }
}

/// A service and its methods, ready to publish.
pub struct ServiceDefinition {
    key: ServiceKey,
    methods: Vec<(MethodKey, Invoker)>,
}

impl ServiceDefinition {
    /// Start a definition for `key`.
    #[must_use]
    pub const fn new(key: ServiceKey) -> Self {
        Self {
            key,
            methods: Vec::new(),
        }
    }

    /// Add an async method taking the argument tuple `A`.
    ///
    /// The handler's error is reported to the caller as an application error.
    #[must_use]
    pub fn method<A, R, E, F, Fut>(mut self, name: &str, handler: F) -> Self
    where
        A: MethodArgs,
        R: Serialize,
        E: fmt::Display,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
    {
        let key = MethodKey {
            interface: self.key.name().to_string(),
            method: name.to_string(),
            parameter_types: A::parameter_types(),
        };

        let handler = Arc::new(handler);
        let invoker: Invoker = Arc::new(move |values: Vec<Value>| {
            let handler = Arc::clone(&handler);
            async move {
                let args = A::from_values(values)?;
                let value = handler(args).await.map_err(|e| e.to_string())?;
                serde_json::to_value(value).map_err(|e| format!("unserializable result: {e}"))
            }
            .boxed()
        });

        self.methods.push((key, invoker));
        self
    }

    /// Service key.
    #[must_use]
    pub const fn key(&self) -> &ServiceKey {
        &self.key
    }

    /// Keys of the defined methods.
    pub fn method_keys(&self) -> impl Iterator<Item = &MethodKey> {
        self.methods.iter().map(|(key, _)| key)
    }
}

impl fmt::Debug for ServiceDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceDefinition")
            .field("key", &self.key)
            .field("methods", &self.method_keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::convert::Infallible;

    fn payload(method: &str, types: Vec<String>, values: Vec<Value>) -> RequestPayload {
        RequestPayload {
            interface_name: "Calculator".to_string(),
            method_name: method.to_string(),
            parameter_types: types,
            parameter_values: values,
            return_type: return_type::<i64>(),
        }
    }

    fn calculator() -> ServiceDefinition {
        ServiceDefinition::new(ServiceKey::new("Calculator"))
            .method("add", |(a, b): (i64, i64)| async move { Ok::<_, Infallible>(a + b) })
            .method("add", |(a, b, c): (i64, i64, i64)| async move {
                Ok::<_, Infallible>(a + b + c)
            })
            .method("div", |(a, b): (i64, i64)| async move {
                if b == 0 {
                    Err("division by zero")
                } else {
                    Ok(a / b)
                }
            })
    }

    #[tokio::test]
    async fn test_overloads_resolve_by_signature() {
        let registry = MethodRegistry::new();
        registry.publish(&calculator());
        assert_eq!(registry.len(), 3);

        let two = registry
            .lookup(&payload("add", <(i64, i64)>::parameter_types(), vec![]))
            .unwrap();
        assert_eq!(two(vec![json!(2), json!(3)]).await, Ok(json!(5)));

        let three = registry
            .lookup(&payload("add", <(i64, i64, i64)>::parameter_types(), vec![]))
            .unwrap();
        assert_eq!(three(vec![json!(1), json!(2), json!(3)]).await, Ok(json!(6)));

        assert!(
            registry
                .lookup(&payload("add", <(String,)>::parameter_types(), vec![]))
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_handler_errors_and_bad_arguments() {
        let registry = MethodRegistry::new();
        registry.publish(&calculator());
        let div = registry
            .lookup(&payload("div", <(i64, i64)>::parameter_types(), vec![]))
            .unwrap();

        assert_eq!(
            div(vec![json!(1), json!(0)]).await,
            Err("division by zero".to_string())
        );
        assert!(div(vec![json!(1)]).await.unwrap_err().contains("expected 2"));
        assert!(
            div(vec![json!("one"), json!(2)])
                .await
                .unwrap_err()
                .contains("invalid argument")
        );
    }

    #[test]
    fn test_args_to_values() {
        let values = ("hi".to_string(), 7u32).into_values().unwrap();
        assert_eq!(values, vec![json!("hi"), json!(7)]);
        assert!(<()>::parameter_types().is_empty());
        assert_eq!(<()>::from_values(vec![]), Ok(()));
    }
}
