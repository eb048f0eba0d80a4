//! Provider side: method publication, request dispatch and the TCP listener.

pub mod dispatch;
pub mod listener;
pub mod methods;

pub use dispatch::Dispatcher;
pub use listener::{RpcServer, ServerConfig};
pub use methods::{
    Invoker, MethodArgs, MethodFuture, MethodKey, MethodRegistry, ServiceDefinition, return_type,
};
