//! Relay Scripting Bridge
//!
//! Request/response middleware for the gateway, written in JavaScript and run
//! inside an embedded QuickJS interpreter.
//!
//! ## Architecture
//!
//! - **Runtime:** one [`RuntimeHandle`] per process, shared by `Arc`; every
//!   entry into the engine holds its execution lock
//! - **Loader:** resolves the dispatcher class from a module on the search path
//! - **Dispatcher:** one script object per process, bound to the middleware
//!   directory, with its hook method resolved up front
//! - **Invoker:** `MessageBuffer` in, `MessageBuffer` out; hook faults are
//!   logged and degrade to an empty buffer
//! - **FFI:** a C ABI over [`Bridge`] for non-Rust gateways
//!
//! ```ignore
//! let bridge = Bridge::init(BridgeConfig::rooted_at("/srv/gateway"))?;
//! let reply = bridge.dispatch(MessageBuffer::new(request_bytes)?);
//! ```
//!
//! Log events are emitted under the `coprocess` target.

pub mod bridge;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod ffi;
pub mod gateway;
pub mod invoker;
pub mod loader;
pub mod message;
pub mod runtime;

pub use bridge::Bridge;
pub use config::{BridgeConfig, RuntimeConfig};
pub use dispatcher::Dispatcher;
pub use error::{BridgeError, ConfigError, ConstructError, InvocationFault, LoadError, RuntimeError};
pub use gateway::{GatewayEvent, GatewayServices, InMemoryServices};
pub use invoker::{DispatchOutcome, DispatchStats};
pub use loader::{load_dispatcher_type, DispatcherType};
pub use message::{MessageBuffer, MessageError};
pub use runtime::{RuntimeHandle, RuntimeState};

pub use rquickjs;

/// Name of the scripting backend this bridge embeds.
pub const COPROCESS_NAME: &str = "quickjs";

/// Bridge version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_set() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn bridge_types_cross_threads() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<RuntimeHandle>();
        assert_send_sync::<Dispatcher>();
        assert_send_sync::<Bridge>();
    }
}
