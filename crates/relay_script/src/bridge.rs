//! Bridge startup
//!
//! Wires the pieces together in the order the gateway expects: publish the
//! search path, bring the interpreter up, resolve the dispatcher type, build
//! the dispatcher. Any failure aborts startup so the gateway fails closed
//! instead of silently skipping middleware.

use crate::config::BridgeConfig;
use crate::dispatcher::Dispatcher;
use crate::error::BridgeError;
use crate::gateway::{GatewayServices, InMemoryServices};
use crate::invoker::{DispatchOutcome, DispatchStats};
use crate::loader::{load_dispatcher_type, DispatcherType};
use crate::message::MessageBuffer;
use crate::runtime::RuntimeHandle;
use std::sync::Arc;

pub struct Bridge {
    // Declared first: dispatcher handles are released before the type's.
    dispatcher: Dispatcher,
    dispatcher_type: DispatcherType,
    config: BridgeConfig,
}

impl Bridge {
    pub fn init(config: BridgeConfig) -> Result<Self, BridgeError> {
        Self::init_with_services(config, Arc::new(InMemoryServices::new()))
    }

    pub fn init_with_services(
        config: BridgeConfig,
        services: Arc<dyn GatewayServices>,
    ) -> Result<Self, BridgeError> {
        Self::start(&config, services)
            .map(|(dispatcher, dispatcher_type)| Self {
                dispatcher,
                dispatcher_type,
                config,
            })
            .inspect_err(|err| {
                tracing::error!(target: "coprocess", error = %err, "Bridge startup aborted");
            })
    }

    fn start(
        config: &BridgeConfig,
        services: Arc<dyn GatewayServices>,
    ) -> Result<(Dispatcher, DispatcherType), BridgeError> {
        let mut runtime = RuntimeHandle::with_services(config.runtime_config()?, services);
        runtime.initialize()?;
        let runtime = Arc::new(runtime);

        let dispatcher_type =
            load_dispatcher_type(&runtime, &config.module_name, &config.class_name)?;

        let middleware_path = config.resolved_middleware_path()?;
        let dispatcher = Dispatcher::new(
            &dispatcher_type,
            &middleware_path.to_string_lossy(),
            &config.hook_name,
        )?;

        Ok((dispatcher, dispatcher_type))
    }

    pub fn dispatch(&self, input: MessageBuffer) -> MessageBuffer {
        self.dispatcher.dispatch(input)
    }

    pub fn invoke(&self, input: &MessageBuffer) -> DispatchOutcome {
        self.dispatcher.invoke(input)
    }

    pub fn stats(&self) -> DispatchStats {
        self.dispatcher.stats()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn dispatcher_type(&self) -> &DispatcherType {
        &self.dispatcher_type
    }

    pub fn runtime(&self) -> &Arc<RuntimeHandle> {
        self.dispatcher.runtime()
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }
}
