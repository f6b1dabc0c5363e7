use std::sync::Arc;
use std::time::Duration;

use morphwire::LinkType;

use crate::dispatch::register_standard;
use crate::error::Error;
use crate::error::Result;
use crate::params::InstanceFactories;
use crate::registry::LinkAction;
use crate::registry::LinkRegistry;
use crate::registry::ReadFn;
use crate::runtime::Config;
use crate::runtime::Runtime;
use crate::service::ServiceDef;
use crate::tcp::TcpConnector;
use crate::transport::Connector;

/// Assembles a [`Runtime`]. Registration errors are collected and reported by
/// [`RuntimeBuilder::build`].
pub struct RuntimeBuilder {
    config: Config,
    registry: LinkRegistry,
    factories: InstanceFactories,
    connector: Arc<dyn Connector>,
    services: Vec<ServiceDef>,
    errors: Vec<Error>,
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        let mut registry = LinkRegistry::new();
        let mut errors = Vec::new();
        if let Err(e) = register_standard(&mut registry) {
            errors.push(e);
        }
        Self {
            config: Config::default(),
            registry,
            factories: InstanceFactories::default(),
            connector: Arc::new(TcpConnector),
            services: Vec::new(),
            errors,
        }
    }

    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.config.call_timeout = timeout;
        self
    }

    pub fn sequence_timeout(mut self, timeout: Duration) -> Self {
        self.config.sequence_timeout = timeout;
        self
    }

    pub fn action_concurrency(mut self, limit: usize) -> Self {
        self.config.action_concurrency = limit;
        self
    }

    /// Overrides the handshake version. Peers must match it exactly.
    pub fn version(mut self, major: u8, minor: u8) -> Self {
        self.config.version = (major, minor);
        self
    }

    /// Instance factories used by proxies created with `via_*`.
    pub fn factories(mut self, factories: InstanceFactories) -> Self {
        self.factories = factories;
        self
    }

    pub fn connector(mut self, connector: impl Connector) -> Self {
        self.connector = Arc::new(connector);
        self
    }

    /// Adds a reader and an action for a link type the runtime does not know.
    pub fn link_type(mut self, link_type: LinkType, reader: ReadFn, action: Arc<dyn LinkAction>) -> Self {
        if let Err(e) = self.registry.register(link_type, reader, action) {
            self.errors.push(e);
        }
        self
    }

    pub fn service(mut self, def: ServiceDef) -> Self {
        self.services.push(def);
        self
    }

    pub fn build(self) -> Result<Runtime> {
        if let Some(first) = self.errors.into_iter().next() {
            return Err(first);
        }
        if self.config.action_concurrency == 0 {
            return Err(Error::usage("Action concurrency must be at least 1"));
        }
        let LinkRegistry { readers, actions } = self.registry;
        let runtime = Runtime::from_parts(self.config, readers, actions, self.factories, self.connector);
        for def in self.services {
            runtime.register_service(def)?;
        }
        Ok(runtime)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::Link;
    use crate::object::ObjectBuilder;

    #[tokio::test]
    async fn test_defaults() {
        let runtime = RuntimeBuilder::new().build().unwrap();
        assert_eq!(runtime.config().call_timeout, Duration::from_secs(60));
        assert_eq!(runtime.config().sequence_timeout, Duration::from_secs(5));
        assert_eq!(runtime.config().version, (1, 1));
    }

    #[tokio::test]
    async fn test_duplicate_link_type_fails_at_build() {
        fn read(_: &mut morphwire::Reader<'_>, _: morphwire::LinkByte, _: &Arc<crate::registry::LinkReaders>) -> Result<Link> {
            Ok(Link::End)
        }
        struct Nothing;
        #[async_trait::async_trait]
        impl LinkAction for Nothing {
            async fn act(&self, _: &Runtime, _: &mut crate::dispatch::Walk, _: Link) -> Result<crate::dispatch::Step> {
                Ok(crate::dispatch::Step::Stop)
            }
        }
        let err = RuntimeBuilder::new().link_type(LinkType::Data, read, Arc::new(Nothing)).build().unwrap_err();
        assert!(matches!(err, Error::Usage(_)));
    }

    #[tokio::test]
    async fn test_services_registered_at_build() {
        let object = ObjectBuilder::new().method("ping", |_| Ok(crate::params::Value::Null)).build();
        let runtime = RuntimeBuilder::new()
            .service(ServiceDef::shared("Ping", object.clone()))
            .build()
            .unwrap();
        assert_eq!(runtime.apartment_count(), 1);

        let err = RuntimeBuilder::new()
            .service(ServiceDef::shared("Ping", object.clone()))
            .service(ServiceDef::shared("ping", object))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Usage(_)));
    }
}
