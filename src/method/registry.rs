use std::collections::hash_map::Entry;
use std::sync::Arc;

use anyhow::bail;
use rustc_hash::FxHashMap;

use crate::message::rpc_message::MethodRef;
use crate::method::method_def::{ArgumentShapeResolver, MethodDef};

pub struct ServiceDef {
    pub name: String,
    methods: FxHashMap<String, MethodDef>,
    shape_resolver: Option<Arc<dyn ArgumentShapeResolver>>,
}

impl ServiceDef {
    pub fn new(name: &str) -> ServiceDef {
        ServiceDef {
            name: name.to_string(),
            methods: Default::default(),
            shape_resolver: None,
        }
    }

    /// The method's service name is overwritten with this service's name
    pub fn with_method(mut self, mut method: MethodDef) -> ServiceDef {
        method.method_ref.service = self.name.clone();
        self.methods.insert(method.method_ref.method.clone(), method);
        self
    }

    pub fn with_shape_resolver(mut self, resolver: Arc<dyn ArgumentShapeResolver>) -> ServiceDef {
        self.shape_resolver = Some(resolver);
        self
    }
}

/// Resolves method refs of inbound messages to their definitions. Shape resolvers of polymorphic
///  methods are attached to the method definitions when the service is added, so they are looked
///  up once per method rather than per message.
#[derive(Default)]
pub struct ServiceRegistry {
    methods: FxHashMap<MethodRef, Arc<MethodDef>>,
    services: FxHashMap<String, Vec<MethodRef>>,
}

impl ServiceRegistry {
    pub fn new() -> ServiceRegistry {
        ServiceRegistry::default()
    }

    pub fn add(&mut self, service: ServiceDef) -> anyhow::Result<()> {
        match self.services.entry(service.name.clone()) {
            Entry::Occupied(_) => bail!("service {} is already registered", service.name),
            Entry::Vacant(e) => {
                let refs = e.insert(Vec::new());
                for (_, mut method) in service.methods {
                    if method.has_polymorphic_arguments {
                        method.shape_resolver = service.shape_resolver.clone();
                    }
                    refs.push(method.method_ref.clone());
                    self.methods.insert(method.method_ref.clone(), Arc::new(method));
                }
            }
        }
        Ok(())
    }

    pub fn with(mut self, service: ServiceDef) -> anyhow::Result<ServiceRegistry> {
        self.add(service)?;
        Ok(self)
    }

    pub fn method(&self, method_ref: &MethodRef) -> Option<Arc<MethodDef>> {
        self.methods.get(method_ref).cloned()
    }

    pub fn service_methods(&self, service: &str) -> Vec<Arc<MethodDef>> {
        self.services.get(service)
            .map(|refs| refs.iter()
                .filter_map(|r| self.methods.get(r).cloned())
                .collect())
            .unwrap_or_default()
    }
}
