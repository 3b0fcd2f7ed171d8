use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

use crate::call::inbound_call::InboundContext;
use crate::config::CallTimeouts;
use crate::error::RpcResult;
use crate::message::arguments::{ArgumentList, ArgumentShape};
use crate::message::rpc_message::MethodRef;
use crate::message::value::RpcValue;

/// The server-side target of a method
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MethodInvoker: Send + Sync {
    async fn invoke(&self, context: &InboundContext, arguments: ArgumentList) -> RpcResult<RpcValue>;
}

pub enum ShapeResolution {
    Shape(ArgumentShape),
    /// the call this message refers to is gone, the message is dropped
    Ignore,
}

/// The polymorphism hook: services whose argument kinds depend on runtime state (stream items,
///  call results) provide this to pick the concrete argument shape for an inbound message.
pub trait ArgumentShapeResolver: Send + Sync {
    fn resolve(&self, method: &MethodDef, context: &InboundContext) -> ShapeResolution;
}

pub struct MethodDef {
    pub method_ref: MethodRef,
    /// the arguments as they travel over the wire, i.e. without the cancellation slot
    pub argument_shape: ArgumentShape,
    /// position of the cancellation token in the local argument list, if the method has one
    pub cancellation_index: Option<usize>,
    /// fire-and-forget: no id, no result, never tracked
    pub no_wait: bool,
    pub is_system: bool,
    /// `Ok`-like system methods whose deserialization failure must fail the related outbound call
    pub is_call_result: bool,
    pub has_polymorphic_arguments: bool,
    pub has_polymorphic_result: bool,
    pub timeouts: CallTimeouts,
    pub invoker: Option<Arc<dyn MethodInvoker>>,
    pub(crate) shape_resolver: Option<Arc<dyn ArgumentShapeResolver>>,
}

impl MethodDef {
    pub fn new(service: &str, method: &str, argument_shape: ArgumentShape) -> MethodDef {
        MethodDef {
            method_ref: MethodRef::new(service, method),
            argument_shape,
            cancellation_index: None,
            no_wait: false,
            is_system: false,
            is_call_result: false,
            has_polymorphic_arguments: false,
            has_polymorphic_result: false,
            timeouts: CallTimeouts::none(),
            invoker: None,
            shape_resolver: None,
        }
    }

    pub fn with_no_wait(mut self) -> MethodDef {
        self.no_wait = true;
        self
    }

    pub fn with_cancellation_index(mut self, index: usize) -> MethodDef {
        self.cancellation_index = Some(index);
        self
    }

    pub fn with_timeouts(mut self, timeouts: CallTimeouts) -> MethodDef {
        self.timeouts = timeouts;
        self
    }

    pub fn with_polymorphic_arguments(mut self) -> MethodDef {
        self.has_polymorphic_arguments = true;
        self
    }

    pub fn with_polymorphic_result(mut self) -> MethodDef {
        self.has_polymorphic_result = true;
        self
    }

    pub fn with_invoker(mut self, invoker: Arc<dyn MethodInvoker>) -> MethodDef {
        self.invoker = Some(invoker);
        self
    }

    pub(crate) fn as_system(mut self, is_call_result: bool) -> MethodDef {
        self.is_system = true;
        self.is_call_result = is_call_result;
        self
    }

    pub fn service(&self) -> &str {
        &self.method_ref.service
    }

    pub fn name(&self) -> &str {
        &self.method_ref.method
    }
}

impl Debug for MethodDef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.method_ref)?;
        if self.no_wait {
            write!(f, "(no wait)")?;
        }
        Ok(())
    }
}
