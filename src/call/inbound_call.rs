use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{RpcError, RpcResult};
use crate::message::arguments::ArgumentList;
use crate::message::rpc_message::{CallId, RpcMessage};
use crate::message::value::RpcValue;
use crate::method::method_def::{MethodDef, ShapeResolution};
use crate::peer::rpc_peer::RpcPeer;
use crate::util::result_cell::ResultCell;

/// What a method implementation gets to see of the call it serves
#[derive(Clone)]
pub struct InboundContext {
    pub peer: Arc<RpcPeer>,
    pub message: RpcMessage,
    pub method: Arc<MethodDef>,
    /// fires when the caller cancels the call or the peer changes
    pub cancellation: CancellationToken,
}

/// The callee side of a single call
pub struct InboundCall {
    /// 0 for no-wait calls, the caller's call id otherwise
    pub id: CallId,
    pub context: InboundContext,
    /// arguments that are used instead of deserializing the message, for synthesized calls
    preset_arguments: Option<ArgumentList>,
    process_lock: Mutex<()>,
    invocation_started: AtomicBool,
    result: ResultCell<RpcResult<RpcValue>>,
    processed: ResultCell<Option<RpcResult<RpcValue>>>,
}

impl InboundCall {
    pub fn new(peer: Arc<RpcPeer>, message: RpcMessage, method: Arc<MethodDef>, preset_arguments: Option<ArgumentList>) -> Arc<InboundCall> {
        let (id, cancellation) = if method.no_wait {
            (0, peer.peer_changed_token())
        }
        else {
            (message.related_id, peer.peer_changed_token().child_token())
        };

        Arc::new(InboundCall {
            id,
            context: InboundContext {
                peer,
                message,
                method,
                cancellation,
            },
            preset_arguments,
            process_lock: Mutex::new(()),
            invocation_started: AtomicBool::new(false),
            result: ResultCell::new(),
            processed: ResultCell::new(),
        })
    }

    pub fn result(&self) -> Option<RpcResult<RpcValue>> {
        self.result.get()
    }

    /// Called when the caller does not need the result any more
    pub fn cancel(&self) {
        trace!(call = ?self, "cancelled by caller");
        self.context.cancellation.cancel();
    }

    /// Processes the call and sends its result. Returns the result, or `None` for calls that have
    ///  no result (no-wait calls, and messages that turned out to be stale).
    ///
    /// A tracked call that is delivered again while the first delivery is in progress does not
    ///  invoke the method again: it observes the first delivery's outcome.
    pub async fn process(self: &Arc<Self>) -> Option<RpcResult<RpcValue>> {
        if self.context.method.no_wait {
            self.process_no_wait().await;
            return None;
        }
        if self.invocation_started.load(Ordering::Acquire) {
            return self.processed.wait().await;
        }

        let registered = self.context.peer.inbound_calls.get_or_register(self);
        if !Arc::ptr_eq(&registered, self) {
            debug!(call = ?self, "call is already being processed");
            return registered.processed.wait().await;
        }

        let arguments = {
            let _lock = self.process_lock.lock().await;
            if self.invocation_started.swap(true, Ordering::AcqRel) {
                drop(_lock);
                return self.processed.wait().await;
            }

            match self.deserialize_arguments() {
                Ok(Some(arguments)) => Ok(arguments),
                Ok(None) => {
                    trace!(call = ?self, "ignored");
                    self.context.peer.inbound_calls.unregister(self);
                    self.processed.try_set(None);
                    return None;
                }
                Err(e) => Err(e),
            }
        };

        let result = match arguments {
            Ok(arguments) => {
                tokio::select! {
                    r = self.invoke(arguments) => r,
                    _ = self.context.cancellation.cancelled() => Err(RpcError::Cancelled),
                }
            }
            Err(e) => Err(e),
        };
        self.result.try_set(result);
        self.complete().await
    }

    async fn process_no_wait(&self) {
        match self.deserialize_arguments() {
            Ok(Some(arguments)) => {
                if let Err(e) = self.invoke(arguments).await {
                    if !e.is_cancellation() {
                        warn!(call = ?self, "no-wait call failed: {}", e);
                    }
                }
            }
            Ok(None) => trace!(call = ?self, "ignored"),
            Err(e) if self.context.method.is_call_result => {
                debug!(call = ?self, "call result can not be deserialized: {}", e);
                self.fail_related_call(e).await;
            }
            Err(e) => warn!(call = ?self, "no-wait call can not be deserialized: {}", e),
        }
    }

    /// Reports a result deserialization failure through the regular `Error` path, so the related
    ///  outbound call gets a typed error
    async fn fail_related_call(&self, error: RpcError) {
        let system_calls = &self.context.peer.hub.system_calls;
        let context = InboundContext {
            method: system_calls.error_method().clone(),
            ..self.context.clone()
        };
        if let Some(invoker) = &context.method.invoker {
            let arguments = ArgumentList::new(vec![RpcValue::Error(error.to_info())]);
            if let Err(e) = invoker.invoke(&context, arguments).await {
                warn!(call = ?self, "failed to report deserialization error: {}", e);
            }
        }
    }

    async fn complete(self: &Arc<Self>) -> Option<RpcResult<RpcValue>> {
        let result = self.result.wait().await;
        {
            let _lock = self.process_lock.lock().await;
            self.context.peer.inbound_calls.unregister(self);
        }

        if self.context.cancellation.is_cancelled() {
            trace!(call = ?self, "not sending result of cancelled call");
        }
        else {
            self.context.peer.hub.system_calls.complete(&self.context.peer, self, &result).await;
        }
        self.processed.try_set(Some(result.clone()));
        Some(result)
    }

    fn deserialize_arguments(&self) -> RpcResult<Option<ArgumentList>> {
        let method = &self.context.method;
        let mut arguments = match &self.preset_arguments {
            Some(preset) => preset.clone(),
            None => {
                let resolved;
                let shape = match &method.shape_resolver {
                    Some(resolver) => match resolver.resolve(method, &self.context) {
                        ShapeResolution::Shape(shape) => {
                            resolved = shape;
                            &resolved
                        }
                        ShapeResolution::Ignore => return Ok(None),
                    },
                    None => &method.argument_shape,
                };
                self.context.peer.hub.serializer
                    .deserialize(&self.context.message.argument_data, shape, method.has_polymorphic_arguments)
                    .map_err(|e| RpcError::Deserialization(format!("{:#}", e)))?
            }
        };

        if let Some(index) = method.cancellation_index {
            arguments.insert(index, RpcValue::Cancellation(self.context.cancellation.clone()))
                .map_err(|e| RpcError::Deserialization(format!("{:#}", e)))?;
        }
        Ok(Some(arguments))
    }

    async fn invoke(&self, arguments: ArgumentList) -> RpcResult<RpcValue> {
        match &self.context.method.invoker {
            Some(invoker) => invoker.invoke(&self.context, arguments).await,
            None => Err(RpcError::EndpointNotFound {
                service: self.context.method.service().to_string(),
                method: self.context.method.name().to_string(),
            }),
        }
    }
}

impl Debug for InboundCall {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{} {:?} @ {:?}", self.id, self.context.method, self.context.peer.peer_ref)
    }
}
