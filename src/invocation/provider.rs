//! Invocation providers and the context handed to their methods.

use crate::error::InvocationError;
use crate::state::omgr::{ObjectView, OmgrHandle};
use replicad_proto::{DEvent, DObject, E_INTERNAL_ERROR, Oid, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// What a method wants done after it returns.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Respond now with these arguments.
    Done(Vec<Value>),
    /// The method kept a [`Responder`] and will answer later.
    Deferred,
    /// No response is sent.
    NoReply,
}

impl Reply {
    pub fn empty() -> Self {
        Reply::Done(Vec::new())
    }
}

/// Signature of a provider method. Runs on the object manager loop.
pub type Handler =
    Arc<dyn Fn(&mut InvocationContext<'_>, &[Value]) -> Result<Reply, InvocationError> + Send + Sync>;

pub(crate) struct Method {
    pub(crate) verb: Arc<str>,
    pub(crate) handler: Handler,
}

/// Server-side implementation of one invocation module.
pub struct Provider {
    module: String,
    methods: HashMap<u32, Method>,
}

impl Provider {
    pub fn builder(module: impl Into<String>) -> ProviderBuilder {
        ProviderBuilder {
            module: module.into(),
            methods: HashMap::new(),
        }
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn verb(&self, method: u32) -> Option<&str> {
        self.methods.get(&method).map(|m| &*m.verb)
    }

    pub(crate) fn method(&self, method: u32) -> Option<&Method> {
        self.methods.get(&method)
    }
}

impl std::fmt::Debug for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut verbs: Vec<_> = self.methods.iter().map(|(id, m)| (*id, &*m.verb)).collect();
        verbs.sort_unstable();
        f.debug_struct("Provider")
            .field("module", &self.module)
            .field("methods", &verbs)
            .finish()
    }
}

/// Builder for the method table of a [`Provider`].
pub struct ProviderBuilder {
    module: String,
    methods: HashMap<u32, Method>,
}

impl ProviderBuilder {
    /// Adds method `id`. `verb` names the response (`<Verb>`) and the
    /// failure response (`<Verb>Failed`).
    pub fn method<F>(mut self, id: u32, verb: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&mut InvocationContext<'_>, &[Value]) -> Result<Reply, InvocationError>
            + Send
            + Sync
            + 'static,
    {
        let verb: String = verb.into();
        let previous = self.methods.insert(
            id,
            Method {
                verb: Arc::from(verb.as_str()),
                handler: Arc::new(handler),
            },
        );
        if previous.is_some() {
            warn!(module = %self.module, method = id, verb = %verb, "Method id registered twice, keeping the last");
        }
        self
    }

    pub fn build(self) -> Provider {
        Provider {
            module: self.module,
            methods: self.methods,
        }
    }
}

/// Everything a method may look at while it runs.
pub struct InvocationContext<'a> {
    pub(crate) caller: &'a DObject,
    pub(crate) objects: ObjectView<'a>,
    pub(crate) omgr: &'a OmgrHandle,
    pub(crate) responder: Responder,
}

impl<'a> InvocationContext<'a> {
    /// The calling client's object.
    pub fn caller(&self) -> &'a DObject {
        self.caller
    }

    pub fn caller_oid(&self) -> Oid {
        self.caller.oid()
    }

    pub fn objects(&self) -> ObjectView<'a> {
        self.objects
    }

    pub fn omgr(&self) -> &'a OmgrHandle {
        self.omgr
    }

    /// A responder for answering later. Pair with [`Reply::Deferred`].
    pub fn responder(&self) -> Responder {
        self.responder.clone()
    }
}

/// Sends the response to one request. Usable from any thread.
///
/// Requests without a request id get no response; failures for them are
/// only logged.
#[derive(Clone)]
pub struct Responder {
    omgr: OmgrHandle,
    client: Oid,
    request_id: Option<u32>,
    verb: Arc<str>,
}

impl Responder {
    pub(crate) fn new(omgr: OmgrHandle, client: Oid, request_id: Option<u32>, verb: Arc<str>) -> Self {
        Self {
            omgr,
            client,
            request_id,
            verb,
        }
    }

    pub fn client(&self) -> Oid {
        self.client
    }

    pub fn request_id(&self) -> Option<u32> {
        self.request_id
    }

    /// Sends the `<Verb>` response.
    pub fn respond(self, args: Vec<Value>) {
        let Some(request_id) = self.request_id else {
            debug!(client = self.client, verb = %self.verb, "No request id, response suppressed");
            return;
        };
        self.omgr.post_event(DEvent::invocation_response(
            self.client,
            request_id,
            &*self.verb,
            args,
        ));
    }

    /// Sends the `<Verb>Failed` response carrying `cause`.
    pub fn fail(self, cause: impl Into<String>) {
        let cause = cause.into();
        let Some(request_id) = self.request_id else {
            warn!(client = self.client, verb = %self.verb, cause = %cause, "Invocation failed");
            return;
        };
        self.omgr.post_event(DEvent::invocation_response(
            self.client,
            request_id,
            format!("{}Failed", self.verb),
            vec![Value::Str(cause)],
        ));
    }

    /// Logs `err` and sends the generic internal error code.
    pub fn internal_error(self, err: anyhow::Error) {
        error!(client = self.client, verb = %self.verb, error = ?err, "Invocation choked");
        self.fail(E_INTERNAL_ERROR);
    }
}

impl std::fmt::Debug for Responder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Responder")
            .field("client", &self.client)
            .field("request_id", &self.request_id)
            .field("verb", &self.verb)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_records_verbs() {
        let provider = Provider::builder("chat")
            .method(1, "Speak", |_ctx, _args| Ok(Reply::NoReply))
            .method(2, "Whisper", |_ctx, _args| Ok(Reply::empty()))
            .build();
        assert_eq!(provider.module(), "chat");
        assert_eq!(provider.verb(1), Some("Speak"));
        assert_eq!(provider.verb(2), Some("Whisper"));
        assert_eq!(provider.verb(3), None);
    }

    #[test]
    fn later_registration_wins() {
        let provider = Provider::builder("chat")
            .method(1, "Speak", |_ctx, _args| Ok(Reply::NoReply))
            .method(1, "Shout", |_ctx, _args| Ok(Reply::NoReply))
            .build();
        assert_eq!(provider.verb(1), Some("Shout"));
    }
}
