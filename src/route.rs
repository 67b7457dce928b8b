//! Route mux: matches inbound requests to handlers by operation kind and
//! per-kind predicates, in registration order.

use crate::cancel;
use crate::message::Message;
use crate::proto::{OpKind, ProtocolOp, SearchScope, OID_CANCEL, RESULT_UNWILLING_TO_PERFORM};
use crate::response::{new_response, ResponseWriter};
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;

/// Type-erased async handler.
pub type HandlerFn = Arc<dyn Fn(ResponseWriter, Arc<Message>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Anything callable as `async fn(ResponseWriter, Arc<Message>)`.
pub trait IntoHandler {
    fn into_handler(self) -> HandlerFn;
}

impl<F, Fut> IntoHandler for F
where
    F: Fn(ResponseWriter, Arc<Message>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn into_handler(self) -> HandlerFn {
        Arc::new(move |w, m| Box::pin(self(w, m)))
    }
}

/// One registered route: an operation kind, optional refinement predicates
/// and the handler to invoke.
pub struct Route {
    kind: OpKind,
    handler: HandlerFn,
    label: Option<String>,
    // Extended predicate
    request_name: Option<String>,
    // Search predicates
    search_base_dn: Option<String>,
    search_scope: Option<SearchScope>,
    search_filter: Option<String>,
}

impl Route {
    fn new(kind: OpKind, handler: HandlerFn) -> Self {
        Self {
            kind,
            handler,
            label: None,
            request_name: None,
            search_base_dn: None,
            search_scope: None,
            search_filter: None,
        }
    }

    /// Restrict a Search route to an exact `baseObject`. Comparison is
    /// byte-exact; no DN normalization is applied.
    pub fn base_dn(&mut self, dn: &str) -> &mut Self {
        self.search_base_dn = Some(dn.to_string());
        self
    }

    /// Restrict a Search route to one scope.
    pub fn scope(&mut self, scope: SearchScope) -> &mut Self {
        self.search_scope = Some(scope);
        self
    }

    /// Restrict a Search route to requests whose filter stringifies to this
    /// exact literal, e.g. `"(objectclass=*)"`.
    pub fn filter(&mut self, pattern: &str) -> &mut Self {
        self.search_filter = Some(pattern.to_string());
        self
    }

    /// Restrict an Extended route to one requestName OID.
    pub fn request_name(&mut self, oid: &str) -> &mut Self {
        self.request_name = Some(oid.to_string());
        self
    }

    /// Attach a label used in dispatch logs.
    pub fn label(&mut self, label: &str) -> &mut Self {
        self.label = Some(label.to_string());
        self
    }

    /// True when the message's kind and every declared predicate match.
    /// Predicates never partially match.
    fn matches(&self, m: &Message) -> bool {
        if m.kind() != self.kind {
            return false;
        }
        match m.protocol_op() {
            ProtocolOp::ExtendedRequest(r) => {
                if let Some(ref want) = self.request_name {
                    if r.request_name != *want {
                        return false;
                    }
                }
            }
            ProtocolOp::SearchRequest(r) => {
                if let Some(ref want) = self.search_base_dn {
                    if r.base_object != *want {
                        return false;
                    }
                }
                if let Some(want) = self.search_scope {
                    if r.scope != want {
                        return false;
                    }
                }
                if let Some(ref want) = self.search_filter {
                    if r.filter.to_filter_string() != *want {
                        return false;
                    }
                }
            }
            _ => {}
        }
        true
    }
}

/// Ordered route table. Dispatch walks routes in registration order and
/// invokes the first full match; an unmatched request goes to the not-found
/// handler, or to a default `UnwillingToPerform(53)` response in the kind
/// matching the request.
#[derive(Default)]
pub struct RouteMux {
    routes: Vec<Route>,
    not_found: Option<HandlerFn>,
}

impl RouteMux {
    pub fn new() -> Self {
        Self::default()
    }

    fn add_route(&mut self, kind: OpKind, handler: HandlerFn) -> &mut Route {
        self.routes.push(Route::new(kind, handler));
        let last = self.routes.len() - 1;
        &mut self.routes[last]
    }

    pub fn bind<H: IntoHandler>(&mut self, handler: H) -> &mut Route {
        self.add_route(OpKind::Bind, handler.into_handler())
    }

    pub fn search<H: IntoHandler>(&mut self, handler: H) -> &mut Route {
        self.add_route(OpKind::Search, handler.into_handler())
    }

    pub fn add<H: IntoHandler>(&mut self, handler: H) -> &mut Route {
        self.add_route(OpKind::Add, handler.into_handler())
    }

    pub fn delete<H: IntoHandler>(&mut self, handler: H) -> &mut Route {
        self.add_route(OpKind::Delete, handler.into_handler())
    }

    pub fn modify<H: IntoHandler>(&mut self, handler: H) -> &mut Route {
        self.add_route(OpKind::Modify, handler.into_handler())
    }

    pub fn modify_dn<H: IntoHandler>(&mut self, handler: H) -> &mut Route {
        self.add_route(OpKind::ModifyDn, handler.into_handler())
    }

    pub fn compare<H: IntoHandler>(&mut self, handler: H) -> &mut Route {
        self.add_route(OpKind::Compare, handler.into_handler())
    }

    pub fn extended<H: IntoHandler>(&mut self, handler: H) -> &mut Route {
        self.add_route(OpKind::Extended, handler.into_handler())
    }

    pub fn abandon<H: IntoHandler>(&mut self, handler: H) -> &mut Route {
        self.add_route(OpKind::Abandon, handler.into_handler())
    }

    /// Register a custom handler for the Cancel extended operation
    /// (RFC 3909). Replaces the built-in Cancel logic, including its
    /// eligibility checks.
    pub fn cancel<H: IntoHandler>(&mut self, handler: H) -> &mut Route {
        let route = self.add_route(OpKind::Extended, handler.into_handler());
        route.request_name(OID_CANCEL);
        route
    }

    /// Handler invoked when no route matches.
    pub fn not_found<H: IntoHandler>(&mut self, handler: H) {
        self.not_found = Some(handler.into_handler());
    }

    /// Dispatch one message. Runs on the operation's worker task.
    pub(crate) async fn serve(&self, w: ResponseWriter, m: Arc<Message>) {
        // Cancel is handled built-in unless a route names its OID; a generic
        // Extended route never catches it.
        let is_cancel = matches!(
            m.protocol_op(),
            ProtocolOp::ExtendedRequest(r) if r.request_name == OID_CANCEL
        );
        if is_cancel {
            let custom = self
                .routes
                .iter()
                .find(|r| r.request_name.as_deref() == Some(OID_CANCEL) && r.matches(&m));
            match custom {
                Some(route) => {
                    tracing::debug!(
                        client = m.client().id(),
                        label = route.label.as_deref().unwrap_or(""),
                        "dispatching custom Cancel handler"
                    );
                    (route.handler)(w, m).await;
                }
                None => cancel::handle_cancel(w, m).await,
            }
            return;
        }

        for route in &self.routes {
            if !route.matches(&m) {
                continue;
            }
            tracing::debug!(
                client = m.client().id(),
                msgid = m.message_id(),
                op = m.protocol_op_name(),
                label = route.label.as_deref().unwrap_or(""),
                "dispatching"
            );
            (route.handler)(w, m).await;
            return;
        }

        // Abandon produces no response, routed or not.
        if m.kind() == OpKind::Abandon {
            return;
        }

        if let Some(ref nf) = self.not_found {
            nf(w, m).await;
            return;
        }

        let mut res = new_response(RESULT_UNWILLING_TO_PERFORM);
        res.set_diagnostic_message("Operation not implemented by server");
        let _ = w.write(res).await;
    }

    /// True when any Abandon route is registered; the engine skips worker
    /// spawning for Abandon otherwise.
    pub(crate) fn has_abandon_route(&self) -> bool {
        self.routes.iter().any(|r| r.kind == OpKind::Abandon)
    }
}
