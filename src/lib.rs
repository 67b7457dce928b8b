//! Embeddable LDAP v3 server framework (RFC 4511).
//!
//! The server accepts BER-framed LDAP messages, dispatches each request to
//! a handler registered on a [`RouteMux`], serializes concurrent handler
//! responses back to the client and coordinates clean shutdown and
//! per-operation cancellation (Abandon, RFC 3909 Cancel). It provides no
//! directory backend: handlers decide what every operation means.
//!
//! ```no_run
//! use ldapserver::{
//!     new_bind_response, new_search_result_done_response, new_search_result_entry,
//!     Message, ResponseWriter, RouteMux, Server, RESULT_SUCCESS,
//! };
//! use std::sync::Arc;
//!
//! async fn handle_bind(w: ResponseWriter, _m: Arc<Message>) {
//!     let _ = w.write(new_bind_response(RESULT_SUCCESS)).await;
//! }
//!
//! async fn handle_search(w: ResponseWriter, m: Arc<Message>) {
//!     let base = m.get_search_request().map(|r| r.base_object.clone()).unwrap_or_default();
//!     let mut e = new_search_result_entry(&format!("cn=someone, {}", base));
//!     e.add_attribute("cn", &["someone"]);
//!     let _ = w.write(e).await;
//!     let _ = w.write(new_search_result_done_response(RESULT_SUCCESS)).await;
//! }
//!
//! # async fn run() -> anyhow::Result<()> {
//! let mut routes = RouteMux::new();
//! routes.bind(handle_bind);
//! routes.search(handle_search).label("generic");
//!
//! let server = Server::new();
//! server.handle(routes);
//! server.listen_and_serve("ldap://127.0.0.1:1389").await?;
//! # Ok(())
//! # }
//! ```

pub mod cancel;
pub mod config;
mod conn;
pub mod logging;
pub mod message;
pub mod metrics;
pub mod proto;
pub mod registry;
pub mod response;
pub mod route;
pub mod server;
pub mod tls;

pub use cancel::{encode_cancel_request_value, parse_cancel_request_value};
pub use config::Settings;
pub use message::{Client, Message};
pub use metrics::Metrics;
pub use proto::{
    BerReader, BerWriter, Control, Filter, LdapMessage, LdapResult, OpKind, ProtocolOp,
    SearchScope, OID_CANCEL, OID_NOTICE_OF_DISCONNECTION, OID_START_TLS, OID_WHOAMI,
    RESULT_BUSY, RESULT_CANCELED, RESULT_CANNOT_CANCEL, RESULT_COMPARE_FALSE,
    RESULT_COMPARE_TRUE, RESULT_INSUFFICIENT_ACCESS_RIGHTS, RESULT_INVALID_CREDENTIALS,
    RESULT_NO_SUCH_OBJECT, RESULT_NO_SUCH_OPERATION, RESULT_OPERATIONS_ERROR,
    RESULT_PROTOCOL_ERROR, RESULT_REFERRAL, RESULT_SUCCESS, RESULT_UNWILLING_TO_PERFORM,
};
pub use response::{
    new_add_response, new_bind_response, new_compare_response, new_control,
    new_delete_response, new_extended_response, new_modify_dn_response, new_modify_response,
    new_referral, new_response, new_search_result_done_response, new_search_result_entry,
    new_search_result_reference, ResponseWriter, WriteableOp,
};
pub use route::{HandlerFn, IntoHandler, Route, RouteMux};
pub use server::{NewConnectionHook, Server};
