//! Response writer capability handed to handlers, and the response
//! constructors mirrored on the LDAP response types.

use crate::conn::Outbound;
use crate::proto::{
    AddResponse, BindResponse, CompareResponse, Control, DelResponse, ExtendedResponse,
    LdapMessage, LdapResult, ModifyDNResponse, ModifyResponse, OpKind, ProtocolOp,
    SearchResultDone, SearchResultEntry, SearchResultReference,
};
use anyhow::{anyhow, Result};
use tokio::sync::mpsc;

/// Writes responses for one operation. The message id is stamped on every
/// envelope; ordering is preserved per operation because all writes go
/// through the connection's single outbound queue.
#[derive(Clone)]
pub struct ResponseWriter {
    tx: mpsc::Sender<Outbound>,
    message_id: i32,
    request_kind: OpKind,
}

impl ResponseWriter {
    pub(crate) fn new(tx: mpsc::Sender<Outbound>, message_id: i32, request_kind: OpKind) -> Self {
        Self { tx, message_id, request_kind }
    }

    pub fn message_id(&self) -> i32 {
        self.message_id
    }

    /// Enqueue one protocol op as a response to this operation. The queue is
    /// unbuffered: a slow client exerts back-pressure here. Fails once the
    /// connection serializer has exited.
    pub async fn write(&self, op: impl WriteableOp) -> Result<()> {
        self.write_message(op, None).await
    }

    /// Like [`write`](Self::write), with response controls attached to the
    /// envelope.
    pub async fn write_with_controls(
        &self,
        op: impl WriteableOp,
        controls: Vec<Control>,
    ) -> Result<()> {
        self.write_message(op, Some(controls)).await
    }

    async fn write_message(
        &self,
        op: impl WriteableOp,
        controls: Option<Vec<Control>>,
    ) -> Result<()> {
        let envelope = LdapMessage {
            message_id: self.message_id,
            protocol_op: op.into_protocol_op(self.request_kind),
            controls,
        };
        self.tx
            .send(Outbound::Message(envelope))
            .await
            .map_err(|_| anyhow!("connection closed"))
    }
}

/// Values a handler may pass to [`ResponseWriter::write`]. The generic
/// [`LdapResult`] maps onto the response kind matching the request, so a
/// not-found handler can answer any operation with one constructor.
pub trait WriteableOp {
    fn into_protocol_op(self, request_kind: OpKind) -> ProtocolOp;
}

macro_rules! writeable {
    ($($t:ident),+) => {
        $(impl WriteableOp for $t {
            fn into_protocol_op(self, _request_kind: OpKind) -> ProtocolOp {
                ProtocolOp::$t(self)
            }
        })+
    };
}

writeable!(
    BindResponse,
    SearchResultEntry,
    SearchResultReference,
    SearchResultDone,
    ModifyResponse,
    AddResponse,
    DelResponse,
    ModifyDNResponse,
    CompareResponse,
    ExtendedResponse
);

impl WriteableOp for LdapResult {
    fn into_protocol_op(self, request_kind: OpKind) -> ProtocolOp {
        let LdapResult { result_code, matched_dn, diagnostic_message, referral } = self;
        match request_kind {
            OpKind::Bind => ProtocolOp::BindResponse(BindResponse {
                result_code,
                matched_dn,
                diagnostic_message,
                referral,
            }),
            OpKind::Search => ProtocolOp::SearchResultDone(SearchResultDone {
                result_code,
                matched_dn,
                diagnostic_message,
                referral,
            }),
            OpKind::Modify => ProtocolOp::ModifyResponse(ModifyResponse {
                result_code,
                matched_dn,
                diagnostic_message,
                referral,
            }),
            OpKind::Add => ProtocolOp::AddResponse(AddResponse {
                result_code,
                matched_dn,
                diagnostic_message,
                referral,
            }),
            OpKind::Delete => ProtocolOp::DelResponse(DelResponse {
                result_code,
                matched_dn,
                diagnostic_message,
                referral,
            }),
            OpKind::ModifyDn => ProtocolOp::ModifyDNResponse(ModifyDNResponse {
                result_code,
                matched_dn,
                diagnostic_message,
                referral,
            }),
            OpKind::Compare => ProtocolOp::CompareResponse(CompareResponse {
                result_code,
                matched_dn,
                diagnostic_message,
                referral,
            }),
            // Extended requests, and kinds with no response of their own,
            // answer as ExtendedResponse (the unsolicited-response shape).
            OpKind::Extended | OpKind::Abandon | OpKind::Unbind => {
                ProtocolOp::ExtendedResponse(ExtendedResponse {
                    result_code,
                    matched_dn,
                    diagnostic_message,
                    referral,
                    response_name: None,
                    response_value: None,
                })
            }
        }
    }
}

impl WriteableOp for ProtocolOp {
    fn into_protocol_op(self, _request_kind: OpKind) -> ProtocolOp {
        self
    }
}

pub fn new_bind_response(result_code: i32) -> BindResponse {
    BindResponse { result_code, ..Default::default() }
}

/// Generic result; written back in the response kind matching the request.
pub fn new_response(result_code: i32) -> LdapResult {
    LdapResult { result_code, ..Default::default() }
}

pub fn new_extended_response(result_code: i32) -> ExtendedResponse {
    ExtendedResponse { result_code, ..Default::default() }
}

pub fn new_compare_response(result_code: i32) -> CompareResponse {
    CompareResponse { result_code, ..Default::default() }
}

pub fn new_modify_response(result_code: i32) -> ModifyResponse {
    ModifyResponse { result_code, ..Default::default() }
}

pub fn new_delete_response(result_code: i32) -> DelResponse {
    DelResponse { result_code, ..Default::default() }
}

pub fn new_add_response(result_code: i32) -> AddResponse {
    AddResponse { result_code, ..Default::default() }
}

pub fn new_modify_dn_response(result_code: i32) -> ModifyDNResponse {
    ModifyDNResponse { result_code, ..Default::default() }
}

pub fn new_search_result_done_response(result_code: i32) -> SearchResultDone {
    SearchResultDone { result_code, ..Default::default() }
}

pub fn new_search_result_entry(object_name: &str) -> SearchResultEntry {
    SearchResultEntry { object_name: object_name.to_string(), ..Default::default() }
}

pub fn new_search_result_reference<I, S>(urls: I) -> SearchResultReference
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    SearchResultReference { uris: urls.into_iter().map(Into::into).collect() }
}

/// Referral URL list for `set_referral`.
pub fn new_referral<I, S>(urls: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    urls.into_iter().map(Into::into).collect()
}

pub fn new_control(oid: &str, critical: bool, value: Option<Vec<u8>>) -> Control {
    Control { control_type: oid.to_string(), criticality: critical, value }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{RESULT_SUCCESS, RESULT_UNWILLING_TO_PERFORM};

    #[tokio::test]
    async fn writer_stamps_message_id() {
        let (tx, mut rx) = mpsc::channel(1);
        let w = ResponseWriter::new(tx, 42, OpKind::Bind);
        w.write(new_bind_response(RESULT_SUCCESS)).await.unwrap();
        match rx.recv().await.unwrap() {
            Outbound::Message(msg) => {
                assert_eq!(msg.message_id, 42);
                assert!(matches!(msg.protocol_op, ProtocolOp::BindResponse(_)));
                assert!(msg.controls.is_none());
            }
            _ => panic!("expected Message"),
        }
    }

    #[tokio::test]
    async fn writer_attaches_controls() {
        let (tx, mut rx) = mpsc::channel(1);
        let w = ResponseWriter::new(tx, 2, OpKind::Search);
        w.write_with_controls(
            new_search_result_done_response(RESULT_SUCCESS),
            vec![new_control("1.2.3.4.5.6.7.8.9", false, None)],
        )
        .await
        .unwrap();
        match rx.recv().await.unwrap() {
            Outbound::Message(msg) => {
                let controls = msg.controls.unwrap();
                assert_eq!(controls.len(), 1);
                assert_eq!(controls[0].control_type, "1.2.3.4.5.6.7.8.9");
            }
            _ => panic!("expected Message"),
        }
    }

    #[tokio::test]
    async fn writer_fails_after_serializer_exit() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let w = ResponseWriter::new(tx, 1, OpKind::Bind);
        assert!(w.write(new_bind_response(RESULT_SUCCESS)).await.is_err());
    }

    #[test]
    fn generic_result_maps_to_request_kind() {
        let mut res = new_response(RESULT_UNWILLING_TO_PERFORM);
        res.set_diagnostic_message("Operation not implemented by server");
        assert!(matches!(
            res.clone().into_protocol_op(OpKind::Bind),
            ProtocolOp::BindResponse(_)
        ));
        assert!(matches!(
            res.clone().into_protocol_op(OpKind::Search),
            ProtocolOp::SearchResultDone(_)
        ));
        assert!(matches!(
            res.clone().into_protocol_op(OpKind::Extended),
            ProtocolOp::ExtendedResponse(_)
        ));
        match res.into_protocol_op(OpKind::Compare) {
            ProtocolOp::CompareResponse(r) => {
                assert_eq!(r.result_code, RESULT_UNWILLING_TO_PERFORM);
                assert_eq!(r.diagnostic_message, "Operation not implemented by server");
            }
            other => panic!("unexpected op {}", other.name()),
        }
    }

    #[test]
    fn entry_builder() {
        let mut e = new_search_result_entry("cn=Valere JEANTET, o=My Company, c=US");
        e.add_attribute("mail", &["valere.jeantet@gmail.com", "mail@vjeantet.fr"]);
        e.add_attribute("cn", &["Valere JEANTET"]);
        assert_eq!(e.attributes.len(), 2);
        assert_eq!(e.attributes[0].attr_values.len(), 2);
    }
}
