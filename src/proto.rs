// LDAP v3 (RFC 4511) message model with BER encoding/decoding.
// Requests are parsed from the wire; responses are encoded to it.

use anyhow::{bail, Context, Result};
use bytes::BytesMut;
use std::io::{Cursor, Read};

// Result codes that appear on the wire (RFC 4511, RFC 3909).
pub const RESULT_SUCCESS: i32 = 0;
pub const RESULT_OPERATIONS_ERROR: i32 = 1;
pub const RESULT_PROTOCOL_ERROR: i32 = 2;
pub const RESULT_COMPARE_FALSE: i32 = 5;
pub const RESULT_COMPARE_TRUE: i32 = 6;
pub const RESULT_REFERRAL: i32 = 10;
pub const RESULT_NO_SUCH_OBJECT: i32 = 32;
pub const RESULT_INVALID_CREDENTIALS: i32 = 49;
pub const RESULT_INSUFFICIENT_ACCESS_RIGHTS: i32 = 50;
pub const RESULT_BUSY: i32 = 51;
pub const RESULT_UNWILLING_TO_PERFORM: i32 = 53;
pub const RESULT_CANCELED: i32 = 118;
pub const RESULT_NO_SUCH_OPERATION: i32 = 119;
pub const RESULT_CANNOT_CANCEL: i32 = 121;

/// StartTLS extended operation (RFC 4511).
pub const OID_START_TLS: &str = "1.3.6.1.4.1.1466.20037";
/// Unsolicited Notice of Disconnection (RFC 4511 section 4.4.1).
pub const OID_NOTICE_OF_DISCONNECTION: &str = "1.3.6.1.4.1.1466.20036";
/// Cancel extended operation (RFC 3909).
pub const OID_CANCEL: &str = "1.3.6.1.1.8";
/// WhoAmI extended operation (RFC 4532).
pub const OID_WHOAMI: &str = "1.3.6.1.4.1.4203.1.11.3";

/// LDAP Control (request or response).
#[derive(Debug, Clone)]
pub struct Control {
    pub control_type: String,
    pub criticality: bool,
    pub value: Option<Vec<u8>>,
}

/// LDAPMessage ::= SEQUENCE { messageID, protocolOp, controls [0] OPTIONAL }
#[derive(Debug, Clone)]
pub struct LdapMessage {
    pub message_id: i32,
    pub protocol_op: ProtocolOp,
    pub controls: Option<Vec<Control>>,
}

#[derive(Debug, Clone)]
pub enum ProtocolOp {
    BindRequest(BindRequest),
    BindResponse(BindResponse),
    UnbindRequest,
    SearchRequest(SearchRequest),
    SearchResultEntry(SearchResultEntry),
    SearchResultReference(SearchResultReference),
    SearchResultDone(SearchResultDone),
    ModifyRequest(ModifyRequest),
    ModifyResponse(ModifyResponse),
    AddRequest(AddRequest),
    AddResponse(AddResponse),
    DelRequest(DelRequest),
    DelResponse(DelResponse),
    ModifyDNRequest(ModifyDNRequest),
    ModifyDNResponse(ModifyDNResponse),
    CompareRequest(CompareRequest),
    CompareResponse(CompareResponse),
    /// AbandonRequest ::= [APPLICATION 16] MessageID - no server response per RFC 4511
    AbandonRequest(i32),
    ExtendedRequest(ExtendedRequest),
    ExtendedResponse(ExtendedResponse),
}

/// Operation kinds, used for route matching and response selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Bind,
    Unbind,
    Search,
    Modify,
    Add,
    Delete,
    ModifyDn,
    Compare,
    Abandon,
    Extended,
}

impl ProtocolOp {
    pub fn kind(&self) -> OpKind {
        match self {
            ProtocolOp::BindRequest(_) | ProtocolOp::BindResponse(_) => OpKind::Bind,
            ProtocolOp::UnbindRequest => OpKind::Unbind,
            ProtocolOp::SearchRequest(_)
            | ProtocolOp::SearchResultEntry(_)
            | ProtocolOp::SearchResultReference(_)
            | ProtocolOp::SearchResultDone(_) => OpKind::Search,
            ProtocolOp::ModifyRequest(_) | ProtocolOp::ModifyResponse(_) => OpKind::Modify,
            ProtocolOp::AddRequest(_) | ProtocolOp::AddResponse(_) => OpKind::Add,
            ProtocolOp::DelRequest(_) | ProtocolOp::DelResponse(_) => OpKind::Delete,
            ProtocolOp::ModifyDNRequest(_) | ProtocolOp::ModifyDNResponse(_) => OpKind::ModifyDn,
            ProtocolOp::CompareRequest(_) | ProtocolOp::CompareResponse(_) => OpKind::Compare,
            ProtocolOp::AbandonRequest(_) => OpKind::Abandon,
            ProtocolOp::ExtendedRequest(_) | ProtocolOp::ExtendedResponse(_) => OpKind::Extended,
        }
    }

    /// Request type name, e.g. "BindRequest". Used in logs and by not-found handlers.
    pub fn name(&self) -> &'static str {
        match self {
            ProtocolOp::BindRequest(_) => "BindRequest",
            ProtocolOp::BindResponse(_) => "BindResponse",
            ProtocolOp::UnbindRequest => "UnbindRequest",
            ProtocolOp::SearchRequest(_) => "SearchRequest",
            ProtocolOp::SearchResultEntry(_) => "SearchResultEntry",
            ProtocolOp::SearchResultReference(_) => "SearchResultReference",
            ProtocolOp::SearchResultDone(_) => "SearchResultDone",
            ProtocolOp::ModifyRequest(_) => "ModifyRequest",
            ProtocolOp::ModifyResponse(_) => "ModifyResponse",
            ProtocolOp::AddRequest(_) => "AddRequest",
            ProtocolOp::AddResponse(_) => "AddResponse",
            ProtocolOp::DelRequest(_) => "DelRequest",
            ProtocolOp::DelResponse(_) => "DelResponse",
            ProtocolOp::ModifyDNRequest(_) => "ModifyDNRequest",
            ProtocolOp::ModifyDNResponse(_) => "ModifyDNResponse",
            ProtocolOp::CompareRequest(_) => "CompareRequest",
            ProtocolOp::CompareResponse(_) => "CompareResponse",
            ProtocolOp::AbandonRequest(_) => "AbandonRequest",
            ProtocolOp::ExtendedRequest(_) => "ExtendedRequest",
            ProtocolOp::ExtendedResponse(_) => "ExtendedResponse",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BindRequest {
    pub version: i32,
    pub name: String,
    pub authentication: BindAuthentication,
}

#[derive(Debug, Clone)]
pub enum BindAuthentication {
    Simple(String),
    Sasl { mechanism: String, credentials: Vec<u8> },
}

/// Shared LDAPResult fields. Also writable as a generic response: the
/// response writer maps it onto the response kind matching the request.
#[derive(Debug, Clone, Default)]
pub struct LdapResult {
    pub result_code: i32,
    pub matched_dn: String,
    pub diagnostic_message: String,
    pub referral: Option<Vec<String>>,
}

macro_rules! result_response {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Default)]
        pub struct $name {
            pub result_code: i32,
            pub matched_dn: String,
            pub diagnostic_message: String,
            pub referral: Option<Vec<String>>,
        }

        impl $name {
            pub fn set_result_code(&mut self, code: i32) {
                self.result_code = code;
            }

            pub fn set_matched_dn(&mut self, dn: impl Into<String>) {
                self.matched_dn = dn.into();
            }

            pub fn set_diagnostic_message(&mut self, msg: impl Into<String>) {
                self.diagnostic_message = msg.into();
            }

            pub fn set_referral(&mut self, urls: Vec<String>) {
                self.referral = Some(urls);
            }
        }
    };
}

result_response!(BindResponse);
result_response!(SearchResultDone);
result_response!(ModifyResponse);
result_response!(AddResponse);
result_response!(DelResponse);
result_response!(ModifyDNResponse);
result_response!(CompareResponse);

impl LdapResult {
    pub fn set_result_code(&mut self, code: i32) {
        self.result_code = code;
    }

    pub fn set_matched_dn(&mut self, dn: impl Into<String>) {
        self.matched_dn = dn.into();
    }

    pub fn set_diagnostic_message(&mut self, msg: impl Into<String>) {
        self.diagnostic_message = msg.into();
    }

    pub fn set_referral(&mut self, urls: Vec<String>) {
        self.referral = Some(urls);
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExtendedResponse {
    pub result_code: i32,
    pub matched_dn: String,
    pub diagnostic_message: String,
    pub referral: Option<Vec<String>>,
    pub response_name: Option<String>,
    pub response_value: Option<Vec<u8>>,
}

impl ExtendedResponse {
    pub fn set_result_code(&mut self, code: i32) {
        self.result_code = code;
    }

    pub fn set_matched_dn(&mut self, dn: impl Into<String>) {
        self.matched_dn = dn.into();
    }

    pub fn set_diagnostic_message(&mut self, msg: impl Into<String>) {
        self.diagnostic_message = msg.into();
    }

    pub fn set_referral(&mut self, urls: Vec<String>) {
        self.referral = Some(urls);
    }

    pub fn set_response_name(&mut self, oid: impl Into<String>) {
        self.response_name = Some(oid.into());
    }

    pub fn set_response_value(&mut self, value: Vec<u8>) {
        self.response_value = Some(value);
    }
}

/// LDAP search filter (RFC 4511 section 4.5.1).
#[derive(Debug, Clone)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    EqualityMatch { attribute: String, value: Vec<u8> },
    Substrings {
        attribute: String,
        substrings: Vec<SubstringFilterItem>,
    },
    GreaterOrEqual { attribute: String, value: Vec<u8> },
    LessOrEqual { attribute: String, value: Vec<u8> },
    Present(String),
    ApproxMatch { attribute: String, value: Vec<u8> },
    ExtensibleMatch {
        matching_rule: Option<String>,
        attribute: Option<String>,
        match_value: Vec<u8>,
        dn_attributes: bool,
    },
    /// Unrecognized filter choice, stored as (tag, raw content).
    Raw(u8, Vec<u8>),
}

#[derive(Debug, Clone)]
pub enum SubstringFilterItem {
    Initial(Vec<u8>),
    Any(Vec<u8>),
    Final(Vec<u8>),
}

impl Filter {
    /// String form, e.g. "(cn=foo)", "(&(a=b)(c=d))". Route predicates compare
    /// this byte-for-byte against the registered filter literal.
    pub fn to_filter_string(&self) -> String {
        match self {
            Filter::And(fs) => format!(
                "(&{})",
                fs.iter().map(Filter::to_filter_string).collect::<String>()
            ),
            Filter::Or(fs) => format!(
                "(|{})",
                fs.iter().map(Filter::to_filter_string).collect::<String>()
            ),
            Filter::Not(f) => format!("(!{})", f.to_filter_string()),
            Filter::EqualityMatch { attribute, value } => {
                format!("({}={})", attribute, escape_filter_value(value))
            }
            Filter::Present(attr) => format!("({}=*)", attr),
            Filter::Substrings { attribute, substrings } => {
                let mut s = attribute.clone();
                s.push('=');
                for item in substrings {
                    match item {
                        SubstringFilterItem::Initial(b) => s.push_str(&escape_filter_value(b)),
                        SubstringFilterItem::Any(b) | SubstringFilterItem::Final(b) => {
                            s.push('*');
                            s.push_str(&escape_filter_value(b));
                        }
                    }
                }
                format!("({})", s)
            }
            Filter::GreaterOrEqual { attribute, value } => {
                format!("({}>={})", attribute, escape_filter_value(value))
            }
            Filter::LessOrEqual { attribute, value } => {
                format!("({}<={})", attribute, escape_filter_value(value))
            }
            Filter::ApproxMatch { attribute, value } => {
                format!("({}~={})", attribute, escape_filter_value(value))
            }
            Filter::ExtensibleMatch { matching_rule, attribute, match_value, .. } => {
                let v = String::from_utf8_lossy(match_value);
                let s = if let Some(mr) = matching_rule {
                    format!(":{}:={}", mr, v)
                } else if let Some(a) = attribute {
                    format!(":dn:{}:={}", a, v)
                } else {
                    format!(":={}", v)
                };
                format!("(:{})", s)
            }
            Filter::Raw(_, _) => "(objectClass=*)".to_string(),
        }
    }
}

fn escape_filter_value(value: &[u8]) -> String {
    String::from_utf8_lossy(value)
        .replace('\\', "\\\\")
        .replace('*', "\\2a")
        .replace('(', "\\28")
        .replace(')', "\\29")
        .replace('\x00', "\\00")
}

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub base_object: String,
    pub scope: SearchScope,
    pub deref_aliases: i32,
    pub size_limit: i32,
    pub time_limit: i32,
    pub types_only: bool,
    pub filter: Filter,
    pub attributes: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    BaseObject = 0,
    SingleLevel = 1,
    WholeSubtree = 2,
}

impl TryFrom<u8> for SearchScope {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(SearchScope::BaseObject),
            1 => Ok(SearchScope::SingleLevel),
            2 => Ok(SearchScope::WholeSubtree),
            _ => bail!("Invalid search scope: {}", value),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SearchResultEntry {
    pub object_name: String,
    pub attributes: Vec<Attribute>,
}

impl SearchResultEntry {
    /// Append an attribute with string values.
    pub fn add_attribute(&mut self, name: &str, values: &[&str]) {
        self.attributes.push(Attribute {
            attr_type: name.to_string(),
            attr_values: values.iter().map(|v| v.as_bytes().to_vec()).collect(),
        });
    }

    /// Append an attribute with raw octet-string values.
    pub fn add_attribute_bytes(&mut self, name: &str, values: Vec<Vec<u8>>) {
        self.attributes.push(Attribute {
            attr_type: name.to_string(),
            attr_values: values,
        });
    }
}

/// SearchResultReference ::= [APPLICATION 19] SEQUENCE OF uri URI
#[derive(Debug, Clone, Default)]
pub struct SearchResultReference {
    pub uris: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ModifyRequest {
    pub object: String,
    pub changes: Vec<ModifyChange>,
}

#[derive(Debug, Clone)]
pub struct ModifyChange {
    pub operation: ModifyOperation,
    pub modification: Attribute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifyOperation {
    Add = 0,
    Delete = 1,
    Replace = 2,
}

#[derive(Debug, Clone)]
pub struct AddRequest {
    pub entry: String,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone)]
pub struct DelRequest {
    pub entry: String,
}

#[derive(Debug, Clone)]
pub struct ModifyDNRequest {
    pub entry: String,
    pub newrdn: String,
    pub delete_old_rdn: bool,
    pub new_superior: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CompareRequest {
    pub entry: String,
    pub attr: String,
    pub assertion_value: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ExtendedRequest {
    pub request_name: String,
    pub request_value: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct Attribute {
    pub attr_type: String,
    pub attr_values: Vec<Vec<u8>>,
}

// BER parsing utilities.
pub struct BerReader<'a> {
    cursor: Cursor<&'a [u8]>,
}

impl<'a> BerReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { cursor: Cursor::new(data) }
    }

    pub fn read_tag(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.cursor.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    pub fn read_length(&mut self) -> Result<usize> {
        let mut buf = [0u8; 1];
        self.cursor.read_exact(&mut buf)?;
        let first = buf[0];

        if (first & 0x80) == 0 {
            return Ok(first as usize);
        }
        let length_bytes = (first & 0x7F) as usize;
        if length_bytes == 0 {
            bail!("Indefinite length not supported");
        }
        if length_bytes > 4 {
            bail!("Length too large: {} bytes", length_bytes);
        }
        if self.remaining() < length_bytes {
            bail!(
                "BER truncated: length encoding needs {} bytes, {} remaining",
                length_bytes,
                self.remaining()
            );
        }
        let mut length = 0usize;
        for _ in 0..length_bytes {
            self.cursor.read_exact(&mut buf)?;
            length = (length << 8) | buf[0] as usize;
        }
        Ok(length)
    }

    pub fn read_integer(&mut self) -> Result<i32> {
        let tag = self.read_tag()?;
        if (tag & 0x1F) != 0x02 {
            bail!("Expected INTEGER tag (0x02), got: 0x{:02X}", tag);
        }
        let length = self.read_length()?;
        if length > 4 {
            bail!("Integer too large: {} bytes", length);
        }
        let buf = self.read_raw_bytes(length)?;
        Ok(int_from_be_bytes(&buf))
    }

    /// OCTET STRING TLV. Lenient on the tag: accepts universal 0x04,
    /// SEQUENCE-wrapped DNs some clients send, and context-specific
    /// [0]..[31] tags (e.g. simple bind credentials, extended requestName).
    pub fn read_octet_string(&mut self) -> Result<Vec<u8>> {
        let tag = self.read_tag()?;
        let ok = (tag & 0x1F) == 0x04
            || tag == 0x30
            || (0x80..=0xBF).contains(&tag);
        if !ok {
            bail!("Expected OCTET STRING tag (0x04), got: 0x{:02X}", tag);
        }
        self.read_octet_string_value()
    }

    /// Length + value only (tag already consumed). For [n] IMPLICIT fields.
    pub fn read_octet_string_value(&mut self) -> Result<Vec<u8>> {
        let length = self.read_length()?;
        self.read_raw_bytes(length)
    }

    pub fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_octet_string()?;
        String::from_utf8(bytes).context("Invalid UTF-8 string")
    }

    pub fn read_sequence(&mut self) -> Result<usize> {
        let tag = self.read_tag()?;
        if (tag & 0x1F) != 0x10 {
            bail!("Expected SEQUENCE tag, got: 0x{:02X}", tag);
        }
        self.read_length()
    }

    pub fn read_enumerated(&mut self) -> Result<u8> {
        let tag = self.read_tag()?;
        if (tag & 0x1F) != 0x0A {
            bail!("Expected ENUMERATED tag, got: 0x{:02X}", tag);
        }
        let length = self.read_length()?;
        if length != 1 {
            bail!("Enumerated value must be 1 byte, got: {}", length);
        }
        let mut buf = [0u8; 1];
        self.cursor.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    pub fn read_boolean(&mut self) -> Result<bool> {
        let tag = self.read_tag()?;
        if (tag & 0x1F) != 0x01 {
            bail!("Expected BOOLEAN tag, got: 0x{:02X}", tag);
        }
        let length = self.read_length()?;
        if length != 1 {
            bail!("Boolean value must be 1 byte, got: {}", length);
        }
        let mut buf = [0u8; 1];
        self.cursor.read_exact(&mut buf)?;
        Ok(buf[0] != 0)
    }

    pub fn position(&self) -> usize {
        self.cursor.position() as usize
    }

    pub fn remaining(&self) -> usize {
        let pos = self.cursor.position() as usize;
        self.cursor.get_ref().len().saturating_sub(pos)
    }

    pub fn read_raw_bytes(&mut self, n: usize) -> Result<Vec<u8>> {
        if self.remaining() < n {
            bail!("BER truncated: need {} bytes, {} remaining", n, self.remaining());
        }
        let mut buf = vec![0u8; n];
        self.cursor.read_exact(&mut buf)?;
        Ok(buf)
    }
}

fn int_from_be_bytes(buf: &[u8]) -> i32 {
    let mut value = 0i32;
    for &byte in buf {
        value = (value << 8) | byte as i32;
    }
    if !buf.is_empty() && buf.len() < 4 && (buf[0] & 0x80) != 0 {
        value |= !0 << (buf.len() * 8);
    }
    value
}

// BER encoding utilities.
#[derive(Default)]
pub struct BerWriter {
    buffer: Vec<u8>,
}

impl BerWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_tag(&mut self, tag: u8) {
        self.buffer.push(tag);
    }

    fn write_length(&mut self, length: usize) {
        if length < 128 {
            self.buffer.push(length as u8);
        } else {
            let mut bytes = Vec::new();
            let mut len = length;
            while len > 0 {
                bytes.push((len & 0xFF) as u8);
                len >>= 8;
            }
            bytes.reverse();
            self.buffer.push(0x80 | bytes.len() as u8);
            self.buffer.extend_from_slice(&bytes);
        }
    }

    pub fn write_integer(&mut self, value: i32) {
        self.write_tag(0x02);
        let bytes = value.to_be_bytes();
        let start = bytes
            .iter()
            .position(|&b| b != 0 || (value < 0 && b != 0xFF))
            .unwrap_or(3);
        let actual = &bytes[start..];
        if actual.is_empty() || (value >= 0 && actual[0] & 0x80 != 0) {
            // Sign byte needed
            self.write_length(actual.len() + 1);
            self.buffer.push(if value >= 0 { 0x00 } else { 0xFF });
            self.buffer.extend_from_slice(actual);
        } else {
            self.write_length(actual.len());
            self.buffer.extend_from_slice(actual);
        }
    }

    pub fn write_octet_string(&mut self, data: &[u8]) {
        self.write_tagged_bytes(0x04, data);
    }

    pub fn write_string(&mut self, s: &str) {
        self.write_octet_string(s.as_bytes());
    }

    /// TLV with an arbitrary (typically IMPLICIT context) tag.
    pub fn write_tagged_bytes(&mut self, tag: u8, data: &[u8]) {
        self.write_tag(tag);
        self.write_length(data.len());
        self.buffer.extend_from_slice(data);
    }

    pub fn write_boolean(&mut self, value: bool) {
        self.write_tag(0x01);
        self.write_length(1);
        self.buffer.push(if value { 0xFF } else { 0x00 });
    }

    pub fn write_enumerated(&mut self, value: u8) {
        self.write_tag(0x0A);
        self.write_length(1);
        self.buffer.push(value);
    }

    /// Reserve a length byte after an already-written tag. Pair with
    /// patch_length() once the content is written.
    pub fn write_length_placeholder(&mut self) -> usize {
        let pos = self.buffer.len();
        self.buffer.push(0);
        pos
    }

    /// Back-patch the length at pos; switches to long form as needed.
    pub fn patch_length(&mut self, pos: usize) {
        let content_len = self.buffer.len() - (pos + 1);
        if content_len < 128 {
            self.buffer[pos] = content_len as u8;
        } else {
            let mut bytes = Vec::new();
            let mut len = content_len;
            while len > 0 {
                bytes.push((len & 0xFF) as u8);
                len >>= 8;
            }
            bytes.reverse();
            self.buffer[pos] = 0x80 | bytes.len() as u8;
            for (i, b) in bytes.iter().enumerate() {
                self.buffer.insert(pos + 1 + i, *b);
            }
        }
    }

    /// Open a constructed TLV with the given tag; returns the length
    /// placeholder position for end_constructed().
    pub fn start_constructed(&mut self, tag: u8) -> usize {
        self.write_tag(tag);
        self.write_length_placeholder()
    }

    pub fn end_constructed(&mut self, pos: usize) {
        self.patch_length(pos);
    }

    pub fn start_sequence(&mut self) -> usize {
        self.start_constructed(0x30)
    }

    pub fn end_sequence(&mut self, pos: usize) {
        self.end_constructed(pos);
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buffer
    }
}

// LDAP protocol application tags.
pub const LDAP_TAG_BIND_REQUEST: u8 = 0x60;
pub const LDAP_TAG_BIND_RESPONSE: u8 = 0x61;
pub const LDAP_TAG_UNBIND_REQUEST: u8 = 0x42;
pub const LDAP_TAG_SEARCH_REQUEST: u8 = 0x63;
pub const LDAP_TAG_SEARCH_RESULT_ENTRY: u8 = 0x64;
pub const LDAP_TAG_SEARCH_RESULT_DONE: u8 = 0x65;
pub const LDAP_TAG_MODIFY_REQUEST: u8 = 0x66;
pub const LDAP_TAG_MODIFY_RESPONSE: u8 = 0x67;
pub const LDAP_TAG_ADD_REQUEST: u8 = 0x68;
pub const LDAP_TAG_ADD_RESPONSE: u8 = 0x69;
pub const LDAP_TAG_DEL_REQUEST: u8 = 0x4A;
pub const LDAP_TAG_DEL_RESPONSE: u8 = 0x6B;
pub const LDAP_TAG_MODIFY_DN_REQUEST: u8 = 0x6C;
pub const LDAP_TAG_MODIFY_DN_RESPONSE: u8 = 0x6D;
pub const LDAP_TAG_COMPARE_REQUEST: u8 = 0x6E;
pub const LDAP_TAG_COMPARE_RESPONSE: u8 = 0x6F;
/// AbandonRequest [APPLICATION 16] - no response
pub const LDAP_TAG_ABANDON_REQUEST: u8 = 0x50;
pub const LDAP_TAG_EXTENDED_REQUEST: u8 = 0x77;
pub const LDAP_TAG_EXTENDED_RESPONSE: u8 = 0x78;
pub const LDAP_TAG_SEARCH_RESULT_REFERENCE: u8 = 0x73;

/// Context [0] IMPLICIT SEQUENCE OF Control
const LDAP_CONTEXT_CONTROLS: u8 = 0xA0;
/// Context [3] referral inside LDAPResult
const LDAP_CONTEXT_REFERRAL: u8 = 0xA3;
/// Context [10]/[11] responseName/responseValue in ExtendedResponse
const LDAP_CONTEXT_RESPONSE_NAME: u8 = 0x8A;
const LDAP_CONTEXT_RESPONSE_VALUE: u8 = 0x8B;

/// Top-level LDAP messages always start with a SEQUENCE tag. Anything else
/// (e.g. a TLS ClientHello 0x16 on a cleartext listener) cannot be resynced.
const LDAP_MESSAGE_SEQUENCE_TAG: u8 = 0x30;

/// Result of trying to frame one message out of the accumulation buffer.
pub enum FrameResult {
    /// Not enough data yet.
    Incomplete,
    /// One message parsed and consumed.
    Message(LdapMessage),
    /// A complete envelope was consumed but its content did not parse.
    /// Framing has re-synced on the next envelope boundary.
    Skip { consumed: usize, message_id: i32 },
}

/// Frame and parse one message from buf. An Err means the stream cannot be
/// resynced (garbage first byte, unparseable length) and the connection
/// must be torn down.
pub fn try_read_message(buf: &mut BytesMut) -> Result<FrameResult> {
    if buf.len() < 2 {
        return Ok(FrameResult::Incomplete);
    }
    if buf[0] != LDAP_MESSAGE_SEQUENCE_TAG {
        bail!("Expecting 0x30 as first byte, got 0x{:02X}", buf[0]);
    }

    let first_len = buf[1];
    let total = if (first_len & 0x80) == 0 {
        2 + first_len as usize
    } else {
        let length_bytes = (first_len & 0x7F) as usize;
        if length_bytes == 0 || length_bytes > 4 {
            bail!("Invalid length encoding");
        }
        if buf.len() < 2 + length_bytes {
            return Ok(FrameResult::Incomplete);
        }
        let mut length = 0usize;
        for i in 0..length_bytes {
            length = (length << 8) | buf[2 + i] as usize;
        }
        2 + length_bytes + length
    };

    if buf.len() < total {
        return Ok(FrameResult::Incomplete);
    }

    let slice = &buf[..total];
    match parse_ldap_message(slice) {
        Ok(msg) => {
            let _ = buf.split_to(total);
            Ok(FrameResult::Message(msg))
        }
        Err(e) => {
            let hex_preview: String = slice
                .iter()
                .take(64)
                .map(|b| format!("{:02x}", b))
                .collect::<Vec<_>>()
                .join(" ");
            tracing::warn!("Failed to parse LDAP message: {} (first 64 bytes: {})", e, hex_preview);
            let (message_id, _) = parse_ldap_message_header(slice).unwrap_or((0, 0));
            let _ = buf.split_to(total);
            Ok(FrameResult::Skip { consumed: total, message_id })
        }
    }
}

/// Parse only the envelope header (SEQUENCE, messageID, protocolOp tag).
pub fn parse_ldap_message_header(data: &[u8]) -> Result<(i32, u8)> {
    let mut reader = BerReader::new(data);
    let _seq_len = reader.read_sequence()?;
    let message_id = reader.read_integer()?;
    let tag = reader.read_tag()?;
    Ok((message_id, tag))
}

pub fn parse_ldap_message(data: &[u8]) -> Result<LdapMessage> {
    let mut reader = BerReader::new(data);

    let _seq_len = reader.read_sequence()?;
    let message_id = reader.read_integer()?;

    let tag = reader.read_tag()?;
    let protocol_op = match tag {
        LDAP_TAG_BIND_REQUEST => ProtocolOp::BindRequest(parse_bind_request(&mut reader)?),
        LDAP_TAG_UNBIND_REQUEST => {
            // [APPLICATION 2] NULL - skip the (normally empty) content
            let len = reader.read_length()?;
            let _ = reader.read_raw_bytes(len)?;
            ProtocolOp::UnbindRequest
        }
        LDAP_TAG_SEARCH_REQUEST => ProtocolOp::SearchRequest(parse_search_request(&mut reader)?),
        LDAP_TAG_MODIFY_REQUEST => ProtocolOp::ModifyRequest(parse_modify_request(&mut reader)?),
        LDAP_TAG_ADD_REQUEST => ProtocolOp::AddRequest(parse_add_request(&mut reader)?),
        LDAP_TAG_DEL_REQUEST => {
            // [APPLICATION 10] IMPLICIT LDAPDN - primitive, content is the DN itself
            let bytes = reader.read_octet_string_value()?;
            ProtocolOp::DelRequest(DelRequest {
                entry: String::from_utf8(bytes).context("Invalid UTF-8 DN")?,
            })
        }
        LDAP_TAG_MODIFY_DN_REQUEST => {
            ProtocolOp::ModifyDNRequest(parse_modify_dn_request(&mut reader)?)
        }
        LDAP_TAG_COMPARE_REQUEST => ProtocolOp::CompareRequest(parse_compare_request(&mut reader)?),
        LDAP_TAG_ABANDON_REQUEST => {
            // [APPLICATION 16] IMPLICIT MessageID - primitive, content is the integer bytes
            let bytes = reader.read_octet_string_value()?;
            if bytes.is_empty() || bytes.len() > 4 {
                bail!("AbandonRequest: invalid message id length {}", bytes.len());
            }
            ProtocolOp::AbandonRequest(int_from_be_bytes(&bytes))
        }
        LDAP_TAG_EXTENDED_REQUEST => {
            ProtocolOp::ExtendedRequest(parse_extended_request(&mut reader)?)
        }
        _ => bail!("Unsupported LDAP operation tag: 0x{:02X}", tag),
    };

    let controls = if reader.remaining() > 0 {
        let next_tag = reader.read_tag()?;
        if next_tag == LDAP_CONTEXT_CONTROLS {
            Some(parse_controls(&mut reader)?)
        } else {
            None
        }
    } else {
        None
    };

    Ok(LdapMessage { message_id, protocol_op, controls })
}

/// Controls ::= SEQUENCE OF Control; the [0] tag is already consumed.
/// Control ::= SEQUENCE { type, criticality DEFAULT FALSE, value OPTIONAL }
fn parse_controls(reader: &mut BerReader) -> Result<Vec<Control>> {
    let len = reader.read_length()?;
    let end = reader.position() + len;
    let mut controls = Vec::new();
    while reader.position() < end {
        let ctrl_len = reader.read_sequence()?;
        let ctrl_end = reader.position() + ctrl_len;
        let control_type = reader.read_string()?;
        let mut criticality = false;
        let mut value = None;
        while reader.position() < ctrl_end {
            let tag = reader.read_tag()?;
            if (tag & 0x1F) == 0x01 {
                let blen = reader.read_length()?;
                let b = reader.read_raw_bytes(blen)?;
                criticality = !b.is_empty() && b[0] != 0;
            } else {
                value = Some(reader.read_octet_string_value()?);
            }
        }
        controls.push(Control { control_type, criticality, value });
    }
    Ok(controls)
}

fn parse_bind_request(reader: &mut BerReader) -> Result<BindRequest> {
    let _len = reader.read_length()?;
    let version = reader.read_integer()?;
    let name = reader.read_string()?;

    // RFC 4511 simple bind is [0] IMPLICIT OCTET STRING (0x80), but clients
    // send various tags. Anything that is not SASL (0xA3) is treated as a
    // simple bind password.
    let auth_tag = reader.read_tag()?;
    let authentication = if auth_tag == 0xA3 {
        let sasl_len = reader.read_length()?;
        let sasl_end = reader.position() + sasl_len;
        let mechanism = reader.read_string()?;
        let credentials = if reader.position() < sasl_end {
            reader.read_octet_string()?
        } else {
            Vec::new()
        };
        BindAuthentication::Sasl { mechanism, credentials }
    } else {
        let password = reader.read_octet_string_value()?;
        BindAuthentication::Simple(String::from_utf8(password)?)
    };

    Ok(BindRequest { version, name, authentication })
}

fn parse_search_request(reader: &mut BerReader) -> Result<SearchRequest> {
    let _len = reader.read_length()?;
    let base_object = reader.read_string()?;
    let scope = SearchScope::try_from(reader.read_enumerated()?)?;
    let deref_aliases = reader.read_enumerated()? as i32;
    let size_limit = reader.read_integer()?;
    let time_limit = reader.read_integer()?;
    let types_only = reader.read_boolean()?;

    let filter = parse_filter(reader)?;

    let _attrs_tag = reader.read_tag()?;
    let attrs_len = reader.read_length()?;
    let attrs_end = reader.position() + attrs_len;
    let mut attributes = Vec::new();
    while reader.position() < attrs_end {
        attributes.push(reader.read_string()?);
    }

    Ok(SearchRequest {
        base_object,
        scope,
        deref_aliases,
        size_limit,
        time_limit,
        types_only,
        filter,
        attributes,
    })
}

/// Filter CHOICE: [0]=and, [1]=or, [2]=not, [3]=equalityMatch,
/// [4]=substrings, [5]=greaterOrEqual, [6]=lessOrEqual, [7]=present,
/// [8]=approxMatch, [9]=extensibleMatch.
fn parse_filter(reader: &mut BerReader) -> Result<Filter> {
    let tag = reader.read_tag()?;
    let len = reader.read_length()?;
    let content = reader.read_raw_bytes(len)?;
    parse_filter_content(&content, tag)
}

fn parse_filter_content(content: &[u8], tag: u8) -> Result<Filter> {
    let mut sub = BerReader::new(content);
    match tag {
        0xA0 | 0x80 => {
            let mut filters = Vec::new();
            while sub.remaining() > 0 {
                filters.push(parse_filter(&mut sub)?);
            }
            Ok(Filter::And(filters))
        }
        0xA1 | 0x81 => {
            let mut filters = Vec::new();
            while sub.remaining() > 0 {
                filters.push(parse_filter(&mut sub)?);
            }
            Ok(Filter::Or(filters))
        }
        0xA2 | 0x82 => {
            let f = parse_filter(&mut sub)?;
            Ok(Filter::Not(Box::new(f)))
        }
        0xA3 => {
            let (attribute, value) = parse_attribute_value_assertion(&mut sub, content)?;
            Ok(Filter::EqualityMatch { attribute, value })
        }
        0xA4 => {
            // SubstringFilter ::= SEQUENCE { type, substrings SEQUENCE OF choice }
            if !content.is_empty() && content[0] == 0x30 {
                let _seq = sub.read_sequence()?;
            }
            let attribute = sub.read_string()?;
            let _seq2_tag = sub.read_tag()?;
            let seq2_len = sub.read_length()?;
            let seq2_end = sub.position() + seq2_len;
            let mut substrings = Vec::new();
            while sub.position() < seq2_end {
                let t = sub.read_tag()?;
                let val = sub.read_octet_string_value()?;
                let item = match t {
                    0x80 => SubstringFilterItem::Initial(val),
                    0x81 => SubstringFilterItem::Any(val),
                    0x82 => SubstringFilterItem::Final(val),
                    _ => continue,
                };
                substrings.push(item);
            }
            Ok(Filter::Substrings { attribute, substrings })
        }
        0xA5 => {
            let (attribute, value) = parse_attribute_value_assertion(&mut sub, content)?;
            Ok(Filter::GreaterOrEqual { attribute, value })
        }
        0xA6 => {
            let (attribute, value) = parse_attribute_value_assertion(&mut sub, content)?;
            Ok(Filter::LessOrEqual { attribute, value })
        }
        0x87 => {
            // present [7] IMPLICIT AttributeDescription: content is the raw
            // attribute name, or a nested 0x04 TLV from lenient encoders
            let attribute = if !content.is_empty() && content[0] == 0x04 {
                sub.read_string()?
            } else {
                String::from_utf8_lossy(content).to_string()
            };
            Ok(Filter::Present(attribute))
        }
        0xA8 => {
            let (attribute, value) = parse_attribute_value_assertion(&mut sub, content)?;
            Ok(Filter::ApproxMatch { attribute, value })
        }
        0xA9 => {
            // extensibleMatch [9] MatchingRuleAssertion
            let mut matching_rule = None;
            let mut attribute = None;
            let mut match_value = Vec::new();
            let mut dn_attributes = false;
            while sub.remaining() > 0 {
                let t = sub.read_tag()?;
                match t {
                    0x81 => matching_rule = Some(String::from_utf8(sub.read_octet_string_value()?)?),
                    0x82 => attribute = Some(String::from_utf8(sub.read_octet_string_value()?)?),
                    0x83 => match_value = sub.read_octet_string_value()?,
                    0x84 => {
                        let len = sub.read_length()?;
                        let b = sub.read_raw_bytes(len)?;
                        dn_attributes = !b.is_empty() && b[0] != 0;
                    }
                    _ => {
                        let len = sub.read_length()?;
                        let _ = sub.read_raw_bytes(len)?;
                    }
                }
            }
            Ok(Filter::ExtensibleMatch { matching_rule, attribute, match_value, dn_attributes })
        }
        _ => Ok(Filter::Raw(tag, content.to_vec())),
    }
}

/// AttributeValueAssertion ::= SEQUENCE { attributeDesc, assertionValue };
/// some encoders inline the fields without the inner SEQUENCE.
fn parse_attribute_value_assertion(sub: &mut BerReader, content: &[u8]) -> Result<(String, Vec<u8>)> {
    if !content.is_empty() && content[0] == 0x30 {
        let _seq = sub.read_sequence()?;
    }
    let attribute = sub.read_string()?;
    let value = sub.read_octet_string()?;
    Ok((attribute, value))
}

fn parse_modify_request(reader: &mut BerReader) -> Result<ModifyRequest> {
    let _len = reader.read_length()?;
    let object = reader.read_string()?;

    let _changes_tag = reader.read_tag()?;
    let changes_len = reader.read_length()?;
    let changes_end = reader.position() + changes_len;
    let mut changes = Vec::new();

    while reader.position() < changes_end {
        let _change_seq = reader.read_sequence()?;
        let operation = reader.read_enumerated()?;
        let modification = parse_attribute(reader)?;

        changes.push(ModifyChange {
            operation: match operation {
                0 => ModifyOperation::Add,
                1 => ModifyOperation::Delete,
                2 => ModifyOperation::Replace,
                _ => bail!("Invalid modify operation: {}", operation),
            },
            modification,
        });
    }

    Ok(ModifyRequest { object, changes })
}

fn parse_add_request(reader: &mut BerReader) -> Result<AddRequest> {
    let _len = reader.read_length()?;
    let entry = reader.read_string()?;

    let _attrs_tag = reader.read_tag()?;
    let attrs_len = reader.read_length()?;
    let attrs_end = reader.position() + attrs_len;
    let mut attributes = Vec::new();

    while reader.position() < attrs_end {
        attributes.push(parse_attribute(reader)?);
    }

    Ok(AddRequest { entry, attributes })
}

/// ModifyDNRequest ::= [APPLICATION 12] SEQUENCE { entry, newrdn,
/// deleteoldrdn, newSuperior [0] OPTIONAL }
fn parse_modify_dn_request(reader: &mut BerReader) -> Result<ModifyDNRequest> {
    let len = reader.read_length()?;
    let end = reader.position() + len;
    let entry = reader.read_string()?;
    let newrdn = reader.read_string()?;
    let delete_old_rdn = reader.read_boolean()?;
    let new_superior = if reader.position() < end {
        let tag = reader.read_tag()?;
        if tag != 0x80 {
            bail!("ModifyDNRequest: expected newSuperior [0], got tag 0x{:02X}", tag);
        }
        let bytes = reader.read_octet_string_value()?;
        Some(String::from_utf8_lossy(&bytes).to_string())
    } else {
        None
    };
    Ok(ModifyDNRequest { entry, newrdn, delete_old_rdn, new_superior })
}

/// CompareRequest ::= [APPLICATION 14] SEQUENCE { entry, ava SEQUENCE { desc, value } }
fn parse_compare_request(reader: &mut BerReader) -> Result<CompareRequest> {
    let _len = reader.read_length()?;
    let entry = reader.read_string()?;
    let _ava_len = reader.read_sequence()?;
    let attr = reader.read_string()?;
    let assertion_value = reader.read_octet_string()?;
    Ok(CompareRequest { entry, attr, assertion_value })
}

/// ExtendedRequest ::= [APPLICATION 23] SEQUENCE {
///   requestName [0] IMPLICIT LDAPOID, requestValue [1] OPTIONAL }
fn parse_extended_request(reader: &mut BerReader) -> Result<ExtendedRequest> {
    let len = reader.read_length()?;
    let end = reader.position() + len;
    let request_name = reader.read_string()?;
    let request_value = if reader.position() < end {
        Some(reader.read_octet_string()?)
    } else {
        None
    };
    Ok(ExtendedRequest { request_name, request_value })
}

fn parse_attribute(reader: &mut BerReader) -> Result<Attribute> {
    let _seq_len = reader.read_sequence()?;
    let attr_type = reader.read_string()?;

    let _vals_tag = reader.read_tag()?;
    let vals_len = reader.read_length()?;
    let vals_end = reader.position() + vals_len;
    let mut attr_values = Vec::new();

    while reader.position() < vals_end {
        attr_values.push(reader.read_octet_string()?);
    }

    Ok(Attribute { attr_type, attr_values })
}

pub fn encode_ldap_message(message: &LdapMessage) -> Result<Vec<u8>> {
    let mut writer = BerWriter::new();
    let seq_start = writer.start_sequence();

    writer.write_integer(message.message_id);

    match &message.protocol_op {
        ProtocolOp::BindResponse(resp) => {
            let pos = writer.start_constructed(LDAP_TAG_BIND_RESPONSE);
            write_ldap_result(&mut writer, resp.result_code, &resp.matched_dn, &resp.diagnostic_message, resp.referral.as_deref());
            writer.end_constructed(pos);
        }
        ProtocolOp::SearchResultEntry(entry) => {
            encode_search_result_entry(&mut writer, entry);
        }
        ProtocolOp::SearchResultReference(reference) => {
            let pos = writer.start_constructed(LDAP_TAG_SEARCH_RESULT_REFERENCE);
            for uri in &reference.uris {
                writer.write_string(uri);
            }
            writer.end_constructed(pos);
        }
        ProtocolOp::SearchResultDone(done) => {
            let pos = writer.start_constructed(LDAP_TAG_SEARCH_RESULT_DONE);
            write_ldap_result(&mut writer, done.result_code, &done.matched_dn, &done.diagnostic_message, done.referral.as_deref());
            writer.end_constructed(pos);
        }
        ProtocolOp::ModifyResponse(resp) => {
            let pos = writer.start_constructed(LDAP_TAG_MODIFY_RESPONSE);
            write_ldap_result(&mut writer, resp.result_code, &resp.matched_dn, &resp.diagnostic_message, resp.referral.as_deref());
            writer.end_constructed(pos);
        }
        ProtocolOp::AddResponse(resp) => {
            let pos = writer.start_constructed(LDAP_TAG_ADD_RESPONSE);
            write_ldap_result(&mut writer, resp.result_code, &resp.matched_dn, &resp.diagnostic_message, resp.referral.as_deref());
            writer.end_constructed(pos);
        }
        ProtocolOp::DelResponse(resp) => {
            let pos = writer.start_constructed(LDAP_TAG_DEL_RESPONSE);
            write_ldap_result(&mut writer, resp.result_code, &resp.matched_dn, &resp.diagnostic_message, resp.referral.as_deref());
            writer.end_constructed(pos);
        }
        ProtocolOp::ModifyDNResponse(resp) => {
            let pos = writer.start_constructed(LDAP_TAG_MODIFY_DN_RESPONSE);
            write_ldap_result(&mut writer, resp.result_code, &resp.matched_dn, &resp.diagnostic_message, resp.referral.as_deref());
            writer.end_constructed(pos);
        }
        ProtocolOp::CompareResponse(resp) => {
            let pos = writer.start_constructed(LDAP_TAG_COMPARE_RESPONSE);
            write_ldap_result(&mut writer, resp.result_code, &resp.matched_dn, &resp.diagnostic_message, resp.referral.as_deref());
            writer.end_constructed(pos);
        }
        ProtocolOp::ExtendedResponse(resp) => {
            let pos = writer.start_constructed(LDAP_TAG_EXTENDED_RESPONSE);
            write_ldap_result(&mut writer, resp.result_code, &resp.matched_dn, &resp.diagnostic_message, resp.referral.as_deref());
            if let Some(ref name) = resp.response_name {
                writer.write_tagged_bytes(LDAP_CONTEXT_RESPONSE_NAME, name.as_bytes());
            }
            if let Some(ref value) = resp.response_value {
                writer.write_tagged_bytes(LDAP_CONTEXT_RESPONSE_VALUE, value);
            }
            writer.end_constructed(pos);
        }
        _ => bail!("Cannot encode operation type {}", message.protocol_op.name()),
    }

    if let Some(ref controls) = message.controls {
        if !controls.is_empty() {
            let ctrl_start = writer.start_constructed(LDAP_CONTEXT_CONTROLS);
            for ctrl in controls {
                encode_control(&mut writer, ctrl);
            }
            writer.end_constructed(ctrl_start);
        }
    }

    writer.end_sequence(seq_start);
    Ok(writer.into_vec())
}

fn write_ldap_result(
    writer: &mut BerWriter,
    result_code: i32,
    matched_dn: &str,
    diagnostic_message: &str,
    referral: Option<&[String]>,
) {
    writer.write_enumerated(result_code as u8);
    writer.write_string(matched_dn);
    writer.write_string(diagnostic_message);
    if let Some(urls) = referral {
        if !urls.is_empty() {
            let pos = writer.start_constructed(LDAP_CONTEXT_REFERRAL);
            for url in urls {
                writer.write_string(url);
            }
            writer.end_constructed(pos);
        }
    }
}

fn encode_search_result_entry(writer: &mut BerWriter, entry: &SearchResultEntry) {
    let pos = writer.start_constructed(LDAP_TAG_SEARCH_RESULT_ENTRY);
    writer.write_string(&entry.object_name);
    let attrs_start = writer.start_sequence();
    for attr in &entry.attributes {
        let attr_start = writer.start_sequence();
        writer.write_string(&attr.attr_type);
        // vals SET OF AttributeValue
        let vals_start = writer.start_constructed(0x31);
        for value in &attr.attr_values {
            writer.write_octet_string(value);
        }
        writer.end_constructed(vals_start);
        writer.end_sequence(attr_start);
    }
    writer.end_sequence(attrs_start);
    writer.end_constructed(pos);
}

/// Control ::= SEQUENCE { controlType, criticality DEFAULT FALSE, value OPTIONAL }
fn encode_control(writer: &mut BerWriter, ctrl: &Control) {
    let seq_start = writer.start_sequence();
    writer.write_string(&ctrl.control_type);
    if ctrl.criticality {
        writer.write_boolean(true);
    }
    if let Some(ref value) = ctrl.value {
        writer.write_octet_string(value);
    }
    writer.end_sequence(seq_start);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_scope_try_from() {
        assert_eq!(SearchScope::try_from(0).unwrap(), SearchScope::BaseObject);
        assert_eq!(SearchScope::try_from(1).unwrap(), SearchScope::SingleLevel);
        assert_eq!(SearchScope::try_from(2).unwrap(), SearchScope::WholeSubtree);
        assert!(SearchScope::try_from(3).is_err());
        assert!(SearchScope::try_from(255).is_err());
    }

    #[test]
    fn ber_writer_integer() {
        let mut writer = BerWriter::new();
        writer.write_integer(0);
        writer.write_integer(127);
        writer.write_integer(-128);
        writer.write_integer(256);
        writer.write_integer(-1);
        let result = writer.into_vec();
        assert!(!result.is_empty());
    }

    #[test]
    fn ber_integer_roundtrip() {
        for v in [0, 1, 127, 128, 255, 256, 9999, i32::MAX, -1, -128] {
            let mut writer = BerWriter::new();
            writer.write_integer(v);
            let encoded = writer.into_vec();
            let mut reader = BerReader::new(&encoded);
            assert_eq!(reader.read_integer().unwrap(), v, "value {}", v);
        }
    }

    #[test]
    fn ber_roundtrip_octet_string_lengths() {
        for len in [0_usize, 1, 127, 128, 256] {
            let s = "x".repeat(len);
            let mut writer = BerWriter::new();
            writer.write_string(&s);
            let encoded = writer.into_vec();
            let mut reader = BerReader::new(&encoded);
            let decoded = reader.read_octet_string().unwrap();
            assert_eq!(decoded.len(), len, "length {}", len);
            assert_eq!(decoded, s.as_bytes());
        }
    }

    #[test]
    fn ber_writer_long_length() {
        let mut writer = BerWriter::new();
        let seq_start = writer.start_sequence();
        for _ in 0..200 {
            writer.write_string("test");
        }
        writer.end_sequence(seq_start);
        let result = writer.into_vec();
        assert_eq!(result[0], 0x30);
        assert!(result[1] & 0x80 != 0, "long form length expected");
    }

    #[test]
    fn ber_truncated_integer_fails() {
        let data = vec![0x02, 0x02, 0xFF]; // length 2 but only 1 byte present
        let mut reader = BerReader::new(&data);
        assert!(reader.read_integer().is_err());
    }

    #[test]
    fn ber_invalid_tag_fails() {
        let data = vec![0x05, 0x00]; // NULL tag when expecting INTEGER
        let mut reader = BerReader::new(&data);
        assert!(reader.read_integer().is_err());
    }

    /// BindRequest (simple, auth tag 0x80): SEQUENCE { id=1,
    /// [APPLICATION 0] { version=3, name, simple [0] "secret" } }
    #[test]
    fn parse_bind_request_simple() {
        let msg = vec![
            0x30, 0x2c, // SEQUENCE length 44
            0x02, 0x01, 0x01, // messageID 1
            0x60, 0x27, // BindRequest length 39
            0x02, 0x01, 0x03, // version 3
            0x04, 0x1a, 0x63, 0x6e, 0x3d, 0x61, 0x64, 0x6d, 0x69, 0x6e, 0x2c, 0x64, 0x63, 0x3d,
            0x65, 0x78, 0x61, 0x6d, 0x70, 0x6c, 0x65, 0x2c, 0x64, 0x63, 0x3d, 0x63, 0x6f, 0x6d,
            0x80, 0x06, 0x73, 0x65, 0x63, 0x72, 0x65, 0x74, // [0] simple "secret"
        ];
        let parsed = parse_ldap_message(&msg).unwrap();
        assert_eq!(parsed.message_id, 1);
        match &parsed.protocol_op {
            ProtocolOp::BindRequest(b) => {
                assert_eq!(b.version, 3);
                assert_eq!(b.name, "cn=admin,dc=example,dc=com");
                match &b.authentication {
                    BindAuthentication::Simple(pw) => assert_eq!(pw, "secret"),
                    _ => panic!("expected Simple bind"),
                }
            }
            _ => panic!("expected BindRequest"),
        }
    }

    /// BindRequest with SASL auth (tag 0xA3), mechanism EXTERNAL, no creds.
    #[test]
    fn parse_bind_request_sasl() {
        let msg = vec![
            0x30, 0x30, 0x02, 0x01, 0x01, 0x60, 0x2b, 0x02, 0x01, 0x03,
            0x04, 0x1a, 0x63, 0x6e, 0x3d, 0x61, 0x64, 0x6d, 0x69, 0x6e, 0x2c, 0x64, 0x63, 0x3d,
            0x65, 0x78, 0x61, 0x6d, 0x70, 0x6c, 0x65, 0x2c, 0x64, 0x63, 0x3d, 0x63, 0x6f, 0x6d,
            0xA3, 0x0a, 0x04, 0x08, 0x45, 0x58, 0x54, 0x45, 0x52, 0x4e, 0x41, 0x4c,
        ];
        let parsed = parse_ldap_message(&msg).unwrap();
        match &parsed.protocol_op {
            ProtocolOp::BindRequest(b) => match &b.authentication {
                BindAuthentication::Sasl { mechanism, credentials } => {
                    assert_eq!(mechanism, "EXTERNAL");
                    assert!(credentials.is_empty());
                }
                _ => panic!("expected Sasl bind"),
            },
            _ => panic!("expected BindRequest"),
        }
    }

    #[test]
    fn parse_unbind_request() {
        let msg = vec![0x30, 0x05, 0x02, 0x01, 0x07, 0x42, 0x00];
        let parsed = parse_ldap_message(&msg).unwrap();
        assert_eq!(parsed.message_id, 7);
        assert!(matches!(parsed.protocol_op, ProtocolOp::UnbindRequest));
    }

    #[test]
    fn parse_abandon_request_primitive() {
        // [APPLICATION 16] primitive with the message id as content
        let msg = vec![0x30, 0x06, 0x02, 0x01, 0x04, 0x50, 0x01, 0x02];
        let parsed = parse_ldap_message(&msg).unwrap();
        assert_eq!(parsed.message_id, 4);
        match parsed.protocol_op {
            ProtocolOp::AbandonRequest(id) => assert_eq!(id, 2),
            _ => panic!("expected AbandonRequest"),
        }
    }

    #[test]
    fn parse_del_request_primitive() {
        // [APPLICATION 10] primitive: content is the DN itself
        let dn = b"cn=x,dc=example";
        let mut msg = vec![0x30, (5 + dn.len()) as u8, 0x02, 0x01, 0x05, 0x4A, dn.len() as u8];
        msg.extend_from_slice(dn);
        let parsed = parse_ldap_message(&msg).unwrap();
        match &parsed.protocol_op {
            ProtocolOp::DelRequest(d) => assert_eq!(d.entry, "cn=x,dc=example"),
            _ => panic!("expected DelRequest"),
        }
    }

    #[test]
    fn parse_search_request_with_filter_present() {
        let msg = vec![
            0x30, 0x27, // SEQUENCE 39
            0x02, 0x01, 0x01, // messageID 1
            0x63, 0x22, // SearchRequest length 34
            0x04, 0x00, // baseObject ""
            0x0A, 0x01, 0x02, // scope wholeSubtree
            0x0A, 0x01, 0x00, // derefAliases never
            0x02, 0x01, 0x00, // sizeLimit 0
            0x02, 0x01, 0x00, // timeLimit 0
            0x01, 0x01, 0x00, // typesOnly false
            0x87, 0x0D, 0x04, 0x0B, 0x6f, 0x62, 0x6a, 0x65, 0x63, 0x74, 0x43, 0x6c, 0x61, 0x73,
            0x73, // present "objectClass" (nested TLV form)
            0x30, 0x00, // attributes empty SEQUENCE
        ];
        let parsed = parse_ldap_message(&msg).unwrap();
        match &parsed.protocol_op {
            ProtocolOp::SearchRequest(sr) => {
                assert_eq!(sr.base_object, "");
                assert_eq!(sr.scope, SearchScope::WholeSubtree);
                assert_eq!(sr.filter.to_filter_string(), "(objectClass=*)");
            }
            _ => panic!("expected SearchRequest"),
        }
    }

    #[test]
    fn parse_search_request_filter_present_raw_content() {
        // present filter with raw attribute bytes (no nested TLV), the form
        // conforming clients send
        let msg = vec![
            0x30, 0x25, 0x02, 0x01, 0x02, 0x63, 0x20, 0x04, 0x00, 0x0A, 0x01, 0x00, 0x0A, 0x01,
            0x00, 0x02, 0x01, 0x00, 0x02, 0x01, 0x00, 0x01, 0x01, 0x00, 0x87, 0x0B, 0x6f, 0x62,
            0x6a, 0x65, 0x63, 0x74, 0x63, 0x6c, 0x61, 0x73, 0x73, 0x30, 0x00,
        ];
        let parsed = parse_ldap_message(&msg).unwrap();
        match &parsed.protocol_op {
            ProtocolOp::SearchRequest(sr) => {
                assert_eq!(sr.scope, SearchScope::BaseObject);
                assert_eq!(sr.filter.to_filter_string(), "(objectclass=*)");
            }
            _ => panic!("expected SearchRequest"),
        }
    }

    #[test]
    fn parse_search_request_filter_equality() {
        let msg = vec![
            0x30, 0x25, 0x02, 0x01, 0x01, 0x63, 0x20, 0x04, 0x00, 0x0A, 0x01, 0x02, 0x0A, 0x01,
            0x00, 0x02, 0x01, 0x00, 0x02, 0x01, 0x00, 0x01, 0x01, 0x00,
            // equalityMatch (cn=admin), fields inlined without inner SEQUENCE
            0xA3, 0x0B, 0x04, 0x02, 0x63, 0x6E, 0x04, 0x05, 0x61, 0x64, 0x6D, 0x69, 0x6E,
            0x30, 0x00,
        ];
        let parsed = parse_ldap_message(&msg).unwrap();
        match &parsed.protocol_op {
            ProtocolOp::SearchRequest(sr) => {
                match &sr.filter {
                    Filter::EqualityMatch { attribute, value } => {
                        assert_eq!(attribute, "cn");
                        assert_eq!(value.as_slice(), b"admin");
                    }
                    other => panic!("expected EqualityMatch, got {:?}", other),
                }
                assert_eq!(sr.filter.to_filter_string(), "(cn=admin)");
            }
            _ => panic!("expected SearchRequest"),
        }
    }

    #[test]
    fn parse_extended_request_with_value() {
        // [APPLICATION 23] { requestName [0] "1.3.6.1.1.8", requestValue [1] bytes }
        let name = b"1.3.6.1.1.8";
        let value = [0x30, 0x03, 0x02, 0x01, 0x02];
        let mut msg = vec![
            0x30, (9 + name.len() + value.len()) as u8,
            0x02, 0x01, 0x03,
            0x77, (4 + name.len() + value.len()) as u8,
            0x80, name.len() as u8,
        ];
        msg.extend_from_slice(name);
        msg.push(0x81);
        msg.push(value.len() as u8);
        msg.extend_from_slice(&value);
        let parsed = parse_ldap_message(&msg).unwrap();
        match &parsed.protocol_op {
            ProtocolOp::ExtendedRequest(r) => {
                assert_eq!(r.request_name, "1.3.6.1.1.8");
                assert_eq!(r.request_value.as_deref(), Some(&value[..]));
            }
            _ => panic!("expected ExtendedRequest"),
        }
    }

    #[test]
    fn parse_extended_request_without_value() {
        let name = b"1.3.6.1.4.1.4203.1.11.3";
        let mut msg = vec![
            0x30, (7 + name.len()) as u8,
            0x02, 0x01, 0x02,
            0x77, (2 + name.len()) as u8,
            0x80, name.len() as u8,
        ];
        msg.extend_from_slice(name);
        let parsed = parse_ldap_message(&msg).unwrap();
        match &parsed.protocol_op {
            ProtocolOp::ExtendedRequest(r) => {
                assert_eq!(r.request_name, OID_WHOAMI);
                assert!(r.request_value.is_none());
            }
            _ => panic!("expected ExtendedRequest"),
        }
    }

    #[test]
    fn encode_bind_response_roundtrip_header() {
        let message = LdapMessage {
            message_id: 1,
            protocol_op: ProtocolOp::BindResponse(BindResponse {
                result_code: RESULT_INVALID_CREDENTIALS,
                diagnostic_message: "invalid credentials".to_string(),
                ..Default::default()
            }),
            controls: None,
        };
        let encoded = encode_ldap_message(&message).unwrap();
        let (id, tag) = parse_ldap_message_header(&encoded).unwrap();
        assert_eq!(id, 1);
        assert_eq!(tag, LDAP_TAG_BIND_RESPONSE);
        // resultCode is the first element inside the response
        assert_eq!(encoded[7], 0x0A);
        assert_eq!(encoded[9], RESULT_INVALID_CREDENTIALS as u8);
    }

    #[test]
    fn encode_search_result_entry_uses_value_set() {
        let mut entry = SearchResultEntry {
            object_name: "cn=test,dc=example,dc=com".to_string(),
            ..Default::default()
        };
        entry.add_attribute("cn", &["test"]);
        entry.add_attribute("mail", &["test@example.com", "t@example.com"]);
        let message = LdapMessage {
            message_id: 3,
            protocol_op: ProtocolOp::SearchResultEntry(entry),
            controls: None,
        };
        let encoded = encode_ldap_message(&message).unwrap();
        let (_, tag) = parse_ldap_message_header(&encoded).unwrap();
        assert_eq!(tag, LDAP_TAG_SEARCH_RESULT_ENTRY);
        assert!(encoded.contains(&0x31), "attribute values must be a SET");
    }

    #[test]
    fn encode_extended_response_context_tags() {
        let mut resp = ExtendedResponse::default();
        resp.set_response_name(OID_WHOAMI);
        resp.set_response_value(b"dn:cn=test".to_vec());
        let message = LdapMessage {
            message_id: 7,
            protocol_op: ProtocolOp::ExtendedResponse(resp),
            controls: None,
        };
        let encoded = encode_ldap_message(&message).unwrap();
        assert!(encoded.windows(2).any(|w| w[0] == 0x8A && w[1] == OID_WHOAMI.len() as u8));
        assert!(encoded.windows(2).any(|w| w[0] == 0x8B && w[1] == 10));
    }

    #[test]
    fn encode_search_result_done_with_referral() {
        let mut done = SearchResultDone::default();
        done.set_result_code(RESULT_REFERRAL);
        done.set_referral(vec!["ldap://alt.example/dc=redirect,dc=example".to_string()]);
        let message = LdapMessage {
            message_id: 2,
            protocol_op: ProtocolOp::SearchResultDone(done),
            controls: None,
        };
        let encoded = encode_ldap_message(&message).unwrap();
        assert!(encoded.contains(&0xA3), "referral [3] expected in encoding");
    }

    #[test]
    fn encode_search_result_reference() {
        let message = LdapMessage {
            message_id: 2,
            protocol_op: ProtocolOp::SearchResultReference(SearchResultReference {
                uris: vec!["ldap://other.example/dc=ref,dc=example".to_string()],
            }),
            controls: None,
        };
        let encoded = encode_ldap_message(&message).unwrap();
        let (_, tag) = parse_ldap_message_header(&encoded).unwrap();
        assert_eq!(tag, LDAP_TAG_SEARCH_RESULT_REFERENCE);
    }

    #[test]
    fn encode_message_with_controls() {
        let message = LdapMessage {
            message_id: 2,
            protocol_op: ProtocolOp::SearchResultDone(SearchResultDone::default()),
            controls: Some(vec![Control {
                control_type: "1.2.3.4.5.6.7.8.9".to_string(),
                criticality: false,
                value: None,
            }]),
        };
        let encoded = encode_ldap_message(&message).unwrap();
        assert!(encoded.contains(&0xA0), "controls [0] expected in encoding");
    }

    #[test]
    fn encode_request_op_fails() {
        let message = LdapMessage {
            message_id: 1,
            protocol_op: ProtocolOp::UnbindRequest,
            controls: None,
        };
        assert!(encode_ldap_message(&message).is_err());
    }

    #[test]
    fn frame_incomplete_then_message() {
        let full = vec![0x30, 0x05, 0x02, 0x01, 0x07, 0x42, 0x00];
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&full[..3]);
        assert!(matches!(try_read_message(&mut buf).unwrap(), FrameResult::Incomplete));
        buf.extend_from_slice(&full[3..]);
        match try_read_message(&mut buf).unwrap() {
            FrameResult::Message(m) => {
                assert_eq!(m.message_id, 7);
                assert!(matches!(m.protocol_op, ProtocolOp::UnbindRequest));
            }
            _ => panic!("expected Message"),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn frame_pipelined_messages() {
        let one = vec![0x30, 0x05, 0x02, 0x01, 0x01, 0x42, 0x00];
        let two = vec![0x30, 0x06, 0x02, 0x01, 0x02, 0x50, 0x01, 0x01];
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&one);
        buf.extend_from_slice(&two);
        assert!(matches!(try_read_message(&mut buf).unwrap(), FrameResult::Message(_)));
        match try_read_message(&mut buf).unwrap() {
            FrameResult::Message(m) => assert_eq!(m.message_id, 2),
            _ => panic!("expected second Message"),
        }
    }

    #[test]
    fn frame_garbage_first_byte_is_fatal() {
        // 0x16 = TLS ClientHello on a cleartext listener
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0x16, 0x03, 0x01, 0x00, 0x05]);
        assert!(try_read_message(&mut buf).is_err());
    }

    #[test]
    fn frame_bad_op_resyncs_on_envelope_boundary() {
        // Valid envelope with an unsupported operation tag, then a valid unbind
        let bad = vec![0x30, 0x05, 0x02, 0x01, 0x01, 0x7F, 0x00];
        let good = vec![0x30, 0x05, 0x02, 0x01, 0x02, 0x42, 0x00];
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&bad);
        buf.extend_from_slice(&good);
        match try_read_message(&mut buf).unwrap() {
            FrameResult::Skip { consumed, message_id } => {
                assert_eq!(consumed, bad.len());
                assert_eq!(message_id, 1);
            }
            _ => panic!("expected Skip"),
        }
        assert!(matches!(try_read_message(&mut buf).unwrap(), FrameResult::Message(_)));
    }

    #[test]
    fn filter_to_string_forms() {
        let f = Filter::Present("objectClass".to_string());
        assert_eq!(f.to_filter_string(), "(objectClass=*)");

        let f = Filter::EqualityMatch { attribute: "cn".to_string(), value: b"admin".to_vec() };
        assert_eq!(f.to_filter_string(), "(cn=admin)");

        let f = Filter::And(vec![
            Filter::Present("objectClass".to_string()),
            Filter::EqualityMatch { attribute: "uid".to_string(), value: b"jdoe".to_vec() },
        ]);
        assert_eq!(f.to_filter_string(), "(&(objectClass=*)(uid=jdoe))");
    }

    #[test]
    fn protocol_op_kind_and_name() {
        let op = ProtocolOp::AbandonRequest(3);
        assert_eq!(op.kind(), OpKind::Abandon);
        assert_eq!(op.name(), "AbandonRequest");
        let op = ProtocolOp::ExtendedRequest(ExtendedRequest {
            request_name: OID_CANCEL.to_string(),
            request_value: None,
        });
        assert_eq!(op.kind(), OpKind::Extended);
    }
}
