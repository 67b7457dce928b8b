//! Cancel extended operation (RFC 3909, OID 1.3.6.1.1.8): requestValue
//! codec and the built-in handler used when no route names the Cancel OID.

use crate::message::Message;
use crate::proto::{
    BerReader, BerWriter, RESULT_CANCELED, RESULT_CANNOT_CANCEL, RESULT_NO_SUCH_OPERATION,
    RESULT_PROTOCOL_ERROR,
};
use crate::registry::is_abortable;
use crate::response::{new_extended_response, ResponseWriter};
use anyhow::{bail, Context, Result};
use std::sync::Arc;

/// Decode `cancelRequestValue ::= SEQUENCE { cancelID MessageID }`.
/// The cancelID must be >= 1 and no octets may follow the SEQUENCE.
pub fn parse_cancel_request_value(raw: Option<&[u8]>) -> Result<i32> {
    let raw = raw.context("cancel request: missing requestValue")?;
    if raw.is_empty() {
        bail!("cancel request: empty requestValue");
    }
    let mut reader = BerReader::new(raw);
    let seq_len = reader
        .read_sequence()
        .context("cancel request: failed to decode requestValue")?;
    let seq_end = reader.position() + seq_len;
    let cancel_id = reader
        .read_integer()
        .context("cancel request: failed to decode cancelID")?;
    if reader.position() != seq_end || reader.remaining() > 0 {
        bail!("cancel request: trailing data after requestValue");
    }
    if cancel_id < 1 {
        bail!("cancel request: invalid cancelID {}", cancel_id);
    }
    Ok(cancel_id)
}

/// Encode a cancelRequestValue for the given message id.
pub fn encode_cancel_request_value(cancel_id: i32) -> Vec<u8> {
    let mut writer = BerWriter::new();
    let seq = writer.start_sequence();
    writer.write_integer(cancel_id);
    writer.end_sequence(seq);
    writer.into_vec()
}

/// Built-in Cancel handler: decode the target id, look it up on this
/// connection, enforce RFC 3909 section 2 eligibility, signal the target
/// and answer `Canceled(118)`. The target's handler is expected to observe
/// its done signal and emit its own terminal response with code 118.
pub(crate) async fn handle_cancel(w: ResponseWriter, m: Arc<Message>) {
    let request_value = m
        .get_extended_request()
        .and_then(|r| r.request_value.as_deref());

    let cancel_id = match parse_cancel_request_value(request_value) {
        Ok(id) => id,
        Err(e) => {
            let mut res = new_extended_response(RESULT_PROTOCOL_ERROR);
            res.set_diagnostic_message(e.to_string());
            let _ = w.write(res).await;
            return;
        }
    };

    let target = match m.client().get_message_by_id(cancel_id) {
        Some(target) => target,
        None => {
            let _ = w.write(new_extended_response(RESULT_NO_SUCH_OPERATION)).await;
            return;
        }
    };

    if !is_abortable(target.protocol_op()) {
        let _ = w.write(new_extended_response(RESULT_CANNOT_CANCEL)).await;
        return;
    }

    tracing::debug!(
        client = m.client().id(),
        target = cancel_id,
        "cancel signalled"
    );
    target.abandon();
    let _ = w.write(new_extended_response(RESULT_CANCELED)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_value_roundtrip() {
        for id in [1, 2, 127, 128, 9999, i32::MAX] {
            let encoded = encode_cancel_request_value(id);
            let decoded = parse_cancel_request_value(Some(&encoded)).unwrap();
            assert_eq!(decoded, id, "cancelID {}", id);
        }
    }

    #[test]
    fn cancel_value_missing_or_empty() {
        assert!(parse_cancel_request_value(None).is_err());
        assert!(parse_cancel_request_value(Some(&[])).is_err());
    }

    #[test]
    fn cancel_value_zero_rejected() {
        let encoded = encode_cancel_request_value(0);
        assert!(parse_cancel_request_value(Some(&encoded)).is_err());
    }

    #[test]
    fn cancel_value_negative_rejected() {
        let encoded = encode_cancel_request_value(-5);
        assert!(parse_cancel_request_value(Some(&encoded)).is_err());
    }

    #[test]
    fn cancel_value_trailing_bytes_rejected() {
        let mut encoded = encode_cancel_request_value(2);
        encoded.push(0x00);
        assert!(parse_cancel_request_value(Some(&encoded)).is_err());
    }

    #[test]
    fn cancel_value_trailing_inside_sequence_rejected() {
        // SEQUENCE { INTEGER 2, INTEGER 3 }
        let value = vec![0x30, 0x06, 0x02, 0x01, 0x02, 0x02, 0x01, 0x03];
        assert!(parse_cancel_request_value(Some(&value)).is_err());
    }

    #[test]
    fn cancel_value_not_a_sequence_rejected() {
        let value = vec![0x02, 0x01, 0x02];
        assert!(parse_cancel_request_value(Some(&value)).is_err());
    }
}
