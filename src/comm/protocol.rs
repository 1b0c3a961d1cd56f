use crate::comm::error::CommError;
use crate::comm::types::{MsgType, RequestPayload, ResponsePayload};
use rmp_serde::decode::Deserializer;
use rmp_serde::encode::Serializer;
use serde::Deserialize;
use std::io::Cursor;
use std::result::Result as StdResult;

/// Header length: type (1) + seq (4)
pub const HEADER_LEN: usize = 5;

/// Encode a packet with given type, sequence, and payload
pub fn encode_packet(
    msg_type: MsgType,
    seq: u32,
    payload: Option<&impl serde::Serialize>,
) -> StdResult<Vec<u8>, CommError> {
    let mut buf = Vec::new();

    // Write msg type (1 byte)
    buf.push(msg_type as u8);

    // Write seq (4 bytes, big-endian)
    buf.extend_from_slice(&seq.to_be_bytes());

    // Write payload if present, as a map so optional fields may be omitted
    if let Some(p) = payload {
        let mut ser = Serializer::new(&mut buf).with_struct_map();
        p.serialize(&mut ser).map_err(|e| CommError::EncodeError(e.to_string()))?;
    }

    Ok(buf)
}

/// Decode packet type and seq from raw bytes
pub fn decode_header(data: &[u8]) -> StdResult<(MsgType, u32), CommError> {
    if data.len() < HEADER_LEN {
        return Err(CommError::DecodeError("Packet too short".to_string()));
    }

    let msg_type = MsgType::from_u8(data[0])
        .ok_or_else(|| CommError::DecodeError(format!("Unknown msg type: {}", data[0])))?;

    let seq = u32::from_be_bytes([data[1], data[2], data[3], data[4]]);

    Ok((msg_type, seq))
}

/// Decode request payload
pub fn decode_request_payload(data: &[u8]) -> StdResult<RequestPayload, CommError> {
    let mut de = Deserializer::new(Cursor::new(data));
    RequestPayload::deserialize(&mut de).map_err(|e| CommError::DecodeError(e.to_string()))
}

/// Decode response payload
#[allow(dead_code)]
pub fn decode_response_payload(data: &[u8]) -> StdResult<ResponsePayload, CommError> {
    let mut de = Deserializer::new(Cursor::new(data));
    ResponsePayload::deserialize(&mut de).map_err(|e| CommError::DecodeError(e.to_string()))
}

/// Encode request ack (no payload)
pub fn encode_request_ack(seq: u32) -> StdResult<Vec<u8>, CommError> {
    encode_packet(MsgType::RequestAck, seq, None::<&()>)
}

/// Encode response
pub fn encode_response(seq: u32, payload: &ResponsePayload) -> StdResult<Vec<u8>, CommError> {
    encode_packet(MsgType::Response, seq, Some(payload))
}

/// Encode a response, truncating its text fields until the payload fits
pub fn encode_response_within(
    seq: u32,
    payload: &ResponsePayload,
    max_payload_bytes: usize,
) -> StdResult<Vec<u8>, CommError> {
    let mut packet = encode_response(seq, payload)?;
    if packet.len() - HEADER_LEN <= max_payload_bytes {
        return Ok(packet);
    }

    let mut shrunk = payload.clone();
    while packet.len() - HEADER_LEN > max_payload_bytes {
        if !shrunk.shrink_longest_field() {
            return Err(CommError::PayloadTooLarge(packet.len() - HEADER_LEN));
        }
        packet = encode_response(seq, &shrunk)?;
    }
    Ok(packet)
}
