//! Wire format for topic datagrams.
//!
//! ```text
//! request:  00 83 <len:u16 BE> 00 00 00 00 00 '?' <query> 00
//! reply:    00 83 <len:u16 BE> 06 <query> 00      (text)
//!           00 83 <len:u16 BE> 2a <f32 LE>        (number)
//! ```
//!
//! `len` counts every byte after the four-byte header. Queries are
//! form-urlencoded key/value pairs.

use std::collections::BTreeMap;

use thiserror::Error;

pub const MAGIC: [u8; 2] = [0x00, 0x83];
pub const TYPE_TEXT: u8 = 0x06;
pub const TYPE_NUMBER: u8 = 0x2a;
const REQUEST_PADDING: usize = 5;
const HEADER_LEN: usize = 4;

/// Key under which a numeric reply is surfaced.
pub const NUMBER_KEY: &str = "value";

pub type TopicParams = BTreeMap<String, String>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("packet too short ({0} bytes)")]
    TooShort(usize),
    #[error("bad packet magic {0:02x?}")]
    BadMagic([u8; 2]),
    #[error("length field says {declared} bytes but {actual} follow")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("unknown reply type 0x{0:02x}")]
    UnknownType(u8),
    #[error("payload is missing its terminator")]
    Unterminated,
    #[error("payload is not valid UTF-8")]
    InvalidUtf8,
    #[error("payload of {0} bytes does not fit in one packet")]
    TooLarge(usize),
    #[error("request does not start with '?'")]
    MissingQueryMarker,
}

pub fn encode_query(params: &TopicParams) -> String {
    url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(params.iter())
        .finish()
}

pub fn decode_query(query: &str) -> TopicParams {
    url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect()
}

fn frame(body: &[u8]) -> Result<Vec<u8>, CodecError> {
    let len = u16::try_from(body.len()).map_err(|_| CodecError::TooLarge(body.len()))?;
    let mut packet = Vec::with_capacity(HEADER_LEN + body.len());
    packet.extend_from_slice(&MAGIC);
    packet.extend_from_slice(&len.to_be_bytes());
    packet.extend_from_slice(body);
    Ok(packet)
}

fn unframe(packet: &[u8]) -> Result<&[u8], CodecError> {
    if packet.len() < HEADER_LEN + 1 {
        return Err(CodecError::TooShort(packet.len()));
    }
    if packet[..2] != MAGIC {
        return Err(CodecError::BadMagic([packet[0], packet[1]]));
    }
    let declared = u16::from_be_bytes([packet[2], packet[3]]) as usize;
    let body = &packet[HEADER_LEN..];
    if declared != body.len() {
        return Err(CodecError::LengthMismatch {
            declared,
            actual: body.len(),
        });
    }
    Ok(body)
}

fn text_until_nul(bytes: &[u8]) -> Result<&str, CodecError> {
    let end = bytes
        .iter()
        .position(|b| *b == 0)
        .ok_or(CodecError::Unterminated)?;
    std::str::from_utf8(&bytes[..end]).map_err(|_| CodecError::InvalidUtf8)
}

pub fn encode_request(params: &TopicParams) -> Result<Vec<u8>, CodecError> {
    let query = encode_query(params);
    let mut body = Vec::with_capacity(REQUEST_PADDING + query.len() + 2);
    body.extend_from_slice(&[0u8; REQUEST_PADDING]);
    body.push(b'?');
    body.extend_from_slice(query.as_bytes());
    body.push(0);
    frame(&body)
}

pub fn decode_request(packet: &[u8]) -> Result<TopicParams, CodecError> {
    let body = unframe(packet)?;
    if body.len() < REQUEST_PADDING + 1 {
        return Err(CodecError::TooShort(packet.len()));
    }
    let text = text_until_nul(&body[REQUEST_PADDING..])?;
    let query = text
        .strip_prefix('?')
        .ok_or(CodecError::MissingQueryMarker)?;
    Ok(decode_query(query))
}

pub fn encode_reply(params: &TopicParams) -> Result<Vec<u8>, CodecError> {
    let query = encode_query(params);
    let mut body = Vec::with_capacity(query.len() + 2);
    body.push(TYPE_TEXT);
    body.extend_from_slice(query.as_bytes());
    body.push(0);
    frame(&body)
}

pub fn encode_number_reply(value: f32) -> Vec<u8> {
    let mut packet = Vec::with_capacity(HEADER_LEN + 5);
    packet.extend_from_slice(&MAGIC);
    packet.extend_from_slice(&5u16.to_be_bytes());
    packet.push(TYPE_NUMBER);
    packet.extend_from_slice(&value.to_le_bytes());
    packet
}

pub fn decode_reply(packet: &[u8]) -> Result<TopicParams, CodecError> {
    let body = unframe(packet)?;
    match body[0] {
        TYPE_TEXT => Ok(decode_query(text_until_nul(&body[1..])?)),
        TYPE_NUMBER => {
            let raw: [u8; 4] = body
                .get(1..5)
                .and_then(|b| b.try_into().ok())
                .ok_or(CodecError::TooShort(packet.len()))?;
            let mut params = TopicParams::new();
            params.insert(NUMBER_KEY.to_string(), f32::from_le_bytes(raw).to_string());
            Ok(params)
        }
        other => Err(CodecError::UnknownType(other)),
    }
}
