//! Metadata-driven payload encoding and decoding.
//!
//! Each [`ParamType`] maps to one writer and one reader. Integers are
//! little-endian. A length prefix describes the next `dynbuffer` or
//! `listbuffer` field; some response shapes instead derive a field's width
//! from the total payload length. Management tables and beacon lists decode
//! into [`Value::Records`].

use bytes::{BufMut, Bytes, BytesMut};

use super::records;
use super::value::{Fields, Value};
use crate::error::{Result, UnpiError};
use crate::meta::{Param, ParamType};

/// Width of the generic response layout.
pub const GENERIC_RSP_LEN: usize = 6;

/// Fixed bytes ahead of a `devlistbuffer` list.
const DEVLIST_HEADER_LEN: usize = 13;

/// Fixed bytes ahead of a `zdomsgcb` body.
const ZDOMSGCB_HEADER_LEN: usize = 9;

/// Fixed bytes ahead of a `nwklistbuffer` table.
const NWKLIST_HEADER_LEN: usize = 6;

/// What a decoded length prefix counts.
#[derive(Debug, Clone, Copy)]
enum Prefix {
    Bytes(usize),
    Words(usize),
    Beacons(usize),
}

impl Prefix {
    fn count(self) -> usize {
        match self {
            Prefix::Bytes(n) | Prefix::Words(n) | Prefix::Beacons(n) => n,
        }
    }
}

/// Payload codec driven by a parameter list.
pub struct PayloadCodec;

impl PayloadCodec {
    /// Serialize bound values in parameter order.
    ///
    /// `values` is aligned with `params`. A `None` is only allowed for a
    /// length prefix, whose value is then taken from the field it describes.
    pub fn encode(params: &[Param], values: &[Option<Value>]) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(32);
        // the pending prefix counts u16 items rather than bytes
        let mut words = false;

        for (i, param) in params.iter().enumerate() {
            let value = values.get(i).and_then(Option::as_ref);

            if param.ty == ParamType::PreLenBeaconList {
                return Err(decode_only(param));
            }
            if param.ty.is_prefix() {
                let count = dynamic_count(params, values, i)?;
                if let Some(given) = value {
                    let given = given.as_i64().ok_or_else(|| type_mismatch(param, given))?;
                    if given != count as i64 {
                        return Err(UnpiError::Serialization(format!(
                            "expected preLen {} to be equal to {}",
                            given, count
                        )));
                    }
                }
                if param.ty == ParamType::PreLenU16 {
                    buf.put_u16_le(narrow::<u16>(param, count as i64)?);
                } else {
                    buf.put_u8(narrow::<u8>(param, count as i64)?);
                }
                words = param.ty == ParamType::PreLenList;
                continue;
            }

            let value = value.ok_or_else(|| {
                UnpiError::Serialization(format!("no value for parameter '{}'", param.name))
            })?;
            if param.ty.is_dynamic() && std::mem::take(&mut words) {
                for item in as_u16_vec(param, value)? {
                    buf.put_u16_le(item);
                }
                continue;
            }
            write_value(&mut buf, param, value)?;
        }

        Ok(buf.freeze())
    }

    /// Decode a payload into named fields.
    ///
    /// The payload must be consumed exactly. When it does not fit and
    /// `generic_rsp` is set, a 6-byte payload is decoded with the generic
    /// `srcaddr/status/nwkaddr/len` layout instead.
    pub fn decode(params: &[Param], data: &[u8], generic_rsp: bool) -> Result<Fields> {
        match decode_exact(params, data) {
            Ok(fields) => Ok(fields),
            Err(err) if generic_rsp && data.len() == GENERIC_RSP_LEN => {
                tracing::debug!("falling back to generic response layout: {}", err);
                decode_generic(data)
            }
            Err(err) => Err(err),
        }
    }
}

fn type_mismatch(param: &Param, value: &Value) -> UnpiError {
    UnpiError::Serialization(format!(
        "value {} does not fit parameter '{}' of type {}",
        value, param.name, param.ty
    ))
}

fn decode_only(param: &Param) -> UnpiError {
    UnpiError::Serialization(format!(
        "parameter '{}' of type {} cannot be encoded",
        param.name, param.ty
    ))
}

fn narrow<T: TryFrom<i64>>(param: &Param, n: i64) -> Result<T> {
    T::try_from(n).map_err(|_| {
        UnpiError::Serialization(format!(
            "{} out of range for parameter '{}' of type {}",
            n, param.name, param.ty
        ))
    })
}

/// Element count of the dynamic field a prefix at `at` describes.
fn dynamic_count(params: &[Param], values: &[Option<Value>], at: usize) -> Result<usize> {
    let target = params[at..]
        .iter()
        .position(|p| p.ty.is_dynamic())
        .map(|offset| at + offset)
        .ok_or_else(|| UnpiError::Serialization("unable to find dynamic data portion".into()))?;

    let param = &params[target];
    let value = values.get(target).and_then(Option::as_ref).ok_or_else(|| {
        UnpiError::Serialization(format!("no value for parameter '{}'", param.name))
    })?;
    value
        .element_count()
        .ok_or_else(|| type_mismatch(param, value))
}

fn write_value(buf: &mut BytesMut, param: &Param, value: &Value) -> Result<()> {
    match param.ty {
        ParamType::U8 | ParamType::U8ZdoInd => {
            let n = value.as_i64().ok_or_else(|| type_mismatch(param, value))?;
            buf.put_u8(narrow::<u8>(param, n)?);
        }
        ParamType::U16 => {
            let n = value.as_i64().ok_or_else(|| type_mismatch(param, value))?;
            buf.put_u16_le(narrow::<u16>(param, n)?);
        }
        ParamType::U32 => {
            let n = value.as_i64().ok_or_else(|| type_mismatch(param, value))?;
            buf.put_u32_le(narrow::<u32>(param, n)?);
        }
        ParamType::I16 => {
            let n = value.as_i64().ok_or_else(|| type_mismatch(param, value))?;
            buf.put_i16_le(narrow::<i16>(param, n)?);
        }
        ParamType::FixedBuffer(len) => {
            let bytes = as_byte_vec(param, value)?;
            if bytes.len() != len {
                return Err(UnpiError::Serialization(format!(
                    "parameter '{}' needs {} bytes, got {}",
                    param.name,
                    len,
                    bytes.len()
                )));
            }
            buf.put_slice(&bytes);
        }
        ParamType::Buffer | ParamType::DynBuffer | ParamType::ZdoMsgCb => {
            buf.put_slice(&as_byte_vec(param, value)?);
        }
        ParamType::LongAddr => {
            let text = value.as_str().ok_or_else(|| type_mismatch(param, value))?;
            buf.put_u64_le(parse_long_addr(text).ok_or_else(|| type_mismatch(param, value))?);
        }
        ParamType::ListBuffer | ParamType::DynU16Array | ParamType::DevListBuffer => {
            for item in as_u16_vec(param, value)? {
                buf.put_u16_le(item);
            }
        }
        ParamType::NwkListBuffer => return Err(decode_only(param)),
        ParamType::PreLenU8
        | ParamType::PreLenU16
        | ParamType::PreLenList
        | ParamType::PreLenBeaconList => {
            unreachable!("length prefixes are written by encode")
        }
    }
    Ok(())
}

fn as_byte_vec(param: &Param, value: &Value) -> Result<Vec<u8>> {
    match value {
        Value::Bytes(b) => Ok(b.clone()),
        Value::List(l) => l
            .iter()
            .map(|&n| u8::try_from(n).map_err(|_| type_mismatch(param, value)))
            .collect(),
        _ => Err(type_mismatch(param, value)),
    }
}

fn as_u16_vec(param: &Param, value: &Value) -> Result<Vec<u16>> {
    match value {
        Value::List(l) => Ok(l.clone()),
        Value::Bytes(b) => Ok(b.iter().map(|&n| u16::from(n)).collect()),
        _ => Err(type_mismatch(param, value)),
    }
}

/// Parse a 16 hex digit address, with or without a `0x` prefix.
fn parse_long_addr(text: &str) -> Option<u64> {
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    if digits.len() != 16 || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u64::from_str_radix(digits, 16).ok()
}

/// Bounds-checked little-endian reader.
pub(super) struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(super) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub(super) fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub(super) fn take(&mut self, n: usize, name: &str) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(UnpiError::Parse(format!(
                "payload too short for '{}': need {} bytes, have {}",
                name,
                n,
                self.remaining()
            )));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub(super) fn u8(&mut self, name: &str) -> Result<u8> {
        Ok(self.take(1, name)?[0])
    }

    pub(super) fn u16(&mut self, name: &str) -> Result<u16> {
        let b = self.take(2, name)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn i16(&mut self, name: &str) -> Result<i16> {
        let b = self.take(2, name)?;
        Ok(i16::from_le_bytes([b[0], b[1]]))
    }

    /// 64-bit little-endian address as 16 lowercase hex characters.
    pub(super) fn addr(&mut self, name: &str) -> Result<String> {
        let b = self.take(8, name)?;
        let addr = u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]);
        Ok(format!("{:016x}", addr))
    }

    fn u32(&mut self, name: &str) -> Result<u32> {
        let b = self.take(4, name)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(super) fn u16_list(&mut self, bytes: usize, name: &str) -> Result<Vec<u16>> {
        if bytes % 2 != 0 {
            return Err(UnpiError::Parse(format!(
                "odd byte count {} for u16 list '{}'",
                bytes, name
            )));
        }
        Ok(self
            .take(bytes, name)?
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect())
    }
}

fn derived_width(total: usize, header: usize, name: &str) -> Result<usize> {
    total.checked_sub(header).ok_or_else(|| {
        UnpiError::Parse(format!(
            "payload of {} bytes too short for '{}'",
            total, name
        ))
    })
}

fn decode_exact(params: &[Param], data: &[u8]) -> Result<Fields> {
    let total = data.len();
    let mut reader = Reader::new(data);
    let mut fields = Fields::new();
    let mut prefix: Option<Prefix> = None;

    for param in params {
        let name = param.name.as_str();
        let value = match param.ty {
            ParamType::U8 => Value::from(reader.u8(name)?),
            ParamType::U16 => Value::from(reader.u16(name)?),
            ParamType::U32 => Value::from(reader.u32(name)?),
            ParamType::I16 => Value::from(reader.i16(name)?),
            ParamType::PreLenU8 => {
                let count = reader.u8(name)?;
                prefix = Some(Prefix::Bytes(count as usize));
                Value::from(count)
            }
            ParamType::PreLenU16 => {
                let count = reader.u16(name)?;
                prefix = Some(Prefix::Bytes(count as usize));
                Value::from(count)
            }
            ParamType::PreLenList => {
                let count = reader.u8(name)?;
                prefix = Some(Prefix::Words(count as usize));
                Value::from(count)
            }
            ParamType::PreLenBeaconList => {
                let count = reader.u8(name)?;
                prefix = Some(Prefix::Beacons(count as usize));
                Value::from(count)
            }
            ParamType::DynBuffer => match prefix.take() {
                Some(Prefix::Bytes(count)) => Value::Bytes(reader.take(count, name)?.to_vec()),
                Some(Prefix::Words(count)) => Value::List(reader.u16_list(count * 2, name)?),
                Some(Prefix::Beacons(count)) => {
                    Value::Records(records::beacons(&mut reader, count)?)
                }
                None => {
                    return Err(UnpiError::Parse(format!(
                        "dynbuffer '{}' has no length prefix",
                        name
                    )))
                }
            },
            ParamType::ListBuffer => {
                let bytes = match prefix.take() {
                    Some(p) => p.count() * 2,
                    None => reader.remaining(),
                };
                Value::List(reader.u16_list(bytes, name)?)
            }
            ParamType::FixedBuffer(len) => Value::Bytes(reader.take(len, name)?.to_vec()),
            ParamType::Buffer => {
                let rest = reader.remaining();
                Value::Bytes(reader.take(rest, name)?.to_vec())
            }
            ParamType::LongAddr => Value::Address(reader.addr(name)?),
            ParamType::DynU16Array => {
                let rest = reader.remaining();
                Value::List(reader.u16_list(rest, name)?)
            }
            ParamType::DevListBuffer => {
                let width = derived_width(total, DEVLIST_HEADER_LEN, name)?;
                Value::List(reader.u16_list(width, name)?)
            }
            ParamType::ZdoMsgCb => {
                let width = derived_width(total, ZDOMSGCB_HEADER_LEN, name)?;
                Value::Bytes(reader.take(width, name)?.to_vec())
            }
            ParamType::NwkListBuffer => {
                let width = derived_width(total, NWKLIST_HEADER_LEN, name)?;
                records::table(name, reader.take(width, name)?, &fields)?
            }
            ParamType::U8ZdoInd => match total {
                3 => {
                    fields.insert("nwkaddr".to_string(), Value::from(reader.u16("nwkaddr")?));
                    Value::from(reader.u8(name)?)
                }
                1 => Value::from(reader.u8(name)?),
                other => {
                    return Err(UnpiError::Parse(format!(
                        "'{}' expects a 1 or 3 byte payload, got {}",
                        name, other
                    )))
                }
            },
        };
        fields.insert(param.name.clone(), value);
    }

    if reader.remaining() != 0 {
        return Err(UnpiError::Parse(format!(
            "{} trailing bytes after last field",
            reader.remaining()
        )));
    }

    Ok(fields)
}

fn decode_generic(data: &[u8]) -> Result<Fields> {
    let mut reader = Reader::new(data);
    let mut fields = Fields::new();
    fields.insert("srcaddr".into(), Value::from(reader.u16("srcaddr")?));
    fields.insert("status".into(), Value::from(reader.u8("status")?));
    fields.insert("nwkaddr".into(), Value::from(reader.u16("nwkaddr")?));
    fields.insert("len".into(), Value::from(reader.u8("len")?));
    Ok(fields)
}
