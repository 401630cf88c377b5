//! Parameter types understood by the serializer.
//!
//! Type tags in definition files are resolved once at load time into the
//! closed [`ParamType`] enum. An unknown tag fails the load.

use std::fmt;
use std::str::FromStr;

use crate::error::UnpiError;

/// Semantic type of one command parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamType {
    /// `uint8`
    U8,
    /// `uint16`, little-endian.
    U16,
    /// `uint32`, little-endian.
    U32,
    /// `int16`, little-endian.
    I16,
    /// `bufferN`: exactly N raw bytes.
    FixedBuffer(usize),
    /// `buffer`: raw bytes, written as given, parsed as the remaining bytes.
    Buffer,
    /// `dynbuffer`: raw bytes whose count comes from a preceding length prefix.
    DynBuffer,
    /// `_preLenUint8`: count of the following dynamic field.
    PreLenU8,
    /// `_preLenUint16`: count of the following dynamic field.
    PreLenU16,
    /// `longaddr`: 64-bit IEEE address as 16 hex characters.
    LongAddr,
    /// `listbuffer`: list of u16 values, contiguous little-endian.
    ListBuffer,
    /// `dynUint16a`: every remaining byte pair as a u16 list.
    DynU16Array,
    /// `devlistbuffer`: total length minus 13 bytes as a u16 list.
    DevListBuffer,
    /// `zdomsgcb`: total length minus 9 raw bytes.
    ZdoMsgCb,
    /// `uint8ZdoInd`: `nwkaddr` + u8 when the payload is 3 bytes, u8 when it is 1.
    U8ZdoInd,
    /// `nwklistbuffer`: total length minus 6 bytes of management table
    /// records, laid out by field name. Decode only.
    NwkListBuffer,
    /// `preLenList`: u8 count of u16 items in the following `dynbuffer`.
    PreLenList,
    /// `preLenBeaconlist`: u8 count of 21-byte beacon records in the
    /// following `dynbuffer`. Decode only.
    PreLenBeaconList,
}

impl ParamType {
    /// True for the length-prefix types.
    #[inline]
    pub fn is_prefix(self) -> bool {
        matches!(
            self,
            ParamType::PreLenU8
                | ParamType::PreLenU16
                | ParamType::PreLenList
                | ParamType::PreLenBeaconList
        )
    }

    /// True for types whose element count a length prefix supplies.
    #[inline]
    pub fn is_dynamic(self) -> bool {
        matches!(self, ParamType::DynBuffer | ParamType::ListBuffer)
    }

    /// Wire width when it does not depend on the value or the payload.
    pub fn fixed_width(self) -> Option<usize> {
        match self {
            ParamType::U8
            | ParamType::PreLenU8
            | ParamType::PreLenList
            | ParamType::PreLenBeaconList => Some(1),
            ParamType::U16 | ParamType::I16 | ParamType::PreLenU16 => Some(2),
            ParamType::U32 => Some(4),
            ParamType::LongAddr => Some(8),
            ParamType::FixedBuffer(n) => Some(n),
            _ => None,
        }
    }
}

impl FromStr for ParamType {
    type Err = UnpiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "uint8" => ParamType::U8,
            "uint16" => ParamType::U16,
            "uint32" => ParamType::U32,
            "int16" => ParamType::I16,
            "buffer" => ParamType::Buffer,
            "dynbuffer" => ParamType::DynBuffer,
            "_preLenUint8" => ParamType::PreLenU8,
            "_preLenUint16" => ParamType::PreLenU16,
            "longaddr" => ParamType::LongAddr,
            "listbuffer" => ParamType::ListBuffer,
            "dynUint16a" => ParamType::DynU16Array,
            "devlistbuffer" => ParamType::DevListBuffer,
            "zdomsgcb" => ParamType::ZdoMsgCb,
            "uint8ZdoInd" => ParamType::U8ZdoInd,
            "nwklistbuffer" => ParamType::NwkListBuffer,
            "preLenList" => ParamType::PreLenList,
            "preLenBeaconlist" => ParamType::PreLenBeaconList,
            other => match other.strip_prefix("buffer").map(str::parse::<usize>) {
                Some(Ok(n)) => ParamType::FixedBuffer(n),
                _ => {
                    return Err(UnpiError::Serialization(format!(
                        "Unknown data type '{}'",
                        other
                    )))
                }
            },
        })
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamType::U8 => f.write_str("uint8"),
            ParamType::U16 => f.write_str("uint16"),
            ParamType::U32 => f.write_str("uint32"),
            ParamType::I16 => f.write_str("int16"),
            ParamType::FixedBuffer(n) => write!(f, "buffer{}", n),
            ParamType::Buffer => f.write_str("buffer"),
            ParamType::DynBuffer => f.write_str("dynbuffer"),
            ParamType::PreLenU8 => f.write_str("_preLenUint8"),
            ParamType::PreLenU16 => f.write_str("_preLenUint16"),
            ParamType::LongAddr => f.write_str("longaddr"),
            ParamType::ListBuffer => f.write_str("listbuffer"),
            ParamType::DynU16Array => f.write_str("dynUint16a"),
            ParamType::DevListBuffer => f.write_str("devlistbuffer"),
            ParamType::ZdoMsgCb => f.write_str("zdomsgcb"),
            ParamType::U8ZdoInd => f.write_str("uint8ZdoInd"),
            ParamType::NwkListBuffer => f.write_str("nwklistbuffer"),
            ParamType::PreLenList => f.write_str("preLenList"),
            ParamType::PreLenBeaconList => f.write_str("preLenBeaconlist"),
        }
    }
}

/// One named parameter of a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    pub name: String,
    pub ty: ParamType,
}

impl Param {
    pub fn new(name: impl Into<String>, ty: ParamType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}
