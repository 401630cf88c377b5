//! Fixed layouts of ZDO management table entries and beacon notifications.
//!
//! A `nwklistbuffer` field is named after the table it carries, and its item
//! count was decoded earlier into a `<name>count` field. Beacon records
//! follow a `preLenBeaconlist` count.

use super::payload::Reader;
use super::value::{Fields, Value};
use crate::error::{Result, UnpiError};

type Layout = fn(&mut Reader<'_>) -> Result<Fields>;

/// Decode `count` beacon records.
pub(super) fn beacons(reader: &mut Reader<'_>, count: usize) -> Result<Vec<Fields>> {
    repeat(reader, count, beacon)
}

/// Decode the management table `name` from its raw bytes.
///
/// `decoded` holds the fields read so far. The data must be consumed exactly.
pub(super) fn table(name: &str, data: &[u8], decoded: &Fields) -> Result<Value> {
    let count_field = format!("{}count", name);
    let count = decoded
        .get(&count_field)
        .and_then(Value::as_i64)
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| {
            UnpiError::Parse(format!("'{}' needs a decoded '{}' field", name, count_field))
        })?;

    let mut reader = Reader::new(data);
    let value = match name {
        "networklist" => Value::Records(repeat(&mut reader, count, network)?),
        "neighborlqilist" => Value::Records(repeat(&mut reader, count, neighbor_lqi)?),
        "routingtablelist" => Value::Records(repeat(&mut reader, count, route)?),
        "bindingtablelist" => Value::Records(repeat(&mut reader, count, binding)?),
        "energylist" => Value::Bytes(reader.take(count, name)?.to_vec()),
        other => {
            return Err(UnpiError::Parse(format!(
                "no record layout for table '{}'",
                other
            )))
        }
    };

    if reader.remaining() != 0 {
        return Err(UnpiError::Parse(format!(
            "{} trailing bytes after {} '{}' entries",
            reader.remaining(),
            count,
            name
        )));
    }
    Ok(value)
}

fn repeat(reader: &mut Reader<'_>, count: usize, layout: Layout) -> Result<Vec<Fields>> {
    (0..count).map(|_| layout(reader)).collect()
}

/// `(byte & mask) >> shift`
fn bits(byte: u8, mask: u8, shift: u32) -> Value {
    Value::from((byte & mask) >> shift)
}

fn put(item: &mut Fields, name: &str, value: Value) {
    item.insert(name.to_string(), value);
}

/// 12 bytes.
fn network(r: &mut Reader<'_>) -> Result<Fields> {
    let mut item = Fields::new();
    put(&mut item, "panid", Value::from(r.u16("panid")?));
    r.take(6, "reserved")?;
    put(&mut item, "logicalchannel", Value::from(r.u8("logicalchannel")?));
    let profile = r.u8("stackprofile")?;
    put(&mut item, "stackprofile", bits(profile, 0x0F, 0));
    put(&mut item, "zigbeeversion", bits(profile, 0xF0, 4));
    let order = r.u8("beaconorder")?;
    put(&mut item, "beaconorder", bits(order, 0x0F, 0));
    put(&mut item, "superframeorder", bits(order, 0xF0, 4));
    put(&mut item, "permitjoin", Value::from(r.u8("permitjoin")?));
    Ok(item)
}

/// 22 bytes.
fn neighbor_lqi(r: &mut Reader<'_>) -> Result<Fields> {
    let mut item = Fields::new();
    put(&mut item, "extpanid", Value::Address(r.addr("extpanid")?));
    put(&mut item, "extaddr", Value::Address(r.addr("extaddr")?));
    put(&mut item, "nwkaddr", Value::from(r.u16("nwkaddr")?));
    let flags = r.u8("devicetype")?;
    put(&mut item, "devicetype", bits(flags, 0x03, 0));
    put(&mut item, "rxonwhenidle", bits(flags, 0x0C, 2));
    put(&mut item, "relationship", bits(flags, 0x70, 4));
    put(&mut item, "permitjoin", bits(r.u8("permitjoin")?, 0x03, 0));
    put(&mut item, "depth", Value::from(r.u8("depth")?));
    put(&mut item, "lqi", Value::from(r.u8("lqi")?));
    Ok(item)
}

/// 5 bytes.
fn route(r: &mut Reader<'_>) -> Result<Fields> {
    let mut item = Fields::new();
    put(&mut item, "destnwkaddr", Value::from(r.u16("destnwkaddr")?));
    let status = r.u8("routestatus")?;
    put(&mut item, "routestatus", bits(status, 0x07, 0));
    put(&mut item, "memoryconstrained", bits(status, 0x08, 3));
    put(&mut item, "manytoone", bits(status, 0x10, 4));
    put(&mut item, "routerecordrequired", bits(status, 0x20, 5));
    put(&mut item, "nexthopnwkaddr", Value::from(r.u16("nexthopnwkaddr")?));
    Ok(item)
}

/// 21 bytes with a 64-bit destination, 20 otherwise.
fn binding(r: &mut Reader<'_>) -> Result<Fields> {
    const ADDR_64BIT: u8 = 3;

    let mut item = Fields::new();
    put(&mut item, "srcaddr", Value::Address(r.addr("srcaddr")?));
    put(&mut item, "srcep", Value::from(r.u8("srcep")?));
    put(&mut item, "clusterid", Value::from(r.u16("clusterid")?));
    let mode = r.u8("dstaddrmode")?;
    put(&mut item, "dstaddrmode", Value::from(mode));
    put(&mut item, "dstaddr", Value::Address(r.addr("dstaddr")?));
    if mode == ADDR_64BIT {
        put(&mut item, "dstep", Value::from(r.u8("dstep")?));
    }
    Ok(item)
}

/// 21 bytes.
fn beacon(r: &mut Reader<'_>) -> Result<Fields> {
    let mut item = Fields::new();
    put(&mut item, "srcaddr", Value::from(r.u16("srcaddr")?));
    put(&mut item, "panid", Value::from(r.u16("panid")?));
    for name in [
        "logicalchannel",
        "permitjoin",
        "routercapacity",
        "devicecapacity",
        "protocolversion",
        "stackprofile",
        "lqi",
        "depth",
        "updateid",
    ] {
        put(&mut item, name, Value::from(r.u8(name)?));
    }
    put(&mut item, "extpanid", Value::Address(r.addr("extpanid")?));
    Ok(item)
}
