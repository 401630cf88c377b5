//! Property tests for framing and payload encoding.

use proptest::prelude::*;
use unpi_client::codec::{PayloadCodec, Value};
use unpi_client::meta::{Param, ParamType};
use unpi_client::protocol::{build_frame, CmdType, FrameBuffer, SOF};
use unpi_client::Registry;

fn cmd_type() -> impl Strategy<Value = CmdType> {
    prop_oneof![Just(CmdType::Sreq), Just(CmdType::Areq), Just(CmdType::Srsp)]
}

/// True when a request layout decodes back without outside context.
///
/// Every length prefix must pair with the next dynamic field, and greedy
/// fields can only come last.
fn decodable(params: &[Param]) -> bool {
    let mut open_prefix = false;
    for (i, param) in params.iter().enumerate() {
        let last = i + 1 == params.len();
        match param.ty {
            ParamType::U8
            | ParamType::U16
            | ParamType::U32
            | ParamType::I16
            | ParamType::FixedBuffer(_)
            | ParamType::LongAddr => {}
            ParamType::PreLenU8 | ParamType::PreLenU16 | ParamType::PreLenList => {
                if open_prefix {
                    return false;
                }
                open_prefix = true;
            }
            ParamType::DynBuffer => {
                if !open_prefix {
                    return false;
                }
                open_prefix = false;
            }
            ParamType::ListBuffer => {
                if !open_prefix && !last {
                    return false;
                }
                open_prefix = false;
            }
            ParamType::Buffer | ParamType::DynU16Array => {
                if open_prefix || !last {
                    return false;
                }
            }
            ParamType::DevListBuffer
            | ParamType::ZdoMsgCb
            | ParamType::U8ZdoInd
            | ParamType::NwkListBuffer
            | ParamType::PreLenBeaconList => return false,
        }
    }
    !open_prefix
}

/// Builtin requests with a decodable layout, named `SUBSYS:command`.
fn decodable_requests() -> Vec<(String, Vec<Param>)> {
    let registry = Registry::builtin().unwrap();
    registry
        .subsystems()
        .flat_map(|subsystem| {
            subsystem
                .commands()
                .map(move |cmd| (format!("{}:{}", subsystem.name, cmd.name), cmd.req.clone()))
        })
        .filter(|(_, req)| decodable(req))
        .collect()
}

/// Values a parameter accepts. Prefixes are left for the encoder to derive.
///
/// `words` marks a `dynbuffer` counted by a `preLenList` prefix.
fn param_value(ty: ParamType, words: bool) -> BoxedStrategy<Option<Value>> {
    let value = match ty {
        ty if ty.is_prefix() => return Just(None).boxed(),
        ParamType::DynBuffer if words => prop::collection::vec(any::<u16>(), 0..16)
            .prop_map(Value::List)
            .boxed(),
        ParamType::U8 => any::<u8>().prop_map(Value::from).boxed(),
        ParamType::U16 => any::<u16>().prop_map(Value::from).boxed(),
        ParamType::U32 => any::<u32>().prop_map(Value::from).boxed(),
        ParamType::I16 => any::<i16>()
            .prop_map(|n| Value::Number(i64::from(n)))
            .boxed(),
        ParamType::FixedBuffer(len) => prop::collection::vec(any::<u8>(), len)
            .prop_map(Value::Bytes)
            .boxed(),
        ParamType::LongAddr => any::<u64>()
            .prop_map(|addr| Value::Address(format!("{:016x}", addr)))
            .boxed(),
        ParamType::Buffer | ParamType::DynBuffer => prop::collection::vec(any::<u8>(), 0..32)
            .prop_map(Value::Bytes)
            .boxed(),
        _ => prop::collection::vec(any::<u16>(), 0..16)
            .prop_map(Value::List)
            .boxed(),
    };
    value.prop_map(Some).boxed()
}

fn request_case() -> impl Strategy<Value = (String, Vec<Param>, Vec<Option<Value>>)> {
    prop::sample::select(decodable_requests()).prop_flat_map(|(name, params)| {
        let mut words = false;
        let values: Vec<_> = params
            .iter()
            .map(|p| {
                let strategy = param_value(p.ty, words);
                if p.ty.is_prefix() {
                    words = p.ty == ParamType::PreLenList;
                }
                strategy
            })
            .collect();
        (Just(name), Just(params), values)
    })
}

#[test]
fn test_builtin_requests_cover_dynamic_layouts() {
    let requests = decodable_requests();
    let has = |ty: ParamType| requests.iter().any(|(_, req)| req.iter().any(|p| p.ty == ty));
    assert!(has(ParamType::DynBuffer));
    assert!(has(ParamType::ListBuffer));
    assert!(has(ParamType::LongAddr));
    assert!(has(ParamType::PreLenList));
    assert!(requests.iter().any(|(name, _)| name == "SYS:osalNvWrite"));
}

proptest! {
    /// Where the byte stream is cut makes no difference.
    #[test]
    fn test_chunk_boundaries_do_not_matter(
        kind in cmd_type(),
        subsystem in 0u8..32,
        command in any::<u8>(),
        payload in prop::collection::vec(any::<u8>(), 0..=250),
        cuts in prop::collection::vec(any::<prop::sample::Index>(), 0..8),
    ) {
        let bytes = build_frame(kind, subsystem, command, &payload).unwrap();
        let mut points: Vec<usize> = cuts.iter().map(|i| i.index(bytes.len())).collect();
        points.sort_unstable();
        points.dedup();

        let mut buffer = FrameBuffer::new();
        let mut frames = Vec::new();
        let mut start = 0;
        for point in points.into_iter().chain(std::iter::once(bytes.len())) {
            frames.extend(buffer.push(&bytes[start..point]));
            start = point;
        }

        prop_assert_eq!(frames.len(), 1);
        let frame = &frames[0];
        prop_assert!(frame.is_valid());
        prop_assert_eq!(frame.cmd_type(), kind);
        prop_assert_eq!(frame.subsystem(), subsystem);
        prop_assert_eq!(frame.command(), command);
        prop_assert_eq!(frame.payload(), &payload[..]);
        prop_assert!(buffer.is_empty());
    }

    /// Noise before the start byte is skipped.
    #[test]
    fn test_leading_noise_is_skipped(
        noise in prop::collection::vec(any::<u8>().prop_filter("not SOF", |b| *b != SOF), 0..64),
        payload in prop::collection::vec(any::<u8>(), 0..32),
    ) {
        let bytes = build_frame(CmdType::Areq, 5, 192, &payload).unwrap();
        let mut stream = noise.clone();
        stream.extend_from_slice(&bytes);

        let frames = FrameBuffer::new().push(&stream);
        prop_assert_eq!(frames.len(), 1);
        prop_assert_eq!(frames[0].payload(), &payload[..]);
    }

    /// Any single flipped bit after the length byte fails the check.
    #[test]
    fn test_single_bit_error_is_detected(
        payload in prop::collection::vec(any::<u8>(), 0..64),
        position in any::<prop::sample::Index>(),
        bit in 0u8..8,
    ) {
        let mut bytes = build_frame(CmdType::Srsp, 1, 2, &payload).unwrap().to_vec();
        // header type/subsys through FCS
        let at = 2 + position.index(bytes.len() - 2);
        bytes[at] ^= 1 << bit;

        let frames = FrameBuffer::new().push(&bytes);
        prop_assert_eq!(frames.len(), 1);
        prop_assert!(!frames[0].is_valid());
    }

    /// NV write arguments survive encoding with the length derived.
    #[test]
    fn test_nv_write_round_trip(
        id in any::<u16>(),
        offset in any::<u8>(),
        value in prop::collection::vec(any::<u8>(), 0..200),
    ) {
        let registry = Registry::builtin().unwrap();
        let (req, _) = registry.params(1, "osalNvWrite").unwrap();
        let args = vec![
            Some(Value::from(id)),
            Some(Value::from(offset)),
            None,
            Some(Value::from(value.clone())),
        ];

        let encoded = PayloadCodec::encode(req, &args).unwrap();
        prop_assert_eq!(encoded.len(), 4 + value.len());

        let fields = PayloadCodec::decode(req, &encoded, false).unwrap();
        prop_assert_eq!(&fields["id"], &Value::Number(i64::from(id)));
        prop_assert_eq!(&fields["offset"], &Value::Number(i64::from(offset)));
        prop_assert_eq!(&fields["len"], &Value::Number(value.len() as i64));
        prop_assert_eq!(&fields["value"], &Value::Bytes(value));
    }

    /// Every builtin request decodes back to the values it was encoded from.
    #[test]
    fn test_builtin_requests_decode_what_they_encode(
        (name, params, values) in request_case(),
    ) {
        let encoded = PayloadCodec::encode(&params, &values).unwrap();
        let fields = PayloadCodec::decode(&params, &encoded, false).unwrap();
        prop_assert_eq!(fields.len(), params.len(), "{}", name);

        for (i, param) in params.iter().enumerate() {
            let expected = match &values[i] {
                Some(value) => value.clone(),
                None => {
                    let target = i + params[i..].iter().position(|p| p.ty.is_dynamic()).unwrap();
                    let count = values[target].as_ref().and_then(Value::element_count).unwrap();
                    Value::Number(count as i64)
                }
            };
            prop_assert_eq!(&fields[&param.name], &expected, "{} field {}", name, param.name);
        }
    }
}
