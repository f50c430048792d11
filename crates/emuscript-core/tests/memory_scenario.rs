//! End-to-end memory API scenarios against the reference collaborator.

use emuscript_core::api::ScriptApi;
use emuscript_core::bridge::BridgeLimits;
use emuscript_core::memory::{
    EmulatedMemory, Endianness, FlatMemory, RegionConfig, SharedMemory, shared_memory,
};
use emuscript_core::memory_api::{MEMORY_CLASS, MemoryApi};
use emuscript_core::script_value::ScriptValue;
use emuscript_core::{ApiCallError, BridgeError};

fn setup() -> (MemoryApi, SharedMemory) {
    let memory = shared_memory(FlatMemory::mem1());
    (
        MemoryApi::new(memory.clone(), BridgeLimits::default()),
        memory,
    )
}

fn call(api: &MemoryApi, function: &str, args: &[ScriptValue]) -> Result<ScriptValue, ApiCallError> {
    let mut values = vec![ScriptValue::Receiver(MEMORY_CLASS.to_string())];
    values.extend_from_slice(args);
    api.call(function, &values)
}

fn s(text: &str) -> ScriptValue {
    ScriptValue::string(text)
}

fn n(value: i64) -> ScriptValue {
    ScriptValue::I64(value)
}

fn entry(table: &ScriptValue, key: i64) -> Option<&ScriptValue> {
    table
        .as_table()?
        .iter()
        .find_map(|(k, v)| (*k == n(key)).then_some(v))
}

#[test]
fn write_then_read_u32() {
    let (api, _) = setup();
    call(&api, "write", &[s("u32"), n(0x8000_0010), n(0xDEAD_BEEF)]).unwrap();
    assert_eq!(
        call(&api, "read", &[s("u32"), n(0x8000_0010)]).unwrap(),
        n(0xDEAD_BEEF)
    );
}

#[test]
fn wrapper_read_matches_collaborator_u16() {
    let (api, memory) = setup();
    call(&api, "write", &[s("u32"), n(0x8000_0010), n(0xDEAD_BEEF)]).unwrap();
    let expected = memory.lock().try_read_u16(0x8000_0010).unwrap();
    assert_eq!(expected, 0xDEAD);

    let ScriptValue::Wrapper(wrapper) =
        call(&api, "read", &[s("wrapper"), n(0x8000_0010), n(2)]).unwrap()
    else {
        panic!("expected a ByteWrapper");
    };
    assert_eq!(wrapper.required_byte_count(), 2);
    assert_eq!(wrapper.bits(), u64::from(expected));
}

#[test]
fn string_round_trip() {
    let (api, _) = setup();
    call(&api, "write_string", &[n(0x8000_0020), s("hi")]).unwrap();
    assert_eq!(
        call(&api, "read_null_terminated_string", &[n(0x8000_0020)]).unwrap(),
        s("hi")
    );
    assert_eq!(
        call(&api, "read_fixed_length_string", &[n(0x8000_0020), n(3)]).unwrap(),
        ScriptValue::string(&b"hi\0"[..])
    );
}

#[test]
fn write_bytes_duplicate_last_wins_and_range_is_atomic() {
    let (api, memory) = setup();
    let mapping = ScriptValue::table([
        (n(0x8000_0100), n(1)),
        (n(0x8000_0100), n(-1)),
        (n(0x8000_0101), n(0x7F)),
    ]);
    call(&api, "write_bytes", &[mapping]).unwrap();
    assert_eq!(memory.lock().try_read_u8(0x8000_0100), Some(0xFF));
    assert_eq!(memory.lock().try_read_u8(0x8000_0101), Some(0x7F));

    let bad = ScriptValue::table([(n(0x8000_0200), n(5)), (n(0x8000_0201), n(256))]);
    let err = call(&api, "write_bytes", &[bad]).unwrap_err();
    assert!(matches!(err.error, BridgeError::InvalidByteRange { value: 256, .. }));
    assert_eq!(memory.lock().try_read_u8(0x8000_0200), Some(0));

    let partly_unmapped = ScriptValue::table([(n(0x8000_0400), n(7)), (n(0x10), n(1))]);
    let err = call(&api, "write_bytes", &[partly_unmapped]).unwrap_err();
    assert!(err.error.is_memory_fault());
    assert_eq!(memory.lock().try_read_u8(0x8000_0400), Some(0));
}

#[test]
fn write_string_truncates_at_embedded_nul() {
    let (api, memory) = setup();
    call(&api, "write_string", &[n(0x8000_0500), s("ab\0cd")]).unwrap();
    let text = call(&api, "read_null_terminated_string", &[n(0x8000_0500)]).unwrap();
    assert_eq!(text, s("ab"));
    assert_eq!(memory.lock().try_read_u8(0x8000_0503), Some(0));
}

#[test]
fn signed_and_unsigned_byte_reads_are_keyed_by_address() {
    let (api, _) = setup();
    call(&api, "write", &[s("u16"), n(0x8000_0300), n(0x80FF)]).unwrap();

    let unsigned = call(&api, "read_unsigned_bytes", &[n(0x8000_0300), n(2)]).unwrap();
    assert_eq!(entry(&unsigned, 0x8000_0300), Some(&n(0x80)));
    assert_eq!(entry(&unsigned, 0x8000_0301), Some(&n(0xFF)));

    let signed = call(&api, "read_signed_bytes", &[n(0x8000_0300), n(2)]).unwrap();
    assert_eq!(entry(&signed, 0x8000_0300), Some(&n(-128)));
    assert_eq!(entry(&signed, 0x8000_0301), Some(&n(-1)));
}

#[test]
fn unmapped_address_faults_without_panicking() {
    let (api, _) = setup();
    let err = call(&api, "read", &[s("u32"), n(0x1000)]).unwrap_err();
    assert!(err.error.is_memory_fault());
    assert!(err.to_string().starts_with("Error in memory:read(): attempt to read_u32"));

    let err = call(&api, "write_string", &[n(0x7FFF_FFFF), s("x")]).unwrap_err();
    assert!(err.error.is_memory_fault());
}

#[test]
fn dot_call_is_usage_error() {
    let (api, _) = setup();
    let err = api.call("read_u8", &[n(0x8000_0000)]).unwrap_err();
    assert!(matches!(err.error, BridgeError::Usage { .. }));
    assert!(err.to_string().contains("colon operator"));
}

#[test]
fn unknown_type_name_is_reported() {
    let (api, _) = setup();
    let err = call(&api, "read", &[s("u128"), n(0x8000_0000)]).unwrap_err();
    assert!(matches!(err.error, BridgeError::UnrecognizedType { .. }));
}

#[test]
fn typed_aliases_and_float_values() {
    let (api, memory) = setup();
    call(&api, "write_float", &[n(0x8000_0400), ScriptValue::number(1.5)]).unwrap();
    assert_eq!(memory.lock().try_read_u32(0x8000_0400), Some(1.5f32.to_bits()));
    assert_eq!(
        call(&api, "readFrom", &[s("float"), n(0x8000_0400)]).unwrap(),
        ScriptValue::number(1.5)
    );
    call(&api, "write_s16", &[n(0x8000_0410), n(-2)]).unwrap();
    assert_eq!(call(&api, "read_u16", &[n(0x8000_0410)]).unwrap(), n(0xFFFE));
    assert_eq!(call(&api, "read_s16", &[n(0x8000_0410)]).unwrap(), n(-2));
}

#[test]
fn byte_order_belongs_to_the_collaborator() {
    let region = RegionConfig {
        name: "le".into(),
        base: 0x100,
        size: 0x100,
    };
    let memory = shared_memory(FlatMemory::new(&[region], Endianness::Little));
    let api = MemoryApi::new(memory.clone(), BridgeLimits::default());
    call(&api, "write", &[s("u32"), n(0x100), n(0x1122_3344)]).unwrap();
    let first = call(&api, "read_unsigned_bytes", &[n(0x100), n(1)]).unwrap();
    assert_eq!(entry(&first, 0x100), Some(&n(0x44)));
    assert_eq!(
        call(&api, "read", &[s("u32"), n(0x100)]).unwrap(),
        n(0x1122_3344)
    );
}
