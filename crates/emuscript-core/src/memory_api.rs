//! The `memory` surface.

use crate::api::{Args, FunctionMetadata, ScriptApi};
use crate::bridge::{BridgeLimits, MemoryBridge};
use crate::error::BridgeError;
use crate::memory::SharedMemory;
use crate::script_value::ScriptValue;
use crate::value::{NumericKind, TaggedValue, TypeName, parse_type_name};
use bstr::BString;

pub const MEMORY_CLASS: &str = "memory";

const FUNCTIONS: &[FunctionMetadata] = &[
    FunctionMetadata::new("read", "memory:read(\"u32\", 0x80000043)"),
    FunctionMetadata::new("readFrom", "memory:readFrom(\"u32\", 0x80000043)"),
    FunctionMetadata::new("write", "memory:write(\"u32\", 0x80000043, 100)"),
    FunctionMetadata::new("writeTo", "memory:writeTo(\"u32\", 0x80000043, 100)"),
    FunctionMetadata::new("read_u8", "memory:read_u8(0x80000043)"),
    FunctionMetadata::new("read_u16", "memory:read_u16(0x80000043)"),
    FunctionMetadata::new("read_u32", "memory:read_u32(0x80000043)"),
    FunctionMetadata::new("read_u64", "memory:read_u64(0x80000043)"),
    FunctionMetadata::new("read_s8", "memory:read_s8(0x80000043)"),
    FunctionMetadata::new("read_s16", "memory:read_s16(0x80000043)"),
    FunctionMetadata::new("read_s32", "memory:read_s32(0x80000043)"),
    FunctionMetadata::new("read_s64", "memory:read_s64(0x80000043)"),
    FunctionMetadata::new("read_float", "memory:read_float(0x80000043)"),
    FunctionMetadata::new("read_double", "memory:read_double(0x80000043)"),
    FunctionMetadata::new("write_u8", "memory:write_u8(0x80000043, 41)"),
    FunctionMetadata::new("write_u16", "memory:write_u16(0x80000043, 41)"),
    FunctionMetadata::new("write_u32", "memory:write_u32(0x80000043, 41)"),
    FunctionMetadata::new("write_u64", "memory:write_u64(0x80000043, 41)"),
    FunctionMetadata::new("write_s8", "memory:write_s8(0x80000043, -41)"),
    FunctionMetadata::new("write_s16", "memory:write_s16(0x80000043, -41)"),
    FunctionMetadata::new("write_s32", "memory:write_s32(0x80000043, -41)"),
    FunctionMetadata::new("write_s64", "memory:write_s64(0x80000043, -41)"),
    FunctionMetadata::new("write_float", "memory:write_float(0x80000043, 41.5)"),
    FunctionMetadata::new("write_double", "memory:write_double(0x80000043, 41.5)"),
    FunctionMetadata::new(
        "read_unsigned_bytes",
        "memory:read_unsigned_bytes(0x80000456, 44)",
    ),
    FunctionMetadata::new("read_signed_bytes", "memory:read_signed_bytes(0x80000456, 44)"),
    FunctionMetadata::new(
        "read_fixed_length_string",
        "memory:read_fixed_length_string(0x80000043, 52)",
    ),
    FunctionMetadata::new(
        "read_null_terminated_string",
        "memory:read_null_terminated_string(0x80000043)",
    ),
    FunctionMetadata::new("write_bytes", "memory:write_bytes({[0x80000043] = 41})"),
    FunctionMetadata::new(
        "write_string",
        "memory:write_string(0x80000043, \"exampleString\")",
    ),
];

/// Typed access to the shared emulated memory.
pub struct MemoryApi {
    memory: SharedMemory,
    limits: BridgeLimits,
}

impl MemoryApi {
    pub fn new(memory: SharedMemory, limits: BridgeLimits) -> Self {
        Self { memory, limits }
    }

    /// Run `op` with the memory lock held for exactly this call.
    fn with_bridge<T>(
        &self,
        op: impl FnOnce(&mut MemoryBridge<'_>) -> Result<T, BridgeError>,
    ) -> Result<T, BridgeError> {
        let mut guard = self.memory.lock();
        let mut bridge = MemoryBridge::new(&mut *guard, self.limits);
        op(&mut bridge)
    }

    fn read(&self, type_name: TypeName, args: &Args<'_>) -> Result<ScriptValue, BridgeError> {
        let address = args.address(2)?;
        match type_name {
            TypeName::Numeric(kind) => self.read_kind(kind, address),
            TypeName::Wrapper => {
                let size = args.integer(3)?;
                let wrapper = self.with_bridge(|b| b.read_wrapper(address, size))?;
                Ok(ScriptValue::Wrapper(wrapper))
            }
        }
    }

    fn read_kind(&self, kind: NumericKind, address: u32) -> Result<ScriptValue, BridgeError> {
        let value = self.with_bridge(|b| b.read(kind, address))?;
        Ok(value.to_script())
    }

    fn write(&self, type_name: TypeName, args: &Args<'_>) -> Result<ScriptValue, BridgeError> {
        let address = args.address(2)?;
        match type_name {
            TypeName::Numeric(kind) => self.write_kind(kind, address, args.get(3)),
            TypeName::Wrapper => {
                let wrapper = args.wrapper(3)?;
                let count = args.optional_integer(4)?;
                self.with_bridge(|b| b.write_wrapper(address, &wrapper, count))?;
                Ok(ScriptValue::Nil)
            }
        }
    }

    fn write_kind(
        &self,
        kind: NumericKind,
        address: u32,
        value: &ScriptValue,
    ) -> Result<ScriptValue, BridgeError> {
        let tagged = match value {
            ScriptValue::Wrapper(wrapper) => wrapper.value_as(kind)?,
            other => TaggedValue::from_script(kind, other)?,
        };
        self.with_bridge(|b| b.write(kind, address, tagged))?;
        Ok(ScriptValue::Nil)
    }

    fn read_bytes(&self, args: &Args<'_>, signed: bool) -> Result<ScriptValue, BridgeError> {
        let address = args.address(1)?;
        let count = args.count(2)?;
        let bytes = self.with_bridge(|b| b.read_bytes(address, count, signed))?;
        // Keyed by absolute address, not by index.
        Ok(ScriptValue::Table(
            bytes
                .into_iter()
                .zip(0u32..)
                .map(|(byte, i)| {
                    (
                        ScriptValue::I64(i64::from(address.wrapping_add(i))),
                        ScriptValue::I64(byte),
                    )
                })
                .collect(),
        ))
    }

    fn write_bytes(&self, args: &Args<'_>) -> Result<ScriptValue, BridgeError> {
        // Either write_bytes({[addr] = v}) or write_bytes(base, {[offset] = v}).
        let (base, position) = if args.get(1).as_table().is_some() {
            (None, 1)
        } else {
            (Some(args.address(1)?), 2)
        };
        let mapping = args.table(position)?;

        let mut entries = Vec::with_capacity(mapping.len());
        for (key, value) in mapping {
            let address = match base {
                None => key
                    .coerce_unsigned()
                    .and_then(|a| u32::try_from(a).ok()),
                Some(base) => key
                    .coerce_unsigned()
                    .and_then(|o| u32::try_from(o).ok())
                    .and_then(|o| base.checked_add(o)),
            }
            .ok_or_else(|| BridgeError::InvalidArgument {
                position,
                expected: if base.is_some() {
                    "table keyed by byte offset"
                } else {
                    "table keyed by address"
                },
                found: key.variant_name().to_string(),
            })?;
            let value = value
                .coerce_signed()
                .ok_or_else(|| BridgeError::InvalidArgument {
                    position,
                    expected: "table of integer byte values",
                    found: value.variant_name().to_string(),
                })?;
            entries.push((address, value));
        }

        self.with_bridge(|b| b.write_bytes(&entries))?;
        Ok(ScriptValue::Nil)
    }
}

/// `read_u16` → `U16`, `write_float` → `Float`.
fn kind_from_suffix(function: &str, prefix: &str) -> Option<NumericKind> {
    match parse_type_name(function.strip_prefix(prefix)?) {
        Ok(TypeName::Numeric(kind)) => Some(kind),
        _ => None,
    }
}

impl ScriptApi for MemoryApi {
    fn class_name(&self) -> &'static str {
        MEMORY_CLASS
    }

    fn functions(&self) -> &'static [FunctionMetadata] {
        FUNCTIONS
    }

    fn dispatch(
        &self,
        function: &'static str,
        args: &Args<'_>,
    ) -> Result<ScriptValue, BridgeError> {
        match function {
            "read" | "readFrom" => self.read(args.type_name(1)?, args),
            "write" | "writeTo" => self.write(args.type_name(1)?, args),
            "read_unsigned_bytes" => self.read_bytes(args, false),
            "read_signed_bytes" => self.read_bytes(args, true),
            "read_fixed_length_string" => {
                let address = args.address(1)?;
                let length = args.count(2)?;
                let text = self.with_bridge(|b| b.read_fixed_length_string(address, length))?;
                Ok(ScriptValue::String(BString::from(text)))
            }
            "read_null_terminated_string" => {
                let address = args.address(1)?;
                let text = self.with_bridge(|b| b.read_null_terminated_string(address))?;
                Ok(ScriptValue::String(BString::from(text)))
            }
            "write_bytes" => self.write_bytes(args),
            "write_string" => {
                let address = args.address(1)?;
                let text = args.bytes(2)?;
                self.with_bridge(|b| b.write_string(address, text))?;
                Ok(ScriptValue::Nil)
            }
            other => {
                if let Some(kind) = kind_from_suffix(other, "read_") {
                    self.read_kind(kind, args.address(1)?)
                } else if let Some(kind) = kind_from_suffix(other, "write_") {
                    self.write_kind(kind, args.address(1)?, args.get(2))
                } else {
                    Err(BridgeError::UnknownFunction(other.to_string()))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{FlatMemory, shared_memory};
    use crate::value::ByteWrapper;

    fn api() -> (MemoryApi, SharedMemory) {
        let memory = shared_memory(FlatMemory::mem1());
        (
            MemoryApi::new(memory.clone(), BridgeLimits::default()),
            memory,
        )
    }

    fn call(api: &MemoryApi, function: &str, args: &[ScriptValue]) -> ScriptValue {
        let mut values = vec![ScriptValue::Receiver(MEMORY_CLASS.into())];
        values.extend_from_slice(args);
        api.call(function, &values).unwrap()
    }

    fn s(text: &str) -> ScriptValue {
        ScriptValue::string(text)
    }

    fn n(value: i64) -> ScriptValue {
        ScriptValue::I64(value)
    }

    #[test]
    fn every_function_is_dispatchable() {
        let (api, _) = api();
        for meta in api.functions() {
            let err = api.call(meta.name, &[n(0)]).unwrap_err();
            assert!(
                matches!(err.error, BridgeError::Usage { .. }),
                "{} should demand a receiver",
                meta.name
            );
            assert_ne!(
                api.dispatch(meta.name, &Args::from_values(&[])),
                Err(BridgeError::UnknownFunction(meta.name.to_string()))
            );
        }
    }

    #[test]
    fn generic_read_write() {
        let (api, memory) = api();
        call(&api, "write", &[s("u32"), n(0x8000_0010), n(0xDEAD_BEEF)]);
        assert_eq!(
            call(&api, "read", &[s("u32"), n(0x8000_0010)]),
            n(0xDEAD_BEEF)
        );
        assert_eq!(memory.lock().try_read_u32(0x8000_0010), Some(0xDEAD_BEEF));
        assert_eq!(
            call(&api, "readFrom", &[s("unsigned_16"), n(0x8000_0010)]),
            n(0xDEAD)
        );
    }

    #[test]
    fn typed_aliases() {
        let (api, _) = api();
        call(&api, "write_s16", &[n(0x8000_0000), n(-2)]);
        assert_eq!(call(&api, "read_s16", &[n(0x8000_0000)]), n(-2));
        assert_eq!(call(&api, "read_u16", &[n(0x8000_0000)]), n(0xFFFE));
        call(&api, "write_double", &[n(0x8000_0008), ScriptValue::number(2.5)]);
        assert_eq!(
            call(&api, "read_double", &[n(0x8000_0008)]),
            ScriptValue::number(2.5)
        );
    }

    #[test]
    fn wrapper_read_and_write() {
        let (api, memory) = api();
        memory.lock().try_write_u32(0x8000_0010, 0xDEAD_BEEF).unwrap();
        let expected = memory.lock().try_read_u16(0x8000_0010).unwrap();
        let wrapper = call(&api, "read", &[s("wrapper"), n(0x8000_0010), n(2)]);
        assert_eq!(
            wrapper,
            ScriptValue::Wrapper(ByteWrapper::from_u16(expected))
        );

        call(
            &api,
            "write",
            &[
                s("bytewrapper"),
                n(0x8000_0020),
                ScriptValue::Wrapper(ByteWrapper::from_u32(0x0102_0304)),
                n(2),
            ],
        );
        assert_eq!(memory.lock().try_read_u16(0x8000_0020), Some(0x0304));
    }

    #[test]
    fn unsigned_and_signed_bytes_keyed_by_address() {
        let (api, _) = api();
        call(
            &api,
            "write_bytes",
            &[ScriptValue::table([(n(0x8000_0000), n(0xFF)), (n(0x8000_0001), n(-1))])],
        );
        let unsigned = call(&api, "read_unsigned_bytes", &[n(0x8000_0000), n(2)]);
        assert_eq!(
            unsigned,
            ScriptValue::table([(n(0x8000_0000), n(255)), (n(0x8000_0001), n(255))])
        );
        let signed = call(&api, "read_signed_bytes", &[n(0x8000_0000), n(2)]);
        assert_eq!(
            signed,
            ScriptValue::table([(n(0x8000_0000), n(-1)), (n(0x8000_0001), n(-1))])
        );
    }

    #[test]
    fn write_bytes_with_base_uses_offsets() {
        let (api, memory) = api();
        call(
            &api,
            "write_bytes",
            &[
                n(0x8000_0100),
                ScriptValue::table([(n(0), n(1)), (n(3), n(4))]),
            ],
        );
        assert_eq!(memory.lock().try_read_u32(0x8000_0100), Some(0x0100_0004));
    }

    #[test]
    fn write_bytes_rejects_whole_call() {
        let (api, memory) = api();
        let err = api
            .call(
                "write_bytes",
                &[
                    ScriptValue::Receiver(MEMORY_CLASS.into()),
                    ScriptValue::table([(n(0x8000_0000), n(7)), (n(0x8000_0001), n(300))]),
                ],
            )
            .unwrap_err();
        assert!(matches!(
            err.error,
            BridgeError::InvalidByteRange { value: 300, .. }
        ));
        assert_eq!(memory.lock().try_read_u8(0x8000_0000), Some(0));
    }

    #[test]
    fn strings() {
        let (api, _) = api();
        call(&api, "write_string", &[n(0x8000_0020), s("hi")]);
        assert_eq!(
            call(&api, "read_null_terminated_string", &[n(0x8000_0020)]),
            s("hi")
        );
        assert_eq!(
            call(&api, "read_fixed_length_string", &[n(0x8000_0020), n(1)]),
            s("h")
        );
    }

    #[test]
    fn bad_type_name_reports_usage() {
        let (api, _) = api();
        let err = api
            .call(
                "read",
                &[
                    ScriptValue::Receiver(MEMORY_CLASS.into()),
                    s("u128"),
                    n(0x8000_0000),
                ],
            )
            .unwrap_err();
        assert!(matches!(err.error, BridgeError::UnrecognizedType { .. }));
        assert!(err.to_string().contains("Example usage"));
    }

    #[test]
    fn unmapped_write_is_memory_fault() {
        let (api, _) = api();
        let err = api
            .call(
                "write_u8",
                &[ScriptValue::Receiver(MEMORY_CLASS.into()), n(0x10), n(1)],
            )
            .unwrap_err();
        assert!(err.error.is_memory_fault());
    }

    #[test]
    fn out_of_range_write_is_rejected() {
        let (api, memory) = api();
        let err = api
            .call(
                "write",
                &[
                    ScriptValue::Receiver(MEMORY_CLASS.into()),
                    s("u8"),
                    n(0x8000_0000),
                    n(256),
                ],
            )
            .unwrap_err();
        assert!(matches!(err.error, BridgeError::ValueOutOfRange { .. }));
        assert_eq!(memory.lock().try_read_u8(0x8000_0000), Some(0));
    }
}
