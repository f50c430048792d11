//! Tagged numeric values crossing the native/script boundary.
//!
//! A [`TaggedValue`] carries its own width and signedness. Storage is always
//! little-endian and exactly `width(kind)` bytes long; the byte order of the
//! emulated machine never leaks into it, because the memory collaborator
//! hands back already-assembled integers.
//!
//! [`ByteWrapper`] is the variant-width container (`wrapper` type name). It
//! remembers how many bytes were populated so that truncating or extending
//! requests can be validated.

use crate::error::BridgeError;
use crate::script_value::ScriptValue;
use ordered_float::OrderedFloat;
use std::fmt;
use std::str::FromStr;

/// Canonical type names accepted by the memory surface.
pub const VALID_TYPE_NAMES: &[&str] = &[
    "u8", "u16", "u32", "u64", "s8", "s16", "s32", "s64", "float", "double", "wrapper",
];

/// Fixed-width numeric kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NumericKind {
    U8,
    U16,
    U32,
    U64,
    S8,
    S16,
    S32,
    S64,
    Float,
    Double,
}

impl NumericKind {
    pub const ALL: [Self; 10] = [
        Self::U8,
        Self::U16,
        Self::U32,
        Self::U64,
        Self::S8,
        Self::S16,
        Self::S32,
        Self::S64,
        Self::Float,
        Self::Double,
    ];

    /// Width in bytes.
    pub const fn width(self) -> usize {
        match self {
            Self::U8 | Self::S8 => 1,
            Self::U16 | Self::S16 => 2,
            Self::U32 | Self::S32 | Self::Float => 4,
            Self::U64 | Self::S64 | Self::Double => 8,
        }
    }

    pub const fn is_signed(self) -> bool {
        matches!(self, Self::S8 | Self::S16 | Self::S32 | Self::S64)
    }

    pub const fn is_float(self) -> bool {
        matches!(self, Self::Float | Self::Double)
    }

    /// Unsigned integer kind of the given width.
    pub const fn unsigned_of_width(width: usize) -> Option<Self> {
        match width {
            1 => Some(Self::U8),
            2 => Some(Self::U16),
            4 => Some(Self::U32),
            8 => Some(Self::U64),
            _ => None,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::U8 => "u8",
            Self::U16 => "u16",
            Self::U32 => "u32",
            Self::U64 => "u64",
            Self::S8 => "s8",
            Self::S16 => "s16",
            Self::S32 => "s32",
            Self::S64 => "s64",
            Self::Float => "float",
            Self::Double => "double",
        }
    }
}

impl fmt::Display for NumericKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Result of parsing a script-supplied type name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TypeName {
    Numeric(NumericKind),
    Wrapper,
}

impl fmt::Display for TypeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Numeric(kind) => fmt::Display::fmt(kind, f),
            Self::Wrapper => f.write_str("wrapper"),
        }
    }
}

impl FromStr for TypeName {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_type_name(s)
    }
}

/// Map a type name or one of its aliases to a [`TypeName`].
///
/// Matching ignores ASCII case and surrounding whitespace. Any other input is
/// reported as [`BridgeError::UnrecognizedType`].
pub fn parse_type_name(name: &str) -> Result<TypeName, BridgeError> {
    use NumericKind::*;

    let normalized = name.trim().to_ascii_lowercase();
    let kind = match normalized.as_str() {
        "u8" | "unsigned_8" | "unsigned8" | "unsigned byte" | "unsigned_byte" | "ubyte" => U8,
        "u16" | "unsigned_16" | "unsigned16" | "unsigned short" | "unsigned_short" => U16,
        "u32" | "unsigned_32" | "unsigned32" | "unsigned int" | "unsigned_int" => U32,
        "u64" | "unsigned_64" | "unsigned64" | "unsigned long long" | "unsigned_long_long" => {
            U64
        }
        "s8" | "signed_8" | "signed8" | "signed byte" | "signed_byte" | "byte" => S8,
        "s16" | "signed_16" | "signed16" | "signed short" | "signed_short" | "short" => S16,
        "s32" | "signed_32" | "signed32" | "signed int" | "signed_int" | "int" => S32,
        "s64" | "signed_64" | "signed64" | "signed long long" | "signed_long_long"
        | "long long" => S64,
        "float" | "f32" => Float,
        "double" | "f64" => Double,
        "wrapper" | "bytewrapper" | "byte_wrapper" | "byte wrapper" => {
            return Ok(TypeName::Wrapper);
        }
        _ => {
            return Err(BridgeError::UnrecognizedType {
                name: name.to_string(),
            });
        }
    };
    Ok(TypeName::Numeric(kind))
}

mod sealed {
    pub trait Sealed {}
}

/// Rust primitives that a [`TaggedValue`] can be reinterpreted as.
pub trait Primitive: Copy + sealed::Sealed {
    const KIND: NumericKind;

    #[doc(hidden)]
    fn from_le_slice(bytes: &[u8]) -> Self;

    #[doc(hidden)]
    fn write_le(self, out: &mut [u8]);
}

macro_rules! impl_primitive {
    ($($ty:ty => $kind:ident),* $(,)?) => {
        $(
            impl sealed::Sealed for $ty {}

            impl Primitive for $ty {
                const KIND: NumericKind = NumericKind::$kind;

                fn from_le_slice(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(bytes);
                    <$ty>::from_le_bytes(raw)
                }

                fn write_le(self, out: &mut [u8]) {
                    out.copy_from_slice(&self.to_le_bytes());
                }
            }
        )*
    };
}

impl_primitive! {
    u8 => U8,
    u16 => U16,
    u32 => U32,
    u64 => U64,
    i8 => S8,
    i16 => S16,
    i32 => S32,
    i64 => S64,
    f32 => Float,
    f64 => Double,
}

/// A fixed-width numeric value with an explicit kind.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaggedValue {
    kind: NumericKind,
    // Bytes past `kind.width()` are always zero.
    storage: [u8; 8],
}

impl TaggedValue {
    /// Wrap a Rust primitive, tagging it with the matching kind.
    pub fn new<T: Primitive>(value: T) -> Self {
        let mut storage = [0u8; 8];
        value.write_le(&mut storage[..T::KIND.width()]);
        Self {
            kind: T::KIND,
            storage,
        }
    }

    /// Build a value from exactly `width(kind)` little-endian bytes.
    pub fn from_bytes(kind: NumericKind, bytes: &[u8]) -> Result<Self, BridgeError> {
        if bytes.len() != kind.width() {
            return Err(BridgeError::WidthMismatch {
                expected: kind.width(),
                actual: bytes.len(),
            });
        }
        let mut storage = [0u8; 8];
        storage[..bytes.len()].copy_from_slice(bytes);
        Ok(Self { kind, storage })
    }

    /// Build a value of `kind` from the low bytes of a raw bit pattern.
    pub fn from_bits(kind: NumericKind, bits: u64) -> Self {
        let mut storage = bits.to_le_bytes();
        storage[kind.width()..].fill(0);
        Self { kind, storage }
    }

    pub fn kind(&self) -> NumericKind {
        self.kind
    }

    pub fn width(&self) -> usize {
        self.kind.width()
    }

    /// The stored bytes, exactly `width()` long.
    pub fn bytes(&self) -> &[u8] {
        &self.storage[..self.kind.width()]
    }

    /// Zero-extended bit pattern.
    pub fn bits(&self) -> u64 {
        u64::from_le_bytes(self.storage)
    }

    /// Reinterpret the stored bytes as `T`; widths must match exactly.
    pub fn get<T: Primitive>(&self) -> Result<T, BridgeError> {
        if T::KIND.width() != self.width() {
            return Err(BridgeError::WidthMismatch {
                expected: T::KIND.width(),
                actual: self.width(),
            });
        }
        Ok(T::from_le_slice(self.bytes()))
    }

    /// Same bytes under another kind of the same width (e.g. u32 as float).
    fn reinterpret(&self, kind: NumericKind) -> Result<Self, BridgeError> {
        Self::from_bytes(kind, self.bytes())
    }

    /// Convert a script-side number into a value of `kind`.
    ///
    /// Integers must fit either the signed or unsigned range of the target
    /// width, so `0xFF` and `-1` are both accepted for `u8` but `256` is not.
    /// Float kinds accept any number.
    pub fn from_script(kind: NumericKind, value: &ScriptValue) -> Result<Self, BridgeError> {
        let out_of_range = || BridgeError::ValueOutOfRange {
            kind,
            value: value.to_string(),
        };

        match kind {
            NumericKind::Float => {
                let f = value.coerce_float().ok_or_else(out_of_range)?;
                Ok(Self::new(f as f32))
            }
            NumericKind::Double => {
                let f = value.coerce_float().ok_or_else(out_of_range)?;
                Ok(Self::new(f))
            }
            _ => {
                let bits = integer_bits_for_width(value, kind.width()).ok_or_else(out_of_range)?;
                Ok(Self::from_bits(kind, bits))
            }
        }
    }

    /// Script-visible form: integers stay integers, floats become numbers.
    pub fn to_script(&self) -> ScriptValue {
        let b = self.bytes();
        match self.kind {
            NumericKind::U8 => ScriptValue::I64(i64::from(b[0])),
            NumericKind::U16 => ScriptValue::I64(i64::from(u16::from_le_slice(b))),
            NumericKind::U32 => ScriptValue::I64(i64::from(u32::from_le_slice(b))),
            NumericKind::U64 => ScriptValue::U64(u64::from_le_slice(b)),
            NumericKind::S8 => ScriptValue::I64(i64::from(i8::from_le_slice(b))),
            NumericKind::S16 => ScriptValue::I64(i64::from(i16::from_le_slice(b))),
            NumericKind::S32 => ScriptValue::I64(i64::from(i32::from_le_slice(b))),
            NumericKind::S64 => ScriptValue::I64(i64::from_le_slice(b)),
            NumericKind::Float => {
                ScriptValue::F64(OrderedFloat(f64::from(f32::from_le_slice(b))))
            }
            NumericKind::Double => ScriptValue::F64(OrderedFloat(f64::from_le_slice(b))),
        }
    }
}

impl fmt::Debug for TaggedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.kind, self.to_script())
    }
}

/// Bit pattern for an integer that fits the signed or unsigned range of
/// `width` bytes.
fn integer_bits_for_width(value: &ScriptValue, width: usize) -> Option<u64> {
    let bits = (width * 8) as u32;
    if let Some(u) = value.coerce_unsigned() {
        let fits = bits == 64 || u >> bits == 0;
        return fits.then_some(u);
    }
    let i = value.coerce_signed()?;
    let min = if bits == 64 { i64::MIN } else { -(1i64 << (bits - 1)) };
    if i < min {
        return None;
    }
    let mask = if bits == 64 { u64::MAX } else { (1u64 << bits) - 1 };
    Some((i as u64) & mask)
}

/// Variant-width byte container.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ByteWrapper {
    storage: [u8; 8],
    populated: u8,
}

impl ByteWrapper {
    pub fn from_u8(value: u8) -> Self {
        Self::from_parts(u64::from(value), 1)
    }

    pub fn from_u16(value: u16) -> Self {
        Self::from_parts(u64::from(value), 2)
    }

    pub fn from_u32(value: u32) -> Self {
        Self::from_parts(u64::from(value), 4)
    }

    pub fn from_u64(value: u64) -> Self {
        Self::from_parts(value, 8)
    }

    /// Wrap the bytes of an existing tagged value.
    pub fn from_tagged(value: TaggedValue) -> Self {
        Self {
            storage: value.storage,
            populated: value.width() as u8,
        }
    }

    /// Wrap `width` low bytes of `bits`; width must be 1, 2, 4 or 8.
    pub fn with_width(bits: u64, width: usize) -> Result<Self, BridgeError> {
        if NumericKind::unsigned_of_width(width).is_none() {
            return Err(BridgeError::InvalidWidth(width as i64));
        }
        Ok(Self::from_parts(bits, width as u8))
    }

    fn from_parts(bits: u64, populated: u8) -> Self {
        let mut storage = bits.to_le_bytes();
        storage[populated as usize..].fill(0);
        Self { storage, populated }
    }

    /// Number of populated bytes.
    pub fn required_byte_count(&self) -> usize {
        self.populated as usize
    }

    pub fn bytes(&self) -> &[u8] {
        &self.storage[..self.required_byte_count()]
    }

    pub fn bits(&self) -> u64 {
        u64::from_le_bytes(self.storage)
    }

    /// The low `width` bytes as an unsigned value of that width.
    ///
    /// Narrowing is allowed; widening past the populated bytes is a
    /// [`BridgeError::WidthMismatch`].
    pub fn truncated(&self, width: usize) -> Result<TaggedValue, BridgeError> {
        let kind =
            NumericKind::unsigned_of_width(width).ok_or(BridgeError::InvalidWidth(width as i64))?;
        if width > self.required_byte_count() {
            return Err(BridgeError::WidthMismatch {
                expected: width,
                actual: self.required_byte_count(),
            });
        }
        TaggedValue::from_bytes(kind, &self.storage[..width])
    }

    /// Read the wrapper as any kind that fits in the populated bytes.
    pub fn value_as(&self, kind: NumericKind) -> Result<TaggedValue, BridgeError> {
        self.truncated(kind.width())?.reinterpret(kind)
    }
}

impl fmt::Debug for ByteWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ByteWrapper<{}>(", self.populated)?;
        for byte in self.bytes().iter().rev() {
            write!(f, "{byte:02X}")?;
        }
        f.write_str(")")
    }
}
