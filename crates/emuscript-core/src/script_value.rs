//! Language-neutral dynamic values handed from a backend to the API surfaces.
//!
//! Every backend converts its engine's native values into [`ScriptValue`]
//! before calling [`crate::api::ScriptApi::call`], and converts the returned
//! value back. The host therefore never sees engine types.

use crate::value::ByteWrapper;
use bstr::BString;
use ordered_float::OrderedFloat;
use std::fmt;

#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub enum ScriptValue {
    #[default]
    Nil,
    Bool(bool),
    I64(i64),
    U64(u64),
    F64(OrderedFloat<f64>),
    /// Script strings are byte strings; they need not be UTF-8.
    String(BString),
    /// Ordered key/value pairs. Backends preserve their iteration order.
    Table(Vec<(ScriptValue, ScriptValue)>),
    Wrapper(ByteWrapper),
    /// The API object a method-style call was made on, by class name.
    Receiver(String),
}

// `u64::MAX as f64` rounds up to these, so the upper bounds are exclusive.
const TWO_POW_64: f64 = 18_446_744_073_709_551_616.0;
const TWO_POW_63: f64 = 9_223_372_036_854_775_808.0;

impl ScriptValue {
    pub fn variant_name(&self) -> &'static str {
        match self {
            Self::Nil => "nil",
            Self::Bool(_) => "boolean",
            Self::I64(_) | Self::U64(_) => "integer",
            Self::F64(_) => "number",
            Self::String(_) => "string",
            Self::Table(_) => "table",
            Self::Wrapper(_) => "ByteWrapper",
            Self::Receiver(_) => "API object",
        }
    }

    pub fn number(value: f64) -> Self {
        Self::F64(OrderedFloat(value))
    }

    pub fn string(value: impl Into<BString>) -> Self {
        Self::String(value.into())
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Self::Nil)
    }

    pub fn coerce_unsigned(&self) -> Option<u64> {
        match self {
            Self::U64(u) => Some(*u),
            Self::I64(i) => (*i).try_into().ok(),
            Self::F64(OrderedFloat(f))
                if f.fract() == 0.0 && *f >= 0.0 && *f < TWO_POW_64 =>
            {
                Some(*f as u64)
            }
            _ => None,
        }
    }

    pub fn coerce_signed(&self) -> Option<i64> {
        match self {
            Self::I64(i) => Some(*i),
            Self::U64(u) => (*u).try_into().ok(),
            Self::F64(OrderedFloat(f))
                if f.fract() == 0.0 && *f >= -TWO_POW_63 && *f < TWO_POW_63 =>
            {
                Some(*f as i64)
            }
            _ => None,
        }
    }

    pub fn coerce_float(&self) -> Option<f64> {
        match self {
            Self::I64(i) => Some(*i as f64),
            Self::U64(u) => Some(*u as f64),
            Self::F64(OrderedFloat(f)) => Some(*f),
            _ => None,
        }
    }

    /// Scripts commonly treat nil and false as falsy and everything else as
    /// truthy.
    pub fn truthy(&self) -> bool {
        !matches!(self, Self::Nil | Self::Bool(false))
    }

    pub fn as_table(&self) -> Option<&[(ScriptValue, ScriptValue)]> {
        match self {
            Self::Table(entries) => Some(entries),
            _ => None,
        }
    }

    /// Look up a string key in a table value.
    pub fn field(&self, key: &str) -> Option<&ScriptValue> {
        self.as_table()?.iter().rev().find_map(|(k, v)| match k {
            Self::String(s) if s.as_slice() == key.as_bytes() => Some(v),
            _ => None,
        })
    }

    /// Build a table from `(key, value)` pairs.
    pub fn table<K, V>(entries: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<ScriptValue>,
        V: Into<ScriptValue>,
    {
        Self::Table(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl fmt::Debug for ScriptValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nil => f.write_str("nil"),
            Self::Bool(b) => fmt::Debug::fmt(b, f),
            Self::I64(i) => fmt::Debug::fmt(i, f),
            Self::U64(u) => fmt::Debug::fmt(u, f),
            Self::F64(n) => fmt::Debug::fmt(&n.0, f),
            Self::String(s) => write!(f, "{:?}", s),
            Self::Table(entries) => f
                .debug_map()
                .entries(entries.iter().map(|(k, v)| (k, v)))
                .finish(),
            Self::Wrapper(w) => fmt::Debug::fmt(w, f),
            Self::Receiver(class) => write!(f, "<{class}>"),
        }
    }
}

impl fmt::Display for ScriptValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => write!(f, "\"{s}\""),
            Self::Table(_) => f.write_str("table"),
            other => fmt::Debug::fmt(other, f),
        }
    }
}

impl From<bool> for ScriptValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for ScriptValue {
    fn from(value: i64) -> Self {
        Self::I64(value)
    }
}

impl From<u32> for ScriptValue {
    fn from(value: u32) -> Self {
        Self::I64(i64::from(value))
    }
}

impl From<u64> for ScriptValue {
    fn from(value: u64) -> Self {
        Self::U64(value)
    }
}

impl From<f64> for ScriptValue {
    fn from(value: f64) -> Self {
        Self::number(value)
    }
}

impl From<&str> for ScriptValue {
    fn from(value: &str) -> Self {
        Self::string(value)
    }
}

impl From<BString> for ScriptValue {
    fn from(value: BString) -> Self {
        Self::String(value)
    }
}

impl From<ByteWrapper> for ScriptValue {
    fn from(value: ByteWrapper) -> Self {
        Self::Wrapper(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn default_is_nil() {
        assert!(ScriptValue::default().is_nil());
    }

    #[test]
    fn coercions_follow_integer_ranges() {
        assert_eq!(ScriptValue::I64(-1).coerce_unsigned(), None);
        assert_eq!(ScriptValue::I64(-1).coerce_signed(), Some(-1));
        assert_eq!(ScriptValue::U64(u64::MAX).coerce_signed(), None);
        assert_eq!(ScriptValue::number(3.0).coerce_unsigned(), Some(3));
        assert_eq!(ScriptValue::number(3.5).coerce_signed(), None);
        assert_eq!(ScriptValue::string("3").coerce_float(), None);
    }

    #[test]
    fn float_coercions_reject_the_first_value_past_each_range() {
        let two_pow_64 = ScriptValue::number(2f64.powi(64));
        let two_pow_63 = ScriptValue::number(2f64.powi(63));
        assert_eq!(two_pow_64.coerce_unsigned(), None);
        assert_eq!(two_pow_63.coerce_signed(), None);
        assert_eq!(two_pow_63.coerce_unsigned(), Some(1 << 63));
        assert_eq!(
            ScriptValue::number(-(2f64.powi(63))).coerce_signed(),
            Some(i64::MIN)
        );
        // The next double below -2^63.
        let below_min = ScriptValue::number(-9_223_372_036_854_777_856.0);
        assert_eq!(below_min.coerce_signed(), None);
        assert_eq!(ScriptValue::number(-0.0).coerce_unsigned(), Some(0));
    }

    proptest! {
        #[test]
        fn floats_past_u64_never_coerce(exp in 64i32..1000) {
            let value = ScriptValue::number(2f64.powi(exp));
            prop_assert_eq!(value.coerce_unsigned(), None);
            prop_assert_eq!(value.coerce_signed(), None);
        }

        #[test]
        fn integral_floats_in_range_coerce_exactly(n in any::<u32>()) {
            let value = ScriptValue::number(f64::from(n));
            prop_assert_eq!(value.coerce_unsigned(), Some(u64::from(n)));
            prop_assert_eq!(value.coerce_signed(), Some(i64::from(n)));
        }
    }

    #[test]
    fn truthiness() {
        assert!(!ScriptValue::Nil.truthy());
        assert!(!ScriptValue::Bool(false).truthy());
        assert!(ScriptValue::I64(0).truthy());
        assert!(ScriptValue::string("").truthy());
    }

    #[test]
    fn field_lookup_prefers_last_entry() {
        let table = ScriptValue::table([("A", true), ("B", false), ("A", false)]);
        assert_eq!(table.field("A"), Some(&ScriptValue::Bool(false)));
        assert_eq!(table.field("B"), Some(&ScriptValue::Bool(false)));
        assert_eq!(table.field("Z"), None);
        assert_eq!(ScriptValue::I64(1).field("A"), None);
    }

    #[test]
    fn strings_are_byte_exact() {
        let value = ScriptValue::String(BString::from(vec![0x68, 0xFF, 0x00]));
        match &value {
            ScriptValue::String(s) => assert_eq!(s.as_slice(), &[0x68, 0xFF, 0x00]),
            _ => unreachable!(),
        }
    }

    #[test]
    fn display_quotes_strings() {
        assert_eq!(ScriptValue::string("hi").to_string(), "\"hi\"");
        assert_eq!(ScriptValue::I64(-4).to_string(), "-4");
        assert_eq!(ScriptValue::Nil.to_string(), "nil");
        assert_eq!(
            ScriptValue::Receiver("memory".into()).to_string(),
            "<memory>"
        );
    }

    #[test]
    fn variant_names_are_script_facing() {
        assert_eq!(ScriptValue::U64(1).variant_name(), "integer");
        assert_eq!(ScriptValue::number(1.0).variant_name(), "number");
        assert_eq!(
            ScriptValue::Wrapper(ByteWrapper::from_u8(1)).variant_name(),
            "ByteWrapper"
        );
    }
}
