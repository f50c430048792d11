//! Script API surfaces.
//!
//! A surface is a named, method-style object (`memory`, `controller`) whose
//! functions a backend can register generically from [`ScriptApi::functions`]
//! without knowing what they do. Every call goes through [`ScriptApi::call`]:
//! the first argument must be the surface's own receiver, the remaining
//! arguments are parsed through [`Args`], and any failure comes back as an
//! [`ApiCallError`] naming the function and its usage example.

use crate::error::{ApiCallError, BridgeError};
use crate::script_value::ScriptValue;
use crate::value::{ByteWrapper, TypeName, parse_type_name};
use bstr::BString;
use serde::Serialize;
use tracing::debug;

/// Version reported by every built-in API class.
pub const SCRIPT_API_VERSION: &str = "1.0.0";

/// One callable function of a surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FunctionMetadata {
    pub name: &'static str,
    /// Example call shown to scripts on misuse.
    pub usage: &'static str,
}

impl FunctionMetadata {
    pub const fn new(name: &'static str, usage: &'static str) -> Self {
        Self { name, usage }
    }
}

/// Class metadata a backend uses to build its script-side object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassMetadata {
    pub name: &'static str,
    pub version: &'static str,
    pub functions: Vec<FunctionMetadata>,
}

pub trait ScriptApi: Send + Sync {
    fn class_name(&self) -> &'static str;

    fn api_version(&self) -> &'static str {
        SCRIPT_API_VERSION
    }

    fn functions(&self) -> &'static [FunctionMetadata];

    /// Run `function` with already-validated arguments.
    fn dispatch(&self, function: &'static str, args: &Args<'_>)
    -> Result<ScriptValue, BridgeError>;

    fn metadata(&self) -> ClassMetadata {
        ClassMetadata {
            name: self.class_name(),
            version: self.api_version(),
            functions: self.functions().to_vec(),
        }
    }

    /// Call `function` with script-supplied `values`, receiver first.
    fn call(&self, function: &str, values: &[ScriptValue]) -> Result<ScriptValue, ApiCallError> {
        let class = self.class_name();
        let Some(meta) = self.functions().iter().find(|f| f.name == function) else {
            return Err(ApiCallError {
                class,
                function: function.to_string(),
                usage: "",
                error: BridgeError::UnknownFunction(function.to_string()),
            });
        };
        let tag = |error: BridgeError| ApiCallError {
            class,
            function: meta.name.to_string(),
            usage: meta.usage,
            error,
        };

        let args = Args::new(class, meta, values).map_err(tag)?;
        let result = self.dispatch(meta.name, &args).map_err(tag);
        if let Err(err) = &result {
            debug!(class, function = meta.name, error = %err.error, "api call failed");
        }
        result
    }
}

/// Positional arguments of one API call, receiver stripped.
///
/// Positions are 1-based and count only the arguments after the receiver,
/// the way a script author writes them.
#[derive(Debug, Clone, Copy)]
pub struct Args<'a> {
    values: &'a [ScriptValue],
}

impl<'a> Args<'a> {
    /// Check the receiver and strip it.
    pub fn new(
        class: &str,
        meta: &FunctionMetadata,
        values: &'a [ScriptValue],
    ) -> Result<Self, BridgeError> {
        match values.first() {
            Some(ScriptValue::Receiver(receiver)) if receiver == class => Ok(Self {
                values: &values[1..],
            }),
            _ => Err(BridgeError::Usage {
                example: meta.usage,
            }),
        }
    }

    /// Arguments without any receiver check, for host-side callers.
    pub fn from_values(values: &'a [ScriptValue]) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The argument at `position`, `Nil` when absent.
    pub fn get(&self, position: usize) -> &'a ScriptValue {
        const NIL: &ScriptValue = &ScriptValue::Nil;
        position
            .checked_sub(1)
            .and_then(|i| self.values.get(i))
            .unwrap_or(NIL)
    }

    pub fn is_present(&self, position: usize) -> bool {
        !self.get(position).is_nil()
    }

    fn invalid(&self, position: usize, expected: &'static str) -> BridgeError {
        BridgeError::InvalidArgument {
            position,
            expected,
            found: self.get(position).variant_name().to_string(),
        }
    }

    /// A 32-bit emulated address.
    pub fn address(&self, position: usize) -> Result<u32, BridgeError> {
        self.get(position)
            .coerce_unsigned()
            .and_then(|a| u32::try_from(a).ok())
            .ok_or_else(|| self.invalid(position, "32-bit address"))
    }

    pub fn integer(&self, position: usize) -> Result<i64, BridgeError> {
        self.get(position)
            .coerce_signed()
            .ok_or_else(|| self.invalid(position, "integer"))
    }

    pub fn optional_integer(&self, position: usize) -> Result<Option<i64>, BridgeError> {
        if self.is_present(position) {
            self.integer(position).map(Some)
        } else {
            Ok(None)
        }
    }

    /// A non-negative count that fits in memory.
    pub fn count(&self, position: usize) -> Result<usize, BridgeError> {
        self.get(position)
            .coerce_unsigned()
            .and_then(|c| usize::try_from(c).ok())
            .ok_or_else(|| self.invalid(position, "non-negative integer"))
    }

    pub fn number(&self, position: usize) -> Result<f64, BridgeError> {
        self.get(position)
            .coerce_float()
            .ok_or_else(|| self.invalid(position, "number"))
    }

    pub fn boolean(&self, position: usize) -> Result<bool, BridgeError> {
        match self.get(position) {
            ScriptValue::Bool(b) => Ok(*b),
            ScriptValue::Nil => Ok(false),
            _ => Err(self.invalid(position, "boolean")),
        }
    }

    pub fn bytes(&self, position: usize) -> Result<&'a BString, BridgeError> {
        match self.get(position) {
            ScriptValue::String(s) => Ok(s),
            _ => Err(self.invalid(position, "string")),
        }
    }

    pub fn string(&self, position: usize) -> Result<String, BridgeError> {
        match self.get(position) {
            ScriptValue::String(s) => Ok(s.to_string()),
            _ => Err(self.invalid(position, "string")),
        }
    }

    pub fn table(&self, position: usize) -> Result<&'a [(ScriptValue, ScriptValue)], BridgeError> {
        self.get(position)
            .as_table()
            .ok_or_else(|| self.invalid(position, "table"))
    }

    pub fn wrapper(&self, position: usize) -> Result<ByteWrapper, BridgeError> {
        match self.get(position) {
            ScriptValue::Wrapper(w) => Ok(*w),
            _ => Err(self.invalid(position, "ByteWrapper")),
        }
    }

    pub fn type_name(&self, position: usize) -> Result<TypeName, BridgeError> {
        match self.get(position) {
            ScriptValue::String(s) => parse_type_name(&s.to_string()),
            _ => Err(self.invalid(position, "type name string")),
        }
    }
}
