//! Conversion between Lua values and [`ScriptValue`].

use emuscript_core::ScriptValue;
use emuscript_core::value::{ByteWrapper, NumericKind, TaggedValue, TypeName, parse_type_name};
use mlua::{Lua, MetaMethod, Table, UserData, UserDataMethods, Value};

/// Field naming the API class of a receiver table (`memory`, `controller`).
pub const CLASS_KEY: &str = "__class";

/// Nested tables deeper than this are rejected; Lua tables can be cyclic.
const MAX_TABLE_DEPTH: usize = 32;

/// Lua handle around a [`ByteWrapper`].
#[derive(Debug, Clone, Copy)]
pub struct LuaByteWrapper(pub ByteWrapper);

impl UserData for LuaByteWrapper {
    fn add_methods<'lua, M: UserDataMethods<'lua, Self>>(methods: &mut M) {
        methods.add_method("size", |_, this, ()| Ok(this.0.required_byte_count()));

        methods.add_method("value_as", |lua, this, name: String| {
            let kind = match parse_type_name(&name).map_err(mlua::Error::external)? {
                TypeName::Numeric(kind) => kind,
                TypeName::Wrapper => return lua.create_userdata(*this).map(Value::UserData),
            };
            let value = this.0.value_as(kind).map_err(mlua::Error::external)?;
            script_to_lua_value(lua, &value.to_script())
        });

        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| {
            Ok(format!("{:?}", this.0))
        });
    }
}

/// `ByteWrapper.new(value[, size])`; size defaults to 8 bytes.
pub fn new_byte_wrapper(value: &ScriptValue, size: Option<i64>) -> mlua::Result<ByteWrapper> {
    let size = size.unwrap_or(8);
    let kind = usize::try_from(size)
        .ok()
        .and_then(NumericKind::unsigned_of_width)
        .ok_or_else(|| {
            mlua::Error::external(emuscript_core::BridgeError::InvalidWidth(size))
        })?;
    let tagged = TaggedValue::from_script(kind, value).map_err(mlua::Error::external)?;
    Ok(ByteWrapper::from_tagged(tagged))
}

pub fn lua_value_to_script(value: &Value<'_>) -> mlua::Result<ScriptValue> {
    to_script(value, 0)
}

fn to_script(value: &Value<'_>, depth: usize) -> mlua::Result<ScriptValue> {
    Ok(match value {
        Value::Nil => ScriptValue::Nil,
        Value::Boolean(b) => ScriptValue::Bool(*b),
        Value::Integer(i) => ScriptValue::I64(*i),
        Value::Number(n) => ScriptValue::number(*n),
        Value::String(s) => ScriptValue::string(s.as_bytes()),
        Value::Table(table) => table_to_script(table, depth)?,
        Value::UserData(ud) if ud.is::<LuaByteWrapper>() => {
            ScriptValue::Wrapper(ud.borrow::<LuaByteWrapper>()?.0)
        }
        other => {
            return Err(mlua::Error::FromLuaConversionError {
                from: other.type_name(),
                to: "ScriptValue",
                message: Some("only nil, booleans, numbers, strings, tables and ByteWrappers cross into the host".to_string()),
            });
        }
    })
}

fn table_to_script(table: &Table<'_>, depth: usize) -> mlua::Result<ScriptValue> {
    if let Value::String(class) = table.raw_get::<_, Value>(CLASS_KEY)? {
        return Ok(ScriptValue::Receiver(class.to_string_lossy().into_owned()));
    }
    if depth >= MAX_TABLE_DEPTH {
        return Err(mlua::Error::RuntimeError(format!(
            "table nesting deeper than {MAX_TABLE_DEPTH} levels"
        )));
    }
    let mut entries = Vec::new();
    for pair in table.clone().pairs::<Value, Value>() {
        let (key, value) = pair?;
        entries.push((to_script(&key, depth + 1)?, to_script(&value, depth + 1)?));
    }
    Ok(ScriptValue::Table(entries))
}

/// Lua integers are signed; a `u64` above `i64::MAX` keeps its bit
/// pattern as a negative integer.
pub fn script_to_lua_value<'lua>(lua: &'lua Lua, value: &ScriptValue) -> mlua::Result<Value<'lua>> {
    Ok(match value {
        ScriptValue::Nil => Value::Nil,
        ScriptValue::Bool(b) => Value::Boolean(*b),
        ScriptValue::I64(i) => Value::Integer(*i),
        ScriptValue::U64(u) => Value::Integer(*u as i64),
        ScriptValue::F64(f) => Value::Number(f.0),
        ScriptValue::String(s) => Value::String(lua.create_string(s.as_slice())?),
        ScriptValue::Table(entries) => {
            let table = lua.create_table()?;
            for (key, value) in entries {
                table.raw_set(script_to_lua_value(lua, key)?, script_to_lua_value(lua, value)?)?;
            }
            Value::Table(table)
        }
        ScriptValue::Wrapper(wrapper) => Value::UserData(lua.create_userdata(LuaByteWrapper(*wrapper))?),
        ScriptValue::Receiver(class) => lua.globals().raw_get(class.as_str())?,
    })
}
