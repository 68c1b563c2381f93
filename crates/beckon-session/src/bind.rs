//! Argument binding from dynamic JSON values to declared parameter kinds.
//!
//! The codec leaves numeric literals as arbitrary JSON numbers; this module
//! applies the coercion rules when an invocation's arguments are bound to a
//! method's declared parameters:
//!
//! 1. Arity mismatch fails the whole binding.
//! 2. Each argument decodes into the declared kind; failures carry the
//!    parameter index.
//! 3. Floating-point numbers narrow to integer kinds iff they have no
//!    fractional part and fit the target range.

use serde::de::DeserializeOwned;
use serde_json::Value;

/// Declared kind of a hub method parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    String,
    Bool,
    /// Deep JSON decode into a typed schema.
    Structured,
    /// Passed through as a raw JSON value.
    Dynamic,
}

/// Error binding an invocation's arguments.
#[derive(Debug)]
pub enum BindError {
    CountMismatch { expected: usize, got: usize },
    Argument { index: usize, detail: String },
}

impl std::fmt::Display for BindError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BindError::CountMismatch { expected, got } => {
                write!(f, "expected {expected} arguments, got {got}")
            }
            BindError::Argument { index, detail } => {
                write!(f, "cannot bind argument {index}: {detail}")
            }
        }
    }
}

impl std::error::Error for BindError {}

/// A type an invocation argument can bind to.
pub trait HubArgument: Sized + Send {
    const KIND: ParamKind;

    /// Bind a single dynamic value. The error is the detail only; the
    /// caller attaches the parameter index.
    fn bind(value: &Value) -> Result<Self, String>;
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a bool",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn bind_signed(value: &Value, min: i64, max: i64, target: &str) -> Result<i64, String> {
    if let Some(n) = value.as_i64() {
        if n < min || n > max {
            return Err(format!("{n} is out of range for {target}"));
        }
        return Ok(n);
    }
    if let Some(f) = value.as_f64() {
        if f.fract() != 0.0 {
            return Err(format!("{f} has a fractional part, cannot narrow to {target}"));
        }
        if f < min as f64 || f > max as f64 {
            return Err(format!("{f} is out of range for {target}"));
        }
        return Ok(f as i64);
    }
    Err(format!("expected a number, got {}", kind_of(value)))
}

fn bind_unsigned(value: &Value, max: u64, target: &str) -> Result<u64, String> {
    if let Some(n) = value.as_u64() {
        if n > max {
            return Err(format!("{n} is out of range for {target}"));
        }
        return Ok(n);
    }
    if let Some(f) = value.as_f64() {
        if f.fract() != 0.0 {
            return Err(format!("{f} has a fractional part, cannot narrow to {target}"));
        }
        if f < 0.0 || f > max as f64 {
            return Err(format!("{f} is out of range for {target}"));
        }
        return Ok(f as u64);
    }
    Err(format!("expected a number, got {}", kind_of(value)))
}

macro_rules! impl_signed_argument {
    ($ty:ty, $kind:expr) => {
        impl HubArgument for $ty {
            const KIND: ParamKind = $kind;

            fn bind(value: &Value) -> Result<Self, String> {
                bind_signed(
                    value,
                    <$ty>::MIN as i64,
                    <$ty>::MAX as i64,
                    stringify!($ty),
                )
                .map(|n| n as $ty)
            }
        }
    };
}

macro_rules! impl_unsigned_argument {
    ($ty:ty, $kind:expr) => {
        impl HubArgument for $ty {
            const KIND: ParamKind = $kind;

            fn bind(value: &Value) -> Result<Self, String> {
                bind_unsigned(value, <$ty>::MAX as u64, stringify!($ty)).map(|n| n as $ty)
            }
        }
    };
}

impl_signed_argument!(i8, ParamKind::I8);
impl_signed_argument!(i16, ParamKind::I16);
impl_signed_argument!(i32, ParamKind::I32);
impl_signed_argument!(i64, ParamKind::I64);
impl_unsigned_argument!(u8, ParamKind::U8);
impl_unsigned_argument!(u16, ParamKind::U16);
impl_unsigned_argument!(u32, ParamKind::U32);
impl_unsigned_argument!(u64, ParamKind::U64);

impl HubArgument for f64 {
    const KIND: ParamKind = ParamKind::F64;

    fn bind(value: &Value) -> Result<Self, String> {
        value
            .as_f64()
            .ok_or_else(|| format!("expected a number, got {}", kind_of(value)))
    }
}

impl HubArgument for f32 {
    const KIND: ParamKind = ParamKind::F32;

    fn bind(value: &Value) -> Result<Self, String> {
        let f = value
            .as_f64()
            .ok_or_else(|| format!("expected a number, got {}", kind_of(value)))?;
        let narrowed = f as f32;
        if f.is_finite() && !narrowed.is_finite() {
            return Err(format!("{f} is out of range for f32"));
        }
        Ok(narrowed)
    }
}

impl HubArgument for String {
    const KIND: ParamKind = ParamKind::String;

    fn bind(value: &Value) -> Result<Self, String> {
        value
            .as_str()
            .map(str::to_owned)
            .ok_or_else(|| format!("expected a string, got {}", kind_of(value)))
    }
}

impl HubArgument for bool {
    const KIND: ParamKind = ParamKind::Bool;

    fn bind(value: &Value) -> Result<Self, String> {
        value
            .as_bool()
            .ok_or_else(|| format!("expected a bool, got {}", kind_of(value)))
    }
}

impl HubArgument for Value {
    const KIND: ParamKind = ParamKind::Dynamic;

    fn bind(value: &Value) -> Result<Self, String> {
        Ok(value.clone())
    }
}

/// Structured parameter: deep JSON decode into `T`.
#[derive(Debug, Clone, PartialEq)]
pub struct Json<T>(pub T);

impl<T> HubArgument for Json<T>
where
    T: DeserializeOwned + Send,
{
    const KIND: ParamKind = ParamKind::Structured;

    fn bind(value: &Value) -> Result<Self, String> {
        serde_json::from_value(value.clone())
            .map(Json)
            .map_err(|e| e.to_string())
    }
}
