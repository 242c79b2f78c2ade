use std::cmp::Ordering;
use std::fmt;

/// Runtime value of the sandbox language.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Tuple(Vec<Value>),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    pub(crate) fn to_f64(self) -> f64 {
        match self {
            Self::Int(value) => value as f64,
            Self::Float(value) => value,
        }
    }
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::None => "NoneType",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "str",
            Self::List(_) => "list",
            Self::Tuple(_) => "tuple",
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Self::None => false,
            Self::Bool(value) => *value,
            Self::Int(value) => *value != 0,
            Self::Float(value) => *value != 0.0,
            Self::Str(value) => !value.is_empty(),
            Self::List(items) | Self::Tuple(items) => !items.is_empty(),
        }
    }

    pub(crate) fn as_number(&self) -> Option<Number> {
        match self {
            Self::Bool(value) => Some(Number::Int(i64::from(*value))),
            Self::Int(value) => Some(Number::Int(*value)),
            Self::Float(value) => Some(Number::Float(*value)),
            _ => None,
        }
    }

    pub(crate) fn as_int(&self) -> Option<i64> {
        match self.as_number() {
            Some(Number::Int(value)) => Some(value),
            _ => None,
        }
    }

    pub(crate) fn len(&self) -> Option<usize> {
        match self {
            Self::Str(value) => Some(value.chars().count()),
            Self::List(items) | Self::Tuple(items) => Some(items.len()),
            _ => None,
        }
    }

    /// Materialises an iterable into its elements.
    pub(crate) fn items(&self) -> Result<Vec<Value>, RunError> {
        match self {
            Self::Str(value) => Ok(value.chars().map(|ch| Self::Str(ch.to_string())).collect()),
            Self::List(items) | Self::Tuple(items) => Ok(items.clone()),
            other => Err(RunError::type_error(format!(
                "'{}' object is not iterable",
                other.type_name()
            ))),
        }
    }

    pub fn repr(&self) -> String {
        match self {
            Self::Str(value) => quote(value),
            Self::List(items) => format!("[{}]", join_repr(items)),
            Self::Tuple(items) if items.len() == 1 => format!("({},)", items[0].repr()),
            Self::Tuple(items) => format!("({})", join_repr(items)),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Bool(true) => f.write_str("True"),
            Self::Bool(false) => f.write_str("False"),
            Self::Int(value) => write!(f, "{value}"),
            Self::Float(value) => f.write_str(&format_float(*value)),
            Self::Str(value) => f.write_str(value),
            Self::List(_) | Self::Tuple(_) => f.write_str(&self.repr()),
        }
    }
}

fn join_repr(items: &[Value]) -> String {
    items.iter().map(Value::repr).collect::<Vec<_>>().join(", ")
}

fn quote(value: &str) -> String {
    let delimiter = if value.contains('\'') && !value.contains('"') { '"' } else { '\'' };
    let mut out = String::with_capacity(value.len() + 2);
    out.push(delimiter);
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            ch if ch == delimiter => {
                out.push('\\');
                out.push(ch);
            }
            ch => out.push(ch),
        }
    }
    out.push(delimiter);
    out
}

/// Shortest round-trip float rendering with Python's exponent conventions.
pub(crate) fn format_float(value: f64) -> String {
    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf".to_string() } else { "-inf".to_string() };
    }

    let magnitude = value.abs();
    if magnitude != 0.0 && !(1e-4..1e16).contains(&magnitude) {
        let rendered = format!("{value:e}");
        return match rendered.split_once('e') {
            Some((mantissa, exponent)) => {
                let (sign, digits) = match exponent.strip_prefix('-') {
                    Some(digits) => ('-', digits),
                    None => ('+', exponent),
                };
                format!("{mantissa}e{sign}{digits:0>2}")
            }
            None => rendered,
        };
    }

    if value.fract() == 0.0 {
        format!("{value:.1}")
    } else {
        format!("{value}")
    }
}

pub(crate) fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::None, Value::None) => true,
        (Value::Str(a), Value::Str(b)) => a == b,
        (Value::List(a), Value::List(b)) | (Value::Tuple(a), Value::Tuple(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| values_equal(x, y))
        }
        _ => match (left.as_number(), right.as_number()) {
            (Some(Number::Int(a)), Some(Number::Int(b))) => a == b,
            (Some(a), Some(b)) => a.to_f64() == b.to_f64(),
            _ => false,
        },
    }
}

/// Ordering used by `<`, `sorted`, `max` and friends. `None` means unordered (NaN).
pub(crate) fn partial_order(
    left: &Value,
    right: &Value,
    symbol: &str,
) -> Result<Option<Ordering>, RunError> {
    match (left, right) {
        (Value::Str(a), Value::Str(b)) => Ok(Some(a.cmp(b))),
        (Value::List(a), Value::List(b)) | (Value::Tuple(a), Value::Tuple(b)) => {
            for (x, y) in a.iter().zip(b) {
                if !values_equal(x, y) {
                    return partial_order(x, y, symbol);
                }
            }
            Ok(Some(a.len().cmp(&b.len())))
        }
        _ => match (left.as_number(), right.as_number()) {
            (Some(Number::Int(a)), Some(Number::Int(b))) => Ok(Some(a.cmp(&b))),
            (Some(a), Some(b)) => Ok(a.to_f64().partial_cmp(&b.to_f64())),
            _ => Err(RunError::type_error(format!(
                "'{symbol}' not supported between instances of '{}' and '{}'",
                left.type_name(),
                right.type_name()
            ))),
        },
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Syntax,
    Name,
    Type,
    Value,
    Index,
    ZeroDivision,
    Overflow,
    Limit,
    Timeout,
}

/// Failure raised while parsing or evaluating a snippet.
#[derive(Clone, Debug, PartialEq)]
pub struct RunError {
    pub kind: ErrorKind,
    pub message: String,
}

impl RunError {
    fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn syntax(message: impl fmt::Display, line: usize) -> Self {
        Self::new(ErrorKind::Syntax, format!("invalid syntax: {message} (line {line})"))
    }

    pub fn undefined_name(name: &str) -> Self {
        Self::new(ErrorKind::Name, format!("name '{name}' is not defined"))
    }

    pub fn forbidden_import(module: &str) -> Self {
        Self::new(ErrorKind::Name, format!("import of '{module}' is not allowed"))
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Type, message)
    }

    pub fn value_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Value, message)
    }

    pub fn index_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Index, message)
    }

    pub fn zero_division(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ZeroDivision, message)
    }

    pub fn overflow() -> Self {
        Self::new(ErrorKind::Overflow, "integer result exceeds 64 bits")
    }

    pub fn limit(length: usize, max: usize) -> Self {
        Self::new(
            ErrorKind::Limit,
            format!("collection of size {length} exceeds the limit of {max}"),
        )
    }

    pub fn timeout() -> Self {
        Self::new(ErrorKind::Timeout, "execution timed out")
    }

    /// Text handed back to the generation loop.
    pub fn observation(&self) -> String {
        match self.kind {
            ErrorKind::Timeout => "Error: Execution timed out".to_string(),
            ErrorKind::Name | ErrorKind::Syntax => format!("Error: {}", self.message),
            _ => format!("Error: An unexpected error occurred: {}", self.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{format_float, values_equal, Value};

    #[test]
    fn floats_render_like_python() {
        assert_eq!(format_float(2.0), "2.0");
        assert_eq!(format_float(0.1 + 0.2), "0.30000000000000004");
        assert_eq!(format_float(1e16), "1e+16");
        assert_eq!(format_float(1.5e-5), "1.5e-05");
        assert_eq!(format_float(-0.5), "-0.5");
    }

    #[test]
    fn containers_use_repr_for_elements() {
        let value = Value::List(vec![
            Value::Int(1),
            Value::Str("a".to_string()),
            Value::Tuple(vec![Value::Bool(true)]),
        ]);
        assert_eq!(value.to_string(), "[1, 'a', (True,)]");
        assert_eq!(Value::Str("it's".to_string()).repr(), "\"it's\"");
    }

    #[test]
    fn numeric_equality_crosses_int_and_float() {
        assert!(values_equal(&Value::Int(1), &Value::Float(1.0)));
        assert!(values_equal(&Value::Bool(true), &Value::Int(1)));
        assert!(!values_equal(&Value::Str("1".to_string()), &Value::Int(1)));
    }
}
