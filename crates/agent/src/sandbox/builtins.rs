use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use super::value::{format_float, partial_order, values_equal, Number, RunError, Value};

/// Size bounds applied to every value the sandbox creates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Limits {
    pub max_collection_len: usize,
}

impl Limits {
    pub(crate) fn check(&self, length: usize) -> Result<(), RunError> {
        if length > self.max_collection_len {
            return Err(RunError::limit(length, self.max_collection_len));
        }
        Ok(())
    }

    /// Elements held by `value`, nested collections and string lengths
    /// included. Counting stops once the limit is passed.
    pub(crate) fn size(&self, value: &Value) -> usize {
        match value {
            Value::Str(text) => text.len(),
            Value::List(items) | Value::Tuple(items) => self.size_of_items(items),
            _ => 0,
        }
    }

    /// Size of a list body: one slot per item plus what each item holds.
    pub(crate) fn size_of_items(&self, items: &[Value]) -> usize {
        self.tally(items.len(), items.iter().collect())
    }

    fn tally(&self, mut total: usize, mut pending: Vec<&Value>) -> usize {
        while let Some(value) = pending.pop() {
            match value {
                Value::Str(text) => total = total.saturating_add(text.len()),
                Value::List(items) | Value::Tuple(items) => {
                    total = total.saturating_add(items.len());
                    if total <= self.max_collection_len {
                        pending.extend(items);
                    }
                }
                _ => {}
            }
            if total > self.max_collection_len {
                break;
            }
        }
        total
    }

    pub(crate) fn checked(&self, value: Value) -> Result<Value, RunError> {
        self.check(self.size(&value))?;
        Ok(value)
    }
}

/// Arguments of a built-in call after evaluation.
pub struct CallArgs {
    pub positional: Vec<Value>,
    pub keywords: Vec<(String, Value)>,
}

impl CallArgs {
    fn no_keywords(&self, name: &str) -> Result<(), RunError> {
        if self.keywords.is_empty() {
            Ok(())
        } else {
            Err(RunError::type_error(format!("{name}() takes no keyword arguments")))
        }
    }

    fn keyword(&self, name: &str) -> Option<&Value> {
        self.keywords.iter().find(|(key, _)| key == name).map(|(_, value)| value)
    }

    fn only_keywords(&self, function: &str, allowed: &[&str]) -> Result<(), RunError> {
        match self.keywords.iter().find(|(key, _)| !allowed.contains(&key.as_str())) {
            Some((key, _)) => Err(RunError::type_error(format!(
                "'{key}' is an invalid keyword argument for {function}()"
            ))),
            None => Ok(()),
        }
    }

    fn arity(&self, name: &str, min: usize, max: usize) -> Result<(), RunError> {
        let count = self.positional.len();
        if count < min || count > max {
            let expected = if min == max {
                format!("exactly {min}")
            } else if count < min {
                format!("at least {min}")
            } else {
                format!("at most {max}")
            };
            let noun = if expected.ends_with(" 1") { "argument" } else { "arguments" };
            return Err(RunError::type_error(format!(
                "{name}() takes {expected} {noun} ({count} given)"
            )));
        }
        Ok(())
    }
}

pub type Builtin = fn(&CallArgs, &Limits) -> Result<Value, RunError>;

/// The fixed set of callable names visible to sandboxed code.
///
/// Values are immutable once built; use [`Allowlist::standard`] or assemble a
/// custom set with [`Allowlist::empty`] and [`Allowlist::with`].
#[derive(Clone)]
pub struct Allowlist {
    builtins: BTreeMap<&'static str, Builtin>,
}

impl fmt::Debug for Allowlist {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.builtins.keys()).finish()
    }
}

impl Default for Allowlist {
    fn default() -> Self {
        Self::standard()
    }
}

impl Allowlist {
    pub fn empty() -> Self {
        Self { builtins: BTreeMap::new() }
    }

    /// Pure arithmetic, conversion and sequence helpers.
    pub fn standard() -> Self {
        Self::empty()
            .with("abs", abs)
            .with("all", all)
            .with("any", any)
            .with("bin", bin)
            .with("bool", bool_)
            .with("chr", chr)
            .with("divmod", divmod)
            .with("enumerate", enumerate)
            .with("float", float)
            .with("hex", hex)
            .with("int", int)
            .with("len", len)
            .with("list", list)
            .with("max", max)
            .with("min", min)
            .with("oct", oct)
            .with("ord", ord)
            .with("pow", pow)
            .with("range", range)
            .with("repr", repr)
            .with("reversed", reversed)
            .with("round", round)
            .with("sorted", sorted)
            .with("str", str_)
            .with("sum", sum)
            .with("tuple", tuple)
            .with("zip", zip)
    }

    pub fn with(mut self, name: &'static str, builtin: Builtin) -> Self {
        self.builtins.insert(name, builtin);
        self
    }

    pub fn without(mut self, name: &str) -> Self {
        self.builtins.remove(name);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.builtins.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.builtins.keys().copied()
    }

    pub(crate) fn get(&self, name: &str) -> Option<Builtin> {
        self.builtins.get(name).copied()
    }
}

fn single<'a>(args: &'a CallArgs, name: &str) -> Result<&'a Value, RunError> {
    args.no_keywords(name)?;
    args.arity(name, 1, 1)?;
    Ok(&args.positional[0])
}

fn integer(value: &Value) -> Result<i64, RunError> {
    value.as_int().ok_or_else(|| {
        RunError::type_error(format!(
            "'{}' object cannot be interpreted as an integer",
            value.type_name()
        ))
    })
}

fn abs(args: &CallArgs, _: &Limits) -> Result<Value, RunError> {
    match single(args, "abs")?.as_number() {
        Some(Number::Int(value)) => value.checked_abs().map(Value::Int).ok_or_else(RunError::overflow),
        Some(Number::Float(value)) => Ok(Value::Float(value.abs())),
        None => Err(RunError::type_error(format!(
            "bad operand type for abs(): '{}'",
            args.positional[0].type_name()
        ))),
    }
}

fn all(args: &CallArgs, _: &Limits) -> Result<Value, RunError> {
    Ok(Value::Bool(single(args, "all")?.items()?.iter().all(Value::truthy)))
}

fn any(args: &CallArgs, _: &Limits) -> Result<Value, RunError> {
    Ok(Value::Bool(single(args, "any")?.items()?.iter().any(Value::truthy)))
}

fn radix_string(args: &CallArgs, name: &str, prefix: &str) -> Result<Value, RunError> {
    let value = integer(single(args, name)?)?;
    let magnitude = value.unsigned_abs();
    let digits = match prefix {
        "0b" => format!("{magnitude:b}"),
        "0o" => format!("{magnitude:o}"),
        _ => format!("{magnitude:x}"),
    };
    let sign = if value < 0 { "-" } else { "" };
    Ok(Value::Str(format!("{sign}{prefix}{digits}")))
}

fn bin(args: &CallArgs, _: &Limits) -> Result<Value, RunError> {
    radix_string(args, "bin", "0b")
}

fn oct(args: &CallArgs, _: &Limits) -> Result<Value, RunError> {
    radix_string(args, "oct", "0o")
}

fn hex(args: &CallArgs, _: &Limits) -> Result<Value, RunError> {
    radix_string(args, "hex", "0x")
}

fn bool_(args: &CallArgs, _: &Limits) -> Result<Value, RunError> {
    args.no_keywords("bool")?;
    args.arity("bool", 0, 1)?;
    Ok(Value::Bool(args.positional.first().is_some_and(Value::truthy)))
}

fn chr(args: &CallArgs, _: &Limits) -> Result<Value, RunError> {
    let code = integer(single(args, "chr")?)?;
    u32::try_from(code)
        .ok()
        .and_then(char::from_u32)
        .map(|ch| Value::Str(ch.to_string()))
        .ok_or_else(|| RunError::value_error("chr() arg not in range(0x110000)"))
}

pub(crate) fn floor_div(left: i64, right: i64) -> Result<i64, RunError> {
    if right == 0 {
        return Err(RunError::zero_division("integer division or modulo by zero"));
    }
    let quotient = left.checked_div(right).ok_or_else(RunError::overflow)?;
    if left % right != 0 && ((left < 0) != (right < 0)) {
        Ok(quotient - 1)
    } else {
        Ok(quotient)
    }
}

pub(crate) fn modulo(left: i64, right: i64) -> Result<i64, RunError> {
    if right == 0 {
        return Err(RunError::zero_division("integer division or modulo by zero"));
    }
    let remainder = left.checked_rem(right).ok_or_else(RunError::overflow)?;
    if remainder != 0 && ((remainder < 0) != (right < 0)) {
        Ok(remainder + right)
    } else {
        Ok(remainder)
    }
}

pub(crate) fn float_modulo(left: f64, right: f64) -> Result<f64, RunError> {
    if right == 0.0 {
        return Err(RunError::zero_division("float modulo"));
    }
    let remainder = left % right;
    if remainder != 0.0 && ((remainder < 0.0) != (right < 0.0)) {
        Ok(remainder + right)
    } else {
        Ok(remainder)
    }
}

fn divmod(args: &CallArgs, _: &Limits) -> Result<Value, RunError> {
    args.no_keywords("divmod")?;
    args.arity("divmod", 2, 2)?;
    let (left, right) = (&args.positional[0], &args.positional[1]);
    match (left.as_number(), right.as_number()) {
        (Some(Number::Int(a)), Some(Number::Int(b))) => {
            Ok(Value::Tuple(vec![Value::Int(floor_div(a, b)?), Value::Int(modulo(a, b)?)]))
        }
        (Some(a), Some(b)) => {
            let (a, b) = (a.to_f64(), b.to_f64());
            if b == 0.0 {
                return Err(RunError::zero_division("float divmod()"));
            }
            Ok(Value::Tuple(vec![Value::Float((a / b).floor()), Value::Float(float_modulo(a, b)?)]))
        }
        _ => Err(RunError::type_error(format!(
            "unsupported operand type(s) for divmod(): '{}' and '{}'",
            left.type_name(),
            right.type_name()
        ))),
    }
}

fn enumerate(args: &CallArgs, limits: &Limits) -> Result<Value, RunError> {
    args.only_keywords("enumerate", &["start"])?;
    args.arity("enumerate", 1, 2)?;
    let start = match args.positional.get(1).or_else(|| args.keyword("start")) {
        Some(value) => integer(value)?,
        None => 0,
    };
    let items = args.positional[0].items()?;
    limits.check(items.len())?;
    items
        .into_iter()
        .enumerate()
        .map(|(offset, item)| {
            let index = i64::try_from(offset)
                .ok()
                .and_then(|offset| start.checked_add(offset))
                .ok_or_else(RunError::overflow)?;
            Ok(Value::Tuple(vec![Value::Int(index), item]))
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Value::List)
}

fn float(args: &CallArgs, _: &Limits) -> Result<Value, RunError> {
    args.no_keywords("float")?;
    args.arity("float", 0, 1)?;
    let Some(value) = args.positional.first() else { return Ok(Value::Float(0.0)) };
    match value {
        Value::Str(text) => {
            let trimmed = text.trim();
            let parsed = match trimmed.to_ascii_lowercase().as_str() {
                "inf" | "+inf" | "infinity" => Ok(f64::INFINITY),
                "-inf" | "-infinity" => Ok(f64::NEG_INFINITY),
                "nan" | "+nan" | "-nan" => Ok(f64::NAN),
                _ => trimmed.replace('_', "").parse::<f64>(),
            };
            parsed.map(Value::Float).map_err(|_| {
                RunError::value_error(format!("could not convert string to float: {}", value.repr()))
            })
        }
        other => match other.as_number() {
            Some(number) => Ok(Value::Float(number.to_f64())),
            None => Err(RunError::type_error(format!(
                "float() argument must be a string or a real number, not '{}'",
                other.type_name()
            ))),
        },
    }
}

pub(crate) fn float_to_int(value: f64) -> Result<i64, RunError> {
    if value.is_nan() {
        return Err(RunError::value_error("cannot convert float NaN to integer"));
    }
    if value.is_infinite() {
        return Err(RunError::overflow());
    }
    let truncated = value.trunc();
    if truncated < i64::MIN as f64 || truncated >= i64::MAX as f64 {
        return Err(RunError::overflow());
    }
    Ok(truncated as i64)
}

fn int(args: &CallArgs, _: &Limits) -> Result<Value, RunError> {
    args.only_keywords("int", &["base"])?;
    args.arity("int", 0, 2)?;
    let Some(value) = args.positional.first() else { return Ok(Value::Int(0)) };
    let base = args.positional.get(1).or_else(|| args.keyword("base"));

    match (value, base) {
        (Value::Str(text), base) => {
            let radix = match base {
                Some(base) => integer(base)?,
                None => 10,
            };
            let radix = u32::try_from(radix)
                .ok()
                .filter(|radix| (2..=36).contains(radix))
                .ok_or_else(|| RunError::value_error("int() base must be >= 2 and <= 36"))?;
            let cleaned = text.trim().replace('_', "");
            i64::from_str_radix(&cleaned, radix).map(Value::Int).map_err(|_| {
                RunError::value_error(format!(
                    "invalid literal for int() with base {radix}: {}",
                    value.repr()
                ))
            })
        }
        (_, Some(_)) => Err(RunError::type_error("int() can't convert non-string with explicit base")),
        (other, None) => match other.as_number() {
            Some(Number::Int(value)) => Ok(Value::Int(value)),
            Some(Number::Float(value)) => float_to_int(value).map(Value::Int),
            None => Err(RunError::type_error(format!(
                "int() argument must be a string or a real number, not '{}'",
                other.type_name()
            ))),
        },
    }
}

fn len(args: &CallArgs, _: &Limits) -> Result<Value, RunError> {
    let value = single(args, "len")?;
    let length = value.len().ok_or_else(|| {
        RunError::type_error(format!("object of type '{}' has no len()", value.type_name()))
    })?;
    i64::try_from(length).map(Value::Int).map_err(|_| RunError::overflow())
}

fn list(args: &CallArgs, _: &Limits) -> Result<Value, RunError> {
    args.no_keywords("list")?;
    args.arity("list", 0, 1)?;
    match args.positional.first() {
        Some(value) => Ok(Value::List(value.items()?)),
        None => Ok(Value::List(Vec::new())),
    }
}

fn tuple(args: &CallArgs, _: &Limits) -> Result<Value, RunError> {
    args.no_keywords("tuple")?;
    args.arity("tuple", 0, 1)?;
    match args.positional.first() {
        Some(value) => Ok(Value::Tuple(value.items()?)),
        None => Ok(Value::Tuple(Vec::new())),
    }
}

fn extreme(args: &CallArgs, name: &str, wanted: Ordering) -> Result<Value, RunError> {
    args.only_keywords(name, &["default"])?;
    let candidates = match args.positional.as_slice() {
        [] => return Err(RunError::type_error(format!("{name} expected at least 1 argument, got 0"))),
        [iterable] => iterable.items()?,
        many => many.to_vec(),
    };

    let mut best: Option<Value> = None;
    for candidate in candidates {
        best = match best {
            None => Some(candidate),
            Some(current) => {
                let symbol = if wanted == Ordering::Greater { ">" } else { "<" };
                if partial_order(&candidate, &current, symbol)? == Some(wanted) {
                    Some(candidate)
                } else {
                    Some(current)
                }
            }
        };
    }

    match (best, args.keyword("default")) {
        (Some(value), _) => Ok(value),
        (None, Some(default)) => Ok(default.clone()),
        (None, None) => Err(RunError::value_error(format!("{name}() arg is an empty sequence"))),
    }
}

fn max(args: &CallArgs, _: &Limits) -> Result<Value, RunError> {
    extreme(args, "max", Ordering::Greater)
}

fn min(args: &CallArgs, _: &Limits) -> Result<Value, RunError> {
    extreme(args, "min", Ordering::Less)
}

fn ord(args: &CallArgs, _: &Limits) -> Result<Value, RunError> {
    let value = single(args, "ord")?;
    let Value::Str(text) = value else {
        return Err(RunError::type_error(format!(
            "ord() expected string of length 1, but {} found",
            value.type_name()
        )));
    };
    let mut chars = text.chars();
    match (chars.next(), chars.next()) {
        (Some(ch), None) => Ok(Value::Int(i64::from(u32::from(ch)))),
        _ => Err(RunError::type_error(format!(
            "ord() expected a character, but string of length {} found",
            text.chars().count()
        ))),
    }
}

pub(crate) fn int_pow(base: i64, exponent: i64) -> Result<Value, RunError> {
    if exponent < 0 {
        return float_pow(base as f64, exponent as f64);
    }
    match base {
        0 => return Ok(Value::Int(i64::from(exponent == 0))),
        1 => return Ok(Value::Int(1)),
        -1 => return Ok(Value::Int(if exponent % 2 == 0 { 1 } else { -1 })),
        _ => {}
    }
    let exponent = u32::try_from(exponent).map_err(|_| RunError::overflow())?;
    base.checked_pow(exponent).map(Value::Int).ok_or_else(RunError::overflow)
}

pub(crate) fn float_pow(base: f64, exponent: f64) -> Result<Value, RunError> {
    if base == 0.0 && exponent < 0.0 {
        return Err(RunError::zero_division("0.0 cannot be raised to a negative power"));
    }
    Ok(Value::Float(base.powf(exponent)))
}

fn pow(args: &CallArgs, _: &Limits) -> Result<Value, RunError> {
    args.no_keywords("pow")?;
    args.arity("pow", 2, 3)?;
    let (base, exponent) = (&args.positional[0], &args.positional[1]);

    if let Some(modulus) = args.positional.get(2) {
        let (Some(base), Some(exponent), Some(modulus)) =
            (base.as_int(), exponent.as_int(), modulus.as_int())
        else {
            return Err(RunError::type_error(
                "pow() 3rd argument not allowed unless all arguments are integers",
            ));
        };
        if modulus == 0 {
            return Err(RunError::value_error("pow() 3rd argument cannot be 0"));
        }
        if exponent < 0 {
            return Err(RunError::value_error("base is not invertible for the given modulus"));
        }
        let modulus = i128::from(modulus);
        let mut result: i128 = 1;
        let mut factor = i128::from(base).rem_euclid(modulus);
        let mut remaining = exponent;
        while remaining > 0 {
            if remaining & 1 == 1 {
                result = (result * factor).rem_euclid(modulus);
            }
            factor = (factor * factor).rem_euclid(modulus);
            remaining >>= 1;
        }
        let result = if modulus < 0 && result > 0 { result + modulus } else { result };
        return i64::try_from(result).map(Value::Int).map_err(|_| RunError::overflow());
    }

    match (base.as_number(), exponent.as_number()) {
        (Some(Number::Int(base)), Some(Number::Int(exponent))) => int_pow(base, exponent),
        (Some(base), Some(exponent)) => float_pow(base.to_f64(), exponent.to_f64()),
        _ => Err(RunError::type_error(format!(
            "unsupported operand type(s) for ** or pow(): '{}' and '{}'",
            base.type_name(),
            exponent.type_name()
        ))),
    }
}

fn range(args: &CallArgs, limits: &Limits) -> Result<Value, RunError> {
    args.no_keywords("range")?;
    args.arity("range", 1, 3)?;
    let bounds = args
        .positional
        .iter()
        .map(integer)
        .collect::<Result<Vec<_>, _>>()?;
    let (start, stop, step) = match bounds.as_slice() {
        [stop] => (0, *stop, 1),
        [start, stop] => (*start, *stop, 1),
        [start, stop, step] => (*start, *stop, *step),
        _ => return Err(RunError::type_error("range expected at most 3 arguments")),
    };
    if step == 0 {
        return Err(RunError::value_error("range() arg 3 must not be zero"));
    }

    let span = if step > 0 {
        i128::from(stop) - i128::from(start)
    } else {
        i128::from(start) - i128::from(stop)
    };
    let stride = i128::from(step).abs();
    let count = if span <= 0 { 0 } else { (span + stride - 1) / stride };
    let count = usize::try_from(count).unwrap_or(usize::MAX);
    limits.check(count)?;

    let mut items = Vec::with_capacity(count);
    let mut current = i128::from(start);
    for _ in 0..count {
        items.push(Value::Int(i64::try_from(current).map_err(|_| RunError::overflow())?));
        current += i128::from(step);
    }
    Ok(Value::List(items))
}

fn repr(args: &CallArgs, _: &Limits) -> Result<Value, RunError> {
    Ok(Value::Str(single(args, "repr")?.repr()))
}

fn reversed(args: &CallArgs, _: &Limits) -> Result<Value, RunError> {
    let value = single(args, "reversed")?;
    if matches!(value, Value::Str(_) | Value::List(_) | Value::Tuple(_)) {
        let mut items = value.items()?;
        items.reverse();
        Ok(Value::List(items))
    } else {
        Err(RunError::type_error(format!("'{}' object is not reversible", value.type_name())))
    }
}

/// Round half to even, matching Python's `round`.
pub(crate) fn round_half_even(value: f64) -> f64 {
    let rounded = value.round();
    if (value - value.trunc()).abs() == 0.5 {
        2.0 * (value / 2.0).round()
    } else {
        rounded
    }
}

fn round(args: &CallArgs, _: &Limits) -> Result<Value, RunError> {
    args.only_keywords("round", &["ndigits"])?;
    args.arity("round", 1, 2)?;
    let value = &args.positional[0];
    let digits = match args.positional.get(1).or_else(|| args.keyword("ndigits")) {
        None | Some(Value::None) => None,
        Some(digits) => Some(integer(digits)?),
    };

    match (value.as_number(), digits) {
        (Some(Number::Int(number)), _) => Ok(Value::Int(number)),
        (Some(Number::Float(number)), None) => float_to_int(round_half_even(number)).map(Value::Int),
        (Some(Number::Float(number)), Some(digits)) => {
            let digits = i32::try_from(digits.clamp(-308, 308)).unwrap_or(0);
            let scale = 10f64.powi(digits);
            let scaled = number * scale;
            if !scaled.is_finite() {
                return Ok(Value::Float(number));
            }
            Ok(Value::Float(round_half_even(scaled) / scale))
        }
        (None, _) => Err(RunError::type_error(format!(
            "type {} doesn't define __round__ method",
            value.type_name()
        ))),
    }
}

fn sorted(args: &CallArgs, _: &Limits) -> Result<Value, RunError> {
    args.only_keywords("sorted", &["reverse"])?;
    args.arity("sorted", 1, 1)?;
    let mut items = args.positional[0].items()?;
    sort_values(&mut items, args.keyword("reverse").is_some_and(Value::truthy))?;
    Ok(Value::List(items))
}

/// Stable sort shared by `sorted()` and `list.sort()`.
pub(crate) fn sort_values(items: &mut [Value], reverse: bool) -> Result<(), RunError> {
    let mut failure = None;
    items.sort_by(|left, right| match partial_order(left, right, "<") {
        Ok(ordering) => ordering.unwrap_or(Ordering::Equal),
        Err(error) => {
            failure.get_or_insert(error);
            Ordering::Equal
        }
    });
    if let Some(error) = failure {
        return Err(error);
    }
    if reverse {
        items.reverse();
    }
    Ok(())
}

fn str_(args: &CallArgs, _: &Limits) -> Result<Value, RunError> {
    args.no_keywords("str")?;
    args.arity("str", 0, 1)?;
    Ok(Value::Str(args.positional.first().map(Value::to_string).unwrap_or_default()))
}

fn sum(args: &CallArgs, _: &Limits) -> Result<Value, RunError> {
    args.only_keywords("sum", &["start"])?;
    args.arity("sum", 1, 2)?;
    let mut total = args
        .positional
        .get(1)
        .or_else(|| args.keyword("start"))
        .cloned()
        .unwrap_or(Value::Int(0));
    if matches!(total, Value::Str(_)) {
        return Err(RunError::type_error("sum() can't sum strings [use ''.join(seq) instead]"));
    }

    for item in args.positional[0].items()? {
        total = match (total.as_number(), item.as_number()) {
            (Some(Number::Int(a)), Some(Number::Int(b))) => {
                Value::Int(a.checked_add(b).ok_or_else(RunError::overflow)?)
            }
            (Some(a), Some(b)) => Value::Float(a.to_f64() + b.to_f64()),
            _ => {
                return Err(RunError::type_error(format!(
                    "unsupported operand type(s) for +: '{}' and '{}'",
                    total.type_name(),
                    item.type_name()
                )));
            }
        };
    }
    Ok(total)
}

fn zip(args: &CallArgs, _: &Limits) -> Result<Value, RunError> {
    args.no_keywords("zip")?;
    let columns =
        args.positional.iter().map(Value::items).collect::<Result<Vec<_>, _>>()?;
    let rows = columns.iter().map(Vec::len).min().unwrap_or(0);
    Ok(Value::List(
        (0..rows)
            .map(|row| Value::Tuple(columns.iter().map(|column| column[row].clone()).collect()))
            .collect(),
    ))
}

/// Applies a format specification (`[,][.precision][type]`) to a value.
pub(crate) fn format_value(value: &Value, spec: &str) -> Result<String, RunError> {
    if spec.is_empty() {
        return Ok(value.to_string());
    }

    let invalid = || {
        RunError::value_error(format!(
            "Invalid format specifier '{spec}' for object of type '{}'",
            value.type_name()
        ))
    };

    let mut rest = spec;
    let (fill, align) = {
        let chars: Vec<char> = rest.chars().take(2).collect();
        match chars.as_slice() {
            [fill, align, ..] if matches!(align, '<' | '>' | '^') => {
                rest = &rest[fill.len_utf8() + 1..];
                (*fill, Some(*align))
            }
            [align, ..] if matches!(align, '<' | '>' | '^') => {
                rest = &rest[1..];
                (' ', Some(*align))
            }
            _ => (' ', None),
        }
    };
    let width_end = rest.find(|ch: char| !ch.is_ascii_digit()).unwrap_or(rest.len());
    let width: usize = if width_end == 0 { 0 } else { rest[..width_end].parse().map_err(|_| invalid())? };
    rest = &rest[width_end..];
    let grouping = rest.starts_with(',');
    if grouping {
        rest = &rest[1..];
    }
    let precision = match rest.strip_prefix('.') {
        Some(after) => {
            let digits_end = after.find(|ch: char| !ch.is_ascii_digit()).unwrap_or(after.len());
            let precision: usize = after[..digits_end].parse().map_err(|_| invalid())?;
            rest = &after[digits_end..];
            Some(precision.min(50))
        }
        None => None,
    };
    let kind = match rest {
        "" => None,
        single if single.chars().count() == 1 => single.chars().next(),
        _ => return Err(invalid()),
    };

    let body = match (kind, value.as_number()) {
        (Some('f' | 'F'), Some(number)) => {
            fixed(number.to_f64(), precision.unwrap_or(6), grouping)
        }
        (Some('%'), Some(number)) => {
            format!("{}%", fixed(number.to_f64() * 100.0, precision.unwrap_or(6), grouping))
        }
        (Some('e' | 'E'), Some(number)) => {
            let rendered = format!("{:.*e}", precision.unwrap_or(6), number.to_f64());
            let rendered = match rendered.split_once('e') {
                Some((mantissa, exponent)) => {
                    let (sign, digits) = match exponent.strip_prefix('-') {
                        Some(digits) => ('-', digits),
                        None => ('+', exponent),
                    };
                    format!("{mantissa}e{sign}{digits:0>2}")
                }
                None => rendered,
            };
            if kind == Some('E') { rendered.to_uppercase() } else { rendered }
        }
        (Some('d') | None, Some(Number::Int(number))) if precision.is_none() => {
            if grouping { group_digits(&number.to_string()) } else { number.to_string() }
        }
        (None, Some(Number::Float(number))) => match precision {
            Some(precision) => fixed(number, precision, grouping),
            None if grouping => fixed(number, 0, true),
            None => format_float(number),
        },
        (Some('s') | None, None) => {
            let text = value.to_string();
            match precision {
                Some(precision) => text.chars().take(precision).collect(),
                None => text,
            }
        }
        _ => return Err(invalid()),
    };

    let length = body.chars().count();
    if width <= length {
        return Ok(body);
    }
    let padding = width - length;
    let default_align = if value.as_number().is_some() { '>' } else { '<' };
    let pad = |count: usize| fill.to_string().repeat(count);
    Ok(match align.unwrap_or(default_align) {
        '<' => format!("{body}{}", pad(padding)),
        '^' => format!("{}{body}{}", pad(padding / 2), pad(padding - padding / 2)),
        _ => format!("{}{body}", pad(padding)),
    })
}

fn fixed(value: f64, precision: usize, grouping: bool) -> String {
    let rendered = format!("{value:.precision$}");
    if !grouping || !value.is_finite() {
        return rendered;
    }
    match rendered.split_once('.') {
        Some((whole, fraction)) => format!("{}.{fraction}", group_digits(whole)),
        None => group_digits(&rendered),
    }
}

fn group_digits(whole: &str) -> String {
    let (sign, digits) = match whole.strip_prefix('-') {
        Some(digits) => ("-", digits),
        None => ("", whole),
    };
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (index, ch) in digits.chars().enumerate() {
        if index > 0 && (digits.len() - index) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    format!("{sign}{grouped}")
}

pub(crate) fn contains(container: &Value, needle: &Value) -> Result<bool, RunError> {
    match container {
        Value::Str(haystack) => match needle {
            Value::Str(needle) => Ok(haystack.contains(needle.as_str())),
            other => Err(RunError::type_error(format!(
                "'in <string>' requires string as left operand, not {}",
                other.type_name()
            ))),
        },
        Value::List(items) | Value::Tuple(items) => {
            Ok(items.iter().any(|item| values_equal(item, needle)))
        }
        other => Err(RunError::type_error(format!(
            "argument of type '{}' is not iterable",
            other.type_name()
        ))),
    }
}
