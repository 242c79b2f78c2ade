use super::builtins::{format_value, sort_values, CallArgs, Limits};
use super::value::{values_equal, RunError, Value};

const MUTATING_LIST_METHODS: &[&str] =
    &["append", "extend", "insert", "pop", "remove", "clear", "sort", "reverse"];

pub(crate) fn is_mutating_list_method(method: &str) -> bool {
    MUTATING_LIST_METHODS.contains(&method)
}

pub(crate) fn no_attribute(receiver: &Value, name: &str) -> RunError {
    RunError::type_error(format!(
        "'{}' object has no attribute '{name}'",
        receiver.type_name()
    ))
}

fn arity(args: &CallArgs, method: &str, min: usize, max: usize) -> Result<(), RunError> {
    if !args.keywords.is_empty() {
        return Err(RunError::type_error(format!("{method}() takes no keyword arguments")));
    }
    let count = args.positional.len();
    if count < min || count > max {
        return Err(RunError::type_error(format!(
            "{method}() takes from {min} to {max} arguments ({count} given)"
        )));
    }
    Ok(())
}

fn text_argument<'a>(value: &'a Value, method: &str) -> Result<&'a str, RunError> {
    match value {
        Value::Str(text) => Ok(text),
        other => Err(RunError::type_error(format!(
            "{method}() argument must be str, not {}",
            other.type_name()
        ))),
    }
}

fn index_of(items: &[Value], needle: &Value, kind: &str) -> Result<Value, RunError> {
    items
        .iter()
        .position(|item| values_equal(item, needle))
        .map(|position| Value::Int(position as i64))
        .ok_or_else(|| RunError::value_error(format!("{kind}.index(x): x not in {kind}")))
}

fn count_of(items: &[Value], needle: &Value) -> Value {
    Value::Int(items.iter().filter(|item| values_equal(item, needle)).count() as i64)
}

/// Methods that rewrite a list bound to a name in place.
pub(crate) fn call_list_method_mut(
    items: &mut Vec<Value>,
    method: &str,
    args: &CallArgs,
    limits: &Limits,
) -> Result<Value, RunError> {
    match method {
        "append" => {
            arity(args, "append", 1, 1)?;
            limits.check(limits.size_of_items(items) + 1 + limits.size(&args.positional[0]))?;
            items.push(args.positional[0].clone());
        }
        "extend" => {
            arity(args, "extend", 1, 1)?;
            let extra = args.positional[0].items()?;
            limits.check(limits.size_of_items(items) + limits.size_of_items(&extra))?;
            items.extend(extra);
        }
        "insert" => {
            arity(args, "insert", 2, 2)?;
            let index = args.positional[0].as_int().ok_or_else(|| {
                RunError::type_error("'insert' index must be an integer")
            })?;
            limits.check(limits.size_of_items(items) + 1 + limits.size(&args.positional[1]))?;
            let length = items.len() as i64;
            let position = if index < 0 { (index + length).max(0) } else { index.min(length) };
            items.insert(position as usize, args.positional[1].clone());
        }
        "pop" => {
            arity(args, "pop", 0, 1)?;
            if items.is_empty() {
                return Err(RunError::index_error("pop from empty list"));
            }
            let length = items.len() as i64;
            let index = match args.positional.first() {
                Some(value) => value.as_int().ok_or_else(|| {
                    RunError::type_error("'pop' index must be an integer")
                })?,
                None => -1,
            };
            let position = if index < 0 { index + length } else { index };
            if !(0..length).contains(&position) {
                return Err(RunError::index_error("pop index out of range"));
            }
            return Ok(items.remove(position as usize));
        }
        "remove" => {
            arity(args, "remove", 1, 1)?;
            let position = items
                .iter()
                .position(|item| values_equal(item, &args.positional[0]))
                .ok_or_else(|| RunError::value_error("list.remove(x): x not in list"))?;
            items.remove(position);
        }
        "clear" => {
            arity(args, "clear", 0, 0)?;
            items.clear();
        }
        "sort" => {
            if !args.positional.is_empty() {
                return Err(RunError::type_error("sort() takes no positional arguments"));
            }
            let mut reverse = false;
            for (key, value) in &args.keywords {
                match key.as_str() {
                    "reverse" => reverse = value.truthy(),
                    other => {
                        return Err(RunError::type_error(format!(
                            "'{other}' is an invalid keyword argument for sort()"
                        )));
                    }
                }
            }
            sort_values(items, reverse)?;
        }
        "reverse" => {
            arity(args, "reverse", 0, 0)?;
            items.reverse();
        }
        other => return Err(no_attribute(&Value::List(Vec::new()), other)),
    }
    Ok(Value::None)
}

/// Non-mutating methods on any receiver.
pub(crate) fn call_method(
    receiver: &Value,
    method: &str,
    args: &CallArgs,
    limits: &Limits,
) -> Result<Value, RunError> {
    match receiver {
        Value::Str(text) => string_method(text, method, args, limits),
        Value::List(items) | Value::Tuple(items) => match method {
            "index" => {
                arity(args, "index", 1, 1)?;
                index_of(items, &args.positional[0], receiver.type_name())
            }
            "count" => {
                arity(args, "count", 1, 1)?;
                Ok(count_of(items, &args.positional[0]))
            }
            "copy" if matches!(receiver, Value::List(_)) => {
                arity(args, "copy", 0, 0)?;
                Ok(receiver.clone())
            }
            _ => Err(no_attribute(receiver, method)),
        },
        other => Err(no_attribute(other, method)),
    }
}

fn strip_set<'a>(
    text: &'a str,
    args: &CallArgs,
    method: &str,
    strip: impl Fn(&'a str, &dyn Fn(char) -> bool) -> &'a str,
) -> Result<Value, RunError> {
    arity(args, method, 0, 1)?;
    let stripped = match args.positional.first() {
        None | Some(Value::None) => strip(text, &|ch: char| ch.is_whitespace()),
        Some(value) => {
            let chars: Vec<char> = text_argument(value, method)?.chars().collect();
            strip(text, &|ch: char| chars.contains(&ch))
        }
    };
    Ok(Value::Str(stripped.to_string()))
}

fn affix_matches(args: &CallArgs, method: &str, test: impl Fn(&str) -> bool) -> Result<Value, RunError> {
    arity(args, method, 1, 1)?;
    let matched = match &args.positional[0] {
        Value::Str(affix) => test(affix),
        Value::Tuple(options) => {
            let mut any = false;
            for option in options {
                any |= test(text_argument(option, method)?);
            }
            any
        }
        other => {
            return Err(RunError::type_error(format!(
                "{method} first arg must be str or a tuple of str, not {}",
                other.type_name()
            )));
        }
    };
    Ok(Value::Bool(matched))
}

fn padded(text: &str, args: &CallArgs, method: &str) -> Result<(usize, char), RunError> {
    arity(args, method, 1, 2)?;
    let width = args.positional[0]
        .as_int()
        .ok_or_else(|| RunError::type_error(format!("{method}() width must be an integer")))?;
    let fill = match args.positional.get(1) {
        Some(value) => {
            let fill = text_argument(value, method)?;
            let mut chars = fill.chars();
            match (chars.next(), chars.next()) {
                (Some(ch), None) => ch,
                _ => {
                    return Err(RunError::type_error(
                        "The fill character must be exactly one character long",
                    ));
                }
            }
        }
        None => ' ',
    };
    let length = text.chars().count();
    Ok((usize::try_from(width).unwrap_or(0).saturating_sub(length), fill))
}

fn string_method(
    text: &str,
    method: &str,
    args: &CallArgs,
    limits: &Limits,
) -> Result<Value, RunError> {
    let owned = |value: String| -> Result<Value, RunError> { Ok(Value::Str(value)) };
    match method {
        "upper" => {
            arity(args, method, 0, 0)?;
            owned(text.to_uppercase())
        }
        "lower" => {
            arity(args, method, 0, 0)?;
            owned(text.to_lowercase())
        }
        "title" => {
            arity(args, method, 0, 0)?;
            let mut out = String::with_capacity(text.len());
            let mut previous_cased = false;
            for ch in text.chars() {
                if previous_cased {
                    out.extend(ch.to_lowercase());
                } else {
                    out.extend(ch.to_uppercase());
                }
                previous_cased = ch.is_alphabetic();
            }
            owned(out)
        }
        "capitalize" => {
            arity(args, method, 0, 0)?;
            let mut chars = text.chars();
            owned(match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            })
        }
        "strip" => strip_set(text, args, method, |text, predicate| text.trim_matches(predicate)),
        "lstrip" => {
            strip_set(text, args, method, |text, predicate| text.trim_start_matches(predicate))
        }
        "rstrip" => strip_set(text, args, method, |text, predicate| text.trim_end_matches(predicate)),
        "split" => {
            if args.positional.len() > 2 {
                return Err(RunError::type_error("split() takes at most 2 arguments"));
            }
            let separator = args
                .positional
                .first()
                .or_else(|| args.keywords.iter().find(|(key, _)| key == "sep").map(|(_, v)| v));
            let max_split = args
                .positional
                .get(1)
                .or_else(|| args.keywords.iter().find(|(key, _)| key == "maxsplit").map(|(_, v)| v))
                .map(|value| {
                    value.as_int().ok_or_else(|| RunError::type_error("maxsplit must be an integer"))
                })
                .transpose()?
                .unwrap_or(-1);
            let pieces: Vec<String> = match separator {
                None | Some(Value::None) => {
                    let mut pieces = Vec::new();
                    let mut rest = text.trim_start();
                    while !rest.is_empty() {
                        if max_split >= 0 && pieces.len() as i64 == max_split {
                            pieces.push(rest.to_string());
                            break;
                        }
                        let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
                        pieces.push(rest[..end].to_string());
                        rest = rest[end..].trim_start();
                    }
                    pieces
                }
                Some(value) => {
                    let separator = text_argument(value, method)?;
                    if separator.is_empty() {
                        return Err(RunError::value_error("empty separator"));
                    }
                    if max_split >= 0 {
                        let count = usize::try_from(max_split).unwrap_or(usize::MAX);
                        text.splitn(count.saturating_add(1), separator).map(str::to_string).collect()
                    } else {
                        text.split(separator).map(str::to_string).collect()
                    }
                }
            };
            limits.check(pieces.len())?;
            Ok(Value::List(pieces.into_iter().map(Value::Str).collect()))
        }
        "splitlines" => {
            arity(args, method, 0, 0)?;
            Ok(Value::List(text.lines().map(|line| Value::Str(line.to_string())).collect()))
        }
        "join" => {
            arity(args, method, 1, 1)?;
            let mut parts = Vec::new();
            for (index, item) in args.positional[0].items()?.into_iter().enumerate() {
                match item {
                    Value::Str(part) => parts.push(part),
                    other => {
                        return Err(RunError::type_error(format!(
                            "sequence item {index}: expected str instance, {} found",
                            other.type_name()
                        )));
                    }
                }
            }
            let joined = parts.join(text);
            limits.check(joined.len())?;
            owned(joined)
        }
        "replace" => {
            arity(args, method, 2, 3)?;
            let old = text_argument(&args.positional[0], method)?;
            let new = text_argument(&args.positional[1], method)?;
            let replaced = match args.positional.get(2).and_then(Value::as_int) {
                Some(count) if count >= 0 => {
                    text.replacen(old, new, usize::try_from(count).unwrap_or(usize::MAX))
                }
                _ => text.replace(old, new),
            };
            limits.check(replaced.len())?;
            owned(replaced)
        }
        "startswith" => affix_matches(args, method, |affix| text.starts_with(affix)),
        "endswith" => affix_matches(args, method, |affix| text.ends_with(affix)),
        "find" | "index" => {
            arity(args, method, 1, 1)?;
            let needle = text_argument(&args.positional[0], method)?;
            match text.find(needle) {
                Some(byte_offset) => Ok(Value::Int(text[..byte_offset].chars().count() as i64)),
                None if method == "find" => Ok(Value::Int(-1)),
                None => Err(RunError::value_error("substring not found")),
            }
        }
        "count" => {
            arity(args, method, 1, 1)?;
            let needle = text_argument(&args.positional[0], method)?;
            let count = if needle.is_empty() {
                text.chars().count() + 1
            } else {
                text.matches(needle).count()
            };
            Ok(Value::Int(count as i64))
        }
        "isdigit" | "isnumeric" => {
            arity(args, method, 0, 0)?;
            Ok(Value::Bool(!text.is_empty() && text.chars().all(|ch| ch.is_numeric())))
        }
        "isalpha" => {
            arity(args, method, 0, 0)?;
            Ok(Value::Bool(!text.is_empty() && text.chars().all(char::is_alphabetic)))
        }
        "isalnum" => {
            arity(args, method, 0, 0)?;
            Ok(Value::Bool(!text.is_empty() && text.chars().all(char::is_alphanumeric)))
        }
        "isspace" => {
            arity(args, method, 0, 0)?;
            Ok(Value::Bool(!text.is_empty() && text.chars().all(char::is_whitespace)))
        }
        "isupper" | "islower" => {
            arity(args, method, 0, 0)?;
            let cased: Vec<char> = text.chars().filter(|ch| ch.is_alphabetic()).collect();
            let wanted: fn(char) -> bool = if method == "isupper" { char::is_uppercase } else { char::is_lowercase };
            Ok(Value::Bool(!cased.is_empty() && cased.iter().all(|ch| wanted(*ch))))
        }
        "zfill" => {
            arity(args, method, 1, 1)?;
            let width = args.positional[0]
                .as_int()
                .ok_or_else(|| RunError::type_error("zfill() width must be an integer"))?;
            let width = usize::try_from(width).unwrap_or(0);
            limits.check(width)?;
            let (sign, digits) = match text.chars().next() {
                Some(sign @ ('+' | '-')) => (sign.to_string(), &text[1..]),
                _ => (String::new(), text),
            };
            let padding = width.saturating_sub(text.chars().count());
            owned(format!("{sign}{}{digits}", "0".repeat(padding)))
        }
        "center" | "ljust" | "rjust" => {
            let (padding, fill) = padded(text, args, method)?;
            limits.check(text.len() + padding)?;
            let pad = |count: usize| fill.to_string().repeat(count);
            owned(match method {
                "ljust" => format!("{text}{}", pad(padding)),
                "rjust" => format!("{}{text}", pad(padding)),
                _ => format!("{}{text}{}", pad(padding / 2), pad(padding - padding / 2)),
            })
        }
        "format" => {
            let formatted = format_template(text, args)?;
            limits.check(formatted.len())?;
            owned(formatted)
        }
        _ => Err(no_attribute(&Value::Str(String::new()), method)),
    }
}

/// `str.format` with positional, numbered and keyword fields.
fn format_template(template: &str, args: &CallArgs) -> Result<String, RunError> {
    let chars: Vec<char> = template.chars().collect();
    let mut out = String::with_capacity(template.len());
    let mut next_auto = 0usize;
    let mut index = 0;

    while index < chars.len() {
        match chars[index] {
            '{' if chars.get(index + 1) == Some(&'{') => {
                out.push('{');
                index += 2;
            }
            '}' if chars.get(index + 1) == Some(&'}') => {
                out.push('}');
                index += 2;
            }
            '}' => return Err(RunError::value_error("Single '}' encountered in format string")),
            '{' => {
                let close = chars[index + 1..]
                    .iter()
                    .position(|ch| *ch == '}')
                    .map(|offset| index + 1 + offset)
                    .ok_or_else(|| RunError::value_error("Single '{' encountered in format string"))?;
                let field: String = chars[index + 1..close].iter().collect();
                let (reference, spec) = field.split_once(':').unwrap_or((field.as_str(), ""));
                let (reference, conversion) = match reference.split_once('!') {
                    Some((reference, conversion)) => (reference, Some(conversion)),
                    None => (reference, None),
                };

                let value = if reference.is_empty() {
                    let position = next_auto;
                    next_auto += 1;
                    positional_field(args, position)?
                } else if let Ok(position) = reference.parse::<usize>() {
                    positional_field(args, position)?
                } else {
                    args.keywords
                        .iter()
                        .find(|(key, _)| key == reference)
                        .map(|(_, value)| value.clone())
                        .ok_or_else(|| RunError::index_error(format!("'{reference}'")))?
                };
                let value = match conversion {
                    Some("r") => Value::Str(value.repr()),
                    Some("s") | None => value,
                    Some(other) => {
                        return Err(RunError::value_error(format!(
                            "Unknown conversion specifier {other}"
                        )));
                    }
                };
                out.push_str(&format_value(&value, spec)?);
                index = close + 1;
            }
            ch => {
                out.push(ch);
                index += 1;
            }
        }
    }
    Ok(out)
}

fn positional_field(args: &CallArgs, position: usize) -> Result<Value, RunError> {
    args.positional.get(position).cloned().ok_or_else(|| {
        RunError::index_error(format!(
            "Replacement index {position} out of range for positional args tuple"
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::{call_list_method_mut, call_method};
    use crate::sandbox::builtins::{CallArgs, Limits};
    use crate::sandbox::value::Value;

    const LIMITS: Limits = Limits { max_collection_len: 100 };

    fn args(positional: Vec<Value>) -> CallArgs {
        CallArgs { positional, keywords: Vec::new() }
    }

    fn text(value: &str) -> Value {
        Value::Str(value.to_string())
    }

    #[test]
    fn string_methods_cover_everyday_text_handling() {
        let split = call_method(&text(" a  b c "), "split", &args(vec![]), &LIMITS).expect("split");
        assert_eq!(split.to_string(), "['a', 'b', 'c']");

        let joined = call_method(&text("-"), "join", &args(vec![split]), &LIMITS).expect("join");
        assert_eq!(joined, text("a-b-c"));

        let formatted = call_method(
            &text("{} has {:.1f}% of {name}"),
            "format",
            &CallArgs {
                positional: vec![text("EU"), Value::Float(12.345)],
                keywords: vec![("name".to_string(), text("sales"))],
            },
            &LIMITS,
        )
        .expect("format");
        assert_eq!(formatted, text("EU has 12.3% of sales"));

        assert_eq!(
            call_method(&text("hello world"), "title", &args(vec![]), &LIMITS).expect("title"),
            text("Hello World")
        );
    }

    #[test]
    fn join_rejects_non_string_items() {
        let error = call_method(
            &text(","),
            "join",
            &args(vec![Value::List(vec![Value::Int(1)])]),
            &LIMITS,
        )
        .expect_err("join of ints");
        assert!(error.message.contains("expected str instance, int found"));
    }

    #[test]
    fn list_mutation_respects_limits() {
        let mut items = vec![Value::Int(3), Value::Int(1)];
        call_list_method_mut(&mut items, "append", &args(vec![Value::Int(2)]), &LIMITS)
            .expect("append");
        call_list_method_mut(&mut items, "sort", &args(vec![]), &LIMITS).expect("sort");
        assert_eq!(Value::List(items.clone()).to_string(), "[1, 2, 3]");

        let popped =
            call_list_method_mut(&mut items, "pop", &args(vec![Value::Int(0)]), &LIMITS)
                .expect("pop");
        assert_eq!(popped, Value::Int(1));

        let tight = Limits { max_collection_len: 2 };
        let error = call_list_method_mut(&mut items, "append", &args(vec![Value::Int(9)]), &tight)
            .expect_err("limit");
        assert!(error.message.contains("exceeds the limit"));
    }

    #[test]
    fn unknown_attributes_are_reported() {
        let error = call_method(&Value::Int(1), "__class__", &args(vec![]), &LIMITS)
            .expect_err("no attributes on int");
        assert_eq!(error.message, "'int' object has no attribute '__class__'");
    }
}
