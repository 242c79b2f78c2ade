use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use super::builtins::{
    contains, float_modulo, float_pow, floor_div, format_value, int_pow, modulo, Allowlist,
    CallArgs, Limits,
};
use super::methods::{call_list_method_mut, call_method, is_mutating_list_method, no_attribute};
use super::parser::{BinOp, CmpOp, Expr, FStringPart, Stmt, Subscript, Target, UnaryOp};
use super::value::{partial_order, values_equal, Number, RunError, Value};

enum Flow {
    Next,
    Break,
    Continue,
}

/// Tree-walking evaluator over a parsed program.
///
/// Every statement and loop iteration checks the deadline and the cancel flag,
/// so abandoned runs stop on their own.
pub(crate) struct Interpreter<'a> {
    allowlist: &'a Allowlist,
    limits: Limits,
    deadline: Instant,
    cancel: &'a AtomicBool,
    namespace: HashMap<String, Value>,
}

impl<'a> Interpreter<'a> {
    pub(crate) fn new(
        allowlist: &'a Allowlist,
        limits: Limits,
        deadline: Instant,
        cancel: &'a AtomicBool,
    ) -> Self {
        Self { allowlist, limits, deadline, cancel, namespace: HashMap::new() }
    }

    /// Runs the program and returns the final global namespace.
    pub(crate) fn run(mut self, program: &[Stmt]) -> Result<HashMap<String, Value>, RunError> {
        self.block(program)?;
        Ok(self.namespace)
    }

    fn tick(&self) -> Result<(), RunError> {
        if self.cancel.load(Ordering::Relaxed) || Instant::now() >= self.deadline {
            return Err(RunError::timeout());
        }
        Ok(())
    }

    fn block(&mut self, body: &[Stmt]) -> Result<Flow, RunError> {
        for stmt in body {
            self.tick()?;
            match self.statement(stmt)? {
                Flow::Next => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Next)
    }

    fn statement(&mut self, stmt: &Stmt) -> Result<Flow, RunError> {
        match stmt {
            Stmt::Expr(expr) => {
                self.eval(expr)?;
            }
            Stmt::Assign { targets, value } => {
                let value = self.eval(value)?;
                for target in targets {
                    self.assign(target, value.clone())?;
                }
            }
            Stmt::AugAssign { target, op, value } => {
                let current = match target {
                    Target::Name(name) => self.lookup(name)?,
                    Target::Subscript(container, index) => {
                        let container = self.eval(container)?;
                        let index = self.eval(index)?;
                        item(&container, &index)?
                    }
                    Target::Tuple(_) => {
                        return Err(RunError::type_error(
                            "illegal expression for augmented assignment",
                        ));
                    }
                };
                let operand = self.eval(value)?;
                let updated = self.binary(*op, current, operand)?;
                self.assign(target, updated)?;
            }
            Stmt::If { branches, otherwise } => {
                for (condition, body) in branches {
                    if self.eval(condition)?.truthy() {
                        return self.block(body);
                    }
                }
                return self.block(otherwise);
            }
            Stmt::While { condition, body } => {
                while self.eval(condition)?.truthy() {
                    self.tick()?;
                    if let Flow::Break = self.block(body)? {
                        break;
                    }
                }
            }
            Stmt::For { target, iter, body } => {
                for value in self.eval(iter)?.items()? {
                    self.tick()?;
                    self.assign(target, value)?;
                    if let Flow::Break = self.block(body)? {
                        break;
                    }
                }
            }
            Stmt::Break => return Ok(Flow::Break),
            Stmt::Continue => return Ok(Flow::Continue),
            Stmt::Pass => {}
            Stmt::Import(module) => return Err(RunError::forbidden_import(module)),
        }
        Ok(Flow::Next)
    }

    fn lookup(&self, name: &str) -> Result<Value, RunError> {
        match self.namespace.get(name) {
            Some(value) => Ok(value.clone()),
            None if self.allowlist.contains(name) => Err(RunError::type_error(format!(
                "builtin '{name}' can only be called"
            ))),
            None => Err(RunError::undefined_name(name)),
        }
    }

    fn assign(&mut self, target: &Target, value: Value) -> Result<(), RunError> {
        match target {
            Target::Name(name) => {
                self.namespace.insert(name.clone(), value);
                Ok(())
            }
            Target::Tuple(targets) => {
                let items = value.items()?;
                if items.len() > targets.len() {
                    return Err(RunError::value_error(format!(
                        "too many values to unpack (expected {})",
                        targets.len()
                    )));
                }
                if items.len() < targets.len() {
                    return Err(RunError::value_error(format!(
                        "not enough values to unpack (expected {}, got {})",
                        targets.len(),
                        items.len()
                    )));
                }
                for (target, item) in targets.iter().zip(items) {
                    self.assign(target, item)?;
                }
                Ok(())
            }
            Target::Subscript(container, index) => self.assign_item(container, index, value),
        }
    }

    /// Writes through a chain of subscripts rooted at a name, e.g. `grid[1][2] = v`.
    fn assign_item(&mut self, container: &Expr, index: &Expr, value: Value) -> Result<(), RunError> {
        let mut path = vec![self.eval(index)?];
        let mut cursor = container;
        let root = loop {
            match cursor {
                Expr::Name(name) => break name,
                Expr::Subscript(inner, subscript) => match &**subscript {
                    Subscript::Index(index) => {
                        path.push(self.eval(index)?);
                        cursor = &**inner;
                    }
                    Subscript::Slice(..) => {
                        return Err(RunError::type_error("slice assignment is not supported"));
                    }
                },
                _ => return Err(RunError::type_error("cannot assign to this expression")),
            }
        };
        path.reverse();

        let mut slot = self
            .namespace
            .get_mut(root.as_str())
            .ok_or_else(|| RunError::undefined_name(root))?;
        for index in &path {
            slot = item_mut(slot, index)?;
        }
        *slot = value;
        if let Some(updated) = self.namespace.get(root.as_str()) {
            self.limits.check(self.limits.size(updated))?;
        }
        Ok(())
    }

    fn eval(&mut self, expr: &Expr) -> Result<Value, RunError> {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Name(name) => self.lookup(name),
            Expr::List(items) => {
                let values = self.eval_all(items)?;
                self.limits.checked(Value::List(values))
            }
            Expr::Tuple(items) => {
                let values = self.eval_all(items)?;
                self.limits.checked(Value::Tuple(values))
            }
            Expr::FString(parts) => {
                let mut out = String::new();
                for part in parts {
                    match part {
                        FStringPart::Literal(text) => out.push_str(text),
                        FStringPart::Field { expr, conversion, spec } => {
                            let value = self.eval(expr)?;
                            let value = match conversion {
                                Some('r') => Value::Str(value.repr()),
                                _ => value,
                            };
                            out.push_str(&format_value(&value, spec)?);
                        }
                    }
                    self.limits.check(out.len())?;
                }
                Ok(Value::Str(out))
            }
            Expr::Unary(op, operand) => {
                let value = self.eval(operand)?;
                unary(*op, value)
            }
            Expr::Binary(left, op, right) => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                self.binary(*op, left, right)
            }
            Expr::Compare(first, rest) => {
                let mut left = self.eval(first)?;
                for (op, right) in rest {
                    let right = self.eval(right)?;
                    if !compare(*op, &left, &right)? {
                        return Ok(Value::Bool(false));
                    }
                    left = right;
                }
                Ok(Value::Bool(true))
            }
            Expr::And(left, right) => {
                let value = self.eval(left)?;
                if value.truthy() {
                    self.eval(right)
                } else {
                    Ok(value)
                }
            }
            Expr::Or(left, right) => {
                let value = self.eval(left)?;
                if value.truthy() {
                    Ok(value)
                } else {
                    self.eval(right)
                }
            }
            Expr::IfElse { condition, then, otherwise } => {
                if self.eval(condition)?.truthy() {
                    self.eval(then)
                } else {
                    self.eval(otherwise)
                }
            }
            Expr::Call { func, args, keywords } => self.call(func, args, keywords),
            Expr::Attribute(receiver, name) => {
                let receiver = self.eval(receiver)?;
                Err(no_attribute(&receiver, name))
            }
            Expr::Subscript(container, subscript) => {
                let container = self.eval(container)?;
                match &**subscript {
                    Subscript::Index(index) => {
                        let index = self.eval(index)?;
                        item(&container, &index)
                    }
                    Subscript::Slice(start, stop, step) => {
                        let start = self.slice_bound(start.as_ref())?;
                        let stop = self.slice_bound(stop.as_ref())?;
                        let step = self.slice_bound(step.as_ref())?;
                        slice(&container, start, stop, step)
                    }
                }
            }
            Expr::Comprehension { element, target, iter, conditions } => {
                let items = self.eval(iter)?.items()?;
                let shadowed = bound_names(target)
                    .into_iter()
                    .map(|name| {
                        let previous = self.namespace.get(&name).cloned();
                        (name, previous)
                    })
                    .collect::<Vec<_>>();

                let result = self.comprehension(element, target, items, conditions);

                // Loop variables stay local to the comprehension.
                for (name, previous) in shadowed {
                    match previous {
                        Some(value) => self.namespace.insert(name, value),
                        None => self.namespace.remove(&name),
                    };
                }
                result
            }
        }
    }

    fn eval_all(&mut self, exprs: &[Expr]) -> Result<Vec<Value>, RunError> {
        exprs.iter().map(|expr| self.eval(expr)).collect()
    }

    fn comprehension(
        &mut self,
        element: &Expr,
        target: &Target,
        items: Vec<Value>,
        conditions: &[Expr],
    ) -> Result<Value, RunError> {
        let mut out = Vec::new();
        let mut size = 0usize;
        'items: for value in items {
            self.tick()?;
            self.assign(target, value)?;
            for condition in conditions {
                if !self.eval(condition)?.truthy() {
                    continue 'items;
                }
            }
            let value = self.eval(element)?;
            size = size.saturating_add(1 + self.limits.size(&value));
            self.limits.check(size)?;
            out.push(value);
        }
        Ok(Value::List(out))
    }

    fn slice_bound(&mut self, bound: Option<&Expr>) -> Result<Option<i64>, RunError> {
        let Some(expr) = bound else { return Ok(None) };
        match self.eval(expr)? {
            Value::None => Ok(None),
            value => value.as_int().map(Some).ok_or_else(|| {
                RunError::type_error("slice indices must be integers or None")
            }),
        }
    }

    fn call(
        &mut self,
        func: &Expr,
        args: &[Expr],
        keywords: &[(String, Expr)],
    ) -> Result<Value, RunError> {
        match func {
            Expr::Name(name) => {
                if let Some(value) = self.namespace.get(name) {
                    return Err(RunError::type_error(format!(
                        "'{}' object is not callable",
                        value.type_name()
                    )));
                }
                let builtin = self.allowlist.get(name).ok_or_else(|| RunError::undefined_name(name))?;
                let call_args = self.call_args(args, keywords)?;
                let result = builtin(&call_args, &self.limits)?;
                self.limits.checked(result)
            }
            Expr::Attribute(receiver, method) => {
                let call_args = self.call_args(args, keywords)?;
                if let Expr::Name(name) = &**receiver {
                    if is_mutating_list_method(method) {
                        if let Some(Value::List(items)) = self.namespace.get_mut(name.as_str()) {
                            return call_list_method_mut(items, method, &call_args, &self.limits);
                        }
                    }
                }
                let receiver = self.eval(receiver)?;
                let result = call_method(&receiver, method, &call_args, &self.limits)?;
                self.limits.checked(result)
            }
            other => {
                let value = self.eval(other)?;
                Err(RunError::type_error(format!("'{}' object is not callable", value.type_name())))
            }
        }
    }

    fn call_args(
        &mut self,
        args: &[Expr],
        keywords: &[(String, Expr)],
    ) -> Result<CallArgs, RunError> {
        let positional = self.eval_all(args)?;
        let keywords = keywords
            .iter()
            .map(|(name, expr)| self.eval(expr).map(|value| (name.clone(), value)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(CallArgs { positional, keywords })
    }

    fn binary(&self, op: BinOp, left: Value, right: Value) -> Result<Value, RunError> {
        let result = match (op, &left, &right) {
            (BinOp::Add, Value::Str(a), Value::Str(b)) => {
                self.limits.check(a.len() + b.len())?;
                Value::Str(format!("{a}{b}"))
            }
            (BinOp::Add, Value::List(a), Value::List(b)) => {
                self.limits.check(self.limits.size_of_items(a) + self.limits.size_of_items(b))?;
                Value::List(a.iter().chain(b).cloned().collect())
            }
            (BinOp::Add, Value::Tuple(a), Value::Tuple(b)) => {
                self.limits.check(self.limits.size_of_items(a) + self.limits.size_of_items(b))?;
                Value::Tuple(a.iter().chain(b).cloned().collect())
            }
            (BinOp::Mul, Value::Str(_) | Value::List(_) | Value::Tuple(_), count)
                if count.as_int().is_some() =>
            {
                self.repeat(&left, count)?
            }
            (BinOp::Mul, count, Value::Str(_) | Value::List(_) | Value::Tuple(_))
                if count.as_int().is_some() =>
            {
                self.repeat(&right, count)?
            }
            _ => arithmetic(op, &left, &right)?,
        };
        self.limits.checked(result)
    }

    fn repeat(&self, sequence: &Value, count: &Value) -> Result<Value, RunError> {
        let times = usize::try_from(count.as_int().unwrap_or(0)).unwrap_or(0);
        self.limits.check(self.limits.size(sequence).saturating_mul(times))?;
        Ok(match sequence {
            Value::Str(text) => Value::Str(text.repeat(times)),
            Value::List(items) => Value::List(repeat_items(items, times)),
            Value::Tuple(items) => Value::Tuple(repeat_items(items, times)),
            other => other.clone(),
        })
    }
}

fn repeat_items(items: &[Value], times: usize) -> Vec<Value> {
    let mut out = Vec::with_capacity(items.len() * times);
    for _ in 0..times {
        out.extend_from_slice(items);
    }
    out
}

fn bound_names(target: &Target) -> Vec<String> {
    match target {
        Target::Name(name) => vec![name.clone()],
        Target::Tuple(targets) => targets.iter().flat_map(bound_names).collect(),
        Target::Subscript(..) => Vec::new(),
    }
}

fn arithmetic(op: BinOp, left: &Value, right: &Value) -> Result<Value, RunError> {
    let (Some(a), Some(b)) = (left.as_number(), right.as_number()) else {
        return Err(RunError::type_error(format!(
            "unsupported operand type(s) for {}: '{}' and '{}'",
            op.symbol(),
            left.type_name(),
            right.type_name()
        )));
    };

    match (a, b) {
        (Number::Int(a), Number::Int(b)) => match op {
            BinOp::Add => a.checked_add(b).map(Value::Int).ok_or_else(RunError::overflow),
            BinOp::Sub => a.checked_sub(b).map(Value::Int).ok_or_else(RunError::overflow),
            BinOp::Mul => a.checked_mul(b).map(Value::Int).ok_or_else(RunError::overflow),
            BinOp::Div if b == 0 => Err(RunError::zero_division("division by zero")),
            BinOp::Div => Ok(Value::Float(a as f64 / b as f64)),
            BinOp::FloorDiv => floor_div(a, b).map(Value::Int),
            BinOp::Mod => modulo(a, b).map(Value::Int),
            BinOp::Pow => int_pow(a, b),
        },
        (a, b) => {
            let (a, b) = (a.to_f64(), b.to_f64());
            match op {
                BinOp::Add => Ok(Value::Float(a + b)),
                BinOp::Sub => Ok(Value::Float(a - b)),
                BinOp::Mul => Ok(Value::Float(a * b)),
                BinOp::Div if b == 0.0 => Err(RunError::zero_division("float division by zero")),
                BinOp::Div => Ok(Value::Float(a / b)),
                BinOp::FloorDiv if b == 0.0 => {
                    Err(RunError::zero_division("float floor division by zero"))
                }
                BinOp::FloorDiv => Ok(Value::Float((a / b).floor())),
                BinOp::Mod => float_modulo(a, b).map(Value::Float),
                BinOp::Pow => float_pow(a, b),
            }
        }
    }
}

fn unary(op: UnaryOp, value: Value) -> Result<Value, RunError> {
    if op == UnaryOp::Not {
        return Ok(Value::Bool(!value.truthy()));
    }
    let symbol = if op == UnaryOp::Neg { "-" } else { "+" };
    match (op, value.as_number()) {
        (UnaryOp::Neg, Some(Number::Int(number))) => {
            number.checked_neg().map(Value::Int).ok_or_else(RunError::overflow)
        }
        (UnaryOp::Neg, Some(Number::Float(number))) => Ok(Value::Float(-number)),
        (_, Some(Number::Int(number))) => Ok(Value::Int(number)),
        (_, Some(Number::Float(number))) => Ok(Value::Float(number)),
        (_, None) => Err(RunError::type_error(format!(
            "bad operand type for unary {symbol}: '{}'",
            value.type_name()
        ))),
    }
}

fn compare(op: CmpOp, left: &Value, right: &Value) -> Result<bool, RunError> {
    use std::cmp::Ordering::{Equal, Greater, Less};

    Ok(match op {
        CmpOp::Eq => values_equal(left, right),
        CmpOp::NotEq => !values_equal(left, right),
        CmpOp::Lt => partial_order(left, right, "<")? == Some(Less),
        CmpOp::LtE => matches!(partial_order(left, right, "<=")?, Some(Less | Equal)),
        CmpOp::Gt => partial_order(left, right, ">")? == Some(Greater),
        CmpOp::GtE => matches!(partial_order(left, right, ">=")?, Some(Greater | Equal)),
        CmpOp::In => contains(right, left)?,
        CmpOp::NotIn => !contains(right, left)?,
        CmpOp::Is => identical(left, right),
        CmpOp::IsNot => !identical(left, right),
    })
}

/// Values carry no identity, so `is` compares singletons and same-typed equal values.
fn identical(left: &Value, right: &Value) -> bool {
    left.type_name() == right.type_name() && values_equal(left, right)
}

fn position(index: &Value, length: usize, kind: &str) -> Result<usize, RunError> {
    let raw = index.as_int().ok_or_else(|| {
        RunError::type_error(format!("{kind} indices must be integers, not {}", index.type_name()))
    })?;
    let length = i64::try_from(length).map_err(|_| RunError::overflow())?;
    let resolved = if raw < 0 { raw + length } else { raw };
    if !(0..length).contains(&resolved) {
        return Err(RunError::index_error(format!("{kind} index out of range")));
    }
    Ok(resolved as usize)
}

fn item(container: &Value, index: &Value) -> Result<Value, RunError> {
    match container {
        Value::Str(text) => {
            let chars: Vec<char> = text.chars().collect();
            let at = position(index, chars.len(), "string")?;
            Ok(Value::Str(chars[at].to_string()))
        }
        Value::List(items) => Ok(items[position(index, items.len(), "list")?].clone()),
        Value::Tuple(items) => Ok(items[position(index, items.len(), "tuple")?].clone()),
        other => Err(RunError::type_error(format!(
            "'{}' object is not subscriptable",
            other.type_name()
        ))),
    }
}

fn item_mut<'v>(container: &'v mut Value, index: &Value) -> Result<&'v mut Value, RunError> {
    match container {
        Value::List(items) => {
            let at = position(index, items.len(), "list assignment")?;
            Ok(&mut items[at])
        }
        other => Err(RunError::type_error(format!(
            "'{}' object does not support item assignment",
            other.type_name()
        ))),
    }
}

/// Positions selected by `[start:stop:step]`, following Python's clamping rules.
fn slice_positions(
    length: usize,
    start: Option<i64>,
    stop: Option<i64>,
    step: Option<i64>,
) -> Result<Vec<usize>, RunError> {
    let step = step.unwrap_or(1);
    if step == 0 {
        return Err(RunError::value_error("slice step cannot be zero"));
    }
    let length = i64::try_from(length).map_err(|_| RunError::overflow())?;
    let mut positions = Vec::new();

    if step > 0 {
        let clamp = |bound: i64| if bound < 0 { (bound + length).max(0) } else { bound.min(length) };
        let mut current = start.map(clamp).unwrap_or(0);
        let end = stop.map(clamp).unwrap_or(length);
        while current < end {
            positions.push(current as usize);
            let Some(next) = current.checked_add(step) else { break };
            current = next;
        }
    } else {
        let clamp =
            |bound: i64| if bound < 0 { (bound + length).max(-1) } else { bound.min(length - 1) };
        let mut current = start.map(clamp).unwrap_or(length - 1);
        let end = stop.map(clamp).unwrap_or(-1);
        while current > end {
            positions.push(current as usize);
            let Some(next) = current.checked_add(step) else { break };
            current = next;
        }
    }
    Ok(positions)
}

fn slice(
    container: &Value,
    start: Option<i64>,
    stop: Option<i64>,
    step: Option<i64>,
) -> Result<Value, RunError> {
    match container {
        Value::Str(text) => {
            let chars: Vec<char> = text.chars().collect();
            let positions = slice_positions(chars.len(), start, stop, step)?;
            Ok(Value::Str(positions.into_iter().map(|at| chars[at]).collect()))
        }
        Value::List(items) => {
            let positions = slice_positions(items.len(), start, stop, step)?;
            Ok(Value::List(positions.into_iter().map(|at| items[at].clone()).collect()))
        }
        Value::Tuple(items) => {
            let positions = slice_positions(items.len(), start, stop, step)?;
            Ok(Value::Tuple(positions.into_iter().map(|at| items[at].clone()).collect()))
        }
        other => Err(RunError::type_error(format!(
            "'{}' object is not subscriptable",
            other.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::AtomicBool;
    use std::time::{Duration, Instant};

    use super::Interpreter;
    use crate::sandbox::builtins::{Allowlist, Limits};
    use crate::sandbox::parser::parse;
    use crate::sandbox::value::{ErrorKind, RunError, Value};

    fn run(source: &str) -> Result<HashMap<String, Value>, RunError> {
        let allowlist = Allowlist::standard();
        let cancel = AtomicBool::new(false);
        let program = parse(source)?;
        Interpreter::new(
            &allowlist,
            Limits { max_collection_len: 10_000 },
            Instant::now() + Duration::from_secs(5),
            &cancel,
        )
        .run(&program)
    }

    fn result_of(source: &str) -> String {
        let namespace = run(source).expect("program runs");
        namespace.get("result").expect("result bound").to_string()
    }

    #[test]
    fn arithmetic_follows_python_rules() {
        assert_eq!(result_of("result = 7 // -2, 7 % -2, -7 / 2, 2 ** -1"), "(-4, -1, -3.5, 0.5)");
        assert_eq!(result_of("result = 1 < 2 <= 2 != 3"), "True");
        assert_eq!(result_of("result = 'ab' * 3 + str(0.1 + 0.2)"), "ababab0.30000000000000004");
    }

    #[test]
    fn loops_comprehensions_and_fstrings() {
        let source = "\
prices = [19.99, 5.25, 100]
total = 0
for i, price in enumerate(prices):
    if i == 1:
        continue
    total += price
evens = [n * n for n in range(10) if n % 2 == 0]
result = f\"{total:,.2f} {evens[-1]} {len(evens)}\"
";
        assert_eq!(result_of(source), "119.99 64 5");
    }

    #[test]
    fn comprehension_variables_do_not_leak() {
        let namespace = run("x = 'outer'\nsquares = [x * x for x in range(3)]").expect("runs");
        assert_eq!(namespace.get("x"), Some(&Value::Str("outer".to_string())));
        assert!(!run("squares = [y for y in range(3)]").expect("runs").contains_key("y"));
    }

    #[test]
    fn nested_item_assignment_and_list_methods() {
        let source = "\
grid = [[0, 0], [0, 0]]
grid[1][0] = 5
grid[0][1] += 2
grid.append([9])
last = grid.pop()
result = str(grid) + ' ' + str(last)
";
        assert_eq!(result_of(source), "[[0, 2], [5, 0]] [9]");
    }

    #[test]
    fn slices_and_while_loops() {
        let source = "\
word = 'sandboxed'
n = 0
while True:
    n += 1
    if n >= 3:
        break
result = word[::-1] + '|' + word[1:4] + '|' + str(n)
";
        assert_eq!(result_of(source), "dexobdnas|and|3");
    }

    #[test]
    fn huge_slice_steps_stop_after_the_first_position() {
        assert_eq!(result_of("result = 'abcdefgh'[1::9223372036854775807]"), "b");
        assert_eq!(result_of("result = [1, 2, 3][1::9223372036854775807]"), "[2]");
        assert_eq!(result_of("result = 'abcdefgh'[-2::-9223372036854775807]"), "g");
    }

    #[test]
    fn nested_values_are_measured_in_full() {
        let doubling = "a = [0] * 1000\nfor i in range(10):\n    a = [a, a]";
        assert_eq!(run(doubling).expect_err("doubling").kind, ErrorKind::Limit);

        let repeated = "row = [0] * 1000\ngrid = [row] * 20";
        assert_eq!(run(repeated).expect_err("repeat").kind, ErrorKind::Limit);

        let comprehension = "row = [0] * 1000\ngrid = [row for i in range(20)]";
        assert_eq!(run(comprehension).expect_err("comprehension").kind, ErrorKind::Limit);

        let self_reference = "g = [0] * 1000\nfor i in range(10):\n    g[0] = g";
        assert_eq!(run(self_reference).expect_err("item assignment").kind, ErrorKind::Limit);

        assert_eq!(result_of("row = [0] * 100\ngrid = [row] * 20\nresult = len(grid)"), "20");
    }

    #[test]
    fn errors_carry_python_kinds() {
        let undefined = run("result = missing + 1").expect_err("undefined name");
        assert_eq!(undefined.kind, ErrorKind::Name);
        assert_eq!(undefined.message, "name 'missing' is not defined");

        let blocked = run("import os").expect_err("import");
        assert_eq!(blocked.kind, ErrorKind::Name);

        let zero = run("result = 1 / 0").expect_err("zero division");
        assert_eq!(zero.kind, ErrorKind::ZeroDivision);

        let overflow = run("result = 2 ** 64").expect_err("overflow");
        assert_eq!(overflow.kind, ErrorKind::Overflow);

        let hidden = run("result = open('x')").expect_err("open is not allowlisted");
        assert_eq!(hidden.message, "name 'open' is not defined");
    }

    #[test]
    fn cancelled_runs_stop_at_the_next_statement() {
        let allowlist = Allowlist::standard();
        let cancel = AtomicBool::new(true);
        let program = parse("x = 1").expect("parse");
        let error = Interpreter::new(
            &allowlist,
            Limits { max_collection_len: 10 },
            Instant::now() + Duration::from_secs(5),
            &cancel,
        )
        .run(&program)
        .expect_err("cancelled");
        assert_eq!(error.kind, ErrorKind::Timeout);
    }
}
