use super::lexer::{tokenize, Spanned, Token};
use super::value::{RunError, Value};

const MAX_NESTING: usize = 100;

const KEYWORDS: &[&str] = &[
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class",
    "continue", "def", "del", "elif", "else", "except", "finally", "for", "from", "global", "if",
    "import", "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return", "try",
    "while", "with", "yield",
];

const AUGMENTED: &[(&str, BinOp)] = &[
    ("+=", BinOp::Add),
    ("-=", BinOp::Sub),
    ("*=", BinOp::Mul),
    ("/=", BinOp::Div),
    ("//=", BinOp::FloorDiv),
    ("%=", BinOp::Mod),
    ("**=", BinOp::Pow),
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
}

impl BinOp {
    pub(crate) fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::FloorDiv => "//",
            Self::Mod => "%",
            Self::Pow => "**",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum UnaryOp {
    Neg,
    Pos,
    Not,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CmpOp {
    Eq,
    NotEq,
    Lt,
    LtE,
    Gt,
    GtE,
    In,
    NotIn,
    Is,
    IsNot,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Subscript {
    Index(Expr),
    Slice(Option<Expr>, Option<Expr>, Option<Expr>),
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum FStringPart {
    Literal(String),
    Field { expr: Expr, conversion: Option<char>, spec: String },
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Expr {
    Literal(Value),
    Name(String),
    List(Vec<Expr>),
    Tuple(Vec<Expr>),
    FString(Vec<FStringPart>),
    Unary(UnaryOp, Box<Expr>),
    Binary(Box<Expr>, BinOp, Box<Expr>),
    Compare(Box<Expr>, Vec<(CmpOp, Expr)>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    IfElse { condition: Box<Expr>, then: Box<Expr>, otherwise: Box<Expr> },
    Call { func: Box<Expr>, args: Vec<Expr>, keywords: Vec<(String, Expr)> },
    Attribute(Box<Expr>, String),
    Subscript(Box<Expr>, Box<Subscript>),
    Comprehension { element: Box<Expr>, target: Target, iter: Box<Expr>, conditions: Vec<Expr> },
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Target {
    Name(String),
    Tuple(Vec<Target>),
    Subscript(Box<Expr>, Box<Expr>),
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Stmt {
    Expr(Expr),
    Assign { targets: Vec<Target>, value: Expr },
    AugAssign { target: Target, op: BinOp, value: Expr },
    If { branches: Vec<(Expr, Vec<Stmt>)>, otherwise: Vec<Stmt> },
    While { condition: Expr, body: Vec<Stmt> },
    For { target: Target, iter: Expr, body: Vec<Stmt> },
    Break,
    Continue,
    Pass,
    Import(String),
}

pub(crate) fn parse(source: &str) -> Result<Vec<Stmt>, RunError> {
    let mut parser = Parser { tokens: tokenize(source)?, pos: 0, depth: 0, loops: 0 };
    parser.program()
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    depth: usize,
    loops: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        self.tokens.get(self.pos).map(|spanned| &spanned.token).unwrap_or(&Token::Eof)
    }

    fn peek_next(&self) -> &Token {
        self.tokens.get(self.pos + 1).map(|spanned| &spanned.token).unwrap_or(&Token::Eof)
    }

    fn line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|spanned| spanned.line)
            .unwrap_or(1)
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn error(&self, message: impl std::fmt::Display) -> RunError {
        RunError::syntax(message, self.line())
    }

    fn check_op(&self, op: &str) -> bool {
        matches!(self.peek(), Token::Op(current) if *current == op)
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if self.check_op(op) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_op(&mut self, op: &str) -> Result<(), RunError> {
        if self.eat_op(op) {
            Ok(())
        } else {
            Err(self.error(format!("expected `{op}`")))
        }
    }

    fn check_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Token::Name(name) if name == keyword)
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.check_keyword(keyword) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<(), RunError> {
        if self.eat_keyword(keyword) {
            Ok(())
        } else {
            Err(self.error(format!("expected `{keyword}`")))
        }
    }

    fn enter(&mut self) -> Result<(), RunError> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(self.error("expression is nested too deeply"));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    fn program(&mut self) -> Result<Vec<Stmt>, RunError> {
        let mut body = Vec::new();
        loop {
            match self.peek() {
                Token::Eof => return Ok(body),
                Token::Newline => {
                    self.advance();
                }
                _ => body.extend(self.statement()?),
            }
        }
    }

    fn statement(&mut self) -> Result<Vec<Stmt>, RunError> {
        match self.peek() {
            Token::Name(name) if name == "if" => Ok(vec![self.if_statement()?]),
            Token::Name(name) if name == "while" => {
                self.advance();
                let condition = self.expr()?;
                let body = self.loop_body()?;
                Ok(vec![Stmt::While { condition, body }])
            }
            Token::Name(name) if name == "for" => {
                self.advance();
                let target = self.target_list()?;
                self.expect_keyword("in")?;
                let iter = self.expr_list()?;
                let body = self.loop_body()?;
                Ok(vec![Stmt::For { target, iter, body }])
            }
            Token::Indent => Err(self.error("unexpected indent")),
            _ => self.simple_line(),
        }
    }

    fn if_statement(&mut self) -> Result<Stmt, RunError> {
        self.advance();
        let condition = self.expr()?;
        let mut branches = vec![(condition, self.block()?)];
        let mut otherwise = Vec::new();

        loop {
            if self.eat_keyword("elif") {
                let condition = self.expr()?;
                branches.push((condition, self.block()?));
            } else if self.eat_keyword("else") {
                otherwise = self.block()?;
                break;
            } else {
                break;
            }
        }

        Ok(Stmt::If { branches, otherwise })
    }

    fn block(&mut self) -> Result<Vec<Stmt>, RunError> {
        self.enter()?;
        let body = self.block_body();
        self.leave();
        body
    }

    fn loop_body(&mut self) -> Result<Vec<Stmt>, RunError> {
        self.loops += 1;
        let body = self.block();
        self.loops -= 1;
        body
    }

    fn block_body(&mut self) -> Result<Vec<Stmt>, RunError> {
        self.expect_op(":")?;
        if !matches!(self.peek(), Token::Newline) {
            return self.simple_line();
        }
        self.advance();
        if !matches!(self.peek(), Token::Indent) {
            return Err(self.error("expected an indented block"));
        }
        self.advance();

        let mut body = Vec::new();
        loop {
            match self.peek() {
                Token::Dedent => {
                    self.advance();
                    return Ok(body);
                }
                Token::Eof => return Ok(body),
                Token::Newline => {
                    self.advance();
                }
                _ => body.extend(self.statement()?),
            }
        }
    }

    fn simple_line(&mut self) -> Result<Vec<Stmt>, RunError> {
        let mut statements = vec![self.simple_statement()?];
        while self.eat_op(";") {
            if matches!(self.peek(), Token::Newline | Token::Eof) {
                break;
            }
            statements.push(self.simple_statement()?);
        }

        match self.peek() {
            Token::Newline => {
                self.advance();
                Ok(statements)
            }
            Token::Eof | Token::Dedent => Ok(statements),
            other => Err(self.error(format!("unexpected {}", describe(other)))),
        }
    }

    fn simple_statement(&mut self) -> Result<Stmt, RunError> {
        if let Token::Name(name) = self.peek() {
            match name.as_str() {
                "pass" => {
                    self.advance();
                    return Ok(Stmt::Pass);
                }
                "break" | "continue" if self.loops == 0 => {
                    return Err(self.error(format!("'{name}' outside loop")));
                }
                "break" => {
                    self.advance();
                    return Ok(Stmt::Break);
                }
                "continue" => {
                    self.advance();
                    return Ok(Stmt::Continue);
                }
                "import" | "from" => return self.import(),
                "elif" | "else" | "except" | "finally" | "in" | "as" => {
                    return Err(self.error(format!("unexpected `{name}`")));
                }
                "def" | "class" | "return" | "lambda" | "try" | "with" | "raise" | "global"
                | "nonlocal" | "del" | "assert" | "yield" | "async" | "await" => {
                    return Err(self.error(format!("`{name}` is not supported")));
                }
                _ => {}
            }
        }

        let first = self.expr_list()?;

        if let Token::Op(op) = self.peek() {
            if let Some((_, bin_op)) = AUGMENTED.iter().find(|(symbol, _)| symbol == op) {
                let op = *bin_op;
                self.advance();
                let target = self.to_target(first)?;
                if matches!(target, Target::Tuple(_)) {
                    return Err(self.error("illegal expression for augmented assignment"));
                }
                let value = self.expr_list()?;
                return Ok(Stmt::AugAssign { target, op, value });
            }
        }

        if !self.check_op("=") {
            return Ok(Stmt::Expr(first));
        }

        let mut targets = vec![self.to_target(first)?];
        loop {
            self.expect_op("=")?;
            let next = self.expr_list()?;
            if self.check_op("=") {
                targets.push(self.to_target(next)?);
            } else {
                return Ok(Stmt::Assign { targets, value: next });
            }
        }
    }

    fn import(&mut self) -> Result<Stmt, RunError> {
        self.advance();
        let module = self.dotted_name()?;
        while !matches!(self.peek(), Token::Newline | Token::Eof | Token::Op(";")) {
            self.advance();
        }
        Ok(Stmt::Import(module))
    }

    fn dotted_name(&mut self) -> Result<String, RunError> {
        let mut parts = Vec::new();
        loop {
            match self.advance() {
                Token::Name(name) => parts.push(name),
                other => return Err(self.error(format!("unexpected {}", describe(&other)))),
            }
            if !self.eat_op(".") {
                return Ok(parts.join("."));
            }
        }
    }

    fn to_target(&self, expr: Expr) -> Result<Target, RunError> {
        match expr {
            Expr::Name(name) => Ok(Target::Name(name)),
            Expr::Tuple(items) | Expr::List(items) => Ok(Target::Tuple(
                items.into_iter().map(|item| self.to_target(item)).collect::<Result<_, _>>()?,
            )),
            Expr::Subscript(value, subscript) => match *subscript {
                Subscript::Index(index) => Ok(Target::Subscript(value, Box::new(index))),
                Subscript::Slice(..) => Err(self.error("slice assignment is not supported")),
            },
            Expr::Literal(_) => Err(self.error("cannot assign to literal")),
            _ => Err(self.error("cannot assign to expression")),
        }
    }

    /// Assignment targets of `for` loops and comprehensions, parsed without consuming `in`.
    fn target_list(&mut self) -> Result<Target, RunError> {
        let first = self.postfix()?;
        if !self.check_op(",") {
            return self.to_target(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.check_keyword("in") {
                break;
            }
            items.push(self.postfix()?);
        }
        self.to_target(Expr::Tuple(items))
    }

    fn at_expr_end(&self) -> bool {
        match self.peek() {
            Token::Newline | Token::Eof | Token::Dedent | Token::Indent => true,
            Token::Op(op) => {
                matches!(*op, "=" | ")" | "]" | "}" | ":" | ";")
                    || AUGMENTED.iter().any(|(symbol, _)| symbol == op)
            }
            _ => false,
        }
    }

    fn expr_list(&mut self) -> Result<Expr, RunError> {
        let first = self.expr()?;
        if !self.check_op(",") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.at_expr_end() {
                break;
            }
            items.push(self.expr()?);
        }
        Ok(Expr::Tuple(items))
    }

    fn expr(&mut self) -> Result<Expr, RunError> {
        self.enter()?;
        let result = self.conditional();
        self.leave();
        result
    }

    fn conditional(&mut self) -> Result<Expr, RunError> {
        let then = self.or_expr()?;
        if !self.eat_keyword("if") {
            return Ok(then);
        }
        let condition = self.or_expr()?;
        self.expect_keyword("else")?;
        let otherwise = self.expr()?;
        Ok(Expr::IfElse {
            condition: Box::new(condition),
            then: Box::new(then),
            otherwise: Box::new(otherwise),
        })
    }

    fn or_expr(&mut self) -> Result<Expr, RunError> {
        let mut left = self.and_expr()?;
        let mut chained = 0;
        while self.eat_keyword("or") {
            self.enter()?;
            chained += 1;
            let right = self.and_expr()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        self.depth -= chained;
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr, RunError> {
        let mut left = self.not_expr()?;
        let mut chained = 0;
        while self.eat_keyword("and") {
            self.enter()?;
            chained += 1;
            let right = self.not_expr()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        self.depth -= chained;
        Ok(left)
    }

    fn not_expr(&mut self) -> Result<Expr, RunError> {
        if self.eat_keyword("not") {
            self.enter()?;
            let operand = self.not_expr();
            self.leave();
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(operand?)));
        }
        self.comparison()
    }

    fn comparison_op(&mut self) -> Option<CmpOp> {
        let op = match self.peek() {
            Token::Op("==") => CmpOp::Eq,
            Token::Op("!=") => CmpOp::NotEq,
            Token::Op("<") => CmpOp::Lt,
            Token::Op("<=") => CmpOp::LtE,
            Token::Op(">") => CmpOp::Gt,
            Token::Op(">=") => CmpOp::GtE,
            Token::Name(name) if name == "in" => CmpOp::In,
            Token::Name(name) if name == "is" => {
                if matches!(self.peek_next(), Token::Name(next) if next == "not") {
                    self.pos += 2;
                    return Some(CmpOp::IsNot);
                }
                CmpOp::Is
            }
            Token::Name(name)
                if name == "not" && matches!(self.peek_next(), Token::Name(next) if next == "in") =>
            {
                self.pos += 2;
                return Some(CmpOp::NotIn);
            }
            _ => return None,
        };
        self.pos += 1;
        Some(op)
    }

    fn comparison(&mut self) -> Result<Expr, RunError> {
        let left = self.arith()?;
        let mut rest = Vec::new();
        while let Some(op) = self.comparison_op() {
            rest.push((op, self.arith()?));
        }
        if rest.is_empty() {
            Ok(left)
        } else {
            Ok(Expr::Compare(Box::new(left), rest))
        }
    }

    // Operator chains build left-deep trees, so each link counts towards the nesting limit.
    fn arith(&mut self) -> Result<Expr, RunError> {
        let mut left = self.term()?;
        let mut chained = 0;
        loop {
            let op = match self.peek() {
                Token::Op("+") => BinOp::Add,
                Token::Op("-") => BinOp::Sub,
                _ => break,
            };
            self.advance();
            self.enter()?;
            chained += 1;
            let right = self.term()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        self.depth -= chained;
        Ok(left)
    }

    fn term(&mut self) -> Result<Expr, RunError> {
        let mut left = self.factor()?;
        let mut chained = 0;
        loop {
            let op = match self.peek() {
                Token::Op("*") => BinOp::Mul,
                Token::Op("/") => BinOp::Div,
                Token::Op("//") => BinOp::FloorDiv,
                Token::Op("%") => BinOp::Mod,
                _ => break,
            };
            self.advance();
            self.enter()?;
            chained += 1;
            let right = self.factor()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        self.depth -= chained;
        Ok(left)
    }

    fn factor(&mut self) -> Result<Expr, RunError> {
        let op = match self.peek() {
            Token::Op("-") => UnaryOp::Neg,
            Token::Op("+") => UnaryOp::Pos,
            _ => return self.power(),
        };
        self.advance();
        self.enter()?;
        let operand = self.factor();
        self.leave();
        Ok(Expr::Unary(op, Box::new(operand?)))
    }

    fn power(&mut self) -> Result<Expr, RunError> {
        let base = self.postfix()?;
        if !self.eat_op("**") {
            return Ok(base);
        }
        self.enter()?;
        let exponent = self.factor();
        self.leave();
        Ok(Expr::Binary(Box::new(base), BinOp::Pow, Box::new(exponent?)))
    }

    fn postfix(&mut self) -> Result<Expr, RunError> {
        let mut expr = self.atom()?;
        loop {
            if self.eat_op("(") {
                let (args, keywords) = self.call_arguments()?;
                expr = Expr::Call { func: Box::new(expr), args, keywords };
            } else if self.eat_op("[") {
                let subscript = self.subscript()?;
                self.expect_op("]")?;
                expr = Expr::Subscript(Box::new(expr), Box::new(subscript));
            } else if self.eat_op(".") {
                match self.advance() {
                    Token::Name(name) => expr = Expr::Attribute(Box::new(expr), name),
                    other => {
                        return Err(self.error(format!("unexpected {}", describe(&other))));
                    }
                }
            } else {
                return Ok(expr);
            }
        }
    }

    fn call_arguments(&mut self) -> Result<(Vec<Expr>, Vec<(String, Expr)>), RunError> {
        let mut args = Vec::new();
        let mut keywords = Vec::new();

        while !self.eat_op(")") {
            let is_keyword = matches!(self.peek(), Token::Name(_))
                && matches!(self.peek_next(), Token::Op("="));
            if is_keyword {
                let Token::Name(name) = self.advance() else {
                    return Err(self.error("expected keyword name"));
                };
                self.advance();
                keywords.push((name, self.expr()?));
            } else if !keywords.is_empty() {
                return Err(self.error("positional argument follows keyword argument"));
            } else {
                let arg = self.expr()?;
                if self.check_keyword("for") {
                    args.push(self.comprehension(arg)?);
                } else {
                    args.push(arg);
                }
            }

            if !self.eat_op(",") {
                self.expect_op(")")?;
                break;
            }
        }

        Ok((args, keywords))
    }

    fn subscript(&mut self) -> Result<Subscript, RunError> {
        let start = if self.check_op(":") { None } else { Some(self.expr()?) };
        if !self.eat_op(":") {
            return match start {
                Some(index) => Ok(Subscript::Index(index)),
                None => Err(self.error("empty subscript")),
            };
        }
        let stop = if self.check_op(":") || self.check_op("]") { None } else { Some(self.expr()?) };
        let step = if self.eat_op(":") && !self.check_op("]") { Some(self.expr()?) } else { None };
        Ok(Subscript::Slice(start, stop, step))
    }

    fn comprehension(&mut self, element: Expr) -> Result<Expr, RunError> {
        self.expect_keyword("for")?;
        let target = self.target_list()?;
        self.expect_keyword("in")?;
        let iter = self.or_expr()?;
        let mut conditions = Vec::new();
        while self.eat_keyword("if") {
            conditions.push(self.or_expr()?);
        }
        if self.check_keyword("for") {
            return Err(self.error("nested comprehensions are not supported"));
        }
        Ok(Expr::Comprehension {
            element: Box::new(element),
            target,
            iter: Box::new(iter),
            conditions,
        })
    }

    fn atom(&mut self) -> Result<Expr, RunError> {
        match self.advance() {
            Token::Int(value) => Ok(Expr::Literal(Value::Int(value))),
            Token::Float(value) => Ok(Expr::Literal(Value::Float(value))),
            Token::Str(text) => {
                let mut text = text;
                while let Token::Str(next) = self.peek() {
                    text.push_str(next);
                    self.advance();
                }
                Ok(Expr::Literal(Value::Str(text)))
            }
            Token::FStr(raw) => Ok(Expr::FString(self.fstring(&raw)?)),
            Token::Name(name) => match name.as_str() {
                "True" => Ok(Expr::Literal(Value::Bool(true))),
                "False" => Ok(Expr::Literal(Value::Bool(false))),
                "None" => Ok(Expr::Literal(Value::None)),
                "lambda" | "await" | "yield" => Err(self.error(format!("`{name}` is not supported"))),
                keyword if KEYWORDS.contains(&keyword) => {
                    Err(self.error(format!("unexpected `{keyword}`")))
                }
                _ => Ok(Expr::Name(name)),
            },
            Token::Op("(") => {
                if self.eat_op(")") {
                    return Ok(Expr::Tuple(Vec::new()));
                }
                let first = self.expr()?;
                if self.check_keyword("for") {
                    let comprehension = self.comprehension(first)?;
                    self.expect_op(")")?;
                    return Ok(comprehension);
                }
                if !self.eat_op(",") {
                    self.expect_op(")")?;
                    return Ok(first);
                }
                let mut items = vec![first];
                while !self.eat_op(")") {
                    items.push(self.expr()?);
                    if !self.eat_op(",") {
                        self.expect_op(")")?;
                        break;
                    }
                }
                Ok(Expr::Tuple(items))
            }
            Token::Op("[") => {
                if self.eat_op("]") {
                    return Ok(Expr::List(Vec::new()));
                }
                let first = self.expr()?;
                if self.check_keyword("for") {
                    let comprehension = self.comprehension(first)?;
                    self.expect_op("]")?;
                    return Ok(comprehension);
                }
                let mut items = vec![first];
                while self.eat_op(",") {
                    if self.check_op("]") {
                        break;
                    }
                    items.push(self.expr()?);
                }
                self.expect_op("]")?;
                Ok(Expr::List(items))
            }
            Token::Op("{") => Err(self.error("dict and set literals are not supported")),
            other => Err(self.error(format!("unexpected {}", describe(&other)))),
        }
    }

    fn fstring(&self, raw: &str) -> Result<Vec<FStringPart>, RunError> {
        let chars: Vec<char> = raw.chars().collect();
        let mut parts = Vec::new();
        let mut literal = String::new();
        let mut index = 0;

        while index < chars.len() {
            let ch = chars[index];
            match ch {
                '{' if chars.get(index + 1) == Some(&'{') => {
                    literal.push('{');
                    index += 2;
                }
                '}' if chars.get(index + 1) == Some(&'}') => {
                    literal.push('}');
                    index += 2;
                }
                '}' => return Err(self.error("f-string: single '}' is not allowed")),
                '{' => {
                    let close = field_end(&chars, index + 1)
                        .ok_or_else(|| self.error("f-string: expecting '}'"))?;
                    let field: String = chars[index + 1..close].iter().collect();
                    if !literal.is_empty() {
                        parts.push(FStringPart::Literal(std::mem::take(&mut literal)));
                    }
                    parts.push(self.fstring_field(&field)?);
                    index = close + 1;
                }
                ch => {
                    literal.push(ch);
                    index += 1;
                }
            }
        }

        if !literal.is_empty() {
            parts.push(FStringPart::Literal(literal));
        }
        Ok(parts)
    }

    fn fstring_field(&self, field: &str) -> Result<FStringPart, RunError> {
        let (expression, conversion, spec) = split_field(field);
        if expression.trim().is_empty() {
            return Err(self.error("f-string: empty expression not allowed"));
        }

        let mut inner = Parser {
            tokens: tokenize(expression.trim())?,
            pos: 0,
            depth: self.depth,
            loops: 0,
        };
        let expr = inner.expr_list()?;
        if !matches!(inner.peek(), Token::Newline | Token::Eof) {
            return Err(self.error("f-string: invalid expression"));
        }

        let conversion = match conversion {
            None => None,
            Some(text @ ("r" | "s")) => text.chars().next(),
            Some(other) => {
                return Err(self.error(format!("f-string: invalid conversion character `{other}`")));
            }
        };
        Ok(FStringPart::Field { expr, conversion, spec: spec.unwrap_or_default().to_string() })
    }
}

/// Index of the `}` closing a replacement field opened just before `start`.
fn field_end(chars: &[char], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    for (offset, ch) in chars[start..].iter().enumerate() {
        match (quote, *ch) {
            (Some(open), ch) if ch == open => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(*ch),
            (None, '(' | '[' | '{') => depth += 1,
            (None, ')' | ']') => depth = depth.saturating_sub(1),
            (None, '}') if depth == 0 => return Some(start + offset),
            (None, '}') => depth -= 1,
            _ => {}
        }
    }
    None
}

/// Splits `expr!conv:spec` at the first top-level `!` or `:`.
fn split_field(field: &str) -> (&str, Option<&str>, Option<&str>) {
    let bytes = field.as_bytes();
    let mut depth = 0usize;
    let mut quote: Option<u8> = None;

    for (index, byte) in bytes.iter().enumerate() {
        match (quote, *byte) {
            (Some(open), byte) if byte == open => quote = None,
            (Some(_), _) => {}
            (None, b'\'' | b'"') => quote = Some(*byte),
            (None, b'(' | b'[' | b'{') => depth += 1,
            (None, b')' | b']' | b'}') => depth = depth.saturating_sub(1),
            (None, b'!') if depth == 0 && bytes.get(index + 1) != Some(&b'=') => {
                let rest = &field[index + 1..];
                return match rest.split_once(':') {
                    Some((conversion, spec)) => (&field[..index], Some(conversion), Some(spec)),
                    None => (&field[..index], Some(rest), None),
                };
            }
            (None, b':') if depth == 0 => return (&field[..index], None, Some(&field[index + 1..])),
            _ => {}
        }
    }
    (field, None, None)
}

fn describe(token: &Token) -> String {
    match token {
        Token::Int(value) => format!("number `{value}`"),
        Token::Float(value) => format!("number `{value}`"),
        Token::Str(_) | Token::FStr(_) => "string literal".to_string(),
        Token::Name(name) => format!("`{name}`"),
        Token::Op(op) => format!("`{op}`"),
        Token::Newline => "end of line".to_string(),
        Token::Indent => "indent".to_string(),
        Token::Dedent => "dedent".to_string(),
        Token::Eof => "end of input".to_string(),
    }
}
