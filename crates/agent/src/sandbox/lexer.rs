use super::value::RunError;

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    FStr(String),
    Name(String),
    Op(&'static str),
    Newline,
    Indent,
    Dedent,
    Eof,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Spanned {
    pub(crate) token: Token,
    pub(crate) line: usize,
}

const OPERATORS: &[&str] = &[
    "**=", "//=", "**", "//", "==", "!=", "<=", ">=", "+=", "-=", "*=", "/=", "%=", "+", "-",
    "*", "/", "%", "<", ">", "=", "(", ")", "[", "]", "{", "}", ",", ":", ".", ";",
];

const TAB_WIDTH: usize = 8;

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    depth: usize,
    indents: Vec<usize>,
    tokens: Vec<Spanned>,
}

/// Splits source into tokens, synthesising `Indent`/`Dedent` from leading whitespace.
pub(crate) fn tokenize(source: &str) -> Result<Vec<Spanned>, RunError> {
    let mut lexer = Lexer {
        chars: source.chars().collect(),
        pos: 0,
        line: 1,
        depth: 0,
        indents: vec![0],
        tokens: Vec::new(),
    };
    lexer.run()?;
    Ok(lexer.tokens)
}

impl Lexer {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn push(&mut self, token: Token) {
        self.tokens.push(Spanned { token, line: self.line });
    }

    fn error(&self, message: impl std::fmt::Display) -> RunError {
        RunError::syntax(message, self.line)
    }

    fn run(&mut self) -> Result<(), RunError> {
        let mut at_line_start = true;

        loop {
            if at_line_start && self.depth == 0 {
                if !self.indentation()? {
                    break;
                }
                at_line_start = false;
            }

            let Some(ch) = self.peek() else { break };
            match ch {
                ' ' | '\t' | '\r' | '\x0c' => self.pos += 1,
                '\\' if self.peek_at(1) == Some('\n') => {
                    self.pos += 2;
                    self.line += 1;
                }
                '\n' => {
                    if self.depth == 0 {
                        self.push(Token::Newline);
                        at_line_start = true;
                    }
                    self.pos += 1;
                    self.line += 1;
                }
                '#' => self.skip_comment(),
                '\'' | '"' => {
                    let text = self.string(ch)?;
                    self.push(Token::Str(text));
                }
                ch if ch.is_ascii_digit()
                    || (ch == '.' && self.peek_at(1).is_some_and(|next| next.is_ascii_digit())) =>
                {
                    let token = self.number()?;
                    self.push(token);
                }
                ch if ch.is_alphabetic() || ch == '_' => self.word()?,
                _ => self.operator()?,
            }
        }

        if !matches!(self.tokens.last().map(|spanned| &spanned.token), None | Some(Token::Newline)) {
            self.push(Token::Newline);
        }
        while self.indents.len() > 1 {
            self.indents.pop();
            self.push(Token::Dedent);
        }
        self.push(Token::Eof);
        Ok(())
    }

    /// Consumes leading whitespace of a logical line. Returns `false` at end of input.
    fn indentation(&mut self) -> Result<bool, RunError> {
        loop {
            let mut column = 0;
            while let Some(ch) = self.peek() {
                match ch {
                    ' ' => column += 1,
                    '\t' => column = (column / TAB_WIDTH + 1) * TAB_WIDTH,
                    '\x0c' | '\r' => {}
                    _ => break,
                }
                self.pos += 1;
            }

            match self.peek() {
                None => return Ok(false),
                Some('\n') => {
                    self.pos += 1;
                    self.line += 1;
                }
                Some('#') => self.skip_comment(),
                Some(_) => {
                    let current = self.indents.last().copied().unwrap_or(0);
                    if column > current {
                        self.indents.push(column);
                        self.push(Token::Indent);
                    } else {
                        while column < self.indents.last().copied().unwrap_or(0) {
                            self.indents.pop();
                            self.push(Token::Dedent);
                        }
                        if column != self.indents.last().copied().unwrap_or(0) {
                            return Err(self.error(
                                "unindent does not match any outer indentation level",
                            ));
                        }
                    }
                    return Ok(true);
                }
            }
        }
    }

    fn skip_comment(&mut self) {
        while let Some(ch) = self.peek() {
            if ch == '\n' {
                break;
            }
            self.pos += 1;
        }
    }

    fn number(&mut self) -> Result<Token, RunError> {
        let start = self.pos;
        let mut is_float = false;

        if self.peek() == Some('0')
            && matches!(self.peek_at(1), Some('x' | 'X' | 'o' | 'O' | 'b' | 'B'))
        {
            let radix = match self.peek_at(1) {
                Some('x' | 'X') => 16,
                Some('o' | 'O') => 8,
                _ => 2,
            };
            self.pos += 2;
            let digits_start = self.pos;
            while self.peek().is_some_and(|ch| ch.is_ascii_alphanumeric() || ch == '_') {
                self.pos += 1;
            }
            let digits: String =
                self.chars[digits_start..self.pos].iter().filter(|ch| **ch != '_').collect();
            return i64::from_str_radix(&digits, radix)
                .map(Token::Int)
                .map_err(|_| self.error("invalid integer literal"));
        }

        while let Some(ch) = self.peek() {
            match ch {
                '0'..='9' | '_' => self.pos += 1,
                '.' if !is_float => {
                    is_float = true;
                    self.pos += 1;
                }
                'e' | 'E' => {
                    is_float = true;
                    self.pos += 1;
                    if matches!(self.peek(), Some('+' | '-')) {
                        self.pos += 1;
                    }
                }
                _ => break,
            }
        }

        let text: String = self.chars[start..self.pos].iter().filter(|ch| **ch != '_').collect();
        if is_float {
            text.parse::<f64>().map(Token::Float).map_err(|_| self.error("invalid float literal"))
        } else {
            text.parse::<i64>().map(Token::Int).map_err(|_| {
                self.error(format!("integer literal `{text}` does not fit in 64 bits"))
            })
        }
    }

    fn word(&mut self) -> Result<(), RunError> {
        let start = self.pos;
        while self.peek().is_some_and(|ch| ch.is_alphanumeric() || ch == '_') {
            self.pos += 1;
        }
        let word: String = self.chars[start..self.pos].iter().collect();

        if let Some(quote @ ('\'' | '"')) = self.peek() {
            match word.to_ascii_lowercase().as_str() {
                "f" => {
                    let text = self.string(quote)?;
                    self.push(Token::FStr(text));
                    return Ok(());
                }
                "r" => {
                    let text = self.raw_string(quote)?;
                    self.push(Token::Str(text));
                    return Ok(());
                }
                "b" | "rb" | "br" | "u" => {
                    return Err(self.error(format!("string prefix `{word}` is not supported")));
                }
                _ => {}
            }
        }

        self.push(Token::Name(word));
        Ok(())
    }

    fn string_delimiter(&mut self, quote: char) -> bool {
        let triple = self.peek_at(1) == Some(quote) && self.peek_at(2) == Some(quote);
        self.pos += if triple { 3 } else { 1 };
        triple
    }

    fn closes(&self, quote: char, triple: bool) -> bool {
        self.peek() == Some(quote)
            && (!triple || (self.peek_at(1) == Some(quote) && self.peek_at(2) == Some(quote)))
    }

    fn string(&mut self, quote: char) -> Result<String, RunError> {
        let triple = self.string_delimiter(quote);
        let mut text = String::new();

        loop {
            if self.closes(quote, triple) {
                self.pos += if triple { 3 } else { 1 };
                return Ok(text);
            }
            let Some(ch) = self.peek() else {
                return Err(self.error("unterminated string literal"));
            };
            self.pos += 1;
            match ch {
                '\n' if !triple => return Err(self.error("unterminated string literal")),
                '\n' => {
                    self.line += 1;
                    text.push('\n');
                }
                '\\' => {
                    let Some(escaped) = self.peek() else {
                        return Err(self.error("unterminated string literal"));
                    };
                    self.pos += 1;
                    match escaped {
                        'n' => text.push('\n'),
                        't' => text.push('\t'),
                        'r' => text.push('\r'),
                        '0' => text.push('\0'),
                        '\\' | '\'' | '"' => text.push(escaped),
                        '\n' => self.line += 1,
                        other => {
                            text.push('\\');
                            text.push(other);
                        }
                    }
                }
                ch => text.push(ch),
            }
        }
    }

    fn raw_string(&mut self, quote: char) -> Result<String, RunError> {
        let triple = self.string_delimiter(quote);
        let mut text = String::new();
        loop {
            if self.closes(quote, triple) {
                self.pos += if triple { 3 } else { 1 };
                return Ok(text);
            }
            match self.peek() {
                None => return Err(self.error("unterminated string literal")),
                Some('\n') if !triple => return Err(self.error("unterminated string literal")),
                Some(ch) => {
                    if ch == '\n' {
                        self.line += 1;
                    }
                    text.push(ch);
                    self.pos += 1;
                }
            }
        }
    }

    fn operator(&mut self) -> Result<(), RunError> {
        let rest: String = self.chars[self.pos..].iter().take(3).collect();
        let Some(op) = OPERATORS.iter().find(|op| rest.starts_with(**op)) else {
            let ch = self.peek().unwrap_or(' ');
            return Err(self.error(format!("unexpected character `{ch}`")));
        };

        match *op {
            "(" | "[" | "{" => self.depth += 1,
            ")" | "]" | "}" => self.depth = self.depth.saturating_sub(1),
            _ => {}
        }
        self.pos += op.chars().count();
        self.push(Token::Op(op));
        Ok(())
    }
}
