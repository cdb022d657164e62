// File: src/lexer.rs
//
// Source text → token stream (spec §4.1). Extends the teacher's char-peekable
// hand-written scanner with string interpolation fragments, nested block comments, and
// the full multi-character operator set the teacher's lexer never grew.

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum StringPart {
    Literal(String),
    /// Raw source text of an embedded `{EXPR}` fragment, re-lexed and compiled as its
    /// own sub-expression by the compiler.
    Interpolation(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Number(f64),
    /// A plain string has exactly one `Literal` part; an interpolated one has two or
    /// more parts in source order.
    StringLit(Vec<StringPart>),
    Identifier(String),
    Keyword(Keyword),
    // Single/multi-character operators and punctuation.
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    PlusEq,
    MinusEq,
    StarEq,
    SlashEq,
    PercentEq,
    PlusPlus,
    MinusMinus,
    Eq,
    EqEq,
    Bang,
    BangEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Shl,
    Shr,
    AmpAmp,
    PipePipe,
    Amp,
    Pipe,
    Caret,
    Tilde,
    QuestionQuestion,
    QuestionDot,
    QuestionBracket,
    Question,
    Arrow,
    FatArrow,
    Dot,
    DotDotDot,
    Comma,
    Colon,
    Semicolon,
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Newline,
    Eof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyword {
    Var,
    Func,
    Class,
    If,
    Else,
    While,
    For,
    In,
    Return,
    Break,
    Continue,
    Import,
    As,
    Global,
    This,
    Super,
    Try,
    Catch,
    Finally,
    Throw,
    Enum,
    Static,
    Export,
    True,
    False,
    Null,
}

impl Keyword {
    fn from_str(s: &str) -> Option<Keyword> {
        Some(match s {
            "var" => Keyword::Var,
            "func" => Keyword::Func,
            "class" => Keyword::Class,
            "if" => Keyword::If,
            "else" => Keyword::Else,
            "while" => Keyword::While,
            "for" => Keyword::For,
            "in" => Keyword::In,
            "return" => Keyword::Return,
            "break" => Keyword::Break,
            "continue" => Keyword::Continue,
            "import" => Keyword::Import,
            "as" => Keyword::As,
            "global" => Keyword::Global,
            "this" => Keyword::This,
            "super" => Keyword::Super,
            "try" => Keyword::Try,
            "catch" => Keyword::Catch,
            "finally" => Keyword::Finally,
            "throw" => Keyword::Throw,
            "enum" => Keyword::Enum,
            "static" => Keyword::Static,
            "export" => Keyword::Export,
            "true" => Keyword::True,
            "false" => Keyword::False,
            "null" => Keyword::Null,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: u32,
    pub column: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LexError {
    pub message: String,
    pub line: u32,
    pub column: u32,
}

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}:{}", self.message, self.line, self.column)
    }
}

pub struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: u32,
    column: u32,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str) -> Self {
        Lexer { chars: source.chars().peekable(), line: 1, column: 1 }
    }

    pub fn tokenize(source: &str) -> Result<Vec<Token>, LexError> {
        let mut lexer = Lexer::new(source);
        let mut tokens = Vec::new();
        loop {
            let tok = lexer.next_token()?;
            let done = tok.kind == TokenKind::Eof;
            tokens.push(tok);
            if done {
                break;
            }
        }
        Ok(tokens)
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().copied()
    }

    fn peek2(&self) -> Option<char> {
        let mut clone = self.chars.clone();
        clone.next();
        clone.next()
    }

    fn match_char(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn skip_whitespace_and_comments(&mut self) -> Result<(), LexError> {
        loop {
            match self.peek() {
                Some(' ') | Some('\t') | Some('\r') => {
                    self.advance();
                }
                Some('/') if self.peek2() == Some('/') => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                Some('/') if self.peek2() == Some('*') => {
                    self.advance();
                    self.advance();
                    let (start_line, start_col) = (self.line, self.column);
                    let mut depth = 1usize;
                    loop {
                        match self.peek() {
                            None => {
                                return Err(LexError {
                                    message: "unterminated block comment".to_string(),
                                    line: start_line,
                                    column: start_col,
                                });
                            }
                            Some('*') if self.peek2() == Some('/') => {
                                self.advance();
                                self.advance();
                                depth -= 1;
                                if depth == 0 {
                                    break;
                                }
                            }
                            Some('/') if self.peek2() == Some('*') => {
                                self.advance();
                                self.advance();
                                depth += 1;
                            }
                            _ => {
                                self.advance();
                            }
                        }
                    }
                }
                _ => break,
            }
        }
        Ok(())
    }

    pub fn next_token(&mut self) -> Result<Token, LexError> {
        self.skip_whitespace_and_comments()?;
        let line = self.line;
        let column = self.column;

        let c = match self.peek() {
            None => return Ok(Token { kind: TokenKind::Eof, line, column }),
            Some(c) => c,
        };

        if c == '\n' {
            self.advance();
            return Ok(Token { kind: TokenKind::Newline, line, column });
        }

        if c.is_ascii_digit() {
            return self.lex_number(line, column);
        }

        if c == '"' {
            return self.lex_string(line, column);
        }

        if c.is_alphabetic() || c == '_' {
            return self.lex_identifier(line, column);
        }

        self.advance();
        let kind = match c {
            '+' => {
                if self.match_char('+') {
                    TokenKind::PlusPlus
                } else if self.match_char('=') {
                    TokenKind::PlusEq
                } else {
                    TokenKind::Plus
                }
            }
            '-' => {
                if self.match_char('-') {
                    TokenKind::MinusMinus
                } else if self.match_char('=') {
                    TokenKind::MinusEq
                } else if self.match_char('>') {
                    TokenKind::Arrow
                } else {
                    TokenKind::Minus
                }
            }
            '*' => {
                if self.match_char('=') {
                    TokenKind::StarEq
                } else {
                    TokenKind::Star
                }
            }
            '/' => {
                if self.match_char('=') {
                    TokenKind::SlashEq
                } else {
                    TokenKind::Slash
                }
            }
            '%' => {
                if self.match_char('=') {
                    TokenKind::PercentEq
                } else {
                    TokenKind::Percent
                }
            }
            '=' => {
                if self.match_char('=') {
                    TokenKind::EqEq
                } else if self.match_char('>') {
                    TokenKind::FatArrow
                } else {
                    TokenKind::Eq
                }
            }
            '!' => {
                if self.match_char('=') {
                    TokenKind::BangEq
                } else {
                    TokenKind::Bang
                }
            }
            '<' => {
                if self.match_char('=') {
                    TokenKind::LtEq
                } else if self.match_char('<') {
                    TokenKind::Shl
                } else {
                    TokenKind::Lt
                }
            }
            '>' => {
                if self.match_char('=') {
                    TokenKind::GtEq
                } else if self.match_char('>') {
                    TokenKind::Shr
                } else {
                    TokenKind::Gt
                }
            }
            '&' => {
                if self.match_char('&') {
                    TokenKind::AmpAmp
                } else {
                    TokenKind::Amp
                }
            }
            '|' => {
                if self.match_char('|') {
                    TokenKind::PipePipe
                } else {
                    TokenKind::Pipe
                }
            }
            '^' => TokenKind::Caret,
            '~' => TokenKind::Tilde,
            '?' => {
                if self.match_char('?') {
                    TokenKind::QuestionQuestion
                } else if self.match_char('.') {
                    TokenKind::QuestionDot
                } else if self.match_char('[') {
                    TokenKind::QuestionBracket
                } else {
                    TokenKind::Question
                }
            }
            '.' => {
                if self.peek() == Some('.') && self.peek2() == Some('.') {
                    self.advance();
                    self.advance();
                    TokenKind::DotDotDot
                } else {
                    TokenKind::Dot
                }
            }
            ',' => TokenKind::Comma,
            ':' => TokenKind::Colon,
            ';' => TokenKind::Semicolon,
            '(' => TokenKind::LParen,
            ')' => TokenKind::RParen,
            '{' => TokenKind::LBrace,
            '}' => TokenKind::RBrace,
            '[' => TokenKind::LBracket,
            ']' => TokenKind::RBracket,
            other => {
                return Err(LexError {
                    message: format!("unexpected character '{other}'"),
                    line,
                    column,
                });
            }
        };
        Ok(Token { kind, line, column })
    }

    fn lex_number(&mut self, line: u32, column: u32) -> Result<Token, LexError> {
        let mut text = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                text.push(c);
                self.advance();
            } else {
                break;
            }
        }
        if self.peek() == Some('.') && self.peek2().map(|c| c.is_ascii_digit()).unwrap_or(false) {
            text.push('.');
            self.advance();
            while let Some(c) = self.peek() {
                if c.is_ascii_digit() {
                    text.push(c);
                    self.advance();
                } else {
                    break;
                }
            }
        }
        let value: f64 = text.parse().map_err(|_| LexError {
            message: format!("invalid number literal '{text}'"),
            line,
            column,
        })?;
        Ok(Token { kind: TokenKind::Number(value), line, column })
    }

    fn lex_identifier(&mut self, line: u32, column: u32) -> Result<Token, LexError> {
        let mut text = String::new();
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' {
                text.push(c);
                self.advance();
            } else {
                break;
            }
        }
        let kind = match Keyword::from_str(&text) {
            Some(kw) => TokenKind::Keyword(kw),
            None => TokenKind::Identifier(text),
        };
        Ok(Token { kind, line, column })
    }

    /// Lex a double-quoted string, splitting on `{EXPR}` interpolation fragments.
    /// `{{` and `\{` both produce a literal `{`; `\n \t \r \" \\` are the other
    /// recognized escapes.
    fn lex_string(&mut self, line: u32, column: u32) -> Result<Token, LexError> {
        self.advance(); // opening quote
        let mut parts = Vec::new();
        let mut current = String::new();
        loop {
            match self.peek() {
                None => {
                    return Err(LexError { message: "unterminated string literal".to_string(), line, column });
                }
                Some('"') => {
                    self.advance();
                    break;
                }
                Some('\\') => {
                    self.advance();
                    match self.peek() {
                        Some('n') => {
                            current.push('\n');
                            self.advance();
                        }
                        Some('t') => {
                            current.push('\t');
                            self.advance();
                        }
                        Some('r') => {
                            current.push('\r');
                            self.advance();
                        }
                        Some('"') => {
                            current.push('"');
                            self.advance();
                        }
                        Some('\\') => {
                            current.push('\\');
                            self.advance();
                        }
                        Some('{') => {
                            current.push('{');
                            self.advance();
                        }
                        Some(other) => {
                            current.push(other);
                            self.advance();
                        }
                        None => {
                            return Err(LexError {
                                message: "unterminated string literal".to_string(),
                                line,
                                column,
                            });
                        }
                    }
                }
                Some('{') if self.peek2() == Some('{') => {
                    self.advance();
                    self.advance();
                    current.push('{');
                }
                Some('{') => {
                    self.advance();
                    if !current.is_empty() {
                        parts.push(StringPart::Literal(std::mem::take(&mut current)));
                    }
                    let mut expr_src = String::new();
                    let mut depth = 1usize;
                    loop {
                        match self.peek() {
                            None => {
                                return Err(LexError {
                                    message: "unterminated interpolation expression".to_string(),
                                    line,
                                    column,
                                });
                            }
                            Some('{') => {
                                depth += 1;
                                expr_src.push('{');
                                self.advance();
                            }
                            Some('}') => {
                                depth -= 1;
                                self.advance();
                                if depth == 0 {
                                    break;
                                }
                                expr_src.push('}');
                            }
                            Some(other) => {
                                expr_src.push(other);
                                self.advance();
                            }
                        }
                    }
                    parts.push(StringPart::Interpolation(expr_src));
                }
                Some(other) => {
                    current.push(other);
                    self.advance();
                }
            }
        }
        if !current.is_empty() || parts.is_empty() {
            parts.push(StringPart::Literal(current));
        }
        Ok(Token { kind: TokenKind::StringLit(parts), line, column })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        Lexer::tokenize(src).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn tokenizes_basic_arithmetic() {
        let k = kinds("1 + 2 * 3");
        assert_eq!(
            k,
            vec![
                TokenKind::Number(1.0),
                TokenKind::Plus,
                TokenKind::Number(2.0),
                TokenKind::Star,
                TokenKind::Number(3.0),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn recognizes_keywords_vs_identifiers() {
        let k = kinds("var func xyz");
        assert_eq!(
            k,
            vec![
                TokenKind::Keyword(Keyword::Var),
                TokenKind::Keyword(Keyword::Func),
                TokenKind::Identifier("xyz".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn multi_char_operators_prefer_longest_match() {
        let k = kinds("a ?? b ?. c += 1 << 2");
        assert!(k.contains(&TokenKind::QuestionQuestion));
        assert!(k.contains(&TokenKind::QuestionDot));
        assert!(k.contains(&TokenKind::PlusEq));
        assert!(k.contains(&TokenKind::Shl));
    }

    #[test]
    fn string_interpolation_splits_into_fragments() {
        let tokens = Lexer::tokenize(r#""a{1+1}b""#).unwrap();
        match &tokens[0].kind {
            TokenKind::StringLit(parts) => {
                assert_eq!(
                    parts,
                    &vec![
                        StringPart::Literal("a".into()),
                        StringPart::Interpolation("1+1".into()),
                        StringPart::Literal("b".into()),
                    ]
                );
            }
            other => panic!("expected string literal, got {other:?}"),
        }
    }

    #[test]
    fn escaped_brace_is_not_interpolation() {
        let tokens = Lexer::tokenize(r#""a{{b""#).unwrap();
        match &tokens[0].kind {
            TokenKind::StringLit(parts) => assert_eq!(parts, &vec![StringPart::Literal("a{b".into())]),
            other => panic!("expected string literal, got {other:?}"),
        }
    }

    #[test]
    fn nested_block_comments_are_skipped() {
        let k = kinds("1 /* outer /* inner */ still-comment */ 2");
        assert_eq!(k, vec![TokenKind::Number(1.0), TokenKind::Number(2.0), TokenKind::Eof]);
    }

    #[test]
    fn unterminated_string_is_a_lex_error() {
        let err = Lexer::tokenize("\"abc").unwrap_err();
        assert!(err.message.contains("unterminated"));
    }

    #[test]
    fn newline_emits_token() {
        let k = kinds("1\n2");
        assert_eq!(k, vec![TokenKind::Number(1.0), TokenKind::Newline, TokenKind::Number(2.0), TokenKind::Eof]);
    }
}
