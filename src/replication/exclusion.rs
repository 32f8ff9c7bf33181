// ABOUTME: Parser for per-table exclusion rules of the form `if (<condition>) skip`
// ABOUTME: Renders to a parameterized `NOT (...)` predicate for the remote query

use crate::source::RemoteColumn;
use crate::utils::{quote_ident, sanitize_identifier, validate_identifier};
use crate::value::SqlValue;
use anyhow::{anyhow, bail, Result};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    NotEq,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Null,
}

impl Literal {
    pub fn to_value(&self) -> SqlValue {
        match self {
            Literal::Text(s) => SqlValue::Text(s.clone()),
            Literal::Int(i) => SqlValue::Int(*i),
            Literal::Float(f) => SqlValue::Float(*f),
            Literal::Bool(b) => SqlValue::Bool(*b),
            Literal::Null => SqlValue::Null,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Comparison {
    pub column: String,
    pub op: CompareOp,
    pub literal: Literal,
}

/// A parsed `if (...) skip` rule.
///
/// `&&` binds tighter than `||`, so the condition is kept as a disjunction of
/// conjunctions: `any_of[i]` holds comparisons that must all match.
#[derive(Debug, Clone, PartialEq)]
pub struct ExclusionRule {
    source: String,
    pub any_of: Vec<Vec<Comparison>>,
}

impl fmt::Display for ExclusionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Number(String),
    LParen,
    RParen,
    EqEq,
    NotEq,
    AndAnd,
    OrOr,
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '=' | '!' | '&' | '|' => {
                let next = chars.get(i + 1).copied();
                let token = match (c, next) {
                    ('=', Some('=')) => Token::EqEq,
                    ('!', Some('=')) => Token::NotEq,
                    ('&', Some('&')) => Token::AndAnd,
                    ('|', Some('|')) => Token::OrOr,
                    _ => bail!("Unsupported operator starting with '{}' at position {}", c, i),
                };
                tokens.push(token);
                i += 2;
            }
            '\'' | '"' => {
                let quote = c;
                let mut value = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => bail!("Unterminated string literal"),
                        Some(&ch) if ch == quote => {
                            // doubled quote is an escaped quote
                            if chars.get(i + 1) == Some(&quote) {
                                value.push(quote);
                                i += 2;
                            } else {
                                i += 1;
                                break;
                            }
                        }
                        Some(&ch) => {
                            value.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(value));
            }
            c if c.is_ascii_digit() || c == '-' || c == '+' => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                tokens.push(Token::Number(chars[start..i].iter().collect()));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$')
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => bail!("Unexpected character '{}' at position {}", other, i),
        }
    }

    Ok(tokens)
}

fn is_keyword(ident: &str, keyword: &str) -> bool {
    ident.eq_ignore_ascii_case(keyword)
}

fn parse_number(text: &str) -> Result<Literal> {
    if let Ok(i) = text.parse::<i64>() {
        return Ok(Literal::Int(i));
    }
    text.parse::<f64>()
        .map(Literal::Float)
        .map_err(|_| anyhow!("Invalid numeric literal '{}'", text))
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<()> {
        match self.next() {
            Some(Token::Ident(word)) if is_keyword(&word, keyword) => Ok(()),
            other => bail!("Expected '{}', found {}", keyword, describe(other.as_ref())),
        }
    }

    fn expect(&mut self, expected: Token, what: &str) -> Result<()> {
        match self.next() {
            Some(token) if token == expected => Ok(()),
            other => bail!("Expected {}, found {}", what, describe(other.as_ref())),
        }
    }

    fn comparison(&mut self) -> Result<Comparison> {
        let column = match self.next() {
            Some(Token::Ident(name))
                if !["true", "false", "null"].iter().any(|k| is_keyword(&name, k)) =>
            {
                name
            }
            Some(Token::LParen) => bail!("Nested parentheses are not supported"),
            other => bail!(
                "Expected a column name on the left of a comparison, found {}",
                describe(other.as_ref())
            ),
        };

        let op = match self.next() {
            Some(Token::EqEq) => CompareOp::Eq,
            Some(Token::NotEq) => CompareOp::NotEq,
            other => bail!("Expected '==' or '!=', found {}", describe(other.as_ref())),
        };

        let literal = match self.next() {
            Some(Token::Str(s)) => Literal::Text(s),
            Some(Token::Number(n)) => parse_number(&n)?,
            Some(Token::Ident(word)) if is_keyword(&word, "true") => Literal::Bool(true),
            Some(Token::Ident(word)) if is_keyword(&word, "false") => Literal::Bool(false),
            Some(Token::Ident(word)) if is_keyword(&word, "null") => Literal::Null,
            Some(Token::Ident(word)) => bail!(
                "Column-to-column comparisons are not supported (right side '{}')",
                sanitize_identifier(&word)
            ),
            other => bail!("Expected a literal, found {}", describe(other.as_ref())),
        };

        Ok(Comparison {
            column,
            op,
            literal,
        })
    }
}

fn describe(token: Option<&Token>) -> String {
    match token {
        None => "end of rule".to_string(),
        Some(Token::Ident(s)) => format!("'{}'", sanitize_identifier(s)),
        Some(Token::Str(s)) => format!("string '{}'", sanitize_identifier(s)),
        Some(Token::Number(n)) => format!("number {}", n),
        Some(Token::LParen) => "'('".to_string(),
        Some(Token::RParen) => "')'".to_string(),
        Some(Token::EqEq) => "'=='".to_string(),
        Some(Token::NotEq) => "'!='".to_string(),
        Some(Token::AndAnd) => "'&&'".to_string(),
        Some(Token::OrOr) => "'||'".to_string(),
    }
}

impl ExclusionRule {
    /// Parse `if (<cmp> [&&|| <cmp>]*) skip`. Anything else is rejected.
    pub fn parse(text: &str) -> Result<Self> {
        let source = text.trim().to_string();
        let mut parser = Parser {
            tokens: tokenize(&source)
                .map_err(|e| anyhow!("Invalid exclusion rule '{}': {}", source, e))?,
            pos: 0,
        };

        let any_of = Self::parse_body(&mut parser)
            .map_err(|e| anyhow!("Invalid exclusion rule '{}': {}", source, e))?;

        Ok(Self { source, any_of })
    }

    fn parse_body(parser: &mut Parser) -> Result<Vec<Vec<Comparison>>> {
        parser.expect_keyword("if")?;
        parser.expect(Token::LParen, "'('")?;

        let mut groups = vec![vec![parser.comparison()?]];
        loop {
            match parser.next() {
                Some(Token::AndAnd) => {
                    let cmp = parser.comparison()?;
                    if let Some(group) = groups.last_mut() {
                        group.push(cmp);
                    }
                }
                Some(Token::OrOr) => groups.push(vec![parser.comparison()?]),
                Some(Token::RParen) => break,
                other => bail!("Expected '&&', '||' or ')', found {}", describe(other.as_ref())),
            }
        }

        parser.expect_keyword("skip")?;
        if let Some(extra) = parser.next() {
            bail!("Unexpected {} after 'skip'", describe(Some(&extra)));
        }
        Ok(groups)
    }

    /// Replace every column with its exact remote spelling, failing on columns
    /// the remote table does not have.
    pub fn resolve(mut self, remote: &[RemoteColumn]) -> Result<Self> {
        for cmp in self.any_of.iter_mut().flatten() {
            let found = remote
                .iter()
                .find(|c| c.name.eq_ignore_ascii_case(&cmp.column))
                .ok_or_else(|| {
                    anyhow!(
                        "Exclusion rule '{}' references unknown column '{}'",
                        self.source,
                        sanitize_identifier(&cmp.column)
                    )
                })?;
            validate_identifier(&found.name)?;
            cmp.column = found.name.clone();
        }
        Ok(self)
    }

    /// Render as `NOT (...)`, numbering placeholders from `*next_param`.
    pub fn to_sql(&self, next_param: &mut usize) -> (String, Vec<SqlValue>) {
        let mut params = Vec::new();
        let groups: Vec<String> = self
            .any_of
            .iter()
            .map(|group| {
                let parts: Vec<String> = group
                    .iter()
                    .map(|cmp| {
                        let column = quote_ident(&cmp.column);
                        match (&cmp.literal, cmp.op) {
                            (Literal::Null, CompareOp::Eq) => format!("{} IS NULL", column),
                            (Literal::Null, CompareOp::NotEq) => format!("{} IS NOT NULL", column),
                            (literal, op) => {
                                params.push(literal.to_value());
                                let placeholder = format!("${}", *next_param);
                                *next_param += 1;
                                let sql_op = if op == CompareOp::Eq { "=" } else { "<>" };
                                format!("{} {} {}", column, sql_op, placeholder)
                            }
                        }
                    })
                    .collect();
                format!("({})", parts.join(" AND "))
            })
            .collect();

        (format!("NOT ({})", groups.join(" OR ")), params)
    }
}
