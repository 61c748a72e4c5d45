//! Tokenizer for InfluxQL text.
//!
//! Tokens only carry byte ranges into the source text, so any span of a statement can be
//! reproduced exactly as the client wrote it.
use nom::{
    IResult,
    branch::alt,
    bytes::complete::{escaped, escaped_transform, tag, take_till},
    character::complete::{alpha1, alphanumeric1, anychar, char, digit0, digit1, multispace1, none_of},
    combinator::{map, opt, recognize, value},
    multi::many0_count,
    sequence::{delimited, pair},
};

use crate::ParseError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TokenKind {
    /// Whitespace or a `--` line comment.
    Whitespace,
    /// Unquoted identifier or keyword.
    Ident,
    /// Double quoted identifier, unescaped.
    QuotedIdent(String),
    /// Single quoted string literal.
    Str,
    /// `/.../` regular expression literal.
    Regex,
    Number,
    Punct,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Token {
    pub(crate) kind: TokenKind,
    pub(crate) start: usize,
    pub(crate) end: usize,
}

impl Token {
    pub(crate) fn text<'a>(&self, src: &'a str) -> &'a str {
        &src[self.start..self.end]
    }

    pub(crate) fn is_significant(&self) -> bool {
        self.kind != TokenKind::Whitespace
    }

    pub(crate) fn is_punct(&self, src: &str, p: &str) -> bool {
        self.kind == TokenKind::Punct && self.text(src) == p
    }

    pub(crate) fn is_keyword(&self, src: &str, keyword: &str) -> bool {
        self.kind == TokenKind::Ident && self.text(src).eq_ignore_ascii_case(keyword)
    }

    /// The identifier value for `Ident` and `QuotedIdent` tokens.
    pub(crate) fn identifier(&self, src: &str) -> Option<String> {
        match &self.kind {
            TokenKind::Ident => Some(self.text(src).to_string()),
            TokenKind::QuotedIdent(s) => Some(s.clone()),
            _ => None,
        }
    }
}

fn whitespace(i: &str) -> IResult<&str, &str> {
    alt((
        multispace1,
        recognize(pair(tag("--"), take_till(|c| c == '\n'))),
    ))(i)
}

fn unquoted_identifier(i: &str) -> IResult<&str, &str> {
    recognize(pair(
        alt((alpha1, tag("_"))),
        many0_count(alt((alphanumeric1, tag("_")))),
    ))(i)
}

fn quoted_identifier(i: &str) -> IResult<&str, String> {
    delimited(
        char('"'),
        map(
            opt(escaped_transform(
                none_of("\\\"\n"),
                '\\',
                alt((
                    value("\\", char('\\')),
                    value("\"", char('"')),
                    value("'", char('\'')),
                    value("\n", char('n')),
                    value("\t", char('t')),
                )),
            )),
            Option::unwrap_or_default,
        ),
        char('"'),
    )(i)
}

fn single_quoted_string(i: &str) -> IResult<&str, &str> {
    recognize(delimited(
        char('\''),
        opt(escaped(none_of("\\'"), '\\', anychar)),
        char('\''),
    ))(i)
}

fn regex(i: &str) -> IResult<&str, &str> {
    recognize(delimited(
        char('/'),
        opt(escaped(none_of("\\/\n"), '\\', anychar)),
        char('/'),
    ))(i)
}

fn number(i: &str) -> IResult<&str, &str> {
    recognize(pair(digit1, opt(pair(char('.'), digit0))))(i)
}

fn punct(i: &str) -> IResult<&str, &str> {
    alt((
        tag("=~"),
        tag("!~"),
        tag("!="),
        tag("<>"),
        tag("<="),
        tag(">="),
        tag("::"),
        recognize(anychar),
    ))(i)
}

fn next_token(i: &str, regex_allowed: bool) -> IResult<&str, TokenKind> {
    if regex_allowed {
        if let Ok((rest, _)) = regex(i) {
            return Ok((rest, TokenKind::Regex));
        }
    }

    alt((
        value(TokenKind::Whitespace, whitespace),
        map(quoted_identifier, TokenKind::QuotedIdent),
        value(TokenKind::Str, single_quoted_string),
        value(TokenKind::Number, number),
        value(TokenKind::Ident, unquoted_identifier),
        value(TokenKind::Punct, punct),
    ))(i)
}

/// A `/` starts a regex only where InfluxQL accepts one.
fn regex_allowed(tokens: &[Token], src: &str) -> bool {
    match tokens.iter().rev().find(|t| t.is_significant()) {
        Some(t) => t.is_keyword(src, "from") || t.is_punct(src, "=~") || t.is_punct(src, "!~"),
        None => false,
    }
}

pub(crate) fn tokenize(src: &str) -> Result<Vec<Token>, ParseError> {
    let mut tokens = Vec::new();
    let mut rest = src;

    while !rest.is_empty() {
        let start = src.len() - rest.len();
        let (remaining, kind) = next_token(rest, regex_allowed(&tokens, src)).map_err(|_| {
            ParseError::Unterminated {
                what: "token",
                offset: start,
            }
        })?;
        let token = Token {
            kind,
            start,
            end: src.len() - remaining.len(),
        };

        // A lone quote means the quoted parsers above could not find the closing quote.
        if token.is_punct(src, "\"") {
            return Err(ParseError::Unterminated {
                what: "identifier",
                offset: start,
            });
        }
        if token.is_punct(src, "'") {
            return Err(ParseError::Unterminated {
                what: "string",
                offset: start,
            });
        }

        tokens.push(token);
        rest = remaining;
    }

    Ok(tokens)
}
