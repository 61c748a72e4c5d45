use std::fmt::{Display, Formatter};

use crate::{
    ParseError, Result,
    lexer::{Token, TokenKind, tokenize},
};

/// The statement categories the proxy routes differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Select,
    ShowMeasurements,
    ShowFieldKeys,
    ShowTagKeys,
    ShowTagValues,
    /// Anything else, e.g. `SHOW DATABASES`, `DROP`, `CREATE`.
    Other,
}

/// One InfluxQL statement, kept as the client wrote it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    text: String,
    tokens: Vec<Token>,
}

/// Split `input` on top-level `;` into statements, dropping empty ones.
pub fn parse_statements(input: &str) -> Result<Vec<Statement>> {
    let tokens = tokenize(input)?;
    tokens
        .split(|t| t.is_punct(input, ";"))
        .filter_map(|group| {
            let first = group.iter().find(|t| t.is_significant())?;
            let last = group.iter().rev().find(|t| t.is_significant())?;
            Some(Statement::new(&input[first.start..last.end]))
        })
        .collect()
}

impl Statement {
    fn new(text: &str) -> Result<Self> {
        Ok(Self {
            text: text.to_string(),
            tokens: tokenize(text)?,
        })
    }

    /// The statement text, without surrounding whitespace or the `;` separator.
    pub fn text(&self) -> &str {
        &self.text
    }

    pub(crate) fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    /// Classify the statement by its leading keywords.
    pub fn kind(&self) -> StatementKind {
        let mut words = self
            .tokens
            .iter()
            .filter(|t| t.is_significant())
            .take(3)
            .map(|t| match t.kind {
                TokenKind::Ident => t.text(&self.text).to_ascii_lowercase(),
                _ => String::new(),
            });

        match words.next().as_deref() {
            Some("select") => StatementKind::Select,
            Some("show") => match (words.next().as_deref(), words.next().as_deref()) {
                (Some("measurements"), _) => StatementKind::ShowMeasurements,
                (Some("field"), Some("keys")) => StatementKind::ShowFieldKeys,
                (Some("tag"), Some("keys")) => StatementKind::ShowTagKeys,
                (Some("tag"), Some("values")) => StatementKind::ShowTagValues,
                _ => StatementKind::Other,
            },
            _ => StatementKind::Other,
        }
    }

    /// Index of the first `keyword` token outside any parentheses.
    pub(crate) fn find_top_level_keyword(&self, keyword: &str) -> Option<usize> {
        let mut depth = 0usize;
        for (i, t) in self.tokens.iter().enumerate() {
            if t.is_punct(&self.text, "(") {
                depth += 1;
            } else if t.is_punct(&self.text, ")") {
                depth = depth.saturating_sub(1);
            } else if depth == 0 && t.is_keyword(&self.text, keyword) {
                return Some(i);
            }
        }
        None
    }

    /// The measurement named by the first source of the top-level `FROM` clause.
    ///
    /// Qualified names resolve to their last segment, so `"db"."rp"."cpu"` and `db..cpu` both
    /// name `cpu`.
    pub fn measurement(&self) -> Result<String> {
        let from = self
            .find_top_level_keyword("from")
            .ok_or(ParseError::MissingFrom)?;

        let mut tokens = self.tokens[from + 1..]
            .iter()
            .filter(|t| t.is_significant())
            .peekable();

        let mut measurement = None;
        while let Some(&t) = tokens.peek() {
            match &t.kind {
                TokenKind::Ident | TokenKind::QuotedIdent(_) => {
                    measurement = t.identifier(&self.text);
                    tokens.next();
                }
                TokenKind::Regex if measurement.is_none() => {
                    return Err(ParseError::RegexSource(t.text(&self.text).to_string()));
                }
                TokenKind::Punct if measurement.is_none() && t.is_punct(&self.text, "(") => {
                    return Err(ParseError::Subquery);
                }
                _ => break,
            }

            let mut separated = false;
            while tokens.next_if(|t| t.is_punct(&self.text, ".")).is_some() {
                separated = true;
            }
            if !separated {
                break;
            }
        }

        measurement.ok_or(ParseError::MissingMeasurement)
    }
}

impl Display for Statement {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.text)
    }
}
