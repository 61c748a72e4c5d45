use std::collections::HashMap;

use crate::{
    ParseError, Result,
    lexer::{Token, TokenKind},
    statement::{Statement, StatementKind},
};

/// A function call projected by a field, e.g. `mean(usage)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    /// Function name, lower-cased.
    pub name: String,
    /// Argument list as written, without the parentheses.
    pub args: String,
}

/// One entry of a `SELECT` projection list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    expr: String,
    alias: Option<String>,
    alias_text: Option<String>,
    call: Option<Call>,
    column: Option<String>,
}

impl Field {
    /// The field expression as written, without any alias.
    pub fn expr(&self) -> &str {
        &self.expr
    }

    /// The unquoted `AS` alias.
    pub fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    /// The alias exactly as written, quotes included.
    pub fn alias_text(&self) -> Option<&str> {
        self.alias_text.as_deref()
    }

    /// The call, when the whole expression is a single function call.
    pub fn call(&self) -> Option<&Call> {
        self.call.as_ref()
    }

    /// The name InfluxDB derives for this field when it has no alias.
    pub fn generated_name(&self) -> &str {
        match (&self.call, &self.column) {
            (Some(call), _) => &call.name,
            (None, Some(column)) => column,
            (None, None) => &self.expr,
        }
    }

    /// Render the field as `expr [AS alias]`.
    pub fn render(&self) -> String {
        match &self.alias_text {
            Some(alias) => format!("{} AS {}", self.expr, alias),
            None => self.expr.clone(),
        }
    }

    pub(crate) fn with_call(&self, name: &str) -> Option<Self> {
        let call = self.call.as_ref()?;
        Some(Self {
            expr: format!("{}({})", name, call.args),
            alias: self.alias.clone(),
            alias_text: self.alias_text.clone(),
            call: Some(Call {
                name: name.to_string(),
                args: call.args.clone(),
            }),
            column: None,
        })
    }

    pub(crate) fn without_alias(self) -> Self {
        Self {
            alias: None,
            alias_text: None,
            ..self
        }
    }

    fn parse(src: &str, tokens: &[Token]) -> Result<Self> {
        let sig: Vec<&Token> = tokens.iter().filter(|t| t.is_significant()).collect();
        let (first, last) = match (sig.first(), sig.last()) {
            (Some(first), Some(last)) => (*first, *last),
            _ => return Err(ParseError::EmptyField),
        };

        let n = sig.len();
        let (expr_sig, alias, alias_text) = if n >= 3 && sig[n - 2].is_keyword(src, "as") {
            match sig[n - 1].identifier(src) {
                Some(alias) => (
                    &sig[..n - 2],
                    Some(alias),
                    Some(last.text(src).to_string()),
                ),
                None => (&sig[..], None, None),
            }
        } else {
            (&sig[..], None, None)
        };

        let expr_end = expr_sig.last().map(|t| t.end).unwrap_or(last.end);
        let expr = src[first.start..expr_end].to_string();

        let column = match expr_sig {
            [only] => only.identifier(src),
            _ => None,
        };

        Ok(Self {
            expr,
            alias,
            alias_text,
            call: parse_call(src, expr_sig),
            column,
        })
    }
}

/// `ident ( ... )` where the closing parenthesis is the last token.
fn parse_call(src: &str, sig: &[&Token]) -> Option<Call> {
    let [name, open, .., close] = sig else {
        return None;
    };
    if name.kind != TokenKind::Ident || !open.is_punct(src, "(") || !close.is_punct(src, ")") {
        return None;
    }

    let mut depth = 0usize;
    for (i, t) in sig.iter().enumerate().skip(1) {
        if t.is_punct(src, "(") {
            depth += 1;
        } else if t.is_punct(src, ")") {
            depth = depth.saturating_sub(1);
            if depth == 0 && i != sig.len() - 1 {
                // e.g. `max(a) + max(b)`
                return None;
            }
        }
    }

    Some(Call {
        name: name.text(src).to_ascii_lowercase(),
        args: src[open.end..close.start].trim().to_string(),
    })
}

/// A `SELECT` statement split into its projection and the rest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectStatement {
    text: String,
    head: String,
    fields: Vec<Field>,
    tail: String,
    has_group_by: bool,
}

impl TryFrom<&Statement> for SelectStatement {
    type Error = ParseError;

    fn try_from(statement: &Statement) -> Result<Self> {
        if statement.kind() != StatementKind::Select {
            return Err(ParseError::NotSelect);
        }

        let src = statement.text();
        let tokens = statement.tokens();
        let select = tokens
            .iter()
            .position(|t| t.is_keyword(src, "select"))
            .ok_or(ParseError::NotSelect)?;
        let from = statement
            .find_top_level_keyword("from")
            .ok_or(ParseError::MissingFrom)?;

        let mut fields = Vec::new();
        let mut depth = 0usize;
        let mut field_start = select + 1;
        for i in select + 1..from {
            let t = &tokens[i];
            if t.is_punct(src, "(") {
                depth += 1;
            } else if t.is_punct(src, ")") {
                depth = depth.saturating_sub(1);
            } else if depth == 0 && t.is_punct(src, ",") {
                fields.push(Field::parse(src, &tokens[field_start..i])?);
                field_start = i + 1;
            }
        }
        fields.push(Field::parse(src, &tokens[field_start..from])?);

        let has_group_by = {
            let rest: Vec<&Token> = tokens[from..].iter().filter(|t| t.is_significant()).collect();
            let mut depth = 0usize;
            let mut found = false;
            for pair in rest.windows(2) {
                if pair[0].is_punct(src, "(") {
                    depth += 1;
                } else if pair[0].is_punct(src, ")") {
                    depth = depth.saturating_sub(1);
                } else if depth == 0
                    && pair[0].is_keyword(src, "group")
                    && pair[1].is_keyword(src, "by")
                {
                    found = true;
                    break;
                }
            }
            found
        };

        Ok(Self {
            text: src.to_string(),
            head: src[..tokens[select].end].to_string(),
            fields,
            tail: src[tokens[from].start..].to_string(),
            has_group_by,
        })
    }
}

impl SelectStatement {
    pub(crate) fn with_fields(&self, fields: Vec<Field>) -> Self {
        let projection = fields
            .iter()
            .map(Field::render)
            .collect::<Vec<_>>()
            .join(", ");
        Self {
            text: format!("{} {} {}", self.head, projection, self.tail),
            head: self.head.clone(),
            fields,
            tail: self.tail.clone(),
            has_group_by: self.has_group_by,
        }
    }

    /// The statement text.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// The projection list.
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Whether the statement has a top-level `GROUP BY` clause.
    pub fn has_group_by(&self) -> bool {
        self.has_group_by
    }

    /// Result column names, excluding the leading `time` column.
    ///
    /// Aliases are taken first. Other fields are named after their call or column, with
    /// `_1`, `_2`, ... appended to names that are already taken.
    pub fn column_names(&self) -> Vec<String> {
        let mut names: Vec<Option<String>> = self
            .fields
            .iter()
            .map(|f| f.alias().map(str::to_string))
            .collect();
        let mut seen: HashMap<String, usize> = names
            .iter()
            .flatten()
            .map(|alias| (alias.clone(), 1))
            .collect();

        for (slot, field) in names.iter_mut().zip(&self.fields) {
            if slot.is_some() {
                continue;
            }
            let mut name = field.generated_name().to_string();
            if let Some(&count) = seen.get(&name) {
                let mut count = count;
                loop {
                    let resolved = format!("{name}_{count}");
                    if !seen.contains_key(&resolved) {
                        seen.insert(name.clone(), count + 1);
                        name = resolved;
                        break;
                    }
                    count += 1;
                }
            }
            *seen.entry(name.clone()).or_default() += 1;
            *slot = Some(name);
        }

        names.into_iter().flatten().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse_statements;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    fn select(q: &str) -> SelectStatement {
        let statements = parse_statements(q).unwrap();
        SelectStatement::try_from(&statements[0]).unwrap()
    }

    #[test]
    fn fields_and_calls() {
        let s = select(
            r#"SELECT mean("usage idle") AS "avg idle", max(v), (f0 * 2) + 4, host, count(distinct(v)) FROM cpu WHERE time > now() - 1h"#,
        );
        let fields = s.fields();
        assert_eq!(fields.len(), 5);

        assert_eq!(
            fields[0].call(),
            Some(&Call {
                name: "mean".to_string(),
                args: r#""usage idle""#.to_string()
            })
        );
        assert_eq!(fields[0].alias(), Some("avg idle"));
        assert_eq!(fields[0].alias_text(), Some(r#""avg idle""#));
        assert_eq!(fields[0].expr(), r#"mean("usage idle")"#);

        assert_eq!(fields[1].call().map(|c| c.name.as_str()), Some("max"));
        assert_eq!(fields[2].call(), None);
        assert_eq!(fields[2].expr(), "(f0 * 2) + 4");
        assert_eq!(fields[3].generated_name(), "host");
        assert_eq!(fields[4].call().map(|c| c.args.as_str()), Some("distinct(v)"));
        assert!(!s.has_group_by());
    }

    #[test]
    fn call_must_span_whole_expression() {
        let s = select("SELECT max(a) + max(b), MAX(c) FROM cpu");
        assert_eq!(s.fields()[0].call(), None);
        assert_eq!(s.fields()[1].call().unwrap().name, "max");
    }

    #[test]
    fn group_by_detection() {
        assert!(select("SELECT mean(v) FROM cpu WHERE time > 0 GROUP BY time(1m)").has_group_by());
        assert!(select("select count(v) from cpu group by host").has_group_by());
        assert!(!select(r#"SELECT count(v) FROM cpu WHERE "group" = 'by'"#).has_group_by());
    }

    #[test]
    fn column_names_follow_influxdb() {
        let s = select("SELECT max(a), max(b), mean(c) AS max, a, a FROM cpu");
        assert_eq!(s.column_names(), ["max_1", "max_2", "max", "a", "a_1"]);

        let s = select("SELECT sum(a), count(a) FROM cpu");
        assert_eq!(s.column_names(), ["sum", "count"]);
    }

    #[test]
    fn not_a_select() {
        let statements = parse_statements("SHOW TAG KEYS FROM cpu").unwrap();
        assert_matches!(
            SelectStatement::try_from(&statements[0]),
            Err(ParseError::NotSelect)
        );

        let statements = parse_statements("SELECT a,, b FROM cpu").unwrap();
        assert_matches!(
            SelectStatement::try_from(&statements[0]),
            Err(ParseError::EmptyField)
        );
    }
}
