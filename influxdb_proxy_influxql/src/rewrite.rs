use crate::select::{Field, SelectStatement};

/// A `SELECT` prepared for execution on every shard group.
///
/// Each `mean(x)` is projected as `sum(x)` in place, and a companion `count(x)` is appended
/// after the original fields, so the partial results can be merged into an exact mean.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributedSelect {
    original: SelectStatement,
    rewritten: SelectStatement,
    count_columns: Vec<Option<usize>>,
}

/// Rewrite every `mean` call of `select` for distributed execution.
///
/// A statement without `mean` is returned with its text untouched.
pub fn rewrite_mean(select: &SelectStatement) -> DistributedSelect {
    let original_len = select.fields().len();
    let mut fields = Vec::with_capacity(original_len);
    let mut counts = Vec::new();
    let mut count_columns = vec![None; original_len];

    for (i, field) in select.fields().iter().enumerate() {
        let is_mean = field.call().is_some_and(|c| c.name == "mean");
        match (is_mean, field.with_call("sum"), field.with_call("count")) {
            (true, Some(sum), Some(count)) => {
                count_columns[i] = Some(original_len + counts.len());
                fields.push(sum);
                counts.push(count.without_alias());
            }
            _ => fields.push(field.clone()),
        }
    }

    let rewritten = if counts.is_empty() {
        select.clone()
    } else {
        fields.extend(counts);
        select.with_fields(fields)
    };

    DistributedSelect {
        original: select.clone(),
        rewritten,
        count_columns,
    }
}

impl DistributedSelect {
    /// The statement to send to each shard group.
    pub fn text(&self) -> &str {
        self.rewritten.text()
    }

    /// The statement as the client sent it.
    pub fn original(&self) -> &SelectStatement {
        &self.original
    }

    /// The projection sent to each shard group.
    pub fn rewritten_fields(&self) -> &[Field] {
        self.rewritten.fields()
    }

    /// Position, in the rewritten projection, of the `count` paired with original field
    /// `index`. `None` unless that field is a `mean`.
    pub fn count_column(&self, index: usize) -> Option<usize> {
        self.count_columns.get(index).copied().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse_statements;
    use pretty_assertions::assert_eq;

    fn rewrite(q: &str) -> DistributedSelect {
        let statements = parse_statements(q).unwrap();
        rewrite_mean(&SelectStatement::try_from(&statements[0]).unwrap())
    }

    #[test]
    fn rewrites() {
        let cases = [
            (
                "SELECT * FROM NOAA_water_database..s1",
                "SELECT * FROM NOAA_water_database..s1",
            ),
            ("SELECT sum(f0) FROM s1", "SELECT sum(f0) FROM s1"),
            ("SELECT count(f0) FROM s1", "SELECT count(f0) FROM s1"),
            ("SELECT min(f0) FROM s1", "SELECT min(f0) FROM s1"),
            ("SELECT max(f0) FROM s1", "SELECT max(f0) FROM s1"),
            ("SELECT mean(f0) FROM s1", "SELECT sum(f0), count(f0) FROM s1"),
            (
                "SELECT mean(f0), mean(f1), mean(f2), max(f3) FROM s1",
                "SELECT sum(f0), sum(f1), sum(f2), max(f3), count(f0), count(f1), count(f2) FROM s1",
            ),
            ("SELECT (f0 * 2) + 4 FROM s1", "SELECT (f0 * 2) + 4 FROM s1"),
            (
                r#"select MEAN("usage idle") as "avg" from cpu where time > now() - 1m"#,
                r#"select sum("usage idle") AS "avg", count("usage idle") from cpu where time > now() - 1m"#,
            ),
        ];

        for (source, want) in cases {
            let got = rewrite(source);
            assert_eq!(got.text(), want, "{source}");
            // stable for the same input
            assert_eq!(got, rewrite(source));
        }
    }

    #[test]
    fn without_mean_text_is_identical() {
        let q = "SELECT   max(v),min(v)   FROM cpu WHERE time > now() - 1m LIMIT 1";
        let got = rewrite(q);
        assert_eq!(got.text(), q);
        assert_eq!(got.count_column(0), None);
        assert_eq!(got.count_column(1), None);
    }

    #[test]
    fn count_positions() {
        let got = rewrite("SELECT mean(a), max(b), mean(c) FROM cpu WHERE time > 0");
        assert_eq!(got.count_column(0), Some(3));
        assert_eq!(got.count_column(1), None);
        assert_eq!(got.count_column(2), Some(4));
        assert_eq!(got.count_column(9), None);

        let names = got
            .rewritten_fields()
            .iter()
            .map(|f| f.expr())
            .collect::<Vec<_>>();
        assert_eq!(names, ["sum(a)", "max(b)", "sum(c)", "count(a)", "count(c)"]);
        assert_eq!(got.original().column_names(), ["mean", "max", "mean_1"]);
    }
}
