//! Regex admission checks applied to query text before routing.
use regex::Regex;

/// Queries matching this are rejected.
pub const DEFAULT_FORBIDDEN: &str =
    r"(?i:select\s+\*|^\s*delete|^\s*drop|^\s*grant|^\s*revoke|\(\)\$)";

/// When any obligated pattern is configured, a query must match at least one of them.
pub const DEFAULT_OBLIGATED: &str = r"(?i:where.*time|show.*from)";

/// Why a query was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Forbidden,
    MissingObligation,
}

#[derive(Debug, Clone, Default)]
pub struct QueryFilters {
    forbidden: Vec<Regex>,
    obligated: Vec<Regex>,
}

impl QueryFilters {
    /// The default forbidden and obligated patterns.
    pub fn with_defaults() -> Result<Self, regex::Error> {
        Ok(Self {
            forbidden: vec![Regex::new(DEFAULT_FORBIDDEN)?],
            obligated: vec![Regex::new(DEFAULT_OBLIGATED)?],
        })
    }

    pub fn forbid(&mut self, pattern: &str) -> Result<(), regex::Error> {
        self.forbidden.push(Regex::new(pattern)?);
        Ok(())
    }

    pub fn ensure(&mut self, pattern: &str) -> Result<(), regex::Error> {
        self.obligated.push(Regex::new(pattern)?);
        Ok(())
    }

    /// Forbidden patterns win over obligated ones.
    pub fn check(&self, query: &str) -> Result<(), Rejection> {
        if self.forbidden.iter().any(|re| re.is_match(query)) {
            return Err(Rejection::Forbidden);
        }
        if !self.obligated.is_empty() && !self.obligated.iter().any(|re| re.is_match(query)) {
            return Err(Rejection::MissingObligation);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filters() {
        let filters = QueryFilters::with_defaults().unwrap();
        let cases = [
            ("select cpu_load from cpu where time > now() - 1m", Ok(())),
            ("SHOW FIELD KEYS FROM cpu", Ok(())),
            ("select * from cpu where time > now() - 1m", Err(Rejection::Forbidden)),
            ("SELECT   *  FROM cpu WHERE time > 0", Err(Rejection::Forbidden)),
            ("  delete from cpu where time > 0", Err(Rejection::Forbidden)),
            ("DROP MEASUREMENT cpu", Err(Rejection::Forbidden)),
            ("grant all to bob", Err(Rejection::Forbidden)),
            ("REVOKE ALL PRIVILEGES FROM bob", Err(Rejection::Forbidden)),
            ("select cpu_load from cpu", Err(Rejection::MissingObligation)),
            ("show measurements", Err(Rejection::MissingObligation)),
            ("select deleted from cpu where time > 0", Ok(())),
        ];
        for (query, want) in cases {
            assert_eq!(filters.check(query), want, "{query}");
        }
    }

    #[test]
    fn registered_patterns() {
        let mut filters = QueryFilters::default();
        assert_eq!(filters.check("anything"), Ok(()));

        filters.ensure("(?i)from cpu").unwrap();
        assert_eq!(filters.check("select v from mem"), Err(Rejection::MissingObligation));
        assert_eq!(filters.check("select v FROM cpu"), Ok(()));

        filters.forbid("(?i)limit").unwrap();
        assert_eq!(filters.check("select v from cpu limit 1"), Err(Rejection::Forbidden));

        assert!(filters.forbid("(unclosed").is_err());
    }
}
