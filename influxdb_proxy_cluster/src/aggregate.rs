//! Merging the partial results of a `SELECT` run on several shard groups.
//!
//! Every shard group answers the rewritten statement (see
//! [`influxdb_proxy_influxql::rewrite_mean`]) with one series holding one row: the time
//! column followed by one column per rewritten field. The merged response uses the first
//! non-empty partial as its template and replaces each field value by the reduction of that
//! column across all partials.
use std::cmp::Ordering;

use bytes::Bytes;
use influxdb_proxy_influxql::DistributedSelect;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AggregateError {
    #[error("no partial results to merge")]
    NoResults,

    #[error("malformed partial result: {0}")]
    Json(#[from] serde_json::Error),

    #[error("shard group returned an error: {0}")]
    Remote(String),

    #[error("unexpected partial result shape: {0}")]
    Shape(&'static str),

    #[error("{0} can't be merged across shard groups")]
    Unsupported(String),
}

pub type Result<T, E = AggregateError> = std::result::Result<T, E>;

/// A numeric JSON value, keeping the width the storage engine emitted it with.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Numeric {
    Int(i64),
    UInt(u64),
    Float(f64),
}

impl Numeric {
    /// `None` for `null`. Non-numeric values are an error.
    fn from_json(value: &Value) -> Result<Option<Self>> {
        match value {
            Value::Null => Ok(None),
            Value::Number(n) => Ok(Some(if let Some(v) = n.as_i64() {
                Self::Int(v)
            } else if let Some(v) = n.as_u64() {
                Self::UInt(v)
            } else {
                Self::Float(n.as_f64().unwrap_or(f64::NAN))
            })),
            _ => Err(AggregateError::Shape("non-numeric aggregate value")),
        }
    }

    fn to_json(self) -> Value {
        match self {
            Self::Int(v) => Value::from(v),
            Self::UInt(v) => Value::from(v),
            Self::Float(v) => serde_json::Number::from_f64(v).map_or(Value::Null, Value::Number),
        }
    }

    fn as_f64(self) -> f64 {
        match self {
            Self::Int(v) => v as f64,
            Self::UInt(v) => v as f64,
            Self::Float(v) => v,
        }
    }

    /// Integer value widened to i128, `None` for floats.
    fn as_i128(self) -> Option<i128> {
        match self {
            Self::Int(v) => Some(v.into()),
            Self::UInt(v) => Some(v.into()),
            Self::Float(_) => None,
        }
    }

    /// Narrow an integer result back to the smallest width that holds it.
    fn from_i128(v: i128) -> Self {
        if let Ok(v) = i64::try_from(v) {
            Self::Int(v)
        } else if let Ok(v) = u64::try_from(v) {
            Self::UInt(v)
        } else {
            Self::Float(v as f64)
        }
    }

    fn compare(self, other: Self) -> Ordering {
        match (self.as_i128(), other.as_i128()) {
            (Some(a), Some(b)) => a.cmp(&b),
            _ => self.as_f64().total_cmp(&other.as_f64()),
        }
    }

    pub fn max(values: &[Self]) -> Option<Self> {
        values.iter().copied().reduce(|a, b| match b.compare(a) {
            Ordering::Greater => b,
            _ => a,
        })
    }

    pub fn min(values: &[Self]) -> Option<Self> {
        values.iter().copied().reduce(|a, b| match b.compare(a) {
            Ordering::Less => b,
            _ => a,
        })
    }

    /// Integer sums stay integers; any float makes the sum a float.
    pub fn sum(values: &[Self]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let ints: Option<Vec<i128>> = values.iter().map(|v| v.as_i128()).collect();
        Some(match ints {
            Some(ints) => ints
                .into_iter()
                .try_fold(0i128, i128::checked_add)
                .map_or_else(
                    || Self::Float(values.iter().map(|v| v.as_f64()).sum()),
                    Self::from_i128,
                ),
            None => Self::Float(values.iter().map(|v| v.as_f64()).sum()),
        })
    }

    /// Always a float: whole-number floats arrive as JSON integers, so the width of `self`
    /// says nothing about the field type. `None` when dividing by zero.
    pub fn divide(self, by: Self) -> Option<Self> {
        let by = by.as_f64();
        (by != 0.0).then(|| Self::Float(self.as_f64() / by))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reducer {
    Max,
    Min,
    Sum,
    /// Counts are summed.
    Count,
    /// Sum of the partial sums over the sum of the partial counts found at `count_column`.
    Mean { count_column: usize },
}

/// How to merge the partial results of one [`DistributedSelect`].
#[derive(Debug, Clone)]
pub struct MergePlan {
    columns: Vec<String>,
    reducers: Vec<Reducer>,
    width: usize,
}

impl MergePlan {
    /// Fails when a field is not one of the aggregates that merge exactly, or when the
    /// statement groups its results.
    pub fn try_new(select: &DistributedSelect) -> Result<Self> {
        let original = select.original();
        if original.has_group_by() {
            return Err(AggregateError::Unsupported("GROUP BY".to_string()));
        }

        let reducers = original
            .fields()
            .iter()
            .enumerate()
            .map(|(i, field)| {
                let name = field.call().map(|c| c.name.as_str());
                Ok(match (name, select.count_column(i)) {
                    (Some("max"), _) => Reducer::Max,
                    (Some("min"), _) => Reducer::Min,
                    (Some("sum"), _) => Reducer::Sum,
                    (Some("count"), _) => Reducer::Count,
                    (Some("mean"), Some(count_column)) => Reducer::Mean { count_column },
                    _ => return Err(AggregateError::Unsupported(field.expr().to_string())),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            columns: original.column_names(),
            reducers,
            width: select.rewritten_fields().len(),
        })
    }

    /// Merge the raw partial responses into one response body.
    ///
    /// Partials without series carry no data and are ignored. When none has data the first
    /// partial is returned unchanged.
    pub fn merge(&self, partials: &[Bytes]) -> Result<Bytes> {
        let first = partials.first().ok_or(AggregateError::NoResults)?;

        let mut responses = Vec::with_capacity(partials.len());
        for raw in partials {
            let response: Response = serde_json::from_slice(raw)?;
            response.check()?;
            if response.has_series() {
                responses.push(response);
            }
        }

        let Some((template, _)) = responses.split_first() else {
            return Ok(first.clone());
        };
        let rows = responses
            .iter()
            .map(|r| r.row(self.width))
            .collect::<Result<Vec<_>>>()?;

        let column = |index: usize| -> Result<Vec<Numeric>> {
            let mut values = Vec::with_capacity(rows.len());
            for row in &rows {
                if let Some(v) = Numeric::from_json(&row[index + 1])? {
                    values.push(v);
                }
            }
            Ok(values)
        };

        let mut merged = Vec::with_capacity(self.reducers.len() + 1);
        merged.push(rows[0][0].clone());
        for (i, reducer) in self.reducers.iter().enumerate() {
            let values = column(i)?;
            let value = match reducer {
                Reducer::Max => Numeric::max(&values),
                Reducer::Min => Numeric::min(&values),
                Reducer::Sum | Reducer::Count => Numeric::sum(&values),
                Reducer::Mean { count_column } => {
                    let counts = column(*count_column)?;
                    Numeric::sum(&values)
                        .zip(Numeric::sum(&counts))
                        .and_then(|(sum, count)| sum.divide(count))
                }
            };
            merged.push(value.map_or(Value::Null, Numeric::to_json));
        }

        let mut out = template.clone();
        let series = &mut out.results[0].series[0];
        let time_column = series
            .columns
            .first()
            .cloned()
            .unwrap_or_else(|| "time".to_string());
        series.columns = std::iter::once(time_column)
            .chain(self.columns.iter().cloned())
            .collect();
        series.values = vec![merged];

        Ok(Bytes::from(serde_json::to_vec(&out)?))
    }
}

/// The body of a `/query` response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct Response {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub(crate) results: Vec<StatementResult>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct StatementResult {
    #[serde(default)]
    pub(crate) statement_id: i64,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub(crate) series: Vec<Series>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) error: Option<String>,

    #[serde(flatten)]
    pub(crate) extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct Series {
    #[serde(default)]
    pub(crate) name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) tags: Option<Map<String, Value>>,

    #[serde(default)]
    pub(crate) columns: Vec<String>,

    #[serde(default)]
    pub(crate) values: Vec<Vec<Value>>,

    #[serde(flatten)]
    pub(crate) extra: Map<String, Value>,
}

impl Response {
    fn check(&self) -> Result<()> {
        if let Some(e) = &self.error {
            return Err(AggregateError::Remote(e.clone()));
        }
        match self.results.as_slice() {
            [result] => match &result.error {
                Some(e) => Err(AggregateError::Remote(e.clone())),
                None => Ok(()),
            },
            _ => Err(AggregateError::Shape("expected exactly one statement result")),
        }
    }

    fn has_series(&self) -> bool {
        self.results.iter().any(|r| !r.series.is_empty())
    }

    /// The single row of the single series, with at least `width` columns after time.
    fn row(&self, width: usize) -> Result<&[Value]> {
        let series = match self.results[0].series.as_slice() {
            [series] => series,
            _ => return Err(AggregateError::Shape("expected exactly one series")),
        };
        let row = match series.values.as_slice() {
            [row] => row,
            _ => return Err(AggregateError::Shape("expected exactly one row")),
        };
        if row.len() < width + 1 {
            return Err(AggregateError::Shape("row has fewer columns than fields"));
        }
        Ok(row)
    }
}
