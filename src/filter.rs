use serde::{Deserialize, Serialize};

use crate::db::quote_identifier;
use crate::error::RowPulseError;

/// Comparison operator of a filter clause
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOp {
    Exact,
    Not,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    Gt,
    Gte,
    Lt,
    Lte,
    Like,
    NotLike,
    Glob,
    In,
    NotIn,
    IsNull,
    NotNull,
    IsBlank,
    NotBlank,
}

impl FilterOp {
    const ALL: [FilterOp; 19] = [
        FilterOp::Exact,
        FilterOp::Not,
        FilterOp::Contains,
        FilterOp::NotContains,
        FilterOp::StartsWith,
        FilterOp::EndsWith,
        FilterOp::Gt,
        FilterOp::Gte,
        FilterOp::Lt,
        FilterOp::Lte,
        FilterOp::Like,
        FilterOp::NotLike,
        FilterOp::Glob,
        FilterOp::In,
        FilterOp::NotIn,
        FilterOp::IsNull,
        FilterOp::NotNull,
        FilterOp::IsBlank,
        FilterOp::NotBlank,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FilterOp::Exact => "exact",
            FilterOp::Not => "not",
            FilterOp::Contains => "contains",
            FilterOp::NotContains => "notcontains",
            FilterOp::StartsWith => "startswith",
            FilterOp::EndsWith => "endswith",
            FilterOp::Gt => "gt",
            FilterOp::Gte => "gte",
            FilterOp::Lt => "lt",
            FilterOp::Lte => "lte",
            FilterOp::Like => "like",
            FilterOp::NotLike => "notlike",
            FilterOp::Glob => "glob",
            FilterOp::In => "in",
            FilterOp::NotIn => "notin",
            FilterOp::IsNull => "isnull",
            FilterOp::NotNull => "notnull",
            FilterOp::IsBlank => "isblank",
            FilterOp::NotBlank => "notblank",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.as_str() == s)
    }
}

/// One `column <op> value` restriction on inserted rows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterClause {
    pub column: String,
    pub op: FilterOp,
    #[serde(default)]
    pub value: String,
}

impl FilterClause {
    pub fn new(column: &str, op: FilterOp, value: &str) -> Self {
        Self {
            column: column.to_string(),
            op,
            value: value.to_string(),
        }
    }

    /// Parse the `["column__op", "value"]` pair form. A bare `"column"`
    /// means `exact`. The suffix after the last `__` only counts as an
    /// operator when it names one, so column names may contain `__`.
    pub fn from_pair(key: &str, value: &str) -> Result<Self, RowPulseError> {
        let (column, op) = match key.rsplit_once("__") {
            Some((column, suffix)) => match FilterOp::from_str_opt(suffix) {
                Some(op) => (column, op),
                None => (key, FilterOp::Exact),
            },
            None => (key, FilterOp::Exact),
        };

        if column.trim().is_empty() {
            return Err(RowPulseError::Validation(format!(
                "Filter '{}' has no column",
                key
            )));
        }

        Ok(Self::new(column, op, value))
    }

    fn render(&self) -> Result<String, RowPulseError> {
        let col = new_row_column(&self.column)?;

        let clause = match self.op {
            FilterOp::Exact => format!("{} = {}", col, SqlLiteral::text(&self.value).render()?),
            FilterOp::Not => format!("{} != {}", col, SqlLiteral::text(&self.value).render()?),
            FilterOp::Contains => format!(
                "{} LIKE {}",
                col,
                SqlLiteral::text(&format!("%{}%", self.value)).render()?
            ),
            FilterOp::NotContains => format!(
                "{} NOT LIKE {}",
                col,
                SqlLiteral::text(&format!("%{}%", self.value)).render()?
            ),
            FilterOp::StartsWith => format!(
                "{} LIKE {}",
                col,
                SqlLiteral::text(&format!("{}%", self.value)).render()?
            ),
            FilterOp::EndsWith => format!(
                "{} LIKE {}",
                col,
                SqlLiteral::text(&format!("%{}", self.value)).render()?
            ),
            FilterOp::Gt => format!("{} > {}", col, SqlLiteral::number_or_text(&self.value).render()?),
            FilterOp::Gte => format!("{} >= {}", col, SqlLiteral::number_or_text(&self.value).render()?),
            FilterOp::Lt => format!("{} < {}", col, SqlLiteral::number_or_text(&self.value).render()?),
            FilterOp::Lte => format!("{} <= {}", col, SqlLiteral::number_or_text(&self.value).render()?),
            FilterOp::Like => format!("{} LIKE {}", col, SqlLiteral::text(&self.value).render()?),
            FilterOp::NotLike => format!("{} NOT LIKE {}", col, SqlLiteral::text(&self.value).render()?),
            FilterOp::Glob => format!("{} GLOB {}", col, SqlLiteral::text(&self.value).render()?),
            FilterOp::In => format!("{} IN ({})", col, self.render_list()?),
            FilterOp::NotIn => format!("{} NOT IN ({})", col, self.render_list()?),
            FilterOp::IsNull => format!("{} IS NULL", col),
            FilterOp::NotNull => format!("{} IS NOT NULL", col),
            FilterOp::IsBlank => format!("({} IS NULL OR {} = '')", col, col),
            FilterOp::NotBlank => format!("({} IS NOT NULL AND {} != '')", col, col),
        };

        Ok(clause)
    }

    /// `in` values are either a JSON array or a comma separated list
    fn render_list(&self) -> Result<String, RowPulseError> {
        let trimmed = self.value.trim();
        let literals: Vec<SqlLiteral> = if trimmed.starts_with('[') {
            let items: Vec<serde_json::Value> = serde_json::from_str(trimmed).map_err(|e| {
                RowPulseError::Validation(format!("Invalid list for '{}': {}", self.column, e))
            })?;
            items
                .iter()
                .map(|item| match item {
                    serde_json::Value::String(s) => Ok(SqlLiteral::text(s)),
                    serde_json::Value::Number(n) => Ok(SqlLiteral::number_or_text(&n.to_string())),
                    other => Err(RowPulseError::Validation(format!(
                        "Unsupported list value for '{}': {}",
                        self.column, other
                    ))),
                })
                .collect::<Result<_, _>>()?
        } else {
            trimmed
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(SqlLiteral::text)
                .collect()
        };

        if literals.is_empty() {
            return Err(RowPulseError::Validation(format!(
                "Filter '{}__{}' needs at least one value",
                self.column,
                self.op.as_str()
            )));
        }

        let rendered = literals
            .iter()
            .map(SqlLiteral::render)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rendered.join(", "))
    }
}

/// Conjunction of filter clauses restricting which inserted rows are queued
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<RawClause>", into = "Vec<FilterClause>")]
pub struct FilterPredicate {
    clauses: Vec<FilterClause>,
}

// Pairs are tried first: a struct also deserializes from a sequence, which
// would misread `["col", "exact"]` as an empty-valued clause.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawClause {
    Pair(Vec<String>),
    Clause(FilterClause),
}

impl TryFrom<Vec<RawClause>> for FilterPredicate {
    type Error = RowPulseError;

    fn try_from(raw: Vec<RawClause>) -> Result<Self, Self::Error> {
        let clauses = raw
            .into_iter()
            .map(|r| match r {
                RawClause::Clause(clause) => Ok(clause),
                RawClause::Pair(pair) => match pair.as_slice() {
                    [key] => FilterClause::from_pair(key, ""),
                    [key, value] => FilterClause::from_pair(key, value),
                    _ => Err(RowPulseError::Validation(format!(
                        "Filter pair must have one or two elements, got {}",
                        pair.len()
                    ))),
                },
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { clauses })
    }
}

impl From<FilterPredicate> for Vec<FilterClause> {
    fn from(predicate: FilterPredicate) -> Self {
        predicate.clauses
    }
}

impl FilterPredicate {
    pub fn new(clauses: Vec<FilterClause>) -> Self {
        Self { clauses }
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    pub fn clauses(&self) -> &[FilterClause] {
        &self.clauses
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.clauses.iter().map(|c| c.column.as_str())
    }

    /// Render as the body of a trigger `WHEN` clause, every column referring
    /// to the inserted row. Columns must appear in `known_columns`.
    /// Returns `None` for an empty predicate.
    pub fn to_trigger_when(&self, known_columns: &[String]) -> Result<Option<String>, RowPulseError> {
        if self.clauses.is_empty() {
            return Ok(None);
        }

        let parts = self
            .clauses
            .iter()
            .map(|clause| {
                if !known_columns.iter().any(|k| k == &clause.column) {
                    return Err(RowPulseError::Validation(format!(
                        "Filter column '{}' does not exist",
                        clause.column
                    )));
                }
                clause.render()
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(parts.join(" AND ")))
    }
}

/// Reference to a column of the row being inserted, for use inside a trigger
pub fn new_row_column(column: &str) -> Result<String, RowPulseError> {
    Ok(format!("NEW.{}", quote_identifier(column)?))
}

/// A literal inlined into trigger DDL, where bound parameters are not available
#[derive(Debug, Clone, PartialEq)]
enum SqlLiteral {
    Text(String),
    Integer(i64),
    Real(f64),
}

impl SqlLiteral {
    fn text(s: &str) -> Self {
        SqlLiteral::Text(s.to_string())
    }

    fn number_or_text(s: &str) -> Self {
        let trimmed = s.trim();
        if let Ok(i) = trimmed.parse::<i64>() {
            return SqlLiteral::Integer(i);
        }
        match trimmed.parse::<f64>() {
            Ok(f) if f.is_finite() => SqlLiteral::Real(f),
            _ => SqlLiteral::Text(s.to_string()),
        }
    }

    fn render(&self) -> Result<String, RowPulseError> {
        match self {
            SqlLiteral::Text(s) => {
                if s.contains('\0') {
                    return Err(RowPulseError::Validation(
                        "Filter values cannot contain NUL bytes".to_string(),
                    ));
                }
                Ok(format!("'{}'", s.replace('\'', "''")))
            }
            SqlLiteral::Integer(i) => Ok(i.to_string()),
            SqlLiteral::Real(f) => Ok(format!("{:?}", f)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_from_pair() {
        assert_eq!(
            FilterClause::from_pair("status__exact", "active").unwrap(),
            FilterClause::new("status", FilterOp::Exact, "active")
        );
        assert_eq!(
            FilterClause::from_pair("status", "active").unwrap(),
            FilterClause::new("status", FilterOp::Exact, "active")
        );
        // Unknown suffix stays part of the column name
        assert_eq!(
            FilterClause::from_pair("odd__name", "x").unwrap(),
            FilterClause::new("odd__name", FilterOp::Exact, "x")
        );
        assert!(FilterClause::from_pair("__gt", "1").is_err());
    }

    #[test]
    fn test_deserialize_both_forms() {
        let pairs: FilterPredicate =
            serde_json::from_str(r#"[["status__exact", "active"], ["n__gt", "3"]]"#).unwrap();
        let objects: FilterPredicate = serde_json::from_str(
            r#"[{"column": "status", "op": "exact", "value": "active"},
                {"column": "n", "op": "gt", "value": "3"}]"#,
        )
        .unwrap();
        assert_eq!(pairs, objects);
        assert_eq!(pairs.clauses().len(), 2);

        let json = serde_json::to_string(&pairs).unwrap();
        let back: FilterPredicate = serde_json::from_str(&json).unwrap();
        assert_eq!(back, pairs);
    }

    #[test]
    fn test_trigger_when_rewrites_columns() {
        let predicate = FilterPredicate::new(vec![
            FilterClause::new("status", FilterOp::Exact, "active"),
            FilterClause::new("score", FilterOp::Gte, "10"),
        ]);
        let when = predicate
            .to_trigger_when(&cols(&["id", "status", "score"]))
            .unwrap()
            .unwrap();
        assert_eq!(when, r#"NEW."status" = 'active' AND NEW."score" >= 10"#);
    }

    #[test]
    fn test_trigger_when_escapes_literals() {
        let predicate = FilterPredicate::new(vec![FilterClause::new(
            "name",
            FilterOp::Exact,
            "x'; DROP TABLE users; --",
        )]);
        let when = predicate.to_trigger_when(&cols(&["name"])).unwrap().unwrap();
        assert_eq!(when, r#"NEW."name" = 'x''; DROP TABLE users; --'"#);
    }

    #[test]
    fn test_trigger_when_rejects_unknown_column() {
        let predicate = FilterPredicate::new(vec![FilterClause::new(
            "\"; DROP TABLE users; --",
            FilterOp::Exact,
            "1",
        )]);
        assert!(matches!(
            predicate.to_trigger_when(&cols(&["id"])),
            Err(RowPulseError::Validation(_))
        ));
    }

    #[test]
    fn test_empty_predicate_has_no_when() {
        assert_eq!(FilterPredicate::default().to_trigger_when(&cols(&["id"])).unwrap(), None);
    }

    #[test]
    fn test_render_operators() {
        let known = cols(&["c"]);
        let render = |op: FilterOp, value: &str| {
            FilterPredicate::new(vec![FilterClause::new("c", op, value)])
                .to_trigger_when(&known)
                .unwrap()
                .unwrap()
        };

        assert_eq!(render(FilterOp::Contains, "ab"), r#"NEW."c" LIKE '%ab%'"#);
        assert_eq!(render(FilterOp::StartsWith, "ab"), r#"NEW."c" LIKE 'ab%'"#);
        assert_eq!(render(FilterOp::Lt, "1.5"), r#"NEW."c" < 1.5"#);
        assert_eq!(render(FilterOp::Gt, "abc"), r#"NEW."c" > 'abc'"#);
        assert_eq!(render(FilterOp::In, "a, b"), r#"NEW."c" IN ('a', 'b')"#);
        assert_eq!(render(FilterOp::NotIn, "[1, \"x\"]"), r#"NEW."c" NOT IN (1, 'x')"#);
        assert_eq!(render(FilterOp::IsNull, ""), r#"NEW."c" IS NULL"#);
        assert_eq!(
            render(FilterOp::NotBlank, ""),
            r#"(NEW."c" IS NOT NULL AND NEW."c" != '')"#
        );
    }

    #[test]
    fn test_in_requires_values() {
        let predicate = FilterPredicate::new(vec![FilterClause::new("c", FilterOp::In, " , ")]);
        assert!(predicate.to_trigger_when(&cols(&["c"])).is_err());
    }
}
