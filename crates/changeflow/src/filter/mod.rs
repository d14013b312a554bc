//! List filters.
//!
//! A filter is a conjunction of comparisons written in the expression
//! language: `variable op literal`, joined by `&&`. Supported operators are
//! `==`, `>=`, `<=` and `in` (with a list of strings). Each list operation
//! maps the terms onto its store finder.

pub mod grant;
pub mod issue;
pub mod plan;

pub use grant::apply_grant_filter;
pub use issue::apply_issue_filter;
pub use plan::apply_plan_filter;

use changeflow_db::Store;
use changeflow_ids::{UserName, UserRef};
use changeflow_protocol::{ApiError, ApiResult, ErrorContext};
use changeflow_security::cel::{self, BinaryOp, Expr, Value};
use chrono::{DateTime, Utc};
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    String(String),
    Bool(bool),
    Int(i64),
    List(Vec<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FilterTerm {
    pub variable: String,
    pub op: BinaryOp,
    pub value: FilterValue,
}

fn invalid(filter: &str, reason: impl std::fmt::Display) -> ApiError {
    ApiError::invalid_argument(format!("invalid filter {:?}: {}", filter, reason))
}

fn literal(filter: &str, expr: &Expr) -> ApiResult<FilterValue> {
    match expr {
        Expr::Literal(Value::String(s)) => Ok(FilterValue::String(s.clone())),
        Expr::Literal(Value::Bool(b)) => Ok(FilterValue::Bool(*b)),
        Expr::Literal(Value::Int(i)) => Ok(FilterValue::Int(*i)),
        Expr::List(items) => {
            let mut values = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Expr::Literal(Value::String(s)) => values.push(s.clone()),
                    _ => return Err(invalid(filter, "list items must be strings")),
                }
            }
            Ok(FilterValue::List(values))
        }
        _ => Err(invalid(filter, "right-hand side must be a literal")),
    }
}

/// Splits `filter` into terms. An empty filter has no terms.
pub fn parse_filter(filter: &str) -> ApiResult<Vec<FilterTerm>> {
    if filter.trim().is_empty() {
        return Ok(Vec::new());
    }
    let expr = cel::parse(filter).map_err(|e| invalid(filter, e))?;
    let mut terms = Vec::new();
    for conjunct in expr.conjuncts() {
        let Expr::Binary(op, lhs, rhs) = conjunct else {
            return Err(invalid(filter, "expect comparisons joined by &&"));
        };
        if !matches!(op, BinaryOp::Eq | BinaryOp::Ge | BinaryOp::Le | BinaryOp::In) {
            return Err(invalid(
                filter,
                format!("unsupported operator {}", op.as_str()),
            ));
        }
        let variable = lhs
            .ident_path()
            .ok_or_else(|| invalid(filter, "left-hand side must be a variable"))?;
        terms.push(FilterTerm {
            variable,
            op: *op,
            value: literal(filter, rhs)?,
        });
    }
    Ok(terms)
}

impl FilterTerm {
    fn unsupported_op(&self) -> ApiError {
        ApiError::invalid_argument(format!(
            "unsupported operator {} for {}",
            self.op.as_str(),
            self.variable
        ))
    }

    fn expect_op(&self, ops: &[BinaryOp]) -> ApiResult<()> {
        if ops.contains(&self.op) {
            Ok(())
        } else {
            Err(self.unsupported_op())
        }
    }

    pub fn string(&self) -> ApiResult<&str> {
        self.expect_op(&[BinaryOp::Eq])?;
        match &self.value {
            FilterValue::String(s) => Ok(s),
            _ => Err(ApiError::invalid_argument(format!(
                "{} expects a string value",
                self.variable
            ))),
        }
    }

    pub fn bool(&self) -> ApiResult<bool> {
        self.expect_op(&[BinaryOp::Eq])?;
        match &self.value {
            FilterValue::Bool(b) => Ok(*b),
            _ => Err(ApiError::invalid_argument(format!(
                "{} expects a bool value",
                self.variable
            ))),
        }
    }

    /// `==` with one string or `in` with a non-empty list.
    pub fn strings(&self) -> ApiResult<Vec<String>> {
        match (&self.op, &self.value) {
            (BinaryOp::Eq, FilterValue::String(s)) => Ok(vec![s.clone()]),
            (BinaryOp::In, FilterValue::List(items)) if items.is_empty() => Err(
                ApiError::invalid_argument(format!("empty list value for {}", self.variable)),
            ),
            (BinaryOp::In, FilterValue::List(items)) => Ok(items.clone()),
            (BinaryOp::Eq | BinaryOp::In, _) => Err(ApiError::invalid_argument(format!(
                "invalid value for {}",
                self.variable
            ))),
            _ => Err(self.unsupported_op()),
        }
    }

    /// Parses every value with `FromStr`, e.g. enum names.
    pub fn parsed<T: FromStr>(&self) -> ApiResult<Vec<T>>
    where
        T::Err: std::fmt::Display,
    {
        self.strings()?
            .iter()
            .map(|s| {
                s.parse::<T>().map_err(|e| {
                    ApiError::invalid_argument(format!("invalid {} {:?}: {}", self.variable, s, e))
                })
            })
            .collect()
    }

    /// An RFC 3339 bound; only `>=` and `<=` apply.
    pub fn timestamp(&self) -> ApiResult<DateTime<Utc>> {
        self.expect_op(&[BinaryOp::Ge, BinaryOp::Le])?;
        let FilterValue::String(raw) = &self.value else {
            return Err(ApiError::invalid_argument(format!(
                "{} expects an RFC 3339 timestamp",
                self.variable
            )));
        };
        DateTime::parse_from_rfc3339(raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| {
                ApiError::invalid_argument(format!("invalid {} {:?}: {}", self.variable, raw, e))
            })
    }

    pub fn unknown(&self) -> ApiError {
        ApiError::invalid_argument(format!("unsupported filter variable {:?}", self.variable))
    }
}

/// Resolves `users/{email-or-uid}` to the email of an existing user.
pub async fn resolve_user_email(store: &Store, name: &str) -> ApiResult<String> {
    let user = match UserName::parse(name)?.user {
        UserRef::Email(email) => store
            .get_user_by_email(&email)
            .await
            .internal_context("get user")?,
        UserRef::Uid(uid) => store.get_user(uid).await.internal_context("get user")?,
    };
    user.map(|u| u.email)
        .ok_or_else(|| ApiError::not_found(format!("user {:?} not found", name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use changeflow_protocol::{Code, IssueStatus};

    #[test]
    fn test_parse_conjunction() {
        let terms = parse_filter(
            r#"status in ["OPEN", "DONE"] && has_pipeline == true && create_time >= "2024-01-01T00:00:00Z""#,
        )
        .unwrap();
        assert_eq!(terms.len(), 3);
        assert_eq!(terms[0].variable, "status");
        assert_eq!(
            terms[0].parsed::<IssueStatus>().unwrap(),
            vec![IssueStatus::Open, IssueStatus::Done]
        );
        assert!(terms[1].bool().unwrap());
        assert_eq!(
            terms[2].timestamp().unwrap().to_rfc3339(),
            "2024-01-01T00:00:00+00:00"
        );
    }

    #[test]
    fn test_empty_filter_has_no_terms() {
        assert!(parse_filter("   ").unwrap().is_empty());
    }

    #[test]
    fn test_rejections() {
        for bad in [
            r#"status == "OPEN" || status == "DONE""#,
            r#"status != "OPEN""#,
            r#""OPEN" == status"#,
            r#"status == other"#,
            r#"status == "#,
        ] {
            assert_eq!(parse_filter(bad).unwrap_err().code, Code::InvalidArgument, "{}", bad);
        }

        let terms = parse_filter(r#"labels in [] && create_time == "2024-01-01T00:00:00Z""#).unwrap();
        assert_eq!(terms[0].strings().unwrap_err().code, Code::InvalidArgument);
        assert_eq!(terms[1].timestamp().unwrap_err().code, Code::InvalidArgument);

        let terms = parse_filter(r#"status == "ARCHIVED""#).unwrap();
        assert_eq!(
            terms[0].parsed::<IssueStatus>().unwrap_err().code,
            Code::InvalidArgument
        );
    }
}
