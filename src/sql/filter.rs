use crate::core::{Result, Value};
use std::cmp::Ordering;
use std::fmt;

/// Column reference, optionally qualified with its table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ColumnRef {
    pub table: Option<String>,
    pub column: String,
}

impl ColumnRef {
    pub fn bare(column: impl Into<String>) -> Self {
        Self {
            table: None,
            column: column.into(),
        }
    }

    pub fn qualified(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            table: Some(table.into()),
            column: column.into(),
        }
    }
}

impl From<&str> for ColumnRef {
    /// `"table.column"` is qualified, anything else is bare.
    fn from(name: &str) -> Self {
        match name.split_once('.') {
            Some((table, column)) => Self::qualified(table, column),
            None => Self::bare(name),
        }
    }
}

impl From<String> for ColumnRef {
    fn from(name: String) -> Self {
        Self::from(name.as_str())
    }
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.table {
            Some(table) => write!(f, "{}.{}", table, self.column),
            None => write!(f, "{}", self.column),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

impl CompareOp {
    fn holds(&self, ordering: Ordering) -> bool {
        match self {
            Self::Eq => ordering == Ordering::Equal,
            Self::NotEq => ordering != Ordering::Equal,
            Self::Lt => ordering == Ordering::Less,
            Self::LtEq => ordering != Ordering::Greater,
            Self::Gt => ordering == Ordering::Greater,
            Self::GtEq => ordering != Ordering::Less,
        }
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            Self::Eq => "=",
            Self::NotEq => "<>",
            Self::Lt => "<",
            Self::LtEq => "<=",
            Self::Gt => ">",
            Self::GtEq => ">=",
        };
        write!(f, "{symbol}")
    }
}

/// Typed WHERE clause.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Compare {
        column: ColumnRef,
        op: CompareOp,
        value: Value,
    },
    In {
        column: ColumnRef,
        values: Vec<Value>,
    },
    IsNull(ColumnRef),
    IsNotNull(ColumnRef),
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    pub fn compare(column: impl Into<ColumnRef>, op: CompareOp, value: impl Into<Value>) -> Self {
        Self::Compare {
            column: column.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(column: impl Into<ColumnRef>, value: impl Into<Value>) -> Self {
        Self::compare(column, CompareOp::Eq, value)
    }

    pub fn gt(column: impl Into<ColumnRef>, value: impl Into<Value>) -> Self {
        Self::compare(column, CompareOp::Gt, value)
    }

    pub fn gte(column: impl Into<ColumnRef>, value: impl Into<Value>) -> Self {
        Self::compare(column, CompareOp::GtEq, value)
    }

    pub fn lt(column: impl Into<ColumnRef>, value: impl Into<Value>) -> Self {
        Self::compare(column, CompareOp::Lt, value)
    }

    pub fn in_list(column: impl Into<ColumnRef>, values: Vec<Value>) -> Self {
        Self::In {
            column: column.into(),
            values,
        }
    }

    pub fn is_null(column: impl Into<ColumnRef>) -> Self {
        Self::IsNull(column.into())
    }

    pub fn is_not_null(column: impl Into<ColumnRef>) -> Self {
        Self::IsNotNull(column.into())
    }

    pub fn and(self, other: Filter) -> Self {
        match self {
            Self::And(mut parts) => {
                parts.push(other);
                Self::And(parts)
            }
            first => Self::And(vec![first, other]),
        }
    }

    pub fn or(self, other: Filter) -> Self {
        match self {
            Self::Or(mut parts) => {
                parts.push(other);
                Self::Or(parts)
            }
            first => Self::Or(vec![first, other]),
        }
    }

    pub fn negate(self) -> Self {
        Self::Not(Box::new(self))
    }

    /// `IN` over `values`, split so no list exceeds `max` entries.
    pub fn in_chunks(column: &ColumnRef, values: &[Value], max: usize) -> Vec<Filter> {
        values
            .chunks(max.max(1))
            .map(|chunk| Self::in_list(column.clone(), chunk.to_vec()))
            .collect()
    }

    /// SQL three-valued evaluation; `None` is UNKNOWN.
    pub fn evaluate<F>(&self, lookup: &F) -> Result<Option<bool>>
    where
        F: Fn(&ColumnRef) -> Result<Value>,
    {
        match self {
            Self::Compare { column, op, value } => {
                let current = lookup(column)?;
                if current.is_null() || value.is_null() {
                    return Ok(None);
                }
                Ok(Some(op.holds(current.cmp(value))))
            }
            Self::In { column, values } => {
                let current = lookup(column)?;
                if current.is_null() {
                    return Ok(None);
                }
                if values.iter().any(|v| !v.is_null() && *v == current) {
                    return Ok(Some(true));
                }
                // NULL in the list makes a miss UNKNOWN rather than FALSE
                if values.iter().any(Value::is_null) {
                    Ok(None)
                } else {
                    Ok(Some(false))
                }
            }
            Self::IsNull(column) => Ok(Some(lookup(column)?.is_null())),
            Self::IsNotNull(column) => Ok(Some(!lookup(column)?.is_null())),
            Self::And(parts) => {
                let mut unknown = false;
                for part in parts {
                    match part.evaluate(lookup)? {
                        Some(false) => return Ok(Some(false)),
                        None => unknown = true,
                        Some(true) => {}
                    }
                }
                Ok(if unknown { None } else { Some(true) })
            }
            Self::Or(parts) => {
                let mut unknown = false;
                for part in parts {
                    match part.evaluate(lookup)? {
                        Some(true) => return Ok(Some(true)),
                        None => unknown = true,
                        Some(false) => {}
                    }
                }
                Ok(if unknown { None } else { Some(false) })
            }
            Self::Not(inner) => Ok(inner.evaluate(lookup)?.map(|b| !b)),
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Compare { column, op, value } => {
                write!(f, "{} {} {}", column, op, value.sql_literal())
            }
            Self::In { column, values } if values.is_empty() => {
                write!(f, "1 = 0 /* empty IN on {} */", column)
            }
            Self::In { column, values } => {
                let list: Vec<String> = values.iter().map(Value::sql_literal).collect();
                write!(f, "{} IN ({})", column, list.join(", "))
            }
            Self::IsNull(column) => write!(f, "{} IS NULL", column),
            Self::IsNotNull(column) => write!(f, "{} IS NOT NULL", column),
            Self::And(parts) => write_joined(f, parts, " AND "),
            Self::Or(parts) => write_joined(f, parts, " OR "),
            Self::Not(inner) => write!(f, "NOT ({})", inner),
        }
    }
}

fn write_joined(f: &mut fmt::Formatter<'_>, parts: &[Filter], sep: &str) -> fmt::Result {
    let rendered: Vec<String> = parts.iter().map(|p| format!("({})", p)).collect();
    write!(f, "{}", rendered.join(sep))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::OrmError;

    fn lookup_from<'a>(pairs: &'a [(&'a str, Value)]) -> impl Fn(&ColumnRef) -> Result<Value> + 'a {
        move |col: &ColumnRef| {
            pairs
                .iter()
                .find(|(name, _)| *name == col.column)
                .map(|(_, v)| v.clone())
                .ok_or_else(|| OrmError::ColumnNotFound(col.column.clone(), "t".into()))
        }
    }

    #[test]
    fn test_in_list_cannot_match_null() {
        let row = [("element", Value::Null)];
        let lookup = lookup_from(&row);
        let filter = Filter::in_list("element", vec![Value::Null, Value::from("a")]);
        assert_eq!(filter.evaluate(&lookup).unwrap(), None);

        let null_branch = Filter::is_null("element");
        assert_eq!(null_branch.evaluate(&lookup).unwrap(), Some(true));
    }

    #[test]
    fn test_and_or_three_valued() {
        let row = [("a", Value::Integer(1)), ("b", Value::Null)];
        let lookup = lookup_from(&row);

        let and = Filter::eq("a", 1i64).and(Filter::eq("b", 2i64));
        assert_eq!(and.evaluate(&lookup).unwrap(), None);

        let or = Filter::eq("a", 1i64).or(Filter::eq("b", 2i64));
        assert_eq!(or.evaluate(&lookup).unwrap(), Some(true));
    }

    #[test]
    fn test_in_chunks_respects_limit() {
        let values: Vec<Value> = (0..7).map(Value::Integer).collect();
        let chunks = Filter::in_chunks(&ColumnRef::bare("id"), &values, 3);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].to_string(), "id IN (6)");
    }

    #[test]
    fn test_display_renders_sql() {
        let filter = Filter::eq("person.name", "O'Hara").and(Filter::is_not_null("person.age"));
        assert_eq!(
            filter.to_string(),
            "(person.name = 'O''Hara') AND (person.age IS NOT NULL)"
        );
    }
}
