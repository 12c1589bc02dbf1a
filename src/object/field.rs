use super::ObjectId;
use crate::core::Value;
use crate::schema::{CollectionKind, FieldKind};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Identity of a domain object: its concrete class and id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectRef {
    pub class: String,
    pub id: ObjectId,
}

impl ObjectRef {
    pub fn new(class: impl Into<String>, id: ObjectId) -> Self {
        Self {
            class: class.into(),
            id,
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.class, self.id)
    }
}

/// Live value of one persistent field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Scalar(Value),
    Reference(Option<ObjectRef>),
    List(Vec<Value>),
    Set(BTreeSet<Value>),
    Map(BTreeMap<Value, Value>),
}

impl FieldValue {
    /// Empty value for a freshly instantiated object; `None` for derived fields.
    pub fn default_for(kind: &FieldKind) -> Option<Self> {
        match kind {
            FieldKind::Scalar(_) => Some(Self::Scalar(Value::Null)),
            FieldKind::Reference { .. } => Some(Self::Reference(None)),
            FieldKind::MultiValued { collection, .. } => Some(match collection {
                CollectionKind::List => Self::List(Vec::new()),
                CollectionKind::Set => Self::Set(BTreeSet::new()),
                CollectionKind::Map => Self::Map(BTreeMap::new()),
            }),
            FieldKind::Derived { .. } => None,
        }
    }

    /// Whether a value of this shape may be stored in a field of `kind`.
    pub fn fits(&self, kind: &FieldKind) -> bool {
        matches!(
            (self, kind),
            (Self::Scalar(_), FieldKind::Scalar(_))
                | (Self::Reference(_), FieldKind::Reference { .. })
                | (
                    Self::List(_),
                    FieldKind::MultiValued {
                        collection: CollectionKind::List,
                        ..
                    }
                )
                | (
                    Self::Set(_),
                    FieldKind::MultiValued {
                        collection: CollectionKind::Set,
                        ..
                    }
                )
                | (
                    Self::Map(_),
                    FieldKind::MultiValued {
                        collection: CollectionKind::Map,
                        ..
                    }
                )
        )
    }

    pub fn as_scalar(&self) -> Option<&Value> {
        match self {
            Self::Scalar(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_reference(&self) -> Option<&ObjectRef> {
        match self {
            Self::Reference(target) => target.as_ref(),
            _ => None,
        }
    }

    /// Column value of a scalar or reference field.
    pub fn column_value(&self) -> Option<Value> {
        match self {
            Self::Scalar(value) => Some(value.clone()),
            Self::Reference(target) => Some(
                target
                    .as_ref()
                    .map_or(Value::Null, |target| Value::Integer(target.id)),
            ),
            _ => None,
        }
    }
}

impl From<Value> for FieldValue {
    fn from(value: Value) -> Self {
        Self::Scalar(value)
    }
}

impl From<ObjectRef> for FieldValue {
    fn from(target: ObjectRef) -> Self {
        Self::Reference(Some(target))
    }
}

impl From<Vec<Value>> for FieldValue {
    fn from(values: Vec<Value>) -> Self {
        Self::List(values)
    }
}

impl From<BTreeSet<Value>> for FieldValue {
    fn from(values: BTreeSet<Value>) -> Self {
        Self::Set(values)
    }
}

impl From<BTreeMap<Value, Value>> for FieldValue {
    fn from(entries: BTreeMap<Value, Value>) -> Self {
        Self::Map(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DataType;

    #[test]
    fn test_reference_column_value() {
        let target = FieldValue::from(ObjectRef::new("Person", 7));
        assert_eq!(target.column_value(), Some(Value::Integer(7)));
        assert_eq!(FieldValue::Reference(None).column_value(), Some(Value::Null));
        assert_eq!(FieldValue::List(vec![]).column_value(), None);
    }

    #[test]
    fn test_fits_kind() {
        let list = FieldKind::MultiValued {
            collection: CollectionKind::List,
            element: DataType::Text,
            key: None,
        };
        assert!(FieldValue::List(vec![]).fits(&list));
        assert!(!FieldValue::Set(BTreeSet::new()).fits(&list));
        assert!(FieldValue::Scalar(Value::Null).fits(&FieldKind::Scalar(DataType::Integer)));
    }
}
