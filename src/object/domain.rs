use super::{FieldValue, ObjectId, ObjectRef, Validity};
use crate::core::{OrmError, Result, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::mem;

/// A typed domain object: identity plus persistent field values.
///
/// Instances are created by the engine (`PersistenceEngine::create` or a
/// load) so every persistent field of the class chain is present from the
/// start; setters reject unknown fields and values of the wrong shape.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainObject {
    class: String,
    id: ObjectId,
    fields: BTreeMap<String, FieldValue>,
    stored: bool,
    validity: Validity,
}

impl DomainObject {
    pub(crate) fn new(
        class: impl Into<String>,
        id: ObjectId,
        fields: BTreeMap<String, FieldValue>,
    ) -> Self {
        Self {
            class: class.into(),
            id,
            fields,
            stored: false,
            validity: Validity::default(),
        }
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn reference(&self) -> ObjectRef {
        ObjectRef::new(self.class.clone(), self.id)
    }

    /// Whether the object was ever persisted.
    pub fn is_stored(&self) -> bool {
        self.stored
    }

    pub(crate) fn set_stored(&mut self, stored: bool) {
        self.stored = stored;
    }

    pub fn validity(&self) -> &Validity {
        &self.validity
    }

    pub fn validity_mut(&mut self) -> &mut Validity {
        &mut self.validity
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&String, &FieldValue)> {
        self.fields.iter()
    }

    pub fn set(&mut self, field: &str, value: impl Into<FieldValue>) -> Result<()> {
        let value = value.into();
        let slot = self
            .fields
            .get_mut(field)
            .ok_or_else(|| OrmError::UnknownField {
                class: self.class.clone(),
                field: field.to_string(),
            })?;
        if mem::discriminant(slot) != mem::discriminant(&value) {
            return Err(OrmError::TypeMismatch(format!(
                "{}.{} cannot hold {:?}",
                self.class, field, value
            )));
        }
        *slot = value;
        Ok(())
    }

    pub fn scalar(&self, field: &str) -> Option<&Value> {
        self.get(field).and_then(FieldValue::as_scalar)
    }

    pub fn set_scalar(&mut self, field: &str, value: impl Into<Value>) -> Result<()> {
        self.set(field, FieldValue::Scalar(value.into()))
    }

    pub fn reference_to(&self, field: &str) -> Option<&ObjectRef> {
        self.get(field).and_then(FieldValue::as_reference)
    }

    pub fn set_reference(&mut self, field: &str, target: Option<ObjectRef>) -> Result<()> {
        self.set(field, FieldValue::Reference(target))
    }

    pub fn list(&self, field: &str) -> Option<&[Value]> {
        match self.get(field) {
            Some(FieldValue::List(values)) => Some(values),
            _ => None,
        }
    }

    pub fn elements(&self, field: &str) -> Option<&BTreeSet<Value>> {
        match self.get(field) {
            Some(FieldValue::Set(values)) => Some(values),
            _ => None,
        }
    }

    pub fn entries(&self, field: &str) -> Option<&BTreeMap<Value, Value>> {
        match self.get(field) {
            Some(FieldValue::Map(entries)) => Some(entries),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn person() -> DomainObject {
        let mut fields = BTreeMap::new();
        fields.insert("name".to_string(), FieldValue::Scalar(Value::Null));
        fields.insert("manager".to_string(), FieldValue::Reference(None));
        DomainObject::new("Person", 1, fields)
    }

    #[test]
    fn test_setters_check_field_and_shape() {
        let mut object = person();
        object.set_scalar("name", "Ada").unwrap();
        assert_eq!(object.scalar("name"), Some(&Value::from("Ada")));

        assert!(matches!(
            object.set_scalar("salary", 10i64),
            Err(OrmError::UnknownField { .. })
        ));
        assert!(matches!(
            object.set_scalar("manager", 2i64),
            Err(OrmError::TypeMismatch(_))
        ));

        object
            .set_reference("manager", Some(ObjectRef::new("Person", 2)))
            .unwrap();
        assert_eq!(object.reference_to("manager").map(|r| r.id), Some(2));
    }
}
