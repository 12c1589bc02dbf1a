use super::{ClassDescriptor, FieldDescriptor, FieldKind, ID_COLUMN};
use crate::core::{OrmError, Result};
use crate::object::{DomainObject, FieldValue, ObjectId};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// Compiled view of every domain class.
///
/// Built once at startup; answers field, chain and subclass questions
/// without re-inspecting descriptors.
#[derive(Debug)]
pub struct SchemaRegistry {
    classes: HashMap<String, CompiledClass>,
    /// Declaration order, for deterministic iteration
    order: Vec<String>,
    purposes: Vec<String>,
}

#[derive(Debug)]
struct CompiledClass {
    descriptor: ClassDescriptor,
    /// Root first, this class last
    chain: Vec<String>,
    /// Every strict descendant
    subclasses: BTreeSet<String>,
}

#[derive(Default)]
pub struct RegistryBuilder {
    classes: Vec<ClassDescriptor>,
    purposes: Vec<String>,
}

impl RegistryBuilder {
    pub fn class(mut self, class: ClassDescriptor) -> Self {
        self.classes.push(class);
        self
    }

    /// Declares an exclusive-allocation purpose; each gets a shadow table.
    pub fn allocation_purpose(mut self, purpose: impl Into<String>) -> Self {
        self.purposes.push(purpose.into());
        self
    }

    pub fn build(self) -> Result<SchemaRegistry> {
        let mut descriptors: HashMap<String, ClassDescriptor> = HashMap::new();
        let mut order = Vec::new();
        let mut tables = HashSet::new();
        for class in self.classes {
            if descriptors.contains_key(&class.name) {
                return Err(OrmError::Configuration(format!(
                    "Class '{}' declared twice",
                    class.name
                )));
            }
            if !tables.insert(class.table.clone()) {
                return Err(OrmError::Configuration(format!(
                    "Table '{}' is mapped by more than one class",
                    class.table
                )));
            }
            order.push(class.name.clone());
            descriptors.insert(class.name.clone(), class);
        }

        let mut chains: HashMap<String, Vec<String>> = HashMap::new();
        for name in &order {
            chains.insert(name.clone(), ancestor_chain(&descriptors, name)?);
        }

        let mut subclasses: HashMap<String, BTreeSet<String>> = HashMap::new();
        for (name, chain) in &chains {
            for ancestor in chain.iter().filter(|a| *a != name) {
                subclasses
                    .entry(ancestor.clone())
                    .or_default()
                    .insert(name.clone());
            }
        }

        let mut classes = HashMap::new();
        for name in &order {
            let descriptor = descriptors
                .get(name)
                .cloned()
                .ok_or_else(|| OrmError::UnknownClass(name.clone()))?;
            let chain = chains.get(name).cloned().unwrap_or_default();
            classes.insert(
                name.clone(),
                CompiledClass {
                    descriptor,
                    chain,
                    subclasses: subclasses.remove(name).unwrap_or_default(),
                },
            );
        }

        let registry = SchemaRegistry {
            classes,
            order,
            purposes: self.purposes,
        };
        registry.validate()?;
        Ok(registry)
    }
}

fn ancestor_chain(
    descriptors: &HashMap<String, ClassDescriptor>,
    name: &str,
) -> Result<Vec<String>> {
    let mut chain = vec![name.to_string()];
    let mut current = descriptors
        .get(name)
        .ok_or_else(|| OrmError::UnknownClass(name.to_string()))?;
    while let Some(parent) = &current.superclass {
        if chain.contains(parent) {
            return Err(OrmError::Configuration(format!(
                "Inheritance cycle through class '{}'",
                parent
            )));
        }
        current = descriptors.get(parent).ok_or_else(|| {
            OrmError::Configuration(format!(
                "Class '{}' extends unknown class '{}'",
                current.name, parent
            ))
        })?;
        chain.push(parent.clone());
    }
    chain.reverse();
    Ok(chain)
}

impl SchemaRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    fn compiled(&self, name: &str) -> Result<&CompiledClass> {
        self.classes
            .get(name)
            .ok_or_else(|| OrmError::UnknownClass(name.to_string()))
    }

    fn validate(&self) -> Result<()> {
        for name in &self.order {
            let mut seen = HashSet::new();
            for (class, field) in self.fields(name)? {
                if field.name == ID_COLUMN || !seen.insert(field.name.as_str()) {
                    return Err(OrmError::Configuration(format!(
                        "Field '{}' of class '{}' clashes with another field or the id column",
                        field.name, class.name
                    )));
                }
                match &field.kind {
                    FieldKind::Reference { target } => {
                        self.compiled(target).map_err(|_| {
                            OrmError::Configuration(format!(
                                "{}.{} references unknown class '{}'",
                                class.name, field.name, target
                            ))
                        })?;
                    }
                    FieldKind::Derived { source, via, .. } => {
                        let (_, via_field) = self.field(source, via).map_err(|_| {
                            OrmError::Configuration(format!(
                                "{}.{} is derived from unknown field {}.{}",
                                class.name, field.name, source, via
                            ))
                        })?;
                        let points_here = via_field
                            .reference_target()
                            .is_some_and(|target| self.is_subclass_of(&class.name, target));
                        if !points_here {
                            return Err(OrmError::Configuration(format!(
                                "{}.{} must be a reference to '{}'",
                                source, via, class.name
                            )));
                        }
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    pub fn class(&self, name: &str) -> Result<&ClassDescriptor> {
        Ok(&self.compiled(name)?.descriptor)
    }

    /// Every class, in declaration order.
    pub fn classes(&self) -> impl Iterator<Item = &ClassDescriptor> {
        self.order
            .iter()
            .filter_map(|name| self.classes.get(name).map(|c| &c.descriptor))
    }

    pub fn allocation_purposes(&self) -> &[String] {
        &self.purposes
    }

    /// Ancestor chain, root first.
    pub fn chain(&self, name: &str) -> Result<Vec<&ClassDescriptor>> {
        self.compiled(name)?
            .chain
            .iter()
            .map(|class| self.class(class))
            .collect()
    }

    pub fn root_of(&self, name: &str) -> Result<&ClassDescriptor> {
        let compiled = self.compiled(name)?;
        match compiled.chain.first() {
            Some(root) => self.class(root),
            None => Ok(&compiled.descriptor),
        }
    }

    /// Reflexive: every class is a subclass of itself.
    pub fn is_subclass_of(&self, name: &str, ancestor: &str) -> bool {
        self.classes
            .get(name)
            .is_some_and(|c| c.chain.iter().any(|a| a == ancestor))
    }

    pub fn has_subclasses(&self, name: &str) -> bool {
        self.classes
            .get(name)
            .is_some_and(|c| !c.subclasses.is_empty())
    }

    pub fn subclasses(&self, name: &str) -> Result<&BTreeSet<String>> {
        Ok(&self.compiled(name)?.subclasses)
    }

    /// Class named by a stored discriminator; must be instantiable.
    pub fn resolve_concrete(&self, name: &str) -> Result<&ClassDescriptor> {
        let class = self.class(name)?;
        if class.is_abstract {
            return Err(OrmError::Configuration(format!(
                "Class '{}' is abstract and cannot be instantiated",
                name
            )));
        }
        Ok(class)
    }

    /// All fields of the chain with their declaring class, root first.
    pub fn fields(&self, name: &str) -> Result<Vec<(&ClassDescriptor, &FieldDescriptor)>> {
        Ok(self
            .chain(name)?
            .into_iter()
            .flat_map(|class| class.fields.iter().map(move |field| (class, field)))
            .collect())
    }

    /// A field anywhere in the chain, with its declaring class.
    pub fn field(&self, class: &str, field: &str) -> Result<(&ClassDescriptor, &FieldDescriptor)> {
        for declaring in self.chain(class)?.into_iter().rev() {
            if let Some(descriptor) = declaring.own_field(field) {
                return Ok((declaring, descriptor));
            }
        }
        Err(OrmError::UnknownField {
            class: class.to_string(),
            field: field.to_string(),
        })
    }

    /// Builds a new object of `name`: empty defaults, then every
    /// constructor of the chain from root to leaf.
    pub fn instantiate(&self, name: &str, id: ObjectId) -> Result<DomainObject> {
        let class = self.resolve_concrete(name)?;
        let chain = self.chain(name)?;

        let mut fields = BTreeMap::new();
        for declaring in &chain {
            for field in &declaring.fields {
                if let Some(value) = FieldValue::default_for(&field.kind) {
                    fields.insert(field.name.clone(), value);
                }
            }
        }

        let mut object = DomainObject::new(class.name.clone(), id, fields);
        for declaring in &chain {
            if let Some(init) = &declaring.constructor {
                init(&mut object);
            }
        }
        Ok(object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{DataType, Value};

    fn registry() -> SchemaRegistry {
        SchemaRegistry::builder()
            .class(
                ClassDescriptor::new("Party")
                    .abstract_class()
                    .field(FieldDescriptor::scalar("name", DataType::Text)),
            )
            .class(
                ClassDescriptor::new("Person")
                    .extends("Party")
                    .field(FieldDescriptor::reference("employer", "Company"))
                    .constructor(|object| {
                        let _ = object.set_scalar("name", "unnamed");
                    }),
            )
            .class(
                ClassDescriptor::new("Company")
                    .extends("Party")
                    .field(FieldDescriptor::derived("staff", "Person", "employer").cascade()),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn test_chain_and_subclasses() {
        let registry = registry();
        let chain: Vec<&str> = registry
            .chain("Person")
            .unwrap()
            .iter()
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(chain, ["Party", "Person"]);
        assert_eq!(registry.root_of("Company").unwrap().name, "Party");
        assert!(registry.is_subclass_of("Person", "Party"));
        assert!(!registry.is_subclass_of("Party", "Person"));
        assert!(registry.has_subclasses("Party"));
        assert!(!registry.has_subclasses("Person"));
    }

    #[test]
    fn test_instantiate_runs_constructors() {
        let registry = registry();
        let person = registry.instantiate("Person", 4).unwrap();
        assert_eq!(person.scalar("name"), Some(&Value::from("unnamed")));
        assert_eq!(person.get("employer"), Some(&FieldValue::Reference(None)));

        assert!(registry.instantiate("Party", 5).is_err());
        assert!(registry.resolve_concrete("Party").is_err());
    }

    #[test]
    fn test_field_lookup_walks_chain() {
        let registry = registry();
        let (declaring, field) = registry.field("Person", "name").unwrap();
        assert_eq!(declaring.name, "Party");
        assert_eq!(field.column_name().as_deref(), Some("name"));
        assert!(matches!(
            registry.field("Person", "salary"),
            Err(OrmError::UnknownField { .. })
        ));
    }

    #[test]
    fn test_build_rejects_bad_metadata() {
        let unknown_parent = SchemaRegistry::builder()
            .class(ClassDescriptor::new("A").extends("Missing"))
            .build();
        assert!(matches!(unknown_parent, Err(OrmError::Configuration(_))));

        let cycle = SchemaRegistry::builder()
            .class(ClassDescriptor::new("A").extends("B"))
            .class(ClassDescriptor::new("B").extends("A"))
            .build();
        assert!(matches!(cycle, Err(OrmError::Configuration(_))));

        let bad_target = SchemaRegistry::builder()
            .class(ClassDescriptor::new("A").field(FieldDescriptor::reference("b", "Nope")))
            .build();
        assert!(matches!(bad_target, Err(OrmError::Configuration(_))));

        let id_field = SchemaRegistry::builder()
            .class(ClassDescriptor::new("A").field(FieldDescriptor::scalar("id", DataType::Integer)))
            .build();
        assert!(id_field.is_err());
    }
}
