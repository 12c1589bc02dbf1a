use crate::core::DataType;
use crate::object::DomainObject;
use std::fmt;
use std::sync::Arc;

pub const ID_COLUMN: &str = "id";
pub const OWNER_COLUMN: &str = "owner_id";
pub const ELEMENT_COLUMN: &str = "element";
pub const KEY_COLUMN: &str = "entry_key";
pub const VALUE_COLUMN: &str = "entry_value";
pub const POSITION_COLUMN: &str = "position";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionKind {
    List,
    Set,
    Map,
}

/// How a field is persisted.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    /// One column of the declaring class's table.
    Scalar(DataType),
    /// Foreign key column `<field>_id` to the target class's table.
    Reference { target: String },
    /// Rows of the entry table `<table>__<field>`. `key` is set for maps.
    MultiValued {
        collection: CollectionKind,
        element: DataType,
        key: Option<DataType>,
    },
    /// Not persisted: the registered objects of `source` whose reference
    /// field `via` points at this object.
    Derived {
        source: String,
        via: String,
        cascade_delete: bool,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldDescriptor {
    pub name: String,
    pub kind: FieldKind,
    pub nullable: bool,
    pub max_length: Option<usize>,
    pub unique: bool,
}

impl FieldDescriptor {
    fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            nullable: true,
            max_length: None,
            unique: false,
        }
    }

    pub fn scalar(name: impl Into<String>, data_type: DataType) -> Self {
        Self::new(name, FieldKind::Scalar(data_type))
    }

    pub fn reference(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(
            name,
            FieldKind::Reference {
                target: target.into(),
            },
        )
    }

    pub fn list(name: impl Into<String>, element: DataType) -> Self {
        Self::multi_valued(name, CollectionKind::List, element, None)
    }

    pub fn set(name: impl Into<String>, element: DataType) -> Self {
        Self::multi_valued(name, CollectionKind::Set, element, None)
    }

    pub fn map(name: impl Into<String>, key: DataType, value: DataType) -> Self {
        Self::multi_valued(name, CollectionKind::Map, value, Some(key))
    }

    fn multi_valued(
        name: impl Into<String>,
        collection: CollectionKind,
        element: DataType,
        key: Option<DataType>,
    ) -> Self {
        Self::new(
            name,
            FieldKind::MultiValued {
                collection,
                element,
                key,
            },
        )
    }

    pub fn derived(
        name: impl Into<String>,
        source: impl Into<String>,
        via: impl Into<String>,
    ) -> Self {
        Self::new(
            name,
            FieldKind::Derived {
                source: source.into(),
                via: via.into(),
                cascade_delete: false,
            },
        )
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn max_length(mut self, max_length: usize) -> Self {
        self.max_length = Some(max_length);
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Derived fields only: deleting the owner deletes every member.
    pub fn cascade(mut self) -> Self {
        if let FieldKind::Derived { cascade_delete, .. } = &mut self.kind {
            *cascade_delete = true;
        }
        self
    }

    pub fn is_persistent(&self) -> bool {
        !matches!(self.kind, FieldKind::Derived { .. })
    }

    /// Column in the declaring class's table, if the field has one.
    pub fn column_name(&self) -> Option<String> {
        match &self.kind {
            FieldKind::Scalar(_) => Some(self.name.clone()),
            FieldKind::Reference { .. } => Some(format!("{}_id", self.name)),
            _ => None,
        }
    }

    pub fn reference_target(&self) -> Option<&str> {
        match &self.kind {
            FieldKind::Reference { target } => Some(target),
            _ => None,
        }
    }

    pub fn collection(&self) -> Option<CollectionKind> {
        match &self.kind {
            FieldKind::MultiValued { collection, .. } => Some(*collection),
            _ => None,
        }
    }
}

/// Initializer run on every freshly instantiated object, after the fields
/// were set to their empty defaults.
pub type Constructor = Arc<dyn Fn(&mut DomainObject) + Send + Sync>;

/// Describes one domain class and the table its own fields live in.
#[derive(Clone)]
pub struct ClassDescriptor {
    pub name: String,
    pub table: String,
    pub superclass: Option<String>,
    pub is_abstract: bool,
    pub fields: Vec<FieldDescriptor>,
    pub constructor: Option<Constructor>,
}

impl ClassDescriptor {
    /// The table defaults to the lowercased class name.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            table: name.to_lowercase(),
            name,
            superclass: None,
            is_abstract: false,
            fields: Vec::new(),
            constructor: None,
        }
    }

    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn extends(mut self, superclass: impl Into<String>) -> Self {
        self.superclass = Some(superclass.into());
        self
    }

    pub fn abstract_class(mut self) -> Self {
        self.is_abstract = true;
        self
    }

    pub fn field(mut self, field: FieldDescriptor) -> Self {
        self.fields.push(field);
        self
    }

    pub fn constructor<F>(mut self, init: F) -> Self
    where
        F: Fn(&mut DomainObject) + Send + Sync + 'static,
    {
        self.constructor = Some(Arc::new(init));
        self
    }

    pub fn own_field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn entry_table(&self, field: &str) -> String {
        format!("{}__{}", self.table, field)
    }

    pub fn is_root(&self) -> bool {
        self.superclass.is_none()
    }
}

impl fmt::Debug for ClassDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassDescriptor")
            .field("name", &self.name)
            .field("table", &self.table)
            .field("superclass", &self.superclass)
            .field("is_abstract", &self.is_abstract)
            .field("fields", &self.fields)
            .field("constructor", &self.constructor.is_some())
            .finish()
    }
}
