// ============================================================================
// Object Store
// ============================================================================
//
// Lifecycle-scoped registry of live objects keyed by (class family, id),
// with the object record kept beside each stored object as its diff
// baseline. Created with the engine, cleared on shutdown.
//
// ============================================================================

use crate::core::{OrmError, Result};
use crate::object::{ObjectHandle, ObjectId, ObjectRecord, ObjectRef};
use crate::schema::SchemaRegistry;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::debug;

/// Registry key: ids are unique within a class family, so the family's
/// root class stands in for the concrete class.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub family: String,
    pub id: ObjectId,
}

/// A loaded foreign key whose target was not registered at load time.
#[derive(Debug, Clone)]
pub struct UnresolvedReference {
    pub holder: ObjectHandle,
    pub field: String,
    /// Declared target class of the reference field
    pub target_class: String,
    pub target_id: ObjectId,
}

pub struct ObjectStore {
    registry: Arc<SchemaRegistry>,
    objects: RwLock<HashMap<ObjectKey, ObjectHandle>>,
    records: RwLock<HashMap<ObjectKey, ObjectRecord>>,
    unresolved: Mutex<Vec<UnresolvedReference>>,
    next_id: AtomicI64,
}

impl ObjectStore {
    pub fn new(registry: Arc<SchemaRegistry>) -> Self {
        Self {
            registry,
            objects: RwLock::new(HashMap::new()),
            records: RwLock::new(HashMap::new()),
            unresolved: Mutex::new(Vec::new()),
            next_id: AtomicI64::new(1),
        }
    }

    pub fn key(&self, class: &str, id: ObjectId) -> Result<ObjectKey> {
        Ok(ObjectKey {
            family: self.registry.root_of(class)?.name.clone(),
            id,
        })
    }

    pub fn key_of(&self, handle: &ObjectHandle) -> Result<ObjectKey> {
        self.key(handle.class(), handle.id())
    }

    pub fn next_id(&self) -> ObjectId {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Makes sure future ids start above `max_persisted`.
    pub fn seed_ids(&self, max_persisted: ObjectId) {
        self.next_id.fetch_max(max_persisted + 1, Ordering::SeqCst);
    }

    /// Registers a new object together with its record (stored objects)
    /// or without one (unsaved objects).
    pub fn register(&self, handle: &ObjectHandle, record: Option<ObjectRecord>) -> Result<()> {
        let key = self.key_of(handle)?;
        {
            let mut objects = self.objects.write()?;
            if let Some(existing) = objects.get(&key) {
                if !existing.ptr_eq(handle) {
                    return Err(OrmError::Execution(format!(
                        "Object {} is already registered",
                        handle.reference()
                    )));
                }
            }
            objects.insert(key.clone(), handle.clone());
        }
        let mut records = self.records.write()?;
        match record {
            Some(record) => {
                records.insert(key, record);
            }
            None => {
                records.remove(&key);
            }
        }
        Ok(())
    }

    /// Registers a freshly loaded object unless another one with the same
    /// key got there first; returns whichever object is registered.
    pub fn register_loaded(&self, handle: &ObjectHandle, record: ObjectRecord) -> Result<ObjectHandle> {
        let key = self.key_of(handle)?;
        let mut objects = self.objects.write()?;
        if let Some(existing) = objects.get(&key) {
            return Ok(existing.clone());
        }
        objects.insert(key.clone(), handle.clone());
        self.records.write()?.insert(key, record);
        Ok(handle.clone())
    }

    /// Removes the object; returns its record, if it had one.
    pub fn unregister(&self, handle: &ObjectHandle) -> Result<Option<ObjectRecord>> {
        let key = self.key_of(handle)?;
        let removed = self.objects.write()?.remove(&key);
        if removed.is_some() {
            debug!(object = %handle.reference(), "unregistered");
        }
        Ok(self.records.write()?.remove(&key))
    }

    pub fn lookup(&self, class: &str, id: ObjectId) -> Result<Option<ObjectHandle>> {
        let key = self.key(class, id)?;
        Ok(self.objects.read()?.get(&key).cloned())
    }

    pub fn lookup_ref(&self, target: &ObjectRef) -> Result<Option<ObjectHandle>> {
        self.lookup(&target.class, target.id)
    }

    pub fn is_registered(&self, handle: &ObjectHandle) -> Result<bool> {
        let key = self.key_of(handle)?;
        Ok(self
            .objects
            .read()?
            .get(&key)
            .is_some_and(|existing| existing.ptr_eq(handle)))
    }

    pub fn record(&self, handle: &ObjectHandle) -> Result<Option<ObjectRecord>> {
        let key = self.key_of(handle)?;
        Ok(self.records.read()?.get(&key).cloned())
    }

    pub fn set_record(&self, handle: &ObjectHandle, record: ObjectRecord) -> Result<()> {
        let key = self.key_of(handle)?;
        self.records.write()?.insert(key, record);
        Ok(())
    }

    pub fn remove_record(&self, handle: &ObjectHandle) -> Result<Option<ObjectRecord>> {
        let key = self.key_of(handle)?;
        Ok(self.records.write()?.remove(&key))
    }

    /// Registered objects of `class` or any of its subclasses.
    pub fn objects_of(&self, class: &str) -> Result<Vec<ObjectHandle>> {
        let mut found: Vec<ObjectHandle> = self
            .objects
            .read()?
            .values()
            .filter(|handle| self.registry.is_subclass_of(handle.class(), class))
            .cloned()
            .collect();
        found.sort_by_key(ObjectHandle::id);
        Ok(found)
    }

    /// Registered objects of `source` whose reference field `via` points at
    /// `target`.
    pub fn referrers(
        &self,
        target: &ObjectRef,
        source: &str,
        via: &str,
    ) -> Result<Vec<ObjectHandle>> {
        let target_key = self.key(&target.class, target.id)?;
        let mut found = Vec::new();
        for candidate in self.objects_of(source)? {
            let points_here = match candidate.with(|object| object.reference_to(via).cloned())? {
                Some(reference) => self.key(&reference.class, reference.id)? == target_key,
                None => false,
            };
            if points_here {
                found.push(candidate);
            }
        }
        Ok(found)
    }

    /// Reference fields of registered objects pointing at any of `targets`,
    /// as `(holder, field, target)`.
    pub fn references_to(
        &self,
        targets: &HashSet<ObjectKey>,
    ) -> Result<Vec<(ObjectHandle, String, ObjectRef)>> {
        let candidates: Vec<ObjectHandle> = self.objects.read()?.values().cloned().collect();
        let mut found = Vec::new();
        for holder in candidates {
            let references: Vec<(String, ObjectRef)> = holder.with(|object| {
                object
                    .fields()
                    .filter_map(|(field, value)| Some((field.clone(), value.as_reference()?.clone())))
                    .collect()
            })?;
            for (field, target) in references {
                if targets.contains(&self.key(&target.class, target.id)?) {
                    found.push((holder.clone(), field, target));
                }
            }
        }
        found.sort_by_key(|(holder, field, _)| (holder.id(), field.clone()));
        Ok(found)
    }

    pub fn track_unresolved(&self, reference: UnresolvedReference) -> Result<()> {
        self.unresolved.lock()?.push(reference);
        Ok(())
    }

    /// References still waiting for their target, dropping those whose
    /// holder left the store or whose field was set since.
    pub fn unresolved(&self) -> Result<Vec<UnresolvedReference>> {
        let pending = self.unresolved.lock()?.clone();
        let mut live = Vec::new();
        for reference in pending {
            if !self.is_registered(&reference.holder)? {
                continue;
            }
            let still_null = reference
                .holder
                .with(|object| object.reference_to(&reference.field).is_none())?;
            if still_null {
                live.push(reference);
            }
        }
        *self.unresolved.lock()? = live.clone();
        Ok(live)
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.objects.read()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn clear(&self) -> Result<()> {
        self.objects.write()?.clear();
        self.records.write()?.clear();
        self.unresolved.lock()?.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DataType;
    use crate::schema::{ClassDescriptor, FieldDescriptor};

    fn store() -> ObjectStore {
        let registry = SchemaRegistry::builder()
            .class(ClassDescriptor::new("Person").field(FieldDescriptor::reference("boss", "Person")))
            .class(
                ClassDescriptor::new("Employee")
                    .extends("Person")
                    .field(FieldDescriptor::scalar("salary", DataType::Integer)),
            )
            .build()
            .unwrap();
        ObjectStore::new(Arc::new(registry))
    }

    fn create(store: &ObjectStore, class: &str, id: ObjectId) -> ObjectHandle {
        let object = store.registry.instantiate(class, id).unwrap();
        let handle = ObjectHandle::new(object);
        store.register(&handle, None).unwrap();
        handle
    }

    #[test]
    fn test_family_key_finds_subclass_instances() {
        let store = store();
        let employee = create(&store, "Employee", 3);

        let found = store.lookup("Person", 3).unwrap().unwrap();
        assert!(found.ptr_eq(&employee));

        let duplicate = ObjectHandle::new(store.registry.instantiate("Person", 3).unwrap());
        assert!(store.register(&duplicate, None).is_err());
    }

    #[test]
    fn test_record_follows_registration() {
        let store = store();
        let person = create(&store, "Person", 1);
        assert!(store.record(&person).unwrap().is_none());

        store.set_record(&person, ObjectRecord::new()).unwrap();
        assert!(store.record(&person).unwrap().is_some());

        let removed = store.unregister(&person).unwrap();
        assert!(removed.is_some());
        assert!(!store.is_registered(&person).unwrap());
        assert!(store.record(&person).unwrap().is_none());
    }

    #[test]
    fn test_referrers() {
        let store = store();
        let boss = create(&store, "Person", 1);
        let worker = create(&store, "Employee", 2);
        worker
            .update(|o| o.set_reference("boss", Some(boss.reference())))
            .unwrap()
            .unwrap();
        create(&store, "Person", 3);

        let staff = store.referrers(&boss.reference(), "Person", "boss").unwrap();
        assert_eq!(staff.len(), 1);
        assert!(staff[0].ptr_eq(&worker));
    }

    #[test]
    fn test_seed_ids_only_moves_forward() {
        let store = store();
        store.seed_ids(41);
        assert_eq!(store.next_id(), 42);
        store.seed_ids(10);
        assert_eq!(store.next_id(), 43);
    }

    #[test]
    fn test_references_to_matches_family_keys() {
        let store = store();
        let boss = create(&store, "Employee", 1);
        let worker = create(&store, "Person", 2);
        worker
            .update(|o| o.set_reference("boss", Some(ObjectRef::new("Person", 1))))
            .unwrap()
            .unwrap();

        let targets: HashSet<ObjectKey> = [store.key_of(&boss).unwrap()].into_iter().collect();
        let found = store.references_to(&targets).unwrap();
        assert_eq!(found.len(), 1);
        assert!(found[0].0.ptr_eq(&worker));
        assert_eq!(found[0].1, "boss");

        let nobody: HashSet<ObjectKey> = [store.key_of(&worker).unwrap()].into_iter().collect();
        assert!(store.references_to(&nobody).unwrap().is_empty());
    }
}
