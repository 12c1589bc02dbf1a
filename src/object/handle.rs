use super::{DomainObject, ObjectId, ObjectRef, Validity};
use crate::core::Result;
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Shared handle to one live domain object.
///
/// Clones point at the same object. Field access goes through a short
/// synchronous lock; never hold a guard across an `.await`.
#[derive(Clone)]
pub struct ObjectHandle {
    inner: Arc<ObjectCell>,
}

struct ObjectCell {
    class: String,
    id: ObjectId,
    state: RwLock<DomainObject>,
    /// Serializes save/delete on this object
    op_lock: tokio::sync::Mutex<()>,
}

impl ObjectHandle {
    pub(crate) fn new(object: DomainObject) -> Self {
        Self {
            inner: Arc::new(ObjectCell {
                class: object.class().to_string(),
                id: object.id(),
                state: RwLock::new(object),
                op_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn class(&self) -> &str {
        &self.inner.class
    }

    pub fn id(&self) -> ObjectId {
        self.inner.id
    }

    pub fn reference(&self) -> ObjectRef {
        ObjectRef::new(self.inner.class.clone(), self.inner.id)
    }

    pub fn read(&self) -> Result<RwLockReadGuard<'_, DomainObject>> {
        Ok(self.inner.state.read()?)
    }

    pub fn write(&self) -> Result<RwLockWriteGuard<'_, DomainObject>> {
        Ok(self.inner.state.write()?)
    }

    pub fn with<R>(&self, f: impl FnOnce(&DomainObject) -> R) -> Result<R> {
        Ok(f(&*self.read()?))
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut DomainObject) -> R) -> Result<R> {
        Ok(f(&mut *self.write()?))
    }

    pub fn snapshot(&self) -> Result<DomainObject> {
        self.with(DomainObject::clone)
    }

    pub fn is_stored(&self) -> Result<bool> {
        self.with(DomainObject::is_stored)
    }

    pub fn validity(&self) -> Result<Validity> {
        self.with(|object| object.validity().clone())
    }

    pub fn ptr_eq(&self, other: &ObjectHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn op_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.inner.op_lock
    }
}

impl fmt::Debug for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectHandle({}#{})", self.inner.class, self.inner.id)
    }
}
