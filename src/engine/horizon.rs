use crate::schema::ClassDescriptor;
use crate::sql::Filter;
use std::collections::HashMap;

/// Visibility window for eager loading.
///
/// Objects outside the window are not loaded by `load_visible` or
/// `load_initial`, but are still loaded on demand when a loaded object
/// references them.
pub trait DataHorizon: Send + Sync {
    /// Filter restricting eager loads of `class`; `None` loads everything.
    fn visible(&self, class: &ClassDescriptor) -> Option<Filter>;

    /// Whether `load_initial` loads this class family at all.
    fn eager(&self, _class: &ClassDescriptor) -> bool {
        true
    }
}

/// Everything is visible.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unbounded;

impl DataHorizon for Unbounded {
    fn visible(&self, _class: &ClassDescriptor) -> Option<Filter> {
        None
    }
}

/// Per-class filters; classes without one are fully visible.
#[derive(Debug, Default, Clone)]
pub struct ClassHorizon {
    filters: HashMap<String, Filter>,
    lazy: Vec<String>,
}

impl ClassHorizon {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn window(mut self, class: impl Into<String>, filter: Filter) -> Self {
        self.filters.insert(class.into(), filter);
        self
    }

    /// Excludes a class family from `load_initial`.
    pub fn lazy(mut self, class: impl Into<String>) -> Self {
        self.lazy.push(class.into());
        self
    }
}

impl DataHorizon for ClassHorizon {
    fn visible(&self, class: &ClassDescriptor) -> Option<Filter> {
        self.filters.get(&class.name).cloned()
    }

    fn eager(&self, class: &ClassDescriptor) -> bool {
        !self.lazy.contains(&class.name)
    }
}
