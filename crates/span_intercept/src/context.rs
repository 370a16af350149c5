use std::any::{Any, TypeId};
use std::collections::HashMap;

/// How the intercepted call completes.
///
/// Decided by whoever installs the chain (for example, whether a completion
/// callback was passed) and stored in the [`InvocationContext`] before the
/// chain runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallShape {
    /// The outcome is known when the call returns.
    #[default]
    Sync,
    /// The outcome arrives later through the call's completion callback.
    Async,
}

/// Per-call values shared by the stages of a chain, keyed by type.
///
/// Holds at most one value per type, so stages store private wrapper types.
/// Created fresh for each call and dropped when the chain completes.
#[derive(Default)]
pub struct InvocationContext {
    values: HashMap<TypeId, Box<dyn Any + Send>>,
}

impl InvocationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_shape(shape: CallShape) -> Self {
        let mut ctx = Self::new();
        ctx.insert(shape);
        ctx
    }

    /// The call shape; [`CallShape::Sync`] unless set.
    pub fn shape(&self) -> CallShape {
        self.get::<CallShape>().copied().unwrap_or_default()
    }

    /// Stores `value`, returning the previous value of the same type.
    pub fn insert<V: Any + Send>(&mut self, value: V) -> Option<V> {
        self.values
            .insert(TypeId::of::<V>(), Box::new(value))
            .and_then(|old| old.downcast::<V>().ok())
            .map(|old| *old)
    }

    pub fn get<V: Any + Send>(&self) -> Option<&V> {
        self.values.get(&TypeId::of::<V>()).and_then(|v| v.downcast_ref::<V>())
    }

    pub fn get_mut<V: Any + Send>(&mut self) -> Option<&mut V> {
        self.values
            .get_mut(&TypeId::of::<V>())
            .and_then(|v| v.downcast_mut::<V>())
    }

    pub fn remove<V: Any + Send>(&mut self) -> Option<V> {
        self.values
            .remove(&TypeId::of::<V>())
            .and_then(|v| v.downcast::<V>().ok())
            .map(|v| *v)
    }

    pub fn contains<V: Any + Send>(&self) -> bool {
        self.values.contains_key(&TypeId::of::<V>())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl std::fmt::Debug for InvocationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvocationContext")
            .field("shape", &self.shape())
            .field("values", &self.values.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Marker(u32);

    #[test]
    fn test_values_keyed_by_type() {
        let mut ctx = InvocationContext::new();
        assert_eq!(ctx.insert(Marker(1)), None);
        ctx.insert(String::from("other"));

        assert_eq!(ctx.get::<Marker>(), Some(&Marker(1)));
        assert_eq!(ctx.insert(Marker(2)), Some(Marker(1)));
        ctx.get_mut::<Marker>().unwrap().0 += 1;
        assert_eq!(ctx.remove::<Marker>(), Some(Marker(3)));
        assert!(!ctx.contains::<Marker>());
        assert_eq!(ctx.len(), 1);
    }

    #[test]
    fn test_shape_defaults_to_sync() {
        assert_eq!(InvocationContext::new().shape(), CallShape::Sync);
        assert_eq!(InvocationContext::with_shape(CallShape::Async).shape(), CallShape::Async);
    }
}
