//! Publish-once memoization of per-type definitions.

use std::any::{Any, TypeId};
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;

use crate::state::error::ConfigurationError;

type Slot<T> = OnceLock<Result<Arc<T>, ConfigurationError>>;

/// Holds the definition of every machine and monitor type used by one runtime.
///
/// The first caller for a type builds its definition while concurrent callers for the same type
/// block until it is published. Every later caller shares the published definition, or the
/// configuration error the build produced.
#[derive(Debug, Default)]
pub struct DefinitionRegistry {
    slots: DashMap<TypeId, Arc<dyn Any + Send + Sync>, ahash::RandomState>,
}

impl DefinitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the definition of type `T`, building it with `build` on first use.
    pub fn get_or_build<T, F>(&self, build: F) -> Result<Arc<T>, ConfigurationError>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Result<T, ConfigurationError>,
    {
        // The shard lock is released at the end of this statement, before the build runs.
        let slot = Arc::clone(
            self.slots
                .entry(TypeId::of::<T>())
                .or_insert_with(|| Arc::new(Slot::<T>::new()))
                .value(),
        );

        // Slots are keyed by the type id of the definition they hold.
        let Some(slot) = slot.downcast_ref::<Slot<T>>() else {
            return build().map(Arc::new);
        };

        slot.get_or_init(|| build().map(Arc::new)).clone()
    }

    /// Number of types with a published definition or error.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Debug)]
    struct Definition(u32);

    #[test]
    fn test_definition_is_built_once() {
        let registry = DefinitionRegistry::new();
        let builds = AtomicUsize::new(0);

        let definitions: Vec<Arc<Definition>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        registry
                            .get_or_build(|| {
                                builds.fetch_add(1, Ordering::SeqCst);
                                std::thread::sleep(std::time::Duration::from_millis(10));
                                Ok(Definition(7))
                            })
                            .unwrap()
                    })
                })
                .collect();

            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert!(definitions.iter().all(|d| Arc::ptr_eq(d, &definitions[0])));
        assert_eq!(definitions[0].0, 7);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_errors_are_published() {
        let registry = DefinitionRegistry::new();
        let err = ConfigurationError::NoStartState { machine: "Broken" };

        let first = registry.get_or_build::<Definition, _>(|| Err(err.clone()));
        let second = registry.get_or_build::<Definition, _>(|| Ok(Definition(1)));

        assert_eq!(first.unwrap_err(), err);
        assert_eq!(second.unwrap_err(), err);
    }
}
