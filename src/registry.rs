//! Fixed-capacity instance registry
//!
//! Class instances live in a [Registry] and are addressed by [Handle]s. A handle is typed
//! by what it points to and remembers the slot generation, so a handle outliving its
//! instance is rejected instead of reaching whatever took the slot next.

use core::fmt;
use core::marker::PhantomData;

/// Handle to an instance stored in a [Registry]
pub struct Handle<T> {
    index: u16,
    generation: u16,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    /// Slot index, stable for the lifetime of the instance
    pub fn index(&self) -> usize {
        self.index as usize
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for Handle<T> {}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({}#{})", self.index, self.generation)
    }
}

#[cfg(feature = "defmt")]
impl<T> defmt::Format for Handle<T> {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "Handle({}#{})", self.index, self.generation)
    }
}

/// The handle does not refer to a live instance
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct InvalidHandle;

/// No free slot left. Gives the rejected value back.
#[derive(Debug)]
pub struct RegistryFull<T>(pub T);

struct Slot<T> {
    generation: u16,
    value: Option<T>,
}

/// Arena of up to `N` instances
pub struct Registry<T, const N: usize> {
    slots: [Slot<T>; N],
}

impl<T, const N: usize> Default for Registry<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const N: usize> Registry<T, N> {
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| Slot {
                generation: 0,
                value: None,
            }),
        }
    }

    /// Stores `value` in the first free slot
    pub fn insert(&mut self, value: T) -> Result<Handle<T>, RegistryFull<T>> {
        match self.slots.iter_mut().enumerate().find(|(_, s)| s.value.is_none()) {
            Some((index, slot)) => {
                slot.value = Some(value);
                Ok(Handle {
                    index: index as u16,
                    generation: slot.generation,
                    _marker: PhantomData,
                })
            }
            None => Err(RegistryFull(value)),
        }
    }

    pub fn get(&self, handle: Handle<T>) -> Result<&T, InvalidHandle> {
        self.slots
            .get(handle.index())
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.value.as_ref())
            .ok_or(InvalidHandle)
    }

    pub fn get_mut(&mut self, handle: Handle<T>) -> Result<&mut T, InvalidHandle> {
        self.slots
            .get_mut(handle.index())
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.value.as_mut())
            .ok_or(InvalidHandle)
    }

    /// Takes the instance out. The handle, and all its copies, become invalid.
    pub fn remove(&mut self, handle: Handle<T>) -> Result<T, InvalidHandle> {
        let slot = self
            .slots
            .get_mut(handle.index())
            .filter(|s| s.generation == handle.generation)
            .ok_or(InvalidHandle)?;
        let value = slot.value.take().ok_or(InvalidHandle)?;
        slot.generation = slot.generation.wrapping_add(1);
        Ok(value)
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.value.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub const fn capacity(&self) -> usize {
        N
    }
}
