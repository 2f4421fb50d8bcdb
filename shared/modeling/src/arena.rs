use std::collections::HashMap;

use tch::{Device, Kind, TchError, Tensor};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArenaError {
    #[error("parameter {0} declared twice")]
    DuplicateParameter(String),

    #[error("shape mismatch for {name}: model expects {expected:?}, shard holds {found:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<i64>,
        found: Vec<i64>,
    },

    #[error("torch error: {0}")]
    Tch(#[from] TchError),
}

/// Stable handle to a parameter inside a [`ParameterArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParameterId(usize);

impl ParameterId {
    pub fn index(&self) -> usize {
        self.0
    }
}

#[derive(Debug)]
pub struct ParameterEntry {
    name: String,
    shape: Vec<i64>,
    tensor: Tensor,
    resident: bool,
}

impl ParameterEntry {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The shape the model declared; the backing tensor only has it while resident.
    pub fn shape(&self) -> &[i64] {
        &self.shape
    }

    pub fn tensor(&self) -> &Tensor {
        &self.tensor
    }

    pub fn is_resident(&self) -> bool {
        self.resident
    }

    fn bytes(&self, kind: Kind) -> u64 {
        self.shape.iter().product::<i64>().max(0) as u64 * kind.elt_size_in_bytes() as u64
    }
}

/// Collects parameter declarations while the model is being built.
///
/// Every declared parameter starts out released: its tensor is an empty
/// placeholder on the target device that shares its implementation with the
/// handle returned to the layer, so later loads become visible to the layer
/// without it ever being touched again.
#[derive(Debug)]
pub struct ArenaBuilder {
    kind: Kind,
    device: Device,
    entries: Vec<ParameterEntry>,
    index: HashMap<String, ParameterId>,
}

impl ArenaBuilder {
    pub fn new(kind: Kind, device: Device) -> Self {
        Self {
            kind,
            device,
            entries: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn declare(&mut self, name: impl Into<String>, shape: &[i64]) -> Result<Tensor, ArenaError> {
        let name = name.into();
        if self.index.contains_key(&name) {
            return Err(ArenaError::DuplicateParameter(name));
        }
        let tensor = Tensor::empty([0], (self.kind, self.device));
        let handle = tensor.shallow_clone();
        let id = ParameterId(self.entries.len());
        self.index.insert(name.clone(), id);
        self.entries.push(ParameterEntry {
            name,
            shape: shape.to_vec(),
            tensor,
            resident: false,
        });
        Ok(handle)
    }

    pub fn finish(self) -> ParameterArena {
        ParameterArena {
            kind: self.kind,
            device: self.device,
            entries: self.entries,
            index: self.index,
        }
    }
}

/// Model storage: every parameter the model reads, indexed by name and by
/// [`ParameterId`].
///
/// Entries are never added, removed or reallocated once the arena is built.
/// Only their backing contents change, through [`ParameterArena::overwrite`]
/// and [`ParameterArena::release`], which only the window scheduler calls.
#[derive(Debug)]
pub struct ParameterArena {
    kind: Kind,
    device: Device,
    entries: Vec<ParameterEntry>,
    index: HashMap<String, ParameterId>,
}

impl ParameterArena {
    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn id(&self, name: &str) -> Option<ParameterId> {
        self.index.get(name).copied()
    }

    pub fn entry(&self, id: ParameterId) -> &ParameterEntry {
        &self.entries[id.0]
    }

    pub fn get(&self, name: &str) -> Option<&ParameterEntry> {
        self.id(name).map(|id| self.entry(id))
    }

    pub fn iter(&self) -> impl Iterator<Item = (ParameterId, &ParameterEntry)> {
        self.entries
            .iter()
            .enumerate()
            .map(|(index, entry)| (ParameterId(index), entry))
    }

    /// Bytes currently held by resident parameters.
    pub fn resident_bytes(&self) -> u64 {
        self.entries
            .iter()
            .filter(|entry| entry.resident)
            .map(|entry| entry.bytes(self.kind))
            .sum()
    }

    /// Writes `value` into the parameter's storage.
    ///
    /// A resident parameter is copied into in place. A released one gets fresh
    /// storage attached to the same tensor implementation.
    pub(crate) fn overwrite(&mut self, id: ParameterId, value: &Tensor) -> Result<(), ArenaError> {
        let (kind, device) = (self.kind, self.device);
        let entry = &mut self.entries[id.0];
        let found = value.size();
        if found != entry.shape {
            return Err(ArenaError::ShapeMismatch {
                name: entry.name.clone(),
                expected: entry.shape.clone(),
                found,
            });
        }

        let _guard = tch::no_grad_guard();
        if entry.resident {
            entry.tensor.f_copy_(value)?;
        } else {
            let data = value.to_device(device).f_to_kind(kind)?.f_contiguous()?;
            entry.tensor.set_data(&data);
            entry.resident = true;
        }
        Ok(())
    }

    /// Drops the parameter's backing storage, leaving an empty placeholder.
    pub(crate) fn release(&mut self, id: ParameterId) {
        let placeholder = Tensor::empty([0], (self.kind, self.device));
        let entry = &mut self.entries[id.0];
        let _guard = tch::no_grad_guard();
        entry.tensor.set_data(&placeholder);
        entry.resident = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_is_visible_through_layer_handle() {
        let mut builder = ArenaBuilder::new(Kind::Float, Device::Cpu);
        let handle = builder.declare("w", &[2, 3]).unwrap();
        let mut arena = builder.finish();
        let id = arena.id("w").unwrap();
        assert_eq!(handle.size(), vec![0]);
        assert!(!arena.entry(id).is_resident());

        let value = Tensor::arange(6, (Kind::Float, Device::Cpu)).reshape([2, 3]);
        arena.overwrite(id, &value).unwrap();
        assert_eq!(handle.size(), vec![2, 3]);
        assert!(handle.equal(&value));
        assert_eq!(arena.resident_bytes(), 24);

        // second load copies into the existing storage
        let ptr = handle.data_ptr();
        let doubled = &value * 2.0;
        arena.overwrite(id, &doubled).unwrap();
        assert_eq!(handle.data_ptr(), ptr);
        assert!(handle.equal(&doubled));

        arena.release(id);
        assert_eq!(handle.size(), vec![0]);
        assert_eq!(arena.resident_bytes(), 0);
    }

    #[test]
    fn converts_kind_on_first_load() {
        let mut builder = ArenaBuilder::new(Kind::BFloat16, Device::Cpu);
        let handle = builder.declare("w", &[4]).unwrap();
        let mut arena = builder.finish();
        let value = Tensor::ones([4], (Kind::Float, Device::Cpu));
        arena.overwrite(arena.id("w").unwrap(), &value).unwrap();
        assert_eq!(handle.kind(), Kind::BFloat16);
    }

    #[test]
    fn rejects_wrong_shape_and_duplicates() {
        let mut builder = ArenaBuilder::new(Kind::Float, Device::Cpu);
        builder.declare("w", &[2, 2]).unwrap();
        assert!(matches!(
            builder.declare("w", &[2, 2]),
            Err(ArenaError::DuplicateParameter(_))
        ));
        let mut arena = builder.finish();
        let err = arena
            .overwrite(
                arena.id("w").unwrap(),
                &Tensor::zeros([3], (Kind::Float, Device::Cpu)),
            )
            .unwrap_err();
        assert!(matches!(err, ArenaError::ShapeMismatch { .. }));
    }
}
