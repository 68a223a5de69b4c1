//! Global cells and entity memory
//!
//! Both regions are flat arrays of 4-byte cells. Every accessor is bounds
//! checked and returns [`AccessError`] instead of reading out of range.

use progs_vm_bytecode::FieldIndex;

use crate::error::AccessError;
use crate::value::{EntityHandle, EntityIndex, Pointer, PointerTarget};

/// Seconds a freed entity stays unused before its slot is handed out again
pub const ENTITY_REUSE_DELAY: f32 = 0.5;

/// Entities freed before this world time may be reused immediately
pub const ENTITY_STARTUP_GRACE: f32 = 2.0;

/// The global cell array
#[derive(Debug, Clone)]
pub struct Globals {
    cells: Box<[u32]>,
}

impl Globals {
    /// Create from initial values
    pub fn new(initial: &[u32]) -> Self {
        Self {
            cells: initial.into(),
        }
    }

    /// Number of cells
    #[inline]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Whether there are no cells
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Restore initial values
    pub fn reset(&mut self, initial: &[u32]) {
        self.cells.copy_from_slice(initial);
    }

    /// All cells
    pub fn as_slice(&self) -> &[u32] {
        &self.cells
    }

    /// `n` consecutive cells starting at `index`
    #[inline]
    pub fn cells(&self, index: usize, n: usize) -> Result<&[u32], AccessError> {
        self.cells
            .get(index..index.saturating_add(n))
            .ok_or(AccessError::Global {
                index,
                len: self.cells.len(),
            })
    }

    /// Mutable `n` consecutive cells starting at `index`
    #[inline]
    pub fn cells_mut(&mut self, index: usize, n: usize) -> Result<&mut [u32], AccessError> {
        let len = self.cells.len();
        self.cells
            .get_mut(index..index.saturating_add(n))
            .ok_or(AccessError::Global { index, len })
    }

    /// Raw cell
    #[inline]
    pub fn cell(&self, index: usize) -> Result<u32, AccessError> {
        self.cells.get(index).copied().ok_or(AccessError::Global {
            index,
            len: self.cells.len(),
        })
    }

    /// Set a raw cell
    #[inline]
    pub fn set_cell(&mut self, index: usize, bits: u32) -> Result<(), AccessError> {
        let len = self.cells.len();
        let cell = self
            .cells
            .get_mut(index)
            .ok_or(AccessError::Global { index, len })?;
        *cell = bits;
        Ok(())
    }

    /// Cell as float
    #[inline]
    pub fn float(&self, index: usize) -> Result<f32, AccessError> {
        self.cell(index).map(f32::from_bits)
    }

    /// Store a float
    #[inline]
    pub fn set_float(&mut self, index: usize, value: f32) -> Result<(), AccessError> {
        self.set_cell(index, value.to_bits())
    }

    /// Cell as integer
    #[inline]
    pub fn int(&self, index: usize) -> Result<i32, AccessError> {
        self.cell(index).map(|bits| bits as i32)
    }

    /// Store an integer
    #[inline]
    pub fn set_int(&mut self, index: usize, value: i32) -> Result<(), AccessError> {
        self.set_cell(index, value as u32)
    }

    /// Three cells as a vector
    #[inline]
    pub fn vector(&self, index: usize) -> Result<[f32; 3], AccessError> {
        let c = self.cells(index, 3)?;
        Ok([
            f32::from_bits(c[0]),
            f32::from_bits(c[1]),
            f32::from_bits(c[2]),
        ])
    }

    /// Store a vector
    #[inline]
    pub fn set_vector(&mut self, index: usize, value: [f32; 3]) -> Result<(), AccessError> {
        let c = self.cells_mut(index, 3)?;
        for (cell, component) in c.iter_mut().zip(value) {
            *cell = component.to_bits();
        }
        Ok(())
    }
}

/// Bookkeeping for one entity slot
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct EntitySlot {
    free: bool,
    freed_at: f32,
}

/// Fixed-capacity array of entity records
#[derive(Debug, Clone)]
pub struct EntityMemory {
    cells: Vec<u32>,
    record_cells: u32,
    capacity: u32,
    in_use: u32,
    slots: Vec<EntitySlot>,
}

impl EntityMemory {
    /// Allocate `capacity` zeroed records of `record_cells` cells
    ///
    /// Only the world entity is in use afterwards.
    pub fn new(capacity: u32, record_cells: u32) -> Self {
        let capacity = capacity.max(1);
        let record_cells = record_cells.max(1);
        let mut memory = Self {
            cells: vec![0; capacity as usize * record_cells as usize],
            record_cells,
            capacity,
            in_use: 1,
            slots: vec![EntitySlot::default(); capacity as usize],
        };
        memory.clear();
        memory
    }

    /// Number of records
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Record width in cells
    #[inline]
    pub fn record_cells(&self) -> u32 {
        self.record_cells
    }

    /// Record width in bytes
    #[inline]
    pub fn record_bytes(&self) -> u32 {
        self.record_cells * 4
    }

    /// One past the highest entity handed out
    #[inline]
    pub fn in_use(&self) -> u32 {
        self.in_use
    }

    /// Validate an entity number
    #[inline]
    pub fn check(&self, entity: i64) -> Result<EntityIndex, AccessError> {
        if (0..self.capacity as i64).contains(&entity) {
            Ok(EntityIndex(entity as u32))
        } else {
            Err(AccessError::Entity {
                entity,
                capacity: self.capacity,
            })
        }
    }

    /// Entity number to byte handle
    pub fn handle(&self, entity: EntityIndex) -> Result<EntityHandle, AccessError> {
        let entity = self.check(entity.0 as i64)?;
        Ok(EntityHandle((entity.0 * self.record_bytes()) as i32))
    }

    /// Byte handle to entity number
    pub fn index(&self, handle: EntityHandle) -> Result<EntityIndex, AccessError> {
        let bytes = self.record_bytes() as i32;
        if handle.0 < 0 || handle.0 % bytes != 0 {
            return Err(AccessError::EntityHandle(handle.0));
        }
        self.check((handle.0 / bytes) as i64)
    }

    #[inline]
    fn span(&self, entity: EntityIndex, field: FieldIndex, n: u32) -> Result<usize, AccessError> {
        let entity = self.check(entity.0 as i64)?;
        if field.0 as u64 + n as u64 > self.record_cells as u64 {
            return Err(AccessError::Field {
                field: field.0,
                cells: n,
                record_cells: self.record_cells,
            });
        }
        Ok(entity.0 as usize * self.record_cells as usize + field.0 as usize)
    }

    /// `n` cells of a field
    #[inline]
    pub fn field(&self, entity: EntityIndex, field: FieldIndex, n: u32) -> Result<&[u32], AccessError> {
        let start = self.span(entity, field, n)?;
        Ok(&self.cells[start..start + n as usize])
    }

    /// Mutable `n` cells of a field
    #[inline]
    pub fn field_mut(
        &mut self,
        entity: EntityIndex,
        field: FieldIndex,
        n: u32,
    ) -> Result<&mut [u32], AccessError> {
        let start = self.span(entity, field, n)?;
        Ok(&mut self.cells[start..start + n as usize])
    }

    /// Whole record of an entity
    pub fn record(&self, entity: EntityIndex) -> Result<&[u32], AccessError> {
        self.field(entity, FieldIndex(0), self.record_cells)
    }

    /// Address of a field, as `ADDRESS` produces it
    pub fn address(&self, entity: EntityIndex, field: FieldIndex) -> Result<Pointer, AccessError> {
        let start = self.span(entity, field, 1)?;
        Ok(Pointer::entity(start as u32 * 4))
    }

    /// Cell index addressed by an entity pointer
    fn pointer_cell(&self, byte: u32, n: u32) -> Result<usize, AccessError> {
        let cell = (byte / 4) as usize;
        if cell + n as usize > self.cells.len() {
            return Err(AccessError::Pointer(byte));
        }
        Ok(cell)
    }

    /// Read `n` cells through an entity pointer
    pub fn load(&self, byte: u32, n: u32) -> Result<&[u32], AccessError> {
        let cell = self.pointer_cell(byte, n)?;
        Ok(&self.cells[cell..cell + n as usize])
    }

    /// Write cells through an entity pointer
    pub fn store(&mut self, byte: u32, values: &[u32]) -> Result<(), AccessError> {
        let cell = self.pointer_cell(byte, values.len() as u32)?;
        self.cells[cell..cell + values.len()].copy_from_slice(values);
        Ok(())
    }

    /// Whether a slot is currently free
    pub fn is_free(&self, entity: EntityIndex) -> bool {
        self.slots
            .get(entity.0 as usize)
            .is_none_or(|slot| slot.free || entity.0 >= self.in_use)
    }

    /// Hand out an entity record
    ///
    /// Reuses the lowest free slot that was released long enough ago, then
    /// grows into unused capacity. Never returns the world.
    pub fn alloc(&mut self, now: f32) -> Result<EntityIndex, AccessError> {
        let reusable = (1..self.in_use).find(|&i| {
            let slot = self.slots[i as usize];
            slot.free && (now < ENTITY_STARTUP_GRACE || now - slot.freed_at > ENTITY_REUSE_DELAY)
        });
        let entity = match reusable {
            Some(i) => EntityIndex(i),
            None if self.in_use < self.capacity => {
                self.in_use += 1;
                EntityIndex(self.in_use - 1)
            }
            None => {
                return Err(AccessError::EntitiesExhausted {
                    capacity: self.capacity,
                });
            }
        };
        self.clear_record(entity);
        self.slots[entity.0 as usize].free = false;
        Ok(entity)
    }

    /// Release an entity record, zeroing it
    pub fn free(&mut self, entity: EntityIndex, now: f32) -> Result<(), AccessError> {
        if entity.is_world() {
            return Err(AccessError::WorldEntity);
        }
        if entity.0 >= self.in_use {
            return Err(AccessError::Entity {
                entity: entity.0 as i64,
                capacity: self.capacity,
            });
        }
        self.clear_record(entity);
        self.slots[entity.0 as usize] = EntitySlot {
            free: true,
            freed_at: now,
        };
        Ok(())
    }

    fn clear_record(&mut self, entity: EntityIndex) {
        let start = entity.0 as usize * self.record_cells as usize;
        self.cells[start..start + self.record_cells as usize].fill(0);
    }

    /// Zero every record and forget all allocations
    pub fn clear(&mut self) {
        self.cells.fill(0);
        self.slots.fill(EntitySlot {
            free: true,
            freed_at: 0.0,
        });
        self.slots[0].free = false;
        self.in_use = 1;
    }
}

/// Resolve a pointer against both regions for reading
pub fn load_pointer<'a>(
    globals: &'a Globals,
    entities: &'a EntityMemory,
    pointer: Pointer,
    n: u32,
) -> Result<&'a [u32], AccessError> {
    match pointer.target() {
        Some(PointerTarget::Global(cell)) => globals
            .cells(cell, n as usize)
            .map_err(|_| AccessError::Pointer(pointer.0)),
        Some(PointerTarget::Entity(byte)) => entities.load(byte, n),
        None => Err(AccessError::Pointer(pointer.0)),
    }
}

/// Resolve a pointer against both regions and write through it
pub fn store_pointer(
    globals: &mut Globals,
    entities: &mut EntityMemory,
    pointer: Pointer,
    values: &[u32],
) -> Result<(), AccessError> {
    match pointer.target() {
        Some(PointerTarget::Global(cell)) => {
            let dst = globals
                .cells_mut(cell, values.len())
                .map_err(|_| AccessError::Pointer(pointer.0))?;
            dst.copy_from_slice(values);
            Ok(())
        }
        Some(PointerTarget::Entity(byte)) => entities.store(byte, values),
        None => Err(AccessError::Pointer(pointer.0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_globals_bounds() {
        let mut g = Globals::new(&[0; 8]);
        g.set_float(7, 1.5).unwrap();
        assert_eq!(g.float(7).unwrap(), 1.5);
        assert_eq!(g.float(8), Err(AccessError::Global { index: 8, len: 8 }));
        assert!(g.vector(6).is_err());
        g.set_vector(5, [1.0, 2.0, 3.0]).unwrap();
        assert_eq!(g.vector(5).unwrap(), [1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_index_handle_identity() {
        let mem = EntityMemory::new(64, 7);
        for i in 0..64 {
            let handle = mem.handle(EntityIndex(i)).unwrap();
            assert_eq!(handle.0, (i * 28) as i32);
            assert_eq!(mem.index(handle).unwrap(), EntityIndex(i));
        }
        assert!(mem.handle(EntityIndex(64)).is_err());
        assert_eq!(mem.index(EntityHandle(30)), Err(AccessError::EntityHandle(30)));
        assert!(mem.index(EntityHandle(-28)).is_err());
    }

    #[test]
    fn test_field_bounds() {
        let mut mem = EntityMemory::new(4, 5);
        mem.field_mut(EntityIndex(2), FieldIndex(2), 3)
            .unwrap()
            .copy_from_slice(&[1, 2, 3]);
        assert_eq!(mem.field(EntityIndex(2), FieldIndex(4), 1).unwrap(), &[3]);
        assert_eq!(
            mem.field(EntityIndex(2), FieldIndex(3), 3),
            Err(AccessError::Field {
                field: 3,
                cells: 3,
                record_cells: 5
            })
        );
        assert!(matches!(
            mem.field(EntityIndex(4), FieldIndex(0), 1),
            Err(AccessError::Entity { entity: 4, .. })
        ));
    }

    #[test]
    fn test_pointers_hit_the_same_cells() {
        let mut globals = Globals::new(&[0; 32]);
        let mut entities = EntityMemory::new(4, 6);
        let ptr = entities.address(EntityIndex(3), FieldIndex(1)).unwrap();
        store_pointer(&mut globals, &mut entities, ptr, &[11, 12, 13]).unwrap();
        assert_eq!(
            entities.field(EntityIndex(3), FieldIndex(1), 3).unwrap(),
            &[11, 12, 13]
        );

        let gptr = Pointer::global(30);
        store_pointer(&mut globals, &mut entities, gptr, &[99]).unwrap();
        assert_eq!(globals.cell(30).unwrap(), 99);
        assert_eq!(load_pointer(&globals, &entities, gptr, 1).unwrap(), &[99]);
        assert!(load_pointer(&globals, &entities, Pointer::global(31), 3).is_err());
        assert!(load_pointer(&globals, &entities, Pointer::entity(4 * 6 * 4), 1).is_err());
    }

    #[test]
    fn test_alloc_never_returns_world() {
        let mut mem = EntityMemory::new(4, 2);
        let got: Vec<_> = (0..3).map(|_| mem.alloc(10.0).unwrap()).collect();
        assert_eq!(got, [EntityIndex(1), EntityIndex(2), EntityIndex(3)]);
        assert!(matches!(
            mem.alloc(10.0),
            Err(AccessError::EntitiesExhausted { capacity: 4 })
        ));
        assert_eq!(mem.free(EntityIndex::WORLD, 10.0), Err(AccessError::WorldEntity));
    }

    #[test]
    fn test_free_slots_respect_reuse_delay() {
        let mut mem = EntityMemory::new(8, 2);
        let a = mem.alloc(10.0).unwrap();
        let b = mem.alloc(10.0).unwrap();
        mem.field_mut(a, FieldIndex(0), 1).unwrap()[0] = 7;
        mem.free(a, 10.0).unwrap();
        assert!(mem.is_free(a));
        assert_eq!(mem.field(a, FieldIndex(0), 1).unwrap(), &[0]);

        // too soon: a fresh slot is used instead
        assert_eq!(mem.alloc(10.2).unwrap(), EntityIndex(3));
        // old enough: the freed slot comes back
        assert_eq!(mem.alloc(10.6).unwrap(), a);
        assert!(!mem.is_free(b));
    }

    #[test]
    fn test_startup_reuse_is_immediate() {
        let mut mem = EntityMemory::new(8, 2);
        let a = mem.alloc(0.0).unwrap();
        mem.free(a, 0.0).unwrap();
        assert_eq!(mem.alloc(0.1).unwrap(), a);
    }
}
