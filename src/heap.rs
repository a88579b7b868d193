use crate::error::RuntimeError;
use crate::value::Value;
use tracing::trace;

/// Stable identifier of a heap object. An id stays valid for the whole
/// lifetime of its object and is only reused after a collection has
/// proven that no live reference to it remains.
pub type HeapId = u32;

/// A user-type instance: fields in the type's flattened declaration
/// order, inherited fields first.
#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
    pub type_id: u32,
    pub fields: Vec<Value>,
}

/// One object in the heap arena.
///
/// `StringBuffer` keeps characters individually so `STORE_CHAR` can
/// replace one in place without re-scanning UTF-8 boundaries.
#[derive(Debug, Clone, PartialEq)]
pub enum HeapObject {
    StringBuffer(Vec<char>),
    List(Vec<Value>),
    Instance(Instance),
    Free,
}

/// The heap arena. It owns every object; stack slots and other heap
/// objects hold [`HeapId`]s into it, never the objects themselves.
/// Reclamation is a mark phase over the roots handed in by the VM plus
/// the cross-references between heap objects, then a sweep into the
/// free list.
#[derive(Debug, Default)]
pub struct Heap {
    objects: Vec<HeapObject>,
    free_list: Vec<HeapId>,
    allocations: usize,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&mut self, object: HeapObject) -> HeapId {
        self.allocations += 1;
        if let Some(id) = self.free_list.pop() {
            self.objects[id as usize] = object;
            id
        } else {
            let id = self.objects.len() as HeapId;
            self.objects.push(object);
            id
        }
    }

    pub fn allocate_string(&mut self, text: &str) -> HeapId {
        self.allocate(HeapObject::StringBuffer(text.chars().collect()))
    }

    pub fn get(&self, id: HeapId) -> Result<&HeapObject, RuntimeError> {
        match self.objects.get(id as usize) {
            Some(HeapObject::Free) | None => Err(RuntimeError::TypeError(format!(
                "dangling heap reference: {}",
                id
            ))),
            Some(object) => Ok(object),
        }
    }

    pub fn string(&self, id: HeapId) -> Result<&Vec<char>, RuntimeError> {
        match self.get(id)? {
            HeapObject::StringBuffer(chars) => Ok(chars),
            other => Err(RuntimeError::TypeError(format!(
                "expected string, found {}",
                kind_of(other)
            ))),
        }
    }

    pub fn string_mut(&mut self, id: HeapId) -> Result<&mut Vec<char>, RuntimeError> {
        match self.objects.get_mut(id as usize) {
            Some(HeapObject::StringBuffer(chars)) => Ok(chars),
            Some(HeapObject::Free) | None => Err(RuntimeError::TypeError(format!(
                "dangling heap reference: {}",
                id
            ))),
            Some(other) => Err(RuntimeError::TypeError(format!(
                "expected string, found {}",
                kind_of(other)
            ))),
        }
    }

    pub fn list(&self, id: HeapId) -> Result<&Vec<Value>, RuntimeError> {
        match self.get(id)? {
            HeapObject::List(elements) => Ok(elements),
            other => Err(RuntimeError::TypeError(format!(
                "expected list, found {}",
                kind_of(other)
            ))),
        }
    }

    pub fn list_mut(&mut self, id: HeapId) -> Result<&mut Vec<Value>, RuntimeError> {
        match self.objects.get_mut(id as usize) {
            Some(HeapObject::List(elements)) => Ok(elements),
            Some(HeapObject::Free) | None => Err(RuntimeError::TypeError(format!(
                "dangling heap reference: {}",
                id
            ))),
            Some(other) => Err(RuntimeError::TypeError(format!(
                "expected list, found {}",
                kind_of(other)
            ))),
        }
    }

    pub fn instance(&self, id: HeapId) -> Result<&Instance, RuntimeError> {
        match self.get(id)? {
            HeapObject::Instance(instance) => Ok(instance),
            other => Err(RuntimeError::TypeError(format!(
                "expected object, found {}",
                kind_of(other)
            ))),
        }
    }

    pub fn instance_mut(&mut self, id: HeapId) -> Result<&mut Instance, RuntimeError> {
        match self.objects.get_mut(id as usize) {
            Some(HeapObject::Instance(instance)) => Ok(instance),
            Some(HeapObject::Free) | None => Err(RuntimeError::TypeError(format!(
                "dangling heap reference: {}",
                id
            ))),
            Some(other) => Err(RuntimeError::TypeError(format!(
                "expected object, found {}",
                kind_of(other)
            ))),
        }
    }

    pub fn should_collect(&self, threshold: usize) -> bool {
        self.allocations >= threshold
    }

    /// Mark from `roots` across heap cross-references, then sweep
    /// everything unmarked into the free list. Returns the number of
    /// objects reclaimed.
    pub fn collect(&mut self, roots: &[Value]) -> usize {
        let mut marks = vec![false; self.objects.len()];
        let mut worklist: Vec<HeapId> = roots.iter().filter_map(Value::heap_id).collect();

        while let Some(id) = worklist.pop() {
            let slot = id as usize;
            if slot >= marks.len() || marks[slot] {
                continue;
            }
            marks[slot] = true;
            match &self.objects[slot] {
                HeapObject::List(elements) => {
                    worklist.extend(elements.iter().filter_map(Value::heap_id));
                }
                HeapObject::Instance(instance) => {
                    worklist.extend(instance.fields.iter().filter_map(Value::heap_id));
                }
                HeapObject::StringBuffer(_) | HeapObject::Free => {}
            }
        }

        let mut freed = 0;
        for (slot, marked) in marks.iter().enumerate() {
            if !marked && !matches!(self.objects[slot], HeapObject::Free) {
                self.objects[slot] = HeapObject::Free;
                self.free_list.push(slot as HeapId);
                freed += 1;
            }
        }
        self.allocations = 0;
        trace!(freed, live = self.live_count(), "heap collection");
        freed
    }

    pub fn live_count(&self) -> usize {
        self.objects
            .iter()
            .filter(|object| !matches!(object, HeapObject::Free))
            .count()
    }
}

fn kind_of(object: &HeapObject) -> &'static str {
    match object {
        HeapObject::StringBuffer(_) => "string",
        HeapObject::List(_) => "list",
        HeapObject::Instance(_) => "object",
        HeapObject::Free => "freed object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_and_read_back() -> Result<(), RuntimeError> {
        let mut heap = Heap::new();
        let id = heap.allocate_string("hello");
        assert_eq!(heap.string(id)?.iter().collect::<String>(), "hello");
        Ok(())
    }

    #[test]
    fn test_ids_are_stable_across_allocations() -> Result<(), RuntimeError> {
        let mut heap = Heap::new();
        let first = heap.allocate(HeapObject::List(vec![Value::Int(1)]));
        let second = heap.allocate_string("x");
        assert_ne!(first, second);
        assert_eq!(heap.list(first)?, &vec![Value::Int(1)]);
        Ok(())
    }

    #[test]
    fn test_kind_mismatch_is_type_error() {
        let mut heap = Heap::new();
        let id = heap.allocate_string("hello");
        assert!(matches!(heap.list(id), Err(RuntimeError::TypeError(_))));
        assert!(matches!(heap.instance(id), Err(RuntimeError::TypeError(_))));
    }

    #[test]
    fn test_dangling_reference_is_an_error() {
        let heap = Heap::new();
        assert!(matches!(heap.get(42), Err(RuntimeError::TypeError(_))));
    }

    #[test]
    fn test_collect_frees_unreachable_objects() {
        let mut heap = Heap::new();
        let live = heap.allocate_string("live");
        let _dead = heap.allocate_string("dead");

        let freed = heap.collect(&[Value::StringRef(live)]);
        assert_eq!(freed, 1);
        assert!(heap.string(live).is_ok());
    }

    #[test]
    fn test_collect_follows_cross_references() {
        let mut heap = Heap::new();
        let inner = heap.allocate_string("inner");
        let outer = heap.allocate(HeapObject::List(vec![Value::StringRef(inner)]));

        let freed = heap.collect(&[Value::ListRef(outer)]);
        assert_eq!(freed, 0);
        assert!(heap.string(inner).is_ok());
    }

    #[test]
    fn test_collect_follows_instance_fields() {
        let mut heap = Heap::new();
        let name = heap.allocate_string("bob");
        let object = heap.allocate(HeapObject::Instance(Instance {
            type_id: 0,
            fields: vec![Value::StringRef(name), Value::Int(7)],
        }));

        heap.collect(&[Value::ObjectRef(object)]);
        assert!(heap.string(name).is_ok());
    }

    #[test]
    fn test_freed_slots_are_reused() {
        let mut heap = Heap::new();
        let dead = heap.allocate_string("dead");
        heap.collect(&[]);
        let recycled = heap.allocate_string("recycled");
        assert_eq!(dead, recycled);
    }

    #[test]
    fn test_cycles_are_collected() -> Result<(), RuntimeError> {
        let mut heap = Heap::new();
        let first = heap.allocate(HeapObject::List(vec![]));
        let second = heap.allocate(HeapObject::List(vec![Value::ListRef(first)]));
        heap.list_mut(first)?.push(Value::ListRef(second));

        let freed = heap.collect(&[]);
        assert_eq!(freed, 2);
        Ok(())
    }

    #[test]
    fn test_collection_threshold() {
        let mut heap = Heap::new();
        assert!(!heap.should_collect(2));
        heap.allocate_string("a");
        heap.allocate_string("b");
        assert!(heap.should_collect(2));
        heap.collect(&[]);
        assert!(!heap.should_collect(2));
    }
}
