//! Occlusion queries.
//!
//! Each query owns a small result buffer the hardware writes sample counts into, one dword per
//! pixel pipe. Only one query can be active per context.

use crate::error::ContextError;
use crate::resource::ResourceHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryId(pub u32);

/// Bytes of a query result buffer.
pub const QUERY_RESULT_SIZE: u64 = 4 * 4;

#[derive(Debug)]
pub struct OcclusionQuery {
    pub id: QueryId,
    pub result: ResourceHandle,
    /// Set by `end`; cleared by the next `begin`.
    pub ended: bool,
}

#[derive(Debug, Default)]
pub struct QueryList {
    queries: Vec<OcclusionQuery>,
    next_id: u32,
    current: Option<QueryId>,
}

impl QueryList {
    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    pub fn current(&self) -> Option<QueryId> {
        self.current
    }

    pub fn insert(&mut self, result: ResourceHandle) -> QueryId {
        self.next_id += 1;
        let id = QueryId(self.next_id);
        self.queries.push(OcclusionQuery {
            id,
            result,
            ended: false,
        });
        id
    }

    pub fn get(&self, id: QueryId) -> Option<&OcclusionQuery> {
        self.queries.iter().find(|q| q.id == id)
    }

    fn get_mut(&mut self, id: QueryId) -> Result<&mut OcclusionQuery, ContextError> {
        self.queries
            .iter_mut()
            .find(|q| q.id == id)
            .ok_or(ContextError::BadArgument("unknown query"))
    }

    pub fn begin(&mut self, id: QueryId) -> Result<(), ContextError> {
        if self.current.is_some() {
            return Err(ContextError::InvalidState("a query is already active"));
        }
        self.get_mut(id)?.ended = false;
        self.current = Some(id);
        Ok(())
    }

    /// Stop `id` and return the buffer the end-of-query write targets.
    pub fn end(&mut self, id: QueryId) -> Result<ResourceHandle, ContextError> {
        if self.current != Some(id) {
            return Err(ContextError::InvalidState("query is not active"));
        }
        self.current = None;
        let query = self.get_mut(id)?;
        query.ended = true;
        Ok(query.result.clone())
    }

    pub fn remove(&mut self, id: QueryId) -> Result<OcclusionQuery, ContextError> {
        let pos = self
            .queries
            .iter()
            .position(|q| q.id == id)
            .ok_or(ContextError::BadArgument("unknown query"))?;
        if self.current == Some(id) {
            self.current = None;
        }
        Ok(self.queries.remove(pos))
    }

    /// Drop every query and its result buffer reference.
    pub fn clear(&mut self) {
        self.current = None;
        self.queries.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::backend::{BindFlags, DeviceBackend, ImmediateDevice};
    use crate::caps::{ChipFamily, DeviceCaps};

    fn result_buffer(backend: &Arc<dyn DeviceBackend>) -> ResourceHandle {
        ResourceHandle::create_buffer(backend, None, QUERY_RESULT_SIZE, BindFlags::QUERY).unwrap()
    }

    #[test]
    fn only_one_query_is_active() {
        let backend: Arc<dyn DeviceBackend> =
            Arc::new(ImmediateDevice::new(DeviceCaps::new(ChipFamily::R300)));
        let mut list = QueryList::default();
        let a = list.insert(result_buffer(&backend));
        let b = list.insert(result_buffer(&backend));

        list.begin(a).unwrap();
        assert!(matches!(list.begin(b), Err(ContextError::InvalidState(_))));
        assert!(matches!(list.end(b), Err(ContextError::InvalidState(_))));
        list.end(a).unwrap();
        assert!(list.get(a).unwrap().ended);
        list.begin(b).unwrap();
        assert_eq!(list.current(), Some(b));
    }

    #[test]
    fn removing_the_active_query_deactivates_it() {
        let dev = Arc::new(ImmediateDevice::new(DeviceCaps::new(ChipFamily::R300)));
        let backend: Arc<dyn DeviceBackend> = dev.clone();
        let mut list = QueryList::default();
        let a = list.insert(result_buffer(&backend));
        list.begin(a).unwrap();
        drop(list.remove(a).unwrap());
        assert_eq!(list.current(), None);
        assert_eq!(dev.live_buffers(), 0);
        assert!(matches!(list.remove(a), Err(ContextError::BadArgument(_))));
    }
}
