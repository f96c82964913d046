use crate::channel::{Channel, EngineId, ObjectHandle};
use crate::error::Result;

/// What is bound on one subchannel, as last read from the wrapped channel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SubchannelEntry {
    pub handle: Option<ObjectHandle>,
    pub class: Option<u32>,
    pub engine: Option<EngineId>,
}

#[derive(Clone, Debug)]
pub struct SubchannelTable {
    entries: Vec<Option<SubchannelEntry>>,
    /// Most recently used first; each subchannel at most once.
    history: Vec<u32>,
}

impl SubchannelTable {
    pub fn new(num_subchannels: u32) -> Self {
        Self {
            entries: vec![None; num_subchannels as usize],
            history: Vec::new(),
        }
    }

    pub fn len(&self) -> u32 {
        self.entries.len() as u32
    }

    pub fn history(&self) -> &[u32] {
        &self.history
    }

    pub fn most_recent(&self) -> Option<u32> {
        self.history.first().copied()
    }

    pub fn touch(&mut self, subchannel: u32) {
        if subchannel >= self.len() {
            return;
        }
        self.history.retain(|&used| used != subchannel);
        self.history.insert(0, subchannel);
    }

    /// Forget what is cached for `subchannel`; the next lookup asks the channel again.
    pub fn invalidate(&mut self, subchannel: u32) {
        if let Some(slot) = self.entries.get_mut(subchannel as usize) {
            *slot = None;
        }
    }

    pub fn invalidate_handle(&mut self, handle: ObjectHandle) {
        for slot in self.entries.iter_mut() {
            if slot.is_some_and(|entry| entry.handle == Some(handle)) {
                *slot = None;
            }
        }
    }

    pub fn clear(&mut self) {
        self.entries.iter_mut().for_each(|slot| *slot = None);
        self.history.clear();
    }

    /// Cached entry for `subchannel`, or `None` without a channel round-trip.
    pub fn cached(&self, subchannel: u32) -> Option<SubchannelEntry> {
        self.entries.get(subchannel as usize).copied().flatten()
    }

    pub fn store(&mut self, subchannel: u32, entry: SubchannelEntry) {
        if let Some(slot) = self.entries.get_mut(subchannel as usize) {
            *slot = Some(entry);
        }
    }
}

/// Read what `channel` has bound on `subchannel`.
pub fn query_entry(channel: &dyn Channel, subchannel: u32) -> Result<SubchannelEntry> {
    Ok(SubchannelEntry {
        handle: channel.object_handle(subchannel)?,
        class: channel.object_class(subchannel)?,
        engine: channel.object_engine(subchannel)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_is_most_recent_first_without_duplicates() {
        let mut table = SubchannelTable::new(8);
        table.touch(2);
        table.touch(5);
        table.touch(2);
        table.touch(9);
        assert_eq!(table.history(), &[2, 5]);
        assert_eq!(table.most_recent(), Some(2));
    }

    #[test]
    fn invalidating_a_handle_clears_every_binding() {
        let mut table = SubchannelTable::new(4);
        let entry = SubchannelEntry {
            handle: Some(ObjectHandle(3)),
            class: Some(0xC5B5),
            engine: Some(EngineId(1)),
        };
        table.store(0, entry);
        table.store(2, entry);
        table.invalidate_handle(ObjectHandle(3));
        assert_eq!(table.cached(0), None);
        assert_eq!(table.cached(2), None);
    }
}
