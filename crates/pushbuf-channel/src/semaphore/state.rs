use std::collections::BTreeMap;

use bitflags::bitflags;

use crate::channel::{ReleaseFlags, SemaphorePayloadSize, ALL_SUBDEVICES};
use crate::error::{ContractViolation, Result};

/// `(subchannel, method)`
pub type MethodKey = (u32, u32);

bitflags! {
    /// Scalar fields whose channel value no longer matches the cached one.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct DirtyFields: u8 {
        const MASK = 1 << 0;
        const OFFSET = 1 << 1;
        const RELEASE_FLAGS = 1 << 2;
        const PAYLOAD_SIZE = 1 << 3;
    }
}

/// A cached method value that has to be written again, restricted to its stale subdevices.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StaleValue {
    pub subchannel: u32,
    pub method: u32,
    pub subdevice_mask: u32,
    pub data: u32,
}

/// Semaphore configuration as last established at one nesting level.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SemState {
    pub subdevice_mask: u32,
    pub sem_offset: u64,
    pub release_flags: ReleaseFlags,
    pub payload_size: SemaphorePayloadSize,
    /// Cached values per subdevice pattern. Masks of one key never overlap.
    methods: BTreeMap<MethodKey, Vec<(u32, u32)>>,
    dirty: DirtyFields,
    /// Stale subdevice bits per cached method.
    method_dirty: BTreeMap<MethodKey, u32>,
    host_dirty: bool,
    dirty_subchannels: u32,
}

impl Default for SemState {
    fn default() -> Self {
        Self {
            subdevice_mask: ALL_SUBDEVICES,
            sem_offset: 0,
            release_flags: ReleaseFlags::empty(),
            payload_size: SemaphorePayloadSize::default(),
            methods: BTreeMap::new(),
            dirty: DirtyFields::empty(),
            method_dirty: BTreeMap::new(),
            host_dirty: false,
            dirty_subchannels: 0,
        }
    }
}

fn bits(mask: u32) -> impl Iterator<Item = u32> {
    (0..u32::BITS)
        .map(|bit| 1u32 << bit)
        .filter(move |bit| mask & bit != 0)
}

fn subchannel_bit(subchannel: u32) -> u32 {
    1u32.checked_shl(subchannel).unwrap_or(0)
}

impl SemState {
    pub fn dirty_fields(&self) -> DirtyFields {
        self.dirty
    }

    pub fn host_dirty(&self) -> bool {
        self.host_dirty
    }

    pub fn dirty_subchannels(&self) -> u32 {
        self.dirty_subchannels
    }

    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty() || self.host_dirty || self.dirty_subchannels != 0
    }

    /// Cached value of `key` for one subdevice bit.
    pub fn value(&self, key: MethodKey, subdevice_bit: u32) -> Option<u32> {
        self.methods
            .get(&key)?
            .iter()
            .find(|(mask, _)| mask & subdevice_bit != 0)
            .map(|(_, data)| *data)
    }

    /// Every cached value that needs re-issuing, grouped by subdevice pattern.
    pub fn stale_values(&self) -> Vec<StaleValue> {
        let mut stale = Vec::new();
        for (&(subchannel, method), &dirty_bits) in &self.method_dirty {
            let Some(entries) = self.methods.get(&(subchannel, method)) else {
                continue;
            };
            for &(mask, data) in entries {
                let subdevice_mask = mask & dirty_bits;
                if subdevice_mask != 0 {
                    stale.push(StaleValue {
                        subchannel,
                        method,
                        subdevice_mask,
                        data,
                    });
                }
            }
        }
        stale
    }

    fn cut(&mut self, key: MethodKey, mask: u32) {
        if let Some(entries) = self.methods.get_mut(&key) {
            for entry in entries.iter_mut() {
                entry.0 &= !mask;
            }
            entries.retain(|(remaining, _)| *remaining != 0);
            if entries.is_empty() {
                self.methods.remove(&key);
            }
        }
        if let Some(dirty) = self.method_dirty.get_mut(&key) {
            *dirty &= !mask;
            if *dirty == 0 {
                self.method_dirty.remove(&key);
            }
        }
    }

    fn record(&mut self, key: MethodKey, data: u32) {
        let mask = self.subdevice_mask;
        self.cut(key, mask);
        self.methods.entry(key).or_default().push((mask, data));
    }

    fn summarize(&mut self, host_method_limit: u32) {
        self.host_dirty = false;
        self.dirty_subchannels = 0;
        for (&(subchannel, method), &dirty_bits) in &self.method_dirty {
            if dirty_bits == 0 {
                continue;
            }
            if method < host_method_limit {
                self.host_dirty = true;
            } else {
                self.dirty_subchannels |= subchannel_bit(subchannel);
            }
        }
    }

    /// Recompute dirtiness after the nested level `popped` was closed on top of `self`.
    fn settle(&mut self, popped: &SemState, host_method_limit: u32) {
        let scalars = [
            (DirtyFields::MASK, self.subdevice_mask != popped.subdevice_mask),
            (DirtyFields::OFFSET, self.sem_offset != popped.sem_offset),
            (DirtyFields::RELEASE_FLAGS, self.release_flags != popped.release_flags),
            (DirtyFields::PAYLOAD_SIZE, self.payload_size != popped.payload_size),
        ];
        for (field, differs) in scalars {
            self.dirty
                .set(field, differs || popped.dirty.contains(field));
        }

        let mut method_dirty = BTreeMap::new();
        for (&key, entries) in &self.methods {
            let inherited = popped.method_dirty.get(&key).copied().unwrap_or(0);
            let mut stale = 0;
            for &(mask, data) in entries {
                for bit in bits(mask) {
                    if inherited & bit != 0 || popped.value(key, bit) != Some(data) {
                        stale |= bit;
                    }
                }
            }
            if stale != 0 {
                method_dirty.insert(key, stale);
            }
        }
        self.method_dirty = method_dirty;
        self.summarize(host_method_limit);
    }
}

/// Save points for nested inserted-methods scopes. The top is the live level; depth never drops
/// below one.
#[derive(Clone, Debug)]
pub struct SemStack {
    states: Vec<SemState>,
    host_method_limit: u32,
}

impl SemStack {
    pub fn new(host_method_limit: u32) -> Self {
        Self {
            states: vec![SemState::default()],
            host_method_limit,
        }
    }

    pub fn depth(&self) -> usize {
        self.states.len()
    }

    pub fn top(&self) -> &SemState {
        // Depth is at least one by construction.
        &self.states[self.states.len() - 1]
    }

    fn top_mut(&mut self) -> &mut SemState {
        let last = self.states.len() - 1;
        &mut self.states[last]
    }

    pub fn push(&mut self) {
        let snapshot = self.top().clone();
        self.states.push(snapshot);
    }

    pub fn pop(&mut self) -> Result<()> {
        if self.states.len() <= 1 {
            return Err(ContractViolation::SemaphoreStackUnderflow.into());
        }
        let popped = self.states.pop().ok_or(ContractViolation::SemaphoreStackUnderflow)?;
        let limit = self.host_method_limit;
        self.top_mut().settle(&popped, limit);
        Ok(())
    }

    /// Drop every save point and forget all cached values.
    pub fn reset(&mut self) {
        self.states = vec![SemState::default()];
    }

    pub fn record_method(&mut self, subchannel: u32, method: u32, data: u32) {
        let limit = self.host_method_limit;
        let top = self.top_mut();
        top.record((subchannel, method), data);
        top.summarize(limit);
    }

    /// Forget cached values for the current subdevice mask.
    pub fn forget_methods(&mut self, subchannel: u32, methods: impl IntoIterator<Item = u32>) {
        let limit = self.host_method_limit;
        let top = self.top_mut();
        let mask = top.subdevice_mask;
        for method in methods {
            top.cut((subchannel, method), mask);
        }
        top.summarize(limit);
    }

    pub fn set_subdevice_mask(&mut self, mask: u32) {
        let top = self.top_mut();
        top.subdevice_mask = mask;
        top.dirty.remove(DirtyFields::MASK);
    }

    pub fn set_sem_offset(&mut self, offset: u64) {
        let top = self.top_mut();
        top.sem_offset = offset;
        top.dirty.remove(DirtyFields::OFFSET);
    }

    pub fn set_release_flags(&mut self, flags: ReleaseFlags) {
        let top = self.top_mut();
        top.release_flags = flags;
        top.dirty.remove(DirtyFields::RELEASE_FLAGS);
    }

    pub fn set_payload_size(&mut self, size: SemaphorePayloadSize) {
        let top = self.top_mut();
        top.payload_size = size;
        top.dirty.remove(DirtyFields::PAYLOAD_SIZE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const HOST_LIMIT: u32 = 0x100;

    #[test]
    fn pop_at_depth_one_underflows() {
        let mut stack = SemStack::new(HOST_LIMIT);
        assert_eq!(
            stack.pop(),
            Err(ContractViolation::SemaphoreStackUnderflow.into())
        );
        assert_eq!(stack.depth(), 1);
    }

    #[test]
    fn overwritten_scalar_becomes_dirty_and_unchanged_one_does_not() {
        let mut stack = SemStack::new(HOST_LIMIT);
        stack.set_sem_offset(0x1000);
        stack.set_release_flags(ReleaseFlags::WAIT_FOR_IDLE);

        stack.push();
        stack.set_sem_offset(0x2000);
        stack.set_release_flags(ReleaseFlags::WAIT_FOR_IDLE);
        stack.pop().unwrap();

        assert_eq!(stack.top().dirty_fields(), DirtyFields::OFFSET);
        assert_eq!(stack.top().sem_offset, 0x1000);
    }

    #[test]
    fn writing_the_value_back_clears_dirtiness() {
        let mut stack = SemStack::new(HOST_LIMIT);
        stack.record_method(1, 0x240, 7);
        stack.push();
        stack.record_method(1, 0x240, 9);
        stack.pop().unwrap();
        assert_eq!(stack.top().dirty_subchannels(), 1 << 1);
        assert!(!stack.top().host_dirty());

        stack.record_method(1, 0x240, 7);
        assert!(!stack.top().is_dirty());
    }

    #[test]
    fn dirtiness_inherited_from_a_nested_level_survives_the_pop() {
        let mut stack = SemStack::new(HOST_LIMIT);
        stack.record_method(0, 0x10, 1);

        stack.push();
        stack.push();
        stack.record_method(0, 0x10, 2);
        stack.pop().unwrap();
        // The middle level now holds 1 but the channel holds 2.
        assert!(stack.top().host_dirty());
        stack.pop().unwrap();
        assert!(stack.top().host_dirty());
        assert_eq!(
            stack.top().stale_values(),
            vec![StaleValue {
                subchannel: 0,
                method: 0x10,
                subdevice_mask: ALL_SUBDEVICES,
                data: 1
            }]
        );
    }

    #[test]
    fn per_subdevice_values_only_restore_the_stale_pattern() {
        let mut stack = SemStack::new(HOST_LIMIT);
        stack.set_subdevice_mask(0x1);
        stack.record_method(2, 0x244, 0xA);
        stack.set_subdevice_mask(0x2);
        stack.record_method(2, 0x244, 0xB);

        stack.push();
        stack.set_subdevice_mask(0x2);
        stack.record_method(2, 0x244, 0xC);
        stack.pop().unwrap();

        assert_eq!(
            stack.top().stale_values(),
            vec![StaleValue {
                subchannel: 2,
                method: 0x244,
                subdevice_mask: 0x2,
                data: 0xB
            }]
        );
    }

    #[test]
    fn forgotten_value_is_stale_for_the_outer_level() {
        let mut stack = SemStack::new(HOST_LIMIT);
        stack.record_method(3, 0x248, 5);
        stack.push();
        stack.forget_methods(3, [0x248]);
        stack.pop().unwrap();
        assert_eq!(stack.top().dirty_subchannels(), 1 << 3);
    }
}
