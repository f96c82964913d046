//! In-memory leaf channel.
//!
//! [`RecordingChannel`] stands in for a real push-buffer channel: it records every leaf
//! operation as a [`TraceEntry`], keeps PUT/GP-PUT bookkeeping and an object table, and can
//! simulate an automatic flush that re-enters the chain from its outermost layer. It backs the
//! wrapper tests and the `pushbuf-replay` tool.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::chain::ChainHead;
use crate::channel::{
    Channel, EngineId, HeaderKind, ObjectHandle, ReleaseFlags, SemaphorePayloadSize, WriteKind,
};
use crate::error::{ChannelError, ContractViolation, Result};
use crate::guard::ScopedFlag;

const OPCODE_INC: u32 = 1;
const OPCODE_NON_INC: u32 = 3;
const OPCODE_IMMEDIATE: u32 = 4;
const OPCODE_INC_ONCE: u32 = 5;

/// Encode a method header word.
///
/// Layout: `opcode[31:29] count[28:16] subchannel[15:13] method_dword[12:0]`. Immediate writes
/// carry their 13-bit payload in the count field.
pub fn encode_method_header(opcode: u32, count: u32, subchannel: u32, method: u32) -> u32 {
    (opcode << 29)
        | ((count & 0x1FFF) << 16)
        | ((subchannel & 0x7) << 13)
        | ((method >> 2) & 0x1FFF)
}

fn write_opcode(kind: WriteKind) -> u32 {
    match kind {
        WriteKind::Incrementing => OPCODE_INC,
        WriteKind::NonIncrementing => OPCODE_NON_INC,
        WriteKind::IncrementOnce => OPCODE_INC_ONCE,
        WriteKind::Immediate => OPCODE_IMMEDIATE,
    }
}

fn header_opcode(kind: HeaderKind) -> u32 {
    match kind {
        HeaderKind::Incrementing => OPCODE_INC,
        HeaderKind::NonIncrementing => OPCODE_NON_INC,
    }
}

/// One operation observed by the leaf channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TraceEntry {
    Method {
        kind: WriteKind,
        subchannel: u32,
        method: u32,
        data: Vec<u32>,
    },
    Header {
        kind: HeaderKind,
        subchannel: u32,
        method: u32,
        count: u32,
    },
    Nop,
    SetSubdevice {
        mask: u32,
    },
    CallSubroutine {
        offset: u64,
        size: u32,
    },
    RawBlock {
        words: Vec<u32>,
    },
    PrivEnable {
        enable: bool,
    },
    SyncEnable {
        enable: bool,
    },
    BeginInsertedMethods,
    EndInsertedMethods,
    CancelInsertedMethods,
    Flush,
    WaitIdle,
    FinishGpEntry,
    SetPut {
        put: u32,
    },
    SetGpPut {
        gp_put: u32,
    },
    SemaphoreOffset {
        offset: u64,
    },
    SemaphoreReleaseFlags {
        flags: ReleaseFlags,
    },
    SemaphorePayloadSize {
        size: SemaphorePayloadSize,
    },
    SemaphoreAcquire {
        payload: u64,
    },
    SemaphoreRelease {
        payload: u64,
    },
    CreateObject {
        class: u32,
        handle: ObjectHandle,
    },
    FreeObject {
        handle: ObjectHandle,
    },
    SetObject {
        subchannel: u32,
        handle: ObjectHandle,
    },
    UnsetObject {
        handle: ObjectHandle,
    },
    RecoverFromRobustError,
}

/// Static description of what a [`RecordingChannel`] can instantiate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingChannelConfig {
    pub num_subchannels: u32,
    /// Engine the channel was created for.
    pub engine: Option<EngineId>,
    /// Classes and the engine each executes on.
    pub classes: Vec<(u32, EngineId)>,
    /// Maximum words per GP entry before a new entry is opened. `0` means unlimited.
    pub gp_entry_words: u32,
    /// Flush the outermost layer automatically once this many words were written since the
    /// last flush.
    pub auto_flush_words: Option<u32>,
}

impl Default for RecordingChannelConfig {
    fn default() -> Self {
        Self {
            num_subchannels: 8,
            engine: None,
            classes: Vec::new(),
            gp_entry_words: 0,
            auto_flush_words: None,
        }
    }
}

#[derive(Debug, Default)]
struct LeafState {
    trace: Vec<TraceEntry>,
    put: u32,
    gp_put: u32,
    open_entry_words: u32,
    words_since_flush: u32,
    next_handle: u32,
    objects: HashMap<ObjectHandle, u32>,
    subchannels: Vec<Option<ObjectHandle>>,
    sem_offset: u64,
    release_flags: ReleaseFlags,
    payload_size: SemaphorePayloadSize,
    inserted_depth: u32,
    robust_error: Option<String>,
}

#[derive(Debug)]
pub struct RecordingChannel {
    config: RecordingChannelConfig,
    class_engines: HashMap<u32, EngineId>,
    state: RefCell<LeafState>,
    head: ChainHead,
    auto_flushing: Cell<bool>,
}

impl RecordingChannel {
    pub fn new(config: RecordingChannelConfig) -> Self {
        let class_engines = config.classes.iter().copied().collect();
        let state = LeafState {
            next_handle: 1,
            subchannels: vec![None; config.num_subchannels as usize],
            ..LeafState::default()
        };
        Self {
            config,
            class_engines,
            state: RefCell::new(state),
            head: ChainHead::new(),
            auto_flushing: Cell::new(false),
        }
    }

    pub fn config(&self) -> &RecordingChannelConfig {
        &self.config
    }

    pub fn trace(&self) -> Vec<TraceEntry> {
        self.state.borrow().trace.clone()
    }

    pub fn take_trace(&self) -> Vec<TraceEntry> {
        std::mem::take(&mut self.state.borrow_mut().trace)
    }

    /// Make every push-buffer operation fail until [`Channel::recover_from_robust_error`].
    pub fn inject_robust_error(&self, message: impl Into<String>) {
        self.state.borrow_mut().robust_error = Some(message.into());
    }

    pub fn inserted_depth(&self) -> u32 {
        self.state.borrow().inserted_depth
    }

    fn check_subchannel(&self, subchannel: u32) -> Result<()> {
        if subchannel >= self.config.num_subchannels {
            return Err(ChannelError::InvalidSubchannel(subchannel));
        }
        Ok(())
    }

    fn check_healthy(&self) -> Result<()> {
        match &self.state.borrow().robust_error {
            Some(message) => Err(ChannelError::RobustChannel(message.clone())),
            None => Ok(()),
        }
    }

    /// Record a push-buffer operation of `words` words, then run the auto-flush hook.
    fn push(&self, entry: TraceEntry, words: u32) -> Result<()> {
        let auto_flush = {
            let mut state = self.state.borrow_mut();
            let limit = self.config.gp_entry_words;
            if limit != 0 && state.open_entry_words != 0 && state.open_entry_words + words > limit {
                state.gp_put = state.gp_put.wrapping_add(1);
                state.open_entry_words = 0;
            }
            state.trace.push(entry);
            state.put = state.put.wrapping_add(words);
            state.open_entry_words += words;
            state.words_since_flush += words;
            self.config
                .auto_flush_words
                .is_some_and(|limit| state.words_since_flush >= limit)
        };

        if auto_flush && !self.auto_flushing.get() {
            let _guard = ScopedFlag::raise(&self.auto_flushing);
            tracing::trace!("recording channel auto-flush");
            match self.head.outermost() {
                Some(outermost) => outermost.flush()?,
                None => self.flush()?,
            }
        }
        Ok(())
    }

    fn record(&self, entry: TraceEntry) {
        self.state.borrow_mut().trace.push(entry);
    }

    fn close_open_entry(state: &mut LeafState) {
        if state.open_entry_words != 0 {
            state.gp_put = state.gp_put.wrapping_add(1);
            state.open_entry_words = 0;
        }
    }
}

impl Default for RecordingChannel {
    fn default() -> Self {
        Self::new(RecordingChannelConfig::default())
    }
}

impl Channel for RecordingChannel {
    fn chain_head(&self) -> Option<ChainHead> {
        Some(self.head.clone())
    }

    fn write_method(
        &self,
        kind: WriteKind,
        subchannel: u32,
        method: u32,
        data: &[u32],
    ) -> Result<()> {
        self.check_subchannel(subchannel)?;
        self.check_healthy()?;
        let words = match kind {
            WriteKind::Immediate => 1,
            _ => 1 + data.len() as u32,
        };
        self.push(
            TraceEntry::Method {
                kind,
                subchannel,
                method,
                data: data.to_vec(),
            },
            words,
        )
    }

    fn write_header(
        &self,
        kind: HeaderKind,
        subchannel: u32,
        method: u32,
        count: u32,
    ) -> Result<()> {
        self.check_subchannel(subchannel)?;
        self.check_healthy()?;
        self.push(
            TraceEntry::Header {
                kind,
                subchannel,
                method,
                count,
            },
            1,
        )
    }

    fn format_method(
        &self,
        out: &mut Vec<u32>,
        kind: WriteKind,
        subchannel: u32,
        method: u32,
        data: &[u32],
    ) -> Result<()> {
        self.check_subchannel(subchannel)?;
        match kind {
            WriteKind::Immediate => {
                let value = data.first().copied().unwrap_or(0);
                out.push(encode_method_header(write_opcode(kind), value, subchannel, method));
            }
            _ => {
                let count = data.len() as u32;
                out.push(encode_method_header(write_opcode(kind), count, subchannel, method));
                out.extend_from_slice(data);
            }
        }
        Ok(())
    }

    fn format_header(
        &self,
        out: &mut Vec<u32>,
        kind: HeaderKind,
        subchannel: u32,
        method: u32,
        count: u32,
    ) -> Result<()> {
        self.check_subchannel(subchannel)?;
        out.push(encode_method_header(header_opcode(kind), count, subchannel, method));
        Ok(())
    }

    fn write_nop(&self) -> Result<()> {
        self.check_healthy()?;
        self.push(TraceEntry::Nop, 1)
    }

    fn write_set_subdevice(&self, mask: u32) -> Result<()> {
        self.check_healthy()?;
        self.push(TraceEntry::SetSubdevice { mask }, 1)
    }

    fn call_subroutine(&self, offset: u64, size: u32) -> Result<()> {
        self.check_healthy()?;
        {
            // A subroutine call occupies a GP entry of its own.
            let mut state = self.state.borrow_mut();
            Self::close_open_entry(&mut state);
            state.gp_put = state.gp_put.wrapping_add(1);
        }
        self.push(TraceEntry::CallSubroutine { offset, size }, 0)
    }

    fn insert_subroutine(&self, words: &[u32]) -> Result<()> {
        self.check_healthy()?;
        self.push(
            TraceEntry::RawBlock {
                words: words.to_vec(),
            },
            words.len() as u32,
        )
    }

    fn set_priv_enable(&self, enable: bool) -> Result<()> {
        self.check_healthy()?;
        self.push(TraceEntry::PrivEnable { enable }, 0)
    }

    fn set_sync_enable(&self, enable: bool) -> Result<()> {
        self.check_healthy()?;
        self.push(TraceEntry::SyncEnable { enable }, 0)
    }

    fn begin_inserted_methods(&self) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.inserted_depth += 1;
        state.trace.push(TraceEntry::BeginInsertedMethods);
        Ok(())
    }

    fn end_inserted_methods(&self) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.inserted_depth == 0 {
            return Err(ContractViolation::UnbalancedEndInsertedMethods.into());
        }
        state.inserted_depth -= 1;
        state.trace.push(TraceEntry::EndInsertedMethods);
        Ok(())
    }

    fn cancel_inserted_methods(&self) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.inserted_depth == 0 {
            return Err(ContractViolation::CancelWithoutInsertedMethods.into());
        }
        state.inserted_depth -= 1;
        state.trace.push(TraceEntry::CancelInsertedMethods);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.check_healthy()?;
        let mut state = self.state.borrow_mut();
        Self::close_open_entry(&mut state);
        state.words_since_flush = 0;
        state.trace.push(TraceEntry::Flush);
        Ok(())
    }

    fn wait_idle(&self) -> Result<()> {
        self.check_healthy()?;
        self.record(TraceEntry::WaitIdle);
        Ok(())
    }

    fn put(&self) -> Result<u32> {
        Ok(self.state.borrow().put)
    }

    fn set_put(&self, put: u32) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.put = put;
        state.trace.push(TraceEntry::SetPut { put });
        Ok(())
    }

    fn gp_put(&self) -> Result<u32> {
        Ok(self.state.borrow().gp_put)
    }

    fn set_gp_put(&self, gp_put: u32) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.gp_put = gp_put;
        state.open_entry_words = 0;
        state.trace.push(TraceEntry::SetGpPut { gp_put });
        Ok(())
    }

    fn finish_open_gp_entry(&self) -> Result<()> {
        let mut state = self.state.borrow_mut();
        Self::close_open_entry(&mut state);
        state.trace.push(TraceEntry::FinishGpEntry);
        Ok(())
    }

    fn set_semaphore_offset(&self, offset: u64) -> Result<()> {
        self.state.borrow_mut().sem_offset = offset;
        self.record(TraceEntry::SemaphoreOffset { offset });
        Ok(())
    }

    fn semaphore_offset(&self) -> Result<u64> {
        Ok(self.state.borrow().sem_offset)
    }

    fn set_semaphore_release_flags(&self, flags: ReleaseFlags) -> Result<()> {
        self.state.borrow_mut().release_flags = flags;
        self.record(TraceEntry::SemaphoreReleaseFlags { flags });
        Ok(())
    }

    fn semaphore_release_flags(&self) -> Result<ReleaseFlags> {
        Ok(self.state.borrow().release_flags)
    }

    fn set_semaphore_payload_size(&self, size: SemaphorePayloadSize) -> Result<()> {
        self.state.borrow_mut().payload_size = size;
        self.record(TraceEntry::SemaphorePayloadSize { size });
        Ok(())
    }

    fn semaphore_payload_size(&self) -> Result<SemaphorePayloadSize> {
        Ok(self.state.borrow().payload_size)
    }

    fn semaphore_acquire(&self, payload: u64) -> Result<()> {
        self.check_healthy()?;
        // Host semaphore: address hi/lo, payload and execute.
        self.push(TraceEntry::SemaphoreAcquire { payload }, 5)
    }

    fn semaphore_release(&self, payload: u64) -> Result<()> {
        self.check_healthy()?;
        self.push(TraceEntry::SemaphoreRelease { payload }, 5)
    }

    fn create_object(&self, class: u32) -> Result<ObjectHandle> {
        if !self.class_engines.contains_key(&class) {
            return Err(ChannelError::Unsupported("class not available on this channel"));
        }
        let mut state = self.state.borrow_mut();
        let handle = ObjectHandle(state.next_handle);
        state.next_handle += 1;
        state.objects.insert(handle, class);
        state.trace.push(TraceEntry::CreateObject { class, handle });
        Ok(handle)
    }

    fn free_object(&self, handle: ObjectHandle) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.objects.remove(&handle).is_none() {
            return Err(ChannelError::UnknownObject(handle));
        }
        for slot in state.subchannels.iter_mut() {
            if *slot == Some(handle) {
                *slot = None;
            }
        }
        state.trace.push(TraceEntry::FreeObject { handle });
        Ok(())
    }

    fn set_object(&self, subchannel: u32, handle: ObjectHandle) -> Result<()> {
        self.check_subchannel(subchannel)?;
        let mut state = self.state.borrow_mut();
        if !state.objects.contains_key(&handle) {
            return Err(ChannelError::UnknownObject(handle));
        }
        state.subchannels[subchannel as usize] = Some(handle);
        state.trace.push(TraceEntry::SetObject { subchannel, handle });
        Ok(())
    }

    fn unset_object(&self, handle: ObjectHandle) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if !state.objects.contains_key(&handle) {
            return Err(ChannelError::UnknownObject(handle));
        }
        for slot in state.subchannels.iter_mut() {
            if *slot == Some(handle) {
                *slot = None;
            }
        }
        state.trace.push(TraceEntry::UnsetObject { handle });
        Ok(())
    }

    fn object_class(&self, subchannel: u32) -> Result<Option<u32>> {
        self.check_subchannel(subchannel)?;
        let state = self.state.borrow();
        Ok(state.subchannels[subchannel as usize]
            .and_then(|handle| state.objects.get(&handle).copied()))
    }

    fn object_engine(&self, subchannel: u32) -> Result<Option<EngineId>> {
        Ok(self
            .object_class(subchannel)?
            .and_then(|class| self.class_engines.get(&class).copied()))
    }

    fn object_handle(&self, subchannel: u32) -> Result<Option<ObjectHandle>> {
        self.check_subchannel(subchannel)?;
        Ok(self.state.borrow().subchannels[subchannel as usize])
    }

    fn engine(&self) -> Result<Option<EngineId>> {
        Ok(self.config.engine)
    }

    fn supported_classes(&self, engine: EngineId) -> Result<Vec<u32>> {
        Ok(self
            .config
            .classes
            .iter()
            .filter(|(_, class_engine)| *class_engine == engine)
            .map(|(class, _)| *class)
            .collect())
    }

    fn num_subchannels(&self) -> u32 {
        self.config.num_subchannels
    }

    fn check_robust_error(&self) -> Result<()> {
        self.check_healthy()
    }

    fn recover_from_robust_error(&self) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.robust_error = None;
        state.inserted_depth = 0;
        state.trace.push(TraceEntry::RecoverFromRobustError);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COPY_CLASS: u32 = 0xC5B5;
    const COPY_ENGINE: EngineId = EngineId(2);

    fn channel(config: RecordingChannelConfig) -> RecordingChannel {
        RecordingChannel::new(RecordingChannelConfig {
            classes: vec![(COPY_CLASS, COPY_ENGINE)],
            ..config
        })
    }

    #[test]
    fn put_counts_header_and_payload_words() {
        let ch = channel(RecordingChannelConfig::default());
        ch.write(0, 0x100, &[1, 2, 3]).unwrap();
        ch.write_immediate(0, 0x200, 7).unwrap();
        assert_eq!(ch.put().unwrap(), 4 + 1);
    }

    #[test]
    fn gp_entries_split_at_configured_size() {
        let ch = channel(RecordingChannelConfig {
            gp_entry_words: 4,
            ..Default::default()
        });
        ch.write(0, 0x100, &[1, 2]).unwrap();
        assert_eq!(ch.gp_put().unwrap(), 0);
        ch.write(0, 0x100, &[1, 2]).unwrap();
        assert_eq!(ch.gp_put().unwrap(), 1, "second write must open a new entry");
        ch.flush().unwrap();
        assert_eq!(ch.gp_put().unwrap(), 2);
        // Nothing open: flushing again does not advance.
        ch.flush().unwrap();
        assert_eq!(ch.gp_put().unwrap(), 2);
    }

    #[test]
    fn format_method_matches_header_layout() {
        let ch = channel(RecordingChannelConfig::default());
        let mut out = Vec::new();
        ch.format_method(&mut out, WriteKind::Incrementing, 3, 0x100, &[0xAA, 0xBB])
            .unwrap();
        assert_eq!(out, vec![(1 << 29) | (2 << 16) | (3 << 13) | 0x40, 0xAA, 0xBB]);

        out.clear();
        ch.format_method(&mut out, WriteKind::Immediate, 0, 0x10, &[5]).unwrap();
        assert_eq!(out, vec![(4 << 29) | (5 << 16) | 0x4]);
    }

    #[test]
    fn objects_bind_and_report_class_and_engine() {
        let ch = channel(RecordingChannelConfig::default());
        let handle = ch.create_object(COPY_CLASS).unwrap();
        ch.set_object(4, handle).unwrap();
        assert_eq!(ch.object_class(4).unwrap(), Some(COPY_CLASS));
        assert_eq!(ch.object_engine(4).unwrap(), Some(COPY_ENGINE));
        assert_eq!(ch.supported_classes(COPY_ENGINE).unwrap(), vec![COPY_CLASS]);

        ch.unset_object(handle).unwrap();
        assert_eq!(ch.object_class(4).unwrap(), None);
        assert!(matches!(
            ch.create_object(0x1234),
            Err(ChannelError::Unsupported(_))
        ));
    }

    #[test]
    fn robust_error_blocks_writes_until_recovered() {
        let ch = channel(RecordingChannelConfig::default());
        ch.inject_robust_error("mmu fault");
        assert_eq!(
            ch.write(0, 0x100, &[1]),
            Err(ChannelError::RobustChannel("mmu fault".into()))
        );
        ch.recover_from_robust_error().unwrap();
        ch.write(0, 0x100, &[1]).unwrap();
    }

    #[test]
    fn rejects_out_of_range_subchannel() {
        let ch = channel(RecordingChannelConfig::default());
        assert_eq!(
            ch.write(8, 0x100, &[1]),
            Err(ChannelError::InvalidSubchannel(8))
        );
    }

    #[test]
    fn unbalanced_end_is_rejected() {
        let ch = channel(RecordingChannelConfig::default());
        assert_eq!(
            ch.end_inserted_methods(),
            Err(ContractViolation::UnbalancedEndInsertedMethods.into())
        );
    }
}
