use crate::channel::{Channel, HeaderKind, WriteKind};
use crate::error::{ChannelError, Result};

/// What a deferred [`ChannelOp`] does when it is finally executed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpKind {
    Write(WriteKind),
    Header(HeaderKind),
    Nop,
    SetSubdevice,
    CallSubroutine,
    InsertSubroutine,
    SetPrivEnable,
    SetSyncEnable,
    CancelAtom,
    BeginInsertedMethods,
    EndInsertedMethods,
    CancelInsertedMethods,
    SemaphoreAcquire,
    SemaphoreRelease,
    /// `through_chain` flushes are re-issued from the outermost layer so the scheduler sees them.
    Flush {
        through_chain: bool,
    },
    WaitIdle,
}

impl OpKind {
    pub fn is_scope_marker(self) -> bool {
        matches!(
            self,
            Self::BeginInsertedMethods | Self::EndInsertedMethods | Self::CancelInsertedMethods
        )
    }

    /// Whether the op can be merged into a pre-formatted block during atom replay.
    pub fn is_raw_blockable(self) -> bool {
        matches!(self, Self::Write(_) | Self::Header(_) | Self::InsertSubroutine)
    }
}

/// One channel operation, recorded so it can be executed later.
///
/// For write kinds `data.len() == count`; header kinds carry no data (their payload arrives
/// separately).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelOp {
    pub kind: OpKind,
    pub subchannel: u32,
    pub method: u32,
    pub count: u32,
    pub data: Vec<u32>,
}

impl ChannelOp {
    fn new(kind: OpKind, data: Vec<u32>) -> Self {
        Self {
            kind,
            subchannel: 0,
            method: 0,
            count: data.len() as u32,
            data,
        }
    }

    pub fn write(kind: WriteKind, subchannel: u32, method: u32, data: &[u32]) -> Self {
        Self {
            subchannel,
            method,
            ..Self::new(OpKind::Write(kind), data.to_vec())
        }
    }

    pub fn header(kind: HeaderKind, subchannel: u32, method: u32, count: u32) -> Self {
        Self {
            subchannel,
            method,
            count,
            ..Self::new(OpKind::Header(kind), Vec::new())
        }
    }

    pub fn simple(kind: OpKind) -> Self {
        Self::new(kind, Vec::new())
    }

    pub fn set_subdevice(mask: u32) -> Self {
        Self::new(OpKind::SetSubdevice, vec![mask])
    }

    pub fn call_subroutine(offset: u64, size: u32) -> Self {
        Self {
            count: size,
            ..Self::new(OpKind::CallSubroutine, split_u64(offset).to_vec())
        }
    }

    pub fn insert_subroutine(words: &[u32]) -> Self {
        Self::new(OpKind::InsertSubroutine, words.to_vec())
    }

    pub fn set_priv_enable(enable: bool) -> Self {
        Self::new(OpKind::SetPrivEnable, vec![u32::from(enable)])
    }

    pub fn set_sync_enable(enable: bool) -> Self {
        Self::new(OpKind::SetSyncEnable, vec![u32::from(enable)])
    }

    pub fn semaphore(kind: OpKind, payload: u64) -> Self {
        Self::new(kind, split_u64(payload).to_vec())
    }

    pub fn flush(through_chain: bool) -> Self {
        Self::new(OpKind::Flush { through_chain }, Vec::new())
    }

    fn word(&self, index: usize) -> u32 {
        self.data.get(index).copied().unwrap_or(0)
    }

    fn wide(&self) -> u64 {
        u64::from(self.word(0)) | (u64::from(self.word(1)) << 32)
    }

    /// Append the op's push-buffer words to `out`, formatted by `channel`.
    pub fn format_into(&self, channel: &dyn Channel, out: &mut Vec<u32>) -> Result<()> {
        match self.kind {
            OpKind::Write(kind) => {
                channel.format_method(out, kind, self.subchannel, self.method, &self.data)
            }
            OpKind::Header(kind) => {
                channel.format_header(out, kind, self.subchannel, self.method, self.count)
            }
            OpKind::InsertSubroutine => {
                out.extend_from_slice(&self.data);
                Ok(())
            }
            _ => Err(ChannelError::Unsupported("op cannot be formatted into a raw block")),
        }
    }

    /// Execute the op on `channel` immediately.
    pub fn execute(&self, channel: &dyn Channel) -> Result<()> {
        match self.kind {
            OpKind::Write(kind) => {
                channel.write_method(kind, self.subchannel, self.method, &self.data)
            }
            OpKind::Header(kind) => {
                channel.write_header(kind, self.subchannel, self.method, self.count)
            }
            OpKind::Nop => channel.write_nop(),
            OpKind::SetSubdevice => channel.write_set_subdevice(self.word(0)),
            OpKind::CallSubroutine => channel.call_subroutine(self.wide(), self.count),
            OpKind::InsertSubroutine => channel.insert_subroutine(&self.data),
            OpKind::SetPrivEnable => channel.set_priv_enable(self.word(0) != 0),
            OpKind::SetSyncEnable => channel.set_sync_enable(self.word(0) != 0),
            OpKind::CancelAtom => channel.cancel_atom(),
            OpKind::BeginInsertedMethods => channel.begin_inserted_methods(),
            OpKind::EndInsertedMethods => channel.end_inserted_methods(),
            OpKind::CancelInsertedMethods => channel.cancel_inserted_methods(),
            OpKind::SemaphoreAcquire => channel.semaphore_acquire(self.wide()),
            OpKind::SemaphoreRelease => channel.semaphore_release(self.wide()),
            OpKind::Flush { .. } => channel.flush(),
            OpKind::WaitIdle => channel.wait_idle(),
        }
    }
}

fn split_u64(value: u64) -> [u32; 2] {
    [value as u32, (value >> 32) as u32]
}
