//! The channel capability surface shared by leaf channels and every wrapper layer.
//!
//! A wrapper is indistinguishable from the channel it wraps: both implement [`Channel`].
//! Every method has a default implementation that forwards to [`Channel::wrapped`], so a
//! wrapper layer only overrides the operations it intercepts while a leaf channel overrides
//! everything it actually implements (and leaves the rest reporting
//! [`ChannelError::Unsupported`]).
//!
//! All methods take `&self`. A chain is driven by a single logical thread, but operations can
//! re-enter the chain synchronously (for example a leaf auto-flush that calls back into the
//! outermost layer), so layers keep their state behind `Cell`/`RefCell` and never hold a borrow
//! across a call into another layer.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::atom::AtomChannelWrapper;
use crate::chain::ChainHead;
use crate::error::{ChannelError, Result};
use crate::runlist::RunlistChannelWrapper;
use crate::semaphore::SemaphoreChannelWrapper;

/// Subdevice mask that broadcasts to every subdevice.
pub const ALL_SUBDEVICES: u32 = 0xFFF;

/// Handle of an object instantiated on a channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectHandle(pub u32);

/// Identifier of the engine a class executes on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EngineId(pub u32);

/// Method write flavours carrying payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteKind {
    /// Each payload word targets the next method (`method + 4 * i`).
    Incrementing,
    /// Every payload word targets the same method.
    NonIncrementing,
    /// The first word targets `method`, the rest target `method + 4`.
    IncrementOnce,
    /// A single value packed into the header word.
    Immediate,
}

impl WriteKind {
    /// Method offset targeted by payload word `index`.
    pub fn method_for_word(self, method: u32, index: usize) -> u32 {
        match self {
            Self::Incrementing => method.wrapping_add(4 * index as u32),
            Self::NonIncrementing | Self::Immediate => method,
            Self::IncrementOnce => {
                if index == 0 {
                    method
                } else {
                    method.wrapping_add(4)
                }
            }
        }
    }
}

/// Header-only writes; the payload follows later as raw words.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeaderKind {
    Incrementing,
    NonIncrementing,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SemaphorePayloadSize {
    #[default]
    Bits32,
    Bits64,
}

bitflags! {
    /// Flags applied to subsequent semaphore releases.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ReleaseFlags: u32 {
        const WAIT_FOR_IDLE = 1 << 0;
        const FLUSH_DISABLE = 1 << 1;
        const TIMESTAMP = 1 << 2;
    }
}

macro_rules! forward {
    ($self:ident, $name:literal, $call:ident ( $($arg:expr),* )) => {
        match $self.wrapped() {
            Some(inner) => inner.$call($($arg),*),
            None => Err(ChannelError::Unsupported($name)),
        }
    };
}

/// A GPU command channel, or a layer wrapping one.
pub trait Channel {
    // ---------------------------------------------------------------------
    // Chain structure and capability discovery
    // ---------------------------------------------------------------------

    /// The next-inner channel. `None` for a leaf.
    fn wrapped(&self) -> Option<&dyn Channel> {
        None
    }

    /// The head shared by every layer of this chain, if the chain has one.
    fn chain_head(&self) -> Option<ChainHead> {
        self.wrapped().and_then(|inner| inner.chain_head())
    }

    fn atom_wrapper(&self) -> Option<&AtomChannelWrapper> {
        self.wrapped().and_then(|inner| inner.atom_wrapper())
    }

    fn semaphore_wrapper(&self) -> Option<&SemaphoreChannelWrapper> {
        self.wrapped().and_then(|inner| inner.semaphore_wrapper())
    }

    fn runlist_wrapper(&self) -> Option<&RunlistChannelWrapper> {
        self.wrapped().and_then(|inner| inner.runlist_wrapper())
    }

    // ---------------------------------------------------------------------
    // Method writes
    // ---------------------------------------------------------------------

    fn write_method(
        &self,
        kind: WriteKind,
        subchannel: u32,
        method: u32,
        data: &[u32],
    ) -> Result<()> {
        forward!(self, "write_method", write_method(kind, subchannel, method, data))
    }

    fn write_header(
        &self,
        kind: HeaderKind,
        subchannel: u32,
        method: u32,
        count: u32,
    ) -> Result<()> {
        forward!(self, "write_header", write_header(kind, subchannel, method, count))
    }

    /// Format a method write into `out` instead of the push buffer.
    fn format_method(
        &self,
        out: &mut Vec<u32>,
        kind: WriteKind,
        subchannel: u32,
        method: u32,
        data: &[u32],
    ) -> Result<()> {
        forward!(self, "format_method", format_method(out, kind, subchannel, method, data))
    }

    fn format_header(
        &self,
        out: &mut Vec<u32>,
        kind: HeaderKind,
        subchannel: u32,
        method: u32,
        count: u32,
    ) -> Result<()> {
        forward!(self, "format_header", format_header(out, kind, subchannel, method, count))
    }

    fn write(&self, subchannel: u32, method: u32, data: &[u32]) -> Result<()> {
        self.write_method(WriteKind::Incrementing, subchannel, method, data)
    }

    fn write_non_inc(&self, subchannel: u32, method: u32, data: &[u32]) -> Result<()> {
        self.write_method(WriteKind::NonIncrementing, subchannel, method, data)
    }

    fn write_inc_once(&self, subchannel: u32, method: u32, data: &[u32]) -> Result<()> {
        self.write_method(WriteKind::IncrementOnce, subchannel, method, data)
    }

    fn write_immediate(&self, subchannel: u32, method: u32, data: u32) -> Result<()> {
        self.write_method(WriteKind::Immediate, subchannel, method, &[data])
    }

    fn write_nop(&self) -> Result<()> {
        forward!(self, "write_nop", write_nop())
    }

    fn write_set_subdevice(&self, mask: u32) -> Result<()> {
        forward!(self, "write_set_subdevice", write_set_subdevice(mask))
    }

    fn call_subroutine(&self, offset: u64, size: u32) -> Result<()> {
        forward!(self, "call_subroutine", call_subroutine(offset, size))
    }

    /// Copy pre-formatted words into the push buffer.
    fn insert_subroutine(&self, words: &[u32]) -> Result<()> {
        forward!(self, "insert_subroutine", insert_subroutine(words))
    }

    fn set_priv_enable(&self, enable: bool) -> Result<()> {
        forward!(self, "set_priv_enable", set_priv_enable(enable))
    }

    fn set_sync_enable(&self, enable: bool) -> Result<()> {
        forward!(self, "set_sync_enable", set_sync_enable(enable))
    }

    /// Abandon grouping of any partially accumulated atom. Leaves have nothing to do.
    fn cancel_atom(&self) -> Result<()> {
        match self.wrapped() {
            Some(inner) => inner.cancel_atom(),
            None => Ok(()),
        }
    }

    // ---------------------------------------------------------------------
    // Inserted-methods scopes
    // ---------------------------------------------------------------------

    fn begin_inserted_methods(&self) -> Result<()> {
        forward!(self, "begin_inserted_methods", begin_inserted_methods())
    }

    fn end_inserted_methods(&self) -> Result<()> {
        forward!(self, "end_inserted_methods", end_inserted_methods())
    }

    fn cancel_inserted_methods(&self) -> Result<()> {
        forward!(self, "cancel_inserted_methods", cancel_inserted_methods())
    }

    // ---------------------------------------------------------------------
    // Submission
    // ---------------------------------------------------------------------

    fn flush(&self) -> Result<()> {
        forward!(self, "flush", flush())
    }

    fn wait_idle(&self) -> Result<()> {
        forward!(self, "wait_idle", wait_idle())
    }

    fn put(&self) -> Result<u32> {
        forward!(self, "put", put())
    }

    fn set_put(&self, put: u32) -> Result<()> {
        forward!(self, "set_put", set_put(put))
    }

    fn gp_put(&self) -> Result<u32> {
        forward!(self, "gp_put", gp_put())
    }

    fn set_gp_put(&self, gp_put: u32) -> Result<()> {
        forward!(self, "set_gp_put", set_gp_put(gp_put))
    }

    /// Close the GP entry currently being written so a later pointer update cannot expose it
    /// partially.
    fn finish_open_gp_entry(&self) -> Result<()> {
        forward!(self, "finish_open_gp_entry", finish_open_gp_entry())
    }

    // ---------------------------------------------------------------------
    // Host semaphores
    // ---------------------------------------------------------------------

    fn set_semaphore_offset(&self, offset: u64) -> Result<()> {
        forward!(self, "set_semaphore_offset", set_semaphore_offset(offset))
    }

    fn semaphore_offset(&self) -> Result<u64> {
        forward!(self, "semaphore_offset", semaphore_offset())
    }

    fn set_semaphore_release_flags(&self, flags: ReleaseFlags) -> Result<()> {
        forward!(self, "set_semaphore_release_flags", set_semaphore_release_flags(flags))
    }

    fn semaphore_release_flags(&self) -> Result<ReleaseFlags> {
        forward!(self, "semaphore_release_flags", semaphore_release_flags())
    }

    fn set_semaphore_payload_size(&self, size: SemaphorePayloadSize) -> Result<()> {
        forward!(self, "set_semaphore_payload_size", set_semaphore_payload_size(size))
    }

    fn semaphore_payload_size(&self) -> Result<SemaphorePayloadSize> {
        forward!(self, "semaphore_payload_size", semaphore_payload_size())
    }

    fn semaphore_acquire(&self, payload: u64) -> Result<()> {
        forward!(self, "semaphore_acquire", semaphore_acquire(payload))
    }

    fn semaphore_release(&self, payload: u64) -> Result<()> {
        forward!(self, "semaphore_release", semaphore_release(payload))
    }

    // ---------------------------------------------------------------------
    // Objects and subchannels
    // ---------------------------------------------------------------------

    fn create_object(&self, class: u32) -> Result<ObjectHandle> {
        forward!(self, "create_object", create_object(class))
    }

    fn free_object(&self, handle: ObjectHandle) -> Result<()> {
        forward!(self, "free_object", free_object(handle))
    }

    fn set_object(&self, subchannel: u32, handle: ObjectHandle) -> Result<()> {
        forward!(self, "set_object", set_object(subchannel, handle))
    }

    fn unset_object(&self, handle: ObjectHandle) -> Result<()> {
        forward!(self, "unset_object", unset_object(handle))
    }

    fn object_class(&self, subchannel: u32) -> Result<Option<u32>> {
        forward!(self, "object_class", object_class(subchannel))
    }

    fn object_engine(&self, subchannel: u32) -> Result<Option<EngineId>> {
        forward!(self, "object_engine", object_engine(subchannel))
    }

    fn object_handle(&self, subchannel: u32) -> Result<Option<ObjectHandle>> {
        forward!(self, "object_handle", object_handle(subchannel))
    }

    /// Engine the channel was created for, if it is bound to one.
    fn engine(&self) -> Result<Option<EngineId>> {
        forward!(self, "engine", engine())
    }

    /// Classes `engine` can instantiate.
    fn supported_classes(&self, engine: EngineId) -> Result<Vec<u32>> {
        forward!(self, "supported_classes", supported_classes(engine))
    }

    fn num_subchannels(&self) -> u32 {
        self.wrapped().map_or(0, |inner| inner.num_subchannels())
    }

    // ---------------------------------------------------------------------
    // Robust-channel errors
    // ---------------------------------------------------------------------

    fn check_robust_error(&self) -> Result<()> {
        forward!(self, "check_robust_error", check_robust_error())
    }

    fn recover_from_robust_error(&self) -> Result<()> {
        forward!(self, "recover_from_robust_error", recover_from_robust_error())
    }
}
