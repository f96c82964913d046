//! Command-channel wrapper stack.
//!
//! A chain of [`Channel`] decorators sits between callers and a raw push-buffer channel:
//!
//! - [`AtomChannelWrapper`]: delivers classifier-identified atoms as one contiguous block
//! - [`SemaphoreChannelWrapper`]: caches semaphore configuration and restores what inserted
//!   methods overwrote
//! - [`RunlistChannelWrapper`]: tells the scheduler about flushes that published work
//!
//! [`ChannelWrapperManager`] decides which layers a channel gets. [`RecordingChannel`] is an
//! in-memory leaf used by tests and the `pushbuf-replay` tool.

#![forbid(unsafe_code)]

mod atom;
mod base;
mod chain;
mod channel;
mod classify;
mod config;
mod error;
mod guard;
mod manager;
mod recording;
mod runlist;
pub mod semaphore;

pub use atom::{AtomChannelWrapper, AtomStats, ChannelOp, OpKind};
pub use base::ChannelWrapperBase;
pub use chain::ChainHead;
pub use channel::{
    Channel, EngineId, HeaderKind, ObjectHandle, ReleaseFlags, SemaphorePayloadSize, WriteKind,
    ALL_SUBDEVICES,
};
pub use classify::{AtomClassifier, AtomPhase, ClassifierRule, ScriptedClassifier};
pub use config::{WrapperConfig, WrapperLayers, RESTORE_LIMIT_ENV, WRAPPERS_ENV};
pub use error::{ChannelError, ContractViolation, Result};
pub use guard::ScopedFlag;
pub use manager::{ChannelWrapperManager, Collaborators};
pub use recording::{encode_method_header, RecordingChannel, RecordingChannelConfig, TraceEntry};
pub use runlist::{
    FlushNotification, FlushPointers, FlushRecorder, InsertedMethod, RunlistChannelWrapper,
    RunlistScheduler,
};
pub use semaphore::{SemaphoreChannelWrapper, SupportedClass};
