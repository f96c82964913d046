//! Replays channel operation scripts through a wrapper chain over the in-memory leaf channel.

#![forbid(unsafe_code)]

mod script;

pub use script::{SchedulerScript, Script, ScriptObject, ScriptOp};

use std::io::Read;
use std::rc::Rc;

use serde::Serialize;
use thiserror::Error;

use pushbuf_channel::{
    AtomStats, Channel, ChannelError, ChannelWrapperManager, Collaborators, FlushNotification,
    FlushRecorder, RecordingChannel, ScriptedClassifier, SupportedClass, TraceEntry,
    WrapperConfig,
};

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("failed to read script: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid script: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("failed to set up channel: {0}")]
    Setup(#[source] ChannelError),

    #[error("op #{index} ({op}) failed: {source}")]
    Op {
        index: usize,
        op: String,
        #[source]
        source: ChannelError,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Resolution {
    pub op_index: usize,
    pub classes: Vec<u32>,
    pub result: SupportedClass,
}

/// Everything observed while replaying a script.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    pub trace: Vec<TraceEntry>,
    pub notifications: Vec<FlushNotification>,
    pub resolutions: Vec<Resolution>,
    pub atom_stats: Option<AtomStats>,
    pub semaphore_restores: Option<u64>,
}

pub fn read_script(reader: impl Read) -> Result<Script, ReplayError> {
    Ok(serde_json::from_reader(reader)?)
}

pub fn replay(script: &Script, config: &WrapperConfig) -> Result<ReplayReport, ReplayError> {
    let leaf = Rc::new(RecordingChannel::new(script.leaf.clone()));
    for object in &script.objects {
        let handle = leaf.create_object(object.class).map_err(ReplayError::Setup)?;
        leaf.set_object(object.subchannel, handle)
            .map_err(ReplayError::Setup)?;
    }
    // Setup is not part of the replayed stream.
    leaf.take_trace();

    let scheduler = script.scheduler.enabled.then(|| {
        Rc::new(match script.scheduler.insert {
            Some(method) => FlushRecorder::inserting(method),
            None => FlushRecorder::new(),
        })
    });
    let mut collaborators =
        Collaborators::new().with_classifier(ScriptedClassifier::from_rules(&script.classifier));
    if let Some(scheduler) = &scheduler {
        collaborators = collaborators.with_scheduler(scheduler.clone());
    }

    let outer = ChannelWrapperManager::new(config.clone())
        .wrap_channel(leaf.clone(), collaborators)
        .map_err(ReplayError::Setup)?;

    let mut resolutions = Vec::new();
    for (index, op) in script.ops.iter().enumerate() {
        tracing::trace!(index, ?op, "replaying op");
        let result = match op {
            ScriptOp::FindSupportedClass {
                classes,
                allow_host,
            } => find_supported_class(&*outer, classes, *allow_host).map(|result| {
                resolutions.push(Resolution {
                    op_index: index,
                    classes: classes.clone(),
                    result,
                });
            }),
            op => apply(&*outer, op),
        };
        result.map_err(|source| ReplayError::Op {
            index,
            op: format!("{op:?}"),
            source,
        })?;
    }

    let atom_stats = outer.atom_wrapper().map(|atom| atom.stats());
    let semaphore_restores = outer.semaphore_wrapper().map(|sem| sem.restore_count());
    drop(outer);

    Ok(ReplayReport {
        trace: leaf.take_trace(),
        notifications: scheduler.map(|s| s.notifications()).unwrap_or_default(),
        resolutions,
        atom_stats,
        semaphore_restores,
    })
}

fn find_supported_class(
    channel: &dyn Channel,
    classes: &[u32],
    allow_host: bool,
) -> Result<SupportedClass, ChannelError> {
    match channel.semaphore_wrapper() {
        Some(sem) => sem.find_supported_class(classes, allow_host),
        None => Err(ChannelError::Unsupported("no semaphore layer in this chain")),
    }
}

fn apply(channel: &dyn Channel, op: &ScriptOp) -> Result<(), ChannelError> {
    match op {
        ScriptOp::Write {
            kind,
            subchannel,
            method,
            data,
        } => channel.write_method(*kind, *subchannel, *method, data),
        ScriptOp::Header {
            kind,
            subchannel,
            method,
            count,
        } => channel.write_header(*kind, *subchannel, *method, *count),
        ScriptOp::Nop => channel.write_nop(),
        ScriptOp::SetSubdevice { mask } => channel.write_set_subdevice(*mask),
        ScriptOp::CallSubroutine { offset, size } => channel.call_subroutine(*offset, *size),
        ScriptOp::InsertSubroutine { words } => channel.insert_subroutine(words),
        ScriptOp::PrivEnable { enable } => channel.set_priv_enable(*enable),
        ScriptOp::SyncEnable { enable } => channel.set_sync_enable(*enable),
        ScriptOp::CancelAtom => channel.cancel_atom(),
        ScriptOp::BeginInserted => channel.begin_inserted_methods(),
        ScriptOp::EndInserted => channel.end_inserted_methods(),
        ScriptOp::CancelInserted => channel.cancel_inserted_methods(),
        ScriptOp::Flush => channel.flush(),
        ScriptOp::WaitIdle => channel.wait_idle(),
        ScriptOp::SemaphoreOffset { offset } => channel.set_semaphore_offset(*offset),
        ScriptOp::SemaphoreReleaseFlags { flags } => channel.set_semaphore_release_flags(*flags),
        ScriptOp::SemaphorePayloadSize { size } => channel.set_semaphore_payload_size(*size),
        ScriptOp::SemaphoreAcquire { payload } => channel.semaphore_acquire(*payload),
        ScriptOp::SemaphoreRelease { payload } => channel.semaphore_release(*payload),
        ScriptOp::FindSupportedClass {
            classes,
            allow_host,
        } => find_supported_class(channel, classes, *allow_host).map(|_| ()),
    }
}

/// One-line human readable form of a trace entry.
pub fn format_entry(entry: &TraceEntry) -> String {
    match entry {
        TraceEntry::Method {
            kind,
            subchannel,
            method,
            data,
        } => format!("method {kind:?} subch={subchannel} method={method:#x} data={data:x?}"),
        TraceEntry::Header {
            kind,
            subchannel,
            method,
            count,
        } => format!("header {kind:?} subch={subchannel} method={method:#x} count={count}"),
        TraceEntry::RawBlock { words } => format!("raw_block words={words:08x?}"),
        TraceEntry::CallSubroutine { offset, size } => {
            format!("call_subroutine offset={offset:#x} size={size}")
        }
        TraceEntry::SetSubdevice { mask } => format!("set_subdevice mask={mask:#x}"),
        TraceEntry::SemaphoreOffset { offset } => format!("semaphore_offset {offset:#x}"),
        other => serde_json::to_string(other).unwrap_or_else(|_| format!("{other:?}")),
    }
}
