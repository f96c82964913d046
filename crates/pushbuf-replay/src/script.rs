use serde::{Deserialize, Serialize};

use pushbuf_channel::{
    ClassifierRule, HeaderKind, InsertedMethod, RecordingChannelConfig, ReleaseFlags,
    SemaphorePayloadSize, WriteKind,
};

/// A replay script: the leaf to simulate, the collaborators to plug in and the operations to
/// issue against the outermost layer.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Script {
    pub leaf: RecordingChannelConfig,
    pub classifier: Vec<ClassifierRule>,
    /// Objects bound before the first operation.
    pub objects: Vec<ScriptObject>,
    pub scheduler: SchedulerScript,
    pub ops: Vec<ScriptOp>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptObject {
    pub subchannel: u32,
    pub class: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerScript {
    pub enabled: bool,
    /// Method the scheduler writes as inserted methods after every notified flush.
    pub insert: Option<InsertedMethod>,
}

fn incrementing() -> WriteKind {
    WriteKind::Incrementing
}

fn header_incrementing() -> HeaderKind {
    HeaderKind::Incrementing
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ScriptOp {
    Write {
        #[serde(default = "incrementing")]
        kind: WriteKind,
        subchannel: u32,
        method: u32,
        data: Vec<u32>,
    },
    Header {
        #[serde(default = "header_incrementing")]
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
    InsertSubroutine {
        words: Vec<u32>,
    },
    PrivEnable {
        enable: bool,
    },
    SyncEnable {
        enable: bool,
    },
    CancelAtom,
    BeginInserted,
    EndInserted,
    CancelInserted,
    Flush,
    WaitIdle,
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
    FindSupportedClass {
        classes: Vec<u32>,
        #[serde(default)]
        allow_host: bool,
    },
}
