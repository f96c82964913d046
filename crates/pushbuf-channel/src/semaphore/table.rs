//! Per-class semaphore method tables.
//!
//! Which methods make up "semaphore configuration" is hardware-generation specific, so the
//! tables are plain data loaded with the rest of [`crate::WrapperConfig`]. They are taken at
//! face value; nothing checks that a table lists every method a class has.

use serde::{Deserialize, Serialize};

/// Methods below this offset are host (channel-level) methods on every class.
pub const DEFAULT_HOST_METHOD_LIMIT: u32 = 0x100;

/// One tracked semaphore method.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SemaphoreMethod {
    pub method: u32,
    /// Methods whose cached values the hardware forgets once this method is written.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub invalidates: Vec<u32>,
    /// Writing this method launches an operation. Its value is never cached or written back.
    #[serde(default)]
    pub trigger: bool,
}

impl SemaphoreMethod {
    pub fn new(method: u32) -> Self {
        Self {
            method,
            invalidates: Vec::new(),
            trigger: false,
        }
    }

    pub fn invalidating(method: u32, invalidates: &[u32]) -> Self {
        Self {
            invalidates: invalidates.to_vec(),
            ..Self::new(method)
        }
    }

    /// A launch method that consumes the listed latches.
    pub fn trigger(method: u32, invalidates: &[u32]) -> Self {
        Self {
            trigger: true,
            ..Self::invalidating(method, invalidates)
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SemaphoreClassTable {
    pub class: u32,
    pub methods: Vec<SemaphoreMethod>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SemaphoreTables {
    pub host_method_limit: u32,
    pub host: Vec<SemaphoreMethod>,
    pub classes: Vec<SemaphoreClassTable>,
}

impl Default for SemaphoreTables {
    fn default() -> Self {
        // Semaphore address (upper/lower), payload and execute, per class family.
        let report = |class| SemaphoreClassTable {
            class,
            methods: vec![
                SemaphoreMethod::new(0x1b00),
                SemaphoreMethod::new(0x1b04),
                SemaphoreMethod::new(0x1b08),
                SemaphoreMethod::trigger(0x1b0c, &[0x1b08]),
            ],
        };
        let copy = |class| SemaphoreClassTable {
            class,
            methods: vec![
                SemaphoreMethod::new(0x240),
                SemaphoreMethod::new(0x244),
                SemaphoreMethod::new(0x248),
                SemaphoreMethod::trigger(0x300, &[0x248]),
            ],
        };

        Self {
            host_method_limit: DEFAULT_HOST_METHOD_LIMIT,
            host: vec![
                SemaphoreMethod::new(0x10),
                SemaphoreMethod::new(0x14),
                SemaphoreMethod::new(0x18),
                // The 64-bit payload upper half shares the payload latch.
                SemaphoreMethod::invalidating(0x1c, &[0x18]),
            ],
            classes: vec![
                report(0xC597),
                report(0xC6C0),
                report(0xC797),
                report(0xC7C0),
                copy(0xC5B5),
                copy(0xC7B5),
            ],
        }
    }
}

impl SemaphoreTables {
    pub fn is_host_method(&self, method: u32) -> bool {
        method < self.host_method_limit
    }

    /// Table entry for `method` written on a subchannel bound to `class`.
    ///
    /// Host methods resolve against the host table whatever the bound class is; engine methods
    /// need a bound class.
    pub fn lookup(&self, class: Option<u32>, method: u32) -> Option<&SemaphoreMethod> {
        if self.is_host_method(method) {
            return self.host.iter().find(|entry| entry.method == method);
        }
        let class = class?;
        self.classes
            .iter()
            .find(|table| table.class == class)?
            .methods
            .iter()
            .find(|entry| entry.method == method)
    }
}
