//! Atom classification.
//!
//! The wrapper stack consumes the classifier as a black box: it only needs to know, for each
//! method it sees, where that method sits relative to an atomic sequence.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::channel::{HeaderKind, WriteKind};

/// Position of a method relative to an atomic sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AtomPhase {
    NotInAtom,
    /// First method of a new atom.
    InNewAtom,
    /// Continues the open atom.
    InAtom,
    /// Last method of the open atom (or a single-method atom).
    AtomEndsAfter,
}

impl AtomPhase {
    pub fn is_inside(self) -> bool {
        matches!(self, Self::InNewAtom | Self::InAtom)
    }
}

pub trait AtomClassifier {
    fn classify_write(
        &mut self,
        kind: WriteKind,
        subchannel: u32,
        method: u32,
        data: &[u32],
    ) -> AtomPhase;

    fn classify_header(
        &mut self,
        kind: HeaderKind,
        subchannel: u32,
        method: u32,
        count: u32,
    ) -> AtomPhase;

    /// Whether the stream is currently inside an atom.
    ///
    /// Subroutine contents cannot be parsed, so the atom wrapper asks this instead of
    /// classifying them.
    fn in_atom(&self) -> bool;

    /// Forget any partially recognised atom.
    fn cancel_atom(&mut self);

    /// Return to the initial state (after robust-channel recovery).
    fn reset(&mut self) {
        self.cancel_atom();
    }
}

/// One entry of a [`ScriptedClassifier`] table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifierRule {
    pub subchannel: u32,
    pub method: u32,
    pub phase: AtomPhase,
}

/// Table-driven classifier: each (subchannel, method) pair has a fixed phase, everything else
/// is [`AtomPhase::NotInAtom`]. Multi-word writes are classified by their first method.
#[derive(Clone, Debug, Default)]
pub struct ScriptedClassifier {
    phases: HashMap<(u32, u32), AtomPhase>,
    in_atom: bool,
    cancelled: u32,
}

impl ScriptedClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rules(rules: &[ClassifierRule]) -> Self {
        let mut classifier = Self::new();
        for rule in rules {
            classifier.set_phase(rule.subchannel, rule.method, rule.phase);
        }
        classifier
    }

    pub fn with_phase(mut self, subchannel: u32, method: u32, phase: AtomPhase) -> Self {
        self.set_phase(subchannel, method, phase);
        self
    }

    pub fn set_phase(&mut self, subchannel: u32, method: u32, phase: AtomPhase) {
        self.phases.insert((subchannel, method), phase);
    }

    /// Number of times the atom wrapper cancelled a pending atom.
    pub fn cancel_count(&self) -> u32 {
        self.cancelled
    }

    fn classify(&mut self, subchannel: u32, method: u32) -> AtomPhase {
        let phase = self
            .phases
            .get(&(subchannel, method))
            .copied()
            .unwrap_or(AtomPhase::NotInAtom);
        self.in_atom = phase.is_inside();
        phase
    }
}

impl AtomClassifier for ScriptedClassifier {
    fn classify_write(
        &mut self,
        _kind: WriteKind,
        subchannel: u32,
        method: u32,
        _data: &[u32],
    ) -> AtomPhase {
        self.classify(subchannel, method)
    }

    fn classify_header(
        &mut self,
        _kind: HeaderKind,
        subchannel: u32,
        method: u32,
        _count: u32,
    ) -> AtomPhase {
        self.classify(subchannel, method)
    }

    fn in_atom(&self) -> bool {
        self.in_atom
    }

    fn cancel_atom(&mut self) {
        if self.in_atom {
            self.cancelled += 1;
        }
        self.in_atom = false;
    }
}
