use std::rc::Rc;

use proptest::prelude::*;
use pushbuf_channel::{
    AtomPhase, Channel, ChannelWrapperManager, Collaborators, FlushRecorder, HeaderKind,
    InsertedMethod, RecordingChannel, RecordingChannelConfig, ScriptedClassifier, TraceEntry,
    WrapperConfig, WriteKind,
};

const PLAIN: u32 = 0x100;
const ATOM_FIRST: u32 = 0x200;
const ATOM_MIDDLE: u32 = 0x204;
const ATOM_LAST: u32 = 0x208;
const INSERTED: u32 = 0x600;

/// Classified as a continuation so a header can sit inside an atom.
const ATOM_HEADER: u32 = 0x20C;

/// Something written between the first and last method of an atom.
#[derive(Clone, Debug)]
enum Part {
    Method,
    /// Incrementing header followed by its payload as a raw subroutine.
    Header(u32),
    CallSubroutine,
    PrivEnable(bool),
    SyncEnable(bool),
}

#[derive(Clone, Debug)]
enum Step {
    Plain,
    Atom {
        parts: Vec<Part>,
        inserted_at: Option<usize>,
    },
    Inserted,
}

fn part_strategy() -> impl Strategy<Value = Part> {
    prop_oneof![
        Just(Part::Method),
        (1u32..4).prop_map(Part::Header),
        Just(Part::CallSubroutine),
        any::<bool>().prop_map(Part::PrivEnable),
        any::<bool>().prop_map(Part::SyncEnable),
    ]
}

fn step_strategy() -> impl Strategy<Value = Step> {
    prop_oneof![
        Just(Step::Plain),
        (
            prop::collection::vec(part_strategy(), 0..5),
            proptest::option::of(1usize..6),
        )
            .prop_map(|(parts, inserted_at)| Step::Atom { parts, inserted_at }),
        Just(Step::Inserted),
    ]
}

/// Collects the entries one atom is expected to produce at the leaf.
struct ExpectedAtom<'a> {
    leaf: &'a RecordingChannel,
    entries: Vec<TraceEntry>,
    block: Vec<u32>,
    calls: bool,
}

impl<'a> ExpectedAtom<'a> {
    fn new(leaf: &'a RecordingChannel) -> Self {
        Self {
            leaf,
            entries: Vec::new(),
            block: Vec::new(),
            calls: false,
        }
    }

    fn method(&mut self, method: u32, data: u32) {
        self.leaf
            .format_method(&mut self.block, WriteKind::Incrementing, 0, method, &[data])
            .unwrap();
    }

    fn header(&mut self, payload: &[u32]) {
        self.leaf
            .format_header(
                &mut self.block,
                HeaderKind::Incrementing,
                0,
                ATOM_HEADER,
                payload.len() as u32,
            )
            .unwrap();
        self.block.extend_from_slice(payload);
    }

    fn standalone(&mut self, entry: TraceEntry) {
        self.close_block();
        self.calls |= matches!(entry, TraceEntry::CallSubroutine { .. });
        self.entries.push(entry);
    }

    fn close_block(&mut self) {
        if !self.block.is_empty() {
            let words = std::mem::take(&mut self.block);
            self.entries.push(TraceEntry::RawBlock { words });
        }
    }

    fn finish(mut self) -> Vec<TraceEntry> {
        self.close_block();
        if self.calls {
            self.entries.push(TraceEntry::FinishGpEntry);
        }
        self.entries
    }
}

fn chain(auto_flush_words: Option<u32>) -> (Rc<RecordingChannel>, Rc<dyn Channel>) {
    let leaf = Rc::new(RecordingChannel::new(RecordingChannelConfig {
        auto_flush_words,
        ..Default::default()
    }));
    let classifier = ScriptedClassifier::new()
        .with_phase(0, ATOM_FIRST, AtomPhase::InNewAtom)
        .with_phase(0, ATOM_MIDDLE, AtomPhase::InAtom)
        .with_phase(0, ATOM_HEADER, AtomPhase::InAtom)
        .with_phase(0, ATOM_LAST, AtomPhase::AtomEndsAfter);
    let scheduler = Rc::new(FlushRecorder::inserting(InsertedMethod {
        subchannel: 1,
        method: 0x500,
        data: 0,
    }));
    let outer = ChannelWrapperManager::new(WrapperConfig::default())
        .wrap_channel(
            leaf.clone(),
            Collaborators::new()
                .with_classifier(classifier)
                .with_scheduler(scheduler),
        )
        .unwrap();
    (leaf, outer)
}

fn insert_scope(channel: &dyn Channel, data: u32) {
    channel.begin_inserted_methods().unwrap();
    channel.write(0, INSERTED, &[data]).unwrap();
    channel.end_inserted_methods().unwrap();
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        .. ProptestConfig::default()
    })]

    #[test]
    fn atoms_stay_contiguous_under_insertions(
        steps in prop::collection::vec(step_strategy(), 1..24),
        auto_flush_words in proptest::option::of(3u32..12),
    ) {
        let (leaf, outer) = chain(auto_flush_words);
        let mut next = 0u32;
        let mut expected_atoms = Vec::new();

        for step in &steps {
            match step {
                Step::Plain => {
                    next += 1;
                    outer.write(0, PLAIN, &[next]).unwrap();
                }
                Step::Inserted => {
                    next += 1;
                    insert_scope(&*outer, next);
                }
                Step::Atom { parts, inserted_at } => {
                    let mut expected = ExpectedAtom::new(&leaf);
                    next += 1;
                    outer.write(0, ATOM_FIRST, &[next]).unwrap();
                    expected.method(ATOM_FIRST, next);

                    for (index, part) in parts.iter().enumerate() {
                        if *inserted_at == Some(index + 1) {
                            next += 1;
                            insert_scope(&*outer, next);
                        }
                        next += 1;
                        match *part {
                            Part::Method => {
                                outer.write(0, ATOM_MIDDLE, &[next]).unwrap();
                                expected.method(ATOM_MIDDLE, next);
                            }
                            Part::Header(count) => {
                                let payload: Vec<u32> = (0..count).map(|i| next + i).collect();
                                outer
                                    .write_header(HeaderKind::Incrementing, 0, ATOM_HEADER, count)
                                    .unwrap();
                                outer.insert_subroutine(&payload).unwrap();
                                expected.header(&payload);
                            }
                            Part::CallSubroutine => {
                                let offset = u64::from(next) << 12;
                                outer.call_subroutine(offset, 8).unwrap();
                                expected.standalone(TraceEntry::CallSubroutine { offset, size: 8 });
                            }
                            Part::PrivEnable(enable) => {
                                outer.set_priv_enable(enable).unwrap();
                                expected.standalone(TraceEntry::PrivEnable { enable });
                            }
                            Part::SyncEnable(enable) => {
                                outer.set_sync_enable(enable).unwrap();
                                expected.standalone(TraceEntry::SyncEnable { enable });
                            }
                        }
                    }

                    if *inserted_at == Some(parts.len() + 1) {
                        next += 1;
                        insert_scope(&*outer, next);
                    }
                    next += 1;
                    outer.write(0, ATOM_LAST, &[next]).unwrap();
                    expected.method(ATOM_LAST, next);
                    expected_atoms.push(expected.finish());
                }
            }
        }

        // Each atom shows up as one unbroken run, in order, with no flush or inserted scope
        // in between its entries.
        let trace = leaf.trace();
        let mut cursor = 0;
        for atom in &expected_atoms {
            let found = (cursor..=trace.len().saturating_sub(atom.len()))
                .find(|&start| trace[start..].starts_with(atom));
            prop_assert!(found.is_some(), "atom {:?} not contiguous in {:?}", atom, trace);
            cursor = found.unwrap_or(cursor) + atom.len();
        }

        let split = trace.iter().any(|entry| matches!(
            entry,
            TraceEntry::Method { method, .. }
                if [ATOM_FIRST, ATOM_MIDDLE, ATOM_LAST].contains(method)
        ));
        prop_assert!(!split, "atomic method written outside its block");
        prop_assert_eq!(leaf.inserted_depth(), 0);
    }

    #[test]
    fn wait_idle_always_empties_the_atom_queue(
        methods in prop::collection::vec(
            prop::sample::select(vec![PLAIN, ATOM_FIRST, ATOM_MIDDLE, ATOM_LAST]),
            0..16,
        ),
    ) {
        let (_leaf, outer) = chain(None);
        for (data, method) in methods.into_iter().enumerate() {
            outer.write(0, method, &[data as u32]).unwrap();
        }
        outer.wait_idle().unwrap();
        prop_assert_eq!(outer.atom_wrapper().unwrap().pending_atom_len(), 0);
    }

    #[test]
    fn nesting_is_balanced_and_unmatched_ends_are_rejected(
        ops in prop::collection::vec(any::<bool>(), 0..32),
    ) {
        let (leaf, outer) = chain(None);
        let mut depth = 0u32;
        for begin in ops {
            if begin {
                outer.begin_inserted_methods().unwrap();
                depth += 1;
            } else if depth == 0 {
                let err = outer.end_inserted_methods().unwrap_err();
                prop_assert!(err.is_contract_violation());
            } else {
                outer.end_inserted_methods().unwrap();
                depth -= 1;
            }
            prop_assert_eq!(outer.atom_wrapper().unwrap().inserted_depth(), depth);
            prop_assert_eq!(leaf.inserted_depth(), depth);
            prop_assert_eq!(outer.semaphore_wrapper().unwrap().depth(), depth as usize + 1);
        }
    }

    #[test]
    fn perturbed_semaphore_offset_round_trips(
        original in any::<u64>(),
        perturbed in any::<u64>(),
    ) {
        let (leaf, outer) = chain(None);
        outer.set_semaphore_offset(original).unwrap();
        outer.begin_inserted_methods().unwrap();
        outer.set_semaphore_offset(perturbed).unwrap();
        outer.end_inserted_methods().unwrap();

        outer.write(0, PLAIN, &[1]).unwrap();
        prop_assert_eq!(leaf.semaphore_offset().unwrap(), original);
        prop_assert!(!outer.semaphore_wrapper().unwrap().needs_restore());
    }
}
