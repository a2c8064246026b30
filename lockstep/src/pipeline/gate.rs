//! Inbound gates.
//!
//! A gate owns the signals a stage waits on and decides when each one is set.
//! Upstream stages never touch a successor's signals directly: they call
//! [`Gate::release`] with the index of the item they just finished, and the
//! gate translates that index into its own slot layout.
//!
//! ```text
//! PerItemGate  (Parallel, Bounded)   release(k) ──► slot[k]
//! TurnstileGate (Sequential)         release(k) ──► slot[0], in item order,
//!                                                   one item at a time
//! ```
//!
//! Every slot has exactly one writer (the gate) and one reader (the unit
//! assigned to it), and a slot is never set twice without a wait in between.

use super::signal::StageSignal;
use parking_lot::Mutex;

/// Inbound side of a stage.
pub trait Gate: Send + Sync {
    /// Upstream finished item `index`.
    fn release(&self, index: usize);

    /// Explicit start: open the entry slot(s) without an upstream.
    fn start(&self);

    /// Slot the unit processing `index` waits on.
    fn slot(&self, index: usize) -> &StageSignal;

    /// The stage finished item `index`.
    fn complete(&self, index: usize);

    /// Number of signals owned by this gate.
    fn slot_count(&self) -> usize;
}

/// One signal per item.
pub struct PerItemGate {
    slots: Box<[StageSignal]>,
}

impl PerItemGate {
    pub fn new(item_count: usize) -> Self {
        Self {
            slots: (0..item_count).map(|_| StageSignal::new()).collect(),
        }
    }
}

impl Gate for PerItemGate {
    fn release(&self, index: usize) {
        if let Some(slot) = self.slots.get(index) {
            slot.set();
        } else {
            tracing::warn!(index, slots = self.slots.len(), "Release for unknown item ignored");
        }
    }

    fn start(&self) {
        for slot in self.slots.iter() {
            slot.set();
        }
    }

    fn slot(&self, index: usize) -> &StageSignal {
        &self.slots[index]
    }

    fn complete(&self, _index: usize) {}

    fn slot_count(&self) -> usize {
        self.slots.len()
    }
}

#[derive(Debug)]
struct TurnstileState {
    upstream_done: Vec<bool>,
    /// Next item to hand to the consumer.
    next: usize,
    /// Consumer finished its previous item and is ready for the next one.
    idle: bool,
    /// Started explicitly; items do not wait for an upstream release.
    self_driven: bool,
}

/// A single shared signal admitting items strictly in order.
///
/// Item `k` is admitted once upstream released `k` (or the gate was started)
/// and the stage completed item `k - 1`.
pub struct TurnstileGate {
    slot: StageSignal,
    state: Mutex<TurnstileState>,
}

impl TurnstileGate {
    pub fn new(item_count: usize) -> Self {
        Self {
            slot: StageSignal::new(),
            state: Mutex::new(TurnstileState {
                upstream_done: vec![false; item_count],
                next: 0,
                idle: true,
                self_driven: false,
            }),
        }
    }

    fn advance(&self, state: &mut TurnstileState) {
        let Some(&done) = state.upstream_done.get(state.next) else {
            return;
        };
        if state.idle && (done || state.self_driven) {
            state.idle = false;
            state.next += 1;
            self.slot.set();
        }
    }
}

impl Gate for TurnstileGate {
    fn release(&self, index: usize) {
        let mut state = self.state.lock();
        match state.upstream_done.get_mut(index) {
            Some(done) => *done = true,
            None => {
                tracing::warn!(index, "Release for unknown item ignored");
                return;
            }
        }
        self.advance(&mut state);
    }

    fn start(&self) {
        let mut state = self.state.lock();
        state.self_driven = true;
        self.advance(&mut state);
    }

    fn slot(&self, _index: usize) -> &StageSignal {
        &self.slot
    }

    fn complete(&self, _index: usize) {
        let mut state = self.state.lock();
        state.idle = true;
        self.advance(&mut state);
    }

    fn slot_count(&self) -> usize {
        1
    }
}
