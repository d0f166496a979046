//! Reusable tick barrier.
//!
//! `std::sync::Barrier` offers neither a completion callback nor a way for
//! an exiting thread to drop out, and both are load-bearing here: the
//! callback advances the virtual clock exactly once per tick, and shutdown
//! must not strand the remaining participants. So this is a small
//! generation-counting barrier on `Mutex` + `Condvar`.
//!
//! The completion callback runs on whichever thread arrives last, while the
//! barrier lock is held; at that moment no participant can be inside a tick,
//! which is exactly the window the wakeup drain needs.

use std::sync::{Condvar, Mutex};

pub struct TickBarrier {
    state: Mutex<State>,
    released: Condvar,
    completion: Box<dyn Fn() + Send + Sync>,
}

struct State {
    arity: usize,
    arrived: usize,
    generation: u64,
}

impl TickBarrier {
    pub fn new(arity: usize, completion: Box<dyn Fn() + Send + Sync>) -> Self {
        assert!(arity > 0, "barrier needs at least one participant");
        Self {
            state: Mutex::new(State { arity, arrived: 0, generation: 0 }),
            released: Condvar::new(),
            completion,
        }
    }

    /// Blocks until every live participant has arrived for this tick.
    pub fn arrive_and_wait(&self) {
        let mut state = self.state.lock().expect("barrier lock poisoned");
        state.arrived += 1;
        if state.arrived == state.arity {
            self.release(&mut state);
        } else {
            let generation = state.generation;
            let _unused = self
                .released
                .wait_while(state, |s| s.generation == generation)
                .expect("barrier lock poisoned");
        }
    }

    /// Permanently leaves the barrier, releasing the current tick if this
    /// arrival was the missing one.
    pub fn arrive_and_drop(&self) {
        let mut state = self.state.lock().expect("barrier lock poisoned");
        state.arity -= 1;
        if state.arity > 0 && state.arrived == state.arity {
            self.release(&mut state);
        } else if state.arity == 0 {
            self.released.notify_all();
        }
    }

    fn release(&self, state: &mut State) {
        (self.completion)();
        state.arrived = 0;
        state.generation += 1;
        self.released.notify_all();
    }
}
