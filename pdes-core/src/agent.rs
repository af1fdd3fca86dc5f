//! Simulation agents and their per-thread histories.
//!
//! An agent is user code: it reacts to events and schedules new ones. The
//! kernel wraps each agent in an [`AgentRuntime`] that keeps the three
//! histories an optimistic kernel needs:
//!
//! ```text
//! input   events processed, held until GVT passes their receive time
//! output  events sent, held until GVT passes their send time
//! state   snapshots after each event, the newest always kept
//! ```

use std::collections::VecDeque;

use crate::event::{AgentId, EventHandle, Time, HEADER_SIZE};
use crate::recycler::{EventRecycler, StateRecycler, StateSnapshot};

/// User-defined simulation entity.
pub trait Agent: Send {
    /// Globally unique id.
    fn id(&self) -> AgentId;

    /// Called once before the first event; typically seeds initial events.
    fn initialize(&mut self, ctx: &mut AgentContext<'_>);

    /// Processes one event.
    fn execute(&mut self, ctx: &mut AgentContext<'_>, event: &EventHandle);

    /// Called once after the last event.
    fn finalize(&mut self) {}

    /// Current state, saved after every event.
    fn state(&self) -> &[u8];
}

/// What an agent may do while handling an event.
#[derive(Debug)]
pub struct AgentContext<'a> {
    id: AgentId,
    now: Time,
    recycler: &'a mut EventRecycler,
    outgoing: &'a mut Vec<EventHandle>,
}

impl<'a> AgentContext<'a> {
    /// Context for agent `id` at virtual time `now`.
    pub fn new(id: AgentId, now: Time, recycler: &'a mut EventRecycler, outgoing: &'a mut Vec<EventHandle>) -> Self {
        Self {
            id,
            now,
            recycler,
            outgoing,
        }
    }

    /// The agent being run.
    pub fn id(&self) -> AgentId {
        self.id
    }

    /// Current virtual time.
    pub fn now(&self) -> Time {
        self.now
    }

    /// Schedules an event for `receiver` at `receive_time` carrying `payload`.
    ///
    /// The event is routed once the handler returns.
    pub fn schedule_event(&mut self, receiver: AgentId, receive_time: Time, payload: &[u8]) -> EventHandle {
        debug_assert!(receive_time >= self.now, "event scheduled into the past");
        let mut event = self.recycler.allocate(HEADER_SIZE + payload.len(), receiver);
        // SAFETY: freshly allocated, not yet shared.
        unsafe {
            let header = event.header_mut();
            header.sender = self.id;
            header.sent_time = self.now;
            header.receive_time = receive_time;
            event.payload_mut().copy_from_slice(payload);
        }
        self.outgoing.push(event);
        event
    }
}

/// An event held in a history, with the counter pair it was retained on.
#[derive(Debug, Clone, Copy)]
struct Held {
    event: EventHandle,
    split: bool,
}

/// An agent plus its histories on its owning thread.
pub struct AgentRuntime {
    agent: Box<dyn Agent>,
    lvt: Time,
    input: VecDeque<Held>,
    output: VecDeque<Held>,
    states: VecDeque<(Time, StateSnapshot)>,
    processed: u64,
    stragglers: u64,
}

impl std::fmt::Debug for AgentRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRuntime")
            .field("id", &self.agent.id())
            .field("lvt", &self.lvt)
            .field("input", &self.input.len())
            .field("output", &self.output.len())
            .field("states", &self.states.len())
            .finish()
    }
}

impl AgentRuntime {
    /// Wraps `agent`, starting at `start_time`.
    pub fn new(agent: Box<dyn Agent>, start_time: Time) -> Self {
        Self {
            agent,
            lvt: start_time,
            input: VecDeque::new(),
            output: VecDeque::new(),
            states: VecDeque::new(),
            processed: 0,
            stragglers: 0,
        }
    }

    /// The agent's id.
    pub fn id(&self) -> AgentId {
        self.agent.id()
    }

    /// Local virtual time.
    pub fn lvt(&self) -> Time {
        self.lvt
    }

    /// Events executed.
    pub fn processed(&self) -> u64 {
        self.processed
    }

    /// Events that arrived with a receive time below the LVT.
    pub fn stragglers(&self) -> u64 {
        self.stragglers
    }

    /// Entries in the input, output and state histories.
    pub fn history_len(&self) -> (usize, usize, usize) {
        (self.input.len(), self.output.len(), self.states.len())
    }

    /// Runs the agent's initializer and saves its initial state.
    pub fn initialize(&mut self, recycler: &mut EventRecycler, states: &mut StateRecycler, outgoing: &mut Vec<EventHandle>) {
        let mut ctx = AgentContext::new(self.agent.id(), self.lvt, recycler, outgoing);
        self.agent.initialize(&mut ctx);
        self.save_state(states);
    }

    /// Executes `event`, which was retained on the `split` counter pair.
    ///
    /// The event joins the input history. A straggler is counted and still
    /// executed; there is no rollback.
    pub fn execute(
        &mut self,
        event: EventHandle,
        split: bool,
        recycler: &mut EventRecycler,
        states: &mut StateRecycler,
        outgoing: &mut Vec<EventHandle>,
    ) {
        let time = event.receive_time();
        if time < self.lvt {
            self.stragglers += 1;
            tracing::trace!(agent = self.agent.id(), time, lvt = self.lvt, "straggler");
        } else {
            self.lvt = time;
        }
        let mut ctx = AgentContext::new(self.agent.id(), time, recycler, outgoing);
        self.agent.execute(&mut ctx, &event);
        self.processed += 1;
        self.input.push_back(Held { event, split });
        self.save_state(states);
    }

    /// Adds a sent event, already retained on the `split` pair, to the
    /// output history.
    pub fn record_output(&mut self, event: EventHandle, split: bool) {
        self.output.push_back(Held { event, split });
    }

    fn save_state(&mut self, states: &mut StateRecycler) {
        let snapshot = states.save(self.agent.state());
        self.states.push_back((self.lvt, snapshot));
    }

    /// Releases history older than `gvt`: input events received before it,
    /// output events sent before it, and every state but the newest one
    /// older than it.
    ///
    /// Returns the number of events released.
    pub fn fossil_collect(&mut self, gvt: Time, recycler: &mut EventRecycler, states: &mut StateRecycler) -> usize {
        let mut released = 0;
        self.input.retain(|held| {
            if held.event.receive_time() < gvt {
                recycler.release_input(held.split, held.event);
                released += 1;
                false
            } else {
                true
            }
        });
        self.output.retain(|held| {
            if held.event.sent_time() < gvt {
                recycler.release_output(held.split, held.event);
                released += 1;
                false
            } else {
                true
            }
        });
        while self.states.len() > 1 && self.states[1].0 < gvt {
            if let Some((_, snapshot)) = self.states.pop_front() {
                states.release(snapshot);
            }
        }
        released
    }

    /// Runs the agent's finalizer.
    pub fn finalize(&mut self) {
        self.agent.finalize();
    }

    /// Releases every history entry, at wind-down.
    pub fn release_all(&mut self, recycler: &mut EventRecycler, states: &mut StateRecycler) {
        for held in self.input.drain(..) {
            recycler.release_input(held.split, held.event);
        }
        for held in self.output.drain(..) {
            recycler.release_output(held.split, held.event);
        }
        for (_, snapshot) in self.states.drain(..) {
            states.release(snapshot);
        }
    }
}
