//! Multi-threaded simulation driver.
//!
//! One worker per simulation thread, each owning its recyclers, scheduler,
//! agents and GVT rank. Workers only meet at the inbound queues, the spin
//! barrier and the reclaim depot.
//!
//! # Worker Lifecycle
//!
//! ```text
//! Init ─► { ProcessIncoming ─► ProcessLocal ─► MaybeGc ─► MaybePoll }* ─► Finalize
//! ```
//!
//! # Wind-down
//!
//! ```text
//! barrier ─► adopt donations, drain inbound ─► finalize, release histories ─► barrier
//!         ─► sweep, delete recycled ─► workers fill depot ─► barrier
//!         ─► main adopts depot, sweeps, frees
//! ```
//!
//! Memory owned by one thread can still be referenced by another until the
//! second barrier, and NUMA blocks are only unmapped by the main thread
//! after the third.
//!
//! # Failure
//!
//! A worker that unwinds (or a thread that never spawned) poisons the
//! barrier. Peers leave their loop at the next iteration or barrier and
//! park their NUMA blocks in the depot, where they leak instead of being
//! unmapped under events a peer may still reference.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;
use parking_lot::Mutex;

use crate::agent::{Agent, AgentRuntime};
use crate::barrier::{BarrierPoisoned, SpinBarrier};
use crate::config::{NumaSetting, SimulationConfig, REDISTRIBUTE_KEEP};
use crate::event::{AgentId, EventHandle, Time, TIME_INFINITY};
use crate::gvt::{GvtLink, GvtManager, GvtMessage, GvtMsgKind};
use crate::numa::{self, ManagerStats, NumaBlocks, NumaTopology};
use crate::queue::{make_queue, InboundQueue};
use crate::recycler::{AdaptiveSweeper, EventRecycler, FreeBuffers, RecyclerStats, StateRecycler};
use crate::scheduler::{HeapScheduler, Scheduler};
use crate::topology::{AgentMap, MemoryTopology, ModuloAgentMap, NodeId, ThreadId};
use crate::transport::{NullTransport, Transport};
use crate::{Error, Result};

/// Thread that polls the transport and adopts the depot at wind-down.
const MAIN_THREAD: ThreadId = 0;

/// Where workers leave what only the main thread may free, plus one
/// mailbox per thread for free event buffers given away by its peers.
#[derive(Debug)]
struct ReclaimDepot {
    pending: Mutex<Vec<EventHandle>>,
    event_blocks: Mutex<NumaBlocks>,
    state_blocks: Mutex<NumaBlocks>,
    donations: Box<[SegQueue<FreeBuffers>]>,
}

impl ReclaimDepot {
    fn new(threads: usize) -> Self {
        Self {
            pending: Mutex::default(),
            event_blocks: Mutex::default(),
            state_blocks: Mutex::default(),
            donations: (0..threads).map(|_| SegQueue::new()).collect(),
        }
    }
}

/// What one worker did.
#[derive(Debug, Clone, Default)]
pub struct ThreadReport {
    /// Logical thread.
    pub thread: ThreadId,
    /// Node its buffers were placed on.
    pub node: NodeId,
    /// Agents owned.
    pub agents: usize,
    /// Events executed.
    pub events_processed: u64,
    /// Events executed below their agent's LVT.
    pub stragglers: u64,
    /// Events received from other threads.
    pub remote_received: u64,
    /// GVT rounds completed.
    pub gvt_rounds: u64,
    /// GVT when the worker stopped.
    pub final_gvt: Time,
    /// Pending-list sweeps run.
    pub sweeps: u64,
    /// Average fraction reclaimed per sweep.
    pub average_sweep_fraction: f64,
    /// Sweep period when the worker stopped.
    pub final_sweep_rate: u32,
    /// Event recycler counters.
    pub events: RecyclerStats,
    /// State recycler counters.
    pub states: RecyclerStats,
    /// Event NUMA manager counters.
    pub numa: ManagerStats,
}

/// Outcome of [`MultiThreadedSimulation::run`].
#[derive(Debug, Clone, Default)]
pub struct SimulationReport {
    /// Per-thread reports, by thread.
    pub threads: Vec<ThreadReport>,
    /// GVT at termination.
    pub final_gvt: Time,
    /// Events executed across threads.
    pub events_processed: u64,
    /// Stragglers across threads.
    pub stragglers: u64,
    /// Event counters summed across threads.
    pub events: RecyclerStats,
    /// State counters summed across threads.
    pub states: RecyclerStats,
    /// Event buffers allocated but never reclaimed.
    pub outstanding: i64,
    /// Wall-clock run time.
    pub elapsed: Duration,
}

impl SimulationReport {
    fn from_threads(threads: Vec<ThreadReport>, elapsed: Duration) -> Self {
        let mut report = SimulationReport {
            final_gvt: threads.iter().map(|t| t.final_gvt).fold(TIME_INFINITY, Time::min),
            elapsed,
            ..Default::default()
        };
        for thread in &threads {
            report.events_processed += thread.events_processed;
            report.stragglers += thread.stragglers;
            report.events.merge(&thread.events);
            report.states.merge(&thread.states);
        }
        report.outstanding = report.events.allocations as i64 - report.events.reclaimed as i64;
        report.threads = threads;
        report
    }

    /// Events executed per wall-clock second.
    pub fn event_rate(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.events_processed as f64 / secs
        } else {
            0.0
        }
    }
}

impl fmt::Display for SimulationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} events in {:.3}s ({:.0} events/s), final GVT {}",
            self.events_processed,
            self.elapsed.as_secs_f64(),
            self.event_rate(),
            self.final_gvt
        )?;
        writeln!(
            f,
            "events: {} allocated, {:.1}% recycled, {} outstanding; states: {} saved, {:.1}% recycled",
            self.events.allocations,
            self.events.hit_rate() * 100.0,
            self.outstanding,
            self.states.allocations,
            self.states.hit_rate() * 100.0
        )?;
        for t in &self.threads {
            writeln!(
                f,
                "  thread {:>3} [{}] agents={} events={} stragglers={} remote={} rounds={} sweeps={} (avg {:.2}, rate {})",
                t.thread,
                t.node,
                t.agents,
                t.events_processed,
                t.stragglers,
                t.remote_received,
                t.gvt_rounds,
                t.sweeps,
                t.average_sweep_fraction,
                t.final_sweep_rate
            )?;
        }
        Ok(())
    }
}

/// A configured run over a set of agents.
pub struct MultiThreadedSimulation {
    config: SimulationConfig,
    agents: Vec<Box<dyn Agent>>,
    agent_map: Option<Arc<dyn AgentMap>>,
    transport: Arc<dyn Transport>,
}

impl fmt::Debug for MultiThreadedSimulation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiThreadedSimulation")
            .field("config", &self.config)
            .field("agents", &self.agents.len())
            .field("agent_map", &self.agent_map)
            .field("transport", &self.transport)
            .finish()
    }
}

impl MultiThreadedSimulation {
    /// Creates a single-process run with the modulo agent map.
    pub fn new(config: SimulationConfig, agents: Vec<Box<dyn Agent>>) -> Self {
        Self {
            config,
            agents,
            agent_map: None,
            transport: Arc::new(NullTransport),
        }
    }

    /// Overrides the agent → thread map.
    pub fn with_agent_map(mut self, agent_map: Arc<dyn AgentMap>) -> Self {
        self.agent_map = Some(agent_map);
        self
    }

    /// Sets the inter-process transport.
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = transport;
        self
    }

    /// The run's configuration.
    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// Runs the simulation to `end_time` and tears it down.
    pub fn run(self) -> Result<SimulationReport> {
        let Self {
            config,
            agents,
            agent_map,
            transport,
        } = self;
        config.validate()?;
        let threads = config.threads;
        let host = NumaTopology::get();
        let agent_map = agent_map.unwrap_or_else(|| Arc::new(ModuloAgentMap::new(threads)));
        let topology = Arc::new(MemoryTopology::from_config(&config, host, agent_map)?);

        if transport.num_processes() > 1 {
            tracing::warn!(
                processes = transport.num_processes(),
                "GVT covers local threads only; remote processes are not synchronized"
            );
        }

        let mut partitions: Vec<Vec<AgentRuntime>> = (0..threads).map(|_| Vec::new()).collect();
        let mut seen = HashMap::with_capacity(agents.len());
        for agent in agents {
            let id = agent.id();
            let thread = topology.thread_of(id);
            if thread >= threads {
                return Err(Error::Config(format!("agent {id} mapped to thread {thread} of {threads}")));
            }
            if seen.insert(id, thread).is_some() {
                return Err(Error::Config(format!("duplicate agent id {id}")));
            }
            partitions[thread].push(AgentRuntime::new(agent, config.start_time));
        }

        let mut parts = Vec::with_capacity(threads);
        for (thread, agents) in partitions.into_iter().enumerate() {
            let events = EventRecycler::new(thread, Arc::clone(&topology), config.event_block_size)?;
            let mut states = StateRecycler::with_block_size(thread, &topology, config.state_block_size)?;
            states.setup(topology.numa_enabled(), topology.node_of_thread(thread));
            parts.push((agents, events, states));
        }

        let queues: Vec<Box<dyn InboundQueue>> =
            (0..threads).map(|_| make_queue(config.queue_kind, config.sub_queues)).collect();
        let barrier = SpinBarrier::new(threads);
        let depot = ReclaimDepot::new(threads);

        tracing::info!(
            threads,
            agents = seen.len(),
            end_time = config.end_time,
            numa = %topology.numa_setting(),
            queue = %config.queue_kind,
            share_events = config.share_events,
            "simulation starting"
        );
        let started = Instant::now();

        let results: Vec<Result<Option<ThreadReport>>> = std::thread::scope(|scope| {
            let handles: Vec<_> = parts
                .into_iter()
                .enumerate()
                .map(|(thread, (agents, events, states))| {
                    let shared = Shared {
                        config: &config,
                        host,
                        topology: Arc::clone(&topology),
                        queues: &queues,
                        barrier: &barrier,
                        depot: &depot,
                        transport: Arc::clone(&transport),
                    };
                    std::thread::Builder::new()
                        .name(format!("pdes-{thread}"))
                        .spawn_scoped(scope, move || Worker::new(thread, shared, agents, events, states).run())
                })
                .collect();
            if handles.iter().any(std::result::Result::is_err) {
                barrier.poison();
            }
            handles
                .into_iter()
                .enumerate()
                .map(|(thread, handle)| match handle {
                    Ok(handle) => handle.join().map_err(|_| Error::WorkerPanicked(thread)),
                    Err(source) => Err(Error::Spawn { thread, source }),
                })
                .collect()
        });

        let mut reports = Vec::with_capacity(threads);
        let mut abandoned = None;
        let mut failure = None;
        for (thread, result) in results.into_iter().enumerate() {
            match result {
                Ok(Some(report)) => reports.push(report),
                Ok(None) => {
                    abandoned.get_or_insert(thread);
                }
                Err(err) => {
                    failure.get_or_insert(err);
                }
            }
        }
        if let Some(err) = failure {
            tracing::error!(%err, "simulation failed");
            return Err(err);
        }
        if let Some(thread) = abandoned {
            return Err(Error::Abandoned(thread));
        }
        let report = SimulationReport::from_threads(reports, started.elapsed());
        tracing::info!(
            events = report.events_processed,
            final_gvt = report.final_gvt,
            outstanding = report.outstanding,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "simulation finished"
        );
        Ok(report)
    }
}

/// Everything a worker borrows from the run.
struct Shared<'s> {
    config: &'s SimulationConfig,
    host: &'static NumaTopology,
    topology: Arc<MemoryTopology>,
    queues: &'s [Box<dyn InboundQueue>],
    barrier: &'s SpinBarrier,
    depot: &'s ReclaimDepot,
    transport: Arc<dyn Transport>,
}

/// Per-thread lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Init,
    Run,
    Finalize,
    Done,
}

/// The [`GvtLink`] a worker lends its GVT manager.
struct ThreadLink<'a> {
    thread: ThreadId,
    lgvt: Time,
    recycler: &'a mut EventRecycler,
    queues: &'a [Box<dyn InboundQueue>],
}

impl GvtLink for ThreadLink<'_> {
    fn lgvt(&self) -> Time {
        self.lgvt
    }

    fn recycler(&mut self) -> &mut EventRecycler {
        self.recycler
    }

    fn send_gvt_message(&mut self, msg: GvtMessage) {
        let dest = msg.dest_rank();
        self.queues[dest].push(self.thread, msg.into_event());
    }
}

struct Worker<'s> {
    id: ThreadId,
    shared: Shared<'s>,
    phase: Phase,
    recycler: EventRecycler,
    states: StateRecycler,
    scheduler: HeapScheduler,
    gvt: GvtManager,
    agents: Vec<AgentRuntime>,
    agent_index: HashMap<AgentId, usize>,
    sweeper: AdaptiveSweeper,
    incoming: Vec<EventHandle>,
    outgoing: Vec<EventHandle>,
    polled: Vec<Vec<u8>>,
    remote_received: u64,
}

impl<'s> Worker<'s> {
    fn new(
        id: ThreadId,
        shared: Shared<'s>,
        agents: Vec<AgentRuntime>,
        recycler: EventRecycler,
        states: StateRecycler,
    ) -> Self {
        let config = shared.config;
        let agent_index = agents.iter().enumerate().map(|(idx, a)| (a.id(), idx)).collect();
        Self {
            id,
            phase: Phase::Init,
            recycler,
            states,
            scheduler: HeapScheduler::new(),
            gvt: GvtManager::new(id, config.threads, config.start_time),
            agents,
            agent_index,
            sweeper: AdaptiveSweeper::new(config.gc_threshold),
            incoming: Vec::new(),
            outgoing: Vec::new(),
            polled: Vec::new(),
            remote_received: 0,
            shared,
        }
    }

    fn enter(&mut self, phase: Phase) {
        tracing::debug!(thread = self.id, from = ?self.phase, to = ?phase, "phase change");
        self.phase = phase;
    }

    /// Returns `None` when a peer failed first.
    fn run(mut self) -> Option<ThreadReport> {
        match self.drive() {
            Ok(report) => Some(report),
            Err(BarrierPoisoned) => {
                tracing::warn!(thread = self.id, phase = ?self.phase, "peer failed, abandoning run");
                None
            }
        }
    }

    fn drive(&mut self) -> std::result::Result<ThreadReport, BarrierPoisoned> {
        self.pin();
        self.initialize()?;
        self.enter(Phase::Run);
        self.simulate()?;
        self.enter(Phase::Finalize);
        self.wind_down()
    }

    fn pin(&self) {
        if !self.shared.config.cpu_pinning {
            return;
        }
        let cpus = self.shared.host.cpus_by_node();
        let Some(&cpu) = cpus.get(self.id % cpus.len().max(1)) else {
            tracing::warn!(thread = self.id, "no CPU available for pinning");
            return;
        };
        match numa::pin_current_thread(cpu) {
            Ok(()) => tracing::debug!(thread = self.id, cpu, "pinned"),
            Err(err) => tracing::warn!(thread = self.id, cpu, %err, "CPU pinning failed, continuing unpinned"),
        }
    }

    fn initialize(&mut self) -> std::result::Result<(), BarrierPoisoned> {
        self.recycler.start();
        let mut outgoing = std::mem::take(&mut self.outgoing);
        for idx in 0..self.agents.len() {
            self.agents[idx].initialize(&mut self.recycler, &mut self.states, &mut outgoing);
            for event in outgoing.drain(..) {
                self.route(idx, event);
            }
        }
        self.outgoing = outgoing;
        // Every thread's initial events must be visible before GVT can be computed.
        self.shared.barrier.try_wait().map(drop)
    }

    fn simulate(&mut self) -> std::result::Result<(), BarrierPoisoned> {
        let config = self.shared.config;
        let mut iteration: u64 = 0;
        while self.gvt.gvt() < config.end_time {
            if self.shared.barrier.is_poisoned() {
                return Err(BarrierPoisoned);
            }
            let received = self.process_incoming();
            let executed = self.process_local();
            self.maybe_gc();
            if self.id == MAIN_THREAD && iteration % u64::from(config.poll_rate) == 0 {
                self.poll_transport();
            }
            if iteration % u64::from(config.gvt_delay) == 0 && self.gvt.gvt() < config.end_time {
                self.with_gvt(|gvt, link| gvt.start_gvt_estimation(link));
            }
            if !received && !executed {
                std::thread::yield_now();
            }
            iteration += 1;
        }
        tracing::debug!(thread = self.id, iteration, gvt = self.gvt.gvt(), "left simulation loop");
        Ok(())
    }

    fn with_gvt<R>(&mut self, f: impl FnOnce(&mut GvtManager, &mut ThreadLink<'_>) -> R) -> R {
        let mut link = ThreadLink {
            thread: self.id,
            lgvt: self.scheduler.next_time(),
            recycler: &mut self.recycler,
            queues: self.shared.queues,
        };
        f(&mut self.gvt, &mut link)
    }

    /// Drains the inbound queue: estimates first, then events, then tokens.
    fn process_incoming(&mut self) -> bool {
        let mut incoming = std::mem::take(&mut self.incoming);
        if self.shared.queues[self.id].remove_all(&mut incoming, None) == 0 {
            self.incoming = incoming;
            return false;
        }

        let mut tokens = Vec::new();
        let mut estimates = Vec::new();
        let mut events = Vec::new();
        for event in incoming.drain(..) {
            match GvtMessage::from_event(event) {
                Some(msg) if msg.kind() == GvtMsgKind::Ctrl => tokens.push(msg),
                Some(msg) => estimates.push(msg),
                None => events.push(event),
            }
        }
        for msg in estimates {
            self.with_gvt(|gvt, link| gvt.recv_gvt_message(msg, link));
        }
        for event in events {
            self.gvt.inspect_remote_event(event);
            self.schedule_remote(event);
        }
        for msg in tokens {
            self.with_gvt(|gvt, link| gvt.recv_gvt_message(msg, link));
        }
        self.with_gvt(|gvt, link| gvt.check_waiting_ctrl_msg(link));
        self.incoming = incoming;
        true
    }

    /// Schedules an event that arrived with a temporary reference, then
    /// drops that reference.
    fn schedule_remote(&mut self, event: EventHandle) {
        let split = self.shared.config.share_events;
        self.recycler.retain_input(split, event);
        self.scheduler.schedule(event);
        if split {
            self.recycler.decrease_input_ref_count(event);
        } else {
            self.recycler.decrease_reference(event);
        }
        self.remote_received += 1;
    }

    fn process_local(&mut self) -> bool {
        let Some(event) = self.scheduler.pop_before(self.shared.config.end_time) else {
            return false;
        };
        let split = Self::is_split(event);
        let Some(&idx) = self.agent_index.get(&event.receiver()) else {
            tracing::warn!(thread = self.id, receiver = event.receiver(), "event for unknown agent dropped");
            self.recycler.release_input(split, event);
            return true;
        };

        let mut outgoing = std::mem::take(&mut self.outgoing);
        self.agents[idx].execute(event, split, &mut self.recycler, &mut self.states, &mut outgoing);
        for sent in outgoing.drain(..) {
            self.route(idx, sent);
        }
        self.outgoing = outgoing;
        true
    }

    /// Events retained on the split pair are the only ones with a non-zero
    /// input count on their receiving thread.
    fn is_split(event: EventHandle) -> bool {
        event.header().input_ref_count() > 0
    }

    /// Delivers an event agent `idx` just scheduled.
    fn route(&mut self, idx: usize, mut event: EventHandle) {
        let receiver = event.receiver();
        let transport = &self.shared.transport;
        if transport.num_processes() > 1 && transport.owner_rank(receiver) != transport.rank() {
            self.recycler.retain_output(false, event);
            self.agents[idx].record_output(event, false);
            transport.send_event(event.as_bytes());
            return;
        }

        let dest = self.shared.topology.thread_of(receiver);
        if dest >= self.shared.queues.len() {
            tracing::warn!(thread = self.id, receiver, dest, "event for a thread outside the run dropped");
            self.recycler.increase_reference(event);
            self.recycler.decrease_reference(event);
            return;
        }
        if dest == self.id {
            self.recycler.retain_output(false, event);
            self.agents[idx].record_output(event, false);
            self.recycler.retain_input(false, event);
            self.scheduler.schedule(event);
        } else if self.shared.config.share_events {
            self.recycler.retain_output(true, event);
            self.agents[idx].record_output(event, true);
            // SAFETY: the event has not been pushed yet.
            unsafe { self.gvt.send_remote_event(&mut event, dest) };
            self.recycler.increase_input_ref_count(event);
            self.shared.queues[dest].push(self.id, event);
        } else {
            self.recycler.retain_output(false, event);
            self.agents[idx].record_output(event, false);
            let placement = match self.shared.topology.numa_setting() {
                NumaSetting::None => NumaSetting::None,
                NumaSetting::Sender | NumaSetting::Receiver => NumaSetting::Receiver,
            };
            let mut clone = self.recycler.clone_event(event, placement);
            // SAFETY: the clone has not been pushed yet.
            unsafe { self.gvt.send_remote_event(&mut clone, dest) };
            self.recycler.increase_reference(clone);
            self.shared.queues[dest].push(self.id, clone);
        }
    }

    /// Fossil-collects at the new GVT, runs the adaptive pending sweep and
    /// gives surplus free buffers away.
    fn maybe_gc(&mut self) {
        self.adopt_donations();
        if !self.gvt.take_advanced() {
            return;
        }
        let gvt = self.gvt.gvt();
        let mut released = 0;
        for agent in &mut self.agents {
            released += agent.fossil_collect(gvt, &mut self.recycler, &mut self.states);
        }
        let swept = self.sweeper.tick(&mut self.recycler);
        tracing::trace!(thread = self.id, gvt, released, ?swept, "garbage collected");
        self.redistribute();
    }

    /// Deals free event buffers above the per-size floor out to the other
    /// threads' mailboxes.
    ///
    /// With cloning, clones are reclaimed by their receiver while the sender
    /// keeps carving new ones; this hands the buffers back.
    fn redistribute(&mut self) {
        let threads = self.shared.config.threads;
        if threads < 2 || !self.shared.config.redistribute_memory {
            return;
        }
        let sets = self.recycler.take_surplus(REDISTRIBUTE_KEEP, threads - 1);
        if sets.is_empty() {
            return;
        }
        let mut given = 0;
        let peers = (0..threads).filter(|&t| t != self.id);
        for (peer, set) in peers.zip(sets) {
            if set.is_empty() {
                continue;
            }
            given += set.len();
            self.shared.depot.donations[peer].push(set);
        }
        tracing::debug!(thread = self.id, given, "redistributed free event buffers");
    }

    /// Takes over every set of free buffers peers left in this thread's
    /// mailbox.
    fn adopt_donations(&mut self) {
        while let Some(set) = self.shared.depot.donations[self.id].pop() {
            // SAFETY: sets come from recyclers of this run, and NUMA blocks
            // are only unmapped after the last barrier of wind-down.
            unsafe { self.recycler.adopt_free(set) };
        }
    }

    /// Brings events from other processes into this process.
    fn poll_transport(&mut self) {
        let mut polled = std::mem::take(&mut self.polled);
        if self.shared.transport.poll(&mut polled) == 0 {
            self.polled = polled;
            return;
        }
        let split = self.shared.config.share_events;
        for bytes in polled.drain(..) {
            let Some(mut event) = self.recycler.allocate_from_bytes(&bytes) else {
                tracing::warn!(len = bytes.len(), "malformed event image dropped");
                continue;
            };
            if event.receive_time() < self.gvt.gvt() {
                tracing::warn!(
                    receive_time = event.receive_time(),
                    gvt = self.gvt.gvt(),
                    "remote event below GVT dropped"
                );
                self.recycler.increase_reference(event);
                self.recycler.decrease_reference(event);
                continue;
            }
            let dest = self.shared.topology.thread_of(event.receiver());
            if dest >= self.shared.queues.len() {
                tracing::warn!(receiver = event.receiver(), dest, "remote event for a thread outside the run dropped");
                self.recycler.increase_reference(event);
                self.recycler.decrease_reference(event);
                continue;
            }
            if split {
                self.recycler.increase_input_ref_count(event);
                self.recycler.track_pending(event);
            } else {
                self.recycler.increase_reference(event);
            }
            if dest == self.id {
                self.schedule_remote(event);
            } else {
                // SAFETY: the event has not been pushed yet.
                unsafe { self.gvt.send_remote_event(&mut event, dest) };
                self.shared.queues[dest].push(self.id, event);
            }
        }
        self.polled = polled;
    }

    fn wind_down(&mut self) -> std::result::Result<ThreadReport, BarrierPoisoned> {
        let barrier = self.shared.barrier;
        let depot = self.shared.depot;
        barrier.try_wait()?;
        self.adopt_donations();

        // Nothing is pushed any more: release what is still queued.
        let split = self.shared.config.share_events;
        let mut incoming = std::mem::take(&mut self.incoming);
        self.shared.queues[self.id].remove_all(&mut incoming, None);
        for event in incoming.drain(..) {
            match GvtMessage::from_event(event) {
                Some(msg) => GvtMessage::destroy(msg, &mut self.recycler),
                None if split => self.recycler.decrease_input_ref_count(event),
                None => self.recycler.decrease_reference(event),
            }
        }
        self.gvt.discard(&mut self.recycler);

        for agent in &mut self.agents {
            agent.finalize();
            agent.release_all(&mut self.recycler, &mut self.states);
        }
        for event in self.scheduler.drain() {
            self.recycler.release_input(Self::is_split(event), event);
        }
        barrier.try_wait()?;

        self.recycler.delete_recycled_events();
        self.states.delete_recycled_states();
        if self.id != MAIN_THREAD {
            self.recycler.move_pending_deallocs_to(&depot.pending);
            self.recycler.move_numa_blocks_to(&depot.event_blocks);
            self.states.move_numa_blocks_to(&depot.state_blocks);
        }
        barrier.try_wait()?;

        if self.id == MAIN_THREAD {
            self.recycler.adopt_pending(&depot.pending);
            self.recycler.delete_recycled_events();
            self.recycler.adopt_numa_blocks(&depot.event_blocks);
            self.states.adopt_numa_blocks(&depot.state_blocks);
        }

        let report = self.report();
        tracing::info!(
            thread = report.thread,
            events = report.events_processed,
            stragglers = report.stragglers,
            rounds = report.gvt_rounds,
            sweeps = report.sweeps,
            hit_rate = report.events.hit_rate(),
            "thread finished"
        );
        self.enter(Phase::Done);
        Ok(report)
    }

    fn report(&self) -> ThreadReport {
        ThreadReport {
            thread: self.id,
            node: self.shared.topology.node_of_thread(self.id),
            agents: self.agents.len(),
            events_processed: self.agents.iter().map(AgentRuntime::processed).sum(),
            stragglers: self.agents.iter().map(AgentRuntime::stragglers).sum(),
            remote_received: self.remote_received,
            gvt_rounds: self.gvt.rounds(),
            final_gvt: self.gvt.gvt(),
            sweeps: self.sweeper.calls(),
            average_sweep_fraction: self.sweeper.average_fraction(),
            final_sweep_rate: self.sweeper.rate(),
            events: self.recycler.stats(),
            states: self.states.stats(),
            numa: self.recycler.numa_stats(),
        }
    }
}

impl Drop for Worker<'_> {
    fn drop(&mut self) {
        if self.phase == Phase::Done {
            return;
        }
        if std::thread::panicking() {
            tracing::error!(thread = self.id, phase = ?self.phase, "simulation thread panicked");
        }
        self.shared.barrier.poison();
        // Peers may still hold events carved from these blocks.
        self.recycler.move_numa_blocks_to(&self.shared.depot.event_blocks);
        self.states.move_numa_blocks_to(&self.shared.depot.state_blocks);
    }
}
