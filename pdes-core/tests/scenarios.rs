//! Recycling scenarios across real threads, and whole runs that must end
//! even when an agent misbehaves.

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use pdes_core::numa::NumaMemoryManager;
use pdes_core::recycler::EventRecycler;
use pdes_core::topology::{AgentMap, MemoryTopology, ModuloAgentMap, TableAgentMap};
use pdes_core::{
    Agent, AgentContext, AgentId, Error, EventHandle, MultiThreadedSimulation, NodeId, NumaSetting,
    SimulationConfig, SimulationReport,
};

fn heap_recycler(thread: usize, threads: usize) -> EventRecycler {
    EventRecycler::new(thread, Arc::new(MemoryTopology::single_node(threads)), 64 * 1024).unwrap()
}

#[test]
fn second_thousand_never_reaches_the_system_allocator() {
    let mut recycler = heap_recycler(0, 1);
    let first: Vec<_> = (0..1000).map(|_| recycler.allocate(128, 0)).collect();
    for &event in &first {
        recycler.increase_reference(event);
        recycler.decrease_reference(event);
    }
    let before = recycler.stats();
    assert_eq!(before.system_allocations, 1000);
    assert_eq!(before.reclaimed, 1000);

    let second: Vec<_> = (0..1000).map(|_| recycler.allocate(128, 0)).collect();
    let after = recycler.stats();
    assert_eq!(after.system_allocations, before.system_allocations);
    assert_eq!(after.recycle_hits, 1000);
    assert!((after.hit_rate() - 0.5).abs() < f64::EPSILON);

    for &event in &second {
        recycler.increase_reference(event);
        recycler.decrease_reference(event);
    }
    recycler.delete_recycled_events();
    assert_eq!(recycler.recycled_count(), 0);
}

#[test]
fn second_thousand_on_a_numa_block_is_carved_once() {
    let mut manager = NumaMemoryManager::new(64 * 1024);
    let first: Vec<_> = (0..1000)
        .map(|_| manager.allocate_with_reuse(NodeId(0), 128))
        .collect();
    assert!(first.iter().all(|&(_, reused)| !reused));
    for &(ptr, _) in &first {
        unsafe { manager.deallocate(ptr, 128) };
    }
    let blocks = manager.block_count();

    let second: Vec<_> = (0..1000)
        .map(|_| manager.allocate_with_reuse(NodeId(0), 128))
        .collect();
    assert!(second.iter().all(|&(_, reused)| reused));
    assert_eq!(manager.block_count(), blocks);
    for (ptr, _) in second {
        unsafe { manager.deallocate(ptr, 128) };
    }
}

/// Sender parks the event; receiver's release lets the sender's next sweep
/// reclaim it, and nothing earlier does.
#[test]
fn shared_event_waits_for_the_receiving_thread() {
    let (to_receiver, receiver_inbox) = mpsc::channel::<EventHandle>();
    let (to_sender, sender_inbox) = mpsc::channel::<&'static str>();
    let (release, release_inbox) = mpsc::channel::<()>();

    let receiver = thread::spawn(move || {
        let mut recycler = heap_recycler(1, 2);
        let event = receiver_inbox.recv().unwrap();
        recycler.retain_input(true, event);
        to_sender.send("retained").unwrap();

        release_inbox.recv().unwrap();
        assert_eq!(event.receive_time(), 7.0);
        recycler.release_input(true, event);
        to_sender.send("released").unwrap();
        // Nothing was reclaimed on this side.
        recycler.stats()
    });

    let mut sender = heap_recycler(0, 2);
    let mut event = sender.allocate(256, 1);
    unsafe { event.header_mut().receive_time = 7.0 };
    sender.retain_output(true, event);
    to_receiver.send(event).unwrap();
    assert_eq!(sender_inbox.recv().unwrap(), "retained");

    sender.release_output(true, event);
    assert_eq!(sender.pending_len(), 1);
    assert_eq!(EventRecycler::input_ref_count(event), 1);
    assert_eq!(sender.process_pending_deallocs(), Some(0.0));
    assert!(event.is_live());

    release.send(()).unwrap();
    assert_eq!(sender_inbox.recv().unwrap(), "released");
    assert_eq!(sender.stats().reclaimed, 0);
    assert_eq!(sender.process_pending_deallocs(), Some(1.0));
    assert!(!event.is_live());
    assert_eq!(sender.stats().reclaimed, 1);

    let receiver_stats = receiver.join().unwrap();
    assert_eq!(receiver_stats.reclaimed, 0);
    assert_eq!(receiver_stats.allocations, 0);
}

/// Many shared events, released by the receiver in a random order while the
/// sender keeps allocating: no live buffer is ever handed out again.
#[test]
fn shared_buffers_are_not_reused_while_referenced() {
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    const EVENTS: usize = 2000;
    let (to_receiver, inbox) = mpsc::channel::<EventHandle>();
    let (released_tx, released_rx) = mpsc::channel::<()>();

    let receiver = thread::spawn(move || {
        let mut recycler = heap_recycler(1, 2);
        let mut held = Vec::with_capacity(EVENTS);
        for event in inbox.iter() {
            recycler.retain_input(true, event);
            // Drop the reference the sender took on our behalf.
            recycler.decrease_input_ref_count(event);
            held.push(event);
        }
        held.shuffle(&mut rand::rngs::StdRng::seed_from_u64(7));
        for event in held {
            // Stamped by the sender with its own address; a reuse would
            // have overwritten it.
            assert_eq!(event.sender(), event.as_ptr() as u64);
            recycler.release_input(true, event);
        }
        released_tx.send(()).unwrap();
    });

    let mut sender = heap_recycler(0, 2);
    let mut live: HashMap<usize, EventHandle> = HashMap::new();
    for _ in 0..EVENTS {
        let mut event = sender.allocate(64, 1);
        if let Some(previous) = live.insert(event.as_ptr() as usize, event) {
            assert!(!previous.is_live(), "live buffer handed out twice");
        }
        unsafe { event.header_mut().sender = event.as_ptr() as u64 };
        sender.retain_output(true, event);
        sender.increase_input_ref_count(event);
        to_receiver.send(event).unwrap();
        sender.release_output(true, event);
        sender.process_pending_deallocs();
    }
    drop(to_receiver);
    released_rx.recv().unwrap();
    receiver.join().unwrap();

    sender.delete_recycled_events();
    assert_eq!(sender.pending_len(), 0);
    assert_eq!(sender.stats().reclaimed, EVENTS as u64);
}

#[test]
fn receiver_placement_follows_the_agent_map() {
    let topology = Arc::new(MemoryTopology::new(
        vec![NodeId(0), NodeId(0)],
        NumaSetting::Receiver,
        Arc::new(ModuloAgentMap::new(2)),
    ));
    let mut recycler = EventRecycler::new(0, Arc::clone(&topology), 64 * 1024).unwrap();
    recycler.start();
    let event = recycler.allocate(128, 3);
    assert_eq!(topology.thread_of(3), 1);
    assert!(recycler.uses_numa());
    recycler.increase_reference(event);
    recycler.decrease_reference(event);
    assert_eq!(recycler.recycled_count(), 1);
}

/// Fails the test instead of hanging it if the run never returns.
fn run_with_watchdog(
    config: SimulationConfig,
    agents: Vec<Box<dyn Agent>>,
    agent_map: Option<Arc<dyn AgentMap>>,
) -> pdes_core::Result<SimulationReport> {
    let (done, outcome) = mpsc::channel();
    thread::spawn(move || {
        let mut sim = MultiThreadedSimulation::new(config, agents);
        if let Some(map) = agent_map {
            sim = sim.with_agent_map(map);
        }
        let _ = done.send(sim.run());
    });
    outcome
        .recv_timeout(Duration::from_secs(60))
        .expect("simulation did not return within a minute")
}

/// Sends one event to itself and one to `peer` per step.
struct Pinger {
    id: AgentId,
    peer: AgentId,
    work: Duration,
}

impl Agent for Pinger {
    fn id(&self) -> AgentId {
        self.id
    }

    fn initialize(&mut self, ctx: &mut AgentContext<'_>) {
        ctx.schedule_event(self.id, ctx.now() + 1.0, &[0; 64]);
    }

    fn execute(&mut self, ctx: &mut AgentContext<'_>, _event: &EventHandle) {
        let started = Instant::now();
        while started.elapsed() < self.work {
            std::hint::spin_loop();
        }
        let at = ctx.now() + 1.0;
        ctx.schedule_event(self.peer, at, &[0; 64]);
        ctx.schedule_event(self.id, at, &[0; 64]);
    }

    fn state(&self) -> &[u8] {
        bytemuck::bytes_of(&self.id)
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Fault {
    None,
    Initialize,
    Execute,
}

/// Consumes events, optionally panicking on the way.
struct Sink {
    id: AgentId,
    fault: Fault,
    seen: u64,
}

impl Agent for Sink {
    fn id(&self) -> AgentId {
        self.id
    }

    fn initialize(&mut self, _ctx: &mut AgentContext<'_>) {
        if self.fault == Fault::Initialize {
            panic!("agent {} failed to initialize", self.id);
        }
    }

    fn execute(&mut self, ctx: &mut AgentContext<'_>, _event: &EventHandle) {
        self.seen += 1;
        if self.fault == Fault::Execute && ctx.now() >= 3.0 {
            panic!("agent {} failed at {}", self.id, ctx.now());
        }
    }

    fn state(&self) -> &[u8] {
        bytemuck::bytes_of(&self.seen)
    }
}

fn pinger(id: AgentId, peer: AgentId, work: Duration) -> Box<dyn Agent> {
    Box::new(Pinger { id, peer, work })
}

fn sink(id: AgentId, fault: Fault) -> Box<dyn Agent> {
    Box::new(Sink { id, fault, seen: 0 })
}

#[test]
fn event_for_a_thread_outside_the_run_is_dropped() {
    for share_events in [true, false] {
        let mut map = TableAgentMap::new(2);
        map.assign(0, 0).assign(1, 0).assign(99, 5);
        let config = SimulationConfig {
            threads: 2,
            end_time: 5.0,
            share_events,
            ..SimulationConfig::default()
        };
        let agents = vec![pinger(0, 99, Duration::ZERO), sink(1, Fault::None)];
        let report = run_with_watchdog(config, agents, Some(Arc::new(map)))
            .unwrap_or_else(|err| panic!("share_events={share_events}: {err}"));
        // Self events at 1..=4 execute; every event for agent 99 is dropped.
        assert_eq!(report.events_processed, 4, "share_events={share_events}");
        assert_eq!(report.outstanding, 0, "share_events={share_events}");
        assert!(report.final_gvt >= 5.0);
    }
}

#[test]
fn panicking_agent_fails_the_run_instead_of_hanging_it() {
    for (fault, share_events) in [(Fault::Execute, true), (Fault::Execute, false), (Fault::Initialize, true)] {
        let config = SimulationConfig {
            threads: 2,
            end_time: 1_000.0,
            share_events,
            ..SimulationConfig::default()
        };
        // Modulo map: agent 0 on thread 0, agent 1 on thread 1.
        let agents = vec![pinger(0, 1, Duration::ZERO), sink(1, fault)];
        let err = run_with_watchdog(config, agents, None).unwrap_err();
        assert!(matches!(err, Error::WorkerPanicked(1)), "{err}");
    }
}

/// Clones are reclaimed by their receiver; without redistribution the
/// sender carves a new buffer for every one of them.
#[test]
fn cloning_sender_reuses_buffers_its_receiver_gives_back() {
    let run = |redistribute_memory: bool| {
        let config = SimulationConfig {
            threads: 2,
            end_time: 2_000.0,
            share_events: false,
            redistribute_memory,
            ..SimulationConfig::default()
        };
        let agents = vec![pinger(0, 1, Duration::from_micros(50)), sink(1, Fault::None)];
        let report = run_with_watchdog(config, agents, None).unwrap();
        assert_eq!(report.outstanding, 0, "{report}");
        report
    };

    let baseline = run(false);
    let clones = baseline.threads[1].remote_received;
    assert!(clones > 1_000);
    assert!(baseline.threads[0].events.system_allocations >= clones);
    assert_eq!(baseline.events.donated, 0);

    let report = run(true);
    let clones = report.threads[1].remote_received;
    let sender = &report.threads[0].events;
    assert!(
        sender.system_allocations < clones / 2,
        "{} system allocations for {clones} clones",
        sender.system_allocations
    );
    assert!(sender.adopted > 0);
    assert!(report.threads[1].events.donated > 0);
    assert_eq!(report.events.donated, report.events.adopted);
}
