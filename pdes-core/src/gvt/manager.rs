//! Mattern's GVT algorithm with one rank per simulation thread.
//!
//! # Protocol
//!
//! ```text
//! rank 0 ──Ctrl──► rank 1 ──Ctrl──► ... ──Ctrl──► rank n-1 ──Ctrl──► rank 0
//!    │                                                              │
//!    │◄──────── counters zero? ── no: forward again ─────────────────┘
//!    │ yes
//!    └──Estimate──► every other rank
//! ```
//!
//! Every event crossing threads is coloured with the sender's active
//! colour. White events are counted per destination; the control token
//! accumulates those counts, and the round can only close once every white
//! event sent has been received. Red events sent during the round bound the
//! estimate through `t_min`.

use super::message::{GvtMessage, GvtMsgKind};
use crate::event::{EventHandle, TIME_INFINITY};
use crate::recycler::EventRecycler;
use crate::Time;

/// Rank that starts every round and computes the new GVT.
pub const ROOT_RANK: usize = 0;

/// What the GVT manager needs from the thread it runs on.
pub trait GvtLink {
    /// Local GVT: the time of the next event this thread will process, or
    /// [`TIME_INFINITY`] if it has none.
    fn lgvt(&self) -> Time;

    /// The thread's event recycler, used to create and destroy tokens.
    fn recycler(&mut self) -> &mut EventRecycler;

    /// Delivers `msg` to the thread [`GvtMessage::dest_rank`] names.
    fn send_gvt_message(&mut self, msg: GvtMessage);
}

/// Per-rank GVT state.
#[derive(Debug)]
pub struct GvtManager {
    rank: usize,
    num_ranks: usize,
    white: u8,
    active_color: u8,
    cycle: u32,
    t_min: Time,
    gvt: Time,
    vec_counters: [Vec<i32>; 2],
    ctrl_msg: Option<GvtMessage>,
    /// Token of the next round that arrived before this round's estimate.
    deferred_ctrl: Option<GvtMessage>,
    round_sequence: Option<u32>,
    advanced: bool,
    rounds: u64,
}

impl GvtManager {
    /// Creates the manager for `rank` of `num_ranks`, with GVT at `start_time`.
    pub fn new(rank: usize, num_ranks: usize, start_time: Time) -> Self {
        debug_assert!(num_ranks > 0 && rank < num_ranks);
        debug_assert!(start_time < TIME_INFINITY);
        Self {
            rank,
            num_ranks,
            white: 0,
            active_color: 0,
            cycle: 0,
            t_min: TIME_INFINITY,
            gvt: start_time,
            vec_counters: [vec![0; num_ranks], vec![0; num_ranks]],
            ctrl_msg: None,
            deferred_ctrl: None,
            round_sequence: None,
            advanced: false,
            rounds: 0,
        }
    }

    /// This manager's rank.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Current GVT.
    pub fn gvt(&self) -> Time {
        self.gvt
    }

    /// Colour stamped on events sent now.
    pub fn active_color(&self) -> u8 {
        self.active_color
    }

    /// Rounds completed on this rank.
    pub fn rounds(&self) -> u64 {
        self.rounds
    }

    /// Whether a round is in progress on the root.
    pub fn estimating(&self) -> bool {
        self.cycle != 0
    }

    /// Returns whether GVT advanced since the last call.
    pub fn take_advanced(&mut self) -> bool {
        std::mem::take(&mut self.advanced)
    }

    /// Colours `event` for a send to `dest_rank` and counts it.
    ///
    /// # Safety
    ///
    /// `event` must not yet be visible to any other thread.
    pub unsafe fn send_remote_event(&mut self, event: &mut EventHandle, dest_rank: usize) {
        debug_assert_ne!(dest_rank, self.rank);
        debug_assert!(dest_rank < self.num_ranks);
        let color = self.active_color;
        event.header_mut().set_color(color);
        self.vec_counters[color as usize][dest_rank] += 1;
        if color != self.white {
            self.t_min = self.t_min.min(event.receive_time());
        }
    }

    /// Counts an event received from another rank.
    ///
    /// Call [`check_waiting_ctrl_msg`](Self::check_waiting_ctrl_msg) once
    /// the event is scheduled so the local GVT includes it.
    pub fn inspect_remote_event(&mut self, event: EventHandle) {
        let color = event.header().color() as usize;
        self.vec_counters[color][self.rank] -= 1;
    }

    /// Advances a stashed control token once every white event addressed to
    /// this rank has arrived.
    pub fn check_waiting_ctrl_msg<L: GvtLink + ?Sized>(&mut self, link: &mut L) {
        let Some(ctrl) = &self.ctrl_msg else {
            return;
        };
        if ctrl.counter(self.rank) + self.vec_counters[self.white as usize][self.rank] > 0 {
            return;
        }
        if self.rank == ROOT_RANK && ctrl.are_counters_zero(self.num_ranks) {
            let estimate = ctrl.min().min(self.t_min);
            if let Some(ctrl) = self.ctrl_msg.take() {
                GvtMessage::destroy(ctrl, link.recycler());
            }
            self.set_gvt(estimate, link);
        } else {
            self.forward_ctrl_msg(link);
        }
    }

    /// Adds this rank's white counts and times to the token and passes it
    /// to the next rank.
    pub fn forward_ctrl_msg<L: GvtLink + ?Sized>(&mut self, link: &mut L) {
        let Some(mut ctrl) = self.ctrl_msg.take() else {
            debug_assert!(false, "forward without a control message");
            return;
        };
        let white = self.white as usize;
        for (pid, count) in self.vec_counters[white].iter_mut().enumerate() {
            ctrl.add_counter(pid, *count);
            *count = 0;
        }
        ctrl.set_t_min(ctrl.t_min().min(self.t_min));
        let lgvt = link.lgvt();
        if self.rank == ROOT_RANK {
            ctrl.set_gvt_estimate(lgvt);
        } else {
            ctrl.set_gvt_estimate(ctrl.gvt_estimate().min(lgvt));
        }

        let next = (self.rank + 1) % self.num_ranks;
        let out = GvtMessage::create_from(&ctrl, next, next, link.recycler());
        GvtMessage::destroy(ctrl, link.recycler());
        link.send_gvt_message(out);
        self.cycle += 1;
        tracing::trace!(rank = self.rank, next, cycle = self.cycle, "forwarded GVT token");
    }

    /// Handles a GVT message taken off this rank's queue.
    pub fn recv_gvt_message<L: GvtLink + ?Sized>(&mut self, msg: GvtMessage, link: &mut L) {
        match msg.kind() {
            GvtMsgKind::Ctrl => self.recv_ctrl(msg, link),
            GvtMsgKind::Estimate => {
                let estimate = msg.gvt_estimate();
                GvtMessage::destroy(msg, link.recycler());
                self.recv_gvt_estimate(estimate, link);
                if let Some(deferred) = self.deferred_ctrl.take() {
                    self.recv_ctrl(deferred, link);
                }
            }
            kind => {
                tracing::warn!(rank = self.rank, ?kind, "ignoring unexpected GVT message");
                GvtMessage::destroy(msg, link.recycler());
            }
        }
    }

    fn recv_ctrl<L: GvtLink + ?Sized>(&mut self, msg: GvtMessage, link: &mut L) {
        debug_assert!(self.ctrl_msg.is_none(), "two control tokens on rank {}", self.rank);
        let sequence = msg.sequence();
        if self.rank != ROOT_RANK
            && self.active_color != self.white
            && self.round_sequence != Some(sequence)
        {
            // Next round's token overtook this round's estimate.
            debug_assert!(self.deferred_ctrl.is_none());
            self.deferred_ctrl = Some(msg);
            return;
        }
        self.ctrl_msg = Some(msg);
        if self.rank != ROOT_RANK && self.active_color == self.white {
            self.active_color = 1 - self.white;
            self.t_min = TIME_INFINITY;
            self.round_sequence = Some(sequence);
        }
        self.check_waiting_ctrl_msg(link);
    }

    /// Applies the root's broadcast estimate.
    pub fn recv_gvt_estimate<L: GvtLink + ?Sized>(&mut self, estimate: Time, link: &mut L) {
        debug_assert_ne!(self.rank, ROOT_RANK);
        self.set_gvt(estimate, link);
    }

    /// Starts a round on the root if none is running.
    ///
    /// With a single rank the estimate is simply the local GVT.
    pub fn start_gvt_estimation<L: GvtLink + ?Sized>(&mut self, link: &mut L) {
        if self.cycle != 0 || self.rank != ROOT_RANK {
            return;
        }
        if self.num_ranks < 2 {
            self.active_color = 1 - self.white;
            let lgvt = link.lgvt();
            self.set_gvt(lgvt, link);
            return;
        }
        debug_assert!(self.ctrl_msg.is_none());
        debug_assert_eq!(self.active_color, self.white);

        let lgvt = link.lgvt();
        let mut msg = GvtMessage::create(GvtMsgKind::Ctrl, self.num_ranks, 1, link.recycler());
        msg.set_gvt_estimate(lgvt);
        msg.set_t_min(TIME_INFINITY);
        let white = self.white as usize;
        for (pid, count) in self.vec_counters[white].iter_mut().enumerate() {
            msg.set_counter(pid, *count);
            *count = 0;
        }
        self.active_color = 1 - self.white;
        self.t_min = TIME_INFINITY;
        self.cycle = 1;
        tracing::trace!(lgvt, sequence = msg.sequence(), "starting GVT round");
        link.send_gvt_message(msg);
    }

    /// Closes the round on this rank and adopts `estimate` if it is larger.
    ///
    /// The root broadcasts every result, including unchanged ones, so that
    /// every rank flips its colour.
    pub fn set_gvt<L: GvtLink + ?Sized>(&mut self, estimate: Time, link: &mut L) {
        debug_assert_ne!(self.active_color, self.white);
        self.white = 1 - self.white;
        self.cycle = 0;
        self.round_sequence = None;
        self.rounds += 1;

        if self.rank == ROOT_RANK {
            for dest in (0..self.num_ranks).filter(|&r| r != ROOT_RANK) {
                let mut msg = GvtMessage::create(GvtMsgKind::Estimate, self.num_ranks, dest, link.recycler());
                msg.set_gvt_estimate(estimate);
                link.send_gvt_message(msg);
            }
        }
        if estimate <= self.gvt {
            return;
        }
        tracing::debug!(rank = self.rank, gvt = estimate, round = self.rounds, "GVT advanced");
        self.gvt = estimate;
        self.advanced = true;
    }

    /// Destroys any token still held, at wind-down.
    pub fn discard(&mut self, recycler: &mut EventRecycler) {
        for msg in [self.ctrl_msg.take(), self.deferred_ctrl.take()].into_iter().flatten() {
            GvtMessage::destroy(msg, recycler);
        }
    }

    /// White-event balance this rank has not reported yet, per destination.
    pub fn unreported(&self) -> &[i32] {
        &self.vec_counters[self.white as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::MemoryTopology;
    use std::collections::VecDeque;
    use std::sync::Arc;

    /// Ranks exchanging tokens through in-memory mailboxes.
    struct Ring {
        managers: Vec<GvtManager>,
        recyclers: Vec<EventRecycler>,
        mailboxes: Vec<VecDeque<GvtMessage>>,
        lgvt: Vec<Time>,
    }

    struct Link<'a> {
        lgvt: Time,
        recycler: &'a mut EventRecycler,
        outbox: &'a mut Vec<GvtMessage>,
    }

    impl GvtLink for Link<'_> {
        fn lgvt(&self) -> Time {
            self.lgvt
        }

        fn recycler(&mut self) -> &mut EventRecycler {
            self.recycler
        }

        fn send_gvt_message(&mut self, msg: GvtMessage) {
            self.outbox.push(msg);
        }
    }

    impl Ring {
        fn new(n: usize) -> Self {
            let topology = Arc::new(MemoryTopology::single_node(n));
            Self {
                managers: (0..n).map(|r| GvtManager::new(r, n, 0.0)).collect(),
                recyclers: (0..n)
                    .map(|t| EventRecycler::new(t, Arc::clone(&topology), 64 * 1024).unwrap())
                    .collect(),
                mailboxes: (0..n).map(|_| VecDeque::new()).collect(),
                lgvt: vec![0.0; n],
            }
        }

        fn with<R>(&mut self, rank: usize, f: impl FnOnce(&mut GvtManager, &mut Link<'_>) -> R) -> R {
            let mut outbox = Vec::new();
            let result = {
                let mut link = Link {
                    lgvt: self.lgvt[rank],
                    recycler: &mut self.recyclers[rank],
                    outbox: &mut outbox,
                };
                f(&mut self.managers[rank], &mut link)
            };
            for msg in outbox {
                let dest = msg.dest_rank();
                self.mailboxes[dest].push_back(msg);
            }
            result
        }

        fn deliver(&mut self, rank: usize) -> bool {
            let Some(msg) = self.mailboxes[rank].pop_front() else {
                return false;
            };
            self.with(rank, |gvt, link| gvt.recv_gvt_message(msg, link));
            true
        }

        fn settle(&mut self) {
            while (0..self.managers.len()).any(|r| !self.mailboxes[r].is_empty()) {
                for rank in 0..self.managers.len() {
                    self.deliver(rank);
                }
            }
        }

        fn send_event(&mut self, from: usize, to: usize, time: Time) -> EventHandle {
            let mut event = self.recyclers[from].allocate(crate::event::HEADER_SIZE, to as u64);
            unsafe {
                event.header_mut().receive_time = time;
                self.managers[from].send_remote_event(&mut event, to);
            }
            self.recyclers[from].increase_reference(event);
            event
        }

        fn receive_event(&mut self, from: usize, to: usize, event: EventHandle) {
            self.managers[to].inspect_remote_event(event);
            self.with(to, |gvt, link| gvt.check_waiting_ctrl_msg(link));
            self.recyclers[from].decrease_reference(event);
        }
    }

    #[test]
    fn single_rank_short_circuits() {
        let mut ring = Ring::new(1);
        ring.lgvt[0] = 5.0;
        ring.with(0, |gvt, link| gvt.start_gvt_estimation(link));
        assert_eq!(ring.managers[0].gvt(), 5.0);
        assert!(ring.managers[0].take_advanced());
        assert!(!ring.managers[0].take_advanced());
        assert!(ring.mailboxes[0].is_empty());
    }

    #[test]
    fn quiet_ring_converges_to_min_lgvt() {
        let mut ring = Ring::new(4);
        ring.lgvt = vec![7.0, 3.0, 9.0, 4.0];
        ring.with(0, |gvt, link| gvt.start_gvt_estimation(link));
        assert!(ring.managers[0].estimating());
        ring.settle();

        for manager in &ring.managers {
            assert_eq!(manager.gvt(), 3.0);
            assert_eq!(manager.rounds(), 1);
            assert_eq!(manager.active_color(), manager.white);
        }
        assert!(!ring.managers[0].estimating());
    }

    #[test]
    fn in_transit_white_event_holds_the_round() {
        let mut ring = Ring::new(3);
        ring.lgvt = vec![10.0, 10.0, 10.0];
        let event = ring.send_event(1, 2, 2.0);

        ring.with(0, |gvt, link| gvt.start_gvt_estimation(link));
        ring.settle();
        // Rank 2 is still waiting for the white event.
        assert_eq!(ring.managers[0].gvt(), 0.0);
        assert!(ring.managers[2].ctrl_msg.is_some());

        ring.lgvt[2] = 2.0;
        ring.receive_event(1, 2, event);
        ring.settle();
        for manager in &ring.managers {
            assert_eq!(manager.gvt(), 2.0);
        }
    }

    #[test]
    fn red_event_bounds_estimate() {
        let mut ring = Ring::new(2);
        ring.lgvt = vec![10.0, 10.0];
        ring.with(0, |gvt, link| gvt.start_gvt_estimation(link));
        // Root is red now; its send carries t_min.
        let event = ring.send_event(0, 1, 4.0);
        ring.settle();
        assert_eq!(ring.managers[0].gvt(), 4.0);
        ring.receive_event(0, 1, event);
        ring.settle();
    }

    #[test]
    fn unchanged_estimate_still_flips_colours() {
        let mut ring = Ring::new(3);
        ring.lgvt = vec![0.0; 3];
        for round in 1..=3 {
            ring.with(0, |gvt, link| gvt.start_gvt_estimation(link));
            ring.settle();
            for manager in &ring.managers {
                assert_eq!(manager.gvt(), 0.0);
                assert_eq!(manager.rounds(), round);
                assert_eq!(manager.active_color(), manager.white);
            }
        }
    }

    #[test]
    fn gvt_never_decreases() {
        let mut ring = Ring::new(2);
        ring.lgvt = vec![6.0, 6.0];
        ring.with(0, |gvt, link| gvt.start_gvt_estimation(link));
        ring.settle();
        ring.lgvt = vec![2.0, 2.0];
        ring.with(0, |gvt, link| gvt.start_gvt_estimation(link));
        ring.settle();
        assert_eq!(ring.managers[0].gvt(), 6.0);
        assert_eq!(ring.managers[1].gvt(), 6.0);
    }

    #[test]
    fn next_round_token_waits_for_estimate() {
        let mut ring = Ring::new(3);
        ring.lgvt = vec![5.0, 5.0, 5.0];
        ring.with(0, |gvt, link| gvt.start_gvt_estimation(link));
        // Pass the token around once without delivering estimates to rank 2.
        ring.deliver(1);
        ring.deliver(2);
        ring.deliver(0);
        assert_eq!(ring.managers[0].gvt(), 5.0);
        assert_eq!(ring.mailboxes[2].len(), 1);

        // Rank 1 gets its estimate, the next round starts and overtakes.
        ring.deliver(1);
        ring.lgvt = vec![8.0, 8.0, 8.0];
        ring.with(0, |gvt, link| gvt.start_gvt_estimation(link));
        ring.deliver(1);
        let estimate = ring.mailboxes[2].pop_front().unwrap();
        ring.deliver(2);
        assert!(ring.managers[2].deferred_ctrl.is_some());
        assert_eq!(ring.managers[2].gvt(), 0.0);

        ring.with(2, |gvt, link| gvt.recv_gvt_message(estimate, link));
        ring.settle();
        for manager in &ring.managers {
            assert_eq!(manager.gvt(), 8.0);
            assert_eq!(manager.rounds(), 2);
        }
    }

    #[test]
    fn discard_releases_held_tokens() {
        let mut ring = Ring::new(2);
        let event = ring.send_event(0, 1, 1.0);
        ring.with(0, |gvt, link| gvt.start_gvt_estimation(link));
        ring.deliver(1);
        assert!(ring.managers[1].ctrl_msg.is_some());

        let before = ring.recyclers[1].stats().reclaimed;
        let Ring { managers, recyclers, .. } = &mut ring;
        managers[1].discard(&mut recyclers[1]);
        assert_eq!(recyclers[1].stats().reclaimed, before + 1);
        ring.receive_event(0, 1, event);
    }
}
