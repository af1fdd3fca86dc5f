//! Inter-process event transport.
//!
//! Multi-process runs exchange events as flat byte images. Only the
//! designated thread (thread 0) talks to the transport; everything else in
//! the process sees remote events as if thread 0 had sent them.

use std::fmt;

use crate::event::AgentId;

/// Moves event images between processes.
pub trait Transport: Send + Sync + fmt::Debug {
    /// This process's rank.
    fn rank(&self) -> usize;

    /// Number of processes in the run.
    fn num_processes(&self) -> usize;

    /// Rank of the process owning `agent`.
    fn owner_rank(&self, agent: AgentId) -> usize;

    /// Sends one event image to the process owning its receiver.
    fn send_event(&self, bytes: &[u8]);

    /// Appends every event image that has arrived to `out`.
    ///
    /// Returns the number of images appended.
    fn poll(&self, out: &mut Vec<Vec<u8>>) -> usize;
}

/// A single-process run: every agent is local and nothing ever arrives.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTransport;

impl Transport for NullTransport {
    fn rank(&self) -> usize {
        0
    }

    fn num_processes(&self) -> usize {
        1
    }

    fn owner_rank(&self, _agent: AgentId) -> usize {
        0
    }

    fn send_event(&self, bytes: &[u8]) {
        tracing::warn!(len = bytes.len(), "event sent through the null transport was dropped");
    }

    fn poll(&self, _out: &mut Vec<Vec<u8>>) -> usize {
        0
    }
}
