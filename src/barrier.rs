use crate::collectives::{recv_msg, send_msg, CollectiveOp, Header};
use crate::error::Result;
use crate::lamellae::Lamellae;

use std::sync::atomic::{AtomicU64, Ordering};

/// n-way dissemination barrier.
///
/// In round `r` every PE notifies the PEs `j * factor^r` ahead of it (`j` in `1..factor`)
/// and waits on the PEs the same distances behind it, completing in `ceil(log_factor(num_pes))` rounds.
#[derive(Debug)]
pub(crate) struct Barrier {
    my_pe: usize,
    num_pes: usize,
    dissemination_factor: usize,
    barrier_cnt: AtomicU64,
}

impl Barrier {
    /// The fan-out actually used for a configured factor, every PE of a group must agree on it
    pub(crate) fn effective_factor(dissemination_factor: usize) -> usize {
        dissemination_factor.max(2)
    }

    pub(crate) fn new(my_pe: usize, num_pes: usize, dissemination_factor: usize) -> Barrier {
        Barrier {
            my_pe,
            num_pes,
            dissemination_factor: Barrier::effective_factor(dissemination_factor),
            barrier_cnt: AtomicU64::new(0),
        }
    }

    /// Offsets (modulo num_pes) this PE sends to in each round, zero offsets are dropped
    fn rounds(&self) -> Vec<Vec<usize>> {
        let mut rounds = Vec::new();
        let mut dist = 1usize;
        while dist < self.num_pes {
            let offsets = (1..self.dissemination_factor)
                .map(|j| j.saturating_mul(dist) % self.num_pes)
                .filter(|off| *off != 0)
                .collect();
            rounds.push(offsets);
            dist = dist.saturating_mul(self.dissemination_factor);
        }
        rounds
    }

    pub(crate) fn barrier(&self, lamellae: &Lamellae) -> Result<()> {
        if self.num_pes <= 1 {
            return Ok(());
        }
        let barrier_id = self.barrier_cnt.fetch_add(1, Ordering::SeqCst);
        let header = Header::new(CollectiveOp::Barrier, barrier_id);
        for (round, offsets) in self.rounds().iter().enumerate() {
            let header = header.with_round(round as u32);
            for off in offsets {
                send_msg(lamellae, header, (self.my_pe + off) % self.num_pes, &())?;
            }
            for off in offsets {
                let src = (self.my_pe + self.num_pes - off) % self.num_pes;
                recv_msg::<()>(lamellae, header, src)?;
            }
        }
        Ok(())
    }
}
