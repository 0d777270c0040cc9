use super::{check_pe, recv_or_warn, Backend, LamellaeComm, TransportResult};
use crate::error::TransportError;

use crossbeam::channel::{Receiver, Sender};
use std::sync::atomic::{AtomicUsize, Ordering};

/// One PE of an in-process group, every ordered pair of PEs shares a dedicated channel.
///
/// When a PE's thread exits its senders are dropped, so peers waiting on it observe
/// a disconnect rather than blocking forever.
pub(crate) struct Threads {
    my_pe: usize,
    num_pes: usize,
    tx: Vec<Sender<Vec<u8>>>,   // indexed by destination pe
    rx: Vec<Receiver<Vec<u8>>>, // indexed by source pe
    data_cnt: AtomicUsize,
}

impl std::fmt::Debug for Threads {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Threads {{ my_pe: {}, num_pes: {} }}",
            self.my_pe, self.num_pes
        )
    }
}

/// Build the channel mesh for `num_pes` PEs, returning the endpoint of each PE in rank order
pub(crate) fn create_fabric(num_pes: usize) -> Vec<Threads> {
    // channels[src][dst]
    let mut senders: Vec<Vec<Option<Sender<Vec<u8>>>>> = Vec::with_capacity(num_pes);
    let mut receivers: Vec<Vec<Option<Receiver<Vec<u8>>>>> = Vec::with_capacity(num_pes);
    for _src in 0..num_pes {
        let mut s_row = Vec::with_capacity(num_pes);
        let mut r_row = Vec::with_capacity(num_pes);
        for _dst in 0..num_pes {
            let (s, r) = crossbeam::channel::unbounded();
            s_row.push(Some(s));
            r_row.push(Some(r));
        }
        senders.push(s_row);
        receivers.push(r_row);
    }
    (0..num_pes)
        .map(|pe| {
            let tx = senders[pe]
                .iter_mut()
                .filter_map(|s| s.take())
                .collect::<Vec<_>>();
            let rx = receivers
                .iter_mut()
                .filter_map(|row| row[pe].take())
                .collect::<Vec<_>>();
            Threads {
                my_pe: pe,
                num_pes,
                tx,
                rx,
                data_cnt: AtomicUsize::new(0),
            }
        })
        .collect()
}

impl LamellaeComm for Threads {
    fn my_pe(&self) -> usize {
        self.my_pe
    }
    fn num_pes(&self) -> usize {
        self.num_pes
    }
    fn backend(&self) -> Backend {
        Backend::Threads
    }
    fn send_to_pe(&self, pe: usize, data: Vec<u8>) -> TransportResult<()> {
        check_pe(pe, self.num_pes)?;
        self.data_cnt.fetch_add(data.len(), Ordering::SeqCst);
        self.tx[pe]
            .send(data)
            .map_err(|_| TransportError::Disconnected(pe))
    }
    fn recv_from_pe(&self, pe: usize) -> TransportResult<Vec<u8>> {
        check_pe(pe, self.num_pes)?;
        recv_or_warn(&self.rx[pe], self.my_pe, pe)
    }
    fn MB_sent(&self) -> f64 {
        self.data_cnt.load(Ordering::SeqCst) as f64 / 1_000_000.0
    }
    fn shutdown(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mesh_is_fifo_per_source() {
        let pes = create_fabric(3);
        pes[2].send_to_pe(0, vec![1]).unwrap();
        pes[2].send_to_pe(0, vec![2]).unwrap();
        pes[1].send_to_pe(0, vec![3]).unwrap();
        assert_eq!(pes[0].recv_from_pe(1).unwrap(), vec![3]);
        assert_eq!(pes[0].recv_from_pe(2).unwrap(), vec![1]);
        assert_eq!(pes[0].recv_from_pe(2).unwrap(), vec![2]);
    }

    #[test]
    fn dropped_peer_disconnects() {
        let mut pes = create_fabric(2);
        let peer = pes.pop().unwrap();
        drop(peer);
        match pes[0].recv_from_pe(1) {
            Err(TransportError::Disconnected(1)) => {}
            other => panic!("expected disconnect, got {:?}", other),
        }
        assert!(pes[0].send_to_pe(1, vec![0]).is_err());
        assert!(matches!(
            pes[0].send_to_pe(5, vec![0]),
            Err(TransportError::InvalidPe(5))
        ));
    }
}
