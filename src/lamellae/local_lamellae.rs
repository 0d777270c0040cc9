use super::{
    check_pe, recv_or_warn, Backend, Lamellae, LamellaeComm, LamellaeInit, TransportResult,
};
use crate::error::{Error, TransportError};

use crossbeam::channel::{Receiver, Sender};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Single PE execution, messages a PE sends to itself go through a loopback queue
#[derive(Clone)]
pub(crate) struct Local {
    loopback_tx: Sender<Vec<u8>>,
    loopback_rx: Receiver<Vec<u8>>,
    data_cnt: Arc<AtomicUsize>,
}

impl std::fmt::Debug for Local {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Local")
    }
}

impl Local {
    pub(crate) fn new() -> Result<Local, Error> {
        if let Ok(val) = std::env::var("DISTMM_NUM_PES") {
            if val.trim() != "1" {
                return Err(Error::GroupJoin(format!(
                    "launched with DISTMM_NUM_PES={} but the local backend only supports a single pe, set DISTMM_BACKEND=sockets",
                    val
                )));
            }
        }
        let (loopback_tx, loopback_rx) = crossbeam::channel::unbounded();
        Ok(Local {
            loopback_tx,
            loopback_rx,
            data_cnt: Arc::new(AtomicUsize::new(0)),
        })
    }
}

impl LamellaeInit for Local {
    fn init_fabric(&mut self) -> (usize, usize) {
        (0, 1)
    }
    fn init_lamellae(&mut self) -> Result<Lamellae, Error> {
        Ok(Lamellae::Local(self.clone()))
    }
}

impl LamellaeComm for Local {
    fn my_pe(&self) -> usize {
        0
    }
    fn num_pes(&self) -> usize {
        1
    }
    fn backend(&self) -> Backend {
        Backend::Local
    }
    fn send_to_pe(&self, pe: usize, data: Vec<u8>) -> TransportResult<()> {
        check_pe(pe, 1)?;
        self.data_cnt.fetch_add(data.len(), Ordering::SeqCst);
        self.loopback_tx
            .send(data)
            .map_err(|_| TransportError::Disconnected(pe))
    }
    fn recv_from_pe(&self, pe: usize) -> TransportResult<Vec<u8>> {
        check_pe(pe, 1)?;
        recv_or_warn(&self.loopback_rx, 0, pe)
    }
    fn MB_sent(&self) -> f64 {
        self.data_cnt.load(Ordering::SeqCst) as f64 / 1_000_000.0
    }
    fn shutdown(&self) {}
}
