use super::{
    check_pe, recv_or_warn, Backend, Lamellae, LamellaeComm, LamellaeInit, TransportResult,
};
use crate::barrier::Barrier;
use crate::config;
use crate::error::{Error, TransportError};

use crossbeam::channel::{Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

const HANDSHAKE_MAX_LEN: usize = 1024;
// initial buffer for a frame body, it only grows as bytes actually arrive
const READ_CHUNK: usize = 1 << 20;

/// Where every PE of a sockets group lives and who this process is within it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketsArch {
    pub my_pe: usize,
    pub num_pes: usize,
    pub job_id: u64,
    /// Host of every pe, indexed by pe id
    pub pe_addrs: Vec<String>,
    /// pe `i` listens on `port + i`
    pub port: u16,
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Result<Option<T>, Error> {
    match std::env::var(name) {
        Ok(val) => val
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| Error::GroupJoin(format!("invalid value for {}: {:?}", name, val))),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(Error::GroupJoin(format!("invalid value for {}: {}", name, e))),
    }
}

impl SocketsArch {
    /// Build an arch for `num_pes` PEs on the given hosts.
    ///
    /// `hosts` holds either a single host shared by every pe or exactly one host per pe.
    pub fn new(
        my_pe: usize,
        num_pes: usize,
        job_id: u64,
        hosts: &[String],
        port: u16,
    ) -> Result<SocketsArch, Error> {
        if num_pes == 0 || my_pe >= num_pes {
            return Err(Error::GroupJoin(format!(
                "pe id {} is not valid for a group of {} pes",
                my_pe, num_pes
            )));
        }
        if usize::from(port) + num_pes > usize::from(u16::MAX) + 1 {
            return Err(Error::GroupJoin(format!(
                "base port {} leaves no room for {} pes",
                port, num_pes
            )));
        }
        let pe_addrs = match hosts.len() {
            0 => vec!["127.0.0.1".to_owned(); num_pes],
            1 => vec![hosts[0].clone(); num_pes],
            n if n == num_pes => hosts.to_vec(),
            n => {
                return Err(Error::GroupJoin(format!(
                    "{} hosts given for a group of {} pes",
                    n, num_pes
                )))
            }
        };
        Ok(SocketsArch {
            my_pe,
            num_pes,
            job_id,
            pe_addrs,
            port,
        })
    }

    /// Read the launch contract (`DISTMM_NUM_PES`, `DISTMM_PE_ID`, `DISTMM_JOB_ID`) from the environment
    pub fn from_env() -> Result<SocketsArch, Error> {
        let num_pes = parse_env::<usize>("DISTMM_NUM_PES")?.unwrap_or(1);
        let my_pe = parse_env::<usize>("DISTMM_PE_ID")?.unwrap_or(0);
        let job_id = parse_env::<u64>("DISTMM_JOB_ID")?.unwrap_or(0);
        let hosts = config()
            .hosts
            .as_deref()
            .map(|h| {
                h.split(',')
                    .map(|s| s.trim().to_owned())
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        SocketsArch::new(my_pe, num_pes, job_id, &hosts, config().port)
    }

    fn addr(&self, pe: usize) -> String {
        format!("{}:{}", self.pe_addrs[pe], usize::from(self.port) + pe)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
struct Handshake {
    job_id: u64,
    pe: u64,
    num_pes: u64,
    barrier_factor: u64,
}

impl Handshake {
    fn from_arch(arch: &SocketsArch) -> Handshake {
        Handshake {
            job_id: arch.job_id,
            pe: arch.my_pe as u64,
            num_pes: arch.num_pes as u64,
            barrier_factor: Barrier::effective_factor(config().barrier_dissemination_factor) as u64,
        }
    }

    /// Checks a peer's handshake against this pe's own, returning the peer's pe id
    fn validate(&self, local: &Handshake) -> Result<usize, Error> {
        if self.job_id != local.job_id {
            return Err(Error::GroupJoin(format!(
                "peer belongs to job {} but this pe belongs to job {}",
                self.job_id, local.job_id
            )));
        }
        if self.num_pes != local.num_pes {
            return Err(Error::GroupJoin(format!(
                "peer pe {} was launched with {} pes but this pe expects {}",
                self.pe, self.num_pes, local.num_pes
            )));
        }
        if self.barrier_factor != local.barrier_factor {
            return Err(Error::GroupJoin(format!(
                "peer pe {} uses barrier dissemination factor {} but this pe uses {}",
                self.pe, self.barrier_factor, local.barrier_factor
            )));
        }
        if self.pe >= local.num_pes || self.pe == local.pe {
            return Err(Error::GroupJoin(format!("peer claims invalid pe id {}", self.pe)));
        }
        usize::try_from(self.pe)
            .map_err(|_| Error::GroupJoin(format!("peer claims invalid pe id {}", self.pe)))
    }
}

pub(crate) fn write_frame<W: Write>(stream: &mut W, data: &[u8]) -> io::Result<()> {
    stream.write_all(&(data.len() as u64).to_le_bytes())?;
    stream.write_all(data)?;
    stream.flush()
}

/// Returns `Ok(None)` when the peer closed the connection cleanly between frames
pub(crate) fn read_frame<R: Read>(stream: &mut R, max_len: usize) -> io::Result<Option<Vec<u8>>> {
    let mut size_buf = 0u64.to_le_bytes();
    match stream.read_exact(&mut size_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let raw_size = u64::from_le_bytes(size_buf);
    let size = usize::try_from(raw_size)
        .ok()
        .filter(|size| *size <= max_len)
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "frame of {} bytes exceeds the {} byte frame limit",
                    raw_size, max_len
                ),
            )
        })?;
    let mut data = Vec::with_capacity(size.min(READ_CHUNK));
    let read = (&mut *stream).take(raw_size).read_to_end(&mut data)?;
    if read != size {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("frame truncated after {} of {} bytes", read, size),
        ));
    }
    Ok(Some(data))
}

fn send_handshake(stream: &mut TcpStream, hs: &Handshake) -> Result<(), Error> {
    let data = bincode::serialize(hs)
        .map_err(|e| Error::GroupJoin(format!("unable to encode handshake: {}", e)))?;
    write_frame(stream, &data)?;
    Ok(())
}

fn recv_handshake(stream: &mut TcpStream, deadline: Instant) -> Result<Handshake, Error> {
    let remaining = deadline
        .saturating_duration_since(Instant::now())
        .max(Duration::from_millis(10));
    stream.set_read_timeout(Some(remaining))?;
    let data = read_frame(stream, HANDSHAKE_MAX_LEN)?
        .ok_or_else(|| Error::GroupJoin("connection closed during handshake".to_owned()))?;
    stream.set_read_timeout(None)?;
    bincode::deserialize(&data)
        .map_err(|e| Error::GroupJoin(format!("malformed handshake: {}", e)))
}

fn resolve(addr: &str) -> Result<SocketAddr, Error> {
    addr.to_socket_addrs()
        .map_err(|e| Error::GroupJoin(format!("unable to resolve {}: {}", addr, e)))?
        .next()
        .ok_or_else(|| Error::GroupJoin(format!("{} did not resolve to any address", addr)))
}

fn connect_to_pe(arch: &SocketsArch, pe: usize, deadline: Instant) -> Result<TcpStream, Error> {
    let addr_port = arch.addr(pe);
    let addr = resolve(&addr_port)?;
    let mut stream = loop {
        match TcpStream::connect_timeout(&addr, Duration::from_secs(1)) {
            Ok(stream) => break stream,
            Err(e) => {
                if Instant::now() >= deadline {
                    return Err(Error::GroupJoin(format!(
                        "pe {} unable to reach pe {} at {}: {}",
                        arch.my_pe, pe, addr_port, e
                    )));
                }
                std::thread::sleep(Duration::from_millis(20));
            }
        }
    };
    stream.set_nodelay(true)?;
    send_handshake(&mut stream, &Handshake::from_arch(arch))?;
    let reply = recv_handshake(&mut stream, deadline)?;
    let r_pe = reply.validate(&Handshake::from_arch(arch))?;
    if r_pe != pe {
        return Err(Error::GroupJoin(format!(
            "connected to {} expecting pe {} but found pe {}",
            addr_port, pe, r_pe
        )));
    }
    trace!("[{:?}] connected to pe {:?} at {}", arch.my_pe, pe, addr_port);
    Ok(stream)
}

fn accept_peers(
    listener: TcpListener,
    arch: SocketsArch,
    deadline: Instant,
) -> Result<Vec<(usize, TcpStream)>, Error> {
    listener.set_nonblocking(true)?;
    let local = Handshake::from_arch(&arch);
    let mut receivers: Vec<(usize, TcpStream)> = Vec::with_capacity(arch.num_pes - 1);
    while receivers.len() < arch.num_pes - 1 {
        match listener.accept() {
            Ok((mut stream, _)) => {
                stream.set_nonblocking(false)?;
                let hs = recv_handshake(&mut stream, deadline)?;
                let pe = hs.validate(&local)?;
                if receivers.iter().any(|(p, _)| *p == pe) {
                    return Err(Error::GroupJoin(format!(
                        "pe {} connected to pe {} twice",
                        pe, arch.my_pe
                    )));
                }
                send_handshake(&mut stream, &local)?;
                receivers.push((pe, stream));
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    let missing = (0..arch.num_pes)
                        .filter(|pe| *pe != arch.my_pe && !receivers.iter().any(|(p, _)| p == pe))
                        .collect::<Vec<_>>();
                    return Err(Error::GroupJoin(format!(
                        "pe {} timed out waiting for pes {:?} to join",
                        arch.my_pe, missing
                    )));
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(receivers)
}

fn recv_thread(
    mut stream: TcpStream,
    src_pe: usize,
    max_frame_len: usize,
    tx: Sender<Vec<u8>>,
    active: Arc<AtomicBool>,
) {
    loop {
        match read_frame(&mut stream, max_frame_len) {
            Ok(Some(data)) => {
                if tx.send(data).is_err() {
                    break;
                }
            }
            Ok(None) => {
                debug!("pe {:?} closed its connection", src_pe);
                break;
            }
            Err(e) => {
                if active.load(Ordering::SeqCst) {
                    warn!("error in network read from pe {:?}: {:?}", src_pe, e);
                }
                break;
            }
        }
    }
    // dropping tx here lets a pending recv_from_pe(src_pe) observe the disconnect
}

pub(crate) struct SocketsBuilder {
    arch: SocketsArch,
}

impl SocketsBuilder {
    pub(crate) fn new(arch: SocketsArch) -> SocketsBuilder {
        SocketsBuilder { arch }
    }
}

impl LamellaeInit for SocketsBuilder {
    fn init_fabric(&mut self) -> (usize, usize) {
        (self.arch.my_pe, self.arch.num_pes)
    }
    fn init_lamellae(&mut self) -> Result<Lamellae, Error> {
        Ok(Lamellae::Sockets(Sockets::connect(self.arch.clone())?))
    }
}

/// One PE of a group connected by a full tcp mesh.
///
/// Every pair of PEs uses two connections, one per direction. Outgoing frames are written
/// directly by the caller, incoming frames are read by one thread per peer and queued per source.
pub(crate) struct Sockets {
    arch: SocketsArch,
    senders: Vec<Option<Mutex<TcpStream>>>,
    loopback: Sender<Vec<u8>>,
    inbound: Vec<Receiver<Vec<u8>>>,
    receiver_streams: Mutex<Vec<TcpStream>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    active: Arc<AtomicBool>,
    data_cnt: AtomicUsize,
}

impl std::fmt::Debug for Sockets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Sockets {{ my_pe: {}, num_pes: {}, job_id: {}, active: {:?} }}",
            self.arch.my_pe, self.arch.num_pes, self.arch.job_id, self.active
        )
    }
}

impl Sockets {
    pub(crate) fn connect(arch: SocketsArch) -> Result<Sockets, Error> {
        let deadline = Instant::now() + Duration::from_secs_f64(config().join_timeout.max(0.0));
        let my_addr = arch.addr(arch.my_pe);
        let listener = TcpListener::bind(resolve(&my_addr)?).map_err(|e| {
            Error::GroupJoin(format!(
                "pe {} unable to listen on {}: {}",
                arch.my_pe, my_addr, e
            ))
        })?;
        debug!("my_pe {:?} addr_port: {:?}", arch.my_pe, my_addr);

        let acceptor = {
            let arch = arch.clone();
            std::thread::spawn(move || accept_peers(listener, arch, deadline))
        };

        let mut senders = Vec::with_capacity(arch.num_pes);
        let mut connect_err = None;
        for pe in 0..arch.num_pes {
            if pe == arch.my_pe {
                senders.push(None);
                continue;
            }
            match connect_to_pe(&arch, pe, deadline) {
                Ok(stream) => senders.push(Some(Mutex::new(stream))),
                Err(e) => {
                    connect_err = Some(e);
                    break;
                }
            }
        }
        let accepted = acceptor
            .join()
            .map_err(|_| Error::GroupJoin("connection acceptor panicked".to_owned()))?;
        if let Some(e) = connect_err {
            return Err(e);
        }
        let accepted = accepted?;

        let max_frame_len = config().max_frame_mb.saturating_mul(1 << 20);
        let active = Arc::new(AtomicBool::new(true));
        let (loopback, loopback_rx) = crossbeam::channel::unbounded();
        let mut inbound = Vec::with_capacity(arch.num_pes);
        let mut pending = accepted;
        let mut receiver_streams = Vec::with_capacity(arch.num_pes - 1);
        let mut threads = Vec::with_capacity(arch.num_pes - 1);
        let mut loopback_rx = Some(loopback_rx);
        for pe in 0..arch.num_pes {
            if pe == arch.my_pe {
                if let Some(rx) = loopback_rx.take() {
                    inbound.push(rx);
                }
                continue;
            }
            let idx = pending
                .iter()
                .position(|(p, _)| *p == pe)
                .ok_or_else(|| Error::GroupJoin(format!("no connection from pe {}", pe)))?;
            let (_, stream) = pending.swap_remove(idx);
            receiver_streams.push(stream.try_clone()?);
            let (tx, rx) = crossbeam::channel::unbounded();
            inbound.push(rx);
            let active = active.clone();
            threads.push(std::thread::spawn(move || {
                recv_thread(stream, pe, max_frame_len, tx, active)
            }));
        }
        debug!(
            "[{:?}] joined sockets group of {:?} pes (job {:?})",
            arch.my_pe, arch.num_pes, arch.job_id
        );
        Ok(Sockets {
            arch,
            senders,
            loopback,
            inbound,
            receiver_streams: Mutex::new(receiver_streams),
            threads: Mutex::new(threads),
            active,
            data_cnt: AtomicUsize::new(0),
        })
    }
}

impl LamellaeComm for Sockets {
    fn my_pe(&self) -> usize {
        self.arch.my_pe
    }
    fn num_pes(&self) -> usize {
        self.arch.num_pes
    }
    fn backend(&self) -> Backend {
        Backend::Sockets
    }
    fn send_to_pe(&self, pe: usize, data: Vec<u8>) -> TransportResult<()> {
        check_pe(pe, self.arch.num_pes)?;
        self.data_cnt.fetch_add(data.len(), Ordering::SeqCst);
        match &self.senders[pe] {
            None => self
                .loopback
                .send(data)
                .map_err(|_| TransportError::Disconnected(pe)),
            Some(sender) => {
                let mut conn = sender.lock();
                write_frame(&mut *conn, &data).map_err(|e| match e.kind() {
                    io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::NotConnected => TransportError::Disconnected(pe),
                    _ => TransportError::Io(e),
                })
            }
        }
    }
    fn recv_from_pe(&self, pe: usize) -> TransportResult<Vec<u8>> {
        check_pe(pe, self.arch.num_pes)?;
        recv_or_warn(&self.inbound[pe], self.arch.my_pe, pe)
    }
    fn MB_sent(&self) -> f64 {
        self.data_cnt.load(Ordering::SeqCst) as f64 / 1_000_000.0
    }
    fn shutdown(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        for sender in self.senders.iter().flatten() {
            let _ = sender.lock().shutdown(Shutdown::Write);
        }
        for stream in self.receiver_streams.lock().drain(..) {
            let _ = stream.shutdown(Shutdown::Both);
        }
        let mut threads = self.threads.lock();
        while let Some(thread) = threads.pop() {
            if thread.join().is_err() {
                warn!("[{:?}] error joining socket reader thread", self.arch.my_pe);
            }
        }
    }
}

impl Drop for Sockets {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_round_trip_and_detect_eof() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"abc").unwrap();
        write_frame(&mut buf, b"").unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        assert_eq!(read_frame(&mut cursor, 16).unwrap(), Some(b"abc".to_vec()));
        assert_eq!(read_frame(&mut cursor, 16).unwrap(), Some(Vec::new()));
        assert_eq!(read_frame(&mut cursor, 16).unwrap(), None);
    }

    #[test]
    fn oversized_length_prefix_is_rejected() {
        let mut buf = u64::MAX.to_le_bytes().to_vec();
        buf.extend_from_slice(b"abc");
        let err = read_frame(&mut std::io::Cursor::new(buf), 1 << 20).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        let mut buf = Vec::new();
        write_frame(&mut buf, &[7u8; 32]).unwrap();
        let err = read_frame(&mut std::io::Cursor::new(buf), 31).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn lying_length_prefix_allocates_only_what_arrives() {
        // claims a gigabyte, delivers three bytes
        let mut buf = (1u64 << 30).to_le_bytes().to_vec();
        buf.extend_from_slice(b"abc");
        let err = read_frame(&mut std::io::Cursor::new(buf), usize::MAX).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn truncated_frame_is_an_error() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"abcdef").unwrap();
        buf.truncate(10);
        let mut cursor = std::io::Cursor::new(buf);
        assert!(read_frame(&mut cursor, 16).is_err());
    }

    #[test]
    fn arch_hosts() {
        let arch = SocketsArch::new(1, 3, 9, &[], 20000).unwrap();
        assert_eq!(arch.pe_addrs, vec!["127.0.0.1"; 3]);
        assert_eq!(arch.addr(2), "127.0.0.1:20002");
        let hosts = vec!["a".to_owned(), "b".to_owned()];
        assert!(SocketsArch::new(0, 3, 9, &hosts, 20000).is_err());
        assert!(SocketsArch::new(3, 3, 9, &[], 20000).is_err());
        assert!(SocketsArch::new(0, 4, 9, &[], u16::MAX - 2).is_err());
    }

    #[test]
    fn handshake_rejects_other_jobs_and_sizes() {
        let local = Handshake { job_id: 42, pe: 0, num_pes: 2, barrier_factor: 2 };
        let good = Handshake { pe: 1, ..local };
        assert_eq!(good.validate(&local).unwrap(), 1);
        let wrong_job = Handshake { job_id: 7, ..good };
        assert!(matches!(wrong_job.validate(&local), Err(Error::GroupJoin(_))));
        let wrong_size = Handshake { num_pes: 3, ..good };
        assert!(matches!(wrong_size.validate(&local), Err(Error::GroupJoin(_))));
        let myself = Handshake { pe: 0, ..good };
        assert!(myself.validate(&local).is_err());
        let outside = Handshake { pe: 2, ..good };
        assert!(outside.validate(&local).is_err());
    }

    #[test]
    fn handshake_rejects_other_barrier_schedules() {
        let local = Handshake { job_id: 42, pe: 0, num_pes: 4, barrier_factor: 2 };
        let peer = Handshake { pe: 3, barrier_factor: 3, ..local };
        match peer.validate(&local) {
            Err(Error::GroupJoin(msg)) => assert!(msg.contains("dissemination factor")),
            other => panic!("unexpected handshake result {:?}", other),
        }
        // factors below two run the same schedule as two
        assert_eq!(Barrier::effective_factor(0), Barrier::effective_factor(2));
        assert_eq!(Barrier::effective_factor(1), 2);
    }

    #[test]
    fn local_handshake_carries_the_barrier_factor() {
        let arch = SocketsArch::new(1, 3, 9, &[], 20000).unwrap();
        let hs = Handshake::from_arch(&arch);
        assert_eq!((hs.job_id, hs.pe, hs.num_pes), (9, 1, 3));
        assert_eq!(
            hs.barrier_factor,
            Barrier::effective_factor(config().barrier_dissemination_factor) as u64
        );
    }
}
