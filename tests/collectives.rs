mod common;

use common::{run_sockets, run_threaded};
use distmm::{
    CollectiveOp, CollectiveOps, ConfigurationError, Error, Matrix, TransportError, COORDINATOR,
};
use serial_test::serial;
use std::sync::atomic::{AtomicUsize, Ordering};

fn numbered(rows: usize, cols: usize) -> Matrix {
    Matrix::from_vec(rows, cols, (0..rows * cols).map(|v| v as f64).collect()).unwrap()
}

macro_rules! collective_tests {
    ( $($num_pes:expr),* ) => {
        $(
            paste::paste! {
                #[test]
                fn [<broadcast_from_every_root_ $num_pes _pes>]() {
                    for root in 0..$num_pes {
                        let got = run_threaded($num_pes, |group| {
                            let value = if group.rank() == root {
                                Some(vec![root as u64, 7, 11])
                            } else {
                                None
                            };
                            group.broadcast(value, root).unwrap()
                        });
                        assert_eq!(got, vec![vec![root as u64, 7, 11]; $num_pes]);
                    }
                }

                #[test]
                fn [<scatter_gather_round_trip_ $num_pes _pes>]() {
                    let rows_per_pe = 3;
                    let full = numbered(rows_per_pe * $num_pes, 5);
                    let results = run_threaded($num_pes, |group| {
                        let input = if group.is_coordinator() { Some(&full) } else { None };
                        let slice = group.scatter(input, rows_per_pe, COORDINATOR).unwrap();
                        assert_eq!(slice.row_range(), group.rank() * 3..group.rank() * 3 + 3);
                        assert_eq!(slice.shape(), (rows_per_pe, 5));
                        for (i, row) in slice.row_range().enumerate() {
                            assert_eq!(slice.row(i), full.row(row));
                        }
                        group.gather(&slice, COORDINATOR).unwrap()
                    });
                    assert_eq!(results[0].as_ref(), Some(&full));
                    assert!(results[1..].iter().all(|r| r.is_none()));
                }

                #[test]
                fn [<barrier_separates_phases_ $num_pes _pes>]() {
                    let arrived = AtomicUsize::new(0);
                    run_threaded($num_pes, |group| {
                        for round in 1..=10 {
                            arrived.fetch_add(1, Ordering::SeqCst);
                            group.barrier().unwrap();
                            assert!(arrived.load(Ordering::SeqCst) >= round * $num_pes);
                            group.barrier().unwrap();
                        }
                    });
                    assert_eq!(arrived.load(Ordering::SeqCst), 10 * $num_pes);
                }
            }
        )*
    };
}

collective_tests!(1, 2, 3, 5, 8);

#[test]
fn gather_to_non_coordinator_root() {
    let results = run_threaded(3, |group| {
        let local = Matrix::from_vec(1, 2, vec![group.rank() as f64; 2]).unwrap();
        group.gather(&local, 2).unwrap()
    });
    assert!(results[0].is_none() && results[1].is_none());
    let gathered = results[2].as_ref().unwrap();
    assert_eq!(gathered.as_slice(), &[0.0, 0.0, 1.0, 1.0, 2.0, 2.0]);
}

#[test]
fn scatter_rejects_misshapen_buffer() {
    let results = run_threaded(2, |group| {
        let full = numbered(5, 2);
        let input = if group.is_coordinator() { Some(&full) } else { None };
        group.scatter(input, 2, COORDINATOR).map(|_| ())
    });
    match &results[0] {
        Err(Error::Configuration(ConfigurationError::ScatterShape {
            rows: 5,
            rows_per_pe: 2,
            num_pes: 2,
        })) => {}
        other => panic!("unexpected coordinator result {:?}", other),
    }
    // the coordinator bailed out, so the peer observes it leaving
    assert!(matches!(
        &results[1],
        Err(Error::Collective {
            op: CollectiveOp::Scatter,
            source: TransportError::Disconnected(0),
            ..
        })
    ));
}

#[test]
fn root_must_supply_a_value() {
    let results = run_threaded(1, |group| group.broadcast(None::<u32>, 0));
    assert!(matches!(
        results[0],
        Err(Error::Configuration(ConfigurationError::MissingRootValue {
            op: CollectiveOp::Broadcast
        }))
    ));
}

#[test]
fn root_outside_the_group() {
    let results = run_threaded(2, |group| group.broadcast(Some(1u8), 2));
    for res in results {
        assert!(matches!(
            res,
            Err(Error::Collective {
                source: TransportError::InvalidPe(2),
                ..
            })
        ));
    }
}

#[test]
fn crashed_peer_fails_the_collective() {
    let results = run_threaded(3, |group| {
        if group.rank() == 2 {
            // leave without taking part
            return Ok(None);
        }
        group.gather(&numbered(1, 1), COORDINATOR)
    });
    match &results[0] {
        Err(Error::Collective {
            op: CollectiveOp::Gather,
            pe: 0,
            source: TransportError::Disconnected(2),
        }) => {}
        other => panic!("unexpected coordinator result {:?}", other),
    }
}

#[test]
fn diverging_collectives_are_detected() {
    let results = run_threaded(2, |group| {
        if group.is_coordinator() {
            group.broadcast(Some(numbered(2, 2)), COORDINATOR).map(|_| ())
        } else {
            group.scatter(None, 1, COORDINATOR).map(|_| ())
        }
    });
    assert!(results[0].is_ok());
    assert!(matches!(
        &results[1],
        Err(Error::Collective {
            op: CollectiveOp::Scatter,
            source: TransportError::Unexpected { src: 0, .. },
            ..
        })
    ));
}

#[test]
#[serial]
fn sockets_mesh_collectives() {
    let full = numbered(8, 4);
    let results = run_sockets(4, 23100, |group| {
        assert_eq!(group.size(), 4);
        let b = group
            .broadcast(group.is_coordinator().then(|| numbered(4, 4)), COORDINATOR)
            .unwrap();
        assert_eq!(b, numbered(4, 4));
        let input = if group.is_coordinator() { Some(&full) } else { None };
        let slice = group.scatter(input, 2, COORDINATOR).unwrap();
        group.barrier().unwrap();
        let gathered = group.gather(&slice, COORDINATOR).unwrap();
        assert!(group.MB_sent() > 0.0);
        group.finalize().unwrap();
        gathered
    });
    assert_eq!(results[0].as_ref(), Some(&full));
}

#[test]
#[serial]
fn sockets_peer_exit_is_a_disconnect() {
    let results = run_sockets(2, 23200, |group| {
        if group.rank() == 1 {
            drop(group);
            return Ok(0u32);
        }
        group.broadcast(None::<u32>, 1)
    });
    assert!(matches!(
        &results[0],
        Err(Error::Collective {
            op: CollectiveOp::Broadcast,
            source: TransportError::Disconnected(1),
            ..
        })
    ));
}
