#![cfg(feature = "sim")]

use std::sync::Arc;

use mana_rx::api::{Mempool, ObjectKind};
use mana_rx::buffer_pool::HeapPool;
use mana_rx::errors::{DoorbellError, PostError, StartError};
use mana_rx::sim::{SimDevice, SimOp};
use mana_rx::{PortState, RxFlags, RxPort};
use nix::errno::Errno;

fn setup(queues: u16, ring: u32, bufs: usize) -> (Arc<SimDevice>, Arc<HeapPool>, RxPort) {
    let sim = Arc::new(SimDevice::new());
    let pool = Arc::new(HeapPool::new(bufs, 2048).unwrap());
    let flags = RxFlags {
        num_queues: queues,
        ring_size: ring,
        ..Default::default()
    };
    let port = RxPort::new(sim.clone(), pool.clone(), &flags).unwrap();
    (sim, pool, port)
}

fn assert_torn_down(sim: &SimDevice, pool: &HeapPool, port: &RxPort) {
    assert_eq!(port.state(), PortState::Uncreated);
    assert_eq!(sim.live_objects(), 0);
    assert_eq!(pool.in_use(), 0);
    assert!(port.ind_table().is_empty());
    assert!(port.hash_qp().is_empty());
    for q in port.queues() {
        assert!(q.is_hw_empty(), "rxq {} still holds hardware state", q.id());
        assert_eq!(q.outstanding(), 0);
    }
}

#[test]
fn start_then_stop_returns_every_buffer() {
    let (sim, pool, mut port) = setup(4, 32, 256);
    port.start().unwrap();
    assert_eq!(pool.in_use(), 4 * 32);

    let drained_before: u64 = port.queues().iter().map(|q| q.stats().drained).sum();
    port.stop();
    let drained: u64 = port.queues().iter().map(|q| q.stats().drained).sum();
    assert_eq!(drained - drained_before, 4 * 32);
    assert_torn_down(&sim, &pool, &port);
}

#[test]
fn stop_twice_and_stop_unstarted() {
    let (sim, pool, mut port) = setup(2, 8, 32);
    port.stop();
    assert_torn_down(&sim, &pool, &port);

    port.start().unwrap();
    port.stop();
    let destroyed = sim.destroyed().len();
    port.stop();
    assert_eq!(sim.destroyed().len(), destroyed);
    assert_torn_down(&sim, &pool, &port);
}

#[test]
fn restart_after_stop() {
    let (sim, pool, mut port) = setup(2, 8, 32);
    port.start().unwrap();
    port.stop();
    port.start().unwrap();
    assert!(port.is_running());
    assert_eq!(pool.in_use(), 16);
    assert_eq!(sim.live_of(ObjectKind::Wq), 2);
}

#[test]
fn cq_failure_on_first_queue() {
    let (sim, pool, mut port) = setup(3, 8, 64);
    sim.fail_next(SimOp::CreateCq, 0, Errno::ENOMEM);
    let err = port.start().unwrap_err();
    assert!(matches!(err, StartError::CreateCq { queue: 0, .. }));
    assert_torn_down(&sim, &pool, &port);
}

#[test]
fn wq_failure_rolls_back_earlier_queues() {
    let (sim, pool, mut port) = setup(4, 8, 64);
    sim.fail_next(SimOp::CreateWq, 2, Errno::ENOMEM);
    let err = port.start().unwrap_err();
    assert!(matches!(err, StartError::CreateWq { queue: 2, .. }));
    // queues 0 and 1 got both objects, queue 2 only its cq
    assert_eq!(sim.destroyed().len(), 5);
    assert_torn_down(&sim, &pool, &port);
}

#[test]
fn indirection_table_failure() {
    let (sim, pool, mut port) = setup(2, 8, 32);
    sim.fail_next(SimOp::CreateIndTable, 0, Errno::EINVAL);
    let err = port.start().unwrap_err();
    assert!(matches!(err, StartError::IndirectionTable(_)));
    assert_torn_down(&sim, &pool, &port);
}

#[test]
fn query_failure_rolls_back() {
    let (sim, pool, mut port) = setup(3, 8, 64);
    sim.fail_next(SimOp::Query, 1, Errno::EIO);
    let err = port.start().unwrap_err();
    assert!(matches!(err, StartError::Query { queue: 1, .. }));
    assert_torn_down(&sim, &pool, &port);
}

#[test]
fn short_pool_fails_fill_and_reclaims_posted_buffers() {
    let (sim, pool, mut port) = setup(2, 8, 12);
    let err = port.start().unwrap_err();
    match err {
        StartError::Fill { queue, source } => {
            assert_eq!(queue, 1);
            assert_eq!(source.posted, 4);
            assert!(matches!(source.source, PostError::OutOfBuffers));
        }
        other => panic!("unexpected error {other}"),
    }
    assert_eq!(port.queues()[1].stats().nombuf, 1);
    assert_torn_down(&sim, &pool, &port);
}

#[test]
fn registration_failure_during_fill() {
    let (sim, pool, mut port) = setup(2, 8, 32);
    sim.fail_next(SimOp::Register, 0, Errno::EFAULT);
    let err = port.start().unwrap_err();
    match err {
        StartError::Fill { queue, source } => {
            assert_eq!(queue, 0);
            assert_eq!(source.posted, 0);
            assert!(matches!(source.source, PostError::Registration(_)));
        }
        other => panic!("unexpected error {other}"),
    }
    assert_torn_down(&sim, &pool, &port);
}

#[test]
fn doorbell_failure_is_a_start_failure() {
    let (sim, pool, mut port) = setup(2, 8, 32);
    sim.fail_next(SimOp::Doorbell, 1, Errno::EIO);
    let err = port.start().unwrap_err();
    assert!(matches!(
        err,
        StartError::Doorbell(DoorbellError { queue: 1, .. })
    ));
    assert_torn_down(&sim, &pool, &port);
}

#[test]
fn dropping_a_running_port_tears_it_down() {
    let sim = Arc::new(SimDevice::new());
    let pool = Arc::new(HeapPool::new(64, 2048).unwrap());
    {
        let flags = RxFlags {
            num_queues: 2,
            ring_size: 16,
            ..Default::default()
        };
        let mut port = RxPort::new(sim.clone(), pool.clone(), &flags).unwrap();
        port.start().unwrap();
        assert_eq!(pool.in_use(), 32);
    }
    assert_eq!(sim.live_objects(), 0);
    assert_eq!(pool.in_use(), 0);
}

#[test]
fn steady_state_cycles_buffers() {
    let (sim, pool, mut port) = setup(1, 16, 24);
    port.start().unwrap();

    let q = port.queue_mut(0).unwrap();
    for _ in 0..10 {
        let mbuf = q.pop_completed().unwrap();
        pool.free(mbuf);
    }
    assert_eq!(q.refill().unwrap(), 10);
    assert_eq!(q.outstanding(), 16);
    assert_eq!(q.work_queue().head - q.work_queue().tail, 16);
    assert_eq!(sim.doorbells().len(), 2);
    assert_eq!(sim.doorbells()[1].1, 26 * 32);
}
