//! End-to-end propagation through deferred callbacks, timers and emitters.
//!
//! Each scenario starts ten independent transactions and checks that every
//! continuation looks up exactly the transaction that scheduled it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use proptest::prelude::*;
use rand::Rng;
use tether_core::TransactionHandle;
use tether_runtime::{Agent, AgentConfig, EmitterPrototype, EventEmitter, EventLoop};

const TRANSACTIONS: usize = 10;

#[derive(Clone)]
enum Signal {
    Start,
    Inner(TransactionHandle, usize),
}

struct Harness {
    event_loop: Arc<EventLoop>,
    agent: Arc<Agent>,
    proto: EmitterPrototype<Signal>,
}

impl Harness {
    fn new() -> Self {
        let event_loop = Arc::new(EventLoop::default());
        let agent = Arc::new(Agent::new(AgentConfig::default(), &event_loop));
        let proto = EmitterPrototype::new();
        agent.instrument_emitters(&proto);
        Self {
            event_loop,
            agent,
            proto,
        }
    }

    fn emitter(&self) -> Arc<EventEmitter<Signal>> {
        Arc::new(self.proto.emitter())
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.agent.unload();
    }
}

type Slots = Arc<Mutex<Vec<Option<TransactionHandle>>>>;

fn slots() -> Slots {
    Arc::new(Mutex::new(vec![None; TRANSACTIONS]))
}

/// Listens for `inner` signals, checks each against the transaction stored
/// for its index, then names and ends it.
fn verify_inner(emitter: &EventEmitter<Signal>, transactions: &Slots, done: &Arc<AtomicUsize>) {
    let transactions = Arc::clone(transactions);
    let done = Arc::clone(done);
    emitter.on("inner", move |signal: &Signal| {
        let Signal::Inner(transaction, index) = signal else {
            panic!("unexpected signal on inner");
        };
        let expected = transactions.lock()[*index].clone().expect("transaction recorded");
        assert!(Arc::ptr_eq(transaction, &expected));
        assert_eq!(transaction.id(), expected.id());

        let name = format!("propagation-{index}");
        transaction.set_name(name.as_str());
        assert!(transaction.duration().is_none());
        assert!(transaction.end());
        assert!(!transaction.is_active());
        assert!(transaction.duration().is_some());
        assert_eq!(transaction.name(), Some(name));
        done.fetch_add(1, Ordering::SeqCst);
    });
}

#[test]
fn lookup_is_empty_outside_any_transaction() {
    let harness = Harness::new();
    assert!(harness.agent.get_transaction().is_none());
}

#[test]
fn next_tick_carries_each_transaction() {
    let harness = Harness::new();
    let synchronizer = harness.emitter();
    let transactions = slots();
    let done = Arc::new(AtomicUsize::new(0));
    verify_inner(&synchronizer, &transactions, &done);

    for index in 0..TRANSACTIONS {
        let event_loop = Arc::clone(&harness.event_loop);
        let agent = Arc::clone(&harness.agent);
        let synchronizer = Arc::clone(&synchronizer);
        let transactions = Arc::clone(&transactions);
        harness.event_loop.next_tick(move || {
            let current = agent.create_transaction();
            transactions.lock()[index] = Some(Arc::clone(&current));

            let agent = Arc::clone(&agent);
            let synchronizer = Arc::clone(&synchronizer);
            event_loop.next_tick(move || {
                let lookup = agent.get_transaction().expect("transaction propagated");
                assert!(Arc::ptr_eq(&lookup, &current));
                synchronizer.emit("inner", &Signal::Inner(lookup, index));
            });
        });
    }

    harness.event_loop.run_until_idle().unwrap();
    assert_eq!(done.load(Ordering::SeqCst), TRANSACTIONS);
}

#[test]
fn timers_carry_each_transaction_across_random_delays() {
    let harness = Harness::new();
    let synchronizer = harness.emitter();
    let transactions = slots();
    let done = Arc::new(AtomicUsize::new(0));
    verify_inner(&synchronizer, &transactions, &done);
    let mut rng = rand::rng();

    for index in 0..TRANSACTIONS {
        let event_loop = Arc::clone(&harness.event_loop);
        let agent = Arc::clone(&harness.agent);
        let synchronizer = Arc::clone(&synchronizer);
        let transactions = Arc::clone(&transactions);
        let delay = Duration::from_millis(rng.random_range(0..20));
        harness.event_loop.set_timeout(
            move || {
                let current = agent.create_transaction();
                transactions.lock()[index] = Some(Arc::clone(&current));

                let agent = Arc::clone(&agent);
                let synchronizer = Arc::clone(&synchronizer);
                event_loop.set_timeout(
                    move || {
                        let lookup = agent.get_transaction().expect("transaction propagated");
                        assert!(Arc::ptr_eq(&lookup, &current));
                        synchronizer.emit("inner", &Signal::Inner(lookup, index));
                    },
                    Duration::from_millis(1),
                );
            },
            delay,
        );
    }

    harness.event_loop.run_until_idle().unwrap();
    assert_eq!(done.load(Ordering::SeqCst), TRANSACTIONS);
}

#[test]
fn listeners_carry_the_transaction_they_were_registered_under() {
    let harness = Harness::new();
    let eventer = harness.emitter();
    let transactions = slots();
    let done = Arc::new(AtomicUsize::new(0));
    verify_inner(&eventer, &transactions, &done);

    for index in 0..TRANSACTIONS {
        let name = format!("ttest{}", index + 1);
        let current = harness.agent.create_transaction();
        transactions.lock()[index] = Some(Arc::clone(&current));

        let agent = Arc::clone(&harness.agent);
        let inner_eventer = Arc::clone(&eventer);
        eventer.on(&name, move |_: &Signal| {
            let lookup = agent.get_transaction().expect("transaction propagated");
            assert!(Arc::ptr_eq(&lookup, &current));
            inner_eventer.emit("inner", &Signal::Inner(lookup, index));
        });
        eventer.emit(&name, &Signal::Start);
    }

    assert_eq!(done.load(Ordering::SeqCst), TRANSACTIONS);
}

/// Ticks, a ticker, more ticks, a zero-delay timer, then two layers of
/// emitters: the transaction created in the ticker must survive all of it.
#[test]
fn transaction_survives_a_chain_of_mixed_continuations() {
    let harness = Harness::new();
    let eventer = harness.emitter();
    let synchronizer = harness.emitter();
    let transactions = slots();
    let done = Arc::new(AtomicUsize::new(0));
    verify_inner(&synchronizer, &transactions, &done);

    {
        let agent = Arc::clone(&harness.agent);
        let synchronizer = Arc::clone(&synchronizer);
        eventer.on("rntest", move |signal: &Signal| {
            let Signal::Inner(transaction, index) = signal else {
                panic!("unexpected signal on rntest");
            };
            let lookup = agent.get_transaction().expect("emitter context visible");
            assert!(Arc::ptr_eq(&lookup, transaction));
            synchronizer.emit("inner", &Signal::Inner(lookup, *index));
        });
    }

    for index in 0..TRANSACTIONS {
        let event_loop = Arc::clone(&harness.event_loop);
        let agent = Arc::clone(&harness.agent);
        let eventer = Arc::clone(&eventer);
        let transactions = Arc::clone(&transactions);
        harness.event_loop.next_tick(move || {
            let current = agent.create_transaction();
            transactions.lock()[index] = Some(Arc::clone(&current));
            let lookup = agent.get_transaction().expect("just created");
            assert!(Arc::ptr_eq(&lookup, &current));

            let timer_loop = Arc::clone(&event_loop);
            let agent = Arc::clone(&agent);
            let eventer = Arc::clone(&eventer);
            event_loop.next_tick(move || {
                let agent = Arc::clone(&agent);
                let eventer = Arc::clone(&eventer);
                let current = Arc::clone(&current);
                timer_loop.set_timeout(
                    move || {
                        let lookup = agent.get_transaction().expect("transaction propagated");
                        assert!(Arc::ptr_eq(&lookup, &current));
                        eventer.emit("rntest", &Signal::Inner(lookup, index));
                    },
                    Duration::ZERO,
                );
            });
        });
    }

    harness.event_loop.run_until_idle().unwrap();
    assert_eq!(done.load(Ordering::SeqCst), TRANSACTIONS);
}

#[test]
fn one_context_fans_out_and_ending_it_is_advisory() {
    let harness = Harness::new();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let txn = harness.agent.create_transaction();
    for _ in 0..3 {
        let agent = Arc::clone(&harness.agent);
        let seen = Arc::clone(&seen);
        harness.event_loop.next_tick(move || {
            let lookup = agent.get_transaction().expect("transaction propagated");
            lookup.end();
            seen.lock().push(lookup);
        });
    }

    harness.event_loop.run_until_idle().unwrap();
    let seen = seen.lock();
    assert_eq!(seen.len(), 3);
    assert!(seen.iter().all(|t| Arc::ptr_eq(t, &txn)));
    assert!(!txn.is_active());
}

#[test]
fn callbacks_scheduled_after_end_do_not_capture() {
    let harness = Harness::new();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let txn = harness.agent.create_transaction();
    txn.end();
    {
        let agent = Arc::clone(&harness.agent);
        let seen = Arc::clone(&seen);
        harness
            .event_loop
            .next_tick(move || seen.lock().push(agent.get_transaction().is_some()));
    }

    harness.event_loop.run_until_idle().unwrap();
    assert_eq!(*seen.lock(), vec![false]);
}

#[test]
fn panicking_continuation_does_not_leak_its_context() {
    let harness = Harness::new();
    let caught = Arc::new(AtomicUsize::new(0));
    {
        let caught = Arc::clone(&caught);
        harness.event_loop.on_uncaught_panic(move |_| {
            caught.fetch_add(1, Ordering::SeqCst);
        });
    }

    let outer = harness.agent.create_transaction();
    {
        let agent = Arc::clone(&harness.agent);
        harness.event_loop.next_tick(move || {
            let _inner = agent.create_transaction();
            panic!("continuation failed");
        });
    }

    harness.event_loop.run_until_idle().unwrap();
    assert_eq!(caught.load(Ordering::SeqCst), 1);
    let current = harness.agent.get_transaction().expect("outer restored");
    assert!(Arc::ptr_eq(&current, &outer));
}

#[test]
fn unloaded_agent_stops_propagating() {
    let harness = Harness::new();
    assert_eq!(harness.agent.unload(), 7);
    let seen = Arc::new(Mutex::new(Vec::new()));

    let _txn = harness.agent.create_transaction();
    {
        let agent = Arc::clone(&harness.agent);
        let seen = Arc::clone(&seen);
        harness
            .event_loop
            .next_tick(move || seen.lock().push(agent.get_transaction().is_some()));
    }

    harness.event_loop.run_until_idle().unwrap();
    assert_eq!(*seen.lock(), vec![false]);
}

/// Schedules callbacks on `outer` that each start a transaction, hand work
/// to `inner` under a transaction of its own, and drive `inner` to idle before
/// returning. Every continuation counts itself in `done`.
fn drive_one_loop_inside_another(outer: &Harness, inner: &Harness, done: &Arc<AtomicUsize>) {
    for delay in (1_u64..).take(TRANSACTIONS) {
        let outer_loop = Arc::clone(&outer.event_loop);
        let outer_agent = Arc::clone(&outer.agent);
        let inner_loop = Arc::clone(&inner.event_loop);
        let inner_agent = Arc::clone(&inner.agent);
        let done = Arc::clone(done);
        outer.event_loop.set_timeout(
            move || {
                let outer_txn = outer_agent.create_transaction();
                assert!(inner_agent.get_transaction().is_none());

                {
                    let timer_loop = Arc::clone(&inner_loop);
                    let inner_agent = Arc::clone(&inner_agent);
                    let outer_txn = Arc::clone(&outer_txn);
                    let done = Arc::clone(&done);
                    inner_loop.next_tick(move || {
                        assert!(inner_agent.get_transaction().is_none());
                        let inner_txn = inner_agent.create_transaction();

                        let inner_agent = Arc::clone(&inner_agent);
                        let outer_txn = Arc::clone(&outer_txn);
                        let done = Arc::clone(&done);
                        timer_loop.set_timeout(
                            move || {
                                let lookup =
                                    inner_agent.get_transaction().expect("inner transaction propagated");
                                assert!(Arc::ptr_eq(&lookup, &inner_txn));
                                assert!(!Arc::ptr_eq(&lookup, &outer_txn));
                                done.fetch_add(1, Ordering::SeqCst);
                            },
                            Duration::from_millis(1),
                        );
                    });
                }
                inner_loop.run_until_idle().unwrap();

                let lookup = outer_agent.get_transaction().expect("outer transaction kept");
                assert!(Arc::ptr_eq(&lookup, &outer_txn));
                assert!(inner_agent.get_transaction().is_none());

                let outer_agent = Arc::clone(&outer_agent);
                let inner_agent = Arc::clone(&inner_agent);
                let done = Arc::clone(&done);
                outer_loop.next_tick(move || {
                    let lookup = outer_agent.get_transaction().expect("outer transaction propagated");
                    assert!(Arc::ptr_eq(&lookup, &outer_txn));
                    assert!(inner_agent.get_transaction().is_none());
                    done.fetch_add(1, Ordering::SeqCst);
                });
            },
            Duration::from_millis(delay),
        );
    }
}

#[test]
fn two_loops_with_their_own_agents_never_share_context() {
    let first = Harness::new();
    let second = Harness::new();

    let done = Arc::new(AtomicUsize::new(0));
    drive_one_loop_inside_another(&first, &second, &done);
    first.event_loop.run_until_idle().unwrap();
    assert_eq!(done.load(Ordering::SeqCst), 2 * TRANSACTIONS);

    let done = Arc::new(AtomicUsize::new(0));
    drive_one_loop_inside_another(&second, &first, &done);
    second.event_loop.run_until_idle().unwrap();
    assert_eq!(done.load(Ordering::SeqCst), 2 * TRANSACTIONS);

    assert!(first.agent.get_transaction().is_none());
    assert!(second.agent.get_transaction().is_none());
}

#[tokio::test(start_paused = true)]
async fn async_driver_propagates_through_real_timers() {
    let harness = Harness::new();
    let done = Arc::new(AtomicUsize::new(0));

    for delay in [30_u64, 10, 20] {
        let txn = harness.agent.create_transaction();
        let agent = Arc::clone(&harness.agent);
        let done = Arc::clone(&done);
        harness.event_loop.set_timeout(
            move || {
                let lookup = agent.get_transaction().expect("transaction propagated");
                assert!(Arc::ptr_eq(&lookup, &txn));
                done.fetch_add(1, Ordering::SeqCst);
            },
            Duration::from_millis(delay),
        );
    }

    let stats = harness.event_loop.run().await.unwrap();
    assert_eq!(stats.turns, 3);
    assert_eq!(done.load(Ordering::SeqCst), 3);
}

proptest! {
    /// Whatever the mix of delays, every timer observes its own transaction.
    #[test]
    fn every_timer_sees_its_own_transaction(delays in prop::collection::vec(0_u64..50, 1..20)) {
        let harness = Harness::new();
        let mismatches = Arc::new(AtomicUsize::new(0));
        let fired = Arc::new(AtomicUsize::new(0));

        for delay in &delays {
            let txn = harness.agent.create_transaction();
            let agent = Arc::clone(&harness.agent);
            let mismatches = Arc::clone(&mismatches);
            let fired = Arc::clone(&fired);
            harness.event_loop.set_timeout(
                move || {
                    let same = agent
                        .get_transaction()
                        .is_some_and(|lookup| Arc::ptr_eq(&lookup, &txn));
                    if !same {
                        mismatches.fetch_add(1, Ordering::SeqCst);
                    }
                    fired.fetch_add(1, Ordering::SeqCst);
                },
                Duration::from_millis(*delay),
            );
        }

        harness.event_loop.run_until_idle().unwrap();
        prop_assert_eq!(fired.load(Ordering::SeqCst), delays.len());
        prop_assert_eq!(mismatches.load(Ordering::SeqCst), 0);
    }
}
