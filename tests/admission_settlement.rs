//! End-to-end scenarios over the in-memory adapters: admission on both
//! paths, batch settlement, counter outage and recovery, divergence repair,
//! and the circuit breaker lifecycle.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use subledger::admission::{Admission, AdmissionPath, AdmissionService};
use subledger::breaker::{BreakerState, CircuitBreaker};
use subledger::consistency::ConsistencyEngine;
use subledger::counter::MemoryPendingCounter;
use subledger::health::CounterHealthProbe;
use subledger::models::{Direction, SubEntry, TransactionRequest};
use subledger::settlement::{SettlementConfig, SettlementWorker};
use subledger::store::{LedgerStore, MemoryLedgerStore};

struct Harness {
    store: Arc<MemoryLedgerStore>,
    counter: Arc<MemoryPendingCounter>,
    probe: Arc<CounterHealthProbe>,
    breaker: Arc<CircuitBreaker>,
    admission: Arc<AdmissionService>,
    settlement: SettlementWorker,
    consistency: Arc<ConsistencyEngine>,
}

impl Harness {
    fn new() -> Self {
        let store = Arc::new(MemoryLedgerStore::new());
        let counter = Arc::new(MemoryPendingCounter::new());
        let probe = Arc::new(CounterHealthProbe::new(
            counter.clone(),
            Duration::from_secs(5),
            Duration::from_secs(1),
        ));
        let breaker = Arc::new(CircuitBreaker::new(3, Duration::from_millis(100)));
        let consistency = Arc::new(ConsistencyEngine::new(
            store.clone(),
            counter.clone(),
            Duration::from_secs(30),
        ));
        let admission = Arc::new(AdmissionService::new(
            store.clone(),
            counter.clone(),
            probe.clone(),
            breaker.clone(),
        ));
        let settlement = SettlementWorker::new(
            store.clone(),
            counter.clone(),
            probe.clone(),
            consistency.clone(),
            SettlementConfig { interval: Duration::from_millis(50), batch_size: 200 },
        );
        Self { store, counter, probe, breaker, admission, settlement, consistency }
    }

    async fn create_account(&self, id: &str, balance: Decimal) {
        self.admission.create_account(id, balance).await.unwrap();
    }

    async fn submit(&self, id: &str, amount: Decimal, tx_type: &str) -> Admission {
        self.admission
            .process(&TransactionRequest {
                account_id: id.to_string(),
                amount,
                tx_type: tx_type.to_string(),
            })
            .await
            .unwrap()
    }

    async fn settle(&self) {
        self.settlement.run_cycle().await.unwrap();
    }

    async fn settled_balance(&self, id: &str) -> Decimal {
        self.store.get_account(id).await.unwrap().unwrap().settled_balance
    }

    async fn counter_outage(&self, down: bool) {
        self.counter.set_available(!down);
        self.probe.check_now().await;
    }
}

fn accepted(admission: &Admission) -> bool {
    matches!(admission, Admission::Accepted { .. })
}

fn accepted_via(admission: &Admission, path: AdmissionPath) -> bool {
    matches!(admission, Admission::Accepted { path: p, .. } if *p == path)
}

#[tokio::test]
async fn test_happy_debit_settles() {
    let h = Harness::new();
    h.create_account("ACC", dec!(1000000)).await;

    let admission = h.submit("ACC", dec!(10000), "debit").await;
    assert!(accepted_via(&admission, AdmissionPath::Counter));

    h.settle().await;

    let account = h.store.get_account("ACC").await.unwrap().unwrap();
    assert_eq!(account.settled_balance, dec!(990000));
    assert_eq!(account.pending_debit, dec!(0));
    assert_eq!(account.pending_credit, dec!(0));
    assert_eq!(account.available_balance, dec!(990000));
    assert!(account.last_settlement_at.is_some());
}

#[tokio::test]
async fn test_overspend_protection_under_concurrency() {
    let h = Harness::new();
    h.create_account("ACC", dec!(1000000)).await;

    let mut handles = Vec::new();
    for _ in 0..5 {
        let admission = h.admission.clone();
        handles.push(tokio::spawn(async move {
            admission
                .process(&TransactionRequest {
                    account_id: "ACC".to_string(),
                    amount: dec!(300000),
                    tx_type: "debit".to_string(),
                })
                .await
                .unwrap()
        }));
    }

    let mut accepted_count = 0;
    let mut rejected_count = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Admission::Accepted { .. } => accepted_count += 1,
            Admission::Rejected { .. } => rejected_count += 1,
        }
    }
    assert_eq!(accepted_count, 3);
    assert_eq!(rejected_count, 2);

    h.settle().await;
    assert_eq!(h.settled_balance("ACC").await, dec!(100000));
}

#[tokio::test]
async fn test_two_debits_for_full_balance_admit_exactly_one() {
    let h = Harness::new();
    h.create_account("ACC", dec!(500)).await;

    let first = h.submit("ACC", dec!(500), "debit").await;
    let second = h.submit("ACC", dec!(500), "debit").await;
    assert!(accepted(&first));
    assert!(matches!(second, Admission::Rejected { .. }));

    h.settle().await;
    assert_eq!(h.settled_balance("ACC").await, dec!(0));
}

#[tokio::test]
async fn test_counter_outage_fallback() {
    let h = Harness::new();
    h.create_account("ACC", dec!(1000000)).await;

    // Backend down: the client still gets a pending acknowledgement.
    h.counter_outage(true).await;
    let admission = h.submit("ACC", dec!(100000), "debit").await;
    assert!(accepted_via(&admission, AdmissionPath::RowLock));

    // Backend returns, one settlement-plus-recovery cycle runs.
    h.counter_outage(false).await;
    h.settle().await;

    assert_eq!(h.settled_balance("ACC").await, dec!(900000));
    // Counter key is absent (or zero) once nothing is pending.
    assert!(h.counter.raw("ACC").map_or(true, |v| v == dec!(0)));
}

#[tokio::test]
async fn test_credit_during_outage_settles_upward() {
    let h = Harness::new();
    h.create_account("ACC", dec!(1000)).await;

    h.counter_outage(true).await;
    let admission = h.submit("ACC", dec!(250), "credit").await;
    assert!(accepted_via(&admission, AdmissionPath::RowLock));

    let account = h.store.get_account("ACC").await.unwrap().unwrap();
    assert_eq!(account.pending_credit, dec!(250));
    assert_eq!(account.available_balance, dec!(1250));

    h.counter_outage(false).await;
    h.settle().await;

    let account = h.store.get_account("ACC").await.unwrap().unwrap();
    assert_eq!(account.settled_balance, dec!(1250));
    assert_eq!(account.pending_credit, dec!(0));
}

#[tokio::test]
async fn test_mixed_batch_rejected_whole() {
    let h = Harness::new();
    h.create_account("ACC", dec!(1000)).await;

    // First debit enters through the fallback.
    h.counter_outage(true).await;
    assert!(accepted(&h.submit("ACC", dec!(600), "debit").await));

    // Manufacture the raced second admission the batch guard defends
    // against: a pending entry the per-request checks never saw together
    // with the first one.
    h.store
        .create_sub_entry(&SubEntry::new_pending("ACC", dec!(600), Direction::Debit))
        .await
        .unwrap();
    let mut account = h.store.get_account("ACC").await.unwrap().unwrap();
    account.pending_debit = dec!(1200);
    account.available_balance = dec!(-200);
    h.store.force_put_account(account).await;

    h.counter_outage(false).await;
    h.settle().await;

    // Folding -1200 would settle to -200: the whole batch is rejected and
    // the settled balance is untouched.
    let account = h.store.get_account("ACC").await.unwrap().unwrap();
    assert_eq!(account.settled_balance, dec!(1000));
    assert_eq!(account.pending_debit, dec!(0));
    assert_eq!(account.available_balance, dec!(1000));
    assert!(h.store.list_all_pending().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_repair_after_divergence() {
    let h = Harness::new();
    h.create_account("ACC", dec!(1000)).await;
    assert!(accepted(&h.submit("ACC", dec!(250), "debit").await));

    // Clobber the counter with a wrong value.
    h.counter.force_set("ACC", dec!(999));

    let report = h.consistency.validate_and_repair().await.unwrap();
    assert_eq!(report.accounts_repaired, 1);
    // Overwritten from sub-entry truth.
    assert_eq!(h.counter.raw("ACC"), Some(dec!(250)));
}

#[tokio::test]
async fn test_breaker_trips_and_recovers() {
    let h = Harness::new();
    h.create_account("ACC", dec!(10000)).await;

    // Backend erroring but the probe has not noticed yet: each admission
    // tries the counter, fails, and falls back.
    h.counter.set_available(false);
    for _ in 0..3 {
        let admission = h.submit("ACC", dec!(10), "debit").await;
        assert!(accepted_via(&admission, AdmissionPath::RowLock));
    }
    assert_eq!(h.breaker.state(), BreakerState::Open);
    let attempts_when_open = h.counter.add_calls();

    // While open, admissions skip the counter entirely.
    let admission = h.submit("ACC", dec!(10), "debit").await;
    assert!(accepted_via(&admission, AdmissionPath::RowLock));
    assert_eq!(h.counter.add_calls(), attempts_when_open);

    // After the cooldown the next admission probes and closes the breaker.
    h.counter.set_available(true);
    tokio::time::sleep(Duration::from_millis(150)).await;
    let admission = h.submit("ACC", dec!(10), "debit").await;
    assert!(accepted_via(&admission, AdmissionPath::Counter));
    assert_eq!(h.breaker.state(), BreakerState::Closed);
}

#[tokio::test]
async fn test_settlement_is_applied_exactly_once_per_admission() {
    // The same debit settles identically whichever path admitted it.
    for outage in [false, true] {
        let h = Harness::new();
        h.create_account("ACC", dec!(5000)).await;
        h.counter_outage(outage).await;

        let admission = h.submit("ACC", dec!(1250), "debit").await;
        assert!(accepted(&admission));

        h.counter_outage(false).await;
        h.settle().await;
        assert_eq!(h.settled_balance("ACC").await, dec!(3750));

        // A second cycle is a no-op: entries are terminal.
        h.settle().await;
        assert_eq!(h.settled_balance("ACC").await, dec!(3750));
    }
}

#[tokio::test]
async fn test_debits_up_to_settled_drain_exactly() {
    let h = Harness::new();
    h.create_account("ACC", dec!(1000)).await;

    for amount in [dec!(400), dec!(350), dec!(250)] {
        assert!(accepted(&h.submit("ACC", amount, "debit").await));
    }
    // Balance fully reserved: nothing more fits.
    assert!(matches!(h.submit("ACC", dec!(0.01), "debit").await, Admission::Rejected { .. }));

    h.settle().await;

    let account = h.store.get_account("ACC").await.unwrap().unwrap();
    assert_eq!(account.settled_balance, dec!(0));
    assert_eq!(account.available_balance, dec!(0));
    assert!(h.store.list_all_pending().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_quiescent_invariants_across_interleavings() {
    let h = Harness::new();
    h.create_account("A", dec!(2000)).await;
    h.create_account("B", dec!(100)).await;

    // Mixed traffic over both paths, with an outage in the middle.
    assert!(accepted(&h.submit("A", dec!(500), "debit").await));
    assert!(accepted(&h.submit("B", dec!(40), "credit").await));
    h.counter_outage(true).await;
    assert!(accepted(&h.submit("A", dec!(300), "debit").await));
    assert!(matches!(h.submit("B", dec!(500), "debit").await, Admission::Rejected { .. }));
    h.counter_outage(false).await;
    assert!(accepted(&h.submit("B", dec!(100), "debit").await));

    h.settle().await;
    h.settle().await;

    for id in ["A", "B"] {
        let account = h.store.get_account(id).await.unwrap().unwrap();
        assert!(account.settled_balance >= Decimal::ZERO);
        assert_eq!(account.available_balance, account.settled_balance);
        assert_eq!(account.pending_debit, Decimal::ZERO);
        assert_eq!(account.pending_credit, Decimal::ZERO);
    }
    assert_eq!(h.settled_balance("A").await, dec!(1200));
    assert_eq!(h.settled_balance("B").await, dec!(40));
    assert!(h.store.list_all_pending().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_rejected_fast_path_debit_changes_nothing() {
    let h = Harness::new();
    h.create_account("ACC", dec!(100)).await;

    let before_counter = h.counter.raw("ACC");
    let admission = h.submit("ACC", dec!(101), "debit").await;
    assert!(matches!(admission, Admission::Rejected { .. }));

    assert_eq!(h.counter.raw("ACC"), before_counter);
    assert!(h.store.list_all_pending().await.unwrap().is_empty());
    let account = h.store.get_account("ACC").await.unwrap().unwrap();
    assert_eq!(account.version, 1);
    assert_eq!(account.settled_balance, dec!(100));
}

#[tokio::test]
async fn test_counter_recovery_after_full_outage() {
    let h = Harness::new();
    h.create_account("ACC", dec!(1000)).await;

    // Admissions land while the counter is dark.
    h.counter_outage(true).await;
    assert!(accepted(&h.submit("ACC", dec!(100), "debit").await));
    assert!(accepted(&h.submit("ACC", dec!(50), "debit").await));

    // Backend returns; recovery rebuilds the key from pending truth.
    h.counter.set_available(true);
    h.consistency.recover_counter_from_store().await.unwrap();

    let totals = h.store.pending_totals("ACC").await.unwrap();
    assert_eq!(h.counter.raw("ACC"), Some(totals.net()));
}

#[tokio::test]
async fn test_settlement_worker_shutdown() {
    let h = Harness::new();
    let worker = Arc::new(h.settlement);

    let (tx, rx) = tokio::sync::watch::channel(false);
    let task = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.run_with_shutdown(rx).await })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    tx.send(true).unwrap();
    task.await.unwrap();
}
