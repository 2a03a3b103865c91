//! Integration tests for the ledger services against every local backend.
//!
//! Tests cover:
//! - Buy/sell arithmetic and the worked AAPL example
//! - Rejected trades and transfers leave every record untouched
//! - Market orders and valuation against fixed quotes
//! - Deposit/withdraw round trips and deferred settlement
//! - Concurrent sells against one position (memory and on-disk SQLite)
//! - Reconciliation over random operation sequences (proptest)

mod common;

use common::*;
use proptest::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::BTreeMap;
use std::sync::Barrier;
use std::thread;
use tradeledger::adapters::memory_adapter::MemoryLedgerAdapter;
use tradeledger::domain::config::{LedgerConfig, SettlementPolicy};
use tradeledger::domain::error::LedgerError;
use tradeledger::domain::executor::TradeExecutor;
use tradeledger::domain::reader::LedgerReader;
use tradeledger::domain::retry::RetryPolicy;
use tradeledger::domain::transaction::{TransactionKind, TransactionStatus};
use tradeledger::domain::transfer::CashTransferProcessor;
use tradeledger::ports::ledger_port::LedgerStore;

fn open(store: &dyn LedgerStore, name: &str, amount: Decimal) {
    CashTransferProcessor::new(store, LedgerConfig::default())
        .open_account(&user(name), Some(amount))
        .unwrap();
}

mod trades {
    use super::*;

    #[test]
    fn worked_example_on_every_backend() {
        for (name, store) in backends() {
            let store = store.as_ref();
            let alice = user("alice");
            open(store, "alice", dec!(10000));
            let executor = TradeExecutor::new(store, RetryPolicy::default());

            executor.buy(&alice, &ticker("AAPL"), 10, dec!(150)).unwrap();
            assert_eq!(cash(store, &alice), dec!(8500), "{name}");
            let held = &store.positions(&alice).unwrap()[0];
            assert_eq!((held.shares, held.avg_cost), (10, dec!(150)), "{name}");

            let receipt = executor.buy(&alice, &ticker("AAPL"), 10, dec!(170)).unwrap();
            assert_eq!(receipt.position.shares, 20, "{name}");
            assert_eq!(receipt.position.avg_cost, dec!(160), "{name}");
            assert_eq!(cash(store, &alice), dec!(6800), "{name}");

            let sold = executor.sell(&alice, &ticker("AAPL"), 20, dec!(180)).unwrap();
            assert!(sold.remaining.is_none(), "{name}");
            assert_eq!(sold.realized_pnl, dec!(400), "{name}");
            assert_eq!(cash(store, &alice), dec!(10400), "{name}");
            assert!(store.positions(&alice).unwrap().is_empty(), "{name}");
            assert_eq!(store.transactions(&alice).unwrap().len(), 3, "{name}");
        }
    }

    #[test]
    fn partial_sell_keeps_average_cost() {
        for (name, store) in backends() {
            let store = store.as_ref();
            let bob = user("bob");
            open(store, "bob", dec!(5000));
            let executor = TradeExecutor::new(store, RetryPolicy::default());

            executor.buy(&bob, &ticker("MSFT"), 7, dec!(101.37)).unwrap();
            executor.buy(&bob, &ticker("MSFT"), 3, dec!(99.01)).unwrap();
            let before = store.positions(&bob).unwrap()[0].avg_cost;

            let receipt = executor.sell(&bob, &ticker("MSFT"), 4, dec!(120)).unwrap();
            let remaining = receipt.remaining.unwrap();
            assert_eq!(remaining.shares, 6, "{name}");
            assert_eq!(remaining.avg_cost, before, "{name}");
            assert_eq!(
                cash(store, &bob),
                dec!(5000) - dec!(709.59) - dec!(297.03) + dec!(480),
                "{name}"
            );
        }
    }

    #[test]
    fn positions_are_per_ticker() {
        for (name, store) in backends() {
            let store = store.as_ref();
            let carol = user("carol");
            open(store, "carol", dec!(10000));
            let executor = TradeExecutor::new(store, RetryPolicy::default());

            executor.buy(&carol, &ticker("TSLA"), 2, dec!(250)).unwrap();
            executor.buy(&carol, &ticker("AAPL"), 1, dec!(150)).unwrap();

            let tickers: Vec<_> = store
                .positions(&carol)
                .unwrap()
                .iter()
                .map(|p| p.ticker.to_string())
                .collect();
            assert_eq!(tickers, vec!["AAPL", "TSLA"], "{name}");
        }
    }

    #[test]
    fn oversell_changes_nothing() {
        for (name, store) in backends() {
            let store = store.as_ref();
            let dave = user("dave");
            open(store, "dave", dec!(1000));
            let executor = TradeExecutor::new(store, RetryPolicy::default());
            executor.buy(&dave, &ticker("AAPL"), 5, dec!(10)).unwrap();

            let before = snapshot(store, &dave);
            match executor.sell(&dave, &ticker("AAPL"), 6, dec!(10)) {
                Err(LedgerError::InsufficientShares {
                    ticker,
                    requested,
                    held,
                }) => {
                    assert_eq!(ticker, "AAPL", "{name}");
                    assert_eq!((requested, held), (6, 5), "{name}");
                }
                other => panic!("{name}: expected InsufficientShares, got {other:?}"),
            }
            assert_eq!(snapshot(store, &dave), before, "{name}");
        }
    }

    #[test]
    fn overspend_changes_nothing() {
        for (name, store) in backends() {
            let store = store.as_ref();
            let erin = user("erin");
            open(store, "erin", dec!(1000));
            let executor = TradeExecutor::new(store, RetryPolicy::default());

            let before = snapshot(store, &erin);
            match executor.buy(&erin, &ticker("AAPL"), 10, dec!(100.01)) {
                Err(LedgerError::InsufficientFunds {
                    required,
                    available,
                }) => {
                    assert_eq!(required, dec!(1000.10), "{name}");
                    assert_eq!(available, dec!(1000), "{name}");
                }
                other => panic!("{name}: expected InsufficientFunds, got {other:?}"),
            }
            assert_eq!(snapshot(store, &erin), before, "{name}");
        }
    }

    #[test]
    fn users_are_isolated() {
        for (name, store) in backends() {
            let store = store.as_ref();
            open(store, "alice", dec!(100));
            open(store, "bob", dec!(100));
            let executor = TradeExecutor::new(store, RetryPolicy::default());

            executor.buy(&user("alice"), &ticker("AAPL"), 1, dec!(60)).unwrap();

            assert_eq!(cash(store, &user("bob")), dec!(100), "{name}");
            assert!(store.positions(&user("bob")).unwrap().is_empty(), "{name}");
            assert!(matches!(
                executor.sell(&user("bob"), &ticker("AAPL"), 1, dec!(60)),
                Err(LedgerError::NoSuchPosition { .. })
            ));
        }
    }
}

mod market {
    use super::*;

    #[test]
    fn market_orders_fill_at_quote() {
        for (name, store) in backends() {
            let store = store.as_ref();
            let kim = user("kim");
            open(store, "kim", dec!(1000));
            let executor = TradeExecutor::new(store, RetryPolicy::default());
            let quotes = FixedQuotes::new(&[("AAPL", dec!(150.25))]);

            let receipt = executor
                .buy_at_market(&quotes, &kim, &ticker("AAPL"), 4)
                .unwrap();
            assert_eq!(receipt.transaction.amount, dec!(601), "{name}");
            assert_eq!(cash(store, &kim), dec!(399), "{name}");

            let before = snapshot(store, &kim);
            assert!(matches!(
                executor.sell_at_market(&quotes, &kim, &ticker("MSFT"), 1),
                Err(LedgerError::PriceUnavailable { .. })
            ));
            assert_eq!(snapshot(store, &kim), before, "{name}");
        }
    }

    #[test]
    fn valuation_counts_unpriced_positions_at_cost() {
        for (name, store) in backends() {
            let store = store.as_ref();
            let lee = user("lee");
            open(store, "lee", dec!(1000));
            let executor = TradeExecutor::new(store, RetryPolicy::default());
            executor.buy(&lee, &ticker("AAPL"), 2, dec!(100)).unwrap();
            executor.buy(&lee, &ticker("MSFT"), 1, dec!(300)).unwrap();

            let quotes = FixedQuotes::new(&[("AAPL", dec!(110))]);
            let valuation = LedgerReader::new(store).valuation(&lee, &quotes).unwrap();

            assert_eq!(valuation.cash, dec!(500), "{name}");
            assert_eq!(valuation.total_equity, dec!(500) + dec!(220) + dec!(300), "{name}");
            let unpriced: Vec<_> = valuation.unpriced().map(|p| p.ticker.to_string()).collect();
            assert_eq!(unpriced, vec!["MSFT"], "{name}");
            assert_eq!(valuation.positions[0].unrealized_pnl, Some(dec!(20)), "{name}");
        }
    }
}

mod transfers {
    use super::*;

    #[test]
    fn deposit_then_withdraw_restores_balance() {
        for (name, store) in backends() {
            let store = store.as_ref();
            let alice = user("alice");
            open(store, "alice", dec!(250));
            let transfers = CashTransferProcessor::new(store, LedgerConfig::default());

            transfers.deposit(&alice, dec!(100), bank()).unwrap();
            assert_eq!(cash(store, &alice), dec!(350), "{name}");
            transfers.withdraw(&alice, dec!(100), bank()).unwrap();
            assert_eq!(cash(store, &alice), dec!(250), "{name}");

            let history = store.transactions(&alice).unwrap();
            assert_eq!(history.len(), 2, "{name}");
            assert_eq!(history[0].kind.as_str(), "withdrawal", "{name}");
            assert_eq!(history[1].kind.as_str(), "deposit", "{name}");
            assert!(
                history
                    .iter()
                    .all(|t| t.status == TransactionStatus::Completed),
                "{name}"
            );
            assert_eq!(history[0].kind.bank(), Some(&bank()), "{name}");
        }
    }

    #[test]
    fn deposit_opens_missing_account() {
        for (name, store) in backends() {
            let store = store.as_ref();
            let frank = user("frank");
            let transfers = CashTransferProcessor::new(store, LedgerConfig::default());

            let receipt = transfers.deposit(&frank, dec!(75.5), bank()).unwrap();
            assert_eq!(receipt.buying_power.amount, dec!(75.5), "{name}");
            assert_eq!(receipt.buying_power.opening_amount, dec!(0), "{name}");
            assert!(
                LedgerReader::new(store).reconcile(&frank).unwrap().is_balanced(),
                "{name}"
            );
        }
    }

    #[test]
    fn overdraw_changes_nothing() {
        for (name, store) in backends() {
            let store = store.as_ref();
            let gina = user("gina");
            open(store, "gina", dec!(10));
            let transfers = CashTransferProcessor::new(store, LedgerConfig::default());

            let before = snapshot(store, &gina);
            assert!(matches!(
                transfers.withdraw(&gina, dec!(10.01), bank()),
                Err(LedgerError::InsufficientFunds { .. })
            ));
            assert_eq!(snapshot(store, &gina), before, "{name}");
        }
    }

    #[test]
    fn deferred_settlement_lifecycle() {
        let config = LedgerConfig {
            settlement: SettlementPolicy::Deferred,
            ..LedgerConfig::default()
        };
        for (name, store) in backends() {
            let store = store.as_ref();
            let hank = user("hank");
            open(store, "hank", dec!(500));
            let transfers = CashTransferProcessor::new(store, config.clone());

            let deposit = transfers.deposit(&hank, dec!(200), bank()).unwrap();
            assert_eq!(deposit.transaction.status, TransactionStatus::Pending, "{name}");
            assert_eq!(cash(store, &hank), dec!(500), "{name}");

            let withdrawal = transfers.withdraw(&hank, dec!(300), bank()).unwrap();
            assert_eq!(cash(store, &hank), dec!(200), "{name}");

            transfers
                .settle(&hank, deposit.transaction.id, TransactionStatus::Completed)
                .unwrap();
            assert_eq!(cash(store, &hank), dec!(400), "{name}");

            transfers
                .settle(&hank, withdrawal.transaction.id, TransactionStatus::Failed)
                .unwrap();
            assert_eq!(cash(store, &hank), dec!(700), "{name}");

            assert!(matches!(
                transfers.settle(&hank, deposit.transaction.id, TransactionStatus::Failed),
                Err(LedgerError::TransactionNotPending { .. })
            ));
            assert!(
                LedgerReader::new(store).reconcile(&hank).unwrap().is_balanced(),
                "{name}"
            );
        }
    }
}

mod concurrency {
    use super::*;

    /// Runs `sellers` single-share sells at once against a position of
    /// `sellers - 1` shares and checks exactly that many succeed.
    fn race_single_share_sells(store: &dyn LedgerStore, sellers: usize) {
        let ivan = user("ivan");
        open(store, "ivan", dec!(10000));
        let executor = TradeExecutor::new(store, RetryPolicy::default());
        let held = (sellers - 1) as u64;
        executor.buy(&ivan, &ticker("AAPL"), held, dec!(100)).unwrap();

        let barrier = Barrier::new(sellers);
        let results: Vec<_> = thread::scope(|s| {
            let handles: Vec<_> = (0..sellers)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        executor.sell(&ivan, &ticker("AAPL"), 1, dec!(110))
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let succeeded = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(succeeded as u64, held);
        for result in results.iter().filter_map(|r| r.as_ref().err()) {
            assert!(
                matches!(
                    result,
                    LedgerError::NoSuchPosition { .. } | LedgerError::InsufficientShares { .. }
                ),
                "unexpected error {result:?}"
            );
        }

        assert_eq!(shares(store, &ivan, "AAPL"), None);
        assert_eq!(
            cash(store, &ivan),
            dec!(10000) - Decimal::from(held) * dec!(100) + Decimal::from(held) * dec!(110)
        );
        let reconciliation = LedgerReader::new(store).reconcile(&ivan).unwrap();
        assert!(reconciliation.is_balanced());
        assert_eq!(reconciliation.transaction_count, 1 + held as usize);
    }

    #[test]
    fn concurrent_sells_memory() {
        race_single_share_sells(&MemoryLedgerAdapter::new(), 16);
    }

    #[cfg(feature = "sqlite")]
    #[test]
    fn concurrent_sells_sqlite_file() {
        use std::time::Duration;
        use tradeledger::adapters::sqlite_adapter::SqliteLedgerAdapter;

        let dir = tempfile::tempdir().unwrap();
        let store =
            SqliteLedgerAdapter::open(dir.path().join("ledger.db"), 8, Duration::from_secs(5))
                .unwrap();
        store.initialize_schema().unwrap();
        race_single_share_sells(&store, 8);
    }

    #[test]
    fn disjoint_users_trade_in_parallel() {
        let store = MemoryLedgerAdapter::new();
        let names: Vec<String> = (0..8).map(|i| format!("user{i}")).collect();
        for name in &names {
            open(&store, name, dec!(1000));
        }
        let executor = TradeExecutor::new(&store, RetryPolicy::default());

        thread::scope(|s| {
            for name in &names {
                let executor = &executor;
                s.spawn(move || {
                    let id = user(name);
                    for _ in 0..10 {
                        executor.buy(&id, &ticker("AAPL"), 1, dec!(10)).unwrap();
                    }
                    for _ in 0..5 {
                        executor.sell(&id, &ticker("AAPL"), 1, dec!(12)).unwrap();
                    }
                });
            }
        });

        for name in &names {
            let id = user(name);
            assert_eq!(shares(&store, &id, "AAPL"), Some(5));
            assert_eq!(cash(&store, &id), dec!(1000) - dec!(100) + dec!(60));
        }
    }
}

mod reconciliation {
    use super::*;

    #[derive(Debug, Clone)]
    enum Op {
        Deposit(i64),
        Withdraw(i64),
        Buy(usize, u64, i64),
        Sell(usize, u64, i64),
        Settle(usize, bool),
    }

    const TICKERS: [&str; 3] = ["AAPL", "MSFT", "BHP.AX"];

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (1i64..500_000).prop_map(Op::Deposit),
            (1i64..500_000).prop_map(Op::Withdraw),
            (0usize..3, 1u64..25, 1i64..50_000).prop_map(|(t, s, p)| Op::Buy(t, s, p)),
            (0usize..3, 1u64..25, 1i64..50_000).prop_map(|(t, s, p)| Op::Sell(t, s, p)),
            (0usize..8, any::<bool>()).prop_map(|(i, ok)| Op::Settle(i, ok)),
        ]
    }

    fn cents(value: i64) -> Decimal {
        Decimal::new(value, 2)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn ledger_always_reconciles(
            deferred in any::<bool>(),
            ops in prop::collection::vec(op(), 1..40),
        ) {
            let store = MemoryLedgerAdapter::new();
            let config = LedgerConfig {
                settlement: if deferred {
                    SettlementPolicy::Deferred
                } else {
                    SettlementPolicy::Immediate
                },
                retry: RetryPolicy::no_retry(),
                ..LedgerConfig::default()
            };
            let transfers = CashTransferProcessor::new(&store, config.clone());
            let executor = TradeExecutor::new(&store, config.retry);
            let reader = LedgerReader::new(&store);
            let judy = user("judy");
            transfers.open_account(&judy, Some(dec!(1000))).unwrap();

            for op in ops {
                let before = snapshot(&store, &judy);
                let result = match op {
                    Op::Deposit(c) => transfers.deposit(&judy, cents(c), bank()).map(|_| ()),
                    Op::Withdraw(c) => transfers.withdraw(&judy, cents(c), bank()).map(|_| ()),
                    Op::Buy(t, s, p) => executor
                        .buy(&judy, &ticker(TICKERS[t]), s, cents(p))
                        .map(|_| ()),
                    Op::Sell(t, s, p) => executor
                        .sell(&judy, &ticker(TICKERS[t]), s, cents(p))
                        .map(|_| ()),
                    Op::Settle(i, completed) => {
                        let pending: Vec<_> = before
                            .transactions
                            .iter()
                            .filter(|t| t.status == TransactionStatus::Pending)
                            .collect();
                        if pending.is_empty() {
                            continue;
                        }
                        let outcome = if completed {
                            TransactionStatus::Completed
                        } else {
                            TransactionStatus::Failed
                        };
                        transfers
                            .settle(&judy, pending[i % pending.len()].id, outcome)
                            .map(|_| ())
                    }
                };

                if let Err(e) = result {
                    prop_assert!(e.is_business_rejection(), "unexpected error {:?}", e);
                    prop_assert_eq!(&snapshot(&store, &judy), &before);
                }

                let reconciliation = reader.reconcile(&judy).unwrap();
                prop_assert!(reconciliation.is_balanced(), "{:?}", reconciliation);
                prop_assert!(reconciliation.actual >= Decimal::ZERO);
            }

            let mut net_shares: BTreeMap<String, i64> = BTreeMap::new();
            for transaction in store.transactions(&judy).unwrap() {
                match &transaction.kind {
                    TransactionKind::Buy(trade) => {
                        *net_shares.entry(trade.ticker.to_string()).or_default() +=
                            trade.shares as i64;
                    }
                    TransactionKind::Sell(trade) => {
                        *net_shares.entry(trade.ticker.to_string()).or_default() -=
                            trade.shares as i64;
                    }
                    _ => {}
                }
            }
            for (symbol, net) in net_shares {
                prop_assert!(net >= 0);
                let held = shares(&store, &judy, &symbol).unwrap_or(0);
                prop_assert_eq!(held as i64, net);
            }
        }
    }
}
