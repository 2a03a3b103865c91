//! In-process ledger store.
//!
//! Each user's book sits behind its own mutex, so units for one user run one
//! at a time while other users proceed in parallel. Writes are staged in the
//! unit and folded into the book only when the work returns `Ok`. A user gets
//! a book only once a unit for them commits a non-empty write-set.

use rust_decimal::Decimal;
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

use crate::domain::account::BuyingPower;
use crate::domain::error::LedgerError;
use crate::domain::identifiers::{Ticker, UserId, now};
use crate::domain::position::Position;
use crate::domain::transaction::{Transaction, TransactionStatus};
use crate::ports::ledger_port::{LedgerStore, UnitOfWork, Work};

#[derive(Debug, Default)]
struct UserBook {
    buying_power: Option<BuyingPower>,
    positions: BTreeMap<Ticker, Position>,
    /// Append order.
    transactions: Vec<Transaction>,
}

#[derive(Default)]
pub struct MemoryLedgerAdapter {
    books: Mutex<HashMap<UserId, Arc<Mutex<UserBook>>>>,
}

impl MemoryLedgerAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    fn existing_book(&self, user_id: &UserId) -> Result<Option<Arc<Mutex<UserBook>>>, LedgerError> {
        Ok(lock(&self.books)?.get(user_id).cloned())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, LedgerError> {
    mutex.lock().map_err(|_| LedgerError::StoreUnavailable {
        reason: "ledger lock poisoned".into(),
    })
}

#[derive(Default)]
struct Staged {
    buying_power: Option<BuyingPower>,
    /// `None` marks a deleted position.
    positions: BTreeMap<Ticker, Option<Position>>,
    appended: Vec<Transaction>,
    statuses: HashMap<Uuid, TransactionStatus>,
}

impl Staged {
    fn is_empty(&self) -> bool {
        self.buying_power.is_none()
            && self.positions.is_empty()
            && self.appended.is_empty()
            && self.statuses.is_empty()
    }

    fn apply(self, book: &mut UserBook) {
        if self.buying_power.is_some() {
            book.buying_power = self.buying_power;
        }
        for (ticker, position) in self.positions {
            match position {
                Some(position) => {
                    book.positions.insert(ticker, position);
                }
                None => {
                    book.positions.remove(&ticker);
                }
            }
        }
        book.transactions.extend(self.appended);
        for transaction in book.transactions.iter_mut() {
            if let Some(status) = self.statuses.get(&transaction.id) {
                transaction.status = *status;
            }
        }
    }
}

fn run_unit(user_id: &UserId, book: &UserBook, work: &mut Work<'_>) -> Result<Staged, LedgerError> {
    let mut unit = MemoryUnit {
        user_id,
        book,
        staged: Staged::default(),
    };
    work(&mut unit)?;
    Ok(unit.staged)
}

struct MemoryUnit<'a> {
    user_id: &'a UserId,
    book: &'a UserBook,
    staged: Staged,
}

impl MemoryUnit<'_> {
    fn current_buying_power(&self) -> Option<&BuyingPower> {
        self.staged
            .buying_power
            .as_ref()
            .or(self.book.buying_power.as_ref())
    }

    fn find_transaction(&self, id: Uuid) -> Option<Transaction> {
        let found = self
            .staged
            .appended
            .iter()
            .chain(self.book.transactions.iter())
            .find(|t| t.id == id)?;
        let mut transaction = found.clone();
        if let Some(status) = self.staged.statuses.get(&id) {
            transaction.status = *status;
        }
        Some(transaction)
    }
}

impl UnitOfWork for MemoryUnit<'_> {
    fn get_buying_power(&mut self) -> Result<Option<BuyingPower>, LedgerError> {
        Ok(self.current_buying_power().cloned())
    }

    fn create_buying_power(&mut self, account: &BuyingPower) -> Result<(), LedgerError> {
        if self.current_buying_power().is_some() {
            return Err(LedgerError::AccountExists {
                user: self.user_id.to_string(),
            });
        }
        self.staged.buying_power = Some(account.clone());
        Ok(())
    }

    fn adjust_buying_power(&mut self, delta: Decimal) -> Result<BuyingPower, LedgerError> {
        let current = self
            .current_buying_power()
            .ok_or_else(|| LedgerError::NoSuchAccount {
                user: self.user_id.to_string(),
            })?;
        let adjusted = current.adjusted(delta, now())?;
        self.staged.buying_power = Some(adjusted.clone());
        Ok(adjusted)
    }

    fn get_position(&mut self, ticker: &Ticker) -> Result<Option<Position>, LedgerError> {
        Ok(match self.staged.positions.get(ticker) {
            Some(staged) => staged.clone(),
            None => self.book.positions.get(ticker).cloned(),
        })
    }

    fn upsert_position(&mut self, position: &Position) -> Result<(), LedgerError> {
        self.staged
            .positions
            .insert(position.ticker.clone(), Some(position.clone()));
        Ok(())
    }

    fn delete_position(&mut self, ticker: &Ticker) -> Result<(), LedgerError> {
        self.staged.positions.insert(ticker.clone(), None);
        Ok(())
    }

    fn append_transaction(&mut self, transaction: &Transaction) -> Result<(), LedgerError> {
        if self.find_transaction(transaction.id).is_some() {
            return Err(LedgerError::StoreQuery {
                reason: format!("duplicate transaction id {}", transaction.id),
            });
        }
        self.staged.appended.push(transaction.clone());
        Ok(())
    }

    fn get_transaction(&mut self, id: Uuid) -> Result<Option<Transaction>, LedgerError> {
        Ok(self.find_transaction(id))
    }

    fn update_transaction_status(
        &mut self,
        id: Uuid,
        status: TransactionStatus,
    ) -> Result<(), LedgerError> {
        if self.find_transaction(id).is_none() {
            return Err(LedgerError::NoSuchTransaction { id });
        }
        self.staged.statuses.insert(id, status);
        Ok(())
    }
}

impl LedgerStore for MemoryLedgerAdapter {
    fn transact(&self, user_id: &UserId, work: &mut Work<'_>) -> Result<(), LedgerError> {
        if let Some(handle) = self.existing_book(user_id)? {
            let mut book = lock(&handle)?;
            let staged = run_unit(user_id, &book, work)?;
            staged.apply(&mut book);
            return Ok(());
        }

        let mut fresh = UserBook::default();
        let staged = run_unit(user_id, &fresh, work)?;
        if staged.is_empty() {
            return Ok(());
        }
        staged.apply(&mut fresh);
        match lock(&self.books)?.entry(user_id.clone()) {
            // Another unit created this user's book first.
            Entry::Occupied(_) => Err(LedgerError::ConcurrencyConflict { attempts: 1 }),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(Mutex::new(fresh)));
                Ok(())
            }
        }
    }

    fn buying_power(&self, user_id: &UserId) -> Result<Option<BuyingPower>, LedgerError> {
        match self.existing_book(user_id)? {
            Some(book) => Ok(lock(&book)?.buying_power.clone()),
            None => Ok(None),
        }
    }

    fn positions(&self, user_id: &UserId) -> Result<Vec<Position>, LedgerError> {
        match self.existing_book(user_id)? {
            Some(book) => Ok(lock(&book)?.positions.values().cloned().collect()),
            None => Ok(Vec::new()),
        }
    }

    fn transactions(&self, user_id: &UserId) -> Result<Vec<Transaction>, LedgerError> {
        let Some(book) = self.existing_book(user_id)? else {
            return Ok(Vec::new());
        };
        let mut transactions: Vec<Transaction> =
            lock(&book)?.transactions.iter().rev().cloned().collect();
        transactions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(transactions)
    }
}
