use super::{AccountState, StateReader, code_hash};
use crate::Result;
use sidecoin_primitives::Address;
use std::collections::BTreeMap;

/// Buffered state writes.
///
/// Ordered maps keep the application order, and therefore the resulting root,
/// deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateChanges {
    pub accounts: BTreeMap<Address, Option<AccountState>>,
    pub storage: BTreeMap<Address, BTreeMap<Vec<u8>, Option<Vec<u8>>>>,
    pub code: BTreeMap<[u8; 32], Vec<u8>>,
}

impl StateChanges {
    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty() && self.storage.is_empty() && self.code.is_empty()
    }

    /// Layers `other` on top of these changes.
    pub fn extend(&mut self, other: StateChanges) {
        self.accounts.extend(other.accounts);
        for (address, entries) in other.storage {
            self.storage.entry(address).or_default().extend(entries);
        }
        self.code.extend(other.code);
    }
}

/// Mutable overlay over a state.
///
/// Nothing reaches the underlying state unless the overlay changes are merged into the
/// parent, or applied to a snapshot for the outermost overlay. Dropping the overlay discards
/// its writes.
pub struct TrackedState<'a> {
    base: &'a dyn StateReader,
    changes: StateChanges,
}

impl<'a> TrackedState<'a> {
    pub fn new(base: &'a dyn StateReader) -> Self {
        Self {
            base,
            changes: StateChanges::default(),
        }
    }

    /// Opens a nested overlay whose writes reach this one only through [`Self::merge`].
    pub fn start_tracking(&self) -> TrackedState<'_> {
        TrackedState::new(self)
    }

    pub fn merge(&mut self, changes: StateChanges) {
        self.changes.extend(changes);
    }

    pub fn into_changes(self) -> StateChanges {
        self.changes
    }

    pub fn changes(&self) -> &StateChanges {
        &self.changes
    }

    pub fn set_account(&mut self, address: Address, account: AccountState) {
        self.changes.accounts.insert(address, Some(account));
    }

    pub fn set_storage(&mut self, address: Address, key: Vec<u8>, value: Vec<u8>) {
        self.changes
            .storage
            .entry(address)
            .or_default()
            .insert(key, Some(value));
    }

    pub fn clear_storage(&mut self, address: Address, key: Vec<u8>) {
        self.changes
            .storage
            .entry(address)
            .or_default()
            .insert(key, None);
    }

    /// Stores contract code and returns its hash.
    pub fn set_code(&mut self, code: Vec<u8>) -> [u8; 32] {
        let hash = code_hash(&code);
        self.changes.code.insert(hash, code);
        hash
    }

    /// Credits an existing account, returns `false` if there is none.
    pub fn add_balance(&mut self, address: &Address, amount: u64) -> Result<bool> {
        let Some(mut account) = self.account(address)? else {
            return Ok(false);
        };
        account.balance = account.balance.saturating_add(amount);
        self.set_account(*address, account);
        Ok(true)
    }

    /// Debits an account, returns `false` if the balance does not cover `amount`.
    pub fn sub_balance(&mut self, address: &Address, amount: u64) -> Result<bool> {
        let Some(mut account) = self.account(address)? else {
            return Ok(false);
        };
        let Some(balance) = account.balance.checked_sub(amount) else {
            return Ok(false);
        };
        account.balance = balance;
        self.set_account(*address, account);
        Ok(true)
    }
}

impl StateReader for TrackedState<'_> {
    fn account(&self, address: &Address) -> Result<Option<AccountState>> {
        match self.changes.accounts.get(address) {
            Some(account) => Ok(account.clone()),
            None => self.base.account(address),
        }
    }

    fn storage(&self, address: &Address, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self
            .changes
            .storage
            .get(address)
            .and_then(|entries| entries.get(key))
        {
            Some(value) => Ok(value.clone()),
            None => self.base.storage(address, key),
        }
    }

    fn code(&self, code_hash: &[u8; 32]) -> Result<Option<Vec<u8>>> {
        match self.changes.code.get(code_hash) {
            Some(code) => Ok(Some(code.clone())),
            None => self.base.code(code_hash),
        }
    }
}
