mod account;
mod tracked;

pub use self::account::AccountState;
pub use self::tracked::{StateChanges, TrackedState};

use crate::trie::{self, EMPTY_ROOT, NodeHash, NodeStore};
use crate::{Error, Result};
use codec::{Decode, Encode};
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use sidecoin_primitives::Address;
use std::sync::Arc;

const ACCOUNT_PREFIX: &[u8] = b"account:";
const CODE_PREFIX: &[u8] = b"code:";

fn account_key(address: &Address) -> Vec<u8> {
    [ACCOUNT_PREFIX, &address.as_bytes()[..]].concat()
}

fn code_key(code_hash: &[u8; 32]) -> Vec<u8> {
    [CODE_PREFIX, &code_hash[..]].concat()
}

/// Hash identifying contract code.
pub fn code_hash(code: &[u8]) -> [u8; 32] {
    Sha256::digest(code).into()
}

/// Read access to contract state.
pub trait StateReader {
    fn account(&self, address: &Address) -> Result<Option<AccountState>>;

    fn storage(&self, address: &Address, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn code(&self, code_hash: &[u8; 32]) -> Result<Option<Vec<u8>>>;
}

/// Contract state pinned at a root.
#[derive(Clone)]
pub struct StateSnapshot {
    store: Arc<dyn NodeStore>,
    root: NodeHash,
}

impl StateSnapshot {
    pub fn root(&self) -> NodeHash {
        self.root
    }

    /// Starts buffering writes on top of this snapshot.
    pub fn start_tracking(&self) -> TrackedState<'_> {
        TrackedState::new(self)
    }

    /// Writes `changes` as new trie nodes and returns the resulting root.
    ///
    /// The snapshot itself, like every other root, is left untouched.
    pub fn apply(&self, changes: StateChanges) -> Result<NodeHash> {
        if changes.is_empty() {
            return Ok(self.root);
        }

        let StateChanges {
            mut accounts,
            storage,
            code,
        } = changes;

        for (address, entries) in storage {
            let account = match accounts.get(&address) {
                Some(Some(account)) => Some(account.clone()),
                // Storage of a removed account goes with it.
                Some(None) => continue,
                None => self.account(&address)?,
            };
            let mut account = account.ok_or(Error::MissingAccount(address))?;
            account.storage_root = trie::update(&*self.store, account.storage_root, entries)?;
            accounts.insert(address, Some(account));
        }

        let world = accounts
            .into_iter()
            .map(|(address, account)| (account_key(&address), account.map(|a| a.encode())))
            .chain(
                code.into_iter()
                    .map(|(hash, code)| (code_key(&hash), Some(code))),
            );

        trie::update(&*self.store, self.root, world)
    }
}

impl StateReader for StateSnapshot {
    fn account(&self, address: &Address) -> Result<Option<AccountState>> {
        trie::get(&*self.store, self.root, &account_key(address))?
            .map(|bytes| AccountState::decode(&mut bytes.as_slice()).map_err(Error::from))
            .transpose()
    }

    fn storage(&self, address: &Address, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.account(address)? {
            Some(account) => trie::get(&*self.store, account.storage_root, key),
            None => Ok(None),
        }
    }

    fn code(&self, code_hash: &[u8; 32]) -> Result<Option<Vec<u8>>> {
        trie::get(&*self.store, self.root, &code_key(code_hash))
    }
}

/// Contract state repository.
///
/// Holds the root of the best chain state. Any historical root remains reachable through
/// [`Self::get_snapshot_to`].
pub struct StateRepositoryRoot {
    store: Arc<dyn NodeStore>,
    root: RwLock<NodeHash>,
}

impl StateRepositoryRoot {
    pub fn new(store: Arc<dyn NodeStore>) -> Self {
        Self {
            store,
            root: RwLock::new(EMPTY_ROOT),
        }
    }

    /// Current root.
    pub fn root(&self) -> NodeHash {
        *self.root.read()
    }

    /// Snapshot of the current root.
    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            store: self.store.clone(),
            root: self.root(),
        }
    }

    /// Returns a view pinned to a historical root.
    pub fn get_snapshot_to(&self, root: NodeHash) -> Result<StateSnapshot> {
        self.ensure_known(&root)?;
        Ok(StateSnapshot {
            store: self.store.clone(),
            root,
        })
    }

    /// Moves the current root.
    pub fn sync_to_root(&self, root: NodeHash) -> Result<()> {
        self.ensure_known(&root)?;
        let previous = std::mem::replace(&mut *self.root.write(), root);
        tracing::debug!(
            from = %hex::encode(previous),
            to = %hex::encode(root),
            "Synced contract state root"
        );
        Ok(())
    }

    fn ensure_known(&self, root: &NodeHash) -> Result<()> {
        if *root == EMPTY_ROOT || self.store.get(root)?.is_some() {
            Ok(())
        } else {
            Err(Error::UnknownRoot(hex::encode(root)))
        }
    }
}
