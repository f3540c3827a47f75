//! Smart contract state and execution.
//!
//! Contract state lives in a content addressed trie. A [`StateSnapshot`] pins a root, changes
//! are buffered in [`TrackedState`] overlays and become a new root only once applied.

mod error;
mod executor;
mod gas;
mod sender;
mod state;
mod transition;
pub mod trie;
mod tx_data;
mod vm;

pub use self::error::Error;
pub use self::executor::{
    BlockExecution, ContractExecutor, ExecutorError, LocalExecutionError, LocalExecutionResult,
    LocalExecutor, Receipt, contract_output, receipt_root,
};
pub use self::gas::{GasMeter, GasPriceList, OutOfGas};
pub use self::sender::{SenderError, address_from_script, get_sender};
pub use self::state::{
    AccountState, StateChanges, StateReader, StateRepositoryRoot, StateSnapshot, TrackedState,
    code_hash,
};
pub use self::transition::{
    ExecutionMessage, Log, MessageKind, StateTransitionError, StateTransitionResult,
    TransferInfo, TxEnvironment, apply,
};
pub use self::tx_data::{ContractPayload, ContractTxData, ContractTxDataError, VM_VERSION};
pub use self::vm::{ContractCode, Instruction, Method};

/// Result type for contract state operations.
pub type Result<T> = std::result::Result<T, Error>;
