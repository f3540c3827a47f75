//! State transitions of contract create and call messages.

use crate::gas::{GasMeter, GasPriceList, OutOfGas};
use crate::state::{AccountState, StateReader, TrackedState};
use crate::vm::{ContractCode, Instruction};
use crate::Error;
use bitcoin::Txid;
use codec::{Decode, Encode};
use sidecoin_primitives::{Address, Height};

/// Deepest nesting of internal calls.
pub const MAX_CALL_DEPTH: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    Create {
        code: Vec<u8>,
        params: Vec<Vec<u8>>,
    },
    Call {
        to: Address,
        method: String,
        params: Vec<Vec<u8>>,
    },
}

/// A contract invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionMessage {
    pub sender: Address,
    /// Funds sent along, in satoshis.
    pub value: u64,
    pub gas_limit: u64,
    pub gas_price: u64,
    pub kind: MessageKind,
}

/// Transaction the message was carried by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxEnvironment {
    pub txid: Txid,
    pub block_height: Height,
    /// Address of the block producer.
    pub coinbase: Address,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Log {
    pub address: Address,
    pub topics: Vec<Vec<u8>>,
    pub data: Vec<u8>,
}

/// Funds moved by a contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct TransferInfo {
    pub from: Address,
    pub to: Address,
    pub value: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateTransitionError {
    #[error("Out of gas")]
    OutOfGas,
    #[error("Execution reverted: {0}")]
    Revert(String),
    #[error("Contract {0} does not exist")]
    ContractDoesNotExist(Address),
    #[error("Contract {0} already exists")]
    ContractAlreadyExists(Address),
    #[error("Method {0} does not exist")]
    MethodDoesNotExist(String),
    #[error("Invalid contract code")]
    InvalidCode,
    #[error("Insufficient contract balance")]
    InsufficientBalance,
    #[error("Missing call parameter {0}")]
    MissingParameter(u32),
    #[error("Call depth exceeded")]
    CallDepthExceeded,
}

/// Outcome of a state transition.
///
/// A failed transition leaves the state untouched, consumed gas is still reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateTransitionResult {
    pub contract_address: Address,
    pub gas_consumed: u64,
    pub logs: Vec<Log>,
    pub internal_transfers: Vec<TransferInfo>,
    pub return_value: Option<Vec<u8>>,
    pub error: Option<StateTransitionError>,
}

impl StateTransitionResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

enum ExecError {
    Contract(StateTransitionError),
    Fatal(Error),
}

impl From<StateTransitionError> for ExecError {
    fn from(error: StateTransitionError) -> Self {
        Self::Contract(error)
    }
}

impl From<OutOfGas> for ExecError {
    fn from(_: OutOfGas) -> Self {
        Self::Contract(StateTransitionError::OutOfGas)
    }
}

impl From<Error> for ExecError {
    fn from(error: Error) -> Self {
        Self::Fatal(error)
    }
}

type ExecResult<T> = Result<T, ExecError>;

/// Applies `message` to `state`.
///
/// All writes of the message are buffered in a nested overlay merged into `state` only on
/// success. An `Err` is a storage fault, contract failures are part of the result.
pub fn apply(
    state: &mut TrackedState<'_>,
    message: &ExecutionMessage,
    env: &TxEnvironment,
) -> Result<StateTransitionResult, Error> {
    let contract_address = match &message.kind {
        MessageKind::Create { .. } => Address::for_contract(env.txid, 0),
        MessageKind::Call { to, .. } => *to,
    };

    let mut machine = Machine {
        meter: GasMeter::new(message.gas_limit),
        logs: Vec::new(),
        transfers: Vec::new(),
    };

    let outcome = match machine.meter.spend(GasPriceList::BASE_COST) {
        Ok(()) => {
            let mut nested = state.start_tracking();
            machine
                .execute(&mut nested, message, contract_address)
                .map(|return_value| (return_value, nested.into_changes()))
        }
        Err(out_of_gas) => Err(out_of_gas.into()),
    };

    let gas_consumed = machine.meter.consumed();

    match outcome {
        Ok((return_value, changes)) => {
            state.merge(changes);
            tracing::trace!(
                txid = %env.txid,
                contract = %contract_address,
                gas_consumed,
                "State transition succeeded"
            );
            Ok(StateTransitionResult {
                contract_address,
                gas_consumed,
                logs: machine.logs,
                internal_transfers: machine.transfers,
                return_value,
                error: None,
            })
        }
        Err(ExecError::Contract(error)) => {
            tracing::debug!(
                txid = %env.txid,
                contract = %contract_address,
                gas_consumed,
                %error,
                "State transition failed"
            );
            Ok(StateTransitionResult {
                contract_address,
                gas_consumed,
                logs: Vec::new(),
                internal_transfers: Vec::new(),
                return_value: None,
                error: Some(error),
            })
        }
        Err(ExecError::Fatal(error)) => Err(error),
    }
}

struct Machine {
    meter: GasMeter,
    logs: Vec<Log>,
    transfers: Vec<TransferInfo>,
}

impl Machine {
    fn execute(
        &mut self,
        state: &mut TrackedState<'_>,
        message: &ExecutionMessage,
        contract_address: Address,
    ) -> ExecResult<Option<Vec<u8>>> {
        match &message.kind {
            MessageKind::Create { code, params } => {
                self.meter.spend(GasPriceList::create(code.len()))?;

                let contract =
                    ContractCode::from_bytes(code).ok_or(StateTransitionError::InvalidCode)?;
                if state.account(&contract_address)?.is_some() {
                    return Err(StateTransitionError::ContractAlreadyExists(contract_address).into());
                }

                let code_hash = state.set_code(code.clone());
                let mut account = AccountState::new(code_hash, contract.type_name.clone());
                account.balance = message.value;
                state.set_account(contract_address, account);

                self.run(
                    state,
                    contract_address,
                    params,
                    &contract.constructor,
                    0,
                )
            }
            MessageKind::Call { to, method, params } => {
                let (contract, _) = self.load_contract(state, to)?;
                let body = &contract
                    .method(method)
                    .ok_or_else(|| StateTransitionError::MethodDoesNotExist(method.clone()))?
                    .body;

                if message.value > 0 {
                    state.add_balance(to, message.value)?;
                }

                self.run(state, *to, params, body, 0)
            }
        }
    }

    fn load_contract(
        &mut self,
        state: &TrackedState<'_>,
        address: &Address,
    ) -> ExecResult<(ContractCode, AccountState)> {
        let account = state
            .account(address)?
            .ok_or(StateTransitionError::ContractDoesNotExist(*address))?;
        let code = state
            .code(&account.code_hash)?
            .and_then(|code| ContractCode::from_bytes(&code))
            .ok_or(StateTransitionError::InvalidCode)?;
        Ok((code, account))
    }

    fn run(
        &mut self,
        state: &mut TrackedState<'_>,
        contract: Address,
        params: &[Vec<u8>],
        body: &[Instruction],
        depth: usize,
    ) -> ExecResult<Option<Vec<u8>>> {
        for instruction in body {
            self.meter.spend(GasPriceList::INSTRUCTION_COST)?;

            match instruction {
                Instruction::Store { key, value } => {
                    self.meter.spend(GasPriceList::store(key, value))?;
                    state.set_storage(contract, key.clone(), value.clone());
                }
                Instruction::StoreParam { key, param } => {
                    let value = params
                        .get(*param as usize)
                        .ok_or(StateTransitionError::MissingParameter(*param))?;
                    self.meter.spend(GasPriceList::store(key, value))?;
                    state.set_storage(contract, key.clone(), value.clone());
                }
                Instruction::Delete { key } => {
                    self.meter.spend(GasPriceList::STORE_COST)?;
                    state.clear_storage(contract, key.clone());
                }
                Instruction::Log { topics, data } => {
                    self.meter.spend(GasPriceList::log(topics, data))?;
                    self.logs.push(Log {
                        address: contract,
                        topics: topics.clone(),
                        data: data.clone(),
                    });
                }
                Instruction::Transfer { to, amount } => {
                    self.meter.spend(GasPriceList::TRANSFER_COST)?;
                    self.transfer(state, contract, *to, *amount)?;
                }
                Instruction::Call {
                    to,
                    method,
                    amount,
                    params,
                } => {
                    self.meter.spend(GasPriceList::CALL_COST)?;
                    self.internal_call(state, contract, *to, method, *amount, params, depth + 1)?;
                }
                Instruction::Revert { reason } => {
                    return Err(StateTransitionError::Revert(reason.clone()).into());
                }
                Instruction::Return { value } => return Ok(Some(value.clone())),
                Instruction::Burn { gas } => self.meter.spend(*gas)?,
            }
        }

        Ok(None)
    }

    fn transfer(
        &mut self,
        state: &mut TrackedState<'_>,
        from: Address,
        to: Address,
        value: u64,
    ) -> ExecResult<()> {
        if !state.sub_balance(&from, value)? {
            return Err(StateTransitionError::InsufficientBalance.into());
        }
        // Funds sent to a non-contract address leave the contract state.
        state.add_balance(&to, value)?;
        self.transfers.push(TransferInfo { from, to, value });
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn internal_call(
        &mut self,
        state: &mut TrackedState<'_>,
        from: Address,
        to: Address,
        method: &str,
        value: u64,
        params: &[Vec<u8>],
        depth: usize,
    ) -> ExecResult<()> {
        let (logs_len, transfers_len) = (self.logs.len(), self.transfers.len());

        let outcome = {
            let mut nested = state.start_tracking();
            self.call_in(&mut nested, from, to, method, value, params, depth)
                .map(|_| nested.into_changes())
        };

        match outcome {
            Ok(changes) => {
                state.merge(changes);
                Ok(())
            }
            Err(ExecError::Contract(StateTransitionError::OutOfGas)) => {
                Err(StateTransitionError::OutOfGas.into())
            }
            Err(ExecError::Contract(error)) => {
                self.logs.truncate(logs_len);
                self.transfers.truncate(transfers_len);
                tracing::trace!(%from, %to, method, %error, "Internal call rolled back");
                Ok(())
            }
            Err(fatal) => Err(fatal),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn call_in(
        &mut self,
        state: &mut TrackedState<'_>,
        from: Address,
        to: Address,
        method: &str,
        value: u64,
        params: &[Vec<u8>],
        depth: usize,
    ) -> ExecResult<Option<Vec<u8>>> {
        if depth > MAX_CALL_DEPTH {
            return Err(StateTransitionError::CallDepthExceeded.into());
        }

        let (contract, _) = self.load_contract(state, &to)?;
        let body = &contract
            .method(method)
            .ok_or_else(|| StateTransitionError::MethodDoesNotExist(method.to_string()))?
            .body;

        if value > 0 {
            self.transfer(state, from, to, value)?;
        }

        self.run(state, to, params, body, depth)
    }
}
