/// Execution ran out of gas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Out of gas")]
pub struct OutOfGas;

/// Gas cost of each operation.
pub struct GasPriceList;

impl GasPriceList {
    /// Charged for any contract transaction.
    pub const BASE_COST: u64 = 10_000;
    pub const CREATE_COST: u64 = 12_000;
    pub const CODE_BYTE_COST: u64 = 10;
    /// Charged for every executed instruction.
    pub const INSTRUCTION_COST: u64 = 1;
    pub const STORE_COST: u64 = 1_000;
    pub const STORE_BYTE_COST: u64 = 10;
    pub const LOG_COST: u64 = 375;
    pub const LOG_TOPIC_COST: u64 = 375;
    pub const LOG_BYTE_COST: u64 = 8;
    pub const TRANSFER_COST: u64 = 1_000;
    pub const CALL_COST: u64 = 2_000;

    pub fn create(code_len: usize) -> u64 {
        Self::CREATE_COST + Self::CODE_BYTE_COST * code_len as u64
    }

    pub fn store(key: &[u8], value: &[u8]) -> u64 {
        Self::STORE_COST + Self::STORE_BYTE_COST * (key.len() + value.len()) as u64
    }

    pub fn log(topics: &[Vec<u8>], data: &[u8]) -> u64 {
        Self::LOG_COST
            + Self::LOG_TOPIC_COST * topics.len() as u64
            + Self::LOG_BYTE_COST * data.len() as u64
    }
}

/// Tracks the gas consumed against a limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GasMeter {
    limit: u64,
    consumed: u64,
}

impl GasMeter {
    pub fn new(limit: u64) -> Self {
        Self { limit, consumed: 0 }
    }

    /// Consumes `amount`. Running out of gas consumes everything that is left.
    pub fn spend(&mut self, amount: u64) -> Result<(), OutOfGas> {
        match self.consumed.checked_add(amount) {
            Some(total) if total <= self.limit => {
                self.consumed = total;
                Ok(())
            }
            _ => {
                self.consumed = self.limit;
                Err(OutOfGas)
            }
        }
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    pub fn available(&self) -> u64 {
        self.limit - self.consumed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausting_consumes_the_limit() {
        let mut meter = GasMeter::new(100);
        meter.spend(60).unwrap();
        assert_eq!(meter.available(), 40);
        assert_eq!(meter.spend(41), Err(OutOfGas));
        assert_eq!(meter.consumed(), 100);
        assert_eq!(meter.spend(u64::MAX), Err(OutOfGas));
    }
}
