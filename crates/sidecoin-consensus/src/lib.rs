//! Consensus rules and block validation of the sidechain.

mod context;
pub mod deployments;
mod engine;
pub mod errors;
pub mod rules;
#[cfg(test)]
mod test_utils;
mod validator;

pub use context::{RuleContext, RuleState, SystemTimeProvider, TimeProvider};
pub use deployments::{DeploymentFlags, ThresholdConditionCache, ThresholdState};
pub use engine::{EngineSetupError, RuleEngine, RuleServices};
pub use errors::{ConsensusError, ConsensusErrors};
pub use rules::{ConsensusRule, RuleEngineError, RulePhase};
pub use validator::{ChainValidator, ValidatorError, ValidatorServices};
