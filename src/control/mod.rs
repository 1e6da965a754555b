//! Control: pick emit, revise, verify or abstain under risk and cost budgets.
//!
//! The controller is synchronous and side-effect free. It reads a copy of
//! the calibrator's dual state and never mutates it.

mod controller;
mod types;

pub use controller::{DecisionController, DecisionInput};
pub use types::{Action, ActionBudget, ActionEstimate, Decision, DecisionRule, POLICY_VERSION};
