//! Weighted action dispatch
//!
//! A [`Dispatcher`] owns a named set of weighted actions and picks one per
//! call. Selection is separated from execution: the caller implements
//! [`ActionRunner`] and receives the key of the chosen action.

mod dispatcher;
mod forced;
mod outcome;

pub use dispatcher::{ActionDef, ActionRunner, Dispatcher};
pub use forced::ForcedSequence;
pub use outcome::ActionOutcome;

use std::collections::HashMap;

use thiserror::Error;

/// `dispatcher name -> action name -> weight`
pub type WeightOverrides = HashMap<String, HashMap<String, f64>>;

/// Programming errors in action tables. These are never recoverable.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Dispatcher {0} has no actions")]
    Empty(&'static str),
    #[error("Dispatcher {0} has only zero-weight actions")]
    AllZero(&'static str),
    #[error("Dispatcher {0} has no applicable action with positive weight")]
    NothingApplicable(&'static str),
    #[error("Action {action} not found for {dispatcher}")]
    UnknownAction {
        dispatcher: &'static str,
        action: String,
    },
    #[error("Action {action} declared twice in {dispatcher}")]
    DuplicateAction {
        dispatcher: &'static str,
        action: String,
    },
    #[error("Action {dispatcher}.{action} has invalid weight {weight}")]
    InvalidWeight {
        dispatcher: &'static str,
        action: String,
        weight: f64,
    },
    #[error("Malformed forced action descriptor '{0}', expected <dispatcher>[?].<action>")]
    BadForcedDescriptor(String),
}
