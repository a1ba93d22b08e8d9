//! Per-boundary configuration.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::transaction::error::TransactionError;
use crate::transaction::propagation::Propagation;

type Matcher = Arc<dyn Fn(&TransactionError) -> bool + Send + Sync>;

/// Selects errors for the rollback rules of a boundary.
#[derive(Clone)]
pub struct ErrorClassifier {
    label: String,
    matcher: Matcher,
}

impl ErrorClassifier {
    /// Matches a unit-of-work error of type `T`, anywhere in its source chain.
    pub fn of<T: StdError + 'static>() -> Self {
        Self {
            label: std::any::type_name::<T>().to_string(),
            matcher: Arc::new(|err| err.find_unit_error::<T>().is_some()),
        }
    }

    /// Matches any error accepted by `predicate`.
    pub fn when<F>(label: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&TransactionError) -> bool + Send + Sync + 'static,
    {
        Self {
            label: label.into(),
            matcher: Arc::new(predicate),
        }
    }

    pub fn matches(&self, err: &TransactionError) -> bool {
        (self.matcher)(err)
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl fmt::Debug for ErrorClassifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ErrorClassifier").field(&self.label).finish()
    }
}

/// How a boundary runs its unit of work.
#[derive(Debug, Clone, Default)]
pub struct TransactionOptions {
    /// Relation to an already active transaction.
    pub propagation: Propagation,
    /// Declares that the unit of work does not write.
    pub read_only: bool,
    /// Errors that always roll back, even when `no_rollback_for` matches.
    pub rollback_for: Vec<ErrorClassifier>,
    /// Errors that still let the transaction commit.
    pub no_rollback_for: Vec<ErrorClassifier>,
}

impl TransactionOptions {
    pub fn new(propagation: Propagation) -> Self {
        Self {
            propagation,
            ..Default::default()
        }
    }

    /// Set propagation mode.
    pub fn propagation(mut self, propagation: Propagation) -> Self {
        self.propagation = propagation;
        self
    }

    /// Set read_only flag.
    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    /// Add an error class that forces rollback.
    pub fn rollback_for(mut self, classifier: ErrorClassifier) -> Self {
        self.rollback_for.push(classifier);
        self
    }

    /// Add an error class that does not trigger rollback.
    pub fn no_rollback_for(mut self, classifier: ErrorClassifier) -> Self {
        self.no_rollback_for.push(classifier);
        self
    }

    /// Whether `err`, raised by the unit of work, must roll the transaction back.
    ///
    /// Every error rolls back unless a `no_rollback_for` classifier
    /// matches it and no `rollback_for` classifier does.
    pub fn triggers_rollback(&self, err: &TransactionError) -> bool {
        if self.rollback_for.iter().any(|c| c.matches(err)) {
            return true;
        }
        !self.no_rollback_for.iter().any(|c| c.matches(err))
    }
}

impl From<Propagation> for TransactionOptions {
    fn from(propagation: Propagation) -> Self {
        Self::new(propagation)
    }
}

/// Boundary defaults loadable from configuration files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionDefaults {
    pub propagation: Propagation,
    pub read_only: bool,
}

impl From<TransactionDefaults> for TransactionOptions {
    fn from(defaults: TransactionDefaults) -> Self {
        Self::new(defaults.propagation).read_only(defaults.read_only)
    }
}
