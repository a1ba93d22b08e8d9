//! Transaction propagation modes.
//!
//! A propagation mode decides how a unit of work relates to the
//! transaction that is already active in its execution context.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Transaction propagation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Propagation {
    /// Join the active transaction, or start one if there is none.
    #[default]
    #[serde(alias = "REQUIRES")]
    Required,

    /// Always start an independent transaction on a fresh session,
    /// suspending the active one until this unit of work finishes.
    RequiresNew,

    /// Create a savepoint inside the active transaction, or start a new
    /// transaction (exactly like `Required`) if there is none.
    ///
    /// A failure rolls back to the savepoint only; the enclosing
    /// transaction can still commit.
    Nested,

    /// Join the active transaction if there is one, otherwise run
    /// without a transaction.
    Supports,

    /// Join the active transaction; fail if there is none.
    Mandatory,

    /// Suspend the active transaction and run without one.
    NotSupported,

    /// Run without a transaction; fail if one is active.
    Never,
}

impl Propagation {
    /// All modes, in declaration order.
    pub const ALL: [Propagation; 7] = [
        Propagation::Required,
        Propagation::RequiresNew,
        Propagation::Nested,
        Propagation::Supports,
        Propagation::Mandatory,
        Propagation::NotSupported,
        Propagation::Never,
    ];

    /// Whether this mode may open a session when no transaction is active.
    pub fn creates_transaction(&self) -> bool {
        matches!(
            self,
            Propagation::Required | Propagation::RequiresNew | Propagation::Nested
        )
    }

    /// Whether this mode hides an active transaction from the unit of work.
    pub fn suspends_existing(&self) -> bool {
        matches!(self, Propagation::RequiresNew | Propagation::NotSupported)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Propagation::Required => "REQUIRED",
            Propagation::RequiresNew => "REQUIRES_NEW",
            Propagation::Nested => "NESTED",
            Propagation::Supports => "SUPPORTS",
            Propagation::Mandatory => "MANDATORY",
            Propagation::NotSupported => "NOT_SUPPORTED",
            Propagation::Never => "NEVER",
        }
    }
}

impl fmt::Display for Propagation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parse a propagation mode, ignoring case and `_`/space/`-` separators.
impl std::str::FromStr for Propagation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| !matches!(c, '_' | ' ' | '-'))
            .collect::<String>()
            .to_uppercase();

        match normalized.as_str() {
            "REQUIRED" | "REQUIRES" => Ok(Propagation::Required),
            "REQUIRESNEW" => Ok(Propagation::RequiresNew),
            "NESTED" => Ok(Propagation::Nested),
            "SUPPORTS" => Ok(Propagation::Supports),
            "MANDATORY" => Ok(Propagation::Mandatory),
            "NOTSUPPORTED" => Ok(Propagation::NotSupported),
            "NEVER" => Ok(Propagation::Never),
            _ => Err(format!("unknown propagation mode: {}", s)),
        }
    }
}
