//! Preauthorized signature credit.
//!
//! A session may be granted a number of signatures for a certificate ahead
//! of time. Each signature consumes one unit of credit without prompting.

use std::collections::HashMap;

use signbridge_types::Thumbprint;

/// Remaining preauthorized signatures per certificate for one session.
#[derive(Debug, Clone, Default)]
pub struct CreditLedger {
    credit: HashMap<Thumbprint, u64>,
}

impl CreditLedger {
    /// An empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the credit for `thumbprint` to exactly `count`.
    pub fn grant(&mut self, thumbprint: &Thumbprint, count: u64) {
        self.credit.insert(thumbprint.clone(), count);
    }

    /// Drop any credit for `thumbprint`.
    pub fn reset(&mut self, thumbprint: &Thumbprint) {
        self.credit.remove(thumbprint);
    }

    /// Consume `count` signatures if enough credit remains.
    ///
    /// Consumption is all-or-nothing: insufficient credit leaves the ledger
    /// untouched.
    pub fn try_consume(&mut self, thumbprint: &Thumbprint, count: u64) -> bool {
        match self.credit.get_mut(thumbprint) {
            Some(left) if *left >= count => {
                *left -= count;
                true
            }
            _ => false,
        }
    }

    /// Remaining credit for `thumbprint`.
    pub fn remaining(&self, thumbprint: &Thumbprint) -> u64 {
        self.credit.get(thumbprint).copied().unwrap_or(0)
    }
}
