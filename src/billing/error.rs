//! Typed outcomes for the billing core.
//!
//! Variants map 1:1 onto what the (external) API layer needs to tell a
//! caller. Status-code mapping is left to that layer.

/// Errors produced by the ledger, wallet, quota, gateway and reconciler.
#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("insufficient balance: required {required}, available {available}")]
    InsufficientBalance { required: i64, available: i64 },

    #[error("daily limit exceeded: {used}/{limit} operations today")]
    DailyLimitExceeded { limit: u32, used: u32 },

    #[error("monthly limit exceeded: {used}/{limit} operations this month")]
    MonthlyLimitExceeded { limit: u32, used: u32 },

    #[error("invalid amount: {0} (must be a positive integer)")]
    InvalidAmount(i64),

    #[error("top-up below minimum: {requested} (minimum {minimum})")]
    TopUpBelowMinimum { minimum: i64, requested: i64 },

    #[error("external reference already recorded: {0}")]
    DuplicateReference(String),

    #[error("external service unavailable: {0}")]
    ExternalServiceUnavailable(String),

    #[error("account not found: {0}")]
    AccountNotFound(String),

    #[error("account already exists for payer: {0}")]
    AccountExists(String),

    #[error("invalid payer identity: {0:?}")]
    InvalidPayerIdentity(String),

    #[error("payment verification failed for {reference}: {reason}")]
    VerificationFailed { reference: String, reason: String },

    #[error("invalid webhook signature")]
    InvalidSignature,

    #[error("reservation not found or not pending: {0}")]
    ReservationNotFound(String),

    /// The external operation succeeded but could not be billed.
    #[error("operational anomaly: {action} for account {account_id} delivered but not billed: {reason}")]
    OperationalAnomaly {
        account_id: String,
        action: String,
        reason: String,
    },

    #[error("sqlite error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
}

impl BillingError {
    /// Whether the caller can act on this error (top up, wait, retry).
    ///
    /// Everything else points at the system itself and needs an operator.
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            Self::InsufficientBalance { .. }
                | Self::DailyLimitExceeded { .. }
                | Self::MonthlyLimitExceeded { .. }
                | Self::InvalidAmount(_)
                | Self::TopUpBelowMinimum { .. }
                | Self::ExternalServiceUnavailable(_)
                | Self::VerificationFailed { .. }
                | Self::AccountExists(_)
                | Self::InvalidPayerIdentity(_)
        )
    }

    /// Short machine-readable code, stable across releases.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InsufficientBalance { .. } => "insufficient_balance",
            Self::DailyLimitExceeded { .. } => "daily_limit_exceeded",
            Self::MonthlyLimitExceeded { .. } => "monthly_limit_exceeded",
            Self::InvalidAmount(_) => "invalid_amount",
            Self::TopUpBelowMinimum { .. } => "top_up_below_minimum",
            Self::DuplicateReference(_) => "duplicate_reference",
            Self::ExternalServiceUnavailable(_) => "external_service_unavailable",
            Self::AccountNotFound(_) => "account_not_found",
            Self::AccountExists(_) => "account_exists",
            Self::InvalidPayerIdentity(_) => "invalid_payer_identity",
            Self::VerificationFailed { .. } => "verification_failed",
            Self::InvalidSignature => "invalid_signature",
            Self::ReservationNotFound(_) => "reservation_not_found",
            Self::OperationalAnomaly { .. } => "operational_anomaly",
            Self::Storage(_) => "storage_error",
            Self::Pool(_) => "storage_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authorization_failures_are_user_facing() {
        assert!(BillingError::InsufficientBalance {
            required: 50,
            available: 10
        }
        .is_user_facing());
        assert!(BillingError::DailyLimitExceeded { limit: 20, used: 20 }.is_user_facing());
    }

    #[test]
    fn anomaly_is_not_user_facing() {
        let err = BillingError::OperationalAnomaly {
            account_id: "acct".into(),
            action: "polish_task".into(),
            reason: "insufficient balance".into(),
        };
        assert!(!err.is_user_facing());
        assert_eq!(err.code(), "operational_anomaly");
        assert!(err.to_string().contains("delivered but not billed"));
    }
}
