use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Validation error on {field}: {message}")]
    ValidationError { field: String, message: String },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Invalid billable metric {code}: {message}")]
    InvalidMetric { code: String, message: String },

    #[error("Invalid charge model config for charge {charge}: {message}")]
    InvalidChargeModelConfig { charge: String, message: String },

    #[error("Invalid custom expression at position {position}: {message}")]
    InvalidExpression { position: usize, message: String },

    #[error("Expression evaluation failed: {message}")]
    ExpressionEvaluation { message: String },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Insufficient wallet balance: available {available}, requested {requested}")]
    InsufficientWalletBalance {
        available: Decimal,
        requested: Decimal,
    },

    #[error("Wallet {wallet_id} version conflict persisted after {attempts} attempts")]
    ConcurrentWalletConflict { wallet_id: String, attempts: u32 },

    #[error("Version conflict on {entity} {id}: expected {expected}, found {found}")]
    VersionConflict {
        entity: &'static str,
        id: String,
        expected: u64,
        found: u64,
    },

    #[error("Cached aggregation for charge {charge_id} is frozen")]
    FrozenAggregation { charge_id: String },

    #[error("Invoice {invoice_id} is finalized and cannot be modified")]
    InvoiceImmutable { invoice_id: String },

    #[error("Invoice generation failed for subscription {subscription}: {message}")]
    InvoiceGenerationFailure {
        subscription: String,
        message: String,
    },

    #[error("Currency {code} is not supported")]
    UnsupportedCurrency { code: String },

    #[error("Currency mismatch: expected {expected}, found {found}")]
    CurrencyMismatch { expected: String, found: String },

    #[error("Storage error during {operation}: {message}")]
    StorageError { operation: String, message: String },

    #[error("Tax provider error: {message}")]
    TaxProviderError { message: String },

    #[error("Invalid state: {message}")]
    InvalidState { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BillingError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        BillingError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        BillingError::ValidationError {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Conflicts that a caller may retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BillingError::ConcurrentWalletConflict { .. } | BillingError::VersionConflict { .. }
        )
    }

    /// Stable error code persisted alongside captured failures.
    pub fn code(&self) -> &'static str {
        match self {
            BillingError::ValidationError { .. } => "validation_error",
            BillingError::NotFound { .. } => "not_found",
            BillingError::InvalidMetric { .. } => "invalid_metric",
            BillingError::InvalidChargeModelConfig { .. } => "invalid_charge_model_config",
            BillingError::InvalidExpression { .. } => "invalid_expression",
            BillingError::ExpressionEvaluation { .. } => "expression_evaluation",
            BillingError::InvalidStateTransition { .. } => "invalid_state_transition",
            BillingError::InsufficientWalletBalance { .. } => "insufficient_wallet_balance",
            BillingError::ConcurrentWalletConflict { .. } => "concurrent_wallet_conflict",
            BillingError::VersionConflict { .. } => "version_conflict",
            BillingError::FrozenAggregation { .. } => "frozen_aggregation",
            BillingError::InvoiceImmutable { .. } => "invoice_immutable",
            BillingError::InvoiceGenerationFailure { .. } => "invoice_generation_failure",
            BillingError::UnsupportedCurrency { .. } => "unsupported_currency",
            BillingError::CurrencyMismatch { .. } => "currency_mismatch",
            BillingError::StorageError { .. } => "storage_error",
            BillingError::TaxProviderError { .. } => "tax_provider_error",
            BillingError::InvalidState { .. } => "invalid_state",
            BillingError::Serialization(_) => "serialization_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, BillingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        let conflict = BillingError::ConcurrentWalletConflict {
            wallet_id: "w".to_string(),
            attempts: 5,
        };
        assert!(conflict.is_transient());
        assert_eq!(conflict.code(), "concurrent_wallet_conflict");

        let missing = BillingError::not_found("charge", "abc");
        assert!(!missing.is_transient());
        assert_eq!(missing.to_string(), "charge not found: abc");
    }
}
