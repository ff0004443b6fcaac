//! Commands for payments and refunds, with their input validation.

use payflow_core::error::DomainError;
use uuid::Uuid;

/// Command to create and authorize a payment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatePayment {
    /// Merchant order reference; unique across payments.
    pub order_id: String,
    /// Tokenized card reference.
    pub card_token: String,
    /// Amount in minor units.
    pub amount_cents: i64,
    /// ISO-4217 currency code.
    pub currency: String,
    /// Statement description.
    pub description: String,
}

impl CreatePayment {
    /// Checks the command's fields.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` naming the first invalid field.
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.order_id.trim().is_empty() {
            return Err(DomainError::Validation("order_id must not be blank".into()));
        }
        if self.card_token.trim().is_empty() {
            return Err(DomainError::Validation(
                "card_token must not be blank".into(),
            ));
        }
        validate_amount(self.amount_cents)?;
        validate_currency(&self.currency)
    }
}

/// Command to refund part or all of an authorized payment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateRefund {
    /// The payment to refund.
    pub payment_id: Uuid,
    /// Amount in minor units.
    pub amount_cents: i64,
    /// Free-text reason.
    pub reason: String,
}

impl CreateRefund {
    /// Checks the command's fields. Limits that depend on the payment are
    /// checked by the handler.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if the amount is not positive.
    pub fn validate(&self) -> Result<(), DomainError> {
        validate_amount(self.amount_cents)
    }
}

fn validate_amount(amount_cents: i64) -> Result<(), DomainError> {
    if amount_cents <= 0 {
        return Err(DomainError::Validation(format!(
            "amount_cents must be positive, got {amount_cents}"
        )));
    }
    Ok(())
}

fn validate_currency(currency: &str) -> Result<(), DomainError> {
    if currency.len() != 3 || !currency.bytes().all(|b| b.is_ascii_uppercase()) {
        return Err(DomainError::Validation(format!(
            "currency must be a 3-letter ISO code, got {currency:?}"
        )));
    }
    Ok(())
}
