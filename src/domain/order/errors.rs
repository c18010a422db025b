use crate::context::DeadlineExceeded;
use crate::repository::RepositoryError;

// ============================================================================
// Order Errors
// ============================================================================

/// Every rule an order-creation request violated, in evaluation order.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{}", .violations.join("\n"))]
pub struct ValidationError {
    violations: Vec<String>,
}

impl ValidationError {
    pub fn new(violations: Vec<String>) -> Self {
        Self { violations }
    }

    pub fn violations(&self) -> &[String] {
        &self.violations
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OrderError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("supplied quantity for item with sku {sku} should be greater than zero, received is {quantity}")]
    InvalidQuantity { sku: String, quantity: i32 },

    #[error("given status '{0}' is invalid")]
    InvalidStatus(String),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("operation did not complete before the request deadline")]
    DeadlineExceeded(#[from] DeadlineExceeded),
}

impl OrderError {
    /// The repository could not find the target order
    pub fn is_not_found(&self) -> bool {
        matches!(self, OrderError::Repository(RepositoryError::NotFound(_)))
    }

    /// Rejected because of the caller's input, before any side effect
    pub fn is_invalid_input(&self) -> bool {
        matches!(
            self,
            OrderError::Validation(_) | OrderError::InvalidQuantity { .. } | OrderError::InvalidStatus(_)
        )
    }

    /// Short label used for metrics
    pub fn reason(&self) -> &'static str {
        match self {
            OrderError::Validation(_) => "validation",
            OrderError::InvalidQuantity { .. } => "invalid_quantity",
            OrderError::InvalidStatus(_) => "invalid_status",
            OrderError::Repository(RepositoryError::NotFound(_)) => "not_found",
            OrderError::Repository(RepositoryError::Conflict(_)) => "conflict",
            OrderError::Repository(RepositoryError::Unknown(_)) => "repository",
            OrderError::DeadlineExceeded(_) => "deadline_exceeded",
        }
    }
}
