// ============================================================================
// Order Domain
// ============================================================================
//
// - Value objects (OrderStatus, OrderedItem)
// - Entity (Order)
// - Events (topic / subscription names, status change projection)
// - Errors (OrderError, ValidationError)
// - Validation (OrderValidator)
//
// ============================================================================

pub mod value_objects;
pub mod entity;
pub mod events;
pub mod errors;
pub mod validation;

pub use value_objects::*;
pub use entity::*;
pub use events::*;
pub use errors::*;
pub use validation::*;
