// ============================================================================
// Domain Layer - Business Logic
// ============================================================================
//
// Order entities, lifecycle events, validation rules and domain errors.
// Nothing in here talks to the database or the message bus; the
// orchestrator wires those collaborators in.
//
// ============================================================================

pub mod order;
