mod lifecycle;
mod supervisor;

pub use lifecycle::OrderLifecycleOrchestrator;
pub use supervisor::LifecycleSupervisor;
