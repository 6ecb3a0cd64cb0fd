pub mod calls;
pub mod scheduler;
pub mod translation;
pub mod workflow_engine;
