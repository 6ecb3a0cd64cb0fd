pub mod status;
pub mod workflow;
pub mod workflow_node;
