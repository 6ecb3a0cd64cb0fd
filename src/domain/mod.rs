pub mod controller;
pub mod engine;
pub mod remote_object;
pub mod transfer;
pub mod utils;
pub mod workflow;
