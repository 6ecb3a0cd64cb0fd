pub mod hash;
pub mod manifest;
pub mod transfer_action;
pub mod transfer_manager;
pub mod transfer_store;
