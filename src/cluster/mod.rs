pub mod api;
pub mod network;
pub mod router;
pub mod types;
