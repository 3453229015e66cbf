pub mod allocator;
pub mod db;
pub mod error;
pub mod reconciler;
pub mod runtime;
pub mod server;
