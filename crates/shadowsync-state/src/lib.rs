pub mod advisory_lock;
pub mod backend;
pub mod buffer;
pub mod db;
pub mod files;
pub mod legacy;
pub mod migration;
pub mod mirror;
pub mod repos;
pub mod router;
pub mod schema;
pub mod store;
pub mod users;
