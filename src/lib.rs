pub mod config;
pub mod coordinator;
pub mod http;
pub mod ledger;
pub mod lock;
pub mod model;
pub mod notify;
pub mod observability;
pub mod store;
