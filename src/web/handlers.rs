pub mod googlechat;
pub mod health;
pub mod metrics;
pub mod provisioning;
pub mod transactions;
