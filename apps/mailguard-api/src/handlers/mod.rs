pub mod health;
pub mod import;
pub mod reputation;
pub mod subscribers;
pub mod uploads;
pub mod webhooks;
