pub mod auth;
pub mod cron;
pub mod extract;
pub mod gcal;
pub mod health;
pub mod webhooks;
