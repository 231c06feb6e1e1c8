//! Intake bot: guided unsubscribe-request form with payment handling.

pub mod advisor;
pub mod bot;
pub mod channels;
pub mod config;
pub mod error;
pub mod form;
pub mod llm;
pub mod notify;
pub mod payments;
pub mod routes;
pub mod store;
