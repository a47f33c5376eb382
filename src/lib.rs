pub mod config;
pub mod message;
pub mod rabbitmq;
pub mod services;
pub mod telemetry;
