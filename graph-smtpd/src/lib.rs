pub mod config;
pub mod controller;
pub mod sendmail;
pub mod telemetry;
