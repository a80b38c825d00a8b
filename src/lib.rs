pub mod clock;
pub mod config;
pub mod flow;
pub mod logging;
pub mod metrics;
pub mod output;
pub mod rate;
pub mod report;
pub mod roles;
pub mod topology;
pub mod transport;
