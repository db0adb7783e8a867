// IOCORE LIBRARY
// EVERYTHING THE CONTROLLER DECIDES IS PURE RUST OVER THE HostInterface SEAM.
// THE BINARY ADDS THE LINUX SYSFS BACKEND; tests/ DRIVE THE SIMULATED HOST.

pub mod adaptive;
pub mod affinity;
pub mod balance;
pub mod classifier;
pub mod cpumask;
pub mod engine;
pub mod error;
pub mod estimator;
pub mod event;
pub mod host;
pub mod model;
pub mod pool;
pub mod sim;
pub mod snapshot;
pub mod topology;
pub mod tuning;
pub mod vm;

pub use error::{Error, Result};
