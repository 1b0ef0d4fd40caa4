pub mod client;
pub mod clock;
pub mod config;
pub mod constants;
pub mod dispatcher;
pub mod error;
pub mod generator;
pub mod logfile;
pub mod model;
pub mod net;
pub mod port_pool;
pub mod protocol;
pub mod sampler;
pub mod session;
pub mod traffic_data;
pub mod verdict;

pub use client::{run_once, run_sweep, ClientOptions, RunReport, SweepReport};
pub use config::{SocketType, TestConfig};
pub use dispatcher::{Dispatcher, ServerOptions};
pub use error::{Error, Result};
pub use stat_test::StatTest;
pub use verdict::Verdict;
