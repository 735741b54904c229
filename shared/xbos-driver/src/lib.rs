//! XBOS driver runtime
//!
//! Building blocks for drivers that expose building devices as timeseries:
//! series registration, buffered readings with periodic batched reporting
//! to archivers, archiver subscriptions, actuators, and UDP listeners.

pub mod clock;
pub mod config;
mod driver;
mod error;
pub mod listener;
pub mod metadata;
pub mod registry;
pub mod report;
pub mod scheduler;
pub mod subscription;
pub mod timeseries;

pub use clock::UnitOfTime;
pub use config::{DeliveryPolicy, DriverConfig};
pub use driver::Driver;
pub use error::{DriverError, Result};
pub use listener::DatagramHandler;
pub use metadata::Metadata;
pub use registry::SeriesRegistry;
pub use report::{FlushOutcome, ReportBatcher};
pub use scheduler::RunSummary;
pub use subscription::{MessageHandler, SubscriptionContext};
pub use timeseries::{ActuatorKind, ActuatorSpec, Reading, StreamType, TimeSeries};

/// Re-export for convenience
pub mod prelude {
    pub use super::{
        ActuatorSpec, DatagramHandler, DeliveryPolicy, Driver, DriverConfig, DriverError,
        MessageHandler, Result, SeriesRegistry, StreamType, SubscriptionContext, UnitOfTime,
    };
}
