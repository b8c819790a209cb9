//! Infrastructure layer: event store backends, command dispatch, the box office
//! services, read models, notifications, config.

pub mod catalog;
pub mod clock;
pub mod command_dispatcher;
pub mod config;
pub mod error;
pub mod event_store;
pub mod ledger;
pub mod orders;
pub mod settlement;
pub mod inventory;
pub mod box_office;
pub mod notifications;
pub mod read_model;
pub mod projections;
pub mod workers;

mod integration_tests;

pub use box_office::BoxOffice;
pub use catalog::{Catalog, CatalogError, InMemoryCatalog};
pub use clock::{Clock, FixedClock, SystemClock};
pub use config::{BoxOfficeConfig, ConfigError, StoreBackend};
pub use error::{EngineError, EngineResult, ErrorKind};
pub use inventory::Availability;
pub use notifications::{LoggingNotifier, NotificationRelay, Notifier, NotifyError};
pub use settlement::{RecoveryReport, SettlementOutcome};
