//! Administrative operations behind the broker settings and history screens.

pub mod broker;
pub mod history;

pub use broker::{BrokerAdmin, BrokerAdminError, BrokerConfigUpdate, BrokerConfigView, ProbeOutcome};
pub use history::AuditReader;
