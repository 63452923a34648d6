//! In-memory profiling stores aggregating state across flows.

pub mod device;
pub mod httpmeta;
pub mod software;

pub use device::DeviceProfileStore;
pub use httpmeta::HttpMetaStore;
pub use software::{SoftwareStore, UserAgentInfo, SERVICE_HTTP, SERVICE_POP3, SERVICE_SSH};
