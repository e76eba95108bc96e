pub mod accuracy;
pub mod quantizer;
pub mod response;
pub mod session;

pub use crate::domain::model::{ImagePayload, TelemetryResult};
pub use crate::domain::ports::{Connector, LabelPolicy, Transport};
pub use crate::utils::error::Result;
