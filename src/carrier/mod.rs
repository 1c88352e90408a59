pub mod protocol;
pub mod rest;
pub mod stream;

pub use protocol::{MediaPayload, OutboundFrame, StartMetadata, StreamEvent};
pub use rest::{CarrierRest, RemoteCall};
pub use stream::{CarrierEvent, CarrierHandle, MediaStream};
