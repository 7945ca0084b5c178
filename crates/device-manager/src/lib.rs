pub mod connection;
pub mod parse;
pub mod ptz;
pub mod requests;
pub mod soap;
pub mod stream_uri;
pub mod types;
pub mod wsse;
pub mod xml;

pub use connection::{Connection, NegotiationConfig, NegotiationError};
pub use ptz::{PtzConfig, PtzController, PtzError, PtzHandle};
pub use soap::{HttpSoapTransport, OnvifRequest, SoapAuth, SoapResponse, SoapTransport};
pub use types::*;
