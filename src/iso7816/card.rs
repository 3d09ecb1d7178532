use std::fmt;
use std::io;

use crate::bpace;
use crate::iso7816::apdu;
use crate::secure_messaging;


#[derive(Debug)]
pub enum CommunicationError {
    Frame(apdu::WriteError),
    Parse(apdu::ParseError),
    Transport(io::Error),
    #[cfg(feature = "pcsc")]
    Pcsc(pcsc::Error),
    SecureMessaging(secure_messaging::Error),
    Bpace(bpace::Error),
}
impl fmt::Display for CommunicationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Frame(e) => write!(f, "APDU write error: {}", e),
            Self::Parse(e) => write!(f, "APDU parse error: {}", e),
            Self::Transport(e) => write!(f, "transport error: {}", e),
            #[cfg(feature = "pcsc")]
            Self::Pcsc(e) => write!(f, "PCSC error: {}", e),
            Self::SecureMessaging(e) => write!(f, "secure messaging error: {}", e),
            Self::Bpace(e) => write!(f, "BPACE error: {}", e),
        }
    }
}
impl std::error::Error for CommunicationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Frame(e) => Some(e),
            Self::Parse(e) => Some(e),
            Self::Transport(e) => Some(e),
            #[cfg(feature = "pcsc")]
            Self::Pcsc(e) => Some(e),
            Self::SecureMessaging(e) => Some(e),
            Self::Bpace(e) => Some(e),
        }
    }
}
impl From<apdu::WriteError> for CommunicationError {
    fn from(value: apdu::WriteError) -> Self { Self::Frame(value) }
}
impl From<apdu::ParseError> for CommunicationError {
    fn from(value: apdu::ParseError) -> Self { Self::Parse(value) }
}
impl From<io::Error> for CommunicationError {
    fn from(value: io::Error) -> Self { Self::Transport(value) }
}
#[cfg(feature = "pcsc")]
impl From<pcsc::Error> for CommunicationError {
    fn from(value: pcsc::Error) -> Self { Self::Pcsc(value) }
}
impl From<secure_messaging::Error> for CommunicationError {
    fn from(value: secure_messaging::Error) -> Self { Self::SecureMessaging(value) }
}
impl From<bpace::Error> for CommunicationError {
    fn from(value: bpace::Error) -> Self { Self::Bpace(value) }
}


/// A smart card compatible with ISO/IEC 7816.
///
/// All framing and encoding happens above this boundary; implementations
/// only ever move raw bytes. Blocking I/O is expected; implementations must
/// surface their own timeouts as errors rather than hang indefinitely.
pub trait SmartCard {
    /// Send a request APDU to the smart card and receive a response APDU.
    fn communicate(&mut self, request: &apdu::Apdu) -> Result<apdu::Response, CommunicationError>;

    /// Whether a card is currently present in the reader.
    fn is_card_present(&mut self) -> bool;
}

#[cfg(feature = "pcsc")]
impl SmartCard for pcsc::Card {
    fn communicate(&mut self, request: &apdu::Apdu) -> Result<apdu::Response, CommunicationError> {
        let out_buf = request.serialize()?;
        tracing::trace!(apdu = %hex::encode(&out_buf), "sending to card");
        let mut in_buf = vec![0u8; request.data.response_data_length().unwrap_or(0) + 258];
        let in_slice = self.transmit(&out_buf, &mut in_buf)?;
        tracing::trace!(apdu = %hex::encode(in_slice), "received from card");
        Ok(apdu::Response::from_slice(in_slice)?)
    }

    fn is_card_present(&mut self) -> bool {
        self.status2_owned().is_ok()
    }
}
