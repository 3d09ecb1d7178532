//! The BPACE protocol engine.
//!
//! BPACE turns a short shared password (CAN, PIN or PUK) into a pair of
//! high-entropy session keys through a four-message exchange with the card,
//! then hands those keys to the secure messaging layer. The engine drives
//! the exchange strictly in order; the key agreement arithmetic itself lives
//! behind [`primitive::KeyAgreement`].


pub mod primitive;


use std::fmt;

use tracing::{debug, trace, warn};
use zeroize::Zeroizing;

use crate::chat::AccessTemplate;
use crate::der_util::{self, decode_tlv, encode_tlv};
use crate::iso7816::apdu::{Apdu, Response};
use crate::iso7816::card::{CommunicationError, SmartCard};
use crate::secure_messaging::SecureChannel;
use primitive::{DeterministicRng, KeyAgreement, KeyAgreementError, SessionKeys, MAX_PASSWORD_LEN};


/// AID of the national ID applet.
pub const AID_ID_APPLET: [u8; 16] = [
    0xD1, 0x12, 0x23, 0x52, 0x12, 0x11, 0x11, 0x01,
    0x00, 0x01, 0x04, 0x71, 0x01, 0x01, 0x00, 0x00,
];
/// Object identifier of the eID application, tag and length included.
pub const OID_EID: [u8; 12] = [
    0x06, 0x0A, 0x2A, 0x70, 0x00, 0x02, 0x00, 0x22, 0x65, 0x4F, 0x06, 0x01,
];
/// Object identifier of the eSign application, tag and length included.
pub const OID_ESIGN: [u8; 12] = [
    0x06, 0x0A, 0x2A, 0x70, 0x00, 0x02, 0x00, 0x22, 0x65, 0x4F, 0x06, 0x02,
];
/// Object identifier of the BPACE protocol, value bytes only.
pub const OID_BPACE: [u8; 9] = [
    0x2A, 0x70, 0x00, 0x02, 0x00, 0x22, 0x65, 0x42, 0x15,
];
/// Access rights the terminal requests on the eID application.
pub const EID_ACCESS_RIGHTS: [u8; 5] = [0x00, 0x33, 0x6F, 0x7B, 0x10];
/// Access rights the terminal requests on the eSign application.
pub const ESIGN_ACCESS_RIGHTS: [u8; 5] = [0x00, 0x00, 0x00, 0xC0, 0x00];


const CLA_DEFAULT: u8 = 0x00;
const CLA_CHAINED: u8 = 0x10;


/// The kind of password used as the shared secret.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum PasswordKind {
    Can,
    Pin,
    Puk,
}
impl PasswordKind {
    /// The selector byte transported in the initialization command.
    pub const fn selector(self) -> u8 {
        match self {
            Self::Can => 1,
            Self::Pin => 2,
            Self::Puk => 3,
        }
    }
}


/// Protocol constants of one concrete card applet.
///
/// These are configuration data, not logic; the engine takes them as given
/// and never hard-codes applet specifics.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct CardProfile {
    pub aid: Vec<u8>,
    /// BPACE protocol object identifier, value bytes only.
    pub protocol_oid: Vec<u8>,
    pub esign_chat: AccessTemplate,
    pub eid_chat: AccessTemplate,
    pub ins_select: u8,
    pub ins_initialize: u8,
    pub ins_authenticate: u8,
}
impl CardProfile {
    /// The profile of the deployed national ID applet.
    pub fn national_id() -> Self {
        Self {
            aid: AID_ID_APPLET.to_vec(),
            protocol_oid: OID_BPACE.to_vec(),
            esign_chat: AccessTemplate::new(OID_ESIGN, ESIGN_ACCESS_RIGHTS),
            eid_chat: AccessTemplate::new(OID_EID, EID_ACCESS_RIGHTS),
            ins_select: 0xA4,
            ins_initialize: 0x22,
            ins_authenticate: 0x86,
        }
    }
}


/// Where an authentication attempt currently stands.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum State {
    Idle,
    ApplicationSelected,
    MasterFileSelected,
    Initialized,
    Step1Sent,
    Step2Received,
    Step3Sent,
    Authenticated,
    Failed,
}


#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Operation {
    GeneralAuthenticate1,
    GeneralAuthenticate2,
}
impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GeneralAuthenticate1 => write!(f, "GENERAL AUTHENTICATE (message 1)"),
            Self::GeneralAuthenticate2 => write!(f, "GENERAL AUTHENTICATE (message 3)"),
        }
    }
}


#[derive(Debug)]
pub enum Error {
    PasswordTooLong { maximum: usize, obtained: usize },
    Selection { response: Response },
    Initialization { response: Response },
    OperationFailed { operation: Operation, response: Response },
    MissingMessage { operation: Operation },
    Encoding(der_util::EncodeError),
    KeyAgreement(KeyAgreementError),
    AuthenticationFailed,
}
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PasswordTooLong { maximum, obtained }
                => write!(f, "password is {} bytes long, expected at most {} bytes", obtained, maximum),
            Self::Selection { response }
                => write!(f, "selection failed with response code 0x{:04X}", response.trailer.to_word()),
            Self::Initialization { response }
                => write!(f, "initialization failed with response code 0x{:04X}", response.trailer.to_word()),
            Self::OperationFailed { operation, response }
                => write!(f, "{} failed with response code 0x{:04X}", operation, response.trailer.to_word()),
            Self::MissingMessage { operation }
                => write!(f, "{} response carries no protocol message", operation),
            Self::Encoding(e)
                => write!(f, "TLV encoding error: {}", e),
            Self::KeyAgreement(e)
                => write!(f, "key agreement error: {}", e),
            Self::AuthenticationFailed
                => write!(f, "mutual authentication failed"),
        }
    }
}
impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::PasswordTooLong { .. } => None,
            Self::Selection { .. } => None,
            Self::Initialization { .. } => None,
            Self::OperationFailed { .. } => None,
            Self::MissingMessage { .. } => None,
            Self::Encoding(e) => Some(e),
            Self::KeyAgreement(e) => Some(e),
            Self::AuthenticationFailed => None,
        }
    }
}
impl From<KeyAgreementError> for Error {
    fn from(value: KeyAgreementError) -> Self { Self::KeyAgreement(value) }
}


/// One authentication attempt against one card.
///
/// The session owns the card for its whole lifetime; a successful
/// [`Bpace::establish`] converts it into a [`SecureChannel`], so a second
/// concurrent session over the same card handle cannot be constructed.
pub struct Bpace<SC: SmartCard> {
    card: SC,
    profile: CardProfile,
    state: State,
}
impl<SC: SmartCard> Bpace<SC> {
    pub fn new(card: SC, profile: CardProfile) -> Self {
        Self {
            card,
            profile,
            state: State::Idle,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Give the card back, abandoning the session.
    pub fn into_card(self) -> SC {
        self.card
    }

    /// Run the full authentication and return the derived session keys.
    ///
    /// Any failure lands the session in [`State::Failed`]; the only recovery
    /// is a fresh `authorize` call, which supersedes everything the previous
    /// attempt produced. All intermediate secrets are wiped on every exit
    /// path.
    pub fn authorize(
        &mut self,
        password: &[u8],
        kind: PasswordKind,
        key_agreement: &mut dyn KeyAgreement,
        rng: &mut dyn DeterministicRng,
    ) -> Result<SessionKeys, CommunicationError> {
        self.state = State::Idle;
        let result = self.run(password, kind, key_agreement, rng);
        if result.is_err() {
            self.state = State::Failed;
        }
        result
    }

    /// Authenticate and wrap the card into a secure channel in one go.
    pub fn establish(
        mut self,
        password: &[u8],
        kind: PasswordKind,
        key_agreement: &mut dyn KeyAgreement,
        rng: &mut dyn DeterministicRng,
    ) -> Result<SecureChannel<SC>, CommunicationError> {
        let keys = self.authorize(password, kind, key_agreement, rng)?;
        Ok(SecureChannel::new(self.card, keys))
    }

    fn run(
        &mut self,
        password: &[u8],
        kind: PasswordKind,
        key_agreement: &mut dyn KeyAgreement,
        rng: &mut dyn DeterministicRng,
    ) -> Result<SessionKeys, CommunicationError> {
        if password.len() > MAX_PASSWORD_LEN {
            return Err(Error::PasswordTooLong {
                maximum: MAX_PASSWORD_LEN,
                obtained: password.len(),
            }.into());
        }

        self.select_application()?;
        self.select_master_file()?;
        let hello_a = self.initialize(kind)?;
        key_agreement.start(password, &hello_a).map_err(Error::from)?;
        let message2 = self.send_message1(key_agreement, rng)?;
        let card_token = self.send_message3(key_agreement, rng, &message2)?;
        self.finish(key_agreement, &card_token)
    }

    fn select_application(&mut self) -> Result<(), CommunicationError> {
        let request = Apdu::command(
            CLA_DEFAULT, self.profile.ins_select, 0x04, 0x0C,
            self.profile.aid.clone(), None,
        )?;
        let response = self.card.communicate(&request)?;
        if !response.trailer.is_success() {
            return Err(Error::Selection { response }.into());
        }
        self.state = State::ApplicationSelected;
        debug!("application selected");
        Ok(())
    }

    fn select_master_file(&mut self) -> Result<(), CommunicationError> {
        let request = Apdu::command(
            CLA_DEFAULT, self.profile.ins_select, 0x00, 0x00,
            Vec::new(), None,
        )?;
        let response = self.card.communicate(&request)?;
        if !response.trailer.is_success() {
            return Err(Error::Selection { response }.into());
        }
        self.state = State::MasterFileSelected;
        debug!("master file selected");
        Ok(())
    }

    /// Send the initialization command and return the hello-A bytes retained
    /// for the key agreement.
    fn initialize(&mut self, kind: PasswordKind) -> Result<Zeroizing<Vec<u8>>, CommunicationError> {
        // eSign first, then eID; the same bytes go to the card and into the
        // primitive's token computation
        let mut hello_a = Zeroizing::new(self.profile.esign_chat.encode());
        hello_a.extend(self.profile.eid_chat.encode());

        let mut request_data = encode_tlv(0x80, &self.profile.protocol_oid)
            .map_err(Error::Encoding)?;
        request_data.extend(encode_tlv(0x83, &[kind.selector()]).map_err(Error::Encoding)?);
        request_data.extend_from_slice(&hello_a);
        // templates and protocol identifiers only, nothing secret
        trace!(data = %hex::encode(&request_data), "initialization data");

        let request = Apdu::command(
            CLA_DEFAULT, self.profile.ins_initialize, 0xC1, 0xA4,
            request_data, None,
        )?;
        let response = self.card.communicate(&request)?;
        if response.trailer.is_retry_warning() {
            warn!(sw = response.trailer.to_word(), "retry counter warning during initialization");
        } else if !response.trailer.is_success() {
            return Err(Error::Initialization { response }.into());
        }
        self.state = State::Initialized;
        debug!("protocol initialized");
        Ok(hello_a)
    }

    fn send_message1(
        &mut self,
        key_agreement: &mut dyn KeyAgreement,
        rng: &mut dyn DeterministicRng,
    ) -> Result<Zeroizing<Vec<u8>>, CommunicationError> {
        rng.reseed(&key_agreement.params().seed);
        let nonce = key_agreement.step2(rng).map_err(Error::from)?;

        let inner = encode_tlv(0x80, &nonce).map_err(Error::Encoding)?;
        let body = encode_tlv(0x7C, &inner).map_err(Error::Encoding)?;
        let request = Apdu::command(
            CLA_CHAINED, self.profile.ins_authenticate, 0x00, 0x00,
            body, Some(0),
        )?;
        self.state = State::Step1Sent;

        let response = self.card.communicate(&request)?;
        if !response.trailer.is_success() {
            return Err(Error::OperationFailed {
                operation: Operation::GeneralAuthenticate1,
                response,
            }.into());
        }

        let missing = || Error::MissingMessage { operation: Operation::GeneralAuthenticate1 };
        let dynamic_data = decode_tlv(0x7C, &response.data).map_err(|_| missing())?;
        let message2 = Zeroizing::new(decode_tlv(0x81, &dynamic_data).map_err(|_| missing())?);
        if message2.is_empty() {
            return Err(missing().into());
        }
        self.state = State::Step2Received;
        debug!(len = message2.len(), "received message 2");
        Ok(message2)
    }

    fn send_message3(
        &mut self,
        key_agreement: &mut dyn KeyAgreement,
        rng: &mut dyn DeterministicRng,
        message2: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, CommunicationError> {
        // the primitive requires the same generator stream as at step 2
        rng.reseed(&key_agreement.params().seed);
        let outgoing = key_agreement.step4(rng, message2).map_err(Error::from)?;

        let inner = encode_tlv(0x82, &outgoing).map_err(Error::Encoding)?;
        let body = encode_tlv(0x7C, &inner).map_err(Error::Encoding)?;
        let request = Apdu::command(
            CLA_DEFAULT, self.profile.ins_authenticate, 0x00, 0x00,
            body, Some(0),
        )?;
        self.state = State::Step3Sent;

        let response = self.card.communicate(&request)?;
        if !response.trailer.is_success() {
            return Err(Error::OperationFailed {
                operation: Operation::GeneralAuthenticate2,
                response,
            }.into());
        }

        let missing = || Error::MissingMessage { operation: Operation::GeneralAuthenticate2 };
        let dynamic_data = decode_tlv(0x7C, &response.data).map_err(|_| missing())?;
        let card_token = Zeroizing::new(decode_tlv(0x83, &dynamic_data).map_err(|_| missing())?);
        if card_token.is_empty() {
            return Err(missing().into());
        }
        debug!(len = card_token.len(), "received message 4");
        Ok(card_token)
    }

    fn finish(
        &mut self,
        key_agreement: &mut dyn KeyAgreement,
        card_token: &[u8],
    ) -> Result<SessionKeys, CommunicationError> {
        key_agreement.step6(card_token).map_err(|e| match e {
            KeyAgreementError::TokenMismatch => Error::AuthenticationFailed,
            other => Error::KeyAgreement(other),
        })?;
        let keys = key_agreement.session_keys().map_err(Error::from)?;
        self.state = State::Authenticated;
        debug!("authenticated");
        Ok(keys)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_kind_selectors() {
        assert_eq!(PasswordKind::Can.selector(), 1);
        assert_eq!(PasswordKind::Pin.selector(), 2);
        assert_eq!(PasswordKind::Puk.selector(), 3);
    }

    #[test]
    fn national_id_profile_chats_encode_with_chat_tag() {
        let profile = CardProfile::national_id();
        let esign = profile.esign_chat.encode();
        let eid = profile.eid_chat.encode();
        assert_eq!(&esign[..2], &[0x7F, 0x4C]);
        assert_eq!(&eid[..2], &[0x7F, 0x4C]);
        // object id (12 bytes) plus rights (5 bytes)
        assert_eq!(esign[2], 17);
        assert_eq!(eid[2], 17);
    }
}
