//! End-to-end authentication against a scripted card.
//!
//! The card side replays the exchange byte for byte and panics on any
//! deviation; the key agreement primitive is scripted the same way, so the
//! test pins down exactly what the engine feeds it at every step.


use eid_bpace::bpace::primitive::{
    DeterministicRng, DomainParams, EchoRng, KeyAgreement, KeyAgreementError, SessionKeys,
};
use eid_bpace::bpace::{Bpace, CardProfile, Error as BpaceError, PasswordKind, State, AID_ID_APPLET};
use eid_bpace::iso7816::apdu::{Apdu, Response, ResponseTrailer};
use eid_bpace::iso7816::card::{CommunicationError, SmartCard};
use hex_literal::hex;
use zeroize::Zeroizing;


const PASSWORD: &[u8] = b"334780";

/// The full data field of the initialization command: protocol object
/// identifier, CAN selector, then the eSign and eID templates.
const INITIALIZE_DATA: [u8; 54] = hex!(
    "80 09 2A 70 00 02 00 22 65 42 15"
    "83 01 01"
    "7F 4C 11 06 0A 2A 70 00 02 00 22 65 4F 06 02 00 00 00 C0 00"
    "7F 4C 11 06 0A 2A 70 00 02 00 22 65 4F 06 01 00 33 6F 7B 10"
);

const NONCE: [u8; 16] = [0xA5; 16];
const MESSAGE2: [u8; 16] = [0xB6; 16];
const CARD_TOKEN: [u8; 8] = [0xC7; 8];

fn message1_body() -> Vec<u8> {
    let mut body = vec![0x7C, 0x12, 0x80, 0x10];
    body.extend_from_slice(&NONCE);
    body
}

fn message2_body() -> Vec<u8> {
    let mut body = vec![0x7C, 0x12, 0x81, 0x10];
    body.extend_from_slice(&MESSAGE2);
    body
}

fn message3_body() -> Vec<u8> {
    let mut body = vec![0x7C, 0x4A, 0x82, 0x48];
    body.extend(0u8..72);
    body
}

fn message4_body(token: &[u8; 8]) -> Vec<u8> {
    let mut body = vec![0x7C, 0x0A, 0x83, 0x08];
    body.extend_from_slice(token);
    body
}


struct ScriptedKeyAgreement {
    params: DomainParams,
    step: u8,
}
impl ScriptedKeyAgreement {
    fn new() -> Self {
        Self {
            // a nonzero seed so the test can tell a reseeded generator from
            // a fresh one
            params: DomainParams {
                oid: "1.2.112.0.2.0.34.101.45.3.1",
                l: 128,
                seed: [1, 2, 3, 4, 5, 6, 7, 8],
            },
            step: 0,
        }
    }
}
impl KeyAgreement for ScriptedKeyAgreement {
    fn params(&self) -> &DomainParams {
        &self.params
    }

    fn start(&mut self, password: &[u8], hello_a: &[u8]) -> Result<(), KeyAgreementError> {
        assert_eq!(self.step, 0);
        assert_eq!(password, PASSWORD);
        // the two concatenated templates, eSign first
        assert_eq!(hello_a.len(), 40);
        assert_eq!(&hello_a[..3], &[0x7F, 0x4C, 0x11]);
        assert_eq!(&hello_a[20..23], &[0x7F, 0x4C, 0x11]);
        self.step = 1;
        Ok(())
    }

    fn step2(&mut self, rng: &mut dyn DeterministicRng) -> Result<Zeroizing<Vec<u8>>, KeyAgreementError> {
        assert_eq!(self.step, 1);
        let mut probe = [0u8; 8];
        rng.fill_bytes(&mut probe);
        assert_eq!(probe, self.params.seed, "generator was not seeded from the domain parameters");
        self.step = 2;
        Ok(Zeroizing::new(NONCE.to_vec()))
    }

    fn step4(&mut self, rng: &mut dyn DeterministicRng, message2: &[u8]) -> Result<Zeroizing<Vec<u8>>, KeyAgreementError> {
        assert_eq!(self.step, 2);
        assert_eq!(message2, MESSAGE2);
        let mut probe = [0u8; 8];
        rng.fill_bytes(&mut probe);
        assert_eq!(probe, self.params.seed, "generator was not reseeded before step 4");
        self.step = 4;
        Ok(Zeroizing::new((0u8..72).collect()))
    }

    fn step6(&mut self, card_token: &[u8]) -> Result<(), KeyAgreementError> {
        assert_eq!(self.step, 4);
        if card_token != CARD_TOKEN {
            return Err(KeyAgreementError::TokenMismatch);
        }
        self.step = 6;
        Ok(())
    }

    fn session_keys(&mut self) -> Result<SessionKeys, KeyAgreementError> {
        if self.step != 6 {
            return Err(KeyAgreementError::StepOutOfOrder);
        }
        Ok(SessionKeys { enc: [0xD8; 32], mac: [0xE9; 32] })
    }
}


struct ScriptedCard {
    initialize_sw: [u8; 2],
    message1_sw: [u8; 2],
    token: [u8; 8],
    exchanges: usize,
}
impl ScriptedCard {
    fn new() -> Self {
        Self {
            initialize_sw: [0x90, 0x00],
            message1_sw: [0x90, 0x00],
            token: CARD_TOKEN,
            exchanges: 0,
        }
    }
}
impl SmartCard for ScriptedCard {
    fn communicate(&mut self, request: &Apdu) -> Result<Response, CommunicationError> {
        self.exchanges += 1;
        let (data, sw) = match request.header.to_be_u32() {
            0x00A4_040C => {
                assert_eq!(request.data.request_data().unwrap(), AID_ID_APPLET);
                (Vec::new(), [0x90, 0x00])
            },
            0x00A4_0000 => {
                assert!(request.data.request_data().is_none());
                (Vec::new(), [0x90, 0x00])
            },
            0x0022_C1A4 => {
                assert_eq!(request.data.request_data().unwrap(), INITIALIZE_DATA);
                (Vec::new(), self.initialize_sw)
            },
            0x1086_0000 => {
                assert_eq!(request.data.request_data().unwrap(), message1_body());
                assert_eq!(request.data.response_data_length(), Some(0));
                if self.message1_sw == [0x90, 0x00] {
                    (message2_body(), [0x90, 0x00])
                } else {
                    (Vec::new(), self.message1_sw)
                }
            },
            0x0086_0000 => {
                assert_eq!(request.data.request_data().unwrap(), message3_body());
                assert_eq!(request.data.response_data_length(), Some(0));
                (message4_body(&self.token), [0x90, 0x00])
            },
            other => panic!("unexpected command 0x{:08X}", other),
        };
        Ok(Response {
            data,
            trailer: ResponseTrailer::new(sw[0], sw[1]),
        })
    }

    fn is_card_present(&mut self) -> bool {
        true
    }
}


#[test]
fn full_authentication_derives_the_session_keys() {
    let mut session = Bpace::new(ScriptedCard::new(), CardProfile::national_id());
    let mut key_agreement = ScriptedKeyAgreement::new();
    let mut rng = EchoRng::new();

    let keys = session
        .authorize(PASSWORD, PasswordKind::Can, &mut key_agreement, &mut rng)
        .unwrap();
    assert_eq!(keys, SessionKeys { enc: [0xD8; 32], mac: [0xE9; 32] });
    assert_eq!(session.state(), State::Authenticated);

    let card = session.into_card();
    assert_eq!(card.exchanges, 5);
}

#[test]
fn establish_wraps_the_card_into_a_secure_channel() {
    let session = Bpace::new(ScriptedCard::new(), CardProfile::national_id());
    let mut key_agreement = ScriptedKeyAgreement::new();
    let mut rng = EchoRng::new();

    let channel = session
        .establish(PASSWORD, PasswordKind::Can, &mut key_agreement, &mut rng)
        .unwrap();
    assert!(!channel.is_poisoned());
}

#[test]
fn retry_warning_during_initialization_is_accepted() {
    let mut card = ScriptedCard::new();
    card.initialize_sw = [0x63, 0xC2];
    let mut session = Bpace::new(card, CardProfile::national_id());
    let mut key_agreement = ScriptedKeyAgreement::new();
    let mut rng = EchoRng::new();

    let result = session.authorize(PASSWORD, PasswordKind::Can, &mut key_agreement, &mut rng);
    assert!(result.is_ok());
    assert_eq!(session.state(), State::Authenticated);
}

#[test]
fn status_failure_marks_the_session_failed() {
    let mut card = ScriptedCard::new();
    card.message1_sw = [0x6A, 0x82];
    let mut session = Bpace::new(card, CardProfile::national_id());
    let mut key_agreement = ScriptedKeyAgreement::new();
    let mut rng = EchoRng::new();

    let result = session.authorize(PASSWORD, PasswordKind::Can, &mut key_agreement, &mut rng);
    match result {
        Err(CommunicationError::Bpace(BpaceError::OperationFailed { response, .. })) => {
            assert_eq!(response.trailer.to_word(), 0x6A82);
        },
        other => panic!("expected OperationFailed, got {:?}", other),
    }
    assert_eq!(session.state(), State::Failed);
}

#[test]
fn wrong_card_token_fails_authentication() {
    let mut card = ScriptedCard::new();
    card.token = [0x00; 8];
    let mut session = Bpace::new(card, CardProfile::national_id());
    let mut key_agreement = ScriptedKeyAgreement::new();
    let mut rng = EchoRng::new();

    let result = session.authorize(PASSWORD, PasswordKind::Can, &mut key_agreement, &mut rng);
    assert!(matches!(
        result,
        Err(CommunicationError::Bpace(BpaceError::AuthenticationFailed)),
    ));
    assert_eq!(session.state(), State::Failed);
}

#[test]
fn overlong_password_is_rejected_before_any_card_traffic() {
    let mut session = Bpace::new(ScriptedCard::new(), CardProfile::national_id());
    let mut key_agreement = ScriptedKeyAgreement::new();
    let mut rng = EchoRng::new();

    let result = session.authorize(&[0x30; 17], PasswordKind::Pin, &mut key_agreement, &mut rng);
    assert!(matches!(
        result,
        Err(CommunicationError::Bpace(BpaceError::PasswordTooLong { .. })),
    ));
    assert_eq!(session.state(), State::Failed);
    assert_eq!(session.into_card().exchanges, 0);
}
