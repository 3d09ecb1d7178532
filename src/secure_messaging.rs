//! Secure messaging on top of an authenticated session.
//!
//! Once BPACE has produced session keys, every command is wrapped into the
//! ISO/IEC 7816-4 secure messaging data objects: the command data encrypted
//! in CBC mode into DO`87`, the expected length in DO`97`, and a truncated
//! CMAC over the whole frame in DO`8E`. Responses are verified MAC-first
//! before anything is decrypted; a response that fails verification poisons
//! the channel for good.


use std::fmt;

use belt_block::BeltBlock;
use cipher::block_padding::NoPadding;
use cipher::generic_array::GenericArray;
use cipher::{BlockDecryptMut, BlockEncrypt, BlockEncryptMut, KeyInit, KeyIvInit};
use cmac::{Cmac, Mac};
use subtle::ConstantTimeEq;
use tracing::trace;
use zeroize::Zeroizing;
use zeroize_derive::ZeroizeOnDrop;

use crate::bpace::primitive::SessionKeys;
use crate::der_util;
use crate::iso7816::apdu::{Apdu, CommandHeader, Data, Response, ResponseTrailer, MAX_SHORT_DATA};
use crate::iso7816::card::{CommunicationError, SmartCard};


const BLOCK_SIZE: usize = 16;
const MAC_LEN: usize = 8;
/// Class byte bits marking a command as secure-messaging protected.
const CLA_SECURE: u8 = 0x04;


#[derive(Debug)]
pub enum Error {
    /// A block cipher or MAC primitive rejected its input.
    Cipher,
    /// The send counter has run out; the channel cannot be used again.
    CounterExhausted,
    /// An earlier response failed verification; the channel refuses all
    /// further traffic.
    ChannelPoisoned,
    /// The response body is not a well-formed sequence of data objects.
    /// The whole frame is MAC protected, so a frame that does not even
    /// parse counts as an integrity failure.
    ResponseTlvFormat,
    /// The response carries no DO`8E` MAC object.
    MissingResponseMac,
    /// The response carries no DO`99` status object.
    MissingResponseStatus,
    /// The DO`99` status object has the wrong length.
    StatusLength { obtained: usize },
    /// The response MAC does not match.
    ResponseMac,
    /// The cryptogram announces a padding scheme other than the one
    /// supported here.
    UnknownPadding { padding_mode: u8 },
    /// The decrypted cryptogram does not end in valid padding.
    InvalidPadding,
}
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cipher
                => write!(f, "block cipher operation failed"),
            Self::CounterExhausted
                => write!(f, "send sequence counter exhausted"),
            Self::ChannelPoisoned
                => write!(f, "channel poisoned by an earlier verification failure"),
            Self::ResponseTlvFormat
                => write!(f, "response is not a well-formed sequence of data objects"),
            Self::MissingResponseMac
                => write!(f, "response carries no MAC data object"),
            Self::MissingResponseStatus
                => write!(f, "response carries no status data object"),
            Self::StatusLength { obtained }
                => write!(f, "status data object is {} bytes long, expected 2 bytes", obtained),
            Self::ResponseMac
                => write!(f, "response MAC verification failed"),
            Self::UnknownPadding { padding_mode }
                => write!(f, "unknown padding mode 0x{:02X}", padding_mode),
            Self::InvalidPadding
                => write!(f, "decrypted cryptogram has invalid padding"),
        }
    }
}
impl std::error::Error for Error {
}


/// Append `0x80` and as many `0x00` as needed to reach a block boundary.
fn pad_to_block(buf: &mut Vec<u8>) {
    buf.push(0x80);
    while buf.len() % BLOCK_SIZE != 0 {
        buf.push(0x00);
    }
}

/// Strip the `0x80 0x00...` padding again.
fn unpad(buf: &[u8]) -> Result<Vec<u8>, Error> {
    let mut end = buf.len();
    while end > 0 && buf[end - 1] == 0x00 {
        end -= 1;
    }
    if end == 0 || buf[end - 1] != 0x80 {
        return Err(Error::InvalidPadding);
    }
    Ok(buf[..end - 1].to_vec())
}


struct DataObject<'d> {
    tag: u8,
    /// The complete node, tag and length bytes included.
    raw: &'d [u8],
    value: &'d [u8],
}

fn split_data_objects(mut input: &[u8]) -> Result<Vec<DataObject<'_>>, Error> {
    let mut objects = Vec::new();
    while !input.is_empty() {
        let tag = input[0];
        // this profile only ever carries single-byte DO tags; a high tag
        // number form must not have its second tag byte misread as a length
        if tag & 0b0001_1111 == 0b0001_1111 {
            return Err(Error::ResponseTlvFormat);
        }
        let (length, after_length) = der_util::try_decode_primitive_length(&input[1..])
            .ok_or(Error::ResponseTlvFormat)?;
        if length > after_length.len() {
            return Err(Error::ResponseTlvFormat);
        }
        let header_len = input.len() - after_length.len();
        let node_len = header_len + length;
        objects.push(DataObject {
            tag,
            raw: &input[..node_len],
            value: &after_length[..length],
        });
        input = &input[node_len..];
    }
    Ok(objects)
}


/// An authenticated, encrypting wrapper around a card.
///
/// The channel owns the card and the session keys; both the encryption key
/// and the MAC key are wiped on drop. The send sequence counter covers the
/// command and the response of each exchange with distinct values, so a
/// replayed response never verifies.
#[derive(ZeroizeOnDrop)]
pub struct SecureChannel<SC: SmartCard> {
    #[zeroize(skip)]
    card: SC,
    k_enc: [u8; 32],
    k_mac: [u8; 32],
    #[zeroize(skip)]
    send_counter: u64,
    #[zeroize(skip)]
    poisoned: bool,
}
impl<SC: SmartCard> SecureChannel<SC> {
    pub fn new(card: SC, keys: SessionKeys) -> Self {
        Self {
            card,
            k_enc: keys.enc,
            k_mac: keys.mac,
            send_counter: 0,
            poisoned: false,
        }
    }

    /// Whether a verification failure has shut the channel down.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    fn next_counter(&mut self) -> Result<u64, Error> {
        let next = self.send_counter.checked_add(1)
            .ok_or(Error::CounterExhausted)?;
        self.send_counter = next;
        Ok(next)
    }

    /// The per-frame initialization vector: the counter, big-endian in the
    /// low half of a zero block, encrypted with the session encryption key.
    fn derive_iv(&self, counter: u64) -> [u8; BLOCK_SIZE] {
        let mut block = [0u8; BLOCK_SIZE];
        block[BLOCK_SIZE - 8..].copy_from_slice(&counter.to_be_bytes());
        let cipher = BeltBlock::new(GenericArray::from_slice(&self.k_enc));
        cipher.encrypt_block(GenericArray::from_mut_slice(&mut block));
        block
    }

    /// CBC-encrypt `buf` in place; the caller has already padded it.
    fn encrypt(&self, iv: &[u8; BLOCK_SIZE], buf: &mut [u8]) -> Result<(), Error> {
        let len = buf.len();
        let encryptor = cbc::Encryptor::<BeltBlock>::new_from_slices(&self.k_enc, iv)
            .map_err(|_| Error::Cipher)?;
        encryptor.encrypt_padded_mut::<NoPadding>(buf, len)
            .map_err(|_| Error::Cipher)?;
        Ok(())
    }

    fn decrypt(&self, iv: &[u8; BLOCK_SIZE], buf: &mut [u8]) -> Result<(), Error> {
        let decryptor = cbc::Decryptor::<BeltBlock>::new_from_slices(&self.k_enc, iv)
            .map_err(|_| Error::Cipher)?;
        decryptor.decrypt_padded_mut::<NoPadding>(buf)
            .map_err(|_| Error::Cipher)?;
        Ok(())
    }

    fn compute_mac(&self, data: &[u8]) -> Result<[u8; MAC_LEN], Error> {
        let mut mac = <Cmac<BeltBlock> as Mac>::new_from_slice(&self.k_mac)
            .map_err(|_| Error::Cipher)?;
        mac.update(data);
        let tag = mac.finalize().into_bytes();
        let mut truncated = [0u8; MAC_LEN];
        truncated.copy_from_slice(&tag[..MAC_LEN]);
        Ok(truncated)
    }

    /// Wrap a plaintext command into its secure messaging form.
    pub fn wrap(&mut self, request: &Apdu) -> Result<Apdu, Error> {
        if self.poisoned {
            return Err(Error::ChannelPoisoned);
        }
        let counter = self.next_counter()?;
        let iv = self.derive_iv(counter);

        let header = CommandHeader {
            cla: request.header.cla | CLA_SECURE,
            ins: request.header.ins,
            p1: request.header.p1,
            p2: request.header.p2,
        };

        let cryptogram_do = match request.data.request_data() {
            Some(data) => {
                let mut plain = Zeroizing::new(data.to_vec());
                pad_to_block(&mut plain);
                self.encrypt(&iv, &mut plain)?;
                let mut node = vec![0x87];
                der_util::encode_primitive_length(&mut node, plain.len() + 1);
                // padding mode indicator, then the ciphertext
                node.push(0x01);
                node.extend_from_slice(&plain);
                Some(node)
            },
            None => None,
        };
        let length_do: Option<Vec<u8>> = match &request.data {
            Data::ResponseDataShort { response_data_length }
            | Data::BothDataShort { response_data_length, .. } => {
                Some(vec![0x97, 0x01, *response_data_length])
            },
            Data::ResponseDataExtended { response_data_length }
            | Data::BothDataExtended { response_data_length, .. } => {
                let bytes = response_data_length.to_be_bytes();
                Some(vec![0x97, 0x02, bytes[0], bytes[1]])
            },
            _ => None,
        };

        let mut mac_input = Vec::with_capacity(BLOCK_SIZE * 2);
        mac_input.extend_from_slice(&iv);
        mac_input.extend_from_slice(&header.to_bytes());
        pad_to_block(&mut mac_input);
        if let Some(node) = &cryptogram_do {
            mac_input.extend_from_slice(node);
        }
        if let Some(node) = &length_do {
            mac_input.extend_from_slice(node);
        }
        pad_to_block(&mut mac_input);
        let mac = self.compute_mac(&mac_input)?;

        let mut body = Vec::new();
        if let Some(node) = cryptogram_do {
            body.extend_from_slice(&node);
        }
        if let Some(node) = length_do {
            body.extend_from_slice(&node);
        }
        body.extend_from_slice(&[0x8E, MAC_LEN as u8]);
        body.extend_from_slice(&mac);

        trace!(counter, len = body.len(), "wrapped command");

        // a wrapped command always expects a wrapped response
        let data = if body.len() <= MAX_SHORT_DATA {
            Data::BothDataShort { request_data: body, response_data_length: 0 }
        } else {
            Data::BothDataExtended { request_data: body, response_data_length: 0 }
        };
        Ok(Apdu { header, data })
    }

    /// Verify and decrypt a secure messaging response.
    ///
    /// The MAC is checked before the status or the cryptogram are even
    /// looked at; any failure up to and including that check (a frame that
    /// does not parse, a missing MAC, a MAC mismatch) poisons the channel
    /// and every later call fails with [`Error::ChannelPoisoned`].
    pub fn unwrap(&mut self, response: &Response) -> Result<Response, Error> {
        if self.poisoned {
            return Err(Error::ChannelPoisoned);
        }
        let counter = self.next_counter()?;
        let iv = self.derive_iv(counter);

        let objects = match split_data_objects(&response.data) {
            Ok(objects) => objects,
            Err(e) => {
                self.poisoned = true;
                return Err(e);
            },
        };

        let mut mac_input = Vec::with_capacity(BLOCK_SIZE + response.data.len());
        mac_input.extend_from_slice(&iv);
        for object in &objects {
            // objects with an odd tag are covered by the MAC
            if object.tag & 0x01 == 0x01 {
                mac_input.extend_from_slice(object.raw);
            }
        }
        pad_to_block(&mut mac_input);
        let expected = self.compute_mac(&mac_input)?;

        let Some(mac_do) = objects.iter().find(|o| o.tag == 0x8E) else {
            self.poisoned = true;
            return Err(Error::MissingResponseMac);
        };
        if mac_do.value.ct_eq(&expected).unwrap_u8() != 1 {
            self.poisoned = true;
            return Err(Error::ResponseMac);
        }

        let Some(status_do) = objects.iter().find(|o| o.tag == 0x99) else {
            return Err(Error::MissingResponseStatus);
        };
        if status_do.value.len() != 2 {
            return Err(Error::StatusLength { obtained: status_do.value.len() });
        }
        let trailer = ResponseTrailer::new(status_do.value[0], status_do.value[1]);

        let data = match objects.iter().find(|o| o.tag == 0x87) {
            Some(cryptogram_do) => {
                let Some((&padding_mode, ciphertext)) = cryptogram_do.value.split_first() else {
                    return Err(Error::ResponseTlvFormat);
                };
                if padding_mode != 0x01 {
                    return Err(Error::UnknownPadding { padding_mode });
                }
                let mut buf = Zeroizing::new(ciphertext.to_vec());
                self.decrypt(&iv, &mut buf)?;
                unpad(&buf)?
            },
            None => Vec::new(),
        };

        trace!(counter, len = data.len(), "unwrapped response");
        Ok(Response { data, trailer })
    }
}
impl<SC: SmartCard> SmartCard for SecureChannel<SC> {
    fn communicate(&mut self, request: &Apdu) -> Result<Response, CommunicationError> {
        let wrapped = self.wrap(request)?;
        let raw = self.card.communicate(&wrapped)?;
        Ok(self.unwrap(&raw)?)
    }

    fn is_card_present(&mut self) -> bool {
        self.card.is_card_present()
    }
}
