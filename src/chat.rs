//! Certificate holder authorization templates.
//!
//! A CHAT declares which card application the terminal wants to talk to and
//! which access rights it requests there. The card evaluates the template
//! during connection establishment; afterwards it is immutable.


/// The two-byte application-class tag that opens every encoded template.
pub const CHAT_TAG: [u8; 2] = [0x7F, 0x4C];


/// An authorization template for one card application.
///
/// Both byte sequences are stored exactly as supplied; the card profile is
/// the authority on their layout.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct AccessTemplate {
    object_id: Vec<u8>,
    access_rights: Vec<u8>,
}
impl AccessTemplate {
    pub fn new(object_id: impl Into<Vec<u8>>, access_rights: impl Into<Vec<u8>>) -> Self {
        Self {
            object_id: object_id.into(),
            access_rights: access_rights.into(),
        }
    }

    /// The object identifier naming the application, tag and length included.
    pub fn object_id(&self) -> &[u8] {
        &self.object_id
    }

    /// The discretionary access-rights bytes.
    pub fn access_rights(&self) -> &[u8] {
        &self.access_rights
    }

    /// Encode the template as `0x7F 0x4C <len> || object id || rights`.
    ///
    /// Deterministic for given inputs; templates are short enough that the
    /// length always fits the single-byte form.
    pub fn encode(&self) -> Vec<u8> {
        let content_length = self.object_id.len() + self.access_rights.len();
        let mut output = Vec::with_capacity(3 + content_length);
        output.extend_from_slice(&CHAT_TAG);
        crate::der_util::encode_primitive_length(&mut output, content_length);
        output.extend_from_slice(&self.object_id);
        output.extend_from_slice(&self.access_rights);
        output
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn encoding_is_deterministic() {
        let oid = hex!("06 0A 2A 70 00 02 00 22 65 4F 06 01");
        let rights = hex!("00 33 6F 7B 10");
        let first = AccessTemplate::new(oid, rights).encode();
        let second = AccessTemplate::new(oid, rights).encode();
        assert_eq!(first, second);
    }

    #[test]
    fn encoding_starts_with_chat_tag() {
        let template = AccessTemplate::new(vec![0x06, 0x01, 0x2A], vec![0xFF]);
        let encoded = template.encode();
        assert_eq!(&encoded[..2], &[0x7F, 0x4C]);
        assert_eq!(encoded[2], 4);
        assert_eq!(&encoded[3..], &[0x06, 0x01, 0x2A, 0xFF]);
    }

    #[test]
    fn stores_sequences_unchanged() {
        let template = AccessTemplate::new(vec![1, 2, 3], vec![4, 5]);
        assert_eq!(template.object_id(), &[1, 2, 3]);
        assert_eq!(template.access_rights(), &[4, 5]);
    }
}
