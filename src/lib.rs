//! Terminal-side access to eID cards protected by the BPACE protocol.
//!
//! The crate is layered bottom-up: [`der_util`] handles the small TLV subset
//! the protocol transports, [`chat`] builds the authorization templates,
//! [`iso7816`] frames commands and responses and abstracts the card reader,
//! [`bpace`] runs the password-authenticated key agreement, and
//! [`secure_messaging`] wraps the authenticated session.


pub mod bpace;
pub mod chat;
pub mod der_util;
pub mod iso7816;
pub mod secure_messaging;
