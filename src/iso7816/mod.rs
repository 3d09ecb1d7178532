//! ISO/IEC 7816 command and response structures and the card boundary.


pub mod apdu;
pub mod card;
