//! DLMS/COSEM (IEC 62056) support: the data-type decoder, APDU dispatch,
//! the OBIS registry and the client-side builders the poller uses.

pub mod apdu;
pub mod client;
pub mod obis;
pub mod value;
