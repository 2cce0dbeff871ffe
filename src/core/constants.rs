//! Protocol sentinels and message-size limits

/// Answer the modem sends when a command succeeds
pub const DEFAULT_ANSWER: &str = "OK";

/// Unsolicited line signalling the modem is ready to handle SMS traffic
pub const READY_SENTINEL: &str = "SMS Ready";

/// Unsolicited line prefix announcing an inbound message (PDU follows on the next line)
pub const INBOUND_INDICATOR: &str = "+CMT: ";

/// Prefix of the service-center-address query answer
pub const SCA_INDICATOR: &str = "+CSCA:";

/// Modem-reported message-service error marker
pub const CMS_ERROR: &str = "+CMS ERROR";

/// Modem-reported equipment error marker
pub const CME_ERROR: &str = "+CME ERROR";

/// Confirmation prefix after a submitted message is accepted
pub const SEND_CONFIRMATION: &str = "+CMGS:";

/// Continuation prompt printed by the modem while it waits for PDU data.
/// Never followed by a line feed, so it is matched character by character.
pub const SEND_PROMPT: &str = ">";

/// End-of-data byte terminating a PDU submission (Ctrl+Z)
pub const END_OF_DATA: u8 = 0x1a;

/// Command line terminator
pub const COMMAND_TERMINATOR: u8 = b'\r';

/// Maximum septets in a single-part GSM-7 message
pub const GSM7_SINGLE_LIMIT: usize = 160;

/// Maximum septets per chunk of a multipart GSM-7 message
pub const GSM7_CHUNK_LIMIT: usize = 152;

/// Maximum characters in a single-part UCS-2 message
pub const UCS2_SINGLE_LIMIT: usize = 70;

/// Maximum characters per chunk of a multipart UCS-2 message
pub const UCS2_CHUNK_LIMIT: usize = 67;
