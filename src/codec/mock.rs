//! Mock codec for tests and development

use crate::codec::{CodecError, CodecResult, InboundSms, OutboundPdu, PartInfo, SmsCodec};
use std::collections::VecDeque;

/// Scripted codec
///
/// Encode calls are recorded and answered with a synthetic payload;
/// decode answers come from a queue loaded by the test.
pub struct MockCodec {
    encoded: Vec<EncodeCall>,
    decode_queue: VecDeque<CodecResult<InboundSms>>,
    service_center: Option<String>,
    fail_encode: bool,
}

/// One recorded encode request
#[derive(Debug, Clone, PartialEq)]
pub struct EncodeCall {
    pub number: String,
    pub text: String,
    pub part: PartInfo,
}

impl MockCodec {
    pub fn new() -> Self {
        Self {
            encoded: Vec::new(),
            decode_queue: VecDeque::new(),
            service_center: None,
            fail_encode: false,
        }
    }

    /// Make every subsequent encode call fail
    pub fn fail_encode(&mut self) {
        self.fail_encode = true;
    }

    /// Queue the outcome of the next decode call
    pub fn push_decode(&mut self, outcome: CodecResult<InboundSms>) {
        self.decode_queue.push_back(outcome);
    }

    /// Every encode request made by the engine, in order
    pub fn encode_calls(&self) -> &[EncodeCall] {
        &self.encoded
    }

    /// Address handed over during initialization, if any
    pub fn service_center(&self) -> Option<&str> {
        self.service_center.as_deref()
    }
}

impl Default for MockCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl SmsCodec for MockCodec {
    fn encode(&mut self, number: &str, text: &str, part: &PartInfo) -> CodecResult<OutboundPdu> {
        if self.fail_encode {
            return Err(CodecError::Encode {
                details: "scripted failure".to_string(),
            });
        }
        self.encoded.push(EncodeCall {
            number: number.to_string(),
            text: text.to_string(),
            part: *part,
        });
        Ok(OutboundPdu {
            payload: format!("PDU#{}", self.encoded.len()),
            tpdu_len: text.chars().count() + 14,
        })
    }

    fn decode(&mut self, line: &str) -> CodecResult<InboundSms> {
        self.decode_queue
            .pop_front()
            .unwrap_or_else(|| {
                Err(CodecError::Decode {
                    details: format!("no scripted answer for: {}", line),
                })
            })
    }

    fn set_service_center(&mut self, address: &str) -> CodecResult<()> {
        if address.is_empty() {
            return Err(CodecError::InvalidAddress {
                address: address.to_string(),
            });
        }
        self.service_center = Some(address.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_calls_are_recorded_in_order() {
        let mut codec = MockCodec::new();
        codec.encode("+336123", "hello", &PartInfo::single()).unwrap();
        let part = PartInfo {
            reference: 1,
            count: 2,
            index: 1,
        };
        codec.encode("+336123", "world", &part).unwrap();
        assert_eq!(codec.encode_calls().len(), 2);
        assert_eq!(codec.encode_calls()[1].part.index, 1);
    }

    #[test]
    fn unscripted_decode_fails() {
        let mut codec = MockCodec::new();
        assert!(codec.decode("07913396").is_err());
    }

    #[test]
    fn scripted_decode_comes_back() {
        let mut codec = MockCodec::new();
        codec.push_decode(Ok(InboundSms {
            sender: "+336".to_string(),
            timestamp: "24/08/31".to_string(),
            text: "hi".to_string(),
            truncated: false,
        }));
        assert_eq!(codec.decode("07913396").unwrap().text, "hi");
    }
}
