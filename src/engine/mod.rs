//! Asynchronous command/response engine
//!
//! [`ModemEngine`] owns the whole modem session: the answer accumulator,
//! the single in-flight command, the initialization pipeline, speed
//! probing, inbound message capture and outbound chunked sends. Nothing
//! in here blocks; the host loop calls [`poll`](ModemEngine::poll) at a
//! sub-second cadence and every operation makes progress only there or
//! in the command-issuing calls invoked from it.

pub mod answer;
pub mod step;

pub use answer::{AnswerBuffer, Push};
pub use step::Step;

use crate::codec::{CodecError, PartInfo, SmsCodec};
use crate::core::clock::{Clock, MonotonicClock};
use crate::core::constants::{
    CME_ERROR, CMS_ERROR, COMMAND_TERMINATOR, DEFAULT_ANSWER, END_OF_DATA, INBOUND_INDICATOR,
    READY_SENTINEL, SCA_INDICATOR, SEND_CONFIRMATION, SEND_PROMPT,
};
use crate::core::types::{
    EngineConfig, RestartReason, RestartStatus, SessionCounters, SessionState, SmsRecord,
};
use crate::hardware::{LinkResult, ModemLink};
use crate::sms::{self, SmsEncoding};
use std::fmt;
use std::ops::Range;

/// Callback invoked for each decoded inbound message:
/// (storage index, sender number, network timestamp, text)
pub type SmsCallback = Box<dyn FnMut(u32, &str, &str, &str)>;

/// Callback invoked for answer lines the engine does not consume
pub type LineCallback = Box<dyn FnMut(&str)>;

/// Errors returned when a caller request cannot be accepted
#[derive(Debug, Clone, PartialEq)]
pub enum RequestError {
    /// Another exchange is in flight; at most one command and one
    /// outbound job exist at a time
    Busy,
    /// The codec rejected the first chunk of the message
    Encode(CodecError),
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestError::Busy => write!(f, "Engine is busy with another exchange"),
            RequestError::Encode(e) => write!(f, "Send rejected: {}", e),
        }
    }
}

impl std::error::Error for RequestError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RequestError::Busy => None,
            RequestError::Encode(e) => Some(e),
        }
    }
}

/// The single in-flight command
struct PendingCommand {
    /// Text as written to the link, for diagnostics
    sent: String,
    /// Pattern ending this exchange: exact line for the default answer,
    /// substring otherwise, single character matched byte-by-byte
    expected: String,
    issued_at: u64,
    deadline: u64,
    next: Option<Step>,
}

/// An armed delay with no transmitted text
#[derive(Clone, Copy)]
struct WaitState {
    deadline: u64,
    /// Resolve early the instant the ready sentinel is observed
    until_ready: bool,
    next: Option<Step>,
}

/// Speed probe progress
struct ProbeState {
    next_candidate: usize,
    resume: Option<Step>,
}

/// One outbound message being driven chunk by chunk
struct OutboundJob {
    number: String,
    text: String,
    encoding: SmsEncoding,
    spans: Vec<Range<usize>>,
    reference: u16,
    next_chunk: usize,
}

/// How a completed line relates to the pending command
enum LineVerdict {
    Matched,
    ProtocolError,
    Unrelated,
}

/// Asynchronous SMS modem engine
///
/// Generic over the byte transport and the PDU codec so tests drive the
/// mocks and hosts plug their serial port and encoder in.
pub struct ModemEngine<L: ModemLink, C: SmsCodec> {
    link: L,
    codec: C,
    clock: Box<dyn Clock>,
    config: EngineConfig,

    state: SessionState,
    pending: Option<PendingCommand>,
    wait: Option<WaitState>,
    probe: Option<ProbeState>,
    outbound: Option<OutboundJob>,
    pending_payload: Option<String>,
    answer: AnswerBuffer,

    modem_ready: bool,
    ignore_errors: bool,
    next_line_is_message: bool,
    receive_deadline: Option<u64>,
    restart: RestartStatus,
    counters: SessionCounters,
    requested_baud: u32,
    multipart_ref: u16,

    /// Line that completed the last command, kept for continuations that
    /// parse the answer (service-center capture)
    last_line: String,
    /// Whether the last command completed by match rather than deadline
    last_matched_ok: bool,

    last_received: Option<SmsRecord>,
    last_sent: Option<SmsRecord>,
    sms_callback: Option<SmsCallback>,
    line_callback: Option<LineCallback>,
}

impl<L: ModemLink, C: SmsCodec> ModemEngine<L, C> {
    /// Create an engine over the given link and codec
    pub fn new(link: L, codec: C, config: EngineConfig) -> Self {
        Self::with_clock(link, codec, config, Box::new(MonotonicClock::new()))
    }

    /// Create an engine with an explicit time source
    pub fn with_clock(link: L, codec: C, config: EngineConfig, clock: Box<dyn Clock>) -> Self {
        let max_answer_len = config.max_answer_len;
        Self {
            link,
            codec,
            clock,
            config,
            state: SessionState::Starting,
            pending: None,
            wait: None,
            probe: None,
            outbound: None,
            pending_payload: None,
            answer: AnswerBuffer::new(max_answer_len),
            modem_ready: false,
            ignore_errors: false,
            next_line_is_message: false,
            receive_deadline: None,
            restart: RestartStatus::default(),
            counters: SessionCounters::default(),
            requested_baud: 0,
            multipart_ref: 0,
            last_line: String::new(),
            last_matched_ok: false,
            last_received: None,
            last_sent: None,
            sms_callback: None,
            line_callback: None,
        }
    }

    // ----- session control -----

    /// Open the link and start speed probing followed by the
    /// initialization pipeline. Asynchronous: completion is observed
    /// through [`is_idle`](Self::is_idle) while the host keeps polling.
    pub fn begin(&mut self, baud: u32) -> LinkResult<()> {
        tracing::info!(baud, "starting modem session");
        self.requested_baud = baud;
        self.restart = RestartStatus::default();
        self.modem_ready = false;
        self.pending = None;
        self.wait = None;
        self.outbound = None;
        self.pending_payload = None;
        self.next_line_is_message = false;
        self.receive_deadline = None;
        self.answer.clear();
        self.link.open(baud)?;
        self.state = SessionState::ProbingSpeed;
        self.start_probe(Some(Step::Reset));
        Ok(())
    }

    /// Drive the engine; must be called frequently (sub-second) by the
    /// host loop
    pub fn poll(&mut self) {
        let mut consumed = false;

        while self.link.bytes_available() > 0 {
            let byte = match self.link.read_byte() {
                Some(b) => b,
                None => break,
            };

            // Single-character expected patterns match byte-by-byte:
            // the continuation prompt is never followed by a line feed
            let prompt = self.pending.as_ref().and_then(|p| {
                if p.expected.len() == 1 {
                    p.expected.bytes().next()
                } else {
                    None
                }
            });
            if prompt == Some(byte) {
                tracing::debug!("prompt matched");
                self.finish_pending(true, "");
                consumed = true;
                continue;
            }

            match self.answer.push(byte) {
                Push::Pending => {}
                Push::Overflow => {
                    if self.ignore_errors {
                        // Line noise at a mismatched speed; the deadline
                        // path moves the probe along
                        tracing::debug!("oversize answer discarded");
                    } else {
                        tracing::error!("answer exceeded buffer limit");
                        if self.pending.is_some() {
                            self.fail(RestartReason::TooLong);
                        }
                        consumed = true;
                    }
                }
                Push::Line(line) => {
                    self.handle_line(&line);
                    consumed = true;
                }
            }
        }

        let now = self.clock.now_ms();

        // Deadlines are only checked on polls where no line completed
        if !consumed {
            if self.pending.as_ref().map_or(false, |p| now >= p.deadline) {
                self.handle_command_deadline();
            } else if self.receive_deadline.map_or(false, |d| now >= d) {
                tracing::error!("inbound message body never arrived");
                let reason = if self.answer.is_empty() {
                    RestartReason::Timeout
                } else {
                    RestartReason::BadAnswer
                };
                self.fail(reason);
            }
        }

        let resolve = match &self.wait {
            Some(w) => (w.until_ready && self.modem_ready) || now >= w.deadline,
            None => false,
        };
        if resolve {
            let next = self.wait.take().and_then(|w| w.next);
            tracing::debug!("wait complete");
            self.advance(next);
        }
    }

    /// Abandon any in-flight exchange and return to idle. The modem is
    /// not notified; whatever it answers next is discarded as an
    /// unrelated line.
    pub fn force_idle(&mut self) {
        tracing::warn!("forcing idle, in-flight context discarded");
        self.wait = None;
        self.probe = None;
        self.outbound = None;
        self.pending_payload = None;
        self.next_line_is_message = false;
        self.receive_deadline = None;
        self.set_idle();
    }

    // ----- caller requests -----

    /// Queue a message for sending, chunking it as needed
    ///
    /// Returns [`RequestError::Busy`] while any exchange is in flight;
    /// one outbound job exists at a time.
    pub fn send_sms(&mut self, number: &str, text: &str) -> Result<(), RequestError> {
        if self.is_busy() {
            return Err(RequestError::Busy);
        }
        let plan = sms::plan(text);
        let reference = if plan.is_multipart() {
            self.multipart_ref = self.multipart_ref.wrapping_add(1);
            self.multipart_ref
        } else {
            0
        };
        tracing::debug!(
            number,
            chunks = plan.chunk_count(),
            encoding = ?plan.encoding,
            reference,
            "sending message"
        );
        self.outbound = Some(OutboundJob {
            number: number.to_string(),
            text: text.to_string(),
            encoding: plan.encoding,
            spans: plan.spans,
            reference,
            next_chunk: 0,
        });
        self.state = SessionState::Sending;
        self.submit_chunk().map_err(|e| {
            tracing::error!(error = %e, number, "encode failed, send rejected");
            self.outbound = None;
            self.set_idle();
            RequestError::Encode(e)
        })
    }

    /// Delete messages from modem storage (`AT+CMGD` index and flag)
    pub fn delete_message(&mut self, index: u32, flag: u32) -> Result<(), RequestError> {
        if self.is_busy() {
            return Err(RequestError::Busy);
        }
        self.issue_delete(index, flag);
        Ok(())
    }

    /// Send an out-of-band command for debugging; the answer is
    /// discarded (or routed to the line callback)
    pub fn send_raw_command(&mut self, text: &str) -> Result<(), RequestError> {
        if self.is_busy() {
            return Err(RequestError::Busy);
        }
        let timeout = self.config.command_timeout_ms;
        self.submit(text, None, DEFAULT_ANSWER, timeout);
        self.pending = None;
        Ok(())
    }

    /// Send a single raw byte for debugging; the answer is discarded
    pub fn send_raw_byte(&mut self, byte: u8) -> Result<(), RequestError> {
        if self.is_busy() {
            return Err(RequestError::Busy);
        }
        let timeout = self.config.command_timeout_ms;
        self.submit_byte(byte, None, DEFAULT_ANSWER, timeout);
        self.pending = None;
        Ok(())
    }

    // ----- callbacks -----

    /// Register the inbound-message callback
    pub fn register_sms_callback<F>(&mut self, callback: F)
    where
        F: FnMut(u32, &str, &str, &str) + 'static,
    {
        self.sms_callback = Some(Box::new(callback));
    }

    /// Register the callback for lines the engine does not consume
    pub fn register_line_callback<F>(&mut self, callback: F)
    where
        F: FnMut(&str) + 'static,
    {
        self.line_callback = Some(Box::new(callback));
    }

    // ----- status -----

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_idle(&self) -> bool {
        self.state == SessionState::Idle
    }

    pub fn is_sending(&self) -> bool {
        self.state == SessionState::Sending
    }

    pub fn is_receiving(&self) -> bool {
        self.state == SessionState::Receiving
    }

    pub fn needs_restart(&self) -> bool {
        self.restart.needed
    }

    pub fn restart_reason(&self) -> Option<RestartReason> {
        self.restart.reason
    }

    /// Clear the restart flag after the caller handled it
    pub fn clear_restart(&mut self) {
        self.restart = RestartStatus::default();
    }

    /// Force the restart flag to a given value, keeping the reason
    pub fn set_restart(&mut self, needed: bool) {
        self.restart.needed = needed;
    }

    pub fn counters(&self) -> SessionCounters {
        self.counters
    }

    /// Most recent decoded inbound message, overwritten per message
    pub fn last_received(&self) -> Option<&SmsRecord> {
        self.last_received.as_ref()
    }

    /// Most recent fully-confirmed outbound message
    pub fn last_sent(&self) -> Option<&SmsRecord> {
        self.last_sent.as_ref()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    pub fn codec_mut(&mut self) -> &mut C {
        &mut self.codec
    }

    /// Dump the engine internals at info level
    pub fn debug_state(&self) {
        tracing::info!(
            state = ?self.state,
            pending = self.pending.as_ref().map(|p| p.sent.as_str()).unwrap_or(""),
            expected = self.pending.as_ref().map(|p| p.expected.as_str()).unwrap_or(""),
            modem_ready = self.modem_ready,
            ignore_errors = self.ignore_errors,
            restart_needed = self.restart.needed,
            restart_reason = ?self.restart.reason,
            commands = self.counters.commands,
            resets = self.counters.resets,
            restarts = self.counters.restarts,
            messages_read = self.counters.messages_read,
            messages_forwarded = self.counters.messages_forwarded,
            messages_sent = self.counters.messages_sent,
            "engine state"
        );
    }

    // ----- line handling -----

    fn handle_line(&mut self, line: &str) {
        if !self.modem_ready && line.contains(READY_SENTINEL) {
            tracing::debug!("modem ready sentinel seen");
            self.modem_ready = true;
            return;
        }

        if self.pending.is_some() {
            match self.judge_line(line) {
                LineVerdict::Matched => {
                    if let Some(p) = &self.pending {
                        let elapsed = self.clock.now_ms().saturating_sub(p.issued_at);
                        tracing::debug!(elapsed_ms = elapsed, answer = line, "answer matched");
                    }
                    self.finish_pending(true, line);
                    return;
                }
                LineVerdict::ProtocolError => {
                    if let Some(p) = &self.pending {
                        tracing::error!(answer = line, command = %p.sent, "modem reported error");
                    }
                    self.fail(RestartReason::ProtocolError);
                    return;
                }
                LineVerdict::Unrelated => {}
            }
        }

        if line.is_empty() {
            return;
        }

        if self.next_line_is_message {
            self.next_line_is_message = false;
            self.receive_deadline = None;
            self.handle_message_body(line);
            return;
        }

        if line.contains(INBOUND_INDICATOR) {
            tracing::debug!(indicator = line, "inbound message announced");
            self.counters.messages_read += 1;
            self.next_line_is_message = true;
            self.state = SessionState::Receiving;
            self.receive_deadline = Some(self.clock.now_ms() + self.config.receive_timeout_ms);
            return;
        }

        if let Some(callback) = &mut self.line_callback {
            callback(line);
        } else {
            tracing::debug!(line, "ignoring line");
        }
    }

    fn judge_line(&self, line: &str) -> LineVerdict {
        let p = match &self.pending {
            Some(p) => p,
            None => return LineVerdict::Unrelated,
        };
        let matched = if p.expected == DEFAULT_ANSWER {
            line == p.expected
        } else {
            line.contains(p.expected.as_str())
        };
        if matched {
            return LineVerdict::Matched;
        }
        if !self.ignore_errors && (line.contains(CMS_ERROR) || line.contains(CME_ERROR)) {
            return LineVerdict::ProtocolError;
        }
        LineVerdict::Unrelated
    }

    fn handle_command_deadline(&mut self) {
        if self.ignore_errors {
            if let Some(p) = &self.pending {
                tracing::debug!(command = %p.sent, "deadline passed, errors ignored");
            }
            self.finish_pending(false, "");
            return;
        }
        let sent = self
            .pending
            .as_ref()
            .map(|p| p.sent.clone())
            .unwrap_or_default();
        let partial = self.answer.partial();
        if partial.is_empty() {
            tracing::error!(command = %sent, "command timed out with no answer");
            self.fail(RestartReason::Timeout);
        } else {
            tracing::error!(command = %sent, partial = %partial, "partial answer at deadline");
            self.fail(RestartReason::BadAnswer);
        }
    }

    fn handle_message_body(&mut self, line: &str) {
        match self.codec.decode(line) {
            Ok(inbound) => {
                if inbound.truncated {
                    tracing::warn!("decode overflow, partial text only");
                }
                self.counters.messages_forwarded += 1;
                tracing::debug!(
                    sender = %inbound.sender,
                    timestamp = %inbound.timestamp,
                    "inbound message decoded"
                );
                self.last_received = Some(SmsRecord {
                    number: inbound.sender.clone(),
                    timestamp: inbound.timestamp.clone(),
                    text: inbound.text.clone(),
                });
                if let Some(callback) = &mut self.sms_callback {
                    callback(0, &inbound.sender, &inbound.timestamp, &inbound.text);
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "inbound decode failed");
            }
        }
        // Never leave a consumed message in storage, decoded or not
        self.issue_delete(1, 2);
    }

    // ----- sequencing -----

    fn finish_pending(&mut self, matched: bool, line: &str) {
        self.last_matched_ok = matched;
        self.last_line = line.to_string();
        let next = self.pending.take().and_then(|p| p.next);
        self.advance(next);
    }

    fn advance(&mut self, next: Option<Step>) {
        match next {
            Some(step) => self.dispatch(step),
            None => self.set_idle(),
        }
    }

    fn dispatch(&mut self, step: Step) {
        let command_timeout = self.config.command_timeout_ms;
        match step {
            Step::ProbeEvaluate => self.probe_evaluate(),
            Step::ProbeDone => {
                self.ignore_errors = false;
                tracing::info!(baud = ?self.link.current_baud(), "modem speed settled");
                let resume = self.probe.take().and_then(|p| p.resume);
                self.advance(resume);
            }

            Step::Reset => {
                self.state = SessionState::Initializing;
                self.counters.resets += 1;
                self.modem_ready = false;
                self.submit("AT&F", Some(Step::SetSpeed), DEFAULT_ANSWER, command_timeout);
            }
            Step::SetSpeed => {
                if self.link.current_baud() == Some(self.requested_baud) {
                    // Already at the requested speed: no no-op command
                    self.dispatch(Step::SpeedApplied);
                } else {
                    let command = format!("AT+IPR={}", self.requested_baud);
                    self.submit(&command, Some(Step::SpeedApplied), DEFAULT_ANSWER, command_timeout);
                }
            }
            Step::SpeedApplied => {
                if self.link.current_baud() == Some(self.requested_baud) {
                    self.dispatch(Step::EchoOff);
                } else if let Err(e) = self.link.reopen(self.requested_baud) {
                    tracing::error!(error = %e, "reopen at requested speed failed");
                    self.fail(RestartReason::BadAnswer);
                } else {
                    // Attention command activates the new speed
                    self.submit("AT", Some(Step::EchoOff), DEFAULT_ANSWER, command_timeout);
                }
            }
            Step::EchoOff => {
                self.submit("ATE0", Some(Step::VerboseErrors), DEFAULT_ANSWER, command_timeout);
            }
            Step::VerboseErrors => {
                self.submit("AT+CMEE=2", Some(Step::PduMode), DEFAULT_ANSWER, command_timeout);
            }
            Step::PduMode => {
                self.submit(
                    "AT+CMGF=0",
                    Some(Step::DetailedRegistration),
                    DEFAULT_ANSWER,
                    command_timeout,
                );
            }
            Step::DetailedRegistration => {
                self.submit("AT+CREG=2", Some(Step::AwaitReady), DEFAULT_ANSWER, command_timeout);
            }
            Step::AwaitReady => {
                if self.modem_ready {
                    tracing::debug!("ready sentinel already seen");
                    self.dispatch(Step::CallerId);
                } else {
                    let wait = self.config.ready_wait_ms;
                    self.wait_for_ready(wait, Some(Step::CallerId));
                }
            }
            Step::CallerId => {
                self.submit("AT+CLIP=1", Some(Step::IndicatorsOn), DEFAULT_ANSWER, command_timeout);
            }
            Step::IndicatorsOn => {
                self.submit(
                    "AT+CNMI=0,2,0,1,1",
                    Some(Step::HeaderDetails),
                    DEFAULT_ANSWER,
                    command_timeout,
                );
            }
            Step::HeaderDetails => {
                self.submit(
                    "AT+CSDH=1",
                    Some(Step::QueryServiceCenter),
                    DEFAULT_ANSWER,
                    command_timeout,
                );
            }
            Step::QueryServiceCenter => {
                self.submit(
                    "AT+CSCA?",
                    Some(Step::CaptureServiceCenter),
                    SCA_INDICATOR,
                    command_timeout,
                );
            }
            Step::CaptureServiceCenter => match parse_service_center(&self.last_line) {
                Some(address) => {
                    tracing::debug!(address = %address, "service center captured");
                    if let Err(e) = self.codec.set_service_center(&address) {
                        tracing::error!(error = %e, "codec rejected service center");
                        self.fail(RestartReason::BadAnswer);
                        return;
                    }
                    // The trailing OK of the same exchange is still due
                    self.submit("", Some(Step::PurgeStored), DEFAULT_ANSWER, command_timeout);
                }
                None => {
                    tracing::error!(answer = %self.last_line, "service center token missing");
                    self.fail(RestartReason::BadAnswer);
                }
            },
            Step::PurgeStored => {
                let timeout = self.config.delete_timeout_ms;
                self.submit("AT+CMGD=1,4", Some(Step::InitComplete), DEFAULT_ANSWER, timeout);
            }
            Step::InitComplete => {
                self.counters.restarts += 1;
                tracing::info!(restarts = self.counters.restarts, "modem initialized");
                self.set_idle();
            }

            Step::WritePayload => {
                let payload = self.pending_payload.take().unwrap_or_default();
                tracing::debug!(len = payload.len(), "writing PDU payload");
                self.link.write_bytes(payload.as_bytes());
                let timeout = self.config.send_confirm_timeout_ms;
                self.submit_byte(
                    END_OF_DATA,
                    Some(Step::ChunkConfirmed),
                    SEND_CONFIRMATION,
                    timeout,
                );
            }
            Step::ChunkConfirmed => {
                self.counters.messages_sent += 1;
                let finished = match &mut self.outbound {
                    Some(job) => {
                        job.next_chunk += 1;
                        job.next_chunk >= job.spans.len()
                    }
                    None => true,
                };
                if finished {
                    if let Some(job) = self.outbound.take() {
                        tracing::debug!(number = %job.number, "message fully sent");
                        self.last_sent = Some(SmsRecord {
                            number: job.number,
                            timestamp: self.clock.now_ms().to_string(),
                            text: job.text,
                        });
                    }
                    self.set_idle();
                } else if let Err(e) = self.submit_chunk() {
                    tracing::error!(error = %e, "chunk encode failed, send abandoned");
                    self.outbound = None;
                    self.set_idle();
                }
            }
        }
    }

    // ----- speed probing -----

    fn start_probe(&mut self, resume: Option<Step>) {
        self.ignore_errors = true;
        self.probe = Some(ProbeState {
            next_candidate: 0,
            resume,
        });
        let timeout = self.config.probe_timeout_ms;
        // Attention command at the current speed first
        self.submit("AT", Some(Step::ProbeEvaluate), DEFAULT_ANSWER, timeout);
    }

    fn probe_evaluate(&mut self) {
        if self.last_matched_ok {
            self.dispatch(Step::ProbeDone);
            return;
        }
        let index = match &mut self.probe {
            Some(p) => {
                let i = p.next_candidate;
                p.next_candidate += 1;
                i
            }
            None => return,
        };
        match self.config.probe_speeds.get(index).copied() {
            Some(baud) => {
                tracing::debug!(baud, "probing candidate speed");
                if let Err(e) = self.link.reopen(baud) {
                    tracing::warn!(error = %e, baud, "reopen for probe failed");
                }
                let timeout = self.config.probe_timeout_ms;
                self.submit("AT", Some(Step::ProbeEvaluate), DEFAULT_ANSWER, timeout);
            }
            None => {
                let baud = self.requested_baud;
                tracing::info!(baud, "no candidate answered, forcing requested speed");
                if let Err(e) = self.link.reopen(baud) {
                    tracing::warn!(error = %e, baud, "reopen at requested speed failed");
                }
                let timeout = self.config.command_timeout_ms;
                self.submit("AT", Some(Step::ProbeDone), DEFAULT_ANSWER, timeout);
            }
        }
    }

    // ----- outbound chunks -----

    fn submit_chunk(&mut self) -> Result<(), CodecError> {
        let (number, chunk, part) = match &self.outbound {
            Some(job) => {
                let span = job.spans[job.next_chunk].clone();
                let part = if job.spans.len() > 1 {
                    PartInfo {
                        reference: job.reference,
                        count: job.spans.len() as u8,
                        index: (job.next_chunk + 1) as u8,
                    }
                } else {
                    PartInfo::single()
                };
                (job.number.clone(), job.text[span].to_string(), part)
            }
            None => return Ok(()),
        };
        let pdu = self.codec.encode(&number, &chunk, &part)?;
        tracing::debug!(
            tpdu_len = pdu.tpdu_len,
            index = part.index,
            count = part.count,
            "chunk encoded"
        );
        self.pending_payload = Some(pdu.payload);
        let command = format!("AT+CMGS={}", pdu.tpdu_len);
        let timeout = self.config.command_timeout_ms;
        self.submit(&command, Some(Step::WritePayload), SEND_PROMPT, timeout);
        Ok(())
    }

    // ----- command primitives -----

    /// Record a pending command and transmit its text. An empty text
    /// means "just wait for the answer of a previously sent command"
    /// and keeps the answer buffer intact.
    fn submit(&mut self, text: &str, next: Option<Step>, expected: &str, timeout_ms: u64) {
        self.counters.commands += 1;
        let now = self.clock.now_ms();
        if !text.is_empty() {
            tracing::debug!(command = text, expected, "issuing command");
            self.answer.clear();
            let mut frame = Vec::with_capacity(text.len() + 1);
            frame.extend_from_slice(text.as_bytes());
            frame.push(COMMAND_TERMINATOR);
            self.link.write_bytes(&frame);
        } else {
            tracing::debug!(expected, "waiting for answer of previous command");
        }
        self.pending = Some(PendingCommand {
            sent: text.to_string(),
            expected: expected.to_string(),
            issued_at: now,
            deadline: now + timeout_ms,
            next,
        });
        self.wait = None;
    }

    /// Same contract for a single control byte, with no terminator
    fn submit_byte(&mut self, byte: u8, next: Option<Step>, expected: &str, timeout_ms: u64) {
        self.counters.commands += 1;
        let now = self.clock.now_ms();
        tracing::debug!(byte = format_args!("0x{:02x}", byte), expected, "issuing raw byte");
        self.answer.clear();
        self.link.write_bytes(&[byte]);
        self.pending = Some(PendingCommand {
            sent: format!("0x{:02x}", byte),
            expected: expected.to_string(),
            issued_at: now,
            deadline: now + timeout_ms,
            next,
        });
        self.wait = None;
    }

    /// Arm a plain delay with no transmitted text
    fn wait_for(&mut self, duration_ms: u64, next: Option<Step>) {
        let now = self.clock.now_ms();
        tracing::debug!(duration_ms, "waiting");
        self.wait = Some(WaitState {
            deadline: now + duration_ms,
            until_ready: false,
            next,
        });
        self.pending = None;
    }

    /// Arm a delay that resolves early the instant the ready sentinel
    /// is observed
    fn wait_for_ready(&mut self, duration_ms: u64, next: Option<Step>) {
        let now = self.clock.now_ms();
        tracing::debug!(duration_ms, "waiting for ready sentinel");
        self.wait = Some(WaitState {
            deadline: now + duration_ms,
            until_ready: true,
            next,
        });
        self.pending = None;
    }

    fn issue_delete(&mut self, index: u32, flag: u32) {
        let command = format!("AT+CMGD={},{}", index, flag);
        let timeout = self.config.delete_timeout_ms;
        self.submit(&command, None, DEFAULT_ANSWER, timeout);
    }

    // ----- restart policy -----

    /// Terminal failure: record the reason, abandon everything in
    /// flight and return to idle. The link itself is never restarted
    /// here; that is the caller's remediation after observing the flag.
    fn fail(&mut self, reason: RestartReason) {
        tracing::error!(%reason, "restart required");
        self.restart = RestartStatus {
            needed: true,
            reason: Some(reason),
        };
        self.pending = None;
        self.wait = None;
        self.probe = None;
        self.outbound = None;
        self.pending_payload = None;
        self.next_line_is_message = false;
        self.receive_deadline = None;
        self.set_idle();
    }

    fn set_idle(&mut self) {
        self.state = SessionState::Idle;
        self.pending = None;
        self.answer.clear();
    }

    fn is_busy(&self) -> bool {
        self.pending.is_some() || self.wait.is_some() || self.state != SessionState::Idle
    }
}

/// Pull the quoted service-center number out of a `+CSCA:` answer
fn parse_service_center(line: &str) -> Option<String> {
    if !line.contains(SCA_INDICATOR) {
        return None;
    }
    let token = line.split('"').nth(1)?;
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{InboundSms, MockCodec};
    use crate::core::clock::ManualClock;
    use crate::hardware::MockLink;
    use std::cell::RefCell;
    use std::rc::Rc;

    type TestEngine = ModemEngine<MockLink, MockCodec>;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn engine_with_clock() -> (TestEngine, ManualClock) {
        init_tracing();
        let clock = ManualClock::new();
        let engine = ModemEngine::with_clock(
            MockLink::new(),
            MockCodec::new(),
            EngineConfig::default(),
            Box::new(clock.clone()),
        );
        (engine, clock)
    }

    fn idle_engine() -> (TestEngine, ManualClock) {
        let (mut engine, clock) = engine_with_clock();
        engine.link_mut().open(115_200).unwrap();
        engine.requested_baud = 115_200;
        engine.state = SessionState::Idle;
        (engine, clock)
    }

    fn ok(engine: &mut TestEngine) {
        engine.link_mut().push_line("OK");
        engine.poll();
    }

    fn prompt(engine: &mut TestEngine) {
        engine.link_mut().push_bytes(b"> ");
        engine.poll();
    }

    fn last_write(engine: &TestEngine) -> String {
        engine.link().written_text().last().cloned().unwrap_or_default()
    }

    #[test]
    fn initialization_pipeline_runs_to_idle() {
        let (mut engine, _clock) = engine_with_clock();
        engine.begin(115_200).unwrap();
        assert_eq!(engine.state(), SessionState::ProbingSpeed);
        assert_eq!(last_write(&engine), "AT\r");

        // Modem answers at the current speed: probing settles at once
        ok(&mut engine);
        assert_eq!(engine.state(), SessionState::Initializing);
        assert_eq!(last_write(&engine), "AT&F\r");

        // Already at the requested speed: no AT+IPR, no activation AT
        ok(&mut engine);
        assert_eq!(last_write(&engine), "ATE0\r");
        ok(&mut engine);
        assert_eq!(last_write(&engine), "AT+CMEE=2\r");
        ok(&mut engine);
        assert_eq!(last_write(&engine), "AT+CMGF=0\r");
        ok(&mut engine);
        assert_eq!(last_write(&engine), "AT+CREG=2\r");

        // Ready sentinel not seen yet: the pipeline parks on a wait
        ok(&mut engine);
        assert!(engine.pending.is_none());
        assert!(engine.wait.is_some());
        engine.link_mut().push_line("SMS Ready");
        engine.poll();
        assert_eq!(last_write(&engine), "AT+CLIP=1\r");

        ok(&mut engine);
        assert_eq!(last_write(&engine), "AT+CNMI=0,2,0,1,1\r");
        ok(&mut engine);
        assert_eq!(last_write(&engine), "AT+CSDH=1\r");
        ok(&mut engine);
        assert_eq!(last_write(&engine), "AT+CSCA?\r");

        engine.link_mut().push_line("+CSCA: \"+33689004000\",145");
        engine.poll();
        // The service center went to the codec; the engine now waits for
        // the trailing OK without writing anything
        assert_eq!(engine.codec().service_center(), Some("+33689004000"));
        assert_eq!(last_write(&engine), "AT+CSCA?\r");

        ok(&mut engine);
        assert_eq!(last_write(&engine), "AT+CMGD=1,4\r");
        ok(&mut engine);

        assert!(engine.is_idle());
        assert!(!engine.needs_restart());
        assert_eq!(engine.counters().resets, 1);
        assert_eq!(engine.counters().restarts, 1);
    }

    #[test]
    fn ready_seen_early_skips_the_wait() {
        let (mut engine, _clock) = engine_with_clock();
        engine.begin(115_200).unwrap();
        ok(&mut engine); // probe
        ok(&mut engine); // AT&F
        ok(&mut engine); // ATE0
        ok(&mut engine); // AT+CMEE=2
        ok(&mut engine); // AT+CMGF=0
        engine.link_mut().push_line("SMS Ready");
        engine.poll();
        ok(&mut engine); // AT+CREG=2 -> AwaitReady skips straight on
        assert!(engine.wait.is_none());
        assert_eq!(last_write(&engine), "AT+CLIP=1\r");
    }

    #[test]
    fn probe_settles_on_the_answering_speed() {
        let (mut engine, clock) = engine_with_clock();
        engine.link_mut().answer_only_at(9_600);
        engine.begin(115_200).unwrap();

        // Initial attention at the requested speed: silence
        engine.poll();
        clock.advance(1_501);
        engine.poll();
        // Candidate 115200 is a no-op reopen, still silence
        clock.advance(1_501);
        engine.poll();
        // Candidate 9600 answers; the scripted modem acknowledges every
        // command instantly, so this poll also carries the pipeline up
        // to the speed change
        engine.poll();

        // The probe reopened exactly once, at the answering speed
        assert_eq!(engine.link().opened_at()[..2], [115_200, 9_600]);
        let writes = engine.link().written_text();
        assert_eq!(writes.iter().filter(|w| *w == "AT&F\r").count(), 1);
        // The pipeline then saw the probed 9600 and requested the
        // configured speed back
        assert!(writes.iter().any(|w| w == "AT+IPR=115200\r"));
        assert_eq!(engine.link().current_baud(), Some(115_200));
        assert!(!engine.needs_restart());
    }

    #[test]
    fn probe_noise_overflow_does_not_force_a_restart() {
        let clock = ManualClock::new();
        let mut config = EngineConfig::default();
        config.max_answer_len = 8;
        let mut engine = ModemEngine::with_clock(
            MockLink::new(),
            MockCodec::new(),
            config,
            Box::new(clock.clone()),
        );
        engine.begin(115_200).unwrap();
        // Garbage with no line feed, longer than the answer buffer
        engine.link_mut().push_bytes(b"line noise at a mismatched speed");
        engine.poll();
        assert!(!engine.needs_restart());

        // The probe just times out and tries the next candidate
        clock.advance(1_501);
        engine.poll();
        assert!(engine.pending.is_some());
        assert!(!engine.needs_restart());
    }

    #[test]
    fn exhausted_probe_forces_the_requested_speed() {
        let clock = ManualClock::new();
        let mut config = EngineConfig::default();
        config.probe_speeds = vec![9_600];
        let mut engine = ModemEngine::with_clock(
            MockLink::new(),
            MockCodec::new(),
            config,
            Box::new(clock.clone()),
        );
        engine.begin(115_200).unwrap();

        engine.poll();
        clock.advance(1_501); // initial attention times out
        engine.poll();
        clock.advance(1_501); // candidate 9600 times out
        engine.poll();

        // Forced back to the requested speed, final attention pending
        assert_eq!(engine.link().current_baud(), Some(115_200));
        clock.advance(4_001);
        engine.poll();
        // Probe errors were ignored all the way; the pipeline went on
        assert_eq!(last_write(&engine), "AT&F\r");
        assert!(!engine.needs_restart());
    }

    #[test]
    fn silence_past_the_deadline_is_a_timeout_restart() {
        let (mut engine, clock) = idle_engine();
        engine.delete_message(1, 4).unwrap();
        engine.poll();
        clock.advance(10_001);
        engine.poll();
        assert!(engine.needs_restart());
        assert_eq!(engine.restart_reason(), Some(RestartReason::Timeout));
        assert!(engine.is_idle());
    }

    #[test]
    fn partial_answer_past_the_deadline_is_a_bad_answer() {
        let (mut engine, clock) = idle_engine();
        engine.delete_message(1, 4).unwrap();
        engine.link_mut().push_bytes(b"+CMG");
        engine.poll();
        clock.advance(10_001);
        engine.poll();
        assert_eq!(engine.restart_reason(), Some(RestartReason::BadAnswer));
    }

    #[test]
    fn modem_error_answer_is_a_protocol_error() {
        let (mut engine, _clock) = idle_engine();
        engine.delete_message(1, 4).unwrap();
        engine.link_mut().push_line("+CMS ERROR: 321");
        engine.poll();
        assert!(engine.needs_restart());
        assert_eq!(engine.restart_reason(), Some(RestartReason::ProtocolError));
        assert!(engine.is_idle());
    }

    #[test]
    fn oversize_answer_is_a_too_long_restart() {
        let clock = ManualClock::new();
        let mut config = EngineConfig::default();
        config.max_answer_len = 8;
        let mut engine = ModemEngine::with_clock(
            MockLink::new(),
            MockCodec::new(),
            config,
            Box::new(clock.clone()),
        );
        engine.link_mut().open(115_200).unwrap();
        engine.state = SessionState::Idle;
        engine.delete_message(1, 4).unwrap();
        engine.link_mut().push_bytes(b"way too much noise");
        engine.poll();
        assert_eq!(engine.restart_reason(), Some(RestartReason::TooLong));
    }

    #[test]
    fn substring_pattern_matches_inside_a_longer_line() {
        let (mut engine, _clock) = idle_engine();
        engine.submit("AT+CSQ", None, "+CSQ:", 4_000);
        engine.link_mut().push_line("+CSQ: 21,0");
        engine.poll();
        assert!(engine.pending.is_none());
        assert!(engine.is_idle());
        assert!(!engine.needs_restart());
    }

    #[test]
    fn default_pattern_requires_the_exact_line() {
        let (mut engine, clock) = idle_engine();
        engine.submit("ATE0", None, DEFAULT_ANSWER, 4_000);
        engine.link_mut().push_line("NOT OK REALLY");
        engine.poll();
        assert!(engine.pending.is_some());
        clock.advance(4_001);
        engine.poll();
        assert_eq!(engine.restart_reason(), Some(RestartReason::Timeout));
    }

    #[test]
    fn unconsumed_lines_reach_the_line_callback() {
        let (mut engine, _clock) = idle_engine();
        let seen: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        engine.register_line_callback(move |line| sink.borrow_mut().push(line.to_string()));
        engine.link_mut().push_line("RING");
        engine.poll();
        assert_eq!(seen.borrow().as_slice(), &["RING".to_string()]);
    }

    #[test]
    fn inbound_message_is_decoded_forwarded_and_deleted() {
        let (mut engine, _clock) = idle_engine();
        let received: Rc<RefCell<Vec<(u32, String, String, String)>>> =
            Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&received);
        engine.register_sms_callback(move |index, number, timestamp, text| {
            sink.borrow_mut().push((
                index,
                number.to_string(),
                timestamp.to_string(),
                text.to_string(),
            ));
        });
        engine.codec_mut().push_decode(Ok(InboundSms {
            sender: "+33612345678".to_string(),
            timestamp: "24/08/31,10:00:00".to_string(),
            text: "hello there".to_string(),
            truncated: false,
        }));

        engine.link_mut().push_line("+CMT: ,33");
        engine
            .link_mut()
            .push_line("07913396050066F0040B913306672146F000");
        engine.poll();

        assert_eq!(received.borrow().len(), 1);
        assert_eq!(received.borrow()[0].1, "+33612345678");
        assert_eq!(received.borrow()[0].3, "hello there");
        assert_eq!(engine.counters().messages_read, 1);
        assert_eq!(engine.counters().messages_forwarded, 1);
        assert_eq!(
            engine.last_received().map(|r| r.number.as_str()),
            Some("+33612345678")
        );
        // Exactly one delete for the consumed message
        let deletes: Vec<String> = engine
            .link()
            .written_text()
            .into_iter()
            .filter(|w| w.starts_with("AT+CMGD="))
            .collect();
        assert_eq!(deletes, vec!["AT+CMGD=1,2\r".to_string()]);

        ok(&mut engine);
        assert!(engine.is_idle());
    }

    #[test]
    fn failed_decode_still_deletes_the_message() {
        let (mut engine, _clock) = idle_engine();
        let called = Rc::new(RefCell::new(0u32));
        let sink = Rc::clone(&called);
        engine.register_sms_callback(move |_, _, _, _| *sink.borrow_mut() += 1);
        // No scripted decode: the codec fails

        engine.link_mut().push_line("+CMT: ,33");
        engine.link_mut().push_line("garbagegarbage");
        engine.poll();

        assert_eq!(*called.borrow(), 0);
        assert_eq!(engine.counters().messages_forwarded, 0);
        assert!(!engine.needs_restart());
        assert_eq!(last_write(&engine), "AT+CMGD=1,2\r");
    }

    #[test]
    fn missing_message_body_times_out() {
        let (mut engine, clock) = idle_engine();
        engine.link_mut().push_line("+CMT: ,33");
        engine.poll();
        assert!(engine.is_receiving());
        clock.advance(4_001);
        engine.poll();
        assert!(engine.needs_restart());
        assert_eq!(engine.restart_reason(), Some(RestartReason::Timeout));
    }

    #[test]
    fn single_part_send_runs_prompt_payload_confirmation() {
        let (mut engine, _clock) = idle_engine();
        engine.send_sms("+33612345678", "hello").unwrap();
        assert!(engine.is_sending());
        assert_eq!(last_write(&engine), "AT+CMGS=19\r");

        prompt(&mut engine);
        // Payload then the end-of-data byte
        let writes = engine.link().writes().to_vec();
        assert_eq!(writes[writes.len() - 2], b"PDU#1".to_vec());
        assert_eq!(writes[writes.len() - 1], vec![0x1a]);

        engine.link_mut().push_line("+CMGS: 4");
        engine.poll();
        assert!(engine.is_idle());
        assert_eq!(engine.counters().messages_sent, 1);
        assert_eq!(engine.last_sent().map(|r| r.text.as_str()), Some("hello"));
        // Single-part: all-zero multipart identification
        assert_eq!(engine.codec().encode_calls()[0].part, PartInfo::single());
    }

    #[test]
    fn long_message_is_sent_as_chained_chunks() {
        let (mut engine, _clock) = idle_engine();
        let text = "a".repeat(161);
        engine.send_sms("+33612345678", &text).unwrap();

        prompt(&mut engine);
        engine.link_mut().push_line("+CMGS: 5");
        engine.poll();
        // Second chunk submitted immediately
        assert!(engine.is_sending());
        prompt(&mut engine);
        engine.link_mut().push_line("+CMGS: 6");
        engine.poll();

        assert!(engine.is_idle());
        assert_eq!(engine.counters().messages_sent, 2);
        let calls = engine.codec().encode_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].text.len(), 152);
        assert_eq!(calls[1].text.len(), 9);
        assert_eq!(calls[0].part.reference, 1);
        assert_eq!(calls[1].part.reference, 1);
        assert_eq!(calls[0].part.count, 2);
        assert_eq!(calls[0].part.index, 1);
        assert_eq!(calls[1].part.index, 2);
    }

    #[test]
    fn multipart_references_are_never_reused() {
        let (mut engine, _clock) = idle_engine();
        let text = "b".repeat(200);

        engine.send_sms("+331", &text).unwrap();
        prompt(&mut engine);
        engine.link_mut().push_line("+CMGS: 1");
        engine.poll();
        prompt(&mut engine);
        engine.link_mut().push_line("+CMGS: 2");
        engine.poll();
        assert!(engine.is_idle());

        engine.send_sms("+332", &text).unwrap();
        let calls = engine.codec().encode_calls();
        assert_eq!(calls[0].part.reference, 1);
        assert_eq!(calls[2].part.reference, 2);
    }

    #[test]
    fn sends_are_rejected_while_busy() {
        let (mut engine, _clock) = idle_engine();
        engine.send_sms("+331", "first").unwrap();
        assert_eq!(engine.send_sms("+332", "second"), Err(RequestError::Busy));
        assert_eq!(engine.delete_message(1, 4), Err(RequestError::Busy));
        assert_eq!(engine.send_raw_command("AT"), Err(RequestError::Busy));
    }

    #[test]
    fn encode_failure_rejects_the_send_and_stays_idle() {
        let (mut engine, _clock) = idle_engine();
        engine.codec_mut().fail_encode();
        let result = engine.send_sms("+331", "whatever");
        assert!(matches!(result, Err(RequestError::Encode(_))));
        assert!(engine.is_idle());
        assert!(!engine.needs_restart());
    }

    #[test]
    fn raw_command_is_fire_and_forget() {
        let (mut engine, _clock) = idle_engine();
        engine.send_raw_command("AT+CSQ").unwrap();
        assert_eq!(last_write(&engine), "AT+CSQ\r");
        assert!(engine.pending.is_none());
        assert!(engine.is_idle());
        engine.send_raw_byte(0x1a).unwrap();
        assert_eq!(engine.link().writes().last(), Some(&vec![0x1a]));
    }

    #[test]
    fn plain_wait_resolves_at_its_deadline() {
        let (mut engine, clock) = idle_engine();
        engine.state = SessionState::Initializing;
        engine.wait_for(500, None);
        engine.poll();
        assert!(engine.wait.is_some());
        clock.advance(500);
        engine.poll();
        assert!(engine.wait.is_none());
        assert!(engine.is_idle());
    }

    #[test]
    fn ready_wait_resolves_early_on_the_sentinel() {
        let (mut engine, _clock) = idle_engine();
        engine.state = SessionState::Initializing;
        engine.modem_ready = false;
        engine.wait_for_ready(30_000, None);
        engine.link_mut().push_line("SMS Ready");
        engine.poll();
        assert!(engine.wait.is_none());
        assert!(engine.is_idle());
    }

    #[test]
    fn force_idle_discards_the_pending_exchange() {
        let (mut engine, clock) = idle_engine();
        engine.send_sms("+331", "stuck").unwrap();
        engine.force_idle();
        assert!(engine.is_idle());
        // The old deadline no longer fires
        clock.advance(60_000);
        engine.poll();
        assert!(!engine.needs_restart());
    }

    #[test]
    fn clear_restart_is_the_callers_remediation() {
        let (mut engine, clock) = idle_engine();
        engine.delete_message(1, 4).unwrap();
        clock.advance(10_001);
        engine.poll();
        assert!(engine.needs_restart());
        engine.clear_restart();
        assert!(!engine.needs_restart());
        assert_eq!(engine.restart_reason(), None);
    }

    #[test]
    fn command_counter_increases_monotonically() {
        let (mut engine, _clock) = idle_engine();
        let before = engine.counters().commands;
        engine.send_raw_command("AT").unwrap();
        engine.send_raw_command("AT").unwrap();
        assert_eq!(engine.counters().commands, before + 2);
    }

    #[test]
    fn service_center_parsing_needs_both_quotes() {
        assert_eq!(
            parse_service_center("+CSCA: \"+33689004000\",145"),
            Some("+33689004000".to_string())
        );
        assert_eq!(parse_service_center("+CSCA: 145"), None);
        assert_eq!(parse_service_center("unrelated"), None);
    }
}
