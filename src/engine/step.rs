//! Continuation steps of the command sequencer
//!
//! Every "what happens after this answer" is one variant of [`Step`],
//! consumed by `ModemEngine::dispatch`. A pending command carries at
//! most one next step, which keeps the pipeline strictly linear.

/// Next action to run when the current command completes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    // Speed probing
    /// Judge the attention-command answer, try the next candidate speed
    ProbeEvaluate,
    /// Probe settled (or gave up); restore error propagation and resume
    ProbeDone,

    // Initialization pipeline
    /// Reset the modem to factory defaults
    Reset,
    /// Request the caller's link speed, skipped when already there
    SetSpeed,
    /// Reopen the link after a speed change took effect
    SpeedApplied,
    /// Turn command echo off
    EchoOff,
    /// Ask for verbose error reports
    VerboseErrors,
    /// Switch message exchange to PDU mode
    PduMode,
    /// Enable detailed network registration reports
    DetailedRegistration,
    /// Wait for the modem-ready sentinel, skipped when already seen
    AwaitReady,
    /// Enable caller identification
    CallerId,
    /// Route inbound message indications to the serial line
    IndicatorsOn,
    /// Enable detailed message headers
    HeaderDetails,
    /// Ask the modem for its service-center address
    QueryServiceCenter,
    /// Parse the service-center answer and hand it to the codec
    CaptureServiceCenter,
    /// Delete already-read and sent messages from storage
    PurgeStored,
    /// Initialization finished, session becomes idle
    InitComplete,

    // Outbound message
    /// The continuation prompt arrived: write the encoded PDU
    WritePayload,
    /// The modem confirmed the chunk: advance or finish the job
    ChunkConfirmed,
}
