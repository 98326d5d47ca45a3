//! Control protocol messages.
//!
//! Every message starts with an 8-byte header (`message_type`, `message_length`)
//! followed by a fixed-width body. All integers and floats travel in host byte
//! order with 1-byte packing, so the client must share the manager's
//! endianness. Encoding goes through bincode configured for fixed-width,
//! native-endian integers, which produces exactly the packed layout.
//!
//! Inbound bodies are sized by `message_type`; the inbound `message_length`
//! is not trusted. Outbound `message_length` values are fixed per reply kind
//! and are kept as the deployed clients expect them, even though they do not
//! match the payload sizes.

use crate::error::ManagerError;
use crate::metrics::{LatencyReport, ThroughputReport, PERCENTILE_COUNT};
use bincode::Options;
use serde::{Deserialize, Serialize};

/// Wire message type codes.
pub mod message_type {
    pub const START_LOAD: u32 = 0;
    pub const START_MEASURE: u32 = 1;
    pub const REPORT_REQ: u32 = 2;
    pub const REPLY: u32 = 3;
    pub const TERMINATE: u32 = 4;
    pub const CONN_OPEN: u32 = 5;
}

/// Report kinds carried by `REPORT_REQ`.
pub mod report_kind {
    pub const THROUGHPUT: u32 = 0;
    pub const LATENCY: u32 = 1;
}

/// Reply `Info` values.
pub mod reply_info {
    pub const ACK: u32 = 0;
    pub const THROUGHPUT: u32 = 1;
    pub const LATENCY: u32 = 2;
}

pub const HEADER_LEN: usize = 8;

const ACK_MESSAGE_LENGTH: u32 = 4;
const THROUGHPUT_MESSAGE_LENGTH: u32 = 36;
const LATENCY_MESSAGE_LENGTH: u32 = 140;

fn codec() -> impl Options + Copy {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_native_endian()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgHeader {
    pub message_type: u32,
    pub message_length: u32,
}

impl MsgHeader {
    pub fn decode(bytes: &[u8; HEADER_LEN]) -> Result<Self, ManagerError> {
        Ok(codec().deserialize(bytes)?)
    }

    pub fn encode(&self) -> Result<Vec<u8>, ManagerError> {
        Ok(codec().serialize(self)?)
    }
}

#[derive(Serialize, Deserialize)]
struct StartMeasureBody {
    sample_count: u32,
    sampling_rate: f64,
}

/// Which aggregate a `REPORT_REQ` asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportKind {
    Throughput,
    Latency,
}

/// A decoded client request.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    StartLoad { load: u32 },
    StartMeasure { sample_count: u32, sampling_rate: f64 },
    Report(ReportKind),
    ConnOpen,
    /// The client closed the connection cleanly.
    Close,
}

impl Request {
    /// Body size that follows a header of the given type.
    pub fn body_len(message_type: u32) -> Result<usize, ManagerError> {
        match message_type {
            message_type::START_LOAD => Ok(4),
            message_type::START_MEASURE => Ok(12),
            message_type::REPORT_REQ => Ok(4),
            message_type::CONN_OPEN => Ok(4),
            other => Err(ManagerError::ProtocolViolation(format!(
                "unknown message type {}",
                other
            ))),
        }
    }

    /// Decode a request body once the header has been read.
    pub fn decode(header: &MsgHeader, body: &[u8]) -> Result<Self, ManagerError> {
        let expected = Self::body_len(header.message_type)?;
        if body.len() != expected {
            return Err(ManagerError::ProtocolViolation(format!(
                "message type {} needs a {} byte body, got {}",
                header.message_type,
                expected,
                body.len()
            )));
        }

        match header.message_type {
            message_type::START_LOAD => {
                let load: u32 = codec().deserialize(body)?;
                Ok(Request::StartLoad { load })
            }
            message_type::START_MEASURE => {
                let b: StartMeasureBody = codec().deserialize(body)?;
                Ok(Request::StartMeasure {
                    sample_count: b.sample_count,
                    sampling_rate: b.sampling_rate,
                })
            }
            message_type::REPORT_REQ => {
                let kind: u32 = codec().deserialize(body)?;
                match kind {
                    report_kind::THROUGHPUT => Ok(Request::Report(ReportKind::Throughput)),
                    report_kind::LATENCY => Ok(Request::Report(ReportKind::Latency)),
                    other => Err(ManagerError::ProtocolViolation(format!(
                        "unknown report kind {}",
                        other
                    ))),
                }
            }
            // The body is padding.
            _ => Ok(Request::ConnOpen),
        }
    }

    /// Encode a request the way a client would send it.
    pub fn encode(&self) -> Result<Vec<u8>, ManagerError> {
        let c = codec();
        let (message_type, body) = match self {
            Request::StartLoad { load } => (message_type::START_LOAD, c.serialize(load)?),
            Request::StartMeasure {
                sample_count,
                sampling_rate,
            } => (
                message_type::START_MEASURE,
                c.serialize(&StartMeasureBody {
                    sample_count: *sample_count,
                    sampling_rate: *sampling_rate,
                })?,
            ),
            Request::Report(kind) => {
                let raw = match kind {
                    ReportKind::Throughput => report_kind::THROUGHPUT,
                    ReportKind::Latency => report_kind::LATENCY,
                };
                (message_type::REPORT_REQ, c.serialize(&raw)?)
            }
            Request::ConnOpen => (message_type::CONN_OPEN, vec![0u8; 4]),
            Request::Close => {
                return Err(ManagerError::ProtocolViolation(
                    "close is not a wire message".to_string(),
                ))
            }
        };

        let mut out = MsgHeader {
            message_type,
            message_length: body.len() as u32,
        }
        .encode()?;
        out.extend_from_slice(&body);
        Ok(out)
    }
}

/// Throughput figures as sent to the client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThroughputReply {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub req_count: u64,
    /// Measurement window in microseconds.
    pub duration: u64,
    pub correct_iad: u64,
}

/// One percentile estimate with the sample values at its CI bounds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PercentileReply {
    pub lower: u64,
    pub value: u64,
    pub upper: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencyReply {
    pub th_data: ThroughputReply,
    pub avg_latency: u64,
    pub percentiles: [PercentileReply; PERCENTILE_COUNT],
    pub to_reduce_sampling: u32,
    pub is_iid: u8,
    pub is_stationary: u8,
}

pub const THROUGHPUT_REPLY_LEN: usize = 40;
pub const LATENCY_REPLY_LEN: usize = 246;

impl From<&ThroughputReport> for ThroughputReply {
    fn from(report: &ThroughputReport) -> Self {
        Self {
            rx_bytes: report.rx_bytes,
            tx_bytes: report.tx_bytes,
            req_count: report.rx_reqs,
            duration: (report.duration_secs * 1e6) as u64,
            correct_iad: report.interarrival_correct as u64,
        }
    }
}

impl From<&LatencyReport> for LatencyReply {
    fn from(report: &LatencyReport) -> Self {
        let mut percentiles = [PercentileReply::default(); PERCENTILE_COUNT];
        for (slot, estimate) in percentiles.iter_mut().zip(report.percentiles.iter()) {
            *slot = PercentileReply {
                lower: estimate.ci.lower_value.unwrap_or(0),
                value: estimate.value,
                upper: estimate.ci.upper_value.unwrap_or(0),
            };
        }

        Self {
            th_data: ThroughputReply::from(&report.throughput),
            avg_latency: report.mean_latency,
            percentiles,
            to_reduce_sampling: report.independence.reduction_lag(),
            is_iid: report.independence.is_iid() as u8,
            is_stationary: report.stationary as u8,
        }
    }
}

/// A reply to the client. Every reply is header type 3 followed by `Info`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ack,
    /// Bare value carried in `Info` (the `CONN_OPEN` answer).
    Value(u32),
    Throughput(ThroughputReply),
    Latency(LatencyReply),
}

impl Reply {
    fn message_length(&self) -> u32 {
        match self {
            Reply::Ack | Reply::Value(_) => ACK_MESSAGE_LENGTH,
            Reply::Throughput(_) => THROUGHPUT_MESSAGE_LENGTH,
            Reply::Latency(_) => LATENCY_MESSAGE_LENGTH,
        }
    }

    fn info(&self) -> u32 {
        match self {
            Reply::Ack => reply_info::ACK,
            Reply::Value(v) => *v,
            Reply::Throughput(_) => reply_info::THROUGHPUT,
            Reply::Latency(_) => reply_info::LATENCY,
        }
    }

    /// Total bytes this reply occupies on the wire.
    pub fn wire_len(&self) -> usize {
        HEADER_LEN
            + 4
            + match self {
                Reply::Ack | Reply::Value(_) => 0,
                Reply::Throughput(_) => THROUGHPUT_REPLY_LEN,
                Reply::Latency(_) => LATENCY_REPLY_LEN,
            }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ManagerError> {
        let c = codec();
        let mut out = Vec::with_capacity(self.wire_len());
        let header = MsgHeader {
            message_type: message_type::REPLY,
            message_length: self.message_length(),
        };
        c.serialize_into(&mut out, &header)?;
        c.serialize_into(&mut out, &self.info())?;
        match self {
            Reply::Ack | Reply::Value(_) => {}
            Reply::Throughput(body) => c.serialize_into(&mut out, body)?,
            Reply::Latency(body) => c.serialize_into(&mut out, body)?,
        }
        Ok(out)
    }

    /// Decode a reply the way a client would (header, `Info`, payload).
    pub fn decode(bytes: &[u8]) -> Result<Self, ManagerError> {
        if bytes.len() < HEADER_LEN + 4 {
            return Err(ManagerError::ProtocolViolation(format!(
                "reply too short: {} bytes",
                bytes.len()
            )));
        }
        let c = codec();
        let header: MsgHeader = c.deserialize(&bytes[..HEADER_LEN])?;
        if header.message_type != message_type::REPLY {
            return Err(ManagerError::ProtocolViolation(format!(
                "expected reply, got message type {}",
                header.message_type
            )));
        }
        let info: u32 = c.deserialize(&bytes[HEADER_LEN..HEADER_LEN + 4])?;
        let payload = &bytes[HEADER_LEN + 4..];

        match (header.message_length, payload.len()) {
            (THROUGHPUT_MESSAGE_LENGTH, THROUGHPUT_REPLY_LEN) => {
                Ok(Reply::Throughput(c.deserialize(payload)?))
            }
            (LATENCY_MESSAGE_LENGTH, LATENCY_REPLY_LEN) => Ok(Reply::Latency(c.deserialize(payload)?)),
            (ACK_MESSAGE_LENGTH, 0) if info == reply_info::ACK => Ok(Reply::Ack),
            (ACK_MESSAGE_LENGTH, 0) => Ok(Reply::Value(info)),
            (length, size) => Err(ManagerError::ProtocolViolation(format!(
                "reply with message_length {} and {} payload bytes",
                length, size
            ))),
        }
    }
}
