//! # rackpool-wire: Named-pipe framing
//!
//! Two byte streams connect the control plane to the reclamation server:
//!
//! - **Requests** (spooler → server): each request is an ASCII record of
//!   comma-separated fields, wrapped in base64, terminated by a single
//!   literal `,`. The base64 alphabet does not contain `,`, so a reader can
//!   recover frame boundaries by splitting the stream on commas.
//! - **Failures** (server → spooler): a bare comma-terminated list of host
//!   ids.
//!
//! Both readers are tolerant by construction: an undecodable token is
//! reported as an error entry for the caller to log, and never aborts the
//! surrounding stream.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use rackpool_types::HostId;

mod error;
pub mod fifo;

pub use error::{Result, WireError};

/// Booleans travel as these exact literals.
const TRUE: &str = "True";
const FALSE: &str = "False";

/// Target-device field value meaning "let the inaugurator decide".
pub const DEFAULT_TARGET_DEVICE: &str = "default";

// ============================================================================
// Requests
// ============================================================================

/// A reclamation request as it crosses the requests pipe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Bring the host back into the inaugurator without a power cycle.
    Soft {
        host_id: HostId,
        hostname: String,
        username: String,
        password: String,
        mac: String,
        /// `"default"` when the embedding has no preference.
        target_device: String,
        /// Whether the inaugurator itself is believed to be running.
        is_inaugurator_active: bool,
    },
    /// Force the host to reboot out-of-band.
    Cold { host_id: HostId, hard_reset: bool },
}

impl Request {
    pub fn host_id(&self) -> &HostId {
        match self {
            Request::Soft { host_id, .. } | Request::Cold { host_id, .. } => host_id,
        }
    }

    fn action(&self) -> &'static str {
        match self {
            Request::Soft { .. } => "soft",
            Request::Cold { .. } => "cold",
        }
    }
}

fn bool_field(value: bool) -> &'static str {
    if value { TRUE } else { FALSE }
}

fn parse_bool(field: &str) -> Result<bool> {
    match field {
        TRUE => Ok(true),
        FALSE => Ok(false),
        other => Err(WireError::InvalidBool(other.to_string())),
    }
}

/// Encodes one request as a wire frame, trailing terminator included.
pub fn encode(request: &Request) -> String {
    let record = match request {
        Request::Soft {
            host_id,
            hostname,
            username,
            password,
            mac,
            target_device,
            is_inaugurator_active,
        } => [
            request.action(),
            host_id.as_str(),
            hostname.as_str(),
            username.as_str(),
            password.as_str(),
            mac.as_str(),
            target_device.as_str(),
            bool_field(*is_inaugurator_active),
        ]
        .join(","),
        Request::Cold {
            host_id,
            hard_reset,
        } => [request.action(), host_id.as_str(), bool_field(*hard_reset)].join(","),
    };
    let mut frame = BASE64.encode(record);
    frame.push(',');
    frame
}

fn decode_record(token: &[u8]) -> Result<Request> {
    let record = BASE64
        .decode(token)
        .map_err(|_| WireError::InvalidBase64(String::from_utf8_lossy(token).into_owned()))?;
    if record.is_empty() {
        return Err(WireError::EmptyRecord);
    }
    let record = String::from_utf8(record)
        .map_err(|_| WireError::InvalidBase64(String::from_utf8_lossy(token).into_owned()))?;
    let fields: Vec<&str> = record.split(',').collect();
    match fields[0] {
        "soft" => {
            if fields.len() != 8 {
                return Err(WireError::WrongFieldCount {
                    action: "soft",
                    expected: 8,
                    found: fields.len(),
                });
            }
            Ok(Request::Soft {
                host_id: HostId::from(fields[1]),
                hostname: fields[2].to_string(),
                username: fields[3].to_string(),
                password: fields[4].to_string(),
                mac: fields[5].to_string(),
                target_device: fields[6].to_string(),
                is_inaugurator_active: parse_bool(fields[7])?,
            })
        }
        "cold" => {
            if fields.len() != 3 {
                return Err(WireError::WrongFieldCount {
                    action: "cold",
                    expected: 3,
                    found: fields.len(),
                });
            }
            Ok(Request::Cold {
                host_id: HostId::from(fields[1]),
                hard_reset: parse_bool(fields[2])?,
            })
        }
        other => Err(WireError::UnknownAction(other.to_string())),
    }
}

/// Decodes one chunk read from the requests pipe.
///
/// The chunk is trimmed of surrounding spaces and commas, split on `,`, and
/// each non-empty token is decoded independently. Callers log the `Err`
/// entries and carry on; a single corrupt frame never poisons its
/// neighbours.
pub fn decode_chunk(chunk: &[u8]) -> Vec<Result<Request>> {
    let trimmed = trim_stream_bytes(chunk);
    trimmed
        .split(|&b| b == b',')
        .filter(|token| !token.is_empty())
        .map(decode_record)
        .collect()
}

fn trim_stream_bytes(chunk: &[u8]) -> &[u8] {
    let is_padding = |b: &u8| *b == b' ' || *b == b',';
    let start = chunk
        .iter()
        .position(|b| !is_padding(b))
        .unwrap_or(chunk.len());
    let end = chunk
        .iter()
        .rposition(|b| !is_padding(b))
        .map_or(start, |p| p + 1);
    &chunk[start..end]
}

// ============================================================================
// Failure notifications
// ============================================================================

/// Encodes one soft-reclamation-failure record: the host id plus the
/// terminating comma.
pub fn encode_failure(host_id: &HostId) -> String {
    format!("{host_id},")
}

/// Splits a chunk read from the failures pipe into host ids, skipping the
/// empty fields produced by the terminator commas.
pub fn parse_failures(chunk: &[u8]) -> Vec<HostId> {
    String::from_utf8_lossy(chunk)
        .split(',')
        .filter(|id| !id.is_empty())
        .map(HostId::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn soft_request() -> Request {
        Request::Soft {
            host_id: HostId::from("rack02-node11"),
            hostname: "10.0.0.21".to_string(),
            username: "root".to_string(),
            password: "hunter2".to_string(),
            mac: "52:54:00:00:00:21".to_string(),
            target_device: DEFAULT_TARGET_DEVICE.to_string(),
            is_inaugurator_active: false,
        }
    }

    #[test]
    fn frame_is_base64_with_comma_terminator() {
        let frame = encode(&soft_request());
        assert!(frame.ends_with(','));
        let body = &frame[..frame.len() - 1];
        let record = BASE64.decode(body).unwrap();
        assert_eq!(
            record,
            b"soft,rack02-node11,10.0.0.21,root,hunter2,52:54:00:00:00:21,default,False"
        );
    }

    #[test]
    fn soft_round_trip() {
        let request = soft_request();
        let decoded = decode_chunk(encode(&request).as_bytes());
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].as_ref().unwrap(), &request);
    }

    #[test]
    fn cold_round_trip() {
        let request = Request::Cold {
            host_id: HostId::from("n9"),
            hard_reset: true,
        };
        let decoded = decode_chunk(encode(&request).as_bytes());
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].as_ref().unwrap(), &request);
    }

    #[test]
    fn several_frames_in_one_chunk() {
        let mut stream = String::new();
        stream.push_str(&encode(&soft_request()));
        stream.push_str(&encode(&Request::Cold {
            host_id: HostId::from("n9"),
            hard_reset: false,
        }));
        let decoded = decode_chunk(stream.as_bytes());
        assert_eq!(decoded.len(), 2);
        assert!(decoded.iter().all(Result::is_ok));
    }

    #[test]
    fn garbage_between_valid_frames_is_isolated() {
        let mut stream = String::from("!!notbase64!!,");
        stream.push_str(&encode(&soft_request()));
        stream.push_str("%%%,");
        stream.push_str(&encode(&Request::Cold {
            host_id: HostId::from("n9"),
            hard_reset: true,
        }));
        let decoded = decode_chunk(stream.as_bytes());
        let ok: Vec<_> = decoded.iter().filter(|r| r.is_ok()).collect();
        let err: Vec<_> = decoded.iter().filter(|r| r.is_err()).collect();
        assert_eq!(ok.len(), 2);
        assert_eq!(err.len(), 2);
    }

    #[test]
    fn unknown_action_is_an_error() {
        let frame = format!("{},", BASE64.encode("warm,n1"));
        let decoded = decode_chunk(frame.as_bytes());
        assert!(matches!(decoded[0], Err(WireError::UnknownAction(_))));
    }

    #[test]
    fn truncated_soft_record_is_an_error() {
        let frame = format!("{},", BASE64.encode("soft,n1,10.0.0.2,root"));
        let decoded = decode_chunk(frame.as_bytes());
        assert!(matches!(
            decoded[0],
            Err(WireError::WrongFieldCount { action: "soft", .. })
        ));
    }

    #[test]
    fn invalid_bool_is_an_error() {
        let frame = format!("{},", BASE64.encode("cold,n1,yes"));
        let decoded = decode_chunk(frame.as_bytes());
        assert!(matches!(decoded[0], Err(WireError::InvalidBool(_))));
    }

    #[test]
    fn failure_stream_round_trip() {
        let mut stream = String::new();
        stream.push_str(&encode_failure(&HostId::from("a")));
        stream.push_str(&encode_failure(&HostId::from("b")));
        let ids = parse_failures(stream.as_bytes());
        assert_eq!(ids, vec![HostId::from("a"), HostId::from("b")]);
    }

    #[test]
    fn failure_stream_skips_empty_fields() {
        let ids = parse_failures(b",,a,,b,");
        assert_eq!(ids, vec![HostId::from("a"), HostId::from("b")]);
    }

    proptest! {
        #[test]
        fn soft_encode_decode_is_identity(
            host_id in "[a-zA-Z0-9._-]{1,32}",
            hostname in "[a-zA-Z0-9.-]{1,32}",
            username in "[a-zA-Z0-9]{1,16}",
            password in "[!-+.-~]{1,24}",
            mac in "[0-9a-f]{2}(:[0-9a-f]{2}){5}",
            target_device in prop_oneof!["default".prop_map(String::from), "/dev/sd[a-z]"],
            active in any::<bool>(),
        ) {
            let request = Request::Soft {
                host_id: HostId::from(host_id.as_str()),
                hostname,
                username,
                password,
                mac,
                target_device,
                is_inaugurator_active: active,
            };
            let decoded = decode_chunk(encode(&request).as_bytes());
            prop_assert_eq!(decoded.len(), 1);
            prop_assert_eq!(decoded[0].as_ref().unwrap(), &request);
        }

        #[test]
        fn cold_encode_decode_is_identity(
            host_id in "[a-zA-Z0-9._-]{1,32}",
            hard_reset in any::<bool>(),
        ) {
            let request = Request::Cold { host_id: HostId::from(host_id.as_str()), hard_reset };
            let decoded = decode_chunk(encode(&request).as_bytes());
            prop_assert_eq!(decoded.len(), 1);
            prop_assert_eq!(decoded[0].as_ref().unwrap(), &request);
        }

        #[test]
        fn arbitrary_chunks_never_panic(chunk in proptest::collection::vec(any::<u8>(), 0..512)) {
            let _ = decode_chunk(&chunk);
            let _ = parse_failures(&chunk);
        }
    }
}
