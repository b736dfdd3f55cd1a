//! Byte-stream bridge over an endpoint.
//!
//! Writers submit `"<selector>:<payload>"`; the selector is `server`,
//! `switch`, `link` or `interface` for the coordinator, `"<cid>,<sid>"` for a
//! component address, or a bare peer id. Readers receive
//! `"<peer_cid>,<peer_sid>:<payload>"`.

use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::endpoint::Endpoint;
use crate::error::{MsgError, Result};
use crate::layout::RegionLayout;
use crate::send::{DestSelector, SID_CID_IS_PEER_ID};

/// Retries after the first busy timeout before a write gives up.
const BUSY_RETRIES: u32 = 2;

const COORDINATOR_NAMES: [&str; 4] = ["server", "switch", "link", "interface"];

bitflags! {
    /// Poll readiness.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Readiness: u8 {
        /// A delivery is pending.
        const READABLE = 1 << 0;
        /// The own mailslot is idle.
        const WRITABLE = 1 << 1;
    }
}

pub struct Bridge {
    endpoint: Arc<Endpoint>,
    /// Serializes writers sharing this bridge.
    write_lock: Mutex<()>,
}

impl Bridge {
    pub fn new(endpoint: Arc<Endpoint>) -> Self {
        Self {
            endpoint,
            write_lock: Mutex::new(()),
        }
    }

    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    /// Send one framed request. Returns `buf.len()` on success.
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        let max = self.endpoint.max_payload().saturating_sub(2);
        if buf.len() > max {
            return Err(MsgError::OversizedPayload {
                len: buf.len(),
                max,
            });
        }

        let _guard = self.write_lock.lock();
        let (dest, body) = parse_request(buf, self.endpoint.layout())?;

        let mut retries = 0;
        let sent = loop {
            match self.endpoint.send(dest, body) {
                Err(MsgError::SlotBusyTimeout { .. }) if retries < BUSY_RETRIES => {
                    retries += 1;
                    debug!(peer_id = self.endpoint.peer_id(), retries, "write retrying");
                }
                Err(MsgError::SlotBusyTimeout { .. }) => {
                    warn!(peer_id = self.endpoint.peer_id(), "write timed out");
                    return Err(MsgError::TimedOut);
                }
                other => break other?,
            }
        };

        if sent != body.len() {
            return Err(MsgError::PartialTransfer {
                sent,
                expected: body.len(),
            });
        }
        Ok(buf.len())
    }

    /// Receive one delivery into `buf` as `"<cid>,<sid>:<payload>"`.
    ///
    /// If `buf` is too small the delivery stays pending.
    pub fn read(&self, buf: &mut [u8], nonblocking: bool) -> Result<usize> {
        let incoming = self.endpoint.await_incoming(nonblocking)?;
        let prefix = format!("{},{}:", incoming.peer_cid(), incoming.peer_sid());
        let total = prefix.len() + incoming.len();
        if buf.len() < total {
            return Err(MsgError::OversizedPayload {
                len: total,
                max: buf.len(),
            });
        }

        buf[..prefix.len()].copy_from_slice(prefix.as_bytes());
        incoming.copy_payload(&mut buf[prefix.len()..total])?;
        self.endpoint.release_incoming();
        Ok(total)
    }

    pub fn poll(&self) -> Readiness {
        let mut ready = Readiness::empty();
        if self.endpoint.pending_sender().is_some() {
            ready |= Readiness::READABLE;
        }
        if self.endpoint.own_slot().busy().is_idle() {
            ready |= Readiness::WRITABLE;
        }
        ready
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("peer_id", &self.endpoint.peer_id())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Request Parsing
// =============================================================================

/// Split a request at its first `:` into destination and payload.
pub fn parse_request<'a>(buf: &'a [u8], layout: &RegionLayout) -> Result<(DestSelector, &'a [u8])> {
    let colon = buf
        .iter()
        .position(|b| *b == b':')
        .ok_or_else(|| MsgError::MalformedRequest("no colon".to_string()))?;
    let selector = std::str::from_utf8(&buf[..colon])
        .map_err(|_| MsgError::MalformedRequest("selector is not UTF-8".to_string()))?;
    Ok((parse_selector(selector, layout)?, &buf[colon + 1..]))
}

pub fn parse_selector(selector: &str, layout: &RegionLayout) -> Result<DestSelector> {
    if COORDINATOR_NAMES.contains(&selector) {
        return Ok(DestSelector::coordinator(layout));
    }
    let malformed = || MsgError::MalformedRequest(format!("bad selector {:?}", selector));
    match selector.split_once(',') {
        Some((cid, sid)) => Ok(DestSelector::Component {
            cid: parse_int(cid).ok_or_else(malformed)?,
            sid: parse_int(sid).ok_or_else(malformed)?,
        }),
        None => Ok(DestSelector::Component {
            cid: parse_int(selector).ok_or_else(malformed)?,
            sid: SID_CID_IS_PEER_ID,
        }),
    }
}

/// Integer with radix taken from its prefix: `0x` hex, leading `0` octal,
/// otherwise decimal. One trailing newline is tolerated.
fn parse_int(text: &str) -> Option<i32> {
    let text = text.strip_suffix('\n').unwrap_or(text);
    let (negative, digits) = match text.as_bytes().first()? {
        b'-' => (true, &text[1..]),
        b'+' => (false, &text[1..]),
        _ => (false, text),
    };
    let (radix, digits) = if let Some(hex) = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        (16, hex)
    } else if digits.len() > 1 && digits.starts_with('0') {
        (8, &digits[1..])
    } else {
        (10, digits)
    };
    if digits.is_empty() || !digits.chars().all(|c| c.is_digit(radix)) {
        return None;
    }
    let magnitude = i64::from_str_radix(digits, radix).ok()?;
    i32::try_from(if negative { -magnitude } else { magnitude }).ok()
}
