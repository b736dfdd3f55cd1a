//! Link-level control messages.
//!
//! Some incoming messages are answered by the endpoint itself instead of
//! reaching the consumer: a proof-of-life ping, the coordinator's
//! peer-attribute query, and the CTL write that assigns component ids. The
//! coordinator side of the exchange uses the builders and reply parsers
//! below.

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::endpoint::CoreIdentity;
use crate::layout::PeerId;
use crate::send::SID_DEFAULT;
use crate::slot::Mailslot;
use crate::sync::Ordering;

pub const PING: &[u8] = b"ping";
pub const PONG: &[u8] = b"pong";

const PEER_ATTRIBUTE: &str = "Link CTL Peer-Attribute";
const LINK_ACK_PREFIX: &str = "Link CTL ACK C-Class=";
const CTL_WRITE_PREFIX: &str = "CTL-Write Space=0,PFMCID=";
const STANDALONE_ACK_PREFIX: &str = "Standalone Acknowledgment Tag=";

/// Result of offering a message to the interpreter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOutcome {
    /// Consumed; the sender's slot was released. The reply, if any, goes back
    /// to the sender.
    Handled(Option<Vec<u8>>),
    /// Not a link message; left for the consumer.
    NotHandled,
}

/// Offer the message staged in `slot` to the link interpreter.
///
/// Runs under the endpoint's incoming lock. Always stamps the sender's
/// negotiated CID and SID.
pub(crate) fn interpret(
    slot: Mailslot<'_>,
    sender: PeerId,
    identity: &Mutex<CoreIdentity>,
) -> LinkOutcome {
    let header = slot.header();
    header.peer_sid.store(SID_DEFAULT as u64, Ordering::Relaxed);
    header
        .peer_cid
        .store(u64::from(sender) * 100, Ordering::Relaxed);

    let Some(len) = slot.busy().occupied() else {
        return LinkOutcome::NotHandled;
    };
    let payload = slot.read_payload(len as usize);

    let reply = if payload == PING {
        PONG.to_vec()
    } else if payload.starts_with(PEER_ATTRIBUTE.as_bytes()) {
        let id = identity.lock();
        link_ack(&LinkAck {
            class_name: id.class_name.clone(),
            cid0: id.cid0,
            sid0: id.sid0,
        })
        .into_bytes()
    } else if let Some(write) = parse_ctl_write(&payload) {
        let mut id = identity.lock();
        id.pfmcid = write.pfmcid;
        id.pfmsid = write.pfmsid;
        id.cid0 = write.cid;
        id.sid0 = write.sid;
        id.pmcid = -1;
        debug!(
            sender,
            cid0 = write.cid,
            sid0 = write.sid,
            pfmcid = write.pfmcid,
            "component ids assigned"
        );
        standalone_ack(write.tag).into_bytes()
    } else {
        return LinkOutcome::NotHandled;
    };

    if let Err(current) = slot.busy().compare_and_clear(len) {
        debug!(sender, expected = len, current, "link message changed under us");
    }
    trace!(sender, len, "link message handled");
    LinkOutcome::Handled(Some(reply))
}

// =============================================================================
// Requests
// =============================================================================

/// `CTL-Write` fields: fabric manager address, assigned CID/SID, and a tag
/// echoed in the acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CtlWrite {
    pub pfmcid: i32,
    pub pfmsid: i32,
    pub cid: i32,
    pub sid: i32,
    pub tag: i32,
}

pub fn peer_attribute_request() -> String {
    PEER_ATTRIBUTE.to_string()
}

pub fn ctl_write_request(write: &CtlWrite) -> String {
    format!(
        "{}{},PFMSID={},CID={},SID={},Tag={}",
        CTL_WRITE_PREFIX, write.pfmcid, write.pfmsid, write.cid, write.sid, write.tag
    )
}

pub fn parse_ctl_write(payload: &[u8]) -> Option<CtlWrite> {
    let mut s = Scanner::new(payload);
    s.literal(CTL_WRITE_PREFIX)?;
    let pfmcid = s.int()?;
    s.literal(",PFMSID=")?;
    let pfmsid = s.int()?;
    s.literal(",CID=")?;
    let cid = s.int()?;
    s.literal(",SID=")?;
    let sid = s.int()?;
    s.literal(",Tag=")?;
    let tag = s.int()?;
    Some(CtlWrite {
        pfmcid,
        pfmsid,
        cid,
        sid,
        tag,
    })
}

// =============================================================================
// Replies
// =============================================================================

/// Reply to a peer-attribute query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkAck {
    pub class_name: String,
    pub cid0: i32,
    pub sid0: i32,
}

pub fn link_ack(ack: &LinkAck) -> String {
    format!(
        "{}{},CID0={},SID0={}",
        LINK_ACK_PREFIX, ack.class_name, ack.cid0, ack.sid0
    )
}

pub fn parse_link_ack(payload: &[u8]) -> Option<LinkAck> {
    let mut s = Scanner::new(payload);
    s.literal(LINK_ACK_PREFIX)?;
    let class_name = s.until(b',')?;
    s.literal(",CID0=")?;
    let cid0 = s.int()?;
    s.literal(",SID0=")?;
    let sid0 = s.int()?;
    Some(LinkAck {
        class_name,
        cid0,
        sid0,
    })
}

pub fn standalone_ack(tag: i32) -> String {
    format!("{}{},Reason=OK", STANDALONE_ACK_PREFIX, tag)
}

/// Tag of a successful standalone acknowledgment.
pub fn parse_standalone_ack(payload: &[u8]) -> Option<i32> {
    let mut s = Scanner::new(payload);
    s.literal(STANDALONE_ACK_PREFIX)?;
    let tag = s.int()?;
    s.literal(",Reason=OK")?;
    Some(tag)
}

// =============================================================================
// Scanning
// =============================================================================

/// Minimal `sscanf`-style matcher: literals match byte for byte, except that
/// a space matches any run of whitespace; integers accept leading whitespace
/// and a sign. Whatever follows the last conversion is ignored.
struct Scanner<'a> {
    rest: &'a [u8],
}

impl<'a> Scanner<'a> {
    fn new(input: &'a [u8]) -> Self {
        Self { rest: input }
    }

    fn skip_whitespace(&mut self) {
        while let [b, tail @ ..] = self.rest {
            if !b.is_ascii_whitespace() {
                break;
            }
            self.rest = tail;
        }
    }

    fn literal(&mut self, lit: &str) -> Option<()> {
        for &want in lit.as_bytes() {
            if want == b' ' {
                self.skip_whitespace();
                continue;
            }
            match self.rest {
                [got, tail @ ..] if *got == want => self.rest = tail,
                _ => return None,
            }
        }
        Some(())
    }

    fn int(&mut self) -> Option<i32> {
        self.skip_whitespace();
        let (negative, digits) = match self.rest {
            [b'-', tail @ ..] => (true, tail),
            [b'+', tail @ ..] => (false, tail),
            _ => (false, self.rest),
        };
        let n = digits.iter().take_while(|b| b.is_ascii_digit()).count();
        if n == 0 {
            return None;
        }
        let text = std::str::from_utf8(&digits[..n]).ok()?;
        let magnitude: i64 = text.parse().ok()?;
        let value = if negative { -magnitude } else { magnitude };
        self.rest = &digits[n..];
        i32::try_from(value).ok()
    }

    /// Everything up to (not including) `stop`, which must be present.
    fn until(&mut self, stop: u8) -> Option<String> {
        let n = self.rest.iter().position(|b| *b == stop)?;
        let out = String::from_utf8_lossy(&self.rest[..n]).into_owned();
        self.rest = &self.rest[n..];
        Some(out)
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use crate::slot::MailslotHeader;
    use std::ptr::NonNull;

    /// A heap mailslot: header plus a 128-byte payload.
    struct TestSlot {
        buf: Box<[u64]>,
    }

    impl TestSlot {
        fn new(peer_id: PeerId) -> Self {
            let mut buf = vec![0u64; 32].into_boxed_slice();
            // SAFETY: buf is 256 bytes, 8-aligned, and unshared.
            unsafe {
                buf.as_mut_ptr()
                    .cast::<MailslotHeader>()
                    .write(MailslotHeader::new(peer_id))
            };
            Self { buf }
        }

        fn slot(&self) -> Mailslot<'_> {
            let header = NonNull::new(self.buf.as_ptr() as *mut MailslotHeader).unwrap();
            unsafe { Mailslot::from_raw(header, 128) }
        }

        fn stage(&self, data: &[u8]) -> Mailslot<'_> {
            let slot = self.slot();
            slot.stage(data);
            slot.busy().publish(data.len() as u64);
            slot
        }
    }

    fn identity() -> Mutex<CoreIdentity> {
        Mutex::new(CoreIdentity {
            class_name: "FEEadapter".into(),
            ..CoreIdentity::default()
        })
    }

    #[test]
    fn test_ping_is_answered() {
        let t = TestSlot::new(2);
        let slot = t.stage(b"ping");
        let outcome = interpret(slot, 2, &identity());
        assert_eq!(outcome, LinkOutcome::Handled(Some(b"pong".to_vec())));
        assert!(slot.busy().is_idle());
        assert_eq!(slot.header().peer_sid.load(Ordering::Relaxed), 27);
        assert_eq!(slot.header().peer_cid.load(Ordering::Relaxed), 200);
    }

    #[test]
    fn test_ping_must_match_exactly() {
        let t = TestSlot::new(2);
        let slot = t.stage(b"pingx");
        assert_eq!(interpret(slot, 2, &identity()), LinkOutcome::NotHandled);
        assert_eq!(slot.busy().occupied(), Some(5));
        // Stamped even when not handled.
        assert_eq!(slot.header().peer_cid.load(Ordering::Relaxed), 200);
    }

    #[test]
    fn test_peer_attribute_reports_identity() {
        let t = TestSlot::new(5);
        let slot = t.stage(b"Link CTL Peer-Attribute");
        let id = identity();
        id.lock().cid0 = 300;
        id.lock().sid0 = 27;

        let LinkOutcome::Handled(Some(reply)) = interpret(slot, 5, &id) else {
            panic!("peer attribute not handled");
        };
        assert_eq!(reply, b"Link CTL ACK C-Class=FEEadapter,CID0=300,SID0=27");
        assert_eq!(
            parse_link_ack(&reply),
            Some(LinkAck {
                class_name: "FEEadapter".into(),
                cid0: 300,
                sid0: 27
            })
        );
        assert!(slot.busy().is_idle());
    }

    #[test]
    fn test_ctl_write_assigns_ids() {
        let t = TestSlot::new(5);
        let request = ctl_write_request(&CtlWrite {
            pfmcid: 500,
            pfmsid: 27,
            cid: 300,
            sid: 27,
            tag: 42,
        });
        assert_eq!(
            request,
            "CTL-Write Space=0,PFMCID=500,PFMSID=27,CID=300,SID=27,Tag=42"
        );
        let slot = t.stage(request.as_bytes());
        let id = identity();

        let outcome = interpret(slot, 5, &id);
        assert_eq!(
            outcome,
            LinkOutcome::Handled(Some(b"Standalone Acknowledgment Tag=42,Reason=OK".to_vec()))
        );
        let id = id.lock();
        assert_eq!((id.cid0, id.sid0), (300, 27));
        assert_eq!((id.pfmcid, id.pfmsid), (500, 27));
        assert_eq!(id.pmcid, -1);
    }

    #[test]
    fn test_ctl_write_scanning() {
        assert_eq!(
            parse_ctl_write(b"CTL-Write   Space=0,PFMCID= -1,PFMSID=+2,CID=3,SID=4,Tag=5 trailing"),
            Some(CtlWrite {
                pfmcid: -1,
                pfmsid: 2,
                cid: 3,
                sid: 4,
                tag: 5
            })
        );
        // Missing conversion.
        assert_eq!(
            parse_ctl_write(b"CTL-Write Space=0,PFMCID=1,PFMSID=2,CID=3,SID=4,Tag="),
            None
        );
        assert_eq!(
            parse_ctl_write(b"CTL-Write Space=1,PFMCID=1,PFMSID=2,CID=3,SID=4,Tag=5"),
            None
        );
        assert_eq!(
            parse_ctl_write(b"CTL-Write Space=0,PFMCID=99999999999,PFMSID=2,CID=3,SID=4,Tag=5"),
            None
        );
    }

    #[test]
    fn test_standalone_ack() {
        assert_eq!(parse_standalone_ack(standalone_ack(7).as_bytes()), Some(7));
        assert_eq!(parse_standalone_ack(b"Standalone Acknowledgment Tag=7,Reason=NO"), None);
    }

    #[test]
    fn test_ordinary_payload_is_left_alone() {
        let t = TestSlot::new(3);
        let slot = t.stage(b"hello");
        assert_eq!(interpret(slot, 3, &identity()), LinkOutcome::NotHandled);
        assert_eq!(slot.busy().occupied(), Some(5));
    }
}
