//! Wire layout of events inside shared segments.
//!
//! Every segment starts with a fixed header whose first field is the
//! process-shared lock guarding the rest of the segment. Data-provide, RPC
//! and notification segments carry one request/response pair per event id
//! ([`SubShmHeader`]); configuration segments carry the multi-phase commit
//! state with per-event acknowledgment counting ([`MultiSubShmHeader`]).
//! The variable-length payload region follows the header.
//!
//! Event ids increase monotonically per segment and are never reused; they
//! are what lets a subscriber skip an event it already processed and lets a
//! restarted subscriber detect events it must not replay.

use std::mem;

use crate::errors::{Error, Result};
use crate::lock::RawRwLock;
use crate::shm::{ShmCursor, ShmOff, SubShm};

/// Sleep interval while polling a segment for acknowledgments or replies.
pub const ACK_POLL_INTERVAL_MS: u64 = 10;

/// Default bound for publisher waits when the caller supplies none.
pub const DEFAULT_OPERATION_TIMEOUT_MS: u32 = 5000;

/// Event kind and commit-phase tag as stored in a segment header.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubEvent {
    None = 0,
    Update = 1,
    Change = 2,
    Done = 3,
    Abort = 4,
    DataProvide = 5,
    Rpc = 6,
    Notif = 7,
}

impl SubEvent {
    pub fn from_u32(value: u32) -> Option<SubEvent> {
        match value {
            0 => Some(SubEvent::None),
            1 => Some(SubEvent::Update),
            2 => Some(SubEvent::Change),
            3 => Some(SubEvent::Done),
            4 => Some(SubEvent::Abort),
            5 => Some(SubEvent::DataProvide),
            6 => Some(SubEvent::Rpc),
            7 => Some(SubEvent::Notif),
            _ => None,
        }
    }

    /// True for the phases of the multi-phase configuration commit.
    pub fn is_change_phase(self) -> bool {
        matches!(
            self,
            SubEvent::Update | SubEvent::Change | SubEvent::Done | SubEvent::Abort
        )
    }
}

/// Header of a single-subscriber segment (data-provide, RPC,
/// notification): one request/response pair per event id. The subscriber
/// answers by writing the reply payload and flipping `event` back to
/// `None` while keeping the event id.
#[repr(C)]
pub struct SubShmHeader {
    pub lock: RawRwLock,
    pub event_id: u32,
    pub event: u32,
    pub err_code: u32,
    pub msg_len: u32,
}

/// Header of a configuration-group segment: the multi-phase commit state.
/// `priority` is the tier the current phase is addressed to and
/// `subscriber_count` collects that tier's acknowledgments.
#[repr(C)]
pub struct MultiSubShmHeader {
    pub lock: RawRwLock,
    pub event_id: u32,
    pub event: u32,
    pub priority: u32,
    pub subscriber_count: u32,
    pub err_code: u32,
    pub msg_len: u32,
}

/// Payload offset in a single-subscriber segment.
pub const SUB_PAYLOAD_OFF: usize = mem::size_of::<SubShmHeader>();

/// Payload offset in a configuration-group segment.
pub const MULTI_PAYLOAD_OFF: usize = mem::size_of::<MultiSubShmHeader>();

pub fn sub_header(shm: &SubShm) -> &SubShmHeader {
    assert!(shm.len() >= SUB_PAYLOAD_OFF);
    unsafe { &*shm.bytes().as_ptr().cast::<SubShmHeader>() }
}

pub fn sub_header_mut(shm: &mut SubShm) -> &mut SubShmHeader {
    assert!(shm.len() >= SUB_PAYLOAD_OFF);
    unsafe { &mut *shm.bytes_mut().as_mut_ptr().cast::<SubShmHeader>() }
}

pub fn multi_header(shm: &SubShm) -> &MultiSubShmHeader {
    assert!(shm.len() >= MULTI_PAYLOAD_OFF);
    unsafe { &*shm.bytes().as_ptr().cast::<MultiSubShmHeader>() }
}

pub fn multi_header_mut(shm: &mut SubShm) -> &mut MultiSubShmHeader {
    assert!(shm.len() >= MULTI_PAYLOAD_OFF);
    unsafe { &mut *shm.bytes_mut().as_mut_ptr().cast::<MultiSubShmHeader>() }
}

/// Initialize a freshly created single-subscriber segment: zeroed event
/// state and a process-shared lock. Only the creating process runs this.
pub fn init_sub_header(shm: &mut SubShm) -> Result<()> {
    let hdr = sub_header_mut(shm);
    hdr.event_id = 0;
    hdr.event = SubEvent::None as u32;
    hdr.err_code = 0;
    hdr.msg_len = 0;
    hdr.lock.init(true)
}

/// Initialize a freshly created configuration-group segment.
pub fn init_multi_header(shm: &mut SubShm) -> Result<()> {
    let hdr = multi_header_mut(shm);
    hdr.event_id = 0;
    hdr.event = SubEvent::None as u32;
    hdr.priority = 0;
    hdr.subscriber_count = 0;
    hdr.err_code = 0;
    hdr.msg_len = 0;
    hdr.lock.init(true)
}

/// Copy `payload` into the segment right after the fixed header, growing
/// the mapping first. Must run under the segment's write lock; a remap
/// inside does not disturb the held lock because the lock state lives in
/// the file bytes, not at the old mapping address.
pub fn write_payload(shm: &mut SubShm, payload_off: usize, payload: &[u8]) -> Result<()> {
    shm.ensure_size(payload_off + payload.len())?;
    let mut cur = ShmCursor::new(payload_off);
    cur.append(shm, payload)?;
    Ok(())
}

/// The payload region of the current event. Must run under at least the
/// segment's read lock. A length running past the mapping means the
/// segment is corrupt.
pub fn read_payload(shm: &SubShm, payload_off: usize, len: usize) -> Result<&[u8]> {
    if payload_off + len > shm.len() {
        return Err(Error::Internal(format!(
            "event payload of {len} bytes runs past segment {}",
            shm.path().display()
        )));
    }
    Ok(shm.read_at(ShmOff(payload_off as u32), len))
}

/// Notification events carry their timestamp on the wire, in front of the
/// opaque payload.
pub fn notif_wire(timestamp: i64, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + payload.len());
    buf.extend_from_slice(&timestamp.to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Split a notification event back into timestamp and payload.
pub fn parse_notif_wire(wire: &[u8]) -> Result<(i64, &[u8])> {
    if wire.len() < 8 {
        return Err(Error::Internal(
            "notification event shorter than its timestamp".into(),
        ));
    }
    let (ts, rest) = wire.split_at(8);
    Ok((i64::from_le_bytes(ts.try_into().expect("split at 8")), rest))
}
