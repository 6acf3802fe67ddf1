//! Subscriber-side event processing and the event pipe.
//!
//! A subscriber process sleeps on its event pipe; a publisher pokes the
//! pipe after writing into a segment the subscriber maps. The pipe carries
//! no payload, one drained byte means "scan your segments". The actual
//! event state lives in the segments themselves, so a missed wakeup delays
//! delivery but never loses an event.

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::fd::AsRawFd;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;

use crate::config::RepoConfig;
use crate::errors::{Error, Result};
use crate::event::{self, SubEvent, MULTI_PAYLOAD_OFF, SUB_PAYLOAD_OFF};
use crate::lock::{LockMode, EVENT_LOOP_TIMEOUT_MS};
use crate::registry::{
    ConfigGroup, DataGroup, NotifGroup, RpcGroup, SubscriptionHandle, OPT_UPDATE,
};
use crate::shm::SubShm;

/// The wakeup channel of one subscriber process.
pub struct EventPipe {
    path: PathBuf,
    read_end: File,
}

impl EventPipe {
    pub(crate) fn create(cfg: &RepoConfig, evpipe_num: u32) -> Result<EventPipe> {
        let path = cfg.evpipe_path(evpipe_num);
        let cpath = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| Error::Internal(format!("NUL byte in path {}", path.display())))?;

        let ret = unsafe { libc::mkfifo(cpath.as_ptr(), 0o600) };
        if ret != 0 {
            let err = io::Error::last_os_error();
            // a pipe left behind by a crashed predecessor is reused
            if err.raw_os_error() != Some(libc::EEXIST) {
                return Err(err.into());
            }
        }

        let read_end = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&path)?;
        Ok(EventPipe { path, read_end })
    }

    /// File descriptor for the caller's own poll loop.
    pub fn as_raw_fd(&self) -> i32 {
        self.read_end.as_raw_fd()
    }

    /// Consume pending wakeup bytes.
    pub(crate) fn drain(&self) {
        let mut buf = [0u8; 256];
        loop {
            let n = unsafe {
                libc::read(self.read_end.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len())
            };
            if n <= 0 {
                break;
            }
        }
    }

    pub(crate) fn remove(&self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            tracing::warn!("failed to remove event pipe {} ({err})", self.path.display());
        }
    }
}

/// Poke a subscriber's event pipe. A missing reader means the process is
/// gone or not listening yet; the event stays in the segment either way,
/// so this never fails.
pub fn notify(cfg: &RepoConfig, evpipe_num: u32) {
    let path = cfg.evpipe_path(evpipe_num);
    match OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(&path)
    {
        Ok(mut pipe) => {
            if let Err(err) = pipe.write(&[0]) {
                tracing::debug!("event pipe {} write failed ({err})", path.display());
            }
        }
        Err(err) => {
            tracing::debug!("event pipe {} has no reader ({err})", path.display());
        }
    }
}

impl SubscriptionHandle {
    /// File descriptor of this handle's event pipe, for the caller's poll
    /// loop.
    pub fn event_pipe_fd(&self) -> i32 {
        self.evpipe.as_raw_fd()
    }

    /// Drain the event pipe and process every pending event addressed to
    /// this handle: invoke matching callbacks and write acknowledgments or
    /// replies back into the segments.
    ///
    /// Runs under the handle's registry lock for its whole duration; a
    /// callback must not subscribe or unsubscribe on the same handle.
    pub fn process_events(&self) -> Result<()> {
        self.evpipe.drain();
        let mut reg = self.state.write(EVENT_LOOP_TIMEOUT_MS)?;

        for group in reg.conf.iter_mut() {
            process_config_group(group)?;
        }
        for group in reg.data.iter_mut() {
            let DataGroup { module, subs } = group;
            let module = module.as_str();
            for entry in subs.iter_mut() {
                let xpath = entry.xpath.clone();
                let cb = entry.cb.clone();
                process_single_segment(&mut entry.sub_shm, SubEvent::DataProvide, |payload| {
                    cb(module, &xpath, payload)
                })?;
            }
        }
        for group in reg.rpc.iter_mut() {
            let RpcGroup { module: _, subs } = group;
            for entry in subs.iter_mut() {
                let xpath = entry.xpath.clone();
                let cb = entry.cb.clone();
                process_single_segment(&mut entry.sub_shm, SubEvent::Rpc, |payload| {
                    cb.invoke(&xpath, payload)
                })?;
            }
        }
        for group in reg.notif.iter_mut() {
            process_notif_group(group)?;
        }
        Ok(())
    }
}

/// One step of the multi-phase commit as seen by the subscriber: read the
/// published phase, dispatch it to the entries of the addressed priority
/// tier that have not seen it yet, and fold the acknowledgments back into
/// the header.
fn process_config_group(group: &mut ConfigGroup) -> Result<()> {
    let ConfigGroup { module, ds, sub_shm, subs } = group;

    sub_shm.remap(None)?;
    if sub_shm.len() < MULTI_PAYLOAD_OFF {
        return Ok(());
    }

    event::multi_header(sub_shm).lock.acquire(EVENT_LOOP_TIMEOUT_MS, LockMode::Read)?;
    let hdr = event::multi_header(sub_shm);
    let event_id = hdr.event_id;
    let raw_event = hdr.event;
    let priority = hdr.priority;
    let msg_len = hdr.msg_len as usize;
    let payload = event::read_payload(sub_shm, MULTI_PAYLOAD_OFF, msg_len).map(<[u8]>::to_vec);
    event::multi_header(sub_shm).lock.release(LockMode::Read);
    let payload = payload?;

    let Some(phase) = SubEvent::from_u32(raw_event) else {
        return Err(Error::Internal(format!(
            "unknown event tag {raw_event} in segment {}",
            sub_shm.path().display()
        )));
    };
    if !phase.is_change_phase() {
        return Ok(());
    }

    let mut acks = 0u32;
    let mut err_code = 0u32;
    for entry in subs.iter_mut().filter(|e| e.priority == priority) {
        // idempotent re-delivery guard
        if entry.event_id == event_id && entry.event == phase {
            continue;
        }
        if phase == SubEvent::Update && entry.opts & OPT_UPDATE == 0 {
            continue;
        }

        let res = (entry.cb)(module.as_str(), *ds, phase, &payload);
        entry.event_id = event_id;
        entry.event = phase;
        acks += 1;

        if let Err(err) = res {
            match phase {
                // a veto stops the tier; the publisher turns it into ABORT
                SubEvent::Update | SubEvent::Change => {
                    err_code = err.code();
                    break;
                }
                // DONE and ABORT state facts, a failing callback changes nothing
                _ => {
                    tracing::warn!(
                        "module {module} callback failed during {phase:?}: {err}"
                    );
                }
            }
        }
    }

    if acks > 0 || err_code != 0 {
        event::multi_header(sub_shm).lock.acquire(EVENT_LOOP_TIMEOUT_MS, LockMode::Write)?;
        let hdr = event::multi_header_mut(sub_shm);
        // only ack the event actually processed; the publisher may have
        // timed out and moved on
        if hdr.event_id == event_id && hdr.event == phase as u32 {
            hdr.subscriber_count += acks;
            if err_code != 0 && hdr.err_code == 0 {
                hdr.err_code = err_code;
            }
        }
        event::multi_header(sub_shm).lock.release(LockMode::Write);
    }
    Ok(())
}

/// Serve a pending request on a single-subscriber segment: invoke the
/// handler and write the reply in place, flipping the event tag back to
/// idle under the same event id.
fn process_single_segment(
    sub_shm: &mut SubShm,
    kind: SubEvent,
    handler: impl FnOnce(&[u8]) -> Result<Vec<u8>>,
) -> Result<()> {
    sub_shm.remap(None)?;
    if sub_shm.len() < SUB_PAYLOAD_OFF {
        return Ok(());
    }

    event::sub_header(sub_shm).lock.acquire(EVENT_LOOP_TIMEOUT_MS, LockMode::Read)?;
    let hdr = event::sub_header(sub_shm);
    let event_id = hdr.event_id;
    let pending = hdr.event == kind as u32;
    let payload = if pending {
        event::read_payload(sub_shm, SUB_PAYLOAD_OFF, hdr.msg_len as usize).map(<[u8]>::to_vec)
    } else {
        Ok(Vec::new())
    };
    event::sub_header(sub_shm).lock.release(LockMode::Read);
    let payload = payload?;

    if !pending {
        return Ok(());
    }

    let reply = handler(&payload);

    let mut reply_len = 0u32;
    let mut wire_err = 0u32;
    event::sub_header(sub_shm).lock.acquire(EVENT_LOOP_TIMEOUT_MS, LockMode::Write)?;
    match &reply {
        Ok(data) => match event::write_payload(sub_shm, SUB_PAYLOAD_OFF, data) {
            Ok(()) => reply_len = data.len() as u32,
            Err(err) => {
                tracing::warn!(
                    "failed to write reply into {} ({err})",
                    sub_shm.path().display()
                );
                wire_err = err.code();
            }
        },
        Err(err) => wire_err = err.code(),
    }
    let hdr = event::sub_header_mut(sub_shm);
    if hdr.event_id == event_id && hdr.event == kind as u32 {
        hdr.event = SubEvent::None as u32;
        hdr.err_code = wire_err;
        hdr.msg_len = reply_len;
    }
    event::sub_header(sub_shm).lock.release(LockMode::Write);
    Ok(())
}

/// Fan a pending notification out to every entry whose time window admits
/// its timestamp, then confirm delivery with the none-reply.
fn process_notif_group(group: &mut NotifGroup) -> Result<()> {
    let NotifGroup { module, sub_shm, subs } = group;

    sub_shm.remap(None)?;
    if sub_shm.len() < SUB_PAYLOAD_OFF {
        return Ok(());
    }

    event::sub_header(sub_shm).lock.acquire(EVENT_LOOP_TIMEOUT_MS, LockMode::Read)?;
    let hdr = event::sub_header(sub_shm);
    let event_id = hdr.event_id;
    let pending = hdr.event == SubEvent::Notif as u32;
    let payload = if pending {
        event::read_payload(sub_shm, SUB_PAYLOAD_OFF, hdr.msg_len as usize).map(<[u8]>::to_vec)
    } else {
        Ok(Vec::new())
    };
    event::sub_header(sub_shm).lock.release(LockMode::Read);
    let payload = payload?;

    if !pending {
        return Ok(());
    }

    let (timestamp, body) = event::parse_notif_wire(&payload)?;
    for entry in subs.iter_mut() {
        if entry.stop_time != 0 && timestamp > entry.stop_time {
            continue;
        }
        if entry.start_time != 0 && timestamp < entry.start_time {
            continue;
        }
        (entry.cb)(module.as_str(), timestamp, body);
        if entry.start_time != 0 {
            entry.replayed = true;
        }
    }

    event::sub_header(sub_shm).lock.acquire(EVENT_LOOP_TIMEOUT_MS, LockMode::Write)?;
    let hdr = event::sub_header_mut(sub_shm);
    // another handle of the fan-out set may have confirmed already
    if hdr.event_id == event_id && hdr.event == SubEvent::Notif as u32 {
        hdr.event = SubEvent::None as u32;
        hdr.err_code = 0;
        hdr.msg_len = 0;
    }
    event::sub_header(sub_shm).lock.release(LockMode::Write);
    Ok(())
}
