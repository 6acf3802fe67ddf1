//! Publisher side of the event protocols.
//!
//! A publisher can run in any process: it opens the target segment by its
//! deterministic name, asks the module directory who is subscribed, writes
//! the event, pokes the subscribers' event pipes, and polls the segment
//! for acknowledgments with a sleep backoff. Completion is observed, not
//! pushed; the bound is always the caller's timeout.
//!
//! Concurrent commits against one module are serialized by the module
//! directory, which hands out the module write intent before a publisher
//! gets here.

use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::config::{first_node_module, str_hash, Datastore, RepoConfig};
use crate::dispatch;
use crate::errors::{Error, Result};
use crate::event::{
    self, SubEvent, ACK_POLL_INTERVAL_MS, DEFAULT_OPERATION_TIMEOUT_MS, MULTI_PAYLOAD_OFF,
    SUB_PAYLOAD_OFF,
};
use crate::lock::{LockMode, EVENT_LOOP_TIMEOUT_MS};
use crate::registry::{ConfigSubInfo, ModuleDirectory, OPT_UPDATE};
use crate::shm::SubShm;

/// Publishes events into shared segments and drives the multi-phase
/// configuration commit.
pub struct Publisher {
    cfg: RepoConfig,
    dir: Arc<dyn ModuleDirectory>,
}

impl Publisher {
    pub fn new(cfg: RepoConfig, dir: Arc<dyn ModuleDirectory>) -> Publisher {
        Publisher { cfg, dir }
    }

    /// Drive a configuration change of `module` in `ds` through the
    /// multi-phase commit: UPDATE (only when some subscriber wants to edit
    /// the change), then CHANGE per priority tier in ascending order, then
    /// DONE — or, on a veto or failure, ABORT delivered in reverse order
    /// to the tiers already notified in the failing phase.
    ///
    /// With no subscribers this is a successful no-op. A timeout while
    /// waiting for CHANGE acknowledgments still drives ABORT before the
    /// error surfaces; subscribers that started applying the change are
    /// never silently abandoned.
    pub fn commit_config_change(
        &self,
        module: &str,
        ds: Datastore,
        payload: &[u8],
        timeout_ms: u32,
    ) -> Result<()> {
        let subs = self.dir.config_subscribers(module, ds)?;
        if subs.is_empty() {
            return Ok(());
        }
        let deadline = Instant::now() + Duration::from_millis(u64::from(timeout_ms));

        let path = self.cfg.sub_shm_path(module, ds.as_str(), None);
        let mut shm = SubShm::open_existing(&path, MULTI_PAYLOAD_OFF)?;

        // one id for every phase of this commit, never reused afterwards
        event::multi_header(&shm).lock.acquire(EVENT_LOOP_TIMEOUT_MS, LockMode::Read)?;
        let event_id = event::multi_header(&shm).event_id + 1;
        event::multi_header(&shm).lock.release(LockMode::Read);

        let mut tiers: Vec<u32> = subs.iter().map(|s| s.priority).collect();
        tiers.sort_unstable();
        tiers.dedup();

        let mut update_tiers: Vec<u32> = subs
            .iter()
            .filter(|s| s.opts & OPT_UPDATE != 0)
            .map(|s| s.priority)
            .collect();
        update_tiers.sort_unstable();
        update_tiers.dedup();

        if let Err((failed, err)) =
            self.run_phase(&mut shm, &subs, &update_tiers, SubEvent::Update, event_id, payload, deadline)
        {
            self.run_abort(&mut shm, &subs, &update_tiers[..=failed], event_id);
            return Err(err);
        }

        if let Err((failed, err)) =
            self.run_phase(&mut shm, &subs, &tiers, SubEvent::Change, event_id, payload, deadline)
        {
            self.run_abort(&mut shm, &subs, &tiers[..=failed], event_id);
            return Err(err);
        }

        // terminal confirmation; subscriber failures here are logged on
        // their side and cannot veto anymore
        if let Err((_, err)) =
            self.run_phase(&mut shm, &subs, &tiers, SubEvent::Done, event_id, &[], deadline)
        {
            return Err(err);
        }
        Ok(())
    }

    /// Request operational data from the provider registered for `xpath`.
    pub fn data_request(
        &self,
        module: &str,
        xpath: &str,
        request: &[u8],
        timeout_ms: u32,
    ) -> Result<Vec<u8>> {
        let Some(sub) = self.dir.data_subscriber(module, xpath)? else {
            return Err(Error::NotFound(format!("data provider for \"{xpath}\"")));
        };
        let path = self.cfg.sub_shm_path(module, "state", Some(str_hash(xpath)));
        self.single_request(&path, SubEvent::DataProvide, request, &[sub.evpipe_num], timeout_ms)
    }

    /// Invoke the RPC/action registered for `xpath` and return its output.
    pub fn rpc_call(&self, xpath: &str, input: &[u8], timeout_ms: u32) -> Result<Vec<u8>> {
        let module = first_node_module(xpath)
            .ok_or_else(|| Error::Internal(format!("cannot learn module name from \"{xpath}\"")))?;
        let Some(sub) = self.dir.rpc_subscriber(module, xpath)? else {
            return Err(Error::NotFound(format!("RPC subscription for \"{xpath}\"")));
        };
        let path = self.cfg.sub_shm_path(module, "rpc", Some(str_hash(xpath)));
        self.single_request(&path, SubEvent::Rpc, input, &[sub.evpipe_num], timeout_ms)
    }

    /// Deliver a notification of `module` to its subscriber set. Without
    /// subscribers this is a successful no-op; stored-notification replay
    /// is the file store's concern.
    pub fn notif_send(
        &self,
        module: &str,
        payload: &[u8],
        timestamp: i64,
        timeout_ms: u32,
    ) -> Result<()> {
        let subs = self.dir.notif_subscribers(module)?;
        if subs.is_empty() {
            tracing::debug!("no live notification subscribers for module {module}");
            return Ok(());
        }
        let evpipes: Vec<u32> = subs.iter().map(|s| s.evpipe_num).collect();
        let wire = event::notif_wire(timestamp, payload);
        let path = self.cfg.sub_shm_path(module, "notif", None);
        self.single_request(&path, SubEvent::Notif, &wire, &evpipes, timeout_ms)
            .map(|_| ())
    }

    /// Publish one phase tier by tier in ascending priority, waiting out
    /// each tier's acknowledgments. Returns the failing tier's index so
    /// the caller knows how far rollback must reach.
    fn run_phase(
        &self,
        shm: &mut SubShm,
        subs: &[ConfigSubInfo],
        tiers: &[u32],
        phase: SubEvent,
        event_id: u32,
        payload: &[u8],
        deadline: Instant,
    ) -> Result<(), (usize, Error)> {
        for (i, &tier) in tiers.iter().enumerate() {
            let addressed = |s: &ConfigSubInfo| {
                s.priority == tier && (phase != SubEvent::Update || s.opts & OPT_UPDATE != 0)
            };
            let expected = subs.iter().filter(|s| addressed(s)).count() as u32;

            if let Err(err) = publish_multi(shm, event_id, phase, tier, payload) {
                return Err((i, err));
            }
            for sub in subs.iter().filter(|s| addressed(s)) {
                dispatch::notify(&self.cfg, sub.evpipe_num);
            }
            if let Err(err) = wait_acks(shm, event_id, phase, expected, deadline) {
                return Err((i, err));
            }
        }
        Ok(())
    }

    /// Deliver ABORT to the already-notified tiers in reverse priority
    /// order, mirroring two-phase-commit rollback. Best effort: a tier
    /// that cannot confirm is logged and rollback keeps going.
    fn run_abort(&self, shm: &mut SubShm, subs: &[ConfigSubInfo], notified: &[u32], event_id: u32) {
        for &tier in notified.iter().rev() {
            let expected = subs.iter().filter(|s| s.priority == tier).count() as u32;

            if let Err(err) = publish_multi(shm, event_id, SubEvent::Abort, tier, &[]) {
                tracing::warn!("failed to publish abort for priority {tier}: {err}");
                continue;
            }
            for sub in subs.iter().filter(|s| s.priority == tier) {
                dispatch::notify(&self.cfg, sub.evpipe_num);
            }
            let deadline =
                Instant::now() + Duration::from_millis(u64::from(DEFAULT_OPERATION_TIMEOUT_MS));
            if let Err(err) = wait_acks(shm, event_id, SubEvent::Abort, expected, deadline) {
                tracing::warn!("abort confirmation missing for priority {tier}: {err}");
            }
        }
    }

    /// Single-phase request/response: claim the segment, write the event,
    /// wake the subscribers, poll for the reply under the same event id.
    fn single_request(
        &self,
        path: &Path,
        kind: SubEvent,
        payload: &[u8],
        evpipes: &[u32],
        timeout_ms: u32,
    ) -> Result<Vec<u8>> {
        let mut shm = SubShm::open_existing(path, SUB_PAYLOAD_OFF)?;
        let deadline = Instant::now() + Duration::from_millis(u64::from(timeout_ms));

        // claim the segment, waiting out a previous unanswered event
        let event_id = loop {
            event::sub_header(&shm).lock.acquire(EVENT_LOOP_TIMEOUT_MS, LockMode::Write)?;
            let hdr = event::sub_header(&shm);
            if hdr.event == SubEvent::None as u32 {
                break hdr.event_id + 1;
            }
            event::sub_header(&shm).lock.release(LockMode::Write);

            if Instant::now() >= deadline {
                return Err(Error::LockTimeout("an idle event segment"));
            }
            thread::sleep(Duration::from_millis(ACK_POLL_INTERVAL_MS));
            shm.remap(None)?;
        };

        // write the request, still under the write lock
        let res = (|| -> Result<()> {
            event::write_payload(&mut shm, SUB_PAYLOAD_OFF, payload)?;
            let hdr = event::sub_header_mut(&mut shm);
            hdr.event_id = event_id;
            hdr.event = kind as u32;
            hdr.err_code = 0;
            hdr.msg_len = payload.len() as u32;
            Ok(())
        })();
        event::sub_header(&shm).lock.release(LockMode::Write);
        res?;

        for &evpipe_num in evpipes {
            dispatch::notify(&self.cfg, evpipe_num);
        }

        // poll for the reply
        loop {
            thread::sleep(Duration::from_millis(ACK_POLL_INTERVAL_MS));
            shm.remap(None)?;

            event::sub_header(&shm).lock.acquire(EVENT_LOOP_TIMEOUT_MS, LockMode::Read)?;
            let hdr = event::sub_header(&shm);
            let replied = hdr.event_id == event_id && hdr.event == SubEvent::None as u32;
            let err_code = hdr.err_code;
            let reply = if replied && err_code == 0 {
                event::read_payload(&shm, SUB_PAYLOAD_OFF, hdr.msg_len as usize).map(<[u8]>::to_vec)
            } else {
                Ok(Vec::new())
            };
            event::sub_header(&shm).lock.release(LockMode::Read);
            let reply = reply?;

            if replied {
                return match Error::from_code(err_code) {
                    Some(err) => Err(err),
                    None => Ok(reply),
                };
            }
            if Instant::now() >= deadline {
                return Err(Error::LockTimeout("the event reply"));
            }
        }
    }
}

/// Write one phase event for one priority tier into a configuration-group
/// segment.
fn publish_multi(
    shm: &mut SubShm,
    event_id: u32,
    phase: SubEvent,
    tier: u32,
    payload: &[u8],
) -> Result<()> {
    event::multi_header(shm).lock.acquire(EVENT_LOOP_TIMEOUT_MS, LockMode::Write)?;
    let res = (|| {
        event::write_payload(shm, MULTI_PAYLOAD_OFF, payload)?;
        let hdr = event::multi_header_mut(shm);
        hdr.event_id = event_id;
        hdr.event = phase as u32;
        hdr.priority = tier;
        hdr.subscriber_count = 0;
        hdr.err_code = 0;
        hdr.msg_len = payload.len() as u32;
        Ok(())
    })();
    event::multi_header(shm).lock.release(LockMode::Write);
    res
}

/// Poll until the current tier's acknowledgments arrive, a subscriber
/// reports an error, or the deadline passes.
fn wait_acks(
    shm: &mut SubShm,
    event_id: u32,
    phase: SubEvent,
    expected: u32,
    deadline: Instant,
) -> Result<()> {
    loop {
        shm.remap(None)?;

        event::multi_header(shm).lock.acquire(EVENT_LOOP_TIMEOUT_MS, LockMode::Read)?;
        let hdr = event::multi_header(shm);
        let id = hdr.event_id;
        let ev = hdr.event;
        let count = hdr.subscriber_count;
        let err_code = hdr.err_code;
        event::multi_header(shm).lock.release(LockMode::Read);

        if id != event_id || ev != phase as u32 {
            return Err(Error::Internal(format!(
                "segment event changed under the publisher (id {id}, tag {ev})"
            )));
        }
        if let Some(err) = Error::from_code(err_code) {
            return Err(err);
        }
        if count >= expected {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(Error::LockTimeout("subscriber acknowledgments"));
        }
        thread::sleep(Duration::from_millis(ACK_POLL_INTERVAL_MS));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MemoryDirectory;
    use tempfile::tempdir;

    fn test_cfg(tmp: &Path) -> RepoConfig {
        let cfg = RepoConfig {
            shm_dir: tmp.join("shm"),
            repo_dir: tmp.join("repo"),
            ..RepoConfig::default()
        };
        std::fs::create_dir_all(&cfg.shm_dir).unwrap();
        std::fs::create_dir_all(&cfg.repo_dir).unwrap();
        cfg
    }

    #[test]
    fn commit_without_subscribers_is_a_noop() {
        let tmp = tempdir().unwrap();
        let cfg = test_cfg(tmp.path());
        let publisher = Publisher::new(cfg.clone(), Arc::new(MemoryDirectory::new()));
        publisher
            .commit_config_change("m1", Datastore::Running, b"diff", 100)
            .unwrap();
        // no segment was created either
        assert!(!cfg.sub_shm_path("m1", "running", None).exists());
    }

    #[test]
    fn requests_without_providers_fail_fast() {
        let tmp = tempdir().unwrap();
        let cfg = test_cfg(tmp.path());
        let publisher = Publisher::new(cfg, Arc::new(MemoryDirectory::new()));

        match publisher.data_request("m1", "/m1:a", b"", 100) {
            Err(Error::NotFound(_)) => {}
            other => panic!("unexpected: {other:?}"),
        }
        match publisher.rpc_call("/m1:do", b"", 100) {
            Err(Error::NotFound(_)) => {}
            other => panic!("unexpected: {other:?}"),
        }
        // a notification without subscribers is not an error
        let publisher_result = publisher.notif_send("m1", b"n", 1, 100);
        publisher_result.unwrap();
    }
}
