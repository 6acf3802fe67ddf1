//! Registry lifecycle scenarios: group/entry bookkeeping, segment files on
//! disk, directory registration, teardown.

use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tempfile::tempdir;

use super::{test_cfg, test_handle};
use crate::config::{str_hash, Datastore};
use crate::errors::{Error, Result};
use crate::event;
use crate::registry::{
    ConfigSubInfo, MemoryDirectory, ModuleChangeCb, ModuleDirectory, NotifSubInfo, RpcCallback,
    SingleSubInfo,
};
use crate::shm::SubShm;

fn noop_config_cb() -> ModuleChangeCb {
    Arc::new(|_, _, _, _| Ok(()))
}

#[test]
fn config_group_lifecycle() {
    let tmp = tempdir().unwrap();
    let cfg = test_cfg(tmp.path());
    let dir = Arc::new(MemoryDirectory::new());
    let handle = test_handle(&cfg, &dir, 1);
    let seg = cfg.sub_shm_path("m1", "running", None);

    let cb_whole = noop_config_cb();
    let cb_path = noop_config_cb();
    handle.add_config("m1", Datastore::Running, None, 0, 0, cb_whole.clone()).unwrap();
    handle.add_config("m1", Datastore::Running, Some("/m1:a"), 5, 0, cb_path.clone()).unwrap();

    // two entries share one group and one segment
    assert_eq!(handle.config_entry_count("m1", Datastore::Running).unwrap(), 2);
    assert!(seg.exists());

    handle.del_config("m1", Datastore::Running, None, 0, 0, &cb_whole).unwrap();
    assert_eq!(handle.config_entry_count("m1", Datastore::Running).unwrap(), 1);
    assert!(seg.exists());

    handle.del_config("m1", Datastore::Running, Some("/m1:a"), 5, 0, &cb_path).unwrap();
    assert_eq!(handle.config_entry_count("m1", Datastore::Running).unwrap(), 0);
    assert!(!seg.exists());
    assert!(dir.is_empty());
}

#[test]
fn deleting_a_non_matching_subscription_leaves_the_rest() {
    let tmp = tempdir().unwrap();
    let cfg = test_cfg(tmp.path());
    let dir = Arc::new(MemoryDirectory::new());
    let handle = test_handle(&cfg, &dir, 1);

    let cb = noop_config_cb();
    handle.add_config("m1", Datastore::Running, None, 0, 0, cb.clone()).unwrap();

    // wrong priority: no match, nothing removed
    match handle.del_config("m1", Datastore::Running, None, 7, 0, &cb) {
        Err(Error::Internal(_)) => {}
        other => panic!("unexpected: {other:?}"),
    }
    // wrong callback identity: no match either
    match handle.del_config("m1", Datastore::Running, None, 0, 0, &noop_config_cb()) {
        Err(Error::Internal(_)) => {}
        other => panic!("unexpected: {other:?}"),
    }
    assert_eq!(handle.config_entry_count("m1", Datastore::Running).unwrap(), 1);
}

#[test]
fn duplicate_subscriptions_are_rejected() {
    let tmp = tempdir().unwrap();
    let cfg = test_cfg(tmp.path());
    let dir = Arc::new(MemoryDirectory::new());
    let handle = test_handle(&cfg, &dir, 1);

    let cb = noop_config_cb();
    handle.add_config("m1", Datastore::Running, Some("/m1:a"), 3, 0, cb.clone()).unwrap();
    match handle.add_config("m1", Datastore::Running, Some("/m1:a"), 3, 0, cb) {
        Err(Error::Internal(_)) => {}
        other => panic!("unexpected: {other:?}"),
    }
    assert_eq!(handle.config_entry_count("m1", Datastore::Running).unwrap(), 1);
}

#[test]
fn last_system_wide_unsubscriber_unlinks_the_file() {
    let tmp = tempdir().unwrap();
    let cfg = test_cfg(tmp.path());
    let dir = Arc::new(MemoryDirectory::new());
    let a = test_handle(&cfg, &dir, 1);
    let b = test_handle(&cfg, &dir, 2);
    let seg = cfg.sub_shm_path("m1", "startup", None);

    let cb_a = noop_config_cb();
    let cb_b = noop_config_cb();
    a.add_config("m1", Datastore::Startup, None, 0, 0, cb_a.clone()).unwrap();
    b.add_config("m1", Datastore::Startup, None, 1, 0, cb_b.clone()).unwrap();
    assert!(seg.exists());

    // another process still subscribed: the file stays
    a.del_config("m1", Datastore::Startup, None, 0, 0, &cb_a).unwrap();
    assert!(seg.exists());

    b.del_config("m1", Datastore::Startup, None, 1, 0, &cb_b).unwrap();
    assert!(!seg.exists());
}

#[test]
fn per_path_segments_use_the_path_hash() {
    let tmp = tempdir().unwrap();
    let cfg = test_cfg(tmp.path());
    let dir = Arc::new(MemoryDirectory::new());
    let handle = test_handle(&cfg, &dir, 1);

    let xpath = "/m1:stats/counters";
    let cb: crate::registry::DataProviderCb = Arc::new(|_, _, _| Ok(Vec::new()));
    handle.add_data_provider("m1", xpath, cb.clone()).unwrap();

    let seg = cfg.sub_shm_path("m1", "state", Some(str_hash(xpath)));
    assert!(seg.exists());
    assert_eq!(handle.data_entry_count("m1").unwrap(), 1);

    handle.del_data_provider("m1", xpath, &cb).unwrap();
    assert!(!seg.exists());
    assert_eq!(handle.data_entry_count("m1").unwrap(), 0);
}

#[test]
fn resubscription_reuses_the_name_but_not_stale_state() {
    let tmp = tempdir().unwrap();
    let cfg = test_cfg(tmp.path());
    let dir = Arc::new(MemoryDirectory::new());
    let handle = test_handle(&cfg, &dir, 1);

    let xpath = "/m1:oper/things";
    let seg = cfg.sub_shm_path("m1", "state", Some(str_hash(xpath)));
    let cb: crate::registry::DataProviderCb = Arc::new(|_, _, _| Ok(Vec::new()));

    handle.add_data_provider("m1", xpath, cb.clone()).unwrap();
    {
        // simulate event history in the segment
        let mut shm = SubShm::open_map(&seg, event::SUB_PAYLOAD_OFF).unwrap();
        assert!(!shm.created());
        event::sub_header_mut(&mut shm).event_id = 42;
    }
    handle.del_data_provider("m1", xpath, &cb).unwrap();
    assert!(!seg.exists());

    // same name, fresh bytes: event ids restart
    handle.add_data_provider("m1", xpath, cb.clone()).unwrap();
    let shm = SubShm::open_map(&seg, event::SUB_PAYLOAD_OFF).unwrap();
    assert!(!shm.created());
    assert_eq!(event::sub_header(&shm).event_id, 0);
}

#[test]
fn delete_all_tears_down_every_kind() {
    let tmp = tempdir().unwrap();
    let cfg = test_cfg(tmp.path());
    let dir = Arc::new(MemoryDirectory::new());
    let handle = test_handle(&cfg, &dir, 1);

    handle.add_config("m1", Datastore::Running, None, 0, 0, noop_config_cb()).unwrap();
    handle.add_config("m2", Datastore::Startup, Some("/m2:x"), 9, 0, noop_config_cb()).unwrap();
    handle
        .add_data_provider("m1", "/m1:state", Arc::new(|_, _, _| Ok(Vec::new())))
        .unwrap();
    handle
        .add_rpc("m1", "/m1:reset", RpcCallback::Value(Arc::new(|_, _| Ok(Vec::new()))))
        .unwrap();
    handle.add_notif("m3", None, 0, 0, Arc::new(|_, _, _| ())).unwrap();
    assert_eq!(handle.total_subscription_count().unwrap(), 5);

    handle.delete_all().unwrap();

    assert_eq!(handle.total_subscription_count().unwrap(), 0);
    assert!(dir.is_empty());
    assert!(!cfg.sub_shm_path("m1", "running", None).exists());
    assert!(!cfg.sub_shm_path("m2", "startup", None).exists());
    assert!(!cfg.sub_shm_path("m1", "state", Some(str_hash("/m1:state"))).exists());
    assert!(!cfg.sub_shm_path("m1", "rpc", Some(str_hash("/m1:reset"))).exists());
    assert!(!cfg.sub_shm_path("m3", "notif", None).exists());

    // idempotent on an already-empty registry
    handle.delete_all().unwrap();
}

#[test]
fn dropping_the_handle_cleans_up() {
    let tmp = tempdir().unwrap();
    let cfg = test_cfg(tmp.path());
    let dir = Arc::new(MemoryDirectory::new());
    let evpipe = cfg.evpipe_path(4);

    {
        let handle = test_handle(&cfg, &dir, 4);
        handle.add_config("m1", Datastore::Running, None, 0, 0, noop_config_cb()).unwrap();
        assert!(evpipe.exists());
    }

    assert!(dir.is_empty());
    assert!(!cfg.sub_shm_path("m1", "running", None).exists());
    assert!(!evpipe.exists());
}

/// Directory that fails the n-th unregistration, for teardown-resumption
/// tests.
struct FlakyDirectory {
    inner: MemoryDirectory,
    removals: AtomicU32,
    fail_on: AtomicU32,
}

impl FlakyDirectory {
    fn new() -> FlakyDirectory {
        FlakyDirectory {
            inner: MemoryDirectory::new(),
            removals: AtomicU32::new(0),
            fail_on: AtomicU32::new(0),
        }
    }

    fn fail_on_removal(&self, n: u32) {
        self.removals.store(0, Ordering::SeqCst);
        self.fail_on.store(n, Ordering::SeqCst);
    }

    fn check_removal(&self) -> Result<()> {
        let n = self.removals.fetch_add(1, Ordering::SeqCst) + 1;
        if n == self.fail_on.load(Ordering::SeqCst) {
            Err(Error::Io(io::Error::other("module directory unavailable")))
        } else {
            Ok(())
        }
    }
}

impl ModuleDirectory for FlakyDirectory {
    fn commit_config_subscription(
        &self,
        module: &str,
        xpath: Option<&str>,
        ds: Datastore,
        priority: u32,
        opts: u32,
        evpipe_num: u32,
        add: bool,
    ) -> Result<bool> {
        if !add {
            self.check_removal()?;
        }
        self.inner
            .commit_config_subscription(module, xpath, ds, priority, opts, evpipe_num, add)
    }

    fn commit_data_subscription(
        &self,
        module: &str,
        xpath: &str,
        evpipe_num: u32,
        add: bool,
    ) -> Result<bool> {
        if !add {
            self.check_removal()?;
        }
        self.inner.commit_data_subscription(module, xpath, evpipe_num, add)
    }

    fn commit_rpc_subscription(
        &self,
        module: &str,
        xpath: &str,
        evpipe_num: u32,
        add: bool,
    ) -> Result<bool> {
        if !add {
            self.check_removal()?;
        }
        self.inner.commit_rpc_subscription(module, xpath, evpipe_num, add)
    }

    fn commit_notif_subscription(&self, module: &str, evpipe_num: u32, add: bool) -> Result<bool> {
        if !add {
            self.check_removal()?;
        }
        self.inner.commit_notif_subscription(module, evpipe_num, add)
    }

    fn config_subscribers(&self, module: &str, ds: Datastore) -> Result<Vec<ConfigSubInfo>> {
        self.inner.config_subscribers(module, ds)
    }

    fn data_subscriber(&self, module: &str, xpath: &str) -> Result<Option<SingleSubInfo>> {
        self.inner.data_subscriber(module, xpath)
    }

    fn rpc_subscriber(&self, module: &str, xpath: &str) -> Result<Option<SingleSubInfo>> {
        self.inner.rpc_subscriber(module, xpath)
    }

    fn notif_subscribers(&self, module: &str) -> Result<Vec<NotifSubInfo>> {
        self.inner.notif_subscribers(module)
    }
}

#[test]
fn delete_all_is_restartable_after_a_directory_failure() {
    let tmp = tempdir().unwrap();
    let cfg = test_cfg(tmp.path());
    let dir = Arc::new(FlakyDirectory::new());
    let handle =
        crate::registry::SubscriptionHandle::new(cfg.clone(), dir.clone(), 1).unwrap();

    let cb: crate::registry::DataProviderCb = Arc::new(|_, _, _| Ok(Vec::new()));
    handle.add_data_provider("m1", "/m1:a", cb.clone()).unwrap();
    handle.add_data_provider("m1", "/m1:b", cb.clone()).unwrap();

    // the second unregistration fails: one entry is gone for good, one
    // stays behind, and the error surfaces
    dir.fail_on_removal(2);
    match handle.delete_all() {
        Err(Error::Io(_)) => {}
        other => panic!("unexpected: {other:?}"),
    }
    assert_eq!(handle.data_entry_count("m1").unwrap(), 1);

    // a retry resumes with what remains
    handle.delete_all().unwrap();
    assert_eq!(handle.data_entry_count("m1").unwrap(), 0);
    assert!(dir.inner.is_empty());
    assert!(!cfg.sub_shm_path("m1", "state", Some(str_hash("/m1:a"))).exists());
    assert!(!cfg.sub_shm_path("m1", "state", Some(str_hash("/m1:b"))).exists());
}

#[test]
fn event_pipe_round_trip() {
    let tmp = tempdir().unwrap();
    let cfg = test_cfg(tmp.path());
    let dir = Arc::new(MemoryDirectory::new());
    let handle = test_handle(&cfg, &dir, 9);

    assert!(cfg.evpipe_path(9).exists());
    assert!(handle.event_pipe_fd() >= 0);

    // a poke with a live reader goes through; processing drains it
    crate::dispatch::notify(&cfg, 9);
    handle.process_events().unwrap();

    // a poke at a pipe nobody reads is quietly dropped
    crate::dispatch::notify(&cfg, 1234);
}
