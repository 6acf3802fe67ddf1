//! In-process subscription registry.
//!
//! One [`SubscriptionHandle`] exists per connected client process. It owns
//! four typed group collections (configuration changes, data providers,
//! RPC/action, notifications), the process's event pipe, and a process-local
//! lock serializing every registry mutation. A group is created lazily on
//! the first subscription to its key and destroyed when its entry list
//! drains; a group and its backing segment are always both present or both
//! absent.
//!
//! The external module directory (the main shared module table, not owned
//! here) is updated through the [`ModuleDirectory`] seam so other processes
//! can address events to this handle; its answers on removal decide whether
//! this handle was the segment's last user and owes the file unlink.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::{str_hash, Datastore, RepoConfig};
use crate::dispatch::EventPipe;
use crate::errors::{Error, Result};
use crate::event::{self, SubEvent, MULTI_PAYLOAD_OFF, SUB_PAYLOAD_OFF};
use crate::lock::{RwLock, EVENT_LOOP_TIMEOUT_MS};
use crate::shm::SubShm;

/// Configuration subscription option flag: the subscriber wants UPDATE
/// events and may edit the pending change before it is applied.
pub const OPT_UPDATE: u32 = 0x01;

/// Configuration change callback: `(module, datastore, phase, payload)`.
/// An `Err` during UPDATE or CHANGE vetoes the commit; during DONE or
/// ABORT it is logged and ignored.
pub type ModuleChangeCb =
    Arc<dyn Fn(&str, Datastore, SubEvent, &[u8]) -> Result<()> + Send + Sync>;

/// Operational data provider callback: `(module, xpath, request)` returning
/// the reply payload.
pub type DataProviderCb = Arc<dyn Fn(&str, &str, &[u8]) -> Result<Vec<u8>> + Send + Sync>;

/// RPC callback over flat values: `(xpath, input)` returning the output.
pub type RpcValueCb = Arc<dyn Fn(&str, &[u8]) -> Result<Vec<u8>> + Send + Sync>;

/// RPC callback over a serialized tree: `(xpath, input)` returning the
/// output tree.
pub type RpcTreeCb = Arc<dyn Fn(&str, &[u8]) -> Result<Vec<u8>> + Send + Sync>;

/// Notification callback: `(module, timestamp, payload)`. Failures cannot
/// veto anything, so there is no result.
pub type NotifCb = Arc<dyn Fn(&str, i64, &[u8]) + Send + Sync>;

/// Exactly one RPC callback form per subscription; the payload is flat
/// values for [`RpcCallback::Value`] and a serialized tree for
/// [`RpcCallback::Tree`].
#[derive(Clone)]
pub enum RpcCallback {
    Value(RpcValueCb),
    Tree(RpcTreeCb),
}

impl RpcCallback {
    fn same(&self, other: &RpcCallback) -> bool {
        match (self, other) {
            (RpcCallback::Value(a), RpcCallback::Value(b)) => Arc::ptr_eq(a, b),
            (RpcCallback::Tree(a), RpcCallback::Tree(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub(crate) fn invoke(&self, xpath: &str, input: &[u8]) -> Result<Vec<u8>> {
        match self {
            RpcCallback::Value(cb) => cb(xpath, input),
            RpcCallback::Tree(cb) => cb(xpath, input),
        }
    }
}

// ---------------------------------------------------------------------------
// external module directory
// ---------------------------------------------------------------------------

/// A registered configuration subscriber, as listed by the directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigSubInfo {
    pub priority: u32,
    pub opts: u32,
    pub evpipe_num: u32,
}

/// A registered single-subscriber (data-provide or RPC) delivery channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SingleSubInfo {
    pub evpipe_num: u32,
}

/// A registered notification subscriber delivery channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotifSubInfo {
    pub evpipe_num: u32,
}

/// The main shared module table, an external collaborator. Registration
/// makes a subscription addressable by other processes; `add = false`
/// unregisters and reports whether this removal was the group's last in
/// the whole system, which decides who unlinks the backing file. The
/// directory also lists current subscribers so a publisher can learn
/// priorities, expected acknowledgment counts, and delivery channels.
///
/// Implementations serialize registrations under their own lock; this
/// crate never sees two racing creations of one segment name.
pub trait ModuleDirectory: Send + Sync {
    fn commit_config_subscription(
        &self,
        module: &str,
        xpath: Option<&str>,
        ds: Datastore,
        priority: u32,
        opts: u32,
        evpipe_num: u32,
        add: bool,
    ) -> Result<bool>;

    fn commit_data_subscription(
        &self,
        module: &str,
        xpath: &str,
        evpipe_num: u32,
        add: bool,
    ) -> Result<bool>;

    fn commit_rpc_subscription(
        &self,
        module: &str,
        xpath: &str,
        evpipe_num: u32,
        add: bool,
    ) -> Result<bool>;

    fn commit_notif_subscription(&self, module: &str, evpipe_num: u32, add: bool) -> Result<bool>;

    fn config_subscribers(&self, module: &str, ds: Datastore) -> Result<Vec<ConfigSubInfo>>;

    fn data_subscriber(&self, module: &str, xpath: &str) -> Result<Option<SingleSubInfo>>;

    fn rpc_subscriber(&self, module: &str, xpath: &str) -> Result<Option<SingleSubInfo>>;

    fn notif_subscribers(&self, module: &str) -> Result<Vec<NotifSubInfo>>;
}

#[derive(Default)]
struct DirState {
    config: HashMap<(String, Datastore), Vec<(Option<String>, u32, u32, u32)>>,
    data: HashMap<(String, String), Vec<u32>>,
    rpc: HashMap<(String, String), Vec<u32>>,
    notif: HashMap<String, Vec<u32>>,
}

/// In-memory [`ModuleDirectory`] for single-process deployments and tests.
/// The real directory lives in the main shared module table owned by the
/// datastore proper.
#[derive(Default)]
pub struct MemoryDirectory {
    state: Mutex<DirState>,
}

impl MemoryDirectory {
    pub fn new() -> MemoryDirectory {
        MemoryDirectory::default()
    }

    fn state(&self) -> MutexGuard<'_, DirState> {
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }

    /// True when nothing at all is registered.
    pub fn is_empty(&self) -> bool {
        let st = self.state();
        st.config.is_empty() && st.data.is_empty() && st.rpc.is_empty() && st.notif.is_empty()
    }
}

fn dir_remove<K: std::hash::Hash + Eq, V: PartialEq>(
    map: &mut HashMap<K, Vec<V>>,
    key: K,
    value: &V,
    what: &str,
) -> Result<bool> {
    let Some(list) = map.get_mut(&key) else {
        return Err(Error::NotFound(format!("registered {what} subscription")));
    };
    let Some(pos) = list.iter().position(|v| v == value) else {
        return Err(Error::NotFound(format!("registered {what} subscription")));
    };
    list.swap_remove(pos);
    if list.is_empty() {
        map.remove(&key);
        Ok(true)
    } else {
        Ok(false)
    }
}

impl ModuleDirectory for MemoryDirectory {
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
        let mut st = self.state();
        let key = (module.to_string(), ds);
        let value = (xpath.map(str::to_string), priority, opts, evpipe_num);
        if add {
            st.config.entry(key).or_default().push(value);
            Ok(false)
        } else {
            dir_remove(&mut st.config, key, &value, "configuration")
        }
    }

    fn commit_data_subscription(
        &self,
        module: &str,
        xpath: &str,
        evpipe_num: u32,
        add: bool,
    ) -> Result<bool> {
        let mut st = self.state();
        let key = (module.to_string(), xpath.to_string());
        if add {
            st.data.entry(key).or_default().push(evpipe_num);
            Ok(false)
        } else {
            dir_remove(&mut st.data, key, &evpipe_num, "data-provide")
        }
    }

    fn commit_rpc_subscription(
        &self,
        module: &str,
        xpath: &str,
        evpipe_num: u32,
        add: bool,
    ) -> Result<bool> {
        let mut st = self.state();
        let key = (module.to_string(), xpath.to_string());
        if add {
            st.rpc.entry(key).or_default().push(evpipe_num);
            Ok(false)
        } else {
            dir_remove(&mut st.rpc, key, &evpipe_num, "RPC")
        }
    }

    fn commit_notif_subscription(&self, module: &str, evpipe_num: u32, add: bool) -> Result<bool> {
        let mut st = self.state();
        if add {
            st.notif.entry(module.to_string()).or_default().push(evpipe_num);
            Ok(false)
        } else {
            dir_remove(&mut st.notif, module.to_string(), &evpipe_num, "notification")
        }
    }

    fn config_subscribers(&self, module: &str, ds: Datastore) -> Result<Vec<ConfigSubInfo>> {
        let st = self.state();
        Ok(st
            .config
            .get(&(module.to_string(), ds))
            .map(|list| {
                list.iter()
                    .map(|&(_, priority, opts, evpipe_num)| ConfigSubInfo {
                        priority,
                        opts,
                        evpipe_num,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    fn data_subscriber(&self, module: &str, xpath: &str) -> Result<Option<SingleSubInfo>> {
        let st = self.state();
        Ok(st
            .data
            .get(&(module.to_string(), xpath.to_string()))
            .and_then(|list| list.first())
            .map(|&evpipe_num| SingleSubInfo { evpipe_num }))
    }

    fn rpc_subscriber(&self, module: &str, xpath: &str) -> Result<Option<SingleSubInfo>> {
        let st = self.state();
        Ok(st
            .rpc
            .get(&(module.to_string(), xpath.to_string()))
            .and_then(|list| list.first())
            .map(|&evpipe_num| SingleSubInfo { evpipe_num }))
    }

    fn notif_subscribers(&self, module: &str) -> Result<Vec<NotifSubInfo>> {
        let st = self.state();
        Ok(st
            .notif
            .get(module)
            .map(|list| list.iter().map(|&evpipe_num| NotifSubInfo { evpipe_num }).collect())
            .unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// groups and entries
// ---------------------------------------------------------------------------

pub(crate) struct ConfigEntry {
    pub(crate) xpath: Option<String>,
    pub(crate) priority: u32,
    pub(crate) opts: u32,
    pub(crate) cb: ModuleChangeCb,
    // subscriber-side cursor into the multi-phase protocol
    pub(crate) event_id: u32,
    pub(crate) event: SubEvent,
}

pub(crate) struct ConfigGroup {
    pub(crate) module: String,
    pub(crate) ds: Datastore,
    pub(crate) sub_shm: SubShm,
    pub(crate) subs: Vec<ConfigEntry>,
}

pub(crate) struct DataEntry {
    pub(crate) xpath: String,
    pub(crate) cb: DataProviderCb,
    pub(crate) sub_shm: SubShm,
}

pub(crate) struct DataGroup {
    pub(crate) module: String,
    pub(crate) subs: Vec<DataEntry>,
}

pub(crate) struct RpcEntry {
    pub(crate) xpath: String,
    pub(crate) cb: RpcCallback,
    pub(crate) sub_shm: SubShm,
}

pub(crate) struct RpcGroup {
    pub(crate) module: String,
    pub(crate) subs: Vec<RpcEntry>,
}

pub(crate) struct NotifEntry {
    pub(crate) xpath: Option<String>,
    pub(crate) start_time: i64,
    pub(crate) stop_time: i64,
    pub(crate) replayed: bool,
    pub(crate) cb: NotifCb,
}

pub(crate) struct NotifGroup {
    pub(crate) module: String,
    pub(crate) sub_shm: SubShm,
    pub(crate) subs: Vec<NotifEntry>,
}

#[derive(Default)]
pub(crate) struct Registry {
    pub(crate) conf: Vec<ConfigGroup>,
    pub(crate) data: Vec<DataGroup>,
    pub(crate) rpc: Vec<RpcGroup>,
    pub(crate) notif: Vec<NotifGroup>,
}

// ---------------------------------------------------------------------------
// subscription handle
// ---------------------------------------------------------------------------

/// Process-local root of all subscriptions of one connected client.
///
/// Registry mutations hold the handle's own lock for the whole operation,
/// so another thread never observes a half-built group. Callbacks run from
/// [`SubscriptionHandle::process_events`] while that lock is held;
/// subscribing or unsubscribing from inside a callback deadlocks.
pub struct SubscriptionHandle {
    pub(crate) cfg: RepoConfig,
    pub(crate) dir: Arc<dyn ModuleDirectory>,
    pub(crate) evpipe_num: u32,
    pub(crate) evpipe: EventPipe,
    pub(crate) state: Box<RwLock<Registry>>,
}

impl SubscriptionHandle {
    /// Create a handle with its event pipe. `evpipe_num` is the delivery
    /// channel registered with the directory; the caller keeps it unique
    /// per handle.
    pub fn new(
        cfg: RepoConfig,
        dir: Arc<dyn ModuleDirectory>,
        evpipe_num: u32,
    ) -> Result<SubscriptionHandle> {
        let evpipe = EventPipe::create(&cfg, evpipe_num)?;
        Ok(SubscriptionHandle {
            cfg,
            dir,
            evpipe_num,
            evpipe,
            state: RwLock::new(Registry::default())?,
        })
    }

    pub fn evpipe_num(&self) -> u32 {
        self.evpipe_num
    }

    pub fn repo_config(&self) -> &RepoConfig {
        &self.cfg
    }

    /// Subscribe to configuration changes of `module` in `ds`. `xpath` of
    /// `None` subscribes to the whole module; `priority` orders CHANGE
    /// delivery (lower first).
    pub fn add_config(
        &self,
        module: &str,
        ds: Datastore,
        xpath: Option<&str>,
        priority: u32,
        opts: u32,
        cb: ModuleChangeCb,
    ) -> Result<()> {
        let mut reg = self.state.write(EVENT_LOOP_TIMEOUT_MS)?;

        let (gi, created_group) =
            match reg.conf.iter().position(|g| g.module == module && g.ds == ds) {
                Some(i) => (i, false),
                None => {
                    let path = self.cfg.sub_shm_path(module, ds.as_str(), None);
                    let mut sub_shm = SubShm::open_map(&path, MULTI_PAYLOAD_OFF)?;
                    if sub_shm.created() {
                        event::init_multi_header(&mut sub_shm)?;
                    }
                    // the group becomes visible only once its segment is open
                    reg.conf.push(ConfigGroup {
                        module: module.to_string(),
                        ds,
                        sub_shm,
                        subs: Vec::new(),
                    });
                    (reg.conf.len() - 1, true)
                }
            };

        let group = &mut reg.conf[gi];
        if group.subs.iter().any(|e| {
            e.xpath.as_deref() == xpath
                && e.priority == priority
                && e.opts == opts
                && Arc::ptr_eq(&e.cb, &cb)
        }) {
            return Err(Error::Internal("duplicate configuration subscription".into()));
        }
        group.subs.push(ConfigEntry {
            xpath: xpath.map(str::to_string),
            priority,
            opts,
            cb,
            event_id: 0,
            event: SubEvent::None,
        });

        if let Err(err) = self.dir.commit_config_subscription(
            module,
            xpath,
            ds,
            priority,
            opts,
            self.evpipe_num,
            true,
        ) {
            // a failed add leaves the registry unchanged
            let group = &mut reg.conf[gi];
            group.subs.pop();
            if group.subs.is_empty() {
                let group = reg.conf.swap_remove(gi);
                if created_group {
                    group.sub_shm.unlink_file();
                }
            }
            return Err(err);
        }
        Ok(())
    }

    /// Remove one configuration subscription. Every component of the
    /// identity must match the `add_config` call being undone.
    pub fn del_config(
        &self,
        module: &str,
        ds: Datastore,
        xpath: Option<&str>,
        priority: u32,
        opts: u32,
        cb: &ModuleChangeCb,
    ) -> Result<()> {
        let mut reg = self.state.write(EVENT_LOOP_TIMEOUT_MS)?;

        let no_match =
            || Error::Internal("no matching configuration subscription to delete".into());
        let gi = reg
            .conf
            .iter()
            .position(|g| g.module == module && g.ds == ds)
            .ok_or_else(no_match)?;
        let ei = reg.conf[gi]
            .subs
            .iter()
            .position(|e| {
                e.xpath.as_deref() == xpath
                    && e.priority == priority
                    && e.opts == opts
                    && Arc::ptr_eq(&e.cb, cb)
            })
            .ok_or_else(no_match)?;

        // unregister first; the local removal below cannot fail
        let last_removed = self.dir.commit_config_subscription(
            module,
            xpath,
            ds,
            priority,
            opts,
            self.evpipe_num,
            false,
        )?;

        let group = &mut reg.conf[gi];
        group.subs.swap_remove(ei);
        if group.subs.is_empty() {
            let group = reg.conf.swap_remove(gi);
            if last_removed {
                group.sub_shm.unlink_file();
            }
        }
        Ok(())
    }

    /// Subscribe as the operational data provider for `xpath` in `module`.
    pub fn add_data_provider(&self, module: &str, xpath: &str, cb: DataProviderCb) -> Result<()> {
        let mut reg = self.state.write(EVENT_LOOP_TIMEOUT_MS)?;

        let (gi, created_group) = match reg.data.iter().position(|g| g.module == module) {
            Some(i) => (i, false),
            None => {
                reg.data.push(DataGroup { module: module.to_string(), subs: Vec::new() });
                (reg.data.len() - 1, true)
            }
        };

        if reg.data[gi].subs.iter().any(|e| e.xpath == xpath && Arc::ptr_eq(&e.cb, &cb)) {
            return Err(Error::Internal("duplicate data-provide subscription".into()));
        }

        let path = self.cfg.sub_shm_path(module, "state", Some(str_hash(xpath)));
        let sub_shm = match Self::open_single_segment(&path) {
            Ok(shm) => shm,
            Err(err) => {
                if created_group {
                    reg.data.swap_remove(gi);
                }
                return Err(err);
            }
        };
        let entry_created = sub_shm.created();
        reg.data[gi].subs.push(DataEntry { xpath: xpath.to_string(), cb, sub_shm });

        if let Err(err) = self.dir.commit_data_subscription(module, xpath, self.evpipe_num, true) {
            let entry = reg.data[gi].subs.pop().expect("entry was just pushed");
            if entry_created {
                entry.sub_shm.unlink_file();
            }
            if reg.data[gi].subs.is_empty() {
                reg.data.swap_remove(gi);
            }
            return Err(err);
        }
        Ok(())
    }

    /// Remove one data-provide subscription.
    pub fn del_data_provider(&self, module: &str, xpath: &str, cb: &DataProviderCb) -> Result<()> {
        let mut reg = self.state.write(EVENT_LOOP_TIMEOUT_MS)?;

        let no_match = || Error::Internal("no matching data-provide subscription to delete".into());
        let gi = reg.data.iter().position(|g| g.module == module).ok_or_else(no_match)?;
        let ei = reg.data[gi]
            .subs
            .iter()
            .position(|e| e.xpath == xpath && Arc::ptr_eq(&e.cb, cb))
            .ok_or_else(no_match)?;

        let last_removed =
            self.dir.commit_data_subscription(module, xpath, self.evpipe_num, false)?;

        let entry = reg.data[gi].subs.swap_remove(ei);
        if last_removed {
            entry.sub_shm.unlink_file();
        }
        if reg.data[gi].subs.is_empty() {
            reg.data.swap_remove(gi);
        }
        Ok(())
    }

    /// Subscribe an RPC/action handler for `xpath` in `module`. The
    /// callback form (values or tree) is fixed by the [`RpcCallback`]
    /// variant.
    pub fn add_rpc(&self, module: &str, xpath: &str, cb: RpcCallback) -> Result<()> {
        let mut reg = self.state.write(EVENT_LOOP_TIMEOUT_MS)?;

        let (gi, created_group) = match reg.rpc.iter().position(|g| g.module == module) {
            Some(i) => (i, false),
            None => {
                reg.rpc.push(RpcGroup { module: module.to_string(), subs: Vec::new() });
                (reg.rpc.len() - 1, true)
            }
        };

        if reg.rpc[gi].subs.iter().any(|e| e.xpath == xpath && e.cb.same(&cb)) {
            return Err(Error::Internal("duplicate RPC subscription".into()));
        }

        let path = self.cfg.sub_shm_path(module, "rpc", Some(str_hash(xpath)));
        let sub_shm = match Self::open_single_segment(&path) {
            Ok(shm) => shm,
            Err(err) => {
                if created_group {
                    reg.rpc.swap_remove(gi);
                }
                return Err(err);
            }
        };
        let entry_created = sub_shm.created();
        reg.rpc[gi].subs.push(RpcEntry { xpath: xpath.to_string(), cb, sub_shm });

        if let Err(err) = self.dir.commit_rpc_subscription(module, xpath, self.evpipe_num, true) {
            let entry = reg.rpc[gi].subs.pop().expect("entry was just pushed");
            if entry_created {
                entry.sub_shm.unlink_file();
            }
            if reg.rpc[gi].subs.is_empty() {
                reg.rpc.swap_remove(gi);
            }
            return Err(err);
        }
        Ok(())
    }

    /// Remove one RPC subscription.
    pub fn del_rpc(&self, module: &str, xpath: &str, cb: &RpcCallback) -> Result<()> {
        let mut reg = self.state.write(EVENT_LOOP_TIMEOUT_MS)?;

        let no_match = || Error::Internal("no matching RPC subscription to delete".into());
        let gi = reg.rpc.iter().position(|g| g.module == module).ok_or_else(no_match)?;
        let ei = reg.rpc[gi]
            .subs
            .iter()
            .position(|e| e.xpath == xpath && e.cb.same(cb))
            .ok_or_else(no_match)?;

        let last_removed = self.dir.commit_rpc_subscription(module, xpath, self.evpipe_num, false)?;

        let entry = reg.rpc[gi].subs.swap_remove(ei);
        if last_removed {
            entry.sub_shm.unlink_file();
        }
        if reg.rpc[gi].subs.is_empty() {
            reg.rpc.swap_remove(gi);
        }
        Ok(())
    }

    /// Subscribe to notifications of `module`, optionally limited to a
    /// `[start_time, stop_time]` window (zero means unbounded).
    pub fn add_notif(
        &self,
        module: &str,
        xpath: Option<&str>,
        start_time: i64,
        stop_time: i64,
        cb: NotifCb,
    ) -> Result<()> {
        let mut reg = self.state.write(EVENT_LOOP_TIMEOUT_MS)?;

        let (gi, created_group) = match reg.notif.iter().position(|g| g.module == module) {
            Some(i) => (i, false),
            None => {
                let path = self.cfg.sub_shm_path(module, "notif", None);
                let sub_shm = Self::open_single_segment(&path)?;
                reg.notif.push(NotifGroup {
                    module: module.to_string(),
                    sub_shm,
                    subs: Vec::new(),
                });
                (reg.notif.len() - 1, true)
            }
        };

        let group = &mut reg.notif[gi];
        if group.subs.iter().any(|e| {
            e.xpath.as_deref() == xpath
                && e.start_time == start_time
                && e.stop_time == stop_time
                && Arc::ptr_eq(&e.cb, &cb)
        }) {
            return Err(Error::Internal("duplicate notification subscription".into()));
        }
        group.subs.push(NotifEntry {
            xpath: xpath.map(str::to_string),
            start_time,
            stop_time,
            replayed: false,
            cb,
        });

        if let Err(err) = self.dir.commit_notif_subscription(module, self.evpipe_num, true) {
            let group = &mut reg.notif[gi];
            group.subs.pop();
            if group.subs.is_empty() {
                let group = reg.notif.swap_remove(gi);
                if created_group {
                    group.sub_shm.unlink_file();
                }
            }
            return Err(err);
        }
        Ok(())
    }

    /// Remove one notification subscription.
    pub fn del_notif(
        &self,
        module: &str,
        xpath: Option<&str>,
        start_time: i64,
        stop_time: i64,
        cb: &NotifCb,
    ) -> Result<()> {
        let mut reg = self.state.write(EVENT_LOOP_TIMEOUT_MS)?;

        let no_match = || Error::Internal("no matching notification subscription to delete".into());
        let gi = reg.notif.iter().position(|g| g.module == module).ok_or_else(no_match)?;
        let ei = reg.notif[gi]
            .subs
            .iter()
            .position(|e| {
                e.xpath.as_deref() == xpath
                    && e.start_time == start_time
                    && e.stop_time == stop_time
                    && Arc::ptr_eq(&e.cb, cb)
            })
            .ok_or_else(no_match)?;

        let last_removed = self.dir.commit_notif_subscription(module, self.evpipe_num, false)?;

        let group = &mut reg.notif[gi];
        group.subs.swap_remove(ei);
        if group.subs.is_empty() {
            let group = reg.notif.swap_remove(gi);
            if last_removed {
                group.sub_shm.unlink_file();
            }
        }
        Ok(())
    }

    /// Remove every subscription owned by this handle: unregister each
    /// entry from the module directory and unlink backing files whose last
    /// subscriber this was.
    ///
    /// Not transactional, but restartable: each group detaches from the
    /// registry as it finishes tearing down, so the first directory error
    /// is surfaced with already-completed groups gone for good, and a
    /// retry resumes with whatever remains.
    pub fn delete_all(&self) -> Result<()> {
        let mut reg = self.state.write(EVENT_LOOP_TIMEOUT_MS)?;

        while let Some(mut group) = reg.conf.pop() {
            let mut last_removed = false;
            while let Some(entry) = group.subs.pop() {
                match self.dir.commit_config_subscription(
                    &group.module,
                    entry.xpath.as_deref(),
                    group.ds,
                    entry.priority,
                    entry.opts,
                    self.evpipe_num,
                    false,
                ) {
                    Ok(last) => last_removed = last,
                    Err(err) => {
                        group.subs.push(entry);
                        reg.conf.push(group);
                        return Err(err);
                    }
                }
            }
            if last_removed {
                group.sub_shm.unlink_file();
            }
        }

        while let Some(mut group) = reg.data.pop() {
            while let Some(entry) = group.subs.pop() {
                match self.dir.commit_data_subscription(
                    &group.module,
                    &entry.xpath,
                    self.evpipe_num,
                    false,
                ) {
                    Ok(last) => {
                        if last {
                            entry.sub_shm.unlink_file();
                        }
                    }
                    Err(err) => {
                        group.subs.push(entry);
                        reg.data.push(group);
                        return Err(err);
                    }
                }
            }
        }

        while let Some(mut group) = reg.rpc.pop() {
            while let Some(entry) = group.subs.pop() {
                match self.dir.commit_rpc_subscription(
                    &group.module,
                    &entry.xpath,
                    self.evpipe_num,
                    false,
                ) {
                    Ok(last) => {
                        if last {
                            entry.sub_shm.unlink_file();
                        }
                    }
                    Err(err) => {
                        group.subs.push(entry);
                        reg.rpc.push(group);
                        return Err(err);
                    }
                }
            }
        }

        while let Some(mut group) = reg.notif.pop() {
            let mut last_removed = false;
            while let Some(entry) = group.subs.pop() {
                match self.dir.commit_notif_subscription(&group.module, self.evpipe_num, false) {
                    Ok(last) => last_removed = last,
                    Err(err) => {
                        group.subs.push(entry);
                        reg.notif.push(group);
                        return Err(err);
                    }
                }
            }
            if last_removed {
                group.sub_shm.unlink_file();
            }
        }

        Ok(())
    }

    /// Entries in the configuration group of `(module, ds)`; zero when the
    /// group does not exist.
    pub fn config_entry_count(&self, module: &str, ds: Datastore) -> Result<usize> {
        let reg = self.state.read(EVENT_LOOP_TIMEOUT_MS)?;
        Ok(reg
            .conf
            .iter()
            .find(|g| g.module == module && g.ds == ds)
            .map_or(0, |g| g.subs.len()))
    }

    /// Entries in the data-provide group of `module`.
    pub fn data_entry_count(&self, module: &str) -> Result<usize> {
        let reg = self.state.read(EVENT_LOOP_TIMEOUT_MS)?;
        Ok(reg.data.iter().find(|g| g.module == module).map_or(0, |g| g.subs.len()))
    }

    /// Entries in the RPC group of `module`.
    pub fn rpc_entry_count(&self, module: &str) -> Result<usize> {
        let reg = self.state.read(EVENT_LOOP_TIMEOUT_MS)?;
        Ok(reg.rpc.iter().find(|g| g.module == module).map_or(0, |g| g.subs.len()))
    }

    /// Entries in the notification group of `module`.
    pub fn notif_entry_count(&self, module: &str) -> Result<usize> {
        let reg = self.state.read(EVENT_LOOP_TIMEOUT_MS)?;
        Ok(reg.notif.iter().find(|g| g.module == module).map_or(0, |g| g.subs.len()))
    }

    /// Replay bookkeeping of a time-windowed notification subscription:
    /// true once an event inside its window has been delivered.
    pub fn notif_replayed(&self, module: &str, start_time: i64, stop_time: i64) -> Result<bool> {
        let reg = self.state.read(EVENT_LOOP_TIMEOUT_MS)?;
        Ok(reg.notif.iter().find(|g| g.module == module).is_some_and(|g| {
            g.subs
                .iter()
                .any(|e| e.start_time == start_time && e.stop_time == stop_time && e.replayed)
        }))
    }

    /// Total entries across all four kinds.
    pub fn total_subscription_count(&self) -> Result<usize> {
        let reg = self.state.read(EVENT_LOOP_TIMEOUT_MS)?;
        Ok(reg.conf.iter().map(|g| g.subs.len()).sum::<usize>()
            + reg.data.iter().map(|g| g.subs.len()).sum::<usize>()
            + reg.rpc.iter().map(|g| g.subs.len()).sum::<usize>()
            + reg.notif.iter().map(|g| g.subs.len()).sum::<usize>())
    }

    fn open_single_segment(path: &std::path::Path) -> Result<SubShm> {
        let mut shm = SubShm::open_map(path, SUB_PAYLOAD_OFF)?;
        if shm.created() {
            event::init_sub_header(&mut shm)?;
        }
        Ok(shm)
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if let Err(err) = self.delete_all() {
            tracing::warn!("subscription cleanup on drop left remnants: {err}");
        }
        self.evpipe.remove();
    }
}
