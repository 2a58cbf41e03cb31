//! Backend orchestrator
//!
//! A single-threaded event loop over the config store's watch channel. One
//! watch covers the whole `backend/<name>` subtree; per-VBD watches cover
//! each device's frontend `state` node and its `pause` node. Every event is
//! drained, dispatched by token, and the affected VBD is driven toward its
//! target channel state. Protocol failures break the VBD: the channel stops
//! and the error is published at `<backend>/tapdisk-error` for an operator.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use blktap_core::{Error, Result};
use tracing::{debug, error, info, warn};

use crate::frontend;
use crate::store::{device_printf, ConfigStore, WatchEvent};
use crate::vbd::{
    ChannelState, Progress, ShutdownState, TapClient, Vbd, VbdState, XenbusState,
};

/// Bound on drive steps per wake-up; the graph is shallow, anything deeper
/// is a cycle
const MAX_DRIVE_STEPS: u32 = 8;

/// The tapback backend process state
pub struct Backend {
    name: String,
    root: String,
    store: Arc<dyn ConfigStore + Sync>,
    tap: Box<dyn TapClient>,
    vbds: BTreeMap<(u32, u32), Vbd>,
    backend_token: String,
    stop: Arc<AtomicBool>,
}

impl Backend {
    /// Create a backend named `name` (canonically `vbd`) and register its
    /// tree watch
    pub fn new(
        name: &str,
        store: Arc<dyn ConfigStore + Sync>,
        tap: Box<dyn TapClient>,
    ) -> Result<Self> {
        let root = format!("backend/{}", name);
        let backend_token = format!("backend-{}", name);
        store.watch(&root, &backend_token)?;
        info!(name, "backend watching {}", root);
        Ok(Self {
            name: name.to_string(),
            root,
            store,
            tap,
            vbds: BTreeMap::new(),
            backend_token,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Flag checked by [`run`](Self::run); flip from a signal handler
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn vbd(&self, domid: u32, devid: u32) -> Option<&Vbd> {
        self.vbds.get(&(domid, devid))
    }

    /// Event loop: drain one event, mutate the affected channel, repeat
    pub fn run(&mut self) -> Result<()> {
        while !self.stop.load(Ordering::SeqCst) {
            match self.store.next_event(Duration::from_millis(500))? {
                Some(event) => self.handle_event(event),
                None => continue,
            }
        }
        info!("backend loop stopping");
        self.shutdown_all();
        Ok(())
    }

    /// Drive every VBD to `Closed` on the way out
    fn shutdown_all(&mut self) {
        let keys: Vec<_> = self.vbds.keys().copied().collect();
        for (domid, devid) in keys {
            if let Some(vbd) = self.vbds.get_mut(&(domid, devid)) {
                vbd.shutdown = ShutdownState::Down;
            }
            self.drive(domid, devid);
        }
    }

    /// Dispatch one fired watch by token
    pub fn handle_event(&mut self, event: WatchEvent) {
        debug!(path = %event.path, token = %event.token, "watch fired");
        if event.token == self.backend_token {
            self.backend_path_changed(&event.path);
        } else if let Some(ids) = parse_token(&event.token, "fe") {
            self.frontend_state_changed(ids.0, ids.1);
        } else if let Some(ids) = parse_token(&event.token, "pause") {
            self.pause_changed(ids.0, ids.1);
        } else {
            warn!(token = %event.token, "event with unknown token");
        }
    }

    /// Parse `backend/<name>[/<domid>[/<devid>[/<leaf>]]]` and act on it
    fn backend_path_changed(&mut self, path: &str) {
        let rest = match path.strip_prefix(&self.root) {
            Some(rest) => rest.trim_start_matches('/'),
            None => return,
        };
        let parts: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();
        match parts.as_slice() {
            [] => self.scan_all(),
            [domid] => {
                let Ok(domid) = domid.parse() else { return };
                self.scan_domain(domid);
            }
            [domid, devid] => {
                let (Ok(domid), Ok(devid)) = (domid.parse(), devid.parse()) else {
                    return;
                };
                self.probe_device(domid, devid);
            }
            [domid, devid, leaf, ..] => {
                let (Ok(domid), Ok(devid)) = (domid.parse(), devid.parse()) else {
                    return;
                };
                // A leaf write is how a new device first becomes visible;
                // probe pulls in every key at once.
                if !self.vbds.contains_key(&(domid, devid)) {
                    self.probe_device(domid, devid);
                } else {
                    self.device_leaf_changed(domid, devid, leaf);
                }
            }
        }
    }

    /// Rescan the whole backend tree
    fn scan_all(&mut self) {
        let domids: Vec<u32> = match self.store.list(&self.root) {
            Ok(names) => names.iter().filter_map(|s| s.parse().ok()).collect(),
            Err(err) => {
                warn!(error = %err, "backend scan failed");
                return;
            }
        };
        for domid in domids {
            self.scan_domain(domid);
        }
    }

    fn scan_domain(&mut self, domid: u32) {
        let dir = format!("{}/{}", self.root, domid);
        let devids: Vec<u32> = match self.store.list(&dir) {
            Ok(names) => names.iter().filter_map(|s| s.parse().ok()).collect(),
            Err(err) => {
                warn!(domid, error = %err, "domain scan failed");
                return;
            }
        };
        for devid in devids {
            self.probe_device(domid, devid);
        }
    }

    /// A device appeared, changed shape, or vanished
    fn probe_device(&mut self, domid: u32, devid: u32) {
        let device_path = format!("{}/{}/{}", self.root, domid, devid);
        let present = self.store.exists(&device_path).unwrap_or(false);

        if !present {
            self.remove_device(domid, devid);
            return;
        }

        if !self.vbds.contains_key(&(domid, devid)) {
            info!(domid, devid, "new device");
            self.vbds
                .insert((domid, devid), Vbd::new(domid, devid, device_path));
        }

        // Pull in whatever is already published; each leaf handler is
        // idempotent, so re-probing an existing device is harmless.
        for leaf in ["params", "mode", "device-type", "frontend", "physical-device",
            "hotplug-status"]
        {
            self.device_leaf_changed(domid, devid, leaf);
        }
        self.install_pause_watch(domid, devid);
        self.pause_changed(domid, devid);
    }

    fn remove_device(&mut self, domid: u32, devid: u32) {
        let Some(vbd) = self.vbds.get_mut(&(domid, devid)) else {
            return;
        };
        info!(domid, devid, "device removed");
        let frontend = vbd
            .frontend_watch
            .take()
            .zip(vbd.frontend_path.clone());
        let pause = vbd
            .pause_watch
            .take()
            .map(|t| (t, vbd.backend_path.clone()));
        vbd.shutdown = ShutdownState::Down;

        if let Some((token, path)) = frontend {
            let _ = self.store.unwatch(&format!("{}/state", path), &token);
        }
        if let Some((token, path)) = pause {
            let _ = self.store.unwatch(&format!("{}/pause", path), &token);
        }
        self.drive(domid, devid);
        self.vbds.remove(&(domid, devid));
    }

    /// One leaf under the device directory changed
    fn device_leaf_changed(&mut self, domid: u32, devid: u32, leaf: &str) {
        let result = match leaf {
            "params" => self.params_changed(domid, devid),
            "mode" => self.mode_changed(domid, devid),
            "device-type" => self.device_type_changed(domid, devid),
            "frontend" => self.frontend_path_changed(domid, devid),
            "physical-device" => self.physical_device_changed(domid, devid),
            "hotplug-status" => self.hotplug_status_changed(domid, devid),
            "pause" => {
                self.pause_changed(domid, devid);
                Ok(())
            }
            // Our own writes (state, sectors, …) come back through the
            // tree watch; nothing to do.
            _ => Ok(()),
        };
        if let Err(err) = result {
            self.break_vbd(domid, devid, &err);
        }
    }

    fn device_read(&self, domid: u32, devid: u32, leaf: &str) -> Result<Option<String>> {
        self.store
            .read(&format!("{}/{}/{}/{}", self.root, domid, devid, leaf))
    }

    fn params_changed(&mut self, domid: u32, devid: u32) -> Result<()> {
        let params = self.device_read(domid, devid, "params")?;
        if let Some(vbd) = self.vbds.get_mut(&(domid, devid)) {
            if let Some(p) = params {
                blktap_control::parse_params(&p)?;
                vbd.params = Some(p);
            }
        }
        Ok(())
    }

    fn mode_changed(&mut self, domid: u32, devid: u32) -> Result<()> {
        let mode = self.device_read(domid, devid, "mode")?;
        if let Some(vbd) = self.vbds.get_mut(&(domid, devid)) {
            vbd.mode_rw = mode.map(|m| m.contains('w')).unwrap_or(false);
        }
        Ok(())
    }

    fn device_type_changed(&mut self, domid: u32, devid: u32) -> Result<()> {
        let kind = self.device_read(domid, devid, "device-type")?;
        if let Some(vbd) = self.vbds.get_mut(&(domid, devid)) {
            vbd.cdrom = kind.as_deref() == Some("cdrom");
        }
        Ok(())
    }

    /// Record the frontend path and watch its `state` node
    fn frontend_path_changed(&mut self, domid: u32, devid: u32) -> Result<()> {
        let Some(path) = self.device_read(domid, devid, "frontend")? else {
            return Ok(());
        };
        let token = format!("fe:{}:{}", domid, devid);
        let Some(vbd) = self.vbds.get_mut(&(domid, devid)) else {
            return Ok(());
        };
        if vbd.frontend_path.as_deref() == Some(path.as_str()) {
            return Ok(());
        }
        vbd.frontend_path = Some(path.clone());
        if vbd.frontend_watch.is_none() {
            vbd.frontend_watch = Some(token.clone());
            self.store.watch(&format!("{}/state", path), &token)?;
        }
        Ok(())
    }

    /// `physical-device` carries `major:minor` in hex. Re-reading the same
    /// value across runs is fine; a changed value means someone is trying
    /// to swap the backing tapdisk, which is not supported.
    fn physical_device_changed(&mut self, domid: u32, devid: u32) -> Result<()> {
        let Some(raw) = self.device_read(domid, devid, "physical-device")? else {
            return Ok(());
        };
        let parsed = parse_physical_device(&raw)?;

        let Some(vbd) = self.vbds.get_mut(&(domid, devid)) else {
            return Ok(());
        };
        match vbd.physical_device {
            Some(existing) if existing == parsed => return Ok(()),
            Some(existing) => {
                return Err(Error::invalid_arg(format!(
                    "physical-device changed from {:x}:{:x} to {:x}:{:x}",
                    existing.0, existing.1, parsed.0, parsed.1
                )));
            }
            None => vbd.physical_device = Some(parsed),
        }
        vbd.minor = Some(parsed.1);

        // Adopt the tapdisk already serving this minor, if one exists
        if vbd.pid.is_none() {
            if let Some(pid) = self.tap.find_by_minor(parsed.1)? {
                let vbd = self.vbds.get_mut(&(domid, devid)).expect("vbd exists");
                vbd.pid = Some(pid);
                vbd.channel = ChannelState::Running;
                let (sectors, sector_size, info) = self.tap.disk_info(pid, parsed.1)?;
                let vbd = self.vbds.get_mut(&(domid, devid)).expect("vbd exists");
                vbd.sectors = sectors;
                vbd.sector_size = sector_size;
                vbd.info = info;
                info!(domid, devid, pid, minor = parsed.1, "adopted tapdisk");
            }
        }
        Ok(())
    }

    fn hotplug_status_changed(&mut self, domid: u32, devid: u32) -> Result<()> {
        let status = self.device_read(domid, devid, "hotplug-status")?;
        let connected = status.as_deref() == Some("connected");
        if let Some(vbd) = self.vbds.get_mut(&(domid, devid)) {
            vbd.hotplug_connected = connected;
        }
        if connected {
            self.drive(domid, devid);
        }
        Ok(())
    }

    fn install_pause_watch(&mut self, domid: u32, devid: u32) {
        let token = format!("pause:{}:{}", domid, devid);
        let Some(vbd) = self.vbds.get_mut(&(domid, devid)) else {
            return;
        };
        if vbd.pause_watch.is_some() {
            return;
        }
        let path = format!("{}/pause", vbd.backend_path);
        vbd.pause_watch = Some(token.clone());
        if let Err(err) = self.store.watch(&path, &token) {
            warn!(domid, devid, error = %err, "pause watch failed");
        }
    }

    /// The `pause` node requests quiesce while present; its removal resumes
    fn pause_changed(&mut self, domid: u32, devid: u32) {
        let Some(vbd) = self.vbds.get(&(domid, devid)) else {
            return;
        };
        let pause_path = format!("{}/pause", vbd.backend_path);
        let requested = self.store.exists(&pause_path).unwrap_or(false);

        let vbd = self.vbds.get_mut(&(domid, devid)).expect("vbd exists");
        match (requested, vbd.state) {
            (true, VbdState::Unpaused) => {
                vbd.state = VbdState::Pausing;
                self.drive(domid, devid);
                self.publish_pause_done(domid, devid);
            }
            (false, VbdState::Paused | VbdState::Pausing) => {
                vbd.state = VbdState::Unpaused;
                let backend_path = vbd.backend_path.clone();
                let _ = self.store.rm(&format!("{}/pause-done", backend_path));
                self.drive(domid, devid);
            }
            _ => {}
        }
    }

    fn publish_pause_done(&mut self, domid: u32, devid: u32) {
        let Some(vbd) = self.vbds.get(&(domid, devid)) else {
            return;
        };
        if vbd.state == VbdState::Paused {
            let path = vbd.backend_path.clone();
            if let Err(err) = device_printf(&*self.store, &path, "pause-done", true, "")
            {
                warn!(domid, devid, error = %err, "pause-done write failed");
            }
        }
    }

    /// A frontend `state` watch fired: re-read and act
    fn frontend_state_changed(&mut self, domid: u32, devid: u32) {
        let Some(vbd) = self.vbds.get(&(domid, devid)) else {
            return;
        };
        let Some(frontend_path) = vbd.frontend_path.clone() else {
            return;
        };
        let state = match self.store.read(&format!("{}/state", frontend_path)) {
            Ok(Some(raw)) => raw
                .trim()
                .parse()
                .ok()
                .and_then(XenbusState::from_u32)
                .unwrap_or(XenbusState::Unknown),
            Ok(None) => return,
            Err(err) => {
                warn!(domid, devid, error = %err, "frontend state unreadable");
                return;
            }
        };

        let vbd = self.vbds.get_mut(&(domid, devid)).expect("vbd exists");
        let result =
            frontend::frontend_changed(&*self.store, vbd, self.tap.as_mut(), state);
        if let Err(err) = result {
            self.break_vbd(domid, devid, &err);
        }
    }

    /// Drive one VBD toward its target, then re-run a pending handshake
    fn drive(&mut self, domid: u32, devid: u32) {
        for _ in 0..MAX_DRIVE_STEPS {
            let Some(vbd) = self.vbds.get_mut(&(domid, devid)) else {
                return;
            };
            let was = vbd.channel;
            match vbd.drive(self.tap.as_mut()) {
                Ok(Progress::Done) => break,
                Ok(Progress::Again) => {
                    let now = self.vbds.get(&(domid, devid)).map(|v| v.channel);
                    if now == Some(was) {
                        // Busy or waiting on missing config; later events
                        // will wake us again.
                        return;
                    }
                }
                Err(err) => {
                    self.break_vbd(domid, devid, &err);
                    return;
                }
            }
        }

        // The tapdisk may have come up after the frontend advertised its
        // ring; finish the handshake now.
        let pending = self.vbds.get(&(domid, devid)).and_then(|vbd| {
            (vbd.channel == ChannelState::Running)
                .then(|| vbd.frontend_path.clone())
                .flatten()
        });
        if let Some(frontend_path) = pending {
            let connected = self
                .store
                .read(&format!("{}/state", frontend_path))
                .ok()
                .flatten()
                .and_then(|raw| raw.trim().parse().ok())
                .and_then(XenbusState::from_u32)
                .map(|s| matches!(s, XenbusState::Initialised | XenbusState::Connected))
                .unwrap_or(false);
            if connected {
                self.frontend_state_changed(domid, devid);
            }
        }
    }

    /// Protocol failure: stop the channel and leave a note for an operator
    fn break_vbd(&mut self, domid: u32, devid: u32, err: &Error) {
        error!(domid, devid, error = %err, "VBD broken");
        let Some(vbd) = self.vbds.get_mut(&(domid, devid)) else {
            return;
        };
        vbd.state = VbdState::Broken;
        let path = vbd.backend_path.clone();
        let _ = device_printf(
            &*self.store,
            &path,
            "tapdisk-error",
            true,
            &err.to_string(),
        );
    }
}

/// Parse a `<tag>:<domid>:<devid>` watch token
fn parse_token(token: &str, tag: &str) -> Option<(u32, u32)> {
    let rest = token.strip_prefix(tag)?.strip_prefix(':')?;
    let (domid, devid) = rest.split_once(':')?;
    Some((domid.parse().ok()?, devid.parse().ok()?))
}

/// Parse the hex `major:minor` of a `physical-device` node
fn parse_physical_device(raw: &str) -> Result<(u32, u32)> {
    let (major, minor) = raw
        .trim()
        .split_once(':')
        .ok_or_else(|| Error::format(format!("malformed physical-device '{}'", raw)))?;
    let major = u32::from_str_radix(major, 16)
        .map_err(|_| Error::format(format!("bad major in '{}'", raw)))?;
    let minor = u32::from_str_radix(minor, 16)
        .map_err(|_| Error::format(format!("bad minor in '{}'", raw)))?;
    Ok((major, minor))
}
