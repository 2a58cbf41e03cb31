//! Orchestrator scenarios: a management agent and a guest frontend drive
//! the store, a mock tapdisk records what the backend asks of it.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use blktap_backend::{
    Backend, ChannelState, ConfigStore, MemStore, RingInfo, TapClient, VbdState,
};
use blktap_core::Result;

const BE: &str = "backend/vbd/1/51712";
const FE: &str = "device/vbd/51712";

#[derive(Default)]
struct TapLog {
    calls: Vec<String>,
}

#[derive(Clone)]
struct MockTap {
    log: Arc<Mutex<TapLog>>,
}

impl MockTap {
    fn new() -> Self {
        Self {
            log: Arc::new(Mutex::new(TapLog::default())),
        }
    }

    fn calls(&self) -> Vec<String> {
        self.log.lock().unwrap().calls.clone()
    }

    fn record(&self, call: impl Into<String>) {
        self.log.lock().unwrap().calls.push(call.into());
    }
}

impl TapClient for MockTap {
    fn find_by_minor(&mut self, _minor: u32) -> Result<Option<i32>> {
        Ok(None)
    }
    fn create(&mut self) -> Result<(i32, u32)> {
        self.record("create");
        Ok((100, 0))
    }
    fn open(&mut self, _: i32, _: u32, params: &str, rw: bool) -> Result<()> {
        self.record(format!("open {} rw={}", params, rw));
        Ok(())
    }
    fn pause(&mut self, _: i32, _: u32) -> Result<()> {
        self.record("pause");
        Ok(())
    }
    fn resume(&mut self, _: i32, _: u32) -> Result<()> {
        self.record("resume");
        Ok(())
    }
    fn close(&mut self, _: i32, _: u32, force: bool) -> Result<()> {
        self.record(format!("close force={}", force));
        Ok(())
    }
    fn detach_free(&mut self, _: i32, _: u32) -> Result<()> {
        self.record("detach_free");
        Ok(())
    }
    fn disk_info(&mut self, _: i32, _: u32) -> Result<(u64, u32, u32)> {
        Ok((8192, 512, 0))
    }
    fn connect_ring(
        &mut self,
        _: i32,
        _: u32,
        domid: u32,
        devid: u32,
        ring: &RingInfo,
    ) -> Result<()> {
        self.record(format!(
            "connect_ring {}:{} grefs={:?} port={}",
            domid, devid, ring.grefs, ring.event_channel
        ));
        Ok(())
    }
    fn disconnect_ring(&mut self, _: i32, _: u32, domid: u32, devid: u32) -> Result<()> {
        self.record(format!("disconnect_ring {}:{}", domid, devid));
        Ok(())
    }
}

struct Rig {
    store: Arc<MemStore>,
    backend: Backend,
    tap: MockTap,
}

impl Rig {
    fn new() -> Self {
        let store = Arc::new(MemStore::new());
        let tap = MockTap::new();
        let backend =
            Backend::new("vbd", store.clone(), Box::new(tap.clone())).unwrap();
        let mut rig = Self {
            store,
            backend,
            tap,
        };
        rig.pump();
        rig
    }

    /// Drain every pending watch event through the backend
    fn pump(&mut self) {
        while let Some(event) =
            self.store.next_event(Duration::from_millis(5)).unwrap()
        {
            self.backend.handle_event(event);
        }
    }

    fn read(&self, path: &str) -> Option<String> {
        self.store.read(path).unwrap()
    }

    /// The toolstack's half of device setup
    fn announce_device(&mut self) {
        self.store.write(&format!("{}/params", BE), "vhd:/a.vhd").unwrap();
        self.store.write(&format!("{}/mode", BE), "w").unwrap();
        self.store.write(&format!("{}/frontend", BE), FE).unwrap();
        self.store.write(&format!("{}/frontend-id", BE), "1").unwrap();
        self.pump();
        self.store
            .write(&format!("{}/physical-device", BE), "fe:0")
            .unwrap();
        self.store
            .write(&format!("{}/hotplug-status", BE), "connected")
            .unwrap();
        self.pump();
    }

    /// The guest's half: advertise a ring and walk the states
    fn frontend_advertise(&mut self) {
        self.store.write(&format!("{}/ring-ref", FE), "42").unwrap();
        self.store.write(&format!("{}/event-channel", FE), "7").unwrap();
        self.store
            .write(&format!("{}/protocol", FE), "x86_64-abi")
            .unwrap();
        self.pump();
    }

    fn frontend_state(&mut self, state: u32) {
        self.store
            .write(&format!("{}/state", FE), &state.to_string())
            .unwrap();
        self.pump();
    }
}

#[test]
fn test_happy_path_publishes_geometry_and_connects() {
    let mut rig = Rig::new();
    rig.announce_device();

    // The tapdisk came up as soon as hotplug blessed the device
    let vbd = rig.backend.vbd(1, 51712).unwrap();
    assert_eq!(vbd.channel, ChannelState::Running);
    assert!(rig.tap.calls().contains(&"create".to_string()));
    assert!(rig
        .tap
        .calls()
        .contains(&"open vhd:/a.vhd rw=true".to_string()));

    rig.frontend_advertise();
    rig.frontend_state(1); // Initialising
    assert_eq!(rig.read(&format!("{}/state", BE)), Some("2".into())); // InitWait

    rig.frontend_state(3); // Initialised
    assert_eq!(rig.read(&format!("{}/sectors", BE)), Some("8192".into()));
    assert_eq!(rig.read(&format!("{}/sector-size", BE)), Some("512".into()));
    assert_eq!(rig.read(&format!("{}/info", BE)), Some("0".into()));
    assert_eq!(rig.read(&format!("{}/state", BE)), Some("4".into())); // Connected
    assert!(rig
        .tap
        .calls()
        .iter()
        .any(|c| c.starts_with("connect_ring 1:51712 grefs=[42] port=7")));
}

#[test]
fn test_full_handshake_emits_each_state_once() {
    let mut rig = Rig::new();
    rig.announce_device();
    rig.frontend_advertise();

    let mut states = Vec::new();
    for fe_state in [1u32, 3, 5, 6] {
        rig.frontend_state(fe_state);
        states.push(rig.read(&format!("{}/state", BE)).unwrap());
    }
    assert_eq!(states, vec!["2", "4", "5", "6"]);
    let disconnects = rig
        .tap
        .calls()
        .iter()
        .filter(|c| c.starts_with("disconnect_ring"))
        .count();
    assert_eq!(disconnects, 1);
}

#[test]
fn test_frontend_before_tapdisk_still_connects() {
    let mut rig = Rig::new();
    // Guest races ahead: ring advertised and Initialised before the
    // backend has a tapdisk.
    rig.store.write(&format!("{}/params", BE), "vhd:/a.vhd").unwrap();
    rig.store.write(&format!("{}/mode", BE), "w").unwrap();
    rig.store.write(&format!("{}/frontend", BE), FE).unwrap();
    rig.pump();
    rig.frontend_advertise();
    rig.frontend_state(3);
    assert_eq!(rig.read(&format!("{}/state", BE)), None);

    // Now hotplug completes; the drive pass finishes the handshake too
    rig.store
        .write(&format!("{}/hotplug-status", BE), "connected")
        .unwrap();
    rig.pump();
    assert_eq!(rig.read(&format!("{}/state", BE)), Some("4".into()));
}

#[test]
fn test_physical_device_change_rejected() {
    let mut rig = Rig::new();
    rig.announce_device();

    // Same value is tolerated (tapback restart)
    rig.store
        .write(&format!("{}/physical-device", BE), "fe:0")
        .unwrap();
    rig.pump();
    assert_eq!(rig.read(&format!("{}/tapdisk-error", BE)), None);

    // A different value is a swap attempt; the VBD breaks
    rig.store
        .write(&format!("{}/physical-device", BE), "fd:1")
        .unwrap();
    rig.pump();
    assert!(rig.read(&format!("{}/tapdisk-error", BE)).is_some());
    assert_eq!(rig.backend.vbd(1, 51712).unwrap().state, VbdState::Broken);
}

#[test]
fn test_pause_node_quiesces_and_reports() {
    let mut rig = Rig::new();
    rig.announce_device();

    rig.store.write(&format!("{}/pause", BE), "").unwrap();
    rig.pump();
    let vbd = rig.backend.vbd(1, 51712).unwrap();
    assert_eq!(vbd.channel, ChannelState::Paused);
    assert_eq!(vbd.state, VbdState::Paused);
    assert_eq!(rig.read(&format!("{}/pause-done", BE)), Some("".into()));
    assert!(rig.tap.calls().contains(&"pause".to_string()));

    rig.store.rm(&format!("{}/pause", BE)).unwrap();
    rig.pump();
    let vbd = rig.backend.vbd(1, 51712).unwrap();
    assert_eq!(vbd.channel, ChannelState::Running);
    assert_eq!(rig.read(&format!("{}/pause-done", BE)), None);
    assert!(rig.tap.calls().contains(&"resume".to_string()));
}

#[test]
fn test_device_removal_closes_channel() {
    let mut rig = Rig::new();
    rig.announce_device();
    assert!(rig.backend.vbd(1, 51712).is_some());

    rig.store.rm(BE).unwrap();
    rig.pump();
    assert!(rig.backend.vbd(1, 51712).is_none());
    assert!(rig.tap.calls().contains(&"close force=false".to_string()));
    assert!(rig.tap.calls().contains(&"detach_free".to_string()));
}
