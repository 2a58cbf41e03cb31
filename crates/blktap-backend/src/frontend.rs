//! Frontend handshake
//!
//! The backend follows the guest frontend through the XenBus state graph:
//! `Initialising` is answered with `InitWait`; once the frontend reports
//! `Initialised` (or `Connected`, on reconnect) its ring parameters are read
//! and handed to the tapdisk, and the backend publishes geometry and goes
//! `Connected`; `Closing`/`Closed` wind the connection back down.

use blktap_core::{Error, Result};
use tracing::{debug, info, warn};

use crate::store::{device_printf, read_parse, read_parse_required, ConfigStore};
use crate::vbd::{RingInfo, TapClient, Vbd, XenbusState};

/// Write the backend's own `state` node
pub fn switch_backend_state(
    store: &dyn ConfigStore,
    vbd: &Vbd,
    state: XenbusState,
) -> Result<()> {
    debug!(
        domid = vbd.domid,
        devid = vbd.devid,
        state = ?state,
        "switching backend state"
    );
    device_printf(
        store,
        &vbd.backend_path,
        "state",
        true,
        &(state as u32).to_string(),
    )
}

/// React to one frontend state transition
pub fn frontend_changed(
    store: &dyn ConfigStore,
    vbd: &mut Vbd,
    tap: &mut dyn TapClient,
    state: XenbusState,
) -> Result<()> {
    debug!(
        domid = vbd.domid,
        devid = vbd.devid,
        frontend = ?state,
        "frontend changed"
    );
    match state {
        XenbusState::Initialising => {
            switch_backend_state(store, vbd, XenbusState::InitWait)
        }
        XenbusState::Initialised | XenbusState::Connected => {
            connect_tap(store, vbd, tap)
        }
        XenbusState::Closing => switch_backend_state(store, vbd, XenbusState::Closing),
        XenbusState::Closed => backend_close(store, vbd, tap),
        XenbusState::Unknown | XenbusState::InitWait => Ok(()),
    }
}

/// Read the ring advertisement from the frontend directory
pub fn read_ring_info(store: &dyn ConfigStore, frontend_path: &str) -> Result<RingInfo> {
    let order: u32 =
        read_parse(store, &format!("{}/ring-page-order", frontend_path))?.unwrap_or(0);
    let pages = 1usize << order;

    let mut grefs = Vec::with_capacity(pages);
    if order == 0 {
        grefs.push(read_parse_required(
            store,
            &format!("{}/ring-ref", frontend_path),
        )?);
    } else {
        for i in 0..pages {
            grefs.push(read_parse_required(
                store,
                &format!("{}/ring-ref{}", frontend_path, i),
            )?);
        }
    }

    let event_channel =
        read_parse_required(store, &format!("{}/event-channel", frontend_path))?;
    let protocol = store.read(&format!("{}/protocol", frontend_path))?;
    let feature_persistent = read_parse::<u32>(
        store,
        &format!("{}/feature-persistent", frontend_path),
    )?
    .unwrap_or(0)
        != 0;

    Ok(RingInfo {
        grefs,
        order,
        event_channel,
        protocol,
        feature_persistent,
    })
}

/// `EALREADY` from the tapdisk: the ring is connected from a previous run
/// of this backend, which is success on restart.
fn is_already_connected(err: &Error) -> bool {
    matches!(err, Error::Io(e) if e.raw_os_error() == Some(libc::EALREADY))
}

/// Bind the tapdisk to the advertised ring and publish geometry
fn connect_tap(store: &dyn ConfigStore, vbd: &mut Vbd, tap: &mut dyn TapClient) -> Result<()> {
    let (Some(pid), Some(minor)) = (vbd.pid, vbd.minor) else {
        // The tapdisk is not up yet; the next drive pass will get there
        // and re-run the handshake.
        debug!(
            domid = vbd.domid,
            devid = vbd.devid,
            "frontend ready before tapdisk, deferring connect"
        );
        return Ok(());
    };
    let frontend_path = vbd
        .frontend_path
        .clone()
        .ok_or_else(|| Error::state("no frontend path recorded"))?;

    let ring = read_ring_info(store, &frontend_path)?;
    match tap.connect_ring(pid, minor, vbd.domid, vbd.devid, &ring) {
        Ok(()) => {}
        Err(err) if is_already_connected(&err) => {
            info!(
                domid = vbd.domid,
                devid = vbd.devid,
                "ring already connected (backend restart)"
            );
        }
        Err(err) => return Err(err),
    }

    device_printf(
        store,
        &vbd.backend_path,
        "sectors",
        true,
        &vbd.sectors.to_string(),
    )?;
    device_printf(
        store,
        &vbd.backend_path,
        "sector-size",
        true,
        &vbd.sector_size.to_string(),
    )?;
    device_printf(store, &vbd.backend_path, "info", true, &vbd.info.to_string())?;
    switch_backend_state(store, vbd, XenbusState::Connected)?;
    info!(
        domid = vbd.domid,
        devid = vbd.devid,
        pid,
        minor,
        "backend connected"
    );
    Ok(())
}

/// Frontend went `Closed`: unbind the ring, then follow
fn backend_close(store: &dyn ConfigStore, vbd: &mut Vbd, tap: &mut dyn TapClient) -> Result<()> {
    if let (Some(pid), Some(minor)) = (vbd.pid, vbd.minor) {
        if let Err(err) = tap.disconnect_ring(pid, minor, vbd.domid, vbd.devid) {
            warn!(
                domid = vbd.domid,
                devid = vbd.devid,
                error = %err,
                "ring disconnect failed"
            );
        }
    }
    switch_backend_state(store, vbd, XenbusState::Closed)
}
