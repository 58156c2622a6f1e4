//! Device I/O adapter: opens/grabs the evdev input device, clones it into a
//! virtual uinput output device, and implements `core::InputSource`/
//! `sink::OutputSink` against real hardware.
//!
//! This is the one module that knows about `/dev/input`, uinput, and the
//! evdev wire format; `core::Engine` never touches any of it directly.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use anyhow::{Context, Result};
use evdev_rs::enums::{EventCode, EV_KEY, EV_SYN};
use evdev_rs::{Device, DeviceWrapper, GrabMode, InputEvent, ReadFlag, ReadStatus, TimeVal, UInputDevice};
use log::{debug, info, trace, warn};

use crate::clock::{Clock, Instant, MonotonicClock};
use crate::config::Config;
use crate::core::{InputSource, PollOutcome, RawEvent};
use crate::sink::OutputSink;

/// How long to wait, after opening the device but before grabbing it, for
/// the terminating up-edge of the launching keystroke (typically Enter) to
/// pass through ungrabbed.
const STARTUP_GRAB_DELAY: Duration = Duration::from_millis(100);

/// Maps raw `u16` codes (the only vocabulary `core::Engine` speaks) back to
/// `evdev_rs::EventCode` (which `UInputDevice::write_event` requires).
/// Pre-seeded from the config's `enabled_codes`; also grows as new codes are
/// observed on the input stream, so arbitrary passthrough keys work too.
/// Shared between `InputDevice` and `UinputSink` since they are borrowed
/// independently by `core::Engine::run`.
#[derive(Clone, Default)]
struct CodeTable(Rc<RefCell<HashMap<u16, EventCode>>>);

impl CodeTable {
    fn seed(codes: &[EventCode]) -> Self {
        let table = Self::default();
        for code in codes {
            table.observe(code);
        }
        table
    }

    fn observe(&self, code: &EventCode) {
        if let EventCode::EV_KEY(k) = code.clone() {
            self.0.borrow_mut().insert(k as u16, code.clone());
        }
    }

    fn resolve(&self, code: u16) -> Option<EventCode> {
        self.0.borrow().get(&code).cloned()
    }
}

/// Enumerates `/dev/input/event*`, printing each device's name and path.
/// Diagnostic helper for the `list-devices` CLI subcommand; not part of the
/// core's contract.
pub fn list_devices() -> Result<()> {
    let mut entries: Vec<PathBuf> = fs::read_dir("/dev/input")
        .context("reading /dev/input")?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("event"))
        })
        .collect();
    entries.sort();

    for path in entries {
        match File::open(&path).ok().and_then(|f| Device::new_from_file(f).ok()) {
            Some(device) => {
                let name = device
                    .name()
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| "<unnamed>".to_string());
                println!("{}\t{}", path.display(), name);
            }
            None => {
                debug!("skipping {}: could not open as an evdev device", path.display());
            }
        }
    }
    Ok(())
}

/// The real evdev input source: a grabbed `Device` plus the raw fd used for
/// readiness polling.
pub struct InputDevice {
    device: Device,
    raw_fd: RawFd,
    codes: CodeTable,
}

/// The real uinput output sink: the cloned device every synthetic edge is
/// written to.
pub struct UinputSink {
    output: UInputDevice,
    codes: CodeTable,
}

/// Opens `path`, enables every code the config references, clones it into a
/// uinput device, waits `STARTUP_GRAB_DELAY`, then grabs the input device
/// exclusively, in that order.
pub fn open_and_grab<P: AsRef<Path>>(path: P, config: &Config) -> Result<(InputDevice, UinputSink)> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let raw_fd = file.as_raw_fd();

    let mut input_device = Device::new_from_file(file)
        .with_context(|| format!("creating evdev Device from {}", path.display()))?;
    input_device.set_name(&format!("janus-remap virtual input for {}", path.display()));

    let codes = CodeTable::seed(&config.enabled_codes);
    for code in &config.enabled_codes {
        input_device
            .enable(code.clone())
            .with_context(|| format!("enabling {:?} on the cloned device", code))?;
    }

    let output = UInputDevice::create_from_device(&input_device)
        .with_context(|| format!("creating uinput device cloned from {}", path.display()))?;

    info!("short delay before grabbing: release any keys now");
    std::thread::sleep(STARTUP_GRAB_DELAY);

    input_device
        .grab(GrabMode::Grab)
        .with_context(|| format!("grabbing exclusive access on {}", path.display()))?;

    Ok((
        InputDevice {
            device: input_device,
            raw_fd,
            codes: codes.clone(),
        },
        UinputSink { output, codes },
    ))
}

impl InputDevice {
    /// Milliseconds to pass to `poll(2)`: `-1` to wait forever, `0` if the
    /// deadline has already passed, else the remaining time.
    fn timeout_ms(&self, deadline: Option<Instant>) -> i32 {
        match deadline {
            None => -1,
            Some(d) => {
                let now = MonotonicClock.now();
                if d <= now {
                    0
                } else {
                    d.sub(now).as_millis().min(i32::MAX as u128) as i32
                }
            }
        }
    }

    fn wait_readable(&self, timeout_ms: i32) -> io::Result<bool> {
        loop {
            let mut pfd = libc::pollfd {
                fd: self.raw_fd,
                events: libc::POLLIN,
                revents: 0,
            };
            let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            return Ok(rc > 0);
        }
    }

    /// Drains events in sync mode until the kernel reports the backlog is
    /// exhausted, per libevdev's documented resync protocol. Every event
    /// read here is discarded without transformation: dropped input is
    /// recoverable, not fatal.
    fn drain_resync(&mut self) -> Result<()> {
        loop {
            match self.device.next_event(ReadFlag::SYNC) {
                Ok((ReadStatus::Sync, ev)) => {
                    trace!("resync drain: {:?}", ev);
                }
                Ok((ReadStatus::Success, ev)) => {
                    trace!("resync drain: {:?}", ev);
                }
                Err(e) if e.raw_os_error() == Some(libc::EAGAIN) => return Ok(()),
                Err(e) => return Err(e).context("draining resync backlog"),
            }
        }
    }
}

impl InputSource for InputDevice {
    fn poll(&mut self, deadline: Option<Instant>) -> Result<PollOutcome> {
        loop {
            let timeout_ms = self.timeout_ms(deadline);
            if !self.wait_readable(timeout_ms)? {
                return Ok(PollOutcome::TimedOut);
            }

            match self.device.next_event(ReadFlag::NORMAL) {
                Ok((ReadStatus::Success, ev)) => match ev.event_code.clone() {
                    EventCode::EV_KEY(k) => {
                        self.codes.observe(&ev.event_code);
                        return Ok(PollOutcome::Ready(RawEvent::new(k as u16, ev.value as u8)));
                    }
                    // EV_SYN/EV_MSC/etc. carry no (code, value) the core
                    // transforms, so they are simply not forwarded.
                    _ => continue,
                },
                Ok((ReadStatus::Sync, _first)) => {
                    warn!("input dropped events, resyncing");
                    self.drain_resync()?;
                    info!("resynced");
                    return Ok(PollOutcome::Resynced);
                }
                Err(e) if e.raw_os_error() == Some(libc::EAGAIN) => return Ok(PollOutcome::TimedOut),
                Err(e) if e.raw_os_error() == Some(libc::ENODEV) => return Ok(PollOutcome::Eof),
                Err(e) => return Err(e).context("reading next input event"),
            }
        }
    }
}

impl UinputSink {
    fn write_event(&self, code: EventCode, value: i32) -> Result<()> {
        let time = TimeVal::new(0, 0);
        self.output
            .write_event(&InputEvent::new(&time, &code, value))
            .context("writing EV_KEY event")?;
        self.output
            .write_event(&InputEvent::new(
                &time,
                &EventCode::EV_SYN(EV_SYN::SYN_REPORT),
                0,
            ))
            .context("writing EV_SYN SYN_REPORT event")?;
        Ok(())
    }
}

impl OutputSink for UinputSink {
    fn emit(&mut self, code: u16, value: u8) -> Result<()> {
        let event_code = self
            .codes
            .resolve(code)
            .ok_or_else(|| anyhow::anyhow!("no EventCode registered for key {code}"))?;
        trace!("OUT code={code} value={value}");
        self.write_event(event_code, value as i32)
    }
}

/// All known `EV_KEY` codes, for the `list-keys` CLI subcommand.
pub fn all_keys() -> Vec<String> {
    let mut keys: Vec<String> = EventCode::EV_KEY(EV_KEY::KEY_RESERVED)
        .iter()
        .filter_map(|code| match code {
            EventCode::EV_KEY(_) => Some(format!("{code}")),
            _ => None,
        })
        .collect();
    keys.sort();
    keys
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_table_round_trips_key_codes() {
        let table = CodeTable::seed(&[EventCode::EV_KEY(EV_KEY::KEY_CAPSLOCK)]);
        assert_eq!(
            table.resolve(EV_KEY::KEY_CAPSLOCK as u16),
            Some(EventCode::EV_KEY(EV_KEY::KEY_CAPSLOCK))
        );
        assert_eq!(table.resolve(EV_KEY::KEY_ESC as u16), None);
    }

    #[test]
    fn code_table_observe_grows_the_map() {
        let table = CodeTable::default();
        table.observe(&EventCode::EV_KEY(EV_KEY::KEY_A));
        assert_eq!(table.resolve(EV_KEY::KEY_A as u16), Some(EventCode::EV_KEY(EV_KEY::KEY_A)));
    }
}
