/* udev hot-plug monitor.
 *
 * Watches the usb subsystem and nudges the registry with a Scan
 * command whenever a transceiver appears.  Disappearances need no
 * help: the device's own reader notices ENODEV and the worker
 * unwinds.  The monitor socket is polled on a blocking task with a
 * one second tick so the task can notice the daemon going away. */

use std::os::fd::{AsRawFd, BorrowedFd};

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::registry::Command;
use crate::usb;

pub fn spawn(commands: mpsc::Sender<Command>) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || run(commands))
}

fn run(commands: mpsc::Sender<Command>) {
    let socket = match udev::MonitorBuilder::new()
        .and_then(|m| m.match_subsystem_devtype("usb", "usb_device"))
        .and_then(|m| m.listen())
    {
        Ok(socket) => socket,
        Err(e) => {
            warn!("cannot listen for hotplug events: {e}");
            return;
        }
    };

    info!("watching for hotplug events");
    let raw_fd = socket.as_raw_fd();

    while !commands.is_closed() {
        /* SAFETY: `socket` outlives the poll call, so the borrowed fd
         * stays valid. */
        let fd = unsafe { BorrowedFd::borrow_raw(raw_fd) };
        let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];

        match poll(&mut fds, PollTimeout::from(1000u16)) {
            Ok(0) => continue,
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => {
                warn!("hotplug poll failed: {e}");
                return;
            }
        }

        for event in socket.iter() {
            if event.event_type() != udev::EventType::Add {
                continue;
            }
            if !is_supported_event(&event) {
                continue;
            }

            debug!("hotplug: transceiver attached, requesting scan");
            if commands.blocking_send(Command::Scan).is_err() {
                return;
            }
        }
    }
}

fn is_supported_event(event: &udev::Event) -> bool {
    let vendor = read_hex_attribute(event.device(), "idVendor");
    let product = read_hex_attribute(event.device(), "idProduct");
    match (vendor, product) {
        (Some(v), Some(p)) => usb::is_supported(v, p),
        _ => false,
    }
}

fn read_hex_attribute(device: udev::Device, name: &str) -> Option<u16> {
    let value = device.attribute_value(name)?;
    u16::from_str_radix(value.to_str()?, 16).ok()
}
