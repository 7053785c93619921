// Thin daemon shim: owns a `/dev/dri/cardN` fd, binds one
// `hwcomposer_drm::DrmController` per connected connector, and forwards the
// kernel's page-flip-complete events into each display's queue.
//
// The windowing compositor this shim would actually sit behind (content
// submission, layer composition policy) is out of scope here; `main` below
// only proves the pipeline runs end to end against real hardware.

use std::env;
use std::os::fd::AsFd;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use drm::control::Device as ControlDevice;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use hwcomposer::buffer_manager::BufferManager;
use hwcomposer::content::Connection;
use hwcomposer::{GlobalScalingArbiter, PhysicalDisplay};
use hwcomposer_drm::{Card, DrmAllocator, DrmController, SinglePlaneComposer};

fn init_tracing() {
    let filter = EnvFilter::try_from_env("HWCOMPOSERD_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter).with(tracing_subscriber::fmt::layer());

    #[cfg(feature = "tracy")]
    let registry = registry.with(tracing_tracy::TracyLayer::default());

    registry.init();
}

fn card_path() -> String {
    env::var("HWCOMPOSERD_CARD").unwrap_or_else(|_| "/dev/dri/card0".to_string())
}

fn main() -> Result<()> {
    init_tracing();

    let card = Arc::new(Card::open(card_path()).context("opening drm device")?);
    let resources = card.resource_handles().context("reading drm resource handles")?;

    let mut displays = Vec::new();
    for (index, &connector_id) in resources.connectors().iter().enumerate() {
        let info = card.get_connector(connector_id, false).context("reading connector info")?;
        if info.state() != drm::control::connector::State::Connected {
            continue;
        }

        let controller = Arc::new(DrmController::new(card.clone(), connector_id).context("binding drm controller")?);
        let composer = Arc::new(SinglePlaneComposer::new(controller.plane_id()));
        let allocator = Arc::new(DrmAllocator::new(card.clone()));
        let buffer_manager = Arc::new(BufferManager::new(allocator));

        let display = PhysicalDisplay::new(
            index as u32,
            format!("connector-{}", Into::<u32>::into(connector_id)),
            controller.clone() as Arc<dyn hwcomposer::traits::DisplayController>,
            composer,
            buffer_manager,
            GlobalScalingArbiter::new(),
        );
        display.start();
        display.handle_hotplug_attach(Connection {
            connector_id: connector_id.into(),
            crtc_id: controller.crtc_id(),
            pipe_index: index as u32,
            has_pipe: true,
            connected: true,
        })?;

        info!(connector = Into::<u32>::into(connector_id), "display online");
        displays.push(display);
    }

    if displays.is_empty() {
        warn!("no connected connectors found, exiting");
        return Ok(());
    }

    event_loop(&card, &displays)
}

/// Block on the card fd for page-flip completions and fan each one out to
/// every display; a real multi-card setup would demux by crtc id instead of
/// notifying all displays, but a single `/dev/dri/cardN` only ever has one
/// event source here.
fn event_loop(card: &Card, displays: &[Arc<PhysicalDisplay>]) -> Result<()> {
    loop {
        let mut fds = [nix::poll::PollFd::new(card.as_fd(), nix::poll::PollFlags::POLLIN)];
        let timeout = nix::poll::PollTimeout::try_from(Duration::from_secs(5).as_millis() as u16).unwrap_or(nix::poll::PollTimeout::MAX);
        match nix::poll::poll(&mut fds, timeout) {
            Ok(0) => continue,
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(anyhow::anyhow!("poll on drm fd failed: {e}")),
        }

        for event in card.receive_events().context("reading drm events")? {
            if let drm::control::Event::PageFlip(_) = event {
                for display in displays {
                    if let Err(e) = display.notify_flip_complete() {
                        warn!(error = %e, "notify_flip_complete failed");
                    }
                }
            }
        }
    }
}
