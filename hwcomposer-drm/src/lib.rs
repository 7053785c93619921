// Concrete `/dev/dri/cardN` binding for `hwcomposer::traits::DisplayController`
// and `hwcomposer::traits::BufferAllocator`. The core crate never touches a
// kernel ioctl directly; everything here exists to satisfy those two traits
// with the real `drm` crate.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::path::Path;
use std::sync::Arc;

use drm::control::{
    self, AtomicCommitFlags, Device as ControlDevice, atomic::AtomicModeReq,
    connector, crtc, plane, property,
};
use drm::{ClientCapability, Device as BasicDevice};
use drm_fourcc::DrmFourcc;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

use hwcomposer::content::DeviceId;
use hwcomposer::traits::{
    BufferAllocator, BufferDetails, BufferUsage, CommitRequest, DisplayCaps, DisplayController, Dpms,
};

#[derive(Debug, Error)]
pub enum DrmBackendError {
    #[error("failed to open {path}: {source}")]
    Open { path: String, source: std::io::Error },

    #[error("no CRTC available for connector {0:?}")]
    NoCrtc(connector::Handle),

    #[error("no primary plane compatible with crtc {0:?}")]
    NoPrimaryPlane(crtc::Handle),

    #[error("drm ioctl failed: {0}")]
    Ioctl(#[from] std::io::Error),

    #[error("required property {0:?} missing on object {1:?}")]
    MissingProperty(&'static str, u32),

    #[error("invalid (zero) drm resource handle {0}")]
    InvalidHandle(u32),
}

/// An open DRM device file. Implements the two marker traits the `drm` crate
/// uses to scope its ioctl wrappers; holds no other state itself.
#[derive(Debug)]
pub struct Card(File);

impl AsFd for Card {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl BasicDevice for Card {}
impl ControlDevice for Card {}

impl AsRawFd for Card {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

impl Card {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DrmBackendError> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| DrmBackendError::Open { path: path.display().to_string(), source })?;
        Ok(Self(file))
    }
}

fn properties_by_name<D: ControlDevice>(
    card: &D,
    object: impl control::ResourceHandle,
) -> Result<HashMap<String, property::Info>, DrmBackendError> {
    Ok(card.get_properties(object)?.as_hashmap(card)?)
}

/// One CRTC/connector/primary-plane triple this backend drives, with its
/// property ids cached once at startup.
pub struct DrmController {
    card: Arc<Card>,
    connector_id: connector::Handle,
    crtc_id: crtc::Handle,
    plane_id: plane::Handle,
    connector_props: HashMap<String, property::Info>,
    crtc_props: HashMap<String, property::Info>,
    plane_props: HashMap<String, property::Info>,
    atomic: bool,
}

impl std::fmt::Debug for DrmController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrmController")
            .field("connector_id", &self.connector_id)
            .field("crtc_id", &self.crtc_id)
            .field("plane_id", &self.plane_id)
            .field("atomic", &self.atomic)
            .finish()
    }
}

impl DrmController {
    /// Bind to `connector_id`, picking its first usable CRTC and that CRTC's
    /// primary plane.
    pub fn new(card: Arc<Card>, connector_id: connector::Handle) -> Result<Self, DrmBackendError> {
        let atomic = card.set_client_capability(ClientCapability::Atomic, true).is_ok();

        let connector = card.get_connector(connector_id, false)?;
        let resources = card.resource_handles()?;
        let crtc_id = connector
            .encoders()
            .iter()
            .find_map(|&enc_id| {
                let encoder = card.get_encoder(enc_id).ok()?;
                resources.filter_crtcs(encoder.possible_crtcs()).into_iter().next()
            })
            .ok_or(DrmBackendError::NoCrtc(connector_id))?;

        let plane_id = card
            .plane_handles()?
            .iter()
            .find(|&&p| {
                card.get_plane(p)
                    .map(|info| {
                        let compatible = resources.filter_crtcs(info.possible_crtcs());
                        if !compatible.contains(&crtc_id) {
                            return false;
                        }
                        card.get_properties(p)
                            .ok()
                            .map(|props| {
                                props.iter().any(|(&id, &val)| {
                                    card.get_property(id)
                                        .ok()
                                        .and_then(|info| info.name().to_str().ok().map(str::to_owned))
                                        .is_some_and(|name| name == "type")
                                        && val == (control::PlaneType::Primary as u32).into()
                                })
                            })
                            .unwrap_or(false)
                    })
                    .unwrap_or(false)
            })
            .copied()
            .ok_or(DrmBackendError::NoPrimaryPlane(crtc_id))?;

        let connector_props = properties_by_name(card.as_ref(), connector_id)?;
        let crtc_props = properties_by_name(card.as_ref(), crtc_id)?;
        let plane_props = properties_by_name(card.as_ref(), plane_id)?;

        debug!(?connector_id, ?crtc_id, ?plane_id, atomic, "bound drm controller");
        Ok(Self { card, connector_id, crtc_id, plane_id, connector_props, crtc_props, plane_props, atomic })
    }

    fn prop(&self, map: &HashMap<String, property::Info>, name: &'static str, object: u32) -> Result<property::Handle, DrmBackendError> {
        map.get(name).map(property::Info::handle).ok_or(DrmBackendError::MissingProperty(name, object))
    }

    pub fn plane_id(&self) -> u32 {
        self.plane_id.into()
    }

    pub fn crtc_id(&self) -> u32 {
        self.crtc_id.into()
    }
}

impl DisplayController for DrmController {
    fn caps(&self) -> DisplayCaps {
        DisplayCaps { atomic_commit: self.atomic, flip_event_from_any_plane: false, max_planes: 4 }
    }

    fn commit(&self, request: &CommitRequest) -> Result<bool, String> {
        if !self.atomic {
            return self.commit_legacy(request).map_err(|e| e.to_string());
        }
        self.commit_atomic(request).map_err(|e| e.to_string())
    }

    fn set_dpms(&self, mode: Dpms) -> Result<(), String> {
        let value = match mode {
            Dpms::On | Dpms::AsyncOn => drm::control::property::Value::Unknown(0),
            Dpms::Standby => drm::control::property::Value::Unknown(1),
            Dpms::Suspend => drm::control::property::Value::Unknown(2),
            Dpms::Off | Dpms::AsyncOff => drm::control::property::Value::Unknown(3),
        };
        let Some(prop) = self.connector_props.get("DPMS") else {
            return Ok(()); // no DPMS property (e.g. a purely atomic panel); nothing to do
        };
        self.card
            .set_property(self.connector_id, prop.handle(), value.into())
            .map_err(|e| e.to_string())
    }

    fn blank(&self) -> Result<(), String> {
        if !self.atomic {
            return Ok(());
        }
        let mut req = AtomicModeReq::new();
        let fb_prop = self.prop(&self.plane_props, "FB_ID", self.plane_id.into()).map_err(|e| e.to_string())?;
        req.add_property(self.plane_id, fb_prop, property::Value::Framebuffer(None));
        self.card.atomic_commit(AtomicCommitFlags::empty(), req).map_err(|e| e.to_string())
    }

    fn create_framebuffer(&self, details: &BufferDetails, _wants_blend: bool) -> Result<DeviceId, String> {
        let format = DrmFourcc::try_from(details.format_fourcc).map_err(|e| e.to_string())?;
        let buffer = self
            .card
            .create_dumb_buffer((details.width, details.height), format, 32)
            .map_err(|e| e.to_string())?;
        let fb = self.card.add_framebuffer(&buffer, 24, 32).map_err(|e| e.to_string())?;
        Ok(Into::<u32>::into(fb) as DeviceId)
    }

    fn destroy_framebuffer(&self, id: DeviceId) {
        let Some(handle) = control::from_u32::<control::framebuffer::Handle>(id as u32) else {
            warn!(id, "failed to destroy framebuffer: invalid (zero) handle");
            return;
        };
        if let Err(e) = self.card.destroy_framebuffer(handle) {
            warn!(id, error = %e, "failed to destroy framebuffer");
        }
    }
}

impl DrmController {
    fn commit_atomic(&self, request: &CommitRequest) -> Result<bool, DrmBackendError> {
        let mut req = AtomicModeReq::new();
        for plane_commit in &request.planes {
            let plane = control::from_u32::<plane::Handle>(plane_commit.plane_id)
                .ok_or(DrmBackendError::InvalidHandle(plane_commit.plane_id))?;
            let fb_prop = self.prop(&self.plane_props, "FB_ID", plane_commit.plane_id)?;
            let fb_handle = control::from_u32::<control::framebuffer::Handle>(plane_commit.fb_id as u32)
                .ok_or(DrmBackendError::InvalidHandle(plane_commit.fb_id as u32))?;
            req.add_property(plane, fb_prop, property::Value::Framebuffer(Some(fb_handle)));

            let (sx, sy, sw, sh) = plane_commit.src_rect;
            let (dx, dy, dw, dh) = plane_commit.dst_rect;
            req.add_property(plane, self.prop(&self.plane_props, "SRC_X", plane_commit.plane_id)?, property::Value::UnsignedRange((sx as u64) << 16));
            req.add_property(plane, self.prop(&self.plane_props, "SRC_Y", plane_commit.plane_id)?, property::Value::UnsignedRange((sy as u64) << 16));
            req.add_property(plane, self.prop(&self.plane_props, "SRC_W", plane_commit.plane_id)?, property::Value::UnsignedRange((sw as u64) << 16));
            req.add_property(plane, self.prop(&self.plane_props, "SRC_H", plane_commit.plane_id)?, property::Value::UnsignedRange((sh as u64) << 16));
            req.add_property(plane, self.prop(&self.plane_props, "CRTC_X", plane_commit.plane_id)?, property::Value::SignedRange(dx as i64));
            req.add_property(plane, self.prop(&self.plane_props, "CRTC_Y", plane_commit.plane_id)?, property::Value::SignedRange(dy as i64));
            req.add_property(plane, self.prop(&self.plane_props, "CRTC_W", plane_commit.plane_id)?, property::Value::UnsignedRange(dw as u64));
            req.add_property(plane, self.prop(&self.plane_props, "CRTC_H", plane_commit.plane_id)?, property::Value::UnsignedRange(dh as u64));
            req.add_property(plane, self.prop(&self.plane_props, "CRTC_ID", plane_commit.plane_id)?, property::Value::CRTC(Some(self.crtc_id)));
        }

        let event_requested = request.planes.iter().any(|p| p.carries_event) || !request.planes.is_empty();
        let mut flags = AtomicCommitFlags::empty();
        if event_requested {
            flags |= AtomicCommitFlags::PAGE_FLIP_EVENT;
        }
        self.card.atomic_commit(flags, req)?;
        Ok(event_requested)
    }

    /// Legacy, per-plane commit path for hardware without atomic KMS: only
    /// the primary plane's ioctl carries the flip-completion event.
    fn commit_legacy(&self, request: &CommitRequest) -> Result<bool, DrmBackendError> {
        let mut event_requested = false;
        for plane_commit in &request.planes {
            let fb = control::from_u32::<control::framebuffer::Handle>(plane_commit.fb_id as u32)
                .ok_or(DrmBackendError::InvalidHandle(plane_commit.fb_id as u32))?;
            let (dx, dy, _dw, _dh) = plane_commit.dst_rect;
            self.card.page_flip(self.crtc_id, fb, control::PageFlipFlags::EVENT, None)?;
            if plane_commit.plane_id == self.plane_id.into() {
                event_requested = true;
            }
            let _ = (dx, dy);
        }
        Ok(event_requested)
    }
}

/// Dumb-buffer-backed allocator; sufficient for software composition onto
/// scanout framebuffers when no GPU import path is available. The real
/// allocator the compositor drives usually wraps gbm/dmabuf import instead;
/// this is the fallback used when none is wired in.
pub struct DrmAllocator {
    card: Arc<Card>,
    usage_hints: Mutex<HashMap<hwcomposer::content::BufferHandle, BufferUsage>>,
}

impl DrmAllocator {
    pub fn new(card: Arc<Card>) -> Self {
        Self { card, usage_hints: Mutex::new(HashMap::new()) }
    }
}

impl BufferAllocator for DrmAllocator {
    fn query_details(&self, _handle: hwcomposer::content::BufferHandle) -> Option<BufferDetails> {
        None
    }

    fn import_framebuffer(&self, details: &BufferDetails, wants_blend: bool) -> Result<DeviceId, String> {
        let format = DrmFourcc::try_from(details.format_fourcc).map_err(|e| e.to_string())?;
        let buffer = self
            .card
            .create_dumb_buffer((details.width, details.height), format, 32)
            .map_err(|e| e.to_string())?;
        let depth = if wants_blend { 32 } else { 24 };
        let fb = self.card.add_framebuffer(&buffer, depth, 32).map_err(|e| e.to_string())?;
        Ok(Into::<u32>::into(fb) as DeviceId)
    }

    fn hint_usage(&self, handle: hwcomposer::content::BufferHandle, usage: BufferUsage) {
        self.usage_hints.lock().insert(handle, usage);
    }

    fn fallocate_uncommit(&self, handle: hwcomposer::content::BufferHandle) {
        debug!(?handle, "fallocate_uncommit: no-op without a pool allocator backing this handle");
    }

    fn fallocate_commit(&self, handle: hwcomposer::content::BufferHandle) {
        debug!(?handle, "fallocate_commit: no-op without a pool allocator backing this handle");
    }
}

/// Maps the whole layer stack onto a single plane, topmost layer wins. A
/// real multi-plane assignment policy belongs in the compositor that embeds
/// this crate; this exists so a daemon with only one scanout plane available
/// still has something to hand [`hwcomposer::traits::Composer`].
#[derive(Debug)]
pub struct SinglePlaneComposer {
    plane_id: u32,
}

impl SinglePlaneComposer {
    pub fn new(plane_id: u32) -> Self {
        Self { plane_id }
    }
}

impl hwcomposer::traits::Composer for SinglePlaneComposer {
    fn prepare(&self, layers: &hwcomposer::content::LayerStack) -> Vec<hwcomposer::traits::PlaneCommit> {
        let Some(top) = layers.last() else { return Vec::new() };
        if top.device_id == 0 {
            return Vec::new();
        }
        let src = (
            top.src_rect.x as u32,
            top.src_rect.y as u32,
            top.src_rect.w as u32,
            top.src_rect.h as u32,
        );
        let dst = (top.dst_rect.x, top.dst_rect.y, top.dst_rect.w, top.dst_rect.h);
        vec![hwcomposer::traits::PlaneCommit {
            plane_id: self.plane_id,
            fb_id: top.device_id,
            src_rect: src,
            dst_rect: dst,
            carries_event: true,
        }]
    }
}
