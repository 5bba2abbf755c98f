use std::fmt;
use std::io;
use std::sync::Arc;

use log::error;

use super::device::{DeviceControl, ObjectKind, RawHandle};

/// An owned, possibly empty, hardware object.
///
/// Destroying is explicit through [`DevObject::destroy`] where ordering
/// matters; anything still held when the value goes away is destroyed on
/// drop, with failures logged.
pub struct DevObject {
    kind: ObjectKind,
    inner: Option<(RawHandle, Arc<dyn DeviceControl>)>,
}

impl DevObject {
    pub fn empty(kind: ObjectKind) -> Self {
        Self { kind, inner: None }
    }

    pub fn new(kind: ObjectKind, raw: RawHandle, device: Arc<dyn DeviceControl>) -> Self {
        Self {
            kind,
            inner: Some((raw, device)),
        }
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    pub fn raw(&self) -> Option<RawHandle> {
        self.inner.as_ref().map(|(raw, _)| *raw)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_none()
    }

    /// Destroys the object if present. The handle is cleared even when the
    /// device reports a failure, so a second call is always a no-op.
    pub fn destroy(&mut self) -> io::Result<()> {
        match self.inner.take() {
            Some((raw, device)) => device.destroy(self.kind, raw),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for DevObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DevObject")
            .field("kind", &self.kind)
            .field("raw", &self.raw())
            .finish()
    }
}

impl Drop for DevObject {
    fn drop(&mut self) {
        let kind = self.kind;
        if let Err(e) = self.destroy() {
            error!("destroy {kind:?} on drop failed: {e}");
        }
    }
}
