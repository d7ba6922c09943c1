//! Bus-owned interface instances.

use std::any::Any;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::descriptor::InterfaceDescriptor;

type IntfData = Box<dyn Any + Send + Sync>;

/// One interface of an attached device.
///
/// Owned by the bus layer. Drivers get a shared reference on attach and
/// detach, and keep their per-interface state in the user-data slot.
pub struct UsbInterface<D> {
    device: Arc<D>,
    number: u8,
    alt_settings: Vec<InterfaceDescriptor>,
    current: Option<usize>,
    data: Mutex<Option<IntfData>>,
}

impl<D> UsbInterface<D> {
    /// `current_alt` is the `bAlternateSetting` value that is active.
    pub fn new(device: Arc<D>, alt_settings: Vec<InterfaceDescriptor>, current_alt: u8) -> Self {
        let number = alt_settings.first().map(|a| a.number()).unwrap_or(0);
        let current = alt_settings
            .iter()
            .position(|a| a.alternate_setting() == current_alt);

        Self {
            device,
            number,
            alt_settings,
            current,
            data: Mutex::new(None),
        }
    }

    /// Borrow the parent device without retaining it.
    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    /// Take a new reference on the parent device.
    pub fn get_device(&self) -> Arc<D> {
        Arc::clone(&self.device)
    }

    pub fn number(&self) -> u8 {
        self.number
    }

    pub fn alt_settings(&self) -> &[InterfaceDescriptor] {
        &self.alt_settings
    }

    /// The active alternate setting.
    pub fn cur_altsetting(&self) -> Option<&InterfaceDescriptor> {
        self.current.map(|i| &self.alt_settings[i])
    }

    fn slot(&self) -> MutexGuard<'_, Option<IntfData>> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store driver data, replacing anything already there.
    pub fn set_intfdata<T: Any + Send + Sync>(&self, data: T) {
        *self.slot() = Some(Box::new(data));
    }

    /// Store driver data only if the slot is empty. Gives `data` back
    /// otherwise.
    pub fn try_set_intfdata<T: Any + Send + Sync>(&self, data: T) -> Result<(), T> {
        let mut slot = self.slot();
        if slot.is_some() {
            return Err(data);
        }
        *slot = Some(Box::new(data));
        Ok(())
    }

    pub fn has_intfdata(&self) -> bool {
        self.slot().is_some()
    }

    /// Run `f` against the stored data if it is a `T`.
    pub fn with_intfdata<T: Any + Send + Sync, R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.slot().as_ref()?.downcast_ref::<T>().map(f)
    }

    /// Clear the slot and hand back its contents if they are a `T`.
    ///
    /// Data of another type is left in place.
    pub fn take_intfdata<T: Any + Send + Sync>(&self) -> Option<T> {
        let mut slot = self.slot();
        match slot.take()?.downcast::<T>() {
            Ok(data) => Some(*data),
            Err(other) => {
                *slot = Some(other);
                None
            }
        }
    }
}
