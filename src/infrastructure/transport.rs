//! USB Transport
//!
//! The host OS exposes the Bluetooth dongle as a device file driven by a
//! vectored ioctl. Bulk and interrupt transfers use three vectors
//! (`{endpoint:u8}`, `{length:be16}`, `{data}`); control transfers use seven
//! (the setup packet fields, a reserved byte and the payload). The direction
//! of a bulk/interrupt transfer follows the endpoint: `>= 0x80` is input.

use crate::error::{BtError, Result};
use std::io;
use std::sync::Arc;

/// Ioctl request numbers understood by the USB device file.
pub mod request {
    pub const CONTROL: u32 = 0;
    pub const BULK: u32 = 1;
    pub const INTERRUPT: u32 = 2;
}

/// Endpoints of a standard Bluetooth USB dongle.
pub mod endpoint {
    /// HCI events (interrupt in)
    pub const EVENTS: u8 = 0x81;
    /// ACL data to the controller (bulk out)
    pub const ACL_OUT: u8 = 0x02;
    /// ACL data from the controller (bulk in)
    pub const ACL_IN: u8 = 0x82;
}

/// `bmRequestType` for HCI commands: host-to-device, class, device.
pub const HCI_COMMAND_REQUEST_TYPE: u8 = 0x20;

/// A handle on an opened USB device file.
///
/// `inputs` are read by the device; `io` is the single data vector, read for
/// outgoing transfers and filled for incoming ones. Returns the number of
/// bytes transferred. Implementations may block.
pub trait IoctlDevice: Send + Sync {
    fn ioctlv(&self, request: u32, inputs: &[&[u8]], io: &mut [u8]) -> io::Result<usize>;
}

/// Opens device files by path.
pub trait HostInterface: Send + Sync {
    fn open(&self, path: &str) -> io::Result<Arc<dyn IoctlDevice>>;
}

/// Typed transfers on top of an [`IoctlDevice`].
#[derive(Clone)]
pub struct UsbTransport {
    device: Arc<dyn IoctlDevice>,
}

impl UsbTransport {
    pub fn new(device: Arc<dyn IoctlDevice>) -> Self {
        Self { device }
    }

    /// Send a class control request carrying `payload` (an HCI command packet).
    pub fn control_out(&self, payload: &[u8]) -> Result<usize> {
        let length = u16::try_from(payload.len())
            .map_err(|_| BtError::argument(format!("control payload of {} bytes", payload.len())))?;

        let request_type = [HCI_COMMAND_REQUEST_TYPE];
        let b_request = [0u8];
        let w_value = 0u16.to_le_bytes();
        let w_index = 0u16.to_le_bytes();
        let w_length = length.to_le_bytes();
        let reserved = [0u8];
        let inputs: [&[u8]; 6] = [
            &request_type,
            &b_request,
            &w_value,
            &w_index,
            &w_length,
            &reserved,
        ];

        let mut data = payload.to_vec();
        Ok(self.device.ioctlv(request::CONTROL, &inputs, &mut data)?)
    }

    /// Bulk or interrupt transfer; direction follows `endpoint`.
    pub fn transfer(&self, kind: u32, endpoint: u8, data: &mut [u8]) -> Result<usize> {
        let length = u16::try_from(data.len())
            .map_err(|_| BtError::argument(format!("transfer of {} bytes", data.len())))?;

        let endpoint_buf = [endpoint];
        let length_buf = length.to_be_bytes();
        let inputs: [&[u8]; 2] = [&endpoint_buf, &length_buf];

        Ok(self.device.ioctlv(kind, &inputs, data)?)
    }

    pub fn interrupt_in(&self, endpoint: u8, buffer: &mut [u8]) -> Result<usize> {
        self.transfer(request::INTERRUPT, endpoint, buffer)
    }

    pub fn bulk_in(&self, endpoint: u8, buffer: &mut [u8]) -> Result<usize> {
        self.transfer(request::BULK, endpoint, buffer)
    }

    pub fn bulk_out(&self, endpoint: u8, data: &[u8]) -> Result<usize> {
        let mut data = data.to_vec();
        self.transfer(request::BULK, endpoint, &mut data)
    }

    /// [`Self::control_out`] on the blocking pool.
    pub async fn control_out_async(&self, payload: Vec<u8>) -> Result<usize> {
        let transport = self.clone();
        tokio::task::spawn_blocking(move || transport.control_out(&payload)).await?
    }

    /// [`Self::bulk_out`] on the blocking pool.
    pub async fn bulk_out_async(&self, endpoint: u8, data: Vec<u8>) -> Result<usize> {
        let transport = self.clone();
        tokio::task::spawn_blocking(move || transport.bulk_out(endpoint, &data)).await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(u32, Vec<Vec<u8>>, Vec<u8>)>>,
    }

    impl IoctlDevice for Recorder {
        fn ioctlv(&self, request: u32, inputs: &[&[u8]], io: &mut [u8]) -> io::Result<usize> {
            let inputs = inputs.iter().map(|v| v.to_vec()).collect();
            self.calls
                .lock()
                .unwrap()
                .push((request, inputs, io.to_vec()));
            Ok(io.len())
        }
    }

    #[test]
    fn test_control_transfer_vectors() {
        let recorder = Arc::new(Recorder::default());
        let transport = UsbTransport::new(recorder.clone());

        transport.control_out(&[0x03, 0x0c, 0x00]).unwrap();

        let calls = recorder.calls.lock().unwrap();
        let (req, inputs, data) = &calls[0];
        assert_eq!(*req, request::CONTROL);
        assert_eq!(inputs.len(), 6);
        assert_eq!(inputs[0], vec![0x20]);
        assert_eq!(inputs[4], vec![0x03, 0x00]);
        assert_eq!(data, &vec![0x03, 0x0c, 0x00]);
    }

    #[test]
    fn test_bulk_length_is_big_endian() {
        let recorder = Arc::new(Recorder::default());
        let transport = UsbTransport::new(recorder.clone());

        transport.bulk_out(endpoint::ACL_OUT, &[0u8; 0x0104]).unwrap();

        let calls = recorder.calls.lock().unwrap();
        let (req, inputs, _) = &calls[0];
        assert_eq!(*req, request::BULK);
        assert_eq!(inputs[0], vec![endpoint::ACL_OUT]);
        assert_eq!(inputs[1], vec![0x01, 0x04]);
    }

    #[test]
    fn test_oversized_transfer_rejected() {
        let transport = UsbTransport::new(Arc::new(Recorder::default()));
        let mut big = vec![0u8; 70_000];
        let err = transport
            .transfer(request::BULK, endpoint::ACL_IN, &mut big)
            .unwrap_err();
        assert!(matches!(err, BtError::Argument(_)));
    }
}
