//! Root window capture with core GetImage

use std::sync::Arc;
use std::time::Instant;

use x11rb::protocol::xproto::{ConnectionExt as _, ImageFormat};

use super::{X11Display, X11Error};
use crate::capture::{CaptureError, CaptureSource};
use crate::frame::{Frame, BYTES_PER_PIXEL};

/// Grabs the top-left `width`×`height` area of the root window
pub struct X11CaptureSource {
    display: Arc<X11Display>,
    width: u32,
    height: u32,
}

impl X11CaptureSource {
    /// Capture source for an area of the root window
    pub fn new(display: Arc<X11Display>, width: u32, height: u32) -> Result<Self, CaptureError> {
        let (width, height) = checked_geometry(width, height)?;
        Ok(Self {
            display,
            width,
            height,
        })
    }

    fn get_image(&self) -> Result<Vec<u8>, X11Error> {
        self.display.with_connection(|conn| {
            let reply = conn
                .get_image(
                    ImageFormat::Z_PIXMAP,
                    self.display.root(),
                    0,
                    0,
                    self.width as u16,
                    self.height as u16,
                    !0,
                )?
                .reply()?;
            Ok(reply.data)
        })
    }
}

impl CaptureSource for X11CaptureSource {
    fn geometry(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn reconfigure(&mut self, width: u32, height: u32) -> Result<(u32, u32), CaptureError> {
        let (width, height) = checked_geometry(width, height)?;
        self.width = width;
        self.height = height;
        Ok((width, height))
    }

    fn grab(&mut self, frame: &mut Frame) -> Result<(), CaptureError> {
        let data = self
            .get_image()
            .map_err(|e| CaptureError::Grab(e.to_string()))?;
        copy_zpixmap(&data, self.width, self.height, frame)
    }
}

fn checked_geometry(width: u32, height: u32) -> Result<(u32, u32), CaptureError> {
    if width == 0 || height == 0 || width > u32::from(u16::MAX) || height > u32::from(u16::MAX) {
        return Err(CaptureError::InvalidGeometry { width, height });
    }
    Ok((width, height))
}

/// Copy a 32bpp ZPixmap image into `frame`
///
/// Rows in the image are `width * 4` bytes (32bpp is always 32-bit padded).
fn copy_zpixmap(data: &[u8], width: u32, height: u32, frame: &mut Frame) -> Result<(), CaptureError> {
    let stride = width * BYTES_PER_PIXEL;
    let expected = stride as usize * height as usize;
    if data.len() < expected {
        return Err(CaptureError::Grab(format!(
            "short image: {} bytes for {}x{}",
            data.len(),
            width,
            height
        )));
    }

    frame.configure(width, height, stride, Instant::now())?;
    frame.data_mut().copy_from_slice(&data[..expected]);
    Ok(())
}
