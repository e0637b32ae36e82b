// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Frame surfaces and their plane layout.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::ext_buffer::ExtBufferList;
use crate::ext_buffer::ExtBufferRegistry;
use crate::payload::PayloadReader;
use crate::payload::PayloadWriter;
use crate::status::Status;
use crate::types::fourcc;
use crate::types::FrameData;
use crate::types::FrameInfo;
use crate::types::SurfaceId;
use crate::Error;
use crate::Result;

/// Largest frame, in bytes, a peer may ask us to mirror.
pub const MAX_SURFACE_SIZE: usize = 256 * 1024 * 1024;

/// A video frame. Planes are stored back to back in plane order when the frame is mapped.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameSurface {
    pub info: FrameInfo,
    pub data: FrameData,
    pub planes: Option<Vec<u8>>,
    pub ext_param: ExtBufferList,
}

/// A surface shared between the application and the shim.
pub type SharedSurface = Arc<Mutex<FrameSurface>>;

impl FrameSurface {
    pub fn new(info: FrameInfo, pitch: u32) -> FrameSurface {
        let mut data = FrameData::default();
        data.set_pitch(pitch);
        FrameSurface {
            info,
            data,
            planes: None,
            ext_param: None,
        }
    }

    /// A surface with zeroed plane storage.
    pub fn mapped(info: FrameInfo, pitch: u32) -> FrameSurface {
        let mut surface = FrameSurface::new(info, pitch);
        surface.map_planes();
        surface
    }

    pub fn into_shared(self) -> SharedSurface {
        Arc::new(Mutex::new(self))
    }

    pub fn frame_size(&self) -> usize {
        frame_size(&self.info, self.data.pitch())
    }

    pub fn is_mapped(&self) -> bool {
        self.planes.is_some()
    }

    /// Allocates plane storage for the current format, reusing the old buffer.
    pub fn map_planes(&mut self) {
        let size = self.frame_size();
        let planes = self.planes.get_or_insert_with(Vec::new);
        planes.resize(size, 0);
        self.data.mapped = 1;
    }

    pub fn unmap_planes(&mut self) {
        self.planes = None;
        self.data.mapped = 0;
    }

    /// Scalar descriptor as sent on the wire.
    pub fn wire_data(&self) -> FrameData {
        FrameData {
            mapped: self.planes.is_some() as u16,
            ..self.data
        }
    }
}

/// Size in bytes of `plane` for a frame of the given format and pitch.
pub fn plane_size(info: &FrameInfo, plane: usize, pitch: u32) -> usize {
    let w = pitch as usize;
    let h = info.height as usize;
    match (info.fourcc, plane) {
        (fourcc::IYUV | fourcc::I010 | fourcc::YV12, 0) => w * h,
        (fourcc::IYUV | fourcc::I010 | fourcc::YV12, 1 | 2) => (w >> 1) * (h >> 1),
        (fourcc::NV12 | fourcc::NV21 | fourcc::P010 | fourcc::P016, 0) => w * h,
        (fourcc::NV12 | fourcc::NV21 | fourcc::P010 | fourcc::P016, 1) => w * (h >> 1),
        (fourcc::P210 | fourcc::UYVY | fourcc::YUY2, 0 | 1) => w * h,
        (
            fourcc::RGB3 | fourcc::RGBP | fourcc::RGB565 | fourcc::BGR4 | fourcc::AYUV | fourcc::P8,
            0,
        ) => w * h,
        (fourcc::RGB4, 2) => w * h,
        _ => 0,
    }
}

/// Total size of all planes of a frame.
pub fn frame_size(info: &FrameInfo, pitch: u32) -> usize {
    (0..4).map(|p| plane_size(info, p, pitch)).sum()
}

/// Writes the plane contents of a mapped surface. Unmapped surfaces contribute nothing.
pub fn write_surface_data(w: &mut PayloadWriter, surface: &FrameSurface) -> Result<()> {
    if let Some(planes) = &surface.planes {
        let size = surface.frame_size();
        let bytes = planes
            .get(..size)
            .ok_or(Error::Status(Status::ERR_NOT_ENOUGH_BUFFER))?;
        w.write(bytes);
    }
    Ok(())
}

/// Reads plane contents into a mapped surface. Unmapped surfaces consume nothing.
pub fn read_surface_data(r: &mut PayloadReader, surface: &mut FrameSurface) -> Result<()> {
    let size = surface.frame_size();
    if let Some(planes) = surface.planes.as_mut() {
        if planes.len() < size {
            planes.resize(size, 0);
        }
        r.read(&mut planes[..size])?;
    }
    Ok(())
}

/// Writes a surface: identity, descriptor, optionally plane contents, then extension buffers.
pub fn put_surface(
    w: &mut PayloadWriter,
    registry: &ExtBufferRegistry,
    id: SurfaceId,
    surface: Option<&FrameSurface>,
    write_contents: bool,
) -> Result<()> {
    let surface = match surface {
        Some(s) => s,
        None => {
            w.write_typed(&SurfaceId::NULL);
            return Ok(());
        }
    };
    w.write_typed(&id);
    w.write_typed(&surface.info);
    w.write_typed(&surface.wire_data());
    if write_contents {
        write_surface_data(w, surface)?;
    }
    registry.write_ext_buffers(w, &surface.ext_param)
}

/// Descriptor of a surface as announced by the peer, before it is bound to a local mirror.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SurfaceDescriptor {
    pub id: SurfaceId,
    pub info: FrameInfo,
    pub data: FrameData,
}

impl SurfaceDescriptor {
    pub fn is_mapped(&self) -> bool {
        self.data.mapped != 0
    }
}

/// Reads the leading part of a surface written by [`put_surface`]. Returns `None` for an absent
/// surface; otherwise the caller binds the descriptor to a local surface and finishes with
/// [`get_surface`].
pub fn read_surface_descriptor(r: &mut PayloadReader) -> Result<Option<SurfaceDescriptor>> {
    let id: SurfaceId = r.read_typed()?;
    if id.is_null() {
        return Ok(None);
    }
    Ok(Some(SurfaceDescriptor {
        id,
        info: r.read_typed()?,
        data: r.read_typed()?,
    }))
}

/// Reads the remainder of a surface into `surface`.
pub fn get_surface(
    r: &mut PayloadReader,
    registry: &ExtBufferRegistry,
    surface: &mut FrameSurface,
    read_contents: bool,
) -> Result<()> {
    if read_contents {
        read_surface_data(r, surface)?;
    }
    registry.read_ext_buffers(r, &mut surface.ext_param)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(fourcc: u32, width: u16, height: u16) -> FrameInfo {
        FrameInfo {
            fourcc,
            width,
            height,
            crop_w: width,
            crop_h: height,
            ..Default::default()
        }
    }

    #[test]
    fn plane_sizes() {
        let nv12 = info(fourcc::NV12, 64, 32);
        assert_eq!(plane_size(&nv12, 0, 64), 2048);
        assert_eq!(plane_size(&nv12, 1, 64), 1024);
        assert_eq!(plane_size(&nv12, 2, 64), 0);
        assert_eq!(frame_size(&nv12, 64), 3072);

        let yv12 = info(fourcc::YV12, 64, 32);
        assert_eq!(frame_size(&yv12, 64), 2048 + 512 + 512);

        let yuy2 = info(fourcc::YUY2, 64, 32);
        assert_eq!(frame_size(&yuy2, 128), 128 * 32 * 2);

        let rgb4 = info(fourcc::RGB4, 64, 32);
        assert_eq!(plane_size(&rgb4, 0, 256), 0);
        assert_eq!(frame_size(&rgb4, 256), 256 * 32);

        let unknown = info(0x1234, 64, 32);
        assert_eq!(frame_size(&unknown, 64), 0);
    }

    #[test]
    fn surface_with_contents() {
        let registry = ExtBufferRegistry::default();
        let mut src = FrameSurface::mapped(info(fourcc::NV12, 16, 8), 16);
        src.data.time_stamp = 3000;
        for (i, b) in src.planes.as_mut().unwrap().iter_mut().enumerate() {
            *b = i as u8;
        }

        let mut w = PayloadWriter::new(0);
        put_surface(&mut w, &registry, SurfaceId(0x10), Some(&src), true).unwrap();
        let mut r = PayloadReader::new(w.into_bytes()).unwrap();

        let desc = read_surface_descriptor(&mut r).unwrap().unwrap();
        assert_eq!(desc.id, SurfaceId(0x10));
        assert!(desc.is_mapped());
        let mut dst = FrameSurface {
            info: desc.info,
            data: desc.data,
            ..Default::default()
        };
        dst.map_planes();
        get_surface(&mut r, &registry, &mut dst, true).unwrap();
        assert_eq!(r.remaining(), 0);
        assert_eq!(dst, src);
    }

    #[test]
    fn surface_without_contents() {
        let registry = ExtBufferRegistry::default();
        let src = FrameSurface::mapped(info(fourcc::NV12, 16, 8), 16);
        let mut w = PayloadWriter::new(0);
        put_surface(&mut w, &registry, SurfaceId(1), Some(&src), false).unwrap();
        put_surface(&mut w, &registry, SurfaceId(2), None, false).unwrap();
        let mut r = PayloadReader::new(w.into_bytes()).unwrap();
        let desc = read_surface_descriptor(&mut r).unwrap().unwrap();
        let mut dst = FrameSurface::new(desc.info, desc.data.pitch());
        get_surface(&mut r, &registry, &mut dst, false).unwrap();
        assert_eq!(read_surface_descriptor(&mut r).unwrap(), None);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn short_plane_buffer_is_rejected() {
        let mut src = FrameSurface::mapped(info(fourcc::NV12, 16, 8), 16);
        src.planes.as_mut().unwrap().truncate(10);
        let mut w = PayloadWriter::new(0);
        assert_eq!(
            write_surface_data(&mut w, &src),
            Err(Error::Status(Status::ERR_NOT_ENOUGH_BUFFER))
        );
    }
}
