// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Composite parameter records: fixed part followed by variable-length data.

use zerocopy::IntoBytes;

use crate::ext_buffer::ExtBufferList;
use crate::ext_buffer::ExtBufferRegistry;
use crate::payload::PayloadReader;
use crate::payload::PayloadWriter;
use crate::types::EncodeCtrlHeader;
use crate::types::FrameAllocResponse;
use crate::types::IoPattern;
use crate::types::MemId;
use crate::types::PayloadInfo;
use crate::types::SurfaceId;
use crate::types::VideoParamHeader;
use crate::Result;

/// Codec configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VideoParam {
    pub header: VideoParamHeader,
    pub ext_param: ExtBufferList,
}

impl VideoParam {
    pub fn io_pattern(&self) -> IoPattern {
        self.header.io_pattern()
    }
}

pub fn write_video_param(
    w: &mut PayloadWriter,
    registry: &ExtBufferRegistry,
    par: Option<&VideoParam>,
) -> Result<()> {
    w.write_presence(par.is_some());
    if let Some(par) = par {
        w.write_typed(&par.header);
        registry.write_ext_buffers(w, &par.ext_param)?;
    }
    Ok(())
}

/// Reads an optional parameter set into `dst`, reusing its extension buffers.
pub fn read_video_param(
    r: &mut PayloadReader,
    registry: &ExtBufferRegistry,
    dst: &mut Option<VideoParam>,
) -> Result<()> {
    if r.read_presence()? == 0 {
        *dst = None;
        return Ok(());
    }
    let par = dst.get_or_insert_with(VideoParam::default);
    par.header = r.read_typed()?;
    registry.read_ext_buffers(r, &mut par.ext_param)
}

/// Per-frame encoder control.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EncodeCtrl {
    pub header: EncodeCtrlHeader,
    pub ext_param: ExtBufferList,
}

pub fn write_encode_ctrl(
    w: &mut PayloadWriter,
    registry: &ExtBufferRegistry,
    ctrl: Option<&EncodeCtrl>,
) -> Result<()> {
    w.write_presence(ctrl.is_some());
    if let Some(ctrl) = ctrl {
        w.write_typed(&ctrl.header);
        registry.write_ext_buffers(w, &ctrl.ext_param)?;
    }
    Ok(())
}

pub fn read_encode_ctrl(
    r: &mut PayloadReader,
    registry: &ExtBufferRegistry,
) -> Result<Option<EncodeCtrl>> {
    if r.read_presence()? == 0 {
        return Ok(None);
    }
    let mut ctrl = EncodeCtrl {
        header: r.read_typed()?,
        ext_param: None,
    };
    registry.read_ext_buffers(r, &mut ctrl.ext_param)?;
    Ok(Some(ctrl))
}

/// User data or SEI message extracted by a decoder.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Payload {
    pub info: PayloadInfo,
    /// `info.buf_size` bytes.
    pub data: Vec<u8>,
}

impl Payload {
    pub fn with_capacity(buf_size: u16) -> Payload {
        Payload {
            info: PayloadInfo {
                buf_size,
                ..Default::default()
            },
            data: vec![0; buf_size as usize],
        }
    }
}

pub fn write_payload(w: &mut PayloadWriter, payload: Option<&Payload>) {
    w.write_presence(payload.is_some());
    if let Some(p) = payload {
        w.write_typed(&p.info);
        let mut data = p.data.clone();
        data.resize(p.info.buf_size as usize, 0);
        w.write(&data);
    }
}

pub fn read_payload(r: &mut PayloadReader, dst: &mut Option<Payload>) -> Result<()> {
    if r.read_presence()? == 0 {
        *dst = None;
        return Ok(());
    }
    let p = dst.get_or_insert_with(Payload::default);
    p.info = r.read_typed()?;
    r.read_into_vec(&mut p.data, p.info.buf_size as usize)
}

/// Frames handed out by an allocator.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AllocatedFrames {
    pub response: FrameAllocResponse,
    pub mids: Vec<MemId>,
}

impl AllocatedFrames {
    pub fn new(alloc_id: u32, mem_type: u16, mids: Vec<MemId>) -> AllocatedFrames {
        AllocatedFrames {
            response: FrameAllocResponse {
                alloc_id,
                num_frame_actual: mids.len() as u16,
                mem_type,
            },
            mids,
        }
    }
}

pub fn write_allocated_frames(w: &mut PayloadWriter, frames: &AllocatedFrames) {
    let count = frames.response.num_frame_actual as usize;
    w.write_typed(&frames.response);
    let mids = &frames.mids[..count.min(frames.mids.len())];
    w.write(mids.as_bytes());
    // Pad with null ids when the response claims more frames than listed.
    for _ in mids.len()..count {
        w.write_typed(&MemId::NULL);
    }
}

pub fn read_allocated_frames(r: &mut PayloadReader) -> Result<AllocatedFrames> {
    let response: FrameAllocResponse = r.read_typed()?;
    let mids = r.read_elements::<MemId>(response.num_frame_actual as usize)?;
    Ok(AllocatedFrames { response, mids })
}

/// Change of a surface's lock count since it was last reported.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LockDelta {
    pub surface: SurfaceId,
    pub increment: bool,
}

pub fn write_lock_deltas(w: &mut PayloadWriter, deltas: &[LockDelta]) {
    w.write_typed(&(deltas.len() as u32));
    for d in deltas {
        w.write_typed(&d.surface);
        w.write_typed(&(d.increment as u16));
    }
}

pub fn read_lock_deltas(r: &mut PayloadReader) -> Result<Vec<LockDelta>> {
    let count: u32 = r.read_typed()?;
    // Each record is 10 bytes; reject counts the frame can't hold before allocating.
    if count as usize > r.remaining() / 10 {
        return Err(crate::Error::OutOfData {
            want: count as usize * 10,
            left: r.remaining(),
        });
    }
    let mut deltas = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let surface: SurfaceId = r.read_typed()?;
        let op: u16 = r.read_typed()?;
        deltas.push(LockDelta {
            surface,
            increment: op != 0,
        });
    }
    Ok(deltas)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ext_buffer::ExtBuffer;
    use crate::ext_buffer::EXTBUFF_CODING_OPTION2;
    use crate::types::codec;

    #[test]
    fn video_param_reuses_destination() {
        let registry = ExtBufferRegistry::default();
        let mut par = VideoParam::default();
        par.header.async_depth = 4;
        par.header.io_pattern = IoPattern::OUT_SYSTEM_MEMORY.bits();
        par.header.mfx.codec_id = codec::HEVC;
        par.ext_param = Some(vec![Some(ExtBuffer::new(EXTBUFF_CODING_OPTION2, vec![2; 60]))]);

        let mut w = PayloadWriter::new(0);
        write_video_param(&mut w, &registry, Some(&par)).unwrap();
        write_video_param(&mut w, &registry, None).unwrap();
        let mut r = PayloadReader::new(w.into_bytes()).unwrap();

        let mut out = Some(VideoParam::default());
        read_video_param(&mut r, &registry, &mut out).unwrap();
        assert_eq!(out.as_ref(), Some(&par));
        assert_eq!(out.unwrap().io_pattern(), IoPattern::OUT_SYSTEM_MEMORY);

        let mut none = Some(VideoParam::default());
        read_video_param(&mut r, &registry, &mut none).unwrap();
        assert_eq!(none, None);
    }

    #[test]
    fn allocated_frames_and_lock_deltas() {
        let frames = AllocatedFrames::new(7, 0x42, vec![MemId(11), MemId(12), MemId(13)]);
        let deltas = [
            LockDelta {
                surface: SurfaceId(0xa0),
                increment: true,
            },
            LockDelta {
                surface: SurfaceId(0xb0),
                increment: false,
            },
        ];
        let mut w = PayloadWriter::new(0);
        write_allocated_frames(&mut w, &frames);
        write_lock_deltas(&mut w, &deltas);
        write_lock_deltas(&mut w, &[]);
        let mut r = PayloadReader::new(w.into_bytes()).unwrap();
        assert_eq!(read_allocated_frames(&mut r).unwrap(), frames);
        assert_eq!(read_lock_deltas(&mut r).unwrap(), deltas);
        assert!(read_lock_deltas(&mut r).unwrap().is_empty());
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn payload_is_sized_by_buf_size() {
        let mut p = Payload::with_capacity(6);
        p.data[..3].copy_from_slice(&[1, 2, 3]);
        p.info.num_bit = 24;
        let mut w = PayloadWriter::new(0);
        write_payload(&mut w, Some(&p));
        let mut r = PayloadReader::new(w.into_bytes()).unwrap();
        let mut out = None;
        read_payload(&mut r, &mut out).unwrap();
        assert_eq!(out, Some(p));
    }
}
