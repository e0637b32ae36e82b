// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Fixed-layout records exchanged verbatim on the wire.
//!
//! All records are `#[repr(C)]` without implicit padding so their byte image is identical on both
//! peers. Peer-owned objects are referenced through the opaque 64-bit handle types defined here.

use std::mem::size_of;

use bitflags::bitflags;
use static_assertions::const_assert_eq;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

macro_rules! wire_handle {
    ($(#[$attr:meta])* $name:ident) => {
        $(#[$attr])*
        #[repr(transparent)]
        #[derive(
            Copy,
            Clone,
            Debug,
            Default,
            PartialEq,
            Eq,
            Hash,
            PartialOrd,
            Ord,
            FromBytes,
            IntoBytes,
            Immutable,
            KnownLayout,
        )]
        pub struct $name(pub u64);

        impl $name {
            pub const NULL: $name = $name(0);

            pub fn is_null(self) -> bool {
                self.0 == 0
            }
        }
    };
}

wire_handle!(
    /// A codec session on the target.
    SessionHandle
);
wire_handle!(
    /// Identity of a surface in the address space of the peer that owns it.
    SurfaceId
);
wire_handle!(
    /// Completion token returned by asynchronous decode and encode calls.
    SyncPoint
);
wire_handle!(
    /// Identity of a host bitstream awaiting encoder output.
    BitstreamId
);
wire_handle!(
    /// Frame allocator memory id.
    MemId
);

/// Builds a FourCC code the way the codec API does.
pub const fn make_fourcc(code: &[u8; 4]) -> u32 {
    (code[0] as u32) | (code[1] as u32) << 8 | (code[2] as u32) << 16 | (code[3] as u32) << 24
}

pub mod fourcc {
    use super::make_fourcc;

    pub const NV12: u32 = make_fourcc(b"NV12");
    pub const NV21: u32 = make_fourcc(b"NV21");
    pub const YV12: u32 = make_fourcc(b"YV12");
    pub const IYUV: u32 = make_fourcc(b"IYUV");
    pub const I010: u32 = make_fourcc(b"I010");
    pub const YUY2: u32 = make_fourcc(b"YUY2");
    pub const UYVY: u32 = make_fourcc(b"UYVY");
    pub const P010: u32 = make_fourcc(b"P010");
    pub const P016: u32 = make_fourcc(b"P016");
    pub const P210: u32 = make_fourcc(b"P210");
    pub const RGB3: u32 = make_fourcc(b"RGB3");
    pub const RGB4: u32 = make_fourcc(b"RGB4");
    pub const BGR4: u32 = make_fourcc(b"BGR4");
    pub const RGBP: u32 = make_fourcc(b"RGBP");
    pub const RGB565: u32 = make_fourcc(b"RGB2");
    pub const A2RGB10: u32 = make_fourcc(b"RG10");
    pub const AYUV: u32 = make_fourcc(b"AYUV");
    pub const P8: u32 = 41;
}

pub mod codec {
    use super::make_fourcc;

    pub const AVC: u32 = make_fourcc(b"AVC ");
    pub const HEVC: u32 = make_fourcc(b"HEVC");
    pub const MPEG2: u32 = make_fourcc(b"MPG2");
    pub const JPEG: u32 = make_fourcc(b"JPEG");
    pub const VP9: u32 = make_fourcc(b"VP90");
    pub const AV1: u32 = make_fourcc(b"AV1 ");
}

pub const PICSTRUCT_PROGRESSIVE: u16 = 0x01;
pub const PICSTRUCT_FIELD_TFF: u16 = 0x02;
pub const PICSTRUCT_FIELD_BFF: u16 = 0x04;

/// `SetHandle` type of a VA display.
pub const HANDLE_VA_DISPLAY: i32 = 4;

bitflags! {
    /// Where a codec reads its input and writes its output.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
    pub struct IoPattern: u16 {
        const IN_VIDEO_MEMORY = 0x01;
        const IN_SYSTEM_MEMORY = 0x02;
        const OUT_VIDEO_MEMORY = 0x10;
        const OUT_SYSTEM_MEMORY = 0x20;
    }
}

bitflags! {
    /// Frame allocator memory type.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
    pub struct MemType: u16 {
        const INTERNAL_FRAME = 0x0001;
        const EXTERNAL_FRAME = 0x0002;
        const VIDEO_MEMORY_DECODER_TARGET = 0x0010;
        const VIDEO_MEMORY_PROCESSOR_TARGET = 0x0020;
        const SYSTEM_MEMORY = 0x0040;
        const FROM_ENCODE = 0x0100;
        const FROM_DECODE = 0x0200;
        const FROM_VPPIN = 0x0400;
        const FROM_VPPOUT = 0x0800;
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct Version {
    pub minor: u16,
    pub major: u16,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct FrameInfo {
    pub fourcc: u32,
    pub width: u16,
    pub height: u16,
    pub crop_x: u16,
    pub crop_y: u16,
    pub crop_w: u16,
    pub crop_h: u16,
    pub frame_rate_ext_n: u32,
    pub frame_rate_ext_d: u32,
    pub aspect_ratio_w: u16,
    pub aspect_ratio_h: u16,
    pub pic_struct: u16,
    pub chroma_format: u16,
    pub bit_depth_luma: u16,
    pub bit_depth_chroma: u16,
    pub shift: u16,
    pub reserved: u16,
}

/// Scalar part of a frame's data descriptor. Plane contents travel separately.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct FrameData {
    pub time_stamp: u64,
    pub frame_order: u32,
    pub locked: u16,
    pub pitch_high: u16,
    pub pitch_low: u16,
    pub corrupted: u16,
    pub data_flag: u16,
    /// Non-zero when plane contents accompany the descriptor.
    pub mapped: u16,
    pub mem_id: MemId,
}

impl FrameData {
    pub fn pitch(&self) -> u32 {
        (u32::from(self.pitch_high) << 16) | u32::from(self.pitch_low)
    }

    pub fn set_pitch(&mut self, pitch: u32) {
        self.pitch_high = (pitch >> 16) as u16;
        self.pitch_low = pitch as u16;
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct InfoMfx {
    pub low_power: u16,
    pub brc_param_multiplier: u16,
    pub frame_info: FrameInfo,
    pub codec_id: u32,
    pub codec_profile: u16,
    pub codec_level: u16,
    pub num_thread: u16,
    pub target_usage: u16,
    pub gop_pic_size: u16,
    pub gop_ref_dist: u16,
    pub gop_opt_flag: u16,
    pub idr_interval: u16,
    pub rate_control_method: u16,
    pub initial_delay_in_kb: u16,
    pub buffer_size_in_kb: u16,
    pub target_kbps: u16,
    pub max_kbps: u16,
    pub num_slice: u16,
    pub num_ref_frame: u16,
    pub encoded_order: u16,
}

/// Fixed part of the codec configuration. Extension buffers follow it on the wire.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct VideoParamHeader {
    pub alloc_id: u32,
    pub async_depth: u16,
    pub protected: u16,
    pub io_pattern: u16,
    pub reserved: u16,
    pub mfx: InfoMfx,
}

impl VideoParamHeader {
    pub fn io_pattern(&self) -> IoPattern {
        IoPattern::from_bits_truncate(self.io_pattern)
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct FrameAllocRequest {
    pub alloc_id: u32,
    pub info: FrameInfo,
    pub mem_type: u16,
    pub num_frame_min: u16,
    pub num_frame_suggested: u16,
    pub reserved: u16,
}

impl FrameAllocRequest {
    pub fn mem_type(&self) -> MemType {
        MemType::from_bits_truncate(self.mem_type)
    }
}

/// Allocator reply header; `num_frame_actual` memory ids follow it.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct FrameAllocResponse {
    pub alloc_id: u32,
    pub num_frame_actual: u16,
    pub mem_type: u16,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct InitParam {
    pub implementation: u32,
    pub version: Version,
    pub external_threads: u16,
    pub gpu_copy: u16,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct InitializationParam {
    pub access_mode: u32,
    pub vendor_impl_id: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct PlatformInfo {
    pub code_name: u16,
    pub device_id: u16,
    pub media_adapter_type: u16,
    pub reserved: u16,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct DecodeStat {
    pub num_frame: u32,
    pub num_skipped_frame: u32,
    pub num_error: u32,
    pub num_cached_frame: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct EncodeStat {
    pub num_frame: u32,
    pub num_cached_frame: u32,
    pub num_bit: u64,
}

/// Per-frame encoder control. Extension buffers follow it on the wire.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct EncodeCtrlHeader {
    pub frame_type: u16,
    pub qp: u16,
    pub skip_frame: u16,
    pub nal_unit_type: u16,
}

/// SEI/user data payload header; `buf_size` data bytes follow it.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct PayloadInfo {
    pub ctrl_flags: u32,
    pub num_bit: u32,
    pub payload_type: u16,
    pub buf_size: u16,
}

/// Fixed part of an implementation description. The device and codec capability trees follow
/// it on the wire, see [`crate::caps`].
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct ImplDescriptionHeader {
    pub impl_type: u32,
    pub acceleration_mode: u32,
    pub api_version: Version,
    pub vendor_id: u32,
    pub vendor_impl_id: u32,
    pub impl_name: [u8; 32],
}

/// Header shared by every extension buffer.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct ExtBufferHeader {
    pub buffer_id: u32,
    pub buffer_sz: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct IpcmArea {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
    pub reserved: [u16; 8],
}

/// Scalar part of a bitstream descriptor.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct BitstreamHeader {
    pub decode_time_stamp: i64,
    pub time_stamp: u64,
    pub data_offset: u32,
    pub data_length: u32,
    pub max_length: u32,
    pub pic_struct: u16,
    pub frame_type: u16,
    pub data_flag: u16,
    pub reserved: u16,
    pub reserved2: u32,
}

/// Tells the host which of its objects a completed operation refers to. Exactly one field is
/// non-zero.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SyncDependentInfo {
    pub surface: SurfaceId,
    pub bitstream: BitstreamId,
}

const_assert_eq!(size_of::<FrameInfo>(), 40);
const_assert_eq!(size_of::<FrameData>(), 32);
const_assert_eq!(size_of::<InfoMfx>(), 80);
const_assert_eq!(size_of::<VideoParamHeader>(), 92);
const_assert_eq!(size_of::<FrameAllocRequest>(), 52);
const_assert_eq!(size_of::<FrameAllocResponse>(), 8);
const_assert_eq!(size_of::<InitParam>(), 12);
const_assert_eq!(size_of::<ImplDescriptionHeader>(), 52);
const_assert_eq!(size_of::<ExtBufferHeader>(), 8);
const_assert_eq!(size_of::<IpcmArea>(), 32);
const_assert_eq!(size_of::<BitstreamHeader>(), 40);
const_assert_eq!(size_of::<SyncDependentInfo>(), 16);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourcc_codes() {
        assert_eq!(fourcc::NV12, 0x3231_564e);
        assert_eq!(codec::AVC, 0x2043_5641);
    }

    #[test]
    fn pitch_split() {
        let mut data = FrameData::default();
        data.set_pitch(0x1_0040);
        assert_eq!(data.pitch_high, 1);
        assert_eq!(data.pitch_low, 0x40);
        assert_eq!(data.pitch(), 0x1_0040);
    }

    #[test]
    fn fixed_layouts_round_trip_through_bytes() {
        let info = FrameInfo {
            fourcc: fourcc::P010,
            width: 1920,
            height: 1088,
            crop_w: 1920,
            crop_h: 1080,
            frame_rate_ext_n: 30000,
            frame_rate_ext_d: 1001,
            pic_struct: PICSTRUCT_PROGRESSIVE,
            bit_depth_luma: 10,
            ..Default::default()
        };
        let bytes = info.as_bytes().to_vec();
        assert_eq!(bytes.len(), 40);
        assert_eq!(FrameInfo::read_from_bytes(&bytes[..]).unwrap(), info);
    }
}
