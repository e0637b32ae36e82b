// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Implementation descriptions returned by `QueryImplsDescription`.
//!
//! A description is a tree: the device with its sub-devices, then decoders, encoders and video
//! processing filters, each broken down by profile and memory type. Every node is written as a
//! fixed record carrying its child counts, followed by its children in order. Leaf lists of plain
//! values (sub-devices, color formats) are counted arrays.

use std::mem::size_of;

use static_assertions::const_assert_eq;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

use crate::payload::PayloadReader;
use crate::payload::PayloadWriter;
use crate::types::ImplDescriptionHeader;
use crate::Error;
use crate::Result;

/// Inclusive range of supported values with a step.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct Range32 {
    pub min: u32,
    pub max: u32,
    pub step: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SubDevice {
    pub index: u32,
    pub sub_device_id: [u8; 32],
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceDescription {
    pub device_id: [u8; 32],
    pub media_adapter_type: u16,
    pub sub_devices: Vec<SubDevice>,
}

/// Surfaces of one memory type a codec profile accepts.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CodecMemDesc {
    pub mem_handle_type: u32,
    pub width: Range32,
    pub height: Range32,
    pub color_formats: Vec<u32>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CodecProfile {
    pub profile: u32,
    pub mem_desc: Vec<CodecMemDesc>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DecoderCodec {
    pub codec_id: u32,
    pub max_codec_level: u16,
    pub profiles: Vec<CodecProfile>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EncoderCodec {
    pub codec_id: u32,
    pub max_codec_level: u16,
    pub bi_directional_prediction: u16,
    pub profiles: Vec<CodecProfile>,
}

/// Output formats a filter can produce from `in_format`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VppFormat {
    pub in_format: u32,
    pub out_formats: Vec<u32>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VppMemDesc {
    pub mem_handle_type: u32,
    pub width: Range32,
    pub height: Range32,
    pub formats: Vec<VppFormat>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VppFilter {
    pub filter_fourcc: u32,
    pub max_delay_in_frames: u16,
    pub mem_desc: Vec<VppMemDesc>,
}

/// Everything an implementation reports about itself.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ImplDescription {
    pub header: ImplDescriptionHeader,
    pub dev: DeviceDescription,
    pub decoders: Vec<DecoderCodec>,
    pub encoders: Vec<EncoderCodec>,
    pub filters: Vec<VppFilter>,
}

impl ImplDescription {
    /// The implementation name up to its first NUL.
    pub fn name(&self) -> String {
        let name = &self.header.impl_name;
        let len = name.iter().position(|b| *b == 0).unwrap_or(name.len());
        String::from_utf8_lossy(&name[..len]).into_owned()
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct DeviceRecord {
    device_id: [u8; 32],
    media_adapter_type: u16,
    num_sub_devices: u16,
}

/// Entry count of the decoder, encoder and filter lists.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct ListRecord {
    num_entries: u16,
    reserved: u16,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct CodecRecord {
    codec_id: u32,
    max_codec_level: u16,
    bi_directional_prediction: u16,
    num_profiles: u16,
    reserved: u16,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct ProfileRecord {
    profile: u32,
    num_mem_types: u16,
    reserved: u16,
}

/// Shared by codec and filter memory descriptors; `num_entries` counts color formats or input
/// formats respectively.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct MemDescRecord {
    mem_handle_type: u32,
    width: Range32,
    height: Range32,
    num_entries: u16,
    reserved: u16,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct FilterRecord {
    filter_fourcc: u32,
    max_delay_in_frames: u16,
    num_mem_types: u16,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct FormatRecord {
    in_format: u32,
    num_out_formats: u16,
    reserved: u16,
}

const_assert_eq!(size_of::<SubDevice>(), 36);
const_assert_eq!(size_of::<DeviceRecord>(), 36);
const_assert_eq!(size_of::<CodecRecord>(), 12);
const_assert_eq!(size_of::<MemDescRecord>(), 32);
const_assert_eq!(size_of::<FilterRecord>(), 8);

fn count(len: usize) -> Result<u16> {
    u16::try_from(len).map_err(|_| Error::TooManyCapabilities(len))
}

fn read_list<T, F>(r: &mut PayloadReader, n: u16, mut read_one: F) -> Result<Vec<T>>
where
    F: FnMut(&mut PayloadReader) -> Result<T>,
{
    // Each entry consumes at least one record, so a bogus count runs out of data quickly.
    let mut items = Vec::new();
    for _ in 0..n {
        items.push(read_one(r)?);
    }
    Ok(items)
}

fn read_values<T: FromBytes>(r: &mut PayloadReader, n: u16) -> Result<Vec<T>> {
    Ok(r.read_array(n as usize)?.unwrap_or_default())
}

fn write_codec_mem_desc(w: &mut PayloadWriter, m: &CodecMemDesc) -> Result<()> {
    w.write_typed(&MemDescRecord {
        mem_handle_type: m.mem_handle_type,
        width: m.width,
        height: m.height,
        num_entries: count(m.color_formats.len())?,
        reserved: 0,
    });
    w.write_array(Some(&m.color_formats[..]));
    Ok(())
}

fn read_codec_mem_desc(r: &mut PayloadReader) -> Result<CodecMemDesc> {
    let rec: MemDescRecord = r.read_typed()?;
    Ok(CodecMemDesc {
        mem_handle_type: rec.mem_handle_type,
        width: rec.width,
        height: rec.height,
        color_formats: read_values(r, rec.num_entries)?,
    })
}

fn write_profiles(w: &mut PayloadWriter, profiles: &[CodecProfile]) -> Result<()> {
    for p in profiles {
        w.write_typed(&ProfileRecord {
            profile: p.profile,
            num_mem_types: count(p.mem_desc.len())?,
            reserved: 0,
        });
        for m in &p.mem_desc {
            write_codec_mem_desc(w, m)?;
        }
    }
    Ok(())
}

fn read_profile(r: &mut PayloadReader) -> Result<CodecProfile> {
    let rec: ProfileRecord = r.read_typed()?;
    Ok(CodecProfile {
        profile: rec.profile,
        mem_desc: read_list(r, rec.num_mem_types, read_codec_mem_desc)?,
    })
}

fn write_codec(
    w: &mut PayloadWriter,
    codec_id: u32,
    max_codec_level: u16,
    bi_directional_prediction: u16,
    profiles: &[CodecProfile],
) -> Result<()> {
    w.write_typed(&CodecRecord {
        codec_id,
        max_codec_level,
        bi_directional_prediction,
        num_profiles: count(profiles.len())?,
        reserved: 0,
    });
    write_profiles(w, profiles)
}

fn read_codec(r: &mut PayloadReader) -> Result<(CodecRecord, Vec<CodecProfile>)> {
    let rec: CodecRecord = r.read_typed()?;
    let profiles = read_list(r, rec.num_profiles, read_profile)?;
    Ok((rec, profiles))
}

fn write_vpp_mem_desc(w: &mut PayloadWriter, m: &VppMemDesc) -> Result<()> {
    w.write_typed(&MemDescRecord {
        mem_handle_type: m.mem_handle_type,
        width: m.width,
        height: m.height,
        num_entries: count(m.formats.len())?,
        reserved: 0,
    });
    for f in &m.formats {
        w.write_typed(&FormatRecord {
            in_format: f.in_format,
            num_out_formats: count(f.out_formats.len())?,
            reserved: 0,
        });
        w.write_array(Some(&f.out_formats[..]));
    }
    Ok(())
}

fn read_vpp_format(r: &mut PayloadReader) -> Result<VppFormat> {
    let rec: FormatRecord = r.read_typed()?;
    Ok(VppFormat {
        in_format: rec.in_format,
        out_formats: read_values(r, rec.num_out_formats)?,
    })
}

fn read_vpp_mem_desc(r: &mut PayloadReader) -> Result<VppMemDesc> {
    let rec: MemDescRecord = r.read_typed()?;
    Ok(VppMemDesc {
        mem_handle_type: rec.mem_handle_type,
        width: rec.width,
        height: rec.height,
        formats: read_list(r, rec.num_entries, read_vpp_format)?,
    })
}

fn read_filter(r: &mut PayloadReader) -> Result<VppFilter> {
    let rec: FilterRecord = r.read_typed()?;
    Ok(VppFilter {
        filter_fourcc: rec.filter_fourcc,
        max_delay_in_frames: rec.max_delay_in_frames,
        mem_desc: read_list(r, rec.num_mem_types, read_vpp_mem_desc)?,
    })
}

fn write_list_len(w: &mut PayloadWriter, len: usize) -> Result<()> {
    w.write_typed(&ListRecord {
        num_entries: count(len)?,
        reserved: 0,
    });
    Ok(())
}

fn read_list_len(r: &mut PayloadReader) -> Result<u16> {
    Ok(r.read_typed::<ListRecord>()?.num_entries)
}

pub fn write_impl_description(w: &mut PayloadWriter, desc: &ImplDescription) -> Result<()> {
    w.write_typed(&desc.header);

    let dev = &desc.dev;
    w.write_typed(&DeviceRecord {
        device_id: dev.device_id,
        media_adapter_type: dev.media_adapter_type,
        num_sub_devices: count(dev.sub_devices.len())?,
    });
    w.write_array(Some(&dev.sub_devices[..]));

    write_list_len(w, desc.decoders.len())?;
    for c in &desc.decoders {
        write_codec(w, c.codec_id, c.max_codec_level, 0, &c.profiles)?;
    }
    write_list_len(w, desc.encoders.len())?;
    for c in &desc.encoders {
        write_codec(
            w,
            c.codec_id,
            c.max_codec_level,
            c.bi_directional_prediction,
            &c.profiles,
        )?;
    }
    write_list_len(w, desc.filters.len())?;
    for f in &desc.filters {
        w.write_typed(&FilterRecord {
            filter_fourcc: f.filter_fourcc,
            max_delay_in_frames: f.max_delay_in_frames,
            num_mem_types: count(f.mem_desc.len())?,
        });
        for m in &f.mem_desc {
            write_vpp_mem_desc(w, m)?;
        }
    }
    Ok(())
}

pub fn read_impl_description(r: &mut PayloadReader) -> Result<ImplDescription> {
    let header: ImplDescriptionHeader = r.read_typed()?;

    let rec: DeviceRecord = r.read_typed()?;
    let dev = DeviceDescription {
        device_id: rec.device_id,
        media_adapter_type: rec.media_adapter_type,
        sub_devices: read_values(r, rec.num_sub_devices)?,
    };

    let n = read_list_len(r)?;
    let decoders = read_list(r, n, |r| {
        let (rec, profiles) = read_codec(r)?;
        Ok(DecoderCodec {
            codec_id: rec.codec_id,
            max_codec_level: rec.max_codec_level,
            profiles,
        })
    })?;
    let n = read_list_len(r)?;
    let encoders = read_list(r, n, |r| {
        let (rec, profiles) = read_codec(r)?;
        Ok(EncoderCodec {
            codec_id: rec.codec_id,
            max_codec_level: rec.max_codec_level,
            bi_directional_prediction: rec.bi_directional_prediction,
            profiles,
        })
    })?;
    let n = read_list_len(r)?;
    let filters = read_list(r, n, read_filter)?;

    Ok(ImplDescription {
        header,
        dev,
        decoders,
        encoders,
        filters,
    })
}

/// Writes a `u32` count followed by each description.
pub fn write_impl_descriptions(w: &mut PayloadWriter, descs: &[ImplDescription]) -> Result<()> {
    w.write_typed(&(descs.len() as u32));
    for d in descs {
        write_impl_description(w, d)?;
    }
    Ok(())
}

pub fn read_impl_descriptions(r: &mut PayloadReader) -> Result<Vec<ImplDescription>> {
    let n: u32 = r.read_typed()?;
    let mut descs = Vec::new();
    for _ in 0..n {
        descs.push(read_impl_description(r)?);
    }
    Ok(descs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::codec;
    use crate::types::fourcc;
    use crate::types::Version;

    fn range(max: u32) -> Range32 {
        Range32 {
            min: 16,
            max,
            step: 16,
        }
    }

    fn sample() -> ImplDescription {
        let mut impl_name = [0; 32];
        impl_name[..3].copy_from_slice(b"vpu");
        let mut sub_device_id = [0; 32];
        sub_device_id[..4].copy_from_slice(b"tile");
        let nv12 = CodecMemDesc {
            mem_handle_type: 1,
            width: range(4096),
            height: range(2304),
            color_formats: vec![fourcc::NV12, fourcc::P010],
        };
        ImplDescription {
            header: ImplDescriptionHeader {
                impl_type: 2,
                acceleration_mode: 0x0400,
                api_version: Version { minor: 8, major: 2 },
                impl_name,
                ..Default::default()
            },
            dev: DeviceDescription {
                media_adapter_type: 1,
                sub_devices: vec![
                    SubDevice {
                        index: 0,
                        sub_device_id,
                    },
                    SubDevice {
                        index: 1,
                        sub_device_id,
                    },
                ],
                ..Default::default()
            },
            decoders: vec![DecoderCodec {
                codec_id: codec::AVC,
                max_codec_level: 51,
                profiles: vec![
                    CodecProfile {
                        profile: 66,
                        mem_desc: vec![nv12.clone()],
                    },
                    CodecProfile {
                        profile: 100,
                        mem_desc: vec![],
                    },
                ],
            }],
            encoders: vec![EncoderCodec {
                codec_id: codec::HEVC,
                max_codec_level: 186,
                bi_directional_prediction: 1,
                profiles: vec![CodecProfile {
                    profile: 1,
                    mem_desc: vec![nv12],
                }],
            }],
            filters: vec![VppFilter {
                filter_fourcc: fourcc::RGB4,
                max_delay_in_frames: 1,
                mem_desc: vec![VppMemDesc {
                    mem_handle_type: 2,
                    width: range(8192),
                    height: range(8192),
                    formats: vec![
                        VppFormat {
                            in_format: fourcc::NV12,
                            out_formats: vec![fourcc::RGB4, fourcc::NV12],
                        },
                        VppFormat {
                            in_format: fourcc::YUY2,
                            out_formats: vec![],
                        },
                    ],
                }],
            }],
        }
    }

    #[test]
    fn nested_tree_survives_the_wire() {
        let descs = vec![sample(), ImplDescription::default()];
        let mut w = PayloadWriter::new(0);
        write_impl_descriptions(&mut w, &descs).unwrap();
        let mut r = PayloadReader::new(w.into_bytes()).unwrap();
        assert_eq!(read_impl_descriptions(&mut r).unwrap(), descs);
        assert_eq!(r.remaining(), 0);
        assert_eq!(descs[0].name(), "vpu");
    }

    #[test]
    fn truncated_tree_is_rejected() {
        let mut w = PayloadWriter::new(0);
        write_impl_descriptions(&mut w, &[sample()]).unwrap();
        let mut bytes = w.into_bytes();
        bytes.truncate(bytes.len() - 6);
        let len = bytes.len() as u32;
        bytes[4..8].copy_from_slice(&len.to_le_bytes());
        let mut r = PayloadReader::new(bytes).unwrap();
        assert!(matches!(
            read_impl_descriptions(&mut r),
            Err(Error::OutOfData { .. })
        ));
    }

    #[test]
    fn oversized_list_is_refused() {
        let desc = ImplDescription {
            decoders: vec![DecoderCodec::default(); u16::MAX as usize + 1],
            ..Default::default()
        };
        let mut w = PayloadWriter::new(0);
        assert_eq!(
            write_impl_description(&mut w, &desc),
            Err(Error::TooManyCapabilities(u16::MAX as usize + 1))
        );
    }
}
