// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Self-describing extension buffers.
//!
//! An extension buffer starts with an [`ExtBufferHeader`] giving its tag and declared size. The
//! fixed part (`buffer_sz` bytes, header included) travels verbatim. Some tags additionally own
//! out-of-line arrays; those are described by a [`VariableLayout`] registered for the tag in an
//! [`ExtBufferRegistry`] and travel right after the fixed part.

use std::collections::BTreeMap;
use std::mem::size_of;

use zerocopy::IntoBytes;

use crate::payload::PayloadReader;
use crate::payload::PayloadWriter;
use crate::payload::ReadWarning;
use crate::payload::PRESENT;
use crate::status::Status;
use crate::types::make_fourcc;
use crate::types::ExtBufferHeader;
use crate::types::IpcmArea;
use crate::Error;
use crate::Result;

pub const EXTBUFF_MBQP: u32 = make_fourcc(b"MBQP");
pub const EXTBUFF_ENCODER_IPCM_AREA: u32 = make_fourcc(b"PCMR");
pub const EXTBUFF_CODING_OPTION_SPSPPS: u32 = make_fourcc(b"COSP");
pub const EXTBUFF_CODING_OPTION: u32 = make_fourcc(b"CDOP");
pub const EXTBUFF_CODING_OPTION2: u32 = make_fourcc(b"CDO2");

pub const MBQP_MODE_QP_VALUE: u16 = 0;
pub const MBQP_MODE_QP_DELTA: u16 = 1;
pub const MBQP_MODE_QP_ADAPTIVE: u16 = 2;
/// Size of one adaptive QP map entry (QP plus mode).
pub const QP_AND_MODE_SIZE: usize = 4;

const HEADER_SIZE: u32 = size_of::<ExtBufferHeader>() as u32;

/// Out-of-line data owned by an extension buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExtVariable {
    Mbqp {
        mode: u16,
        block_size: u16,
        num_qp_alloc: u32,
        qp: Vec<u8>,
    },
    IpcmArea {
        areas: Vec<IpcmArea>,
    },
    SpsPps {
        sps_id: u16,
        pps_id: u16,
        sps: Option<Vec<u8>>,
        pps: Option<Vec<u8>>,
    },
    /// Generic list of byte blobs, for layouts registered with [`encode_blobs`] and
    /// [`decode_blobs`].
    Blobs(Vec<Vec<u8>>),
}

/// One extension buffer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExtBuffer {
    pub id: u32,
    /// Fixed bytes following the header.
    pub body: Vec<u8>,
    pub variable: Option<ExtVariable>,
}

impl ExtBuffer {
    pub fn new(id: u32, body: Vec<u8>) -> ExtBuffer {
        ExtBuffer {
            id,
            body,
            variable: None,
        }
    }

    pub fn with_variable(id: u32, body: Vec<u8>, variable: ExtVariable) -> ExtBuffer {
        ExtBuffer {
            id,
            body,
            variable: Some(variable),
        }
    }

    /// Size of the fixed part, header included.
    pub fn declared_size(&self) -> u32 {
        HEADER_SIZE + self.body.len() as u32
    }
}

/// An optional list of optional extension buffers. `None` entries are kept in place.
pub type ExtBufferList = Option<Vec<Option<ExtBuffer>>>;

pub type EncodeFn = fn(Option<&ExtVariable>, &mut PayloadWriter) -> Result<()>;
pub type DecodeFn = fn(&mut PayloadReader, &mut Option<ExtVariable>) -> Result<()>;

/// Encoder and decoder of the out-of-line part of one tag.
#[derive(Copy, Clone)]
pub struct VariableLayout {
    pub encode: EncodeFn,
    pub decode: DecodeFn,
}

/// Maps extension buffer tags to their variable-length layouts.
#[derive(Clone)]
pub struct ExtBufferRegistry {
    layouts: BTreeMap<u32, VariableLayout>,
}

impl Default for ExtBufferRegistry {
    fn default() -> Self {
        let mut registry = ExtBufferRegistry::empty();
        registry.register(EXTBUFF_MBQP, encode_mbqp, decode_mbqp);
        registry.register(EXTBUFF_ENCODER_IPCM_AREA, encode_ipcm_area, decode_ipcm_area);
        registry.register(EXTBUFF_CODING_OPTION_SPSPPS, encode_spspps, decode_spspps);
        registry
    }
}

impl ExtBufferRegistry {
    /// A registry without any variable-length layout.
    pub fn empty() -> ExtBufferRegistry {
        ExtBufferRegistry {
            layouts: BTreeMap::new(),
        }
    }

    /// Registers both halves of a layout, replacing any previous registration.
    pub fn register(&mut self, tag: u32, encode: EncodeFn, decode: DecodeFn) {
        self.layouts.insert(tag, VariableLayout { encode, decode });
    }

    pub fn is_registered(&self, tag: u32) -> bool {
        self.layouts.contains_key(&tag)
    }

    /// Writes the header and fixed bytes of `buf`, then its registered variable part.
    pub fn write_ext_buffer(&self, w: &mut PayloadWriter, buf: &ExtBuffer) -> Result<()> {
        w.write_typed(&ExtBufferHeader {
            buffer_id: buf.id,
            buffer_sz: buf.declared_size(),
        });
        w.write(&buf.body);
        if let Some(layout) = self.layouts.get(&buf.id) {
            (layout.encode)(buf.variable.as_ref(), w)?;
        }
        Ok(())
    }

    /// Reads one buffer into `dst`, reusing its allocations.
    pub fn read_ext_buffer(&self, r: &mut PayloadReader, dst: &mut ExtBuffer) -> Result<()> {
        let header: ExtBufferHeader = r.read_typed()?;
        if header.buffer_sz < HEADER_SIZE {
            return Err(Error::InvalidExtBufferSize {
                id: header.buffer_id,
                size: header.buffer_sz,
            });
        }
        if dst.id != header.buffer_id {
            dst.variable = None;
        }
        dst.id = header.buffer_id;
        r.read_into_vec(&mut dst.body, (header.buffer_sz - HEADER_SIZE) as usize)?;
        match self.layouts.get(&header.buffer_id) {
            Some(layout) => (layout.decode)(r, &mut dst.variable)?,
            None => {
                dst.variable = None;
                r.warn(ReadWarning::UnknownVariableLayout(header.buffer_id));
            }
        }
        Ok(())
    }

    /// Writes a list: presence marker, count, then per entry its identity, declared size and
    /// contents. Identities are 1-based indices, 0 marks a missing entry.
    pub fn write_ext_buffers(&self, w: &mut PayloadWriter, list: &ExtBufferList) -> Result<()> {
        let entries = match list {
            Some(entries) => entries,
            None => {
                w.write_presence(false);
                w.write_typed(&0u16);
                return Ok(());
            }
        };
        let count =
            u16::try_from(entries.len()).map_err(|_| Error::TooManyExtBuffers(entries.len()))?;
        w.write_presence(true);
        w.write_typed(&count);
        for (index, entry) in entries.iter().enumerate() {
            match entry {
                Some(buf) => {
                    w.write_typed(&(index as u64 + 1));
                    w.write_typed(&buf.declared_size().max(HEADER_SIZE));
                    self.write_ext_buffer(w, buf)?;
                }
                None => w.write_typed(&0u64),
            }
        }
        Ok(())
    }

    /// Reads a list written by [`write_ext_buffers`](Self::write_ext_buffers) into `dst`,
    /// reusing the existing vector and buffers where possible.
    pub fn read_ext_buffers(&self, r: &mut PayloadReader, dst: &mut ExtBufferList) -> Result<()> {
        let present = r.read_presence()?;
        let count: u16 = r.read_typed()?;
        if present == 0 {
            *dst = None;
            return Ok(());
        }
        let entries = dst.get_or_insert_with(Vec::new);
        entries.resize_with(count as usize, || None);
        for entry in entries.iter_mut() {
            let identity: u64 = r.read_typed()?;
            if identity == 0 {
                *entry = None;
                continue;
            }
            let declared: u32 = r.read_typed()?;
            let header: ExtBufferHeader = r.peek_typed()?;
            if declared != header.buffer_sz.max(HEADER_SIZE) {
                return Err(Error::InvalidExtBufferSize {
                    id: header.buffer_id,
                    size: declared,
                });
            }
            let buf = entry.get_or_insert_with(ExtBuffer::default);
            self.read_ext_buffer(r, buf)?;
        }
        Ok(())
    }
}

fn layout_mismatch() -> Error {
    Error::Status(Status::ERR_INVALID_VIDEO_PARAM)
}

fn mbqp_map_size(mode: u16, num_qp_alloc: u32) -> usize {
    let entry = if mode == MBQP_MODE_QP_ADAPTIVE {
        QP_AND_MODE_SIZE
    } else {
        1
    };
    num_qp_alloc as usize * entry
}

fn encode_mbqp(var: Option<&ExtVariable>, w: &mut PayloadWriter) -> Result<()> {
    let (mode, block_size, num_qp_alloc, qp): (u16, u16, u32, &[u8]) = match var {
        None => (0, 0, 0, &[]),
        Some(ExtVariable::Mbqp {
            mode,
            block_size,
            num_qp_alloc,
            qp,
        }) => (*mode, *block_size, *num_qp_alloc, qp),
        Some(_) => return Err(layout_mismatch()),
    };
    let size = mbqp_map_size(mode, num_qp_alloc);
    let map = qp
        .get(..size)
        .ok_or(Error::Status(Status::ERR_NOT_ENOUGH_BUFFER))?;
    w.write_typed(&mode);
    w.write_typed(&block_size);
    w.write_typed(&num_qp_alloc);
    w.write(map);
    Ok(())
}

fn decode_mbqp(r: &mut PayloadReader, dst: &mut Option<ExtVariable>) -> Result<()> {
    let mode: u16 = r.read_typed()?;
    let block_size: u16 = r.read_typed()?;
    let num_qp_alloc: u32 = r.read_typed()?;
    let size = mbqp_map_size(mode, num_qp_alloc);
    let mut qp = match dst.take() {
        Some(ExtVariable::Mbqp { qp, .. }) => qp,
        _ => Vec::new(),
    };
    r.read_into_vec(&mut qp, size)?;
    *dst = Some(ExtVariable::Mbqp {
        mode,
        block_size,
        num_qp_alloc,
        qp,
    });
    Ok(())
}

fn encode_ipcm_area(var: Option<&ExtVariable>, w: &mut PayloadWriter) -> Result<()> {
    let areas: &[IpcmArea] = match var {
        None => &[],
        Some(ExtVariable::IpcmArea { areas }) => areas,
        Some(_) => return Err(layout_mismatch()),
    };
    let num_area = u16::try_from(areas.len()).map_err(|_| layout_mismatch())?;
    w.write_typed(&num_area);
    w.write(areas.as_bytes());
    Ok(())
}

fn decode_ipcm_area(r: &mut PayloadReader, dst: &mut Option<ExtVariable>) -> Result<()> {
    let num_area: u16 = r.read_typed()?;
    let read = r.read_elements::<IpcmArea>(num_area as usize)?;
    let mut areas = match dst.take() {
        Some(ExtVariable::IpcmArea { areas }) => areas,
        _ => Vec::new(),
    };
    areas.clear();
    areas.extend(read);
    *dst = Some(ExtVariable::IpcmArea { areas });
    Ok(())
}

fn encode_spspps(var: Option<&ExtVariable>, w: &mut PayloadWriter) -> Result<()> {
    let (sps_id, pps_id, sps, pps) = match var {
        None => (0, 0, None, None),
        Some(ExtVariable::SpsPps {
            sps_id,
            pps_id,
            sps,
            pps,
        }) => (*sps_id, *pps_id, sps.as_deref(), pps.as_deref()),
        Some(_) => return Err(layout_mismatch()),
    };
    let buf_size = |b: Option<&[u8]>| u16::try_from(b.map_or(0, |b| b.len()));
    let sps_size = buf_size(sps).map_err(|_| layout_mismatch())?;
    let pps_size = buf_size(pps).map_err(|_| layout_mismatch())?;
    w.write_typed(&sps_id);
    w.write_typed(&pps_id);
    w.write_typed(&sps_size);
    w.write_typed(&pps_size);
    w.write_presence(sps.is_some());
    w.write_presence(pps.is_some());
    if let Some(sps) = sps {
        w.write(sps);
    }
    if let Some(pps) = pps {
        w.write(pps);
    }
    Ok(())
}

fn decode_spspps(r: &mut PayloadReader, dst: &mut Option<ExtVariable>) -> Result<()> {
    let sps_id: u16 = r.read_typed()?;
    let pps_id: u16 = r.read_typed()?;
    let sps_size: u16 = r.read_typed()?;
    let pps_size: u16 = r.read_typed()?;
    let has_sps = r.read_presence()? != 0;
    let has_pps = r.read_presence()? != 0;
    let (mut old_sps, mut old_pps) = match dst.take() {
        Some(ExtVariable::SpsPps { sps, pps, .. }) => (sps, pps),
        _ => (None, None),
    };
    let sps = if has_sps {
        let mut buf = old_sps.take().unwrap_or_default();
        r.read_into_vec(&mut buf, sps_size as usize)?;
        Some(buf)
    } else {
        None
    };
    let pps = if has_pps {
        let mut buf = old_pps.take().unwrap_or_default();
        r.read_into_vec(&mut buf, pps_size as usize)?;
        Some(buf)
    } else {
        None
    };
    *dst = Some(ExtVariable::SpsPps {
        sps_id,
        pps_id,
        sps,
        pps,
    });
    Ok(())
}

/// Writes [`ExtVariable::Blobs`] as a count followed by length-prefixed blobs.
pub fn encode_blobs(var: Option<&ExtVariable>, w: &mut PayloadWriter) -> Result<()> {
    let blobs: &[Vec<u8>] = match var {
        None => &[],
        Some(ExtVariable::Blobs(blobs)) => blobs,
        Some(_) => return Err(layout_mismatch()),
    };
    w.write_typed(&(blobs.len() as u32));
    for blob in blobs {
        w.write_typed(&(blob.len() as u32));
        w.write(blob);
    }
    Ok(())
}

pub fn decode_blobs(r: &mut PayloadReader, dst: &mut Option<ExtVariable>) -> Result<()> {
    let count: u32 = r.read_typed()?;
    let mut blobs = match dst.take() {
        Some(ExtVariable::Blobs(blobs)) => blobs,
        _ => Vec::new(),
    };
    // Never trust the count for preallocation.
    blobs.truncate(count as usize);
    for i in 0..count as usize {
        let len: u32 = r.read_typed()?;
        if i < blobs.len() {
            r.read_into_vec(&mut blobs[i], len as usize)?;
        } else {
            blobs.push(r.read_vec(len as usize)?);
        }
    }
    *dst = Some(ExtVariable::Blobs(blobs));
    Ok(())
}
