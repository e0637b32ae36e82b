// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Frame builder and cursor-based frame parser.
//!
//! Records are copied in host byte order. The protocol is little-endian, which is the byte order
//! of every platform this crate builds for.

use std::mem::size_of;

use log::warn;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

use crate::function::FunctionId;
use crate::status::Status;
use crate::Error;
use crate::Result;

#[cfg(not(target_endian = "little"))]
compile_error!("the bypass wire format requires a little-endian target");

/// Leading 8 bytes of every frame.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct PayloadHeader {
    /// Function id of a request or status of a response.
    pub id: u32,
    /// Total frame size, header included.
    pub size: u32,
}

pub const HEADER_SIZE: usize = size_of::<PayloadHeader>();

/// Marker written in front of an optional value that is present. Absent values are marked by 0.
pub const PRESENT: u64 = 1;

/// Builds one frame. The header's size field always matches the bytes written so far.
#[derive(Clone, Debug)]
pub struct PayloadWriter {
    buf: Vec<u8>,
}

impl PayloadWriter {
    pub fn new(id: u32) -> PayloadWriter {
        let mut writer = PayloadWriter {
            buf: Vec::with_capacity(256),
        };
        writer.buf.extend_from_slice(
            PayloadHeader {
                id,
                size: HEADER_SIZE as u32,
            }
            .as_bytes(),
        );
        writer
    }

    pub fn for_function(function: FunctionId) -> PayloadWriter {
        PayloadWriter::new(function as u32)
    }

    /// Replaces the id word of the header.
    pub fn set_id(&mut self, id: u32) {
        self.buf[0..4].copy_from_slice(&id.to_le_bytes());
    }

    pub fn set_status(&mut self, status: Status) {
        self.set_id(status.to_raw());
    }

    pub fn id(&self) -> u32 {
        u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]])
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True when nothing but the header has been written.
    pub fn is_empty(&self) -> bool {
        self.buf.len() == HEADER_SIZE
    }

    /// Drops everything written after the header.
    pub fn clear(&mut self) {
        self.buf.truncate(HEADER_SIZE);
        self.update_size();
    }

    fn update_size(&mut self) {
        let size = self.buf.len() as u32;
        self.buf[4..8].copy_from_slice(&size.to_le_bytes());
    }

    pub fn write(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
        self.update_size();
    }

    pub fn write_typed<T: IntoBytes + Immutable + ?Sized>(&mut self, value: &T) {
        self.write(value.as_bytes());
    }

    /// Writes a one byte presence flag followed by the elements when present.
    pub fn write_array<T: IntoBytes + Immutable>(&mut self, data: Option<&[T]>) {
        match data {
            Some(items) => {
                self.write_typed(&1u8);
                self.write(items.as_bytes());
            }
            None => self.write_typed(&0u8),
        }
    }

    /// Writes a presence marker followed by the value when present.
    pub fn write_struct<T: IntoBytes + Immutable>(&mut self, value: Option<&T>) {
        self.write_presence(value.is_some());
        if let Some(v) = value {
            self.write_typed(v);
        }
    }

    pub fn write_presence(&mut self, present: bool) {
        self.write_typed(&if present { PRESENT } else { 0u64 });
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Non-fatal anomalies noticed while parsing a frame.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReadWarning {
    /// An extension buffer tag with no registered variable-length layout. Only its fixed bytes
    /// were read.
    UnknownVariableLayout(u32),
}

/// Sequential parser over one received frame.
///
/// Failed reads and seeks leave the cursor where it was.
#[derive(Debug)]
pub struct PayloadReader {
    buf: Vec<u8>,
    pos: usize,
    header: PayloadHeader,
    warnings: Vec<ReadWarning>,
    allocated: usize,
}

impl PayloadReader {
    /// Takes ownership of a complete frame and positions the cursor after its header.
    pub fn new(frame: Vec<u8>) -> Result<PayloadReader> {
        let (header, _) =
            PayloadHeader::read_from_prefix(&frame[..]).map_err(|_| Error::InvalidFrame {
                declared: HEADER_SIZE,
                actual: frame.len(),
            })?;
        if header.size as usize != frame.len() {
            return Err(Error::InvalidFrame {
                declared: header.size as usize,
                actual: frame.len(),
            });
        }
        Ok(PayloadReader {
            buf: frame,
            pos: HEADER_SIZE,
            header,
            warnings: Vec::new(),
            allocated: 0,
        })
    }

    pub fn header(&self) -> PayloadHeader {
        self.header
    }

    /// Gives back the whole frame, header included.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn id(&self) -> u32 {
        self.header.id
    }

    pub fn status(&self) -> Status {
        Status::from_raw(self.header.id)
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.len() == HEADER_SIZE
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Moves the cursor to `pos` and returns the previous position.
    pub fn seek(&mut self, pos: usize) -> Result<usize> {
        if pos > self.buf.len() {
            return Err(Error::SeekPastEnd {
                pos,
                len: self.buf.len(),
            });
        }
        Ok(std::mem::replace(&mut self.pos, pos))
    }

    /// Advances the cursor by `n` bytes and returns the previous position.
    pub fn skip(&mut self, n: usize) -> Result<usize> {
        self.seek(self.pos.saturating_add(n))
    }

    fn take(&mut self, n: usize) -> Result<&[u8]> {
        if n > self.remaining() {
            return Err(Error::OutOfData {
                want: n,
                left: self.remaining(),
            });
        }
        let start = self.pos;
        self.pos += n;
        Ok(&self.buf[start..start + n])
    }

    pub fn read(&mut self, out: &mut [u8]) -> Result<()> {
        let src = self.take(out.len())?;
        out.copy_from_slice(src);
        Ok(())
    }

    /// Reads `n` bytes into a new buffer owned by the caller.
    pub fn read_vec(&mut self, n: usize) -> Result<Vec<u8>> {
        let v = self.take(n)?.to_vec();
        self.allocated += n;
        Ok(v)
    }

    /// Reads `n` bytes into `dst`, reusing its allocation.
    pub fn read_into_vec(&mut self, dst: &mut Vec<u8>, n: usize) -> Result<()> {
        let src = self.take(n)?;
        dst.clear();
        dst.extend_from_slice(src);
        self.allocated += n;
        Ok(())
    }

    pub fn read_typed<T: FromBytes>(&mut self) -> Result<T> {
        let want = size_of::<T>();
        let left = self.remaining();
        let (value, _) = T::read_from_prefix(&self.buf[self.pos..])
            .map_err(|_| Error::OutOfData { want, left })?;
        self.pos += want;
        Ok(value)
    }

    /// Reads a value without consuming it.
    pub fn peek_typed<T: FromBytes>(&mut self) -> Result<T> {
        let value = self.read_typed::<T>()?;
        self.pos -= size_of::<T>();
        Ok(value)
    }

    /// Reads `count` elements into a vector.
    pub fn read_elements<T: FromBytes>(&mut self, count: usize) -> Result<Vec<T>> {
        let elem = size_of::<T>();
        let bytes = count.saturating_mul(elem);
        let src = self.take(bytes)?;
        // Frame bytes carry no alignment guarantee, so copy element by element.
        let items: Vec<T> = src
            .chunks_exact(elem.max(1))
            .filter_map(|chunk| T::read_from_bytes(chunk).ok())
            .collect();
        self.allocated += bytes;
        Ok(items)
    }

    /// Reads a one byte presence flag followed by `count` elements when present.
    pub fn read_array<T: FromBytes>(
        &mut self,
        count: usize,
    ) -> Result<Option<Vec<T>>> {
        let start = self.pos;
        let present: u8 = self.read_typed()?;
        if present == 0 {
            return Ok(None);
        }
        match self.read_elements(count) {
            Ok(v) => Ok(Some(v)),
            Err(e) => {
                self.pos = start;
                Err(e)
            }
        }
    }

    pub fn read_presence(&mut self) -> Result<u64> {
        self.read_typed::<u64>()
    }

    pub fn read_struct<T: FromBytes>(&mut self) -> Result<Option<T>> {
        let start = self.pos;
        if self.read_presence()? == 0 {
            return Ok(None);
        }
        match self.read_typed::<T>() {
            Ok(v) => Ok(Some(v)),
            Err(e) => {
                self.pos = start;
                Err(e)
            }
        }
    }

    pub fn warn(&mut self, warning: ReadWarning) {
        warn!("frame {:#x}: {:?}", self.header.id, warning);
        self.warnings.push(warning);
    }

    pub fn warnings(&self) -> &[ReadWarning] {
        &self.warnings
    }

    /// Bytes of variable-length data handed out to decoded values so far.
    pub fn allocated_bytes(&self) -> usize {
        self.allocated
    }
}
