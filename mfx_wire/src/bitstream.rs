// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Bitstream encoding with optional de-duplication of unchanged payload bytes.
//!
//! A bitstream is written as:
//!
//! * identity (`u64`, 0 when absent)
//! * [`BitstreamHeader`] and extension buffers
//! * data presence marker (`u64`)
//! * contents tag (`u64`): number of committed bytes that follow, 0 when the peer already holds
//!   them in its [`BitstreamCache`]
//! * the committed bytes `data[DataOffset..DataOffset + DataLength]` when the tag is non-zero

use std::sync::Arc;

use parking_lot::Mutex;

use crate::ext_buffer::ExtBufferList;
use crate::ext_buffer::ExtBufferRegistry;
use crate::payload::PayloadReader;
use crate::payload::PayloadWriter;
use crate::payload::PRESENT;
use crate::types::BitstreamHeader;
use crate::types::BitstreamId;
use crate::Error;
use crate::Result;

/// Largest bitstream accepted from the peer.
pub const MAX_BITSTREAM_SIZE: u32 = 256 * 1024 * 1024;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Bitstream {
    pub header: BitstreamHeader,
    /// Backing buffer; `max_length` bytes when allocated.
    pub data: Option<Vec<u8>>,
    pub ext_param: ExtBufferList,
}

/// A bitstream shared between the application and the shim.
pub type SharedBitstream = Arc<Mutex<Bitstream>>;

impl Bitstream {
    /// A bitstream whose whole buffer is committed data.
    pub fn from_data(data: Vec<u8>) -> Bitstream {
        let len = data.len() as u32;
        Bitstream {
            header: BitstreamHeader {
                data_length: len,
                max_length: len,
                ..Default::default()
            },
            data: Some(data),
            ext_param: None,
        }
    }

    /// An empty output bitstream able to hold `max_length` bytes.
    pub fn with_capacity(max_length: u32) -> Bitstream {
        Bitstream {
            header: BitstreamHeader {
                max_length,
                ..Default::default()
            },
            data: Some(vec![0; max_length as usize]),
            ext_param: None,
        }
    }

    fn committed_range(&self) -> Result<std::ops::Range<usize>> {
        let h = &self.header;
        let end = h.data_offset as u64 + h.data_length as u64;
        if end > h.max_length as u64 {
            return Err(Error::BitstreamOverrun {
                offset: h.data_offset,
                length: h.data_length,
                max: h.max_length,
            });
        }
        Ok(h.data_offset as usize..end as usize)
    }

    pub fn into_shared(self) -> SharedBitstream {
        Arc::new(Mutex::new(self))
    }

    /// Bytes between `DataOffset` and `DataOffset + DataLength`, empty without a buffer.
    pub fn committed(&self) -> Result<&[u8]> {
        let range = self.committed_range()?;
        match &self.data {
            Some(data) => data.get(range).ok_or(Error::BitstreamOverrun {
                offset: self.header.data_offset,
                length: self.header.data_length,
                max: data.len() as u32,
            }),
            None => Ok(&[]),
        }
    }
}

/// Copy of the committed bytes last sent to (or received from) the peer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BitstreamCache {
    bytes: Vec<u8>,
}

impl BitstreamCache {
    pub fn new() -> BitstreamCache {
        BitstreamCache::default()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// Compares the cached region with `live` at `offset`, dropping the cache on mismatch.
    /// Returns true when the cache still mirrors the live bytes.
    fn validate(&mut self, offset: usize, live: &[u8]) -> bool {
        if self.bytes.is_empty() {
            return false;
        }
        let end = offset + live.len();
        if self.bytes.len() < end || self.bytes[offset..end] != *live {
            self.bytes.clear();
            return false;
        }
        true
    }

    fn store(&mut self, offset: usize, live: &[u8]) {
        self.bytes.resize(offset + live.len(), 0);
        self.bytes[offset..].copy_from_slice(live);
    }
}

/// Writes `bs` under the identity `id` (any non-zero value when the peer does not need one).
pub fn write_bitstream(
    w: &mut PayloadWriter,
    registry: &ExtBufferRegistry,
    id: BitstreamId,
    bs: Option<&Bitstream>,
    cache: Option<&mut BitstreamCache>,
) -> Result<()> {
    let bs = match bs {
        Some(bs) => bs,
        None => {
            w.write_typed(&0u64);
            return Ok(());
        }
    };
    w.write_typed(&if id.is_null() { PRESENT } else { id.0 });

    let range = bs.committed_range()?;
    let live = bs.committed()?;
    w.write_typed(&bs.header);
    registry.write_ext_buffers(w, &bs.ext_param)?;

    if bs.data.is_none() {
        w.write_presence(false);
        return Ok(());
    }
    w.write_presence(true);

    let tag = match cache {
        Some(cache) => {
            if live.is_empty() || cache.validate(range.start, live) {
                0
            } else {
                cache.store(range.start, live);
                live.len() as u64
            }
        }
        None => live.len() as u64,
    };
    w.write_typed(&tag);
    if tag != 0 {
        w.write(live);
    }
    Ok(())
}

/// Reads a bitstream into `dst` and returns the identity the peer wrote for it.
///
/// With a cache, data sent by the peer refreshes the cache and the bitstream buffer always
/// mirrors the cache. Without one, an existing buffer in `dst` is reused.
pub fn read_bitstream(
    r: &mut PayloadReader,
    registry: &ExtBufferRegistry,
    dst: &mut Option<Bitstream>,
    cache: Option<&mut BitstreamCache>,
) -> Result<BitstreamId> {
    let id: u64 = r.read_typed()?;
    if id == 0 {
        *dst = None;
        return Ok(BitstreamId::NULL);
    }
    let bs = dst.get_or_insert_with(Bitstream::default);
    bs.header = r.read_typed()?;
    registry.read_ext_buffers(r, &mut bs.ext_param)?;

    if r.read_presence()? == 0 {
        bs.data = None;
        return Ok(BitstreamId(id));
    }
    if bs.header.data_length > MAX_BITSTREAM_SIZE {
        return Err(Error::BitstreamTooLarge(bs.header.data_length));
    }
    bs.header.max_length = bs.header.max_length.min(MAX_BITSTREAM_SIZE);

    let offset = bs.header.data_offset as usize;
    let tag: u64 = r.read_typed()?;
    let data = bs.data.get_or_insert_with(Vec::new);
    match cache {
        Some(cache) => {
            if tag != 0 {
                let mut incoming = Vec::new();
                r.read_into_vec(&mut incoming, bs.header.data_length as usize)?;
                cache.store(offset, &incoming);
            }
            data.clear();
            data.extend_from_slice(cache.as_slice());
            if data.is_empty() {
                data.push(0);
            }
        }
        None => {
            let end = offset + bs.header.data_length as usize;
            let size = (bs.header.max_length as usize).max(data.len());
            if end > size {
                return Err(Error::BitstreamOverrun {
                    offset: bs.header.data_offset,
                    length: bs.header.data_length,
                    max: bs.header.max_length,
                });
            }
            data.resize(size, 0);
            if tag != 0 {
                r.read(&mut data[offset..end])?;
            }
        }
    }
    Ok(BitstreamId(id))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(bs: &Bitstream, cache: Option<&mut BitstreamCache>) -> PayloadReader {
        let mut w = PayloadWriter::new(0);
        write_bitstream(
            &mut w,
            &ExtBufferRegistry::default(),
            BitstreamId(0x55),
            Some(bs),
            cache,
        )
        .unwrap();
        PayloadReader::new(w.into_bytes()).unwrap()
    }

    fn tag_of(r: &mut PayloadReader) -> u64 {
        let start = r.pos();
        r.skip(8 + std::mem::size_of::<BitstreamHeader>() + 8 + 2 + 8)
            .unwrap();
        let tag = r.read_typed::<u64>().unwrap();
        r.seek(start).unwrap();
        tag
    }

    #[test]
    fn unchanged_bytes_are_sent_once() {
        let mut cache = BitstreamCache::new();
        let bs = Bitstream::from_data((0..10).collect());

        let mut first = encode(&bs, Some(&mut cache));
        assert_eq!(tag_of(&mut first), 10);
        assert_eq!(cache.as_slice(), bs.committed().unwrap());

        let mut second = encode(&bs, Some(&mut cache));
        assert_eq!(tag_of(&mut second), 0);
        assert!(second.len() < first.len());

        let mut changed = bs.clone();
        changed.data.as_mut().unwrap()[3] = 0xff;
        let mut third = encode(&changed, Some(&mut cache));
        assert_eq!(tag_of(&mut third), 10);
        assert_eq!(cache.as_slice(), changed.committed().unwrap());
    }

    #[test]
    fn consumed_prefix_keeps_cache() {
        let mut host_cache = BitstreamCache::new();
        let mut target_cache = BitstreamCache::new();
        let registry = ExtBufferRegistry::default();
        let mut bs = Bitstream::from_data((100..120).collect());

        let mut r = encode(&bs, Some(&mut host_cache));
        let mut target = None;
        read_bitstream(&mut r, &registry, &mut target, Some(&mut target_cache)).unwrap();
        assert_eq!(target.as_ref().unwrap().committed().unwrap(), bs.committed().unwrap());

        // The target consumed 8 bytes; the host resends the remainder without contents.
        bs.header.data_offset = 8;
        bs.header.data_length = 12;
        let mut r = encode(&bs, Some(&mut host_cache));
        assert_eq!(tag_of(&mut r), 0);
        read_bitstream(&mut r, &registry, &mut target, Some(&mut target_cache)).unwrap();
        assert_eq!(target.unwrap().committed().unwrap(), bs.committed().unwrap());
    }

    #[test]
    fn uncached_read_reuses_buffer() {
        let registry = ExtBufferRegistry::default();
        let mut bs = Bitstream::with_capacity(64);
        bs.header.data_offset = 4;
        bs.header.data_length = 3;
        bs.data.as_mut().unwrap()[4..7].copy_from_slice(&[7, 8, 9]);

        let mut r = encode(&bs, None);
        let mut out = Some(Bitstream::with_capacity(64));
        let ptr = out.as_ref().unwrap().data.as_ref().unwrap().as_ptr();
        assert_eq!(
            read_bitstream(&mut r, &registry, &mut out, None).unwrap(),
            BitstreamId(0x55)
        );
        let out = out.unwrap();
        assert_eq!(out.committed().unwrap(), &[7, 8, 9]);
        assert_eq!(out.data.as_ref().unwrap().as_ptr(), ptr);
    }

    #[test]
    fn overrun_is_undefined_behavior() {
        let mut bs = Bitstream::from_data(vec![0; 8]);
        bs.header.data_offset = 4;
        let mut w = PayloadWriter::new(0);
        let err = write_bitstream(
            &mut w,
            &ExtBufferRegistry::default(),
            BitstreamId::NULL,
            Some(&bs),
            None,
        )
        .unwrap_err();
        assert_eq!(err.status(), crate::Status::ERR_UNDEFINED_BEHAVIOR);
    }

    #[test]
    fn committed_region_must_fit() {
        let mut bs = Bitstream::from_data(vec![1; 8]);
        bs.header.data_offset = 6;
        assert!(matches!(
            bs.committed(),
            Err(Error::BitstreamOverrun { offset: 6, length: 8, max: 8 })
        ));

        // The header agrees but the buffer is shorter than it claims.
        bs.header.data_offset = 0;
        bs.header.max_length = 16;
        bs.header.data_length = 12;
        assert!(matches!(
            bs.committed(),
            Err(Error::BitstreamOverrun { max: 8, .. })
        ));

        bs.data = None;
        assert_eq!(bs.committed().unwrap(), &[] as &[u8]);
    }

    #[test]
    fn oversized_length_is_rejected() {
        let mut w = PayloadWriter::new(0);
        w.write_typed(&PRESENT);
        w.write_typed(&BitstreamHeader {
            data_length: MAX_BITSTREAM_SIZE + 1,
            max_length: u32::MAX,
            ..Default::default()
        });
        w.write_presence(false);
        w.write_typed(&0u16);
        w.write_presence(true);
        let mut r = PayloadReader::new(w.into_bytes()).unwrap();
        let err = read_bitstream(&mut r, &ExtBufferRegistry::default(), &mut None, None)
            .unwrap_err();
        assert_eq!(err, Error::BitstreamTooLarge(MAX_BITSTREAM_SIZE + 1));
        assert_eq!(err.status(), crate::Status::ERR_MEMORY_ALLOC);
    }

    #[test]
    fn absent_bitstream() {
        let mut w = PayloadWriter::new(0);
        write_bitstream(&mut w, &ExtBufferRegistry::default(), BitstreamId(1), None, None)
            .unwrap();
        let mut r = PayloadReader::new(w.into_bytes()).unwrap();
        let mut out = Some(Bitstream::default());
        assert_eq!(
            read_bitstream(&mut r, &ExtBufferRegistry::default(), &mut out, None).unwrap(),
            BitstreamId::NULL
        );
        assert_eq!(out, None);
    }
}
