// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Byte-level layout of complete request frames.

use mfx_wire::bitstream::read_bitstream;
use mfx_wire::bitstream::write_bitstream;
use mfx_wire::ext_buffer::ExtVariable;
use mfx_wire::ext_buffer::EXTBUFF_MBQP;
use mfx_wire::ext_buffer::MBQP_MODE_QP_VALUE;
use mfx_wire::param::read_video_param;
use mfx_wire::param::write_video_param;
use mfx_wire::param::VideoParam;
use mfx_wire::surface::put_surface;
use mfx_wire::surface::read_surface_descriptor;
use mfx_wire::types::fourcc;
use mfx_wire::types::BitstreamId;
use mfx_wire::types::FrameInfo;
use mfx_wire::types::SessionHandle;
use mfx_wire::types::SurfaceId;
use mfx_wire::Bitstream;
use mfx_wire::BitstreamCache;
use mfx_wire::Error;
use mfx_wire::ExtBuffer;
use mfx_wire::ExtBufferRegistry;
use mfx_wire::FrameSurface;
use mfx_wire::FunctionId;
use mfx_wire::PayloadReader;
use mfx_wire::PayloadWriter;

fn decode_request(cache: &mut BitstreamCache, bs: &Bitstream) -> Vec<u8> {
    let registry = ExtBufferRegistry::default();
    let surface = FrameSurface::new(
        FrameInfo {
            fourcc: fourcc::NV12,
            width: 32,
            height: 16,
            ..Default::default()
        },
        32,
    );
    let mut w = PayloadWriter::for_function(FunctionId::DecodeFrameAsync);
    w.write_typed(&SessionHandle(0x1000));
    write_bitstream(&mut w, &registry, BitstreamId::NULL, Some(bs), Some(cache)).unwrap();
    put_surface(&mut w, &registry, SurfaceId(0x2000), Some(&surface), false).unwrap();
    w.into_bytes()
}

#[test]
fn decode_request_header_and_dedup() {
    let mut cache = BitstreamCache::new();
    let bs = Bitstream::from_data((0u8..10).collect());

    let first = decode_request(&mut cache, &bs);
    assert_eq!(&first[0..4], &1026u32.to_le_bytes());
    assert_eq!(&first[4..8], &(first.len() as u32).to_le_bytes());
    assert_eq!(&first[8..16], &0x1000u64.to_le_bytes());

    // Same committed bytes again: the payload is replaced by a zero tag.
    let second = decode_request(&mut cache, &bs);
    assert_eq!(first.len() - second.len(), 10);

    let registry = ExtBufferRegistry::default();
    let mut r = PayloadReader::new(second).unwrap();
    assert_eq!(FunctionId::from_raw(r.id()), Some(FunctionId::DecodeFrameAsync));
    assert_eq!(r.read_typed::<SessionHandle>().unwrap(), SessionHandle(0x1000));

    let mut peer_cache = BitstreamCache::new();
    let mut seen = None;
    // The peer already holds the bytes from the first request.
    {
        let mut r1 = PayloadReader::new(first).unwrap();
        r1.skip(8).unwrap();
        read_bitstream(&mut r1, &registry, &mut seen, Some(&mut peer_cache)).unwrap();
    }
    read_bitstream(&mut r, &registry, &mut seen, Some(&mut peer_cache)).unwrap();
    assert_eq!(seen.unwrap().committed().unwrap(), bs.committed().unwrap());

    let desc = read_surface_descriptor(&mut r).unwrap().unwrap();
    assert_eq!(desc.id, SurfaceId(0x2000));
    assert_eq!(desc.info.width, 32);
    assert!(!desc.is_mapped());
}

#[test]
fn video_param_with_mbqp_map() {
    let registry = ExtBufferRegistry::default();
    let mut par = VideoParam::default();
    par.header.mfx.frame_info.fourcc = fourcc::NV12;
    par.ext_param = Some(vec![
        None,
        Some(ExtBuffer::with_variable(
            EXTBUFF_MBQP,
            vec![0; 24],
            ExtVariable::Mbqp {
                mode: MBQP_MODE_QP_VALUE,
                block_size: 16,
                num_qp_alloc: 4,
                qp: vec![20, 21, 22, 23],
            },
        )),
    ]);

    let mut w = PayloadWriter::for_function(FunctionId::EncodeInit);
    w.write_typed(&SessionHandle(1));
    write_video_param(&mut w, &registry, Some(&par)).unwrap();
    let mut r = PayloadReader::new(w.into_bytes()).unwrap();
    r.read_typed::<SessionHandle>().unwrap();
    let mut out = None;
    read_video_param(&mut r, &registry, &mut out).unwrap();
    assert_eq!(out, Some(par));
    assert!(r.warnings().is_empty());
}

#[test]
fn truncated_frame_is_rejected() {
    let mut w = PayloadWriter::for_function(FunctionId::Close);
    w.write_typed(&SessionHandle(7));
    let mut bytes = w.into_bytes();
    bytes.pop();
    assert_eq!(
        PayloadReader::new(bytes).unwrap_err(),
        Error::InvalidFrame {
            declared: 16,
            actual: 15
        }
    );
}
