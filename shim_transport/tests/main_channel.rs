// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::net::TcpStream;
use std::thread;

use shim_transport::Channel;
use shim_transport::Listener;
use shim_transport::TcpChannelListener;
use shim_transport::UnixChannelListener;
use shim_transport::DATA_MAX_SEND_SIZE;

fn frame(id: u32, len: usize) -> Vec<u8> {
    let mut f = Vec::with_capacity(len + 8);
    f.extend_from_slice(&id.to_le_bytes());
    f.extend_from_slice(&((len + 8) as u32).to_le_bytes());
    f.extend((0..len).map(|i| (i % 251) as u8));
    f
}

// Echoes every frame back with its id incremented.
fn serve_echo(mut ch: Channel) {
    while let Ok(mut f) = ch.read_frame() {
        f[0] = f[0].wrapping_add(1);
        if ch.write_frame(&f).is_err() {
            break;
        }
    }
}

#[test]
fn tcp_request_response() {
    let mut listener = TcpChannelListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = thread::spawn(move || {
        let ch = listener.accept().unwrap().unwrap();
        serve_echo(ch);
    });

    let mut host = Channel::from_stream(TcpStream::connect(addr).unwrap());
    for len in [0, 17, DATA_MAX_SEND_SIZE + 3] {
        let request = frame(1000, len);
        host.write_frame(&request).unwrap();
        let reply = host.read_frame().unwrap();
        assert_eq!(reply.len(), request.len());
        assert_eq!(reply[0], 1001u32 as u8);
        assert_eq!(reply[8..], request[8..]);
    }
    drop(host);
    server.join().unwrap();
}

#[test]
fn unix_stream_request_response() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bypass.sock");
    let mut listener = UnixChannelListener::bind(&path, true).unwrap();
    let server = thread::spawn(move || {
        let ch = listener.accept().unwrap().unwrap();
        serve_echo(ch);
    });

    let stream = std::os::unix::net::UnixStream::connect(&path).unwrap();
    let mut host = Channel::from_stream(stream);
    host.write_frame(&frame(1041, 4)).unwrap();
    assert_eq!(host.read_frame().unwrap()[0], 1042u32 as u8);
    drop(host);
    server.join().unwrap();
}
