// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use psp_proxy_rs::engine::{
    HostIoSink,
    buffers::{LOG_BUFFER_LEN, LogLineBuffer},
};
use rand::RngExt;

#[derive(Default)]
struct CollectSink {
    lines: Vec<String>,
    out_bufs: Vec<(u32, Vec<u8>)>,
}

impl HostIoSink for CollectSink {
    fn log_msg(&mut self, line: &str) {
        self.lines.push(line.to_string());
    }

    fn out_buf_write(&mut self, id_out_buf: u32, data: &[u8]) {
        self.out_bufs.push((id_out_buf, data.to_vec()));
    }
}

#[test]
fn delivered_lines_equal_stream_up_to_last_newline() {
    let mut rng = rand::rng();
    for _ in 0..30 {
        // Printable-ish bytes with newlines sprinkled in; short enough that
        // no message can overflow the assembly buffer.
        let len = rng.random_range(0..700);
        let stream: Vec<u8> = (0..len)
            .map(|_| {
                if rng.random_range(0..12) == 0 {
                    b'\n'
                } else {
                    rng.random_range(0x20..0x7F)
                }
            })
            .collect();

        let mut lb = LogLineBuffer::new();
        let mut sink = CollectSink::default();
        let mut rest = stream.as_slice();
        while !rest.is_empty() {
            let n = rng.random_range(1..=rest.len());
            lb.push(&rest[..n], &mut sink);
            rest = &rest[n..];
        }

        let delivered: Vec<u8> = sink.lines.concat().into_bytes();
        let truncated = match stream.iter().rposition(|b| *b == b'\n') {
            Some(pos) => &stream[..=pos],
            None => &[][..],
        };
        assert_eq!(delivered, truncated);
    }
}

#[test]
fn oversized_message_dropped_without_poisoning_later_lines() {
    let mut lb = LogLineBuffer::new();
    let mut sink = CollectSink::default();

    lb.push(b"start\n", &mut sink);
    lb.push(&vec![b'A'; LOG_BUFFER_LEN + 1], &mut sink);
    lb.push(b"end\n", &mut sink);

    assert_eq!(sink.lines, vec!["start\n", "end\n"]);
}
