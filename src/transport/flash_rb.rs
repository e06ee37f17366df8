// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Flash ring-buffer transport.
//!
//! The stub has no real link; instead a message channel is embedded at a
//! fixed offset of the SPI flash image served by an EM100-style emulator.
//! The channel is a small header plus two single-producer/single-consumer
//! ring buffers (host→PSP and PSP→host). Every operation re-fetches the
//! header from flash, moves one contiguous span, and publishes the updated
//! ring pointer by writing just that field back.
//!
//! There is no doorbell: the PSP→host direction is discovered by polling
//! the flash image, so round-trip latency is orders of magnitude above the
//! socket transports. Expect tens of milliseconds per PDU.

use std::time::Duration;

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::{Instant, sleep},
};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use zerocopy::{
    FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout, LittleEndian, U32,
};

use crate::{
    error::TransportError,
    transport::{Interrupter, PollOutcome, Transport, guarded},
};

/// Request magic of the emulator's framed remote-access protocol.
const EM100_REQ_MAGIC: u32 = 0xEBAD_C0DE;
const EM100_CMD_READ: u32 = 0;
const EM100_CMD_WRITE: u32 = 1;

/// Flash offset of the message channel inside the image.
pub const CHANNEL_OFFSET: u32 = 0x00AA_B000;
/// Sentinel closing the channel header.
pub const CHANNEL_MAGIC: u32 = 0x1892_0103;
/// Capacity of each ring's data area.
pub const RING_CAPACITY: u32 = 0x1000;

/// Gap between the channel header and the first ring data area.
const RING_AREA_OFFSET: u32 = 0x40;
/// How often the poll loop re-reads the PSP→host ring.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[repr(C)]
#[derive(Debug, Default, Clone, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
struct RingHdr {
    cap: U32<LittleEndian>,
    head: U32<LittleEndian>,
    tail: U32<LittleEndian>,
}

impl RingHdr {
    fn empty() -> Self {
        Self {
            cap: U32::new(RING_CAPACITY),
            head: U32::new(0),
            tail: U32::new(0),
        }
    }

    #[inline]
    fn used(&self) -> u32 {
        self.head
            .get()
            .wrapping_sub(self.tail.get())
            .rem_euclid(self.cap.get())
    }

    /// One slot is sacrificed to distinguish full from empty.
    #[inline]
    fn free(&self) -> u32 {
        self.cap.get() - 1 - self.used()
    }
}

#[repr(C)]
#[derive(Debug, Default, Clone, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
struct ChannelHeader {
    /// Flash offset of the host→PSP ring data.
    off_ext2psp: U32<LittleEndian>,
    /// Flash offset of the PSP→host ring data.
    off_psp2ext: U32<LittleEndian>,
    rb_ext2psp: RingHdr,
    rb_psp2ext: RingHdr,
    magic: U32<LittleEndian>,
}

const EXT2PSP_HEAD_FIELD: u32 = CHANNEL_OFFSET
    + (core::mem::offset_of!(ChannelHeader, rb_ext2psp)
        + core::mem::offset_of!(RingHdr, head)) as u32;
const PSP2EXT_TAIL_FIELD: u32 = CHANNEL_OFFSET
    + (core::mem::offset_of!(ChannelHeader, rb_psp2ext)
        + core::mem::offset_of!(RingHdr, tail)) as u32;

#[repr(C)]
#[derive(Debug, Default, Clone, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
struct Em100Request {
    magic: U32<LittleEndian>,
    cmd: U32<LittleEndian>,
    start: U32<LittleEndian>,
    length: U32<LittleEndian>,
}

impl Em100Request {
    fn new(cmd: u32, start: u32, length: u32) -> Self {
        Self {
            magic: U32::new(EM100_REQ_MAGIC),
            cmd: U32::new(cmd),
            start: U32::new(start),
            length: U32::new(length),
        }
    }
}

#[derive(Debug)]
pub struct FlashRbTransport {
    stream: TcpStream,
    cancel: CancellationToken,
}

impl FlashRbTransport {
    /// Connects to the emulator and initializes the channel: header plus
    /// two empty rings.
    pub async fn connect(host: &str, port: u16) -> Result<Self, TransportError> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        let mut this = Self {
            stream,
            cancel: CancellationToken::new(),
        };

        let header = ChannelHeader {
            off_ext2psp: U32::new(CHANNEL_OFFSET + RING_AREA_OFFSET),
            off_psp2ext: U32::new(CHANNEL_OFFSET + RING_AREA_OFFSET + RING_CAPACITY),
            rb_ext2psp: RingHdr::empty(),
            rb_psp2ext: RingHdr::empty(),
            magic: U32::new(CHANNEL_MAGIC),
        };
        this.flash_write(CHANNEL_OFFSET, header.as_bytes()).await?;
        let zeroes = vec![0u8; RING_CAPACITY as usize];
        this.flash_write(header.off_ext2psp.get(), &zeroes).await?;
        this.flash_write(header.off_psp2ext.get(), &zeroes).await?;
        debug!(%host, port, "flash ring-buffer channel initialized");
        Ok(this)
    }

    async fn flash_write(&mut self, start: u32, data: &[u8]) -> Result<(), TransportError> {
        let req = Em100Request::new(EM100_CMD_WRITE, start, data.len() as u32);
        guarded(&self.cancel, self.stream.write_all(req.as_bytes())).await?;
        guarded(&self.cancel, self.stream.write_all(data)).await
    }

    async fn flash_read(&mut self, start: u32, buf: &mut [u8]) -> Result<(), TransportError> {
        let req = Em100Request::new(EM100_CMD_READ, start, buf.len() as u32);
        guarded(&self.cancel, self.stream.write_all(req.as_bytes())).await?;
        let mut status = [0u8; 4];
        guarded(&self.cancel, self.stream.read_exact(&mut status)).await?;
        let status = u32::from_le_bytes(status);
        if status != 0 {
            return Err(TransportError::Io(std::io::Error::other(format!(
                "flash emulator read failed: status {status:#x}"
            ))));
        }
        guarded(&self.cancel, self.stream.read_exact(buf)).await?;
        Ok(())
    }

    async fn fetch_channel(&mut self) -> Result<ChannelHeader, TransportError> {
        let mut raw = [0u8; size_of::<ChannelHeader>()];
        self.flash_read(CHANNEL_OFFSET, &mut raw).await?;
        let header = ChannelHeader::read_from_bytes(&raw)
            .unwrap_or_else(|_| unreachable!("buffer is exactly header-sized"));
        if header.magic.get() != CHANNEL_MAGIC {
            return Err(TransportError::Io(std::io::Error::other(
                "flash channel magic missing; image was overwritten",
            )));
        }
        Ok(header)
    }
}

impl Transport for FlashRbTransport {
    async fn peek(&mut self) -> Result<usize, TransportError> {
        let header = self.fetch_channel().await?;
        Ok(header.rb_psp2ext.used() as usize)
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let header = self.fetch_channel().await?;
        let ring = &header.rb_psp2ext;
        let used = ring.used();
        if used == 0 || buf.is_empty() {
            return Ok(0);
        }
        let tail = ring.tail.get();
        // Only the span up to the wrap point; the caller loops for more.
        let contiguous = used.min(ring.cap.get() - tail);
        let n = (contiguous as usize).min(buf.len());
        self.flash_read(header.off_psp2ext.get() + tail, &mut buf[..n])
            .await?;
        let new_tail = (tail + n as u32) % ring.cap.get();
        self.flash_write(PSP2EXT_TAIL_FIELD, &new_tail.to_le_bytes())
            .await?;
        Ok(n)
    }

    async fn write_all(&mut self, buf: &[u8]) -> Result<(), TransportError> {
        let mut offset = 0usize;
        while offset < buf.len() {
            if self.cancel.is_cancelled() {
                return Err(TransportError::Interrupted);
            }
            let header = self.fetch_channel().await?;
            let ring = &header.rb_ext2psp;
            let free = ring.free();
            if free == 0 {
                // Ring full: the stub has not drained yet.
                sleep(POLL_INTERVAL).await;
                continue;
            }
            let head = ring.head.get();
            let contiguous = free.min(ring.cap.get() - head);
            let n = (contiguous as usize).min(buf.len() - offset);
            self.flash_write(header.off_ext2psp.get() + head, &buf[offset..offset + n])
                .await?;
            let new_head = (head + n as u32) % ring.cap.get();
            self.flash_write(EXT2PSP_HEAD_FIELD, &new_head.to_le_bytes())
                .await?;
            offset += n;
        }
        Ok(())
    }

    async fn poll_readable(
        &mut self,
        wait: Duration,
    ) -> Result<PollOutcome, TransportError> {
        let deadline = Instant::now() + wait;
        loop {
            if self.cancel.is_cancelled() {
                return Err(TransportError::Interrupted);
            }
            if self.peek().await? > 0 {
                return Ok(PollOutcome::Ready);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(PollOutcome::TimedOut);
            }
            let nap = POLL_INTERVAL.min(deadline - now);
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(TransportError::Interrupted),
                _ = sleep(nap) => {},
            }
        }
    }

    fn interrupter(&self) -> Interrupter {
        Interrupter::new(self.cancel.clone())
    }
}
