// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The PDU engine: connect handshake, request/response correlation,
//! notification dispatch, transparent chunking and the code-module
//! runloop.
//!
//! One engine is owned by one caller; every operation takes `&mut self`,
//! so requests are strictly serialized and the only suspension points are
//! transport calls and timer deadlines. The first fatal error (transport
//! failure, protocol violation, peer reset) latches the engine; later
//! calls fail fast until the embedder rebuilds it.

use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use zerocopy::IntoBytes;

use crate::{
    engine::{
        buffers::{IrqSnapshot, IrqTable, LogLineBuffer},
        host_io::HostIoSink,
        session::{SessionInfo, SessionState},
    },
    error::{EngineError, ProtocolError},
    pdu::{
        addr::PspAddress,
        framer::{FrameDecoder, PAD_ZEROES, RawFrame, encode},
        header::{Direction, FRAME_OVERHEAD, RECV_BUFFER_LEN},
        inbound::{
            BeaconNotify, ConnectResponsePayload, CoprocReadResponsePayload,
            ExecFinishedNotify, IrqChangeNotify, OutBufWriteHdr,
        },
        request::{
            ADDR_XFER_REQ_LEN, AddrXferRequest, BranchToRequest, CodeModExecRequest,
            CodeModLoadRequest, CoprocReadRequest, CoprocWriteRequest,
            INPUT_BUF_WRITE_REQ_LEN, InputBufWriteRequest, XferFlags,
        },
        rrn::RrnId,
    },
    transport::{Interrupter, PollOutcome, Transport},
};

/// Upper bound on CCDs this build tracks; above any shipped topology.
pub const MAX_CCDS: u32 = 64;

/// Poll granularity of the exec runloop between input-pump rounds.
const EXEC_POLL_SLICE: Duration = Duration::from_millis(1);

/// Per-read ceiling when pumping host input to the stub during exec.
const EXEC_INPUT_CHUNK: usize = 512;

/// Read granularity of the receive loop.
const READ_CHUNK: usize = 512;

/// A per-operation time budget; keeps the original millisecond figure
/// around for error reporting.
#[derive(Debug, Clone, Copy)]
struct Deadline {
    at: Instant,
    budget: Duration,
}

impl Deadline {
    fn new(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
            budget,
        }
    }

    fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    fn timeout_err(&self) -> EngineError {
        EngineError::Timeout(self.budget.as_millis() as u64)
    }
}

pub struct PduEngine<T: Transport> {
    transport: T,
    sink: Box<dyn HostIoSink>,
    decoder: FrameDecoder,
    session: SessionState,
    /// Outbound PDU counter; the N-th emitted frame carries N.
    pdus_sent: u32,
    beacons_seen: u32,
    rc_last: u32,
    failed: bool,
    log_lines: LogLineBuffer,
    irq: IrqTable,
    /// Return value of a finished code module, parked until the runloop
    /// picks it up.
    exec_finished: Option<u32>,
    /// Epoch for the informational timestamp field in emitted headers.
    epoch: std::time::Instant,
}

impl<T: Transport> PduEngine<T> {
    pub fn new(transport: T, sink: Box<dyn HostIoSink>) -> Self {
        Self {
            transport,
            sink,
            decoder: FrameDecoder::new(),
            session: SessionState::Disconnected,
            pdus_sent: 0,
            beacons_seen: 0,
            rc_last: 0,
            failed: false,
            log_lines: LogLineBuffer::new(),
            irq: IrqTable::default(),
            exec_finished: None,
            epoch: std::time::Instant::now(),
        }
    }

    #[inline]
    pub fn session(&self) -> &SessionState {
        &self.session
    }

    /// Scratch region, topology and `cbPduMax`, answered locally from the
    /// handshake state.
    pub fn query_info(&self) -> Result<&SessionInfo, EngineError> {
        self.session.info().ok_or(EngineError::NotConnected)
    }

    /// Count of beacons observed so far (pre- and post-connect).
    #[inline]
    pub fn beacons_seen(&self) -> u32 {
        self.beacons_seen
    }

    /// Stub status code of the most recent response.
    #[inline]
    pub fn last_request_rc(&self) -> u32 {
        self.rc_last
    }

    pub fn interrupter(&self) -> Interrupter {
        self.transport.interrupter()
    }

    fn timestamp_ms(&self) -> u32 {
        self.epoch.elapsed().as_millis() as u32
    }

    fn ensure_usable(&self) -> Result<(), EngineError> {
        if self.failed {
            return Err(EngineError::Failed(
                "a fatal transport or protocol error latched this engine",
            ));
        }
        Ok(())
    }

    fn require_info(&self) -> Result<&SessionInfo, EngineError> {
        self.query_info()
    }

    fn validate_ccd(&self, ccd: u32) -> Result<(), EngineError> {
        let total = self.session.info().map_or(1, SessionInfo::total_ccds);
        if ccd >= total {
            return Err(EngineError::InvalidArgument(
                "CCD id exceeds the advertised topology",
            ));
        }
        Ok(())
    }

    /// Marks the engine failed when `res` carries a fatal error.
    fn latch<R>(&mut self, res: Result<R, EngineError>) -> Result<R, EngineError> {
        if let Err(e) = &res
            && e.is_fatal()
        {
            warn!("latching engine after fatal error: {e}");
            self.failed = true;
        }
        res
    }

    // ── frame IO ───────────────────────────────────────────────────────

    async fn send_frame(
        &mut self,
        ccd: u32,
        rrn: RrnId,
        parts: &[&[u8]],
    ) -> Result<(), EngineError> {
        self.pdus_sent = self.pdus_sent.wrapping_add(1);
        let frame = encode(
            Direction::HostToStub,
            self.pdus_sent,
            rrn,
            ccd,
            self.timestamp_ms(),
            0,
            parts,
        );
        trace!(counter = self.pdus_sent, rrn = rrn as u32, ccd, "sending frame");

        self.transport.write_all(frame.header.as_bytes()).await?;
        for part in parts {
            if !part.is_empty() {
                self.transport.write_all(part).await?;
            }
        }
        if frame.pad > 0 {
            self.transport.write_all(&PAD_ZEROES[..frame.pad]).await?;
        }
        self.transport.write_all(frame.footer.as_bytes()).await?;
        Ok(())
    }

    async fn recv_frame(&mut self, dl: Deadline) -> Result<RawFrame, EngineError> {
        loop {
            if let Some(frame) = self.decoder.next_frame()? {
                return Ok(frame);
            }
            let remaining = dl.remaining();
            if remaining.is_zero() {
                return Err(dl.timeout_err());
            }
            match self.transport.poll_readable(remaining).await? {
                PollOutcome::TimedOut => return Err(dl.timeout_err()),
                PollOutcome::Ready => {
                    let mut chunk = [0u8; READ_CHUNK];
                    let n = self.transport.read(&mut chunk).await?;
                    if n > 0 {
                        self.decoder.extend(&chunk[..n]);
                    }
                },
            }
        }
    }

    /// Routes a notification frame to its consumer. A beacon out of
    /// sequence is a stub reset and fatal.
    fn dispatch_notification(&mut self, frame: &RawFrame) -> Result<(), EngineError> {
        let rrn = frame.rrn()?;
        match rrn {
            RrnId::Beacon => {
                let beacon = BeaconNotify::parse(&frame.payload)?;
                let got = beacon.beacons_sent.get();
                if self.session.is_connected() {
                    let want = self.beacons_seen.wrapping_add(1);
                    if got != want {
                        return Err(EngineError::PeerReset { got, want });
                    }
                }
                self.beacons_seen = got;
                trace!(beacons = got, "beacon");
            },
            RrnId::LogMsg => {
                self.log_lines.push(&frame.payload, self.sink.as_mut());
            },
            RrnId::OutBufWrite => {
                let (hdr, data) = OutBufWriteHdr::parse(&frame.payload)?;
                self.sink.out_buf_write(hdr.id_out_buf.get(), data);
            },
            RrnId::IrqChange => {
                let irq = IrqChangeNotify::parse(&frame.payload)?;
                self.irq
                    .record(frame.header.ccd_id.get(), irq.irq(), irq.firq());
            },
            RrnId::CodeModExecFinished => {
                let fin = ExecFinishedNotify::parse(&frame.payload)?;
                debug!(cm_ret = fin.cm_ret.get(), "code module finished");
                self.exec_finished = Some(fin.cm_ret.get());
            },
            other => {
                return Err(EngineError::Protocol(ProtocolError::UnexpectedRrn(
                    other as u32,
                )));
            },
        }
        Ok(())
    }

    /// Receives until the expected response id shows up, dispatching any
    /// interleaved notifications. Any other frame is a protocol error.
    async fn wait_response(
        &mut self,
        expect: RrnId,
        dl: Deadline,
    ) -> Result<RawFrame, EngineError> {
        loop {
            let frame = self.recv_frame(dl).await?;
            let rrn = frame.rrn()?;
            if rrn.is_notification() {
                self.dispatch_notification(&frame)?;
                continue;
            }
            if rrn == expect {
                self.rc_last = frame.header.request_rc.get();
                return Ok(frame);
            }
            return Err(EngineError::Protocol(ProtocolError::UnexpectedRrn(
                rrn as u32,
            )));
        }
    }

    /// Single-shot request/response: emits one request, waits for its
    /// response, checks the stub rc and the exact payload size.
    async fn request(
        &mut self,
        ccd: u32,
        req: RrnId,
        parts: &[&[u8]],
        expect_len: Option<usize>,
        timeout: Duration,
    ) -> Result<Bytes, EngineError> {
        let dl = Deadline::new(timeout);
        self.send_frame(ccd, req, parts).await?;
        let frame = self.wait_response(req.response(), dl).await?;

        let rc = frame.header.request_rc.get();
        if rc != 0 {
            return Err(EngineError::RequestRejected { rc });
        }
        if let Some(want) = expect_len
            && frame.payload.len() != want
        {
            return Err(EngineError::Protocol(ProtocolError::PayloadSizeMismatch {
                got: frame.payload.len(),
                want,
            }));
        }
        Ok(frame.payload)
    }

    // ── handshake ──────────────────────────────────────────────────────

    /// Connect handshake: wait for a beacon, emit a ConnectRequest, accept
    /// the ConnectResponse and adopt the advertised limits and topology.
    pub async fn connect(&mut self, timeout: Duration) -> Result<(), EngineError> {
        let res = self.connect_inner(timeout).await;
        self.latch(res)
    }

    async fn connect_inner(&mut self, timeout: Duration) -> Result<(), EngineError> {
        self.ensure_usable()?;
        if self.session.is_connected() {
            return Err(EngineError::InvalidArgument("already connected"));
        }

        let dl = Deadline::new(timeout);

        // The stub advertises itself with beacons; wait for one so the
        // request is not fired into a dead link.
        loop {
            let frame = self.recv_frame(dl).await?;
            let rrn = frame.rrn()?;
            if !rrn.is_notification() {
                return Err(EngineError::Protocol(ProtocolError::UnexpectedRrn(
                    rrn as u32,
                )));
            }
            self.dispatch_notification(&frame)?;
            if rrn == RrnId::Beacon {
                break;
            }
        }
        debug!(beacons = self.beacons_seen, "beacon observed, connecting");

        self.send_frame(0, RrnId::ConnectReq, &[]).await?;
        let frame = self.wait_response(RrnId::ConnectResp, dl).await?;

        let rc = frame.header.request_rc.get();
        if rc != 0 {
            return Err(EngineError::RequestRejected { rc });
        }
        // The response restarts the stub's PDU numbering: it is inbound
        // frame #1 of the session.
        let counter = frame.header.counter.get();
        if counter != 1 {
            return Err(EngineError::Protocol(ProtocolError::CounterSkew {
                got: counter,
                want: 1,
            }));
        }

        let info = ConnectResponsePayload::parse(&frame.payload)?;
        let sockets = info.sys_sockets.get();
        let ccds_per_socket = info.ccds_per_socket.get();
        let total = sockets.saturating_mul(ccds_per_socket);
        if total == 0 || total > MAX_CCDS {
            return Err(EngineError::Protocol(ProtocolError::BadTopology {
                sockets,
                ccds_per_socket,
            }));
        }

        let info = SessionInfo {
            cb_pdu_max: info.cb_pdu_max.get(),
            scratch_addr: info.scratch_addr.get(),
            cb_scratch: info.cb_scratch.get(),
            sys_sockets: sockets,
            ccds_per_socket,
        };
        info!(
            cb_pdu_max = info.cb_pdu_max,
            scratch_addr = format_args!("{:#x}", info.scratch_addr),
            cb_scratch = info.cb_scratch,
            ccds = total,
            "connected to stub"
        );

        self.irq.resize(total);
        self.decoder.mark_connected(total);
        self.rc_last = rc;
        self.session = SessionState::Connected(info);
        Ok(())
    }

    // ── generic address transfers ──────────────────────────────────────

    /// Largest data span per transfer request, rounded down to the stride.
    fn xfer_chunk_cap(&self, stride: u32) -> Result<usize, EngineError> {
        let info = self.require_info()?;
        let budget = (info.cb_pdu_max as usize).min(RECV_BUFFER_LEN);
        let cap = budget
            .checked_sub(FRAME_OVERHEAD + ADDR_XFER_REQ_LEN)
            .unwrap_or(0);
        let cap = cap - cap % stride as usize;
        if cap == 0 {
            return Err(EngineError::InvalidArgument(
                "advertised cbPduMax cannot fit a transfer request",
            ));
        }
        Ok(cap)
    }

    /// Chunked read covering `out.len()` bytes from `addr`.
    ///
    /// The per-call `timeout` is re-armed for every chunk, so the budget
    /// bounds each round trip rather than the whole transfer.
    pub async fn transfer_read(
        &mut self,
        ccd: u32,
        addr: PspAddress,
        incr_addr: bool,
        stride: u32,
        out: &mut [u8],
        timeout: Duration,
    ) -> Result<(), EngineError> {
        self.ensure_usable()?;
        self.validate_ccd(ccd)?;
        let cap = self.xfer_chunk_cap(stride)?;
        let mut flags = XferFlags::READ;
        if incr_addr {
            flags |= XferFlags::INCR_ADDR;
        }

        let total = out.len();
        let mut done = 0usize;
        while done < total {
            let n = cap.min(total - done);
            let cursor = if incr_addr {
                addr.advanced_by(done as u64)
            } else {
                addr
            };
            let req = AddrXferRequest::new(cursor, flags, stride, n as u32);
            let res = self
                .request(ccd, RrnId::AddrXferReq, &[req.as_bytes()], Some(n), timeout)
                .await;
            let payload = self.latch(res)?;
            out[done..done + n].copy_from_slice(&payload);
            done += n;
        }
        Ok(())
    }

    /// Chunked write of `data` to `addr`; timeout semantics as for reads.
    pub async fn transfer_write(
        &mut self,
        ccd: u32,
        addr: PspAddress,
        incr_addr: bool,
        stride: u32,
        data: &[u8],
        timeout: Duration,
    ) -> Result<(), EngineError> {
        self.ensure_usable()?;
        self.validate_ccd(ccd)?;
        let cap = self.xfer_chunk_cap(stride)?;
        let mut flags = XferFlags::WRITE;
        if incr_addr {
            flags |= XferFlags::INCR_ADDR;
        }

        let mut done = 0usize;
        while done < data.len() {
            let n = cap.min(data.len() - done);
            let cursor = if incr_addr {
                addr.advanced_by(done as u64)
            } else {
                addr
            };
            let req = AddrXferRequest::new(cursor, flags, stride, n as u32);
            let res = self
                .request(
                    ccd,
                    RrnId::AddrXferReq,
                    &[req.as_bytes(), &data[done..done + n]],
                    Some(0),
                    timeout,
                )
                .await;
            self.latch(res)?;
            done += n;
        }
        Ok(())
    }

    /// Chunked memset: the stride-sized `pattern` is transferred once per
    /// chunk and never advanced, only the remote address moves (when
    /// `incr_addr` is set).
    pub async fn transfer_fill(
        &mut self,
        ccd: u32,
        addr: PspAddress,
        incr_addr: bool,
        stride: u32,
        pattern: &[u8],
        cb_xfer: u32,
        timeout: Duration,
    ) -> Result<(), EngineError> {
        self.ensure_usable()?;
        self.validate_ccd(ccd)?;
        let cap = self.xfer_chunk_cap(stride)? as u32;
        let mut flags = XferFlags::MEMSET;
        if incr_addr {
            flags |= XferFlags::INCR_ADDR;
        }

        let mut done = 0u32;
        while done < cb_xfer {
            let n = cap.min(cb_xfer - done);
            let cursor = if incr_addr {
                addr.advanced_by(done as u64)
            } else {
                addr
            };
            let req = AddrXferRequest::new(cursor, flags, stride, n);
            let res = self
                .request(
                    ccd,
                    RrnId::AddrXferReq,
                    &[req.as_bytes(), pattern],
                    Some(0),
                    timeout,
                )
                .await;
            self.latch(res)?;
            done += n;
        }
        Ok(())
    }

    // ── coprocessor and control flow ───────────────────────────────────

    pub async fn coproc_read(
        &mut self,
        ccd: u32,
        selector: CoprocReadRequest,
        timeout: Duration,
    ) -> Result<u32, EngineError> {
        self.ensure_usable()?;
        self.validate_ccd(ccd)?;
        let res = self
            .request(
                ccd,
                RrnId::CoprocReadReq,
                &[selector.as_bytes()],
                Some(size_of::<CoprocReadResponsePayload>()),
                timeout,
            )
            .await;
        let payload = self.latch(res)?;
        Ok(CoprocReadResponsePayload::parse(&payload)?.val.get())
    }

    pub async fn coproc_write(
        &mut self,
        ccd: u32,
        selector: CoprocReadRequest,
        val: u32,
        timeout: Duration,
    ) -> Result<(), EngineError> {
        self.ensure_usable()?;
        self.validate_ccd(ccd)?;
        let req = CoprocWriteRequest::new(selector, val);
        let res = self
            .request(ccd, RrnId::CoprocWriteReq, &[req.as_bytes()], Some(0), timeout)
            .await;
        self.latch(res)?;
        Ok(())
    }

    /// Redirects the selected PSP to execute at `addr` in its SRAM.
    pub async fn branch_to(
        &mut self,
        ccd: u32,
        addr: u32,
        timeout: Duration,
    ) -> Result<(), EngineError> {
        self.ensure_usable()?;
        self.validate_ccd(ccd)?;
        let req = BranchToRequest::new(addr);
        let res = self
            .request(ccd, RrnId::BranchToReq, &[req.as_bytes()], Some(0), timeout)
            .await;
        self.latch(res)?;
        Ok(())
    }

    // ── input buffers and code modules ─────────────────────────────────

    /// Feeds bytes into a stub-side input buffer.
    pub async fn input_buf_write(
        &mut self,
        ccd: u32,
        id_in_buf: u32,
        data: &[u8],
        timeout: Duration,
    ) -> Result<(), EngineError> {
        self.ensure_usable()?;
        self.validate_ccd(ccd)?;
        let hdr = InputBufWriteRequest::new(id_in_buf, data.len() as u32);
        let res = self
            .request(
                ccd,
                RrnId::InputBufWriteReq,
                &[hdr.as_bytes(), data],
                Some(0),
                timeout,
            )
            .await;
        self.latch(res)?;
        Ok(())
    }

    /// Announces and uploads a code module, chunking the image against the
    /// advertised frame limit. The timeout is re-armed per chunk.
    pub async fn code_mod_load(
        &mut self,
        ccd: u32,
        image: &[u8],
        timeout: Duration,
    ) -> Result<(), EngineError> {
        self.ensure_usable()?;
        self.validate_ccd(ccd)?;

        let info = self.require_info()?;
        let budget = (info.cb_pdu_max as usize).min(RECV_BUFFER_LEN);
        let cap = budget
            .checked_sub(FRAME_OVERHEAD + INPUT_BUF_WRITE_REQ_LEN)
            .unwrap_or(0);
        if cap == 0 {
            return Err(EngineError::InvalidArgument(
                "advertised cbPduMax cannot fit an upload chunk",
            ));
        }

        let req = CodeModLoadRequest::new(image.len() as u32);
        let res = self
            .request(ccd, RrnId::CodeModLoadReq, &[req.as_bytes()], Some(0), timeout)
            .await;
        self.latch(res)?;

        for chunk in image.chunks(cap) {
            self.input_buf_write(ccd, 0, chunk, timeout).await?;
        }
        debug!(
            bytes = image.len(),
            chunks = image.len().div_ceil(cap),
            "code module uploaded"
        );
        Ok(())
    }

    /// Starts the loaded module and runs the pump loop until the stub
    /// reports completion: short receive polls for the finish notification
    /// interleaved with forwarding host input to the stub. Returns the
    /// module's return value. The `timeout` bounds the whole run.
    pub async fn code_mod_exec(
        &mut self,
        ccd: u32,
        arg: u32,
        timeout: Duration,
    ) -> Result<u32, EngineError> {
        let res = self.code_mod_exec_inner(ccd, arg, timeout).await;
        self.latch(res)
    }

    async fn code_mod_exec_inner(
        &mut self,
        ccd: u32,
        arg: u32,
        timeout: Duration,
    ) -> Result<u32, EngineError> {
        self.ensure_usable()?;
        self.validate_ccd(ccd)?;

        self.exec_finished = None;
        let req = CodeModExecRequest::new(arg);
        // The response only acknowledges the start.
        self.request(ccd, RrnId::CodeModExecReq, &[req.as_bytes()], Some(0), timeout)
            .await?;

        let dl = Deadline::new(timeout);
        loop {
            if let Some(ret) = self.exec_finished.take() {
                return Ok(ret);
            }

            let slice = Deadline::new(EXEC_POLL_SLICE.min(dl.remaining()));
            match self.recv_frame(slice).await {
                Ok(frame) => {
                    let rrn = frame.rrn()?;
                    if !rrn.is_notification() {
                        return Err(EngineError::Protocol(ProtocolError::UnexpectedRrn(
                            rrn as u32,
                        )));
                    }
                    self.dispatch_notification(&frame)?;
                },
                Err(EngineError::Timeout(_)) => {
                    if dl.remaining().is_zero() {
                        return Err(dl.timeout_err());
                    }
                    // Nothing from the stub: pump host input instead.
                    let avail = self.sink.in_buf_peek(0);
                    if avail > 0 {
                        let mut buf = [0u8; EXEC_INPUT_CHUNK];
                        let want = avail.min(EXEC_INPUT_CHUNK);
                        let n = self.sink.in_buf_read(0, &mut buf[..want]);
                        if n > 0 {
                            self.input_buf_write(ccd, 0, &buf[..n], timeout).await?;
                        }
                    }
                },
                Err(e) => return Err(e),
            }
        }
    }

    // ── interrupts ─────────────────────────────────────────────────────

    /// Hands back one pending IRQ change in arrival order, or waits for
    /// the next IrqChange notification.
    ///
    /// A zero `timeout` with an empty table reports "no change" as
    /// `Ok(None)` rather than a timeout error.
    pub async fn wait_for_irq(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<IrqSnapshot>, EngineError> {
        let res = self.wait_for_irq_inner(timeout).await;
        self.latch(res)
    }

    async fn wait_for_irq_inner(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<IrqSnapshot>, EngineError> {
        self.ensure_usable()?;
        self.require_info()?;

        if let Some(snap) = self.irq.drain() {
            return Ok(Some(snap));
        }
        if timeout.is_zero() {
            return Ok(None);
        }

        let dl = Deadline::new(timeout);
        loop {
            let frame = self.recv_frame(dl).await?;
            let rrn = frame.rrn()?;
            if !rrn.is_notification() {
                return Err(EngineError::Protocol(ProtocolError::UnexpectedRrn(
                    rrn as u32,
                )));
            }
            self.dispatch_notification(&frame)?;
            if let Some(snap) = self.irq.drain() {
                return Ok(Some(snap));
            }
        }
    }
}
