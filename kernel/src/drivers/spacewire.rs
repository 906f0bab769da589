//! SpaceWire (GRSPW2) link driver (spec.md §4.8, L7): RMAP-capable DMA
//! descriptor rings, RX auto-drop back-pressure, routing between cores.
//!
//! Descriptor slots are arena-indexed (spec.md §9 "intrusive doubly linked
//! lists"): each ring owns a `Vec` of fixed-capacity slots plus a `free` and
//! `used` `VecDeque<usize>` of indices into it, the same pattern
//! [`crate::sched::round_robin::RoundRobinScheduler`] uses for its FIFO
//! classes. Register access goes through [`crate::arch::MmioBus`] so this
//! driver is exercised in tests against [`crate::arch::MemoryBus`]
//! instead of real silicon.

extern crate alloc;

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use bitflags::bitflags;

use crate::arch::MmioBus;
use crate::error::{KernelError, KernelResult};

pub const TX_RING_CAPACITY: usize = 16;
pub const RX_RING_CAPACITY: usize = 16;

bitflags! {
    /// TX descriptor control word (spec.md §6 "SpaceWire RMAP wire format").
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct TxCtrl: u32 {
        const EN = 1 << 0;
        const WR = 1 << 1;
        const IE = 1 << 2;
        const APPEND_HEADER_CRC = 1 << 3;
        const APPEND_DATA_CRC = 1 << 4;
    }

    /// RX descriptor control word.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct RxCtrl: u32 {
        const EN = 1 << 0;
        const WR = 1 << 1;
        const IE = 1 << 2;
        const EP = 1 << 3;
    }
}

struct TxSlot {
    header: Vec<u8>,
    data: Vec<u8>,
    ctrl: TxCtrl,
    non_crc_bytes: u8,
}

struct RxSlot {
    buf: Vec<u8>,
    len: usize,
    ctrl: RxCtrl,
}

/// Per-link counters (spec.md §4.8 last paragraph).
#[derive(Debug, Default, Clone, Copy)]
pub struct LinkErrorCounters {
    pub parity: u64,
    pub escape: u64,
    pub disconnect: u64,
    pub credit: u64,
    pub invalid_address: u64,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DmaErrorCounters {
    pub ahb_read: u64,
    pub ahb_write: u64,
}

/// Auto-drop back-pressure policy (spec.md §4.8 "Auto-drop").
#[derive(Debug, Clone, Copy)]
struct AutoDrop {
    enabled: bool,
    n_drop: usize,
}

/// One GRSPW2 core: register map plus the TX/RX descriptor rings it owns.
pub struct GrSpw2Core<B: MmioBus> {
    regs: B,
    node_address: u8,

    tx_slots: Vec<TxSlot>,
    tx_free: VecDeque<usize>,
    tx_used: VecDeque<usize>,

    rx_slots: Vec<RxSlot>,
    rx_free: VecDeque<usize>,
    rx_used: VecDeque<usize>,

    auto_drop: AutoDrop,

    pub link_errors: LinkErrorCounters,
    pub dma_errors: DmaErrorCounters,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub dropped_bytes: u64,

    mtu: usize,
}

const REG_CTRL: usize = 0x00;
const REG_STATUS: usize = 0x04;
const REG_NODE_ADDR: usize = 0x08;
const REG_CLKDIV: usize = 0x0c;

const CTRL_RESET: u32 = 1 << 0;
const CTRL_RX_ENABLE: u32 = 1 << 1;
const CTRL_TX_ENABLE: u32 = 1 << 2;
const CTRL_PROMISCUOUS: u32 = 1 << 3;

impl<B: MmioBus> GrSpw2Core<B> {
    /// `core_init` (spec.md §4.8): soft-reset, node address, clock divisor,
    /// MTU, descriptor rings ready to accept packets.
    pub fn core_init(mut regs: B, node_address: u8, clkdiv: u8, mtu: usize) -> Self {
        regs.write_be32(REG_CTRL, CTRL_RESET);
        regs.write_be32(REG_NODE_ADDR, node_address as u32);
        regs.write_be32(REG_CLKDIV, clkdiv as u32);
        regs.write_be32(REG_CTRL, CTRL_RX_ENABLE | CTRL_TX_ENABLE);

        let mut tx_slots = Vec::with_capacity(TX_RING_CAPACITY);
        let mut tx_free = VecDeque::with_capacity(TX_RING_CAPACITY);
        for i in 0..TX_RING_CAPACITY {
            tx_slots.push(TxSlot {
                header: Vec::new(),
                data: Vec::new(),
                ctrl: TxCtrl::empty(),
                non_crc_bytes: 0,
            });
            tx_free.push_back(i);
        }

        let mut rx_slots = Vec::with_capacity(RX_RING_CAPACITY);
        let mut rx_free = VecDeque::with_capacity(RX_RING_CAPACITY);
        for i in 0..RX_RING_CAPACITY {
            rx_slots.push(RxSlot {
                buf: alloc::vec![0u8; mtu],
                len: 0,
                ctrl: RxCtrl::empty(),
            });
            rx_free.push_back(i);
        }

        Self {
            regs,
            node_address,
            tx_slots,
            tx_free,
            tx_used: VecDeque::new(),
            rx_slots,
            rx_free,
            rx_used: VecDeque::new(),
            auto_drop: AutoDrop {
                enabled: false,
                n_drop: 0,
            },
            link_errors: LinkErrorCounters::default(),
            dma_errors: DmaErrorCounters::default(),
            rx_bytes: 0,
            tx_bytes: 0,
            dropped_bytes: 0,
            mtu,
        }
    }

    pub fn node_address(&self) -> u8 {
        self.node_address
    }

    pub fn set_promiscuous(&mut self, on: bool) {
        let mut ctrl = self.regs.read_be32(REG_CTRL);
        if on {
            ctrl |= CTRL_PROMISCUOUS;
        } else {
            ctrl &= !CTRL_PROMISCUOUS;
        }
        self.regs.write_be32(REG_CTRL, ctrl);
    }

    /// Enable the auto-drop policy: once the RX ring has exactly `n_drop`
    /// free slots remaining, evict the `n_drop` oldest RX entries before
    /// accepting the next packet (spec.md §4.8 "Auto-drop").
    pub fn set_auto_drop(&mut self, n_drop: usize) {
        self.auto_drop = AutoDrop {
            enabled: n_drop > 0,
            n_drop,
        };
    }

    /// `add_pkt` (spec.md §4.8): pull a free TX element, copy header/data
    /// into its pre-allocated buffers, mark it enabled for the device.
    pub fn add_pkt(&mut self, header: &[u8], data: &[u8]) -> KernelResult<()> {
        self.add_tx(header, data, TxCtrl::EN)
    }

    /// `add_rmap`: same as `add_pkt` but marks the RMAP CRC-append bits.
    pub fn add_rmap(&mut self, header: &[u8], data: &[u8]) -> KernelResult<()> {
        self.add_tx(
            header,
            data,
            TxCtrl::EN | TxCtrl::APPEND_HEADER_CRC | TxCtrl::APPEND_DATA_CRC,
        )
    }

    fn add_tx(&mut self, header: &[u8], data: &[u8], mut ctrl: TxCtrl) -> KernelResult<()> {
        let idx = self.tx_free.pop_front().ok_or(KernelError::WouldBlock)?;
        let last = self.tx_free.is_empty();
        if last {
            ctrl |= TxCtrl::WR;
        }
        let slot = &mut self.tx_slots[idx];
        slot.header.clear();
        slot.header.extend_from_slice(header);
        slot.data.clear();
        slot.data.extend_from_slice(data);
        slot.non_crc_bytes = 0;
        slot.ctrl = ctrl;
        self.tx_used.push_back(idx);
        self.tx_bytes += (header.len() + data.len()) as u64;
        self.kick();
        Ok(())
    }

    /// `get_pkt` (spec.md §4.8): pull the head of RX `used`, copy it out
    /// less the configured header strip, re-arm the descriptor.
    pub fn get_pkt(&mut self, strip_header: usize) -> Option<Vec<u8>> {
        let idx = self.rx_used.pop_front()?;
        let slot = &mut self.rx_slots[idx];
        let payload = slot.buf[strip_header.min(slot.len)..slot.len].to_vec();
        self.rearm_rx(idx);
        Some(payload)
    }

    /// `drop_pkt`: discard the head of RX `used` without returning it.
    pub fn drop_pkt(&mut self) -> bool {
        match self.rx_used.pop_front() {
            Some(idx) => {
                self.rearm_rx(idx);
                true
            }
            None => false,
        }
    }

    fn rearm_rx(&mut self, idx: usize) {
        let slot = &mut self.rx_slots[idx];
        slot.len = 0;
        slot.ctrl = RxCtrl::EN;
        self.rx_free.push_back(idx);
        self.kick();
    }

    fn kick(&mut self) {
        let ctrl = self.regs.read_be32(REG_CTRL);
        self.regs.write_be32(REG_CTRL, ctrl);
    }

    /// Simulates the device delivering one packet into the RX ring; real
    /// hardware does this via DMA, this is the seam a test double (or the
    /// real ISR, once wired to a concrete register map) drives.
    pub fn on_rx_packet(&mut self, bytes: &[u8]) {
        if self.auto_drop.enabled && self.rx_free.len() == self.auto_drop.n_drop {
            self.auto_drop_evict();
        }
        let Some(idx) = self.rx_free.pop_front() else {
            // Ring genuinely full with auto-drop off or already maxed:
            // the hardware would simply stall the link. Nothing to do.
            return;
        };
        let slot = &mut self.rx_slots[idx];
        let n = bytes.len().min(slot.buf.len());
        slot.buf[..n].copy_from_slice(&bytes[..n]);
        slot.len = n;
        slot.ctrl = RxCtrl::EN | RxCtrl::WR;
        self.rx_used.push_back(idx);
        self.rx_bytes += n as u64;
    }

    fn auto_drop_evict(&mut self) {
        for _ in 0..self.auto_drop.n_drop {
            let Some(idx) = self.rx_used.pop_front() else {
                break;
            };
            self.dropped_bytes += self.rx_slots[idx].len as u64;
            self.rx_slots[idx].len = 0;
            self.rx_free.push_back(idx);
        }
    }

    /// Routing mode (spec.md §4.8 "Routing mode"): forward every received
    /// packet from `self` to `peer`'s TX ring, by copy (RX/TX descriptor
    /// layouts differ, so zero-copy hand-off is not possible per spec.md §9
    /// open questions). Disables itself if the peer has no free TX slots.
    pub fn route_to(&mut self, peer: &mut Self, header: &[u8]) -> KernelResult<usize> {
        let mut routed = 0;
        while let Some(idx) = self.rx_used.front().copied() {
            if peer.tx_free.is_empty() {
                break;
            }
            let payload = self.rx_slots[idx].buf[..self.rx_slots[idx].len].to_vec();
            self.rx_used.pop_front();
            self.rearm_rx(idx);
            peer.add_pkt(header, &payload)?;
            routed += 1;
        }
        Ok(routed)
    }

    /// Report a transient link error (spec.md §7 "Driver transient").
    pub fn report_link_error(&mut self, kind: LinkErrorKind) {
        match kind {
            LinkErrorKind::Parity => self.link_errors.parity += 1,
            LinkErrorKind::Escape => self.link_errors.escape += 1,
            LinkErrorKind::Disconnect => self.link_errors.disconnect += 1,
            LinkErrorKind::Credit => self.link_errors.credit += 1,
            LinkErrorKind::InvalidAddress => self.link_errors.invalid_address += 1,
        }
        let status = self.regs.read_be32(REG_STATUS);
        self.regs.write_be32(REG_STATUS, status);
    }

    /// DMA errors are cleared by writing 1 to their status bits.
    pub fn report_dma_error(&mut self, kind: DmaErrorKind) {
        match kind {
            DmaErrorKind::AhbRead => self.dma_errors.ahb_read += 1,
            DmaErrorKind::AhbWrite => self.dma_errors.ahb_write += 1,
        }
        let status = self.regs.read_be32(REG_STATUS);
        self.regs.write_be32(REG_STATUS, status | 1);
    }

    pub fn rx_pending(&self) -> usize {
        self.rx_used.len()
    }

    pub fn tx_pending(&self) -> usize {
        self.tx_used.len()
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }
}

#[derive(Debug, Clone, Copy)]
pub enum LinkErrorKind {
    Parity,
    Escape,
    Disconnect,
    Credit,
    InvalidAddress,
}

#[derive(Debug, Clone, Copy)]
pub enum DmaErrorKind {
    AhbRead,
    AhbWrite,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::MemoryBus;

    fn core(n_drop: usize) -> GrSpw2Core<MemoryBus> {
        let mut c = GrSpw2Core::core_init(MemoryBus::new(16), 0xfe, 1, 64);
        if n_drop > 0 {
            c.set_auto_drop(n_drop);
        }
        c
    }

    #[test]
    fn auto_drop_evicts_oldest_entries_under_idle_consumer() {
        let mut c = core(8);
        for i in 0..16u8 {
            c.on_rx_packet(&[i]);
        }
        assert_eq!(c.rx_pending(), 8);
        let mut seen = Vec::new();
        while let Some(pkt) = c.get_pkt(0) {
            seen.push(pkt[0]);
        }
        assert_eq!(seen, (8..16).collect::<Vec<u8>>());
        assert_eq!(c.dropped_bytes, 8);
    }

    #[test]
    fn add_pkt_marks_wrap_on_last_descriptor() {
        let mut c = core(0);
        for _ in 0..TX_RING_CAPACITY {
            c.add_pkt(&[0xaa], &[0xbb]).unwrap();
        }
        assert!(c.tx_slots[c.tx_used[TX_RING_CAPACITY - 1]]
            .ctrl
            .contains(TxCtrl::WR));
        assert!(c.add_pkt(&[0], &[0]).is_err());
    }

    #[test]
    fn routing_copies_packets_to_peer_tx_ring() {
        let mut a = core(0);
        let mut b = core(0);
        a.on_rx_packet(&[1, 2, 3]);
        a.on_rx_packet(&[4, 5, 6]);
        let routed = a.route_to(&mut b, &[0xde]).unwrap();
        assert_eq!(routed, 2);
        assert_eq!(b.tx_pending(), 2);
        assert_eq!(a.rx_pending(), 0);
    }

    #[test]
    fn link_and_dma_error_counters_increment() {
        let mut c = core(0);
        c.report_link_error(LinkErrorKind::Parity);
        c.report_link_error(LinkErrorKind::Parity);
        c.report_dma_error(DmaErrorKind::AhbWrite);
        assert_eq!(c.link_errors.parity, 2);
        assert_eq!(c.dma_errors.ahb_write, 1);
    }
}
